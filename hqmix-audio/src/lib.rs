//! Real-time audio mixing engine
//!
//! - Mixer: source-set exchange between the request thread and a dedicated
//!   mixer thread, slot state machine, start/stop notifications
//! - Mixing unit: per-source fades and accumulation into the sink format
//! - Pipes: source, sink/capture and volume pipes around the mixer
//! - Effects: ten band equalizer on the mixed output
//! - Config: persisted mixer settings

pub mod circulation_buffer;
pub mod config;
pub mod effects;
mod error;
pub mod mixer;
pub mod mixing_unit;
pub mod pipe;

pub use config::{MixerConfig, MixerSetup, SinkFormat, SinkReader};
pub use effects::equalizer::{
    EqualizerControl, EqualizerMode, EqualizerProperties, EqualizerService, HQEqualizer,
    HQEqualizerProcessor,
};
pub use effects::{EffectBinding, MixedOutputAudioEffect, MixedOutputAudioEffectProcessor, SharedEffect};
pub use error::{result_code, MixerError, Result};
pub use mixer::{
    AttachSourceArgs, AudioMixer, MixerInitArgs, MixerState, MixingStartCause, MixingStopCause,
    SinkPullNotifier, SinkWriter, SlotState, SourceClientEventHandler, SourceClientHandle,
};
pub use mixing_unit::MixMode;
pub use pipe::{block_pipe, AudioSourceDataPipe, BlockReader, BlockTag, BlockWriter};
