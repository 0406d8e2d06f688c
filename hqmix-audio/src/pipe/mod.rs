//! Data pipes between decoders, the mixer and the audio sink
//!
//! - Source pipe: decoded PCM blocks and end-of-data events, decoder → mixer
//! - Block pipe: mixed output, mixer → platform player (sink) or visualizer (capture)
//! - Stereo volume pipe: per-client volume, request thread → mixer thread

mod block;
mod source;
mod volume;

pub use block::{block_pipe, BlockReader, BlockWriter, PipeBlock};
pub use source::{
    AudioSourceDataPipe, BlockTag, SourceBlock, SourceInPort, SourceOutPort, SourcePipeId,
    TAG_FILTER_ALL, TAG_FILTER_AUDIO_DATA, TAG_FILTER_NON_AUDIO_DATA,
};
pub use volume::{stereo_volume_pipe, StereoVolume, VolumeReader, VolumeWriter};

/// Interleaved stereo
pub const NUM_CHANNELS: usize = 2;
