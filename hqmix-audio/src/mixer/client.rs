//! Source clients: owners of source pipes that receive mixing events

use std::sync::Arc;

use crate::pipe::{AudioSourceDataPipe, StereoVolume, VolumeWriter};

use super::AudioMixer;

/// Maximum number of registered source clients
pub const NUM_MAX_SOURCE_CLIENTS: usize = 4;

const HANDLE_PATTERN: u32 = 0xC3A7_6A00;
const HANDLE_PATTERN_MASK: u32 = 0xFFFF_FF00;

/// Opaque client handle returned by `register_source_client`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SourceClientHandle {
    pub(crate) f1: u32,
    pub(crate) f2: u32,
    pub(crate) f3: u64,
}

impl SourceClientHandle {
    pub(crate) fn new(index: usize, serial: u32, client_id: u64) -> Self {
        Self {
            f1: HANDLE_PATTERN | index as u32,
            f2: serial,
            f3: client_id,
        }
    }

    /// Client entry index encoded in the handle
    pub(crate) fn index(&self) -> usize {
        (self.f1 & !HANDLE_PATTERN_MASK) as usize
    }

    pub fn is_valid(&self) -> bool {
        (self.f1 & HANDLE_PATTERN_MASK) == HANDLE_PATTERN && self.index() < NUM_MAX_SOURCE_CLIENTS
    }

    pub fn client_id(&self) -> u64 {
        self.f3
    }
}

/// Why a source started contributing to the mix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixingStartCause {
    ExplicitOperation,
    NoLoopTriggered,
    LoopTriggered,
}

/// Why a source stopped contributing to the mix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixingStopCause {
    Detached,
    ExplicitOperation,
    EndOfDataNoTriggered,
    EndOfDataTriggeredNoLoopingSource,
    EndOfDataTriggeredLoopingSource,
    FadedOut,
}

/// Receives start/stop notifications on the request thread.
///
/// Both callbacks get the mixer back so they can attach, update or detach
/// pipes from inside the notification.
pub trait SourceClientEventHandler: Send + Sync {
    fn on_mixing_started(
        &self,
        mixer: &mut AudioMixer,
        pipe: &Arc<AudioSourceDataPipe>,
        cause: MixingStartCause,
    );

    fn on_mixing_stopped(
        &self,
        mixer: &mut AudioMixer,
        pipe: &Arc<AudioSourceDataPipe>,
        cause: MixingStopCause,
    );
}

/// Request-thread side of one client entry
pub(crate) struct MixerSourceClient {
    pub handle: SourceClientHandle,
    pub event_handler: Option<Arc<dyn SourceClientEventHandler>>,
    pub volume_writer: VolumeWriter,
    pub requested_volume: StereoVolume,
    /// Requested volume not yet pushed to the mixer thread
    pub modified: bool,
}

impl MixerSourceClient {
    pub fn new(volume_writer: VolumeWriter) -> Self {
        Self {
            handle: SourceClientHandle::default(),
            event_handler: None,
            volume_writer,
            requested_volume: StereoVolume::UNITY,
            modified: false,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.handle != SourceClientHandle::default()
    }

    /// Forget the registration and fall back to unity gain
    pub fn reset(&mut self) {
        self.handle = SourceClientHandle::default();
        self.event_handler = None;
        self.requested_volume = StereoVolume::UNITY;
        self.modified = true;
    }

    /// Push the pending volume. Returns `false` when the ring is full.
    pub fn apply_volume(&mut self) -> bool {
        if !self.modified {
            return true;
        }
        if self.volume_writer.write(self.requested_volume) {
            self.modified = false;
            true
        } else {
            false
        }
    }
}
