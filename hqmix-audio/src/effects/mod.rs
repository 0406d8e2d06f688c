//! Effects applied to the mixed output
//!
//! Every effect is split in two halves:
//! - [`MixedOutputAudioEffect`]: control half, owned by the request thread
//! - [`MixedOutputAudioEffectProcessor`]: render half, moved into the mixer thread
//!
//! The halves talk to each other through circulation buffers only, so the
//! render half never takes a lock while processing.

pub mod equalizer;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Control half of a mixed output effect
pub trait MixedOutputAudioEffect: Send {
    /// Whether [`poll`](Self::poll) has pending work
    fn is_polling_required(&self) -> bool;

    /// Recycle items returned by the render half and push pending requests
    fn poll(&mut self) -> Result<()>;
}

/// Render half of a mixed output effect
pub trait MixedOutputAudioEffectProcessor: Send {
    fn on_attached_to_mixer_thread(&mut self);

    fn on_detached_from_mixer_thread(&mut self);

    /// Pick up requests from the control half
    fn poll_from_mixer_thread(&mut self);

    /// Process interleaved samples in place
    fn process(&mut self, data: &mut [f32], num_channels: usize, num_frames: usize);
}

/// Control half shared between the owner and the mixer
pub type SharedEffect = Arc<Mutex<dyn MixedOutputAudioEffect>>;

/// Both halves of one effect, handed to the mixer at initialization
pub struct EffectBinding {
    pub control: SharedEffect,
    pub processor: Box<dyn MixedOutputAudioEffectProcessor>,
}
