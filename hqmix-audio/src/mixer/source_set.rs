//! Source slots and the snapshots exchanged between the request and
//! mixer threads

use crate::mixing_unit::MixMode;
use crate::pipe::{SourceOutPort, SourcePipeId};

use super::client::SourceClientHandle;

/// Maximum number of attached source pipes
pub const NUM_MAX_SOURCE_PIPES: usize = 16;

/// Operation requested for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operation {
    #[default]
    None,
    Start,
    Stop,
    Detach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    #[default]
    None,
    OnEndOfData,
}

/// Starts another slot when the owning slot reaches its end of data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Trigger {
    pub mode: TriggerMode,
    pub target: SourceClientHandle,
    pub source_no: u32,
}

impl Trigger {
    pub fn on_end_of_data(target: SourceClientHandle, source_no: u32) -> Self {
        Self {
            mode: TriggerMode::OnEndOfData,
            target,
            source_no,
        }
    }

    /// Whether this trigger points at the slot identified by `handle` / `source_no`
    pub(crate) fn matches(&self, handle: &SourceClientHandle, source_no: u32) -> bool {
        self.mode == TriggerMode::OnEndOfData && self.target == *handle && self.source_no == source_no
    }
}

/// Stop the slot once a fade-out has completed
pub const STOP_AFTER_FADE_OUT: u32 = 1 << 0;
/// Stop the slot when its source reaches end of data
pub const STOP_ON_PLAYBACK_END: u32 = 1 << 1;
pub(crate) const STOP_COND_MASK: u32 = STOP_AFTER_FADE_OUT | STOP_ON_PLAYBACK_END;

/// Lifecycle state of a slot as seen by the mixer thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Placeholder written by the request thread
    #[default]
    Nop,
    Unused,
    Ready,
    StartedByExplicitOperation,
    StartedNoLoopTriggered,
    StartedLoopTriggered,
    StoppedByExplicitOperation,
    StoppedByDataEndNoTriggered,
    StoppedByDataEndTriggeredNoLoopingSource,
    StoppedByDataEndTriggeredLoopingSource,
    StoppedByFadedOut,
}

impl SlotState {
    pub fn is_started(self) -> bool {
        matches!(
            self,
            SlotState::StartedByExplicitOperation
                | SlotState::StartedNoLoopTriggered
                | SlotState::StartedLoopTriggered
        )
    }

    pub(crate) fn can_start_by_explicit_operation(self) -> bool {
        matches!(
            self,
            SlotState::Ready | SlotState::StoppedByExplicitOperation | SlotState::StoppedByFadedOut
        )
    }

    pub(crate) fn can_stop_by_explicit_operation(self) -> bool {
        self.is_started()
    }
}

/// State a slot takes after the mixer thread applies `operation`.
///
/// `update` is true when the slot already holds the same client and pipe.
pub(crate) fn next_slot_state(operation: Operation, update: bool, current: SlotState) -> SlotState {
    match operation {
        Operation::None if update => current,
        Operation::None => SlotState::Ready,
        Operation::Start if update && !current.can_start_by_explicit_operation() => current,
        Operation::Start => SlotState::StartedByExplicitOperation,
        Operation::Stop if update && !current.can_stop_by_explicit_operation() => current,
        Operation::Stop => SlotState::StoppedByExplicitOperation,
        Operation::Detach => SlotState::Unused,
    }
}

/// Contents of an occupied slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OccupiedSlot {
    pub client_handle: SourceClientHandle,
    pub handle_index: usize,
    pub operation: Operation,
    pub pipe: SourcePipeId,
    pub source_no: u32,
    pub mix_mode: MixMode,
    pub mix_phase: f32,
    pub mix_phase_override: bool,
    pub trigger_no_loop: Trigger,
    pub trigger_loop: Trigger,
    pub stop_cond: u32,
    pub state: SlotState,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum AudioSourceSlot {
    #[default]
    Vacant,
    Occupied(OccupiedSlot),
}

impl AudioSourceSlot {
    pub fn pipe(&self) -> Option<SourcePipeId> {
        match self {
            AudioSourceSlot::Vacant => None,
            AudioSourceSlot::Occupied(slot) => Some(slot.pipe),
        }
    }

    /// Vacant slots report [`SlotState::Unused`]
    pub fn state(&self) -> SlotState {
        match self {
            AudioSourceSlot::Vacant => SlotState::Unused,
            AudioSourceSlot::Occupied(slot) => slot.state,
        }
    }

    pub fn occupied(&self) -> Option<&OccupiedSlot> {
        match self {
            AudioSourceSlot::Vacant => None,
            AudioSourceSlot::Occupied(slot) => Some(slot),
        }
    }

    pub fn occupied_mut(&mut self) -> Option<&mut OccupiedSlot> {
        match self {
            AudioSourceSlot::Vacant => None,
            AudioSourceSlot::Occupied(slot) => Some(slot),
        }
    }
}

/// Fixed array of slots plus the set of slot indices changed since the
/// last exchange
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AudioSourceSet {
    pub slots: [AudioSourceSlot; NUM_MAX_SOURCE_PIPES],
    pub updated_bitmap: u32,
}

impl AudioSourceSet {
    pub fn find(&self, pipe: SourcePipeId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.pipe() == Some(pipe))
    }

    pub fn find_vacant(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, AudioSourceSlot::Vacant))
    }

    pub fn mark_updated(&mut self, index: usize) {
        self.updated_bitmap |= 1 << index;
    }

    pub fn unmark_updated(&mut self, index: usize) {
        self.updated_bitmap &= !(1 << index);
    }

    pub fn has_started_slot(&self) -> bool {
        self.slots.iter().any(|slot| slot.state().is_started())
    }
}

/// Which pool a snapshot item belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemOwner {
    RequestThread,
    MixerThread,
}

/// Pooled snapshot carried through the exchange queues.
///
/// `ports` moves consumer ports across: to the mixer for newly attached
/// slots, back to the request thread for detached ones.
pub(crate) struct SourceSetItem {
    pub owner: ItemOwner,
    pub set: AudioSourceSet,
    pub ports: [Option<SourceOutPort>; NUM_MAX_SOURCE_PIPES],
}

impl SourceSetItem {
    pub fn new(owner: ItemOwner) -> Box<Self> {
        Box::new(Self {
            owner,
            set: AudioSourceSet::default(),
            ports: std::array::from_fn(|_| None),
        })
    }

    /// Reset the snapshot. Ports must already have been taken out.
    pub fn clear(&mut self) {
        self.set = AudioSourceSet::default();
        debug_assert!(self.ports.iter().all(Option::is_none));
    }
}

/// Indices of the set bits of `bitmap`, lowest first
pub(crate) fn bits(mut bitmap: u32) -> impl Iterator<Item = usize> {
    std::iter::from_fn(move || {
        if bitmap == 0 {
            return None;
        }
        let index = bitmap.trailing_zeros() as usize;
        bitmap &= bitmap - 1;
        Some(index)
    })
}
