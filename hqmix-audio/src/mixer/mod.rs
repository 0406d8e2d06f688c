//! Audio mixer: control plane on the request thread, rendering on a
//! dedicated mixer thread
//!
//! The request thread edits a *requested* source set and ships full
//! snapshots of it to the mixer thread. The mixer thread applies them,
//! runs the slot state machine and sends back snapshots of its *current*
//! set, which the request thread folds into its *active* view and turns
//! into start/stop notifications for the source clients.

mod client;
mod source_set;
mod thread;

pub use client::{
    MixingStartCause, MixingStopCause, SourceClientEventHandler, SourceClientHandle,
    NUM_MAX_SOURCE_CLIENTS,
};
pub use source_set::{
    AudioSourceSet, AudioSourceSlot, OccupiedSlot, Operation, SlotState, Trigger, TriggerMode,
    NUM_MAX_SOURCE_PIPES, STOP_AFTER_FADE_OUT, STOP_ON_PLAYBACK_END,
};
pub use thread::SinkWriter;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::circulation_buffer::{circulation_buffer, Monitor, Reader, Writer};
use crate::effects::{EffectBinding, SharedEffect};
use crate::error::{MixerError, Result};
use crate::mixing_unit::{MixMode, MixingUnit};
use crate::pipe::{stereo_volume_pipe, AudioSourceDataPipe, BlockWriter, SourceOutPort, StereoVolume};

use client::MixerSourceClient;
pub(crate) use source_set::bits;
use source_set::{ItemOwner, SourceSetItem, STOP_COND_MASK};
use thread::{
    ClientVolumeReader, MixerShared, MixerThreadQueues, MixerThreadResources, INITIALIZED,
    REQUEST_STOP, REQUEST_SUSPENDED, RUNNING, SOURCE_SET_ITEMS_PER_THREAD, SOURCE_SET_QUEUE_SIZE,
};

/// Maximum number of mixed output effects
pub const NUM_MAX_MIXOUT_EFFECTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerState {
    NotInitialized,
    Stopped,
    Started,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallingContext {
    Normal,
    OnMixingStarted,
    OnMixingStopped,
}

/// Arguments for [`AudioMixer::initialize`]
pub struct MixerInitArgs {
    pub sampling_rate: u32,
    pub block_size: usize,
    pub sink: SinkWriter,
    pub capture: Option<BlockWriter<f32>>,
    /// Blocks the platform player keeps queued
    pub num_sink_player_blocks: usize,
    pub short_fade_duration_ms: u32,
    pub long_fade_duration_ms: u32,
    pub effects: Vec<EffectBinding>,
}

/// Arguments for [`AudioMixer::attach_or_update_source_pipe`]
#[derive(Clone)]
pub struct AttachSourceArgs {
    pub handle: SourceClientHandle,
    pub pipe: Arc<AudioSourceDataPipe>,
    pub operation: Operation,
    /// Client-defined number used to address this source from triggers
    pub source_no: u32,
    pub mix_mode: MixMode,
    pub mix_phase: f32,
    /// Use `mix_phase` instead of carrying the current phase over
    pub mix_phase_override: bool,
    pub trigger_no_loop: Trigger,
    pub trigger_loop: Trigger,
    pub stop_cond: u32,
}

impl AttachSourceArgs {
    pub fn new(handle: SourceClientHandle, pipe: Arc<AudioSourceDataPipe>) -> Self {
        Self {
            handle,
            pipe,
            operation: Operation::None,
            source_no: 0,
            mix_mode: MixMode::Add,
            mix_phase: 0.0,
            mix_phase_override: false,
            trigger_no_loop: Trigger::default(),
            trigger_loop: Trigger::default(),
            stop_cond: 0,
        }
    }
}

/// Wakes the mixer thread when the platform player has consumed a sink block
#[derive(Clone)]
pub struct SinkPullNotifier {
    shared: Arc<MixerShared>,
}

impl SinkPullNotifier {
    pub fn notify(&self) {
        self.shared.notify();
    }
}

/// Batches attach/detach requests and applies them together on drop
pub struct DeferredApplication<'a> {
    mixer: &'a mut AudioMixer,
}

impl DeferredApplication<'_> {
    pub fn attach_or_update_source_pipe(&mut self, args: &AttachSourceArgs) -> Result<()> {
        self.mixer.attach_or_update(args, true)
    }

    pub fn detach_source_pipe(&mut self, pipe: &Arc<AudioSourceDataPipe>) -> Result<()> {
        self.mixer.detach(pipe, true)
    }
}

impl Drop for DeferredApplication<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mixer.apply() {
            warn!(error = %e, "deferred source set application failed");
        }
    }
}

pub struct AudioMixer {
    state: MixerState,
    calling_context: CallingContext,
    shared: Arc<MixerShared>,
    thread: Option<JoinHandle<()>>,

    requested: AudioSourceSet,
    active: AudioSourceSet,
    pipes: [Option<Arc<AudioSourceDataPipe>>; NUM_MAX_SOURCE_PIPES],
    /// Consumer ports of attached pipes not yet handed to the mixer thread
    pending_ports: [Option<SourceOutPort>; NUM_MAX_SOURCE_PIPES],

    free_tx: Writer<Box<SourceSetItem>>,
    free_rx: Reader<Box<SourceSetItem>>,
    to_mixer: Writer<Box<SourceSetItem>>,
    from_mixer: Reader<Box<SourceSetItem>>,
    mixer_free: Monitor<Box<SourceSetItem>>,
    /// Mixer-thread queue ends, until `initialize` moves them into the resources
    thread_queues: Option<MixerThreadQueues>,

    clients: Vec<MixerSourceClient>,
    client_serial: u32,
    effects: Vec<SharedEffect>,
    block_size: usize,
    capture_available: bool,
}

impl AudioMixer {
    /// Create an uninitialized mixer with its exchange queues and item pools
    pub fn new() -> Self {
        let (to_mixer, from_request) = circulation_buffer(SOURCE_SET_QUEUE_SIZE);
        let (to_request, from_mixer) = circulation_buffer(SOURCE_SET_QUEUE_SIZE);
        let (mut free_tx, free_rx) = circulation_buffer(SOURCE_SET_QUEUE_SIZE);
        let (mut mixer_free_tx, mixer_free_rx) = circulation_buffer(SOURCE_SET_QUEUE_SIZE);

        for _ in 0..SOURCE_SET_ITEMS_PER_THREAD {
            // capacity exceeds the pool size, pushes cannot fail
            let _ = free_tx.push(SourceSetItem::new(ItemOwner::RequestThread));
            let _ = mixer_free_tx.push(SourceSetItem::new(ItemOwner::MixerThread));
        }

        let mut clients = Vec::with_capacity(NUM_MAX_SOURCE_CLIENTS);
        let mut volumes = Vec::with_capacity(NUM_MAX_SOURCE_CLIENTS);
        for _ in 0..NUM_MAX_SOURCE_CLIENTS {
            let (writer, reader) = stereo_volume_pipe();
            clients.push(MixerSourceClient::new(writer));
            volumes.push(ClientVolumeReader {
                reader,
                actual: StereoVolume::UNITY,
            });
        }

        let mixer_free = mixer_free_rx.monitor();

        Self {
            state: MixerState::NotInitialized,
            calling_context: CallingContext::Normal,
            shared: Arc::new(MixerShared::new()),
            thread: None,
            requested: AudioSourceSet::default(),
            active: AudioSourceSet::default(),
            pipes: std::array::from_fn(|_| None),
            pending_ports: std::array::from_fn(|_| None),
            free_tx,
            free_rx,
            to_mixer,
            from_mixer,
            mixer_free,
            thread_queues: Some(MixerThreadQueues {
                from_request,
                to_request,
                free_tx: mixer_free_tx,
                free_rx: mixer_free_rx,
                volumes,
            }),
            clients,
            client_serial: 0,
            effects: Vec::new(),
            block_size: 0,
            capture_available: false,
        }
    }

    pub fn initialize(&mut self, args: MixerInitArgs) -> Result<()> {
        if self.state != MixerState::NotInitialized {
            return Err(MixerError::IllegalState);
        }

        if args.sampling_rate == 0
            || args.block_size == 0
            || args.num_sink_player_blocks == 0
            || args.effects.len() > NUM_MAX_MIXOUT_EFFECTS
            || args.sink.block_size() != args.block_size
            || args.capture.as_ref().is_some_and(|c| c.block_size() != args.block_size)
        {
            return Err(MixerError::IllegalArgument);
        }

        let mixing_unit = MixingUnit::new(
            args.sampling_rate,
            args.block_size,
            args.short_fade_duration_ms,
            args.long_fade_duration_ms,
        )?;

        let queues = self.thread_queues.take().ok_or(MixerError::IllegalState)?;

        let sink_buffer_us = args.block_size as u64 * args.num_sink_player_blocks as u64 * 1_000_000
            / u64::from(args.sampling_rate);
        let sleep_duration = Duration::from_nanos(sink_buffer_us * 1000 * 3 / 2);
        let max_process_block_at_once = (args.num_sink_player_blocks * 2).min(args.sink.num_items());

        let (controls, processors): (Vec<_>, Vec<_>) = args
            .effects
            .into_iter()
            .map(|binding| (binding.control, binding.processor))
            .unzip();

        self.capture_available = args.capture.is_some();
        *self.shared.resources.lock() = Some(MixerThreadResources {
            queues,
            sink: args.sink,
            capture: args.capture,
            mixing_unit,
            effects: processors,
            ports: std::array::from_fn(|_| None),
            max_process_block_at_once,
            sleep_duration,
        });

        self.effects = controls;
        self.block_size = args.block_size;
        self.shared
            .premix_level
            .store(1.0f32.to_bits(), Ordering::Release);
        self.state = MixerState::Stopped;

        debug!(
            sampling_rate = args.sampling_rate,
            block_size = args.block_size,
            ?sleep_duration,
            max_process_block_at_once,
            "mixer initialized"
        );

        Ok(())
    }

    pub fn state(&self) -> MixerState {
        self.state
    }

    fn is_initialized(&self) -> bool {
        self.state != MixerState::NotInitialized
    }

    fn is_started(&self) -> bool {
        matches!(self.state, MixerState::Started | MixerState::Suspended)
    }

    /// Spawn the mixer thread, optionally parked in the suspended state
    pub fn start(&mut self, suspended: bool) -> Result<()> {
        match self.state {
            MixerState::NotInitialized => return Err(MixerError::IllegalState),
            MixerState::Started | MixerState::Suspended => return Ok(()),
            MixerState::Stopped => {}
        }

        {
            let mut resources = self.shared.resources.lock();
            let Some(res) = resources.as_mut() else {
                return Err(MixerError::InternalError);
            };

            // the thread starts from the requested volumes
            for (client, volume) in self.clients.iter_mut().zip(res.queues.volumes.iter_mut()) {
                volume.reader.read_latest();
                volume.actual = client.requested_volume;
                client.modified = false;
            }

            for (index, port) in self.pending_ports.iter_mut().enumerate() {
                if let Some(port) = port.take() {
                    res.ports[index] = Some(port);
                }
            }
        }

        self.shared
            .control_flags
            .store(if suspended { REQUEST_SUSPENDED } else { 0 }, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let initial = self.requested;
        let handle = std::thread::Builder::new()
            .name("hqmix-mixer".into())
            .spawn(move || thread::mixer_thread_main(shared, initial))
            .map_err(|e| {
                error!(error = %e, "failed to spawn mixer thread");
                MixerError::InternalError
            })?;

        {
            let mut guard = self.shared.mutex.lock();
            while self.shared.flags() & INITIALIZED == 0 {
                self.shared.cond.wait(&mut guard);
            }
        }

        if self.shared.flags() & RUNNING == 0 {
            let _ = handle.join();
            return Err(MixerError::InternalError);
        }

        self.thread = Some(handle);
        self.state = if suspended {
            MixerState::Suspended
        } else {
            MixerState::Started
        };
        self.active = self.requested;

        debug!(suspended, "mixer started");
        Ok(())
    }

    /// Stop and join the mixer thread
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            MixerState::NotInitialized => return Err(MixerError::IllegalState),
            MixerState::Stopped => return Ok(()),
            MixerState::Started | MixerState::Suspended => {}
        }

        self.shared.update_flags(REQUEST_STOP, 0);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("mixer thread panicked");
            }
        }
        self.shared.control_flags.store(0, Ordering::Release);
        self.state = MixerState::Stopped;

        self.recycle_all_source_set_items();
        self.active = self.requested;

        debug!("mixer stopped");
        Ok(())
    }

    pub fn suspend(&mut self) -> Result<()> {
        match self.state {
            MixerState::Suspended => Ok(()),
            MixerState::Started => {
                self.shared.update_flags(REQUEST_SUSPENDED, 0);
                self.state = MixerState::Suspended;
                debug!("mixer suspend requested");
                Ok(())
            }
            _ => Err(MixerError::IllegalState),
        }
    }

    pub fn resume(&mut self) -> Result<()> {
        match self.state {
            MixerState::Started => Ok(()),
            MixerState::Suspended => {
                self.shared.update_flags(0, REQUEST_SUSPENDED);
                self.state = MixerState::Started;
                debug!("mixer resume requested");
                Ok(())
            }
            _ => Err(MixerError::IllegalState),
        }
    }

    /// Attach a pipe, or update the slot it already occupies
    pub fn attach_or_update_source_pipe(&mut self, args: &AttachSourceArgs) -> Result<()> {
        self.attach_or_update(args, false)
    }

    /// Request detaching a pipe. The consumer port is released once the
    /// mixer thread has acknowledged it.
    pub fn detach_source_pipe(&mut self, pipe: &Arc<AudioSourceDataPipe>) -> Result<()> {
        self.detach(pipe, false)
    }

    /// Collect several attach/detach requests into one snapshot
    pub fn deferred(&mut self) -> DeferredApplication<'_> {
        DeferredApplication { mixer: self }
    }

    fn attach_or_update(&mut self, args: &AttachSourceArgs, deferred: bool) -> Result<()> {
        if !args.handle.is_valid()
            || args.operation == Operation::Detach
            || args.stop_cond & !STOP_COND_MASK != 0
            || !(0.0..=1.0).contains(&args.mix_phase)
        {
            return Err(MixerError::IllegalArgument);
        }
        if !self.is_initialized() {
            return Err(MixerError::IllegalState);
        }
        if args.pipe.block_size() != self.block_size {
            return Err(MixerError::IllegalArgument);
        }

        let pipe_id = args.pipe.id();
        let (index, is_new) = match self.requested.find(pipe_id) {
            Some(index) => (index, false),
            None => (
                self.requested
                    .find_vacant()
                    .ok_or(MixerError::ResourceAllocationFailed)?,
                true,
            ),
        };

        if is_new {
            self.pending_ports[index] = Some(args.pipe.acquire_out_port()?);
            self.pipes[index] = Some(Arc::clone(&args.pipe));
        } else if self.requested.slots[index]
            .occupied()
            .is_some_and(|slot| slot.operation == Operation::Detach)
        {
            return Err(MixerError::IllegalState);
        }

        self.requested.slots[index] = AudioSourceSlot::Occupied(OccupiedSlot {
            client_handle: args.handle,
            handle_index: args.handle.index(),
            operation: args.operation,
            pipe: pipe_id,
            source_no: args.source_no,
            mix_mode: args.mix_mode,
            mix_phase: args.mix_phase,
            mix_phase_override: args.mix_phase_override,
            trigger_no_loop: args.trigger_no_loop,
            trigger_loop: args.trigger_loop,
            stop_cond: args.stop_cond,
            state: SlotState::Nop,
        });
        self.requested.mark_updated(index);

        debug!(
            slot = index,
            pipe = ?pipe_id,
            operation = ?args.operation,
            attach = is_new,
            "source slot requested"
        );

        if self.is_started() && !deferred {
            self.apply_source_set_items();
        }

        Ok(())
    }

    fn detach(&mut self, pipe: &Arc<AudioSourceDataPipe>, deferred: bool) -> Result<()> {
        let index = self
            .requested
            .find(pipe.id())
            .ok_or(MixerError::IllegalArgument)?;

        let Some(slot) = self.requested.slots[index].occupied_mut() else {
            return Err(MixerError::IllegalArgument);
        };
        if slot.operation == Operation::Detach {
            return Ok(());
        }
        slot.operation = Operation::Detach;
        self.requested.mark_updated(index);

        debug!(slot = index, pipe = ?pipe.id(), "source detach requested");

        if !self.is_started() {
            // no mixer thread to acknowledge, the port is still ours
            let port = match self.pending_ports[index].take() {
                Some(port) => Some(port),
                None => self
                    .shared
                    .resources
                    .lock()
                    .as_mut()
                    .and_then(|res| res.ports[index].take()),
            };
            let cur = self.active.slots[index]
                .occupied()
                .filter(|cur| cur.pipe == pipe.id())
                .copied();
            self.finish_detach(index, cur, SlotState::Unused, port);
        } else if !deferred {
            self.apply_source_set_items();
        }

        Ok(())
    }

    /// Ship pending requests to the mixer thread
    pub fn apply(&mut self) -> Result<()> {
        if !self.is_initialized() {
            return Err(MixerError::IllegalState);
        }
        if self.is_started() {
            self.apply_source_set_items();
        }
        Ok(())
    }

    pub fn is_polling_required(&self) -> bool {
        !self.can_suspend() || self.effects.iter().any(|e| e.lock().is_polling_required())
    }

    /// Process acknowledgements, push pending requests and volumes, and
    /// service the effects
    pub fn poll(&mut self) -> Result<()> {
        if !self.is_initialized() {
            return Err(MixerError::IllegalState);
        }

        if self.is_started() {
            self.recycle_all_source_set_items();
            self.apply_source_set_items();
            self.apply_all_volumes();
        }

        for effect in &self.effects {
            let mut effect = effect.lock();
            if effect.is_polling_required() {
                if let Err(e) = effect.poll() {
                    warn!(error = %e, "effect poll failed");
                }
            }
        }

        if self.state == MixerState::Suspended {
            // let the suspended thread service its effects
            self.shared.notify();
        }

        Ok(())
    }

    /// Nothing is playing and no snapshot is in flight
    pub fn can_suspend(&self) -> bool {
        !self.active.has_started_slot()
            && self.free_rx.len() == SOURCE_SET_ITEMS_PER_THREAD
            && self.mixer_free.len() == SOURCE_SET_ITEMS_PER_THREAD
    }

    /// State of `pipe` as last acknowledged by the mixer thread
    pub fn source_slot_state(&self, pipe: &AudioSourceDataPipe) -> Option<SlotState> {
        self.active
            .find(pipe.id())
            .map(|index| self.active.slots[index].state())
    }

    pub fn register_source_client(
        &mut self,
        client_id: u64,
        event_handler: Arc<dyn SourceClientEventHandler>,
    ) -> Result<SourceClientHandle> {
        if client_id == 0 {
            return Err(MixerError::IllegalArgument);
        }
        if !self.is_initialized() {
            return Err(MixerError::IllegalState);
        }
        if self
            .clients
            .iter()
            .any(|c| c.is_registered() && c.handle.client_id() == client_id)
        {
            return Err(MixerError::IllegalState);
        }

        let index = self
            .clients
            .iter()
            .position(|c| !c.is_registered())
            .ok_or(MixerError::ResourceAllocationFailed)?;

        let handle = SourceClientHandle::new(index, self.client_serial, client_id);
        self.client_serial = self.client_serial.wrapping_add(1);

        let started = self.is_started();
        let client = &mut self.clients[index];
        client.reset();
        client.handle = handle;
        client.event_handler = Some(event_handler);
        if started {
            client.apply_volume();
        }

        debug!(index, client_id, "source client registered");
        Ok(handle)
    }

    pub fn unregister_source_client(&mut self, handle: &SourceClientHandle) -> Result<()> {
        if !handle.is_valid() {
            return Err(MixerError::IllegalArgument);
        }
        if !self.is_initialized() {
            return Err(MixerError::IllegalState);
        }

        let client = &mut self.clients[handle.index()];
        if client.handle != *handle {
            return Err(MixerError::IllegalState);
        }
        client.reset();

        debug!(index = handle.index(), "source client unregistered");
        Ok(())
    }

    /// Set the client gain, clamped to [0, 1]
    pub fn set_volume(&mut self, handle: &SourceClientHandle, left: f32, right: f32) -> Result<()> {
        if !handle.is_valid() {
            return Err(MixerError::IllegalArgument);
        }
        if !self.is_initialized() {
            return Err(MixerError::IllegalState);
        }

        let started = self.is_started();
        let client = &mut self.clients[handle.index()];
        if client.handle != *handle {
            return Err(MixerError::IllegalState);
        }

        let volume = StereoVolume::new(left.clamp(0.0, 1.0), right.clamp(0.0, 1.0));
        if volume == client.requested_volume {
            return Ok(());
        }

        client.requested_volume = volume;
        client.modified = true;
        if started {
            client.apply_volume();
        }

        Ok(())
    }

    pub fn set_looping(&self, handle: &SourceClientHandle, looping: bool) -> Result<()> {
        if !handle.is_valid() {
            return Err(MixerError::IllegalArgument);
        }
        if self.clients[handle.index()].handle != *handle {
            return Err(MixerError::IllegalState);
        }

        let mask = 1u32 << handle.index();
        if looping {
            self.shared.looping_bitmap.fetch_or(mask, Ordering::AcqRel);
        } else {
            self.shared.looping_bitmap.fetch_and(!mask, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn set_audio_capture_enabled(&self, enabled: bool) -> Result<()> {
        self.shared.capture_enabled.store(enabled, Ordering::Release);
        Ok(())
    }

    /// Gain applied to every source before mixing
    pub fn set_global_premix_volume_level(&self, level: f32) -> Result<()> {
        self.shared
            .premix_level
            .store(level.to_bits(), Ordering::Release);
        Ok(())
    }

    pub fn is_capture_available(&self) -> bool {
        self.capture_available
    }

    pub fn sink_pull_notifier(&self) -> SinkPullNotifier {
        SinkPullNotifier {
            shared: Arc::clone(&self.shared),
        }
    }

    fn apply_source_set_items(&mut self) -> bool {
        if self.requested.updated_bitmap == 0 {
            return false;
        }

        let Some(mut item) = self.free_rx.pop() else {
            return false;
        };

        item.set = self.requested;
        for (slot, port) in item.ports.iter_mut().zip(self.pending_ports.iter_mut()) {
            *slot = port.take();
        }

        if let Err(mut item) = self.to_mixer.push(item) {
            error!("source set request queue overflow");
            for (slot, port) in item.ports.iter_mut().zip(self.pending_ports.iter_mut()) {
                *port = slot.take();
            }
            item.clear();
            if self.free_tx.push(item).is_err() {
                error!("request free queue overflow");
            }
            return false;
        }

        self.requested.updated_bitmap = 0;
        self.shared.notify();
        true
    }

    fn apply_all_volumes(&mut self) {
        for client in self.clients.iter_mut().filter(|c| c.modified) {
            client.apply_volume();
        }
    }

    fn recycle_all_source_set_items(&mut self) -> usize {
        let mut count = 0;
        if self.calling_context == CallingContext::Normal {
            while self.receive_one_source_set_item() {
                count += 1;
            }
        }
        count
    }

    fn receive_one_source_set_item(&mut self) -> bool {
        debug_assert_eq!(self.calling_context, CallingContext::Normal);

        let Some(mut item) = self.from_mixer.pop() else {
            return false;
        };

        for index in bits(item.set.updated_bitmap) {
            let notified = item.set.slots[index];

            match (self.active.slots[index], notified) {
                (AudioSourceSlot::Vacant, AudioSourceSlot::Vacant) => {}
                (AudioSourceSlot::Vacant, AudioSourceSlot::Occupied(next)) => {
                    if next.operation == Operation::Detach {
                        // attached and detached within one snapshot
                        let port = item.ports[index]
                            .take()
                            .or_else(|| self.pending_ports[index].take());
                        self.finish_detach(index, None, next.state, port);
                    } else {
                        self.active.slots[index] = notified;
                        self.handle_mixing_state_changed(index, &next, SlotState::Ready, next.state);
                    }
                }
                (AudioSourceSlot::Occupied(cur), AudioSourceSlot::Occupied(next)) if cur.pipe == next.pipe => {
                    if next.operation == Operation::Detach {
                        let port = item.ports[index]
                            .take()
                            .or_else(|| self.pending_ports[index].take());
                        self.finish_detach(index, Some(cur), next.state, port);
                    } else {
                        if cur.state != next.state {
                            self.handle_mixing_state_changed(index, &cur, cur.state, next.state);
                        }
                        self.active.slots[index] = notified;
                    }
                }
                (active, notified) => {
                    error!(slot = index, ?active, ?notified, "unexpected source slot pairing");
                }
            }
        }

        for (index, port) in item.ports.iter_mut().enumerate() {
            if let Some(port) = port.take() {
                warn!(slot = index, "unexpected consumer port in acknowledgement");
                self.pending_ports[index] = Some(port);
            }
        }

        item.clear();
        let recycled = match item.owner {
            ItemOwner::RequestThread => self.free_tx.push(item),
            ItemOwner::MixerThread => self.to_mixer.push(item),
        };
        if recycled.is_err() {
            error!("failed to recycle a source set item");
        }

        true
    }

    /// Return the consumer port to its pipe, report the stop and vacate the slot
    fn finish_detach(
        &mut self,
        index: usize,
        cur: Option<OccupiedSlot>,
        next: SlotState,
        port: Option<SourceOutPort>,
    ) {
        if let (Some(port), Some(pipe)) = (port, self.pipes[index].as_ref()) {
            if let Err(e) = pipe.release_out_port(port) {
                error!(slot = index, error = %e, "failed to release consumer port");
            }
        }

        if let Some(cur) = cur {
            self.handle_mixing_state_changed(index, &cur, cur.state, next);
        }

        self.active.slots[index] = AudioSourceSlot::Vacant;
        self.requested.slots[index] = AudioSourceSlot::Vacant;
        self.requested.unmark_updated(index);
        self.pipes[index] = None;
        debug!(slot = index, "source detach completed");
    }

    fn handle_mixing_state_changed(
        &mut self,
        index: usize,
        slot: &OccupiedSlot,
        cur: SlotState,
        next: SlotState,
    ) {
        let started = !cur.is_started() && next.is_started();
        let stopped = cur.is_started() && !next.is_started();
        if !started && !stopped {
            return;
        }

        let client = &self.clients[slot.handle_index];
        if client.handle != slot.client_handle {
            return;
        }
        let (Some(handler), Some(pipe)) = (client.event_handler.clone(), self.pipes[index].clone()) else {
            return;
        };

        if started {
            let cause = match next {
                SlotState::StartedNoLoopTriggered => MixingStartCause::NoLoopTriggered,
                SlotState::StartedLoopTriggered => MixingStartCause::LoopTriggered,
                _ => MixingStartCause::ExplicitOperation,
            };
            debug!(slot = index, ?cause, "mixing started");
            self.calling_context = CallingContext::OnMixingStarted;
            handler.on_mixing_started(self, &pipe, cause);
        } else {
            let cause = match next {
                SlotState::Unused => MixingStopCause::Detached,
                SlotState::StoppedByDataEndNoTriggered => MixingStopCause::EndOfDataNoTriggered,
                SlotState::StoppedByDataEndTriggeredNoLoopingSource => {
                    MixingStopCause::EndOfDataTriggeredNoLoopingSource
                }
                SlotState::StoppedByDataEndTriggeredLoopingSource => {
                    MixingStopCause::EndOfDataTriggeredLoopingSource
                }
                SlotState::StoppedByFadedOut => MixingStopCause::FadedOut,
                _ => MixingStopCause::ExplicitOperation,
            };
            debug!(slot = index, ?cause, "mixing stopped");
            self.calling_context = CallingContext::OnMixingStopped;
            handler.on_mixing_stopped(self, &pipe, cause);
        }
        self.calling_context = CallingContext::Normal;
    }
}

impl Default for AudioMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioMixer {
    fn drop(&mut self) {
        if self.is_started() {
            if let Err(e) = self.stop() {
                warn!(error = %e, "failed to stop mixer on drop");
            }
        }
    }
}
