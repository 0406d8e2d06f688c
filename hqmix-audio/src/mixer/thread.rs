//! Mixer thread: applies source-set snapshots, evaluates start and stop
//! triggers and renders one sink block per iteration

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use super::source_set::{
    bits, next_slot_state, AudioSourceSet, AudioSourceSlot, ItemOwner, OccupiedSlot, Operation,
    SlotState, SourceSetItem, NUM_MAX_SOURCE_PIPES, STOP_AFTER_FADE_OUT, STOP_ON_PLAYBACK_END,
};
use crate::circulation_buffer::{Reader, Writer};
use crate::effects::MixedOutputAudioEffectProcessor;
use crate::error::{MixerError, Result};
use crate::mixing_unit::{carry_over_phase, MixContext, MixingUnit, SinkBuffer};
use crate::pipe::{
    BlockTag, BlockWriter, PipeBlock, SourceOutPort, StereoVolume, VolumeReader,
    TAG_FILTER_AUDIO_DATA, TAG_FILTER_NON_AUDIO_DATA,
};

// control flags: requests from the request thread
pub(crate) const REQUEST_STOP: u32 = 1 << 0;
pub(crate) const REQUEST_SUSPENDED: u32 = 1 << 1;
// control flags: mixer thread status
pub(crate) const INITIALIZED: u32 = 1 << 16;
pub(crate) const RUNNING: u32 = 1 << 17;
pub(crate) const SUSPENDED: u32 = 1 << 18;

// per-slot flags
const SLOT_DETACH_REQUESTED: u32 = 1 << 0;
const SLOT_STARTED: u32 = 1 << 1;
const SLOT_END_OF_DATA: u32 = 1 << 2;
const SLOT_END_OF_DATA_WITH_LOOPING: u32 = 1 << 3;
const SLOT_TRIGGER_FIRED: u32 = 1 << 4;

/// Capacity of each source-set exchange queue
pub(crate) const SOURCE_SET_QUEUE_SIZE: usize = 64;
/// Snapshot items owned by each thread
pub(crate) const SOURCE_SET_ITEMS_PER_THREAD: usize = SOURCE_SET_QUEUE_SIZE / 2 - 1;

/// Sink pipe writer, in either sample format
pub enum SinkWriter {
    S16(BlockWriter<i16>),
    F32(BlockWriter<f32>),
}

impl SinkWriter {
    pub fn block_size(&self) -> usize {
        match self {
            SinkWriter::S16(w) => w.block_size(),
            SinkWriter::F32(w) => w.block_size(),
        }
    }

    pub fn num_items(&self) -> usize {
        match self {
            SinkWriter::S16(w) => w.num_items(),
            SinkWriter::F32(w) => w.num_items(),
        }
    }

    fn lock_write(&mut self, min_remains: usize) -> Option<SinkBlock> {
        match self {
            SinkWriter::S16(w) => w.lock_write(min_remains).map(SinkBlock::S16),
            SinkWriter::F32(w) => w.lock_write(min_remains).map(SinkBlock::F32),
        }
    }

    fn unlock_write(&mut self, block: SinkBlock) -> Result<()> {
        match (self, block) {
            (SinkWriter::S16(w), SinkBlock::S16(b)) => w.unlock_write(b),
            (SinkWriter::F32(w), SinkBlock::F32(b)) => w.unlock_write(b),
            _ => Err(MixerError::InternalError),
        }
    }
}

enum SinkBlock {
    S16(Box<PipeBlock<i16>>),
    F32(Box<PipeBlock<f32>>),
}

impl SinkBlock {
    fn buffer(&mut self) -> SinkBuffer<'_> {
        match self {
            SinkBlock::S16(b) => SinkBuffer::S16(&mut b.data[..]),
            SinkBlock::F32(b) => SinkBuffer::F32(&mut b.data[..]),
        }
    }
}

/// State shared by the request thread and the mixer thread
pub(crate) struct MixerShared {
    pub control_flags: AtomicU32,
    pub mutex: Mutex<()>,
    pub cond: Condvar,
    /// f32 bits
    pub premix_level: AtomicU32,
    /// Bit per client index
    pub looping_bitmap: AtomicU32,
    pub capture_enabled: AtomicBool,
    /// Held here while the thread is not running
    pub resources: Mutex<Option<MixerThreadResources>>,
}

impl MixerShared {
    pub fn new() -> Self {
        Self {
            control_flags: AtomicU32::new(0),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
            premix_level: AtomicU32::new(1.0f32.to_bits()),
            looping_bitmap: AtomicU32::new(0),
            capture_enabled: AtomicBool::new(false),
            resources: Mutex::new(None),
        }
    }

    /// Wake the mixer thread
    pub fn notify(&self) {
        let _guard = self.mutex.lock();
        self.cond.notify_all();
    }

    pub fn flags(&self) -> u32 {
        self.control_flags.load(Ordering::Acquire)
    }

    /// Update control flags under the mutex and wake the mixer thread
    pub fn update_flags(&self, set: u32, clear: u32) {
        let _guard = self.mutex.lock();
        let flags = self.control_flags.load(Ordering::Acquire);
        self.control_flags
            .store((flags & !clear) | set, Ordering::Release);
        self.cond.notify_all();
    }

    pub fn premix_level(&self) -> f32 {
        f32::from_bits(self.premix_level.load(Ordering::Acquire))
    }
}

/// Volume ring reader of one client plus the last value read from it
pub(crate) struct ClientVolumeReader {
    pub reader: VolumeReader,
    pub actual: StereoVolume,
}

/// Queue ends the mixer thread owns
pub(crate) struct MixerThreadQueues {
    pub from_request: Reader<Box<SourceSetItem>>,
    pub to_request: Writer<Box<SourceSetItem>>,
    pub free_tx: Writer<Box<SourceSetItem>>,
    pub free_rx: Reader<Box<SourceSetItem>>,
    pub volumes: Vec<ClientVolumeReader>,
}

/// Everything the mixer thread takes with it while running
pub(crate) struct MixerThreadResources {
    pub queues: MixerThreadQueues,
    pub sink: SinkWriter,
    pub capture: Option<BlockWriter<f32>>,
    pub mixing_unit: MixingUnit,
    pub effects: Vec<Box<dyn MixedOutputAudioEffectProcessor>>,
    pub ports: [Option<SourceOutPort>; NUM_MAX_SOURCE_PIPES],
    pub max_process_block_at_once: usize,
    pub sleep_duration: Duration,
}

#[inline]
fn should_suspend(flags: u32) -> bool {
    flags & REQUEST_SUSPENDED != 0 && flags & REQUEST_STOP == 0
}

/// Thread entry point
pub(crate) fn mixer_thread_main(shared: Arc<MixerShared>, initial: AudioSourceSet) {
    let resources = shared.resources.lock().take();
    let Some(resources) = resources else {
        error!("mixer thread started without resources");
        shared.update_flags(INITIALIZED, 0);
        return;
    };

    let mut c = MixerThreadContext::new(Arc::clone(&shared), resources);
    c.enter(&initial);
    debug!("mixer thread started");

    c.run();

    c.exit();
    *shared.resources.lock() = Some(c.into_resources());
    shared.update_flags(0, RUNNING);
    debug!("mixer thread exited");
}

pub(crate) struct MixerThreadContext {
    shared: Arc<MixerShared>,
    res: MixerThreadResources,
    current: AudioSourceSet,
    slot_flags: [u32; NUM_MAX_SOURCE_PIPES],
    contexts: [MixContext; NUM_MAX_SOURCE_PIPES],
    attached_bitmap: u32,
    started_bitmap: u32,
    detach_requested_bitmap: u32,
    looping_bitmap: u32,
    premix_level: f32,
}

impl MixerThreadContext {
    pub fn new(shared: Arc<MixerShared>, res: MixerThreadResources) -> Self {
        Self {
            shared,
            res,
            current: AudioSourceSet::default(),
            slot_flags: [0; NUM_MAX_SOURCE_PIPES],
            contexts: [MixContext::default(); NUM_MAX_SOURCE_PIPES],
            attached_bitmap: 0,
            started_bitmap: 0,
            detach_requested_bitmap: 0,
            looping_bitmap: 0,
            premix_level: 1.0,
        }
    }

    pub fn into_resources(self) -> MixerThreadResources {
        self.res
    }

    /// Adopt the initial snapshot and report readiness to the starter
    fn enter(&mut self, initial: &AudioSourceSet) {
        let shared = Arc::clone(&self.shared);
        let _guard = shared.mutex.lock();

        self.update_global_premix_level();
        for (index, slot) in initial.slots.iter().enumerate() {
            if let AudioSourceSlot::Occupied(slot) = slot {
                self.initialize_source(index, slot);
            }
        }
        for effect in self.res.effects.iter_mut() {
            effect.on_attached_to_mixer_thread();
        }

        shared
            .control_flags
            .fetch_or(INITIALIZED | RUNNING, Ordering::AcqRel);
        shared.cond.notify_all();
    }

    fn run(&mut self) {
        let shared = Arc::clone(&self.shared);
        let mut processed_count = 0;

        loop {
            let mut flags = shared.flags();

            if should_suspend(flags) {
                let mut guard = shared.mutex.lock();
                flags = shared.control_flags.fetch_or(SUSPENDED, Ordering::AcqRel) | SUSPENDED;
                debug!("mixer thread suspended");

                while should_suspend(flags) {
                    self.handle_non_audio_data_blocks();
                    self.poll_effects();
                    shared.cond.wait(&mut guard);
                    flags = shared.flags();
                }

                shared.control_flags.fetch_and(!SUSPENDED, Ordering::AcqRel);
                debug!("mixer thread resumed");
            }

            if flags & REQUEST_STOP != 0 {
                break;
            }

            self.looping_bitmap = shared.looping_bitmap.load(Ordering::Acquire);
            self.poll_effects();

            for _ in 0..SOURCE_SET_QUEUE_SIZE {
                if !self.update_one() {
                    break;
                }
            }

            self.handle_non_audio_data_blocks();
            self.check_start_conditions();
            self.check_stop_conditions();

            self.update_global_premix_level();
            self.update_mix_volumes();

            let processed = self.handle_audio_data_blocks();
            if processed {
                self.handle_non_audio_data_blocks();
                self.check_start_conditions();
                self.check_stop_conditions();
            }

            self.notify();

            if processed {
                processed_count += 1;
            }

            if !processed || processed_count >= self.res.max_process_block_at_once {
                processed_count = 0;
                let mut guard = shared.mutex.lock();
                if shared.flags() & REQUEST_STOP == 0 {
                    shared.cond.wait_for(&mut guard, self.res.sleep_duration);
                }
            }
        }
    }

    /// Drain pending exchanges before handing the resources back
    fn exit(&mut self) {
        for effect in self.res.effects.iter_mut() {
            effect.on_detached_from_mixer_thread();
        }
        while self.update_one() {}
        while self.update_mix_volumes() {}
    }

    fn poll_effects(&mut self) {
        for effect in self.res.effects.iter_mut() {
            effect.poll_from_mixer_thread();
        }
    }

    fn update_global_premix_level(&mut self) {
        self.premix_level = self.shared.premix_level();
    }

    /// Apply one snapshot from the request thread, or recycle one of our
    /// own items coming back. Returns `false` when the queue was empty.
    pub(crate) fn update_one(&mut self) -> bool {
        let Some(mut item) = self.res.queues.from_request.pop() else {
            return false;
        };

        let mut applied = false;

        match item.owner {
            ItemOwner::RequestThread => {
                let updated = item.set.updated_bitmap;

                for index in 0..NUM_MAX_SOURCE_PIPES {
                    if let Some(port) = item.ports[index].take() {
                        self.adopt_port(index, port);
                    }
                }

                for index in bits(updated) {
                    if let AudioSourceSlot::Occupied(slot) = item.set.slots[index] {
                        self.initialize_source(index, &slot);
                    }
                }

                self.current.updated_bitmap |= updated;
                item.set = self.current;

                // ports of detached pipes go back with the acknowledgement
                for index in bits(self.detach_requested_bitmap) {
                    item.ports[index] = self.res.ports[index].take();
                }

                match self.res.queues.to_request.push(item) {
                    Ok(()) => applied = true,
                    Err(mut item) => {
                        error!("source set acknowledgement queue overflow");
                        for index in 0..NUM_MAX_SOURCE_PIPES {
                            if let Some(port) = item.ports[index].take() {
                                self.res.ports[index] = Some(port);
                            }
                        }
                    }
                }
            }
            ItemOwner::MixerThread => {
                item.clear();
                if self.res.queues.free_tx.push(item).is_err() {
                    error!("mixer free queue overflow");
                }
            }
        }

        self.check_start_conditions();

        if applied {
            self.current.updated_bitmap = 0;
            self.clean_up();
        }

        true
    }

    fn adopt_port(&mut self, index: usize, port: SourceOutPort) {
        if let Some(old) = self.res.ports[index].replace(port) {
            error!(slot = index, pipe = ?old.pipe_id(), "consumer port overwritten");
        }
    }

    pub(crate) fn initialize_source(&mut self, index: usize, new: &OccupiedSlot) {
        let current = self.current.slots[index];
        let same_pipe = current.pipe() == Some(new.pipe);
        let update = same_pipe
            && current
                .occupied()
                .is_some_and(|c| c.client_handle == new.client_handle);

        let mut flags = if update { self.slot_flags[index] } else { 0 };

        match self.res.ports[index].as_ref().map(SourceOutPort::last_block_tag) {
            Some(BlockTag::EndOfData) => flags |= SLOT_END_OF_DATA,
            Some(BlockTag::EndOfDataWithLoopPoint) => {
                flags |= SLOT_END_OF_DATA | SLOT_END_OF_DATA_WITH_LOOPING
            }
            _ => {}
        }

        match new.operation {
            Operation::None => {}
            Operation::Start => {
                if flags & SLOT_DETACH_REQUESTED == 0 {
                    flags |= SLOT_STARTED;
                }
            }
            Operation::Stop => {
                if flags & SLOT_DETACH_REQUESTED == 0 {
                    flags &= !SLOT_STARTED;
                }
            }
            Operation::Detach => {
                flags &= !SLOT_STARTED;
                flags |= SLOT_DETACH_REQUESTED;
            }
        }

        let volume = self.res.queues.volumes[new.handle_index].actual;
        let ctx = &mut self.contexts[index];
        let prev_mode = ctx.mode;
        ctx.mode = new.mix_mode;
        ctx.phase = if new.mix_phase_override {
            new.mix_phase
        } else if same_pipe {
            carry_over_phase(prev_mode, new.mix_mode, ctx.phase)
        } else {
            0.0
        };
        ctx.volume = [
            volume.left * self.premix_level,
            volume.right * self.premix_level,
        ];

        let state = next_slot_state(new.operation, update, current.state());
        self.current.slots[index] = AudioSourceSlot::Occupied(OccupiedSlot { state, ..*new });
        self.slot_flags[index] = flags;

        let mask = 1 << index;
        self.attached_bitmap |= mask;
        set_bit(&mut self.started_bitmap, mask, flags & SLOT_STARTED != 0);
        set_bit(
            &mut self.detach_requested_bitmap,
            mask,
            flags & SLOT_DETACH_REQUESTED != 0,
        );

        trace!(slot = index, update, ?state, "source slot initialized");
    }

    /// Forget slots whose detach has been acknowledged
    fn clean_up(&mut self) {
        for index in bits(self.detach_requested_bitmap) {
            let mask = 1 << index;
            self.current.slots[index] = AudioSourceSlot::Vacant;
            self.slot_flags[index] = 0;
            self.contexts[index] = MixContext::default();
            self.attached_bitmap &= !mask;
            self.started_bitmap &= !mask;
            if let Some(port) = self.res.ports[index].take() {
                warn!(slot = index, pipe = ?port.pipe_id(), "dropping consumer port of a detached slot");
            }
            debug!(slot = index, "source detached");
        }
        self.detach_requested_bitmap = 0;
    }

    /// Send a snapshot of the current set if anything changed since the last one
    fn notify(&mut self) -> bool {
        if self.current.updated_bitmap == 0 {
            return false;
        }

        let queues = &mut self.res.queues;
        let Some(mut free) = queues.free_rx.lock_read(0) else {
            return false;
        };
        let Some(mut out) = queues.to_request.lock_write(0) else {
            free.unlock_read(false);
            return false;
        };

        let Some(mut item) = free.take() else {
            error!("empty cell in the mixer free queue");
            free.unlock_read(true);
            return false;
        };
        free.unlock_read(true);

        item.set = self.current;
        *out = Some(item);
        out.unlock_write();

        self.current.updated_bitmap = 0;
        true
    }

    pub(crate) fn check_start_conditions(&mut self) -> bool {
        let mut started = 0;

        for target_index in bits(self.attached_bitmap & !self.started_bitmap) {
            if self.slot_flags[target_index] & SLOT_END_OF_DATA != 0 {
                continue;
            }
            let Some(target) = self.current.slots[target_index].occupied().copied() else {
                continue;
            };

            let fired = bits(self.attached_bitmap & !(1 << target_index)).find_map(|trigger_index| {
                let trigger_flags = self.slot_flags[trigger_index];
                if trigger_flags & SLOT_TRIGGER_FIRED != 0 || trigger_flags & SLOT_END_OF_DATA == 0 {
                    return None;
                }
                let trigger = self.current.slots[trigger_index].occupied()?;
                if trigger_flags & SLOT_END_OF_DATA_WITH_LOOPING != 0 {
                    trigger
                        .trigger_loop
                        .matches(&target.client_handle, target.source_no)
                        .then_some((trigger_index, SlotState::StartedLoopTriggered))
                } else {
                    trigger
                        .trigger_no_loop
                        .matches(&target.client_handle, target.source_no)
                        .then_some((trigger_index, SlotState::StartedNoLoopTriggered))
                }
            });

            if let Some((trigger_index, state)) = fired {
                self.slot_flags[target_index] |= SLOT_STARTED;
                self.slot_flags[trigger_index] |= SLOT_TRIGGER_FIRED;
                // the target continues where the trigger source left off
                self.contexts[target_index] = self.contexts[trigger_index];
                if let Some(slot) = self.current.slots[target_index].occupied_mut() {
                    slot.state = state;
                }
                started |= 1 << target_index;
                debug!(target = target_index, trigger = trigger_index, ?state, "end of data trigger fired");
            }
        }

        self.started_bitmap |= started;
        self.current.updated_bitmap |= started;
        started != 0
    }

    pub(crate) fn check_stop_conditions(&mut self) -> bool {
        let mut stopped = 0;

        for index in bits(self.started_bitmap) {
            let Some(slot) = self.current.slots[index].occupied_mut() else {
                continue;
            };
            let ctx = &self.contexts[index];
            let flags = &mut self.slot_flags[index];

            let mut stop_state = None;

            if slot.stop_cond & STOP_AFTER_FADE_OUT != 0 && ctx.mode.is_fade_out() && ctx.phase >= 1.0 {
                stop_state = Some(SlotState::StoppedByFadedOut);
            }

            if slot.stop_cond & STOP_ON_PLAYBACK_END != 0 && *flags & SLOT_END_OF_DATA != 0 {
                stop_state = Some(if *flags & SLOT_TRIGGER_FIRED == 0 {
                    SlotState::StoppedByDataEndNoTriggered
                } else if *flags & SLOT_END_OF_DATA_WITH_LOOPING != 0 {
                    SlotState::StoppedByDataEndTriggeredLoopingSource
                } else {
                    SlotState::StoppedByDataEndTriggeredNoLoopingSource
                });
            }

            if let Some(state) = stop_state {
                *flags &= !SLOT_STARTED;
                slot.state = state;
                stopped |= 1 << index;
            }
        }

        self.started_bitmap &= !stopped;
        self.current.updated_bitmap |= stopped;
        stopped != 0
    }

    /// Consume end-of-data markers waiting at the head of started sources
    pub(crate) fn handle_non_audio_data_blocks(&mut self) {
        for index in bits(self.started_bitmap) {
            let Some(slot) = self.current.slots[index].occupied() else {
                continue;
            };
            let Some(port) = self.res.ports[index].as_mut() else {
                continue;
            };
            let looping = self.looping_bitmap & (1 << slot.handle_index) != 0;

            while let Some(mut block) = port.lock_consume(0, TAG_FILTER_NON_AUDIO_DATA) {
                match block.tag {
                    BlockTag::EndOfData => {
                        self.slot_flags[index] |= SLOT_END_OF_DATA;
                        if looping {
                            self.slot_flags[index] |= SLOT_END_OF_DATA_WITH_LOOPING;
                            block.tag = BlockTag::EndOfDataWithLoopPoint;
                        }
                    }
                    tag => error!(slot = index, ?tag, "unexpected block tag"),
                }
                port.unlock_consume(block);
            }
        }
    }

    /// Render one sink block. Returns `false` when the sink has no free block.
    pub(crate) fn handle_audio_data_blocks(&mut self) -> bool {
        let capture_enabled = self.shared.capture_enabled.load(Ordering::Acquire);
        let res = &mut self.res;

        let Some(mut dest) = res.sink.lock_write(0) else {
            return false;
        };
        let mut capture = match res.capture.as_mut() {
            Some(capture) if capture_enabled => capture.lock_write(0),
            _ => None,
        };

        match res.mixing_unit.begin(
            dest.buffer(),
            capture.as_mut().map(|block| &mut block.data[..]),
            &mut res.effects,
        ) {
            Ok(mut pass) => {
                for index in bits(self.started_bitmap) {
                    let ctx = &mut self.contexts[index];
                    let block = res.ports[index]
                        .as_mut()
                        .and_then(|port| port.lock_consume(0, TAG_FILTER_AUDIO_DATA));

                    match block {
                        Some(block) => {
                            if let Err(e) = pass.mix(ctx, &block.data) {
                                trace!(slot = index, error = %e, "mix skipped");
                            }
                            if let Some(port) = res.ports[index].as_mut() {
                                port.unlock_consume(block);
                            }
                        }
                        // starved sources count as having finished their fade
                        None => ctx.phase = 1.0,
                    }
                }
                pass.end();
            }
            Err(e) => error!(error = %e, "failed to begin mix pass"),
        }

        if let Some(mut block) = capture {
            block.timestamp = Some(Instant::now());
            if let Some(writer) = res.capture.as_mut() {
                if let Err(e) = writer.unlock_write(block) {
                    warn!(error = %e, "capture block dropped");
                }
            }
        }

        if let Err(e) = res.sink.unlock_write(dest) {
            error!(error = %e, "sink block dropped");
        }

        true
    }

    /// Read client volumes and refresh the gains of attached slots.
    /// Returns `true` when any client volume changed.
    pub(crate) fn update_mix_volumes(&mut self) -> bool {
        let mut updated = false;
        for client in self.res.queues.volumes.iter_mut() {
            if let Some(volume) = client.reader.read_latest() {
                client.actual = volume;
                updated = true;
            }
        }

        for index in bits(self.attached_bitmap) {
            let Some(slot) = self.current.slots[index].occupied() else {
                continue;
            };
            let volume = self.res.queues.volumes[slot.handle_index].actual;
            self.contexts[index].volume = [
                volume.left * self.premix_level,
                volume.right * self.premix_level,
            ];
        }

        updated
    }
}

#[inline]
fn set_bit(bitmap: &mut u32, mask: u32, on: bool) {
    if on {
        *bitmap |= mask;
    } else {
        *bitmap &= !mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circulation_buffer::circulation_buffer;
    use crate::mixer::client::SourceClientHandle;
    use crate::mixer::source_set::Trigger;
    use crate::mixing_unit::MixMode;
    use crate::pipe::{block_pipe, stereo_volume_pipe, AudioSourceDataPipe, BlockReader, SourceInPort};

    const BLOCK: usize = 4;

    struct Harness {
        ctx: MixerThreadContext,
        sink: BlockReader<f32>,
        to_mixer: Writer<Box<SourceSetItem>>,
        from_mixer: Reader<Box<SourceSetItem>>,
    }

    fn harness() -> Harness {
        let (to_mixer, from_request) = circulation_buffer(SOURCE_SET_QUEUE_SIZE);
        let (to_request, from_mixer) = circulation_buffer(SOURCE_SET_QUEUE_SIZE);
        let (mut free_tx, free_rx) = circulation_buffer(SOURCE_SET_QUEUE_SIZE);
        for _ in 0..SOURCE_SET_ITEMS_PER_THREAD {
            assert!(free_tx.push(SourceSetItem::new(ItemOwner::MixerThread)).is_ok());
        }
        let volumes = (0..4)
            .map(|_| ClientVolumeReader {
                reader: stereo_volume_pipe().1,
                actual: StereoVolume::UNITY,
            })
            .collect();
        let (sink_tx, sink) = block_pipe::<f32>(BLOCK, 2).unwrap();

        let res = MixerThreadResources {
            queues: MixerThreadQueues {
                from_request,
                to_request,
                free_tx,
                free_rx,
                volumes,
            },
            sink: SinkWriter::F32(sink_tx),
            capture: None,
            mixing_unit: MixingUnit::new(1000, BLOCK, 10, 10).unwrap(),
            effects: Vec::new(),
            ports: std::array::from_fn(|_| None),
            max_process_block_at_once: 2,
            sleep_duration: Duration::from_millis(1),
        };

        Harness {
            ctx: MixerThreadContext::new(Arc::new(MixerShared::new()), res),
            sink,
            to_mixer,
            from_mixer,
        }
    }

    fn slot(handle: SourceClientHandle, pipe: &AudioSourceDataPipe, source_no: u32, op: Operation) -> OccupiedSlot {
        OccupiedSlot {
            client_handle: handle,
            handle_index: handle.index(),
            operation: op,
            pipe: pipe.id(),
            source_no,
            mix_mode: MixMode::Add,
            mix_phase: 0.0,
            mix_phase_override: false,
            trigger_no_loop: Trigger::default(),
            trigger_loop: Trigger::default(),
            stop_cond: 0,
            state: SlotState::Nop,
        }
    }

    fn attach(h: &mut Harness, index: usize, pipe: &Arc<AudioSourceDataPipe>, slot: OccupiedSlot) -> SourceInPort {
        h.ctx.res.ports[index] = Some(pipe.acquire_out_port().unwrap());
        h.ctx.initialize_source(index, &slot);
        pipe.acquire_in_port().unwrap()
    }

    fn produce(port: &mut SourceInPort, tag: BlockTag, value: f32) {
        let mut block = port.lock_produce().unwrap();
        block.tag = tag;
        block.data.fill(value);
        port.unlock_produce(block);
    }

    fn state(h: &Harness, index: usize) -> SlotState {
        h.ctx.current.slots[index].state()
    }

    #[test]
    fn test_initialize_source_states() {
        let mut h = harness();
        let handle = SourceClientHandle::new(0, 0, 1);
        let pipe = AudioSourceDataPipe::new(BLOCK, 4).unwrap();

        let _in = attach(&mut h, 0, &pipe, slot(handle, &pipe, 0, Operation::None));
        assert_eq!(state(&h, 0), SlotState::Ready);
        assert_eq!(h.ctx.attached_bitmap, 1);
        assert_eq!(h.ctx.started_bitmap, 0);

        h.ctx.initialize_source(0, &slot(handle, &pipe, 0, Operation::Start));
        assert_eq!(state(&h, 0), SlotState::StartedByExplicitOperation);
        assert_eq!(h.ctx.started_bitmap, 1);

        h.ctx.initialize_source(0, &slot(handle, &pipe, 0, Operation::Stop));
        assert_eq!(state(&h, 0), SlotState::StoppedByExplicitOperation);
        assert_eq!(h.ctx.started_bitmap, 0);

        h.ctx.initialize_source(0, &slot(handle, &pipe, 0, Operation::Detach));
        assert_eq!(state(&h, 0), SlotState::Unused);
        assert_eq!(h.ctx.detach_requested_bitmap, 1);
    }

    #[test]
    fn test_mix_phase_carries_over_on_same_pipe() {
        let mut h = harness();
        let handle = SourceClientHandle::new(0, 0, 1);
        let pipe = AudioSourceDataPipe::new(BLOCK, 4).unwrap();

        let mut fade_in = slot(handle, &pipe, 0, Operation::Start);
        fade_in.mix_mode = MixMode::ShortFadeIn;
        fade_in.mix_phase = 0.25;
        fade_in.mix_phase_override = true;
        let _in = attach(&mut h, 0, &pipe, fade_in);
        assert_eq!(h.ctx.contexts[0].phase, 0.25);

        let mut fade_out = slot(handle, &pipe, 0, Operation::None);
        fade_out.mix_mode = MixMode::ShortFadeOut;
        h.ctx.initialize_source(0, &fade_out);
        assert!((h.ctx.contexts[0].phase - 0.75).abs() < 1e-6);
        assert_eq!(h.ctx.contexts[0].mode, MixMode::ShortFadeOut);
    }

    #[test]
    fn test_end_of_data_triggers_next_source() {
        let mut h = harness();
        let handle = SourceClientHandle::new(0, 0, 1);
        let pipe1 = AudioSourceDataPipe::new(BLOCK, 4).unwrap();
        let pipe2 = AudioSourceDataPipe::new(BLOCK, 4).unwrap();

        let mut first = slot(handle, &pipe1, 1, Operation::Start);
        first.stop_cond = STOP_ON_PLAYBACK_END;
        first.trigger_no_loop = Trigger::on_end_of_data(handle, 2);
        let mut in1 = attach(&mut h, 0, &pipe1, first);
        let _in2 = attach(&mut h, 1, &pipe2, slot(handle, &pipe2, 2, Operation::None));
        h.ctx.contexts[0].set_phase(0.5);

        assert!(!h.ctx.check_start_conditions());

        produce(&mut in1, BlockTag::EndOfData, 0.0);
        h.ctx.handle_non_audio_data_blocks();
        assert!(h.ctx.check_start_conditions());
        assert!(h.ctx.check_stop_conditions());

        assert_eq!(state(&h, 1), SlotState::StartedNoLoopTriggered);
        assert_eq!(state(&h, 0), SlotState::StoppedByDataEndTriggeredNoLoopingSource);
        assert_eq!(h.ctx.started_bitmap, 0b10);
        assert_eq!(h.ctx.contexts[1].phase, 0.5);
        assert_eq!(h.ctx.current.updated_bitmap, 0b11);

        // a trigger fires only once
        assert!(!h.ctx.check_start_conditions());
    }

    #[test]
    fn test_looping_source_uses_loop_trigger() {
        let mut h = harness();
        let handle = SourceClientHandle::new(0, 0, 1);
        let pipe1 = AudioSourceDataPipe::new(BLOCK, 4).unwrap();
        let pipe2 = AudioSourceDataPipe::new(BLOCK, 4).unwrap();

        let mut first = slot(handle, &pipe1, 1, Operation::Start);
        first.stop_cond = STOP_ON_PLAYBACK_END;
        first.trigger_no_loop = Trigger::on_end_of_data(handle, 3);
        first.trigger_loop = Trigger::on_end_of_data(handle, 2);
        let mut in1 = attach(&mut h, 0, &pipe1, first);
        let _in2 = attach(&mut h, 1, &pipe2, slot(handle, &pipe2, 2, Operation::None));

        h.ctx.looping_bitmap = 1 << handle.index();
        produce(&mut in1, BlockTag::EndOfData, 0.0);
        h.ctx.handle_non_audio_data_blocks();
        h.ctx.check_start_conditions();
        h.ctx.check_stop_conditions();

        assert_eq!(state(&h, 1), SlotState::StartedLoopTriggered);
        assert_eq!(state(&h, 0), SlotState::StoppedByDataEndTriggeredLoopingSource);
        assert_eq!(
            h.ctx.res.ports[0].as_ref().unwrap().last_block_tag(),
            BlockTag::EndOfDataWithLoopPoint
        );
    }

    #[test]
    fn test_end_of_data_without_trigger() {
        let mut h = harness();
        let handle = SourceClientHandle::new(0, 0, 1);
        let pipe = AudioSourceDataPipe::new(BLOCK, 4).unwrap();

        let mut only = slot(handle, &pipe, 0, Operation::Start);
        only.stop_cond = STOP_ON_PLAYBACK_END;
        let mut port = attach(&mut h, 0, &pipe, only);

        produce(&mut port, BlockTag::EndOfData, 0.0);
        h.ctx.handle_non_audio_data_blocks();
        assert!(h.ctx.check_stop_conditions());
        assert_eq!(state(&h, 0), SlotState::StoppedByDataEndNoTriggered);
    }

    #[test]
    fn test_stop_after_fade_out() {
        let mut h = harness();
        let handle = SourceClientHandle::new(0, 0, 1);
        let pipe = AudioSourceDataPipe::new(BLOCK, 4).unwrap();

        let mut fading = slot(handle, &pipe, 0, Operation::Start);
        fading.mix_mode = MixMode::ShortFadeOut;
        fading.stop_cond = STOP_AFTER_FADE_OUT;
        let _port = attach(&mut h, 0, &pipe, fading);

        assert!(!h.ctx.check_stop_conditions());

        // no data available: the fade is treated as finished
        assert!(h.ctx.handle_audio_data_blocks());
        assert_eq!(h.ctx.contexts[0].phase, 1.0);
        assert!(h.ctx.check_stop_conditions());
        assert_eq!(state(&h, 0), SlotState::StoppedByFadedOut);
    }

    #[test]
    fn test_audio_block_mixed_into_sink() {
        let mut h = harness();
        let handle = SourceClientHandle::new(0, 0, 1);
        let pipe = AudioSourceDataPipe::new(BLOCK, 4).unwrap();
        let mut port = attach(&mut h, 0, &pipe, slot(handle, &pipe, 0, Operation::Start));

        h.ctx.premix_level = 0.5;
        h.ctx.update_mix_volumes();
        produce(&mut port, BlockTag::AudioData, 0.5);

        assert!(h.ctx.handle_audio_data_blocks());
        let block = h.sink.lock_read(0).unwrap();
        assert!(block.data.iter().all(|&s| (s - 0.25).abs() < 1e-6));
        h.sink.unlock_read(block).unwrap();

        assert_eq!(port.recycle_all(), 1);

        // sink pipe holds two blocks
        assert!(h.ctx.handle_audio_data_blocks());
        assert!(h.ctx.handle_audio_data_blocks());
        assert!(!h.ctx.handle_audio_data_blocks());
    }

    #[test]
    fn test_snapshot_exchange_round_trip() {
        let mut h = harness();
        let handle = SourceClientHandle::new(0, 0, 1);
        let pipe = AudioSourceDataPipe::new(BLOCK, 4).unwrap();

        let mut item = SourceSetItem::new(ItemOwner::RequestThread);
        item.set.slots[2] = AudioSourceSlot::Occupied(slot(handle, &pipe, 0, Operation::Start));
        item.set.mark_updated(2);
        item.ports[2] = Some(pipe.acquire_out_port().unwrap());
        assert!(h.to_mixer.push(item).is_ok());

        assert!(h.ctx.update_one());
        assert!(!h.ctx.update_one());

        let ack = h.from_mixer.pop().unwrap();
        assert_eq!(ack.owner, ItemOwner::RequestThread);
        assert_eq!(ack.set.updated_bitmap, 1 << 2);
        assert_eq!(ack.set.slots[2].state(), SlotState::StartedByExplicitOperation);
        assert!(h.ctx.res.ports[2].is_some());

        // detach: the port travels back with the acknowledgement
        let mut item = ack;
        item.set.slots[2] = AudioSourceSlot::Occupied(slot(handle, &pipe, 0, Operation::Detach));
        item.set.updated_bitmap = 1 << 2;
        assert!(h.to_mixer.push(item).is_ok());
        assert!(h.ctx.update_one());

        let mut ack = h.from_mixer.pop().unwrap();
        assert_eq!(ack.set.slots[2].state(), SlotState::Unused);
        let port = ack.ports[2].take().unwrap();
        pipe.release_out_port(port).unwrap();
        assert_eq!(h.ctx.current.slots[2], AudioSourceSlot::Vacant);
        assert_eq!(h.ctx.attached_bitmap, 0);
    }

    #[test]
    fn test_notify_sends_mixer_owned_snapshot() {
        let mut h = harness();
        assert!(!h.ctx.notify());

        let handle = SourceClientHandle::new(0, 0, 1);
        let pipe = AudioSourceDataPipe::new(BLOCK, 4).unwrap();
        let _port = attach(&mut h, 0, &pipe, slot(handle, &pipe, 0, Operation::Start));
        h.ctx.current.mark_updated(0);

        assert!(h.ctx.notify());
        assert_eq!(h.ctx.current.updated_bitmap, 0);

        let mut item = h.from_mixer.pop().unwrap();
        assert_eq!(item.owner, ItemOwner::MixerThread);
        assert_eq!(item.set.slots[0].state(), SlotState::StartedByExplicitOperation);

        // returned through the request queue into the mixer free pool
        item.clear();
        assert!(h.to_mixer.push(item).is_ok());
        let free_before = h.ctx.res.queues.free_rx.len();
        assert!(h.ctx.update_one());
        assert_eq!(h.ctx.res.queues.free_rx.len(), free_before + 1);
    }
}
