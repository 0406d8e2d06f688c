//! Source data pipe: decoded PCM blocks flowing from a decoder to the mixer
//!
//! Blocks circulate free → ready → used → free. The decoder holds the
//! [`SourceInPort`] (produce and recycle), the mixer holds the
//! [`SourceOutPort`] (consume). Each port has a single user at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use super::NUM_CHANNELS;
use crate::circulation_buffer::{circulation_buffer, Reader, Writer};
use crate::error::{MixerError, Result};

/// Kind of payload carried by a [`SourceBlock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum BlockTag {
    #[default]
    None = 0,
    AudioData = 1,
    EndOfData = 2,
    EndOfDataWithLoopPoint = 3,
}

impl BlockTag {
    /// Bit of this tag inside a tag filter mask
    #[inline]
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn is_end_of_data(self) -> bool {
        matches!(self, BlockTag::EndOfData | BlockTag::EndOfDataWithLoopPoint)
    }
}

pub const TAG_FILTER_ALL: u32 = !0;
pub const TAG_FILTER_AUDIO_DATA: u32 = BlockTag::AudioData.bit();
pub const TAG_FILTER_NON_AUDIO_DATA: u32 = !TAG_FILTER_AUDIO_DATA;

/// One block of interleaved stereo f32 samples
#[derive(Debug)]
pub struct SourceBlock {
    pub data: Box<[f32]>,
    pub tag: BlockTag,
    /// Playback position of the first frame
    pub position_msec: i64,
}

impl SourceBlock {
    fn new(block_size: usize) -> Self {
        Self {
            data: vec![0.0; block_size * NUM_CHANNELS].into_boxed_slice(),
            tag: BlockTag::None,
            position_msec: 0,
        }
    }
}

/// Process-unique identity of a source pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourcePipeId(u64);

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

/// A pool of blocks shared by one decoder and the mixer
pub struct AudioSourceDataPipe {
    id: SourcePipeId,
    block_size: usize,
    num_items: usize,
    in_port: Mutex<Option<SourceInPort>>,
    out_port: Mutex<Option<SourceOutPort>>,
}

impl AudioSourceDataPipe {
    /// Allocate a pipe of `num_items` blocks, `block_size` frames each
    pub fn new(block_size: usize, num_items: usize) -> Result<Arc<Self>> {
        if block_size == 0 || num_items == 0 {
            return Err(MixerError::IllegalArgument);
        }

        let id = SourcePipeId(NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed));
        let (ready_tx, ready_rx) = circulation_buffer(num_items);
        let (used_tx, used_rx) = circulation_buffer(num_items);
        let free = (0..num_items)
            .map(|_| Box::new(SourceBlock::new(block_size)))
            .collect();

        let in_port = SourceInPort {
            pipe_id: id,
            free,
            ready: ready_tx,
            used: used_rx,
        };
        let out_port = SourceOutPort {
            pipe_id: id,
            ready: ready_rx,
            used: used_tx,
            last_tag: BlockTag::None,
        };

        Ok(Arc::new(Self {
            id,
            block_size,
            num_items,
            in_port: Mutex::new(Some(in_port)),
            out_port: Mutex::new(Some(out_port)),
        }))
    }

    pub fn id(&self) -> SourcePipeId {
        self.id
    }

    /// Frames per block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Take the producer port. Fails with `IllegalState` if it is in use.
    pub fn acquire_in_port(&self) -> Result<SourceInPort> {
        self.in_port.lock().take().ok_or(MixerError::IllegalState)
    }

    pub fn release_in_port(&self, port: SourceInPort) -> Result<()> {
        if port.pipe_id != self.id {
            return Err(MixerError::IllegalArgument);
        }
        *self.in_port.lock() = Some(port);
        Ok(())
    }

    /// Take the consumer port. Fails with `IllegalState` if it is in use.
    pub fn acquire_out_port(&self) -> Result<SourceOutPort> {
        self.out_port.lock().take().ok_or(MixerError::IllegalState)
    }

    pub fn release_out_port(&self, port: SourceOutPort) -> Result<()> {
        if port.pipe_id != self.id {
            return Err(MixerError::IllegalArgument);
        }
        *self.out_port.lock() = Some(port);
        Ok(())
    }
}

impl std::fmt::Debug for AudioSourceDataPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSourceDataPipe")
            .field("id", &self.id)
            .field("block_size", &self.block_size)
            .field("num_items", &self.num_items)
            .finish()
    }
}

/// Decoder side of a source pipe
pub struct SourceInPort {
    pipe_id: SourcePipeId,
    free: Vec<Box<SourceBlock>>,
    ready: Writer<Box<SourceBlock>>,
    used: Reader<Box<SourceBlock>>,
}

impl SourceInPort {
    pub fn pipe_id(&self) -> SourcePipeId {
        self.pipe_id
    }

    /// Get an empty block to fill
    pub fn lock_produce(&mut self) -> Option<Box<SourceBlock>> {
        self.free.pop()
    }

    /// Hand a filled block to the mixer
    pub fn unlock_produce(&mut self, block: Box<SourceBlock>) {
        if let Err(block) = self.ready.push(block) {
            error!(pipe = ?self.pipe_id, "source ready queue overflow");
            self.free.push(block);
        }
    }

    /// Get a block the mixer has finished with
    pub fn lock_recycle(&mut self) -> Option<Box<SourceBlock>> {
        self.used.pop()
    }

    /// Return a recycled block to the free pool
    pub fn unlock_recycle(&mut self, mut block: Box<SourceBlock>) {
        block.tag = BlockTag::None;
        self.free.push(block);
    }

    /// Recycle every consumed block at once
    pub fn recycle_all(&mut self) -> usize {
        let mut count = 0;
        while let Some(block) = self.lock_recycle() {
            self.unlock_recycle(block);
            count += 1;
        }
        count
    }

    /// Number of blocks waiting for the mixer
    pub fn pending(&self) -> usize {
        self.ready.len()
    }
}

/// Mixer side of a source pipe
pub struct SourceOutPort {
    pipe_id: SourcePipeId,
    ready: Reader<Box<SourceBlock>>,
    used: Writer<Box<SourceBlock>>,
    last_tag: BlockTag,
}

impl SourceOutPort {
    pub fn pipe_id(&self) -> SourcePipeId {
        self.pipe_id
    }

    /// Take the head block if its tag passes `tag_filter`.
    ///
    /// A block whose tag is filtered out stays at the head of the queue.
    pub fn lock_consume(&mut self, min_remains: usize, tag_filter: u32) -> Option<Box<SourceBlock>> {
        let mut lock = self.ready.lock_read(min_remains)?;

        let accepted = lock
            .as_ref()
            .is_some_and(|block| tag_filter & block.tag.bit() != 0);
        if !accepted {
            lock.unlock_read(false);
            return None;
        }

        let block = lock.take();
        lock.unlock_read(true);
        block
    }

    /// Finish with a consumed block; its (possibly rewritten) tag becomes
    /// the last block tag.
    pub fn unlock_consume(&mut self, block: Box<SourceBlock>) {
        self.last_tag = block.tag;
        if self.used.push(block).is_err() {
            error!(pipe = ?self.pipe_id, "source used queue overflow");
        }
    }

    pub fn last_block_tag(&self) -> BlockTag {
        self.last_tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn produce(port: &mut SourceInPort, tag: BlockTag, value: f32) {
        let mut block = port.lock_produce().expect("free block");
        block.tag = tag;
        block.data.fill(value);
        port.unlock_produce(block);
    }

    #[test]
    fn test_ports_have_single_user() {
        let pipe = AudioSourceDataPipe::new(4, 2).unwrap();
        let port = pipe.acquire_out_port().unwrap();
        assert_eq!(pipe.acquire_out_port().err(), Some(MixerError::IllegalState));
        pipe.release_out_port(port).unwrap();
        assert!(pipe.acquire_out_port().is_ok());
    }

    #[test]
    fn test_foreign_port_rejected() {
        let a = AudioSourceDataPipe::new(4, 2).unwrap();
        let b = AudioSourceDataPipe::new(4, 2).unwrap();
        let port = a.acquire_in_port().unwrap();
        assert!(b.release_in_port(port).is_err());
    }

    #[test]
    fn test_tag_filter_keeps_event_at_head() {
        let pipe = AudioSourceDataPipe::new(4, 4).unwrap();
        let mut tx = pipe.acquire_in_port().unwrap();
        let mut rx = pipe.acquire_out_port().unwrap();

        produce(&mut tx, BlockTag::EndOfData, 0.0);
        produce(&mut tx, BlockTag::AudioData, 0.5);

        assert!(rx.lock_consume(0, TAG_FILTER_AUDIO_DATA).is_none());
        let block = rx.lock_consume(0, TAG_FILTER_NON_AUDIO_DATA).unwrap();
        assert_eq!(block.tag, BlockTag::EndOfData);
        rx.unlock_consume(block);
        assert_eq!(rx.last_block_tag(), BlockTag::EndOfData);

        let block = rx.lock_consume(0, TAG_FILTER_AUDIO_DATA).unwrap();
        assert!(block.data.iter().all(|&s| s == 0.5));
        rx.unlock_consume(block);
    }

    #[test]
    fn test_blocks_circulate() {
        let pipe = AudioSourceDataPipe::new(2, 2).unwrap();
        let mut tx = pipe.acquire_in_port().unwrap();
        let mut rx = pipe.acquire_out_port().unwrap();

        for round in 0..5 {
            produce(&mut tx, BlockTag::AudioData, round as f32);
            produce(&mut tx, BlockTag::AudioData, round as f32);
            assert!(tx.lock_produce().is_none());
            assert_eq!(tx.pending(), 2);

            while let Some(block) = rx.lock_consume(0, TAG_FILTER_ALL) {
                rx.unlock_consume(block);
            }
            assert_eq!(tx.recycle_all(), 2);
        }
    }
}
