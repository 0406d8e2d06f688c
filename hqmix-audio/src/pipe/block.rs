//! Block pipe used for the sink (mixer → player) and capture (mixer → visualizer)

use std::time::Instant;

use super::NUM_CHANNELS;
use crate::circulation_buffer::{circulation_buffer, Reader, Writer};
use crate::error::{MixerError, Result};

/// One interleaved stereo block
#[derive(Debug)]
pub struct PipeBlock<S> {
    pub data: Box<[S]>,
    /// Set by the mixer on capture blocks
    pub timestamp: Option<Instant>,
}

/// Create a pipe of `num_items` blocks, `block_size` frames each
pub fn block_pipe<S: Copy + Default + Send>(
    block_size: usize,
    num_items: usize,
) -> Result<(BlockWriter<S>, BlockReader<S>)> {
    if block_size == 0 || num_items == 0 {
        return Err(MixerError::IllegalArgument);
    }

    let (mut free_tx, free_rx) = circulation_buffer(num_items);
    let (filled_tx, filled_rx) = circulation_buffer(num_items);

    for _ in 0..num_items {
        let block = Box::new(PipeBlock {
            data: vec![S::default(); block_size * NUM_CHANNELS].into_boxed_slice(),
            timestamp: None,
        });
        if free_tx.push(block).is_err() {
            return Err(MixerError::InternalError);
        }
    }

    Ok((
        BlockWriter {
            block_size,
            num_items,
            free: free_rx,
            filled: filled_tx,
        },
        BlockReader {
            block_size,
            num_items,
            filled: filled_rx,
            free: free_tx,
        },
    ))
}

/// Producer side (the mixer)
pub struct BlockWriter<S> {
    block_size: usize,
    num_items: usize,
    free: Reader<Box<PipeBlock<S>>>,
    filled: Writer<Box<PipeBlock<S>>>,
}

impl<S> BlockWriter<S> {
    /// Get an empty block, keeping at least `min_remains` spare blocks
    pub fn lock_write(&mut self, min_remains: usize) -> Option<Box<PipeBlock<S>>> {
        let mut lock = self.free.lock_read(min_remains)?;
        let block = lock.take();
        lock.unlock_read(true);
        block
    }

    /// Publish a filled block
    pub fn unlock_write(&mut self, block: Box<PipeBlock<S>>) -> Result<()> {
        self.filled.push(block).map_err(|_| MixerError::InternalError)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }
}

/// Consumer side (platform player or visualizer)
pub struct BlockReader<S> {
    block_size: usize,
    num_items: usize,
    filled: Reader<Box<PipeBlock<S>>>,
    free: Writer<Box<PipeBlock<S>>>,
}

impl<S> BlockReader<S> {
    /// Get the oldest filled block, requiring `min_remains` more behind it
    pub fn lock_read(&mut self, min_remains: usize) -> Option<Box<PipeBlock<S>>> {
        let mut lock = self.filled.lock_read(min_remains)?;
        let block = lock.take();
        lock.unlock_read(true);
        block
    }

    /// Return a played block to the free pool
    pub fn unlock_read(&mut self, mut block: Box<PipeBlock<S>>) -> Result<()> {
        block.timestamp = None;
        self.free.push(block).map_err(|_| MixerError::InternalError)
    }

    /// Number of filled blocks waiting to be read
    pub fn available(&self) -> usize {
        self.filled.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_geometry() {
        assert!(block_pipe::<f32>(0, 4).is_err());
        assert!(block_pipe::<f32>(4, 0).is_err());
    }

    #[test]
    fn test_write_then_read() {
        let (mut tx, mut rx) = block_pipe::<i16>(4, 2).unwrap();
        assert!(rx.lock_read(0).is_none());

        let mut block = tx.lock_write(0).unwrap();
        assert_eq!(block.data.len(), 8);
        block.data.fill(42);
        tx.unlock_write(block).unwrap();

        assert_eq!(rx.available(), 1);
        let block = rx.lock_read(0).unwrap();
        assert!(block.data.iter().all(|&s| s == 42));
        rx.unlock_read(block).unwrap();
    }

    #[test]
    fn test_writer_runs_dry() {
        let (mut tx, mut rx) = block_pipe::<f32>(4, 2).unwrap();
        let a = tx.lock_write(0).unwrap();
        assert!(tx.lock_write(1).is_none());
        let b = tx.lock_write(0).unwrap();
        assert!(tx.lock_write(0).is_none());
        tx.unlock_write(a).unwrap();
        tx.unlock_write(b).unwrap();

        let a = rx.lock_read(0).unwrap();
        rx.unlock_read(a).unwrap();
        assert!(tx.lock_write(0).is_some());
    }
}
