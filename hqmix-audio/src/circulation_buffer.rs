//! Lock-free single-producer/single-consumer circulation buffer
//!
//! Fixed capacity ring used to hand pooled items between exactly two
//! threads. One side owns the [`Writer`], the other owns the [`Reader`];
//! neither side ever blocks. A slot is reserved with `lock_write` /
//! `lock_read`, accessed through the returned guard, and released with
//! `unlock_write` / `unlock_read`. Dropping a guard without unlocking
//! aborts the reservation and leaves the ring untouched.
//!
//! A [`Monitor`] can observe the fill level from any thread.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Shared<T> {
    // capacity + 1 cells, one always stays empty to tell full from empty
    cells: Box<[UnsafeCell<Option<T>>]>,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
}

// SAFETY: a cell is only touched by the side that currently owns it.
// Cells in [read_pos, write_pos) belong to the reader, all others to the
// writer. Ownership moves with the Release/Acquire position updates.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    #[inline]
    fn num_cells(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    fn advance(&self, pos: usize) -> usize {
        let next = pos + 1;
        if next == self.num_cells() {
            0
        } else {
            next
        }
    }

    #[inline]
    fn distance(&self, from: usize, to: usize) -> usize {
        if to >= from {
            to - from
        } else {
            to + self.num_cells() - from
        }
    }

    fn len(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        self.distance(r, w)
    }

    fn capacity(&self) -> usize {
        self.num_cells() - 1
    }
}

/// Create a circulation buffer holding up to `capacity` items.
pub fn circulation_buffer<T: Send>(capacity: usize) -> (Writer<T>, Reader<T>) {
    let cells = (0..capacity + 1)
        .map(|_| UnsafeCell::new(None))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let shared = Arc::new(Shared {
        cells,
        read_pos: AtomicUsize::new(0),
        write_pos: AtomicUsize::new(0),
    });

    (
        Writer {
            shared: Arc::clone(&shared),
        },
        Reader { shared },
    )
}

/// Producer side of a circulation buffer
pub struct Writer<T> {
    shared: Arc<Shared<T>>,
}

/// Consumer side of a circulation buffer
pub struct Reader<T> {
    shared: Arc<Shared<T>>,
}

/// Read-only view of the fill level, usable from any thread
pub struct Monitor<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Monitor<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

macro_rules! fill_level_accessors {
    ($ty:ident) => {
        impl<T> $ty<T> {
            /// Number of published items not yet consumed
            pub fn len(&self) -> usize {
                self.shared.len()
            }

            pub fn is_empty(&self) -> bool {
                self.shared.len() == 0
            }

            pub fn is_full(&self) -> bool {
                self.shared.len() == self.shared.capacity()
            }

            pub fn capacity(&self) -> usize {
                self.shared.capacity()
            }
        }
    };
}

fill_level_accessors!(Writer);
fill_level_accessors!(Reader);
fill_level_accessors!(Monitor);

impl<T> Writer<T> {
    /// Reserve the next free cell.
    ///
    /// Fails unless at least `1 + min_remains` cells are vacant.
    pub fn lock_write(&mut self, min_remains: usize) -> Option<WriteLock<'_, T>> {
        let w = self.shared.write_pos.load(Ordering::Relaxed);
        let r = self.shared.read_pos.load(Ordering::Acquire);
        let vacant = self.shared.capacity() - self.shared.distance(r, w);

        if vacant < 1 + min_remains {
            return None;
        }

        Some(WriteLock { writer: self, pos: w })
    }

    /// Publish a value, handing it back if the buffer is full
    pub fn push(&mut self, value: T) -> Result<(), T> {
        match self.lock_write(0) {
            Some(mut lock) => {
                *lock = Some(value);
                lock.unlock_write();
                Ok(())
            }
            None => Err(value),
        }
    }

    pub fn monitor(&self) -> Monitor<T> {
        Monitor {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Reader<T> {
    /// Reserve the oldest published cell.
    ///
    /// Fails unless at least `1 + min_remains` cells are filled.
    pub fn lock_read(&mut self, min_remains: usize) -> Option<ReadLock<'_, T>> {
        let r = self.shared.read_pos.load(Ordering::Relaxed);
        let w = self.shared.write_pos.load(Ordering::Acquire);
        let filled = self.shared.distance(r, w);

        if filled < 1 + min_remains {
            return None;
        }

        Some(ReadLock { reader: self, pos: r })
    }

    /// Take the oldest value
    pub fn pop(&mut self) -> Option<T> {
        let mut lock = self.lock_read(0)?;
        let value = lock.take();
        lock.unlock_read(true);
        value
    }

    /// Discard everything currently published
    pub fn clear(&mut self) {
        while self.lock_read(0).map(|lock| lock.unlock_read(true)).is_some() {}
    }

    pub fn monitor(&self) -> Monitor<T> {
        Monitor {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// A reserved write cell. Dropping it without [`WriteLock::unlock_write`]
/// leaves the cell unpublished.
pub struct WriteLock<'a, T> {
    writer: &'a mut Writer<T>,
    pos: usize,
}

impl<T> WriteLock<'_, T> {
    /// Publish the cell to the reader
    pub fn unlock_write(self) {
        let shared = &self.writer.shared;
        shared.write_pos.store(shared.advance(self.pos), Ordering::Release);
    }
}

impl<T> Deref for WriteLock<'_, T> {
    type Target = Option<T>;

    fn deref(&self) -> &Option<T> {
        // SAFETY: the cell at `pos` is outside [read_pos, write_pos) and the
        // writer is exclusively borrowed for the lifetime of the guard.
        unsafe { &*self.writer.shared.cells[self.pos].get() }
    }
}

impl<T> DerefMut for WriteLock<'_, T> {
    fn deref_mut(&mut self) -> &mut Option<T> {
        // SAFETY: see `deref`
        unsafe { &mut *self.writer.shared.cells[self.pos].get() }
    }
}

/// A reserved read cell. Dropping it is the same as
/// `unlock_read(false)`.
pub struct ReadLock<'a, T> {
    reader: &'a mut Reader<T>,
    pos: usize,
}

impl<T> ReadLock<'_, T> {
    /// Release the cell. With `commit == false` the read is aborted and the
    /// same cell is returned by the next `lock_read`.
    pub fn unlock_read(self, commit: bool) {
        if commit {
            let shared = &self.reader.shared;
            shared.read_pos.store(shared.advance(self.pos), Ordering::Release);
        }
    }
}

impl<T> Deref for ReadLock<'_, T> {
    type Target = Option<T>;

    fn deref(&self) -> &Option<T> {
        // SAFETY: the cell at `pos` is inside [read_pos, write_pos), which the
        // writer does not touch until read_pos moves past it.
        unsafe { &*self.reader.shared.cells[self.pos].get() }
    }
}

impl<T> DerefMut for ReadLock<'_, T> {
    fn deref_mut(&mut self) -> &mut Option<T> {
        // SAFETY: see `deref`
        unsafe { &mut *self.reader.shared.cells[self.pos].get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let (mut tx, mut rx) = circulation_buffer::<u32>(4);
        for i in 0..4 {
            assert!(tx.push(i).is_ok());
        }
        for i in 0..4 {
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_full_and_empty_fail() {
        let (mut tx, mut rx) = circulation_buffer::<u32>(2);
        assert!(rx.lock_read(0).is_none());
        assert!(tx.push(1).is_ok());
        assert!(tx.push(2).is_ok());
        assert!(tx.is_full());
        assert_eq!(tx.push(3), Err(3));
        assert!(tx.lock_write(0).is_none());

        assert_eq!(rx.pop(), Some(1));
        assert!(tx.push(3).is_ok());
        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), Some(3));
        assert!(rx.is_empty());
    }

    #[test]
    fn test_min_remains() {
        let (mut tx, mut rx) = circulation_buffer::<u32>(4);
        assert!(tx.push(1).is_ok());
        assert!(tx.push(2).is_ok());
        // 2 vacant cells
        assert!(tx.lock_write(2).is_none());
        assert!(tx.lock_write(1).is_some());
        // 2 filled cells
        assert!(rx.lock_read(2).is_none());
        assert!(rx.lock_read(1).is_some());
    }

    #[test]
    fn test_aborted_read_does_not_consume() {
        let (mut tx, mut rx) = circulation_buffer::<u32>(4);
        assert!(tx.push(7).is_ok());

        let lock = rx.lock_read(0).expect("filled");
        assert_eq!(*lock, Some(7));
        lock.unlock_read(false);

        assert_eq!(rx.len(), 1);
        assert_eq!(rx.pop(), Some(7));
    }

    #[test]
    fn test_dropped_write_lock_is_not_published() {
        let (mut tx, mut rx) = circulation_buffer::<u32>(4);
        {
            let mut lock = tx.lock_write(0).expect("vacant");
            *lock = Some(1);
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn test_wraparound() {
        let (mut tx, mut rx) = circulation_buffer::<usize>(3);
        for i in 0..100 {
            assert!(tx.push(i).is_ok());
            assert!(tx.push(i + 1000).is_ok());
            assert_eq!(rx.pop(), Some(i));
            assert_eq!(rx.pop(), Some(i + 1000));
        }
        assert_eq!(tx.monitor().len(), 0);
    }

    #[test]
    fn test_clear() {
        let (mut tx, mut rx) = circulation_buffer::<u32>(4);
        assert!(tx.push(1).is_ok());
        assert!(tx.push(2).is_ok());
        rx.clear();
        assert!(rx.is_empty());
        assert!(tx.push(3).is_ok());
        assert_eq!(rx.pop(), Some(3));
    }

    #[test]
    fn test_spsc_threads_preserve_order() {
        const COUNT: u32 = 20_000;
        let (mut tx, mut rx) = circulation_buffer::<Box<u32>>(8);

        let producer = thread::spawn(move || {
            let mut next = 0;
            while next < COUNT {
                match tx.push(Box::new(next)) {
                    Ok(()) => next += 1,
                    Err(_) => thread::yield_now(),
                }
            }
        });

        let mut expected = 0;
        while expected < COUNT {
            match rx.pop() {
                Some(v) => {
                    assert_eq!(*v, expected);
                    expected += 1;
                }
                None => thread::yield_now(),
            }
        }

        producer.join().expect("producer thread");
    }
}
