//! Per-client stereo volume exchange

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Ring depth of the volume pipe
const VOLUME_PIPE_DEPTH: usize = 3;

/// Left/right linear gain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoVolume {
    pub left: f32,
    pub right: f32,
}

impl StereoVolume {
    pub const UNITY: StereoVolume = StereoVolume {
        left: 1.0,
        right: 1.0,
    };

    pub fn new(left: f32, right: f32) -> Self {
        Self { left, right }
    }
}

impl Default for StereoVolume {
    fn default() -> Self {
        Self::UNITY
    }
}

/// Create a volume pipe (writer held by the request thread, reader by the mixer thread)
pub fn stereo_volume_pipe() -> (VolumeWriter, VolumeReader) {
    let (prod, cons) = HeapRb::<StereoVolume>::new(VOLUME_PIPE_DEPTH).split();
    (VolumeWriter { prod }, VolumeReader { cons })
}

pub struct VolumeWriter {
    prod: HeapProd<StereoVolume>,
}

impl VolumeWriter {
    /// Publish a new volume. Returns `false` when the ring is full.
    pub fn write(&mut self, volume: StereoVolume) -> bool {
        self.prod.try_push(volume).is_ok()
    }

    pub fn is_full(&self) -> bool {
        self.prod.is_full()
    }
}

pub struct VolumeReader {
    cons: HeapCons<StereoVolume>,
}

impl VolumeReader {
    /// Drain the ring and return the most recent value, if any
    pub fn read_latest(&mut self) -> Option<StereoVolume> {
        let mut latest = None;
        while let Some(v) = self.cons.try_pop() {
            latest = Some(v);
        }
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_value_wins() {
        let (mut tx, mut rx) = stereo_volume_pipe();
        assert!(rx.read_latest().is_none());

        assert!(tx.write(StereoVolume::new(0.1, 0.2)));
        assert!(tx.write(StereoVolume::new(0.3, 0.4)));
        assert_eq!(rx.read_latest(), Some(StereoVolume::new(0.3, 0.4)));
        assert!(rx.read_latest().is_none());
    }

    #[test]
    fn test_full_ring_rejects() {
        let (mut tx, _rx) = stereo_volume_pipe();
        for _ in 0..VOLUME_PIPE_DEPTH {
            assert!(tx.write(StereoVolume::UNITY));
        }
        assert!(tx.is_full());
        assert!(!tx.write(StereoVolume::UNITY));
    }
}
