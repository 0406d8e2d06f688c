//! Ten band graphic equalizer applied to the mixed output
//!
//! [`HQEqualizer`] is the control half. It keeps the authoritative band
//! levels and ships snapshots of them to the render half through three
//! circulation buffers:
//!
//! ```text
//!   free --apply()--> request --poll_from_mixer_thread()--> used --poll()--> free
//! ```
//!
//! [`HQEqualizerProcessor`] is the render half. It glides each band toward
//! its requested gain in bounded steps so level changes never click.

mod biquad;
mod calculator;
pub mod presets;
mod processor;
pub mod service;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::circulation_buffer::{circulation_buffer, Reader, Writer};
use crate::effects::MixedOutputAudioEffect;
use crate::error::{MixerError, Result};

pub use processor::HQEqualizerProcessor;
pub use service::{EqualizerControl, EqualizerProperties, EqualizerService};

pub const NUM_BANDS: usize = 10;

/// Band or preset number meaning "none"
pub const UNDEFINED: u16 = 0xFFFF;

pub const MIN_BAND_LEVEL_MILLIBEL: i16 = -15 * 100;
pub const MAX_BAND_LEVEL_MILLIBEL: i16 = 15 * 100;

const REQUEST_QUEUE_SIZE: usize = 3;

pub(crate) const ENABLED_UPDATED_BIT: u32 = 1 << 31;
pub(crate) const ALL_BANDS_MASK: u32 = (1 << NUM_BANDS) - 1;

/// Band edges and center, in millihertz
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandInfo {
    pub min_freq: u32,
    pub center_freq: u32,
    pub max_freq: u32,
}

const fn band(min_freq: u32, center_freq: u32, max_freq: u32) -> BandInfo {
    BandInfo {
        min_freq,
        center_freq,
        max_freq,
    }
}

/// One octave per band, 31.25 Hz to 16 kHz
pub(crate) const BAND_INFO: [BandInfo; NUM_BANDS] = [
    band(22_097, 31_250, 44_193),
    band(44_194, 62_500, 88_387),
    band(88_388, 125_000, 176_775),
    band(176_776, 250_000, 353_552),
    band(353_553, 500_000, 707_105),
    band(707_106, 1_000_000, 1_414_212),
    band(1_414_213, 2_000_000, 2_828_426),
    band(2_828_427, 4_000_000, 5_656_853),
    band(5_656_854, 8_000_000, 11_313_707),
    band(11_313_708, 16_000_000, 22_627_415),
];

/// Filter topology used by the render half
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EqualizerMode {
    /// One peaking section per band with a neighbour correction
    Peaking,
    /// A pair of shelves per band, flatter response at twice the cost
    #[default]
    FlatGain,
}

impl EqualizerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EqualizerMode::Peaking => "peaking",
            EqualizerMode::FlatGain => "flat_gain",
        }
    }
}

impl fmt::Display for EqualizerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EqualizerMode {
    type Err = MixerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "peaking" => Ok(EqualizerMode::Peaking),
            "flat_gain" => Ok(EqualizerMode::FlatGain),
            _ => Err(MixerError::IllegalArgument),
        }
    }
}

/// Snapshot of the control state carried through the request queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct EqualizerRequest {
    pub enabled: bool,
    pub band_level: [i16; NUM_BANDS],
    /// Bits 0..NUM_BANDS: band changed. [`ENABLED_UPDATED_BIT`]: enabled changed.
    pub updated_bitmap: u32,
}

pub(crate) type RequestItem = Box<EqualizerRequest>;

/// Move the oldest item of `src` into `dest`, optionally reading it out
/// before or overwriting it on the way.
///
/// Returns false when `src` is empty.
pub(crate) fn move_request_item(
    src: &mut Reader<RequestItem>,
    dest: &mut Writer<RequestItem>,
    set_value: Option<&EqualizerRequest>,
    get_value: Option<&mut EqualizerRequest>,
) -> bool {
    let Some(mut src_lock) = src.lock_read(0) else {
        return false;
    };

    let Some(mut dest_lock) = dest.lock_write(0) else {
        // queues are sized for the whole pool
        error!("equalizer request queue overflow");
        return false;
    };

    let Some(mut item) = src_lock.take() else {
        error!("empty equalizer request cell");
        src_lock.unlock_read(true);
        return true;
    };

    if let Some(get_value) = get_value {
        *get_value = *item;
    }
    if let Some(set_value) = set_value {
        *item = *set_value;
    }

    *dest_lock = Some(item);
    dest_lock.unlock_write();
    src_lock.unlock_read(true);
    true
}

fn millibel_to_decibel(mb: i16) -> f64 {
    0.01 * f64::from(mb)
}

fn check_band(band: u16) -> Result<usize> {
    let band = usize::from(band);
    if band < NUM_BANDS {
        Ok(band)
    } else {
        Err(MixerError::IllegalArgument)
    }
}

/// Control half of the equalizer
pub struct HQEqualizer {
    // authoritative state, also read by the render half when it attaches
    request: Arc<Mutex<EqualizerRequest>>,
    free_tx: Writer<RequestItem>,
    free_rx: Reader<RequestItem>,
    request_tx: Writer<RequestItem>,
    used_rx: Reader<RequestItem>,
}

impl HQEqualizer {
    /// Create both halves. The render half goes to the mixer.
    pub fn new(
        sampling_rate: u32,
        block_size: usize,
        mode: EqualizerMode,
    ) -> Result<(Self, HQEqualizerProcessor)> {
        if sampling_rate == 0 || block_size == 0 {
            return Err(MixerError::IllegalArgument);
        }

        let (mut free_tx, free_rx) = circulation_buffer(REQUEST_QUEUE_SIZE);
        let (request_tx, request_rx) = circulation_buffer(REQUEST_QUEUE_SIZE);
        let (used_tx, used_rx) = circulation_buffer(REQUEST_QUEUE_SIZE);

        for _ in 0..REQUEST_QUEUE_SIZE {
            if free_tx.push(Box::default()).is_err() {
                return Err(MixerError::InternalError);
            }
        }

        let request = Arc::new(Mutex::new(EqualizerRequest::default()));

        debug!(sampling_rate, block_size, %mode, "equalizer created");

        let processor = HQEqualizerProcessor::new(
            sampling_rate,
            block_size,
            mode,
            Arc::clone(&request),
            request_rx,
            used_tx,
        );

        Ok((
            Self {
                request,
                free_tx,
                free_rx,
                request_tx,
                used_rx,
            },
            processor,
        ))
    }

    pub fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        {
            let mut request = self.request.lock();
            if request.enabled == enabled {
                return Ok(());
            }
            request.enabled = enabled;
            request.updated_bitmap |= ENABLED_UPDATED_BIT;
        }
        self.apply();
        Ok(())
    }

    pub fn enabled(&self) -> bool {
        self.request.lock().enabled
    }

    /// Band whose range contains `frequency` (mHz), or [`UNDEFINED`]
    pub fn band_for_frequency(&self, frequency: u32) -> u16 {
        BAND_INFO
            .iter()
            .position(|b| frequency >= b.min_freq && frequency <= b.max_freq)
            .map_or(UNDEFINED, |band| band as u16)
    }

    /// Set one band, clamped to the supported range
    pub fn set_band_level(&mut self, band: u16, level: i16) -> Result<()> {
        let band = check_band(band)?;
        let level = level.clamp(MIN_BAND_LEVEL_MILLIBEL, MAX_BAND_LEVEL_MILLIBEL);
        {
            let mut request = self.request.lock();
            if request.band_level[band] == level {
                return Ok(());
            }
            request.band_level[band] = level;
            request.updated_bitmap |= 1 << band;
        }
        self.apply();
        Ok(())
    }

    pub fn band_level(&self, band: u16) -> Result<i16> {
        let band = check_band(band)?;
        Ok(self.request.lock().band_level[band])
    }

    /// Band edges in millihertz
    pub fn band_freq_range(&self, band: u16) -> Result<(u32, u32)> {
        let info = &BAND_INFO[check_band(band)?];
        Ok((info.min_freq, info.max_freq))
    }

    pub fn band_level_range(&self) -> (i16, i16) {
        (MIN_BAND_LEVEL_MILLIBEL, MAX_BAND_LEVEL_MILLIBEL)
    }

    /// Center frequency in millihertz
    pub fn center_freq(&self, band: u16) -> Result<u32> {
        Ok(BAND_INFO[check_band(band)?].center_freq)
    }

    pub fn number_of_bands(&self) -> u16 {
        NUM_BANDS as u16
    }

    pub fn set_all_band_level(&mut self, levels: &[i16]) -> Result<()> {
        if levels.len() != NUM_BANDS {
            return Err(MixerError::IllegalArgument);
        }
        {
            let mut request = self.request.lock();
            for (band, &level) in levels.iter().enumerate() {
                let level = level.clamp(MIN_BAND_LEVEL_MILLIBEL, MAX_BAND_LEVEL_MILLIBEL);
                if request.band_level[band] != level {
                    request.band_level[band] = level;
                    request.updated_bitmap |= 1 << band;
                }
            }
        }
        self.apply();
        Ok(())
    }

    pub fn all_band_level(&self) -> [i16; NUM_BANDS] {
        self.request.lock().band_level
    }

    fn recycle_request_items(&mut self) {
        while move_request_item(&mut self.used_rx, &mut self.free_tx, None, None) {}
    }

    /// Push the pending snapshot if a pooled item is free
    fn apply(&mut self) {
        let mut request = self.request.lock();
        if request.updated_bitmap == 0 {
            return;
        }
        if move_request_item(&mut self.free_rx, &mut self.request_tx, Some(&*request), None) {
            request.updated_bitmap = 0;
        }
    }
}

impl MixedOutputAudioEffect for HQEqualizer {
    fn is_polling_required(&self) -> bool {
        self.request.lock().updated_bitmap != 0 || !self.free_rx.is_full()
    }

    fn poll(&mut self) -> Result<()> {
        self.recycle_request_items();
        self.apply();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::MixedOutputAudioEffectProcessor;

    const BLOCK: usize = 512;

    fn create(mode: EqualizerMode) -> (HQEqualizer, HQEqualizerProcessor) {
        HQEqualizer::new(48000, BLOCK, mode).unwrap()
    }

    #[test]
    fn test_rejects_invalid_setup() {
        assert_eq!(
            HQEqualizer::new(0, BLOCK, EqualizerMode::Peaking).err(),
            Some(MixerError::IllegalArgument)
        );
        assert_eq!(
            HQEqualizer::new(48000, 0, EqualizerMode::FlatGain).err(),
            Some(MixerError::IllegalArgument)
        );
    }

    #[test]
    fn test_band_queries() {
        let (eq, _) = create(EqualizerMode::FlatGain);
        assert_eq!(eq.number_of_bands(), 10);
        assert_eq!(eq.band_level_range(), (-1500, 1500));
        assert_eq!(eq.center_freq(0), Ok(31_250));
        assert_eq!(eq.center_freq(9), Ok(16_000_000));
        assert_eq!(eq.center_freq(10), Err(MixerError::IllegalArgument));
        assert_eq!(eq.band_freq_range(5), Ok((707_106, 1_414_212)));

        assert_eq!(eq.band_for_frequency(1_000_000), 5);
        assert_eq!(eq.band_for_frequency(22_097), 0);
        assert_eq!(eq.band_for_frequency(22_627_415), 9);
        assert_eq!(eq.band_for_frequency(10_000), UNDEFINED);
        assert_eq!(eq.band_for_frequency(30_000_000), UNDEFINED);
    }

    #[test]
    fn test_band_level_is_clamped() {
        let (mut eq, _) = create(EqualizerMode::Peaking);
        eq.set_band_level(2, 2000).unwrap();
        assert_eq!(eq.band_level(2), Ok(1500));
        eq.set_band_level(2, -4000).unwrap();
        assert_eq!(eq.band_level(2), Ok(-1500));
        assert_eq!(eq.set_band_level(10, 0), Err(MixerError::IllegalArgument));
        assert_eq!(eq.band_level(10), Err(MixerError::IllegalArgument));
    }

    #[test]
    fn test_all_band_level_length_checked() {
        let (mut eq, _) = create(EqualizerMode::FlatGain);
        assert_eq!(eq.set_all_band_level(&[0; 9]), Err(MixerError::IllegalArgument));

        let levels = [100, -200, 300, 0, 0, 0, 0, 0, 0, 1500];
        eq.set_all_band_level(&levels).unwrap();
        assert_eq!(eq.all_band_level(), levels);
    }

    #[test]
    fn test_request_pool_exhaustion_keeps_pending_state() {
        let (mut eq, _proc) = create(EqualizerMode::Peaking);
        assert!(!eq.is_polling_required());

        // three pooled items, all in flight afterwards
        for level in 1..=3 {
            eq.set_band_level(0, level * 100).unwrap();
        }
        assert_eq!(eq.request.lock().updated_bitmap, 0);

        eq.set_band_level(1, 700).unwrap();
        assert_eq!(eq.request.lock().updated_bitmap, 1 << 1);
        assert!(eq.is_polling_required());
        assert_eq!(eq.band_level(1), Ok(700));
    }

    #[test]
    fn test_round_trip_through_render_half() {
        let (mut eq, mut proc) = create(EqualizerMode::Peaking);
        proc.on_attached_to_mixer_thread();

        eq.set_enabled(true).unwrap();
        eq.set_band_level(4, 600).unwrap();
        assert_eq!(eq.band_level(4), Ok(600));

        proc.poll_from_mixer_thread();
        assert!(proc.is_enabled());
        assert_eq!(proc.requested_band_gain_db(4), 6.0);

        // used items come back to the free queue on poll
        assert!(eq.is_polling_required());
        eq.poll().unwrap();
        assert!(!eq.is_polling_required());
    }

    #[test]
    fn test_pending_state_flushed_by_poll() {
        let (mut eq, mut proc) = create(EqualizerMode::FlatGain);
        proc.on_attached_to_mixer_thread();

        for level in 1..=4 {
            eq.set_band_level(3, level * 100).unwrap();
        }
        assert!(eq.is_polling_required());

        proc.poll_from_mixer_thread();
        eq.poll().unwrap();
        proc.poll_from_mixer_thread();
        eq.poll().unwrap();

        assert_eq!(proc.requested_band_gain_db(3), 4.0);
        assert!(!eq.is_polling_required());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("peaking".parse::<EqualizerMode>(), Ok(EqualizerMode::Peaking));
        assert_eq!("flat_gain".parse::<EqualizerMode>(), Ok(EqualizerMode::FlatGain));
        assert!("shelf".parse::<EqualizerMode>().is_err());
        assert_eq!(EqualizerMode::default().to_string(), "flat_gain");
    }
}
