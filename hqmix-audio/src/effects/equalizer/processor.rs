//! Render half of the equalizer
//!
//! Runs on the mixer thread. Band gains are folded in from the request
//! queue on every poll, then each band topology steps its calculators in
//! `BLOCK_SIZE_WHILE_UPDATING` frame chunks until the gains settle.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::circulation_buffer::{Reader, Writer};
use crate::effects::MixedOutputAudioEffectProcessor;
use crate::mixer::bits;
use crate::pipe::NUM_CHANNELS;

use super::biquad::{CascadedBiquad, SingleBiquad};
use super::calculator::BandCalculator;
use super::{
    millibel_to_decibel, move_request_item, EqualizerMode, EqualizerRequest, RequestItem,
    ALL_BANDS_MASK, BAND_INFO, ENABLED_UPDATED_BIT, NUM_BANDS,
};

const MAX_GAIN_STEP: f64 = 0.125; // dB
const BLOCK_SIZE_WHILE_UPDATING: usize = 256; // frames

const MILLIHERTZ_TO_HERTZ: f64 = 0.001;

// peaking topology
const PEAKING_NEIGHBOR_BAND_CORRELATION_COEFF: f64 = -0.15;
const PEAKING_BAND_WIDTH: f64 = 1.0; // octaves

// flat gain topology
const BAND_SLOPE: f64 = 2.0;
const HALF_BAND_WIDTH: f64 = std::f64::consts::SQRT_2;
const HALF_BAND_WIDTH_INV: f64 = std::f64::consts::FRAC_1_SQRT_2;

const LOWEST_BAND_MASK: u32 = 1;
const HIGHEST_BAND_MASK: u32 = 1 << (NUM_BANDS - 1);
const MID_BANDS_MASK: u32 = ALL_BANDS_MASK & !(LOWEST_BAND_MASK | HIGHEST_BAND_MASK);

/// Gains and per-band leftovers shared by both topologies
struct BandLevels {
    current_db: [f64; NUM_BANDS],
    /// Frames still owed to a partially processed update chunk
    pending: [usize; NUM_BANDS],
}

/// How the bands are realized as biquad sections
trait BandTopology: Send {
    fn setup(&mut self, fs: f64, levels: &BandLevels);

    /// Filter the bands in `mask`. Returns the bands still gliding.
    fn process_bands(&mut self, mask: u32, data: &mut [f32], frames: usize, levels: &mut BandLevels) -> u32;

    /// Retarget the bands in `mask`. Returns the bands that start gliding.
    fn update_bands_level(&mut self, mask: u32, levels: &BandLevels) -> u32;
}

/// Run `frames` frames through `filter`, stepping `calcs` (one per section)
/// every [`BLOCK_SIZE_WHILE_UPDATING`] frames.
///
/// `pending` carries the unfinished part of the last chunk across calls so
/// that a coefficient set always covers a full chunk. Returns true while any
/// calculator is still gliding.
fn process_gliding<const N: usize>(
    filter: &mut CascadedBiquad<N>,
    calcs: &mut [BandCalculator],
    pending: &mut usize,
    data: &mut [f32],
    frames: usize,
) -> bool {
    let mut offset = 0;
    let mut remains = frames;

    if remains > 0 && *pending > 0 {
        let n = remains.min(*pending);
        filter.perform(&mut data[offset * NUM_CHANNELS..], n);
        remains -= n;
        offset += n;
        *pending -= n;
    }

    while remains > 0 {
        let mut updating = false;
        for calc in calcs.iter_mut() {
            updating |= calc.update();
        }
        if !updating {
            break;
        }

        let n = remains.min(BLOCK_SIZE_WHILE_UPDATING);
        for (section, calc) in calcs.iter().enumerate() {
            filter.update_partial(section, calc.coeffs());
        }
        filter.perform(&mut data[offset * NUM_CHANNELS..], n);
        remains -= n;
        offset += n;
        *pending = BLOCK_SIZE_WHILE_UPDATING - n;
    }

    if remains > 0 && !calcs.iter().all(BandCalculator::can_bypass) {
        filter.perform(&mut data[offset * NUM_CHANNELS..], remains);
    }

    !calcs.iter().all(BandCalculator::is_stabled)
}

/// One peaking section per band, two bands per cascade
#[derive(Default)]
struct PeakingTopology {
    filters: [CascadedBiquad<2>; NUM_BANDS / 2],
    calcs: [BandCalculator; NUM_BANDS],
}

impl PeakingTopology {
    /// Band gain corrected for the overlap with its neighbours
    fn corrected_band_level(levels: &BandLevels, band: usize) -> f64 {
        let lower = if band == 0 { 0.0 } else { levels.current_db[band - 1] };
        let higher = if band == NUM_BANDS - 1 {
            0.0
        } else {
            levels.current_db[band + 1]
        };
        levels.current_db[band] + PEAKING_NEIGHBOR_BAND_CORRELATION_COEFF * (lower + higher)
    }
}

impl BandTopology for PeakingTopology {
    fn setup(&mut self, fs: f64, levels: &BandLevels) {
        for band in 0..NUM_BANDS {
            let calc = &mut self.calcs[band];
            calc.init_peaking(
                fs,
                f64::from(BAND_INFO[band].center_freq) * MILLIHERTZ_TO_HERTZ,
                PEAKING_BAND_WIDTH,
                Self::corrected_band_level(levels, band),
                MAX_GAIN_STEP,
            );
            self.filters[band / 2].init_partial(band % 2, calc.coeffs());
        }
    }

    fn process_bands(&mut self, mask: u32, data: &mut [f32], frames: usize, levels: &mut BandLevels) -> u32 {
        let mut updating = 0;
        let pair_mask = mask | (mask >> 1);

        for set in 0..NUM_BANDS / 2 {
            let first = 2 * set;
            if pair_mask & (1 << first) == 0 {
                continue;
            }

            let mut pending = levels.pending[first].max(levels.pending[first + 1]);
            let gliding = process_gliding(
                &mut self.filters[set],
                &mut self.calcs[first..first + 2],
                &mut pending,
                data,
                frames,
            );
            levels.pending[first] = pending;
            levels.pending[first + 1] = pending;

            if gliding {
                updating |= 0b11 << first;
            }
        }

        updating
    }

    fn update_bands_level(&mut self, mask: u32, levels: &BandLevels) -> u32 {
        // a band's correction depends on its neighbours
        let mask = (mask | (mask << 1) | (mask >> 1)) & ALL_BANDS_MASK;
        for band in bits(mask) {
            self.calcs[band].set_gain(Self::corrected_band_level(levels, band));
        }
        mask
    }
}

/// Each band is a step between two low shelves; the edge bands are a
/// single shelf
#[derive(Default)]
struct FlatGainTopology {
    lowest: SingleBiquad,
    highest: SingleBiquad,
    mid: [CascadedBiquad<2>; NUM_BANDS - 2],
    // [0]: lowest, [1 + 2 * (band - 1)..][..2]: mid band, [last]: highest
    calcs: [BandCalculator; 2 + 2 * (NUM_BANDS - 2)],
}

const LOWEST_CALC: usize = 0;
const HIGHEST_CALC: usize = 1 + 2 * (NUM_BANDS - 2);

fn mid_calc(band: usize) -> usize {
    1 + 2 * (band - 1)
}

impl BandTopology for FlatGainTopology {
    fn setup(&mut self, fs: f64, levels: &BandLevels) {
        let center_hz = |band: usize| f64::from(BAND_INFO[band].center_freq) * MILLIHERTZ_TO_HERTZ;

        let calc = &mut self.calcs[LOWEST_CALC];
        calc.init_lowshelf(
            fs,
            center_hz(0) * HALF_BAND_WIDTH,
            BAND_SLOPE,
            levels.current_db[0],
            MAX_GAIN_STEP,
        );
        self.lowest.init(calc.coeffs());

        for band in 1..NUM_BANDS - 1 {
            let db = levels.current_db[band];
            let index = mid_calc(band);
            let filter = &mut self.mid[band - 1];

            let calc = &mut self.calcs[index];
            calc.init_lowshelf(fs, center_hz(band) * HALF_BAND_WIDTH_INV, BAND_SLOPE, -db, MAX_GAIN_STEP);
            filter.init_partial(0, calc.coeffs());

            let calc = &mut self.calcs[index + 1];
            calc.init_lowshelf(fs, center_hz(band) * HALF_BAND_WIDTH, BAND_SLOPE, db, MAX_GAIN_STEP);
            filter.init_partial(1, calc.coeffs());
        }

        let calc = &mut self.calcs[HIGHEST_CALC];
        calc.init_highshelf(
            fs,
            center_hz(NUM_BANDS - 1) * HALF_BAND_WIDTH_INV,
            BAND_SLOPE,
            levels.current_db[NUM_BANDS - 1],
            MAX_GAIN_STEP,
        );
        self.highest.init(calc.coeffs());
    }

    fn process_bands(&mut self, mask: u32, data: &mut [f32], frames: usize, levels: &mut BandLevels) -> u32 {
        let mut updating = 0;

        if mask & LOWEST_BAND_MASK != 0
            && process_gliding(
                &mut self.lowest,
                &mut self.calcs[LOWEST_CALC..=LOWEST_CALC],
                &mut levels.pending[0],
                data,
                frames,
            )
        {
            updating |= LOWEST_BAND_MASK;
        }

        for band in bits(mask & MID_BANDS_MASK) {
            let index = mid_calc(band);
            if process_gliding(
                &mut self.mid[band - 1],
                &mut self.calcs[index..index + 2],
                &mut levels.pending[band],
                data,
                frames,
            ) {
                updating |= 1 << band;
            }
        }

        if mask & HIGHEST_BAND_MASK != 0
            && process_gliding(
                &mut self.highest,
                &mut self.calcs[HIGHEST_CALC..=HIGHEST_CALC],
                &mut levels.pending[NUM_BANDS - 1],
                data,
                frames,
            )
        {
            updating |= HIGHEST_BAND_MASK;
        }

        updating
    }

    fn update_bands_level(&mut self, mask: u32, levels: &BandLevels) -> u32 {
        if mask & LOWEST_BAND_MASK != 0 {
            self.calcs[LOWEST_CALC].set_gain(levels.current_db[0]);
        }
        for band in bits(mask & MID_BANDS_MASK) {
            let db = levels.current_db[band];
            let index = mid_calc(band);
            self.calcs[index].set_gain(-db);
            self.calcs[index + 1].set_gain(db);
        }
        if mask & HIGHEST_BAND_MASK != 0 {
            self.calcs[HIGHEST_CALC].set_gain(levels.current_db[NUM_BANDS - 1]);
        }
        mask
    }
}

/// Render half of the equalizer, owned by the mixer thread
pub struct HQEqualizerProcessor {
    sampling_rate: u32,
    block_size: usize,
    control: Arc<Mutex<EqualizerRequest>>,
    request_rx: Reader<RequestItem>,
    used_tx: Writer<RequestItem>,
    current: EqualizerRequest,
    requested_db: [f64; NUM_BANDS],
    levels: BandLevels,
    updating_bands: u32,
    topology: Box<dyn BandTopology>,
}

impl HQEqualizerProcessor {
    pub(super) fn new(
        sampling_rate: u32,
        block_size: usize,
        mode: EqualizerMode,
        control: Arc<Mutex<EqualizerRequest>>,
        request_rx: Reader<RequestItem>,
        used_tx: Writer<RequestItem>,
    ) -> Self {
        let topology: Box<dyn BandTopology> = match mode {
            EqualizerMode::Peaking => Box::<PeakingTopology>::default(),
            EqualizerMode::FlatGain => Box::<FlatGainTopology>::default(),
        };

        Self {
            sampling_rate,
            block_size,
            control,
            request_rx,
            used_tx,
            current: EqualizerRequest::default(),
            requested_db: [0.0; NUM_BANDS],
            levels: BandLevels {
                current_db: [0.0; NUM_BANDS],
                pending: [0; NUM_BANDS],
            },
            updating_bands: 0,
            topology,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_enabled(&self) -> bool {
        self.current.enabled
    }

    #[cfg(test)]
    pub(crate) fn requested_band_gain_db(&self, band: usize) -> f64 {
        self.requested_db[band]
    }

    #[cfg(test)]
    pub(crate) fn current_band_gain_db(&self, band: usize) -> f64 {
        self.levels.current_db[band]
    }
}

impl MixedOutputAudioEffectProcessor for HQEqualizerProcessor {
    fn on_attached_to_mixer_thread(&mut self) {
        // snapshots still queued are older than the control state
        while move_request_item(&mut self.request_rx, &mut self.used_tx, None, None) {}

        {
            let mut control = self.control.lock();
            self.current = *control;
            control.updated_bitmap = 0;
        }

        self.updating_bands = 0;
        self.levels.pending = [0; NUM_BANDS];

        for band in 0..NUM_BANDS {
            let db = millibel_to_decibel(self.current.band_level[band]);
            self.requested_db[band] = db;
            self.levels.current_db[band] = db;
        }

        self.topology.setup(f64::from(self.sampling_rate), &self.levels);

        debug!(enabled = self.current.enabled, "equalizer attached to mixer thread");
    }

    fn on_detached_from_mixer_thread(&mut self) {
        debug!("equalizer detached from mixer thread");
    }

    fn poll_from_mixer_thread(&mut self) {
        let mut updated_mask = 0;
        while move_request_item(&mut self.request_rx, &mut self.used_tx, None, Some(&mut self.current)) {
            updated_mask |= self.current.updated_bitmap;
        }

        if updated_mask == 0 {
            return;
        }

        let updated_bands = updated_mask & ALL_BANDS_MASK;
        for band in bits(updated_bands) {
            self.requested_db[band] = millibel_to_decibel(self.current.band_level[band]);
            if self.current.enabled {
                self.levels.current_db[band] = self.requested_db[band];
            }
        }

        if updated_mask & ENABLED_UPDATED_BIT != 0 {
            self.levels.current_db = if self.current.enabled {
                self.requested_db
            } else {
                [0.0; NUM_BANDS]
            };
            self.updating_bands |= self.topology.update_bands_level(ALL_BANDS_MASK, &self.levels);
        } else if self.current.enabled && updated_bands != 0 {
            self.updating_bands |= self.topology.update_bands_level(updated_bands, &self.levels);
        }

        trace!(updated_mask, updating = self.updating_bands, "equalizer requests applied");
    }

    fn process(&mut self, data: &mut [f32], num_channels: usize, num_frames: usize) {
        if num_channels != NUM_CHANNELS || num_frames != self.block_size || data.len() < num_frames * NUM_CHANNELS {
            return;
        }

        let active = if self.current.enabled {
            ALL_BANDS_MASK
        } else {
            self.updating_bands
        };
        self.updating_bands = self.topology.process_bands(active, data, num_frames, &mut self.levels);
    }
}
