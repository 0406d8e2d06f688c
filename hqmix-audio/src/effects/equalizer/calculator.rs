//! Per-band coefficient calculator with bounded gain steps
//!
//! Gain moves toward its target by at most `max_gain_step` dB per
//! `update()`, so the coefficients glide instead of jumping.
//! Formulas follow the RBJ Audio EQ Cookbook.

use std::f64::consts::{LN_2, PI};

use super::biquad::BiquadCoeffs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BandShape {
    #[default]
    Bypass,
    Peaking,
    LowShelf,
    HighShelf,
}

#[derive(Debug, Clone, Default)]
pub struct BandCalculator {
    shape: BandShape,
    coeffs: BiquadCoeffs,
    bandwidth_or_slope: f64,
    sin_w0: f64,
    cos_w0: f64,
    alpha: f64,
    current_gain: f64, // dB
    target_gain: f64,  // dB
    max_gain_step: f64, // dB
    dirty: bool,
}

fn calc_w0(fs: f64, f0: f64) -> f64 {
    2.0 * PI * f0 / fs
}

fn calc_a(db_gain: f64) -> f64 {
    10f64.powf(db_gain / 40.0)
}

fn calc_alpha_q(sin_w0: f64, q: f64) -> f64 {
    sin_w0 / (2.0 * q)
}

/// Q of a peaking section spanning `bandwidth` octaves around `f0`
fn calc_q_from_band_width(fs: f64, f0: f64, bandwidth: f64) -> f64 {
    let w0 = calc_w0(fs, f0);
    1.0 / (2.0 * (LN_2 / 2.0 * bandwidth * w0 / w0.sin()).sinh())
}

/// Q of a shelf with the given gain and slope
fn calc_q_from_slope(db_gain: f64, slope: f64) -> f64 {
    let a = calc_a(db_gain);
    1.0 / ((a + 1.0 / a) * (1.0 / slope - 1.0) + 2.0).sqrt()
}

impl BandCalculator {
    pub fn init_peaking(&mut self, fs: f64, f0: f64, bandwidth: f64, init_gain: f64, max_gain_step: f64) {
        let q = calc_q_from_band_width(fs, f0, bandwidth);
        self.bandwidth_or_slope = bandwidth;
        self.init_common(BandShape::Peaking, fs, f0, q, init_gain, max_gain_step);
    }

    pub fn init_lowshelf(&mut self, fs: f64, f0: f64, slope: f64, init_gain: f64, max_gain_step: f64) {
        let q = calc_q_from_slope(init_gain, slope);
        self.bandwidth_or_slope = slope;
        self.init_common(BandShape::LowShelf, fs, f0, q, init_gain, max_gain_step);
    }

    pub fn init_highshelf(&mut self, fs: f64, f0: f64, slope: f64, init_gain: f64, max_gain_step: f64) {
        let q = calc_q_from_slope(init_gain, slope);
        self.bandwidth_or_slope = slope;
        self.init_common(BandShape::HighShelf, fs, f0, q, init_gain, max_gain_step);
    }

    fn init_common(&mut self, shape: BandShape, fs: f64, f0: f64, q: f64, init_gain: f64, max_gain_step: f64) {
        let w0 = calc_w0(fs, f0);
        self.shape = shape;
        self.sin_w0 = w0.sin();
        self.cos_w0 = w0.cos();
        self.alpha = calc_alpha_q(self.sin_w0, q);
        self.current_gain = init_gain;
        self.target_gain = init_gain;
        self.max_gain_step = max_gain_step;
        self.dirty = false;
        self.calculate_coeffs();
    }

    /// Take one step toward the target gain.
    ///
    /// Returns true when the coefficients changed, including the step that
    /// lands on the target. [`is_stabled`](Self::is_stabled) tells whether
    /// more steps are needed.
    pub fn update(&mut self) -> bool {
        if !self.dirty {
            return false;
        }

        if (self.current_gain - self.target_gain).abs() <= self.max_gain_step {
            self.current_gain = self.target_gain;
            self.dirty = false;
        } else if self.current_gain > self.target_gain {
            self.current_gain -= self.max_gain_step;
        } else {
            self.current_gain += self.max_gain_step;
        }

        if matches!(self.shape, BandShape::LowShelf | BandShape::HighShelf) {
            let q = calc_q_from_slope(self.current_gain, self.bandwidth_or_slope);
            self.alpha = calc_alpha_q(self.sin_w0, q);
        }

        self.calculate_coeffs();
        true
    }

    pub fn is_stabled(&self) -> bool {
        !self.dirty
    }

    pub fn set_gain(&mut self, gain: f64) {
        self.target_gain = gain;
        self.dirty = true;
    }

    pub fn current_gain(&self) -> f64 {
        self.current_gain
    }

    pub fn target_gain(&self) -> f64 {
        self.target_gain
    }

    pub fn coeffs(&self) -> &BiquadCoeffs {
        &self.coeffs
    }

    /// Flat and staying flat: filtering can be skipped
    pub fn can_bypass(&self) -> bool {
        self.is_stabled() && self.current_gain == 0.0 && self.target_gain == 0.0
    }

    fn calculate_coeffs(&mut self) {
        let a = calc_a(self.current_gain);
        let cos_w0 = self.cos_w0;
        let alpha = self.alpha;

        let (b0, b1, b2, a0, a1, a2) = match self.shape {
            BandShape::Peaking => {
                let alpha_mul_a = alpha * a;
                let alpha_div_a = alpha / a;
                (
                    1.0 + alpha_mul_a,
                    -2.0 * cos_w0,
                    1.0 - alpha_mul_a,
                    1.0 + alpha_div_a,
                    -2.0 * cos_w0,
                    1.0 - alpha_div_a,
                )
            }
            BandShape::LowShelf => {
                let d_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                let b0_b2 = (a + 1.0) - (a - 1.0) * cos_w0;
                let a0_a2 = (a + 1.0) + (a - 1.0) * cos_w0;
                let b1_a1 = (a + 1.0) * cos_w0;
                (
                    a * (b0_b2 + d_sqrt_a_alpha),
                    2.0 * a * ((a - 1.0) - b1_a1),
                    a * (b0_b2 - d_sqrt_a_alpha),
                    a0_a2 + d_sqrt_a_alpha,
                    -2.0 * ((a - 1.0) + b1_a1),
                    a0_a2 - d_sqrt_a_alpha,
                )
            }
            BandShape::HighShelf => {
                let d_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;
                let b0_b2 = (a + 1.0) + (a - 1.0) * cos_w0;
                let a0_a2 = (a + 1.0) - (a - 1.0) * cos_w0;
                let b1_a1 = (a + 1.0) * cos_w0;
                (
                    a * (b0_b2 + d_sqrt_a_alpha),
                    -2.0 * a * ((a - 1.0) + b1_a1),
                    a * (b0_b2 - d_sqrt_a_alpha),
                    a0_a2 + d_sqrt_a_alpha,
                    2.0 * ((a - 1.0) - b1_a1),
                    a0_a2 - d_sqrt_a_alpha,
                )
            }
            BandShape::Bypass => (1.0, 0.0, 0.0, 1.0, 0.0, 0.0),
        };

        let ia0 = 1.0 / a0;
        self.coeffs = BiquadCoeffs {
            a0: (b0 * ia0) as f32,
            a1: (b1 * ia0) as f32,
            a2: (b2 * ia0) as f32,
            b1: (a1 * ia0) as f32,
            b2: (a2 * ia0) as f32,
        };
    }
}
