//! Stereo biquad sections for the equalizer bands

/// Normalized biquad coefficients (a* feedforward, b* feedback)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub a0: f32,
    pub a1: f32,
    pub a2: f32,
    pub b1: f32,
    pub b2: f32,
}

impl BiquadCoeffs {
    /// Pass-through section
    pub const IDENTITY: Self = Self {
        a0: 1.0,
        a1: 0.0,
        a2: 0.0,
        b1: 0.0,
        b2: 0.0,
    };
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Biquad filter state for a single channel
#[derive(Debug, Default, Clone, Copy)]
struct BiquadState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadState {
    #[inline]
    fn process(&mut self, input: f32, coeffs: &BiquadCoeffs) -> f32 {
        let output = coeffs.a0 * input + coeffs.a1 * self.x1 + coeffs.a2 * self.x2
            - coeffs.b1 * self.y1
            - coeffs.b2 * self.y2;

        self.x2 = self.x1;
        self.x1 = input;
        self.y2 = self.y1;
        self.y1 = output;

        output
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// `N` biquad sections run back to back over interleaved stereo frames
#[derive(Debug, Clone)]
pub struct CascadedBiquad<const N: usize> {
    coeffs: [BiquadCoeffs; N],
    // [section][channel]
    states: [[BiquadState; 2]; N],
}

/// One biquad section over stereo frames
pub type SingleBiquad = CascadedBiquad<1>;

impl<const N: usize> Default for CascadedBiquad<N> {
    fn default() -> Self {
        Self {
            coeffs: [BiquadCoeffs::IDENTITY; N],
            states: [[BiquadState::default(); 2]; N],
        }
    }
}

impl<const N: usize> CascadedBiquad<N> {
    /// Set a section's coefficients and clear its history
    pub fn init_partial(&mut self, section: usize, coeffs: &BiquadCoeffs) {
        self.coeffs[section] = *coeffs;
        for state in self.states[section].iter_mut() {
            state.reset();
        }
    }

    /// Swap a section's coefficients, keeping its history
    pub fn update_partial(&mut self, section: usize, coeffs: &BiquadCoeffs) {
        self.coeffs[section] = *coeffs;
    }

    /// Filter `frames` interleaved stereo frames in place
    pub fn perform(&mut self, data: &mut [f32], frames: usize) {
        for frame in data[..frames * 2].chunks_exact_mut(2) {
            for (coeffs, states) in self.coeffs.iter().zip(self.states.iter_mut()) {
                frame[0] = states[0].process(frame[0], coeffs);
                frame[1] = states[1].process(frame[1], coeffs);
            }
        }
    }
}

impl SingleBiquad {
    pub fn init(&mut self, coeffs: &BiquadCoeffs) {
        self.init_partial(0, coeffs);
    }

    pub fn update(&mut self, coeffs: &BiquadCoeffs) {
        self.update_partial(0, coeffs);
    }
}
