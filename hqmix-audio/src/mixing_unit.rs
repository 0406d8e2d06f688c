//! Sample-level mixing and fade arithmetic
//!
//! A mix pass is opened with [`MixingUnit::begin`], every contributing
//! source is added with [`MixPass::mix`], and [`MixPass::end`] runs the
//! output effects and converts to the sink format.
//!
//! The first contributor of a pass overwrites the mix buffer, later ones
//! accumulate onto it, so the buffer never needs to be pre-zeroed.

use std::f64::consts::PI;

use crate::effects::MixedOutputAudioEffectProcessor;
use crate::error::{MixerError, Result};
use crate::pipe::NUM_CHANNELS;

/// How a source contributes to the mix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MixMode {
    #[default]
    Mute,
    Add,
    ShortFadeIn,
    ShortFadeOut,
    LongFadeIn,
    LongFadeOut,
}

impl MixMode {
    /// +1 for fade-in, -1 for fade-out, 0 otherwise
    pub fn direction(self) -> i32 {
        match self {
            MixMode::Mute | MixMode::Add => 0,
            MixMode::ShortFadeIn | MixMode::LongFadeIn => 1,
            MixMode::ShortFadeOut | MixMode::LongFadeOut => -1,
        }
    }

    pub fn is_fade_in(self) -> bool {
        self.direction() > 0
    }

    pub fn is_fade_out(self) -> bool {
        self.direction() < 0
    }
}

/// Phase to continue with when a source switches from `cur` to `next`.
///
/// Same direction keeps the phase, opposite direction mirrors it, and a
/// switch involving a non-directional mode restarts at 0.
pub fn carry_over_phase(cur: MixMode, next: MixMode, phase: f32) -> f32 {
    if cur == next {
        return phase;
    }
    match cur.direction() * next.direction() {
        1 => phase,
        -1 => 1.0 - phase,
        _ => 0.0,
    }
}

/// Per-source render state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixContext {
    pub mode: MixMode,
    /// Position within the current fade, always in [0, 1]
    pub phase: f32,
    pub volume: [f32; 2],
}

impl MixContext {
    pub fn set_phase(&mut self, phase: f32) {
        self.phase = phase.clamp(0.0, 1.0);
    }

    fn is_muted(&self) -> bool {
        self.volume[0] == 0.0 && self.volume[1] == 0.0
    }
}

impl Default for MixContext {
    fn default() -> Self {
        Self {
            mode: MixMode::Mute,
            phase: 0.0,
            volume: [0.0, 0.0],
        }
    }
}

/// Raised-cosine ramp from 0 to 1
struct FadeTable {
    table: Box<[f32]>,
}

impl FadeTable {
    fn new(n: usize) -> Self {
        let step = if n > 1 { PI / (n - 1) as f64 } else { 0.0 };
        let table = (0..n)
            .map(|i| (0.5 - 0.5 * (step * i as f64).cos()) as f32)
            .collect();
        Self { table }
    }

    #[inline]
    fn len(&self) -> usize {
        self.table.len()
    }
}

/// Destination block handed to [`MixingUnit::begin`]
pub enum SinkBuffer<'a> {
    S16(&'a mut [i16]),
    F32(&'a mut [f32]),
}

/// Stateless-per-call stereo mixer with precomputed fade tables
pub struct MixingUnit {
    block_size: usize,
    internal_mix_buff: Box<[f32]>,
    short_fade: FadeTable,
    long_fade: FadeTable,
}

impl MixingUnit {
    pub fn new(
        sampling_rate: u32,
        block_size: usize,
        short_fade_ms: u32,
        long_fade_ms: u32,
    ) -> Result<Self> {
        if sampling_rate == 0 || block_size == 0 {
            return Err(MixerError::IllegalArgument);
        }

        let frames = |ms: u32| (u64::from(sampling_rate) * u64::from(ms) / 1000) as usize;

        Ok(Self {
            block_size,
            internal_mix_buff: vec![0.0; block_size * NUM_CHANNELS].into_boxed_slice(),
            short_fade: FadeTable::new(frames(short_fade_ms)),
            long_fade: FadeTable::new(frames(long_fade_ms)),
        })
    }

    /// Frames per block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Open a mix pass over `dest`.
    ///
    /// Float sinks are mixed in place. For 16-bit sinks the capture buffer
    /// (or an internal buffer when there is none) holds the float mix.
    pub fn begin<'a>(
        &'a mut self,
        dest: SinkBuffer<'a>,
        capture: Option<&'a mut [f32]>,
        effects: &'a mut [Box<dyn MixedOutputAudioEffectProcessor>],
    ) -> Result<MixPass<'a>> {
        let samples = self.block_size * NUM_CHANNELS;

        let dest_len = match &dest {
            SinkBuffer::S16(d) => d.len(),
            SinkBuffer::F32(d) => d.len(),
        };
        if dest_len != samples || capture.as_ref().is_some_and(|c| c.len() != samples) {
            return Err(MixerError::IllegalArgument);
        }

        let MixingUnit {
            block_size,
            internal_mix_buff,
            short_fade,
            long_fade,
        } = self;

        let (mix_buff, s16_dest, capture_copy) = match (dest, capture) {
            (SinkBuffer::F32(d), capture) => (d, None, capture),
            (SinkBuffer::S16(d), Some(capture)) => (capture, Some(d), None),
            (SinkBuffer::S16(d), None) => (&mut internal_mix_buff[..], Some(d), None),
        };

        Ok(MixPass {
            block_size: *block_size,
            short_fade,
            long_fade,
            mix_buff,
            s16_dest,
            capture_copy,
            effects,
            processed_count: 0,
        })
    }
}

/// An open mix pass over one output block
pub struct MixPass<'a> {
    block_size: usize,
    short_fade: &'a FadeTable,
    long_fade: &'a FadeTable,
    mix_buff: &'a mut [f32],
    s16_dest: Option<&'a mut [i16]>,
    capture_copy: Option<&'a mut [f32]>,
    effects: &'a mut [Box<dyn MixedOutputAudioEffectProcessor>],
    processed_count: usize,
}

impl MixPass<'_> {
    /// Mix one source block according to `context`, advancing its phase
    pub fn mix(&mut self, context: &mut MixContext, src: &[f32]) -> Result<()> {
        if src.len() != self.block_size * NUM_CHANNELS {
            return Err(MixerError::IllegalArgument);
        }
        if !(0.0..=1.0).contains(&context.phase) {
            return Err(MixerError::IllegalArgument);
        }

        let first_mix = self.processed_count == 0;
        let mode = if context.is_muted() {
            MixMode::Mute
        } else {
            context.mode
        };

        let processed = match mode {
            MixMode::Mute => false,
            MixMode::Add => {
                mul_scale(self.mix_buff, src, context.volume, first_mix);
                true
            }
            MixMode::ShortFadeIn => fade_in(context, self.short_fade, self.mix_buff, src, first_mix),
            MixMode::LongFadeIn => fade_in(context, self.long_fade, self.mix_buff, src, first_mix),
            MixMode::ShortFadeOut => fade_out(context, self.short_fade, self.mix_buff, src, first_mix),
            MixMode::LongFadeOut => fade_out(context, self.long_fade, self.mix_buff, src, first_mix),
        };

        if processed {
            self.processed_count += 1;
        }

        Ok(())
    }

    /// Number of sources that wrote into the mix buffer so far
    pub fn processed_count(&self) -> usize {
        self.processed_count
    }

    /// Apply output effects, convert to the sink format and fill the capture block
    pub fn end(self) {
        let MixPass {
            block_size,
            mix_buff,
            s16_dest,
            capture_copy,
            effects,
            processed_count,
            ..
        } = self;

        if processed_count == 0 {
            mix_buff.fill(0.0);
        }

        for effect in effects.iter_mut() {
            effect.process(mix_buff, NUM_CHANNELS, block_size);
        }

        if let Some(dest) = s16_dest {
            for (d, &s) in dest.iter_mut().zip(mix_buff.iter()) {
                *d = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
            }
        }

        if let Some(capture) = capture_copy {
            capture.copy_from_slice(mix_buff);
        }
    }
}

/// dest = (dest if accumulating) + src * volume
#[inline]
fn mul_scale(dest: &mut [f32], src: &[f32], volume: [f32; 2], first_mix: bool) {
    for (d, s) in dest.chunks_exact_mut(NUM_CHANNELS).zip(src.chunks_exact(NUM_CHANNELS)) {
        let l = s[0] * volume[0];
        let r = s[1] * volume[1];
        if first_mix {
            d[0] = l;
            d[1] = r;
        } else {
            d[0] += l;
            d[1] += r;
        }
    }
}

/// Like [`mul_scale`], with each frame also scaled by its ramp value
#[inline]
fn mul_ramp_and_scale<'t>(
    dest: &mut [f32],
    src: &[f32],
    ramp: impl Iterator<Item = &'t f32>,
    volume: [f32; 2],
    first_mix: bool,
) {
    let frames = dest
        .chunks_exact_mut(NUM_CHANNELS)
        .zip(src.chunks_exact(NUM_CHANNELS))
        .zip(ramp);

    for ((d, s), &g) in frames {
        let l = s[0] * g * volume[0];
        let r = s[1] * g * volume[1];
        if first_mix {
            d[0] = l;
            d[1] = r;
        } else {
            d[0] += l;
            d[1] += r;
        }
    }
}

fn fade_remains(context: &MixContext, table: &FadeTable, num_frames: usize) -> (usize, usize) {
    let size = table.len();
    let iphase = ((context.phase * size as f32) as usize).min(size);
    (iphase, (size - iphase).min(num_frames))
}

fn advance_phase(context: &mut MixContext, table: &FadeTable, frames: usize) {
    if table.len() > 0 {
        context.set_phase(context.phase + frames as f32 / table.len() as f32);
    }
}

fn fade_in(
    context: &mut MixContext,
    table: &FadeTable,
    mix_buff: &mut [f32],
    src: &[f32],
    first_mix: bool,
) -> bool {
    let num_frames = src.len() / NUM_CHANNELS;
    let (iphase, remains) = fade_remains(context, table, num_frames);
    let split = remains * NUM_CHANNELS;

    if remains > 0 {
        let ramp = table.table[iphase..iphase + remains].iter();
        mul_ramp_and_scale(&mut mix_buff[..split], &src[..split], ramp, context.volume, first_mix);
    }
    if remains < num_frames {
        mul_scale(&mut mix_buff[split..], &src[split..], context.volume, first_mix);
    }

    advance_phase(context, table, remains);
    true
}

fn fade_out(
    context: &mut MixContext,
    table: &FadeTable,
    mix_buff: &mut [f32],
    src: &[f32],
    first_mix: bool,
) -> bool {
    let num_frames = src.len() / NUM_CHANNELS;
    let (iphase, remains) = fade_remains(context, table, num_frames);
    let split = remains * NUM_CHANNELS;

    if remains > 0 {
        // read the ramp backwards, starting at size - iphase - 1
        let top = table.len() - iphase;
        let ramp = table.table[top - remains..top].iter().rev();
        mul_ramp_and_scale(&mut mix_buff[..split], &src[..split], ramp, context.volume, first_mix);
    }
    if remains < num_frames && first_mix {
        mix_buff[split..].fill(0.0);
    }

    advance_phase(context, table, remains);
    remains > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 16;

    fn unit(short_ms: u32, long_ms: u32) -> MixingUnit {
        // 1 kHz keeps the tables short: 1 ms == 1 frame
        MixingUnit::new(1000, BLOCK, short_ms, long_ms).unwrap()
    }

    fn constant(value: f32) -> Vec<f32> {
        vec![value; BLOCK * NUM_CHANNELS]
    }

    fn ctx(mode: MixMode, volume: f32) -> MixContext {
        MixContext {
            mode,
            phase: 0.0,
            volume: [volume, volume],
        }
    }

    struct Gain(f32);

    impl MixedOutputAudioEffectProcessor for Gain {
        fn on_attached_to_mixer_thread(&mut self) {}
        fn on_detached_from_mixer_thread(&mut self) {}
        fn poll_from_mixer_thread(&mut self) {}
        fn process(&mut self, data: &mut [f32], _num_channels: usize, _num_frames: usize) {
            for s in data.iter_mut() {
                *s *= self.0;
            }
        }
    }

    #[test]
    fn test_fade_table_shape() {
        let table = FadeTable::new(5);
        assert!(table.table[0].abs() < 1e-6);
        assert!((table.table[2] - 0.5).abs() < 1e-6);
        assert!((table.table[4] - 1.0).abs() < 1e-6);
        assert_eq!(FadeTable::new(1).table[0], 0.0);
        assert_eq!(FadeTable::new(0).len(), 0);
    }

    #[test]
    fn test_add_is_additive() {
        let mut mu = unit(4, 8);
        let mut out = constant(123.0);
        let mut effects: Vec<Box<dyn MixedOutputAudioEffectProcessor>> = Vec::new();
        let mut a = ctx(MixMode::Add, 0.5);
        let mut b = ctx(MixMode::Add, 0.25);

        let mut pass = mu.begin(SinkBuffer::F32(&mut out), None, &mut effects).unwrap();
        pass.mix(&mut a, &constant(0.4)).unwrap();
        pass.mix(&mut b, &constant(0.8)).unwrap();
        assert_eq!(pass.processed_count(), 2);
        pass.end();

        for s in &out {
            assert!((s - (0.4 * 0.5 + 0.8 * 0.25)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_nothing_mixed_yields_silence() {
        let mut mu = unit(4, 8);
        let mut out = constant(9.0);
        let mut effects: Vec<Box<dyn MixedOutputAudioEffectProcessor>> = Vec::new();
        let mut silent = ctx(MixMode::Add, 0.0);

        let mut pass = mu.begin(SinkBuffer::F32(&mut out), None, &mut effects).unwrap();
        pass.mix(&mut silent, &constant(1.0)).unwrap();
        pass.end();

        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_mute_does_not_take_first_write() {
        let mut mu = unit(4, 8);
        let mut out = constant(9.0);
        let mut effects: Vec<Box<dyn MixedOutputAudioEffectProcessor>> = Vec::new();
        let mut muted = ctx(MixMode::Mute, 1.0);
        let mut live = ctx(MixMode::Add, 1.0);

        let mut pass = mu.begin(SinkBuffer::F32(&mut out), None, &mut effects).unwrap();
        pass.mix(&mut muted, &constant(1.0)).unwrap();
        pass.mix(&mut live, &constant(0.25)).unwrap();
        pass.end();

        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_wrong_size_rejected() {
        let mut mu = unit(4, 8);
        let mut short = vec![0.0f32; 4];
        let mut effects: Vec<Box<dyn MixedOutputAudioEffectProcessor>> = Vec::new();
        assert!(mu.begin(SinkBuffer::F32(&mut short), None, &mut effects).is_err());

        let mut out = constant(0.0);
        let mut c = ctx(MixMode::Add, 1.0);
        let mut pass = mu.begin(SinkBuffer::F32(&mut out), None, &mut effects).unwrap();
        assert_eq!(pass.mix(&mut c, &[0.0; 3]), Err(MixerError::IllegalArgument));
        c.phase = 1.5;
        assert_eq!(pass.mix(&mut c, &constant(0.0)), Err(MixerError::IllegalArgument));
        pass.end();
    }

    #[test]
    fn test_fade_phase_monotonic() {
        // 40 frame long fade, 16 frame blocks
        let mut mu = unit(4, 40);
        let mut effects: Vec<Box<dyn MixedOutputAudioEffectProcessor>> = Vec::new();
        let src = constant(1.0);

        for mode in [MixMode::LongFadeIn, MixMode::LongFadeOut] {
            let mut c = ctx(mode, 1.0);
            let mut last = c.phase;
            let mut saturated = false;
            for _ in 0..6 {
                let mut out = constant(0.0);
                let mut pass = mu.begin(SinkBuffer::F32(&mut out), None, &mut effects).unwrap();
                pass.mix(&mut c, &src).unwrap();
                pass.end();

                assert!(c.phase >= 0.0 && c.phase <= 1.0);
                if saturated {
                    assert_eq!(c.phase, 1.0);
                } else {
                    assert!(c.phase > last);
                }
                saturated = c.phase >= 1.0;
                last = c.phase;
            }
            assert!(saturated);
        }
    }

    #[test]
    fn test_fade_in_ramps_up_then_adds() {
        let mut mu = unit(4, 8);
        let mut out = constant(0.0);
        let mut effects: Vec<Box<dyn MixedOutputAudioEffectProcessor>> = Vec::new();
        let mut c = ctx(MixMode::ShortFadeIn, 1.0);

        let mut pass = mu.begin(SinkBuffer::F32(&mut out), None, &mut effects).unwrap();
        pass.mix(&mut c, &constant(1.0)).unwrap();
        pass.end();

        let left: Vec<f32> = out.iter().step_by(2).copied().collect();
        assert!(left[0].abs() < 1e-6);
        assert!(left[1] > left[0] && left[2] > left[1]);
        assert!((left[3] - 1.0).abs() < 1e-6);
        assert!(left[4..].iter().all(|&s| s == 1.0));
        assert_eq!(c.phase, 1.0);
    }

    #[test]
    fn test_fade_out_tail_is_silent() {
        let mut mu = unit(4, 8);
        let mut out = constant(5.0);
        let mut effects: Vec<Box<dyn MixedOutputAudioEffectProcessor>> = Vec::new();
        let mut c = ctx(MixMode::ShortFadeOut, 1.0);

        let mut pass = mu.begin(SinkBuffer::F32(&mut out), None, &mut effects).unwrap();
        pass.mix(&mut c, &constant(1.0)).unwrap();
        pass.end();

        let left: Vec<f32> = out.iter().step_by(2).copied().collect();
        assert!((left[0] - 1.0).abs() < 1e-6);
        assert!(left[3].abs() < 1e-6);
        assert!(left[4..].iter().all(|&s| s == 0.0));
        assert_eq!(c.phase, 1.0);

        // fully faded out: contributes nothing
        let mut out = constant(5.0);
        let mut pass = mu.begin(SinkBuffer::F32(&mut out), None, &mut effects).unwrap();
        pass.mix(&mut c, &constant(1.0)).unwrap();
        assert_eq!(pass.processed_count(), 0);
        pass.end();
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_mode_switch_phase() {
        let p = 0.3;
        assert_eq!(carry_over_phase(MixMode::ShortFadeIn, MixMode::ShortFadeOut, p), 1.0 - p);
        assert_eq!(carry_over_phase(MixMode::ShortFadeIn, MixMode::LongFadeIn, p), p);
        assert_eq!(carry_over_phase(MixMode::LongFadeOut, MixMode::ShortFadeOut, p), p);
        assert_eq!(carry_over_phase(MixMode::Add, MixMode::ShortFadeIn, p), 0.0);
        assert_eq!(carry_over_phase(MixMode::ShortFadeOut, MixMode::Mute, p), 0.0);
        assert_eq!(carry_over_phase(MixMode::Add, MixMode::Add, p), p);
    }

    #[test]
    fn test_s16_sink_with_capture_and_effects() {
        let mut mu = unit(4, 8);
        let mut sink = vec![0i16; BLOCK * NUM_CHANNELS];
        let mut capture = constant(7.0);
        let mut effects: Vec<Box<dyn MixedOutputAudioEffectProcessor>> = vec![Box::new(Gain(0.5))];
        let mut c = ctx(MixMode::Add, 1.0);

        let mut pass = mu
            .begin(SinkBuffer::S16(&mut sink), Some(&mut capture), &mut effects)
            .unwrap();
        pass.mix(&mut c, &constant(2.0)).unwrap();
        pass.end();

        // 2.0 * 0.5 = 1.0, clamped to full scale
        assert!(sink.iter().all(|&s| s == 32767));
        assert!(capture.iter().all(|&s| (s - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_f32_sink_copies_to_capture() {
        let mut mu = unit(4, 8);
        let mut sink = constant(0.0);
        let mut capture = constant(0.0);
        let mut effects: Vec<Box<dyn MixedOutputAudioEffectProcessor>> = Vec::new();
        let mut c = ctx(MixMode::Add, 0.5);

        let mut pass = mu
            .begin(SinkBuffer::F32(&mut sink), Some(&mut capture), &mut effects)
            .unwrap();
        pass.mix(&mut c, &constant(0.5)).unwrap();
        pass.end();

        assert_eq!(sink, capture);
        assert!(sink.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }
}
