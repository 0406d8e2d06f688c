//! HQMix demo host
//!
//! Plays the mixer's sink pipe through the default output device, feeds two
//! synthetic sources and drives the equalizer through its message protocol.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hqmix_audio::mixer::{Operation, STOP_ON_PLAYBACK_END};
use hqmix_audio::pipe::SourceInPort;
use hqmix_audio::{
    AttachSourceArgs, AudioMixer, AudioSourceDataPipe, BlockReader, BlockTag, EffectBinding,
    EqualizerService, MixerConfig, MixingStartCause, MixingStopCause, SharedEffect,
    SinkPullNotifier, SinkReader, SourceClientEventHandler,
};

/// Total demo duration
const RUN_TIME: Duration = Duration::from_secs(8);
/// Request-thread poll period
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Mixing event forwarded from the client callbacks to the main loop
#[derive(Debug)]
enum SourceEvent {
    Started(&'static str, MixingStartCause),
    Stopped(&'static str, MixingStopCause),
}

struct ForwardingClient {
    name: &'static str,
    events: Sender<SourceEvent>,
}

impl SourceClientEventHandler for ForwardingClient {
    fn on_mixing_started(
        &self,
        _mixer: &mut AudioMixer,
        _pipe: &Arc<AudioSourceDataPipe>,
        cause: MixingStartCause,
    ) {
        let _ = self.events.try_send(SourceEvent::Started(self.name, cause));
    }

    fn on_mixing_stopped(
        &self,
        _mixer: &mut AudioMixer,
        _pipe: &Arc<AudioSourceDataPipe>,
        cause: MixingStopCause,
    ) {
        let _ = self.events.try_send(SourceEvent::Stopped(self.name, cause));
    }
}

/// Sine generator standing in for a decoder
struct ToneSource {
    frequency: f32,
    amplitude: f32,
    sampling_rate: f32,
    phase: f32,
    /// Frames left before end of data, `None` for endless
    remaining: Option<usize>,
}

impl ToneSource {
    fn fill(&mut self, data: &mut [f32]) -> BlockTag {
        let step = TAU * self.frequency / self.sampling_rate;
        let mut tag = BlockTag::AudioData;

        for frame in data.chunks_exact_mut(2) {
            let sample = match &mut self.remaining {
                Some(0) => {
                    tag = BlockTag::EndOfData;
                    0.0
                }
                Some(n) => {
                    *n -= 1;
                    self.amplitude * self.phase.sin()
                }
                None => self.amplitude * self.phase.sin(),
            };
            frame[0] = sample;
            frame[1] = sample;
            self.phase = (self.phase + step) % TAU;
        }
        tag
    }
}

fn spawn_producer(
    name: &'static str,
    mut port: SourceInPort,
    mut tone: ToneSource,
    running: Arc<AtomicBool>,
) -> anyhow::Result<JoinHandle<SourceInPort>> {
    let handle = thread::Builder::new()
        .name(format!("hqmix-src-{name}"))
        .spawn(move || {
            let mut finished = false;
            while running.load(Ordering::Relaxed) && !finished {
                port.recycle_all();
                match port.lock_produce() {
                    Some(mut block) => {
                        block.tag = tone.fill(&mut block.data);
                        finished = block.tag.is_end_of_data();
                        port.unlock_produce(block);
                    }
                    None => thread::sleep(Duration::from_millis(2)),
                }
            }
            debug!(source = name, "producer finished");
            port
        })?;
    Ok(handle)
}

/// Copies sink blocks into the device buffer from the audio callback
struct PlayerFeed {
    sink: SinkReader,
    notifier: SinkPullNotifier,
    stereo: Vec<f32>,
    pos: usize,
}

impl PlayerFeed {
    fn new(sink: SinkReader, notifier: SinkPullNotifier) -> Self {
        let block_size = match &sink {
            SinkReader::S16(r) => r.block_size(),
            SinkReader::F32(r) => r.block_size(),
        };
        let stereo = vec![0.0; block_size * 2];
        let pos = stereo.len();
        Self {
            sink,
            notifier,
            stereo,
            pos,
        }
    }

    /// Pull the next sink block, false on underrun
    fn next_block(&mut self) -> bool {
        let pulled = match &mut self.sink {
            SinkReader::F32(reader) => pull_block(reader, &mut self.stereo, |s| s),
            SinkReader::S16(reader) => pull_block(reader, &mut self.stereo, |s| s as f32 / 32768.0),
        };
        if pulled {
            self.pos = 0;
            self.notifier.notify();
        }
        pulled
    }

    fn render(&mut self, data: &mut [f32], channels: usize) {
        for frame in data.chunks_mut(channels) {
            if self.pos >= self.stereo.len() && !self.next_block() {
                frame.fill(0.0);
                continue;
            }
            let (left, right) = (self.stereo[self.pos], self.stereo[self.pos + 1]);
            self.pos += 2;

            match frame {
                [mono] => *mono = (left + right) * 0.5,
                [l, r, rest @ ..] => {
                    *l = left;
                    *r = right;
                    rest.fill(0.0);
                }
                [] => {}
            }
        }
    }
}

fn pull_block<S: Copy>(
    reader: &mut BlockReader<S>,
    out: &mut [f32],
    convert: impl Fn(S) -> f32,
) -> bool {
    let Some(block) = reader.lock_read(0) else {
        return false;
    };
    for (dst, &src) in out.iter_mut().zip(block.data.iter()) {
        *dst = convert(src);
    }
    if reader.unlock_read(block).is_err() {
        error!("sink block could not be returned");
    }
    true
}

/// Peak of every pending capture block
fn drain_capture(capture: &mut BlockReader<f32>) -> Option<f32> {
    let mut peak = None;
    while let Some(block) = capture.lock_read(0) {
        let block_peak = block.data.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        peak = Some(peak.map_or(block_peak, |p: f32| p.max(block_peak)));
        if capture.unlock_read(block).is_err() {
            warn!("capture block could not be returned");
        }
    }
    peak
}

fn log_events(events: &Receiver<SourceEvent>) {
    for event in events.try_iter() {
        match event {
            SourceEvent::Started(name, cause) => info!(source = name, ?cause, "mixing started"),
            SourceEvent::Stopped(name, cause) => info!(source = name, ?cause, "mixing stopped"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = MixerConfig::load();
    info!(
        rate = config.sampling_rate,
        block = config.block_size,
        format = %config.sink_format,
        eq = %config.equalizer_mode,
        "mixer configuration"
    );

    // Equalizer: control half shared with the service, render half to the mixer
    let (equalizer, eq_processor) = config.equalizer()?;
    let equalizer = Arc::new(Mutex::new(equalizer));
    let eq_control: SharedEffect = equalizer.clone();
    let mut eq_service = EqualizerService::start(equalizer)?;
    let eq = eq_service.control();

    let setup = config.mixer_args(vec![EffectBinding {
        control: eq_control,
        processor: Box::new(eq_processor),
    }])?;

    let mut mixer = AudioMixer::new();
    mixer.initialize(setup.args)?;
    let mut capture = setup.capture;
    if mixer.is_capture_available() {
        mixer.set_audio_capture_enabled(true)?;
    }

    // Output device
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .context("no audio output device found")?;
    let channels = device.default_output_config()?.channels();
    let stream_config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(config.sampling_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut feed = PlayerFeed::new(setup.sink, mixer.sink_pull_notifier());
    let stream = device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            feed.render(data, channels as usize);
        },
        |err| error!(%err, "audio stream error"),
        None,
    )?;

    mixer.start(false)?;
    stream.play()?;

    // Sources
    let (event_tx, event_rx) = crossbeam_channel::bounded(64);
    let running = Arc::new(AtomicBool::new(true));
    let rate = config.sampling_rate as f32;

    let tones = [
        ("drone", 220.0, 0.25, None, 1u64),
        ("chime", 880.0, 0.2, Some(config.sampling_rate as usize * 3), 2u64),
    ];

    let mut producers = Vec::new();
    let mut sources = Vec::new();
    for (name, frequency, amplitude, remaining, client_id) in tones {
        let pipe = AudioSourceDataPipe::new(config.block_size, config.source_pipe_items)?;
        let port = pipe.acquire_in_port()?;
        let tone = ToneSource {
            frequency,
            amplitude,
            sampling_rate: rate,
            phase: 0.0,
            remaining,
        };
        producers.push(spawn_producer(name, port, tone, running.clone())?);

        let handle = mixer.register_source_client(
            client_id,
            Arc::new(ForwardingClient {
                name,
                events: event_tx.clone(),
            }),
        )?;
        mixer.set_volume(&handle, 0.8, 0.8)?;

        let mut args = AttachSourceArgs::new(handle, pipe.clone());
        args.operation = Operation::Start;
        args.source_no = client_id as u32;
        args.stop_cond = STOP_ON_PLAYBACK_END;
        mixer.attach_or_update_source_pipe(&args)?;

        sources.push((handle, pipe));
    }

    // Request loop
    let started = Instant::now();
    let mut eq_engaged = false;
    let mut last_peak_log = Instant::now();

    while started.elapsed() < RUN_TIME {
        mixer.poll()?;
        log_events(&event_rx);

        if !eq_engaged && started.elapsed() >= Duration::from_secs(2) {
            let presets = eq.number_of_presets()?;
            let preset = presets.saturating_sub(1);
            eq.use_preset(preset)?;
            eq.set_enabled(true)?;
            info!(preset = eq.preset_name(preset)?, "equalizer engaged");
            eq_engaged = true;
        }

        if let Some(reader) = capture.as_mut() {
            if let Some(peak) = drain_capture(reader) {
                if last_peak_log.elapsed() >= Duration::from_secs(1) {
                    debug!(peak, "capture level");
                    last_peak_log = Instant::now();
                }
            }
        }

        thread::sleep(POLL_INTERVAL);
    }

    // Shutdown
    for (handle, pipe) in &sources {
        if let Err(err) = mixer.detach_source_pipe(pipe) {
            warn!(%err, "detach failed");
        }
        mixer.poll()?;
        mixer.unregister_source_client(handle)?;
    }
    mixer.stop()?;
    drop(stream);
    log_events(&event_rx);

    running.store(false, Ordering::Relaxed);
    for ((_, pipe), producer) in sources.iter().zip(producers) {
        match producer.join() {
            Ok(port) => pipe.release_in_port(port)?,
            Err(_) => error!("producer thread panicked"),
        }
    }

    let props = eq.properties()?;
    info!(preset = props.cur_preset, levels = ?props.band_levels, "final equalizer state");
    eq_service.shutdown();

    Ok(())
}
