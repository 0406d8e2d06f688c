//! Message-driven front end for the equalizer
//!
//! A handler thread owns the control state (current preset, active client)
//! and serializes every operation. Callers hold [`EqualizerControl`]
//! handles, post one message per call and block on its reply channel.
//! Only the most recently created handle may change settings; the others
//! get [`MixerError::ControlLost`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{MixerError, Result};

use super::presets::{self, num_presets};
use super::{HQEqualizer, MAX_BAND_LEVEL_MILLIBEL, MIN_BAND_LEVEL_MILLIBEL, NUM_BANDS, UNDEFINED};

/// Preset selection plus band levels, read or written in one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EqualizerProperties {
    /// Preset index or [`UNDEFINED`] for custom levels
    pub cur_preset: u16,
    pub band_levels: [i16; NUM_BANDS],
}

type Reply<T> = Sender<Result<T>>;

enum Message {
    SetEnabled(bool, Reply<()>),
    GetEnabled(Reply<bool>),
    HasControl(Reply<bool>),
    GetBand(u32, Reply<u16>),
    GetBandFreqRange(u16, Reply<(u32, u32)>),
    GetBandLevel(u16, Reply<i16>),
    SetBandLevel(u16, i16, Reply<()>),
    GetBandLevelRange(Reply<(i16, i16)>),
    GetCenterFreq(u16, Reply<u32>),
    GetNumberOfBands(Reply<u16>),
    GetCurrentPreset(Reply<u16>),
    UsePreset(u16, Reply<()>),
    GetNumberOfPresets(Reply<u16>),
    GetPresetName(u16, Reply<&'static str>),
    GetProperties(Reply<EqualizerProperties>),
    SetProperties(EqualizerProperties, Reply<()>),
    Shutdown,
}

struct Envelope {
    client: u64,
    message: Message,
}

/// Owns the handler thread. Dropping it shuts the thread down.
pub struct EqualizerService {
    tx: Sender<Envelope>,
    active_client: Arc<AtomicU64>,
    next_client: AtomicU64,
    handle: Option<JoinHandle<()>>,
}

impl EqualizerService {
    /// Load the first preset into `equalizer` and start the handler thread
    pub fn start(equalizer: Arc<Mutex<HQEqualizer>>) -> Result<Self> {
        if let Some(preset) = presets::preset(0) {
            equalizer.lock().set_all_band_level(&preset.band_level)?;
        }

        let (tx, rx) = unbounded();
        let active_client = Arc::new(AtomicU64::new(0));

        let handler = MessageHandler {
            equalizer,
            active_client: Arc::clone(&active_client),
            current_preset: 0,
        };

        let handle = thread::Builder::new()
            .name("hqmix-eq".into())
            .spawn(move || handler.run(rx))
            .map_err(|e| {
                warn!(error = %e, "failed to spawn equalizer handler thread");
                MixerError::InternalError
            })?;

        debug!("equalizer service started");

        Ok(Self {
            tx,
            active_client,
            next_client: AtomicU64::new(1),
            handle: Some(handle),
        })
    }

    /// Create a handle. It becomes the one in control.
    pub fn control(&self) -> EqualizerControl {
        let client = self.next_client.fetch_add(1, Ordering::Relaxed);
        self.active_client.store(client, Ordering::Release);
        EqualizerControl {
            client,
            tx: self.tx.clone(),
        }
    }

    /// Stop the handler thread and disable the equalizer. Later calls on
    /// any handle fail with [`MixerError::DeadObject`].
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.tx.send(Envelope {
            client: 0,
            message: Message::Shutdown,
        });
        if handle.join().is_err() {
            warn!("equalizer handler thread panicked");
        }
        debug!("equalizer service stopped");
    }
}

impl Drop for EqualizerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Caller-side handle to the equalizer service
#[derive(Clone)]
pub struct EqualizerControl {
    client: u64,
    tx: Sender<Envelope>,
}

impl EqualizerControl {
    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Message) -> Result<T> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(Envelope {
                client: self.client,
                message: make(reply_tx),
            })
            .map_err(|_| MixerError::DeadObject)?;
        reply_rx.recv().map_err(|_| MixerError::DeadObject)?
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.call(|r| Message::SetEnabled(enabled, r))
    }

    pub fn enabled(&self) -> Result<bool> {
        self.call(Message::GetEnabled)
    }

    pub fn has_control(&self) -> Result<bool> {
        self.call(Message::HasControl)
    }

    /// Band containing `frequency` (mHz), or [`UNDEFINED`]
    pub fn band(&self, frequency: u32) -> Result<u16> {
        self.call(|r| Message::GetBand(frequency, r))
    }

    pub fn band_freq_range(&self, band: u16) -> Result<(u32, u32)> {
        self.call(|r| Message::GetBandFreqRange(band, r))
    }

    pub fn band_level(&self, band: u16) -> Result<i16> {
        self.call(|r| Message::GetBandLevel(band, r))
    }

    pub fn set_band_level(&self, band: u16, level: i16) -> Result<()> {
        self.call(|r| Message::SetBandLevel(band, level, r))
    }

    pub fn band_level_range(&self) -> Result<(i16, i16)> {
        self.call(Message::GetBandLevelRange)
    }

    pub fn center_freq(&self, band: u16) -> Result<u32> {
        self.call(|r| Message::GetCenterFreq(band, r))
    }

    pub fn number_of_bands(&self) -> Result<u16> {
        self.call(Message::GetNumberOfBands)
    }

    pub fn current_preset(&self) -> Result<u16> {
        self.call(Message::GetCurrentPreset)
    }

    pub fn use_preset(&self, preset: u16) -> Result<()> {
        if preset >= num_presets() {
            return Err(MixerError::IllegalArgument);
        }
        self.call(|r| Message::UsePreset(preset, r))
    }

    pub fn number_of_presets(&self) -> Result<u16> {
        self.call(Message::GetNumberOfPresets)
    }

    pub fn preset_name(&self, preset: u16) -> Result<&'static str> {
        self.call(|r| Message::GetPresetName(preset, r))
    }

    pub fn properties(&self) -> Result<EqualizerProperties> {
        self.call(Message::GetProperties)
    }

    pub fn set_properties(&self, props: &EqualizerProperties) -> Result<()> {
        if props.cur_preset >= num_presets() && props.cur_preset != UNDEFINED {
            return Err(MixerError::IllegalArgument);
        }
        if !props
            .band_levels
            .iter()
            .all(|l| (MIN_BAND_LEVEL_MILLIBEL..=MAX_BAND_LEVEL_MILLIBEL).contains(l))
        {
            return Err(MixerError::IllegalArgument);
        }
        let props = *props;
        self.call(|r| Message::SetProperties(props, r))
    }
}

struct MessageHandler {
    equalizer: Arc<Mutex<HQEqualizer>>,
    active_client: Arc<AtomicU64>,
    current_preset: u16,
}

fn reply<T>(tx: Reply<T>, result: Result<T>) {
    // the caller may have given up waiting
    let _ = tx.send(result);
}

impl MessageHandler {
    fn run(mut self, rx: Receiver<Envelope>) {
        while let Ok(envelope) = rx.recv() {
            if matches!(envelope.message, Message::Shutdown) {
                break;
            }
            self.handle(envelope.client, envelope.message);
        }

        if let Err(e) = self.equalizer.lock().set_enabled(false) {
            warn!(error = %e, "failed to disable equalizer on shutdown");
        }
    }

    fn is_active(&self, client: u64) -> bool {
        self.active_client.load(Ordering::Acquire) == client
    }

    fn check_active(&self, client: u64) -> Result<()> {
        if self.is_active(client) {
            Ok(())
        } else {
            Err(MixerError::ControlLost)
        }
    }

    fn handle(&mut self, client: u64, message: Message) {
        match message {
            Message::SetEnabled(enabled, r) => {
                let result = self
                    .check_active(client)
                    .and_then(|()| self.equalizer.lock().set_enabled(enabled));
                reply(r, result);
            }
            Message::GetEnabled(r) => reply(r, Ok(self.equalizer.lock().enabled())),
            Message::HasControl(r) => reply(r, Ok(self.is_active(client))),
            Message::GetBand(frequency, r) => {
                reply(r, Ok(self.equalizer.lock().band_for_frequency(frequency)))
            }
            Message::GetBandFreqRange(band, r) => reply(r, self.equalizer.lock().band_freq_range(band)),
            Message::GetBandLevel(band, r) => reply(r, self.equalizer.lock().band_level(band)),
            Message::SetBandLevel(band, level, r) => reply(r, self.set_band_level(client, band, level)),
            Message::GetBandLevelRange(r) => reply(r, Ok(self.equalizer.lock().band_level_range())),
            Message::GetCenterFreq(band, r) => reply(r, self.equalizer.lock().center_freq(band)),
            Message::GetNumberOfBands(r) => reply(r, Ok(self.equalizer.lock().number_of_bands())),
            Message::GetCurrentPreset(r) => reply(r, Ok(self.current_preset)),
            Message::UsePreset(preset, r) => reply(r, self.use_preset(client, preset)),
            Message::GetNumberOfPresets(r) => reply(r, Ok(num_presets())),
            Message::GetPresetName(preset, r) => reply(
                r,
                presets::preset(preset)
                    .map(|p| p.name)
                    .ok_or(MixerError::IllegalArgument),
            ),
            Message::GetProperties(r) => reply(
                r,
                Ok(EqualizerProperties {
                    cur_preset: self.current_preset,
                    band_levels: self.equalizer.lock().all_band_level(),
                }),
            ),
            Message::SetProperties(props, r) => reply(r, self.set_properties(client, &props)),
            Message::Shutdown => {}
        }
    }

    fn set_band_level(&mut self, client: u64, band: u16, level: i16) -> Result<()> {
        self.check_active(client)?;
        let mut equalizer = self.equalizer.lock();
        if equalizer.band_level(band)? != level {
            equalizer.set_band_level(band, level)?;
            self.current_preset = UNDEFINED;
        }
        Ok(())
    }

    fn use_preset(&mut self, client: u64, preset_no: u16) -> Result<()> {
        self.check_active(client)?;
        let preset = presets::preset(preset_no).ok_or(MixerError::IllegalArgument)?;
        self.equalizer.lock().set_all_band_level(&preset.band_level)?;
        self.current_preset = preset_no;
        Ok(())
    }

    fn set_properties(&mut self, client: u64, props: &EqualizerProperties) -> Result<()> {
        self.check_active(client)?;
        match presets::preset(props.cur_preset) {
            Some(preset) if props.cur_preset != UNDEFINED => {
                self.equalizer.lock().set_all_band_level(&preset.band_level)?;
                self.current_preset = props.cur_preset;
            }
            _ => {
                self.equalizer.lock().set_all_band_level(&props.band_levels)?;
                self.current_preset = UNDEFINED;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::equalizer::{EqualizerMode, HQEqualizerProcessor};

    fn start() -> (EqualizerService, Arc<Mutex<HQEqualizer>>, HQEqualizerProcessor) {
        let (eq, proc) = HQEqualizer::new(48000, 256, EqualizerMode::FlatGain).unwrap();
        let eq = Arc::new(Mutex::new(eq));
        let service = EqualizerService::start(Arc::clone(&eq)).unwrap();
        (service, eq, proc)
    }

    #[test]
    fn test_starts_with_first_preset() {
        let (service, _eq, _proc) = start();
        let control = service.control();

        assert_eq!(control.current_preset(), Ok(0));
        assert_eq!(control.preset_name(0), Ok("Normal"));
        assert_eq!(
            control.properties().unwrap().band_levels,
            presets::PRESETS[0].band_level
        );
        assert_eq!(control.number_of_presets(), Ok(10));
        assert_eq!(control.number_of_bands(), Ok(10));
        assert_eq!(control.band_level_range(), Ok((-1500, 1500)));
        assert_eq!(control.center_freq(5), Ok(1_000_000));
        assert_eq!(control.band(1_000_000), Ok(5));
        assert_eq!(control.band_freq_range(0), Ok((22_097, 44_193)));
        assert_eq!(control.preset_name(10), Err(MixerError::IllegalArgument));
    }

    #[test]
    fn test_band_level_change_clears_preset() {
        let (service, eq, _proc) = start();
        let control = service.control();

        // same level as the preset keeps it selected
        control.set_band_level(0, 300).unwrap();
        assert_eq!(control.current_preset(), Ok(0));

        control.set_band_level(0, -500).unwrap();
        assert_eq!(control.current_preset(), Ok(UNDEFINED));
        assert_eq!(control.band_level(0), Ok(-500));
        assert_eq!(eq.lock().band_level(0), Ok(-500));

        control.use_preset(9).unwrap();
        assert_eq!(control.current_preset(), Ok(9));
        assert_eq!(control.band_level(1), Ok(500));
        assert_eq!(control.use_preset(10), Err(MixerError::IllegalArgument));
        assert_eq!(control.set_band_level(10, 0), Err(MixerError::IllegalArgument));
    }

    #[test]
    fn test_newest_handle_takes_control() {
        let (service, _eq, _proc) = start();
        let first = service.control();
        assert_eq!(first.has_control(), Ok(true));

        let second = service.control();
        assert_eq!(first.has_control(), Ok(false));
        assert_eq!(second.has_control(), Ok(true));

        assert_eq!(first.set_enabled(true), Err(MixerError::ControlLost));
        assert_eq!(first.set_band_level(0, 100), Err(MixerError::ControlLost));
        assert_eq!(first.use_preset(1), Err(MixerError::ControlLost));
        assert_eq!(first.enabled(), Ok(false));

        second.set_enabled(true).unwrap();
        assert_eq!(first.enabled(), Ok(true));
    }

    #[test]
    fn test_set_properties() {
        let (service, _eq, _proc) = start();
        let control = service.control();

        let custom = EqualizerProperties {
            cur_preset: UNDEFINED,
            band_levels: [100, 200, 300, 400, 500, 600, 700, 800, 900, 1000],
        };
        control.set_properties(&custom).unwrap();
        assert_eq!(control.properties(), Ok(custom));

        let preset = EqualizerProperties {
            cur_preset: 3,
            band_levels: [1500; NUM_BANDS],
        };
        control.set_properties(&preset).unwrap();
        assert_eq!(
            control.properties(),
            Ok(EqualizerProperties {
                cur_preset: 3,
                band_levels: [0; NUM_BANDS],
            })
        );

        let out_of_range = EqualizerProperties {
            cur_preset: UNDEFINED,
            band_levels: [2000; NUM_BANDS],
        };
        assert_eq!(control.set_properties(&out_of_range), Err(MixerError::IllegalArgument));
    }

    #[test]
    fn test_dead_after_shutdown() {
        let (mut service, eq, _proc) = start();
        let control = service.control();
        control.set_enabled(true).unwrap();
        assert!(eq.lock().enabled());

        service.shutdown();
        assert!(!eq.lock().enabled());
        assert_eq!(control.enabled(), Err(MixerError::DeadObject));
        assert_eq!(control.set_band_level(0, 0), Err(MixerError::DeadObject));
    }
}
