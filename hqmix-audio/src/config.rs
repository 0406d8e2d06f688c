//! Mixer configuration persistence
//!
//! Plain key=value file in the user config directory. Missing keys and
//! values that fail to parse keep their defaults.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::warn;

use crate::effects::equalizer::{EqualizerMode, HQEqualizer, HQEqualizerProcessor};
use crate::effects::EffectBinding;
use crate::error::{MixerError, Result};
use crate::mixer::{MixerInitArgs, SinkWriter};
use crate::pipe::{block_pipe, BlockReader};

/// Sample format of the sink pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkFormat {
    S16,
    #[default]
    F32,
}

impl SinkFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            SinkFormat::S16 => "s16",
            SinkFormat::F32 => "f32",
        }
    }
}

impl fmt::Display for SinkFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SinkFormat {
    type Err = MixerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s16" => Ok(SinkFormat::S16),
            "f32" => Ok(SinkFormat::F32),
            _ => Err(MixerError::IllegalArgument),
        }
    }
}

/// Player side of the sink pipe
pub enum SinkReader {
    S16(BlockReader<i16>),
    F32(BlockReader<f32>),
}

/// Everything [`MixerConfig::mixer_args`] builds: the mixer's arguments
/// plus the reader ends of its output pipes
pub struct MixerSetup {
    pub args: MixerInitArgs,
    pub sink: SinkReader,
    pub capture: Option<BlockReader<f32>>,
}

/// Mixer configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MixerConfig {
    /// Hz
    pub sampling_rate: u32,
    /// Frames per block
    pub block_size: usize,
    pub sink_format: SinkFormat,
    pub sink_pipe_items: usize,
    /// Blocks the platform player keeps queued
    pub num_player_blocks: usize,
    pub source_pipe_items: usize,
    /// 0 disables capture
    pub capture_pipe_items: usize,
    pub short_fade_ms: u32,
    pub long_fade_ms: u32,
    pub equalizer_mode: EqualizerMode,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 48000,
            block_size: 512,
            sink_format: SinkFormat::F32,
            sink_pipe_items: 4,
            num_player_blocks: 2,
            source_pipe_items: 8,
            capture_pipe_items: 4,
            short_fade_ms: 50,
            long_fade_ms: 1000,
            equalizer_mode: EqualizerMode::FlatGain,
        }
    }
}

fn parse_into<T: FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.parse() {
        Ok(v) => *slot = v,
        Err(_) => warn!(key, value, "ignoring unparsable config value"),
    }
}

impl MixerConfig {
    /// Load config from the default location
    ///
    /// Returns default config if the file doesn't exist or can't be read.
    pub fn load() -> Self {
        Self::load_from(&Self::config_path()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn save(&self) -> io::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize())
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hqmix")
            .join("mixer.conf")
    }

    fn parse(content: &str) -> Self {
        let mut config = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "sampling_rate" => parse_into(key, value, &mut config.sampling_rate),
                "block_size" => parse_into(key, value, &mut config.block_size),
                "sink_format" => parse_into(key, value, &mut config.sink_format),
                "sink_pipe_items" => parse_into(key, value, &mut config.sink_pipe_items),
                "num_player_blocks" => parse_into(key, value, &mut config.num_player_blocks),
                "source_pipe_items" => parse_into(key, value, &mut config.source_pipe_items),
                "capture_pipe_items" => parse_into(key, value, &mut config.capture_pipe_items),
                "short_fade_ms" => parse_into(key, value, &mut config.short_fade_ms),
                "long_fade_ms" => parse_into(key, value, &mut config.long_fade_ms),
                "equalizer_mode" => parse_into(key, value, &mut config.equalizer_mode),
                _ => {} // Ignore unknown keys
            }
        }

        config
    }

    fn serialize(&self) -> String {
        [
            "# hqmix mixer configuration".to_string(),
            format!("sampling_rate={}", self.sampling_rate),
            format!("block_size={}", self.block_size),
            format!("sink_format={}", self.sink_format),
            format!("sink_pipe_items={}", self.sink_pipe_items),
            format!("num_player_blocks={}", self.num_player_blocks),
            format!("source_pipe_items={}", self.source_pipe_items),
            format!("capture_pipe_items={}", self.capture_pipe_items),
            format!("short_fade_ms={}", self.short_fade_ms),
            format!("long_fade_ms={}", self.long_fade_ms),
            format!("equalizer_mode={}", self.equalizer_mode),
        ]
        .join("\n")
    }

    /// Build the sink and capture pipes and the mixer arguments around them
    pub fn mixer_args(&self, effects: Vec<EffectBinding>) -> Result<MixerSetup> {
        let (sink_writer, sink) = match self.sink_format {
            SinkFormat::S16 => {
                let (w, r) = block_pipe::<i16>(self.block_size, self.sink_pipe_items)?;
                (SinkWriter::S16(w), SinkReader::S16(r))
            }
            SinkFormat::F32 => {
                let (w, r) = block_pipe::<f32>(self.block_size, self.sink_pipe_items)?;
                (SinkWriter::F32(w), SinkReader::F32(r))
            }
        };

        let (capture_writer, capture) = if self.capture_pipe_items > 0 {
            let (w, r) = block_pipe::<f32>(self.block_size, self.capture_pipe_items)?;
            (Some(w), Some(r))
        } else {
            (None, None)
        };

        Ok(MixerSetup {
            args: MixerInitArgs {
                sampling_rate: self.sampling_rate,
                block_size: self.block_size,
                sink: sink_writer,
                capture: capture_writer,
                num_sink_player_blocks: self.num_player_blocks,
                short_fade_duration_ms: self.short_fade_ms,
                long_fade_duration_ms: self.long_fade_ms,
                effects,
            },
            sink,
            capture,
        })
    }

    /// Both halves of an equalizer matching this configuration
    pub fn equalizer(&self) -> Result<(HQEqualizer, HQEqualizerProcessor)> {
        HQEqualizer::new(self.sampling_rate, self.block_size, self.equalizer_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        assert_eq!(MixerConfig::parse(""), MixerConfig::default());
    }

    #[test]
    fn test_parse_values() {
        let content = "# Comment\nsampling_rate = 44100\nblock_size=256\nsink_format=s16\n\
                       capture_pipe_items=0\nequalizer_mode=peaking\nunknown=1";
        let config = MixerConfig::parse(content);
        assert_eq!(config.sampling_rate, 44100);
        assert_eq!(config.block_size, 256);
        assert_eq!(config.sink_format, SinkFormat::S16);
        assert_eq!(config.capture_pipe_items, 0);
        assert_eq!(config.equalizer_mode, EqualizerMode::Peaking);
        assert_eq!(config.long_fade_ms, 1000);
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let config = MixerConfig::parse("block_size=big\nsink_format=u8\nshort_fade_ms=-5\nnot a pair");
        assert_eq!(config, MixerConfig::default());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = MixerConfig {
            sampling_rate: 96000,
            sink_format: SinkFormat::S16,
            equalizer_mode: EqualizerMode::Peaking,
            ..MixerConfig::default()
        };
        assert_eq!(MixerConfig::parse(&config.serialize()), config);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir()
            .join(format!("hqmix-config-test-{}", std::process::id()))
            .join("mixer.conf");
        let config = MixerConfig {
            block_size: 1024,
            ..MixerConfig::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(MixerConfig::load_from(&path).unwrap(), config);
        let _ = fs::remove_dir_all(path.parent().unwrap());

        assert!(MixerConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_mixer_args() {
        let config = MixerConfig {
            capture_pipe_items: 0,
            sink_format: SinkFormat::S16,
            ..MixerConfig::default()
        };
        let setup = config.mixer_args(Vec::new()).unwrap();
        assert_eq!(setup.args.block_size, 512);
        assert_eq!(setup.args.num_sink_player_blocks, 2);
        assert!(setup.args.capture.is_none());
        assert!(setup.capture.is_none());
        assert!(matches!(setup.sink, SinkReader::S16(ref r) if r.num_items() == 4));

        let bad = MixerConfig {
            block_size: 0,
            ..MixerConfig::default()
        };
        assert!(bad.mixer_args(Vec::new()).is_err());
    }
}
