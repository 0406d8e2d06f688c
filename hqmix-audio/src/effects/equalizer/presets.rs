//! Built-in band level presets (millibel)

use super::NUM_BANDS;

pub struct Preset {
    pub name: &'static str,
    pub band_level: [i16; NUM_BANDS],
}

pub const PRESETS: &[Preset] = &[
    Preset {
        name: "Normal",
        band_level: [300, 300, 200, 0, 0, 0, 0, 100, 300, 300],
    },
    Preset {
        name: "Classical",
        band_level: [0, 0, 0, 0, 0, 0, -100, -100, -200, -300],
    },
    Preset {
        name: "Dance",
        band_level: [500, 400, 300, 0, 0, -100, 0, 100, 100, 100],
    },
    Preset {
        name: "Flat",
        band_level: [0; NUM_BANDS],
    },
    Preset {
        name: "Folk",
        band_level: [200, 300, 300, 100, 0, 0, 0, 200, -100, -100],
    },
    Preset {
        name: "Heavy Metal",
        band_level: [400, 400, 200, 100, 0, 300, 500, 100, 200, 400],
    },
    Preset {
        name: "Hip Hop",
        band_level: [400, 500, 400, 300, 0, 0, 100, 100, 200, 300],
    },
    Preset {
        name: "Jazz",
        band_level: [300, 400, 400, 200, 0, -200, 0, 200, 300, 500],
    },
    Preset {
        name: "Pop",
        band_level: [-100, -100, 0, 200, 300, 500, 200, 100, -100, -200],
    },
    Preset {
        name: "Rock",
        band_level: [400, 500, 400, 300, 0, -100, 0, 300, 400, 500],
    },
];

pub fn num_presets() -> u16 {
    PRESETS.len() as u16
}

pub fn preset(preset_no: u16) -> Option<&'static Preset> {
    PRESETS.get(preset_no as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::equalizer::{MAX_BAND_LEVEL_MILLIBEL, MIN_BAND_LEVEL_MILLIBEL};

    #[test]
    fn test_lookup() {
        assert_eq!(num_presets(), 10);
        assert_eq!(preset(3).map(|p| p.name), Some("Flat"));
        assert_eq!(preset(9).map(|p| p.name), Some("Rock"));
        assert!(preset(10).is_none());
    }

    #[test]
    fn test_levels_within_range() {
        for p in PRESETS {
            assert!(p
                .band_level
                .iter()
                .all(|l| (MIN_BAND_LEVEL_MILLIBEL..=MAX_BAND_LEVEL_MILLIBEL).contains(l)));
        }
    }
}
