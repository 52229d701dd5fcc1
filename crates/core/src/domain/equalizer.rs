//! Equalizer bands and presets
//!
//! The equalizer is a fixed set of ten bands. The first band is a low shelf,
//! the last a high shelf, everything in between a peaking filter.

use crate::domain::audio::{FilterInfo, FilterKind};
use crate::domain::dsp::params;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Canonical band frequencies in Hz
pub const CANONICAL_FREQUENCIES: [f32; 10] = [
    60.0, 170.0, 310.0, 600.0, 1000.0, 3000.0, 6000.0, 12000.0, 14000.0, 16000.0,
];

/// Number of bands in the canonical equalizer
pub const BAND_COUNT: usize = CANONICAL_FREQUENCIES.len();

/// Q of interior (peaking) bands
pub const PEAKING_Q: f32 = 1.4;

/// Slope used by the shelf bands
pub const SHELF_Q: f32 = 0.707;

/// Stand-in for a band frequency that is not a positive finite number
const FALLBACK_FREQUENCY: f32 = 1000.0;

/// One equalizer band
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqualizerBand {
    /// Center/corner frequency in Hz
    pub frequency: f32,
    /// Gain in dB, [-12, +12]
    pub gain: f32,
}

impl EqualizerBand {
    pub fn new(frequency: f32, gain: f32) -> Self {
        Self {
            frequency: sanitize_frequency(frequency),
            gain: clamp_gain(gain),
        }
    }

    /// Ten flat bands at the canonical frequencies
    pub fn flat() -> Vec<Self> {
        Self::from_gains(&[0.0; BAND_COUNT])
    }

    /// Bands at the canonical frequencies with the given gains
    ///
    /// Extra gains are ignored; missing ones are flat.
    pub fn from_gains(gains: &[f32]) -> Vec<Self> {
        CANONICAL_FREQUENCIES
            .iter()
            .enumerate()
            .map(|(i, &freq)| Self::new(freq, gains.get(i).copied().unwrap_or(0.0)))
            .collect()
    }

    /// Gain the band's filter should carry
    pub fn effective_gain(&self, enabled: bool) -> f32 {
        if enabled {
            self.gain
        } else {
            0.0
        }
    }
}

fn sanitize_frequency(frequency: f32) -> f32 {
    if frequency.is_finite() && frequency > 0.0 {
        frequency
    } else {
        FALLBACK_FREQUENCY
    }
}

fn clamp_gain(gain: f32) -> f32 {
    if gain.is_finite() {
        gain.clamp(params::EQ_GAIN_MIN, params::EQ_GAIN_MAX)
    } else {
        0.0
    }
}

/// Filter response for the band at `index` in a chain of `count` bands
pub fn filter_kind_for(index: usize, count: usize) -> FilterKind {
    match index {
        _ if count <= 1 => FilterKind::Peaking,
        0 => FilterKind::LowShelf,
        i if i + 1 == count => FilterKind::HighShelf,
        _ => FilterKind::Peaking,
    }
}

/// Full filter description for one band of a chain
pub fn filter_info_for(index: usize, count: usize, band: &EqualizerBand, enabled: bool) -> FilterInfo {
    let kind = filter_kind_for(index, count);
    FilterInfo {
        kind,
        frequency: band.frequency,
        q: match kind {
            FilterKind::Peaking => PEAKING_Q,
            FilterKind::LowShelf | FilterKind::HighShelf => SHELF_Q,
        },
        gain_db: band.effective_gain(enabled),
    }
}

/// Named equalizer presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EqPreset {
    Flat,
    BassBoost,
    TrebleBoost,
    Vocal,
    Electronic,
    Rock,
    Acoustic,
}

/// Error for a preset name that is not recognized
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown equalizer preset: {0}")]
pub struct UnknownPreset(pub String);

impl EqPreset {
    pub const ALL: [EqPreset; 7] = [
        EqPreset::Flat,
        EqPreset::BassBoost,
        EqPreset::TrebleBoost,
        EqPreset::Vocal,
        EqPreset::Electronic,
        EqPreset::Rock,
        EqPreset::Acoustic,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EqPreset::Flat => "flat",
            EqPreset::BassBoost => "bass-boost",
            EqPreset::TrebleBoost => "treble-boost",
            EqPreset::Vocal => "vocal",
            EqPreset::Electronic => "electronic",
            EqPreset::Rock => "rock",
            EqPreset::Acoustic => "acoustic",
        }
    }

    /// Band gains in dB, lowest band first
    pub fn gains(&self) -> [f32; BAND_COUNT] {
        match self {
            EqPreset::Flat => [0.0; BAND_COUNT],
            EqPreset::BassBoost => [7.0, 6.0, 4.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            EqPreset::TrebleBoost => [0.0, 0.0, 0.0, 0.0, 0.0, 2.0, 4.0, 5.0, 6.0, 7.0],
            EqPreset::Vocal => [-2.0, -1.0, 0.0, 2.0, 4.0, 4.0, 3.0, 1.0, 0.0, -1.0],
            EqPreset::Electronic => [5.0, 4.0, 1.0, 0.0, -2.0, 2.0, 1.0, 2.0, 4.0, 5.0],
            EqPreset::Rock => [5.0, 4.0, 3.0, 1.0, -1.0, -1.0, 1.0, 3.0, 4.0, 5.0],
            EqPreset::Acoustic => [4.0, 3.0, 2.0, 1.0, 1.0, 1.0, 2.0, 3.0, 3.0, 2.0],
        }
    }

    pub fn bands(&self) -> Vec<EqualizerBand> {
        EqualizerBand::from_gains(&self.gains())
    }
}

impl Default for EqPreset {
    fn default() -> Self {
        EqPreset::Flat
    }
}

impl fmt::Display for EqPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EqPreset {
    type Err = UnknownPreset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        EqPreset::ALL
            .into_iter()
            .find(|preset| preset.name() == wanted)
            .ok_or_else(|| UnknownPreset(s.to_string()))
    }
}
