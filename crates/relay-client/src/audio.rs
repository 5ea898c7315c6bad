//! Broadcast audio knobs.
//!
//! These are handed to the capture pipeline unchanged. Nothing here is seen
//! by the relay.

use crate::errors::ClientError;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MAX_VOLUME_PERCENT: u16 = 200;
pub const MAX_GAIN_PERCENT: u16 = 200;
pub const DEFAULT_VOLUME_PERCENT: u16 = 100;
pub const DEFAULT_GAIN_PERCENT: u16 = 150;

/// Meter level (0-100) above which the signal counts as clipping.
pub const CLIP_THRESHOLD: f32 = 85.0;

/// Analyser FFT size used for level metering.
pub const METER_FFT_SIZE: usize = 2048;
pub const METER_SMOOTHING: f32 = 0.8;

/// Dynamics compressor used as a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    pub threshold_db: f32,
    pub knee_db: f32,
    pub ratio: f32,
    pub attack: Duration,
    pub release: Duration,
}

pub const LIMITER: LimiterSettings = LimiterSettings {
    threshold_db: -10.0,
    knee_db: 40.0,
    ratio: 12.0,
    attack: Duration::from_millis(3),
    release: Duration::from_millis(250),
};

/// Microphone capture constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: false,
        }
    }
}

/// User-facing audio knobs for one broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSettings {
    volume: u16,
    gain: u16,
    limiter_enabled: bool,
    normalizer_enabled: bool,
    muted: bool,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            volume: DEFAULT_VOLUME_PERCENT,
            gain: DEFAULT_GAIN_PERCENT,
            limiter_enabled: true,
            normalizer_enabled: true,
            muted: false,
        }
    }
}

impl AudioSettings {
    #[must_use]
    pub fn volume(&self) -> u16 {
        self.volume
    }

    #[must_use]
    pub fn gain(&self) -> u16 {
        self.gain
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    #[must_use]
    pub fn limiter_enabled(&self) -> bool {
        self.limiter_enabled
    }

    #[must_use]
    pub fn normalizer_enabled(&self) -> bool {
        self.normalizer_enabled
    }

    /// Volume in percent, `0..=200`.
    ///
    /// # Errors
    ///
    /// `InvalidSetting` above 200.
    pub fn set_volume(&mut self, percent: u16) -> Result<(), ClientError> {
        self.volume = check_percent("volume", percent, MAX_VOLUME_PERCENT)?;
        Ok(())
    }

    /// Gain in percent, `0..=200`.
    ///
    /// # Errors
    ///
    /// `InvalidSetting` above 200.
    pub fn set_gain(&mut self, percent: u16) -> Result<(), ClientError> {
        self.gain = check_percent("gain", percent, MAX_GAIN_PERCENT)?;
        Ok(())
    }

    pub fn set_limiter(&mut self, enabled: bool) {
        self.limiter_enabled = enabled;
    }

    pub fn set_normalizer(&mut self, enabled: bool) {
        self.normalizer_enabled = enabled;
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// Flip mute and return the new state.
    pub fn toggle_mute(&mut self) -> bool {
        self.muted = !self.muted;
        self.muted
    }

    /// Linear gain applied to the capture, `0.0..=4.0`.
    #[must_use]
    pub fn effective_gain(&self) -> f32 {
        if self.muted {
            return 0.0;
        }
        f32::from(self.volume) * f32::from(self.gain) / 10_000.0
    }

    /// Limiter to insert after the gain stage, if enabled.
    #[must_use]
    pub fn limiter(&self) -> Option<LimiterSettings> {
        self.limiter_enabled.then_some(LIMITER)
    }
}

fn check_percent(name: &str, percent: u16, max: u16) -> Result<u16, ClientError> {
    if percent > max {
        return Err(ClientError::InvalidSetting(format!(
            "{name} must be between 0 and {max}, got {percent}"
        )));
    }
    Ok(percent)
}

/// One level meter sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelReading {
    /// `0.0..=100.0`.
    pub level: f32,
    pub clipping: bool,
}

/// RMS of analyser bins scaled to 0-100. Muted input reads as silence.
#[must_use]
pub fn meter_level(bins: &[u8], muted: bool) -> LevelReading {
    if muted || bins.is_empty() {
        return LevelReading {
            level: 0.0,
            clipping: false,
        };
    }
    let sum: f64 = bins.iter().map(|&b| f64::from(b) * f64::from(b)).sum();
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let level = ((sum / bins.len() as f64).sqrt() / 255.0 * 100.0) as f32;
    LevelReading {
        level,
        clipping: level > CLIP_THRESHOLD,
    }
}
