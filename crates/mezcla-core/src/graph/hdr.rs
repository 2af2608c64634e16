//! Cross-frame compression stage ("HDR" mixing).
//!
//! A bus with an HDR stage tracks a sliding *window top*: the loudest level
//! among its voice inputs, compressed above a threshold. Every voice input is
//! then attenuated by how far the window top sits above the threshold, so
//! loud events duck everything else on the bus while quiet scenes keep their
//! full dynamic range.
//!
//! ```text
//! L = loudest input level (dB)
//! T = threshold + max(0, L - threshold) * (1 - 1/ratio)
//! top = T                            if T > top      (instant attack)
//! top = T + (top - T) * coeff        otherwise      (release)
//! coeff = exp(-frame_size / (release_time * sample_rate))
//! reduction = top - threshold
//! ```
//!
//! `Linear` release runs the smoothing in dB. `Exponential` runs it on linear
//! amplitude, which lingers near the top in dB terms and drops faster as it
//! nears the threshold.
//!
//! The reduction published by frame N is applied to voice connections in
//! frame N + 1.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use libm::expf;

use crate::{SILENCE_DB, db_to_linear, linear_to_db};

/// Release smoothing domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ReleaseMode {
    /// Release in dB.
    #[default]
    Linear,
    /// Release in linear amplitude.
    Exponential,
}

/// Settings of one bus's HDR stage.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HdrSettings {
    /// Level above which the window top starts to rise, in dB.
    pub threshold_db: f32,
    /// Compression ratio (>= 1).
    pub ratio: f32,
    /// Release time constant in seconds.
    pub release_time_s: f32,
    /// Release smoothing domain.
    pub release_mode: ReleaseMode,
    /// Inputs quieter than `top - window_range_db` are muted.
    pub window_range_db: Option<f32>,
}

impl Default for HdrSettings {
    fn default() -> Self {
        Self {
            threshold_db: -12.0,
            ratio: 4.0,
            release_time_s: 0.5,
            release_mode: ReleaseMode::Linear,
            window_range_db: None,
        }
    }
}

/// Persistent state of one bus's HDR stage.
#[derive(Clone, Debug)]
pub struct HdrState {
    settings: HdrSettings,
    coeff: f32,
    // dB for Linear, linear amplitude for Exponential.
    top: f32,
    reduction_db: f32,
}

impl HdrState {
    /// Creates a stage resting at the threshold.
    pub fn new(settings: HdrSettings, frame_size: usize, sample_rate: f32) -> Self {
        let release_samples = (settings.release_time_s * sample_rate).max(1.0);
        let coeff = expf(-(frame_size as f32) / release_samples);
        let top = match settings.release_mode {
            ReleaseMode::Linear => settings.threshold_db,
            ReleaseMode::Exponential => db_to_linear(settings.threshold_db),
        };
        Self {
            settings,
            coeff,
            top,
            reduction_db: 0.0,
        }
    }

    /// Returns the settings.
    pub fn settings(&self) -> &HdrSettings {
        &self.settings
    }

    /// Returns the release coefficient per frame.
    pub fn release_coeff(&self) -> f32 {
        self.coeff
    }

    /// Returns the window top in dB.
    pub fn top_db(&self) -> f32 {
        match self.settings.release_mode {
            ReleaseMode::Linear => self.top,
            ReleaseMode::Exponential => linear_to_db(self.top),
        }
    }

    /// Returns the last published reduction in dB (>= 0).
    pub fn reduction_db(&self) -> f32 {
        self.reduction_db
    }

    /// Level under which inputs are muted, if the window is enabled.
    pub fn window_floor_db(&self) -> Option<f32> {
        self.settings
            .window_range_db
            .map(|range| self.top_db() - range)
    }

    /// Advances one frame with the loudest input level and publishes the new
    /// reduction.
    ///
    /// `None` (no audible input) releases toward the threshold.
    pub fn update(&mut self, loudest_db: Option<f32>) -> f32 {
        let s = &self.settings;
        let level = loudest_db.unwrap_or(SILENCE_DB);
        let over = (level - s.threshold_db).max(0.0);
        let target_db = s.threshold_db + over * (1.0 - 1.0 / s.ratio.max(1.0));

        let target = match s.release_mode {
            ReleaseMode::Linear => target_db,
            ReleaseMode::Exponential => db_to_linear(target_db),
        };
        if target > self.top {
            self.top = target;
        } else {
            self.top = target + (self.top - target) * self.coeff;
        }

        self.reduction_db = (self.top_db() - s.threshold_db).max(0.0);
        self.reduction_db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(mode: ReleaseMode) -> HdrState {
        HdrState::new(
            HdrSettings {
                threshold_db: -20.0,
                ratio: 2.0,
                release_time_s: 0.1,
                release_mode: mode,
                window_range_db: Some(30.0),
            },
            480,
            48000.0,
        )
    }

    #[test]
    fn below_threshold_publishes_no_reduction() {
        let mut hdr = stage(ReleaseMode::Linear);
        assert_eq!(hdr.update(Some(-40.0)), 0.0);
        assert_eq!(hdr.update(None), 0.0);
    }

    #[test]
    fn attack_is_instant() {
        let mut hdr = stage(ReleaseMode::Linear);
        // 10 dB over at 2:1 -> top 5 dB over threshold.
        let r = hdr.update(Some(-10.0));
        assert!((r - 5.0).abs() < 1e-4, "reduction {r}");
        assert!((hdr.top_db() - -15.0).abs() < 1e-4);
    }

    #[test]
    fn linear_release_decays_in_db() {
        let mut hdr = stage(ReleaseMode::Linear);
        hdr.update(Some(-10.0));
        let c = hdr.release_coeff();
        let r = hdr.update(None);
        assert!((r - 5.0 * c).abs() < 1e-4, "reduction {r}, coeff {c}");
        for _ in 0..200 {
            hdr.update(None);
        }
        assert!(hdr.reduction_db() < 1e-3);
    }

    #[test]
    fn exponential_release_decays_in_amplitude() {
        let mut lin = stage(ReleaseMode::Linear);
        let mut exp = stage(ReleaseMode::Exponential);
        lin.update(Some(0.0));
        exp.update(Some(0.0));
        assert!((lin.reduction_db() - exp.reduction_db()).abs() < 1e-3);
        let l = lin.update(None);
        let e = exp.update(None);
        assert!(e > l, "amplitude-domain release lingers near the top ({e} vs {l})");
        assert!(e < 10.0);
    }

    #[test]
    fn release_coefficient() {
        let hdr = stage(ReleaseMode::Linear);
        assert!((hdr.release_coeff() - expf(-0.1)).abs() < 1e-6);
    }

    #[test]
    fn window_floor_follows_top() {
        let mut hdr = stage(ReleaseMode::Linear);
        assert_eq!(hdr.window_floor_db(), Some(-50.0));
        hdr.update(Some(-10.0));
        assert!((hdr.window_floor_db().unwrap() - -45.0).abs() < 1e-4);
    }
}
