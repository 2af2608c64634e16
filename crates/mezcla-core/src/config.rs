//! Engine settings.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::buffer::ChannelConfig;
use crate::error::MixError;

/// Settings for a [`MixGraphContext`](crate::MixGraphContext).
///
/// All fields have working defaults; override what you need and call
/// [`validate`](Self::validate) (the context constructor does this too).
///
/// ```rust
/// use mezcla_core::MixConfig;
///
/// let config = MixConfig {
///     frame_size: 256,
///     worker_threads: 2,
///     ..MixConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MixConfig {
    /// Sample rate in Hz.
    pub sample_rate: f32,
    /// Frames per tick.
    pub frame_size: usize,
    /// Channel layout of top-level buses without an explicit layout.
    pub output_channels: ChannelConfig,
    /// Worker threads; 0 runs every phase on the audio thread.
    pub worker_threads: usize,
    /// Voices per work item in the parallel production phase.
    pub voice_batch_size: usize,
    /// Run independent same-depth buses on the worker pool.
    pub parallel_buses: bool,
    /// Idle ticks before an orphaned bus is destroyed.
    pub orphan_grace_frames: u32,
    /// Maximum live voices.
    pub max_voices: usize,
    /// Maximum live bus instances.
    pub max_buses: usize,
    /// Maximum incoming connections on one bus.
    pub max_connections_per_bus: usize,
    /// Buffers pre-allocated in the pool.
    pub initial_buffers: usize,
    /// Longest wait on the decode barrier, in milliseconds.
    pub decode_barrier_timeout_ms: u64,
    /// Measure peak/RMS of every bus output.
    pub metering: bool,
    /// Record per-node execution order in each frame report.
    pub record_execution: bool,
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            frame_size: 512,
            output_channels: ChannelConfig::STEREO,
            worker_threads: 0,
            voice_batch_size: 8,
            parallel_buses: true,
            orphan_grace_frames: 1,
            max_voices: 256,
            max_buses: 128,
            max_connections_per_bus: 512,
            initial_buffers: 64,
            decode_barrier_timeout_ms: 2,
            metering: false,
            record_execution: false,
        }
    }
}

impl MixConfig {
    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), MixError> {
        if !(self.sample_rate.is_finite() && self.sample_rate >= 8000.0) {
            return Err(MixError::Config(format!(
                "sample_rate must be at least 8000 Hz, got {}",
                self.sample_rate
            )));
        }
        if self.frame_size == 0 || self.frame_size > 16384 {
            return Err(MixError::Config(format!(
                "frame_size must be 1..=16384, got {}",
                self.frame_size
            )));
        }
        if self.voice_batch_size == 0 {
            return Err(MixError::Config("voice_batch_size must be non-zero".into()));
        }
        if self.max_buses == 0 || self.max_connections_per_bus == 0 {
            return Err(MixError::Config(
                "max_buses and max_connections_per_bus must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Returns the frame duration in seconds.
    pub fn frame_duration_s(&self) -> f32 {
        self.frame_size as f32 / self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(MixConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_frame_size() {
        let config = MixConfig {
            frame_size: 0,
            ..MixConfig::default()
        };
        assert!(matches!(config.validate(), Err(MixError::Config(_))));
    }

    #[test]
    fn rejects_low_sample_rate() {
        let config = MixConfig {
            sample_rate: 100.0,
            ..MixConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn frame_duration() {
        let config = MixConfig {
            frame_size: 480,
            ..MixConfig::default()
        };
        assert!((config.frame_duration_s() - 0.01).abs() < 1e-6);
    }
}
