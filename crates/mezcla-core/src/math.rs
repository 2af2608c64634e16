//! Level conversions and small numeric helpers shared by the mix path.
//!
//! All functions are allocation-free and safe to call from worker threads
//! during voice production and bus consumption.
//!
//! - [`db_to_linear`] / [`linear_to_db`] - Convert between dB and linear gain
//! - [`flush_denormal`] - Zero out subnormal filter state

use libm::{expf, logf};

/// Level used to represent silence in dB (the floor of [`linear_to_db`]).
pub const SILENCE_DB: f32 = -200.0;

/// Convert decibels to linear gain.
///
/// # Example
/// ```rust
/// use mezcla_core::db_to_linear;
///
/// assert!((db_to_linear(0.0) - 1.0).abs() < 0.001);
/// assert!((db_to_linear(-6.02) - 0.5).abs() < 0.01);
/// ```
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    // 10^(dB/20) = e^(dB * ln(10)/20)
    const FACTOR: f32 = core::f32::consts::LN_10 / 20.0;
    expf(db * FACTOR)
}

/// Convert linear gain to decibels.
///
/// Values at or below zero clamp to [`SILENCE_DB`].
///
/// # Example
/// ```rust
/// use mezcla_core::linear_to_db;
///
/// assert!((linear_to_db(1.0) - 0.0).abs() < 0.001);
/// assert!((linear_to_db(0.5) - (-6.02)).abs() < 0.01);
/// ```
#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    // 20 * log10(linear) = 20 * ln(linear) / ln(10)
    const FACTOR: f32 = 20.0 / core::f32::consts::LN_10;
    logf(linear.max(1e-10)) * FACTOR
}

/// Flush subnormal values to zero.
///
/// Used on one-pole filter state, where a decaying signal would otherwise
/// settle into the subnormal range and cost hundreds of cycles per sample.
#[allow(clippy::inline_always)]
#[inline(always)]
pub fn flush_denormal(x: f32) -> f32 {
    if x.abs() < 1e-20 { 0.0 } else { x }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_round_trip() {
        for db in [-60.0, -12.0, -3.0, 0.0, 6.0] {
            let back = linear_to_db(db_to_linear(db));
            assert!((back - db).abs() < 1e-3, "{db} dB came back as {back}");
        }
    }

    #[test]
    fn linear_to_db_clamps_silence() {
        assert!(linear_to_db(0.0) <= -199.0);
        assert!(linear_to_db(-1.0) <= -199.0);
    }

    #[test]
    fn flush_denormal_zeroes_tiny_values() {
        assert_eq!(flush_denormal(1e-30), 0.0);
        assert_eq!(flush_denormal(0.5), 0.5);
    }
}
