//! Per-connection one-pole filters.
//!
//! Every mix connection carries an LPF and an HPF *amount* in `0..=100`
//! resolved by the parameter collaborator. Amounts map to cutoff frequencies
//! on a log scale:
//!
//! ```text
//! LPF: 0 → bypass, 1..=100 → 20 kHz down to 50 Hz
//! HPF: 0 → bypass, 1..=100 → 20 Hz up to 10 kHz
//! ```
//!
//! The filter is the classic single-pole IIR,
//! `y[n] = x[n] + coeff * (y[n-1] - x[n])` with
//! `coeff = exp(-2π * freq / sample_rate)`; the highpass output is
//! `x[n] - lowpass(x[n])`. Six dB per octave, zero latency, one multiply per
//! sample.

use libm::{expf, logf};

use crate::buffer::MAX_CHANNELS;
use crate::flush_denormal;

const LPF_MAX_HZ: f32 = 20_000.0;
const LPF_MIN_HZ: f32 = 50.0;
const HPF_MIN_HZ: f32 = 20.0;
const HPF_MAX_HZ: f32 = 10_000.0;

/// Maps an LPF amount to a cutoff frequency; `None` means bypass.
pub fn lpf_cutoff_hz(amount: f32) -> Option<f32> {
    (amount > 0.0).then(|| log_interp(LPF_MAX_HZ, LPF_MIN_HZ, amount.min(100.0) / 100.0))
}

/// Maps an HPF amount to a cutoff frequency; `None` means bypass.
pub fn hpf_cutoff_hz(amount: f32) -> Option<f32> {
    (amount > 0.0).then(|| log_interp(HPF_MIN_HZ, HPF_MAX_HZ, amount.min(100.0) / 100.0))
}

fn log_interp(from: f32, to: f32, t: f32) -> f32 {
    from * expf(logf(to / from) * t)
}

/// One-pole filter state for a single channel.
///
/// # Invariants
///
/// - `coeff` is in [0, 1) for stable operation
/// - `state` is flushed to zero when below 1e-20
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OnePole {
    state: f32,
}

impl OnePole {
    /// Computes the coefficient for `freq_hz` at `sample_rate`.
    #[inline]
    pub fn coefficient(freq_hz: f32, sample_rate: f32) -> f32 {
        expf(-core::f32::consts::TAU * freq_hz / sample_rate)
    }

    /// Lowpass one sample.
    #[inline]
    pub fn process_lowpass(&mut self, input: f32, coeff: f32) -> f32 {
        self.state = flush_denormal(input + coeff * (self.state - input));
        self.state
    }

    /// Highpass one sample (input minus its lowpass).
    #[inline]
    pub fn process_highpass(&mut self, input: f32, coeff: f32) -> f32 {
        input - self.process_lowpass(input, coeff)
    }

    /// Clears the filter memory.
    pub fn reset(&mut self) {
        self.state = 0.0;
    }
}

/// LPF + HPF memory for every channel of one connection.
///
/// Filtering is applied on the producer's channel layout before the samples
/// are mixed into the consumer.
#[derive(Debug, Clone, Default)]
pub struct ConnectionFilter {
    lowpass: [OnePole; MAX_CHANNELS],
    highpass: [OnePole; MAX_CHANNELS],
}

impl ConnectionFilter {
    /// Returns true if neither amount engages a filter.
    #[inline]
    pub fn is_bypassed(lpf: f32, hpf: f32) -> bool {
        lpf <= 0.0 && hpf <= 0.0
    }

    /// Filters one sample of `channel` with precomputed coefficients.
    ///
    /// `None` coefficients skip that stage.
    #[inline]
    pub fn process(
        &mut self,
        channel: usize,
        input: f32,
        lpf_coeff: Option<f32>,
        hpf_coeff: Option<f32>,
    ) -> f32 {
        let mut x = input;
        if let Some(c) = lpf_coeff {
            x = self.lowpass[channel].process_lowpass(x, c);
        }
        if let Some(c) = hpf_coeff {
            x = self.highpass[channel].process_highpass(x, c);
        }
        x
    }

    /// Clears all channel memories.
    pub fn reset(&mut self) {
        self.lowpass.iter_mut().for_each(OnePole::reset);
        self.highpass.iter_mut().for_each(OnePole::reset);
    }
}
