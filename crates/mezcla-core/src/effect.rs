//! Bus effect contract.
//!
//! Buses carry an ordered list of [`EffectSlot`]s. The scheduler only cares
//! about two things: whether a slot is bypassed, and whether the effect works
//! on the bus buffer in place or needs a separate output buffer. That choice
//! is the [`Effect`] enum, so dispatch is one `match` per slot and no
//! downcasting is ever needed.
//!
//! ## Design Decisions
//!
//! - **Block based**: Effects see whole [`AudioBuffer`]s. Per-sample DSP can
//!   be lifted with [`PerChannel`], which runs one [`SampleEffect`] instance
//!   per channel.
//!
//! - **Fallible**: `process` returns `Result`. A failing slot is marked
//!   failed and bypassed from then on; the bus keeps mixing.
//!
//! - **No allocations**: Out-of-place effects write into a scratch buffer the
//!   bus owns, which is then swapped with the bus buffer.

use crate::buffer::{AudioBuffer, ChannelConfig};
use crate::db_to_linear;
use crate::error::ProducerError;

/// An effect that rewrites a buffer in place.
pub trait InPlaceEffect: Send {
    /// Processes the valid frames of `buffer`.
    fn process(&mut self, buffer: &mut AudioBuffer) -> Result<(), ProducerError>;

    /// Clears internal state.
    fn reset(&mut self) {}
}

/// An effect that reads one buffer and writes another.
///
/// `output` arrives with the input's channel layout and no valid frames; the
/// effect may change its layout via [`AudioBuffer::copy_from`] or by writing
/// channels and setting the valid-frame count.
pub trait OutOfPlaceEffect: Send {
    /// Processes `input` into `output`.
    fn process(&mut self, input: &AudioBuffer, output: &mut AudioBuffer)
    -> Result<(), ProducerError>;

    /// Returns the channel layout the output buffer should be prepared with.
    fn output_channels(&self, input: ChannelConfig) -> ChannelConfig {
        input
    }

    /// Clears internal state.
    fn reset(&mut self) {}
}

/// A bus effect, tagged with how it wants its buffers.
pub enum Effect {
    /// Works on the bus buffer directly.
    InPlace(Box<dyn InPlaceEffect>),
    /// Writes a separate buffer that replaces the bus buffer.
    OutOfPlace(Box<dyn OutOfPlaceEffect>),
}

impl core::fmt::Debug for Effect {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InPlace(_) => f.write_str("Effect::InPlace"),
            Self::OutOfPlace(_) => f.write_str("Effect::OutOfPlace"),
        }
    }
}

impl Effect {
    /// Wraps an in-place effect.
    pub fn in_place(effect: impl InPlaceEffect + 'static) -> Self {
        Self::InPlace(Box::new(effect))
    }

    /// Wraps an out-of-place effect.
    pub fn out_of_place(effect: impl OutOfPlaceEffect + 'static) -> Self {
        Self::OutOfPlace(Box::new(effect))
    }

    /// Returns true for the out-of-place variant.
    pub fn is_out_of_place(&self) -> bool {
        matches!(self, Self::OutOfPlace(_))
    }

    /// Runs the effect on `buffer`.
    ///
    /// Out-of-place effects write into `scratch`, which is then swapped with
    /// `buffer`; `scratch` must have the same capacity as `buffer`.
    pub fn process(
        &mut self,
        buffer: &mut AudioBuffer,
        scratch: &mut AudioBuffer,
    ) -> Result<(), ProducerError> {
        match self {
            Self::InPlace(fx) => fx.process(buffer),
            Self::OutOfPlace(fx) => {
                debug_assert_eq!(buffer.capacity(), scratch.capacity());
                scratch.reset_for(fx.output_channels(buffer.channel_config()));
                fx.process(buffer, scratch)?;
                core::mem::swap(buffer, scratch);
                Ok(())
            }
        }
    }

    /// Clears the effect's internal state.
    pub fn reset(&mut self) {
        match self {
            Self::InPlace(fx) => fx.reset(),
            Self::OutOfPlace(fx) => fx.reset(),
        }
    }
}

/// One effect in a bus chain, with its bypass state.
#[derive(Debug)]
pub struct EffectSlot {
    name: String,
    effect: Effect,
    bypass: bool,
    failed: bool,
}

impl EffectSlot {
    /// Creates an active slot.
    pub fn new(name: impl Into<String>, effect: Effect) -> Self {
        Self {
            name: name.into(),
            effect,
            bypass: false,
            failed: false,
        }
    }

    /// Returns the slot name (the effect's registry name or a label).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the slot was bypassed by request.
    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    /// Returns true if the effect failed and is permanently skipped.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Sets or clears the bypass flag.
    ///
    /// Leaving bypass clears the effect's state so stale tails don't leak.
    pub fn set_bypass(&mut self, bypass: bool) {
        if self.bypass && !bypass {
            self.effect.reset();
        }
        self.bypass = bypass;
    }

    /// Returns true if the effect should run this frame.
    #[inline]
    pub fn is_active(&self) -> bool {
        !self.bypass && !self.failed
    }

    /// Returns true if running this slot needs a scratch buffer.
    pub fn needs_scratch(&self) -> bool {
        self.effect.is_out_of_place()
    }

    /// Runs the effect unless bypassed; a failure marks the slot failed.
    pub fn run(
        &mut self,
        buffer: &mut AudioBuffer,
        scratch: &mut AudioBuffer,
    ) -> Result<(), ProducerError> {
        if !self.is_active() {
            return Ok(());
        }
        let result = self.effect.process(buffer, scratch);
        if result.is_err() {
            self.failed = true;
        }
        result
    }
}

/// Single-sample effect, lifted to buffers by [`PerChannel`].
///
/// # Example
///
/// ```rust
/// use mezcla_core::effect::{PerChannel, SampleEffect};
/// use mezcla_core::{AudioBuffer, ChannelConfig, Effect};
///
/// #[derive(Clone)]
/// struct Invert;
///
/// impl SampleEffect for Invert {
///     fn process(&mut self, input: f32) -> f32 {
///         -input
///     }
/// }
///
/// let mut fx = Effect::in_place(PerChannel::new(Invert));
/// let mut buf = AudioBuffer::new(4, ChannelConfig::STEREO);
/// let mut scratch = AudioBuffer::new(4, ChannelConfig::STEREO);
/// buf.channel_mut(0).fill(0.5);
/// buf.set_valid_frames(4);
/// fx.process(&mut buf, &mut scratch).unwrap();
/// assert_eq!(buf.channel(0)[0], -0.5);
/// ```
pub trait SampleEffect: Send {
    /// Processes one sample.
    fn process(&mut self, input: f32) -> f32;

    /// Processes a block in place.
    fn process_block_inplace(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            *sample = self.process(*sample);
        }
    }

    /// Clears internal state.
    fn reset(&mut self) {}
}

/// Runs one [`SampleEffect`] instance per channel.
///
/// Instances are cloned from a prototype up to [`MAX_CHANNELS`](crate::MAX_CHANNELS)
/// so a buffer whose layout changes never allocates.
pub struct PerChannel<E> {
    instances: Vec<E>,
}

impl<E: SampleEffect + Clone> PerChannel<E> {
    /// Creates one instance per possible channel.
    pub fn new(prototype: E) -> Self {
        Self {
            instances: vec![prototype; crate::MAX_CHANNELS],
        }
    }
}

impl<E: SampleEffect> InPlaceEffect for PerChannel<E> {
    fn process(&mut self, buffer: &mut AudioBuffer) -> Result<(), ProducerError> {
        let n = buffer.valid_frames();
        for c in 0..buffer.num_channels() {
            let samples = &mut buffer.channel_mut(c)[..n];
            self.instances[c].process_block_inplace(samples);
            if samples.iter().any(|s| !s.is_finite()) {
                return Err(ProducerError::new("non-finite output"));
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.instances.iter_mut().for_each(SampleEffect::reset);
    }
}

/// Static gain.
#[derive(Debug, Clone, Copy)]
pub struct Gain {
    gain: f32,
}

impl Gain {
    /// Creates a gain stage from a level in dB.
    pub fn from_db(db: f32) -> Self {
        Self {
            gain: db_to_linear(db),
        }
    }

    /// Returns the linear gain.
    pub fn linear(&self) -> f32 {
        self.gain
    }
}

impl SampleEffect for Gain {
    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        input * self.gain
    }

    fn process_block_inplace(&mut self, buffer: &mut [f32]) {
        buffer.iter_mut().for_each(|s| *s *= self.gain);
    }
}

/// Folds a buffer onto fewer (or more) channels.
///
/// Out of place because the output layout differs from the input.
#[derive(Debug, Clone, Copy)]
pub struct Downmix {
    channels: ChannelConfig,
}

impl Downmix {
    /// Creates a downmix to `channels`.
    pub fn new(channels: ChannelConfig) -> Self {
        Self { channels }
    }
}

impl OutOfPlaceEffect for Downmix {
    fn output_channels(&self, _input: ChannelConfig) -> ChannelConfig {
        self.channels
    }

    fn process(
        &mut self,
        input: &AudioBuffer,
        output: &mut AudioBuffer,
    ) -> Result<(), ProducerError> {
        let n = input.valid_frames();
        let src_cfg = input.channel_config();
        for c in 0..output.num_channels() {
            output.channel_mut(c)[..n].fill(0.0);
        }
        for c in 0..input.num_channels() {
            let route = src_cfg.route(c, self.channels);
            for d in route {
                let dst = &mut output.channel_mut(d)[..n];
                for (o, &s) in dst.iter_mut().zip(input.channel(c)) {
                    *o += s;
                }
            }
        }
        output.set_valid_frames(n);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Exploding;

    impl InPlaceEffect for Exploding {
        fn process(&mut self, _buffer: &mut AudioBuffer) -> Result<(), ProducerError> {
            Err(ProducerError::new("boom"))
        }
    }

    fn filled(channels: ChannelConfig, value: f32) -> AudioBuffer {
        let mut buf = AudioBuffer::new(8, channels);
        for c in 0..buf.num_channels() {
            buf.channel_mut(c).fill(value);
        }
        buf.set_valid_frames(8);
        buf
    }

    #[test]
    fn gain_in_place() {
        let mut fx = Effect::in_place(PerChannel::new(Gain::from_db(-6.0206)));
        let mut buf = filled(ChannelConfig::STEREO, 1.0);
        let mut scratch = AudioBuffer::new(8, ChannelConfig::STEREO);
        fx.process(&mut buf, &mut scratch).unwrap();
        assert!((buf.channel(1)[3] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn out_of_place_swaps_buffers() {
        let mut fx = Effect::out_of_place(Downmix::new(ChannelConfig::MONO));
        let mut buf = filled(ChannelConfig::STEREO, 0.25);
        let mut scratch = AudioBuffer::new(8, ChannelConfig::STEREO);
        fx.process(&mut buf, &mut scratch).unwrap();
        assert_eq!(buf.num_channels(), 1);
        assert_eq!(buf.valid_frames(), 8);
        assert_eq!(buf.channel(0)[0], 0.5);
        assert_eq!(scratch.num_channels(), 2);
    }

    #[test]
    fn failing_slot_stays_bypassed() {
        let mut slot = EffectSlot::new("boom", Effect::in_place(Exploding));
        let mut buf = filled(ChannelConfig::MONO, 1.0);
        let mut scratch = AudioBuffer::new(8, ChannelConfig::MONO);
        assert!(slot.run(&mut buf, &mut scratch).is_err());
        assert!(slot.has_failed());
        assert!(!slot.is_active());
        assert!(slot.run(&mut buf, &mut scratch).is_ok());
    }

    #[test]
    fn bypassed_slot_leaves_buffer() {
        let mut slot = EffectSlot::new(
            "gain",
            Effect::in_place(PerChannel::new(Gain::from_db(-20.0))),
        );
        slot.set_bypass(true);
        let mut buf = filled(ChannelConfig::MONO, 1.0);
        let mut scratch = AudioBuffer::new(8, ChannelConfig::MONO);
        slot.run(&mut buf, &mut scratch).unwrap();
        assert_eq!(buf.channel(0)[0], 1.0);
    }

    #[test]
    fn non_finite_output_is_a_failure() {
        #[derive(Clone)]
        struct Nan;
        impl SampleEffect for Nan {
            fn process(&mut self, _input: f32) -> f32 {
                f32::NAN
            }
        }
        let mut fx = PerChannel::new(Nan);
        let mut buf = filled(ChannelConfig::MONO, 1.0);
        assert!(fx.process(&mut buf).is_err());
    }
}
