//! Audio buffers and the buffer pool for the mix graph.
//!
//! An [`AudioBuffer`] is a fixed-capacity, deinterleaved block of samples with
//! a [`ChannelConfig`] and a valid-frame count. Buffers travel through the
//! graph by value: a voice or bus acquires one from the [`BufferPool`], fills
//! it, publishes it for its consumers, and the scheduler returns it to the pool
//! once every consumer has pulled from it. Rust ownership gives the
//! "exactly one owner" rule for free; the pool only has to count.
//!
//! Storage is allocated once per buffer for [`MAX_CHANNELS`] planes, so
//! reusing a pooled buffer with a different channel configuration never
//! allocates.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use libm::sqrtf;

/// Maximum number of channels a buffer can carry.
pub const MAX_CHANNELS: usize = 8;

/// Channel configuration of a buffer or bus.
///
/// Holds a channel count in `1..=MAX_CHANNELS`. Mixing between
/// configurations follows a simple rule: mono sources spread to every
/// destination channel, other sources map channel `c` to `c % dst_channels`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "u8", into = "u8"))]
pub struct ChannelConfig {
    channels: u8,
}

impl ChannelConfig {
    /// One channel.
    pub const MONO: Self = Self { channels: 1 };
    /// Left/right.
    pub const STEREO: Self = Self { channels: 2 };
    /// 5.1 surround (six channels).
    pub const SURROUND_5_1: Self = Self { channels: 6 };
    /// 7.1 surround (eight channels).
    pub const SURROUND_7_1: Self = Self { channels: 8 };

    /// Creates a configuration with `channels` channels.
    ///
    /// Returns `None` for zero or more than [`MAX_CHANNELS`].
    pub fn new(channels: usize) -> Option<Self> {
        (1..=MAX_CHANNELS).contains(&channels).then_some(Self {
            channels: channels as u8,
        })
    }

    /// Returns the number of channels.
    #[inline]
    pub fn count(self) -> usize {
        self.channels as usize
    }

    /// Returns the destination channel range that source channel `src`
    /// (of a `self`-channel buffer) mixes into on a `dst`-channel buffer.
    #[inline]
    pub fn route(self, src: usize, dst: ChannelConfig) -> core::ops::Range<usize> {
        if self.channels == 1 {
            0..dst.count()
        } else {
            let d = src % dst.count();
            d..d + 1
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::STEREO
    }
}

impl TryFrom<u8> for ChannelConfig {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value as usize)
            .ok_or_else(|| format!("channel count must be 1..={MAX_CHANNELS}, got {value}"))
    }
}

impl From<ChannelConfig> for u8 {
    fn from(config: ChannelConfig) -> Self {
        config.channels
    }
}

/// Peak and RMS level of a buffer, in linear amplitude.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Meter {
    /// Largest absolute sample across all channels.
    pub peak: f32,
    /// Root-mean-square across all channels.
    pub rms: f32,
}

/// A fixed-capacity, deinterleaved block of audio samples.
///
/// # Invariants
///
/// - `valid_frames() <= capacity()` after every call
/// - channel planes are `capacity` samples long; only the first
///   `valid_frames` of each are meaningful
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    data: Vec<f32>,
    capacity: usize,
    valid_frames: usize,
    channels: ChannelConfig,
}

impl AudioBuffer {
    /// Creates a zeroed buffer holding `capacity` frames per channel.
    pub fn new(capacity: usize, channels: ChannelConfig) -> Self {
        Self {
            data: vec![0.0; capacity * MAX_CHANNELS],
            capacity,
            valid_frames: 0,
            channels,
        }
    }

    /// Returns the maximum number of frames per channel.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of valid frames.
    #[inline]
    pub fn valid_frames(&self) -> usize {
        self.valid_frames
    }

    /// Sets the number of valid frames, clamped to the capacity.
    #[inline]
    pub fn set_valid_frames(&mut self, frames: usize) {
        debug_assert!(
            frames <= self.capacity,
            "valid frames {frames} exceed capacity {}",
            self.capacity
        );
        self.valid_frames = frames.min(self.capacity);
    }

    /// Returns the channel configuration.
    #[inline]
    pub fn channel_config(&self) -> ChannelConfig {
        self.channels
    }

    /// Returns the number of channels.
    #[inline]
    pub fn num_channels(&self) -> usize {
        self.channels.count()
    }

    /// Returns true if the buffer holds no valid frames.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.valid_frames == 0
    }

    /// Returns the valid samples of channel `c`.
    ///
    /// # Panics
    ///
    /// Panics if `c >= num_channels()`.
    #[inline]
    pub fn channel(&self, c: usize) -> &[f32] {
        assert!(c < self.num_channels(), "channel {c} out of range");
        let start = c * self.capacity;
        &self.data[start..start + self.valid_frames]
    }

    /// Returns the full-capacity plane of channel `c` for writing.
    ///
    /// Producers write into this slice and then call
    /// [`set_valid_frames`](Self::set_valid_frames).
    ///
    /// # Panics
    ///
    /// Panics if `c >= num_channels()`.
    #[inline]
    pub fn channel_mut(&mut self, c: usize) -> &mut [f32] {
        assert!(c < self.num_channels(), "channel {c} out of range");
        let start = c * self.capacity;
        &mut self.data[start..start + self.capacity]
    }

    /// Drops all valid frames without touching the samples.
    pub fn clear(&mut self) {
        self.valid_frames = 0;
    }

    /// Zeros every channel and marks the whole capacity valid.
    ///
    /// A bus with no audible input still publishes a silent, full-length
    /// buffer so downstream consumers see a present-but-empty block.
    pub fn fill_silence(&mut self) {
        let used = self.num_channels() * self.capacity;
        self.data[..used].fill(0.0);
        self.valid_frames = self.capacity;
    }

    /// Copies channel layout, valid frames and samples from another buffer.
    ///
    /// Frames beyond this buffer's capacity are dropped.
    pub fn copy_from(&mut self, other: &AudioBuffer) {
        self.channels = other.channels;
        self.valid_frames = other.valid_frames.min(self.capacity);
        for c in 0..self.num_channels() {
            let n = self.valid_frames;
            let src = &other.data[c * other.capacity..c * other.capacity + n];
            let start = c * self.capacity;
            self.data[start..start + n].copy_from_slice(src);
        }
    }

    /// Multiplies the valid frames by a gain ramping from `from` to `to`.
    pub fn apply_gain_ramp(&mut self, from: f32, to: f32) {
        if from == 1.0 && to == 1.0 {
            return;
        }
        let n = self.valid_frames;
        let step = if n > 0 { (to - from) / n as f32 } else { 0.0 };
        for c in 0..self.num_channels() {
            let start = c * self.capacity;
            for (i, sample) in self.data[start..start + n].iter_mut().enumerate() {
                *sample *= from + step * i as f32;
            }
        }
    }

    /// Measures peak and RMS over the valid frames of every channel.
    pub fn meter(&self) -> Meter {
        let n = self.valid_frames;
        if n == 0 {
            return Meter::default();
        }
        let mut peak = 0.0f32;
        let mut sum_sq = 0.0f32;
        for c in 0..self.num_channels() {
            for &s in self.channel(c) {
                peak = peak.max(s.abs());
                sum_sq += s * s;
            }
        }
        let count = (n * self.num_channels()) as f32;
        Meter {
            peak,
            rms: sqrtf(sum_sq / count),
        }
    }

    /// Re-targets a pooled buffer: new channel layout, no valid frames.
    pub(crate) fn reset_for(&mut self, channels: ChannelConfig) {
        self.channels = channels;
        self.valid_frames = 0;
    }
}

/// Pool of reusable [`AudioBuffer`]s of one capacity.
///
/// The pool is pre-sized at engine init and grows if a frame needs more
/// buffers than it holds; growth is counted so callers can size the pool
/// better next time.
///
/// Releasing more buffers than were acquired is a programming error: it fails
/// a `debug_assert!` in debug builds and the extra buffer is dropped in release
/// builds.
#[derive(Debug)]
pub struct BufferPool {
    free: Vec<AudioBuffer>,
    capacity: usize,
    outstanding: usize,
    grown: usize,
}

impl BufferPool {
    /// Creates a pool of `count` buffers holding `capacity` frames each.
    pub fn new(count: usize, capacity: usize) -> Self {
        let free = (0..count)
            .map(|_| AudioBuffer::new(capacity, ChannelConfig::default()))
            .collect();
        Self {
            free,
            capacity,
            outstanding: 0,
            grown: 0,
        }
    }

    /// Hands out a buffer with the given channel layout and no valid frames.
    pub fn acquire(&mut self, channels: ChannelConfig) -> AudioBuffer {
        self.outstanding += 1;
        match self.free.pop() {
            Some(mut buffer) => {
                buffer.reset_for(channels);
                buffer
            }
            None => {
                self.grown += 1;
                if self.grown == 1 {
                    tracing::warn!(
                        capacity = self.capacity,
                        outstanding = self.outstanding,
                        "buffer pool exhausted, growing"
                    );
                }
                AudioBuffer::new(self.capacity, channels)
            }
        }
    }

    /// Returns a buffer to the pool.
    pub fn release(&mut self, buffer: AudioBuffer) {
        debug_assert!(self.outstanding > 0, "buffer released twice");
        debug_assert_eq!(
            buffer.capacity(),
            self.capacity,
            "foreign buffer released into pool"
        );
        if self.outstanding == 0 || buffer.capacity() != self.capacity {
            return;
        }
        self.outstanding -= 1;
        self.free.push(buffer);
    }

    /// Releases the buffer held in `slot`, if any, leaving `None` behind.
    ///
    /// Calling this twice on the same slot is a no-op the second time.
    pub fn release_slot(&mut self, slot: &mut Option<AudioBuffer>) {
        if let Some(buffer) = slot.take() {
            self.release(buffer);
        }
    }

    /// Returns the capacity (frames per channel) of pooled buffers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of buffers currently on the free list.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Returns the number of buffers currently handed out.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Returns how many buffers were allocated beyond the initial size.
    pub fn grown(&self) -> usize {
        self.grown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_config_bounds() {
        assert!(ChannelConfig::new(0).is_none());
        assert!(ChannelConfig::new(MAX_CHANNELS + 1).is_none());
        assert_eq!(ChannelConfig::new(2), Some(ChannelConfig::STEREO));
    }

    #[test]
    fn mono_routes_to_every_channel() {
        let r = ChannelConfig::MONO.route(0, ChannelConfig::SURROUND_5_1);
        assert_eq!(r, 0..6);
        let r = ChannelConfig::SURROUND_5_1.route(3, ChannelConfig::STEREO);
        assert_eq!(r, 1..2);
    }

    #[test]
    fn valid_frames_never_exceed_capacity() {
        let mut buf = AudioBuffer::new(64, ChannelConfig::STEREO);
        assert!(buf.valid_frames() <= buf.capacity());
        buf.fill_silence();
        assert_eq!(buf.valid_frames(), 64);
        buf.clear();
        assert_eq!(buf.valid_frames(), 0);
    }

    #[test]
    fn fill_silence_zeros_samples() {
        let mut buf = AudioBuffer::new(4, ChannelConfig::STEREO);
        buf.channel_mut(0).fill(1.0);
        buf.set_valid_frames(4);
        buf.fill_silence();
        assert!(buf.channel(0).iter().all(|&s| s == 0.0));
        assert_eq!(buf.channel(1).len(), 4);
    }

    #[test]
    fn gain_ramp_is_linear() {
        let mut buf = AudioBuffer::new(4, ChannelConfig::MONO);
        buf.channel_mut(0).fill(1.0);
        buf.set_valid_frames(4);
        buf.apply_gain_ramp(0.0, 1.0);
        assert_eq!(buf.channel(0), &[0.0, 0.25, 0.5, 0.75]);
    }

    #[test]
    fn meter_reports_peak_and_rms() {
        let mut buf = AudioBuffer::new(4, ChannelConfig::MONO);
        buf.channel_mut(0).copy_from_slice(&[0.5, -1.0, 0.5, -1.0]);
        buf.set_valid_frames(4);
        let m = buf.meter();
        assert_eq!(m.peak, 1.0);
        assert!((m.rms - 0.790_569).abs() < 1e-4);
    }

    #[test]
    fn copy_from_takes_layout_and_frames() {
        let mut src = AudioBuffer::new(8, ChannelConfig::MONO);
        src.channel_mut(0)[..3].copy_from_slice(&[1.0, 2.0, 3.0]);
        src.set_valid_frames(3);
        let mut dst = AudioBuffer::new(8, ChannelConfig::STEREO);
        dst.copy_from(&src);
        assert_eq!(dst.num_channels(), 1);
        assert_eq!(dst.channel(0), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn pool_counts_outstanding() {
        let mut pool = BufferPool::new(2, 32);
        let a = pool.acquire(ChannelConfig::MONO);
        let b = pool.acquire(ChannelConfig::STEREO);
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(pool.available(), 0);
        assert_eq!(b.num_channels(), 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn pool_grows_when_exhausted() {
        let mut pool = BufferPool::new(1, 16);
        let a = pool.acquire(ChannelConfig::MONO);
        let b = pool.acquire(ChannelConfig::MONO);
        assert_eq!(pool.grown(), 1);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn release_slot_is_idempotent() {
        let mut pool = BufferPool::new(1, 16);
        let mut slot = Some(pool.acquire(ChannelConfig::MONO));
        pool.release_slot(&mut slot);
        pool.release_slot(&mut slot);
        assert!(slot.is_none());
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn acquired_buffer_starts_empty() {
        let mut pool = BufferPool::new(1, 16);
        let mut a = pool.acquire(ChannelConfig::MONO);
        a.fill_silence();
        pool.release(a);
        let b = pool.acquire(ChannelConfig::STEREO);
        assert!(b.is_empty());
        assert_eq!(b.channel_config(), ChannelConfig::STEREO);
        pool.release(b);
    }
}
