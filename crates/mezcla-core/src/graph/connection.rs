//! Mix connections between graph nodes.
//!
//! A [`MixConnection`] feeds a producer (voice or bus) into a consumer bus.
//! Connections are owned by the consumer bus, in a generation-checked arena;
//! the producer only keeps [`ConnectionId`] back-references. A connection
//! whose producer handle stops resolving contributes nothing.
//!
//! Gain, LPF and HPF each keep the previous frame's value next to the current
//! target so the mix ramps across the block instead of stepping.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thunderdome::Index;

use crate::buffer::AudioBuffer;
use crate::filter::{ConnectionFilter, OnePole, hpf_cutoff_hz, lpf_cutoff_hz};
use crate::graph::node::{BusId, BusKey, NodeRef, ProducerKey, RoutingContextId};

/// How a producer feeds its consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ConnectionType {
    /// Main output path (voice to its bus, bus to its parent).
    Direct,
    /// Auxiliary send.
    Aux,
    /// Send that reads the producer's previous-tick output.
    Feedback,
}

/// Per-connection targets resolved by the parameter collaborator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConnectionParams {
    /// Gain in dB on top of the static send level.
    pub gain_db: f32,
    /// Lowpass amount, `0..=100` (0 = off).
    pub lpf: f32,
    /// Highpass amount, `0..=100` (0 = off).
    pub hpf: f32,
    /// False mutes the connection.
    pub audible: bool,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            gain_db: 0.0,
            lpf: 0.0,
            hpf: 0.0,
            audible: true,
        }
    }
}

/// A value and the value it had the previous frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Ramp {
    /// Value at the start of the current block.
    pub previous: f32,
    /// Value at the end of the current block.
    pub current: f32,
}

impl Ramp {
    /// A ramp resting at `value`.
    pub fn snapped(value: f32) -> Self {
        Self {
            previous: value,
            current: value,
        }
    }

    /// Sets the end-of-block target.
    #[inline]
    pub fn set(&mut self, target: f32) {
        self.current = target;
    }

    /// Ends the block: the current value becomes the starting point.
    #[inline]
    pub fn advance(&mut self) {
        self.previous = self.current;
    }

    /// Returns true if both ends are zero.
    #[inline]
    pub fn is_silent(&self) -> bool {
        self.previous == 0.0 && self.current == 0.0
    }
}

/// Handle to a connection: the consumer bus plus a slot in its input arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub(crate) bus: BusId,
    pub(crate) slot: Index,
}

impl ConnectionId {
    /// Returns the consumer bus.
    pub fn consumer(self) -> BusId {
        self.bus
    }
}

/// Stable identity of a connection, as seen by collaborators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    /// Producer identity.
    pub producer: ProducerKey,
    /// Consumer bus identity.
    pub consumer: BusKey,
    /// Connection type.
    pub kind: ConnectionType,
}

/// An edge of the mix graph.
#[derive(Debug)]
pub struct MixConnection {
    pub(crate) producer: NodeRef,
    pub(crate) producer_key: ProducerKey,
    pub(crate) kind: ConnectionType,
    pub(crate) context: RoutingContextId,
    pub(crate) send_gain_db: f32,
    pub(crate) params: ConnectionParams,
    pub(crate) hdr_reduction_db: f32,
    pub(crate) window_audible: bool,
    pub(crate) gain: Ramp,
    pub(crate) lpf: Ramp,
    pub(crate) hpf: Ramp,
    pub(crate) late: bool,
    pub(crate) fresh: bool,
    pub(crate) filter: ConnectionFilter,
}

/// Samples filtered per inner pass when spreading one channel to several.
const MIX_CHUNK: usize = 64;

impl MixConnection {
    pub(crate) fn new(
        producer: NodeRef,
        producer_key: ProducerKey,
        kind: ConnectionType,
        context: RoutingContextId,
        send_gain_db: f32,
    ) -> Self {
        Self {
            producer,
            producer_key,
            kind,
            context,
            send_gain_db,
            params: ConnectionParams::default(),
            hdr_reduction_db: 0.0,
            window_audible: true,
            gain: Ramp::default(),
            lpf: Ramp::default(),
            hpf: Ramp::default(),
            late: kind == ConnectionType::Feedback,
            fresh: true,
            filter: ConnectionFilter::default(),
        }
    }

    /// Returns the producer.
    pub fn producer(&self) -> NodeRef {
        self.producer
    }

    /// Returns the connection type.
    pub fn kind(&self) -> ConnectionType {
        self.kind
    }

    /// Returns the routing context the connection was made in.
    pub fn context(&self) -> RoutingContextId {
        self.context
    }

    /// Returns true if the connection reads the previous tick's output.
    pub fn is_late(&self) -> bool {
        self.late
    }

    /// Returns true if the connection contributes this frame.
    pub fn is_audible(&self) -> bool {
        self.params.audible && self.window_audible
    }

    /// Returns the current resolved parameters.
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Returns the linear gain ramp for this block.
    pub fn gain(&self) -> Ramp {
        self.gain
    }

    /// Gain in dB before HDR: static send level plus resolved gain.
    pub(crate) fn level_db(&self) -> f32 {
        self.send_gain_db + self.params.gain_db
    }

    /// Turns the resolved targets into this block's ramps.
    ///
    /// A fresh connection starts at its target instead of fading in.
    pub(crate) fn commit_targets(&mut self) {
        let target = if self.is_audible() {
            crate::db_to_linear(self.level_db() - self.hdr_reduction_db)
        } else {
            0.0
        };
        self.gain.set(target);
        self.lpf.set(self.params.lpf.clamp(0.0, 100.0));
        self.hpf.set(self.params.hpf.clamp(0.0, 100.0));
        if self.fresh {
            self.gain.advance();
            self.lpf.advance();
            self.hpf.advance();
            self.fresh = false;
        }
    }

    /// Ends the block for every ramp.
    pub(crate) fn advance(&mut self) {
        self.gain.advance();
        self.lpf.advance();
        self.hpf.advance();
    }

    /// Adds `src` into `dst` through the filters at the ramped gain.
    ///
    /// Mixes `min(src.valid_frames, dst.valid_frames)` frames. Mono sources
    /// spread to every destination channel.
    pub(crate) fn mix_into(&mut self, src: &AudioBuffer, dst: &mut AudioBuffer, sample_rate: f32) {
        if self.gain.is_silent() {
            return;
        }
        let n = src.valid_frames().min(dst.valid_frames());
        if n == 0 {
            return;
        }
        let lpf = lpf_cutoff_hz(self.lpf.current).map(|hz| OnePole::coefficient(hz, sample_rate));
        let hpf = hpf_cutoff_hz(self.hpf.current).map(|hz| OnePole::coefficient(hz, sample_rate));
        let g0 = self.gain.previous;
        let step = (self.gain.current - g0) / n as f32;
        let src_cfg = src.channel_config();
        let dst_cfg = dst.channel_config();

        let mut tmp = [0.0f32; MIX_CHUNK];
        for c in 0..src.num_channels() {
            let input = src.channel(c);
            let route = src_cfg.route(c, dst_cfg);
            let mut start = 0;
            while start < n {
                let len = MIX_CHUNK.min(n - start);
                for (i, t) in tmp[..len].iter_mut().enumerate() {
                    let frame = start + i;
                    let x = self.filter.process(c, input[frame], lpf, hpf);
                    *t = x * (g0 + step * frame as f32);
                }
                for d in route.clone() {
                    let out = &mut dst.channel_mut(d)[start..start + len];
                    for (o, &t) in out.iter_mut().zip(&tmp[..len]) {
                        *o += t;
                    }
                }
                start += len;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ChannelConfig;
    use crate::graph::node::VoiceId;
    use thunderdome::Arena;

    fn conn(kind: ConnectionType) -> MixConnection {
        let mut arena = Arena::new();
        let bus = BusId(arena.insert(()));
        MixConnection::new(
            NodeRef::Bus(bus),
            ProducerKey::Voice(VoiceId(1)),
            kind,
            RoutingContextId(0),
            0.0,
        )
    }

    fn constant(channels: ChannelConfig, value: f32, frames: usize) -> AudioBuffer {
        let mut buf = AudioBuffer::new(frames, channels);
        for c in 0..buf.num_channels() {
            buf.channel_mut(c).fill(value);
        }
        buf.set_valid_frames(frames);
        buf
    }

    #[test]
    fn feedback_starts_late() {
        assert!(conn(ConnectionType::Feedback).is_late());
        assert!(!conn(ConnectionType::Aux).is_late());
    }

    #[test]
    fn fresh_connection_does_not_fade_in() {
        let mut c = conn(ConnectionType::Direct);
        c.commit_targets();
        assert_eq!(c.gain(), Ramp::snapped(1.0));
        c.params.gain_db = -120.0;
        c.commit_targets();
        assert_eq!(c.gain().previous, 1.0);
        assert!(c.gain().current < 1e-5);
    }

    #[test]
    fn inaudible_connection_targets_zero() {
        let mut c = conn(ConnectionType::Direct);
        c.params.audible = false;
        c.commit_targets();
        assert!(c.gain().is_silent());
    }

    #[test]
    fn mono_spreads_to_stereo() {
        let mut c = conn(ConnectionType::Direct);
        c.commit_targets();
        let src = constant(ChannelConfig::MONO, 0.5, 100);
        let mut dst = AudioBuffer::new(100, ChannelConfig::STEREO);
        dst.fill_silence();
        c.mix_into(&src, &mut dst, 48000.0);
        assert!(dst.channel(0).iter().all(|&s| s == 0.5));
        assert!(dst.channel(1).iter().all(|&s| s == 0.5));
    }

    #[test]
    fn gain_ramps_across_block() {
        let mut c = conn(ConnectionType::Direct);
        c.gain = Ramp {
            previous: 0.0,
            current: 1.0,
        };
        c.fresh = false;
        let src = constant(ChannelConfig::MONO, 1.0, 4);
        let mut dst = AudioBuffer::new(4, ChannelConfig::MONO);
        dst.fill_silence();
        c.mix_into(&src, &mut dst, 48000.0);
        assert_eq!(dst.channel(0), &[0.0, 0.25, 0.5, 0.75]);
    }

    #[test]
    fn mixing_is_additive() {
        let mut c = conn(ConnectionType::Direct);
        c.commit_targets();
        let src = constant(ChannelConfig::STEREO, 0.25, 8);
        let mut dst = constant(ChannelConfig::STEREO, 0.5, 8);
        c.mix_into(&src, &mut dst, 48000.0);
        assert_eq!(dst.channel(1)[7], 0.75);
    }

    #[test]
    fn short_source_mixes_valid_frames_only() {
        let mut c = conn(ConnectionType::Direct);
        c.commit_targets();
        let src = constant(ChannelConfig::MONO, 1.0, 3);
        let mut dst = AudioBuffer::new(3 + 5, ChannelConfig::MONO);
        dst.fill_silence();
        c.mix_into(&src, &mut dst, 48000.0);
        assert_eq!(&dst.channel(0)[..4], &[1.0, 1.0, 1.0, 0.0]);
    }
}
