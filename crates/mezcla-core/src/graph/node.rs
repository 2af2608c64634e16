//! Graph node types: voices, buses and the identifiers that name them.
//!
//! Nodes live in generation-checked [`thunderdome`] arenas owned by the
//! [`Graph`](super::Graph). Handles ([`BusId`], [`VoiceHandle`]) are slot +
//! generation pairs, so a handle to a destroyed node simply stops resolving.
//! Stable, user-facing identity is carried separately by [`BusKey`] and
//! [`VoiceId`], which never change over a node's life.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thunderdome::{Arena, Index};

use crate::buffer::{AudioBuffer, ChannelConfig, Meter};
use crate::collab::{Source, SourceStatus};
use crate::effect::EffectSlot;

use super::connection::{ConnectionId, ConnectionType, MixConnection, Ramp};
use super::hdr::HdrState;

/// Identifier of a bus definition in the [`BusCatalog`](super::BusCatalog).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BusDefId(pub u32);

/// Identifier of a routing context (a listener, split-screen player, or
/// output device). Each context gets its own instances of every bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RoutingContextId(pub u32);

/// Identifier of a voice, allocated by [`MixHandle`](super::MixHandle).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(pub u64);

/// Stable identity of a bus instance: one per (definition, context).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusKey {
    /// Bus definition.
    pub def: BusDefId,
    /// Routing context the instance belongs to.
    pub context: RoutingContextId,
}

impl BusKey {
    /// Creates a key.
    pub fn new(def: BusDefId, context: RoutingContextId) -> Self {
        Self { def, context }
    }
}

/// Handle to a live bus instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BusId(pub(crate) Index);

impl BusId {
    /// Arena slot of the bus; reused after the bus is destroyed.
    #[inline]
    pub fn slot(self) -> u32 {
        self.0.slot()
    }
}

/// Handle to a live voice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VoiceHandle(pub(crate) Index);

/// The producing side of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeRef {
    /// A voice.
    Voice(VoiceHandle),
    /// A bus.
    Bus(BusId),
}

/// Stable identity of a connection's producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProducerKey {
    /// A voice.
    Voice(VoiceId),
    /// A bus instance.
    Bus(BusKey),
}

/// Playback state of a voice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoiceState {
    /// Started this frame; becomes `Play` at the end of Refresh.
    Init,
    /// Producing audio every tick.
    Play,
    /// Connected but silent.
    Pause,
    /// Finished; destroyed at the end of the frame.
    Stop,
}

/// A voice's requested routing: one connection to one bus.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SendTarget {
    /// Target bus definition (instantiated in the voice's context).
    pub bus: BusDefId,
    /// Connection type; voices may not use `Feedback`.
    pub kind: ConnectionType,
    /// Static send level in dB.
    pub gain_db: f32,
}

impl SendTarget {
    /// A Direct send at unity.
    pub fn direct(bus: BusDefId) -> Self {
        Self {
            bus,
            kind: ConnectionType::Direct,
            gain_db: 0.0,
        }
    }

    /// An Aux send at `gain_db`.
    pub fn aux(bus: BusDefId, gain_db: f32) -> Self {
        Self {
            bus,
            kind: ConnectionType::Aux,
            gain_db,
        }
    }
}

/// A playing sound: one source feeding one or more buses.
pub struct VoiceNode {
    pub(crate) id: VoiceId,
    pub(crate) context: RoutingContextId,
    pub(crate) source: Box<dyn Source>,
    pub(crate) channels: ChannelConfig,
    pub(crate) state: VoiceState,
    pub(crate) output_bus: BusDefId,
    pub(crate) sends: Vec<SendTarget>,
    pub(crate) loudness_db: f32,
    pub(crate) outgoing: Vec<ConnectionId>,
    pub(crate) routing_dirty: bool,
    pub(crate) starving: bool,
    pub(crate) starvation_onset: bool,
    pub(crate) barrier_timed_out: bool,
    pub(crate) last_status: Option<SourceStatus>,
    pub(crate) output: Option<AudioBuffer>,
}

impl core::fmt::Debug for VoiceNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VoiceNode")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("state", &self.state)
            .field("output_bus", &self.output_bus)
            .field("outgoing", &self.outgoing.len())
            .finish_non_exhaustive()
    }
}

impl VoiceNode {
    pub(crate) fn new(
        id: VoiceId,
        context: RoutingContextId,
        output_bus: BusDefId,
        source: Box<dyn Source>,
    ) -> Self {
        let channels = source.channels();
        Self {
            id,
            context,
            source,
            channels,
            state: VoiceState::Init,
            output_bus,
            sends: Vec::new(),
            loudness_db: 0.0,
            outgoing: Vec::new(),
            routing_dirty: true,
            starving: false,
            starvation_onset: false,
            barrier_timed_out: false,
            last_status: None,
            output: None,
        }
    }

    /// Returns the voice id.
    pub fn id(&self) -> VoiceId {
        self.id
    }

    /// Returns the playback state.
    pub fn state(&self) -> VoiceState {
        self.state
    }

    /// Returns true while the source reports `NoDataReady`.
    pub fn is_starving(&self) -> bool {
        self.starving
    }

    /// Returns the number of connections leaving this voice.
    pub fn connection_count(&self) -> usize {
        self.outgoing.len()
    }

    /// Returns true if the next Refresh will (re)connect this voice's sends.
    pub fn needs_routing(&self) -> bool {
        self.routing_dirty
    }

    /// The sends this voice should be connected through.
    pub(crate) fn desired_sends(&self) -> impl Iterator<Item = SendTarget> + '_ {
        let fallback = self
            .sends
            .is_empty()
            .then(|| SendTarget::direct(self.output_bus));
        self.sends.iter().copied().chain(fallback)
    }

    /// Pulls one tick from the source into the acquired output buffer.
    ///
    /// Runs on a worker thread. State changes that follow from the status
    /// (stop on end/failure) are applied afterwards on the audio thread.
    pub(crate) fn produce(&mut self) {
        let Some(buffer) = self.output.as_mut() else {
            return;
        };
        let status = if self.barrier_timed_out {
            SourceStatus::NoDataReady
        } else {
            self.source.produce(buffer)
        };
        debug_assert!(buffer.valid_frames() <= buffer.capacity());

        match status {
            SourceStatus::DataReady | SourceStatus::NoMoreData => {
                if self.starving {
                    self.starving = false;
                    tracing::debug!(voice = self.id.0, "voice recovered from starvation");
                }
            }
            SourceStatus::NoDataReady => {
                buffer.clear();
                if !self.starving {
                    self.starving = true;
                    self.starvation_onset = true;
                    tracing::warn!(voice = self.id.0, "voice starving: source has no data ready");
                }
            }
            SourceStatus::Fail => {
                buffer.clear();
                tracing::warn!(voice = self.id.0, "voice source failed, stopping");
            }
        }
        self.last_status = Some(status);
    }
}

/// Lifecycle state of a bus instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusState {
    /// Has live inputs, or is a protected top-level bus.
    Active,
    /// No live inputs; destroyed once the grace period runs out.
    Orphaned,
}

/// A mix bus instance.
///
/// Owns its incoming connections. Everything a bus needs to consume its
/// inputs during the parallel bus phase is reachable from `&mut BusNode`
/// plus shared reads of the voice arena and the output table.
pub struct BusNode {
    pub(crate) key: BusKey,
    pub(crate) channels: ChannelConfig,
    pub(crate) depth: Option<u32>,
    pub(crate) top_level: bool,
    pub(crate) inputs: Arena<MixConnection>,
    pub(crate) outgoing: Vec<ConnectionId>,
    pub(crate) effects: Vec<EffectSlot>,
    pub(crate) scratch: Option<AudioBuffer>,
    pub(crate) hdr: Option<HdrState>,
    pub(crate) volume_db: f32,
    pub(crate) volume: Ramp,
    pub(crate) needs_latch: bool,
    pub(crate) idle_frames: u32,
    pub(crate) seq: u64,
    pub(crate) meter: Meter,
    pub(crate) frame_failures: u32,
    pub(crate) output: Option<AudioBuffer>,
}

impl core::fmt::Debug for BusNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BusNode")
            .field("key", &self.key)
            .field("depth", &self.depth)
            .field("top_level", &self.top_level)
            .field("inputs", &self.inputs.len())
            .field("outgoing", &self.outgoing.len())
            .field("effects", &self.effects.len())
            .finish_non_exhaustive()
    }
}

impl BusNode {
    pub(crate) fn new(key: BusKey, channels: ChannelConfig, volume_db: f32, seq: u64) -> Self {
        Self {
            key,
            channels,
            depth: None,
            top_level: false,
            inputs: Arena::new(),
            outgoing: Vec::new(),
            effects: Vec::new(),
            scratch: None,
            hdr: None,
            volume_db,
            volume: Ramp::snapped(crate::db_to_linear(volume_db)),
            needs_latch: false,
            idle_frames: 0,
            seq,
            meter: Meter::default(),
            frame_failures: 0,
            output: None,
        }
    }

    /// Returns the bus key.
    pub fn key(&self) -> BusKey {
        self.key
    }

    /// Returns the channel layout.
    pub fn channels(&self) -> ChannelConfig {
        self.channels
    }

    /// Returns the depth from the last sort; `None` if unreached.
    pub fn depth(&self) -> Option<u32> {
        self.depth
    }

    /// Returns true if the bus feeds its context's sink.
    pub fn is_top_level(&self) -> bool {
        self.top_level
    }

    /// Returns the number of incoming connections.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Returns the number of incoming connections that keep the bus alive.
    ///
    /// Feedback inputs don't count: two buses feeding each other only
    /// through a feedback send are garbage once nothing else feeds them.
    pub fn live_input_count(&self) -> usize {
        self.inputs
            .iter()
            .filter(|(_, c)| c.kind != ConnectionType::Feedback)
            .count()
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> BusState {
        if self.idle_frames > 0 {
            BusState::Orphaned
        } else {
            BusState::Active
        }
    }

    /// Returns the effect slots.
    pub fn effects(&self) -> &[EffectSlot] {
        &self.effects
    }

    /// Returns the meter of the last frame (zero unless metering is on).
    pub fn meter(&self) -> Meter {
        self.meter
    }

    /// Returns the current HDR reduction in dB, if the bus has an HDR stage.
    pub fn hdr_reduction_db(&self) -> Option<f32> {
        self.hdr.as_ref().map(HdrState::reduction_db)
    }

    /// Returns the bus volume target in dB.
    pub fn volume_db(&self) -> f32 {
        self.volume_db
    }

    /// Returns true if the bus must keep a copy of its output for next tick.
    pub fn needs_latch(&self) -> bool {
        self.needs_latch
    }
}
