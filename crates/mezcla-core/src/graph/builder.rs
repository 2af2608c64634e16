//! Topology builder: creates, connects and destroys graph nodes.
//!
//! The [`Graph`] owns every voice and bus in two generation-checked arenas.
//! Only the audio thread touches it, and only during Refresh and end-of-frame
//! GC; the parallel phases borrow disjoint parts of it.
//!
//! Any change to bus-to-bus wiring marks the graph dirty so the next Refresh
//! re-sorts. Voice connections never affect bus order and don't dirty it.

use std::collections::HashMap;

use thunderdome::Arena;

use crate::buffer::AudioBuffer;
use crate::collab::Sink;
use crate::config::MixConfig;
use crate::effect::EffectSlot;
use crate::error::{MixError, Resource};

use super::catalog::BusCatalog;
use super::connection::{ConnectionId, ConnectionKey, ConnectionType, MixConnection};
use super::hdr::HdrState;
use super::node::{
    BusDefId, BusId, BusKey, BusNode, NodeRef, ProducerKey, RoutingContextId, VoiceHandle, VoiceId,
    VoiceNode,
};
use super::report::GraphSnapshot;

/// Deepest parent chain followed before giving up on a definition.
pub const MAX_BUS_NESTING: usize = 32;

/// A routing context: where its top-level buses go.
pub(crate) struct ContextEntry {
    pub(crate) sink: Option<Box<dyn Sink>>,
    pub(crate) gain: f32,
}

/// Per-frame builder counters, drained into the frame report.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BuildStats {
    pub(crate) buses_created: u32,
    pub(crate) buses_destroyed: u32,
    pub(crate) allocation_failures: u32,
}

/// The mix graph: voices, buses, connections and routing contexts.
pub struct Graph {
    pub(crate) buses: Arena<BusNode>,
    pub(crate) voices: Arena<VoiceNode>,
    pub(crate) bus_index: HashMap<BusKey, BusId>,
    pub(crate) voice_index: HashMap<VoiceId, VoiceHandle>,
    pub(crate) contexts: HashMap<RoutingContextId, ContextEntry>,
    pub(crate) catalog: BusCatalog,
    pub(crate) config: MixConfig,
    pub(crate) dirty: bool,
    pub(crate) stats: BuildStats,
    next_seq: u64,
}

impl core::fmt::Debug for Graph {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Graph")
            .field("buses", &self.buses.len())
            .field("voices", &self.voices.len())
            .field("contexts", &self.contexts.len())
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl Graph {
    /// Creates an empty graph over a catalogue.
    pub fn new(config: MixConfig, catalog: BusCatalog) -> Self {
        Self {
            buses: Arena::with_capacity(config.max_buses),
            voices: Arena::with_capacity(config.max_voices),
            bus_index: HashMap::new(),
            voice_index: HashMap::new(),
            contexts: HashMap::new(),
            catalog,
            config,
            dirty: false,
            stats: BuildStats::default(),
            next_seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn allocation_failure(&mut self, resource: Resource) -> MixError {
        self.stats.allocation_failures += 1;
        tracing::debug!(%resource, "allocation failure");
        MixError::AllocationFailure(resource)
    }

    // ── Routing contexts ────────────────────────────────────────────────────

    /// Registers (or re-binds) a routing context.
    pub fn register_context(
        &mut self,
        context: RoutingContextId,
        sink: Option<Box<dyn Sink>>,
        gain: f32,
    ) {
        self.contexts.insert(context, ContextEntry { sink, gain });
        self.dirty = true;
    }

    /// Unregisters a context. Its buses lose their protection and are
    /// reclaimed by GC once idle.
    pub fn unregister_context(&mut self, context: RoutingContextId) -> bool {
        let removed = self.contexts.remove(&context).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    /// Sets the gain a context's sink receives its buses with.
    pub fn set_context_gain(&mut self, context: RoutingContextId, gain: f32) -> bool {
        self.contexts
            .get_mut(&context)
            .map(|entry| entry.gain = gain)
            .is_some()
    }

    /// Returns true if the context is registered.
    pub fn has_context(&self, context: RoutingContextId) -> bool {
        self.contexts.contains_key(&context)
    }

    // ── Buses ───────────────────────────────────────────────────────────────

    /// Returns the bus instance of `def` in `context`, creating it (and its
    /// parents and static send targets) if needed.
    pub fn get_or_create_bus(
        &mut self,
        def: BusDefId,
        context: RoutingContextId,
    ) -> Result<BusId, MixError> {
        self.resolve_bus(def, context, 0)
    }

    fn resolve_bus(
        &mut self,
        def: BusDefId,
        context: RoutingContextId,
        nesting: usize,
    ) -> Result<BusId, MixError> {
        if !self.contexts.contains_key(&context) {
            return Err(MixError::UnknownContext(context));
        }
        let key = BusKey::new(def, context);
        if let Some(&id) = self.bus_index.get(&key) {
            return Ok(id);
        }
        if nesting > MAX_BUS_NESTING {
            return Err(MixError::InvalidConnection(format!(
                "bus {def:?} nests deeper than {MAX_BUS_NESTING} levels; is the parent chain cyclic?"
            )));
        }
        let definition = self
            .catalog
            .get(def)
            .ok_or(MixError::UnknownBus(def))?
            .clone();

        let parent = match definition.parent {
            Some(p) => Some(self.resolve_bus(p, context, nesting + 1)?),
            None => None,
        };

        if self.buses.len() >= self.config.max_buses {
            return Err(self.allocation_failure(Resource::Bus));
        }

        let channels = definition.channels.unwrap_or(self.config.output_channels);
        let seq = self.next_seq();
        let mut node = BusNode::new(key, channels, definition.volume_db, seq);
        node.top_level = parent.is_none();
        node.effects = definition
            .effects
            .iter()
            .map(|d| {
                let mut slot = EffectSlot::new(d.name.clone(), (d.factory)(&self.config));
                slot.set_bypass(d.bypass);
                slot
            })
            .collect();
        if !node.effects.is_empty() {
            node.scratch = Some(AudioBuffer::new(self.config.frame_size, channels));
        }
        node.hdr = definition
            .hdr
            .map(|s| HdrState::new(s, self.config.frame_size, self.config.sample_rate));

        let id = BusId(self.buses.insert(node));
        self.bus_index.insert(key, id);
        self.dirty = true;
        self.stats.buses_created += 1;
        tracing::debug!(
            bus = %definition.name,
            context = context.0,
            top_level = parent.is_none(),
            "bus created"
        );

        if let Some(parent) = parent {
            if let Err(e) = self.connect(NodeRef::Bus(id), parent, ConnectionType::Direct, 0.0) {
                tracing::debug!(bus = %definition.name, error = %e, "parent link failed");
            }
        }
        for send in &definition.sends {
            let linked = self
                .resolve_bus(send.target, context, nesting + 1)
                .and_then(|target| self.connect(NodeRef::Bus(id), target, send.kind, send.gain_db));
            if let Err(e) = linked {
                tracing::debug!(bus = %definition.name, error = %e, "static send failed");
            }
        }
        Ok(id)
    }

    /// Looks up a live bus.
    pub fn bus(&self, id: BusId) -> Option<&BusNode> {
        self.buses.get(id.0)
    }

    /// Looks up a bus by key.
    pub fn bus_id(&self, key: BusKey) -> Option<BusId> {
        self.bus_index.get(&key).copied()
    }

    /// Returns the number of bus instances.
    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    /// Destroys a bus, unlinking it from its consumers and producers.
    pub fn remove_bus(&mut self, id: BusId) -> bool {
        let Some(bus) = self.buses.get(id.0) else {
            return false;
        };
        for conn in bus.outgoing.clone() {
            self.disconnect(conn);
        }
        let Some(node) = self.buses.remove(id.0) else {
            return false;
        };
        for (_, conn) in node.inputs.iter() {
            match conn.producer {
                NodeRef::Voice(h) => {
                    if let Some(voice) = self.voices.get_mut(h.0) {
                        voice.outgoing.retain(|c| c.bus != id);
                        voice.routing_dirty = true;
                    }
                }
                NodeRef::Bus(b) => {
                    if let Some(producer) = self.buses.get_mut(b.0) {
                        producer.outgoing.retain(|c| c.bus != id);
                    }
                }
            }
        }
        self.bus_index.remove(&node.key);
        self.dirty = true;
        self.stats.buses_destroyed += 1;
        tracing::debug!(def = node.key.def.0, context = node.key.context.0, "bus destroyed");
        true
    }

    // ── Connections ─────────────────────────────────────────────────────────

    /// Connects `producer` into `bus`.
    ///
    /// Idempotent: an existing connection of the same producer, consumer and
    /// type is returned unchanged.
    pub fn connect(
        &mut self,
        producer: NodeRef,
        bus: BusId,
        kind: ConnectionType,
        send_gain_db: f32,
    ) -> Result<ConnectionId, MixError> {
        if let Some(existing) = self.find_connection(producer, bus, kind) {
            return Ok(existing);
        }
        let (producer_key, context) = match producer {
            NodeRef::Voice(h) => {
                let voice = self
                    .voices
                    .get(h.0)
                    .ok_or_else(|| MixError::InvalidConnection("producer voice is gone".into()))?;
                if kind == ConnectionType::Feedback {
                    return Err(MixError::InvalidConnection(
                        "voices cannot feed a bus through a feedback send".into(),
                    ));
                }
                (ProducerKey::Voice(voice.id), voice.context)
            }
            NodeRef::Bus(b) => {
                let node = self
                    .buses
                    .get(b.0)
                    .ok_or_else(|| MixError::InvalidConnection("producer bus is gone".into()))?;
                if b == bus && kind != ConnectionType::Feedback {
                    return Err(MixError::InvalidConnection(
                        "a bus can only feed itself through a feedback send".into(),
                    ));
                }
                (ProducerKey::Bus(node.key), node.key.context)
            }
        };

        let max = self.config.max_connections_per_bus;
        let full = self
            .buses
            .get(bus.0)
            .ok_or_else(|| MixError::InvalidConnection("consumer bus is gone".into()))?
            .inputs
            .len()
            >= max;
        if full {
            return Err(self.allocation_failure(Resource::Connection));
        }

        let conn = MixConnection::new(producer, producer_key, kind, context, send_gain_db);
        let Some(consumer) = self.buses.get_mut(bus.0) else {
            return Err(MixError::InvalidConnection("consumer bus is gone".into()));
        };
        let slot = consumer.inputs.insert(conn);
        consumer.idle_frames = 0;
        let id = ConnectionId { bus, slot };

        match producer {
            NodeRef::Voice(h) => {
                if let Some(voice) = self.voices.get_mut(h.0) {
                    voice.outgoing.push(id);
                }
            }
            NodeRef::Bus(b) => {
                if let Some(node) = self.buses.get_mut(b.0) {
                    node.outgoing.push(id);
                }
                self.dirty = true;
            }
        }
        Ok(id)
    }

    /// Finds an existing connection of `producer` into `bus` with `kind`.
    pub fn find_connection(
        &self,
        producer: NodeRef,
        bus: BusId,
        kind: ConnectionType,
    ) -> Option<ConnectionId> {
        let outgoing = match producer {
            NodeRef::Voice(h) => &self.voices.get(h.0)?.outgoing,
            NodeRef::Bus(b) => &self.buses.get(b.0)?.outgoing,
        };
        let consumer = self.buses.get(bus.0)?;
        outgoing.iter().copied().find(|c| {
            c.bus == bus
                && consumer
                    .inputs
                    .get(c.slot)
                    .is_some_and(|conn| conn.kind == kind)
        })
    }

    /// Looks up a connection.
    pub fn connection(&self, id: ConnectionId) -> Option<&MixConnection> {
        self.buses.get(id.bus.0)?.inputs.get(id.slot)
    }

    /// Returns the stable key of a connection.
    pub fn connection_key(&self, id: ConnectionId) -> Option<ConnectionKey> {
        let bus = self.buses.get(id.bus.0)?;
        let conn = bus.inputs.get(id.slot)?;
        Some(ConnectionKey {
            producer: conn.producer_key,
            consumer: bus.key,
            kind: conn.kind,
        })
    }

    /// Removes a connection from both sides. Returns false if it was gone.
    pub fn disconnect(&mut self, id: ConnectionId) -> bool {
        let Some(conn) = self
            .buses
            .get_mut(id.bus.0)
            .and_then(|b| b.inputs.remove(id.slot))
        else {
            return false;
        };
        match conn.producer {
            NodeRef::Voice(h) => {
                if let Some(voice) = self.voices.get_mut(h.0) {
                    voice.outgoing.retain(|c| *c != id);
                    // Next Refresh reconnects whatever sends are still wanted.
                    voice.routing_dirty = true;
                }
            }
            NodeRef::Bus(b) => {
                if let Some(node) = self.buses.get_mut(b.0) {
                    node.outgoing.retain(|c| *c != id);
                }
                self.dirty = true;
            }
        }
        true
    }

    /// Nearest bus at or above `bus` on its parent chain that runs an HDR
    /// stage, with the gain in dB picked up on the way (bus volumes plus
    /// Direct link gains).
    pub(crate) fn hdr_owner(&self, bus: BusId) -> Option<(BusId, f32)> {
        let mut current = bus;
        let mut gain_db = 0.0;
        for _ in 0..=MAX_BUS_NESTING {
            let node = self.buses.get(current.0)?;
            gain_db += node.volume_db;
            if node.hdr.is_some() {
                return Some((current, gain_db));
            }
            let (parent, link_db) = node.outgoing.iter().find_map(|c| {
                let conn = self.buses.get(c.bus.0)?.inputs.get(c.slot)?;
                (conn.kind == ConnectionType::Direct).then(|| (c.bus, conn.level_db()))
            })?;
            gain_db += link_db;
            current = parent;
        }
        None
    }

    // ── Voices ──────────────────────────────────────────────────────────────

    /// Adds a voice. Fails when `max_voices` voices are live.
    pub(crate) fn add_voice(&mut self, voice: VoiceNode) -> Result<VoiceHandle, MixError> {
        if self.voices.len() >= self.config.max_voices {
            return Err(self.allocation_failure(Resource::Voice));
        }
        if self.voice_index.contains_key(&voice.id) {
            return Err(MixError::InvalidConnection(format!(
                "voice {:?} already playing",
                voice.id
            )));
        }
        let id = voice.id;
        let handle = VoiceHandle(self.voices.insert(voice));
        self.voice_index.insert(id, handle);
        Ok(handle)
    }

    /// Looks up a voice.
    pub fn voice(&self, id: VoiceId) -> Option<&VoiceNode> {
        let handle = self.voice_index.get(&id)?;
        self.voices.get(handle.0)
    }

    pub(crate) fn voice_mut(&mut self, id: VoiceId) -> Option<&mut VoiceNode> {
        let handle = self.voice_index.get(&id)?;
        self.voices.get_mut(handle.0)
    }

    /// Returns the handle of a live voice.
    pub fn voice_handle(&self, id: VoiceId) -> Option<VoiceHandle> {
        self.voice_index.get(&id).copied()
    }

    /// Returns the number of live voices.
    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Destroys a voice and its connections.
    pub fn remove_voice(&mut self, handle: VoiceHandle) -> bool {
        let Some(voice) = self.voices.get(handle.0) else {
            return false;
        };
        for conn in voice.outgoing.clone() {
            self.disconnect(conn);
        }
        match self.voices.remove(handle.0) {
            Some(voice) => {
                self.voice_index.remove(&voice.id);
                true
            }
            None => false,
        }
    }

    // ── Garbage collection ──────────────────────────────────────────────────

    /// Ages orphaned buses and destroys those past the grace period.
    ///
    /// A bus is orphaned when nothing but feedback feeds it and it is not a
    /// top-level bus of a registered context. Removal runs deepest-first, and
    /// parents orphaned by a removal are only aged from the next call on.
    pub fn collect_garbage(&mut self) -> Vec<BusId> {
        let grace = self.config.orphan_grace_frames;
        let mut doomed: Vec<(u64, u64, BusId)> = Vec::new();
        for (index, bus) in self.buses.iter_mut() {
            let protected = bus.top_level && self.contexts.contains_key(&bus.key.context);
            if protected || bus.live_input_count() > 0 {
                bus.idle_frames = 0;
                continue;
            }
            bus.idle_frames += 1;
            if bus.idle_frames >= grace {
                let depth = bus.depth.map_or(u64::MAX, u64::from);
                doomed.push((depth, bus.seq, BusId(index)));
            }
        }
        doomed.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        doomed
            .into_iter()
            .filter_map(|(_, _, id)| self.remove_bus(id).then_some(id))
            .collect()
    }

    /// Returns a structural snapshot for equality checks.
    pub fn snapshot(&self) -> GraphSnapshot {
        let mut buses: Vec<BusKey> = self.buses.iter().map(|(_, b)| b.key).collect();
        let mut connections: Vec<ConnectionKey> = self
            .buses
            .iter()
            .flat_map(|(_, bus)| {
                bus.inputs.iter().map(move |(_, conn)| ConnectionKey {
                    producer: conn.producer_key,
                    consumer: bus.key,
                    kind: conn.kind,
                })
            })
            .collect();
        buses.sort_unstable();
        connections.sort_unstable();
        GraphSnapshot { buses, connections }
    }

    /// Drains the per-frame counters.
    pub(crate) fn take_stats(&mut self) -> BuildStats {
        core::mem::take(&mut self.stats)
    }
}
