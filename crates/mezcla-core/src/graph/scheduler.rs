//! Frame scheduler: one [`run_one_frame`](MixGraphContext::run_one_frame)
//! per audio tick.
//!
//! ```text
//! Refresh ─► Decode barrier ─► Voices (parallel) ─► Buses, deepest bucket first
//!    │                                                  │
//!    │         commands, routing, parameters, HDR,      ├─► Sinks (top-level buses)
//!    │         resort if dirty                          ├─► Feedback latches
//!    │                                                  └─► Release ─► GC
//! ```
//!
//! Produced buffers live in an [`OutputTable`] keyed by arena slot, so the
//! parallel phases need nothing but `&mut` to their own node and a shared
//! read of the table. A parallel bucket publishes once every member is done;
//! a sequential bucket publishes after each bus, so later members see the
//! current output of earlier ones.

use core::time::Duration;
use std::collections::HashMap;

use thunderdome::Index;

use crate::buffer::{AudioBuffer, BufferPool, ChannelConfig};
use crate::collab::{SinkStatus, SourceStatus};
use crate::error::MixError;
use crate::math::db_to_linear;

use super::command::Command;
use super::connection::{ConnectionId, ConnectionKey};
use super::context::MixGraphContext;
use super::node::{BusId, BusNode, NodeRef, VoiceHandle, VoiceNode, VoiceState};
use super::report::{ExecutedNode, FrameReport};
use super::topology;

type Slots = Vec<Option<(Index, AudioBuffer)>>;

fn slot_mut(slots: &mut Slots, index: Index) -> &mut Option<(Index, AudioBuffer)> {
    let slot = index.slot() as usize;
    if slots.len() <= slot {
        slots.resize_with(slot + 1, || None);
    }
    &mut slots[slot]
}

fn lookup(slots: &Slots, index: Index) -> Option<&AudioBuffer> {
    match slots.get(index.slot() as usize)? {
        Some((owner, buffer)) if *owner == index => Some(buffer),
        _ => None,
    }
}

fn put(slots: &mut Slots, index: Index, buffer: AudioBuffer, pool: &mut BufferPool) {
    if let Some((_, old)) = slot_mut(slots, index).replace((index, buffer)) {
        pool.release(old);
    }
}

fn release_all(slots: &mut Slots, pool: &mut BufferPool) {
    for entry in slots.iter_mut() {
        if let Some((_, buffer)) = entry.take() {
            pool.release(buffer);
        }
    }
}

/// Where a bus's voice inputs answer for HDR, as of last frame.
#[derive(Clone, Copy)]
struct HdrRoute {
    owner: BusId,
    /// Bus volumes and link gains between the voice's bus and the owner.
    gain_db: f32,
    reduction_db: f32,
    floor_db: Option<f32>,
}

/// This frame's published outputs plus each latched bus's previous output.
///
/// Entries are generation-checked: a reused arena slot never sees the
/// buffer of the node that held it before.
#[derive(Debug, Default)]
pub(crate) struct OutputTable {
    voices: Slots,
    buses: Slots,
    latches: Slots,
}

impl OutputTable {
    pub(crate) fn publish_voice(
        &mut self,
        voice: VoiceHandle,
        buffer: AudioBuffer,
        pool: &mut BufferPool,
    ) {
        put(&mut self.voices, voice.0, buffer, pool);
    }

    pub(crate) fn publish_bus(&mut self, bus: BusId, buffer: AudioBuffer, pool: &mut BufferPool) {
        put(&mut self.buses, bus.0, buffer, pool);
    }

    pub(crate) fn voice_output(&self, voice: VoiceHandle) -> Option<&AudioBuffer> {
        lookup(&self.voices, voice.0)
    }

    pub(crate) fn bus_output(&self, bus: BusId) -> Option<&AudioBuffer> {
        lookup(&self.buses, bus.0)
    }

    pub(crate) fn latch(&self, bus: BusId) -> Option<&AudioBuffer> {
        lookup(&self.latches, bus.0)
    }

    /// Copies the bus's current output into its latch (silence if it didn't run).
    pub(crate) fn store_latch(&mut self, bus: BusId, pool: &mut BufferPool) {
        let mut latch = match slot_mut(&mut self.latches, bus.0).take() {
            Some((owner, buffer)) if owner == bus.0 => buffer,
            Some((_, stale)) => {
                pool.release(stale);
                pool.acquire(ChannelConfig::default())
            }
            None => pool.acquire(ChannelConfig::default()),
        };
        match lookup(&self.buses, bus.0) {
            Some(output) => latch.copy_from(output),
            None => latch.clear(),
        }
        *slot_mut(&mut self.latches, bus.0) = Some((bus.0, latch));
    }

    /// Releases whatever latch occupies the bus's slot.
    pub(crate) fn drop_latch(&mut self, bus: BusId, pool: &mut BufferPool) {
        if let Some(entry) = self.latches.get_mut(bus.0.slot() as usize) {
            if let Some((_, buffer)) = entry.take() {
                pool.release(buffer);
            }
        }
    }

    /// Releases everything held for a destroyed bus.
    pub(crate) fn forget(&mut self, bus: BusId, pool: &mut BufferPool) {
        for slots in [&mut self.buses, &mut self.latches] {
            if let Some(entry) = slots.get_mut(bus.0.slot() as usize) {
                if entry.as_ref().is_some_and(|(owner, _)| *owner == bus.0) {
                    if let Some((_, buffer)) = entry.take() {
                        pool.release(buffer);
                    }
                }
            }
        }
    }

    /// Returns this frame's voice and bus outputs to the pool. Latches stay.
    pub(crate) fn release_outputs(&mut self, pool: &mut BufferPool) {
        release_all(&mut self.voices, pool);
        release_all(&mut self.buses, pool);
    }

    pub(crate) fn latch_count(&self) -> usize {
        self.latches.iter().filter(|e| e.is_some()).count()
    }
}

impl BusNode {
    /// Mixes inputs, runs effects and volume into the acquired output buffer.
    ///
    /// Runs on a worker thread during a parallel bucket.
    pub(crate) fn consume(&mut self, table: &OutputTable, sample_rate: f32, metering: bool) {
        let Some(mut out) = self.output.take() else {
            return;
        };
        out.fill_silence();

        for (_, conn) in self.inputs.iter_mut() {
            let src = match conn.producer {
                NodeRef::Voice(h) => table.voice_output(h),
                NodeRef::Bus(b) if conn.late => table.latch(b),
                NodeRef::Bus(b) => table.bus_output(b),
            };
            if let Some(src) = src {
                conn.mix_into(src, &mut out, sample_rate);
            }
        }

        if let Some(scratch) = self.scratch.as_mut() {
            let key = self.key;
            for slot in &mut self.effects {
                if let Err(e) = slot.run(&mut out, scratch) {
                    self.frame_failures += 1;
                    tracing::warn!(
                        def = key.def.0,
                        context = key.context.0,
                        effect = slot.name(),
                        error = %e,
                        "effect failed, bypassing from now on"
                    );
                }
            }
        }

        out.apply_gain_ramp(self.volume.previous, self.volume.current);
        if metering {
            self.meter = out.meter();
        }
        self.output = Some(out);
    }
}

impl MixGraphContext {
    /// Runs one audio tick and reports what happened.
    ///
    /// Never fails: node-level problems (capacity, source or effect
    /// failures, refused sinks) are contained and counted in the report.
    pub fn run_one_frame(&mut self) -> FrameReport {
        let mut report = FrameReport {
            frame: self.frame,
            ..FrameReport::default()
        };

        self.refresh(&mut report);
        self.wait_for_decoder();
        self.produce_voices(&mut report);
        self.consume_buses(&mut report);
        self.push_to_sinks(&mut report);
        self.latch_feedback();
        self.table.release_outputs(&mut self.pool);
        self.end_frame(&mut report);

        tracing::trace!(
            frame = report.frame,
            voices = report.voices_produced,
            buses = report.buses_processed,
            "frame done"
        );
        self.frame += 1;
        report
    }

    // ── Refresh ─────────────────────────────────────────────────────────────

    fn refresh(&mut self, report: &mut FrameReport) {
        if !self.handle.try_drain_into(&mut self.commands) {
            tracing::trace!(frame = self.frame, "command queue busy, retrying next frame");
        }
        let mut commands = core::mem::take(&mut self.commands);
        for command in commands.drain(..) {
            self.apply_command(command);
        }
        self.commands = commands;

        let dirty: Vec<VoiceHandle> = self
            .graph
            .voices
            .iter()
            .filter(|(_, v)| v.routing_dirty && v.state != VoiceState::Stop)
            .map(|(index, _)| VoiceHandle(index))
            .collect();
        for handle in dirty {
            self.route_voice(handle);
        }

        self.resolve_parameters();
        self.run_hdr();

        if self.graph.dirty {
            topology::resort(&mut self.graph, &mut self.topology);
            report.resorted = true;
        }

        for (_, voice) in self.graph.voices.iter_mut() {
            if voice.state == VoiceState::Init {
                voice.state = VoiceState::Play;
            }
        }
        tracing::trace!(frame = self.frame, "refresh done");
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::Play(req) => {
                if !self.graph.has_context(req.context) {
                    tracing::warn!(
                        voice = req.voice.0,
                        context = req.context.0,
                        "play for unregistered context ignored"
                    );
                    return;
                }
                let mut voice = VoiceNode::new(req.voice, req.context, req.output_bus, req.source);
                voice.sends = req.sends;
                voice.loudness_db = req.loudness_db;
                if let Err(e) = self.graph.add_voice(voice) {
                    tracing::debug!(voice = req.voice.0, error = %e, "voice not started");
                }
            }
            Command::Stop(id) => {
                if let Some(voice) = self.graph.voice_mut(id) {
                    voice.state = VoiceState::Stop;
                }
            }
            Command::Pause(id) => {
                if let Some(voice) = self.graph.voice_mut(id) {
                    if matches!(voice.state, VoiceState::Init | VoiceState::Play) {
                        voice.state = VoiceState::Pause;
                    }
                }
            }
            Command::Resume(id) => {
                if let Some(voice) = self.graph.voice_mut(id) {
                    if voice.state == VoiceState::Pause {
                        voice.state = VoiceState::Play;
                    }
                }
            }
            Command::SetLoudness { voice, loudness_db } => {
                if let Some(voice) = self.graph.voice_mut(voice) {
                    voice.loudness_db = loudness_db;
                }
            }
            Command::SetSends { voice, sends } => {
                if let Some(voice) = self.graph.voice_mut(voice) {
                    voice.sends = sends;
                    voice.routing_dirty = true;
                }
            }
            Command::SetOutputBus { voice, bus } => {
                if let Some(voice) = self.graph.voice_mut(voice) {
                    voice.output_bus = bus;
                    voice.routing_dirty = true;
                }
            }
            Command::SetEffectBypass { bus, slot, bypass } => {
                let effect = self
                    .graph
                    .bus_id(bus)
                    .and_then(|id| self.graph.buses.get_mut(id.0))
                    .and_then(|node| node.effects.get_mut(slot));
                match effect {
                    Some(effect) => effect.set_bypass(bypass),
                    None => {
                        tracing::debug!(def = bus.def.0, slot, "bypass for missing effect slot");
                    }
                }
            }
            Command::RegisterContext {
                context,
                sink,
                gain,
            } => self.graph.register_context(context, Some(sink), gain),
            Command::UnregisterContext(context) => self.unregister_context(context),
            Command::SetContextGain { context, gain } => {
                self.graph.set_context_gain(context, gain);
            }
        }
    }

    /// Connects a voice to every bus it should feed and drops stale links.
    fn route_voice(&mut self, handle: VoiceHandle) {
        let Some(voice) = self.graph.voices.get(handle.0) else {
            return;
        };
        let context = voice.context;
        let id = voice.id;
        let desired: Vec<_> = voice.desired_sends().collect();

        let mut keep: Vec<ConnectionId> = Vec::with_capacity(desired.len());
        let mut complete = true;
        for send in desired {
            let linked = self
                .graph
                .get_or_create_bus(send.bus, context)
                .and_then(|bus| {
                    self.graph
                        .connect(NodeRef::Voice(handle), bus, send.kind, send.gain_db)
                });
            match linked {
                Ok(conn) => {
                    if let Some(c) = self
                        .graph
                        .buses
                        .get_mut(conn.bus.0)
                        .and_then(|b| b.inputs.get_mut(conn.slot))
                    {
                        c.send_gain_db = send.gain_db;
                    }
                    keep.push(conn);
                }
                Err(e) => {
                    // Only capacity failures are retried.
                    if matches!(e, MixError::AllocationFailure(_)) {
                        complete = false;
                    }
                    tracing::debug!(
                        voice = id.0,
                        bus = send.bus.0,
                        error = %e,
                        "voice send not connected"
                    );
                }
            }
        }

        let stale: Vec<ConnectionId> = self
            .graph
            .voices
            .get(handle.0)
            .map(|v| v.outgoing.iter().copied().filter(|c| !keep.contains(c)).collect())
            .unwrap_or_default();
        for conn in stale {
            self.graph.disconnect(conn);
        }
        if let Some(voice) = self.graph.voices.get_mut(handle.0) {
            voice.routing_dirty = !complete;
        }
    }

    fn resolve_parameters(&mut self) {
        if let Some(params) = self.parameters.as_mut() {
            for (_, bus) in self.graph.buses.iter_mut() {
                let consumer = bus.key;
                params.bus_volume_db(consumer, &mut bus.volume_db);
                for (_, conn) in bus.inputs.iter_mut() {
                    let key = ConnectionKey {
                        producer: conn.producer_key,
                        consumer,
                        kind: conn.kind,
                    };
                    params.connection_targets(&key, &mut conn.params);
                }
            }
        }
        for (_, bus) in self.graph.buses.iter_mut() {
            bus.volume.set(db_to_linear(bus.volume_db));
        }
    }

    /// Applies last frame's HDR reduction and window, then advances each stage.
    ///
    /// A voice answers to the nearest HDR bus at or above the bus it feeds,
    /// so a stage on a group bus covers every voice routed into its children.
    fn run_hdr(&mut self) {
        let routes: HashMap<BusId, HdrRoute> = self
            .graph
            .buses
            .iter()
            .filter(|(_, bus)| {
                bus.inputs
                    .iter()
                    .any(|(_, c)| matches!(c.producer, NodeRef::Voice(_)))
            })
            .filter_map(|(index, _)| {
                let (owner, gain_db) = self.graph.hdr_owner(BusId(index))?;
                let hdr = self.graph.buses.get(owner.0)?.hdr.as_ref()?;
                let route = HdrRoute {
                    owner,
                    gain_db,
                    reduction_db: hdr.reduction_db(),
                    floor_db: hdr.window_floor_db(),
                };
                Some((BusId(index), route))
            })
            .collect();

        let mut loudest: HashMap<BusId, f32> = HashMap::new();
        let voices = &self.graph.voices;
        for (index, bus) in self.graph.buses.iter_mut() {
            let route = routes.get(&BusId(index)).copied();
            for (_, conn) in bus.inputs.iter_mut() {
                let NodeRef::Voice(h) = conn.producer else {
                    continue;
                };
                let Some(route) = route else {
                    conn.hdr_reduction_db = 0.0;
                    conn.window_audible = true;
                    continue;
                };
                let Some(voice) = voices.get(h.0) else {
                    continue;
                };
                let level = voice.loudness_db + conn.level_db() + route.gain_db;
                conn.hdr_reduction_db = route.reduction_db;
                conn.window_audible = route.floor_db.is_none_or(|f| level >= f);
                let sounding = matches!(voice.state, VoiceState::Init | VoiceState::Play);
                if sounding && conn.params.audible {
                    loudest
                        .entry(route.owner)
                        .and_modify(|l| *l = l.max(level))
                        .or_insert(level);
                }
            }
        }

        for (index, bus) in self.graph.buses.iter_mut() {
            if let Some(hdr) = bus.hdr.as_mut() {
                hdr.update(loudest.get(&BusId(index)).copied());
            }
            for (_, conn) in bus.inputs.iter_mut() {
                conn.commit_targets();
            }
        }
    }

    // ── Production ──────────────────────────────────────────────────────────

    fn wait_for_decoder(&mut self) {
        let mut waiting = false;
        for (_, voice) in self.graph.voices.iter_mut() {
            voice.barrier_timed_out = false;
            waiting |= voice.state == VoiceState::Play && voice.source.requires_decode_barrier();
        }
        if !waiting {
            return;
        }
        let Some(barrier) = self.barrier.as_ref() else {
            return;
        };
        let timeout = Duration::from_millis(self.config.decode_barrier_timeout_ms);
        if barrier.wait(timeout) {
            return;
        }
        tracing::warn!(frame = self.frame, ?timeout, "decode barrier timed out");
        for (_, voice) in self.graph.voices.iter_mut() {
            if voice.state == VoiceState::Play && voice.source.requires_decode_barrier() {
                voice.barrier_timed_out = true;
            }
        }
    }

    fn produce_voices(&mut self, report: &mut FrameReport) {
        for (_, voice) in self.graph.voices.iter_mut() {
            if voice.state == VoiceState::Play {
                self.pool.release_slot(&mut voice.output);
                voice.output = Some(self.pool.acquire(voice.channels));
            }
        }

        let mut playing: Vec<&mut VoiceNode> = self
            .graph
            .voices
            .iter_mut()
            .map(|(_, v)| v)
            .filter(|v| v.output.is_some())
            .collect();
        self.dispatcher
            .for_each_mut(&mut playing, self.config.voice_batch_size, |voice| voice.produce());
        drop(playing);

        let record = self.config.record_execution;
        for (index, voice) in self.graph.voices.iter_mut() {
            let Some(buffer) = voice.output.take() else {
                continue;
            };
            report.voices_produced += 1;
            if record {
                report.execution.push(ExecutedNode::Voice(voice.id));
            }
            if voice.starvation_onset {
                voice.starvation_onset = false;
                report.starvation_events += 1;
            }
            match voice.last_status.take() {
                Some(SourceStatus::NoMoreData) => voice.state = VoiceState::Stop,
                Some(SourceStatus::Fail) => {
                    voice.state = VoiceState::Stop;
                    report.producer_failures += 1;
                }
                _ => {}
            }
            self.table
                .publish_voice(VoiceHandle(index), buffer, &mut self.pool);
        }
        tracing::trace!(frame = self.frame, voices = report.voices_produced, "voices produced");
    }

    // ── Buses ───────────────────────────────────────────────────────────────

    fn consume_buses(&mut self, report: &mut FrameReport) {
        let Self {
            graph,
            topology,
            pool,
            table,
            dispatcher,
            config,
            ..
        } = self;
        let sample_rate = config.sample_rate;
        let metering = config.metering;

        for bucket in topology.buckets().iter().rev() {
            let members = topology.members(bucket);
            for &id in members {
                if let Some(bus) = graph.buses.get_mut(id.0) {
                    pool.release_slot(&mut bus.output);
                    bus.output = Some(pool.acquire(bus.channels));
                }
            }

            let parallel = config.parallel_buses
                && dispatcher.is_parallel()
                && !bucket.sequential
                && members.len() > 1;
            if parallel {
                let mut nodes: Vec<&mut BusNode> = graph
                    .buses
                    .iter_mut()
                    .map(|(_, b)| b)
                    .filter(|b| b.depth == Some(bucket.depth))
                    .collect();
                let shared: &OutputTable = table;
                dispatcher.for_each_mut(&mut nodes, 1, |bus| {
                    bus.consume(shared, sample_rate, metering);
                });
                drop(nodes);
                for &id in members {
                    if let Some(bus) = graph.buses.get_mut(id.0) {
                        if let Some(buffer) = bus.output.take() {
                            table.publish_bus(id, buffer, pool);
                        }
                    }
                }
            } else {
                for &id in members {
                    if let Some(bus) = graph.buses.get_mut(id.0) {
                        bus.consume(table, sample_rate, metering);
                        if let Some(buffer) = bus.output.take() {
                            table.publish_bus(id, buffer, pool);
                        }
                    }
                }
            }

            for &id in members {
                if let Some(bus) = graph.buses.get_mut(id.0) {
                    report.buses_processed += 1;
                    report.producer_failures += core::mem::take(&mut bus.frame_failures);
                    if config.record_execution {
                        report.execution.push(ExecutedNode::Bus(bus.key));
                    }
                }
            }
            tracing::trace!(
                depth = bucket.depth,
                buses = members.len(),
                parallel,
                sequential = bucket.sequential,
                "bucket done"
            );
        }
    }

    fn push_to_sinks(&mut self, report: &mut FrameReport) {
        for &id in self.topology.reached() {
            let Some(bus) = self.graph.buses.get(id.0) else {
                continue;
            };
            if !bus.top_level {
                continue;
            }
            let Some(buffer) = self.table.bus_output(id) else {
                continue;
            };
            let Some(entry) = self.graph.contexts.get_mut(&bus.key.context) else {
                continue;
            };
            let gain = entry.gain;
            if let Some(sink) = entry.sink.as_mut() {
                if sink.push(buffer, gain) == SinkStatus::NotReady {
                    report.dropped_outputs += 1;
                    tracing::debug!(
                        def = bus.key.def.0,
                        context = bus.key.context.0,
                        "sink not ready, output dropped"
                    );
                }
            }
        }
    }

    fn latch_feedback(&mut self) {
        for (index, bus) in self.graph.buses.iter() {
            let id = BusId(index);
            if bus.needs_latch {
                self.table.store_latch(id, &mut self.pool);
            } else {
                self.table.drop_latch(id, &mut self.pool);
            }
        }
    }

    // ── End of frame ────────────────────────────────────────────────────────

    fn end_frame(&mut self, report: &mut FrameReport) {
        for (_, bus) in self.graph.buses.iter_mut() {
            bus.volume.advance();
            for (_, conn) in bus.inputs.iter_mut() {
                conn.advance();
            }
        }

        let stopped: Vec<VoiceHandle> = self
            .graph
            .voices
            .iter()
            .filter(|(_, v)| v.state == VoiceState::Stop)
            .map(|(index, _)| VoiceHandle(index))
            .collect();
        for handle in stopped {
            if self.graph.remove_voice(handle) {
                report.voices_stopped += 1;
            }
        }

        for id in self.graph.collect_garbage() {
            self.table.forget(id, &mut self.pool);
        }

        let stats = self.graph.take_stats();
        report.allocation_failures += stats.allocation_failures;
        report.buses_created = stats.buses_created;
        report.buses_destroyed = stats.buses_destroyed;
        report.has_cycles = self.topology.has_cycles();

        if self.monitor.is_some() {
            let snapshot = self.frame_snapshot();
            if let Some(monitor) = self.monitor.as_mut() {
                monitor.on_frame(&snapshot);
            }
        }
    }
}
