//! [`MixGraphContext`]: the engine instance.
//!
//! Owns the graph, the sorted topology, the buffer pool, the worker pool and
//! the collaborators. The audio thread calls
//! [`run_one_frame`](MixGraphContext::run_one_frame) once per tick; game
//! threads talk to it through cloned [`MixHandle`]s.

use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::collab::{DecodeBarrier, Monitor, ParameterSource, Sink};
use crate::config::MixConfig;
use crate::error::MixError;

use super::builder::Graph;
use super::catalog::BusCatalog;
use super::command::{Command, MixHandle};
use super::connection::{ConnectionId, ConnectionKey, ConnectionType};
use super::dispatch::Dispatcher;
use super::node::{
    BusDefId, BusId, BusKey, BusNode, NodeRef, RoutingContextId, VoiceId, VoiceNode, VoiceState,
};
use super::report::{BusSnapshot, ConnectionSnapshot, FrameSnapshot, GraphSnapshot};
use super::scheduler::OutputTable;
use super::topology::{self, SortedTopology};

/// A running mix graph.
///
/// # Example
///
/// ```rust
/// use mezcla_core::collab::{Sink, SinkStatus, Source, SourceStatus};
/// use mezcla_core::graph::{BusCatalog, BusDefId, BusDefinition, RoutingContextId};
/// use mezcla_core::{AudioBuffer, MixConfig, MixGraphContext};
///
/// struct Tone;
/// impl Source for Tone {
///     fn produce(&mut self, buffer: &mut AudioBuffer) -> SourceStatus {
///         for c in 0..buffer.num_channels() {
///             buffer.channel_mut(c).fill(0.25);
///         }
///         buffer.set_valid_frames(buffer.capacity());
///         SourceStatus::DataReady
///     }
/// }
///
/// struct Speakers;
/// impl Sink for Speakers {
///     fn push(&mut self, _buffer: &AudioBuffer, _gain: f32) -> SinkStatus {
///         SinkStatus::Accepted
///     }
/// }
///
/// let master = BusDefId(0);
/// let catalog = BusCatalog::new().with(BusDefinition::new(master, "master")).unwrap();
/// let mut mix = MixGraphContext::new(MixConfig::default(), catalog).unwrap();
/// mix.register_context(RoutingContextId(0), Speakers, 1.0);
///
/// let voice = mix.handle().play(RoutingContextId(0), master, Tone);
/// let report = mix.run_one_frame();
/// assert_eq!(report.voices_produced, 1);
/// assert!(mix.voice_state(voice).is_some());
/// ```
pub struct MixGraphContext {
    pub(crate) config: MixConfig,
    pub(crate) graph: Graph,
    pub(crate) topology: SortedTopology,
    pub(crate) pool: BufferPool,
    pub(crate) table: OutputTable,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) handle: MixHandle,
    pub(crate) parameters: Option<Box<dyn ParameterSource>>,
    pub(crate) monitor: Option<Box<dyn Monitor>>,
    pub(crate) barrier: Option<Arc<dyn DecodeBarrier>>,
    pub(crate) frame: u64,
    pub(crate) commands: Vec<Command>,
}

impl core::fmt::Debug for MixGraphContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MixGraphContext")
            .field("frame", &self.frame)
            .field("graph", &self.graph)
            .field("dispatcher", &self.dispatcher)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl MixGraphContext {
    /// Creates an engine over a bus catalogue.
    ///
    /// Fails if the config doesn't validate or the worker pool can't start.
    pub fn new(config: MixConfig, catalog: BusCatalog) -> Result<Self, MixError> {
        config.validate()?;
        let dispatcher = Dispatcher::new(config.worker_threads)?;
        tracing::debug!(
            sample_rate = config.sample_rate,
            frame_size = config.frame_size,
            workers = dispatcher.threads(),
            buses = catalog.len(),
            "mix graph created"
        );
        Ok(Self {
            pool: BufferPool::new(config.initial_buffers, config.frame_size),
            graph: Graph::new(config.clone(), catalog),
            topology: SortedTopology::default(),
            table: OutputTable::default(),
            dispatcher,
            handle: MixHandle::new(),
            parameters: None,
            monitor: None,
            barrier: None,
            frame: 0,
            commands: Vec::new(),
            config,
        })
    }

    /// Returns a handle for game threads.
    pub fn handle(&self) -> MixHandle {
        self.handle.clone()
    }

    /// Returns the engine settings.
    pub fn config(&self) -> &MixConfig {
        &self.config
    }

    /// Installs the parameter collaborator.
    pub fn set_parameter_source(&mut self, source: impl ParameterSource + 'static) {
        self.parameters = Some(Box::new(source));
    }

    /// Installs the monitoring collaborator.
    pub fn set_monitor(&mut self, monitor: impl Monitor + 'static) {
        self.monitor = Some(Box::new(monitor));
    }

    /// Installs the hardware decode barrier.
    pub fn set_decode_barrier(&mut self, barrier: Arc<dyn DecodeBarrier>) {
        self.barrier = Some(barrier);
    }

    // ── Graph ───────────────────────────────────────────────────────────────

    /// Registers a routing context and its sink.
    pub fn register_context(
        &mut self,
        context: RoutingContextId,
        sink: impl Sink + 'static,
        gain: f32,
    ) {
        self.graph.register_context(context, Some(Box::new(sink)), gain);
    }

    /// Unregisters a context and stops its voices.
    pub fn unregister_context(&mut self, context: RoutingContextId) {
        if !self.graph.unregister_context(context) {
            return;
        }
        let mut stopped = 0usize;
        for (_, voice) in self.graph.voices.iter_mut() {
            if voice.context == context && voice.state != VoiceState::Stop {
                voice.state = VoiceState::Stop;
                stopped += 1;
            }
        }
        tracing::debug!(context = context.0, voices = stopped, "context unregistered");
    }

    /// Returns the bus instance of `def` in `context`, creating it if needed.
    pub fn get_or_create_bus(
        &mut self,
        def: BusDefId,
        context: RoutingContextId,
    ) -> Result<BusId, MixError> {
        self.graph.get_or_create_bus(def, context)
    }

    /// Connects a bus into another bus.
    pub fn connect(
        &mut self,
        producer: BusId,
        consumer: BusId,
        kind: ConnectionType,
        send_gain_db: f32,
    ) -> Result<ConnectionId, MixError> {
        self.graph
            .connect(NodeRef::Bus(producer), consumer, kind, send_gain_db)
    }

    /// Removes a connection.
    pub fn disconnect(&mut self, connection: ConnectionId) -> bool {
        self.graph.disconnect(connection)
    }

    /// Looks up a bus by key.
    pub fn bus_id(&self, key: BusKey) -> Option<BusId> {
        self.graph.bus_id(key)
    }

    /// Looks up a live bus.
    pub fn bus(&self, id: BusId) -> Option<&BusNode> {
        self.graph.bus(id)
    }

    /// Looks up a live bus by key.
    pub fn bus_by_key(&self, key: BusKey) -> Option<&BusNode> {
        self.graph.bus_id(key).and_then(|id| self.graph.bus(id))
    }

    /// Read access to the graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Returns the playback state of a voice, if it is live.
    pub fn voice_state(&self, voice: VoiceId) -> Option<VoiceState> {
        self.graph.voice(voice).map(|v| v.state())
    }

    /// Looks up a live voice.
    pub fn voice(&self, voice: VoiceId) -> Result<&VoiceNode, MixError> {
        self.graph.voice(voice).ok_or(MixError::UnknownVoice(voice))
    }

    // ── Topology and inspection ─────────────────────────────────────────────

    /// Returns the topology of the last sort.
    pub fn topology(&self) -> &SortedTopology {
        &self.topology
    }

    /// Re-sorts now, whether or not the graph changed.
    pub fn resort(&mut self) -> &SortedTopology {
        topology::resort(&mut self.graph, &mut self.topology);
        &self.topology
    }

    /// Returns a structural snapshot of the graph.
    pub fn snapshot(&self) -> GraphSnapshot {
        self.graph.snapshot()
    }

    /// Builds the snapshot a [`Monitor`] receives.
    pub fn frame_snapshot(&self) -> FrameSnapshot {
        let mut buses = Vec::with_capacity(self.topology.order().len());
        let mut connections = Vec::new();
        for &id in self.topology.order() {
            let Some(bus) = self.graph.bus(id) else {
                continue;
            };
            buses.push(BusSnapshot {
                key: bus.key,
                depth: bus.depth,
                top_level: bus.top_level,
                meter: bus.meter,
                volume_db: bus.volume_db,
                hdr_reduction_db: bus.hdr_reduction_db(),
            });
            for (_, conn) in bus.inputs.iter() {
                connections.push(ConnectionSnapshot {
                    key: ConnectionKey {
                        producer: conn.producer_key,
                        consumer: bus.key,
                        kind: conn.kind,
                    },
                    gain: conn.gain.current,
                    lpf: conn.lpf.current,
                    hpf: conn.hpf.current,
                    audible: conn.is_audible(),
                    late: conn.late,
                });
            }
        }
        FrameSnapshot {
            frame: self.frame,
            has_cycles: self.topology.has_cycles(),
            buses,
            connections,
        }
    }

    /// Returns the buffer pool.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Returns the number of buses holding a feedback latch.
    pub fn latched_buses(&self) -> usize {
        self.table.latch_count()
    }

    /// Returns the number of frames run so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Returns the number of live bus instances.
    pub fn bus_count(&self) -> usize {
        self.graph.bus_count()
    }

    /// Returns the number of live voices.
    pub fn voice_count(&self) -> usize {
        self.graph.voice_count()
    }
}
