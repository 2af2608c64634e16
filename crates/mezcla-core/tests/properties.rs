//! Property-based tests for mezcla-core topology and mixing.
//!
//! Generates random bus hierarchies (a parent tree plus extra sends) and
//! checks the ordering guarantees of the sorter, the cycle handling of
//! feedback sends, and that voices sum into the master exactly once.

use std::sync::{Arc, Mutex};

use mezcla_core::graph::{BusId, ProducerKey};
use mezcla_core::{
    AudioBuffer, BufferPool, BusCatalog, BusDefId, BusDefinition, BusKey, ChannelConfig,
    ConnectionType, MixConfig, MixGraphContext, RoutingContextId, Sink, SinkStatus, Source,
    SourceStatus,
};
use proptest::prelude::*;

const CTX: RoutingContextId = RoutingContextId(0);

struct Null;

impl Sink for Null {
    fn push(&mut self, _buffer: &AudioBuffer, _gain: f32) -> SinkStatus {
        SinkStatus::Accepted
    }
}

#[derive(Clone, Default)]
struct FirstSample(Arc<Mutex<Vec<f32>>>);

impl Sink for FirstSample {
    fn push(&mut self, buffer: &AudioBuffer, gain: f32) -> SinkStatus {
        self.0.lock().unwrap().push(buffer.channel(0)[0] * gain);
        SinkStatus::Accepted
    }
}

struct Constant(f32);

impl Source for Constant {
    fn channels(&self) -> ChannelConfig {
        ChannelConfig::MONO
    }

    fn produce(&mut self, buffer: &mut AudioBuffer) -> SourceStatus {
        buffer.channel_mut(0).fill(self.0);
        buffer.set_valid_frames(buffer.capacity());
        SourceStatus::DataReady
    }
}

/// Bus 0 is the master; bus `i` hangs off `parents[i - 1] % i`, so the parent
/// tree is acyclic.
fn tree(parents: &[usize]) -> Vec<BusDefinition> {
    (0..=parents.len())
        .map(|i| {
            let def = BusDefinition::new(BusDefId(i as u32), format!("bus{i}"));
            if i == 0 {
                def
            } else {
                def.with_parent(BusDefId((parents[i - 1] % i) as u32))
            }
        })
        .collect()
}

/// Builds [`tree`] plus one send per `(from, to)` pair that `kind` accepts,
/// and instantiates every bus.
fn build(
    parents: &[usize],
    sends: &[(usize, usize)],
    kind: impl Fn(usize, usize) -> Option<ConnectionType>,
) -> MixGraphContext {
    let n = parents.len() + 1;
    let mut defs = tree(parents);
    for &(from, to) in sends {
        let (from, to) = (from % n, to % n);
        if let Some(kind) = kind(from, to) {
            let def = defs[from].clone();
            defs[from] = def.with_send(BusDefId(to as u32), kind, -3.0);
        }
    }

    let mut catalog = BusCatalog::new();
    for def in defs {
        catalog.insert(def).unwrap();
    }
    let mut mix = MixGraphContext::new(MixConfig::default(), catalog).unwrap();
    mix.register_context(CTX, Null, 1.0);
    for i in 0..n {
        mix.get_or_create_bus(BusDefId(i as u32), CTX).unwrap();
    }
    mix
}

fn id(mix: &MixGraphContext, def: usize) -> BusId {
    mix.bus_id(BusKey::new(BusDefId(def as u32), CTX)).unwrap()
}

/// Every bus-to-bus connection as (producer, consumer, kind).
fn bus_edges(mix: &MixGraphContext) -> Vec<(BusId, BusId, ConnectionType)> {
    mix.snapshot()
        .connections
        .iter()
        .filter_map(|key| match key.producer {
            ProducerKey::Bus(producer) => Some((
                mix.bus_id(producer).unwrap(),
                mix.bus_id(key.consumer).unwrap(),
                key.kind,
            )),
            ProducerKey::Voice(_) => None,
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// With sends only pointing towards lower-numbered buses, the graph is a
    /// DAG: no cycles, no sequential buckets, and every producer sorts after
    /// its consumer.
    #[test]
    fn dag_producers_sort_deeper_than_consumers(
        parents in prop::collection::vec(0usize..64, 1..12),
        sends in prop::collection::vec((0usize..64, 0usize..64), 0..8),
    ) {
        let mut mix = build(&parents, &sends, |from, to| {
            (to < from).then_some(ConnectionType::Aux)
        });
        let topo = mix.resort().clone();

        prop_assert!(!topo.has_cycles());
        prop_assert!(topo.buckets().iter().all(|b| !b.sequential));
        prop_assert_eq!(topo.reached().len(), parents.len() + 1);
        for (producer, consumer, _) in bus_edges(&mix) {
            let p = topo.position(producer).unwrap();
            let c = topo.position(consumer).unwrap();
            prop_assert!(p > c, "producer at {} must follow consumer at {}", p, c);
            let depth = |bus: BusId| mix.bus(bus).unwrap().depth();
            prop_assert!(depth(producer) > depth(consumer));
        }
    }

    /// Sorting an unchanged graph again gives the same order and buckets.
    #[test]
    fn resort_is_idempotent(
        parents in prop::collection::vec(0usize..64, 1..12),
        sends in prop::collection::vec((0usize..64, 0usize..64), 0..8),
        feedback in any::<bool>(),
    ) {
        let mut mix = build(&parents, &sends, |from, to| {
            if from == to {
                None
            } else if to < from {
                Some(ConnectionType::Aux)
            } else if feedback {
                Some(ConnectionType::Feedback)
            } else {
                None
            }
        });
        let first = mix.resort().clone();
        let second = mix.resort().clone();

        prop_assert_eq!(first.order(), second.order());
        prop_assert_eq!(first.buckets(), second.buckets());
        prop_assert_eq!(first.has_cycles(), second.has_cycles());
        prop_assert_eq!(second.generation(), first.generation() + 1);
    }

    /// A feedback send puts both of its endpoints in one sequential bucket
    /// and marks the edge late.
    #[test]
    fn feedback_endpoints_share_a_sequential_bucket(
        parents in prop::collection::vec(0usize..64, 1..12),
        from in 0usize..64,
        to in 0usize..64,
    ) {
        let n = parents.len() + 1;
        prop_assume!(from % n != to % n);
        let mut mix = build(&parents, &[(from, to)], |_, _| Some(ConnectionType::Feedback));
        let topo = mix.resort().clone();

        let producer = id(&mix, from % n);
        let consumer = id(&mix, to % n);
        prop_assert!(topo.has_cycles());
        let bucket = topo
            .buckets()
            .iter()
            .find(|b| topo.members(b).contains(&producer))
            .unwrap();
        prop_assert!(bucket.sequential);
        prop_assert!(topo.members(bucket).contains(&consumer));
        prop_assert!(mix.bus(producer).unwrap().needs_latch());
    }

    /// Every voice reaches the master once through the parent chain, so the
    /// master output is the sum of all voices.
    #[test]
    fn parent_tree_sums_every_voice_once(
        parents in prop::collection::vec(0usize..64, 1..10),
        voices in prop::collection::vec((0usize..64, -1.0f32..1.0f32), 1..16),
    ) {
        let n = parents.len() + 1;
        let mut catalog = BusCatalog::new();
        for def in tree(&parents) {
            catalog.insert(def).unwrap();
        }
        let mut mix = MixGraphContext::new(MixConfig::default(), catalog).unwrap();
        let sink = FirstSample::default();
        mix.register_context(CTX, sink.clone(), 1.0);
        let handle = mix.handle();
        for &(bus, value) in &voices {
            handle.play(CTX, BusDefId((bus % n) as u32), Constant(value));
        }

        let report = mix.run_one_frame();

        prop_assert_eq!(report.allocation_failures, 0);
        prop_assert_eq!(report.voices_produced as usize, voices.len());
        let expected: f32 = voices.iter().map(|&(_, v)| v).sum();
        let samples = sink.0.lock().unwrap();
        prop_assert_eq!(samples.len(), 1);
        prop_assert!((samples[0] - expected).abs() < 1e-4, "{} != {}", samples[0], expected);
    }

    /// Buffers handed out by the pool always match the frame size, and the
    /// outstanding count tracks acquire and release.
    #[test]
    fn pool_tracks_outstanding_buffers(
        ops in prop::collection::vec(any::<bool>(), 1..64),
        initial in 0usize..8,
    ) {
        let mut pool = BufferPool::new(initial, 32);
        let mut held = Vec::new();
        for acquire in ops {
            if acquire || held.is_empty() {
                let buffer = pool.acquire(ChannelConfig::STEREO);
                prop_assert_eq!(buffer.capacity(), 32);
                prop_assert!(buffer.valid_frames() <= buffer.capacity());
                held.push(buffer);
            } else if let Some(buffer) = held.pop() {
                pool.release(buffer);
            }
            prop_assert_eq!(pool.outstanding(), held.len());
        }
    }
}
