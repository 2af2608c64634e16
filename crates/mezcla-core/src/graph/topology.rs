//! Topological sorter: orders buses by depth and finds feedback cycles.
//!
//! Depth is the longest path from a bus to a sink: top-level buses sit at 0,
//! and every bus is deeper than anything it feeds. The scheduler runs buckets
//! from the deepest up, so a bus's inputs are always ready before it runs.
//!
//! # Algorithm
//!
//! 1. Iterative DFS from every top-level bus of a registered context,
//!    following bus inputs upstream, with a three-state visit array and
//!    Tarjan lowlinks. Reaching an `InProgress` bus is a cycle. Declared
//!    feedback edges are also walked backwards, which puts both endpoints of
//!    every feedback send in one strongly connected component.
//! 2. Components are emitted producers-first; walking them in reverse gives
//!    each component its longest distance to a sink. Members of one component
//!    share a depth.
//! 3. A stable counting sort by depth (ties by creation order). Unreached
//!    buses go last with no depth and are not run.
//! 4. Buckets holding a cycle run sequentially, ordered by Kahn's algorithm
//!    over their non-feedback edges. Whatever edge still points backwards
//!    (declared feedback, or the edge broken to escape a stall) is *late*:
//!    it reads the producer's output from the previous tick.

use std::collections::HashMap;
use std::ops::Range;

use super::builder::Graph;
use super::connection::ConnectionType;
use super::node::{BusId, NodeRef};

/// A run of buses with the same depth in [`SortedTopology::order`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepthBucket {
    /// Shared depth.
    pub depth: u32,
    /// Range into the sorted order.
    pub range: Range<usize>,
    /// Members feed each other and must run one at a time, in order.
    pub sequential: bool,
}

/// Result of a sort: bus order, depth buckets and the cycle flag.
///
/// # Invariants
///
/// - for every non-feedback connection A -> B between reached buses in
///   different buckets, `depth(A) > depth(B)`
/// - members of a cycle share one bucket, which is `sequential`
/// - `order[..reached]` ascends by depth; `order[reached..]` is unreached
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SortedTopology {
    order: Vec<BusId>,
    reached: usize,
    buckets: Vec<DepthBucket>,
    has_cycles: bool,
    generation: u64,
}

impl SortedTopology {
    /// All buses: reached ones by ascending depth, then unreached ones.
    pub fn order(&self) -> &[BusId] {
        &self.order
    }

    /// Buses connected to a sink, by ascending depth.
    pub fn reached(&self) -> &[BusId] {
        &self.order[..self.reached]
    }

    /// Buses with no path to a sink.
    pub fn unreached(&self) -> &[BusId] {
        &self.order[self.reached..]
    }

    /// Depth buckets, ascending.
    pub fn buckets(&self) -> &[DepthBucket] {
        &self.buckets
    }

    /// Members of a bucket, in execution order.
    pub fn members(&self, bucket: &DepthBucket) -> &[BusId] {
        &self.order[bucket.range.clone()]
    }

    /// Returns true if the graph contains a cycle or a feedback send.
    pub fn has_cycles(&self) -> bool {
        self.has_cycles
    }

    /// Position of a bus in [`order`](Self::order).
    pub fn position(&self, id: BusId) -> Option<usize> {
        self.order.iter().position(|&b| b == id)
    }

    /// Number of sorts performed so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Visit {
    Unvisited,
    InProgress,
    Done,
}

const NONE: usize = usize::MAX;

/// Re-derives bus order, depths, late flags and latch needs.
pub(crate) fn resort(graph: &mut Graph, topo: &mut SortedTopology) {
    // Dense numbering in creation order keeps every tie stable.
    let mut by_seq: Vec<(u64, BusId)> = graph
        .buses
        .iter()
        .map(|(index, bus)| (bus.seq, BusId(index)))
        .collect();
    by_seq.sort_unstable_by_key(|&(seq, _)| seq);
    let ids: Vec<BusId> = by_seq.into_iter().map(|(_, id)| id).collect();
    let n = ids.len();
    let dense: HashMap<BusId, usize> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    // Bus-to-bus edges as (producer, consumer, kind).
    let mut edges: Vec<(usize, usize, ConnectionType)> = Vec::new();
    let mut upstream: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut roots: Vec<usize> = Vec::new();
    for (c, id) in ids.iter().enumerate() {
        let Some(bus) = graph.buses.get(id.0) else {
            continue;
        };
        if bus.top_level && graph.contexts.contains_key(&bus.key.context) {
            roots.push(c);
        }
        for (_, conn) in bus.inputs.iter() {
            let NodeRef::Bus(p) = conn.producer else {
                continue;
            };
            let Some(&p) = dense.get(&p) else {
                continue;
            };
            edges.push((p, c, conn.kind));
            upstream[c].push(p);
            downstream[p].push(c);
            if conn.kind == ConnectionType::Feedback && p != c {
                upstream[p].push(c);
            }
        }
    }

    // 1. DFS + Tarjan components.
    let mut visit = vec![Visit::Unvisited; n];
    let mut index = vec![0usize; n];
    let mut lowlink = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut scc_stack: Vec<usize> = Vec::new();
    let mut comp_of = vec![NONE; n];
    let mut comps: Vec<Vec<usize>> = Vec::new();
    let mut counter = 0usize;
    let mut has_cycles = false;

    for &root in &roots {
        if visit[root] != Visit::Unvisited {
            continue;
        }
        let mut call: Vec<(usize, usize)> = vec![(root, 0)];
        index[root] = counter;
        lowlink[root] = counter;
        counter += 1;
        visit[root] = Visit::InProgress;
        on_stack[root] = true;
        scc_stack.push(root);

        while let Some(frame) = call.last_mut() {
            let v = frame.0;
            if frame.1 < upstream[v].len() {
                let w = upstream[v][frame.1];
                frame.1 += 1;
                match visit[w] {
                    Visit::Unvisited => {
                        index[w] = counter;
                        lowlink[w] = counter;
                        counter += 1;
                        visit[w] = Visit::InProgress;
                        on_stack[w] = true;
                        scc_stack.push(w);
                        call.push((w, 0));
                    }
                    Visit::InProgress => {
                        has_cycles = true;
                        lowlink[v] = lowlink[v].min(index[w]);
                    }
                    Visit::Done => {
                        if on_stack[w] {
                            lowlink[v] = lowlink[v].min(index[w]);
                        }
                    }
                }
                continue;
            }

            call.pop();
            visit[v] = Visit::Done;
            if let Some(&(parent, _)) = call.last() {
                lowlink[parent] = lowlink[parent].min(lowlink[v]);
            }
            if lowlink[v] == index[v] {
                let id = comps.len();
                let mut members = Vec::new();
                while let Some(w) = scc_stack.pop() {
                    on_stack[w] = false;
                    comp_of[w] = id;
                    members.push(w);
                    if w == v {
                        break;
                    }
                }
                comps.push(members);
            }
        }
    }

    // 2. Longest path to a sink; consumers' components come later in `comps`.
    let mut comp_depth = vec![0u32; comps.len()];
    for ci in (0..comps.len()).rev() {
        let mut depth = 0;
        for &v in &comps[ci] {
            for &c in &downstream[v] {
                let cc = comp_of[c];
                if cc != NONE && cc != ci {
                    depth = depth.max(comp_depth[cc] + 1);
                }
            }
        }
        comp_depth[ci] = depth;
    }

    // 3. Stable counting sort of reached buses.
    let reached: Vec<usize> = (0..n).filter(|&v| comp_of[v] != NONE).collect();
    let depth_of = |v: usize| comp_depth[comp_of[v]];
    let max_depth = reached.iter().map(|&v| depth_of(v)).max().unwrap_or(0) as usize;
    let mut starts = vec![0usize; max_depth + 2];
    for &v in &reached {
        starts[depth_of(v) as usize + 1] += 1;
    }
    for d in 1..starts.len() {
        starts[d] += starts[d - 1];
    }
    let mut sorted = vec![NONE; reached.len()];
    let mut cursor = starts.clone();
    for &v in &reached {
        let d = depth_of(v) as usize;
        sorted[cursor[d]] = v;
        cursor[d] += 1;
    }

    // 4. Buckets; cycle buckets get a dependency order.
    let mut bucket_of = vec![NONE; n];
    let mut buckets = Vec::new();
    for d in 0..=max_depth {
        let range = starts[d]..starts[d + 1];
        if range.is_empty() {
            continue;
        }
        let b = buckets.len();
        for &v in &sorted[range.clone()] {
            bucket_of[v] = b;
        }
        let intra = edges
            .iter()
            .any(|&(p, c, _)| p != c && bucket_of[p] == b && bucket_of[c] == b);
        let sequential = has_cycles && range.len() > 1 && intra;
        if sequential {
            order_cycle_bucket(&mut sorted[range.clone()], &edges, &bucket_of, b);
        }
        buckets.push(DepthBucket {
            depth: d as u32,
            range,
            sequential,
        });
    }

    let mut position = vec![NONE; n];
    for (i, &v) in sorted.iter().enumerate() {
        position[v] = i;
    }

    // 5. Late flags and latch needs.
    let mut needs_latch = vec![false; n];
    for (c, id) in ids.iter().enumerate() {
        let Some(bus) = graph.buses.get_mut(id.0) else {
            continue;
        };
        for (_, conn) in bus.inputs.iter_mut() {
            let NodeRef::Bus(p) = conn.producer else {
                conn.late = false;
                continue;
            };
            let Some(&p) = dense.get(&p) else {
                conn.late = false;
                continue;
            };
            let backwards =
                bucket_of[p] != NONE && bucket_of[p] == bucket_of[c] && position[p] > position[c];
            conn.late = conn.kind == ConnectionType::Feedback || p == c || backwards;
            if conn.late && comp_of[c] != NONE {
                needs_latch[p] = true;
            }
        }
    }

    let mut order: Vec<BusId> = sorted.iter().map(|&v| ids[v]).collect();
    order.extend((0..n).filter(|&v| comp_of[v] == NONE).map(|v| ids[v]));
    for (v, id) in ids.iter().enumerate() {
        if let Some(bus) = graph.buses.get_mut(id.0) {
            bus.depth = (comp_of[v] != NONE).then(|| depth_of(v));
            bus.needs_latch = needs_latch[v];
        }
    }

    tracing::debug!(
        buses = n,
        reached = reached.len(),
        buckets = buckets.len(),
        has_cycles,
        "topology sorted"
    );

    *topo = SortedTopology {
        order,
        reached: reached.len(),
        buckets,
        has_cycles,
        generation: topo.generation + 1,
    };
    graph.dirty = false;
}

/// Orders one cycle bucket by Kahn's algorithm over its non-feedback edges.
///
/// Among ready buses the one feeding the most bucket members goes first, then
/// the oldest. On a stall (a cycle with no declared feedback) the same rule
/// picks from everything left, and the edge it breaks becomes late.
fn order_cycle_bucket(
    members: &mut [usize],
    edges: &[(usize, usize, ConnectionType)],
    bucket_of: &[usize],
    bucket: usize,
) {
    let local: Vec<(usize, usize)> = edges
        .iter()
        .filter(|&&(p, c, kind)| {
            kind != ConnectionType::Feedback
                && p != c
                && bucket_of[p] == bucket
                && bucket_of[c] == bucket
        })
        .map(|&(p, c, _)| (p, c))
        .collect();

    let slot = |v: usize| members.iter().position(|&m| m == v);
    let k = members.len();
    let mut fanout = vec![0usize; k];
    let mut indegree = vec![0usize; k];
    for &(p, c) in &local {
        if let (Some(pi), Some(ci)) = (slot(p), slot(c)) {
            fanout[pi] += 1;
            indegree[ci] += 1;
        }
    }

    // `members` arrives in creation order, so the first best index wins ties.
    let mut placed = vec![false; k];
    let mut result = Vec::with_capacity(k);
    for _ in 0..k {
        let pick = |ready_only: bool| {
            (0..k)
                .filter(|&i| !placed[i] && (!ready_only || indegree[i] == 0))
                .fold(None, |best: Option<usize>, i| match best {
                    Some(b) if fanout[b] >= fanout[i] => Some(b),
                    _ => Some(i),
                })
        };
        let Some(next) = pick(true).or_else(|| pick(false)) else {
            break;
        };
        placed[next] = true;
        result.push(members[next]);
        for &(p, c) in &local {
            if p == members[next] {
                if let Some(ci) = slot(c) {
                    indegree[ci] = indegree[ci].saturating_sub(1);
                }
            }
        }
    }
    members.copy_from_slice(&result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MixConfig;
    use crate::graph::catalog::{BusCatalog, BusDefinition};
    use crate::graph::node::{BusDefId, BusKey, RoutingContextId};

    const CTX: RoutingContextId = RoutingContextId(0);

    fn def(id: u32, parent: Option<u32>) -> BusDefinition {
        let d = BusDefinition::new(BusDefId(id), format!("bus{id}"));
        match parent {
            Some(p) => d.with_parent(BusDefId(p)),
            None => d,
        }
    }

    fn graph(defs: Vec<BusDefinition>) -> Graph {
        let mut catalog = BusCatalog::new();
        for d in defs {
            catalog.insert(d).unwrap();
        }
        let mut g = Graph::new(MixConfig::default(), catalog);
        g.register_context(CTX, None, 1.0);
        g
    }

    fn id(g: &Graph, def: u32) -> BusId {
        g.bus_id(BusKey::new(BusDefId(def), CTX)).unwrap()
    }

    #[test]
    fn chain_sorts_sink_first() {
        let mut g = graph(vec![def(0, None), def(1, Some(0)), def(2, Some(1))]);
        g.get_or_create_bus(BusDefId(2), CTX).unwrap();
        let mut topo = SortedTopology::default();
        resort(&mut g, &mut topo);
        assert_eq!(topo.order(), &[id(&g, 0), id(&g, 1), id(&g, 2)]);
        assert!(!topo.has_cycles());
        assert_eq!(topo.buckets().len(), 3);
        assert_eq!(g.bus(id(&g, 2)).unwrap().depth(), Some(2));
        assert!(!g.dirty);
    }

    #[test]
    fn longest_path_wins() {
        // 3 feeds both 0 (directly) and 1; 1 feeds 0. Depth of 3 is 2.
        let mut g = graph(vec![
            def(0, None),
            def(1, Some(0)),
            def(3, Some(0)).with_send(BusDefId(1), ConnectionType::Aux, 0.0),
        ]);
        g.get_or_create_bus(BusDefId(3), CTX).unwrap();
        let mut topo = SortedTopology::default();
        resort(&mut g, &mut topo);
        assert_eq!(g.bus(id(&g, 3)).unwrap().depth(), Some(2));
        assert_eq!(g.bus(id(&g, 1)).unwrap().depth(), Some(1));
    }

    #[test]
    fn unreached_buses_go_last() {
        let mut g = graph(vec![def(0, None), def(1, Some(0))]);
        g.get_or_create_bus(BusDefId(1), CTX).unwrap();
        let master = id(&g, 0);
        let music = id(&g, 1);
        let link = g
            .find_connection(NodeRef::Bus(music), master, ConnectionType::Direct)
            .unwrap();
        g.disconnect(link);
        let mut topo = SortedTopology::default();
        resort(&mut g, &mut topo);
        assert_eq!(topo.reached(), &[master]);
        assert_eq!(topo.unreached(), &[music]);
        assert_eq!(g.bus(music).unwrap().depth(), None);
    }

    #[test]
    fn aux_feedback_pair_shares_sequential_bucket() {
        let mut g = graph(vec![
            def(0, None),
            def(1, Some(0)).with_send(BusDefId(2), ConnectionType::Aux, 0.0),
            def(2, Some(0)).with_send(BusDefId(1), ConnectionType::Feedback, 0.0),
        ]);
        g.get_or_create_bus(BusDefId(1), CTX).unwrap();
        let (b1, b2) = (id(&g, 1), id(&g, 2));
        let mut topo = SortedTopology::default();
        resort(&mut g, &mut topo);

        assert!(topo.has_cycles());
        let bucket = &topo.buckets()[1];
        assert!(bucket.sequential);
        assert_eq!(topo.members(bucket), &[b1, b2]);
        assert!(g.bus(b2).unwrap().needs_latch());
        assert!(!g.bus(b1).unwrap().needs_latch());

        let fb = g
            .find_connection(NodeRef::Bus(b2), b1, ConnectionType::Feedback)
            .unwrap();
        let aux = g.find_connection(NodeRef::Bus(b1), b2, ConnectionType::Aux).unwrap();
        assert!(g.connection(fb).unwrap().is_late());
        assert!(!g.connection(aux).unwrap().is_late());
    }

    #[test]
    fn undeclared_cycle_breaks_one_edge() {
        let mut g = graph(vec![
            def(0, None),
            def(1, Some(0)).with_send(BusDefId(2), ConnectionType::Aux, 0.0),
            def(2, Some(0)).with_send(BusDefId(1), ConnectionType::Aux, 0.0),
        ]);
        g.get_or_create_bus(BusDefId(1), CTX).unwrap();
        let (b1, b2) = (id(&g, 1), id(&g, 2));
        let mut topo = SortedTopology::default();
        resort(&mut g, &mut topo);

        assert!(topo.has_cycles());
        assert!(topo.buckets()[1].sequential);
        let a = g.find_connection(NodeRef::Bus(b1), b2, ConnectionType::Aux).unwrap();
        let b = g.find_connection(NodeRef::Bus(b2), b1, ConnectionType::Aux).unwrap();
        let late = [a, b]
            .iter()
            .filter(|&&c| g.connection(c).unwrap().is_late())
            .count();
        assert_eq!(late, 1);
    }

    #[test]
    fn feedback_self_loop_is_a_cycle() {
        let mut g = graph(vec![def(0, None), def(1, Some(0))]);
        let music = g.get_or_create_bus(BusDefId(1), CTX).unwrap();
        g.connect(NodeRef::Bus(music), music, ConnectionType::Feedback, -6.0)
            .unwrap();
        let mut topo = SortedTopology::default();
        resort(&mut g, &mut topo);
        assert!(topo.has_cycles());
        assert!(g.bus(music).unwrap().needs_latch());
        assert!(!topo.buckets()[1].sequential);
    }

    #[test]
    fn resort_is_idempotent() {
        let mut g = graph(vec![
            def(0, None),
            def(1, Some(0)).with_send(BusDefId(2), ConnectionType::Aux, 0.0),
            def(2, Some(0)).with_send(BusDefId(1), ConnectionType::Feedback, 0.0),
            def(3, Some(1)),
        ]);
        g.get_or_create_bus(BusDefId(3), CTX).unwrap();
        let mut first = SortedTopology::default();
        resort(&mut g, &mut first);
        let mut second = first.clone();
        resort(&mut g, &mut second);
        assert_eq!(first.order(), second.order());
        assert_eq!(first.buckets(), second.buckets());
        assert_eq!(second.generation(), first.generation() + 1);
    }
}
