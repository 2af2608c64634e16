//! Per-frame report and monitoring snapshots.

use crate::buffer::Meter;

use super::connection::ConnectionKey;
use super::node::{BusKey, VoiceId};

/// A node that ran during a frame, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutedNode {
    /// A voice produced a buffer.
    Voice(VoiceId),
    /// A bus consumed its inputs.
    Bus(BusKey),
}

/// What happened during one [`run_one_frame`](crate::MixGraphContext::run_one_frame).
///
/// Runtime failures are counted here instead of aborting the frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameReport {
    /// Frame counter, starting at 0.
    pub frame: u64,
    /// Voices that produced audio.
    pub voices_produced: u32,
    /// Buses that ran.
    pub buses_processed: u32,
    /// Capacity limits hit (voices, buses, connections).
    pub allocation_failures: u32,
    /// Source failures plus effect failures.
    pub producer_failures: u32,
    /// Voices that started starving this frame.
    pub starvation_events: u32,
    /// Top-level outputs a sink refused.
    pub dropped_outputs: u32,
    /// Bus instances created.
    pub buses_created: u32,
    /// Bus instances destroyed.
    pub buses_destroyed: u32,
    /// Voices destroyed at end of frame.
    pub voices_stopped: u32,
    /// The topology was re-sorted in Refresh.
    pub resorted: bool,
    /// The current topology has a cycle or feedback send.
    pub has_cycles: bool,
    /// Execution order (only with `MixConfig::record_execution`).
    pub execution: Vec<ExecutedNode>,
}

/// Per-connection entry of a [`FrameSnapshot`].
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionSnapshot {
    /// Connection identity.
    pub key: ConnectionKey,
    /// Linear gain at the end of the frame.
    pub gain: f32,
    /// LPF amount.
    pub lpf: f32,
    /// HPF amount.
    pub hpf: f32,
    /// Whether the connection was mixed.
    pub audible: bool,
    /// Whether it read previous-tick data.
    pub late: bool,
}

/// Per-bus entry of a [`FrameSnapshot`].
#[derive(Clone, Debug, PartialEq)]
pub struct BusSnapshot {
    /// Bus identity.
    pub key: BusKey,
    /// Depth; `None` if unreached.
    pub depth: Option<u32>,
    /// Feeds a sink.
    pub top_level: bool,
    /// Output level (zero unless metering is enabled).
    pub meter: Meter,
    /// Volume in dB.
    pub volume_db: f32,
    /// Published HDR reduction, for HDR buses.
    pub hdr_reduction_db: Option<f32>,
}

/// What a [`Monitor`](crate::Monitor) sees after each frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameSnapshot {
    /// Frame counter.
    pub frame: u64,
    /// Cycle flag of the sorted topology.
    pub has_cycles: bool,
    /// Buses in sorted order.
    pub buses: Vec<BusSnapshot>,
    /// Every connection.
    pub connections: Vec<ConnectionSnapshot>,
}

/// Structural view of the graph, sorted so equal graphs compare equal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GraphSnapshot {
    /// Every bus instance.
    pub buses: Vec<BusKey>,
    /// Every connection.
    pub connections: Vec<ConnectionKey>,
}
