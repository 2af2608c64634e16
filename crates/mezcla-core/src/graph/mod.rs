//! The mix graph: voices and buses joined by typed connections.
//!
//! Voices produce audio; buses mix their inputs, run an effect chain and feed
//! their parent, up to top-level buses that push into a routing context's
//! sink. Each routing context (listener, split-screen player, output device)
//! gets its own instance of every bus it uses.
//!
//! # Architecture
//!
//! - [`Graph`] - Arenas of voices and buses. Built and pruned on demand by
//!   the audio thread during Refresh and end-of-frame GC.
//! - [`SortedTopology`] - Buses bucketed by depth (longest path to a sink).
//!   Recomputed only when bus wiring changes. Cycles share a sequential
//!   bucket; edges that run backwards read the previous tick's output.
//! - [`MixGraphContext`] - Owns the graph, pools and collaborators and runs
//!   [`run_one_frame`](MixGraphContext::run_one_frame).
//! - [`MixHandle`] - Queues commands from game threads.
//!
//! # Frame
//!
//! Refresh (commands, voice routing, parameters, HDR, resort), decode
//! barrier, voice production across the worker pool, bus consumption from the
//! deepest bucket to depth 0, sink push, feedback latching, buffer release,
//! GC. Nothing inside a frame returns an error; failures are counted in the
//! [`FrameReport`].

pub mod builder;
pub mod catalog;
pub mod command;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod hdr;
pub mod node;
pub mod report;
mod scheduler;
pub mod topology;

pub use builder::{Graph, MAX_BUS_NESTING};
pub use catalog::{BusCatalog, BusDefinition, BusSend, EffectDescriptor, EffectFactory};
pub use command::{Command, MixHandle, PlayRequest};
pub use connection::{
    ConnectionId, ConnectionKey, ConnectionParams, ConnectionType, MixConnection, Ramp,
};
pub use context::MixGraphContext;
pub use dispatch::Dispatcher;
pub use hdr::{HdrSettings, HdrState, ReleaseMode};
pub use node::{
    BusDefId, BusId, BusKey, BusNode, BusState, NodeRef, ProducerKey, RoutingContextId,
    SendTarget, VoiceHandle, VoiceId, VoiceNode, VoiceState,
};
pub use report::{
    BusSnapshot, ConnectionSnapshot, ExecutedNode, FrameReport, FrameSnapshot, GraphSnapshot,
};
pub use topology::{DepthBucket, SortedTopology};
