//! Error types for the mix graph.

use thiserror::Error;

use crate::graph::{BusDefId, RoutingContextId, VoiceId};

/// The kind of graph resource a capacity limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// A voice slot (`max_voices`).
    Voice,
    /// A bus instance (`max_buses`).
    Bus,
    /// An incoming connection on a bus (`max_connections_per_bus`).
    Connection,
}

impl core::fmt::Display for Resource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Voice => "voice",
            Self::Bus => "bus",
            Self::Connection => "connection",
        };
        f.write_str(name)
    }
}

/// Errors returned by the graph-building API.
///
/// Runtime failures inside a frame (starvation, producer failures, dropped
/// outputs) are not errors: they are counted in
/// [`FrameReport`](crate::graph::FrameReport) and logged.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MixError {
    /// A capacity limit was hit.
    #[error("{0} capacity exhausted")]
    AllocationFailure(Resource),

    /// No bus definition with this id is in the catalogue.
    #[error("unknown bus definition {0:?}")]
    UnknownBus(BusDefId),

    /// The routing context is not registered (or was unregistered).
    #[error("unknown routing context {0:?}")]
    UnknownContext(RoutingContextId),

    /// The voice does not exist (never started, or already stopped and collected).
    #[error("unknown voice {0:?}")]
    UnknownVoice(VoiceId),

    /// The requested connection is not allowed.
    #[error("invalid connection: {0}")]
    InvalidConnection(String),

    /// Engine settings failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failure reported by an effect while processing a bus buffer.
///
/// The slot that returned it is bypassed for the rest of its life.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("effect failed: {0}")]
pub struct ProducerError(pub String);

impl ProducerError {
    /// Creates a producer error with a message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
