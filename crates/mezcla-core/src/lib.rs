//! Mezcla Core - real-time mix graph scheduler
//!
//! Turns a changing set of playing voices into a handful of output buffers,
//! once per audio tick, within the tick's time budget.
//!
//! # Core Abstractions
//!
//! ## Graph
//!
//! - [`MixGraphContext`] - The engine: owns the graph and runs frames
//! - [`MixHandle`] - Game-thread command queue (play, stop, sends, contexts)
//! - [`BusCatalog`] / [`BusDefinition`] - The static bus hierarchy
//! - [`SortedTopology`] - Depth-ordered buses with cycle detection
//! - [`FrameReport`] - What each frame did and what failed
//!
//! ## Audio
//!
//! - [`AudioBuffer`] - Deinterleaved block with a valid-frame count
//! - [`BufferPool`] - Pre-sized free list of buffers
//! - [`Effect`] / [`EffectSlot`] - Bus effect contract and bypass state
//!
//! ## Collaborators
//!
//! - [`Source`], [`Sink`], [`ParameterSource`], [`Monitor`], [`DecodeBarrier`]
//!
//! # Example
//!
//! ```rust
//! use mezcla_core::graph::{BusCatalog, BusDefId, BusDefinition};
//! use mezcla_core::{MixConfig, MixGraphContext};
//!
//! let catalog = BusCatalog::new()
//!     .with(BusDefinition::new(BusDefId(0), "master"))
//!     .and_then(|c| c.with(BusDefinition::new(BusDefId(1), "sfx").with_parent(BusDefId(0))))
//!     .unwrap();
//! let mut mix = MixGraphContext::new(MixConfig::default(), catalog).unwrap();
//! let report = mix.run_one_frame();
//! assert_eq!(report.frame, 0);
//! ```
//!
//! # Design Principles
//!
//! - **No locks in the mix path**: parallel phases borrow disjoint nodes
//! - **Contained failures**: a frame always completes
//! - **Allocation-free steady state**: buffers come from the pool

pub mod buffer;
pub mod collab;
pub mod config;
pub mod effect;
pub mod error;
pub mod filter;
pub mod graph;
pub mod math;

pub use buffer::{AudioBuffer, BufferPool, ChannelConfig, MAX_CHANNELS, Meter};
pub use collab::{
    DecodeBarrier, Monitor, ParameterSource, Sink, SinkStatus, Source, SourceStatus,
};
pub use config::MixConfig;
pub use effect::{Effect, EffectSlot, InPlaceEffect, OutOfPlaceEffect};
pub use error::{MixError, ProducerError, Resource};
pub use graph::{
    BusCatalog, BusDefId, BusDefinition, BusKey, ConnectionType, FrameReport, MixGraphContext,
    MixHandle, RoutingContextId, SendTarget, SortedTopology, VoiceId, VoiceState,
};
pub use math::{SILENCE_DB, db_to_linear, flush_denormal, linear_to_db};
