//! Configuration for the mezcla mix graph.
//!
//! Describes a whole engine in one TOML document: engine settings, the bus
//! hierarchy, each bus's effect chain, static sends and HDR stage. The
//! document is validated up front and turned into a running
//! [`MixGraphContext`](mezcla_core::MixGraphContext).
//!
//! # Features
//!
//! - **Engine Config**: Load and save [`EngineConfig`] documents from TOML files
//! - **Effect Registry**: Named effect factories with parameter ranges
//! - **Validation**: Every problem in a document reported in one pass
//!
//! # Example
//!
//! ```rust
//! use mezcla_config::{EffectRegistry, EngineConfig};
//!
//! let config = EngineConfig::from_toml(r#"
//!     [engine]
//!     frame_size = 256
//!
//!     [[buses]]
//!     id = 0
//!     name = "master"
//!
//!     [[buses]]
//!     id = 1
//!     name = "sfx"
//!     parent = "master"
//!     [[buses.effects]]
//!     type = "gain"
//!     [buses.effects.params]
//!     gain_db = -6.0
//! "#).unwrap();
//!
//! let mix = config.build_context(&EffectRegistry::new()).unwrap();
//! assert_eq!(mix.config().frame_size, 256);
//! ```

mod engine_config;
mod error;

/// Named effect factories.
pub mod registry;

/// Engine config validation.
pub mod validation;

pub use engine_config::{BusConfig, EffectConfig, EngineConfig, SendConfig};
pub use error::ConfigError;
pub use registry::{EffectRegistry, ParamSpec, Params};
pub use validation::{ValidationError, ValidationResult, validate_engine_config};
