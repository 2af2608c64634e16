//! Engine config validation.
//!
//! Checks what the engine can't check on its own before any bus exists:
//! unique ids and names, parents and send targets that resolve, an acyclic
//! parent chain, and effect entries the registry accepts. All problems are
//! collected, so one pass reports everything wrong with a file.
//!
//! # Example
//!
//! ```rust
//! use mezcla_config::{BusConfig, EffectRegistry, EngineConfig, validate_engine_config};
//!
//! let config = EngineConfig::new()
//!     .with_bus(BusConfig::new(0, "master"))
//!     .with_bus(BusConfig::new(1, "sfx").with_parent("master"));
//! assert!(validate_engine_config(&config, &EffectRegistry::new()).is_ok());
//! ```

use std::collections::{BTreeMap, BTreeSet};

use mezcla_core::ConnectionType;
use thiserror::Error;

use crate::engine_config::EngineConfig;
use crate::registry::EffectRegistry;

/// Validation error types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// Engine settings out of range.
    #[error("engine: {0}")]
    Engine(String),

    /// No bus has been declared without a parent.
    #[error("no top-level bus")]
    NoTopLevelBus,

    /// Two buses share an id.
    #[error("duplicate bus id {0}")]
    DuplicateId(u32),

    /// Two buses share a name.
    #[error("duplicate bus name '{0}'")]
    DuplicateName(String),

    /// A parent name doesn't match any bus.
    #[error("bus '{bus}' names unknown parent '{parent}'")]
    UnknownParent {
        /// Bus declaring the parent.
        bus: String,
        /// The unresolved name.
        parent: String,
    },

    /// A send target doesn't match any bus.
    #[error("bus '{bus}' sends to unknown bus '{target}'")]
    UnknownSendTarget {
        /// Bus declaring the send.
        bus: String,
        /// The unresolved name.
        target: String,
    },

    /// A static send is `direct`; the parent link is the only direct output.
    #[error("bus '{0}' declares a direct send; use its parent instead")]
    DirectSend(String),

    /// Following parents from this bus never reaches a top-level bus.
    #[error("parent chain of bus '{0}' is cyclic")]
    ParentCycle(String),

    /// Unknown effect type.
    #[error("unknown effect type: {0}")]
    UnknownEffect(String),

    /// Unknown parameter name.
    #[error("unknown parameter '{param}' for effect '{effect}'")]
    UnknownParameter {
        /// Name of the effect.
        effect: String,
        /// Name of the unrecognized parameter.
        param: String,
    },

    /// Parameter value out of range.
    #[error("parameter '{param}' value {value} out of range [{min}, {max}]")]
    OutOfRange {
        /// Name of the parameter.
        param: String,
        /// The value that was out of range.
        value: f32,
        /// Minimum allowed value.
        min: f32,
        /// Maximum allowed value.
        max: f32,
    },

    /// Multiple validation errors.
    #[error("multiple validation errors: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates engine settings, the bus hierarchy and every effect entry.
///
/// Returns the single error found, or [`ValidationError::Multiple`].
pub fn validate_engine_config(
    config: &EngineConfig,
    registry: &EffectRegistry,
) -> ValidationResult<()> {
    let mut errors = Vec::new();

    if let Err(e) = config.engine.validate() {
        errors.push(ValidationError::Engine(e.to_string()));
    }

    if !config.buses.is_empty() && config.buses.iter().all(|b| b.parent.is_some()) {
        errors.push(ValidationError::NoTopLevelBus);
    }

    let mut ids = BTreeSet::new();
    let mut parents: BTreeMap<&str, Option<&str>> = BTreeMap::new();
    for bus in &config.buses {
        if !ids.insert(bus.id) {
            errors.push(ValidationError::DuplicateId(bus.id));
        }
        if parents
            .insert(bus.name.as_str(), bus.parent.as_deref())
            .is_some()
        {
            errors.push(ValidationError::DuplicateName(bus.name.clone()));
        }
    }

    for bus in &config.buses {
        if let Some(parent) = &bus.parent {
            if !parents.contains_key(parent.as_str()) {
                errors.push(ValidationError::UnknownParent {
                    bus: bus.name.clone(),
                    parent: parent.clone(),
                });
            }
        }
        for send in &bus.sends {
            if send.kind == ConnectionType::Direct {
                errors.push(ValidationError::DirectSend(bus.name.clone()));
            }
            if !parents.contains_key(send.target.as_str()) {
                errors.push(ValidationError::UnknownSendTarget {
                    bus: bus.name.clone(),
                    target: send.target.clone(),
                });
            }
        }
        for effect in &bus.effects {
            if let Err(e) = registry.resolve(effect) {
                errors.push(e);
            }
        }
        if has_parent_cycle(&bus.name, &parents) {
            errors.push(ValidationError::ParentCycle(bus.name.clone()));
        }
    }

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ValidationError::Multiple(errors)),
    }
}

fn has_parent_cycle(start: &str, parents: &BTreeMap<&str, Option<&str>>) -> bool {
    let mut current = parents.get(start).copied().flatten();
    // A chain longer than the bus count must revisit a bus.
    for _ in 0..parents.len() {
        match current {
            Some(name) if name == start => return true,
            Some(name) => current = parents.get(name).copied().flatten(),
            None => return false,
        }
    }
    current.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_config::{BusConfig, EffectConfig};
    use mezcla_core::MixConfig;

    fn registry() -> EffectRegistry {
        EffectRegistry::new()
    }

    fn tree() -> EngineConfig {
        EngineConfig::new()
            .with_bus(BusConfig::new(0, "master"))
            .with_bus(BusConfig::new(1, "music").with_parent("master"))
            .with_bus(BusConfig::new(2, "sfx").with_parent("master"))
    }

    #[test]
    fn valid_tree_passes() {
        assert_eq!(validate_engine_config(&tree(), &registry()), Ok(()));
    }

    #[test]
    fn empty_config_passes() {
        assert_eq!(validate_engine_config(&EngineConfig::new(), &registry()), Ok(()));
    }

    #[test]
    fn bad_engine_settings_are_reported() {
        let config = tree().with_engine(MixConfig {
            frame_size: 0,
            ..MixConfig::default()
        });
        assert!(matches!(
            validate_engine_config(&config, &registry()),
            Err(ValidationError::Engine(_))
        ));
    }

    #[test]
    fn duplicate_id_and_name() {
        let config = tree().with_bus(BusConfig::new(2, "music").with_parent("master"));
        assert_eq!(
            validate_engine_config(&config, &registry()),
            Err(ValidationError::Multiple(vec![
                ValidationError::DuplicateId(2),
                ValidationError::DuplicateName("music".into()),
            ]))
        );
    }

    #[test]
    fn unknown_parent() {
        let config = tree().with_bus(BusConfig::new(3, "ui").with_parent("menu"));
        assert_eq!(
            validate_engine_config(&config, &registry()),
            Err(ValidationError::UnknownParent {
                bus: "ui".into(),
                parent: "menu".into(),
            })
        );
    }

    #[test]
    fn unknown_send_target() {
        let config = tree().with_bus(
            BusConfig::new(3, "dialog")
                .with_parent("master")
                .with_send("reverb", ConnectionType::Aux, -6.0),
        );
        assert!(matches!(
            validate_engine_config(&config, &registry()),
            Err(ValidationError::UnknownSendTarget { ref target, .. }) if target == "reverb"
        ));
    }

    #[test]
    fn direct_send_is_rejected() {
        let config = tree().with_bus(
            BusConfig::new(3, "dialog")
                .with_parent("master")
                .with_send("music", ConnectionType::Direct, 0.0),
        );
        assert_eq!(
            validate_engine_config(&config, &registry()),
            Err(ValidationError::DirectSend("dialog".into()))
        );
    }

    #[test]
    fn feedback_send_is_allowed() {
        let config = tree().with_bus(
            BusConfig::new(3, "reverb")
                .with_parent("master")
                .with_send("sfx", ConnectionType::Feedback, -12.0),
        );
        assert_eq!(validate_engine_config(&config, &registry()), Ok(()));
    }

    #[test]
    fn parent_cycle_is_reported_for_each_member() {
        let config = EngineConfig::new()
            .with_bus(BusConfig::new(0, "master"))
            .with_bus(BusConfig::new(1, "a").with_parent("b"))
            .with_bus(BusConfig::new(2, "b").with_parent("a"));
        assert_eq!(
            validate_engine_config(&config, &registry()),
            Err(ValidationError::Multiple(vec![
                ValidationError::ParentCycle("a".into()),
                ValidationError::ParentCycle("b".into()),
            ]))
        );
    }

    #[test]
    fn all_parented_has_no_top_level() {
        let config = EngineConfig::new().with_bus(BusConfig::new(0, "loop").with_parent("loop"));
        let Err(ValidationError::Multiple(errors)) = validate_engine_config(&config, &registry())
        else {
            panic!("expected multiple errors");
        };
        assert!(errors.contains(&ValidationError::NoTopLevelBus));
        assert!(errors.contains(&ValidationError::ParentCycle("loop".into())));
    }

    #[test]
    fn effect_errors_are_collected() {
        let config = tree().with_bus(
            BusConfig::new(3, "ui")
                .with_parent("master")
                .with_effect(EffectConfig::new("chorus"))
                .with_effect(EffectConfig::new("gain").with_param("gain_db", 60.0)),
        );
        let Err(ValidationError::Multiple(errors)) = validate_engine_config(&config, &registry())
        else {
            panic!("expected multiple errors");
        };
        assert_eq!(errors[0], ValidationError::UnknownEffect("chorus".into()));
        assert!(matches!(errors[1], ValidationError::OutOfRange { value, .. } if value == 60.0));
    }

    #[test]
    fn multiple_display_joins_messages() {
        let err = ValidationError::Multiple(vec![
            ValidationError::DuplicateId(1),
            ValidationError::NoTopLevelBus,
        ]);
        assert_eq!(
            err.to_string(),
            "multiple validation errors: duplicate bus id 1; no top-level bus"
        );
    }
}
