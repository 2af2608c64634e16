//! Named effect factories.
//!
//! The registry maps the `type` string of an `[[buses.effects]]` entry to a
//! factory and the parameters it accepts. Applications register their own
//! effects next to the built-ins.
//!
//! # Example
//!
//! ```rust
//! use mezcla_config::{EffectConfig, EffectRegistry};
//!
//! let registry = EffectRegistry::new();
//! assert!(registry.contains("gain"));
//!
//! let config = EffectConfig::new("gain").with_param("gain_db", -6.0);
//! let descriptor = registry.descriptor(&config).unwrap();
//! assert_eq!(descriptor.name, "gain");
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use mezcla_core::effect::{Downmix, Gain, PerChannel};
use mezcla_core::graph::EffectDescriptor;
use mezcla_core::{ChannelConfig, Effect, MixConfig};

use crate::engine_config::EffectConfig;
use crate::validation::{ValidationError, ValidationResult};

/// A parameter an effect accepts, with its range and default.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    /// Parameter name, as written in the config file.
    pub name: &'static str,
    /// Minimum value.
    pub min: f32,
    /// Maximum value.
    pub max: f32,
    /// Value used when the config omits the parameter.
    pub default: f32,
}

impl ParamSpec {
    /// Creates a parameter spec.
    pub const fn new(name: &'static str, min: f32, max: f32, default: f32) -> Self {
        Self {
            name,
            min,
            max,
            default,
        }
    }
}

/// Resolved parameter values, every declared parameter present.
pub type Params = BTreeMap<String, f32>;

type Builder = Arc<dyn Fn(&Params, &MixConfig) -> Effect + Send + Sync>;

struct Entry {
    description: &'static str,
    params: Vec<ParamSpec>,
    build: Builder,
}

/// Effect factories by name.
pub struct EffectRegistry {
    entries: BTreeMap<String, Entry>,
}

impl Default for EffectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for EffectRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EffectRegistry")
            .field("effects", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EffectRegistry {
    /// Creates a registry holding the built-in effects.
    ///
    /// - `gain` (`gain_db`, -96..=24): static gain on every channel
    /// - `downmix` (`channels`, 1..=8): folds the bus onto another layout
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(
            "gain",
            "Static gain on every channel",
            vec![ParamSpec::new("gain_db", -96.0, 24.0, 0.0)],
            |params, _| {
                Effect::in_place(PerChannel::new(Gain::from_db(param(params, "gain_db"))))
            },
        );
        registry.register(
            "downmix",
            "Folds the bus onto another channel layout",
            vec![ParamSpec::new("channels", 1.0, 8.0, 1.0)],
            |params, _| {
                let channels = ChannelConfig::new(param(params, "channels").round() as usize)
                    .unwrap_or(ChannelConfig::MONO);
                Effect::out_of_place(Downmix::new(channels))
            },
        );
        registry
    }

    /// Creates a registry with no effects.
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registers (or replaces) an effect.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: &'static str,
        params: Vec<ParamSpec>,
        build: impl Fn(&Params, &MixConfig) -> Effect + Send + Sync + 'static,
    ) {
        let name = name.into();
        tracing::debug!(effect = %name, params = params.len(), "effect registered");
        self.entries.insert(
            name,
            Entry {
                description,
                params,
                build: Arc::new(build),
            },
        );
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// One-line description of an effect.
    pub fn description(&self, name: &str) -> Option<&'static str> {
        self.entries.get(name).map(|e| e.description)
    }

    /// Parameters an effect accepts.
    pub fn params(&self, name: &str) -> Option<&[ParamSpec]> {
        self.entries.get(name).map(|e| e.params.as_slice())
    }

    /// Checks an effect entry and fills in defaults for missing parameters.
    pub fn resolve(&self, config: &EffectConfig) -> ValidationResult<Params> {
        let entry = self
            .entries
            .get(&config.effect_type)
            .ok_or_else(|| ValidationError::UnknownEffect(config.effect_type.clone()))?;

        for name in config.params.keys() {
            if !entry.params.iter().any(|p| p.name == name.as_str()) {
                return Err(ValidationError::UnknownParameter {
                    effect: config.effect_type.clone(),
                    param: name.clone(),
                });
            }
        }

        let mut resolved = Params::new();
        for spec in &entry.params {
            let value = config.params.get(spec.name).copied().unwrap_or(spec.default);
            if !(value >= spec.min && value <= spec.max) {
                return Err(ValidationError::OutOfRange {
                    param: spec.name.to_string(),
                    value,
                    min: spec.min,
                    max: spec.max,
                });
            }
            resolved.insert(spec.name.to_string(), value);
        }
        Ok(resolved)
    }

    /// Turns an effect entry into a descriptor a bus definition can carry.
    ///
    /// Parameters are resolved once; every bus instance gets a fresh effect
    /// built from the same values.
    pub fn descriptor(&self, config: &EffectConfig) -> ValidationResult<EffectDescriptor> {
        let params = self.resolve(config)?;
        let build = self
            .entries
            .get(&config.effect_type)
            .map(|e| Arc::clone(&e.build))
            .ok_or_else(|| ValidationError::UnknownEffect(config.effect_type.clone()))?;
        Ok(EffectDescriptor {
            name: config.effect_type.clone(),
            factory: Arc::new(move |mix: &MixConfig| build(&params, mix)),
            bypass: config.bypassed,
        })
    }
}

fn param(params: &Params, name: &str) -> f32 {
    params.get(name).copied().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = EffectRegistry::new();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["downmix", "gain"]);
        assert!(registry.description("gain").is_some());
        assert_eq!(registry.params("downmix").unwrap()[0].name, "channels");
    }

    #[test]
    fn resolve_fills_defaults() {
        let registry = EffectRegistry::new();
        let params = registry.resolve(&EffectConfig::new("gain")).unwrap();
        assert_eq!(params.get("gain_db"), Some(&0.0));
    }

    #[test]
    fn resolve_rejects_unknown_effect() {
        let registry = EffectRegistry::new();
        assert_eq!(
            registry.resolve(&EffectConfig::new("flanger")),
            Err(ValidationError::UnknownEffect("flanger".into()))
        );
    }

    #[test]
    fn resolve_rejects_unknown_parameter() {
        let registry = EffectRegistry::new();
        let config = EffectConfig::new("gain").with_param("drive", 0.5);
        assert!(matches!(
            registry.resolve(&config),
            Err(ValidationError::UnknownParameter { ref param, .. }) if param == "drive"
        ));
    }

    #[test]
    fn resolve_rejects_out_of_range() {
        let registry = EffectRegistry::new();
        let config = EffectConfig::new("downmix").with_param("channels", 12.0);
        assert!(matches!(
            registry.resolve(&config),
            Err(ValidationError::OutOfRange { max, .. }) if max == 8.0
        ));
    }

    #[test]
    fn descriptor_builds_fresh_effects() {
        let registry = EffectRegistry::new();
        let config = EffectConfig::new("downmix").with_param("channels", 1.0);
        let descriptor = registry.descriptor(&config).unwrap();
        let mix = MixConfig::default();
        assert!((descriptor.factory)(&mix).is_out_of_place());
        assert!((descriptor.factory)(&mix).is_out_of_place());
        assert!(!descriptor.bypass);
    }

    #[test]
    fn custom_effects_can_be_registered() {
        let mut registry = EffectRegistry::empty();
        registry.register("silence", "Multiplies by zero", Vec::new(), |_, _| {
            Effect::in_place(PerChannel::new(Gain::from_db(-200.0)))
        });
        assert!(registry.contains("silence"));
        assert!(!registry.contains("gain"));
    }
}
