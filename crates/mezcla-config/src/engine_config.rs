//! Engine configuration file format and operations.

use std::collections::BTreeMap;
use std::path::Path;

use mezcla_core::graph::{BusSend, HdrSettings};
use mezcla_core::{
    BusCatalog, BusDefId, BusDefinition, ChannelConfig, ConnectionType, MixConfig,
    MixGraphContext,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::registry::EffectRegistry;
use crate::validation::validate_engine_config;

/// Engine settings plus the bus hierarchy, as stored in a TOML file.
///
/// # TOML Format
///
/// ```toml
/// [engine]
/// sample_rate = 48000.0
/// frame_size = 512
/// worker_threads = 2
///
/// [[buses]]
/// id = 0
/// name = "master"
/// [buses.hdr]
/// threshold_db = -12.0
/// ratio = 4.0
///
/// [[buses]]
/// id = 1
/// name = "sfx"
/// parent = "master"
/// volume_db = -3.0
///
/// [[buses.effects]]
/// type = "gain"
/// [buses.effects.params]
/// gain_db = -6.0
///
/// [[buses.sends]]
/// target = "reverb"
/// kind = "aux"
/// gain_db = -9.0
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Engine settings; omitted keys take their defaults.
    #[serde(default)]
    pub engine: MixConfig,

    /// Bus hierarchy.
    #[serde(default)]
    pub buses: Vec<BusConfig>,
}

/// One bus definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    /// Identifier game code routes voices to.
    pub id: u32,

    /// Unique name, used by `parent` and send `target`.
    pub name: String,

    /// Name of the parent bus; omitted for top-level buses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Channel layout; omitted to use the engine's output layout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<ChannelConfig>,

    /// Initial volume in dB.
    #[serde(default)]
    pub volume_db: f32,

    /// Effect chain, in processing order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effects: Vec<EffectConfig>,

    /// Static sends to other buses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sends: Vec<SendConfig>,

    /// Compression stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdr: Option<HdrSettings>,
}

impl BusConfig {
    /// Creates a top-level bus with unity volume.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            parent: None,
            channels: None,
            volume_db: 0.0,
            effects: Vec::new(),
            sends: Vec::new(),
            hdr: None,
        }
    }

    /// Sets the parent bus by name.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Sets the initial volume.
    pub fn with_volume_db(mut self, volume_db: f32) -> Self {
        self.volume_db = volume_db;
        self
    }

    /// Appends an effect.
    pub fn with_effect(mut self, effect: EffectConfig) -> Self {
        self.effects.push(effect);
        self
    }

    /// Adds a static send.
    pub fn with_send(
        mut self,
        target: impl Into<String>,
        kind: ConnectionType,
        gain_db: f32,
    ) -> Self {
        self.sends.push(SendConfig {
            target: target.into(),
            kind,
            gain_db,
        });
        self
    }

    /// Enables the compression stage.
    pub fn with_hdr(mut self, hdr: HdrSettings) -> Self {
        self.hdr = Some(hdr);
        self
    }
}

/// One effect in a bus chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectConfig {
    /// Registry name of the effect.
    #[serde(rename = "type")]
    pub effect_type: String,

    /// Whether new bus instances start with this effect bypassed.
    #[serde(default)]
    pub bypassed: bool,

    /// Parameter values; missing ones take the registry default.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, f32>,
}

impl EffectConfig {
    /// Creates an active effect with default parameters.
    pub fn new(effect_type: impl Into<String>) -> Self {
        Self {
            effect_type: effect_type.into(),
            bypassed: false,
            params: BTreeMap::new(),
        }
    }

    /// Sets a parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: f32) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    /// Starts the effect bypassed.
    pub fn bypassed(mut self) -> Self {
        self.bypassed = true;
        self
    }
}

/// A static bus-to-bus send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendConfig {
    /// Name of the receiving bus.
    pub target: String,

    /// `aux` or `feedback`.
    #[serde(default = "default_send_kind")]
    pub kind: ConnectionType,

    /// Send level in dB.
    #[serde(default)]
    pub gain_db: f32,
}

fn default_send_kind() -> ConnectionType {
    ConnectionType::Aux
}

impl EngineConfig {
    /// Creates a config with default engine settings and no buses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the engine settings.
    pub fn with_engine(mut self, engine: MixConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Adds a bus.
    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.buses.push(bus);
        self
    }

    /// Load a config from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(
            path = %path.display(),
            buses = config.buses.len(),
            "engine config loaded"
        );
        Ok(config)
    }

    /// Load a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Save the config to a TOML file, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
            }
        }
        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))?;
        Ok(())
    }

    /// Convert the config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Looks up a bus id by name.
    pub fn bus_id(&self, name: &str) -> Option<BusDefId> {
        self.buses
            .iter()
            .find(|b| b.name == name)
            .map(|b| BusDefId(b.id))
    }

    /// Validates the document and builds the bus catalogue.
    pub fn catalog(&self, registry: &EffectRegistry) -> Result<BusCatalog, ConfigError> {
        validate_engine_config(self, registry)?;

        let ids: BTreeMap<&str, BusDefId> = self
            .buses
            .iter()
            .map(|b| (b.name.as_str(), BusDefId(b.id)))
            .collect();
        // Validation guarantees every name resolves.
        let lookup = |name: &str| ids.get(name).copied().unwrap_or(BusDefId(u32::MAX));

        let mut catalog = BusCatalog::new();
        for bus in &self.buses {
            let mut def = BusDefinition::new(BusDefId(bus.id), bus.name.clone())
                .with_volume_db(bus.volume_db);
            def.parent = bus.parent.as_deref().map(lookup);
            def.channels = bus.channels;
            def.hdr = bus.hdr;
            for effect in &bus.effects {
                def.effects.push(registry.descriptor(effect)?);
            }
            def.sends = bus
                .sends
                .iter()
                .map(|s| BusSend {
                    target: lookup(&s.target),
                    kind: s.kind,
                    gain_db: s.gain_db,
                })
                .collect();
            catalog.insert(def)?;
        }
        Ok(catalog)
    }

    /// Validates the document and creates an engine from it.
    pub fn build_context(&self, registry: &EffectRegistry) -> Result<MixGraphContext, ConfigError> {
        let catalog = self.catalog(registry)?;
        let context = MixGraphContext::new(self.engine.clone(), catalog)?;
        tracing::info!(
            buses = self.buses.len(),
            sample_rate = self.engine.sample_rate,
            frame_size = self.engine.frame_size,
            "mix graph built from config"
        );
        Ok(context)
    }
}
