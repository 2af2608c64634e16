//! Bus definitions: the static mixing hierarchy buses are instantiated from.
//!
//! A [`BusDefinition`] names its parent, its channel layout, volume, effect
//! chain, static sends and optional HDR stage. The builder creates one
//! instance of a definition per routing context the first time something
//! routes to it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer::ChannelConfig;
use crate::config::MixConfig;
use crate::effect::Effect;
use crate::error::MixError;

use super::connection::ConnectionType;
use super::hdr::HdrSettings;
use super::node::BusDefId;

/// Builds a fresh effect instance for a new bus.
pub type EffectFactory = Arc<dyn Fn(&MixConfig) -> Effect + Send + Sync>;

/// One entry of a bus's effect chain.
#[derive(Clone)]
pub struct EffectDescriptor {
    /// Display name, usually the registry id.
    pub name: String,
    /// Factory called once per bus instance.
    pub factory: EffectFactory,
    /// Whether new instances start bypassed.
    pub bypass: bool,
}

impl core::fmt::Debug for EffectDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EffectDescriptor")
            .field("name", &self.name)
            .field("bypass", &self.bypass)
            .finish_non_exhaustive()
    }
}

/// A static bus-to-bus send.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BusSend {
    /// Target bus definition (same routing context).
    pub target: BusDefId,
    /// `Aux` or `Feedback`.
    pub kind: ConnectionType,
    /// Send level in dB.
    pub gain_db: f32,
}

/// Definition of a bus in the mixing hierarchy.
#[derive(Clone, Debug)]
pub struct BusDefinition {
    /// Identifier.
    pub id: BusDefId,
    /// Human-readable name.
    pub name: String,
    /// Parent bus; `None` makes this a top-level bus feeding the sink.
    pub parent: Option<BusDefId>,
    /// Channel layout; `None` uses the engine's output layout.
    pub channels: Option<ChannelConfig>,
    /// Initial volume in dB.
    pub volume_db: f32,
    /// Effect chain, in processing order.
    pub effects: Vec<EffectDescriptor>,
    /// Static sends created with every instance.
    pub sends: Vec<BusSend>,
    /// Compression stage settings.
    pub hdr: Option<HdrSettings>,
}

impl BusDefinition {
    /// Creates a top-level definition with unity volume and no effects.
    pub fn new(id: BusDefId, name: impl Into<String>) -> Self {
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

    /// Sets the parent bus.
    pub fn with_parent(mut self, parent: BusDefId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Sets the channel layout.
    pub fn with_channels(mut self, channels: ChannelConfig) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Sets the initial volume.
    pub fn with_volume_db(mut self, volume_db: f32) -> Self {
        self.volume_db = volume_db;
        self
    }

    /// Appends an effect to the chain.
    pub fn with_effect(
        mut self,
        name: impl Into<String>,
        factory: impl Fn(&MixConfig) -> Effect + Send + Sync + 'static,
    ) -> Self {
        self.effects.push(EffectDescriptor {
            name: name.into(),
            factory: Arc::new(factory),
            bypass: false,
        });
        self
    }

    /// Adds a static send.
    pub fn with_send(mut self, target: BusDefId, kind: ConnectionType, gain_db: f32) -> Self {
        self.sends.push(BusSend {
            target,
            kind,
            gain_db,
        });
        self
    }

    /// Enables the HDR stage.
    pub fn with_hdr(mut self, hdr: HdrSettings) -> Self {
        self.hdr = Some(hdr);
        self
    }
}

/// All bus definitions known to an engine.
#[derive(Clone, Debug, Default)]
pub struct BusCatalog {
    defs: HashMap<BusDefId, BusDefinition>,
}

impl BusCatalog {
    /// Creates an empty catalogue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a definition.
    ///
    /// Fails if the id is taken or a static send is `Direct` (the parent link
    /// is the only Direct bus output).
    pub fn insert(&mut self, def: BusDefinition) -> Result<(), MixError> {
        if self.defs.contains_key(&def.id) {
            return Err(MixError::Config(format!(
                "duplicate bus definition {:?} ({})",
                def.id, def.name
            )));
        }
        if def.sends.iter().any(|s| s.kind == ConnectionType::Direct) {
            return Err(MixError::InvalidConnection(format!(
                "bus '{}' declares a Direct send; use its parent instead",
                def.name
            )));
        }
        self.defs.insert(def.id, def);
        Ok(())
    }

    /// Adds a definition, builder style.
    pub fn with(mut self, def: BusDefinition) -> Result<Self, MixError> {
        self.insert(def)?;
        Ok(self)
    }

    /// Looks up a definition.
    pub fn get(&self, id: BusDefId) -> Option<&BusDefinition> {
        self.defs.get(&id)
    }

    /// Looks up a definition by name.
    pub fn find(&self, name: &str) -> Option<&BusDefinition> {
        self.defs.values().find(|d| d.name == name)
    }

    /// Returns the number of definitions.
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// Returns true if there are no definitions.
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Iterates over all definitions in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &BusDefinition> {
        self.defs.values()
    }
}
