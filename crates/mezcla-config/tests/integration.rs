//! Integration tests for mezcla-config.
//!
//! These tests go from a TOML file on disk to a running mix graph.

use std::sync::{Arc, Mutex};

use mezcla_config::{
    BusConfig, ConfigError, EffectConfig, EffectRegistry, EngineConfig, ValidationError,
};
use mezcla_core::graph::HdrSettings;
use mezcla_core::{
    AudioBuffer, ChannelConfig, ConnectionType, MixConfig, RoutingContextId, Sink, SinkStatus,
    Source, SourceStatus, db_to_linear,
};
use tempfile::TempDir;

const CTX: RoutingContextId = RoutingContextId(0);

struct Constant(f32);

impl Source for Constant {
    fn channels(&self) -> ChannelConfig {
        ChannelConfig::MONO
    }

    fn produce(&mut self, buffer: &mut AudioBuffer) -> SourceStatus {
        buffer.channel_mut(0).fill(self.0);
        buffer.set_valid_frames(buffer.capacity());
        SourceStatus::DataReady
    }
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<(usize, f32)>>>);

impl Sink for Capture {
    fn push(&mut self, buffer: &AudioBuffer, gain: f32) -> SinkStatus {
        self.0
            .lock()
            .unwrap()
            .push((buffer.num_channels(), buffer.channel(0)[0] * gain));
        SinkStatus::Accepted
    }
}

fn game_mix() -> EngineConfig {
    EngineConfig::new()
        .with_engine(MixConfig {
            frame_size: 128,
            ..MixConfig::default()
        })
        .with_bus(BusConfig::new(0, "master").with_hdr(HdrSettings::default()))
        .with_bus(
            BusConfig::new(1, "sfx")
                .with_parent("master")
                .with_effect(EffectConfig::new("gain").with_param("gain_db", -6.0))
                .with_send("reverb", ConnectionType::Aux, -9.0),
        )
        .with_bus(
            BusConfig::new(2, "reverb")
                .with_parent("master")
                .with_send("sfx", ConnectionType::Feedback, -12.0),
        )
        .with_bus(
            BusConfig::new(3, "radio")
                .with_parent("master")
                .with_effect(EffectConfig::new("downmix").with_param("channels", 1.0))
                .with_effect(EffectConfig::new("gain").with_param("gain_db", -3.0).bypassed()),
        )
}

/// Save to disk, load back, and get the same document.
#[test]
fn save_and_load_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("audio").join("mix.toml");

    let config = game_mix();
    config.save(&path).expect("should save config");
    assert!(path.exists(), "save should create parent directories");

    let loaded = EngineConfig::load(&path).expect("should load config");
    assert_eq!(loaded, config);
}

#[test]
fn load_missing_file_reports_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("missing.toml");
    let err = EngineConfig::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::ReadFile { path: ref p, .. } if *p == path));
}

#[test]
fn load_malformed_file_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[[buses]]\nid = \"zero\"\n").unwrap();
    assert!(matches!(
        EngineConfig::load(&path),
        Err(ConfigError::TomlParse(_))
    ));
}

/// A config-built engine routes and processes like a hand-built one.
#[test]
fn built_context_runs_frames() {
    let config = game_mix();
    let mut mix = config.build_context(&EffectRegistry::new()).unwrap();
    let capture = Capture::default();
    mix.register_context(CTX, capture.clone(), 1.0);

    let sfx = config.bus_id("sfx").unwrap();
    mix.handle().play(CTX, sfx, Constant(0.5));
    let report = mix.run_one_frame();

    assert_eq!(report.voices_produced, 1);
    assert!(report.has_cycles, "reverb feeds sfx back");
    assert_eq!(report.producer_failures, 0);

    let pushed = capture.0.lock().unwrap();
    assert_eq!(pushed.len(), 1);
    let (channels, first) = pushed[0];
    assert_eq!(channels, 2);
    // sfx gain -6 dB, plus the reverb's aux copy at -9 dB; HDR starts idle.
    let expected = 0.5 * db_to_linear(-6.0) * (1.0 + db_to_linear(-9.0));
    assert!((first - expected).abs() < 1e-5, "{first} != {expected}");
}

#[test]
fn bypassed_effects_start_bypassed() {
    let config = game_mix();
    let mut mix = config.build_context(&EffectRegistry::new()).unwrap();
    mix.register_context(CTX, Capture::default(), 1.0);
    let radio = mix.get_or_create_bus(config.bus_id("radio").unwrap(), CTX).unwrap();

    let bus = mix.bus(radio).unwrap();
    assert_eq!(bus.effects().len(), 2);
    assert!(!bus.effects()[0].is_bypassed());
    assert!(bus.effects()[1].is_bypassed());
}

#[test]
fn invalid_document_never_builds() {
    let config = game_mix().with_bus(BusConfig::new(4, "ui").with_parent("hud"));
    let err = config.build_context(&EffectRegistry::new()).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Validation(ValidationError::UnknownParent { ref parent, .. }) if parent == "hud"
    ));
}

#[test]
fn custom_registry_effects_are_available() {
    let mut registry = EffectRegistry::new();
    registry.register(
        "mute",
        "Silences the bus",
        Vec::new(),
        |_, _| {
            mezcla_core::Effect::in_place(mezcla_core::effect::PerChannel::new(
                mezcla_core::effect::Gain::from_db(-200.0),
            ))
        },
    );
    let config = EngineConfig::new()
        .with_bus(BusConfig::new(0, "master").with_effect(EffectConfig::new("mute")));

    assert!(config.build_context(&EffectRegistry::new()).is_err());
    let mut mix = config.build_context(&registry).unwrap();
    let capture = Capture::default();
    mix.register_context(CTX, capture.clone(), 1.0);
    mix.handle().play(CTX, config.bus_id("master").unwrap(), Constant(1.0));
    mix.run_one_frame();
    assert!(capture.0.lock().unwrap()[0].1.abs() < 1e-6);
}
