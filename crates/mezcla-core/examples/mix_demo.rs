//! Mix demo: two listeners, a music/sfx hierarchy, a reverb feedback loop,
//! HDR on the master, and a voice that runs dry.
//!
//! Run with: RUST_LOG=mezcla_core=debug cargo run -p mezcla-core --example mix_demo

use mezcla_core::graph::{ExecutedNode, HdrSettings};
use mezcla_core::{
    AudioBuffer, BusCatalog, BusDefId, BusDefinition, ChannelConfig, ConnectionType, MixConfig,
    MixError, MixGraphContext, RoutingContextId, SendTarget, Sink, SinkStatus, Source,
    SourceStatus,
};
use tracing_subscriber::EnvFilter;

const MASTER: BusDefId = BusDefId(0);
const MUSIC: BusDefId = BusDefId(1);
const SFX: BusDefId = BusDefId(2);
const REVERB: BusDefId = BusDefId(3);

/// Sine oscillator that stops after a fixed number of frames.
struct Sine {
    phase: f32,
    step: f32,
    remaining: Option<u32>,
}

impl Sine {
    fn new(freq: f32, sample_rate: f32, frames: Option<u32>) -> Self {
        Self {
            phase: 0.0,
            step: freq / sample_rate,
            remaining: frames,
        }
    }
}

impl Source for Sine {
    fn channels(&self) -> ChannelConfig {
        ChannelConfig::MONO
    }

    fn produce(&mut self, buffer: &mut AudioBuffer) -> SourceStatus {
        for sample in buffer.channel_mut(0) {
            *sample = 0.2 * (self.phase * core::f32::consts::TAU).sin();
            self.phase = (self.phase + self.step).fract();
        }
        buffer.set_valid_frames(buffer.capacity());
        match &mut self.remaining {
            Some(0) => SourceStatus::NoMoreData,
            Some(n) => {
                *n -= 1;
                SourceStatus::DataReady
            }
            None => SourceStatus::DataReady,
        }
    }
}

/// Prints the peak of every pushed buffer.
struct Meter(&'static str);

impl Sink for Meter {
    fn push(&mut self, buffer: &AudioBuffer, gain: f32) -> SinkStatus {
        let peak = buffer.meter().peak * gain;
        println!("  {:<8} peak {:>6.3}", self.0, peak);
        SinkStatus::Accepted
    }
}

fn main() -> Result<(), MixError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let catalog = BusCatalog::new()
        .with(BusDefinition::new(MASTER, "master").with_hdr(HdrSettings {
            threshold_db: -18.0,
            ratio: 3.0,
            ..HdrSettings::default()
        }))?
        .with(BusDefinition::new(MUSIC, "music").with_parent(MASTER))?
        .with(BusDefinition::new(SFX, "sfx").with_parent(MASTER))?
        .with(
            BusDefinition::new(REVERB, "reverb")
                .with_parent(MASTER)
                .with_send(SFX, ConnectionType::Feedback, -9.0),
        )?;

    let config = MixConfig {
        frame_size: 256,
        worker_threads: 2,
        record_execution: true,
        ..MixConfig::default()
    };
    let sample_rate = config.sample_rate;
    let mut mix = MixGraphContext::new(config, catalog)?;

    let player_one = RoutingContextId(0);
    let player_two = RoutingContextId(1);
    mix.register_context(player_one, Meter("p1"), 1.0);
    mix.register_context(player_two, Meter("p2"), 0.5);

    let handle = mix.handle();
    handle.play(player_one, MUSIC, Sine::new(220.0, sample_rate, None));
    handle.play_with(
        player_one,
        SFX,
        vec![SendTarget::direct(SFX), SendTarget::aux(REVERB, -6.0)],
        -3.0,
        Box::new(Sine::new(880.0, sample_rate, Some(3))),
    );
    handle.play(player_two, SFX, Sine::new(440.0, sample_rate, None));

    for _ in 0..6 {
        let report = mix.run_one_frame();
        println!(
            "frame {}: {} voices, {} buses, cycles {}, resorted {}, stopped {}",
            report.frame,
            report.voices_produced,
            report.buses_processed,
            report.has_cycles,
            report.resorted,
            report.voices_stopped,
        );
        let order: Vec<String> = report
            .execution
            .iter()
            .map(|node| match node {
                ExecutedNode::Voice(v) => format!("v{}", v.0),
                ExecutedNode::Bus(b) => format!("b{}@{}", b.def.0, b.context.0),
            })
            .collect();
        println!("  order: {}", order.join(" "));
    }

    let snapshot = mix.frame_snapshot();
    println!("\nbuses after {} frames:", mix.frame());
    for bus in &snapshot.buses {
        println!(
            "  b{}@{} depth {:?} peak {:.3} hdr {:?}",
            bus.key.def.0,
            bus.key.context.0,
            bus.depth,
            bus.meter.peak,
            bus.hdr_reduction_db,
        );
    }
    Ok(())
}
