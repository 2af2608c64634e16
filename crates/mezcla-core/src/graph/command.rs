//! Command queue between game threads and the audio thread.
//!
//! [`MixHandle`] is cheap to clone and safe to share. Callers push
//! [`Command`]s under a short-held `parking_lot::Mutex`; the audio thread
//! drains the queue at the start of every frame with `try_lock`, so a caller
//! holding the lock delays its commands by a frame rather than stalling audio.
//!
//! Voice ids come from an atomic counter, so `play` returns immediately with
//! the id the voice will have once the audio thread picks it up.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::collab::{Sink, Source};

use super::node::{BusDefId, BusKey, RoutingContextId, SendTarget, VoiceId};

/// Everything needed to start a voice.
pub struct PlayRequest {
    /// Id allocated by the handle.
    pub voice: VoiceId,
    /// Routing context the voice plays in.
    pub context: RoutingContextId,
    /// Bus used when the voice has no explicit sends.
    pub output_bus: BusDefId,
    /// Explicit sends; empty means Direct to `output_bus`.
    pub sends: Vec<SendTarget>,
    /// Loudness of the sound in dB, used by HDR buses.
    pub loudness_db: f32,
    /// Audio producer.
    pub source: Box<dyn Source>,
}

/// A request from a game thread, applied at the next Refresh.
pub enum Command {
    /// Start a voice.
    Play(PlayRequest),
    /// Stop a voice at the end of the frame.
    Stop(VoiceId),
    /// Keep a voice connected but silent.
    Pause(VoiceId),
    /// Resume a paused voice.
    Resume(VoiceId),
    /// Update a voice's loudness.
    SetLoudness {
        /// Target voice.
        voice: VoiceId,
        /// Loudness in dB.
        loudness_db: f32,
    },
    /// Replace a voice's sends.
    SetSends {
        /// Target voice.
        voice: VoiceId,
        /// New sends; empty means Direct to the output bus.
        sends: Vec<SendTarget>,
    },
    /// Change a voice's default output bus.
    SetOutputBus {
        /// Target voice.
        voice: VoiceId,
        /// New output bus.
        bus: BusDefId,
    },
    /// Bypass or re-enable one effect slot of a live bus.
    SetEffectBypass {
        /// Target bus instance.
        bus: BusKey,
        /// Slot index in the bus's chain.
        slot: usize,
        /// New bypass state.
        bypass: bool,
    },
    /// Register (or re-bind) a routing context.
    RegisterContext {
        /// Context id.
        context: RoutingContextId,
        /// Sink for its top-level buses.
        sink: Box<dyn Sink>,
        /// Linear gain the sink receives buses with.
        gain: f32,
    },
    /// Unregister a routing context; its voices stop.
    UnregisterContext(RoutingContextId),
    /// Change a context's sink gain.
    SetContextGain {
        /// Context id.
        context: RoutingContextId,
        /// Linear gain.
        gain: f32,
    },
}

impl core::fmt::Debug for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Play(req) => f
                .debug_struct("Play")
                .field("voice", &req.voice)
                .field("context", &req.context)
                .field("output_bus", &req.output_bus)
                .finish_non_exhaustive(),
            Self::Stop(v) => f.debug_tuple("Stop").field(v).finish(),
            Self::Pause(v) => f.debug_tuple("Pause").field(v).finish(),
            Self::Resume(v) => f.debug_tuple("Resume").field(v).finish(),
            Self::SetLoudness { voice, loudness_db } => f
                .debug_struct("SetLoudness")
                .field("voice", voice)
                .field("loudness_db", loudness_db)
                .finish(),
            Self::SetSends { voice, sends } => f
                .debug_struct("SetSends")
                .field("voice", voice)
                .field("sends", sends)
                .finish(),
            Self::SetOutputBus { voice, bus } => f
                .debug_struct("SetOutputBus")
                .field("voice", voice)
                .field("bus", bus)
                .finish(),
            Self::SetEffectBypass { bus, slot, bypass } => f
                .debug_struct("SetEffectBypass")
                .field("bus", bus)
                .field("slot", slot)
                .field("bypass", bypass)
                .finish(),
            Self::RegisterContext { context, gain, .. } => f
                .debug_struct("RegisterContext")
                .field("context", context)
                .field("gain", gain)
                .finish_non_exhaustive(),
            Self::UnregisterContext(c) => f.debug_tuple("UnregisterContext").field(c).finish(),
            Self::SetContextGain { context, gain } => f
                .debug_struct("SetContextGain")
                .field("context", context)
                .field("gain", gain)
                .finish(),
        }
    }
}

struct Shared {
    queue: Mutex<VecDeque<Command>>,
    next_voice: AtomicU64,
}

/// Game-thread handle to a [`MixGraphContext`](crate::MixGraphContext).
#[derive(Clone)]
pub struct MixHandle {
    inner: Arc<Shared>,
}

impl core::fmt::Debug for MixHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MixHandle")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Default for MixHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl MixHandle {
    /// Creates a handle with an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                next_voice: AtomicU64::new(1),
            }),
        }
    }

    /// Queues a command.
    pub fn push(&self, command: Command) {
        self.inner.queue.lock().push_back(command);
    }

    /// Returns the number of queued commands.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Allocates a fresh voice id.
    pub fn allocate_voice(&self) -> VoiceId {
        VoiceId(self.inner.next_voice.fetch_add(1, Ordering::Relaxed))
    }

    /// Starts a voice routed Direct to `output_bus`.
    pub fn play(
        &self,
        context: RoutingContextId,
        output_bus: BusDefId,
        source: impl Source + 'static,
    ) -> VoiceId {
        self.play_with(context, output_bus, Vec::new(), 0.0, Box::new(source))
    }

    /// Starts a voice with explicit sends and loudness.
    pub fn play_with(
        &self,
        context: RoutingContextId,
        output_bus: BusDefId,
        sends: Vec<SendTarget>,
        loudness_db: f32,
        source: Box<dyn Source>,
    ) -> VoiceId {
        let voice = self.allocate_voice();
        self.push(Command::Play(PlayRequest {
            voice,
            context,
            output_bus,
            sends,
            loudness_db,
            source,
        }));
        voice
    }

    /// Stops a voice.
    pub fn stop(&self, voice: VoiceId) {
        self.push(Command::Stop(voice));
    }

    /// Pauses a voice.
    pub fn pause(&self, voice: VoiceId) {
        self.push(Command::Pause(voice));
    }

    /// Resumes a paused voice.
    pub fn resume(&self, voice: VoiceId) {
        self.push(Command::Resume(voice));
    }

    /// Sets a voice's loudness in dB.
    pub fn set_loudness(&self, voice: VoiceId, loudness_db: f32) {
        self.push(Command::SetLoudness { voice, loudness_db });
    }

    /// Replaces a voice's sends.
    pub fn set_sends(&self, voice: VoiceId, sends: Vec<SendTarget>) {
        self.push(Command::SetSends { voice, sends });
    }

    /// Changes a voice's output bus.
    pub fn set_output_bus(&self, voice: VoiceId, bus: BusDefId) {
        self.push(Command::SetOutputBus { voice, bus });
    }

    /// Bypasses or re-enables an effect slot on a live bus.
    pub fn set_effect_bypass(&self, bus: BusKey, slot: usize, bypass: bool) {
        self.push(Command::SetEffectBypass { bus, slot, bypass });
    }

    /// Registers a routing context.
    pub fn register_context(
        &self,
        context: RoutingContextId,
        sink: impl Sink + 'static,
        gain: f32,
    ) {
        self.push(Command::RegisterContext {
            context,
            sink: Box::new(sink),
            gain,
        });
    }

    /// Unregisters a routing context.
    pub fn unregister_context(&self, context: RoutingContextId) {
        self.push(Command::UnregisterContext(context));
    }

    /// Changes a context's sink gain.
    pub fn set_context_gain(&self, context: RoutingContextId, gain: f32) {
        self.push(Command::SetContextGain { context, gain });
    }

    /// Moves every queued command into `out` (audio thread, non-blocking).
    ///
    /// Returns false if the lock was contended; the commands stay queued.
    pub(crate) fn try_drain_into(&self, out: &mut Vec<Command>) -> bool {
        match self.inner.queue.try_lock() {
            Some(mut queue) => {
                out.extend(queue.drain(..));
                true
            }
            None => false,
        }
    }
}
