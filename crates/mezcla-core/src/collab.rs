//! Collaborator traits: the engine's seams to the outside world.
//!
//! - [`Source`] - Produces one frame of audio per playing voice (decoders,
//!   synths, streams)
//! - [`Sink`] - Receives the final output of each top-level bus (device
//!   drivers, capture, offline writers)
//! - [`ParameterSource`] - Resolves per-connection gain/LPF/HPF targets and
//!   bus volumes (game parameters, 3D attenuation, snapshots)
//! - [`Monitor`] - Observes a snapshot of the graph after each frame
//! - [`DecodeBarrier`] - Lets hardware-decoded voices finish before mixing
//!
//! Sources are called from worker threads (one voice at a time, never
//! concurrently for the same voice), so they must be `Send`. Everything else
//! is called from the audio thread.

use core::time::Duration;

use crate::buffer::{AudioBuffer, ChannelConfig};
use crate::graph::{BusKey, ConnectionKey, ConnectionParams, FrameSnapshot};

/// Outcome of [`Source::produce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    /// The buffer holds this tick's frames.
    DataReady,
    /// The buffer holds the final frames; the voice stops after this tick.
    NoMoreData,
    /// Nothing is ready yet (decoder behind, stream buffering). The voice
    /// contributes nothing this tick and is starving.
    NoDataReady,
    /// The source failed; the voice stops.
    Fail,
}

/// Audio producer for one voice.
pub trait Source: Send {
    /// Channel layout of the produced audio.
    fn channels(&self) -> ChannelConfig {
        ChannelConfig::STEREO
    }

    /// Writes up to `buffer.capacity()` frames and sets the valid-frame count.
    ///
    /// The buffer arrives with this source's channel layout and no valid
    /// frames.
    fn produce(&mut self, buffer: &mut AudioBuffer) -> SourceStatus;

    /// Returns true if this source is decoded by hardware and the engine
    /// must wait on the [`DecodeBarrier`] before reading it.
    fn requires_decode_barrier(&self) -> bool {
        false
    }
}

/// Outcome of [`Sink::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    /// The sink took the buffer.
    Accepted,
    /// The sink could not take a buffer this tick; the output is dropped.
    NotReady,
}

/// Destination of a routing context's top-level buses.
pub trait Sink: Send {
    /// Receives a top-level bus output with the context gain (linear).
    fn push(&mut self, buffer: &AudioBuffer, gain: f32) -> SinkStatus;
}

/// Resolves mixing parameters each frame.
///
/// Both methods receive the current value and may overwrite it. Defaults
/// leave everything unchanged.
pub trait ParameterSource: Send {
    /// Updates the targets of one connection (gain, LPF, HPF).
    fn connection_targets(&mut self, key: &ConnectionKey, params: &mut ConnectionParams) {
        let _ = (key, params);
    }

    /// Updates the volume (dB) of one bus.
    fn bus_volume_db(&mut self, bus: BusKey, volume_db: &mut f32) {
        let _ = (bus, volume_db);
    }
}

/// Observer of the graph after each frame.
pub trait Monitor: Send {
    /// Called at the end of every frame with the sorted topology, connection
    /// volumes and bus meters.
    fn on_frame(&mut self, snapshot: &FrameSnapshot);
}

/// Synchronization point with a hardware decoder.
pub trait DecodeBarrier: Send + Sync {
    /// Blocks until the current batch is decoded or `timeout` elapses.
    ///
    /// Returns false on timeout.
    fn wait(&self, timeout: Duration) -> bool;
}
