//! Playback lifecycle
//!
//! [`PlaybackEngine`] owns the active media stream and walks it through
//! `Idle -> Loading -> Playing -> {Switching -> Playing | Stopping -> Idle}`.
//! Everything slow (readiness polling, fades, end-of-stream) arrives later as
//! an [`EngineEvent`] on the engine's channel; every play/stop bumps a
//! generation counter so events belonging to a superseded request are
//! dropped before they can touch the player or the state.
//!
//! The engine never talks to surfaces. It queues [`PlaybackEvent`]s which
//! the scheduler drains with [`PlaybackEngine::take_events`] and forwards to
//! the display controller in order.

mod engine;
mod fade;
mod media;

use common::PlaybackState;
use std::time::Duration;

use crate::catalog::VideoId;

pub use engine::{PlayOutcome, PlaybackEngine, PlaybackError, PlaybackSession};
pub use fade::{FadeCurve, FadeEvent, FadeKind, FadeTarget};
pub use media::{
    EosToken, FrameSlot, MediaBackend, MediaError, MediaEvent, MediaHandle, StreamId, VideoFrame,
};

#[cfg(test)]
pub use media::fake;

/// Durations and retry budget used by the engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackTimings {
    /// Total switch time; half fading out, half fading in
    pub crossfade: Duration,
    pub audio_fade: Duration,
    pub stop_fade: Duration,
    pub readiness_interval: Duration,
    pub readiness_max_attempts: u32,
    pub fade_curve: FadeCurve,
}

impl Default for PlaybackTimings {
    fn default() -> Self {
        crate::config::PlaybackSettings::default().timings()
    }
}

/// Inbound events the engine reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Fade(FadeEvent),
    ReadinessCheck { generation: u64, attempt: u32 },
    Media(MediaEvent),
}

/// What the engine tells the rest of the daemon
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    StateChanged(PlaybackState),
    /// Stream every surface should show from now on
    StreamChanged(Option<MediaHandle>),
    /// Cover opacity over the stream, 0.0 (video visible) to 1.0 (hidden)
    CoverOpacity(f32),
    /// The request with this generation is now on screen
    Started {
        generation: u64,
        id: VideoId,
        readiness_timed_out: bool,
    },
    /// The request with this generation was replaced before it started
    Superseded { generation: u64 },
    /// The source for this generation errored before it started
    Failed { generation: u64, message: String },
}
