use common::PlaybackState;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use super::fade::{FadeEvent, FadeKind, FadeTarget, Fader};
use super::media::{EosToken, MediaBackend, MediaError, MediaEvent, MediaHandle};
use super::{EngineEvent, PlaybackEvent, PlaybackTimings};
use crate::catalog::VideoId;

#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("source file missing: {}", .0.display())]
    SourceFileMissing(PathBuf),

    #[error(transparent)]
    Media(#[from] MediaError),
}

impl From<PlaybackError> for common::WallpaperError {
    fn from(e: PlaybackError) -> Self {
        Self::Playback(e.to_string())
    }
}

/// Result of a successful `play` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// The same source is already playing or being prepared
    AlreadyActive,
    /// The request was accepted; `PlaybackEvent::Started` with this
    /// generation follows once the source is on screen
    Pending { generation: u64 },
}

/// Observable playback state
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSession {
    pub active_id: Option<VideoId>,
    pub state: PlaybackState,
    pub audio_enabled: bool,
    pub audio_volume: f32,
}

impl From<&PlaybackSession> for common::PlaybackStatus {
    fn from(session: &PlaybackSession) -> Self {
        Self {
            state: session.state,
            active_id: session.active_id.as_ref().map(|id| id.to_string()),
            audio_enabled: session.audio_enabled,
            audio_volume: session.audio_volume,
        }
    }
}

struct ActiveStream {
    handle: MediaHandle,
    id: VideoId,
    path: PathBuf,
    eos: Option<EosToken>,
    loops: u64,
}

struct PendingSource {
    handle: MediaHandle,
    id: VideoId,
    path: PathBuf,
    generation: u64,
    /// `Some(timed_out)` once the readiness poll has finished
    readiness: Option<bool>,
}

enum Readiness {
    Ready,
    TimedOut,
    Retry,
}

pub struct PlaybackEngine {
    backend: Box<dyn MediaBackend>,
    timings: PlaybackTimings,
    tx: mpsc::UnboundedSender<EngineEvent>,
    fader: Fader,
    session: PlaybackSession,
    generation: u64,
    current: Option<ActiveStream>,
    pending: Option<PendingSource>,
    cover: f32,
    volume_level: f32,
    /// The switch fade-out for the current generation has finished
    cover_opaque: bool,
    events: Vec<PlaybackEvent>,
}

impl PlaybackEngine {
    pub fn new(
        backend: Box<dyn MediaBackend>,
        timings: PlaybackTimings,
        tx: mpsc::UnboundedSender<EngineEvent>,
        audio_enabled: bool,
        audio_volume: f32,
    ) -> Self {
        Self {
            backend,
            timings,
            fader: Fader::new(tx.clone(), timings.fade_curve),
            tx,
            session: PlaybackSession {
                active_id: None,
                state: PlaybackState::Idle,
                audio_enabled,
                audio_volume: audio_volume.clamp(0.0, 1.0),
            },
            generation: 0,
            current: None,
            pending: None,
            cover: 1.0,
            volume_level: 0.0,
            cover_opaque: false,
            events: Vec::new(),
        }
    }

    pub fn session(&self) -> &PlaybackSession {
        &self.session
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub fn cover_opacity(&self) -> f32 {
        self.cover
    }

    /// Stream currently shown on the surfaces
    pub fn current_stream(&self) -> Option<&MediaHandle> {
        self.current.as_ref().map(|c| &c.handle)
    }

    /// Source being prepared to replace the current stream
    pub fn pending_id(&self) -> Option<&VideoId> {
        self.pending.as_ref().map(|p| &p.id)
    }

    /// How many times the current stream wrapped around
    #[cfg(test)]
    pub fn loop_count(&self) -> u64 {
        self.current.as_ref().map_or(0, |c| c.loops)
    }

    pub fn take_events(&mut self) -> Vec<PlaybackEvent> {
        std::mem::take(&mut self.events)
    }

    /// Start playing `path` as `id`.
    ///
    /// If the source cannot be opened nothing changes: an idle engine stays
    /// idle and a playing one keeps its current stream.
    pub fn play(&mut self, id: &VideoId, path: &Path) -> Result<PlayOutcome, PlaybackError> {
        if !path.is_file() {
            return Err(PlaybackError::SourceFileMissing(path.to_path_buf()));
        }

        if self.is_active(id, path) {
            log::debug!("{} is already active, ignoring play request", id);
            return Ok(PlayOutcome::AlreadyActive);
        }

        let handle = self.backend.open(path)?;
        self.backend.set_muted(&handle, !self.session.audio_enabled);
        self.backend.set_volume(&handle, 0.0);

        self.generation += 1;
        let generation = self.generation;
        log::info!(
            "Play {} from {} (generation {})",
            id,
            path.display(),
            generation
        );

        if let Some(stale) = self.pending.take() {
            log::debug!("Generation {} superseded before start", stale.generation);
            self.backend.close(&stale.handle);
            self.events.push(PlaybackEvent::Superseded {
                generation: stale.generation,
            });
        }

        self.pending = Some(PendingSource {
            handle,
            id: id.clone(),
            path: path.to_path_buf(),
            generation,
            readiness: None,
        });
        self.cover_opaque = false;

        if self.current.is_some() {
            self.set_state(PlaybackState::Switching);
            let half = self.timings.crossfade / 2;
            self.fader
                .start(FadeTarget::Cover, generation, self.cover, 1.0, half);
            if self.session.audio_enabled {
                self.fader
                    .start(FadeTarget::Volume, generation, self.volume_level, 0.0, half);
            }
        } else {
            self.fader.cancel_all();
            self.set_state(PlaybackState::Loading);
        }

        self.check_readiness(generation, 0);
        Ok(PlayOutcome::Pending { generation })
    }

    /// Fade to the cover and tear the stream down; false if already idle or
    /// stopping
    pub fn stop(&mut self) -> bool {
        if matches!(
            self.session.state,
            PlaybackState::Idle | PlaybackState::Stopping
        ) {
            return false;
        }

        self.generation += 1;
        let generation = self.generation;
        log::info!("Stopping playback (generation {})", generation);

        if let Some(stale) = self.pending.take() {
            self.backend.close(&stale.handle);
            self.events.push(PlaybackEvent::Superseded {
                generation: stale.generation,
            });
        }

        if self.current.is_none() {
            self.fader.cancel_all();
            self.session.active_id = None;
            self.set_state(PlaybackState::Idle);
            return true;
        }

        self.set_state(PlaybackState::Stopping);
        self.fader.start(
            FadeTarget::Cover,
            generation,
            self.cover,
            1.0,
            self.timings.stop_fade,
        );
        if self.session.audio_enabled {
            self.fader.start(
                FadeTarget::Volume,
                generation,
                self.volume_level,
                0.0,
                self.timings.stop_fade,
            );
        }
        true
    }

    /// Tear everything down immediately, without fades
    pub fn shutdown(&mut self) {
        self.fader.cancel_all();
        if let Some(pending) = self.pending.take() {
            self.backend.close(&pending.handle);
        }
        if let Some(current) = self.current.take() {
            self.teardown(current);
            self.events.push(PlaybackEvent::StreamChanged(None));
        }
        self.session.active_id = None;
        self.set_state(PlaybackState::Idle);
    }

    /// Enable or disable audio with a short ramp; remembered for later plays
    pub fn set_audio_enabled(&mut self, enabled: bool) {
        if self.session.audio_enabled == enabled {
            return;
        }
        self.session.audio_enabled = enabled;
        log::info!("Audio {}", if enabled { "enabled" } else { "disabled" });

        if let Some(pending) = &self.pending {
            self.backend.set_muted(&pending.handle, !enabled);
        }
        let Some(current) = &self.current else {
            return;
        };

        let target = if enabled {
            self.backend.set_muted(&current.handle, false);
            self.session.audio_volume
        } else {
            0.0
        };
        self.fader.start(
            FadeTarget::Volume,
            self.generation,
            self.volume_level,
            target,
            self.timings.audio_fade,
        );
    }

    pub fn set_volume(&mut self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.session.audio_volume = volume;

        if self.session.audio_enabled && self.current.is_some() {
            self.fader.start(
                FadeTarget::Volume,
                self.generation,
                self.volume_level,
                volume,
                self.timings.audio_fade,
            );
        }
    }

    pub fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Fade(fade) => self.handle_fade(fade),
            EngineEvent::ReadinessCheck {
                generation,
                attempt,
            } => self.check_readiness(generation, attempt),
            EngineEvent::Media(media) => self.handle_media(media),
        }
    }

    fn is_active(&self, id: &VideoId, path: &Path) -> bool {
        if let Some(pending) = &self.pending {
            return &pending.id == id && pending.path == path;
        }
        match (&self.current, self.session.state) {
            (Some(current), PlaybackState::Playing | PlaybackState::Switching) => {
                &current.id == id && current.path == path
            }
            _ => false,
        }
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.session.state != state {
            log::info!("Playback {} -> {}", self.session.state, state);
            self.session.state = state;
            self.events.push(PlaybackEvent::StateChanged(state));
        }
    }

    fn check_readiness(&mut self, generation: u64, attempt: u32) {
        let Some(pending) = self
            .pending
            .as_ref()
            .filter(|p| p.generation == generation && p.readiness.is_none())
        else {
            log::trace!("Dropping readiness check for generation {}", generation);
            return;
        };

        let outcome = if self.backend.is_ready(&pending.handle) {
            Readiness::Ready
        } else if attempt >= self.timings.readiness_max_attempts {
            Readiness::TimedOut
        } else {
            Readiness::Retry
        };

        match outcome {
            Readiness::Retry => self.schedule_readiness(generation, attempt + 1),
            Readiness::Ready | Readiness::TimedOut => {
                let timed_out = matches!(outcome, Readiness::TimedOut);
                if timed_out {
                    log::warn!(
                        "Source not ready after {} checks, starting anyway",
                        attempt + 1
                    );
                }
                if let Some(pending) = self.pending.as_mut() {
                    pending.readiness = Some(timed_out);
                }
                self.try_promote();
            }
        }
    }

    fn schedule_readiness(&self, generation: u64, attempt: u32) {
        let tx = self.tx.clone();
        let interval = self.timings.readiness_interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = tx.send(EngineEvent::ReadinessCheck {
                generation,
                attempt,
            });
        });
    }

    /// Put the pending source on screen once it is ready and, when switching,
    /// the old stream is fully covered
    fn try_promote(&mut self) {
        let ready = self
            .pending
            .as_ref()
            .is_some_and(|p| p.readiness.is_some());
        if !ready || (self.current.is_some() && !self.cover_opaque) {
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };

        if let Some(old) = self.current.take() {
            self.teardown(old);
        }

        if let Err(e) = self.backend.play(&pending.handle) {
            log::warn!("Failed to start {}: {}", pending.id, e);
        }
        let eos = match self.backend.subscribe_end_of_stream(&pending.handle) {
            Ok(token) => Some(token),
            Err(e) => {
                log::warn!("Looping unavailable for {}: {}", pending.id, e);
                None
            }
        };

        log::info!("Now playing {}", pending.id);
        self.session.active_id = Some(pending.id.clone());
        self.events
            .push(PlaybackEvent::StreamChanged(Some(pending.handle.clone())));
        self.events.push(PlaybackEvent::Started {
            generation: pending.generation,
            id: pending.id.clone(),
            readiness_timed_out: pending.readiness.unwrap_or(false),
        });

        self.current = Some(ActiveStream {
            handle: pending.handle,
            id: pending.id,
            path: pending.path,
            eos,
            loops: 0,
        });

        let half = self.timings.crossfade / 2;
        self.fader
            .start(FadeTarget::Cover, pending.generation, self.cover, 0.0, half);
        self.volume_level = 0.0;
        if self.session.audio_enabled {
            self.fader.start(
                FadeTarget::Volume,
                pending.generation,
                0.0,
                self.session.audio_volume,
                self.timings.audio_fade,
            );
        } else {
            self.fader.cancel(FadeTarget::Volume);
        }

        if self.session.state == PlaybackState::Loading {
            self.set_state(PlaybackState::Playing);
        }
    }

    fn handle_fade(&mut self, event: FadeEvent) {
        if event.generation != self.generation {
            log::trace!(
                "Ignoring fade from generation {} (now {})",
                event.generation,
                self.generation
            );
            return;
        }
        if !self.fader.is_current(event.target, event.fade_id) {
            return;
        }

        match event.kind {
            FadeKind::Tick(value) => self.apply_fade_value(event.target, value),
            FadeKind::Done(value) => {
                self.fader.finish(event.target);
                self.apply_fade_value(event.target, value);
                self.fade_finished(event.target, value);
            }
        }
    }

    fn apply_fade_value(&mut self, target: FadeTarget, value: f32) {
        match target {
            FadeTarget::Cover => {
                self.cover = value;
                self.events.push(PlaybackEvent::CoverOpacity(value));
            }
            FadeTarget::Volume => {
                self.volume_level = value;
                if let Some(current) = &self.current {
                    self.backend.set_volume(&current.handle, value);
                }
            }
        }
    }

    fn fade_finished(&mut self, target: FadeTarget, value: f32) {
        match target {
            FadeTarget::Cover => match self.session.state {
                PlaybackState::Stopping => self.finish_stop(),
                PlaybackState::Switching if self.pending.is_some() => {
                    self.cover_opaque = true;
                    self.try_promote();
                }
                PlaybackState::Switching => self.set_state(PlaybackState::Playing),
                _ => {}
            },
            FadeTarget::Volume => {
                if value <= 0.0
                    && !self.session.audio_enabled
                    && let Some(current) = &self.current
                {
                    self.backend.set_muted(&current.handle, true);
                }
            }
        }
    }

    fn finish_stop(&mut self) {
        self.fader.cancel_all();
        if let Some(current) = self.current.take() {
            self.teardown(current);
        }
        self.session.active_id = None;
        self.volume_level = 0.0;
        self.events.push(PlaybackEvent::StreamChanged(None));
        self.set_state(PlaybackState::Idle);
    }

    fn teardown(&mut self, stream: ActiveStream) {
        log::debug!(
            "Closing {} ({}) after {} loops",
            stream.id,
            stream.handle.id,
            stream.loops
        );
        if let Some(token) = stream.eos {
            self.backend.unsubscribe(token);
        }
        if let Err(e) = self.backend.pause(&stream.handle) {
            log::debug!("Failed to pause {} before closing: {}", stream.id, e);
        }
        self.backend.close(&stream.handle);
    }

    fn handle_media(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::EndOfStream { token } => {
                let Some(current) = self.current.as_mut() else {
                    return;
                };
                if current.eos != Some(token) {
                    log::trace!("Ignoring end-of-stream for stale subscription {:?}", token);
                    return;
                }

                self.backend.unsubscribe(token);
                if let Err(e) = self.backend.seek(&current.handle, Duration::ZERO) {
                    log::warn!("Failed to rewind {}: {}", current.id, e);
                }
                if let Err(e) = self.backend.play(&current.handle) {
                    log::warn!("Failed to resume {}: {}", current.id, e);
                }
                current.eos = match self.backend.subscribe_end_of_stream(&current.handle) {
                    Ok(token) => Some(token),
                    Err(e) => {
                        log::warn!("Failed to re-arm loop for {}: {}", current.id, e);
                        None
                    }
                };
                current.loops += 1;
                log::debug!("Looped {} ({} times)", current.id, current.loops);
            }
            MediaEvent::Error { stream, message } => {
                log::warn!("Media error on {}: {}", stream, message);
                if self.pending.as_ref().is_some_and(|p| p.handle.id == stream) {
                    self.fail_pending(message);
                } else if self.current.as_ref().is_some_and(|c| c.handle.id == stream) {
                    self.fail_current();
                }
            }
        }
    }

    /// The source being prepared cannot play: drop it and fall back to
    /// whatever was there before
    fn fail_pending(&mut self, message: String) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        self.backend.close(&pending.handle);
        self.events.push(PlaybackEvent::Failed {
            generation: pending.generation,
            message: format!("{} failed to play: {}", pending.id, message),
        });
        self.cover_opaque = false;

        if self.current.is_none() {
            self.fader.cancel_all();
            self.session.active_id = None;
            self.set_state(PlaybackState::Idle);
            return;
        }

        // Uncover the stream that kept playing underneath
        let half = self.timings.crossfade / 2;
        self.fader
            .start(FadeTarget::Cover, self.generation, self.cover, 0.0, half);
        if self.session.audio_enabled {
            self.fader.start(
                FadeTarget::Volume,
                self.generation,
                self.volume_level,
                self.session.audio_volume,
                self.timings.audio_fade,
            );
        }
    }

    /// The stream on screen died; hide it and hand over to a pending source
    /// if there is one
    fn fail_current(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };
        self.teardown(current);
        self.fader.cancel_all();
        self.session.active_id = None;
        self.volume_level = 0.0;
        self.cover = 1.0;
        self.events.push(PlaybackEvent::CoverOpacity(1.0));
        self.events.push(PlaybackEvent::StreamChanged(None));

        if self.pending.is_some() {
            self.cover_opaque = true;
            self.set_state(PlaybackState::Loading);
            self.try_promote();
        } else {
            self.set_state(PlaybackState::Idle);
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.backend.close(&pending.handle);
        }
        if let Some(current) = self.current.take() {
            self.teardown(current);
        }
    }
}
