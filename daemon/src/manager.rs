//! The coordinator behind every public entry point.
//!
//! [`WallpaperManager`] owns the catalog, the playback engine and the
//! display controller, and is only ever touched from the scheduler task.
//! Slow work (probing, downloading) runs on spawned tasks that report back
//! through [`ManagerEvent`]s; replies to clients travel in oneshot channels
//! and are sent once the outcome is known.

use common::{DaemonStatus, DownloadStatus, LibraryEntry, PlayReport, Response, WallpaperError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

use crate::catalog::{CacheStore, EntryUpdate, VideoId};
use crate::display::{ConnectedDisplay, DisplayController, DisplayError, DisplayEvent};
use crate::download::{CancelHandle, DownloadError, DownloadOrchestrator, ProbeResult};
use crate::playback::{EngineEvent, PlayOutcome, PlaybackEngine, PlaybackError, PlaybackEvent};
use crate::state::{Preferences, PreferencesFile};
use crate::{log_and_continue, remove_file_quietly};

pub type Reply = oneshot::Sender<Response>;

/// Results of background work, delivered back to the scheduler
#[derive(Debug)]
pub enum ManagerEvent {
    Probed {
        reference: String,
        result: Result<ProbeResult, DownloadError>,
        reply: Reply,
    },
    Progress {
        id: VideoId,
        progress: f32,
    },
    Downloaded {
        id: VideoId,
        result: Result<PathBuf, DownloadError>,
    },
}

struct ActiveDownload {
    reference: String,
    progress: f32,
    cancel: CancelHandle,
    /// The catalog row was created for this attempt and goes away if it fails
    created_row: bool,
    /// The entry was deleted while downloading
    deleted: bool,
    reply: Reply,
}

fn send_reply(reply: Reply, response: Response) {
    if reply.send(response).is_err() {
        log::debug!("Client went away before its reply");
    }
}

fn error_response(e: impl Into<WallpaperError>) -> Response {
    Response::Error(e.into())
}

fn parse_id(raw: &str) -> Result<VideoId, WallpaperError> {
    VideoId::new(raw.trim()).ok_or_else(|| WallpaperError::NotFound(raw.to_string()))
}

pub struct WallpaperManager {
    store: CacheStore,
    orchestrator: DownloadOrchestrator,
    engine: PlaybackEngine,
    displays: DisplayController,
    prefs_file: PreferencesFile,
    prefs: Preferences,
    downloads: BTreeMap<VideoId, ActiveDownload>,
    /// Play requests waiting for their generation to start
    pending_plays: Vec<(u64, Reply)>,
    events: mpsc::UnboundedSender<ManagerEvent>,
    started_at: Instant,
}

impl WallpaperManager {
    pub fn new(
        store: CacheStore,
        orchestrator: DownloadOrchestrator,
        engine: PlaybackEngine,
        displays: DisplayController,
        prefs_file: PreferencesFile,
        prefs: Preferences,
        events: mpsc::UnboundedSender<ManagerEvent>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            engine,
            displays,
            prefs_file,
            prefs,
            downloads: BTreeMap::new(),
            pending_plays: Vec::new(),
            events,
            started_at: Instant::now(),
        }
    }

    /// Download `reference` into the library.
    ///
    /// Replies `Added` once the file is cached, immediately if it already
    /// was. A second request for an id that is still downloading is
    /// rejected as busy.
    pub fn add_to_library(&mut self, reference: String, reply: Reply) {
        let reference = reference.trim().to_string();
        if reference.is_empty() {
            send_reply(
                reply,
                error_response(WallpaperError::Download("empty reference".to_string())),
            );
            return;
        }

        if let Some(id) = VideoId::from_reference(&reference) {
            if self.downloads.contains_key(&id) {
                send_reply(reply, busy_response(&id));
                return;
            }
            match self.store.refresh(&id) {
                Ok(Some(entry)) if entry.is_cached => {
                    log::info!("{} is already cached", id);
                    send_reply(reply, Response::Added((&entry).into()));
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    send_reply(reply, error_response(e));
                    return;
                }
            }
        }

        log::info!("Probing {}", reference);
        let orchestrator = self.orchestrator.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = orchestrator.probe(&reference).await;
            let _ = events.send(ManagerEvent::Probed {
                reference,
                result,
                reply,
            });
        });
    }

    pub fn set_wallpaper(&mut self, id: &str, reply: Reply) {
        match self.start_playback(id) {
            Ok(Some(generation)) => self.pending_plays.push((generation, reply)),
            Ok(None) => send_reply(
                reply,
                Response::Playing(PlayReport {
                    id: id.trim().to_string(),
                    readiness_timed_out: false,
                }),
            ),
            Err(e) => {
                log::error!("Failed to set wallpaper {}: {}", id, e);
                send_reply(reply, Response::Error(e));
            }
        }
        self.drain_playback();
    }

    pub fn stop_wallpaper(&mut self) -> Response {
        if !self.engine.stop() {
            log::debug!("Stop requested while already idle");
        }
        self.remember_wallpaper(None);
        self.drain_playback();
        Response::Ok
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) -> Response {
        self.engine.set_audio_enabled(enabled);
        self.prefs.audio_enabled = enabled;
        self.save_preferences();
        self.drain_playback();
        Response::Ok
    }

    pub fn set_volume(&mut self, volume: f32) -> Response {
        if !volume.is_finite() {
            return error_response(WallpaperError::Ipc(format!("invalid volume {}", volume)));
        }
        let volume = volume.clamp(0.0, 1.0);
        self.engine.set_volume(volume);
        self.prefs.audio_volume = volume;
        self.save_preferences();
        self.drain_playback();
        Response::Ok
    }

    /// Remove an entry, stopping it first if it is on screen and aborting
    /// its download if one is running
    pub fn delete_from_library(&mut self, raw: &str) -> Response {
        let id = match parse_id(raw) {
            Ok(id) => id,
            Err(e) => return Response::Error(e),
        };

        if let Some(job) = self.downloads.get_mut(&id) {
            log::info!("Cancelling download of {} before deleting it", id);
            job.deleted = true;
            job.cancel.cancel();
        }

        if self.store.lookup(&id).is_none() {
            return error_response(WallpaperError::NotFound(id.to_string()));
        }

        let session = self.engine.session();
        if session.active_id.as_ref() == Some(&id) || self.engine.pending_id() == Some(&id) {
            log::info!("Stopping {} before deleting it", id);
            self.engine.stop();
            self.drain_playback();
        }
        if self.prefs.last_wallpaper.as_ref() == Some(&id) {
            self.remember_wallpaper(None);
        }

        match self.store.remove(&id) {
            Ok(_) => Response::Ok,
            Err(e) => error_response(e),
        }
    }

    pub fn reorder_library(&mut self, order: &[String]) -> Response {
        let ids: Vec<VideoId> = order
            .iter()
            .filter_map(|raw| VideoId::new(raw.trim()))
            .collect();
        match self.store.reorder(&ids) {
            Ok(()) => Response::Ok,
            Err(e) => error_response(e),
        }
    }

    /// Play whatever was last set as the wallpaper, if it is still around
    pub fn restore_last_on_launch(&mut self, reply: Reply) {
        let Some(id) = self.prefs.last_wallpaper.clone() else {
            send_reply(reply, Response::NothingToRestore);
            return;
        };

        if self.store.lookup(&id).is_none() {
            log::warn!("Last wallpaper {} is no longer in the library", id);
            self.remember_wallpaper(None);
            send_reply(reply, Response::NothingToRestore);
            return;
        }

        log::info!("Restoring last wallpaper {}", id);
        self.set_wallpaper(id.as_str(), reply);
    }

    pub fn cancel_download(&mut self, raw: &str) -> Response {
        let job = parse_id(raw)
            .ok()
            .and_then(|id| self.downloads.get(&id).map(|job| (id, job)));
        match job {
            Some((id, job)) => {
                log::info!("Cancelling download of {}", id);
                job.cancel.cancel();
                Response::Ok
            }
            None => error_response(WallpaperError::NotFound(format!(
                "no download in progress for {}",
                raw
            ))),
        }
    }

    pub fn list_library(&self) -> Vec<LibraryEntry> {
        self.store.all().iter().map(LibraryEntry::from).collect()
    }

    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            playback: self.engine.session().into(),
            downloads: self
                .downloads
                .iter()
                .map(|(id, job)| DownloadStatus {
                    id: id.to_string(),
                    reference: job.reference.clone(),
                    progress: job.progress,
                })
                .collect(),
            surfaces: self.displays.len(),
        }
    }

    pub fn list_displays(&self) -> Vec<common::DisplayInfo> {
        self.displays.displays()
    }

    pub fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Probed {
                reference,
                result,
                reply,
            } => self.on_probed(reference, result, reply),
            ManagerEvent::Progress { id, progress } => {
                if let Some(job) = self.downloads.get_mut(&id) {
                    log::debug!("Download {} at {:.0}%", id, progress * 100.0);
                    job.progress = progress;
                }
            }
            ManagerEvent::Downloaded { id, result } => self.on_downloaded(id, result),
        }
    }

    pub fn handle_engine_event(&mut self, event: EngineEvent) {
        self.engine.handle(event);
        self.drain_playback();
    }

    pub fn handle_display_event(&mut self, event: DisplayEvent) {
        match event {
            DisplayEvent::Topology(displays) => {
                log::debug!("Display topology changed: {} display(s)", displays.len());
                self.update_topology(&displays);
            }
            DisplayEvent::AttachFailed(DisplayError::DisplayAttachFailed { display, reason }) => {
                log::warn!("Display {} has no surface: {}", display, reason);
                self.displays.surface_failed(&display);
            }
        }
    }

    /// React to a new display topology
    pub fn update_topology(&mut self, displays: &[ConnectedDisplay]) {
        let failures = self.displays.reconcile(displays);
        if self.displays.is_empty() {
            log::warn!("No displays connected; the wallpaper is not visible anywhere");
        }
        if !failures.is_empty() {
            log::warn!("{} display(s) left without a surface", failures.len());
        }
    }

    /// Abort downloads, tear playback down without fades and drop surfaces
    pub fn shutdown(&mut self) {
        for (id, job) in &self.downloads {
            log::info!("Cancelling download of {} for shutdown", id);
            job.cancel.cancel();
        }
        self.engine.shutdown();
        self.drain_playback();
        self.displays.shutdown();
        for (_, reply) in self.pending_plays.drain(..) {
            send_reply(
                reply,
                error_response(WallpaperError::Playback("daemon shutting down".to_string())),
            );
        }
    }

    fn on_probed(
        &mut self,
        reference: String,
        result: Result<ProbeResult, DownloadError>,
        reply: Reply,
    ) {
        let probe = match result {
            Ok(probe) => probe,
            Err(e) => {
                log::warn!("Probe of {} failed: {}", reference, e);
                send_reply(reply, error_response(e));
                return;
            }
        };

        let id = VideoId::from_reference(&reference)
            .or_else(|| probe.video_id.clone().and_then(VideoId::new));
        let Some(id) = id else {
            send_reply(
                reply,
                error_response(DownloadError::FormatResolutionFailed(format!(
                    "no usable video id for {}",
                    reference
                ))),
            );
            return;
        };

        if self.downloads.contains_key(&id) {
            send_reply(reply, busy_response(&id));
            return;
        }

        let existing = match self.store.refresh(&id) {
            Ok(existing) => existing,
            Err(e) => {
                send_reply(reply, error_response(e));
                return;
            }
        };
        if let Some(entry) = existing.as_ref().filter(|e| e.is_cached) {
            send_reply(reply, Response::Added(entry.into()));
            return;
        }

        let update = EntryUpdate {
            title: probe.title.clone(),
            remote_reference: Some(reference.clone()),
            ..Default::default()
        };
        if let Err(e) = self.store.upsert(&id, update) {
            send_reply(reply, error_response(e));
            return;
        }

        log::info!(
            "Downloading {} as {} ({}x{}, format {})",
            reference,
            id,
            probe.best.width,
            probe.best.height,
            probe.best.format_id
        );

        let (cancel, token) = CancelHandle::new();
        let target = self.orchestrator.target_path(&id);
        let orchestrator = self.orchestrator.clone();
        let events = self.events.clone();
        let task_id = id.clone();
        let task_reference = reference.clone();
        let format_id = probe.best.format_id;
        tokio::spawn(async move {
            let progress_events = events.clone();
            let progress_id = task_id.clone();
            let result = orchestrator
                .download(
                    &task_id,
                    &task_reference,
                    &format_id,
                    &target,
                    move |progress| {
                        let _ = progress_events.send(ManagerEvent::Progress {
                            id: progress_id.clone(),
                            progress,
                        });
                    },
                    token,
                )
                .await;
            let _ = events.send(ManagerEvent::Downloaded {
                id: task_id,
                result,
            });
        });

        self.downloads.insert(
            id,
            ActiveDownload {
                reference,
                progress: 0.0,
                cancel,
                created_row: existing.is_none(),
                deleted: false,
                reply,
            },
        );
    }

    fn on_downloaded(&mut self, id: VideoId, result: Result<PathBuf, DownloadError>) {
        let Some(job) = self.downloads.remove(&id) else {
            log::warn!("Download result for unknown job {}", id);
            return;
        };

        let outcome = if job.deleted {
            if let Ok(path) = &result {
                remove_file_quietly!(path, "download of a deleted entry");
            }
            Err(WallpaperError::NotFound(format!(
                "{} was deleted while downloading",
                id
            )))
        } else {
            self.finish_download(&id, result)
        };

        match outcome {
            Ok(entry) => send_reply(job.reply, Response::Added(entry)),
            Err(e) => {
                if job.created_row && !job.deleted {
                    log_and_continue!(self.store.remove(&id), "drop catalog row of failed download");
                }
                send_reply(job.reply, Response::Error(e));
            }
        }
    }

    fn finish_download(
        &mut self,
        id: &VideoId,
        result: Result<PathBuf, DownloadError>,
    ) -> Result<LibraryEntry, WallpaperError> {
        let path = result?;
        let size = std::fs::metadata(&path)?.len();
        if size == 0 {
            remove_file_quietly!(&path, "empty download");
            return Err(DownloadError::OutputMissing(path).into());
        }

        match self.store.set_cached(id, &path, size) {
            Ok(entry) => Ok((&entry).into()),
            Err(e) => {
                remove_file_quietly!(&path, "uncatalogued download");
                Err(e.into())
            }
        }
    }

    /// Returns the generation to wait for, or `None` when the source is
    /// already on screen
    fn start_playback(&mut self, raw: &str) -> Result<Option<u64>, WallpaperError> {
        let id = parse_id(raw)?;
        let previous_path = self
            .store
            .lookup(&id)
            .and_then(|e| e.cached_file_path.clone());
        let entry = self
            .store
            .refresh(&id)?
            .ok_or_else(|| WallpaperError::NotFound(id.to_string()))?;

        let Some(path) = entry.playable_path() else {
            return Err(match previous_path {
                Some(path) => PlaybackError::SourceFileMissing(path).into(),
                None => WallpaperError::NotFound(format!("{} is not downloaded", id)),
            });
        };

        let outcome = match self.engine.play(&id, path) {
            Ok(outcome) => outcome,
            Err(e @ PlaybackError::SourceFileMissing(_)) => {
                log_and_continue!(self.store.mark_evicted(&id), "evict vanished file");
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        match outcome {
            PlayOutcome::Pending { generation } => Ok(Some(generation)),
            PlayOutcome::AlreadyActive => {
                let generation = self.engine.generation();
                let still_starting = self.pending_plays.iter().any(|(g, _)| *g == generation);
                Ok(still_starting.then_some(generation))
            }
        }
    }

    /// Forward queued playback events to the surfaces and settle replies
    fn drain_playback(&mut self) {
        for event in self.engine.take_events() {
            self.displays.apply(&event);
            match event {
                PlaybackEvent::Started {
                    generation,
                    id,
                    readiness_timed_out,
                } => {
                    self.remember_wallpaper(Some(id.clone()));
                    self.resolve_plays(
                        generation,
                        Response::Playing(PlayReport {
                            id: id.to_string(),
                            readiness_timed_out,
                        }),
                    );
                }
                PlaybackEvent::Superseded { generation } => self.resolve_plays(
                    generation,
                    error_response(WallpaperError::Playback(
                        "superseded by a newer request".to_string(),
                    )),
                ),
                PlaybackEvent::Failed {
                    generation,
                    message,
                } => self.resolve_plays(
                    generation,
                    error_response(WallpaperError::Playback(message)),
                ),
                PlaybackEvent::StateChanged(_)
                | PlaybackEvent::StreamChanged(_)
                | PlaybackEvent::CoverOpacity(_) => {}
            }
        }
    }

    fn resolve_plays(&mut self, generation: u64, response: Response) {
        let (done, waiting) = std::mem::take(&mut self.pending_plays)
            .into_iter()
            .partition(|(g, _)| *g == generation);
        self.pending_plays = waiting;
        for (_, reply) in done {
            send_reply(reply, response.clone());
        }
    }

    fn remember_wallpaper(&mut self, id: Option<VideoId>) {
        if self.prefs.last_wallpaper != id {
            self.prefs.last_wallpaper = id;
            self.save_preferences();
        }
    }

    fn save_preferences(&self) {
        log_and_continue!(self.prefs_file.save(&self.prefs), "save preferences");
    }
}

fn busy_response(id: &VideoId) -> Response {
    error_response(WallpaperError::Busy(format!(
        "{} is already downloading",
        id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogEntry, MemoryCatalog};
    use crate::config::{FetchSettings, PlaybackSettings};
    use crate::display::{DisplayId, Frame};
    use crate::display::fake::FakeSurfaces;
    use crate::playback::{FadeCurve, MediaEvent, PlaybackTimings, StreamId};
    use crate::playback::fake::FakeMedia;
    use common::PlaybackState;
    use std::time::Duration;

    struct Harness {
        manager: WallpaperManager,
        events: mpsc::UnboundedReceiver<ManagerEvent>,
        engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        media: FakeMedia,
        surfaces: FakeSurfaces,
        catalog: MemoryCatalog,
        dir: tempfile::TempDir,
    }

    fn timings() -> PlaybackTimings {
        PlaybackTimings {
            crossfade: Duration::ZERO,
            audio_fade: Duration::ZERO,
            stop_fade: Duration::ZERO,
            readiness_interval: Duration::from_millis(1),
            readiness_max_attempts: 3,
            fade_curve: FadeCurve::Linear,
        }
    }

    fn harness_with(catalog: MemoryCatalog, fetch: FetchSettings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("videos");
        std::fs::create_dir_all(&cache_dir).unwrap();

        let media = FakeMedia::default();
        let surfaces = FakeSurfaces::default();
        let (engine_tx, engine_events) = mpsc::unbounded_channel();
        let (tx, events) = mpsc::unbounded_channel();

        let prefs = Preferences::from_settings(&PlaybackSettings::default());
        let engine = PlaybackEngine::new(
            Box::new(media.clone()),
            timings(),
            engine_tx,
            prefs.audio_enabled,
            prefs.audio_volume,
        );
        let manager = WallpaperManager::new(
            CacheStore::open(Box::new(catalog.clone())).unwrap(),
            DownloadOrchestrator::new(fetch, cache_dir),
            engine,
            DisplayController::new(Box::new(surfaces.clone())),
            PreferencesFile::new(dir.path().join("state.json")),
            prefs,
            tx,
        );

        Harness {
            manager,
            events,
            engine_events,
            media,
            surfaces,
            catalog,
            dir,
        }
    }

    /// Catalog with one cached clip per id
    fn harness(cached: &[&str]) -> Harness {
        let catalog = MemoryCatalog::default();
        let videos = tempfile::tempdir().unwrap().keep();
        let entries: Vec<CatalogEntry> = cached
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let path = videos.join(format!("{}.mp4", id));
                std::fs::write(&path, b"video").unwrap();
                let mut entry = CatalogEntry::new(VideoId::new(*id).unwrap(), *id, i as u32);
                entry.cached_file_path = Some(path);
                entry.is_cached = true;
                entry.size_bytes = Some(5);
                entry
            })
            .collect();
        *catalog.saved.lock().unwrap() = entries;
        harness_with(catalog, FetchSettings::default())
    }

    impl Harness {
        /// Drive background work until `rx` resolves
        async fn settle(&mut self, mut rx: oneshot::Receiver<Response>) -> Response {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            loop {
                if let Ok(response) = rx.try_recv() {
                    return response;
                }
                assert!(tokio::time::Instant::now() < deadline, "reply never came");
                tokio::select! {
                    Some(event) = self.events.recv() => self.manager.handle_event(event),
                    Some(event) = self.engine_events.recv() => self.manager.handle_engine_event(event),
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                }
            }
        }

        /// Drain whatever is already queued
        async fn pump(&mut self) {
            for _ in 0..50 {
                tokio::select! {
                    Some(event) = self.events.recv() => self.manager.handle_event(event),
                    Some(event) = self.engine_events.recv() => self.manager.handle_engine_event(event),
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                }
            }
        }

        async fn set(&mut self, id: &str) -> Response {
            let (tx, rx) = oneshot::channel();
            self.manager.set_wallpaper(id, tx);
            self.settle(rx).await
        }

        async fn add(&mut self, reference: &str) -> Response {
            let (tx, rx) = oneshot::channel();
            self.manager.add_to_library(reference.to_string(), tx);
            self.settle(rx).await
        }

        fn connect_displays(&mut self) {
            let frame = Frame {
                x: 0,
                y: 0,
                width: 1920,
                height: 1080,
            };
            self.manager.update_topology(&[
                ConnectedDisplay::new("DP-1", frame),
                ConnectedDisplay::new("DP-2", Frame { x: 1920, ..frame }),
            ]);
        }
    }

    #[tokio::test]
    async fn test_set_wallpaper_reaches_every_surface() {
        let mut h = harness(&["alpha"]);
        h.connect_displays();

        let response = h.set("alpha").await;
        assert!(matches!(
            response,
            Response::Playing(PlayReport { ref id, readiness_timed_out: false }) if id == "alpha"
        ));
        h.pump().await;

        assert_eq!(h.manager.engine.session().state, PlaybackState::Playing);
        let stream = h.manager.engine.current_stream().unwrap().id;
        h.surfaces.with(|log| {
            assert_eq!(log.live.len(), 2);
            assert!(log.live.values().all(|s| *s == Some(stream)));
        });
        assert_eq!(
            h.manager.prefs.last_wallpaper,
            VideoId::new("alpha")
        );
    }

    #[tokio::test]
    async fn test_set_wallpaper_twice_opens_one_stream() {
        let mut h = harness(&["alpha"]);
        h.connect_displays();

        h.set("alpha").await;
        h.pump().await;
        let second = h.set("alpha").await;

        assert!(matches!(second, Response::Playing(_)));
        assert_eq!(h.media.with(|log| log.opened.len()), 1);
        assert_eq!(h.manager.engine.session().state, PlaybackState::Playing);
        assert_eq!(h.manager.displays.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_and_missing_sources() {
        let mut h = harness(&["alpha"]);

        let response = h.set("nope").await;
        assert!(matches!(response, Response::Error(WallpaperError::NotFound(_))));

        let path = h.manager.store.lookup(&VideoId::new("alpha").unwrap()).unwrap()
            .cached_file_path
            .clone()
            .unwrap();
        std::fs::remove_file(&path).unwrap();

        let response = h.set("alpha").await;
        assert!(matches!(response, Response::Error(WallpaperError::Playback(_))));
        assert_eq!(h.manager.engine.session().state, PlaybackState::Idle);

        // The vanished file is reflected in the catalog
        let entry = h.manager.store.lookup(&VideoId::new("alpha").unwrap()).unwrap();
        assert!(!entry.is_cached);
    }

    #[tokio::test]
    async fn test_rapid_switch_supersedes_first_request() {
        let mut h = harness(&["alpha", "beta"]);
        h.media.never_ready();

        let (first_tx, first_rx) = oneshot::channel();
        h.manager.set_wallpaper("alpha", first_tx);
        let (second_tx, second_rx) = oneshot::channel();
        h.manager.set_wallpaper("beta", second_tx);

        let first = h.settle(first_rx).await;
        assert!(matches!(first, Response::Error(WallpaperError::Playback(_))));

        let second = h.settle(second_rx).await;
        assert!(matches!(
            second,
            Response::Playing(PlayReport { ref id, readiness_timed_out: true }) if id == "beta"
        ));
    }

    #[tokio::test]
    async fn test_undecodable_source_replies_error() {
        let mut h = harness(&["alpha"]);
        h.connect_displays();
        h.media.never_ready();

        let (tx, rx) = oneshot::channel();
        h.manager.set_wallpaper("alpha", tx);
        h.manager
            .handle_engine_event(EngineEvent::Media(MediaEvent::Error {
                stream: StreamId(1),
                message: "missing plugin".to_string(),
            }));

        let response = h.settle(rx).await;
        assert!(matches!(
            response,
            Response::Error(WallpaperError::Playback(ref message)) if message.contains("missing plugin")
        ));
        h.pump().await;

        assert_eq!(h.manager.engine.session().state, PlaybackState::Idle);
        assert_eq!(h.manager.prefs.last_wallpaper, None);
        h.surfaces.with(|log| assert!(log.live.values().all(Option::is_none)));
    }

    #[tokio::test]
    async fn test_surface_creation_failure_is_retried_on_next_snapshot() {
        let mut h = harness(&["alpha"]);
        h.connect_displays();
        h.set("alpha").await;
        h.pump().await;

        h.manager
            .handle_display_event(DisplayEvent::AttachFailed(DisplayError::DisplayAttachFailed {
                display: DisplayId::new("DP-2"),
                reason: "No wl_output named DP-2".to_string(),
            }));
        assert_eq!(h.manager.displays.len(), 1);
        assert_eq!(h.manager.list_displays().len(), 1);

        let frame = Frame {
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
        };
        h.manager.handle_display_event(DisplayEvent::Topology(vec![
            ConnectedDisplay::new("DP-1", frame),
            ConnectedDisplay::new("DP-2", Frame { x: 1920, ..frame }),
        ]));

        assert_eq!(h.manager.displays.len(), 2);
        let stream = h.manager.engine.current_stream().unwrap().id;
        h.surfaces.with(|log| {
            assert_eq!(log.live[&DisplayId::new("DP-2")], Some(stream));
        });
    }

    #[tokio::test]
    async fn test_stop_clears_surfaces_and_restore_target() {
        let mut h = harness(&["alpha"]);
        h.connect_displays();
        h.set("alpha").await;

        assert!(matches!(h.manager.stop_wallpaper(), Response::Ok));
        h.pump().await;

        assert_eq!(h.manager.engine.session().state, PlaybackState::Idle);
        h.surfaces.with(|log| assert!(log.live.values().all(Option::is_none)));

        let (tx, rx) = oneshot::channel();
        h.manager.restore_last_on_launch(tx);
        assert!(matches!(h.settle(rx).await, Response::NothingToRestore));
    }

    #[tokio::test]
    async fn test_restore_plays_last_wallpaper() {
        let mut h = harness(&["alpha", "beta"]);
        h.set("beta").await;

        // Preferences survive on disk
        let saved = PreferencesFile::new(h.dir.path().join("state.json"))
            .load_or(Preferences::from_settings(&PlaybackSettings::default()));
        assert_eq!(saved.last_wallpaper, VideoId::new("beta"));

        h.manager.engine.shutdown();
        h.manager.drain_playback();

        let (tx, rx) = oneshot::channel();
        h.manager.restore_last_on_launch(tx);
        let response = h.settle(rx).await;
        assert!(matches!(response, Response::Playing(PlayReport { ref id, .. }) if id == "beta"));
    }

    #[tokio::test]
    async fn test_delete_active_entry_stops_playback() {
        let mut h = harness(&["alpha", "beta"]);
        h.set("alpha").await;
        let path = h.manager.store.lookup(&VideoId::new("alpha").unwrap()).unwrap()
            .cached_file_path
            .clone()
            .unwrap();

        assert!(matches!(h.manager.delete_from_library("alpha"), Response::Ok));
        h.pump().await;

        assert_eq!(h.manager.engine.session().state, PlaybackState::Idle);
        assert!(!path.exists());
        assert_eq!(h.manager.list_library().len(), 1);
        assert!(h.manager.prefs.last_wallpaper.is_none());
        assert!(matches!(
            h.manager.delete_from_library("alpha"),
            Response::Error(WallpaperError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reorder_and_list() {
        let mut h = harness(&["a", "b", "c"]);
        let order = vec!["c".to_string(), "bad id!".to_string(), "a".to_string()];
        assert!(matches!(h.manager.reorder_library(&order), Response::Ok));

        let ids: Vec<String> = h.manager.list_library().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        let saved = h.catalog.saved.lock().unwrap();
        assert_eq!(saved[0].id.as_str(), "c");
    }

    #[tokio::test]
    async fn test_audio_preferences_persist() {
        let mut h = harness(&["alpha"]);
        h.manager.set_audio_enabled(true);
        h.manager.set_volume(0.3);
        assert!(matches!(
            h.manager.set_volume(f32::NAN),
            Response::Error(WallpaperError::Ipc(_))
        ));

        let status = h.manager.status();
        assert!(status.playback.audio_enabled);
        assert_eq!(status.playback.audio_volume, 0.3);

        h.set("alpha").await;
        let stream = h.manager.engine.current_stream().unwrap().id;
        assert!(!h.media.with(|log| log.muted[&stream]));

        let saved = PreferencesFile::new(h.dir.path().join("state.json"))
            .load_or(Preferences::from_settings(&PlaybackSettings::default()));
        assert!(saved.audio_enabled);
        assert_eq!(saved.audio_volume, 0.3);
    }

    #[tokio::test]
    async fn test_add_for_cached_entry_replies_immediately() {
        let mut h = harness(&["dQw4w9WgXcQ"]);
        let response = h
            .add("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
            .await;
        assert!(matches!(response, Response::Added(ref entry) if entry.is_cached));
    }

    #[tokio::test]
    async fn test_cancel_unknown_download() {
        let mut h = harness(&[]);
        assert!(matches!(
            h.manager.cancel_download("abc"),
            Response::Error(WallpaperError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    mod downloads {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        const PROBE: &str = r#"#!/bin/sh
for arg in "$@"; do
  if [ "$arg" = "-J" ]; then
    echo '{"id":"clip_001","title":"A clip","formats":[{"format_id":"22","vcodec":"avc1","width":1280,"height":720}]}'
    exit 0
  fi
done
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; shift; fi
  shift
done
base=$(printf '%s' "$out" | sed 's/\.%(ext)s$//')
"#;

        fn fetch_tool(dir: &std::path::Path, body: &str) -> FetchSettings {
            let script = dir.join("fake-fetch");
            std::fs::write(&script, format!("{}{}", PROBE, body)).unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            FetchSettings {
                tool: Some(script.display().to_string()),
                ..Default::default()
            }
        }

        fn harness_with_tool(body: &str) -> (Harness, tempfile::TempDir) {
            let tools = tempfile::tempdir().unwrap();
            let settings = fetch_tool(tools.path(), body);
            (harness_with(MemoryCatalog::default(), settings), tools)
        }

        fn cache_files(h: &Harness) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(h.dir.path().join("videos"))
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }

        #[tokio::test]
        async fn test_successful_download_is_cached() {
            let (mut h, _tools) = harness_with_tool(
                r#"
echo "[download]  50.0% of 1.00MiB"
printf 'video bytes' > "$base.mp4"
echo "[download] 100% of 1.00MiB"
"#,
            );

            let response = h.add("https://example.com/videos/1").await;
            let Response::Added(entry) = response else {
                panic!("unexpected response {:?}", response);
            };
            assert_eq!(entry.id, "clip_001");
            assert_eq!(entry.title, "A clip");
            assert!(entry.is_cached);

            let path = PathBuf::from(entry.cached_file_path.unwrap());
            assert!(path.exists());
            assert!(std::fs::metadata(&path).unwrap().len() > 0);
            assert_eq!(cache_files(&h), vec!["clip_001.mp4"]);
            assert!(h.manager.status().downloads.is_empty());
        }

        #[tokio::test]
        async fn test_failed_download_leaves_no_trace() {
            let (mut h, _tools) = harness_with_tool(
                r#"
printf 'partial' > "$base.f22.mp4.part"
echo "[download]  12.0% of 1.00MiB"
exit 1
"#,
            );

            let response = h.add("https://example.com/videos/1").await;
            assert!(matches!(response, Response::Error(WallpaperError::Download(_))));
            assert!(h.manager.list_library().is_empty());
            assert!(cache_files(&h).is_empty());
        }

        #[tokio::test]
        async fn test_failed_redownload_keeps_existing_row() {
            let (mut h, _tools) = harness_with_tool("\nexit 1\n");
            let id = VideoId::new("clip_001").unwrap();
            h.manager
                .store
                .upsert(&id, EntryUpdate::default())
                .unwrap();

            let response = h.add("https://example.com/videos/1").await;
            assert!(matches!(response, Response::Error(_)));

            let entry = h.manager.store.lookup(&id).unwrap();
            assert!(!entry.is_cached);
        }

        #[tokio::test]
        async fn test_concurrent_add_is_busy_and_cancel_cleans_up() {
            let (mut h, _tools) = harness_with_tool(
                r#"
printf 'partial' > "$base.f22.mp4.part"
echo "[download]  10.0% of 1.00MiB"
exec sleep 30
"#,
            );

            let (first_tx, first_rx) = oneshot::channel();
            h.manager
                .add_to_library("https://example.com/videos/1".to_string(), first_tx);

            // Wait for the download to register
            for _ in 0..400 {
                if !h.manager.status().downloads.is_empty() {
                    break;
                }
                h.pump().await;
            }
            assert_eq!(h.manager.status().downloads.len(), 1);

            let second = h.add("https://example.com/videos/1").await;
            assert!(matches!(second, Response::Error(WallpaperError::Busy(_))));

            assert!(matches!(h.manager.cancel_download("clip_001"), Response::Ok));
            let first = h.settle(first_rx).await;
            assert!(matches!(first, Response::Error(WallpaperError::Download(_))));
            assert!(h.manager.list_library().is_empty());
            assert!(cache_files(&h).is_empty());
        }
    }
}
