mod catalog;
mod config;
mod display;
mod download;
mod ipc_server;
mod macros;
mod manager;
mod playback;
mod scheduler;
mod state;
mod video;
mod wayland;

use anyhow::{Context, Result};
use common::{Command, Response};
use tokio::sync::{mpsc, oneshot, watch};

use crate::catalog::{CacheStore, JsonCatalogFile};
use crate::display::{
    DisplayController, DisplayEvent, HeadlessSurfaces, SurfaceBackend, fallback_displays,
};
use crate::download::DownloadOrchestrator;
use crate::manager::WallpaperManager;
use crate::playback::PlaybackEngine;
use crate::scheduler::{Inbox, Request};
use crate::state::{Preferences, PreferencesFile};

#[tokio::main]
async fn main() -> Result<()> {
    let (config, config_error) = match config::Config::load() {
        Ok(cfg) => (cfg, None),
        Err(e) => (config::Config::default(), Some(e)),
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.general.log_level.as_str()),
    )
    .init();

    log::info!("Starting loopwall v{}", env!("CARGO_PKG_VERSION"));

    match config_error {
        None => {
            log::info!("✓ Configuration loaded");
            log::info!("    - Log level: {}", config.general.log_level);
            log::info!(
                "    - Crossfade: {}ms, audio fade: {}ms, stop fade: {}ms",
                config.playback.crossfade_ms,
                config.playback.audio_fade_ms,
                config.playback.stop_fade_ms
            );
            log::info!(
                "    - Restore on launch: {}",
                if config.general.restore_on_launch { "yes" } else { "no" }
            );
        }
        Some(e) => {
            log::warn!("Failed to load config: {:#}. Using defaults.", e);
            if let Ok(path) = config::Config::default_config_path() {
                log::info!("Config is read from {}", path.display());
            }
        }
    }

    // Library
    let cache_dir = config.library.cache_dir()?;
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("Failed to create cache directory {}", cache_dir.display()))?;
    let catalog_path = config.library.catalog_path()?;
    let store = CacheStore::open(Box::new(JsonCatalogFile::new(&catalog_path)))
        .with_context(|| format!("Failed to open catalog {}", catalog_path.display()))?;
    log::info!(
        "Library: {} entries in {}",
        store.all().len(),
        catalog_path.display()
    );
    let orchestrator = DownloadOrchestrator::new(config.fetch.clone(), cache_dir);

    let prefs_file = PreferencesFile::new(config.library.state_path()?);
    let prefs = prefs_file.load_or(Preferences::from_settings(&config.playback));

    // Playback
    let (engine_tx, engine_rx) = mpsc::unbounded_channel();
    let (media_tx, media_rx) = mpsc::unbounded_channel();
    let engine = PlaybackEngine::new(
        Box::new(video::GstMediaBackend::new(media_tx)),
        config.playback.timings(),
        engine_tx,
        prefs.audio_enabled,
        prefs.audio_volume,
    );

    // Displays
    let (topology_tx, topology_rx) = mpsc::unbounded_channel();
    let surfaces: Box<dyn SurfaceBackend> =
        match wayland::spawn(&config.display, topology_tx.clone()) {
            Ok((surfaces, _thread)) => Box::new(surfaces),
            Err(e) => {
                log::warn!("{:#}; running headless", e);
                let displays = fallback_displays(&config.display);
                log::info!("Using {} fallback display(s)", displays.len());
                let _ = topology_tx.send(DisplayEvent::Topology(displays));
                Box::new(HeadlessSurfaces)
            }
        };

    let (manager_tx, manager_rx) = mpsc::unbounded_channel();
    let manager = WallpaperManager::new(
        store,
        orchestrator,
        engine,
        DisplayController::new(surfaces),
        prefs_file,
        prefs,
        manager_tx,
    );

    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let inbox = Inbox {
        requests: requests_rx,
        engine: engine_rx,
        media: media_rx,
        manager: manager_rx,
        topology: topology_rx,
    };
    let scheduler_handle = tokio::spawn(scheduler::run(manager, inbox, shutdown_rx.clone()));

    if config.general.restore_on_launch {
        restore_last_wallpaper(&requests_tx);
    }

    // Start IPC server
    let ipc_shutdown = shutdown_rx.clone();
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server::start(requests_tx, ipc_shutdown).await {
            log::error!("IPC server error: {}", e);
        }
    });

    // Set up signal handlers
    let signal_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                log::error!("Failed to set up signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM, shutting down...");
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT, shutting down...");
            }
        }

        let _ = signal_shutdown.send(true);
    });

    // The scheduler decides when the daemon is done
    if let Err(e) = scheduler_handle.await {
        log::error!("Scheduler task failed: {}", e);
    }
    let _ = shutdown_tx.send(true);
    if let Err(e) = ipc_handle.await {
        log::error!("IPC server task failed: {}", e);
    }

    log::info!("Daemon shutting down");
    Ok(())
}

/// Queue a restore of the last wallpaper and log how it went
fn restore_last_wallpaper(requests: &mpsc::UnboundedSender<Request>) {
    let (reply, response) = oneshot::channel();
    let request = Request {
        command: Command::RestoreLastOnLaunch,
        reply,
    };
    if requests.send(request).is_err() {
        return;
    }

    tokio::spawn(async move {
        match response.await {
            Ok(Response::Playing(report)) => {
                log::info!("Restored wallpaper {}", report.id);
                if report.readiness_timed_out {
                    log::warn!("{} started before it reported ready", report.id);
                }
            }
            Ok(Response::NothingToRestore) => log::info!("No wallpaper to restore"),
            Ok(Response::Error(e)) => log::warn!("Failed to restore wallpaper: {}", e),
            Ok(other) => log::debug!("Unexpected restore reply: {:?}", other),
            Err(_) => log::debug!("Restore dropped during shutdown"),
        }
    });
}
