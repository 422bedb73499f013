//! The daemon's single scheduling context.
//!
//! Every mutation of library, playback and surface state happens on the task
//! running [`run`]. IPC requests, engine timers, media bus messages,
//! background download results and display topology changes all arrive as
//! channel messages and are handled one at a time, in arrival order per
//! channel.

use common::{Command, Response};
use std::ops::ControlFlow;
use tokio::sync::{mpsc, oneshot, watch};

use crate::display::DisplayEvent;
use crate::manager::{ManagerEvent, WallpaperManager};
use crate::playback::{EngineEvent, MediaEvent};

/// A client command together with where its answer goes
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub reply: oneshot::Sender<Response>,
}

/// Receiving halves of everything the scheduler listens to
pub struct Inbox {
    pub requests: mpsc::UnboundedReceiver<Request>,
    pub engine: mpsc::UnboundedReceiver<EngineEvent>,
    pub media: mpsc::UnboundedReceiver<MediaEvent>,
    pub manager: mpsc::UnboundedReceiver<ManagerEvent>,
    pub topology: mpsc::UnboundedReceiver<DisplayEvent>,
}

/// Run until a `Kill` request arrives, `shutdown` flips to true, or every
/// input is gone. The manager is shut down before returning.
pub async fn run(
    mut manager: WallpaperManager,
    mut inbox: Inbox,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("Scheduler started");

    loop {
        tokio::select! {
            Some(request) = inbox.requests.recv() => {
                if dispatch(&mut manager, request).is_break() {
                    log::info!("Kill requested, shutting down");
                    break;
                }
            }
            Some(event) = inbox.engine.recv() => manager.handle_engine_event(event),
            Some(event) = inbox.media.recv() => {
                manager.handle_engine_event(EngineEvent::Media(event));
            }
            Some(event) = inbox.manager.recv() => manager.handle_event(event),
            Some(event) = inbox.topology.recv() => manager.handle_display_event(event),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    log::info!("Shutdown requested");
                    break;
                }
            }
            else => {
                log::warn!("All scheduler inputs closed");
                break;
            }
        }
    }

    manager.shutdown();
    log::info!("Scheduler stopped");
}

/// Route one request to the manager
fn dispatch(manager: &mut WallpaperManager, request: Request) -> ControlFlow<()> {
    let Request { command, reply } = request;
    log::debug!("Handling command: {:?}", command);

    let response = match command {
        // These reply later, once their background work settles
        Command::AddToLibrary { reference } => {
            manager.add_to_library(reference, reply);
            return ControlFlow::Continue(());
        }
        Command::SetWallpaper { id } => {
            manager.set_wallpaper(&id, reply);
            return ControlFlow::Continue(());
        }
        Command::RestoreLastOnLaunch => {
            manager.restore_last_on_launch(reply);
            return ControlFlow::Continue(());
        }

        Command::StopWallpaper => manager.stop_wallpaper(),
        Command::SetAudioEnabled { enabled } => manager.set_audio_enabled(enabled),
        Command::SetVolume { volume } => manager.set_volume(volume),
        Command::DeleteFromLibrary { id } => manager.delete_from_library(&id),
        Command::ReorderLibrary { order } => manager.reorder_library(&order),
        Command::CancelDownload { id } => manager.cancel_download(&id),
        Command::ListLibrary => Response::Library(manager.list_library()),
        Command::Query => Response::Status(manager.status()),
        Command::ListDisplays => Response::Displays(manager.list_displays()),
        Command::Ping => Response::Pong,
        Command::Kill => {
            let _ = reply.send(Response::Ok);
            return ControlFlow::Break(());
        }
    };

    let _ = reply.send(response);
    ControlFlow::Continue(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CacheStore, MemoryCatalog};
    use crate::config::{FetchSettings, PlaybackSettings};
    use crate::display::{ConnectedDisplay, DisplayController, Frame, HeadlessSurfaces};
    use crate::download::DownloadOrchestrator;
    use crate::playback::PlaybackEngine;
    use crate::playback::fake::FakeMedia;
    use crate::state::{Preferences, PreferencesFile};

    struct Running {
        requests: mpsc::UnboundedSender<Request>,
        topology: mpsc::UnboundedSender<DisplayEvent>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    fn start() -> Running {
        let dir = tempfile::tempdir().unwrap();
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (engine_tx, engine) = mpsc::unbounded_channel();
        let (_media_tx, media) = mpsc::unbounded_channel();
        let (manager_tx, manager_rx) = mpsc::unbounded_channel();
        let (topology_tx, topology) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let prefs = Preferences::from_settings(&PlaybackSettings::default());
        let engine_handle = PlaybackEngine::new(
            Box::new(FakeMedia::default()),
            PlaybackSettings::default().timings(),
            engine_tx,
            prefs.audio_enabled,
            prefs.audio_volume,
        );
        let manager = WallpaperManager::new(
            CacheStore::open(Box::new(MemoryCatalog::default())).unwrap(),
            DownloadOrchestrator::new(FetchSettings::default(), dir.path().join("videos")),
            engine_handle,
            DisplayController::new(Box::new(HeadlessSurfaces)),
            PreferencesFile::new(dir.path().join("state.json")),
            prefs,
            manager_tx,
        );

        let inbox = Inbox {
            requests,
            engine,
            media,
            manager: manager_rx,
            topology,
        };
        let task = tokio::spawn(run(manager, inbox, shutdown_rx));

        Running {
            requests: requests_tx,
            topology: topology_tx,
            shutdown: shutdown_tx,
            task,
            _dir: dir,
        }
    }

    async fn ask(running: &Running, command: Command) -> Response {
        let (reply, rx) = oneshot::channel();
        running.requests.send(Request { command, reply }).unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_requests_are_answered_in_order() {
        let running = start();

        assert!(matches!(ask(&running, Command::Ping).await, Response::Pong));
        assert!(matches!(
            ask(&running, Command::ListLibrary).await,
            Response::Library(entries) if entries.is_empty()
        ));
        assert!(matches!(
            ask(&running, Command::RestoreLastOnLaunch).await,
            Response::NothingToRestore
        ));

        let Response::Status(status) = ask(&running, Command::Query).await else {
            panic!("expected status");
        };
        assert_eq!(status.playback.state, common::PlaybackState::Idle);
        assert!(status.downloads.is_empty());

        assert!(matches!(ask(&running, Command::Kill).await, Response::Ok));
        running.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_topology_updates_reach_the_controller() {
        let running = start();
        let frame = Frame {
            x: 0,
            y: 0,
            width: 2560,
            height: 1440,
        };
        running
            .topology
            .send(DisplayEvent::Topology(vec![ConnectedDisplay::new(
                "HDMI-A-1", frame,
            )]))
            .unwrap();

        // The two channels are independent, so poll until the snapshot lands
        let mut displays = Vec::new();
        for _ in 0..100 {
            let Response::Displays(current) = ask(&running, Command::ListDisplays).await else {
                panic!("expected displays");
            };
            if !current.is_empty() {
                displays = current;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(displays.len(), 1);
        assert_eq!(displays[0].id, "HDMI-A-1");
        assert_eq!(displays[0].width, 2560);
        assert!(!displays[0].attached);

        running.shutdown.send(true).unwrap();
        running.task.await.unwrap();
    }
}
