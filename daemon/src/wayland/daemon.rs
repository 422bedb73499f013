use anyhow::{Context, Result};
use smithay_client_toolkit::{
    compositor::CompositorState, output::OutputState, registry::RegistryState,
    shell::wlr_layer::LayerShell, shm::Shm,
};
use std::time::Duration;
use tokio::sync::mpsc;
use wayland_client::{
    Connection, ConnectError, backend::WaylandError, globals::registry_queue_init,
};

use super::compose::Compositor;
use super::frame_updates::update_surfaces;
use super::outputs::{handle_surface_command, publish_topology};
use super::types::{SurfaceCommand, SurfaceState};
use crate::config::{DisplaySettings, parse_hex_color};
use crate::display::{ConnectedDisplay, DisplayError, DisplayEvent, DisplayId, SurfaceBackend};
use crate::log_and_continue;
use crate::playback::MediaHandle;

const MAX_RETRIES: u32 = 10;

/// [`SurfaceBackend`] that forwards every call to the Wayland thread
pub struct WaylandSurfaces {
    commands: mpsc::UnboundedSender<SurfaceCommand>,
}

impl WaylandSurfaces {
    fn send(&self, command: SurfaceCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

impl SurfaceBackend for WaylandSurfaces {
    fn create(&mut self, display: &ConnectedDisplay) -> Result<(), DisplayError> {
        if self.send(SurfaceCommand::Create(display.clone())) {
            Ok(())
        } else {
            Err(DisplayError::DisplayAttachFailed {
                display: display.id.clone(),
                reason: "Wayland thread is not running".to_string(),
            })
        }
    }

    fn refit(&mut self, display: &ConnectedDisplay) {
        self.send(SurfaceCommand::Refit(display.clone()));
    }

    fn attach(&mut self, display: &DisplayId, stream: Option<&MediaHandle>) {
        self.send(SurfaceCommand::Attach {
            display: display.clone(),
            stream: stream.cloned(),
        });
    }

    fn set_cover_opacity(&mut self, display: &DisplayId, opacity: f32) {
        self.send(SurfaceCommand::Cover {
            display: display.clone(),
            opacity,
        });
    }

    fn destroy(&mut self, display: &DisplayId) {
        self.send(SurfaceCommand::Destroy(display.clone()));
    }
}

impl Drop for WaylandSurfaces {
    fn drop(&mut self) {
        self.send(SurfaceCommand::Exit);
    }
}

/// Connect to the compositor and start the Wayland thread.
///
/// Topology snapshots are sent on `topology` whenever outputs appear, change
/// or disappear, along with surfaces that could not be created. Fails right away when no compositor is reachable, so the
/// caller can fall back to headless surfaces.
pub fn spawn(
    settings: &DisplaySettings,
    topology: mpsc::UnboundedSender<DisplayEvent>,
) -> Result<(WaylandSurfaces, std::thread::JoinHandle<()>)> {
    log::info!("Connecting to Wayland compositor...");
    let conn = Connection::connect_to_env().context("Failed to connect to Wayland compositor")?;

    let cover = parse_hex_color(&settings.cover_color).unwrap_or((0, 0, 0));
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = std::thread::Builder::new()
        .name("wayland".to_string())
        .spawn(move || run_wayland_with_reconnect(conn, rx, topology, cover))
        .context("Failed to spawn Wayland thread")?;

    Ok((WaylandSurfaces { commands: tx }, handle))
}

fn is_retryable(e: &anyhow::Error) -> bool {
    if e.downcast_ref::<ConnectError>().is_some() {
        return true;
    }
    let error_msg = format!("{:#}", e).to_lowercase();
    error_msg.contains("broken pipe") || error_msg.contains("connection reset")
}

fn run_wayland_with_reconnect(
    conn: Connection,
    mut commands: mpsc::UnboundedReceiver<SurfaceCommand>,
    topology: mpsc::UnboundedSender<DisplayEvent>,
    cover: (u8, u8, u8),
) {
    let mut conn = Some(conn);
    let mut retry_count = 0u32;
    let mut backoff_ms = 1000u64;

    loop {
        let result = match conn.take() {
            Some(conn) => Ok(conn),
            None => Connection::connect_to_env().map_err(anyhow::Error::from),
        }
        .and_then(|conn| run_wayland_blocking(conn, &mut commands, &topology, cover));

        let e = match result {
            Ok(()) => {
                log::info!("Wayland thread exited normally");
                return;
            }
            Err(e) => e,
        };

        // Every surface died with the connection
        let _ = topology.send(DisplayEvent::Topology(Vec::new()));

        if !is_retryable(&e) {
            log::error!("Wayland error (not retrying): {:#}", e);
            return;
        }

        retry_count += 1;
        if retry_count > MAX_RETRIES {
            log::error!(
                "Failed to reconnect after {} attempts. Giving up.",
                MAX_RETRIES
            );
            return;
        }

        log::warn!(
            "Wayland compositor disconnected (attempt {}/{}). Reconnecting in {}ms...",
            retry_count,
            MAX_RETRIES,
            backoff_ms
        );
        std::thread::sleep(Duration::from_millis(backoff_ms));
        backoff_ms = std::cmp::min(backoff_ms * 2, 10000);
    }
}

fn run_wayland_blocking(
    conn: Connection,
    commands: &mut mpsc::UnboundedReceiver<SurfaceCommand>,
    topology: &mpsc::UnboundedSender<DisplayEvent>,
    cover: (u8, u8, u8),
) -> Result<()> {
    let (globals, mut event_queue) = registry_queue_init(&conn)?;
    let qh = event_queue.handle();

    let mut state = SurfaceState {
        registry_state: RegistryState::new(&globals),
        compositor_state: CompositorState::bind(&globals, &qh)?,
        layer_shell: LayerShell::bind(&globals, &qh)?,
        output_state: OutputState::new(&globals, &qh),
        shm: Shm::bind(&globals, &qh)?,
        surfaces: Vec::new(),
        compositor: Compositor::new(cover),
        topology: topology.clone(),
        exit: false,
    };

    // Outputs and their names/geometry arrive over the first roundtrips
    event_queue.roundtrip(&mut state)?;
    event_queue.roundtrip(&mut state)?;
    log::info!(
        "Connected to Wayland compositor with {} output(s)",
        state.output_state.outputs().count()
    );
    publish_topology(&state, None);

    loop {
        loop {
            match commands.try_recv() {
                Ok(command) => log_and_continue!(
                    handle_surface_command(&mut state, command, &qh),
                    "handle surface command"
                ),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    state.exit = true;
                    break;
                }
            }
        }

        if state.exit {
            log::info!("Exiting Wayland event loop");
            break;
        }

        if let Some(guard) = event_queue.prepare_read() {
            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
        event_queue.dispatch_pending(&mut state)?;

        log_and_continue!(update_surfaces(&mut state, &qh), "update surfaces");

        event_queue.flush()?;

        std::thread::sleep(next_poll_delay(&state));
    }

    Ok(())
}

/// Poll at video rate while a stream is attached, lazily otherwise
fn next_poll_delay(state: &SurfaceState) -> Duration {
    if state.surfaces.iter().any(|s| s.frames.is_some()) {
        Duration::from_millis(8)
    } else if state.surfaces.iter().any(|s| s.dirty) {
        Duration::from_millis(16)
    } else {
        Duration::from_millis(50)
    }
}
