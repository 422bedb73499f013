//! Wayland layer-shell surfaces
//!
//! The Wayland connection lives on its own thread:
//! - daemon: thread startup, reconnection and the event loop
//! - outputs: topology snapshots and layer surface management
//! - frame_updates: drawing the attached stream into each surface
//! - compose: scaling frames and blending the cover colour
//! - buffer: shared-memory buffers
//! - event_handlers: Wayland protocol event handlers
//!
//! The display controller talks to it through [`WaylandSurfaces`], a
//! [`SurfaceBackend`](crate::display::SurfaceBackend) that only queues
//! commands.

#[cfg(feature = "wayland")]
mod buffer;
#[cfg(feature = "wayland")]
mod compose;
#[cfg(feature = "wayland")]
mod daemon;
#[cfg(feature = "wayland")]
mod event_handlers;
#[cfg(feature = "wayland")]
mod frame_updates;
#[cfg(feature = "wayland")]
mod outputs;
#[cfg(feature = "wayland")]
mod types;

#[cfg(feature = "wayland")]
pub use daemon::{WaylandSurfaces, spawn};

#[cfg(not(feature = "wayland"))]
pub use stub::{WaylandSurfaces, spawn};

#[cfg(not(feature = "wayland"))]
mod stub {
    use anyhow::Result;
    use tokio::sync::mpsc;

    use crate::config::DisplaySettings;
    use crate::display::{ConnectedDisplay, DisplayError, DisplayEvent, DisplayId, SurfaceBackend};
    use crate::playback::MediaHandle;

    /// Placeholder when Wayland support is not compiled in; never constructed
    pub enum WaylandSurfaces {}

    impl SurfaceBackend for WaylandSurfaces {
        fn create(&mut self, _display: &ConnectedDisplay) -> Result<(), DisplayError> {
            match *self {}
        }

        fn refit(&mut self, _display: &ConnectedDisplay) {
            match *self {}
        }

        fn attach(&mut self, _display: &DisplayId, _stream: Option<&MediaHandle>) {
            match *self {}
        }

        fn set_cover_opacity(&mut self, _display: &DisplayId, _opacity: f32) {
            match *self {}
        }

        fn destroy(&mut self, _display: &DisplayId) {
            match *self {}
        }
    }

    pub fn spawn(
        _settings: &DisplaySettings,
        _topology: mpsc::UnboundedSender<DisplayEvent>,
    ) -> Result<(WaylandSurfaces, std::thread::JoinHandle<()>)> {
        anyhow::bail!("Wayland support not compiled in")
    }
}
