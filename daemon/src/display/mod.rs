//! Display surfaces
//!
//! [`DisplayController`] keeps one surface per connected display and mirrors
//! the playback engine's stream and cover opacity onto all of them. The
//! actual drawing sits behind [`SurfaceBackend`]: the Wayland layer-shell
//! backend in [`crate::wayland`], or [`HeadlessSurfaces`] when no compositor
//! is reachable.

mod controller;
mod topology;

pub use controller::{
    DisplayController, DisplayError, DisplaySurface, HeadlessSurfaces, SurfaceBackend,
};
pub use topology::{ConnectedDisplay, DisplayEvent, DisplayId, Frame, fallback_displays};

#[cfg(test)]
pub use controller::fake;
