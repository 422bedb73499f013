use std::collections::BTreeMap;
use thiserror::Error;

use super::topology::{ConnectedDisplay, DisplayId, Frame};
use crate::playback::{MediaHandle, PlaybackEvent, StreamId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DisplayError {
    #[error("failed to attach a surface to {display}: {reason}")]
    DisplayAttachFailed { display: DisplayId, reason: String },
}

impl From<DisplayError> for common::WallpaperError {
    fn from(e: DisplayError) -> Self {
        Self::Display(e.to_string())
    }
}

/// Whatever actually puts pixels on a display.
///
/// Every call refers to a surface by the display it sits on; the controller
/// guarantees `create` happens before any other call for that display and
/// that nothing follows `destroy` until the next `create`.
pub trait SurfaceBackend: Send {
    /// Create a borderless, click-through surface covering `display`
    fn create(&mut self, display: &ConnectedDisplay) -> Result<(), DisplayError>;

    /// Re-fit an existing surface to a new frame
    fn refit(&mut self, display: &ConnectedDisplay);

    /// Show `stream` (or nothing but the cover) on the surface
    fn attach(&mut self, display: &DisplayId, stream: Option<&MediaHandle>);

    fn set_cover_opacity(&mut self, display: &DisplayId, opacity: f32);

    fn destroy(&mut self, display: &DisplayId);
}

/// Controller-side view of one surface
#[derive(Debug, Clone, PartialEq)]
pub struct DisplaySurface {
    pub frame: Frame,
    pub attached_stream: Option<StreamId>,
}

/// Keeps exactly one surface per connected display, all showing the same
/// stream under the same cover opacity.
pub struct DisplayController {
    backend: Box<dyn SurfaceBackend>,
    surfaces: BTreeMap<DisplayId, DisplaySurface>,
    stream: Option<MediaHandle>,
    cover: f32,
}

impl DisplayController {
    pub fn new(backend: Box<dyn SurfaceBackend>) -> Self {
        Self {
            backend,
            surfaces: BTreeMap::new(),
            stream: None,
            cover: 1.0,
        }
    }

    #[cfg(test)]
    pub fn surface(&self, display: &DisplayId) -> Option<&DisplaySurface> {
        self.surfaces.get(display)
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    #[cfg(test)]
    pub fn cover_opacity(&self) -> f32 {
        self.cover
    }

    /// Bring the surface map in line with `displays`.
    ///
    /// New displays get a surface showing the current stream at the current
    /// cover opacity; surfaces of vanished displays are destroyed; surfaces
    /// whose frame changed are re-fitted. Surfaces that fail to attach are
    /// skipped and reported, the rest of the topology is still applied.
    pub fn reconcile(&mut self, displays: &[ConnectedDisplay]) -> Vec<DisplayError> {
        let wanted: BTreeMap<&DisplayId, &ConnectedDisplay> =
            displays.iter().map(|d| (&d.id, d)).collect();

        let gone: Vec<DisplayId> = self
            .surfaces
            .keys()
            .filter(|id| !wanted.contains_key(id))
            .cloned()
            .collect();
        for id in gone {
            log::info!("Display {} disconnected, destroying its surface", id);
            self.backend.destroy(&id);
            self.surfaces.remove(&id);
        }

        let mut failures = Vec::new();
        for display in wanted.into_values() {
            if let Some(surface) = self.surfaces.get_mut(&display.id) {
                if surface.frame != display.frame {
                    if surface.frame.same_size(&display.frame) {
                        log::debug!("Display {} moved to {:?}", display.id, display.frame);
                    } else {
                        log::info!(
                            "Display {} resized {}x{} -> {}x{}",
                            display.id,
                            surface.frame.width,
                            surface.frame.height,
                            display.frame.width,
                            display.frame.height
                        );
                    }
                    self.backend.refit(display);
                    surface.frame = display.frame;
                }
                continue;
            }

            if let Err(e) = self.backend.create(display) {
                log::warn!("{}", e);
                failures.push(e);
                continue;
            }

            self.backend.attach(&display.id, self.stream.as_ref());
            self.backend.set_cover_opacity(&display.id, self.cover);
            self.surfaces.insert(
                display.id.clone(),
                DisplaySurface {
                    frame: display.frame,
                    attached_stream: self.stream.as_ref().map(|s| s.id),
                },
            );
            log::info!(
                "Created surface for {} ({}x{} at {},{})",
                display.id,
                display.frame.width,
                display.frame.height,
                display.frame.x,
                display.frame.y
            );
        }

        failures
    }

    /// Forget a surface the backend failed to create after accepting the
    /// request; the next topology snapshot tries again
    pub fn surface_failed(&mut self, display: &DisplayId) -> bool {
        if self.surfaces.remove(display).is_some() {
            log::warn!("Surface for {} was never created", display);
            self.backend.destroy(display);
            true
        } else {
            false
        }
    }

    /// Show `stream` on every live surface
    pub fn broadcast(&mut self, stream: Option<&MediaHandle>) {
        self.stream = stream.cloned();
        let attached = stream.map(|s| s.id);
        for (id, surface) in &mut self.surfaces {
            self.backend.attach(id, stream);
            surface.attached_stream = attached;
        }
        match stream {
            Some(s) => log::debug!("Broadcast {} to {} surface(s)", s.id, self.surfaces.len()),
            None => log::debug!("Cleared stream on {} surface(s)", self.surfaces.len()),
        }
    }

    pub fn set_cover_opacity(&mut self, opacity: f32) {
        self.cover = opacity.clamp(0.0, 1.0);
        for id in self.surfaces.keys() {
            self.backend.set_cover_opacity(id, self.cover);
        }
    }

    /// Forward the parts of a playback event that concern surfaces
    pub fn apply(&mut self, event: &PlaybackEvent) {
        match event {
            PlaybackEvent::StreamChanged(stream) => self.broadcast(stream.as_ref()),
            PlaybackEvent::CoverOpacity(opacity) => self.set_cover_opacity(*opacity),
            _ => {}
        }
    }

    pub fn displays(&self) -> Vec<common::DisplayInfo> {
        self.surfaces
            .iter()
            .map(|(id, surface)| common::DisplayInfo {
                id: id.to_string(),
                x: surface.frame.x,
                y: surface.frame.y,
                width: surface.frame.width,
                height: surface.frame.height,
                attached: surface.attached_stream.is_some(),
            })
            .collect()
    }

    /// Destroy every surface
    pub fn shutdown(&mut self) {
        for id in std::mem::take(&mut self.surfaces).into_keys() {
            self.backend.destroy(&id);
        }
        self.stream = None;
    }
}

/// Surface backend for running without a compositor: tracks nothing and
/// draws nothing, so playback and the library keep working headless.
pub struct HeadlessSurfaces;

impl SurfaceBackend for HeadlessSurfaces {
    fn create(&mut self, display: &ConnectedDisplay) -> Result<(), DisplayError> {
        log::debug!("Headless surface for {}", display.id);
        Ok(())
    }

    fn refit(&mut self, _display: &ConnectedDisplay) {}

    fn attach(&mut self, _display: &DisplayId, _stream: Option<&MediaHandle>) {}

    fn set_cover_opacity(&mut self, _display: &DisplayId, _opacity: f32) {}

    fn destroy(&mut self, _display: &DisplayId) {}
}
