//! State owned by the Wayland thread.

use smithay_client_toolkit::{
    compositor::CompositorState, output::OutputState, registry::RegistryState,
    shell::wlr_layer::{LayerShell, LayerSurface}, shm::Shm,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use wayland_client::protocol::wl_output;

use super::buffer::ShmBuffer;
use super::compose::Compositor;
use crate::display::{ConnectedDisplay, DisplayEvent, DisplayId, Frame};
use crate::playback::{FrameSlot, MediaHandle, VideoFrame};

/// Instructions from the display controller, applied in order
#[derive(Debug)]
pub enum SurfaceCommand {
    Create(ConnectedDisplay),
    Refit(ConnectedDisplay),
    Attach {
        display: DisplayId,
        stream: Option<MediaHandle>,
    },
    Cover {
        display: DisplayId,
        opacity: f32,
    },
    Destroy(DisplayId),
    Exit,
}

/// Wayland protocol objects plus one [`OutputSurface`] per live surface
pub struct SurfaceState {
    pub(super) registry_state: RegistryState,
    pub(super) compositor_state: CompositorState,
    pub(super) layer_shell: LayerShell,
    pub(super) output_state: OutputState,
    pub(super) shm: Shm,
    pub(super) surfaces: Vec<OutputSurface>,
    pub(super) compositor: Compositor,
    pub(super) topology: mpsc::UnboundedSender<DisplayEvent>,
    pub(super) exit: bool,
}

/// One layer surface pinned to one output
pub struct OutputSurface {
    pub(super) id: DisplayId,
    pub(super) output: wl_output::WlOutput,
    pub(super) layer_surface: LayerSurface,
    /// Buffers handed to the compositor, reused once released
    pub(super) buffers: Vec<ShmBuffer>,
    pub(super) frame: Frame,
    pub(super) width: u32,
    pub(super) height: u32,
    pub(super) configured: bool,
    pub(super) frames: Option<FrameSlot>,
    pub(super) cover: f32,
    /// Last frame drawn, to skip redrawing an unchanged picture
    pub(super) shown: Option<Arc<VideoFrame>>,
    pub(super) dirty: bool,
}

impl OutputSurface {
    const MAX_BUFFERS: usize = 3;

    /// Whether something new has to be drawn
    pub(super) fn needs_redraw(&self) -> bool {
        if !self.configured || self.width == 0 || self.height == 0 {
            return false;
        }
        if self.dirty {
            return true;
        }
        match (&self.frames, &self.shown) {
            (Some(slot), Some(shown)) => slot
                .latest()
                .is_some_and(|latest| !Arc::ptr_eq(&latest, shown)),
            (Some(slot), None) => slot.latest().is_some(),
            (None, _) => false,
        }
    }

    /// Take a released buffer of the current size, if any
    pub(super) fn take_released_buffer(&mut self) -> Option<ShmBuffer> {
        let (width, height) = (self.width, self.height);
        let index = self
            .buffers
            .iter()
            .position(|b| b.width() == width && b.height() == height && b.is_released())?;
        Some(self.buffers.swap_remove(index))
    }

    /// Return a buffer that was just committed, dropping released extras
    pub(super) fn keep_buffer(&mut self, buffer: ShmBuffer) {
        self.buffers.push(buffer);

        let (width, height) = (self.width, self.height);
        self.buffers
            .retain(|b| !b.is_released() || (b.width() == width && b.height() == height));

        if self.buffers.len() > Self::MAX_BUFFERS {
            let mut excess = self.buffers.len() - Self::MAX_BUFFERS;
            self.buffers.retain(|b| {
                if excess > 0 && b.is_released() {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }

        if self.buffers.len() > Self::MAX_BUFFERS {
            log::warn!(
                "Surface {} holds {} busy buffers, compositor may not be releasing them",
                self.id,
                self.buffers.len()
            );
        }
    }
}

impl Drop for OutputSurface {
    fn drop(&mut self) {
        log::debug!(
            "Dropping surface for {} ({}x{}, {} buffers)",
            self.id,
            self.width,
            self.height,
            self.buffers.len()
        );
    }
}
