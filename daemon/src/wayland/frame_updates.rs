use anyhow::Result;
use smithay_client_toolkit::shell::WaylandSurface;
use wayland_client::QueueHandle;

use super::buffer::ShmBuffer;
use super::types::SurfaceState;

/// Draw every surface whose frame or cover changed since the last pass.
///
/// Returns how many surfaces were committed.
pub(super) fn update_surfaces(
    state: &mut SurfaceState,
    qh: &QueueHandle<SurfaceState>,
) -> Result<usize> {
    let mut committed = 0;

    for surface in &mut state.surfaces {
        if !surface.needs_redraw() {
            continue;
        }

        let latest = surface.frames.as_ref().and_then(|slot| slot.latest());
        let pixels = state.compositor.render(
            latest.as_deref(),
            surface.width,
            surface.height,
            surface.cover,
        )?;

        let mut buffer = match surface.take_released_buffer() {
            Some(buffer) => buffer,
            None => ShmBuffer::new(state.shm.wl_shm(), surface.width, surface.height, qh)?,
        };
        buffer.write_image_data(&pixels)?;

        let wl_surface = surface.layer_surface.wl_surface();
        wl_surface.attach(Some(buffer.buffer()), 0, 0);
        wl_surface.damage_buffer(0, 0, surface.width as i32, surface.height as i32);
        wl_surface.commit();
        buffer.mark_busy();

        surface.keep_buffer(buffer);
        surface.shown = latest;
        surface.dirty = false;
        committed += 1;
    }

    if committed > 0 {
        log::trace!("Committed {} surface(s)", committed);
    }
    Ok(committed)
}
