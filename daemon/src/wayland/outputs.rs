use anyhow::{Context, Result};
use smithay_client_toolkit::compositor::Region;
use smithay_client_toolkit::shell::{
    WaylandSurface,
    wlr_layer::{Anchor, KeyboardInteractivity, Layer},
};
use wayland_client::{QueueHandle, protocol::wl_output};

use super::types::{OutputSurface, SurfaceCommand, SurfaceState};
use crate::display::{ConnectedDisplay, DisplayError, DisplayEvent, DisplayId, Frame};

/// Current topology as reported by `wl_output`, minus `excluding`
pub(super) fn current_displays(
    state: &SurfaceState,
    excluding: Option<&wl_output::WlOutput>,
) -> Vec<ConnectedDisplay> {
    state
        .output_state
        .outputs()
        .filter(|output| Some(output) != excluding)
        .filter_map(|output| {
            let info = state.output_state.info(&output)?;
            let name = info.name.clone()?;
            let (width, height) = info.logical_size?;
            let (x, y) = info.logical_position.unwrap_or((0, 0));
            Some(ConnectedDisplay::new(
                name,
                Frame {
                    x,
                    y,
                    width: width.max(0) as u32,
                    height: height.max(0) as u32,
                },
            ))
        })
        .filter(|display| !display.frame.is_empty())
        .collect()
}

/// Tell the scheduler about the current topology
pub(super) fn publish_topology(state: &SurfaceState, excluding: Option<&wl_output::WlOutput>) {
    let displays = current_displays(state, excluding);
    log::debug!("Publishing topology with {} display(s)", displays.len());
    if state.topology.send(DisplayEvent::Topology(displays)).is_err() {
        log::debug!("Topology receiver gone");
    }
}

fn find_output(state: &SurfaceState, id: &DisplayId) -> Option<wl_output::WlOutput> {
    state.output_state.outputs().find(|output| {
        state
            .output_state
            .info(output)
            .and_then(|info| info.name)
            .is_some_and(|name| name == id.as_str())
    })
}

/// Create a click-through background layer surface on `display`
pub(super) fn create_layer_surface(
    state: &mut SurfaceState,
    display: &ConnectedDisplay,
    qh: &QueueHandle<SurfaceState>,
) -> Result<()> {
    if state.surfaces.iter().any(|s| s.id == display.id) {
        log::debug!("Surface for {} already exists", display.id);
        return Ok(());
    }

    let output = find_output(state, &display.id)
        .with_context(|| format!("No wl_output named {}", display.id))?;

    let surface = state.compositor_state.create_surface(qh);

    // Empty input region: pointer events fall through to the desktop
    let region = Region::new(&state.compositor_state).context("Failed to create input region")?;
    surface.set_input_region(Some(region.wl_region()));

    let layer_surface = state.layer_shell.create_layer_surface(
        qh,
        surface,
        Layer::Background,
        Some("loopwall"),
        Some(&output),
    );

    layer_surface.set_anchor(Anchor::all());
    layer_surface.set_exclusive_zone(-1);
    layer_surface.set_keyboard_interactivity(KeyboardInteractivity::None);
    layer_surface.commit();

    state.surfaces.push(OutputSurface {
        id: display.id.clone(),
        output,
        layer_surface,
        buffers: Vec::new(),
        frame: display.frame,
        width: 0,
        height: 0,
        configured: false,
        frames: None,
        cover: 1.0,
        shown: None,
        dirty: true,
    });

    log::info!("Created layer surface for {}", display.id);
    Ok(())
}

/// Apply one command from the display controller
pub(super) fn handle_surface_command(
    state: &mut SurfaceState,
    command: SurfaceCommand,
    qh: &QueueHandle<SurfaceState>,
) -> Result<()> {
    match command {
        SurfaceCommand::Create(display) => {
            if let Err(e) = create_layer_surface(state, &display, qh) {
                log::warn!("Failed to create surface for {}: {:#}", display.id, e);
                let failure = DisplayError::DisplayAttachFailed {
                    display: display.id.clone(),
                    reason: format!("{:#}", e),
                };
                if state.topology.send(DisplayEvent::AttachFailed(failure)).is_err() {
                    log::debug!("Topology receiver gone");
                }
            }
        }
        SurfaceCommand::Refit(display) => {
            if let Some(surface) = state.surfaces.iter_mut().find(|s| s.id == display.id) {
                surface.frame = display.frame;
                surface.configured = false;
                // Anchored to every edge, so a zero size asks for a fresh configure
                surface.layer_surface.set_size(0, 0);
                surface.layer_surface.commit();
            }
        }
        SurfaceCommand::Attach { display, stream } => {
            if let Some(surface) = state.surfaces.iter_mut().find(|s| s.id == display) {
                surface.frames = stream.map(|s| s.frames);
                surface.shown = None;
                surface.dirty = true;
            }
        }
        SurfaceCommand::Cover { display, opacity } => {
            if let Some(surface) = state.surfaces.iter_mut().find(|s| s.id == display)
                && surface.cover != opacity
            {
                surface.cover = opacity;
                surface.dirty = true;
            }
        }
        SurfaceCommand::Destroy(display) => {
            let before = state.surfaces.len();
            state.surfaces.retain(|s| s.id != display);
            if state.surfaces.len() < before {
                log::info!("Destroyed layer surface for {}", display);
            }
        }
        SurfaceCommand::Exit => state.exit = true,
    }
    Ok(())
}
