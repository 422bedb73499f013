use std::fmt;

use super::controller::DisplayError;
use crate::config::DisplaySettings;

/// Stable identity of a physical display (the compositor's output name)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DisplayId(String);

impl DisplayId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position and logical size of a display in the global layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frame {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn same_size(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height
    }
}

/// One entry of the current display topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedDisplay {
    pub id: DisplayId,
    pub frame: Frame,
}

impl ConnectedDisplay {
    pub fn new(id: impl Into<String>, frame: Frame) -> Self {
        Self {
            id: DisplayId::new(id),
            frame,
        }
    }
}

/// What the surface side reports back to the scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayEvent {
    /// Full snapshot of the connected displays
    Topology(Vec<ConnectedDisplay>),
    /// A queued `create` did not produce a surface
    AttachFailed(DisplayError),
}

/// Displays declared in `[[display.fallback]]`, used when the compositor
/// cannot tell us what is connected
pub fn fallback_displays(settings: &DisplaySettings) -> Vec<ConnectedDisplay> {
    settings
        .fallback
        .iter()
        .map(|d| {
            ConnectedDisplay::new(
                d.name.clone(),
                Frame {
                    x: d.x,
                    y: d.y,
                    width: d.width,
                    height: d.height,
                },
            )
        })
        .collect()
}
