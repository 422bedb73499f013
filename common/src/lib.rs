//! Common types and utilities for loopwall.
//!
//! This crate defines the shared data structures and IPC protocol used for
//! communication between the daemon (`loopwall`) and the client (`lwctl`).
//!
//! # IPC Protocol
//!
//! Communication happens over a Unix domain socket using newline-delimited
//! JSON messages. The client sends [`Command`] variants and receives
//! [`Response`] variants.
//!
//! # Examples
//!
//! ```no_run
//! use common::{Command, Response};
//!
//! // Ask the daemon to download a clip into the library
//! let cmd = Command::AddToLibrary {
//!     reference: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string(),
//! };
//!
//! // Serialize for sending over IPC
//! let json = serde_json::to_string(&cmd).unwrap();
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type shared between client and daemon.
///
/// All errors are serializable for transmission over IPC.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WallpaperError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("Display error: {0}")]
    Display(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for WallpaperError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for WallpaperError {
    fn from(e: serde_json::Error) -> Self {
        Self::Ipc(e.to_string())
    }
}

/// Commands sent from client to daemon via IPC.
///
/// These map one-to-one onto the daemon's public entry points, plus a few
/// inspection commands.
///
/// # Examples
///
/// ```
/// use common::Command;
///
/// let cmd = Command::ReorderLibrary {
///     order: vec!["abc123".to_string(), "xyz789".to_string()],
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Download a remote clip and add it to the library.
    ///
    /// The response is sent once the download finished or failed.
    AddToLibrary {
        /// Remote reference understood by the fetch tool (usually a URL)
        reference: String,
    },
    /// Play a library entry as the wallpaper on every display
    SetWallpaper { id: String },
    /// Fade out and stop the current wallpaper
    StopWallpaper,
    /// Enable or disable audio with a short volume ramp
    SetAudioEnabled { enabled: bool },
    /// Set the target audio volume (0.0-1.0)
    SetVolume { volume: f32 },
    /// Remove an entry and its cached files
    DeleteFromLibrary { id: String },
    /// Apply a user-defined ordering to the library
    ReorderLibrary { order: Vec<String> },
    /// Play whatever was last set as the wallpaper
    RestoreLastOnLaunch,
    /// Abort an in-flight download
    CancelDownload { id: String },
    /// List library entries in their user-defined order
    ListLibrary,
    /// Query daemon status
    Query,
    /// List displays and their surfaces
    ListDisplays,
    /// Ping the daemon
    Ping,
    /// Kill the daemon
    Kill,
}

/// Response from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Error(WallpaperError),
    Added(LibraryEntry),
    Playing(PlayReport),
    /// Nothing was recorded as the last wallpaper
    NothingToRestore,
    Library(Vec<LibraryEntry>),
    Status(DaemonStatus),
    Displays(Vec<DisplayInfo>),
    Pong,
}

/// A catalog entry as seen by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub id: String,
    pub title: String,
    pub thumbnail_path: Option<String>,
    pub cached_file_path: Option<String>,
    pub is_cached: bool,
    pub size_bytes: Option<u64>,
    pub sort_index: u32,
}

/// Outcome of a successful `SetWallpaper`/`RestoreLastOnLaunch`.
///
/// `readiness_timed_out` is set when the media source did not report ready
/// within the polling budget and playback was started anyway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayReport {
    pub id: String,
    pub readiness_timed_out: bool,
}

/// Lifecycle state of the playback engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackState {
    #[default]
    Idle,
    Loading,
    Playing,
    Switching,
    Stopping,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Playing => "playing",
            Self::Switching => "switching",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Daemon status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub playback: PlaybackStatus,
    pub downloads: Vec<DownloadStatus>,
    pub surfaces: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub active_id: Option<String>,
    pub audio_enabled: bool,
    pub audio_volume: f32,
}

/// An in-flight download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadStatus {
    pub id: String,
    pub reference: String,
    pub progress: f32,
}

/// Display (monitor) information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub id: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Whether a wallpaper stream is attached to this display's surface
    pub attached: bool,
}

/// Get the IPC socket path
pub fn get_socket_path() -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));

    std::path::PathBuf::from(runtime_dir).join("loopwall.sock")
}
