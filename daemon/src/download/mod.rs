//! Download orchestration
//!
//! Turns a remote reference into a cached file by driving an external fetch
//! tool (yt-dlp by default):
//!
//! 1. [`FetchTool::locate`] finds the executable
//! 2. [`probe_best_format`] asks the tool for its format list and picks the
//!    best video-bearing candidate
//! 3. [`DownloadOrchestrator::download`] runs the tool, streams debounced
//!    progress, and renames the finished output into place
//!
//! Every file a job creates is staged under a job-unique name in the cache
//! directory so that a failure or cancellation can remove exactly those
//! files and nothing else.

mod fetch_tool;
mod orchestrator;
mod probe;
mod progress;

use std::path::PathBuf;
use thiserror::Error;

pub use fetch_tool::FetchTool;
pub use orchestrator::{CancelHandle, CancelToken, DownloadJob, DownloadOrchestrator};
pub use probe::{BestFormat, FormatCandidate, ProbeResult, probe_best_format, select_best_format};
pub use progress::ProgressTracker;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("fetch tool {0} not found")]
    FetchToolMissing(String),

    #[error("no usable video format: {0}")]
    FormatResolutionFailed(String),

    #[error("fetch tool failed with exit code {}", .0.map_or("none (killed)".to_string(), |c| c.to_string()))]
    ProcessFailed(Option<i32>),

    #[error("download cancelled")]
    Cancelled,

    #[error("fetch tool finished but produced no output at {}", .0.display())]
    OutputMissing(PathBuf),

    #[error("could not read probe output: {0}")]
    Probe(String),

    #[error("download I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DownloadError> for common::WallpaperError {
    fn from(e: DownloadError) -> Self {
        Self::Download(e.to_string())
    }
}
