use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("failed to open {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("media backend error: {0}")]
    Backend(String),

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("video support not compiled in")]
    Unsupported,
}

/// Identity of one opened media source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Decoded BGRA frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Bytes per row, at least `width * 4`
    pub stride: u32,
    pub data: Vec<u8>,
}

impl VideoFrame {
    /// Whether `data` really holds `height` rows of `width` pixels
    pub fn is_well_formed(&self) -> bool {
        let row = self.width as usize * 4;
        let stride = self.stride as usize;
        if self.width == 0 || self.height == 0 || stride < row {
            return false;
        }
        let needed = stride * (self.height as usize - 1) + row;
        self.data.len() >= needed
    }
}

/// Latest decoded frame of a stream, shared with every surface showing it
#[derive(Debug, Clone, Default)]
pub struct FrameSlot {
    latest: Arc<Mutex<Option<Arc<VideoFrame>>>>,
}

impl FrameSlot {
    pub fn publish(&self, frame: VideoFrame) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(Arc::new(frame));
        }
    }

    pub fn latest(&self) -> Option<Arc<VideoFrame>> {
        self.latest.lock().ok()?.clone()
    }
}

/// An opened media source; cheap to clone and hand to surfaces
#[derive(Debug, Clone)]
pub struct MediaHandle {
    pub id: StreamId,
    pub frames: FrameSlot,
}

impl MediaHandle {
    pub fn new(id: StreamId) -> Self {
        Self {
            id,
            frames: FrameSlot::default(),
        }
    }
}

impl PartialEq for MediaHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MediaHandle {}

/// Cancellable end-of-stream subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EosToken {
    pub stream: StreamId,
    pub serial: u64,
}

/// Notifications a backend sends from its own threads
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    EndOfStream { token: EosToken },
    Error { stream: StreamId, message: String },
}

/// Decode/playback subsystem.
///
/// Backends are constructed with a sender for [`MediaEvent`]s; end-of-stream
/// is only reported for streams with a live subscription, and at most once
/// per subscription.
pub trait MediaBackend: Send {
    fn open(&mut self, path: &Path) -> Result<MediaHandle, MediaError>;
    fn is_ready(&mut self, handle: &MediaHandle) -> bool;
    fn play(&mut self, handle: &MediaHandle) -> Result<(), MediaError>;
    fn pause(&mut self, handle: &MediaHandle) -> Result<(), MediaError>;
    fn seek(&mut self, handle: &MediaHandle, position: Duration) -> Result<(), MediaError>;
    fn subscribe_end_of_stream(&mut self, handle: &MediaHandle) -> Result<EosToken, MediaError>;
    fn unsubscribe(&mut self, token: EosToken);
    fn set_volume(&mut self, handle: &MediaHandle, volume: f32);
    fn set_muted(&mut self, handle: &MediaHandle, muted: bool);
    fn close(&mut self, handle: &MediaHandle);
}
