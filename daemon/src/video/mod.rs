//! GStreamer media backend
//!
//! - `pipeline`: pipeline construction and the appsink frame callback
//! - `backend`: [`GstMediaBackend`], the [`MediaBackend`] the daemon runs with
//!
//! Each opened stream gets its own `playbin` whose video sink publishes BGRA
//! frames into the stream's [`FrameSlot`](crate::playback::FrameSlot). A bus
//! thread per stream turns end-of-stream and error messages into
//! [`MediaEvent`]s.
//!
//! [`MediaBackend`]: crate::playback::MediaBackend
//! [`MediaEvent`]: crate::playback::MediaEvent

#[cfg(feature = "video")]
mod backend;
#[cfg(feature = "video")]
mod pipeline;

#[cfg(feature = "video")]
pub use backend::GstMediaBackend;

#[cfg(not(feature = "video"))]
pub use backend_stub::GstMediaBackend;

#[cfg(not(feature = "video"))]
mod backend_stub {
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::playback::{EosToken, MediaBackend, MediaError, MediaEvent, MediaHandle};

    /// Stub backend when the video feature is disabled
    pub struct GstMediaBackend;

    impl GstMediaBackend {
        pub fn new(_events: mpsc::UnboundedSender<MediaEvent>) -> Self {
            log::warn!("Video support not compiled in, wallpapers cannot be played");
            Self
        }
    }

    impl MediaBackend for GstMediaBackend {
        fn open(&mut self, _path: &Path) -> Result<MediaHandle, MediaError> {
            Err(MediaError::Unsupported)
        }

        fn is_ready(&mut self, _handle: &MediaHandle) -> bool {
            false
        }

        fn play(&mut self, _handle: &MediaHandle) -> Result<(), MediaError> {
            Err(MediaError::Unsupported)
        }

        fn pause(&mut self, _handle: &MediaHandle) -> Result<(), MediaError> {
            Err(MediaError::Unsupported)
        }

        fn seek(&mut self, _handle: &MediaHandle, _position: Duration) -> Result<(), MediaError> {
            Err(MediaError::Unsupported)
        }

        fn subscribe_end_of_stream(
            &mut self,
            _handle: &MediaHandle,
        ) -> Result<EosToken, MediaError> {
            Err(MediaError::Unsupported)
        }

        fn unsubscribe(&mut self, _token: EosToken) {}

        fn set_volume(&mut self, _handle: &MediaHandle, _volume: f32) {}

        fn set_muted(&mut self, _handle: &MediaHandle, _muted: bool) {}

        fn close(&mut self, _handle: &MediaHandle) {}
    }
}
