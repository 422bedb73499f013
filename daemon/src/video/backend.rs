use gstreamer as gst;
use gstreamer::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::pipeline;
use crate::playback::{EosToken, MediaBackend, MediaError, MediaEvent, MediaHandle, StreamId};

/// How long the bus thread blocks before checking for shutdown
const BUS_POLL: gst::ClockTime = gst::ClockTime::from_mseconds(100);

struct GstStream {
    pipeline: gst::Pipeline,
    eos: Arc<Mutex<Option<EosToken>>>,
    closing: Arc<AtomicBool>,
}

/// Media backend decoding with GStreamer, one pipeline per stream
pub struct GstMediaBackend {
    events: mpsc::UnboundedSender<MediaEvent>,
    streams: HashMap<StreamId, GstStream>,
    next_id: u64,
    next_serial: u64,
}

impl GstMediaBackend {
    pub fn new(events: mpsc::UnboundedSender<MediaEvent>) -> Self {
        pipeline::initialize_gstreamer();
        Self {
            events,
            streams: HashMap::new(),
            next_id: 0,
            next_serial: 0,
        }
    }

    fn stream(&self, handle: &MediaHandle) -> Result<&GstStream, MediaError> {
        self.streams
            .get(&handle.id)
            .ok_or(MediaError::UnknownStream(handle.id))
    }

    fn set_state(&self, handle: &MediaHandle, state: gst::State) -> Result<(), MediaError> {
        self.stream(handle)?
            .pipeline
            .set_state(state)
            .map(|_| ())
            .map_err(|e| MediaError::Backend(format!("{} -> {:?}: {}", handle.id, state, e)))
    }

    fn spawn_bus_watch(&self, id: StreamId, stream: &GstStream) -> Result<(), MediaError> {
        let bus = stream
            .pipeline
            .bus()
            .ok_or_else(|| MediaError::Backend("pipeline has no bus".to_string()))?;
        let eos = Arc::clone(&stream.eos);
        let closing = Arc::clone(&stream.closing);
        let events = self.events.clone();

        std::thread::Builder::new()
            .name(format!("gst-bus-{}", id.0))
            .spawn(move || {
                while !closing.load(Ordering::Acquire) {
                    let Some(msg) = bus.timed_pop(BUS_POLL) else {
                        continue;
                    };
                    match msg.view() {
                        gst::MessageView::Eos(_) => {
                            let token = eos.lock().ok().and_then(|mut t| t.take());
                            if let Some(token) = token {
                                let _ = events.send(MediaEvent::EndOfStream { token });
                            }
                        }
                        gst::MessageView::Error(err) => {
                            let _ = events.send(MediaEvent::Error {
                                stream: id,
                                message: format!("{} (debug: {:?})", err.error(), err.debug()),
                            });
                        }
                        _ => {}
                    }
                }
                log::trace!("Bus watch for {} exiting", id);
            })
            .map_err(|e| MediaError::Backend(format!("failed to spawn bus thread: {}", e)))?;

        Ok(())
    }
}

impl MediaBackend for GstMediaBackend {
    fn open(&mut self, path: &Path) -> Result<MediaHandle, MediaError> {
        let (pipeline, app_sink) = pipeline::build_pipeline(path)?;
        pipeline::configure_app_sink(&app_sink);

        self.next_id += 1;
        let handle = MediaHandle::new(StreamId(self.next_id));
        pipeline::setup_frame_callback(&app_sink, handle.frames.clone());

        let stream = GstStream {
            pipeline,
            eos: Arc::new(Mutex::new(None)),
            closing: Arc::new(AtomicBool::new(false)),
        };
        self.spawn_bus_watch(handle.id, &stream)?;

        // Preroll so readiness can be polled
        if let Err(e) = stream.pipeline.set_state(gst::State::Paused) {
            stream.closing.store(true, Ordering::Release);
            let _ = stream.pipeline.set_state(gst::State::Null);
            return Err(MediaError::Open {
                path: path.display().to_string(),
                reason: e.to_string(),
            });
        }

        self.streams.insert(handle.id, stream);
        Ok(handle)
    }

    fn is_ready(&mut self, handle: &MediaHandle) -> bool {
        let Ok(stream) = self.stream(handle) else {
            return false;
        };
        let (result, current, _pending) = stream.pipeline.state(gst::ClockTime::ZERO);
        result.is_ok() && matches!(current, gst::State::Paused | gst::State::Playing)
    }

    fn play(&mut self, handle: &MediaHandle) -> Result<(), MediaError> {
        self.set_state(handle, gst::State::Playing)
    }

    fn pause(&mut self, handle: &MediaHandle) -> Result<(), MediaError> {
        self.set_state(handle, gst::State::Paused)
    }

    fn seek(&mut self, handle: &MediaHandle, position: Duration) -> Result<(), MediaError> {
        self.stream(handle)?
            .pipeline
            .seek_simple(
                gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT,
                gst::ClockTime::from_nseconds(position.as_nanos() as u64),
            )
            .map_err(|e| MediaError::Backend(format!("seek failed: {}", e)))
    }

    fn subscribe_end_of_stream(&mut self, handle: &MediaHandle) -> Result<EosToken, MediaError> {
        self.next_serial += 1;
        let token = EosToken {
            stream: handle.id,
            serial: self.next_serial,
        };
        let stream = self.stream(handle)?;
        let mut slot = stream
            .eos
            .lock()
            .map_err(|_| MediaError::Backend("end-of-stream slot poisoned".to_string()))?;
        *slot = Some(token);
        Ok(token)
    }

    fn unsubscribe(&mut self, token: EosToken) {
        if let Some(stream) = self.streams.get(&token.stream)
            && let Ok(mut slot) = stream.eos.lock()
            && *slot == Some(token)
        {
            *slot = None;
        }
    }

    fn set_volume(&mut self, handle: &MediaHandle, volume: f32) {
        if let Ok(stream) = self.stream(handle) {
            stream
                .pipeline
                .set_property("volume", f64::from(volume.clamp(0.0, 1.0)));
        }
    }

    fn set_muted(&mut self, handle: &MediaHandle, muted: bool) {
        if let Ok(stream) = self.stream(handle) {
            stream.pipeline.set_property("mute", muted);
        }
    }

    fn close(&mut self, handle: &MediaHandle) {
        if let Some(stream) = self.streams.remove(&handle.id) {
            stream.closing.store(true, Ordering::Release);
            if let Err(e) = stream.pipeline.set_state(gst::State::Null) {
                log::warn!("Failed to shut down {}: {}", handle.id, e);
            }
            log::debug!("Closed {}", handle.id);
        }
    }
}

impl Drop for GstMediaBackend {
    fn drop(&mut self) {
        for (_, stream) in self.streams.drain() {
            stream.closing.store(true, Ordering::Release);
            let _ = stream.pipeline.set_state(gst::State::Null);
        }
    }
}
