//! GStreamer pipeline setup and configuration

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::path::Path;

use crate::playback::{FrameSlot, MediaError, VideoFrame};

/// Initialize GStreamer (idempotent, safe to call multiple times)
pub fn initialize_gstreamer() {
    static GSTREAMER_INITIALIZED: std::sync::Once = std::sync::Once::new();

    GSTREAMER_INITIALIZED.call_once(|| {
        gst::init().expect("Failed to initialize GStreamer");
        log::info!("GStreamer initialized");
    });
}

/// Build a `playbin` for `path` whose video ends in a BGRA appsink.
///
/// Audio goes through playbin's own sink so that clips without an audio
/// track still preroll; volume and mute are playbin properties.
pub fn build_pipeline(path: &Path) -> Result<(gst::Pipeline, gst_app::AppSink), MediaError> {
    let open_error = |reason: String| MediaError::Open {
        path: path.display().to_string(),
        reason,
    };

    log::info!("Creating GStreamer pipeline for: {}", path.display());

    let uri = gst::glib::filename_to_uri(path, None)
        .map_err(|e| open_error(format!("not a valid file URI: {}", e)))?;

    let playbin = gst::ElementFactory::make("playbin")
        .name("player")
        .property("uri", uri.as_str())
        .build()
        .map_err(|e| open_error(format!("playbin unavailable: {}", e)))?;

    let video_sink = gst::parse::bin_from_description(
        "videoconvert ! video/x-raw,format=BGRA ! appsink name=sink",
        true,
    )
    .map_err(|e| open_error(format!("failed to build video sink: {}", e)))?;

    let app_sink = video_sink
        .by_name("sink")
        .and_then(|sink| sink.dynamic_cast::<gst_app::AppSink>().ok())
        .ok_or_else(|| open_error("sink is not an AppSink".to_string()))?;

    playbin.set_property("video-sink", &video_sink);

    let pipeline = playbin
        .dynamic_cast::<gst::Pipeline>()
        .map_err(|_| open_error("playbin is not a gst::Pipeline".to_string()))?;

    Ok((pipeline, app_sink))
}

/// Configure AppSink for low-latency video delivery
///
/// - `sync=true`: Proper frame pacing (respects video timestamps)
/// - `max-buffers=1`: Minimal latency
/// - `drop=true`: Let GStreamer drop old frames if queue fills
pub fn configure_app_sink(app_sink: &gst_app::AppSink) {
    app_sink.set_property("emit-signals", true);
    app_sink.set_property("sync", true);
    app_sink.set_property("max-buffers", 1u32);
    app_sink.set_property("drop", true);
}

/// Publish every decoded frame into `slot`
pub fn setup_frame_callback(app_sink: &gst_app::AppSink, slot: FrameSlot) {
    app_sink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                let caps = sample.caps().ok_or(gst::FlowError::Error)?;
                let info =
                    gst_video::VideoInfo::from_caps(caps).map_err(|_| gst::FlowError::Error)?;

                let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                let frame = VideoFrame {
                    width: info.width(),
                    height: info.height(),
                    stride: u32::try_from(info.stride()[0]).unwrap_or(0),
                    data: map.as_slice().to_vec(),
                };
                if frame.is_well_formed() {
                    slot.publish(frame);
                } else {
                    log::trace!(
                        "Dropping malformed {}x{} frame ({} bytes, stride {})",
                        frame.width,
                        frame.height,
                        frame.data.len(),
                        frame.stride
                    );
                }

                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );
}
