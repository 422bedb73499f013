use serde::Deserialize;
use std::cmp::Ordering;
use std::time::Duration;

use super::{DownloadError, FetchTool};

/// One format as reported by the fetch tool's JSON dump
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatCandidate {
    pub format_id: String,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default)]
    pub vbr: Option<f64>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub filesize_approx: Option<u64>,
}

impl FormatCandidate {
    fn has_video(&self) -> bool {
        match self.vcodec.as_deref() {
            Some("none") => false,
            Some(_) => true,
            None => self.width.is_some() && self.height.is_some(),
        }
    }

    fn area(&self) -> u64 {
        u64::from(self.width.unwrap_or(0)) * u64::from(self.height.unwrap_or(0))
    }

    fn bitrate(&self) -> f64 {
        self.vbr.or(self.tbr).unwrap_or(0.0)
    }

    /// Lexicographic (area, frame rate, bitrate)
    fn rank(&self, other: &Self) -> Ordering {
        self.area()
            .cmp(&other.area())
            .then_with(|| self.fps.unwrap_or(0.0).total_cmp(&other.fps.unwrap_or(0.0)))
            .then_with(|| self.bitrate().total_cmp(&other.bitrate()))
    }
}

/// The chosen encoding
#[derive(Debug, Clone, PartialEq)]
pub struct BestFormat {
    pub format_id: String,
    pub width: u32,
    pub height: u32,
    pub approx_size_bytes: Option<u64>,
}

/// Metadata gathered while probing a reference
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Id the fetch tool assigned to the video
    pub video_id: Option<String>,
    pub title: Option<String>,
    pub best: BestFormat,
}

#[derive(Deserialize)]
struct ProbeDocument {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    formats: Vec<FormatCandidate>,
}

/// Pick the video-bearing candidate with the largest (area, fps, bitrate).
///
/// Ties go to the candidate listed last.
pub fn select_best_format(candidates: &[FormatCandidate]) -> Option<&FormatCandidate> {
    candidates
        .iter()
        .filter(|c| c.has_video())
        .max_by(|a, b| a.rank(b))
}

/// Ask the fetch tool for the format list of `reference` and choose one
pub async fn probe_best_format(
    tool: &FetchTool,
    reference: &str,
    timeout: Duration,
) -> Result<ProbeResult, DownloadError> {
    log::info!("Probing formats for {}", reference);

    let mut cmd = tool.command();
    cmd.args(["-J", "--no-playlist", "--no-warnings", reference]);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            DownloadError::FormatResolutionFailed(format!(
                "probe timed out after {}s",
                timeout.as_secs()
            ))
        })??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        log::warn!("Probe of {} failed: {}", reference, stderr.trim());
        return Err(DownloadError::ProcessFailed(output.status.code()));
    }

    parse_probe_output(&output.stdout)
}

fn parse_probe_output(stdout: &[u8]) -> Result<ProbeResult, DownloadError> {
    let document: ProbeDocument =
        serde_json::from_slice(stdout).map_err(|e| DownloadError::Probe(e.to_string()))?;

    let best = select_best_format(&document.formats).ok_or_else(|| {
        DownloadError::FormatResolutionFailed(format!(
            "none of {} formats carries video",
            document.formats.len()
        ))
    })?;

    log::debug!(
        "Selected format {} ({}x{} @ {:?}fps)",
        best.format_id,
        best.width.unwrap_or(0),
        best.height.unwrap_or(0),
        best.fps
    );

    Ok(ProbeResult {
        video_id: document.id,
        title: document.title,
        best: BestFormat {
            format_id: best.format_id.clone(),
            width: best.width.unwrap_or(0),
            height: best.height.unwrap_or(0),
            approx_size_bytes: best.filesize.or(best.filesize_approx),
        },
    })
}
