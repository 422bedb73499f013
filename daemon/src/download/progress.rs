use std::path::PathBuf;

/// Smallest progress change worth reporting
const PROGRESS_STEP: f32 = 0.01;

/// Highest value reported before the output is in place
const PROGRESS_CEILING: f32 = 0.99;

/// Turns raw progress readings into a debounced, never-decreasing series
/// that always ends at exactly 1.0.
///
/// The fetch tool restarts at 0% for every stream it downloads, so readings
/// are scaled into the slice of the overall job that the current part owns.
/// Only [`ProgressTracker::finish`] reports 1.0.
#[derive(Debug)]
pub struct ProgressTracker {
    current: f32,
    last_emitted: Option<f32>,
    parts: u32,
    part: Option<u32>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::with_parts(1)
    }
}

impl ProgressTracker {
    /// Tracker for a job expected to download `parts` streams in sequence
    pub fn with_parts(parts: u32) -> Self {
        Self {
            current: 0.0,
            last_emitted: None,
            parts: parts.max(1),
            part: None,
        }
    }

    /// The tool announced the next stream
    pub fn start_part(&mut self) {
        let last = self.parts - 1;
        self.part = Some(self.part.map_or(0, |part| (part + 1).min(last)));
    }

    /// Feed a reading in `[0, 1]` for the current part; returns the overall
    /// value to report, if any
    pub fn observe(&mut self, value: f32) -> Option<f32> {
        if !value.is_finite() {
            return None;
        }
        let done = self.part.unwrap_or(0) as f32 + value.clamp(0.0, 1.0);
        let overall = (done / self.parts as f32).min(PROGRESS_CEILING);
        self.current = self.current.max(overall);

        let due = match self.last_emitted {
            None => true,
            Some(last) => {
                self.current - last >= PROGRESS_STEP
                    || (self.current >= PROGRESS_CEILING && last < PROGRESS_CEILING)
            }
        };
        if due {
            self.last_emitted = Some(self.current);
            Some(self.current)
        } else {
            None
        }
    }

    /// Final report; `None` if 1.0 was already emitted
    pub fn finish(&mut self) -> Option<f32> {
        self.current = 1.0;
        if self.last_emitted == Some(1.0) {
            return None;
        }
        self.last_emitted = Some(1.0);
        Some(1.0)
    }

    #[cfg(test)]
    pub fn current(&self) -> f32 {
        self.current
    }
}

/// Parse `[download]  NN.N% ...` into a fraction
pub(super) fn parse_progress_line(line: &str) -> Option<f32> {
    let rest = line.trim_start().strip_prefix("[download]")?.trim_start();
    let (number, _) = rest.split_once('%')?;
    let percent: f32 = number.trim().parse().ok()?;
    Some(percent / 100.0)
}

/// Whether the tool is starting on another stream
pub(super) fn parse_part_start(line: &str) -> bool {
    line.trim()
        .strip_prefix("[download]")
        .map(str::trim)
        .is_some_and(|rest| {
            rest.starts_with("Destination:") || rest.ends_with("has already been downloaded")
        })
}

/// Extract file paths the tool announces it is writing
pub(super) fn parse_artifact_line(line: &str) -> Option<PathBuf> {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix("[download]") {
        let rest = rest.trim_start();
        if let Some(path) = rest.strip_prefix("Destination:") {
            return non_empty_path(path);
        }
        if let Some(path) = rest.strip_suffix("has already been downloaded") {
            return non_empty_path(path);
        }
        return None;
    }

    if line.starts_with("[Merger]") {
        let (_, path) = line.split_once("Merging formats into")?;
        return non_empty_path(path.trim().trim_matches('"'));
    }

    None
}

fn non_empty_path(path: &str) -> Option<PathBuf> {
    let path = path.trim();
    (!path.is_empty()).then(|| PathBuf::from(path))
}
