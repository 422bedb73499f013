use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;

use super::progress::{
    ProgressTracker, parse_artifact_line, parse_part_start, parse_progress_line,
};
use super::{DownloadError, FetchTool, ProbeResult, probe_best_format};
use crate::catalog::VideoId;
use crate::config::FetchSettings;
use crate::{log_and_continue, remove_file_quietly};

const STDERR_TAIL_LINES: usize = 20;

/// `<format>+bestaudio` fetches the video stream, then the audio stream
const EXPECTED_PARTS: u32 = 2;

/// Requests cancellation of one download
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by a running download
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled
    #[cfg(test)]
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Handle dropped without cancelling
            std::future::pending::<()>().await;
        }
    }
}

/// State of one fetch-tool run; lives only while the download does
#[derive(Debug)]
pub struct DownloadJob {
    pub id: VideoId,
    pub remote_reference: String,
    pub chosen_format_id: String,
    pub target_path: PathBuf,
    pub temp_artifact_paths: BTreeSet<PathBuf>,
    pub progress: f32,
    staging_stem: String,
}

impl DownloadJob {
    fn new(id: VideoId, reference: &str, format_id: &str, target_path: &Path) -> Self {
        let stem = target_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string());
        let staging_stem = format!("{}.part-{:08x}", stem, rand::random::<u32>());

        Self {
            id,
            remote_reference: reference.to_string(),
            chosen_format_id: format_id.to_string(),
            target_path: target_path.to_path_buf(),
            temp_artifact_paths: BTreeSet::new(),
            progress: 0.0,
            staging_stem,
        }
    }

    fn dir(&self) -> &Path {
        self.target_path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn output_template(&self) -> PathBuf {
        self.dir().join(format!("{}.%(ext)s", self.staging_stem))
    }

    /// Files in the target directory carrying this job's staging stem
    fn staged_files(&self) -> Vec<PathBuf> {
        let pattern = format!(
            "{}/{}.*",
            glob::Pattern::escape(&self.dir().to_string_lossy()),
            glob::Pattern::escape(&self.staging_stem)
        );

        match glob::glob(&pattern) {
            Ok(paths) => paths.filter_map(Result::ok).collect(),
            Err(e) => {
                log::warn!("Invalid artifact pattern {}: {}", pattern, e);
                Vec::new()
            }
        }
    }

    /// The finished output among the staged files.
    ///
    /// Intermediates look like `<stem>.f137.mp4` or `<stem>.mp4.part`; the
    /// final file is `<stem>.<ext>`. An extension matching the target wins.
    fn resolve_output(&self) -> Option<PathBuf> {
        let wanted_ext = self.target_path.extension();
        let prefix = format!("{}.", self.staging_stem);

        let mut finals: Vec<PathBuf> = self
            .staged_files()
            .into_iter()
            .filter(|path| path.is_file())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_prefix(&prefix))
                    .is_some_and(|ext| !ext.is_empty() && !ext.contains('.'))
            })
            .collect();
        finals.sort();

        if let Some(exact) = finals.iter().find(|p| p.extension() == wanted_ext) {
            return Some(exact.clone());
        }
        if let Some(first) = finals.into_iter().next() {
            return Some(first);
        }

        // The tool may ignore the template; fall back to what it announced
        self.temp_artifact_paths
            .iter()
            .rev()
            .find(|p| p.is_file() && p.parent() == Some(self.dir()))
            .cloned()
    }
}

/// Drives the fetch tool for probing and downloading
#[derive(Debug, Clone)]
pub struct DownloadOrchestrator {
    settings: FetchSettings,
    cache_dir: PathBuf,
}

impl DownloadOrchestrator {
    pub fn new(settings: FetchSettings, cache_dir: PathBuf) -> Self {
        Self {
            settings,
            cache_dir,
        }
    }

    /// Where the cached file for `id` lives once downloaded
    pub fn target_path(&self, id: &VideoId) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{}", id, self.settings.merge_output_format))
    }

    pub async fn probe(&self, reference: &str) -> Result<ProbeResult, DownloadError> {
        let tool = FetchTool::locate(&self.settings)?;
        probe_best_format(
            &tool,
            reference,
            Duration::from_secs(self.settings.probe_timeout_secs),
        )
        .await
    }

    /// Download `format_id` of `reference` into `target_path`.
    ///
    /// Progress readings are passed to `on_progress` debounced, never
    /// decreasing, and ending with 1.0 on success. On any error every file
    /// this job created in the target directory is removed; files that
    /// existed before the job started are left alone.
    pub async fn download(
        &self,
        id: &VideoId,
        reference: &str,
        format_id: &str,
        target_path: &Path,
        mut on_progress: impl FnMut(f32) + Send,
        cancel: CancelToken,
    ) -> Result<PathBuf, DownloadError> {
        let tool = FetchTool::locate(&self.settings)?;
        let mut job = DownloadJob::new(id.clone(), reference, format_id, target_path);

        std::fs::create_dir_all(job.dir())?;
        let pre_existing = list_dir(job.dir());

        log::info!(
            "Downloading {} (format {}) to {}",
            job.remote_reference,
            job.chosen_format_id,
            job.target_path.display()
        );

        match self
            .run(&tool, &mut job, &mut on_progress, cancel)
            .await
        {
            Ok(path) => {
                log::info!("Download of {} finished", job.id);
                remove_job_files(&job, &pre_existing, Some(&path));
                Ok(path)
            }
            Err(e) => {
                log::warn!("Download of {} failed: {}", job.id, e);
                remove_job_files(&job, &pre_existing, None);
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        tool: &FetchTool,
        job: &mut DownloadJob,
        on_progress: &mut (impl FnMut(f32) + Send),
        mut cancel: CancelToken,
    ) -> Result<PathBuf, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let mut cmd = tool.command();
        cmd.arg("-f")
            .arg(format!("{0}+bestaudio/{0}", job.chosen_format_id))
            .arg("--merge-output-format")
            .arg(&self.settings.merge_output_format)
            .args(["--newline", "--no-playlist", "--no-warnings"])
            .arg("-o")
            .arg(job.output_template())
            .arg(&job.remote_reference)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::FetchToolMissing(
                    tool.program().display().to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("fetch tool stdout unavailable"))?;
        let stderr_tail = child.stderr.take().map(|stderr| tokio::spawn(collect_tail(stderr)));

        let mut tracker = ProgressTracker::with_parts(EXPECTED_PARTS);
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!("Cancelling download of {}", job.id);
                    log_and_continue!(child.kill().await, "kill fetch tool");
                    return Err(DownloadError::Cancelled);
                }
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if parse_part_start(&line) {
                        tracker.start_part();
                    }
                    if let Some(path) = parse_artifact_line(&line) {
                        log::debug!("Fetch tool writing {}", path.display());
                        job.temp_artifact_paths.insert(path);
                    } else if let Some(reading) = parse_progress_line(&line)
                        && let Some(progress) = tracker.observe(reading)
                    {
                        log::debug!("Download {} at {:.0}%", job.id, progress * 100.0);
                        job.progress = progress;
                        on_progress(progress);
                    }
                }
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log_and_continue!(child.kill().await, "kill fetch tool");
                return Err(DownloadError::Cancelled);
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            if let Some(tail) = stderr_tail
                && let Ok(tail) = tail.await
                && !tail.is_empty()
            {
                log::warn!("Fetch tool stderr:\n{}", tail.join("\n"));
            }
            return Err(DownloadError::ProcessFailed(status.code()));
        }

        let output = job
            .resolve_output()
            .ok_or_else(|| DownloadError::OutputMissing(job.target_path.clone()))?;
        if std::fs::metadata(&output)?.len() == 0 {
            return Err(DownloadError::OutputMissing(output));
        }

        if output != job.target_path {
            log::debug!(
                "Moving {} into place at {}",
                output.display(),
                job.target_path.display()
            );
            tokio::fs::rename(&output, &job.target_path).await?;
        }

        if let Some(progress) = tracker.finish() {
            job.progress = progress;
            on_progress(progress);
        }

        Ok(job.target_path.clone())
    }
}

async fn collect_tail(stream: impl AsyncRead + Unpin) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

fn list_dir(dir: &Path) -> HashSet<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
        .unwrap_or_default()
}

/// Remove files the job created, except `keep`; anything present before it
/// started stays
fn remove_job_files(job: &DownloadJob, pre_existing: &HashSet<PathBuf>, keep: Option<&Path>) {
    let created = job
        .staged_files()
        .into_iter()
        .chain(job.temp_artifact_paths.iter().cloned())
        .filter(|path| path.parent() == Some(job.dir()))
        .filter(|path| !pre_existing.contains(path))
        .filter(|path| Some(path.as_path()) != keep)
        .collect::<BTreeSet<_>>();

    for path in &created {
        remove_file_quietly!(path, "download artifact");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tokio::sync::mpsc;

    const HEADER: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; shift; fi
  shift
done
base=$(printf '%s' "$out" | sed 's/\.%(ext)s$//')
"#;

    const SUCCEEDS: &str = r#"
echo "[download] Destination: $base.f137.mp4"
echo "[download]   0.0% of 1.00MiB"
echo "[download]  50.0% of 1.00MiB"
printf 'partial' > "$base.f137.mp4"
echo "[download] 100% of 1.00MiB in 00:01"
echo "[Merger] Merging formats into \"$base.mp4\""
printf 'merged video' > "$base.mp4"
rm "$base.f137.mp4"
"#;

    const KEEPS_INTERMEDIATES: &str = r#"
echo "[download] Destination: $base.f137.mp4"
echo "[download]   0.0% of 1.00MiB"
printf 'video' > "$base.f137.mp4"
echo "[download] 100% of 1.00MiB in 00:01"
echo "[download] Destination: $base.f251.webm"
echo "[download]  50.0% of 0.20MiB"
printf 'audio' > "$base.f251.webm"
echo "[download] 100% of 0.20MiB in 00:01"
echo "[Merger] Merging formats into \"$base.mp4\""
printf 'merged video' > "$base.mp4"
printf 'merged video' > "$base.webm"
"#;

    const FAILS: &str = r#"
echo "[download] Destination: $base.f137.mp4"
printf 'partial' > "$base.f137.mp4.part"
echo "[download]  12.0% of 1.00MiB"
echo "ERROR: connection reset" >&2
exit 2
"#;

    const HANGS: &str = r#"
printf 'partial' > "$base.f137.mp4.part"
echo "[download]  10.0% of 1.00MiB"
exec sleep 30
"#;

    const WRITES_NOTHING: &str = "\nexit 0\n";

    struct Fixture {
        _tools: tempfile::TempDir,
        cache: tempfile::TempDir,
        orchestrator: DownloadOrchestrator,
    }

    fn fixture(body: &str) -> Fixture {
        let tools = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let script = tools.path().join("fake-fetch");
        std::fs::write(&script, format!("{}{}", HEADER, body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let settings = FetchSettings {
            tool: Some(script.display().to_string()),
            ..Default::default()
        };
        let orchestrator = DownloadOrchestrator::new(settings, cache.path().to_path_buf());
        Fixture {
            _tools: tools,
            cache,
            orchestrator,
        }
    }

    fn vid() -> VideoId {
        VideoId::new("abc").unwrap()
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_successful_download_moves_output_into_place() {
        let fx = fixture(SUCCEEDS);
        let target = fx.orchestrator.target_path(&vid());
        let mut progress = Vec::new();

        let path = fx
            .orchestrator
            .download(&vid(), "ref", "137", &target, |p| progress.push(p), CancelToken::never())
            .await
            .unwrap();

        assert_eq!(path, target);
        assert_eq!(std::fs::read(&target).unwrap(), b"merged video");
        assert_eq!(files_in(fx.cache.path()), vec!["abc.mp4"]);
        assert_eq!(progress, vec![0.0, 0.25, 0.5, 1.0]);
    }

    #[tokio::test]
    async fn test_success_sweeps_leftover_intermediates() {
        let fx = fixture(KEEPS_INTERMEDIATES);
        let target = fx.orchestrator.target_path(&vid());
        std::fs::write(fx.cache.path().join("other.mp4"), b"unrelated").unwrap();
        let mut progress = Vec::new();

        let path = fx
            .orchestrator
            .download(&vid(), "ref", "137", &target, |p| progress.push(p), CancelToken::never())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"merged video");
        assert_eq!(files_in(fx.cache.path()), vec!["abc.mp4", "other.mp4"]);
        // Each stream fills half of the bar; completion waits for the merge
        assert_eq!(progress, vec![0.0, 0.5, 0.75, 0.99, 1.0]);
    }

    #[tokio::test]
    async fn test_failed_download_removes_only_job_files() {
        let fx = fixture(FAILS);
        let target = fx.orchestrator.target_path(&vid());
        std::fs::write(&target, b"previous cached copy").unwrap();
        std::fs::write(fx.cache.path().join("other.mp4"), b"unrelated").unwrap();

        let err = fx
            .orchestrator
            .download(&vid(), "ref", "137", &target, |_| {}, CancelToken::never())
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::ProcessFailed(Some(2))));
        assert_eq!(files_in(fx.cache.path()), vec!["abc.mp4", "other.mp4"]);
        assert_eq!(std::fs::read(&target).unwrap(), b"previous cached copy");
    }

    #[tokio::test]
    async fn test_missing_output_is_an_error() {
        let fx = fixture(WRITES_NOTHING);
        let target = fx.orchestrator.target_path(&vid());

        let err = fx
            .orchestrator
            .download(&vid(), "ref", "137", &target, |_| {}, CancelToken::never())
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::OutputMissing(_)));
        assert!(files_in(fx.cache.path()).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_kills_tool_and_cleans_up() {
        let fx = fixture(HANGS);
        let target = fx.orchestrator.target_path(&vid());
        let (handle, token) = CancelHandle::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = vid();
        let download = fx.orchestrator.download(
            &id,
            "ref",
            "137",
            &target,
            move |p| {
                let _ = tx.send(p);
            },
            token,
        );
        let canceller = async {
            rx.recv().await;
            handle.cancel();
        };

        let (result, ()) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(download, canceller)
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert!(files_in(fx.cache.path()).is_empty());
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let cache = tempfile::tempdir().unwrap();
        let settings = FetchSettings {
            tool_name: "loopwall-definitely-missing".to_string(),
            extra_search_dirs: Vec::new(),
            ..Default::default()
        };
        let orchestrator = DownloadOrchestrator::new(settings, cache.path().to_path_buf());

        let err = orchestrator
            .download(
                &vid(),
                "ref",
                "137",
                &orchestrator.target_path(&vid()),
                |_| {},
                CancelToken::never(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::FetchToolMissing(_)));
    }

    #[test]
    fn test_resolve_output_prefers_matching_extension() {
        let cache = tempfile::tempdir().unwrap();
        let job = DownloadJob::new(vid(), "ref", "137", &cache.path().join("abc.mp4"));
        for ext in ["webm", "mp4", "f137.mp4", "mp4.part"] {
            std::fs::write(
                cache.path().join(format!("{}.{}", job.staging_stem, ext)),
                b"x",
            )
            .unwrap();
        }

        let output = job.resolve_output().unwrap();
        assert_eq!(
            output.file_name().unwrap().to_string_lossy(),
            format!("{}.mp4", job.staging_stem)
        );
    }
}
