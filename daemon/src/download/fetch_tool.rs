use std::path::{Path, PathBuf};

use super::DownloadError;
use crate::config::FetchSettings;

/// Resolved location of the fetch tool executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTool {
    program: PathBuf,
}

impl FetchTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Find the tool: explicit config path first, then `PATH`, then the
    /// configured extra directories
    pub fn locate(settings: &FetchSettings) -> Result<Self, DownloadError> {
        if let Some(tool) = &settings.tool {
            let path = PathBuf::from(shellexpand::tilde(tool).as_ref());
            if is_executable(&path) {
                return Ok(Self::new(path));
            }
            log::warn!(
                "Configured fetch tool {} is not executable, searching instead",
                path.display()
            );
        }

        let path_dirs = std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).collect::<Vec<_>>())
            .unwrap_or_default();
        let extra_dirs = settings
            .extra_search_dirs
            .iter()
            .map(|dir| PathBuf::from(shellexpand::tilde(dir).as_ref()));

        path_dirs
            .into_iter()
            .chain(extra_dirs)
            .map(|dir| dir.join(&settings.tool_name))
            .find(|candidate| is_executable(candidate))
            .map(|program| {
                log::debug!("Using fetch tool at {}", program.display());
                Self::new(program)
            })
            .ok_or_else(|| DownloadError::FetchToolMissing(settings.tool_name.clone()))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub(super) fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.stdin(std::process::Stdio::null()).kill_on_drop(true);
        cmd
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
