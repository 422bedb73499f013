//! Custom macros for reducing code repetition in loopwall

/// Log an error and continue execution (non-fatal error handling)
///
/// # Example
/// ```ignore
/// log_and_continue!(store.mark_evicted(&id), "evict stale entry");
/// ```
#[macro_export]
macro_rules! log_and_continue {
    ($expr:expr, $context:expr) => {
        if let Err(e) = $expr {
            log::error!("Failed to {}: {}", $context, e);
        }
    };
}

/// Validate that a string value is one of the allowed variants
///
/// # Example
/// ```ignore
/// validate_enum!(level, "trace", "debug", "info", "warn", "error");
/// ```
#[macro_export]
macro_rules! validate_enum {
    ($value:expr, $($variant:expr),+) => {
        match $value {
            $($variant)|+ => Ok(()),
            _ => anyhow::bail!("Invalid value: {} (expected one of: {})", $value, [$($variant),+].join(", ")),
        }
    };
}

/// Remove a file, treating "already gone" as success and logging anything else
///
/// # Example
/// ```ignore
/// remove_file_quietly!(&partial_path, "partial download");
/// ```
#[macro_export]
macro_rules! remove_file_quietly {
    ($path:expr, $what:expr) => {
        match std::fs::remove_file($path) {
            Ok(()) => log::debug!("Removed {}: {}", $what, $path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {} {}: {}", $what, $path.display(), e),
        }
    };
}
