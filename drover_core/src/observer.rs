use crate::coverage::{DecodeError, read_trace};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// File name prefix the sanitizer uses for its error logs (`asan-error.<pid>`).
pub const SANITIZER_LOG_PREFIX: &str = "asan-error";

#[derive(Error, Debug)]
pub enum ObserverError {
    #[error("Failed to decode coverage trace {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },
    #[error("Failed to remove coverage trace {path:?}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Sanitizer log path for a process inside `dir`.
pub fn sanitizer_log_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("{SANITIZER_LOG_PREFIX}.{pid}"))
}

/// Collects the coverage a sanitizer-instrumented consumer dumped on exit.
///
/// The sanitizer names each trace `<binary>.<pid>.sancov` inside its
/// coverage directory, so traces must be consumed (and removed) before the
/// pid can be reused.
#[derive(Debug, Clone)]
pub struct SancovObserver {
    sanitizer_dir: PathBuf,
    binary_name: String,
}

impl SancovObserver {
    pub fn new(sanitizer_dir: impl Into<PathBuf>, consumer: &str) -> Self {
        let binary_name = Path::new(consumer.trim())
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| consumer.trim().to_string());
        Self {
            sanitizer_dir: sanitizer_dir.into(),
            binary_name,
        }
    }

    pub fn trace_path(&self, pid: u32) -> PathBuf {
        self.sanitizer_dir
            .join(format!("{}.{pid}.sancov", self.binary_name))
    }

    /// Decodes and deletes the trace left by `pid`. `Ok(None)` when the
    /// process did not write one.
    pub fn collect(&self, pid: u32) -> Result<Option<Vec<i64>>, ObserverError> {
        let path = self.trace_path(pid);
        if !path.exists() {
            warn!(pid, ?path, "no coverage trace written");
            return Ok(None);
        }

        let edges = read_trace(&path).map_err(|source| ObserverError::Decode {
            path: path.clone(),
            source,
        })?;
        std::fs::remove_file(&path).map_err(|source| ObserverError::Remove {
            path: path.clone(),
            source,
        })?;

        // With coverage on the sanitizer also logs to its error file; a crash
        // may already have moved it into a bundle.
        discard_stray_log(&sanitizer_log_path(&self.sanitizer_dir, pid));

        debug!(pid, edges = edges.len(), "collected coverage trace");
        Ok(Some(edges))
    }
}

fn discard_stray_log(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(?path, error = %e, "failed to remove sanitizer log"),
    }
}
