use crate::executor::RunResult;
use crate::observer::sanitizer_log_path;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Filesystem failures while persisting a finding. All of them are fatal:
/// a finding that cannot be saved must not be silently dropped.
#[derive(Error, Debug)]
pub enum TriageError {
    #[error("Failed to create crash directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to copy {from:?} to {to:?}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to remove sanitizer log {path:?}: {source}")]
    RemoveLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0:?} is not a regular file")]
    NotAFile(PathBuf),
}

/// Whether the sanitizer's log belongs in the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    Sanitizer,
    Output,
}

/// Writes one self-contained directory per finding under the crash root:
///
/// ```text
/// <crash_dir>/<id>/<test case>
/// <crash_dir>/<id>/<id>.stdout
/// <crash_dir>/<id>/<id>.stderr
/// <crash_dir>/<id>/asan-error.<pid>     (sanitizer crashes only)
/// ```
#[derive(Debug, Clone)]
pub struct CrashTriage {
    crash_dir: PathBuf,
    sanitizer_dir: PathBuf,
}

impl CrashTriage {
    pub fn new(crash_dir: impl Into<PathBuf>, sanitizer_dir: impl Into<PathBuf>) -> Self {
        Self {
            crash_dir: crash_dir.into(),
            sanitizer_dir: sanitizer_dir.into(),
        }
    }

    pub fn crash_dir(&self) -> &Path {
        &self.crash_dir
    }

    /// Persists the bundle and returns its directory.
    pub fn record(
        &self,
        test_case: &Path,
        result: &RunResult,
        attribution: Attribution,
    ) -> Result<PathBuf, TriageError> {
        create_dir(&self.crash_dir)?;

        let id = artifact_id();
        let bundle = self.crash_dir.join(&id);
        create_dir(&bundle)?;

        let name = test_case
            .file_name()
            .ok_or_else(|| TriageError::NotAFile(test_case.to_path_buf()))?;
        copy_regular(test_case, &bundle.join(name))?;

        write(&bundle.join(format!("{id}.stdout")), &result.stdout)?;
        write(&bundle.join(format!("{id}.stderr")), &result.stderr)?;

        if attribution == Attribution::Sanitizer {
            self.move_sanitizer_log(result.pid, &bundle)?;
        }

        info!(bundle = ?bundle, pid = result.pid, status = result.status, "saved finding");
        Ok(bundle)
    }

    fn move_sanitizer_log(&self, pid: u32, bundle: &Path) -> Result<(), TriageError> {
        let log = sanitizer_log_path(&self.sanitizer_dir, pid);
        if !log.exists() {
            warn!(pid, ?log, "sanitizer crash without a sanitizer log");
            return Ok(());
        }
        let name = log
            .file_name()
            .ok_or_else(|| TriageError::NotAFile(log.clone()))?;
        copy_regular(&log, &bundle.join(name))?;
        fs::remove_file(&log).map_err(|source| TriageError::RemoveLog { path: log, source })
    }
}

/// Random v4 UUID, lowercase hex grouped 8-4-4-4-12.
pub fn artifact_id() -> String {
    Uuid::new_v4().to_string()
}

fn create_dir(path: &Path) -> Result<(), TriageError> {
    fs::create_dir_all(path).map_err(|source| TriageError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, contents: &str) -> Result<(), TriageError> {
    fs::write(path, contents).map_err(|source| TriageError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn copy_regular(from: &Path, to: &Path) -> Result<(), TriageError> {
    let copy_err = |source| TriageError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };
    let meta = fs::metadata(from).map_err(copy_err)?;
    if !meta.is_file() {
        return Err(TriageError::NotAFile(from.to_path_buf()));
    }
    fs::copy(from, to).map_err(copy_err)?;
    Ok(())
}
