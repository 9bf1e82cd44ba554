//! One fuzzing worker: produce a batch of test cases, feed each to the
//! consumer, triage findings, report, clean up, repeat.
//!
//! Workers share nothing mutable. Everything they learn travels to the
//! aggregator as `CycleReport` and `CoverageBatch` messages.

use crate::config::CampaignConfig;
use crate::executor::{CommandRunner, RunResult, RunnerError};
use crate::observer::{ObserverError, SANITIZER_LOG_PREFIX, SancovObserver};
use crate::oracle::{OutputOracle, SANITIZER_CRASH_EXIT_CODE, Verdict};
use crate::triage::{Attribution, CrashTriage, TriageError};
use crossbeam_channel::Sender;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable the sanitizer runtime reads its options from.
pub const SANITIZER_OPTIONS_VAR: &str = "ASAN_OPTIONS";

/// Per-cycle summary sent to the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub worker_id: usize,
    pub iterations: usize,
    pub crashes: usize,
    pub interesting: usize,
}

/// Edges decoded from one consumer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageBatch {
    pub worker_id: usize,
    pub edges: Vec<i64>,
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to prepare {path:?}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to list test cases in {path:?}: {source}")]
    ListTestCases {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Producer timed out after {0:?}")]
    ProducerTimedOut(Duration),
    #[error("Producer returned {status}: {stderr}")]
    ProducerFailed { status: i32, stderr: String },
    #[error("Producer left no test cases in {0:?}")]
    NoTestCases(PathBuf),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Triage(#[from] TriageError),
    #[error(transparent)]
    Coverage(#[from] ObserverError),
    #[error("Unable to delete workdir {path:?}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Aggregator is gone")]
    Disconnected,
}

/// `ASAN_OPTIONS` value routing logs (and optionally coverage) into `dir`.
pub fn sanitizer_options(dir: &Path, coverage: bool) -> String {
    let log_path = dir.join(SANITIZER_LOG_PREFIX);
    if coverage {
        format!(
            "log_path='{}':verbosity=0:coverage=1:coverage_dir='{}':exitcode={SANITIZER_CRASH_EXIT_CODE}:abort_on_error=false",
            log_path.display(),
            dir.display()
        )
    } else {
        format!(
            "log_path='{}':verbosity=0:exitcode={SANITIZER_CRASH_EXIT_CODE}:abort_on_error=false",
            log_path.display()
        )
    }
}

/// State that lives for exactly one cycle. Dropping it removes the working
/// directory, so a failed cycle does not leak test cases.
struct WorkerContext {
    workdir: TempDir,
    producer_args: String,
    processed: usize,
    crashes: usize,
    interesting: usize,
}

pub struct Worker {
    id: usize,
    config: Arc<CampaignConfig>,
    sanitizer_dir: PathBuf,
    runner: CommandRunner,
    oracle: OutputOracle,
    triage: CrashTriage,
    observer: Option<SancovObserver>,
    reports: Sender<CycleReport>,
    coverage: Sender<CoverageBatch>,
}

impl Worker {
    pub fn new(
        id: usize,
        config: Arc<CampaignConfig>,
        reports: Sender<CycleReport>,
        coverage: Sender<CoverageBatch>,
    ) -> Self {
        let sanitizer_dir = config.worker_sanitizer_dir(id);
        let runner = CommandRunner::new(config.max_output_bytes).with_env(
            SANITIZER_OPTIONS_VAR,
            sanitizer_options(&sanitizer_dir, config.coverage),
        );
        let observer = config
            .coverage
            .then(|| SancovObserver::new(&sanitizer_dir, &config.consumer));
        Self {
            id,
            oracle: OutputOracle::new(&config.interesting_strings),
            triage: CrashTriage::new(&config.crash_dir, &sanitizer_dir),
            observer,
            runner,
            sanitizer_dir,
            config,
            reports,
            coverage,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Cycles until a fatal error. Returns `Ok(())` once the aggregator has
    /// stopped listening.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        info!(worker = self.id, "worker started");
        loop {
            match self.run_cycle() {
                Ok(_) => {}
                Err(WorkerError::Disconnected) => {
                    debug!(worker = self.id, "aggregator gone, stopping");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One full INIT, PRODUCE, CONSUME, REPORT, CLEANUP pass.
    pub fn run_cycle(&mut self) -> Result<CycleReport, WorkerError> {
        let mut ctx = self.init()?;
        self.produce(&ctx)?;
        self.consume(&mut ctx)?;

        let report = CycleReport {
            worker_id: self.id,
            iterations: ctx.processed,
            crashes: ctx.crashes,
            interesting: ctx.interesting,
        };
        self.reports
            .send(report)
            .map_err(|_| WorkerError::Disconnected)?;

        let path = ctx.workdir.path().to_path_buf();
        ctx.workdir
            .close()
            .map_err(|source| WorkerError::Cleanup { path, source })?;

        debug!(
            worker = self.id,
            iterations = report.iterations,
            crashes = report.crashes,
            interesting = report.interesting,
            "cycle finished"
        );
        Ok(report)
    }

    fn init(&self) -> Result<WorkerContext, WorkerError> {
        fs::create_dir_all(&self.sanitizer_dir).map_err(|source| WorkerError::Workspace {
            path: self.sanitizer_dir.clone(),
            source,
        })?;
        let workdir = tempfile::Builder::new()
            .prefix("workdir")
            .tempdir()
            .map_err(|source| WorkerError::Workspace {
                path: std::env::temp_dir(),
                source,
            })?;
        let producer_args = self
            .config
            .producer_args_for(workdir.path(), self.config.test_cases_per_cycle);
        Ok(WorkerContext {
            workdir,
            producer_args,
            processed: 0,
            crashes: 0,
            interesting: 0,
        })
    }

    fn produce(&self, ctx: &WorkerContext) -> Result<(), WorkerError> {
        let producer = self.config.producer.trim();
        debug!(worker = self.id, "[Producer]: {} {}", producer, ctx.producer_args);

        let timeout = self.config.producer_timeout();
        let result = self.runner.run(producer, &ctx.producer_args, timeout)?;
        if result.timed_out {
            return Err(WorkerError::ProducerTimedOut(timeout));
        }
        if result.status != 0 {
            return Err(WorkerError::ProducerFailed {
                status: result.status,
                stderr: result.stderr,
            });
        }
        Ok(())
    }

    fn consume(&self, ctx: &mut WorkerContext) -> Result<(), WorkerError> {
        let cases = test_cases(ctx.workdir.path())?;
        if cases.is_empty() {
            return Err(WorkerError::NoTestCases(ctx.workdir.path().to_path_buf()));
        }
        for case in &cases {
            self.consume_one(ctx, case)?;
        }
        Ok(())
    }

    fn consume_one(&self, ctx: &mut WorkerContext, case: &Path) -> Result<(), WorkerError> {
        let consumer = self.config.consumer.trim();
        let argv = self.config.consumer_argv_for(case);
        debug!(worker = self.id, "[Consumer]: {} {}", consumer, argv.join(" "));

        let result = self
            .runner
            .run_argv(consumer, &argv, self.config.consumer_timeout())?;
        ctx.processed += 1;

        match self.oracle.examine(&result) {
            Verdict::Crash => {
                self.triage.record(case, &result, Attribution::Sanitizer)?;
                ctx.crashes += 1;
            }
            Verdict::Interesting(pattern) => {
                self.triage.record(case, &result, Attribution::Output)?;
                ctx.interesting += 1;
                debug!(worker = self.id, pattern = %pattern, "interesting output found");
            }
            Verdict::Other(status) => debug!(
                worker = self.id,
                status,
                stderr = %result.stderr,
                stdout = %result.stdout,
                "consumer failed"
            ),
            Verdict::Timeout => debug!(worker = self.id, ?case, "consumer timed out"),
            Verdict::Clean => {}
        }

        self.collect_coverage(&result)
    }

    fn collect_coverage(&self, result: &RunResult) -> Result<(), WorkerError> {
        let Some(observer) = &self.observer else {
            return Ok(());
        };
        if result.timed_out {
            return Ok(());
        }
        if let Some(edges) = observer.collect(result.pid)? {
            self.coverage
                .send(CoverageBatch {
                    worker_id: self.id,
                    edges,
                })
                .map_err(|_| WorkerError::Disconnected)?;
        }
        Ok(())
    }
}

/// Regular files in `dir`, sorted by name, minus sanitizer logs.
fn test_cases(dir: &Path) -> Result<Vec<PathBuf>, WorkerError> {
    let list_err = |source| WorkerError::ListTestCases {
        path: dir.to_path_buf(),
        source,
    };
    let mut cases = Vec::new();
    for entry in fs::read_dir(dir).map_err(list_err)? {
        let entry = entry.map_err(list_err)?;
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(SANITIZER_LOG_PREFIX)
        {
            debug!(file = ?entry.path(), "skipping sanitizer log");
            continue;
        }
        if entry.file_type().map_err(list_err)?.is_file() {
            cases.push(entry.path());
        }
    }
    cases.sort();
    Ok(cases)
}
