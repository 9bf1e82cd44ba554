use crate::aggregator::{Aggregator, AggregatorError, AggregatorSettings, CampaignSummary, WorkerFailure};
use crate::config::CampaignConfig;
use crate::stats::StatsLog;
use crate::worker::{Worker, WorkerError};
use crossbeam_channel::{bounded, unbounded};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// Capacity of the report and coverage channels. Workers block when the
/// aggregator falls this far behind.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Failed to create statistics log {path:?}: {source}")]
    StatsLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write statistics: {0}")]
    StatsWrite(#[source] io::Error),
    #[error("Failed to spawn worker {worker_id}: {source}")]
    Spawn {
        worker_id: usize,
        #[source]
        source: io::Error,
    },
    #[error("Worker {worker_id} failed: {source}")]
    Worker {
        worker_id: usize,
        #[source]
        source: WorkerError,
    },
}

impl From<AggregatorError> for CampaignError {
    fn from(err: AggregatorError) -> Self {
        match err {
            AggregatorError::Stats(source) => CampaignError::StatsWrite(source),
            AggregatorError::Worker { worker_id, error } => CampaignError::Worker {
                worker_id,
                source: error,
            },
        }
    }
}

/// Wires `threads` workers to one aggregator and runs until the budget is
/// spent or a worker fails.
pub struct Campaign {
    config: Arc<CampaignConfig>,
    tick_interval: Duration,
    run_budget: Option<Duration>,
}

impl Campaign {
    pub fn new(config: Arc<CampaignConfig>) -> Self {
        Self {
            tick_interval: config.stats_interval(),
            run_budget: config.run_budget(),
            config,
        }
    }

    /// Overrides `statsInterval`.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Overrides `maxRunTime`. `None` runs forever.
    pub fn run_budget(mut self, budget: Option<Duration>) -> Self {
        self.run_budget = budget;
        self
    }

    pub fn run(&self) -> Result<CampaignSummary, CampaignError> {
        let stats = self.open_stats_log()?;
        let aggregator = Aggregator::new(
            AggregatorSettings {
                tick: self.tick_interval,
                budget: self.run_budget,
                track_coverage: self.config.coverage,
            },
            stats,
        );

        let (report_tx, report_rx) = bounded(CHANNEL_CAPACITY);
        let (coverage_tx, coverage_rx) = bounded(CHANNEL_CAPACITY);
        let (failure_tx, failure_rx) = unbounded();

        info!(
            threads = self.config.threads,
            consumer = %self.config.consumer,
            producer = %self.config.producer,
            budget = ?self.run_budget,
            "starting campaign"
        );

        // Workers are detached. Once the aggregator returns and the receivers
        // drop, each one stops at its next send.
        for worker_id in 1..=self.config.threads {
            let mut worker = Worker::new(
                worker_id,
                Arc::clone(&self.config),
                report_tx.clone(),
                coverage_tx.clone(),
            );
            let failures = failure_tx.clone();
            thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || {
                    if let Err(error) = worker.run() {
                        error!(worker = worker_id, error = %error, "worker failed");
                        let _ = failures.send(WorkerFailure { worker_id, error });
                    }
                })
                .map_err(|source| CampaignError::Spawn { worker_id, source })?;
        }
        drop(report_tx);
        drop(coverage_tx);
        drop(failure_tx);

        let summary = aggregator.run(report_rx, coverage_rx, failure_rx)?;
        info!(
            iterations = summary.totals.iterations,
            crashes = summary.totals.crashes,
            interesting = summary.totals.interesting,
            coverage = summary.coverage,
            "campaign finished"
        );
        Ok(summary)
    }

    fn open_stats_log(&self) -> Result<StatsLog<io::BufWriter<fs::File>>, CampaignError> {
        let path = self.config.stats_path();
        let log_err = |source| CampaignError::StatsLog {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&self.config.stats_dir).map_err(log_err)?;
        StatsLog::create(&path, self.config.coverage).map_err(log_err)
    }
}
