use crate::coverage::CoverageSet;
use crate::stats::{CampaignTotals, StatsLog, StatsRow};
use crate::worker::{CoverageBatch, CycleReport, WorkerError};
use crossbeam_channel::{Receiver, never, select, tick};
use std::io::{self, Write};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("Failed to write statistics: {0}")]
    Stats(#[from] io::Error),
    #[error("Worker {worker_id} failed: {error}")]
    Worker {
        worker_id: usize,
        #[source]
        error: WorkerError,
    },
}

/// A worker's last word before its thread ends.
#[derive(Debug)]
pub struct WorkerFailure {
    pub worker_id: usize,
    pub error: WorkerError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorSettings {
    pub tick: Duration,
    /// `None` runs until the process is stopped.
    pub budget: Option<Duration>,
    pub track_coverage: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    BudgetExhausted,
}

/// Final state handed back once the runtime budget is spent.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignSummary {
    pub elapsed: Duration,
    pub totals: CampaignTotals,
    pub coverage: usize,
    pub rows_written: usize,
}

enum Event {
    Report(Option<CycleReport>),
    Coverage(Option<CoverageBatch>),
    Failure(Option<WorkerFailure>),
    Tick,
}

/// Single owner of the campaign totals and the coverage set.
pub struct Aggregator<W: Write> {
    settings: AggregatorSettings,
    totals: CampaignTotals,
    coverage: CoverageSet,
    stats: StatsLog<W>,
    started: Instant,
    rows_written: usize,
}

impl<W: Write> Aggregator<W> {
    pub fn new(settings: AggregatorSettings, stats: StatsLog<W>) -> Self {
        Self {
            settings,
            totals: CampaignTotals::default(),
            coverage: CoverageSet::new(),
            stats,
            started: Instant::now(),
            rows_written: 0,
        }
    }

    pub fn totals(&self) -> CampaignTotals {
        self.totals
    }

    pub fn coverage_len(&self) -> usize {
        self.coverage.len()
    }

    pub fn record_report(&mut self, report: CycleReport) {
        self.totals.absorb(&report);
    }

    /// Returns how many edges the batch added.
    pub fn record_coverage(&mut self, batch: CoverageBatch) -> usize {
        let new_edges = self.coverage.extend(batch.edges);
        if new_edges > 0 {
            debug!(
                worker = batch.worker_id,
                new_edges,
                total = self.coverage.len(),
                "new coverage"
            );
        }
        new_edges
    }

    pub fn snapshot(&self, elapsed: Duration) -> StatsRow {
        let coverage = self.settings.track_coverage.then(|| self.coverage.len());
        StatsRow::new(elapsed, &self.totals, coverage)
    }

    pub fn tick(&mut self) -> io::Result<TickOutcome> {
        self.tick_at(self.started.elapsed())
    }

    /// Writes and prints the row for `elapsed`, then checks the budget.
    pub fn tick_at(&mut self, elapsed: Duration) -> io::Result<TickOutcome> {
        let row = self.snapshot(elapsed);
        println!("{row}");
        self.stats.append(&row)?;
        self.rows_written += 1;

        match self.settings.budget {
            Some(budget) if elapsed >= budget => {
                info!(?elapsed, ?budget, "Runtime exceeded, exiting...");
                Ok(TickOutcome::BudgetExhausted)
            }
            _ => Ok(TickOutcome::Continue),
        }
    }

    pub fn summary(&self) -> CampaignSummary {
        CampaignSummary {
            elapsed: self.started.elapsed(),
            totals: self.totals,
            coverage: self.coverage.len(),
            rows_written: self.rows_written,
        }
    }

    /// Event loop. Returns when the budget is exhausted or a worker fails.
    pub fn run(
        mut self,
        reports: Receiver<CycleReport>,
        coverage: Receiver<CoverageBatch>,
        failures: Receiver<WorkerFailure>,
    ) -> Result<CampaignSummary, AggregatorError> {
        let ticker = tick(self.settings.tick);
        let (mut reports, mut coverage, mut failures) = (reports, coverage, failures);

        loop {
            let event = select! {
                recv(reports) -> msg => Event::Report(msg.ok()),
                recv(coverage) -> msg => Event::Coverage(msg.ok()),
                recv(failures) -> msg => Event::Failure(msg.ok()),
                recv(ticker) -> _ => Event::Tick,
            };

            // A hung-up channel would be ready forever; park it on `never()`.
            match event {
                Event::Report(Some(report)) => self.record_report(report),
                Event::Report(None) => reports = never(),
                Event::Coverage(Some(batch)) => {
                    self.record_coverage(batch);
                }
                Event::Coverage(None) => coverage = never(),
                Event::Failure(Some(failure)) => {
                    return Err(AggregatorError::Worker {
                        worker_id: failure.worker_id,
                        error: failure.error,
                    });
                }
                Event::Failure(None) => failures = never(),
                Event::Tick => {
                    if self.tick()? == TickOutcome::BudgetExhausted {
                        return Ok(self.summary());
                    }
                }
            }
        }
    }
}
