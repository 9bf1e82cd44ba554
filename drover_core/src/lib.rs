pub mod aggregator;
pub mod campaign;
pub mod config;
pub mod coverage;
pub mod executor;
pub mod observer;
pub mod oracle;
pub mod stats;
pub mod triage;
pub mod worker;

pub use aggregator::{Aggregator, AggregatorError, AggregatorSettings, CampaignSummary};
pub use campaign::{Campaign, CampaignError};
pub use config::CampaignConfig;
pub use coverage::{CoverageSet, DecodeError, TraceReader, TraceWidth};
pub use executor::{CommandRunner, RunResult, RunnerError};
pub use observer::{ObserverError, SancovObserver};
pub use oracle::{OutputOracle, Verdict};
pub use stats::{CampaignTotals, StatsLog, StatsRow};
pub use triage::{Attribution, CrashTriage, TriageError};
pub use worker::{CoverageBatch, CycleReport, Worker, WorkerError};
