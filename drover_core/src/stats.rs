use crate::worker::CycleReport;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

const BASE_COLUMNS: [&str; 5] = [
    "Runtime(seconds)",
    "Iterations",
    "Iterations/Second",
    "Crashes",
    "Interesting",
];
const COVERAGE_COLUMN: &str = "Coverage";

/// Cumulative counters for the whole campaign. Never reset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CampaignTotals {
    pub iterations: u64,
    pub crashes: u64,
    pub interesting: u64,
}

impl CampaignTotals {
    pub fn absorb(&mut self, report: &CycleReport) {
        self.iterations += report.iterations as u64;
        self.crashes += report.crashes as u64;
        self.interesting += report.interesting as u64;
    }
}

/// One periodic snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsRow {
    pub runtime: Duration,
    pub iterations: u64,
    pub iterations_per_sec: f64,
    pub crashes: u64,
    pub interesting: u64,
    pub coverage: Option<usize>,
}

impl StatsRow {
    pub fn new(runtime: Duration, totals: &CampaignTotals, coverage: Option<usize>) -> Self {
        let secs = runtime.as_secs_f64();
        let iterations_per_sec = if secs > 0.0 {
            totals.iterations as f64 / secs
        } else {
            0.0
        };
        Self {
            runtime,
            iterations: totals.iterations,
            iterations_per_sec,
            crashes: totals.crashes,
            interesting: totals.interesting,
            coverage,
        }
    }

    pub fn csv_record(&self) -> String {
        let mut record = format!(
            "{:.3},{},{:.3},{},{}",
            self.runtime.as_secs_f64(),
            self.iterations,
            self.iterations_per_sec,
            self.crashes,
            self.interesting
        );
        if let Some(coverage) = self.coverage {
            record.push_str(&format!(",{coverage}"));
        }
        record
    }
}

/// Console form, runtime rounded to whole minutes as `HH:MM`.
impl fmt::Display for StatsRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let minutes = (self.runtime.as_secs() + 30) / 60;
        write!(
            f,
            "runtime:{:02}:{:02} iterations:{} iter/sec:{:.3} crashes:{} interesting:{}",
            minutes / 60,
            minutes % 60,
            self.iterations,
            self.iterations_per_sec,
            self.crashes,
            self.interesting
        )?;
        if let Some(coverage) = self.coverage {
            write!(f, " coverage:{coverage}")?;
        }
        Ok(())
    }
}

/// Append-only CSV statistics log. Every row is flushed as it is written.
pub struct StatsLog<W: Write> {
    out: W,
    with_coverage: bool,
}

impl StatsLog<BufWriter<File>> {
    pub fn create(path: &Path, with_coverage: bool) -> io::Result<Self> {
        Self::new(BufWriter::new(File::create(path)?), with_coverage)
    }
}

impl<W: Write> StatsLog<W> {
    /// Writes the header immediately.
    pub fn new(out: W, with_coverage: bool) -> io::Result<Self> {
        let mut log = Self { out, with_coverage };
        let mut header = BASE_COLUMNS.join(",");
        if with_coverage {
            header.push(',');
            header.push_str(COVERAGE_COLUMN);
        }
        writeln!(log.out, "{header}")?;
        log.out.flush()?;
        Ok(log)
    }

    pub fn append(&mut self, row: &StatsRow) -> io::Result<()> {
        debug_assert_eq!(row.coverage.is_some(), self.with_coverage);
        writeln!(self.out, "{}", row.csv_record())?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
