use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder in `producerArgs` replaced by the worker's working directory.
pub const OUTDIR_PLACEHOLDER: &str = "<outdir>";
/// Placeholder in `producerArgs` replaced by the number of test cases per cycle.
pub const COUNT_PLACEHOLDER: &str = "<count>";
/// Largest `maxRunTime` whose length in seconds still fits a `u64`.
pub const MAX_RUN_TIME_MINUTES: u64 = u64::MAX / 60;

/// Campaign settings, loaded once at startup and shared read-only by every
/// worker and the aggregator.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    #[serde(default)]
    pub strategy: String,
    pub consumer: String,
    #[serde(default)]
    pub consumer_args: String,
    pub producer: String,
    #[serde(default)]
    pub producer_args: String,
    pub crash_dir: PathBuf,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub coverage: bool,
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Seconds.
    #[serde(default = "default_consumer_timeout")]
    pub consumer_timeout: u64,
    /// Seconds.
    #[serde(default = "default_producer_timeout")]
    pub producer_timeout: u64,
    #[serde(default)]
    pub interesting_strings: Vec<String>,
    /// Minutes, 0 runs forever.
    #[serde(default)]
    pub max_run_time: u64,
    #[serde(default = "default_test_cases_per_cycle")]
    pub test_cases_per_cycle: usize,
    #[serde(default = "default_stats_dir")]
    pub stats_dir: PathBuf,
    #[serde(default = "default_sanitizer_dir")]
    pub sanitizer_dir: PathBuf,
    /// Seconds between two statistics rows.
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
    /// Per-stream cap on captured child output.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

pub fn default_threads() -> usize {
    1
}

fn default_consumer_timeout() -> u64 {
    5
}

fn default_producer_timeout() -> u64 {
    30
}

pub fn default_test_cases_per_cycle() -> usize {
    25
}

fn default_stats_dir() -> PathBuf {
    PathBuf::from(".")
}

pub fn default_sanitizer_dir() -> PathBuf {
    std::env::temp_dir().join("drover-sanitizer")
}

fn default_stats_interval() -> u64 {
    60
}

fn default_max_output_bytes() -> usize {
    8 * 1024 * 1024
}

impl CampaignConfig {
    /// Reads a JSON config, or TOML when the file has a `.toml` extension,
    /// and validates it.
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let config: CampaignConfig = if is_toml {
            toml::from_str(&content).map_err(|e| {
                anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| {
                anyhow::anyhow!("Failed to parse JSON from config file {:?}: {}", path, e)
            })?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.consumer.trim().is_empty() {
            anyhow::bail!("`consumer` must name an executable");
        }
        if self.producer.trim().is_empty() {
            anyhow::bail!("`producer` must name an executable");
        }
        if self.threads == 0 {
            anyhow::bail!("`threads` must be at least 1");
        }
        if self.consumer_timeout == 0 || self.producer_timeout == 0 {
            anyhow::bail!("`consumerTimeout` and `producerTimeout` must be greater than zero");
        }
        if self.test_cases_per_cycle == 0 {
            anyhow::bail!("`testCasesPerCycle` must be at least 1");
        }
        if self.stats_interval == 0 {
            anyhow::bail!("`statsInterval` must be greater than zero");
        }
        if self.max_run_time > MAX_RUN_TIME_MINUTES {
            anyhow::bail!("`maxRunTime` must be at most {MAX_RUN_TIME_MINUTES} minutes");
        }
        if self.max_output_bytes == 0 {
            anyhow::bail!("`maxOutputBytes` must be greater than zero");
        }
        Ok(())
    }

    /// Producer arguments with `<outdir>` and `<count>` filled in.
    pub fn producer_args_for(&self, outdir: &Path, count: usize) -> String {
        self.producer_args
            .replace(OUTDIR_PLACEHOLDER, &outdir.to_string_lossy())
            .replace(COUNT_PLACEHOLDER, &count.to_string())
            .trim()
            .to_string()
    }

    /// Consumer argv for one test case: the split template followed by the path.
    pub fn consumer_argv_for(&self, test_case: &Path) -> Vec<String> {
        self.consumer_args
            .split_whitespace()
            .map(str::to_string)
            .chain(std::iter::once(test_case.to_string_lossy().into_owned()))
            .collect()
    }

    pub fn consumer_timeout(&self) -> Duration {
        Duration::from_secs(self.consumer_timeout)
    }

    pub fn producer_timeout(&self) -> Duration {
        Duration::from_secs(self.producer_timeout)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval)
    }

    /// `None` when the campaign is unbounded.
    pub fn run_budget(&self) -> Option<Duration> {
        match self.max_run_time {
            0 => None,
            minutes => Some(Duration::from_secs(minutes.saturating_mul(60))),
        }
    }

    pub fn stats_file_name(&self) -> String {
        if self.strategy.is_empty() {
            "fuzzstats.csv".to_string()
        } else {
            format!("{}_fuzzstats.csv", self.strategy)
        }
    }

    pub fn stats_path(&self) -> PathBuf {
        self.stats_dir.join(self.stats_file_name())
    }

    /// Sanitizer output directory private to one worker.
    pub fn worker_sanitizer_dir(&self, worker_id: usize) -> PathBuf {
        self.sanitizer_dir.join(format!("worker-{worker_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "consumer": "/usr/bin/target",
        "producer": "/usr/bin/gen",
        "crashDir": "crashes"
    }"#;

    #[test]
    fn minimal_json_fills_in_defaults() {
        let config: CampaignConfig = serde_json::from_str(MINIMAL).unwrap();
        assert_eq!(config.threads, 1);
        assert_eq!(config.consumer_timeout, 5);
        assert_eq!(config.producer_timeout, 30);
        assert_eq!(config.test_cases_per_cycle, 25);
        assert_eq!(config.stats_interval, 60);
        assert_eq!(config.max_run_time, 0);
        assert!(config.interesting_strings.is_empty());
        assert!(!config.coverage);
        assert!(config.run_budget().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn full_json_uses_camel_case_fields() {
        let raw = r#"{
            "strategy": "radamsa",
            "consumer": "./consumer",
            "consumerArgs": "-d",
            "producer": "./producer",
            "producerArgs": "-o <outdir>/case-%n -n <count>",
            "crashDir": "/tmp/crashes",
            "debugMode": true,
            "coverage": true,
            "threads": 4,
            "consumerTimeout": 2,
            "producerTimeout": 10,
            "interestingStrings": ["panic", "assert"],
            "maxRunTime": 15
        }"#;
        let config: CampaignConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.strategy, "radamsa");
        assert_eq!(config.threads, 4);
        assert!(config.debug_mode && config.coverage);
        assert_eq!(config.interesting_strings, vec!["panic", "assert"]);
        assert_eq!(config.run_budget(), Some(Duration::from_secs(15 * 60)));
        assert_eq!(config.stats_file_name(), "radamsa_fuzzstats.csv");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = r#"{"consumer":"a","producer":"b","crashDir":"c","bogus":1}"#;
        assert!(serde_json::from_str::<CampaignConfig>(raw).is_err());
    }

    #[test]
    fn validation_rejects_zero_threads_and_timeouts() {
        let mut config: CampaignConfig = serde_json::from_str(MINIMAL).unwrap();
        config.threads = 0;
        assert!(config.validate().is_err());

        let mut config: CampaignConfig = serde_json::from_str(MINIMAL).unwrap();
        config.consumer_timeout = 0;
        assert!(config.validate().is_err());

        let mut config: CampaignConfig = serde_json::from_str(MINIMAL).unwrap();
        config.producer = "   ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_max_run_time_is_rejected() {
        let json = r#"{"consumer":"a","producer":"b","crashDir":"c","maxRunTime":307445734561825861}"#;
        let config: CampaignConfig = serde_json::from_str(json).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("maxRunTime"));
        // Still no overflow if validation was skipped.
        assert_eq!(config.run_budget(), Some(Duration::from_secs(u64::MAX)));

        let mut config: CampaignConfig = serde_json::from_str(MINIMAL).unwrap();
        config.max_run_time = MAX_RUN_TIME_MINUTES;
        assert!(config.validate().is_ok());
        assert_eq!(
            config.run_budget(),
            Some(Duration::from_secs(MAX_RUN_TIME_MINUTES * 60))
        );
    }

    #[test]
    fn producer_template_substitution() {
        let mut config: CampaignConfig = serde_json::from_str(MINIMAL).unwrap();
        config.producer_args = " -o <outdir> -n <count> --again <outdir> ".to_string();
        let args = config.producer_args_for(Path::new("/tmp/workdir123"), 25);
        assert_eq!(args, "-o /tmp/workdir123 -n 25 --again /tmp/workdir123");
    }

    #[test]
    fn consumer_argv_appends_test_case() {
        let mut config: CampaignConfig = serde_json::from_str(MINIMAL).unwrap();
        config.consumer_args = "--parse  -q".to_string();
        let argv = config.consumer_argv_for(Path::new("/tmp/w/case_1"));
        assert_eq!(argv, vec!["--parse", "-q", "/tmp/w/case_1"]);

        config.consumer_args = String::new();
        let argv = config.consumer_argv_for(Path::new("/tmp/w/case_1"));
        assert_eq!(argv, vec!["/tmp/w/case_1"]);
    }

    #[test]
    fn stats_file_without_strategy() {
        let config: CampaignConfig = serde_json::from_str(MINIMAL).unwrap();
        assert_eq!(config.stats_path(), PathBuf::from("./fuzzstats.csv"));
    }

    #[test]
    fn loads_toml_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("campaign.toml");
        std::fs::write(
            &path,
            "consumer = \"./c\"\nproducer = \"./p\"\ncrashDir = \"out\"\nthreads = 3\n",
        )
        .unwrap();
        let config = CampaignConfig::load_from_file(&path).unwrap();
        assert_eq!(config.threads, 3);
        assert_eq!(config.crash_dir, PathBuf::from("out"));
    }

    #[test]
    fn load_reports_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let err = CampaignConfig::load_from_file(&missing).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        let err = CampaignConfig::load_from_file(&broken).unwrap_err();
        assert!(err.to_string().contains("Failed to parse JSON"));
    }
}
