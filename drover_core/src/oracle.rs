use crate::executor::RunResult;

/// Exit code the sanitizer is configured to use when it detects a memory error.
pub const SANITIZER_CRASH_EXIT_CODE: i32 = 42;

/// How one consumer run is treated. Only `Crash` and `Interesting` produce
/// artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Crash,
    /// Carries the configured string that matched.
    Interesting(String),
    /// Non-zero exit that is neither a sanitizer crash nor interesting.
    Other(i32),
    Timeout,
    Clean,
}

impl Verdict {
    pub fn is_finding(&self) -> bool {
        matches!(self, Verdict::Crash | Verdict::Interesting(_))
    }
}

/// Classifies consumer runs by exit status and output.
#[derive(Debug, Clone, Default)]
pub struct OutputOracle {
    /// Original spelling, lowercased spelling.
    interesting: Vec<(String, String)>,
}

impl OutputOracle {
    pub fn new<S: AsRef<str>>(interesting: &[S]) -> Self {
        let interesting = interesting
            .iter()
            .map(AsRef::as_ref)
            .filter(|s| !s.is_empty())
            .map(|s| (s.to_string(), s.to_lowercase()))
            .collect();
        Self { interesting }
    }

    /// First match wins: sanitizer crash, interesting output, other non-zero
    /// exit, timeout, clean.
    pub fn examine(&self, result: &RunResult) -> Verdict {
        if result.status == SANITIZER_CRASH_EXIT_CODE {
            return Verdict::Crash;
        }
        if let Some(found) = self.find_interesting(&result.stdout, &result.stderr) {
            return Verdict::Interesting(found.to_string());
        }
        if result.status != 0 {
            return Verdict::Other(result.status);
        }
        if result.timed_out {
            return Verdict::Timeout;
        }
        Verdict::Clean
    }

    fn find_interesting(&self, stdout: &str, stderr: &str) -> Option<&str> {
        if self.interesting.is_empty() {
            return None;
        }
        let stdout = stdout.to_lowercase();
        let stderr = stderr.to_lowercase();
        self.interesting
            .iter()
            .find(|(_, lowered)| stderr.contains(lowered.as_str()) || stdout.contains(lowered.as_str()))
            .map(|(original, _)| original.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(status: i32, stdout: &str, stderr: &str, timed_out: bool) -> RunResult {
        RunResult {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            status,
            timed_out,
            pid: 1000,
        }
    }

    #[test]
    fn interesting_match_ignores_case() {
        let oracle = OutputOracle::new(&["panic"]);
        assert_eq!(
            oracle.examine(&run(0, "PANIC: oops", "", false)),
            Verdict::Interesting("panic".to_string())
        );
    }

    #[test]
    fn interesting_match_checks_stderr_and_substrings() {
        let oracle = OutputOracle::new(&["Assertion Failed"]);
        assert_eq!(
            oracle.examine(&run(0, "", "main.c:12: assertion failed: x > 0", false)),
            Verdict::Interesting("Assertion Failed".to_string())
        );
    }

    #[test]
    fn sanitizer_exit_code_wins_over_interesting_output() {
        let oracle = OutputOracle::new(&["panic"]);
        let verdict = oracle.examine(&run(SANITIZER_CRASH_EXIT_CODE, "panic here", "", false));
        assert_eq!(verdict, Verdict::Crash);
        assert!(verdict.is_finding());
    }

    #[test]
    fn interesting_output_wins_over_non_zero_exit() {
        let oracle = OutputOracle::new(&["leak"]);
        assert!(matches!(
            oracle.examine(&run(1, "", "LEAK detected", false)),
            Verdict::Interesting(_)
        ));
    }

    #[test]
    fn non_zero_exit_is_other() {
        let oracle = OutputOracle::new(&["panic"]);
        let verdict = oracle.examine(&run(3, "fine", "", false));
        assert_eq!(verdict, Verdict::Other(3));
        assert!(!verdict.is_finding());
    }

    #[test]
    fn timed_out_run_is_never_a_finding() {
        let oracle = OutputOracle::new(&["panic"]);
        let killed = oracle.examine(&run(137, "", "", true));
        assert_eq!(killed, Verdict::Other(137));
        assert!(!killed.is_finding());
        assert_eq!(oracle.examine(&run(0, "", "", true)), Verdict::Timeout);
    }

    #[test]
    fn clean_run_and_empty_patterns() {
        let oracle = OutputOracle::new(&[""]);
        assert_eq!(oracle.examine(&run(0, "anything", "", false)), Verdict::Clean);
        let oracle = OutputOracle::new::<&str>(&[]);
        assert_eq!(oracle.examine(&run(0, "", "", false)), Verdict::Clean);
    }
}
