use std::ffi::OsString;
use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors raised while launching or reaping a child process.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to spawn command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("Error waiting for child {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("Failed to capture {stream} of child {pid}")]
    Capture { pid: u32, stream: &'static str },
}

/// Outcome of one external process execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `128 + signal` for signal deaths on unix, `-1` otherwise.
    pub status: i32,
    pub timed_out: bool,
    pub pid: u32,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.status == 0 && !self.timed_out
    }
}

/// Runs external commands with a deadline and captures their output.
///
/// The environment given at construction is added on top of the inherited
/// one for every child, so concurrent runners never have to touch the
/// process-wide environment.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    envs: Vec<(OsString, OsString)>,
    max_output_bytes: usize,
}

impl CommandRunner {
    pub fn new(max_output_bytes: usize) -> Self {
        Self {
            envs: Vec::new(),
            max_output_bytes,
        }
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Splits `args` on whitespace and runs `command` with them.
    pub fn run(&self, command: &str, args: &str, timeout: Duration) -> Result<RunResult, RunnerError> {
        let argv: Vec<&str> = args.split_whitespace().collect();
        self.run_argv(command, &argv, timeout)
    }

    pub fn run_argv<S: AsRef<str>>(
        &self,
        command: &str,
        argv: &[S],
        timeout: Duration,
    ) -> Result<RunResult, RunnerError> {
        let mut cmd = Command::new(command);
        cmd.args(argv.iter().map(AsRef::as_ref))
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a timeout can take grandchildren down too.
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let pid = child.id();

        let stdout_reader = child
            .stdout
            .take()
            .map(|pipe| spawn_capture(pipe, self.max_output_bytes));
        let stderr_reader = child
            .stderr
            .take()
            .map(|pipe| spawn_capture(pipe, self.max_output_bytes));

        let (exit_status, timed_out) = wait_with_timeout(&mut child, timeout)?;

        let stdout = join_capture(stdout_reader, pid, "stdout")?;
        let stderr = join_capture(stderr_reader, pid, "stderr")?;

        Ok(RunResult {
            stdout,
            stderr,
            status: normalize_status(exit_status),
            timed_out,
            pid,
        })
    }
}

/// Polls the child until it exits or the deadline passes. On timeout the
/// child is killed and reaped; the returned flag is `true`.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool), RunnerError> {
    let start_time = Instant::now();
    let pid = child.id();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok((status, false)),
            Ok(None) => {
                if start_time.elapsed() >= timeout {
                    debug!(pid, ?timeout, "command timed out, killing");
                    kill_tree(child);
                    let status = child
                        .wait()
                        .map_err(|source| RunnerError::Wait { pid, source })?;
                    return Ok((status, true));
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(source) => return Err(RunnerError::Wait { pid, source }),
        }
    }
}

fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: signalling a process group we created; no memory is touched.
            let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
            if rc == 0 {
                return;
            }
        }
    }
    if let Err(e) = child.kill() {
        warn!(pid = child.id(), error = %e, "failed to kill timed-out child");
    }
}

#[cfg(unix)]
fn normalize_status(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

#[cfg(not(unix))]
fn normalize_status(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn spawn_capture<R: Read + Send + 'static>(pipe: R, cap: usize) -> JoinHandle<io::Result<String>> {
    thread::spawn(move || capture_capped(pipe, cap))
}

fn join_capture(
    handle: Option<JoinHandle<io::Result<String>>>,
    pid: u32,
    stream: &'static str,
) -> Result<String, RunnerError> {
    match handle {
        None => Ok(String::new()),
        Some(handle) => match handle.join() {
            Ok(Ok(text)) => Ok(text),
            _ => Err(RunnerError::Capture { pid, stream }),
        },
    }
}

/// Reads the whole stream, keeping at most `cap` bytes. Anything past the cap
/// is drained so the child never blocks on a full pipe.
fn capture_capped<R: Read>(mut pipe: R, cap: usize) -> io::Result<String> {
    let mut kept = Vec::new();
    let mut dropped: u64 = 0;
    let mut chunk = [0u8; 8192];

    loop {
        let n = match pipe.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let room = cap.saturating_sub(kept.len());
        let take = room.min(n);
        kept.extend_from_slice(&chunk[..take]);
        dropped += (n - take) as u64;
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if dropped > 0 {
        text.push_str(&format!("\n[... truncated {dropped} bytes]"));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_keeps_everything_under_the_cap() {
        let text = capture_capped(&b"hello world"[..], 64).unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn capture_truncates_and_marks() {
        let data = vec![b'a'; 100];
        let text = capture_capped(&data[..], 10).unwrap();
        assert_eq!(text, format!("{}\n[... truncated 90 bytes]", "a".repeat(10)));
    }

    #[test]
    fn capture_is_lossy_on_invalid_utf8() {
        let text = capture_capped(&[0x66, 0xff, 0x6f][..], 64).unwrap();
        assert_eq!(text, "f\u{fffd}o");
    }

    #[test]
    fn cmd_exec_invalid_command() {
        let runner = CommandRunner::new(1024);
        let err = runner
            .run(
                "./this_command_does_not_exist_ever_12345.sh",
                "",
                Duration::from_secs(1),
            )
            .unwrap_err();
        match err {
            RunnerError::Spawn { command, .. } => {
                assert!(command.contains("this_command_does_not_exist_ever_12345"))
            }
            other => panic!("Expected Spawn error, got {other:?}"),
        }
    }
}
