use crate::config::Timeout;
use log::debug;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Placeholder in a command template replaced by the candidate path.
pub const PATH_PLACEHOLDER: &str = "@@";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

const AUTO_TIMEOUT_CEILING: Duration = Duration::from_secs(90);
const AUTO_TIMEOUT_FLOOR: Duration = Duration::from_secs(1);
const AUTO_TIMEOUT_FACTOR: u32 = 4;

/// Failures to run a process at all. These abort the run and are never retried.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Command template is empty")]
    EmptyCommand,

    #[error("Failed to spawn command {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        #[source]
        source: std::io::Error,
    },

    #[error("Error waiting for child process: {0}")]
    Wait(std::io::Error),

    #[error("Failed to kill timed-out process: {0}")]
    Kill(std::io::Error),

    #[error("Candidate path {0:?} is not valid UTF-8")]
    NonUtf8Path(PathBuf),

    #[error("Execution I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ExecutionError {
    fn from(err: std::io::Error) -> Self {
        ExecutionError::Io(err.to_string())
    }
}

/// How a subject process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    TimedOut,
}

impl Termination {
    /// Normalized termination code: exit codes as unsigned 32-bit values,
    /// signals as `128 + signal` the way a shell reports them.
    pub fn code(&self) -> Option<i64> {
        match self {
            Termination::Exited(code) => Some(i64::from(*code as u32)),
            Termination::Signaled(signal) => Some(128 + i64::from(*signal)),
            Termination::TimedOut => None,
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Termination::Signaled(signal);
            }
        }
        // No code and no signal only happens on exotic platforms.
        Termination::Exited(status.code().unwrap_or(-1))
    }
}

#[derive(Debug)]
pub struct ProcessOutcome {
    pub termination: Termination,
    pub elapsed: Duration,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Everything needed to launch one process.
#[derive(Debug, Clone)]
pub struct ProcessSpec<'a> {
    pub argv: &'a [String],
    pub environment: &'a BTreeMap<String, String>,
    pub working_dir: Option<&'a Path>,
    pub timeout: Duration,
}

/// Substitutes the candidate path into a command template and splits it into argv.
///
/// An explicit `@@` wins; without one the path is appended as the last argument.
pub fn render_command(template: &str, candidate: &Path) -> Result<Vec<String>, ExecutionError> {
    if template.trim().is_empty() {
        return Err(ExecutionError::EmptyCommand);
    }
    let path_str = candidate
        .to_str()
        .ok_or_else(|| ExecutionError::NonUtf8Path(candidate.to_path_buf()))?;

    if template.contains(PATH_PLACEHOLDER) {
        return Ok(template
            .split_whitespace()
            .map(|part| part.replace(PATH_PLACEHOLDER, path_str))
            .collect());
    }
    let mut argv: Vec<String> = template.split_whitespace().map(String::from).collect();
    argv.push(path_str.to_string());
    Ok(argv)
}

/// Launches processes with a hard wall-clock limit.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        CommandExecutor
    }

    /// Runs `spec` to completion or until its timeout, killing it in the latter case.
    ///
    /// Output goes to anonymous temp files rather than pipes so a chatty
    /// subject can never block on a full pipe.
    pub fn run(&self, spec: &ProcessSpec<'_>) -> Result<ProcessOutcome, ExecutionError> {
        let (program, args) = spec.argv.split_first().ok_or(ExecutionError::EmptyCommand)?;

        let mut stdout_sink = tempfile::tempfile()?;
        let mut stderr_sink = tempfile::tempfile()?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(spec.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_sink.try_clone()?))
            .stderr(Stdio::from(stderr_sink.try_clone()?));
        if let Some(cwd) = spec.working_dir {
            cmd.current_dir(cwd);
        }

        let start_time = Instant::now();
        let child = cmd.spawn().map_err(|source| ExecutionError::Spawn {
            command: spec.argv.to_vec(),
            source,
        })?;

        let termination = match self.wait_with_timeout(child, spec.timeout)? {
            Some(status) => Termination::from_status(status),
            None => Termination::TimedOut,
        };
        let elapsed = start_time.elapsed();

        Ok(ProcessOutcome {
            termination,
            elapsed,
            stdout: drain(&mut stdout_sink)?,
            stderr: drain(&mut stderr_sink)?,
        })
    }

    /// `None` means the child outlived `timeout` and was killed.
    fn wait_with_timeout(
        &self,
        mut child: Child,
        timeout: Duration,
    ) -> Result<Option<ExitStatus>, ExecutionError> {
        let start_time = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(Some(status)),
                Ok(None) => {
                    if start_time.elapsed() > timeout {
                        debug!("Target timed out after {timeout:?}, killing...");
                        if let Err(e) = child.kill() {
                            // The child may have exited between the poll and the kill.
                            if let Ok(Some(status)) = child.try_wait() {
                                return Ok(Some(status));
                            }
                            return Err(ExecutionError::Kill(e));
                        }
                        child.wait().map_err(ExecutionError::Wait)?;
                        return Ok(None);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(ExecutionError::Wait(e)),
            }
        }
    }

    /// Runs an operator hook through `sh -c` and waits for it.
    ///
    /// A non-zero hook exit is reported but does not fail the trial.
    pub fn run_hook(
        &self,
        command: &str,
        environment: &BTreeMap<String, String>,
        working_dir: Option<&Path>,
    ) -> Result<Option<i32>, ExecutionError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).envs(environment).stdin(Stdio::null());
        if let Some(cwd) = working_dir {
            cmd.current_dir(cwd);
        }
        let status = cmd.status().map_err(|source| ExecutionError::Spawn {
            command: vec!["sh".into(), "-c".into(), command.into()],
            source,
        })?;
        Ok(status.code())
    }
}

fn drain(sink: &mut File) -> Result<Vec<u8>, ExecutionError> {
    let mut buf = Vec::new();
    sink.seek(SeekFrom::Start(0))?;
    sink.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Turns a configured `Timeout` into a concrete per-run budget.
///
/// For `Timeout::Auto` the budget tracks the slowest completed run seen so
/// far, scaled and clamped; before any observation it is the ceiling.
#[derive(Debug, Default, Clone)]
pub struct TimeoutClock {
    longest_run: Option<Duration>,
}

impl TimeoutClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn budget(&self, timeout: Timeout) -> Duration {
        match timeout {
            Timeout::Seconds(secs) => Duration::from_secs(secs),
            Timeout::Auto => match self.longest_run {
                None => AUTO_TIMEOUT_CEILING,
                Some(longest) => (longest * AUTO_TIMEOUT_FACTOR)
                    .clamp(AUTO_TIMEOUT_FLOOR, AUTO_TIMEOUT_CEILING),
            },
        }
    }

    /// Records a run that finished on its own.
    pub fn observe(&mut self, termination: Termination, elapsed: Duration) {
        if termination == Termination::TimedOut {
            return;
        }
        self.longest_run = Some(self.longest_run.map_or(elapsed, |d| d.max(elapsed)));
    }
}
