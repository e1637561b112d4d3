use crate::config::{ConfigError, DebugBackend, TargetProfile};
use crate::executor::{
    CommandExecutor, ExecutionError, ProcessSpec, Termination, TimeoutClock, render_command,
};
use log::debug;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};

/// Synthetic code reported when a debugger backend observes a memory-safety violation.
pub const ACCESS_VIOLATION: i64 = 0xC000_0005;

/// Code reported for a panicking in-process harness (`128 + SIGABRT`).
pub const HARNESS_PANIC: i64 = 134;

/// Termination codes that always count as a crash.
const FATAL_CODES: &[(i64, &str)] = &[
    (132, "SIGILL"),
    (133, "SIGTRAP"),
    (134, "SIGABRT"),
    (135, "SIGBUS"),
    (136, "SIGFPE"),
    (138, "SIGBUS"),
    (139, "SIGSEGV"),
    (0xC000_0005, "EXCEPTION_ACCESS_VIOLATION"),
    (0xC000_001D, "EXCEPTION_ILLEGAL_INSTRUCTION"),
    (0xC000_0094, "EXCEPTION_INT_DIVIDE_BY_ZERO"),
    (0xC000_00FD, "EXCEPTION_STACK_OVERFLOW"),
    (0xC000_0374, "STATUS_HEAP_CORRUPTION"),
    (0xC000_0409, "STATUS_STACK_BUFFER_OVERRUN"),
];

/// Signals that gdb reports for a memory-safety violation or abort.
const GDB_FATAL_SIGNALS: &[&str] = &["SIGSEGV", "SIGBUS", "SIGILL", "SIGFPE", "SIGABRT"];

/// Fatal signal named by one of gdb's own stop reports, such as
/// `Program received signal SIGSEGV, Segmentation fault.` or
/// `Thread 1 "target" received signal SIGABRT, Aborted.`
///
/// Lines that do not start the way gdb words these reports are ignored, so
/// the subject's own output cannot pass for one.
pub fn gdb_fatal_signal(transcript: &str) -> Option<&'static str> {
    transcript.lines().find_map(|line| {
        if !(line.starts_with("Program ") || line.starts_with("Thread ")) {
            return None;
        }
        let rest = [" received signal ", " terminated with signal "]
            .iter()
            .find_map(|report| line.split_once(report).map(|(_, rest)| rest))?;
        let name = rest.split([',', '.', ' ']).next()?;
        GDB_FATAL_SIGNALS.iter().copied().find(|fatal| *fatal == name)
    })
}

/// Classification of one subject run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    NoCrash,
    Crashed(i64),
    TimedOut,
}

impl Verdict {
    pub fn is_crash(&self, timeout_is_crash: bool) -> bool {
        match self {
            Verdict::Crashed(_) => true,
            Verdict::TimedOut => timeout_is_crash,
            Verdict::NoCrash => false,
        }
    }
}

/// Human-readable name for a fatal termination code, if it is in the table.
pub fn signal_name(code: i64) -> Option<&'static str> {
    FATAL_CODES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, name)| *name)
}

/// Maps a termination to a verdict using the fatal-code table plus the
/// profile's extra `crash_signal`.
///
/// `crash_signal` matches the normalized code, and for signal terminations
/// also the raw signal number or its negation.
pub fn classify(termination: Termination, crash_signal: Option<i64>) -> Verdict {
    let Some(code) = termination.code() else {
        return Verdict::TimedOut;
    };
    if signal_name(code).is_some() {
        return Verdict::Crashed(code);
    }
    if let Some(extra) = crash_signal {
        let raw_signal_matches = match termination {
            Termination::Signaled(signal) => {
                let signal = i64::from(signal);
                extra == signal || extra == -signal
            }
            _ => false,
        };
        if extra == code || raw_signal_matches {
            return Verdict::Crashed(code);
        }
    }
    Verdict::NoCrash
}

/// Decides whether a materialized candidate makes the subject crash.
///
/// Implementations run one candidate per call and must not keep state that
/// changes the verdict for identical inputs, apart from timeout tuning.
pub trait CrashOracle: Send {
    fn name(&self) -> &'static str;

    /// Runs the subject on `candidate` as described by `profile`.
    ///
    /// Returns `Err` only when the subject cannot be run at all.
    fn run(&mut self, candidate: &Path, profile: &TargetProfile) -> Result<Verdict, ExecutionError>;
}

/// Runs the subject directly and classifies its exit status.
#[derive(Debug, Default)]
pub struct NativeOracle {
    executor: CommandExecutor,
    clock: TimeoutClock,
}

impl NativeOracle {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CrashOracle for NativeOracle {
    fn name(&self) -> &'static str {
        "native"
    }

    fn run(&mut self, candidate: &Path, profile: &TargetProfile) -> Result<Verdict, ExecutionError> {
        let argv = render_command(&profile.command, candidate)?;
        let outcome = self.executor.run(&ProcessSpec {
            argv: &argv,
            environment: &profile.environment,
            working_dir: profile.working_dir.as_deref(),
            timeout: self.clock.budget(profile.timeout),
        })?;
        self.clock.observe(outcome.termination, outcome.elapsed);

        if !outcome.stderr.is_empty() {
            debug!("subject stderr: {}", String::from_utf8_lossy(&outcome.stderr));
        }
        Ok(classify(outcome.termination, profile.crash_signal))
    }
}

/// Runs the subject under `gdb -batch` and looks for a fatal signal report.
#[derive(Debug)]
pub struct GdbOracle {
    gdb_path: PathBuf,
    executor: CommandExecutor,
    clock: TimeoutClock,
}

impl GdbOracle {
    pub fn new(gdb_path: impl Into<PathBuf>) -> Self {
        Self {
            gdb_path: gdb_path.into(),
            executor: CommandExecutor::new(),
            clock: TimeoutClock::new(),
        }
    }

    fn debugger_argv(&self, subject: Vec<String>) -> Vec<String> {
        let mut argv = vec![
            self.gdb_path.to_string_lossy().into_owned(),
            "-q".into(),
            "-nx".into(),
            "-batch".into(),
            "-ex".into(),
            "run".into(),
            "--args".into(),
        ];
        argv.extend(subject);
        argv
    }
}

impl CrashOracle for GdbOracle {
    fn name(&self) -> &'static str {
        "gdb"
    }

    fn run(&mut self, candidate: &Path, profile: &TargetProfile) -> Result<Verdict, ExecutionError> {
        let argv = self.debugger_argv(render_command(&profile.command, candidate)?);
        let outcome = self.executor.run(&ProcessSpec {
            argv: &argv,
            environment: &profile.environment,
            working_dir: profile.working_dir.as_deref(),
            timeout: self.clock.budget(profile.timeout),
        })?;
        self.clock.observe(outcome.termination, outcome.elapsed);

        if outcome.termination == Termination::TimedOut {
            return Ok(Verdict::TimedOut);
        }
        // gdb writes its stop reports to stdout.
        let transcript = String::from_utf8_lossy(&outcome.stdout);
        debug!("gdb transcript: {transcript}");
        debug!("gdb stderr: {}", String::from_utf8_lossy(&outcome.stderr));
        if let Some(signal) = gdb_fatal_signal(&transcript) {
            debug!("gdb reported {signal}");
            Ok(Verdict::Crashed(ACCESS_VIOLATION))
        } else {
            Ok(Verdict::NoCrash)
        }
    }
}

/// Calls a Rust harness with the candidate bytes; a panic counts as a crash.
pub struct InProcessOracle<F>
where
    F: FnMut(&[u8]) + Send,
{
    harness_fn: F,
}

impl<F> InProcessOracle<F>
where
    F: FnMut(&[u8]) + Send,
{
    pub fn new(harness_fn: F) -> Self {
        Self { harness_fn }
    }
}

impl<F> CrashOracle for InProcessOracle<F>
where
    F: FnMut(&[u8]) + Send,
{
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn run(&mut self, candidate: &Path, _profile: &TargetProfile) -> Result<Verdict, ExecutionError> {
        let data = std::fs::read(candidate)?;
        let harness = &mut self.harness_fn;
        match catch_unwind(AssertUnwindSafe(|| harness(&data))) {
            Ok(()) => Ok(Verdict::NoCrash),
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                debug!("harness panicked: {msg}");
                Ok(Verdict::Crashed(HARNESS_PANIC))
            }
        }
    }
}

/// Picks the oracle implementation named by the profile's `debug_backend`.
pub fn build_oracle(profile: &TargetProfile) -> Result<Box<dyn CrashOracle>, ConfigError> {
    match &profile.debug_backend {
        DebugBackend::Native => Ok(Box::new(NativeOracle::new())),
        DebugBackend::Gdb { gdb_path } => Ok(Box::new(GdbOracle::new(gdb_path.clone()))),
        other => Err(ConfigError::UnsupportedBackend(other.name().to_string())),
    }
}
