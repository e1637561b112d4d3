use crate::config::TargetProfile;
use crate::executor::{CommandExecutor, ExecutionError};
use crate::oracle::Verdict;
use log::{debug, warn};
use std::path::Path;

/// Per-trial information handed to observers.
#[derive(Debug, Clone, Copy)]
pub struct TrialContext<'a> {
    pub profile: &'a TargetProfile,
    pub iteration: u64,
}

/// An `Observer` takes part in every trial around the oracle call.
///
/// `pre_exec` runs before the subject starts, `post_exec` after it ends,
/// and `reset` once the trial's verdict has been settled. Observers can
/// contribute crash evidence of their own through `reports_crash`, which
/// is read between `post_exec` and `reset`.
pub trait Observer: Send {
    fn name(&self) -> &'static str;

    fn pre_exec(&mut self, ctx: &TrialContext<'_>) -> Result<(), ExecutionError>;

    fn post_exec(&mut self, ctx: &TrialContext<'_>, verdict: &Verdict)
    -> Result<(), ExecutionError>;

    fn reset(&mut self, ctx: &TrialContext<'_>) -> Result<(), ExecutionError>;

    fn reports_crash(&self) -> bool {
        false
    }
}

/// Runs the profile's pre/post shell hooks, each gated by its own interval
/// over the iteration counter.
#[derive(Debug, Default)]
pub struct HookObserver {
    executor: CommandExecutor,
}

impl HookObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn run_gated(
        &self,
        ctx: &TrialContext<'_>,
        command: Option<&str>,
        interval: u64,
        stage: &str,
    ) -> Result<(), ExecutionError> {
        let Some(command) = command else {
            return Ok(());
        };
        if ctx.iteration % interval.max(1) != 0 {
            return Ok(());
        }
        debug!("Running {stage}-command {command}");
        let profile = ctx.profile;
        match self
            .executor
            .run_hook(command, &profile.environment, profile.working_dir.as_deref())?
        {
            Some(0) => {}
            Some(code) => warn!("{stage}-command {command:?} exited with code {code}"),
            None => warn!("{stage}-command {command:?} was terminated by a signal"),
        }
        Ok(())
    }
}

impl Observer for HookObserver {
    fn name(&self) -> &'static str {
        "HookObserver"
    }

    fn pre_exec(&mut self, ctx: &TrialContext<'_>) -> Result<(), ExecutionError> {
        let profile = ctx.profile;
        self.run_gated(ctx, profile.pre_command.as_deref(), profile.pre_interval, "pre")
    }

    fn post_exec(
        &mut self,
        ctx: &TrialContext<'_>,
        _verdict: &Verdict,
    ) -> Result<(), ExecutionError> {
        let profile = ctx.profile;
        self.run_gated(ctx, profile.post_command.as_deref(), profile.post_interval, "post")
    }

    fn reset(&mut self, _ctx: &TrialContext<'_>) -> Result<(), ExecutionError> {
        Ok(())
    }
}

/// Watches the profile's crash-marker directory, where an external detector
/// drops files when it sees a crash.
///
/// The directory is emptied before and after every trial so evidence never
/// leaks from one trial into the next.
#[derive(Debug, Default)]
pub struct CrashMarkerObserver {
    evidence: bool,
}

impl CrashMarkerObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn clear(dir: &Path) -> Result<(), ExecutionError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            debug!("Removing crash marker {path:?}");
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn has_markers(dir: &Path) -> Result<bool, ExecutionError> {
        match std::fs::read_dir(dir) {
            Ok(mut entries) => Ok(entries.next().is_some()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Observer for CrashMarkerObserver {
    fn name(&self) -> &'static str {
        "CrashMarkerObserver"
    }

    fn pre_exec(&mut self, ctx: &TrialContext<'_>) -> Result<(), ExecutionError> {
        self.evidence = false;
        match &ctx.profile.crash_marker_path {
            Some(dir) => Self::clear(dir),
            None => Ok(()),
        }
    }

    fn post_exec(
        &mut self,
        ctx: &TrialContext<'_>,
        _verdict: &Verdict,
    ) -> Result<(), ExecutionError> {
        self.evidence = match &ctx.profile.crash_marker_path {
            Some(dir) => Self::has_markers(dir)?,
            None => false,
        };
        Ok(())
    }

    fn reset(&mut self, ctx: &TrialContext<'_>) -> Result<(), ExecutionError> {
        self.evidence = false;
        match &ctx.profile.crash_marker_path {
            Some(dir) => Self::clear(dir),
            None => Ok(()),
        }
    }

    fn reports_crash(&self) -> bool {
        self.evidence
    }
}
