use crate::config::{ConfigError, TargetProfile};
use crate::executor::ExecutionError;
use crate::observer::{CrashMarkerObserver, HookObserver, Observer, TrialContext};
use crate::oracle::{CrashOracle, Verdict, build_oracle};
use std::io::Write;

/// Outcome of one executed trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialReport {
    pub iteration: u64,
    pub verdict: Verdict,
    /// An observer (the crash-marker directory) saw evidence of a crash.
    pub marker_evidence: bool,
}

impl TrialReport {
    /// Whether this trial still reproduces the crash.
    pub fn reproduces(&self, timeout_is_crash: bool) -> bool {
        self.marker_evidence || self.verdict.is_crash(timeout_is_crash)
    }
}

/// Materializes candidates and runs them through observers and the oracle.
pub struct TrialRunner {
    oracle: Box<dyn CrashOracle>,
    observers: Vec<Box<dyn Observer>>,
}

impl TrialRunner {
    /// Runner with the standard observers. Stale markers are cleared before
    /// the pre-hook runs, and the post-hook finishes before the marker
    /// directory is inspected.
    pub fn new(oracle: Box<dyn CrashOracle>) -> Self {
        Self::with_observers(
            oracle,
            vec![
                Box::new(CrashMarkerObserver::new()),
                Box::new(HookObserver::new()),
            ],
        )
    }

    /// Observers are nested around the oracle: `pre_exec` runs in list
    /// order, `post_exec` in reverse.
    pub fn with_observers(oracle: Box<dyn CrashOracle>, observers: Vec<Box<dyn Observer>>) -> Self {
        Self { oracle, observers }
    }

    pub fn from_profile(profile: &TargetProfile) -> Result<Self, ConfigError> {
        Ok(Self::new(build_oracle(profile)?))
    }

    pub fn oracle_name(&self) -> &'static str {
        self.oracle.name()
    }

    /// Writes `candidate` to a fresh temp file carrying the profile's
    /// extension, runs one trial on it and removes the file again.
    pub fn run(
        &mut self,
        candidate: &[u8],
        profile: &TargetProfile,
        iteration: u64,
    ) -> Result<TrialReport, ExecutionError> {
        let mut temp_file = tempfile::Builder::new()
            .prefix("whittle-")
            .suffix(&crate::artifact::file_suffix(&profile.extension))
            .tempfile()?;
        temp_file.write_all(candidate)?;
        temp_file.flush()?;

        let ctx = TrialContext { profile, iteration };
        let outcome = self.observe_and_run(&ctx, temp_file.path());

        // Stale markers must not reach the next trial, whatever happened here.
        let mut reset_error = None;
        for obs in self.observers.iter_mut() {
            if let Err(e) = obs.reset(&ctx) {
                reset_error.get_or_insert(e);
            }
        }
        temp_file.close()?;

        let report = outcome?;
        match reset_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn observe_and_run(
        &mut self,
        ctx: &TrialContext<'_>,
        path: &std::path::Path,
    ) -> Result<TrialReport, ExecutionError> {
        for obs in self.observers.iter_mut() {
            obs.pre_exec(ctx)?;
        }
        let verdict = self.oracle.run(path, ctx.profile)?;
        for obs in self.observers.iter_mut().rev() {
            obs.post_exec(ctx, &verdict)?;
        }
        let marker_evidence = self.observers.iter().any(|obs| obs.reports_crash());
        Ok(TrialReport {
            iteration: ctx.iteration,
            verdict,
            marker_evidence,
        })
    }
}
