//! Shrinks a crashing file by deleting spans of lines while the crash
//! still reproduces.
//!
//! The first pass cuts a random number of lines, bounded by a percentage of
//! the remaining tail, at each cursor position. Later passes cut a fixed
//! count. A deletion that still crashes is kept and the cursor stays put;
//! otherwise the cursor moves on. A full pass that removes nothing ends the
//! run. After every trial the exact run position is recorded so an
//! interrupted run can continue with the same decisions.

use super::{IterationCounter, MinimizeError, MinimizeOutcome};
use crate::artifact::{ArtifactStore, LineSpanState};
use crate::config::{LineRipSettings, ProfileSource, TargetProfile};
use crate::input::LineBuffer;
use crate::trial::TrialRunner;
use log::{info, warn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;

/// Upper bound of the coarse cut: `percent` of the remaining lines, at least one.
pub fn coarse_cut_bound(remaining: usize, percent: u32) -> usize {
    (remaining * percent as usize / 100).max(1)
}

/// Number of lines the next trial removes.
///
/// Randomized only on the first pass and only when line-per-line mode is off.
pub fn lines_to_rip<R: Rng + ?Sized>(
    rng: &mut R,
    settings: &LineRipSettings,
    loops: u64,
    total_lines: usize,
    current_line: usize,
) -> usize {
    if loops == 0 && !settings.line_per_line {
        let bound = coarse_cut_bound(total_lines.saturating_sub(current_line), settings.lines_percent);
        rng.random_range(1..=bound)
    } else {
        settings.lines_to_rip.max(1)
    }
}

/// Position inside one pass.
#[derive(Debug, Clone, Copy)]
struct Pass {
    total_lines: usize,
    trials: usize,
    current_line: usize,
}

pub struct LineSpanMinimizer {
    lines: LineBuffer,
    runner: TrialRunner,
    store: ArtifactStore,
    rng: ChaCha8Rng,
    counter: IterationCounter,
    executed: u64,
    loops: u64,
    resume: Option<Pass>,
}

impl LineSpanMinimizer {
    pub fn new(lines: LineBuffer, runner: TrialRunner, store: ArtifactStore, rng: ChaCha8Rng) -> Self {
        Self {
            lines,
            runner,
            store,
            rng,
            counter: IterationCounter::default(),
            executed: 0,
            loops: 0,
            resume: None,
        }
    }

    /// Minimizer whose coarse cuts come from a ChaCha8 stream seeded with `seed`.
    pub fn seeded(lines: LineBuffer, runner: TrialRunner, store: ArtifactStore, seed: u64) -> Self {
        Self::new(lines, runner, store, ChaCha8Rng::seed_from_u64(seed))
    }

    /// Continues an interrupted run from its recorded state.
    ///
    /// The buffer must be the run's checkpoint (or the original input when
    /// no cut was accepted yet) and the random source must carry the seed
    /// of the interrupted run. A buffer of the wrong length is rejected.
    pub fn resume_from(mut self, state: &LineSpanState) -> Result<Self, MinimizeError> {
        if self.lines.len() != state.lines_left {
            return Err(MinimizeError::Resume(format!(
                "buffer has {} line(s), the recorded run left {}",
                self.lines.len(),
                state.lines_left
            )));
        }
        self.rng.set_word_pos(state.rng_word_pos);
        self.counter = IterationCounter::continuing_from(state.next_iteration);
        self.loops = state.loops;
        self.resume = Some(Pass {
            total_lines: state.total_lines,
            trials: state.pass_trials,
            current_line: state.current_line,
        });
        Ok(self)
    }

    pub fn lines(&self) -> &LineBuffer {
        &self.lines
    }

    /// Completed passes over the buffer.
    pub fn loops(&self) -> u64 {
        self.loops
    }

    pub fn trials_executed(&self) -> u64 {
        self.executed
    }

    fn state(&self, pass: &Pass) -> LineSpanState {
        LineSpanState {
            loops: self.loops,
            total_lines: pass.total_lines,
            pass_trials: pass.trials,
            current_line: pass.current_line,
            lines_left: self.lines.len(),
            next_iteration: self.counter.next_index(),
            rng_word_pos: self.rng.get_word_pos(),
        }
    }

    pub fn run(&mut self, source: &dyn ProfileSource) -> Result<MinimizeOutcome, MinimizeError> {
        let mut profile = source.load()?;
        let original_lines = self.lines.len();
        info!(
            "Reducing {original_lines} line(s) with the {} oracle",
            self.runner.oracle_name()
        );
        if self.resume.is_some() {
            info!("Resuming at trial {} in pass {}", self.counter.next_index(), self.loops);
        }

        loop {
            let mut pass = self.resume.take().unwrap_or(Pass {
                total_lines: self.lines.len(),
                trials: 0,
                current_line: 0,
            });
            info!("Pass {} over {} line(s)", self.loops, pass.total_lines);

            while pass.trials < pass.total_lines && pass.current_line < self.lines.len() {
                profile = reload(source, profile);

                let count = lines_to_rip(
                    &mut self.rng,
                    &profile.line_rip,
                    self.loops,
                    pass.total_lines,
                    pass.current_line,
                );
                let slot = self.counter.advance();
                info!(
                    "Trial {}: cutting {count} line(s) at line {}",
                    slot.index, pass.current_line
                );

                let candidate = self.lines.without(pass.current_line, count);
                let report = self.runner.run(&candidate.to_bytes(), &profile, slot.index)?;
                self.executed += 1;
                pass.trials += 1;

                if report.reproduces(profile.timeout_is_crash) {
                    self.lines = candidate;
                    info!("Cut kept, {} line(s) left", self.lines.len());
                    let checkpoint = self.store.write_checkpoint(&self.lines.to_bytes())?;
                    info!("Checkpoint updated at {checkpoint:?}");
                } else {
                    pass.current_line += 1;
                }
                self.store.record_line_span_progress(&self.state(&pass))?;
            }

            self.loops += 1;

            if self.lines.len() == pass.total_lines {
                info!(
                    "Converged from {original_lines} line(s) to {}",
                    self.lines.len()
                );
                let buf = self.lines.to_bytes();
                let artifact = self.store.write_minimized(&buf)?;
                info!("Wrote minimized input to {artifact:?}");
                return Ok(MinimizeOutcome::Minimized {
                    artifact,
                    size: self.lines.len(),
                    iterations: self.counter.next_index(),
                });
            }
        }
    }
}

/// Fresh snapshot of the profile; a broken edit keeps the previous one.
fn reload(source: &dyn ProfileSource, previous: TargetProfile) -> TargetProfile {
    match source.load() {
        Ok(fresh) => {
            if fresh.debug_backend != previous.debug_backend {
                warn!("Changing the debugging interface mid-run has no effect");
            }
            fresh
        }
        Err(e) => {
            warn!("Keeping previous configuration, reload failed: {e}");
            previous
        }
    }
}
