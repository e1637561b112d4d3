//! The two reduction strategies and the machinery they share: outcome and
//! error types, and the iteration counter used for resumption.

pub mod byte_diff;
pub mod line_span;

pub use byte_diff::ByteDiffMinimizer;
pub use line_span::LineSpanMinimizer;

use crate::artifact::ArtifactError;
use crate::config::ConfigError;
use crate::executor::ExecutionError;
use crate::input::InputError;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal problems that stop a minimization run.
#[derive(Error, Debug)]
pub enum MinimizeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Cannot resume: {0}")]
    Resume(String),
}

/// How a run ended. Neither variant is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinimizeOutcome {
    Minimized {
        artifact: PathBuf,
        /// Bytes for byte-diff runs, lines for line-span runs.
        size: usize,
        iterations: u64,
    },
    /// No reproducing reduction was found; nothing was written.
    Exhausted { iterations: u64 },
}

impl MinimizeOutcome {
    pub fn artifact(&self) -> Option<&PathBuf> {
        match self {
            MinimizeOutcome::Minimized { artifact, .. } => Some(artifact),
            MinimizeOutcome::Exhausted { .. } => None,
        }
    }
}

/// One slot in the deterministic trial enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialSlot {
    pub index: u64,
    /// The slot lies before the resumption point and must not be executed.
    pub skipped: bool,
}

/// Hands out trial indices in enumeration order; indices below `start_at`
/// come back marked as skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct IterationCounter {
    next: u64,
    start_at: u64,
}

impl IterationCounter {
    pub fn new(start_at: u64) -> Self {
        Self { next: 0, start_at }
    }

    /// Counter that picks up at `next` with nothing left to skip.
    pub fn continuing_from(next: u64) -> Self {
        Self {
            next,
            start_at: next,
        }
    }

    pub fn advance(&mut self) -> TrialSlot {
        let index = self.next;
        self.next += 1;
        TrialSlot {
            index,
            skipped: index < self.start_at,
        }
    }

    /// Index the next call to `advance` will hand out.
    pub fn next_index(&self) -> u64 {
        self.next
    }

    pub fn start_at(&self) -> u64 {
        self.start_at
    }
}
