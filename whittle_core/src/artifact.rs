use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File stem of the line-mode checkpoint, overwritten after every accepted reduction.
pub const CHECKPOINT_STEM: &str = "last_minimized";

/// Name of the resumption record kept next to the artifacts.
pub const PROGRESS_FILE: &str = "progress.json";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Artifact I/O error: {0}")]
    Io(String),

    #[error("Progress record serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for ArtifactError {
    fn from(err: std::io::Error) -> Self {
        ArtifactError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ArtifactError {
    fn from(err: serde_json::Error) -> Self {
        ArtifactError::Serialization(err.to_string())
    }
}

impl From<tempfile::PersistError> for ArtifactError {
    fn from(err: tempfile::PersistError) -> Self {
        ArtifactError::Io(err.error.to_string())
    }
}

/// Turns a configured extension into a file suffix: `pdf` and `.pdf` both give `.pdf`.
pub fn file_suffix(extension: &str) -> String {
    if extension.is_empty() || extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{extension}")
    }
}

/// Lowercase hex SHA-1 of `data`.
pub fn content_hash(data: &[u8]) -> String {
    format!("{:x}", Sha1::digest(data))
}

/// Where a run stands, so an interrupted run can pick up where it left off.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RunProgress {
    pub algorithm: String,
    /// First iteration index that has not been executed yet.
    pub next_iteration: u64,
    /// Seed of the line-mode random source, when one was used.
    pub seed: Option<u64>,
    /// Exact position of a line-span run, present for that algorithm only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_span: Option<LineSpanState>,
}

/// Where a line-span run stands between two trials.
///
/// Together with the checkpoint file and the seed this is enough to
/// continue the run exactly where it stopped.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSpanState {
    /// Completed passes.
    pub loops: u64,
    /// Buffer length at the start of the current pass.
    pub total_lines: usize,
    /// Trials already spent in the current pass.
    pub pass_trials: usize,
    pub current_line: usize,
    /// Buffer length after the last accepted cut; must match the checkpoint.
    pub lines_left: usize,
    pub next_iteration: u64,
    /// Word position of the ChaCha8 stream.
    pub rng_word_pos: u128,
}

/// Output directory holding final artifacts, the checkpoint and the progress record.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    out_dir: PathBuf,
    suffix: String,
    seed: Option<u64>,
}

impl ArtifactStore {
    /// Opens `out_dir`, creating it if needed.
    pub fn new(out_dir: impl Into<PathBuf>, extension: &str) -> Result<Self, ArtifactError> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir)?;
        Ok(Self {
            out_dir,
            suffix: file_suffix(extension),
            seed: None,
        })
    }

    /// Records `seed` in every progress update.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn minimized_path(&self, data: &[u8]) -> PathBuf {
        self.out_dir
            .join(format!("{}{}", content_hash(data), self.suffix))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.out_dir.join(format!("{CHECKPOINT_STEM}{}", self.suffix))
    }

    /// Writes a final artifact under its content-derived name.
    pub fn write_minimized(&self, data: &[u8]) -> Result<PathBuf, ArtifactError> {
        let path = self.minimized_path(data);
        self.write_atomic(&path, data)?;
        Ok(path)
    }

    /// Overwrites the checkpoint with the latest accepted reduction.
    pub fn write_checkpoint(&self, data: &[u8]) -> Result<PathBuf, ArtifactError> {
        let path = self.checkpoint_path();
        self.write_atomic(&path, data)?;
        Ok(path)
    }

    pub fn record_progress(&self, algorithm: &str, next_iteration: u64) -> Result<(), ArtifactError> {
        self.write_progress(&RunProgress {
            algorithm: algorithm.to_string(),
            next_iteration,
            seed: self.seed,
            line_span: None,
        })
    }

    pub fn record_line_span_progress(&self, state: &LineSpanState) -> Result<(), ArtifactError> {
        self.write_progress(&RunProgress {
            algorithm: String::from("line-span"),
            next_iteration: state.next_iteration,
            seed: self.seed,
            line_span: Some(*state),
        })
    }

    fn write_progress(&self, progress: &RunProgress) -> Result<(), ArtifactError> {
        let json = serde_json::to_vec_pretty(progress)?;
        self.write_atomic(&self.out_dir.join(PROGRESS_FILE), &json)
    }

    /// Reads a progress record left in `out_dir`, if there is one.
    pub fn load_progress(out_dir: &Path) -> Result<Option<RunProgress>, ArtifactError> {
        let path = out_dir.join(PROGRESS_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Readers never observe a half-written file.
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), ArtifactError> {
        let mut staged = tempfile::NamedTempFile::new_in(&self.out_dir)?;
        staged.write_all(data)?;
        staged.flush()?;
        staged.persist(path)?;
        Ok(())
    }
}
