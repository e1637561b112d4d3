use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while resolving a `TargetProfile` from a configuration source.
///
/// All of these are fatal and surface before any trial runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse TOML from config file {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Section '{section}' does not exist (available: {available:?})")]
    UnknownSection {
        section: String,
        available: Vec<String>,
    },

    #[error("No '{field}' specified in section '{section}'")]
    MissingField {
        section: String,
        field: &'static str,
    },

    #[error("Invalid value for '{field}' in section '{section}': {reason}")]
    InvalidField {
        section: String,
        field: &'static str,
        reason: String,
    },

    #[error("Debugging interface '{0}' is not supported on this build")]
    UnsupportedBackend(String),
}

pub fn default_timeout_secs() -> u64 {
    90
}

fn default_interval() -> u64 {
    1
}

fn default_lines_to_rip() -> usize {
    1
}

fn default_lines_percent() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

pub fn default_gdb_path() -> PathBuf {
    PathBuf::from("gdb")
}

/// How long a single subject run may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Seconds(u64),
    /// Derive the budget from observed run times.
    Auto,
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::Seconds(default_timeout_secs())
    }
}

/// Which crash oracle implementation drives the subject.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DebugBackend {
    /// Classify the subject's own termination code.
    #[default]
    Native,
    Gdb {
        gdb_path: PathBuf,
    },
    Vtrace,
    Pykd {
        mode: String,
        windbg_path: Option<PathBuf>,
        exploitable_path: Option<PathBuf>,
    },
}

impl DebugBackend {
    pub fn name(&self) -> &'static str {
        match self {
            DebugBackend::Native => "native",
            DebugBackend::Gdb { .. } => "gdb",
            DebugBackend::Vtrace => "vtrace",
            DebugBackend::Pykd { .. } => "pykd",
        }
    }
}

/// Tunables for the line-span minimizer. Re-read on every trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRipSettings {
    /// Skip the randomized coarse first pass.
    pub line_per_line: bool,
    /// Lines removed per trial in the fine-grained passes.
    pub lines_to_rip: usize,
    /// Upper bound of the coarse cut, as a percentage of the remaining tail.
    pub lines_percent: u32,
    pub strip_empty_lines: bool,
}

impl Default for LineRipSettings {
    fn default() -> Self {
        Self {
            line_per_line: false,
            lines_to_rip: default_lines_to_rip(),
            lines_percent: default_lines_percent(),
            strip_empty_lines: true,
        }
    }
}

/// Fully-defaulted description of how to run one subject program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProfile {
    pub section: String,
    /// Command template; `@@` marks the candidate path, otherwise it is appended.
    pub command: String,
    pub extension: String,
    pub timeout: Timeout,
    pub pre_command: Option<String>,
    pub pre_interval: u64,
    pub post_command: Option<String>,
    pub post_interval: u64,
    pub environment: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub crash_signal: Option<i64>,
    pub crash_marker_path: Option<PathBuf>,
    pub timeout_is_crash: bool,
    pub debug_backend: DebugBackend,
    pub line_rip: LineRipSettings,
    /// Recognized legacy keys that have no effect here.
    pub ignored_keys: Vec<&'static str>,
}

impl TargetProfile {
    /// Builds a profile with every optional field at its default.
    pub fn new(command: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            section: String::from("default"),
            command: command.into(),
            extension: extension.into(),
            timeout: Timeout::default(),
            pre_command: None,
            pre_interval: default_interval(),
            post_command: None,
            post_interval: default_interval(),
            environment: BTreeMap::new(),
            working_dir: None,
            crash_signal: None,
            crash_marker_path: None,
            timeout_is_crash: false,
            debug_backend: DebugBackend::Native,
            line_rip: LineRipSettings::default(),
            ignored_keys: Vec::new(),
        }
    }

    pub fn load_from_file(path: &Path, section: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content, section).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_toml_str(content: &str, section: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;

        let value = table
            .get(section)
            .filter(|v| v.is_table())
            .ok_or_else(|| ConfigError::UnknownSection {
                section: section.to_string(),
                available: table
                    .iter()
                    .filter(|(_, v)| v.is_table())
                    .map(|(k, _)| k.clone())
                    .collect(),
            })?;

        let raw: RawSection = value.clone().try_into().map_err(|e: toml::de::Error| {
            ConfigError::Parse {
                path: PathBuf::new(),
                reason: format!("section '{section}': {}", e.message()),
            }
        })?;

        raw.resolve(section)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum RawTimeout {
    Seconds(u64),
    Keyword(String),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum RawMode {
    Bits(u64),
    Named(String),
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
enum RawBackend {
    Native,
    Gdb,
    Vtrace,
    Pykd,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
struct RawSection {
    command: Option<String>,
    extension: Option<String>,
    minimize_timeout: Option<RawTimeout>,
    pre_command: Option<String>,
    #[serde(default = "default_interval")]
    pre_iterations: u64,
    post_command: Option<String>,
    #[serde(default = "default_interval")]
    post_iterations: u64,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    signal: Option<i64>,
    crash_path: Option<PathBuf>,
    #[serde(default)]
    timeout_is_crash: bool,
    debugging_interface: Option<RawBackend>,
    use_gdb: Option<bool>,
    gdb_path: Option<PathBuf>,
    mode: Option<RawMode>,
    windbg_path: Option<PathBuf>,
    exploitable_path: Option<PathBuf>,
    #[serde(default)]
    line_per_line: bool,
    #[serde(default = "default_lines_to_rip")]
    lines_to_rip: usize,
    #[serde(default = "default_lines_percent")]
    lines_percent: u32,
    #[serde(default = "default_true")]
    strip_empty_lines: bool,
    /// Accepted for old profiles; nothing runs it.
    cleanup_command: Option<String>,
}

impl RawSection {
    fn resolve(self, section: &str) -> Result<TargetProfile, ConfigError> {
        let invalid = |field: &'static str, reason: String| ConfigError::InvalidField {
            section: section.to_string(),
            field,
            reason,
        };

        let command = self
            .command
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingField {
                section: section.to_string(),
                field: "command",
            })?;
        let extension = self.extension.ok_or_else(|| ConfigError::MissingField {
            section: section.to_string(),
            field: "extension",
        })?;

        let timeout = match self.minimize_timeout {
            None => Timeout::default(),
            Some(RawTimeout::Seconds(0)) => {
                return Err(invalid("minimize-timeout", "must be at least 1 second".into()));
            }
            Some(RawTimeout::Seconds(secs)) => Timeout::Seconds(secs),
            Some(RawTimeout::Keyword(word)) if word.eq_ignore_ascii_case("auto") => Timeout::Auto,
            Some(RawTimeout::Keyword(word)) => {
                return Err(invalid(
                    "minimize-timeout",
                    format!("expected seconds or \"auto\", got {word:?}"),
                ));
            }
        };

        if self.pre_iterations == 0 {
            return Err(invalid("pre-iterations", "must be at least 1".into()));
        }
        if self.post_iterations == 0 {
            return Err(invalid("post-iterations", "must be at least 1".into()));
        }
        if self.lines_to_rip == 0 {
            return Err(invalid("lines-to-rip", "must be at least 1".into()));
        }
        if !(1..=100).contains(&self.lines_percent) {
            return Err(invalid(
                "lines-percent",
                format!("must be within 1..=100, got {}", self.lines_percent),
            ));
        }

        // `debugging-interface` wins over the legacy `use-gdb` switch.
        let backend = match (self.debugging_interface, self.use_gdb) {
            (Some(kind), _) => kind,
            (None, Some(true)) => RawBackend::Gdb,
            (None, _) => RawBackend::Native,
        };
        let debug_backend = match backend {
            RawBackend::Native => DebugBackend::Native,
            RawBackend::Gdb => DebugBackend::Gdb {
                gdb_path: self.gdb_path.unwrap_or_else(default_gdb_path),
            },
            RawBackend::Vtrace => DebugBackend::Vtrace,
            RawBackend::Pykd => DebugBackend::Pykd {
                mode: match self.mode {
                    Some(RawMode::Bits(bits)) => bits.to_string(),
                    Some(RawMode::Named(name)) => name,
                    None => String::from("32"),
                },
                windbg_path: self.windbg_path,
                exploitable_path: self.exploitable_path,
            },
        };

        Ok(TargetProfile {
            section: section.to_string(),
            command,
            extension,
            timeout,
            pre_command: self.pre_command,
            pre_interval: self.pre_iterations,
            post_command: self.post_command,
            post_interval: self.post_iterations,
            environment: self.environment,
            working_dir: self.working_dir,
            crash_signal: self.signal,
            crash_marker_path: self.crash_path,
            timeout_is_crash: self.timeout_is_crash,
            debug_backend,
            line_rip: LineRipSettings {
                line_per_line: self.line_per_line,
                lines_to_rip: self.lines_to_rip,
                lines_percent: self.lines_percent,
                strip_empty_lines: self.strip_empty_lines,
            },
            ignored_keys: self
                .cleanup_command
                .map(|_| vec!["cleanup-command"])
                .unwrap_or_default(),
        })
    }
}

/// Something that can produce a fresh `TargetProfile` snapshot on demand.
pub trait ProfileSource {
    fn load(&self) -> Result<TargetProfile, ConfigError>;
}

impl ProfileSource for TargetProfile {
    fn load(&self) -> Result<TargetProfile, ConfigError> {
        Ok(self.clone())
    }
}

/// Reads the named section from a TOML file on every `load`, so edits made
/// while a run is in progress take effect on the next trial.
#[derive(Debug, Clone)]
pub struct FileProfileSource {
    path: PathBuf,
    section: String,
}

impl FileProfileSource {
    pub fn new(path: impl Into<PathBuf>, section: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            section: section.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProfileSource for FileProfileSource {
    fn load(&self) -> Result<TargetProfile, ConfigError> {
        TargetProfile::load_from_file(&self.path, &self.section)
    }
}
