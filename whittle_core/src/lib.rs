pub mod artifact;
pub mod config;
pub mod executor;
pub mod input;
pub mod minimizer;
pub mod observer;
pub mod oracle;
pub mod trial;

pub use artifact::{ArtifactError, ArtifactStore, LineSpanState, RunProgress};
pub use config::{ConfigError, DebugBackend, FileProfileSource, ProfileSource, TargetProfile, Timeout};
pub use executor::{CommandExecutor, ExecutionError, Termination};
pub use input::{ByteChangeSet, InputError, LineBuffer};
pub use minimizer::{ByteDiffMinimizer, LineSpanMinimizer, MinimizeError, MinimizeOutcome};
pub use observer::{CrashMarkerObserver, HookObserver, Observer};
pub use oracle::{CrashOracle, GdbOracle, InProcessOracle, NativeOracle, Verdict, build_oracle};
pub use trial::{TrialReport, TrialRunner};
