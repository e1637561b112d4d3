use whittle_core::artifact::{ArtifactStore, RunProgress};
use whittle_core::config::{FileProfileSource, ProfileSource, TargetProfile};
use whittle_core::input::{ByteChangeSet, LineBuffer};
use whittle_core::minimizer::{ByteDiffMinimizer, LineSpanMinimizer, MinimizeOutcome};
use whittle_core::trial::TrialRunner;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Shrinks crashing inputs while the crash still reproduces", long_about = None)]
struct Cli {
    #[clap(short, long, value_parser, default_value = "whittle.toml")]
    config_file: PathBuf,
    /// Configuration section describing the target.
    #[clap(short, long)]
    section: String,
    /// Skip every trial whose iteration index is lower than this. Line-span
    /// runs only accept the position recorded in their progress file.
    #[clap(long, env = "WHITTLE_ITERATION")]
    start_at: Option<u64>,
    /// Continue from the progress record left in the output directory.
    #[clap(long)]
    resume: bool,
    /// Seed for the line-span coarse cuts.
    #[clap(long)]
    seed: Option<u64>,
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[clap(subcommand)]
    algorithm: Algorithm,
}

#[derive(Subcommand, Debug)]
enum Algorithm {
    /// Find the fewest differing bytes between a template and a crash that still crash.
    ByteDiff {
        #[clap(long)]
        template: PathBuf,
        #[clap(long)]
        crash: PathBuf,
        /// One differing byte offset per line.
        #[clap(long)]
        diff: PathBuf,
        #[clap(short, long)]
        out_dir: PathBuf,
    },
    /// Drop spans of lines from a crashing file.
    LineSpan {
        #[clap(long)]
        crash: PathBuf,
        #[clap(short, long)]
        out_dir: PathBuf,
    },
}

impl Algorithm {
    fn name(&self) -> &'static str {
        match self {
            Algorithm::ByteDiff { .. } => "byte-diff",
            Algorithm::LineSpan { .. } => "line-span",
        }
    }

    fn out_dir(&self) -> &Path {
        match self {
            Algorithm::ByteDiff { out_dir, .. } | Algorithm::LineSpan { out_dir, .. } => out_dir,
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_target(false)
        .init();
}

/// Progress left behind by an earlier run of the same algorithm, if asked for.
fn previous_progress(cli: &Cli) -> Result<Option<RunProgress>, anyhow::Error> {
    if !cli.resume {
        return Ok(None);
    }
    let out_dir = cli.algorithm.out_dir();
    let Some(progress) = ArtifactStore::load_progress(out_dir)
        .with_context(|| format!("Reading progress record in {out_dir:?}"))?
    else {
        warn!("No progress record in {out_dir:?}, starting from the beginning");
        return Ok(None);
    };
    if progress.algorithm != cli.algorithm.name() {
        bail!(
            "Progress record in {out_dir:?} belongs to a {} run, not {}",
            progress.algorithm,
            cli.algorithm.name()
        );
    }
    Ok(Some(progress))
}

fn run(cli: Cli) -> Result<MinimizeOutcome, anyhow::Error> {
    let source = FileProfileSource::new(&cli.config_file, &cli.section);
    let profile: TargetProfile = source
        .load()
        .with_context(|| format!("Loading section '{}' from {:?}", cli.section, cli.config_file))?;
    for key in &profile.ignored_keys {
        warn!("Ignoring '{key}' in section '{}', it has no effect", profile.section);
    }
    let runner = TrialRunner::from_profile(&profile)?;

    let progress = previous_progress(&cli)?;
    let start_at = cli
        .start_at
        .or(progress.as_ref().map(|p| p.next_iteration))
        .unwrap_or(0);

    let outcome = match &cli.algorithm {
        Algorithm::ByteDiff {
            template,
            crash,
            diff,
            out_dir,
        } => {
            let changes = ByteChangeSet::load(template, crash, diff)?;
            info!(
                "Loaded {} differing offset(s) between {template:?} and {crash:?}",
                changes.len()
            );
            let store = ArtifactStore::new(out_dir, &profile.extension)?;
            ByteDiffMinimizer::new(changes, runner, store)
                .start_at(start_at)
                .run(&profile)?
        }
        Algorithm::LineSpan { crash, out_dir } => {
            let state = progress.as_ref().and_then(|p| p.line_span);
            match (cli.start_at, &state) {
                (Some(n), Some(s)) if n != s.next_iteration => bail!(
                    "--start-at {n} does not match the recorded line-span position ({})",
                    s.next_iteration
                ),
                (Some(n), None) if n > 0 => {
                    bail!("line-span runs continue from their progress record, use --resume")
                }
                _ => {}
            }

            let seed = match (&state, progress.as_ref().and_then(|p| p.seed)) {
                (Some(_), Some(recorded)) => recorded,
                _ => cli.seed.unwrap_or_else(rand::random),
            };
            info!("Using seed {seed}");
            let store = ArtifactStore::new(out_dir, &profile.extension)?.with_seed(seed);

            let strip = profile.line_rip.strip_empty_lines;
            let checkpoint = store.checkpoint_path();
            let source_file = match state {
                Some(_) if checkpoint.exists() => checkpoint.as_path(),
                _ => crash.as_path(),
            };
            let lines = LineBuffer::load(source_file, strip)?;
            let minimizer =
                LineSpanMinimizer::new(lines, runner, store, ChaCha8Rng::seed_from_u64(seed));
            let mut minimizer = match &state {
                Some(state) => {
                    info!("Continuing from {source_file:?}");
                    minimizer.resume_from(state)?
                }
                None => minimizer,
            };
            minimizer.run(&source)?
        }
    };
    Ok(outcome)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(MinimizeOutcome::Minimized {
            artifact,
            size,
            iterations,
        }) => {
            info!("Done after {iterations} iteration(s): {artifact:?} ({size})");
            ExitCode::SUCCESS
        }
        Ok(MinimizeOutcome::Exhausted { iterations }) => {
            warn!("No reproducing reduction found after {iterations} iteration(s)");
            ExitCode::from(1)
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}
