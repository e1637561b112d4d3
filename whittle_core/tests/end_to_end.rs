use std::path::{Path, PathBuf};
use whittle_core::artifact::{ArtifactStore, content_hash};
use whittle_core::config::{FileProfileSource, ProfileSource};
use whittle_core::input::{ByteChangeSet, LineBuffer};
use whittle_core::minimizer::{ByteDiffMinimizer, LineSpanMinimizer, MinimizeOutcome};
use whittle_core::trial::TrialRunner;

/// Writes `script` next to a config file whose `target` section runs it.
fn setup(dir: &Path, script: &str, extra_keys: &str) -> PathBuf {
    let subject = dir.join("subject.sh");
    std::fs::write(&subject, script).unwrap();
    let config = dir.join("whittle.toml");
    std::fs::write(
        &config,
        format!(
            "[target]\ncommand = 'sh {} @@'\nextension = 'txt'\nminimize-timeout = 10\n{extra_keys}\n",
            subject.display()
        ),
    )
    .unwrap();
    config
}

fn haystack() -> Vec<u8> {
    let mut data = Vec::new();
    for i in 0..11 {
        if i == 5 {
            data.extend_from_slice(b"CRASH\n");
        } else {
            data.extend_from_slice(format!("filler {i}\n").as_bytes());
        }
    }
    data
}

#[test]
fn byte_diff_finds_the_single_crashing_byte() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(
        dir.path(),
        "if grep -q X \"$1\"; then kill -SEGV $$; fi\nexit 0\n",
        "",
    );
    let template = dir.path().join("template.txt");
    let crash = dir.path().join("crash.txt");
    let diff = dir.path().join("crash.diff");
    std::fs::write(&template, b"....").unwrap();
    std::fs::write(&crash, b"X.yz").unwrap();
    std::fs::write(&diff, "0\n2\n3\n").unwrap();

    let profile = FileProfileSource::new(&config, "target").load().unwrap();
    let changes = ByteChangeSet::load(&template, &crash, &diff).unwrap();
    let store = ArtifactStore::new(dir.path().join("out"), &profile.extension).unwrap();
    let runner = TrialRunner::from_profile(&profile).unwrap();

    let outcome = ByteDiffMinimizer::new(changes, runner, store)
        .run(&profile)
        .unwrap();
    let artifact = outcome.artifact().unwrap();
    assert_eq!(std::fs::read(artifact).unwrap(), b"X...");
    assert_eq!(
        artifact,
        &dir.path()
            .join("out")
            .join(format!("{}.txt", content_hash(b"X...")))
    );
}

#[test]
fn byte_diff_exhausts_when_nothing_crashes() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path(), "exit 0\n", "");
    let profile = FileProfileSource::new(&config, "target").load().unwrap();
    let changes = ByteChangeSet::new(b"abc".to_vec(), vec![0, 1], b"xyz").unwrap();
    let out = dir.path().join("out");
    let store = ArtifactStore::new(&out, &profile.extension).unwrap();

    let outcome = ByteDiffMinimizer::new(changes, TrialRunner::from_profile(&profile).unwrap(), store)
        .run(&profile)
        .unwrap();
    assert_eq!(outcome, MinimizeOutcome::Exhausted { iterations: 3 });
    let progress = ArtifactStore::load_progress(&out).unwrap().unwrap();
    assert_eq!(progress.algorithm, "byte-diff");
    assert_eq!(progress.next_iteration, 3);
}

#[test]
fn line_span_isolates_the_crashing_line() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(
        dir.path(),
        "if grep -q CRASH \"$1\"; then kill -ABRT $$; fi\nexit 0\n",
        "",
    );
    let crash = dir.path().join("crash.txt");
    std::fs::write(&crash, haystack()).unwrap();

    let source = FileProfileSource::new(&config, "target");
    let profile = source.load().unwrap();
    let lines = LineBuffer::load(&crash, profile.line_rip.strip_empty_lines).unwrap();
    let out = dir.path().join("out");
    let store = ArtifactStore::new(&out, &profile.extension).unwrap().with_seed(5);

    let mut minimizer =
        LineSpanMinimizer::seeded(lines, TrialRunner::from_profile(&profile).unwrap(), store, 5);
    let outcome = minimizer.run(&source).unwrap();

    assert_eq!(std::fs::read(outcome.artifact().unwrap()).unwrap(), b"CRASH\n");
    assert_eq!(std::fs::read(out.join("last_minimized.txt")).unwrap(), b"CRASH\n");
    assert_eq!(ArtifactStore::load_progress(&out).unwrap().unwrap().seed, Some(5));
}

#[test]
fn crash_marker_directory_counts_as_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let markers = dir.path().join("markers");
    std::fs::create_dir(&markers).unwrap();
    // The subject exits cleanly and only leaves a marker behind.
    let config = setup(
        dir.path(),
        &format!(
            "if grep -q CRASH \"$1\"; then touch {}/report; fi\nexit 0\n",
            markers.display()
        ),
        &format!("crash-path = '{}'\nline-per-line = true", markers.display()),
    );
    let source = FileProfileSource::new(&config, "target");
    let profile = source.load().unwrap();
    let store = ArtifactStore::new(dir.path().join("out"), &profile.extension).unwrap();

    let mut minimizer = LineSpanMinimizer::seeded(
        LineBuffer::from_bytes(&haystack(), true),
        TrialRunner::from_profile(&profile).unwrap(),
        store,
        0,
    );
    let outcome = minimizer.run(&source).unwrap();
    assert_eq!(std::fs::read(outcome.artifact().unwrap()).unwrap(), b"CRASH\n");
    assert_eq!(std::fs::read_dir(&markers).unwrap().count(), 0);
}

#[test]
fn pre_hook_honours_its_interval() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("hook.log");
    let config = setup(
        dir.path(),
        "exit 0\n",
        &format!(
            "pre-command = 'echo pre >> {}'\npre-iterations = 2\nline-per-line = true",
            log.display()
        ),
    );
    let source = FileProfileSource::new(&config, "target");
    let profile = source.load().unwrap();
    let store = ArtifactStore::new(dir.path().join("out"), &profile.extension).unwrap();

    let mut minimizer = LineSpanMinimizer::seeded(
        LineBuffer::from_bytes(b"a\nb\nc\nd\ne\n", true),
        TrialRunner::from_profile(&profile).unwrap(),
        store,
        0,
    );
    minimizer.run(&source).unwrap();

    // Five trials, iterations 0, 2 and 4 run the hook.
    assert_eq!(minimizer.trials_executed(), 5);
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "pre\npre\npre\n");
}

#[test]
fn missing_subject_binary_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("whittle.toml");
    std::fs::write(
        &config,
        "[target]\ncommand = '/no/such/subject @@'\nextension = '.bin'\n",
    )
    .unwrap();
    let profile = FileProfileSource::new(&config, "target").load().unwrap();
    let changes = ByteChangeSet::new(vec![0; 2], vec![0], &[1, 1]).unwrap();
    let store = ArtifactStore::new(dir.path().join("out"), &profile.extension).unwrap();

    let result = ByteDiffMinimizer::new(changes, TrialRunner::from_profile(&profile).unwrap(), store)
        .run(&profile);
    assert!(matches!(
        result,
        Err(whittle_core::MinimizeError::Execution(_))
    ));
}
