//! Reduces a crashing mutation to the fewest byte changes that still
//! reproduce the crash, given the offsets where it differs from its template.
//!
//! Each round tries every remaining change on its own, on top of the changes
//! already baked into the template. The first candidate that crashes is the
//! result. When none does, the last remaining offset is treated as mandatory:
//! it is baked in and the next round starts with one change fewer. The
//! result is locally minimal; which offset gets baked is a list-order
//! tie-break, not a search.

use super::{IterationCounter, MinimizeError, MinimizeOutcome};
use crate::artifact::ArtifactStore;
use crate::config::TargetProfile;
use crate::input::ByteChangeSet;
use crate::oracle::{Verdict, signal_name};
use crate::trial::TrialRunner;
use log::{debug, info, warn};

const ALGORITHM: &str = "byte-diff";

pub struct ByteDiffMinimizer {
    changes: ByteChangeSet,
    runner: TrialRunner,
    store: ArtifactStore,
    counter: IterationCounter,
    executed: u64,
}

impl ByteDiffMinimizer {
    pub fn new(changes: ByteChangeSet, runner: TrialRunner, store: ArtifactStore) -> Self {
        Self {
            changes,
            runner,
            store,
            counter: IterationCounter::default(),
            executed: 0,
        }
    }

    /// Skips every trial whose index is below `start_at`.
    pub fn start_at(mut self, start_at: u64) -> Self {
        self.counter = IterationCounter::new(start_at);
        self
    }

    pub fn changes(&self) -> &ByteChangeSet {
        &self.changes
    }

    /// Trials actually executed, skipped ones excluded.
    pub fn trials_executed(&self) -> u64 {
        self.executed
    }

    pub fn run(&mut self, profile: &TargetProfile) -> Result<MinimizeOutcome, MinimizeError> {
        let rounds = self.changes.len();
        info!(
            "Reducing {rounds} differing byte(s) with the {} oracle",
            self.runner.oracle_name()
        );
        if self.counter.start_at() > 0 {
            info!("Resuming at trial {}", self.counter.start_at());
        }

        for round in 0..rounds {
            let max_iterations = (self.changes.len() * self.changes.len()) as u64;
            let offsets = self.changes.offsets().to_vec();
            for offset in offsets {
                let slot = self.counter.advance();
                if slot.skipped {
                    continue;
                }
                let Some(candidate) = self.changes.candidate_with(offset) else {
                    continue;
                };
                info!(
                    "Trial {} of at most {max_iterations}: round {round}, applying offset {offset}",
                    slot.index
                );

                let report = self.runner.run(&candidate, profile, slot.index)?;
                self.executed += 1;
                self.store
                    .record_progress(ALGORITHM, self.counter.next_index())?;

                if report.reproduces(profile.timeout_is_crash) {
                    let cause = match report.verdict {
                        Verdict::Crashed(code) => {
                            format!("caught code {code} ({})", signal_name(code).unwrap_or("custom"))
                        }
                        _ if report.marker_evidence => "crash marker found".to_string(),
                        _ => "hang treated as crash".to_string(),
                    };
                    info!("Crash reproduced, {cause}");
                    let artifact = self.store.write_minimized(&candidate)?;
                    info!("Wrote minimized input to {artifact:?}");
                    return Ok(MinimizeOutcome::Minimized {
                        artifact,
                        size: candidate.len(),
                        iterations: self.counter.next_index(),
                    });
                }
            }

            if let Some(baked) = self.changes.bake_last() {
                debug!(
                    "No single change reproduces the crash, baking in offset {baked} ({} left)",
                    self.changes.len()
                );
            }
        }

        warn!("No combination of the differing bytes reproduced the crash");
        Ok(MinimizeOutcome::Exhausted {
            iterations: self.counter.next_index(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minimizer::testing::PredicateOracle;
    use proptest::prelude::*;

    fn minimizer_for<P>(
        template: Vec<u8>,
        diff: Vec<usize>,
        crash: &[u8],
        out: &std::path::Path,
        predicate: P,
    ) -> (ByteDiffMinimizer, std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>)
    where
        P: Fn(&[u8]) -> Verdict + Send + 'static,
    {
        let (oracle, calls) = PredicateOracle::new(predicate);
        let changes = ByteChangeSet::new(template, diff, crash).unwrap();
        let store = ArtifactStore::new(out, ".bin").unwrap();
        let minimizer = ByteDiffMinimizer::new(changes, TrialRunner::new(Box::new(oracle)), store);
        (minimizer, calls)
    }

    fn profile() -> TargetProfile {
        TargetProfile::new("unused", ".bin")
    }

    #[test]
    fn single_offset_crash_is_found_in_round_zero() {
        let out = tempfile::tempdir().unwrap();
        let (mut minimizer, calls) = minimizer_for(
            vec![0; 4],
            vec![0, 1, 2, 3],
            &[1, 0, 0, 0],
            out.path(),
            |data| {
                if data[0] != 0 {
                    Verdict::Crashed(139)
                } else {
                    Verdict::NoCrash
                }
            },
        );

        let outcome = minimizer.run(&profile()).unwrap();
        let artifact = outcome.artifact().expect("should minimize").clone();
        assert_eq!(std::fs::read(&artifact).unwrap(), vec![1, 0, 0, 0]);
        assert_eq!(
            artifact.file_name().unwrap().to_str().unwrap(),
            format!("{}.bin", crate::artifact::content_hash(&[1, 0, 0, 0]))
        );
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(minimizer.trials_executed(), 1);
    }

    #[test]
    fn always_crashing_oracle_stops_on_first_trial() {
        let out = tempfile::tempdir().unwrap();
        let (mut minimizer, calls) = minimizer_for(
            b"hello".to_vec(),
            vec![4, 0],
            b"HELLO",
            out.path(),
            |_| Verdict::Crashed(134),
        );
        let outcome = minimizer.run(&profile()).unwrap();
        assert_eq!(
            std::fs::read(outcome.artifact().unwrap()).unwrap(),
            b"hellO".to_vec()
        );
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn never_crashing_oracle_exhausts_and_writes_nothing() {
        let out = tempfile::tempdir().unwrap();
        let (mut minimizer, calls) = minimizer_for(
            vec![0; 5],
            vec![0, 1, 2, 3],
            &[9, 8, 7, 6, 5],
            out.path(),
            |_| Verdict::NoCrash,
        );
        let outcome = minimizer.run(&profile()).unwrap();
        assert_eq!(outcome, MinimizeOutcome::Exhausted { iterations: 10 });
        assert_eq!(calls.lock().unwrap().len(), 4 + 3 + 2 + 1);
        assert!(minimizer.changes().is_empty());
        assert_eq!(minimizer.changes().template(), &[9, 8, 7, 6, 0]);
        let artifacts: Vec<_> = std::fs::read_dir(out.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "bin"))
            .collect();
        assert!(artifacts.is_empty());
    }

    #[test]
    fn baked_changes_combine_with_later_single_changes() {
        // Crash needs bytes 1 and 3 both set: round 0 fails, offset 3 is baked,
        // round 1 then finds offset 1.
        let out = tempfile::tempdir().unwrap();
        let (mut minimizer, calls) = minimizer_for(
            vec![0; 4],
            vec![0, 1, 2, 3],
            &[1, 1, 1, 1],
            out.path(),
            |data| {
                if data[1] == 1 && data[3] == 1 {
                    Verdict::Crashed(139)
                } else {
                    Verdict::NoCrash
                }
            },
        );
        let outcome = minimizer.run(&profile()).unwrap();
        assert_eq!(
            std::fs::read(outcome.artifact().unwrap()).unwrap(),
            vec![0, 1, 0, 1]
        );
        assert_eq!(calls.lock().unwrap().len(), 4 + 2);
    }

    #[test]
    fn timeouts_do_not_count_unless_configured() {
        let out = tempfile::tempdir().unwrap();
        let (mut minimizer, _) =
            minimizer_for(vec![0; 2], vec![0, 1], &[1, 1], out.path(), |_| Verdict::TimedOut);
        assert!(matches!(
            minimizer.run(&profile()).unwrap(),
            MinimizeOutcome::Exhausted { .. }
        ));

        let (mut minimizer, _) =
            minimizer_for(vec![0; 2], vec![0, 1], &[1, 1], out.path(), |_| Verdict::TimedOut);
        let mut hang_profile = profile();
        hang_profile.timeout_is_crash = true;
        assert!(matches!(
            minimizer.run(&hang_profile).unwrap(),
            MinimizeOutcome::Minimized { .. }
        ));
    }

    #[test]
    fn minimizing_the_output_again_succeeds_immediately() {
        let out = tempfile::tempdir().unwrap();
        let crashes = |data: &[u8]| {
            if data[2] == 0xAA {
                Verdict::Crashed(139)
            } else {
                Verdict::NoCrash
            }
        };
        let (mut first, _) = minimizer_for(
            vec![0; 6],
            vec![5, 2, 0],
            &[3, 0, 0xAA, 0, 0, 3],
            out.path(),
            crashes,
        );
        let artifact = first.run(&profile()).unwrap().artifact().unwrap().clone();
        let minimized = std::fs::read(&artifact).unwrap();

        let (mut second, calls) =
            minimizer_for(minimized.clone(), vec![2], &minimized, out.path(), crashes);
        let again = second.run(&profile()).unwrap();
        assert_eq!(again.artifact(), Some(&artifact));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn resuming_reaches_the_same_answer() {
        let predicate = |data: &[u8]| {
            if data[1] == 1 && data[3] == 1 {
                Verdict::Crashed(139)
            } else {
                Verdict::NoCrash
            }
        };
        let out_full = tempfile::tempdir().unwrap();
        let (mut full, full_calls) =
            minimizer_for(vec![0; 4], vec![0, 1, 2, 3], &[1; 4], out_full.path(), predicate);
        let full_outcome = full.run(&profile()).unwrap();

        let out_resumed = tempfile::tempdir().unwrap();
        let (resumed, resumed_calls) = minimizer_for(
            vec![0; 4],
            vec![0, 1, 2, 3],
            &[1; 4],
            out_resumed.path(),
            predicate,
        );
        let mut resumed = resumed.start_at(3);
        let resumed_outcome = resumed.run(&profile()).unwrap();

        let full_bytes = std::fs::read(full_outcome.artifact().unwrap()).unwrap();
        let resumed_bytes = std::fs::read(resumed_outcome.artifact().unwrap()).unwrap();
        assert_eq!(full_bytes, resumed_bytes);
        assert_eq!(full_calls.lock().unwrap().len(), 6);
        assert_eq!(resumed_calls.lock().unwrap().len(), 3);

        let progress = ArtifactStore::load_progress(out_resumed.path()).unwrap().unwrap();
        assert_eq!(progress.algorithm, "byte-diff");
        assert_eq!(progress.next_iteration, 6);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn only_diff_offsets_are_ever_touched(
            template in proptest::collection::vec(any::<u8>(), 1..24),
            crash_seed in proptest::collection::vec(any::<u8>(), 24),
            picks in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
            trigger in any::<u8>(),
        ) {
            let crash: Vec<u8> = crash_seed[..template.len()].to_vec();
            let diff: Vec<usize> = picks.iter().map(|i| i.index(template.len())).collect();
            let allowed: std::collections::HashSet<usize> = diff.iter().copied().collect();
            let original = template.clone();

            let out = tempfile::tempdir().unwrap();
            let (mut minimizer, calls) = minimizer_for(
                template,
                diff,
                &crash,
                out.path(),
                move |data| {
                    if data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) == trigger {
                        Verdict::Crashed(139)
                    } else {
                        Verdict::NoCrash
                    }
                },
            );
            let outcome = minimizer.run(&profile()).unwrap();

            let mut produced = calls.lock().unwrap().clone();
            produced.push(minimizer.changes().template().to_vec());
            if let Some(path) = outcome.artifact() {
                produced.push(std::fs::read(path).unwrap());
            }
            for buf in produced {
                prop_assert_eq!(buf.len(), original.len());
                for (offset, (a, b)) in buf.iter().zip(original.iter()).enumerate() {
                    if a != b {
                        prop_assert!(allowed.contains(&offset));
                        prop_assert_eq!(*a, crash[offset]);
                    }
                }
            }
        }
    }
}
