use crate::corpus::{CorpusEntry, EntryId};
use crate::coverage::{CoverageObservation, VirginMap};
use rand::seq::SliceRandom;
use rand_core::RngCore;
use thiserror::Error;
use tracing::debug;

/// Number of mutated executions to run against each picked entry.
pub const DEFAULT_MUTATION_BUDGET: usize = 256;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Indicates that the corpus is empty, and therefore no input can be scheduled.
    #[error("Corpus is empty, cannot schedule next input")]
    CorpusEmpty,
}

/// A `Scheduler` owns the corpus, the fuzzing queue and the global coverage
/// accumulator, and decides which entry to fuzz next and for how long.
///
/// The accumulator is never handed out: `classify_and_merge` is the only way to
/// change it.
pub trait Scheduler: Send {
    /// Signals the end of the seed import phase.
    fn mark_initialization_done(&mut self);

    /// Selects the next entry to fuzz and the number of mutations to spend on it.
    ///
    /// # Arguments
    /// * `rng`: randomness for any reordering the policy needs.
    ///
    /// # Returns
    /// The chosen entry and its mutation budget, or `SchedulerError::CorpusEmpty`
    /// if nothing has been admitted yet.
    fn pick_next(
        &mut self,
        rng: &mut dyn RngCore,
    ) -> Result<(CorpusEntry, usize), SchedulerError>;

    /// Reports whether `observation` would add coverage, without merging it.
    fn is_new(&self, observation: &CoverageObservation) -> bool;

    /// Reports whether `observation` adds coverage and merges it into the
    /// global accumulator. Calling it again with the same observation returns
    /// false.
    fn classify_and_merge(&mut self, observation: &CoverageObservation) -> bool;

    /// Adds `entry` to the corpus and queue if `observation.is_new` is set.
    /// Novelty is taken from the observation, never recomputed.
    fn admit(
        &mut self,
        entry: CorpusEntry,
        observation: &CoverageObservation,
        parent: Option<EntryId>,
    );

    /// Adds a seed entry unconditionally.
    fn admit_seed(&mut self, entry: CorpusEntry);

    fn corpus_len(&self) -> usize;

    fn queue_len(&self) -> usize;

    /// Number of coverage bits never triggered so far.
    fn unseen_bits(&self) -> u64;
}

/// A "fair" scheduler: every refill of the queue is a uniformly random
/// permutation of the whole corpus, so every entry gets fuzzed once per cycle
/// regardless of age, size or how much coverage it brought.
#[derive(Debug)]
pub struct RoundRobinScheduler {
    corpus: Vec<CorpusEntry>,
    queue: Vec<CorpusEntry>,
    virgin: VirginMap,
    initialization_finished: bool,
    mutation_budget: usize,
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_MUTATION_BUDGET)
    }

    pub fn with_budget(mutation_budget: usize) -> Self {
        Self {
            corpus: Vec::new(),
            queue: Vec::new(),
            virgin: VirginMap::new(),
            initialization_finished: false,
            mutation_budget,
        }
    }
}

impl Default for RoundRobinScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for RoundRobinScheduler {
    fn mark_initialization_done(&mut self) {
        self.initialization_finished = true;
    }

    fn pick_next(
        &mut self,
        rng: &mut dyn RngCore,
    ) -> Result<(CorpusEntry, usize), SchedulerError> {
        if self.queue.is_empty() {
            if self.corpus.is_empty() {
                return Err(SchedulerError::CorpusEmpty);
            }
            self.queue = self.corpus.clone();
            self.queue.shuffle(rng);
            debug!(
                entries = self.queue.len(),
                after_initialization = self.initialization_finished,
                "refilled fuzzing queue"
            );
        }
        match self.queue.pop() {
            Some(entry) => Ok((entry, self.mutation_budget)),
            None => Err(SchedulerError::CorpusEmpty),
        }
    }

    fn is_new(&self, observation: &CoverageObservation) -> bool {
        self.virgin.has_new_bits(observation)
    }

    fn classify_and_merge(&mut self, observation: &CoverageObservation) -> bool {
        self.virgin.merge(observation)
    }

    fn admit(
        &mut self,
        entry: CorpusEntry,
        observation: &CoverageObservation,
        _parent: Option<EntryId>,
    ) {
        if observation.is_new == Some(true) {
            self.queue.push(entry.clone());
            self.corpus.push(entry);
        }
    }

    fn admit_seed(&mut self, entry: CorpusEntry) {
        self.queue.push(entry.clone());
        self.corpus.push(entry);
    }

    fn corpus_len(&self) -> usize {
        self.corpus.len()
    }

    fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn unseen_bits(&self) -> u64 {
        self.virgin.unseen_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::MAP_SIZE;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn entry(id: u64) -> CorpusEntry {
        CorpusEntry {
            id: EntryId(id),
            parent: None,
            path: PathBuf::from(format!("queue/id-{id}")),
        }
    }

    fn observation(slot: usize, is_new: Option<bool>) -> CoverageObservation {
        let mut observation = CoverageObservation::new();
        observation.mark_slot(slot);
        observation.is_new = is_new;
        observation
    }

    #[test]
    fn pick_next_from_empty_corpus_returns_corpus_empty_error() {
        let mut scheduler = RoundRobinScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        assert!(matches!(
            scheduler.pick_next(&mut rng),
            Err(SchedulerError::CorpusEmpty)
        ));
    }

    #[test]
    fn pick_next_returns_fixed_budget() {
        let mut scheduler = RoundRobinScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        scheduler.admit_seed(entry(0));
        let (picked, budget) = scheduler.pick_next(&mut rng).unwrap();
        assert_eq!(picked, entry(0));
        assert_eq!(budget, DEFAULT_MUTATION_BUDGET);
    }

    #[test]
    fn every_entry_is_picked_once_per_refill_cycle() {
        let mut scheduler = RoundRobinScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([2; 32]);
        for id in 0..7 {
            scheduler.admit_seed(entry(id));
        }
        scheduler.mark_initialization_done();
        // Drain the import-time queue so the next picks come from a refill.
        while scheduler.queue_len() > 0 {
            scheduler.pick_next(&mut rng).unwrap();
        }

        for cycle in 0..5 {
            let mut seen = HashSet::new();
            for _ in 0..7 {
                let (picked, _) = scheduler.pick_next(&mut rng).unwrap();
                assert!(
                    seen.insert(picked.id),
                    "entry {} repeated within cycle {cycle}",
                    picked.id
                );
            }
            assert_eq!(seen.len(), 7);
            assert_eq!(scheduler.queue_len(), 0);
        }
    }

    #[test]
    fn refills_are_shuffled() {
        let mut scheduler = RoundRobinScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        for id in 0..16 {
            scheduler.admit_seed(entry(id));
        }
        while scheduler.queue_len() > 0 {
            scheduler.pick_next(&mut rng).unwrap();
        }
        let orders: HashSet<Vec<EntryId>> = (0..4)
            .map(|_| {
                (0..16)
                    .map(|_| scheduler.pick_next(&mut rng).unwrap().0.id)
                    .collect()
            })
            .collect();
        assert!(orders.len() > 1, "four refills produced the same order");
    }

    #[test]
    fn classify_and_merge_reports_new_then_not_new() {
        let mut scheduler = RoundRobinScheduler::new();
        let observation = observation(5, None);
        let before = scheduler.unseen_bits();

        assert!(scheduler.is_new(&observation));
        assert!(scheduler.classify_and_merge(&observation));
        assert!(!scheduler.classify_and_merge(&observation));
        assert!(!scheduler.is_new(&observation));
        assert_eq!(scheduler.unseen_bits(), before - 1);
    }

    #[test]
    fn peek_leaves_accumulator_unchanged() {
        let scheduler = RoundRobinScheduler::new();
        assert!(scheduler.is_new(&observation(9, None)));
        assert_eq!(scheduler.unseen_bits(), (MAP_SIZE as u64) * 8);
    }

    #[test]
    fn admit_trusts_the_novelty_flag() {
        let mut scheduler = RoundRobinScheduler::new();

        scheduler.admit(entry(0), &observation(1, Some(false)), None);
        scheduler.admit(entry(1), &observation(1, None), None);
        assert_eq!(scheduler.corpus_len(), 0);
        assert_eq!(scheduler.queue_len(), 0);

        // Already merged coverage, but flagged new by the caller: admitted.
        let flagged = observation(1, Some(true));
        scheduler.classify_and_merge(&flagged);
        scheduler.admit(entry(2), &flagged, Some(EntryId(0)));
        assert_eq!(scheduler.corpus_len(), 1);
        assert_eq!(scheduler.queue_len(), 1);
        assert_eq!(scheduler.corpus[0].id, EntryId(2));
    }

    #[test]
    fn admitted_entries_join_the_current_cycle() {
        let mut scheduler = RoundRobinScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([4; 32]);
        scheduler.admit_seed(entry(0));
        scheduler.admit_seed(entry(1));
        scheduler.mark_initialization_done();
        assert!(scheduler.initialization_finished);

        scheduler.pick_next(&mut rng).unwrap();
        scheduler.admit(entry(2), &observation(3, Some(true)), Some(EntryId(0)));
        assert_eq!(scheduler.queue_len(), 2);
        assert_eq!(scheduler.corpus_len(), 3);
    }

    #[test]
    fn custom_budget_is_reported() {
        let mut scheduler = RoundRobinScheduler::with_budget(8);
        let mut rng = ChaCha8Rng::from_seed([5; 32]);
        scheduler.admit_seed(entry(0));
        assert_eq!(scheduler.pick_next(&mut rng).unwrap().1, 8);
    }
}
