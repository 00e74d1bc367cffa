use crate::config::RunSettings;
use crate::corpus::{CorpusEntry, CorpusStore, CrashId, CrashRecord, EntryId, StorageError};
use crate::executor::{ExecError, Executor, ReturnCodeExecutor};
use crate::mutator::{PresetMutator, Mutator, MutatorError};
use crate::scheduler::{RoundRobinScheduler, Scheduler, SchedulerError};
use crate::stats::{DEFAULT_STATS_INTERVAL, RunStats, StatsReporter};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum FuzzerError {
    #[error("Execution failed: {0}")]
    Exec(#[from] ExecError),
    #[error("Mutation failed: {0}")]
    Mutator(#[from] MutatorError),
    #[error("Scheduling failed: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Persisting input failed: {0}")]
    Storage(#[from] StorageError),
    #[error("Failed to read seed input {path:?}: {source}")]
    SeedRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No seed inputs found in {0:?}")]
    NoSeeds(PathBuf),
    #[error("Fuzzer is {actual:?}, expected {expected:?}")]
    WrongPhase { expected: Phase, actual: Phase },
    #[error("Failed to start stats reporter: {0}")]
    Reporter(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Fuzzing,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct FuzzerOptions {
    pub stop_on_first_crash: bool,
    pub max_executions: Option<u64>,
    pub time_limit: Option<Duration>,
    pub seed: Option<u64>,
    pub stats_interval: Duration,
}

impl Default for FuzzerOptions {
    fn default() -> Self {
        Self {
            stop_on_first_crash: false,
            max_executions: None,
            time_limit: None,
            seed: None,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

impl From<&RunSettings> for FuzzerOptions {
    fn from(settings: &RunSettings) -> Self {
        Self {
            stop_on_first_crash: settings.stop_on_first_crash,
            max_executions: settings.max_executions,
            time_limit: settings.time_limit,
            seed: settings.seed,
            stats_interval: settings.stats_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub executions: u64,
    pub discovered: u64,
    pub corpus_size: u64,
    pub crashes: u64,
    pub elapsed: Duration,
}

/// Drives the fuzzing loop: seeds the corpus, then picks, mutates, executes and
/// keeps whatever adds coverage until something asks it to stop.
pub struct Fuzzer {
    executor: Box<dyn Executor>,
    mutator: Box<dyn Mutator>,
    scheduler: Box<dyn Scheduler>,
    store: CorpusStore,
    rng: ChaCha8Rng,
    options: FuzzerOptions,
    stats: Arc<RunStats>,
    stop: Arc<AtomicBool>,
    phase: Phase,
    next_entry_id: u64,
    next_crash_id: u64,
}

impl Fuzzer {
    pub fn new(
        executor: Box<dyn Executor>,
        mutator: Box<dyn Mutator>,
        scheduler: Box<dyn Scheduler>,
        store: CorpusStore,
        options: FuzzerOptions,
    ) -> Self {
        let rng = match options.seed {
            Some(seed) => {
                info!("Using constant random seed: {seed}");
                ChaCha8Rng::seed_from_u64(seed)
            }
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        Self {
            executor,
            mutator,
            scheduler,
            store,
            rng,
            options,
            stats: Arc::new(RunStats::new()),
            stop: Arc::new(AtomicBool::new(false)),
            phase: Phase::Initializing,
            next_entry_id: 0,
            next_crash_id: 0,
        }
    }

    /// Wires up the stock components for a validated configuration: the
    /// return-code executor (scratch file in the output root), the configured
    /// mutator preset and the round-robin scheduler.
    pub fn from_settings(settings: &RunSettings) -> Result<Self, FuzzerError> {
        let executor =
            ReturnCodeExecutor::from_invocation(&settings.invocation, &settings.layout.root)?;
        let mutator = PresetMutator::from_preset(settings.mutator);
        let scheduler = RoundRobinScheduler::with_budget(settings.mutation_budget);
        let store = CorpusStore::new(settings.layout.clone())?;
        info!(
            invocation = %settings.invocation,
            delivery = ?executor.input_delivery(),
            mutator = %settings.mutator,
            "fuzzer configured"
        );
        Ok(Self::new(
            Box::new(executor),
            Box::new(mutator),
            Box::new(scheduler),
            store,
            settings.into(),
        ))
    }

    /// Shares an externally owned stop flag, e.g. one registered with a
    /// signal handler.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn stats(&self) -> Arc<RunStats> {
        self.stats.clone()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    pub fn store(&self) -> &CorpusStore {
        &self.store
    }

    /// Runs every file in `input_dir` once, stores it as a seed entry and
    /// admits it regardless of the coverage it produced.
    pub fn initialize(&mut self, input_dir: &Path) -> Result<(), FuzzerError> {
        self.expect_phase(Phase::Initializing)?;
        info!("Initializing...");

        let seed_paths = collect_seed_paths(input_dir)?;
        if seed_paths.is_empty() {
            return Err(FuzzerError::NoSeeds(input_dir.to_path_buf()));
        }

        for seed_path in seed_paths {
            let bytes = fs::read(&seed_path).map_err(|source| FuzzerError::SeedRead {
                path: seed_path.clone(),
                source,
            })?;
            let mut observation = self.executor.run(&bytes)?;
            let is_new = self.scheduler.classify_and_merge(&observation);
            observation.is_new = Some(is_new);

            let id = self.allocate_entry_id();
            let entry = self.store.save_seed(id, &bytes)?;
            info!(
                "[{id}] Starting input: \"{}\" (new_coverage: {is_new})",
                String::from_utf8_lossy(&bytes)
            );
            self.scheduler.admit_seed(entry);
            self.stats.record_corpus_entry();
        }

        self.scheduler.mark_initialization_done();
        self.phase = Phase::Fuzzing;
        Ok(())
    }

    /// Fuzzes until the stop flag is raised, a limit is hit, or a fatal error
    /// occurs. The reporter is always joined before returning.
    pub fn run(&mut self) -> Result<RunSummary, FuzzerError> {
        self.expect_phase(Phase::Fuzzing)?;
        info!("Fuzzing {} corpus entries", self.scheduler.corpus_len());

        let reporter = StatsReporter::spawn(
            self.stats.clone(),
            self.stop.clone(),
            self.options.stats_interval,
        )
        .map_err(FuzzerError::Reporter)?;

        let outcome = self.fuzz_loop();

        self.stop.store(true, Ordering::SeqCst);
        reporter.join();
        self.phase = Phase::Stopped;

        if let Err(e) = &outcome {
            warn!("Fuzzing aborted: {e}");
        }
        outcome?;

        let summary = self.summary();
        info!(
            "Fuzzing stopped after {:.2?}: {} execs, corpus {} ({} discovered), {} crashes",
            summary.elapsed,
            summary.executions,
            summary.corpus_size,
            summary.discovered,
            summary.crashes
        );
        Ok(summary)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            executions: self.stats.executions(),
            discovered: self.stats.discovered(),
            corpus_size: self.stats.corpus_size(),
            crashes: self.stats.crashes(),
            elapsed: self.stats.elapsed(),
        }
    }

    fn fuzz_loop(&mut self) -> Result<(), FuzzerError> {
        while !self.should_stop() {
            let (entry, budget) = self.scheduler.pick_next(&mut self.rng)?;
            self.fuzz_one(&entry, budget)?;
        }
        Ok(())
    }

    /// Spends `budget` mutated executions on `entry`, returning early when the
    /// run has to stop.
    fn fuzz_one(&mut self, entry: &CorpusEntry, budget: usize) -> Result<(), FuzzerError> {
        self.mutator.set_input(&entry.path)?;

        for _ in 0..budget {
            let mutated = self.mutator.next_mutation(&mut self.rng)?;
            let mut observation = self.executor.run(&mutated)?;
            if self.stop.load(Ordering::SeqCst) {
                // Interrupted while the target ran; its status says nothing
                // about the input.
                debug!("discarding execution interrupted by stop request");
                return Ok(());
            }
            self.stats.record_execution();

            if observation.is_crash {
                self.save_crash(entry, &mutated)?;
                if self.options.stop_on_first_crash {
                    info!(
                        "Stopping on first crash after {:.02} seconds",
                        self.stats.elapsed().as_secs_f64()
                    );
                    self.stop.store(true, Ordering::SeqCst);
                    return Ok(());
                }
            }

            let is_new = self.scheduler.classify_and_merge(&observation);
            observation.is_new = Some(is_new);
            if is_new {
                let id = self.allocate_entry_id();
                info!(
                    "[{id}] New input: \"{}\"",
                    String::from_utf8_lossy(&mutated).trim()
                );
                let new_entry = self.store.save_discovery(id, entry.id, &mutated)?;
                self.scheduler.admit(new_entry, &observation, Some(entry.id));
                self.stats.record_discovery();
                self.stats.record_corpus_entry();
            }

            if self.should_stop() {
                return Ok(());
            }
        }
        Ok(())
    }

    fn save_crash(
        &mut self,
        source: &CorpusEntry,
        bytes: &[u8],
    ) -> Result<CrashRecord, FuzzerError> {
        let id = CrashId(self.next_crash_id);
        self.next_crash_id += 1;
        let record = self.store.save_crash(id, source.id, bytes)?;
        self.stats.record_crash();
        info!("Crashing input: \"{}\"", String::from_utf8_lossy(bytes));
        Ok(record)
    }

    fn allocate_entry_id(&mut self) -> EntryId {
        let id = EntryId(self.next_entry_id);
        self.next_entry_id += 1;
        id
    }

    /// True once the stop flag is raised. Exhausting the execution cap or the
    /// time limit raises it too.
    fn should_stop(&self) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            return true;
        }
        let out_of_executions = self
            .options
            .max_executions
            .is_some_and(|max| self.stats.executions() >= max);
        let out_of_time = self
            .options
            .time_limit
            .is_some_and(|limit| self.stats.elapsed() >= limit);
        if out_of_executions || out_of_time {
            self.stop.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    fn expect_phase(&self, expected: Phase) -> Result<(), FuzzerError> {
        if self.phase != expected {
            return Err(FuzzerError::WrongPhase {
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }
}

/// Regular files directly inside `input_dir`, sorted by name.
fn collect_seed_paths(input_dir: &Path) -> Result<Vec<PathBuf>, FuzzerError> {
    let read_err = |source| FuzzerError::SeedRead {
        path: input_dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for dir_entry in fs::read_dir(input_dir).map_err(read_err)? {
        let path = dir_entry.map_err(read_err)?.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
