pub mod config;
pub mod corpus;
pub mod coverage;
pub mod executor;
pub mod fuzzer;
pub mod mutator;
pub mod scheduler;
pub mod stats;

pub use config::{ConfigError, RunSettings, TypistConfig};
pub use corpus::{
    CorpusEntry, CorpusStore, CrashId, CrashRecord, EntryId, OutputLayout, StorageError,
};
pub use coverage::{CoverageObservation, MAP_SIZE, VirginMap};
pub use executor::{ExecError, Executor, InProcessExecutor, InputDelivery, ReturnCodeExecutor};
pub use fuzzer::{Fuzzer, FuzzerError, FuzzerOptions, Phase, RunSummary};
pub use mutator::{PresetMutator, Mutator, MutatorError, MutatorPreset};
pub use scheduler::{RoundRobinScheduler, Scheduler, SchedulerError};
pub use stats::{RunStats, StatsReporter};
