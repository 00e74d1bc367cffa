use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Default pause between two statistics reports.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Counters shared between the fuzzing worker and the reporter.
///
/// The worker is the only writer; every counter only ever grows.
#[derive(Debug)]
pub struct RunStats {
    executions: AtomicU64,
    discovered: AtomicU64,
    corpus_size: AtomicU64,
    crashes: AtomicU64,
    start_time: Instant,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            executions: AtomicU64::new(0),
            discovered: AtomicU64::new(0),
            corpus_size: AtomicU64::new(0),
            crashes: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discovery(&self) {
        self.discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corpus_entry(&self) {
        self.corpus_size.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_crash(&self) {
        self.crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn discovered(&self) -> u64 {
        self.discovered.load(Ordering::Relaxed)
    }

    pub fn corpus_size(&self) -> u64 {
        self.corpus_size.load(Ordering::Relaxed)
    }

    pub fn crashes(&self) -> u64 {
        self.crashes.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Raises the stop flag when dropped, so the worker never outlives a reporter
/// that returned or panicked.
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Background thread printing throughput while the worker fuzzes.
#[derive(Debug)]
pub struct StatsReporter {
    handle: JoinHandle<()>,
}

impl StatsReporter {
    /// Starts the reporter. It waits one `interval`, then reports and sleeps in
    /// turn until it sees the stop flag, reporting once more before exiting.
    pub fn spawn(
        stats: Arc<RunStats>,
        stop: Arc<AtomicBool>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name("stats-reporter".to_string())
            .spawn(move || {
                let _guard = StopOnDrop(stop.clone());
                let mut last_report = Instant::now();
                let mut last_execs = 0u64;
                thread::sleep(interval);
                loop {
                    let now = Instant::now();
                    let executions = stats.executions();
                    let window = now.duration_since(last_report).as_secs_f64();
                    let execs_per_sec = if window > 0.0 {
                        (executions - last_execs) as f64 / window
                    } else {
                        0.0
                    };
                    info!(
                        "Execs: {}; Corpus: {}; Crashes: {}; Time elapsed: {:.3}; Execs/sec: {:.2}",
                        executions,
                        stats.corpus_size(),
                        stats.crashes(),
                        stats.elapsed().as_secs_f64(),
                        execs_per_sec
                    );
                    last_report = now;
                    last_execs = executions;

                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    thread::sleep(interval);
                }
            })?;
        Ok(Self { handle })
    }

    /// Waits for the reporter to finish its last report.
    pub fn join(self) {
        if self.handle.join().is_err() {
            warn!("stats reporter panicked");
        }
    }
}
