//! Fetch orchestration — dispatches batches of independent fetch tasks.
//!
//! Two modes: serial with a fixed inter-task delay (rate-limit friendly),
//! and concurrent over a bounded private rayon pool (never the global pool,
//! so a large batch cannot starve unrelated work). One task's failure never
//! aborts the batch; the report carries per-task failures plus aggregate
//! stats. The orchestrator owns no persistent state — it is a pure
//! execution service invoked by the cache layers.

use crate::error::DataError;
use std::sync::Arc;
use std::time::Duration;

/// Hook for hosting environments that require worker threads to be
/// registered with a shared execution context. Bound once per pool thread
/// at startup; core fetch and cache logic never sees it.
pub trait WorkerContext: Send + Sync {
    fn bind(&self);
}

/// Where a task's value came from, for the stats counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Cache,
    Network,
}

/// Successful task outcome plus its source.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub value: T,
    pub source: FetchSource,
}

impl<T> Fetched<T> {
    pub fn cached(value: T) -> Self {
        Self {
            value,
            source: FetchSource::Cache,
        }
    }

    pub fn network(value: T) -> Self {
        Self {
            value,
            source: FetchSource::Network,
        }
    }
}

/// Aggregate counters for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub network_calls: usize,
}

/// Outcome of one batch: successes and failures in task order.
#[derive(Debug)]
pub struct BatchReport<K, T> {
    pub successes: Vec<(K, T)>,
    pub failures: Vec<(K, DataError)>,
    pub stats: BatchStats,
}

impl<K, T> BatchReport<K, T> {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// How a batch is dispatched.
#[derive(Debug, Clone, Copy)]
pub enum DispatchMode {
    /// One task at a time, sleeping `delay` after each task that actually
    /// touched the network.
    Serial { delay: Duration },
    /// Bounded worker pool. Keep `workers` small enough to avoid upstream
    /// anti-abuse throttling.
    Concurrent { workers: usize },
}

pub struct FetchOrchestrator {
    mode: DispatchMode,
    context: Option<Arc<dyn WorkerContext>>,
}

impl FetchOrchestrator {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            mode,
            context: None,
        }
    }

    pub fn serial(delay: Duration) -> Self {
        Self::new(DispatchMode::Serial { delay })
    }

    pub fn concurrent(workers: usize) -> Self {
        Self::new(DispatchMode::Concurrent {
            workers: workers.max(1),
        })
    }

    /// Attach an opaque context handle, propagated to every worker thread.
    pub fn with_context(mut self, context: Arc<dyn WorkerContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Run a batch of independent tasks. `fetch` reports whether each value
    /// came from cache or network so the stats stay honest.
    pub fn run<K, T, F>(&self, tasks: Vec<K>, fetch: F) -> BatchReport<K, T>
    where
        K: Send,
        T: Send,
        F: Fn(&K) -> Result<Fetched<T>, DataError> + Send + Sync,
    {
        let outcomes: Vec<(K, Result<Fetched<T>, DataError>)> = match self.mode {
            DispatchMode::Serial { delay } => tasks
                .into_iter()
                .map(|key| {
                    let outcome = fetch(&key);
                    let touched_network =
                        !matches!(&outcome, Ok(f) if f.source == FetchSource::Cache);
                    if touched_network && !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    (key, outcome)
                })
                .collect(),
            DispatchMode::Concurrent { workers } => {
                use rayon::prelude::*;

                let mut builder = rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(|i| format!("quotevault-fetch-{i}"));
                if let Some(context) = self.context.clone() {
                    builder = builder.start_handler(move |_| context.bind());
                }
                let pool = builder.build().expect("failed to build fetch worker pool");

                pool.install(|| {
                    tasks
                        .into_par_iter()
                        .map(|key| {
                            let outcome = fetch(&key);
                            (key, outcome)
                        })
                        .collect()
                })
            }
        };

        let mut report = BatchReport {
            successes: Vec::new(),
            failures: Vec::new(),
            stats: BatchStats::default(),
        };
        for (key, outcome) in outcomes {
            report.stats.total += 1;
            match outcome {
                Ok(fetched) => {
                    report.stats.success += 1;
                    match fetched.source {
                        FetchSource::Cache => report.stats.cache_hits += 1,
                        FetchSource::Network => report.stats.network_calls += 1,
                    }
                    report.successes.push((key, fetched.value));
                }
                Err(err) => {
                    report.stats.failed += 1;
                    report.stats.network_calls += 1;
                    report.failures.push((key, err));
                }
            }
        }
        report
    }
}

/// Exponential backoff owned by a single task's retry loop.
///
/// Deliberately per-task state: two unrelated tasks never share a backoff
/// value. Delay doubles on consecutive failures from a fixed floor and
/// resets to zero on any success.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration) -> Self {
        Self {
            floor,
            current: Duration::ZERO,
        }
    }

    /// Current delay to sleep before the next attempt.
    pub fn delay(&self) -> Duration {
        self.current
    }

    pub fn record_failure(&mut self) {
        self.current = if self.current.is_zero() {
            self.floor
        } else {
            self.current.saturating_mul(2)
        };
    }

    pub fn record_success(&mut self) {
        self.current = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn backoff_is_monotonic_until_success() {
        let mut backoff = Backoff::new(Duration::from_secs(60));
        assert_eq!(backoff.delay(), Duration::ZERO);

        let mut previous = Duration::ZERO;
        for _ in 0..5 {
            backoff.record_failure();
            assert!(backoff.delay() >= previous);
            previous = backoff.delay();
        }
        assert_eq!(previous, Duration::from_secs(60 * 16));

        backoff.record_success();
        assert_eq!(backoff.delay(), Duration::ZERO);

        // After a reset the ladder starts again from the floor.
        backoff.record_failure();
        assert_eq!(backoff.delay(), Duration::from_secs(60));
    }

    #[test]
    fn serial_batch_isolates_failures_and_counts_sources() {
        let orchestrator = FetchOrchestrator::serial(Duration::ZERO);
        let report = orchestrator.run(vec![1u32, 2, 3, 4], |key| match key {
            1 => Ok(Fetched::cached(*key * 10)),
            2 => Err(DataError::Exhausted {
                key: key.to_string(),
            }),
            _ => Ok(Fetched::network(*key * 10)),
        });

        assert_eq!(report.successes.len(), 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.stats.total, 4);
        assert_eq!(report.stats.success, 3);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.stats.cache_hits, 1);
        assert_eq!(report.stats.network_calls, 3);
        assert!(!report.all_succeeded());

        // Serial dispatch preserves task order.
        assert_eq!(report.successes[0], (1, 10));
        assert_eq!(report.successes[1], (3, 30));
    }

    #[test]
    fn concurrent_batch_runs_every_task() {
        let orchestrator = FetchOrchestrator::concurrent(4);
        let calls = AtomicUsize::new(0);
        let report = orchestrator.run((0u32..32).collect(), |key| {
            calls.fetch_add(1, Ordering::SeqCst);
            if key % 8 == 0 {
                Err(DataError::Exhausted {
                    key: key.to_string(),
                })
            } else {
                Ok(Fetched::network(*key))
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 32);
        assert_eq!(report.stats.total, 32);
        assert_eq!(report.stats.failed, 4);
        assert_eq!(report.stats.success, 28);
    }

    struct RecordingContext {
        bound: Mutex<Vec<String>>,
    }

    impl WorkerContext for RecordingContext {
        fn bind(&self) {
            let name = std::thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_string();
            self.bound.lock().unwrap().push(name);
        }
    }

    #[test]
    fn context_is_bound_on_every_worker_thread() {
        let context = Arc::new(RecordingContext {
            bound: Mutex::new(Vec::new()),
        });
        let orchestrator = FetchOrchestrator::concurrent(3).with_context(context.clone());
        let report = orchestrator.run(vec![1u32, 2, 3], |key| Ok(Fetched::network(*key)));

        assert_eq!(report.stats.success, 3);
        let bound = context.bound.lock().unwrap();
        assert_eq!(bound.len(), 3);
        assert!(bound.iter().all(|n| n.starts_with("quotevault-fetch-")));
    }
}
