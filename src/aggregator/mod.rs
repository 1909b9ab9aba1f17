pub mod metrics;
pub mod persist;
pub mod types;

pub use metrics::Metrics;
pub use types::{ExpectedResult, FailedEntry, ProgressUpdate, ResultPayload};

use crate::error::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

/// Classification of a rejected `processResult`/`processProgressUpdate` call,
/// distinct from the I/O-bound `AggregatorError` so HTTP handlers can map it
/// to a status code without inspecting error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Forbidden,
    Duplicate,
}

/// Outcome of `processResult`, distinguishing the 200/500 cases that
/// `RejectReason` alone (403/409) doesn't cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Persisted,
    PersistFailed,
    Rejected(RejectReason),
}

struct ResultsState {
    expected: HashSet<String>,
    received: HashSet<String>,
    failed: HashMap<String, FailedEntry>,
    synthetic_failures: HashSet<String>,
}

/// Owns the received/failed/expected maps and the output directory. All
/// public operations are thread-safe; `resultsMutex` (here `results`) guards
/// received/failed/expected, `progressMutex` (here `progress`) guards the
/// latest-progress map, and the two are never held together.
pub struct Aggregator {
    results: RwLock<ResultsState>,
    progress: RwLock<HashMap<String, ProgressUpdate>>,
    output_dir: PathBuf,
    retry_window: Duration,
    completion: Notify,
    metrics: Arc<Metrics>,
}

impl Aggregator {
    pub fn new(expected: Vec<ExpectedResult>, output_dir: PathBuf, retry_window: Duration, metrics: Arc<Metrics>) -> Self {
        let expected_keys: HashSet<String> = expected.iter().map(ExpectedResult::key).collect();
        metrics.set_expected_count(expected_keys.len() as i64);

        Self {
            results: RwLock::new(ResultsState {
                expected: expected_keys,
                received: HashSet::new(),
                failed: HashMap::new(),
                synthetic_failures: HashSet::new(),
            }),
            progress: RwLock::new(HashMap::new()),
            output_dir,
            retry_window,
            completion: Notify::new(),
            metrics,
        }
    }

    /// Single point through which every result, HTTP or synthetic, flows.
    pub async fn process_result(&self, r: ResultPayload) -> ProcessOutcome {
        let key = r.key();

        {
            let mut state = self.results.write().await;
            if !state.expected.contains(&key) {
                self.metrics.record_forbidden();
                return ProcessOutcome::Rejected(RejectReason::Forbidden);
            }
            let retriable = state.failed.contains_key(&key) || state.synthetic_failures.contains(&key);
            if state.received.contains(&key) && !retriable {
                self.metrics.record_duplicate();
                return ProcessOutcome::Rejected(RejectReason::Duplicate);
            }
            // Optimistically mark received before persisting so isComplete
            // observes a consistent post-persist state without re-acquiring
            // the lock mid-write; a persistence failure below re-marks it
            // failed without removing it from received.
            state.received.insert(key.clone());
        }

        let is_synthetic_failure = r.is_synthetic_failure();
        match persist::persist(&self.output_dir, &r) {
            Ok(()) => {
                let mut state = self.results.write().await;
                state.failed.remove(&key);
                if is_synthetic_failure {
                    state.synthetic_failures.insert(key);
                } else {
                    state.synthetic_failures.remove(&key);
                }
                self.metrics.record_received();
                self.completion.notify_waiters();
                ProcessOutcome::Persisted
            }
            Err(_) => {
                let mut state = self.results.write().await;
                state.failed.insert(
                    key,
                    FailedEntry {
                        recorded_at: Utc::now(),
                    },
                );
                self.metrics.record_failed();
                ProcessOutcome::PersistFailed
            }
        }
    }

    pub async fn process_progress_update(
        &self,
        p: ProgressUpdate,
    ) -> std::result::Result<(), RejectReason> {
        let key = p.key();
        {
            let state = self.results.read().await;
            if !state.expected.contains(&key) {
                self.metrics.record_forbidden();
                return Err(RejectReason::Forbidden);
            }
        }
        let mut progress = self.progress.write().await;
        progress.insert(key, p);
        Ok(())
    }

    pub async fn is_complete(&self) -> bool {
        let state = self.results.read().await;
        state.expected.iter().all(|k| state.received.contains(k))
    }

    /// Blocks until `isComplete` is true or `stop` fires, then sleeps out
    /// the retry window for any still-outstanding failed-map entries. This
    /// window is observed even when every result is already present, since
    /// a retry can arrive after the persisted success that completed the run.
    pub async fn wait(&self, stop: &CancellationToken) -> Result<()> {
        loop {
            if self.is_complete().await {
                break;
            }
            tokio::select! {
                _ = self.completion.notified() => continue,
                _ = stop.cancelled() => return Ok(()),
            }
        }

        self.wait_out_retry_window(stop).await;
        Ok(())
    }

    async fn wait_out_retry_window(&self, stop: &CancellationToken) {
        loop {
            let oldest_age = {
                let state = self.results.read().await;
                state
                    .failed
                    .values()
                    .map(|e| Utc::now().signed_duration_since(e.recorded_at))
                    .filter_map(|d| d.to_std().ok())
                    .max()
            };

            let Some(age) = oldest_age else { break };
            if age >= self.retry_window {
                break;
            }
            let remaining = self.retry_window - age;
            tokio::select! {
                _ = tokio::time::sleep(remaining) => continue,
                _ = stop.cancelled() => break,
            }
        }
    }

    pub async fn plugin_has_results(&self, plugin: &str) -> bool {
        let state = self.results.read().await;
        state
            .expected
            .iter()
            .filter(|k| k.starts_with(&format!("{plugin}/")))
            .all(|k| state.received.contains(k))
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn output_dir(&self) -> &PathBuf {
        &self.output_dir
    }

    pub async fn snapshot_progress(&self, key: &str) -> Option<ProgressUpdate> {
        self.progress.read().await.get(key).cloned()
    }

    pub async fn snapshot(&self) -> AggregatorSnapshot {
        let state = self.results.read().await;
        AggregatorSnapshot {
            expected: state.expected.iter().cloned().collect(),
            received: state.received.iter().cloned().collect(),
            synthetic_failures: state.synthetic_failures.iter().cloned().collect(),
        }
    }
}

/// A point-in-time view used by the status annotator; cloned out from under
/// the lock so annotation serialization never blocks result processing.
pub struct AggregatorSnapshot {
    pub expected: Vec<String>,
    pub received: Vec<String>,
    /// Received keys whose persisted result was a Supervisor-synthesized
    /// failure rather than a real plugin upload.
    pub synthetic_failures: Vec<String>,
}
