//! Contract between the orchestrator and whatever executes training tasks.
//!
//! A launched task is split into two halves connected by watch channels:
//! the [`TaskHandle`] the orchestrator polls and the [`TaskReporter`] the
//! execution substrate writes progress, results and the final outcome to.
//! Cancellation is cooperative: the handle only raises a flag the reporter
//! side observes.

use std::collections::BTreeMap;

use automl_config::{AlgorithmId, SortMetric};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::plan::WorkKind;

/// A trained model as seen by the leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    /// Unique model key; the leaderboard deduplicates on it.
    pub key: String,
    pub algo: AlgorithmId,
    /// Finer grouping than `algo`, e.g. `XRT` for randomized DRF models.
    pub model_type: String,
    /// Metric values by name, e.g. `auc` or `rmse`.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl ModelResult {
    #[must_use]
    pub fn metric(&self, metric: SortMetric) -> Option<f64> {
        self.metrics
            .get(metric.key())
            .copied()
            .filter(|v| !v.is_nan())
    }
}

/// Limits for a hyperparameter search. Zero means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub max_models: u32,
    pub max_runtime_secs: f64,
    /// Fixed seed for the search; random when unset.
    #[serde(default)]
    pub seed: Option<u64>,
    pub stopping_rounds: u32,
    pub stopping_tolerance: f64,
}

/// Everything a substrate needs to run one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Model key for builds, search key for searches.
    pub key: String,
    pub algo: AlgorithmId,
    pub kind: WorkKind,
    /// Name used in result keys, e.g. `XRT` or `GBM`.
    pub model_type: String,
    /// Full trainer parameters, defaults merged in.
    pub params: Map<String, Value>,
    /// Values to explore, searches only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hyper_params: BTreeMap<String, Vec<Value>>,
    /// Search limits; `None` for single builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchCriteria>,
}

/// What a finished task produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    Model(ModelResult),
    Search(Vec<ModelResult>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(TaskOutput),
    /// Stopped on request without a result.
    Cancelled,
    Crashed(String),
}

#[derive(Debug, Clone, Default)]
struct TaskState {
    progress: f64,
    /// Results a search has finished so far.
    results: Vec<ModelResult>,
    outcome: Option<TaskOutcome>,
}

/// Create a connected handle/reporter pair for one task.
#[must_use]
pub fn task_channel(key: impl Into<String>, kind: WorkKind) -> (TaskHandle, TaskReporter) {
    let (state_tx, state_rx) = watch::channel(TaskState::default());
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = TaskHandle {
        key: key.into(),
        kind,
        state: state_rx,
        stop: std::sync::Arc::new(stop_tx),
    };
    let reporter = TaskReporter {
        state: state_tx,
        stop: stop_rx,
    };
    (handle, reporter)
}

/// Orchestrator side of a running task.
#[derive(Clone)]
pub struct TaskHandle {
    key: String,
    kind: WorkKind,
    state: watch::Receiver<TaskState>,
    stop: std::sync::Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("running", &self.is_running())
            .finish()
    }
}

impl TaskHandle {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn kind(&self) -> WorkKind {
        self.kind
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.borrow().outcome.is_none()
    }

    /// Self-reported progress in `[0, 1]`.
    #[must_use]
    pub fn progress(&self) -> f64 {
        self.state.borrow().progress
    }

    /// Ask the task to stop. Advisory; the task acknowledges by finishing.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Number of results a search has made available so far.
    #[must_use]
    pub fn result_count(&self) -> usize {
        self.state.borrow().results.len()
    }

    /// Results made available after the first `seen`.
    #[must_use]
    pub fn results_since(&self, seen: usize) -> Vec<ModelResult> {
        self.state
            .borrow()
            .results
            .iter()
            .skip(seen)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.state.borrow().outcome.clone()
    }

    #[must_use]
    pub fn is_crashed(&self) -> bool {
        matches!(self.state.borrow().outcome, Some(TaskOutcome::Crashed(_)))
    }

    /// Wait until the task reports an outcome.
    pub async fn wait(&self) -> TaskOutcome {
        let mut state = self.state.clone();
        match state.wait_for(|s| s.outcome.is_some()).await {
            Ok(s) => s
                .outcome
                .clone()
                .unwrap_or_else(|| TaskOutcome::Crashed("task reported no outcome".into())),
            Err(_) => TaskOutcome::Crashed("task substrate went away".into()),
        }
    }
}

/// Substrate side of a running task.
///
/// Dropping a reporter that never reported an outcome marks the task crashed,
/// so the orchestrator never waits on a task nobody is driving.
pub struct TaskReporter {
    state: watch::Sender<TaskState>,
    stop: watch::Receiver<bool>,
}

impl TaskReporter {
    /// Record progress; clamped to `[0, 1]` and never moves backwards.
    pub fn set_progress(&self, progress: f64) {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        self.state.send_if_modified(|s| {
            if progress > s.progress {
                s.progress = progress;
                true
            } else {
                false
            }
        });
    }

    /// Make one finished search result available.
    pub fn push_result(&self, result: ModelResult) {
        self.state.send_modify(|s| s.results.push(result));
    }

    /// Results pushed so far.
    #[must_use]
    pub fn results(&self) -> Vec<ModelResult> {
        self.state.borrow().results.clone()
    }

    /// Report the final outcome. Only the first call has any effect.
    pub fn finish(&self, outcome: TaskOutcome) -> bool {
        self.state.send_if_modified(|s| {
            if s.outcome.is_some() {
                return false;
            }
            if matches!(outcome, TaskOutcome::Completed(_)) {
                s.progress = 1.0;
            }
            s.outcome = Some(outcome);
            true
        })
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.borrow().outcome.is_some()
    }

    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        let mut stop = self.stop.clone();
        if stop.wait_for(|s| *s).await.is_err() {
            // handle side dropped: nobody can ask us to stop anymore
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for TaskReporter {
    fn drop(&mut self) {
        self.finish(TaskOutcome::Crashed(
            "task ended without reporting an outcome".into(),
        ));
    }
}

/// Errors raised while launching a task.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("{0} is not available")]
    Unavailable(AlgorithmId),
    #[error("failed to spawn trainer for {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("failed to write task file {0}: {1}")]
    Io(std::path::PathBuf, std::io::Error),
    #[error("failed to serialize task {0}: {1}")]
    Serialize(String, String),
    #[error("task {0} rejected: {1}")]
    Rejected(String, String),
}

/// Something that can run training tasks.
pub trait TaskLauncher: Send + Sync {
    /// Start a task. Must be called from within a tokio runtime.
    fn launch(&self, spec: TaskSpec) -> Result<TaskHandle, LaunchError>;

    /// Whether this substrate can train the given algorithm at all.
    fn is_available(&self, _algo: AlgorithmId) -> bool {
        true
    }

    /// Drop cross-validation predictions kept for the given models.
    fn cleanup_cv_predictions(&self, _keys: &[String]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(key: &str) -> ModelResult {
        ModelResult {
            key: key.to_string(),
            algo: AlgorithmId::Gbm,
            model_type: "GBM".to_string(),
            metrics: BTreeMap::from([("auc".to_string(), 0.8)]),
        }
    }

    #[test]
    fn test_progress_is_clamped_and_monotonic() {
        let (handle, reporter) = task_channel("t", WorkKind::Build);
        reporter.set_progress(0.4);
        reporter.set_progress(0.2);
        assert_eq!(handle.progress(), 0.4);
        reporter.set_progress(7.0);
        assert_eq!(handle.progress(), 1.0);
    }

    #[test]
    fn test_incremental_results() {
        let (handle, reporter) = task_channel("grid", WorkKind::Search);
        reporter.push_result(result("a"));
        reporter.push_result(result("b"));
        assert_eq!(handle.result_count(), 2);
        reporter.push_result(result("c"));

        let new = handle.results_since(2);
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].key, "c");
    }

    #[test]
    fn test_first_outcome_wins() {
        let (handle, reporter) = task_channel("t", WorkKind::Build);
        assert!(handle.is_running());
        assert!(reporter.finish(TaskOutcome::Cancelled));
        assert!(!reporter.finish(TaskOutcome::Crashed("late".into())));
        assert!(!handle.is_running());
        assert_eq!(handle.outcome(), Some(TaskOutcome::Cancelled));
    }

    #[test]
    fn test_dropped_reporter_marks_crash() {
        let (handle, reporter) = task_channel("t", WorkKind::Build);
        drop(reporter);
        assert!(handle.is_crashed());
    }

    #[tokio::test]
    async fn test_stop_request_reaches_reporter() {
        let (handle, reporter) = task_channel("t", WorkKind::Build);
        let driver = tokio::spawn(async move {
            reporter.stopped().await;
            reporter.finish(TaskOutcome::Cancelled);
        });

        handle.request_stop();
        assert!(handle.is_stop_requested());
        assert_eq!(handle.wait().await, TaskOutcome::Cancelled);
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_returns_completed_result() {
        let (handle, reporter) = task_channel("t", WorkKind::Build);
        reporter.finish(TaskOutcome::Completed(TaskOutput::Model(result("m"))));
        assert_eq!(handle.progress(), 1.0);
        match handle.wait().await {
            TaskOutcome::Completed(TaskOutput::Model(m)) => assert_eq!(m.key, "m"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
