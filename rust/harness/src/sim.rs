//! In-process task substrate driven by tokio timers.
//!
//! Tasks advance their progress by a fixed step every tick and produce
//! models whose metrics are derived from the model key, so runs are
//! reproducible. Families can be marked unavailable, crashing or refusing
//! to launch to exercise the orchestrator's failure paths.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    hash::{DefaultHasher, Hash, Hasher},
    sync::Mutex,
    time::Duration,
};

use automl_config::AlgorithmId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    plan::WorkKind,
    task::{
        LaunchError, ModelResult, TaskHandle, TaskLauncher, TaskOutcome, TaskOutput,
        TaskReporter, TaskSpec, task_channel,
    },
};

/// Pace and size of simulated tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimSettings {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Progress added per tick.
    #[serde(default = "default_step")]
    pub step: f64,
    /// Models a search produces when unconstrained.
    #[serde(default = "default_search_size")]
    pub search_size: u32,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            step: default_step(),
            search_size: default_search_size(),
        }
    }
}

fn default_tick_ms() -> u64 {
    100
}

fn default_step() -> f64 {
    0.25
}

fn default_search_size() -> u32 {
    4
}

/// Simulated substrate.
#[derive(Default)]
pub struct SimulatedLauncher {
    settings: SimSettings,
    unavailable: HashSet<AlgorithmId>,
    crashing: HashSet<AlgorithmId>,
    refusing: HashSet<AlgorithmId>,
    launched: Mutex<Vec<TaskSpec>>,
    cleaned: Mutex<Vec<String>>,
    /// Models reserved per search key, so searches sharing a key never reuse a name.
    search_models: Mutex<HashMap<String, u32>>,
}

impl SimulatedLauncher {
    #[must_use]
    pub fn new(settings: SimSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn unavailable(mut self, algo: AlgorithmId) -> Self {
        self.unavailable.insert(algo);
        self
    }

    /// Tasks of `algo` crash half-way.
    #[must_use]
    pub fn crashing(mut self, algo: AlgorithmId) -> Self {
        self.crashing.insert(algo);
        self
    }

    /// Launching `algo` fails outright.
    #[must_use]
    pub fn refusing(mut self, algo: AlgorithmId) -> Self {
        self.refusing.insert(algo);
        self
    }

    /// Every task launched so far, in launch order.
    #[must_use]
    pub fn launched(&self) -> Vec<TaskSpec> {
        self.launched
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Models whose CV predictions were cleaned up.
    #[must_use]
    pub fn cleaned(&self) -> Vec<String> {
        self.cleaned
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl TaskLauncher for SimulatedLauncher {
    fn launch(&self, spec: TaskSpec) -> Result<TaskHandle, LaunchError> {
        if self.unavailable.contains(&spec.algo) {
            return Err(LaunchError::Unavailable(spec.algo));
        }
        if self.refusing.contains(&spec.algo) {
            return Err(LaunchError::Rejected(
                spec.key.clone(),
                "simulated launch failure".into(),
            ));
        }

        self.launched
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(spec.clone());

        let size = search_size(&spec, self.settings.search_size);
        let first_model = if spec.kind == WorkKind::Search {
            let mut reserved = self
                .search_models
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let next = reserved.entry(spec.key.clone()).or_insert(0);
            let first = *next + 1;
            *next += size;
            first
        } else {
            1
        };

        let (handle, reporter) = task_channel(spec.key.clone(), spec.kind);
        let task = SimTask {
            size,
            first_model,
            runtime_limit: runtime_limit(&spec),
            crash: self.crashing.contains(&spec.algo),
            settings: self.settings.clone(),
            spec,
        };
        tokio::spawn(task.run(reporter));
        Ok(handle)
    }

    fn is_available(&self, algo: AlgorithmId) -> bool {
        !self.unavailable.contains(&algo)
    }

    fn cleanup_cv_predictions(&self, keys: &[String]) {
        self.cleaned
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend(keys.iter().cloned());
    }
}

fn search_size(spec: &TaskSpec, default: u32) -> u32 {
    match (&spec.kind, &spec.search) {
        (WorkKind::Build, _) => 1,
        (WorkKind::Search, Some(criteria)) if criteria.max_models > 0 => {
            default.min(criteria.max_models)
        }
        (WorkKind::Search, _) => default,
    }
}

fn runtime_limit(spec: &TaskSpec) -> Option<Duration> {
    let secs = match &spec.search {
        Some(criteria) => criteria.max_runtime_secs,
        None => spec
            .params
            .get("max_runtime_secs")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0),
    };
    (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f64(secs))
}

struct SimTask {
    spec: TaskSpec,
    settings: SimSettings,
    size: u32,
    first_model: u32,
    runtime_limit: Option<Duration>,
    crash: bool,
}

impl SimTask {
    async fn run(self, reporter: TaskReporter) {
        let started = Instant::now();
        let tick = Duration::from_millis(self.settings.tick_ms.max(1));
        let mut progress = 0.0;
        let mut models = Vec::new();

        loop {
            tokio::select! {
                biased;
                () = reporter.stopped() => {
                    reporter.finish(TaskOutcome::Cancelled);
                    return;
                }
                () = tokio::time::sleep(tick) => {}
            }

            progress += self.settings.step;
            reporter.set_progress(progress);

            if self.crash && progress >= 0.5 {
                reporter.finish(TaskOutcome::Crashed(format!(
                    "{} crashed (simulated)",
                    self.spec.key
                )));
                return;
            }

            if self.spec.kind == WorkKind::Search {
                // models finish evenly over the search's lifetime
                let due = ((progress.min(1.0) * f64::from(self.size)).floor() as u32).min(self.size);
                while (models.len() as u32) < due {
                    let n = self.first_model + models.len() as u32;
                    let model = self.model(&format!("{}_model_{n}", self.spec.key));
                    reporter.push_result(model.clone());
                    models.push(model);
                }
            }

            let out_of_time = self
                .runtime_limit
                .is_some_and(|limit| started.elapsed() >= limit);
            if progress >= 1.0 - 1e-9 || out_of_time {
                let output = match self.spec.kind {
                    WorkKind::Build => TaskOutput::Model(self.model(&self.spec.key)),
                    WorkKind::Search => TaskOutput::Search(models),
                };
                reporter.finish(TaskOutcome::Completed(output));
                return;
            }
        }
    }

    fn model(&self, key: &str) -> ModelResult {
        ModelResult {
            key: key.to_string(),
            algo: self.spec.algo,
            model_type: self.spec.model_type.clone(),
            metrics: simulated_metrics(key),
        }
    }
}

/// Plausible metrics derived from a model key.
#[must_use]
pub fn simulated_metrics(key: &str) -> BTreeMap<String, f64> {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let quality = (hasher.finish() % 10_000) as f64 / 10_000.0;

    let error = 0.5 - 0.4 * quality;
    BTreeMap::from([
        ("auc".to_string(), 0.6 + 0.35 * quality),
        ("logloss".to_string(), 0.7 - 0.5 * quality),
        ("mean_per_class_error".to_string(), 0.45 - 0.4 * quality),
        ("rmse".to_string(), error),
        ("mse".to_string(), error * error),
        ("mae".to_string(), 0.8 * error),
        ("rmsle".to_string(), 0.3 * error),
        ("mean_residual_deviance".to_string(), error * error),
    ])
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, json};

    use super::*;
    use crate::task::SearchCriteria;

    fn spec(key: &str, kind: WorkKind) -> TaskSpec {
        TaskSpec {
            key: key.to_string(),
            algo: AlgorithmId::Gbm,
            kind,
            model_type: "GBM".into(),
            params: Map::new(),
            hyper_params: BTreeMap::new(),
            search: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_completes_with_model() {
        let launcher = SimulatedLauncher::default();
        let handle = launcher.launch(spec("GBM_1", WorkKind::Build)).unwrap();
        match handle.wait().await {
            TaskOutcome::Completed(TaskOutput::Model(m)) => {
                assert_eq!(m.key, "GBM_1");
                assert_eq!(m.metrics, simulated_metrics("GBM_1"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(launcher.launched().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_respects_max_models() {
        let launcher = SimulatedLauncher::new(SimSettings {
            search_size: 10,
            ..SimSettings::default()
        });
        let mut grid = spec("GBM_grid_1", WorkKind::Search);
        grid.search = Some(SearchCriteria {
            max_models: 3,
            max_runtime_secs: 0.0,
            seed: None,
            stopping_rounds: 3,
            stopping_tolerance: 0.01,
        });
        let handle = launcher.launch(grid).unwrap();
        match handle.wait().await {
            TaskOutcome::Completed(TaskOutput::Search(models)) => {
                assert_eq!(models.len(), 3);
                assert_eq!(models[2].key, "GBM_grid_1_model_3");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(handle.result_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_searches_sharing_a_key_get_distinct_models() {
        let launcher = SimulatedLauncher::new(SimSettings {
            search_size: 2,
            ..SimSettings::default()
        });
        let mut keys = Vec::new();
        for _ in 0..2 {
            let handle = launcher
                .launch(spec("DeepLearning_grid_1", WorkKind::Search))
                .unwrap();
            handle.wait().await;
            keys.extend(handle.results_since(0).into_iter().map(|m| m.key));
        }
        assert_eq!(
            keys,
            [
                "DeepLearning_grid_1_model_1",
                "DeepLearning_grid_1_model_2",
                "DeepLearning_grid_1_model_3",
                "DeepLearning_grid_1_model_4",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_limit_ends_build_early() {
        let launcher = SimulatedLauncher::new(SimSettings {
            tick_ms: 1000,
            step: 0.01,
            ..SimSettings::default()
        });
        let mut build = spec("GBM_1", WorkKind::Build);
        build.params.insert("max_runtime_secs".into(), json!(3.0));
        let handle = launcher.launch(build).unwrap();
        let started = Instant::now();
        assert!(matches!(handle.wait().await, TaskOutcome::Completed(_)));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels() {
        let launcher = SimulatedLauncher::new(SimSettings {
            tick_ms: 1000,
            step: 0.1,
            ..SimSettings::default()
        });
        let handle = launcher.launch(spec("GBM_1", WorkKind::Build)).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.request_stop();
        assert_eq!(handle.wait().await, TaskOutcome::Cancelled);
        assert!((handle.progress() - 0.2).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_modes() {
        let launcher = SimulatedLauncher::default()
            .crashing(AlgorithmId::Gbm)
            .refusing(AlgorithmId::Glm)
            .unavailable(AlgorithmId::XGBoost);

        let handle = launcher.launch(spec("GBM_1", WorkKind::Build)).unwrap();
        assert!(matches!(handle.wait().await, TaskOutcome::Crashed(_)));

        let mut glm = spec("GLM_1", WorkKind::Build);
        glm.algo = AlgorithmId::Glm;
        assert!(matches!(launcher.launch(glm), Err(LaunchError::Rejected(..))));
        assert!(!launcher.is_available(AlgorithmId::XGBoost));
        assert!(launcher.is_available(AlgorithmId::Gbm));
    }
}
