//! The orchestrator: one budgeted AutoML run over a project.
//!
//! Construction validates everything up front (algorithm filters, frames,
//! columns) and rolls back what it created on failure. [`AutoMl::start`]
//! then walks the fixed launch sequence on a tokio task, draining each
//! launched task before the next, and finishes with the ensemble stage.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use automl_config::{AlgorithmId, BuildSpec, SortMetric};
use serde_json::json;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    algos::{self, Step, TaskTemplate, merge_params},
    clock::BudgetClock,
    data::{DataError, DataLayer, PreparedFrames, delete_frames, prepare_frames},
    ensemble::{self, ALL_MODELS, BEST_OF_FAMILY},
    events::{EventLog, Stage},
    keys::{CounterMap, InstanceCounter, RunKeys},
    leaderboard::{Leaderboard, LeaderboardHandle},
    params::{RunParams, resolve_stopping_tolerance},
    plan::{Allocation, Exclusion, PlanError, WorkItem, WorkKind, WorkPlan, build_plan},
    poller::RunContext,
    progress::RunProgress,
    state::{ProjectStore, StoreError, now_timestamp, reserve_run_stamp},
    task::{TaskHandle, TaskLauncher, TaskSpec},
};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Orchestrator settings that aren't part of the build spec.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// How often a running task's progress is read.
    pub poll_interval: Duration,
    /// Work allocation table the plan is built from.
    pub allocations: Vec<Allocation>,
    /// Numbers model keys per model type. Clones share the counter.
    pub model_counter: Arc<dyn InstanceCounter>,
    /// Numbers search keys per model type.
    pub grid_counter: Arc<dyn InstanceCounter>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            allocations: WorkPlan::default_allocations(),
            model_counter: Arc::new(CounterMap::default()),
            grid_counter: Arc::new(CounterMap::default()),
        }
    }
}

/// What a finished run reports.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub project: String,
    /// Models this run added to the leaderboard, ensembles included.
    pub models_built: u32,
    /// Work units reported to the progress sink.
    pub worked: u64,
    /// Work units in the sealed plan.
    pub total_work: u64,
    pub duration: Duration,
}

/// One AutoML run.
pub struct AutoMl {
    project: String,
    spec: BuildSpec,
    plan: WorkPlan,
    keys: RunKeys,
    frames: PreparedFrames,
    params: RunParams,
    ctx: RunContext,
    launcher: Arc<dyn TaskLauncher>,
    data: Arc<dyn DataLayer>,
    status: watch::Sender<RunStatus>,
}

impl AutoMl {
    /// Validate the build spec and prepare a run without starting it.
    ///
    /// Configuration errors surface here, before any task is launched. On
    /// failure every frame created so far is deleted, and the project is
    /// removed from the store if this call created it.
    pub fn new(
        spec: BuildSpec,
        settings: RunSettings,
        launcher: Arc<dyn TaskLauncher>,
        data: Arc<dyn DataLayer>,
        store: Arc<dyn ProjectStore>,
    ) -> Result<Self, AutoMlError> {
        let (plan, skipped) = build_plan(&spec.models, &settings.allocations, |algo| {
            launcher.is_available(algo)
        })?;

        let project = spec.project();
        let existed = store.exists(&project)?;
        let result = Self::construct(
            spec, settings, plan, &skipped, launcher, data, store.clone(),
        );
        if result.is_err()
            && !existed
            && let Err(e) = store.remove(&project)
        {
            tracing::error!("Failed to remove project {project} after failed construction: {e}");
        }
        result
    }

    fn construct(
        mut spec: BuildSpec,
        settings: RunSettings,
        plan: WorkPlan,
        skipped: &[(AlgorithmId, Exclusion)],
        launcher: Arc<dyn TaskLauncher>,
        data: Arc<dyn DataLayer>,
        store: Arc<dyn ProjectStore>,
    ) -> Result<Self, AutoMlError> {
        let project = spec.project();
        let stamp = reserve_run_stamp(
            store.as_ref(),
            &project,
            chrono::Local::now().naive_local(),
        )?;

        let events = EventLog::new(store.clone(), &project);
        events.info(Stage::Workflow, format!("Project: {project}"));
        events.info(
            Stage::Workflow,
            format!("AutoML job created: {}", now_timestamp()),
        );

        for (algo, why) in skipped {
            match why {
                Exclusion::Unavailable => events.warn(
                    Stage::ModelTraining,
                    format!("AutoML: {algo} is not available; skipping it."),
                ),
                Exclusion::Requested => events.info(
                    Stage::ModelTraining,
                    format!("Disabling Algo: {algo} as requested by the user."),
                ),
            }
        }

        if let Some(fold) = &spec.input.fold_column {
            events.warn(
                Stage::Workflow,
                format!("Custom fold column, {fold}, will be used. nfolds value will be ignored."),
            );
            spec.control.nfolds = 0;
        }
        events.info(
            Stage::Workflow,
            format!("Build control seed: {}", spec.control.stopping.seed),
        );

        let frames = prepare_frames(&spec, data.as_ref(), &events)?;
        let stopping_tolerance =
            resolve_stopping_tolerance(&spec.control.stopping, frames.training.rows, &events);

        let default_metric = SortMetric::default_for(frames.response_kind);
        let leaderboard = match LeaderboardHandle::get_or_create(
            store,
            &project,
            spec.input.sort_metric,
            default_metric,
        ) {
            Ok(leaderboard) => leaderboard,
            Err(e) => {
                delete_frames(data.as_ref(), &frames.created);
                return Err(e.into());
            }
        };

        let ctx = RunContext::new(
            BudgetClock::from_secs_f64(spec.control.stopping.max_runtime_secs),
            events,
            leaderboard,
            RunProgress::new(plan.remaining_work()),
            spec.control.stopping.max_models,
            settings.poll_interval,
        );
        let params = RunParams::new(&spec, &frames, stopping_tolerance);
        let (status, _) = watch::channel(RunStatus::Idle);

        Ok(Self {
            project,
            spec,
            plan,
            keys: RunKeys::with_counters(stamp, settings.model_counter, settings.grid_counter),
            frames,
            params,
            ctx,
            launcher,
            data,
            status,
        })
    }

    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Stamp shared by every key this run creates.
    #[must_use]
    pub fn run_stamp(&self) -> &str {
        self.keys.stamp()
    }

    #[must_use]
    pub fn plan(&self) -> &WorkPlan {
        &self.plan
    }

    #[must_use]
    pub fn frames(&self) -> &PreparedFrames {
        &self.frames
    }

    #[must_use]
    pub fn event_log(&self) -> &EventLog {
        self.ctx.events()
    }

    #[must_use]
    pub fn leaderboard(&self) -> &LeaderboardHandle {
        self.ctx.leaderboard()
    }

    #[must_use]
    pub fn progress(&self) -> &RunProgress {
        self.ctx.progress()
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    /// Milliseconds left in the run's budget, `u64::MAX` when unlimited.
    #[must_use]
    pub fn remaining_time_ms(&self) -> u64 {
        self.ctx.clock().remaining_ms()
    }

    /// Models that may still be built; `None` when unlimited.
    #[must_use]
    pub fn remaining_model_budget(&self) -> Option<u32> {
        self.ctx.remaining_models()
    }

    #[must_use]
    pub fn models_built(&self) -> u32 {
        self.ctx.models_built()
    }

    /// Stop launching new tasks and ask running ones to wind down.
    ///
    /// A running build reports [`RunStatus::Draining`] from here on.
    pub fn request_stop(&self) {
        if self.status() == RunStatus::Stopped {
            return;
        }
        self.ctx.request_stop();
        self.status.send_if_modified(|status| {
            let running = *status == RunStatus::Running;
            if running {
                *status = RunStatus::Draining;
            }
            running
        });
    }

    /// Start the run on the current tokio runtime.
    #[must_use]
    pub fn start(self: Arc<Self>) -> RunHandle {
        self.status.send_replace(RunStatus::Running);
        self.ctx.clock().start();
        self.ctx.events().info(
            Stage::Workflow,
            format!("AutoML build started: {}", now_timestamp()),
        );

        let automl = self.clone();
        let join = tokio::spawn(async move {
            automl.learn().await;
            automl.finalize().await
        });
        RunHandle {
            automl: self,
            join,
        }
    }

    async fn learn(&self) {
        for step in algos::launch_sequence() {
            self.run_step(&step).await;
        }
        self.stack().await;
    }

    async fn run_step(&self, step: &Step) {
        let Some(item) = self.plan.get(step.algo, step.kind) else {
            self.ctx
                .progress()
                .update(0, format!("{} skipped", step.label));
            return;
        };

        let shared_key = (step.kind == WorkKind::Search && step.shared_search_key)
            .then(|| self.keys.grid_key(step.model_type));

        for task in &step.tasks {
            let key = match (&shared_key, step.kind) {
                (Some(key), _) => key.clone(),
                (None, WorkKind::Build) => self.keys.model_key(step.model_type),
                (None, WorkKind::Search) => self.keys.grid_key(step.model_type),
            };
            if item.is_exhausted() {
                tracing::debug!("{}: allocation used up, not launching {key}", step.label);
                continue;
            }

            let handle = if self.ctx.exceeded_limits(&item, &key, false) {
                None
            } else {
                match step.kind {
                    WorkKind::Build => self.launch_build(step, task, &key),
                    WorkKind::Search => self.launch_search(step, task, &key, &item),
                }
            };
            self.ctx.drain_task(&key, &item, handle, false).await;
        }
    }

    fn base_params(&self, algo: AlgorithmId, task: &TaskTemplate) -> serde_json::Map<String, serde_json::Value> {
        let mut params = self.params.common();
        merge_params(
            &mut params,
            &algos::default_params(algo, self.frames.response_kind),
        );
        merge_params(&mut params, &task.params);
        params
    }

    fn launch_build(&self, step: &Step, task: &TaskTemplate, key: &str) -> Option<TaskHandle> {
        let mut params = self.base_params(step.algo, task);
        self.params.apply_stopping(&mut params);
        params.insert(
            "max_runtime_secs".into(),
            json!(self.params.model_runtime(self.ctx.clock(), false)),
        );
        self.params.assign_seed(&mut params);

        self.ctx.events().info(
            Stage::ModelTraining,
            format!("AutoML: starting {key} model training"),
        );
        self.launch(TaskSpec {
            key: key.to_string(),
            algo: step.algo,
            kind: WorkKind::Build,
            model_type: step.model_type.to_string(),
            params,
            hyper_params: BTreeMap::new(),
            search: None,
        })
    }

    fn launch_search(
        &self,
        step: &Step,
        task: &TaskTemplate,
        key: &str,
        item: &WorkItem,
    ) -> Option<TaskHandle> {
        let mut params = self.base_params(step.algo, task);
        self.params.apply_stopping(&mut params);
        params.insert(
            "max_runtime_secs".into(),
            json!(self.spec.control.stopping.max_runtime_secs_per_model),
        );
        let criteria = self.params.search_criteria(
            item.share(),
            self.plan.remaining_work(),
            self.ctx.clock(),
            self.ctx.remaining_models(),
        );
        tracing::debug!(
            "{key}: max_runtime_secs={:.1} max_models={}",
            criteria.max_runtime_secs,
            criteria.max_models
        );

        self.ctx.events().info(
            Stage::ModelTraining,
            format!("AutoML: starting {key} hyperparameter search"),
        );
        self.launch(TaskSpec {
            key: key.to_string(),
            algo: step.algo,
            kind: WorkKind::Search,
            model_type: step.model_type.to_string(),
            params,
            hyper_params: task.hyper_params.clone(),
            search: Some(criteria),
        })
    }

    fn launch(&self, spec: TaskSpec) -> Option<TaskHandle> {
        let key = spec.key.clone();
        match self.launcher.launch(spec) {
            Ok(handle) => {
                self.ctx.register(&handle);
                Some(handle)
            }
            Err(e) => {
                self.ctx.events().warn(
                    Stage::ModelTraining,
                    format!("Skipping training of model {key} due to exception: {e}"),
                );
                None
            }
        }
    }

    /// Ensemble stage: stack the best of each family, then all models.
    async fn stack(&self) {
        let item = self.plan.get(AlgorithmId::StackedEnsemble, WorkKind::Build);
        let leaderboard = self.ctx.leaderboard().snapshot().unwrap_or_else(|e| {
            tracing::error!("Failed to read leaderboard: {e}");
            Leaderboard::new(self.project.clone(), SortMetric::Auc)
        });

        let item = match ensemble::check_eligible(
            item.is_some(),
            leaderboard.count(),
            self.spec.is_cv_enabled(),
            self.params.has_blending_frame(),
        ) {
            Ok(()) => item,
            Err(skip) => {
                let units = match &item {
                    Some(item) if skip.consumes_share() => item.consume_all(),
                    _ => 0,
                };
                self.ctx
                    .progress()
                    .update(units, "StackedEnsemble builds skipped");
                self.ctx.events().info(Stage::ModelTraining, skip.message());
                return;
            }
        };
        let Some(item) = item else {
            return;
        };

        let base = ensemble::select_base_models(&leaderboard);
        for (name, models, keep_base_predictions, description) in [
            (
                BEST_OF_FAMILY,
                base.best_of_family,
                true,
                "StackedEnsemble build using top model from each algorithm type",
            ),
            (
                ALL_MODELS,
                base.all_models,
                false,
                "StackedEnsemble build using all AutoML models",
            ),
        ] {
            let key = self.keys.unique_key(name);
            if item.is_exhausted() {
                continue;
            }
            let handle = if self.ctx.exceeded_limits(&item, &key, true) {
                None
            } else {
                let mut params = self.base_params(AlgorithmId::StackedEnsemble, &TaskTemplate::default());
                merge_params(
                    &mut params,
                    &ensemble::ensemble_params(&self.params, &models, keep_base_predictions),
                );
                params.insert(
                    "max_runtime_secs".into(),
                    json!(self.params.model_runtime(self.ctx.clock(), true)),
                );
                self.params.assign_seed(&mut params);
                self.ctx.events().info(
                    Stage::ModelTraining,
                    format!("AutoML: starting {key} model training"),
                );
                self.launch(TaskSpec {
                    key,
                    algo: AlgorithmId::StackedEnsemble,
                    kind: WorkKind::Build,
                    model_type: AlgorithmId::StackedEnsemble.name().to_string(),
                    params,
                    hyper_params: BTreeMap::new(),
                    search: None,
                })
            };
            self.ctx.drain_task(description, &item, handle, true).await;
        }
    }

    async fn finalize(&self) -> RunSummary {
        self.status.send_replace(RunStatus::Draining);
        self.ctx.drain_active().await;

        // allocations no routine got to, e.g. after a stop request
        for item in self.plan.items() {
            let left = item.consume_all();
            if left > 0 {
                self.ctx.progress().update(
                    left,
                    format!("{} {} not run", item.family(), item.kind()),
                );
            }
        }

        let clock = self.ctx.clock();
        clock.stop();
        let events = self.ctx.events();
        let built = self.ctx.models_built();
        let duration = clock.elapsed();
        events.info(
            Stage::Workflow,
            format!("AutoML build stopped: {}", now_timestamp()),
        );
        events.info(
            Stage::Workflow,
            format!("AutoML build done: built {built} models"),
        );
        events.info_with(
            Stage::Workflow,
            format!("AutoML duration: {}", pretty_duration(duration)),
            "duration_secs",
            duration.as_secs(),
        );

        let log: Vec<String> = events.events().iter().map(ToString::to_string).collect();
        tracing::debug!(
            "Event Log for AutoML run {}:\n{}",
            self.project,
            log.join("\n")
        );

        match self.ctx.leaderboard().snapshot() {
            Ok(leaderboard) => {
                tracing::info!("{}", leaderboard.table());
                if !self.spec.control.keep_cross_validation_predictions {
                    self.launcher
                        .cleanup_cv_predictions(&leaderboard.ranked_keys());
                }
            }
            Err(e) => tracing::error!("Failed to read leaderboard: {e}"),
        }

        self.verify_input_unchanged();

        let progress = self.ctx.progress();
        progress.finish(format!("{}: built {built} models", self.project));
        self.status.send_replace(RunStatus::Stopped);

        RunSummary {
            project: self.project.clone(),
            models_built: built,
            worked: progress.worked(),
            total_work: progress.total(),
            duration,
        }
    }

    fn verify_input_unchanged(&self) {
        let events = self.ctx.events();
        events.debug(
            Stage::Workflow,
            "Verifying training frame immutability. . .",
        );
        match self.data.checksum(&self.frames.original) {
            Ok(checksum) if checksum == self.frames.original_checksum => {
                events.debug(Stage::Workflow, "Training frame was not mutated (as expected).");
            }
            Ok(_) => events.warn(
                Stage::Workflow,
                "Training frame was mutated!  This indicates a bug in the AutoML software.",
            ),
            Err(e) => events.warn(
                Stage::Workflow,
                format!("Could not verify training frame immutability: {e}"),
            ),
        }
    }
}

/// Handle to a started run.
pub struct RunHandle {
    automl: Arc<AutoMl>,
    join: JoinHandle<RunSummary>,
}

impl RunHandle {
    #[must_use]
    pub fn automl(&self) -> &Arc<AutoMl> {
        &self.automl
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.automl.status()
    }

    #[must_use]
    pub fn remaining_time_ms(&self) -> u64 {
        self.automl.remaining_time_ms()
    }

    #[must_use]
    pub fn remaining_model_budget(&self) -> Option<u32> {
        self.automl.remaining_model_budget()
    }

    pub fn request_stop(&self) {
        self.automl.request_stop();
    }

    /// Wait for the run to drain and finalize.
    pub async fn block_until_done(self) -> Result<RunSummary, AutoMlError> {
        self.join
            .await
            .map_err(|e| AutoMlError::Aborted(e.to_string()))
    }
}

/// `1 hour 2 mins 3.456 sec` style durations for the event log.
#[must_use]
pub fn pretty_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, mins, secs) = (total / 3600, (total / 60) % 60, total % 60);
    let millis = duration.subsec_millis();

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{hours} hour{}", if hours == 1 { "" } else { "s" }));
    }
    if mins > 0 {
        parts.push(format!("{mins} min{}", if mins == 1 { "" } else { "s" }));
    }
    parts.push(format!("{secs}.{millis:03} sec"));
    parts.join(" ")
}

/// Errors that abort a run before it starts, or kill it outright.
#[derive(Debug, thiserror::Error)]
pub enum AutoMlError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("project store error: {0}")]
    Store(#[from] StoreError),
    #[error("AutoML run aborted: {0}")]
    Aborted(String),
}

#[cfg(test)]
mod tests {
    use automl_config::ColumnKind;

    use super::*;
    use crate::{
        data::{FrameInfo, InMemoryData},
        sim::{SimSettings, SimulatedLauncher},
        state::MemoryStore,
    };

    fn data() -> Arc<InMemoryData> {
        Arc::new(InMemoryData::new([FrameInfo {
            key: "train".into(),
            rows: 1000,
            columns: vec!["x".into(), "fold".into(), "y".into()],
            kinds: BTreeMap::from([("y".to_string(), ColumnKind::Binary)]),
        }]))
    }

    fn fast() -> Arc<SimulatedLauncher> {
        Arc::new(SimulatedLauncher::new(SimSettings {
            tick_ms: 100,
            step: 0.5,
            search_size: 2,
        }))
    }

    fn settings(allocations: Vec<Allocation>) -> RunSettings {
        RunSettings {
            poll_interval: Duration::from_millis(100),
            allocations,
            ..RunSettings::default()
        }
    }

    #[test]
    fn test_pretty_duration() {
        assert_eq!(pretty_duration(Duration::from_millis(12_345)), "12.345 sec");
        assert_eq!(
            pretty_duration(Duration::from_secs(3723)),
            "1 hour 2 mins 3.000 sec"
        );
    }

    #[test]
    fn test_include_and_exclude_is_rejected_before_anything_is_created() {
        let store: Arc<dyn ProjectStore> = Arc::new(MemoryStore::default());
        let mut spec = BuildSpec::new("train", "y");
        spec.models.include_algos = Some(Vec::new());
        spec.models.exclude_algos = Some(Vec::new());

        let err = AutoMl::new(spec, RunSettings::default(), fast(), data(), store.clone())
            .err()
            .unwrap();
        assert!(matches!(err, AutoMlError::Plan(PlanError::ExclusiveAlgos)));
        assert!(!store.exists("automl_train").unwrap());
    }

    #[test]
    fn test_failed_construction_rolls_back() {
        let store: Arc<dyn ProjectStore> = Arc::new(MemoryStore::default());
        let data = data();
        let mut spec = BuildSpec::new("train", "y");
        spec.control.nfolds = 0;
        spec.input.leaderboard_frame = Some("missing".into());

        let err = AutoMl::new(spec, RunSettings::default(), fast(), data.clone(), store.clone())
            .err()
            .unwrap();
        assert!(matches!(err, AutoMlError::Data(DataError::MissingFrame(_))));
        assert!(!store.exists("automl_train").unwrap());
        assert_eq!(data.keys(), ["train"]);
    }

    #[test]
    fn test_fold_column_disables_nfolds() {
        let store: Arc<dyn ProjectStore> = Arc::new(MemoryStore::default());
        let mut spec = BuildSpec::new("train", "y");
        spec.input.fold_column = Some("fold".into());

        let automl = AutoMl::new(spec, RunSettings::default(), fast(), data(), store).unwrap();
        assert_eq!(automl.params.common()["nfolds"], 0);
        assert_eq!(automl.status(), RunStatus::Idle);
        let events = automl.event_log().events();
        assert!(events.iter().any(|e| {
            e.message == "Custom fold column, fold, will be used. nfolds value will be ignored."
        }));
    }

    #[test]
    fn test_unavailable_algorithms_leave_the_plan() {
        let store: Arc<dyn ProjectStore> = Arc::new(MemoryStore::default());
        let launcher = Arc::new(SimulatedLauncher::default().unavailable(AlgorithmId::XGBoost));
        let automl = AutoMl::new(
            BuildSpec::new("train", "y"),
            RunSettings::default(),
            launcher,
            data(),
            store,
        )
        .unwrap();

        assert!(!automl.plan().contains_family(AlgorithmId::XGBoost));
        assert!(automl.plan().is_sealed());
        assert_eq!(automl.progress().total(), 380 - 130);
        assert!(automl.event_log().events().iter().any(|e| {
            e.message == "AutoML: XGBoost is not available; skipping it."
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_lifecycle() {
        let store: Arc<dyn ProjectStore> = Arc::new(MemoryStore::default());
        let allocations = vec![Allocation {
            algo: AlgorithmId::Drf,
            count: 2,
            kind: WorkKind::Build,
            share: 10,
        }];
        let automl = Arc::new(
            AutoMl::new(
                BuildSpec::new("train", "y"),
                settings(allocations),
                fast(),
                data(),
                store,
            )
            .unwrap(),
        );
        let mut status = automl.watch_status();

        let handle = automl.clone().start();
        assert_eq!(handle.status(), RunStatus::Running);
        let summary = handle.block_until_done().await.unwrap();

        assert_eq!(*status.borrow_and_update(), RunStatus::Stopped);
        assert_eq!(summary.models_built, 2);
        assert_eq!(summary.worked, 20);
        assert_eq!(summary.total_work, 20);
        let keys = automl.leaderboard().ranked_keys().unwrap();
        assert!(keys.iter().any(|k| k.starts_with("DRF_1_AutoML_")));
        assert!(keys.iter().any(|k| k.starts_with("XRT_1_AutoML_")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_request_reports_draining() {
        let store: Arc<dyn ProjectStore> = Arc::new(MemoryStore::default());
        let allocations = vec![Allocation {
            algo: AlgorithmId::Gbm,
            count: 3,
            kind: WorkKind::Build,
            share: 10,
        }];
        let automl = Arc::new(
            AutoMl::new(
                BuildSpec::new("train", "y"),
                settings(allocations),
                fast(),
                data(),
                store,
            )
            .unwrap(),
        );

        automl.request_stop();
        assert_eq!(automl.status(), RunStatus::Idle);

        let handle = automl.clone().start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.request_stop();
        assert_eq!(handle.status(), RunStatus::Draining);

        handle.block_until_done().await.unwrap();
        assert_eq!(automl.status(), RunStatus::Stopped);
        automl.request_stop();
        assert_eq!(automl.status(), RunStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_counter_numbers_model_keys() {
        #[derive(Debug, Default)]
        struct FromSeven(CounterMap);
        impl InstanceCounter for FromSeven {
            fn next(&self, name: &str) -> u32 {
                self.0.next(name) + 6
            }
        }

        let store: Arc<dyn ProjectStore> = Arc::new(MemoryStore::default());
        let settings = RunSettings {
            model_counter: Arc::new(FromSeven::default()),
            ..settings(vec![Allocation {
                algo: AlgorithmId::Gbm,
                count: 1,
                kind: WorkKind::Build,
                share: 10,
            }])
        };
        let automl = Arc::new(
            AutoMl::new(BuildSpec::new("train", "y"), settings, fast(), data(), store).unwrap(),
        );
        automl.clone().start().block_until_done().await.unwrap();

        let stamp = automl.run_stamp();
        assert_eq!(
            automl.leaderboard().ranked_keys().unwrap(),
            [format!("GBM_7_AutoML_{stamp}")]
        );
    }
}
