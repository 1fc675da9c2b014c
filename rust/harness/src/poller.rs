//! Driving launched tasks to completion.
//!
//! [`RunContext`] is the per-run state every routine shares: the clock, the
//! model budget, the progress sink and the set of in-flight tasks.
//! [`RunContext::drain_task`] polls one task until it finishes, converting its
//! fractional progress into work units and feeding finished models to the
//! leaderboard as they appear.

use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use crate::{
    clock::BudgetClock,
    events::{EventLog, Stage},
    leaderboard::LeaderboardHandle,
    plan::{WorkItem, WorkKind},
    progress::RunProgress,
    task::{ModelResult, TaskHandle, TaskOutcome, TaskOutput},
};

/// Shared state of one run.
pub struct RunContext {
    clock: BudgetClock,
    events: EventLog,
    leaderboard: LeaderboardHandle,
    progress: RunProgress,
    max_models: u32,
    models_built: AtomicU32,
    stop_requested: AtomicBool,
    active: Mutex<Vec<TaskHandle>>,
    poll_interval: Duration,
}

impl RunContext {
    #[must_use]
    pub fn new(
        clock: BudgetClock,
        events: EventLog,
        leaderboard: LeaderboardHandle,
        progress: RunProgress,
        max_models: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            clock,
            events,
            leaderboard,
            progress,
            max_models,
            models_built: AtomicU32::new(0),
            stop_requested: AtomicBool::new(false),
            active: Mutex::new(Vec::new()),
            poll_interval,
        }
    }

    #[must_use]
    pub fn clock(&self) -> &BudgetClock {
        &self.clock
    }

    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    #[must_use]
    pub fn leaderboard(&self) -> &LeaderboardHandle {
        &self.leaderboard
    }

    #[must_use]
    pub fn progress(&self) -> &RunProgress {
        &self.progress
    }

    /// Models this run has added to the leaderboard.
    #[must_use]
    pub fn models_built(&self) -> u32 {
        self.models_built.load(Ordering::Acquire)
    }

    /// Models left before `max_models` is hit; `None` when unlimited.
    #[must_use]
    pub fn remaining_models(&self) -> Option<u32> {
        (self.max_models > 0).then(|| self.max_models.saturating_sub(self.models_built()))
    }

    /// Not timed out and the model budget isn't used up.
    #[must_use]
    pub fn keep_running(&self) -> bool {
        !self.clock.timed_out() && self.remaining_models() != Some(0)
    }

    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Ask every in-flight task to stop. Routines skip from now on.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        for handle in self.lock_active().iter() {
            handle.request_stop();
        }
    }

    /// Whether a routine must skip its next launch.
    ///
    /// `ignore_limits` lifts the time and model budgets but never a stop request.
    pub fn exceeded_limits(&self, item: &WorkItem, name: &str, ignore_limits: bool) -> bool {
        let what = format!("{name} {}", item.kind());
        if !ignore_limits && !self.keep_running() {
            let why = if self.clock.timed_out() {
                "out of time"
            } else {
                "hit the max_models limit"
            };
            self.events.debug(
                Stage::ModelTraining,
                format!("AutoML: {why}; skipping {what}"),
            );
            return true;
        }
        if self.is_stop_requested() {
            self.events.debug(
                Stage::ModelTraining,
                format!("AutoML: job cancelled; skipping {what}"),
            );
            return true;
        }
        false
    }

    /// Track a launched task so a stop request reaches it.
    pub fn register(&self, handle: &TaskHandle) {
        if self.is_stop_requested() {
            handle.request_stop();
        }
        self.lock_active().push(handle.clone());
    }

    fn unregister(&self, key: &str) {
        self.lock_active().retain(|h| h.key() != key);
    }

    /// Stop every task still registered and wait until each has finished.
    pub async fn drain_active(&self) {
        let handles: Vec<TaskHandle> = std::mem::take(&mut *self.lock_active());
        for handle in &handles {
            handle.request_stop();
        }
        for handle in handles {
            let outcome = handle.wait().await;
            tracing::debug!("drained {}: {outcome:?}", handle.key());
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Vec<TaskHandle>> {
        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Add models to the leaderboard, counting only the ones that were new.
    pub fn add_results(&self, models: &[ModelResult]) -> usize {
        if models.is_empty() {
            return 0;
        }
        match self.leaderboard.add_results(models) {
            Ok(outcome) => {
                let added = outcome.added();
                self.models_built
                    .fetch_add(u32::try_from(added).unwrap_or(u32::MAX), Ordering::AcqRel);
                added
            }
            Err(e) => {
                tracing::error!("Failed to update leaderboard: {e}");
                0
            }
        }
    }

    /// Poll a task until it finishes and account for its work item.
    ///
    /// A missing handle means the launch was skipped; the item's share is
    /// reported as done straight away. Whatever happens to the task, exactly
    /// one repetition of `item` is consumed and its full share reported.
    pub async fn drain_task(
        &self,
        name: &str,
        item: &WorkItem,
        handle: Option<TaskHandle>,
        ignore_timeout: bool,
    ) {
        let Some(handle) = handle else {
            let units = item.consume(1);
            self.progress.update(units, format!("{name} SKIPPED"));
            return;
        };

        self.events
            .debug(Stage::ModelTraining, format!("{name} started"));
        let budget = if item.is_exhausted() {
            0
        } else {
            u64::from(item.share())
        };
        let mut worked = 0;
        let mut seen = 0;
        let mut stopping = false;

        while handle.is_running() {
            if !stopping && self.is_stop_requested() {
                self.events.debug(
                    Stage::ModelTraining,
                    format!("AutoML job cancelled; stopping {name}"),
                );
                handle.request_stop();
                stopping = true;
            }
            if !stopping && !ignore_timeout && self.clock.timed_out() {
                self.events.debug(
                    Stage::ModelTraining,
                    format!("AutoML: out of time; stopping {name}"),
                );
                handle.request_stop();
                stopping = true;
            }

            let so_far = ((handle.progress() * budget as f64).round() as u64).min(budget);
            if so_far > worked {
                self.progress.update(so_far - worked, name);
                worked = so_far;
            }

            if handle.kind() == WorkKind::Search {
                seen = self.ingest_new(&handle, seen);
            }

            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                _ = handle.wait() => {}
            }
        }

        match handle.outcome() {
            Some(TaskOutcome::Crashed(e)) => {
                self.events
                    .warn(Stage::ModelTraining, format!("{name} failed: {e}"));
            }
            Some(TaskOutcome::Cancelled) | None => {
                // keep what a cancelled search finished before it stopped
                if handle.kind() == WorkKind::Search {
                    self.ingest_new(&handle, seen);
                }
                self.events
                    .info(Stage::ModelTraining, format!("{name} cancelled"));
            }
            Some(TaskOutcome::Completed(TaskOutput::Model(model))) => {
                self.add_results(std::slice::from_ref(&model));
                self.events
                    .debug(Stage::ModelTraining, format!("{name} complete"));
            }
            Some(TaskOutcome::Completed(TaskOutput::Search(models))) => {
                // may repeat models already ingested while polling
                self.add_results(&models);
                self.events.debug(
                    Stage::ModelTraining,
                    format!("Built: {} models for search: {name}", models.len()),
                );
                self.events
                    .debug(Stage::ModelTraining, format!("{name} complete"));
            }
        }

        self.progress.update(budget - worked, name);
        item.consume(1);
        self.unregister(handle.key());
    }

    fn ingest_new(&self, handle: &TaskHandle, seen: usize) -> usize {
        let count = handle.result_count();
        if count > seen {
            let new = handle.results_since(seen);
            let added = self.add_results(&new);
            tracing::debug!(
                "{}: {} new models, {} added to the leaderboard",
                handle.key(),
                new.len(),
                added
            );
        }
        count.max(seen)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use automl_config::{AlgorithmId, SortMetric};

    use super::*;
    use crate::{
        plan::WorkPlan,
        state::{MemoryStore, ProjectStore},
        task::task_channel,
    };

    fn context(deadline_secs: f64, max_models: u32) -> RunContext {
        let store: Arc<dyn ProjectStore> = Arc::new(MemoryStore::default());
        let leaderboard =
            LeaderboardHandle::get_or_create(store.clone(), "p", None, SortMetric::Auc).unwrap();
        RunContext::new(
            BudgetClock::from_secs_f64(deadline_secs),
            EventLog::new(store, "p"),
            leaderboard,
            RunProgress::new(100),
            max_models,
            Duration::from_secs(1),
        )
    }

    fn model(key: &str) -> ModelResult {
        ModelResult {
            key: key.to_string(),
            algo: AlgorithmId::Gbm,
            model_type: "GBM".to_string(),
            metrics: BTreeMap::new(),
        }
    }

    fn item(kind: WorkKind, count: u32, share: u32) -> Arc<WorkItem> {
        let mut plan = WorkPlan::new();
        plan.allocate(AlgorithmId::Gbm, count, kind, share).unwrap();
        plan.get(AlgorithmId::Gbm, kind).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_reports_full_share() {
        let ctx = context(0.0, 0);
        let item = item(WorkKind::Build, 2, 10);
        ctx.drain_task("GBM_1", &item, None, false).await;
        assert_eq!(ctx.progress().worked(), 10);
        assert_eq!(item.remaining(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_build_is_added() {
        let ctx = context(0.0, 0);
        let item = item(WorkKind::Build, 1, 10);
        let (handle, reporter) = task_channel("GBM_1", WorkKind::Build);
        ctx.register(&handle);

        let driver = tokio::spawn(async move {
            for i in 1..=4 {
                tokio::time::sleep(Duration::from_millis(700)).await;
                reporter.set_progress(f64::from(i) * 0.25);
            }
            reporter.finish(TaskOutcome::Completed(TaskOutput::Model(model("GBM_1"))));
        });

        ctx.drain_task("GBM_1", &item, Some(handle), false).await;
        driver.await.unwrap();

        assert_eq!(ctx.progress().worked(), 10);
        assert_eq!(ctx.models_built(), 1);
        assert!(item.is_exhausted());
        assert!(ctx.lock_active().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_results_are_ingested_progressively_once() {
        let ctx = context(0.0, 0);
        let item = item(WorkKind::Search, 1, 60);
        let (handle, reporter) = task_channel("GBM_grid_1", WorkKind::Search);

        let lb = ctx.leaderboard().clone();
        let driver = tokio::spawn(async move {
            reporter.push_result(model("m1"));
            reporter.push_result(model("m2"));
            tokio::time::sleep(Duration::from_secs(3)).await;
            // first two models are on the leaderboard before the search ends
            let mid = lb.count().unwrap();
            reporter.push_result(model("m3"));
            reporter.finish(TaskOutcome::Completed(TaskOutput::Search(vec![
                model("m1"),
                model("m2"),
                model("m3"),
            ])));
            mid
        });

        ctx.drain_task("GBM grid", &item, Some(handle), false).await;
        assert_eq!(driver.await.unwrap(), 2);
        assert_eq!(ctx.leaderboard().count().unwrap(), 3);
        assert_eq!(ctx.models_built(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_requests_stop_and_reports_full_share() {
        let ctx = context(1.0, 0);
        ctx.clock().start();
        let item = item(WorkKind::Build, 1, 10);
        let (handle, reporter) = task_channel("GBM_1", WorkKind::Build);

        let driver = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = reporter.stopped() => {
                        reporter.finish(TaskOutcome::Cancelled);
                        return;
                    }
                    () = tokio::time::sleep(Duration::from_secs(2)) => {
                        reporter.set_progress(0.1);
                    }
                }
            }
        });

        ctx.drain_task("GBM_1", &item, Some(handle), false).await;
        driver.await.unwrap();

        assert_eq!(ctx.progress().worked(), 10);
        assert_eq!(ctx.models_built(), 0);
        let messages: Vec<String> = ctx.events().events().into_iter().map(|e| e.message).collect();
        assert!(messages.contains(&"AutoML: out of time; stopping GBM_1".to_string()));
        assert!(messages.contains(&"GBM_1 cancelled".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_is_not_fatal() {
        let ctx = context(0.0, 0);
        let item = item(WorkKind::Build, 1, 10);
        let (handle, reporter) = task_channel("GBM_1", WorkKind::Build);
        reporter.set_progress(0.5);
        reporter.finish(TaskOutcome::Crashed("out of memory".into()));

        ctx.drain_task("GBM_1", &item, Some(handle), false).await;
        assert_eq!(ctx.progress().worked(), 10);
        let last = ctx.events().events().pop().unwrap();
        assert_eq!(last.message, "GBM_1 failed: out of memory");
    }

    #[test]
    fn test_model_budget() {
        let ctx = context(0.0, 2);
        let item = item(WorkKind::Build, 5, 10);
        assert_eq!(ctx.remaining_models(), Some(2));
        ctx.add_results(&[model("a"), model("b"), model("a")]);
        assert_eq!(ctx.models_built(), 2);
        assert!(!ctx.keep_running());
        assert!(ctx.exceeded_limits(&item, "GBM", false));
        assert!(!ctx.exceeded_limits(&item, "GBM", true));

        ctx.request_stop();
        assert!(ctx.exceeded_limits(&item, "GBM", true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_clock_skips_launches() {
        let ctx = context(1.0, 0);
        let item = item(WorkKind::Build, 2, 10);
        ctx.clock().start();
        assert!(ctx.keep_running());
        assert!(!ctx.exceeded_limits(&item, "GBM_1", false));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!ctx.keep_running());
        assert!(ctx.exceeded_limits(&item, "GBM_2", false));
        assert!(!ctx.exceeded_limits(&item, "StackedEnsemble", true));
        let last = ctx.events().events().pop().unwrap();
        assert_eq!(last.message, "AutoML: out of time; skipping GBM_2 model build");
    }
}
