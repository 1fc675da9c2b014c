//! Ranked, deduplicated collection of trained models per project.

use std::{cmp::Ordering, fmt::Write as _, sync::Arc};

use automl_config::SortMetric;
use serde::{Deserialize, Serialize};

use crate::{
    state::{ProjectStore, StoreError},
    task::ModelResult,
};

/// Leaderboard contents. Models are kept in insertion order and ranked on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leaderboard {
    pub project: String,
    pub sort_metric: SortMetric,
    #[serde(default)]
    models: Vec<ModelResult>,
}

impl Leaderboard {
    #[must_use]
    pub fn new(project: impl Into<String>, sort_metric: SortMetric) -> Self {
        Self {
            project: project.into(),
            sort_metric,
            models: Vec::new(),
        }
    }

    /// Add a model unless one with the same key is already present.
    pub fn add(&mut self, model: ModelResult) -> bool {
        if self.contains(&model.key) {
            return false;
        }
        self.models.push(model);
        true
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.models.iter().any(|m| m.key == key)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Models ordered best first.
    ///
    /// `auc` ranks descending, every other metric ascending. Models without
    /// the metric go last; ties keep insertion order.
    #[must_use]
    pub fn ranked(&self) -> Vec<&ModelResult> {
        let metric = self.sort_metric;
        let mut ranked: Vec<&ModelResult> = self.models.iter().collect();
        ranked.sort_by(|a, b| match (a.metric(metric), b.metric(metric)) {
            (Some(x), Some(y)) if metric.higher_is_better() => y.total_cmp(&x),
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        ranked
    }

    #[must_use]
    pub fn ranked_keys(&self) -> Vec<String> {
        self.ranked().into_iter().map(|m| m.key.clone()).collect()
    }

    #[must_use]
    pub fn leader(&self) -> Option<&ModelResult> {
        self.ranked().into_iter().next()
    }

    /// Plain-text table: rank, key and the sort metric first.
    #[must_use]
    pub fn table(&self) -> String {
        let ranked = self.ranked();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Leaderboard for project {} (sorted by {}):",
            self.project, self.sort_metric
        );
        if ranked.is_empty() {
            let _ = writeln!(out, "  (no models)");
            return out;
        }

        let width = ranked.iter().map(|m| m.key.len()).max().unwrap_or(0).max(9);
        let others: Vec<&str> = ALL_METRICS
            .iter()
            .copied()
            .filter(|m| *m != self.sort_metric)
            .filter(|m| ranked.iter().any(|r| r.metric(*m).is_some()))
            .map(SortMetric::key)
            .collect();

        let _ = write!(
            out,
            "{:>4}  {:width$}  {:>12}",
            "rank",
            "model_id",
            self.sort_metric.key()
        );
        for name in &others {
            let _ = write!(out, "  {name:>12}");
        }
        out.push('\n');

        for (i, model) in ranked.iter().enumerate() {
            let _ = write!(
                out,
                "{:>4}  {:width$}  {:>12}",
                i + 1,
                model.key,
                fmt_metric(model.metric(self.sort_metric))
            );
            for name in &others {
                let value = model.metrics.get(*name).copied();
                let _ = write!(out, "  {:>12}", fmt_metric(value));
            }
            out.push('\n');
        }
        out
    }
}

const ALL_METRICS: [SortMetric; 8] = [
    SortMetric::Auc,
    SortMetric::Logloss,
    SortMetric::MeanPerClassError,
    SortMetric::MeanResidualDeviance,
    SortMetric::Rmse,
    SortMetric::Mse,
    SortMetric::Mae,
    SortMetric::Rmsle,
];

fn fmt_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.6}"))
}

/// Size of the leaderboard before and after an add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    pub before: usize,
    pub after: usize,
}

impl AddOutcome {
    /// Models this add actually contributed.
    #[must_use]
    pub fn added(self) -> usize {
        self.after.saturating_sub(self.before)
    }
}

/// Reference to the authoritative leaderboard of a project.
///
/// Every call goes back to the store; nothing is cached locally, so several
/// runs of the same project merge their models instead of overwriting them.
#[derive(Clone)]
pub struct LeaderboardHandle {
    store: Arc<dyn ProjectStore>,
    project: String,
}

impl LeaderboardHandle {
    /// Open the project's leaderboard, creating it if needed.
    ///
    /// The sort metric of an existing leaderboard is kept unless `sort_metric`
    /// is given.
    pub fn get_or_create(
        store: Arc<dyn ProjectStore>,
        project: &str,
        sort_metric: Option<SortMetric>,
        default_metric: SortMetric,
    ) -> Result<Self, StoreError> {
        store.update(project, &mut |state| {
            if let Some(lb) = state.leaderboard.as_mut() {
                if let Some(metric) = sort_metric {
                    lb.sort_metric = metric;
                }
            } else {
                state.leaderboard = Some(Leaderboard::new(
                    project,
                    sort_metric.unwrap_or(default_metric),
                ));
            }
        })?;
        Ok(Self {
            store,
            project: project.to_string(),
        })
    }

    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn add_result(&self, model: &ModelResult) -> Result<AddOutcome, StoreError> {
        self.add_results(std::slice::from_ref(model))
    }

    /// Add models under one store lock, reporting the count difference.
    pub fn add_results(&self, models: &[ModelResult]) -> Result<AddOutcome, StoreError> {
        let mut outcome = AddOutcome {
            before: 0,
            after: 0,
        };
        let project = self.project.clone();
        self.store.update(&self.project, &mut |state| {
            let lb = state
                .leaderboard
                .get_or_insert_with(|| Leaderboard::new(project.clone(), SortMetric::Auc));
            outcome.before = lb.count();
            for model in models {
                lb.add(model.clone());
            }
            outcome.after = lb.count();
        })?;
        Ok(outcome)
    }

    /// Current contents, read from the store.
    pub fn snapshot(&self) -> Result<Leaderboard, StoreError> {
        let state = self.store.load(&self.project)?;
        Ok(state
            .leaderboard
            .unwrap_or_else(|| Leaderboard::new(self.project.clone(), SortMetric::Auc)))
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.snapshot()?.count())
    }

    pub fn ranked_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.snapshot()?.ranked_keys())
    }
}
