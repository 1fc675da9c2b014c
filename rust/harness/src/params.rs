//! Parameter resolution for launched tasks.
//!
//! Every task starts from the same common parameters derived from the build
//! spec and the prepared frames. Routine-specific parameters are layered on
//! top, then stopping criteria, runtime limits and seeds are filled in from
//! whatever the routine left unset.

use std::sync::atomic::{AtomicU64, Ordering};

use automl_config::{BuildSpec, Seed, SortMetric, StoppingCriteria, StoppingMetric};
use serde_json::{Map, Value, json};

use crate::{
    clock::BudgetClock,
    data::PreparedFrames,
    events::{EventLog, Stage},
    task::SearchCriteria,
};

/// Resolve the stopping tolerance, logging how it was chosen.
///
/// Without a user value the tolerance is derived from the training frame's
/// row count. A user value well below that default is allowed but warned about.
pub fn resolve_stopping_tolerance(
    criteria: &StoppingCriteria,
    training_rows: u64,
    events: &EventLog,
) -> f64 {
    let default = StoppingCriteria::default_tolerance_for_rows(training_rows);
    match criteria.stopping_tolerance {
        None => {
            events.info(
                Stage::Workflow,
                format!(
                    "Setting stopping tolerance adaptively based on the training frame: {default}"
                ),
            );
            default
        }
        Some(tolerance) => {
            events.info(
                Stage::Workflow,
                format!("Stopping tolerance set by the user: {tolerance}"),
            );
            if tolerance < 0.7 * default {
                events.warn(
                    Stage::Workflow,
                    format!(
                        "Stopping tolerance set by the user is < 70% of the recommended default of {default}, so models may take a long time to converge or may not converge at all."
                    ),
                );
            }
            tolerance
        }
    }
}

/// Run-wide parameter defaults.
#[derive(Debug)]
pub struct RunParams {
    spec: BuildSpec,
    training: String,
    validation: Option<String>,
    blending: Option<String>,
    stopping_tolerance: f64,
    sort_metric: Option<SortMetric>,
    models_seeded: AtomicU64,
}

impl RunParams {
    #[must_use]
    pub fn new(spec: &BuildSpec, frames: &PreparedFrames, stopping_tolerance: f64) -> Self {
        Self {
            spec: spec.clone(),
            training: frames.training.key.clone(),
            validation: frames.validation.as_ref().map(|f| f.key.clone()),
            blending: frames.blending.as_ref().map(|f| f.key.clone()),
            stopping_tolerance,
            sort_metric: spec.input.sort_metric,
            models_seeded: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn spec(&self) -> &BuildSpec {
        &self.spec
    }

    #[must_use]
    pub fn stopping_tolerance(&self) -> f64 {
        self.stopping_tolerance
    }

    #[must_use]
    pub fn has_blending_frame(&self) -> bool {
        self.blending.is_some()
    }

    #[must_use]
    pub fn blending_frame(&self) -> Option<&str> {
        self.blending.as_deref()
    }

    #[must_use]
    pub fn validation_frame(&self) -> Option<&str> {
        self.validation.as_deref()
    }

    /// Parameters every task gets.
    #[must_use]
    pub fn common(&self) -> Map<String, Value> {
        let input = &self.spec.input;
        let control = &self.spec.control;

        let mut params = Map::new();
        params.insert("training_frame".into(), json!(self.training));
        if let Some(validation) = &self.validation {
            params.insert("validation_frame".into(), json!(validation));
        }
        params.insert("response_column".into(), json!(input.response_column));
        if !input.ignored_columns.is_empty() {
            params.insert("ignored_columns".into(), json!(input.ignored_columns));
        }
        if let Some(fold) = &input.fold_column {
            params.insert("fold_column".into(), json!(fold));
        }
        if let Some(weights) = &input.weights_column {
            params.insert("weights_column".into(), json!(weights));
        }

        params.insert("nfolds".into(), json!(control.nfolds));
        if control.nfolds > 1 && input.fold_column.is_none() {
            params.insert("fold_assignment".into(), json!("Modulo"));
        }
        if control.balance_classes {
            params.insert("balance_classes".into(), json!(true));
            if !control.class_sampling_factors.is_empty() {
                params.insert(
                    "class_sampling_factors".into(),
                    json!(control.class_sampling_factors),
                );
            }
            params.insert(
                "max_after_balance_size".into(),
                json!(control.max_after_balance_size),
            );
        }

        params.insert(
            "keep_cross_validation_models".into(),
            json!(control.keep_cross_validation_models),
        );
        // ensembles need the CV predictions unless they can blend instead
        params.insert(
            "keep_cross_validation_predictions".into(),
            json!(self.blending.is_none() || control.keep_cross_validation_predictions),
        );
        params.insert(
            "keep_cross_validation_fold_assignment".into(),
            json!(control.nfolds != 0 && control.keep_cross_validation_fold_assignment),
        );
        if let Some(dir) = &control.export_checkpoints_dir {
            params.insert("export_checkpoints_dir".into(), json!(dir));
        }
        params
    }

    /// Fill in stopping criteria the routine left unset.
    pub fn apply_stopping(&self, params: &mut Map<String, Value>) {
        let stopping = &self.spec.control.stopping;
        let metric = match stopping.stopping_metric {
            StoppingMetric::Auto => StoppingMetric::for_sort_metric(self.sort_metric),
            metric => metric,
        };
        params
            .entry("stopping_metric")
            .or_insert_with(|| json!(metric.to_string()));
        params
            .entry("stopping_rounds")
            .or_insert_with(|| json!(stopping.stopping_rounds));
        params
            .entry("stopping_tolerance")
            .or_insert_with(|| json!(self.stopping_tolerance));
    }

    /// Runtime cap in seconds for one model; 0 means none.
    ///
    /// An unset per-model limit becomes whatever time the run has left.
    #[must_use]
    pub fn model_runtime(&self, clock: &BudgetClock, ignore_limits: bool) -> f64 {
        if ignore_limits {
            return 0.0;
        }
        let explicit = self.spec.control.stopping.max_runtime_secs_per_model;
        match clock.remaining() {
            None => explicit.max(0.0),
            Some(remaining) if explicit <= 0.0 => remaining.as_secs_f64(),
            Some(remaining) => explicit.min(remaining.as_secs_f64()),
        }
    }

    /// Give the next model its own seed derived from the global one.
    ///
    /// Only applies when the run has a fixed seed and the routine did not set one.
    pub fn assign_seed(&self, params: &mut Map<String, Value>) {
        if let Seed::Fixed(seed) = self.spec.control.stopping.seed
            && !params.contains_key("seed")
        {
            let n = self.models_seeded.fetch_add(1, Ordering::Relaxed);
            params.insert("seed".into(), json!(seed.wrapping_add(n)));
        }
    }

    /// Limits for a search given its share of the remaining plan.
    ///
    /// The search gets `share / remaining_work` of the time and models left.
    /// Explicit global limits are never loosened.
    #[must_use]
    pub fn search_criteria(
        &self,
        share: u32,
        remaining_work: u64,
        clock: &BudgetClock,
        remaining_models: Option<u32>,
    ) -> SearchCriteria {
        let stopping = &self.spec.control.stopping;
        let ratio = if remaining_work == 0 {
            1.0
        } else {
            (f64::from(share) / remaining_work as f64).min(1.0)
        };

        let explicit_time = stopping.max_runtime_secs.max(0.0);
        let max_runtime_secs = match clock.remaining() {
            None => explicit_time,
            Some(remaining) => {
                let assigned = ratio * remaining.as_secs_f64();
                if explicit_time == 0.0 {
                    assigned
                } else {
                    explicit_time.min(assigned)
                }
            }
        };

        let max_models = match remaining_models {
            None => stopping.max_models,
            Some(remaining) => {
                let assigned = (ratio * f64::from(remaining)).ceil() as u32;
                if stopping.max_models == 0 {
                    assigned
                } else {
                    stopping.max_models.min(assigned)
                }
            }
        };

        SearchCriteria {
            max_models,
            max_runtime_secs,
            seed: stopping.seed.fixed(),
            stopping_rounds: stopping.stopping_rounds,
            stopping_tolerance: self.stopping_tolerance,
        }
    }
}
