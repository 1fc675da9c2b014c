//! Build specification: what to train on and how much budget to spend.

use serde::{Deserialize, Serialize};

use crate::{AlgorithmId, Seed, SortMetric, StoppingMetric};

/// Full description of one AutoML build.
///
/// All three parts are flattened so a single `[automl]` TOML table
/// carries every field.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BuildSpec {
    #[serde(flatten)]
    pub input: InputSpec,
    #[serde(flatten)]
    pub control: BuildControl,
    #[serde(flatten)]
    pub models: BuildModels,
}

impl BuildSpec {
    /// Minimal spec for a training frame and response column.
    #[must_use]
    pub fn new(training_frame: impl Into<String>, response_column: impl Into<String>) -> Self {
        Self {
            input: InputSpec {
                training_frame: training_frame.into(),
                response_column: response_column.into(),
                validation_frame: None,
                blending_frame: None,
                leaderboard_frame: None,
                fold_column: None,
                weights_column: None,
                ignored_columns: Vec::new(),
                sort_metric: None,
            },
            control: BuildControl::default(),
            models: BuildModels::default(),
        }
    }

    /// Project name; derived from the training frame when not set.
    #[must_use]
    pub fn project(&self) -> String {
        self.control
            .project_name
            .clone()
            .unwrap_or_else(|| format!("automl_{}", self.input.training_frame))
    }

    /// Cross-validation is on when folds are requested or a fold column is given.
    #[must_use]
    pub fn is_cv_enabled(&self) -> bool {
        self.control.nfolds != 0 || self.input.fold_column.is_some()
    }
}

/// Datasets and columns.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InputSpec {
    pub training_frame: String,
    pub response_column: String,
    #[serde(default)]
    pub validation_frame: Option<String>,
    /// Held-out frame used to train ensembles when cross-validation is off.
    #[serde(default)]
    pub blending_frame: Option<String>,
    /// Frame the leaderboard scores on; cross-validation metrics are used otherwise.
    #[serde(default)]
    pub leaderboard_frame: Option<String>,
    #[serde(default)]
    pub fold_column: Option<String>,
    #[serde(default)]
    pub weights_column: Option<String>,
    #[serde(default)]
    pub ignored_columns: Vec<String>,
    #[serde(default)]
    pub sort_metric: Option<SortMetric>,
}

/// Run-wide knobs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BuildControl {
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default = "default_nfolds")]
    pub nfolds: u32,
    #[serde(default)]
    pub balance_classes: bool,
    #[serde(default)]
    pub class_sampling_factors: Vec<f32>,
    #[serde(default = "default_max_after_balance_size")]
    pub max_after_balance_size: f32,
    #[serde(default)]
    pub keep_cross_validation_predictions: bool,
    #[serde(default)]
    pub keep_cross_validation_models: bool,
    #[serde(default)]
    pub keep_cross_validation_fold_assignment: bool,
    #[serde(default)]
    pub export_checkpoints_dir: Option<String>,
    #[serde(flatten)]
    pub stopping: StoppingCriteria,
}

impl Default for BuildControl {
    fn default() -> Self {
        Self {
            project_name: None,
            nfolds: default_nfolds(),
            balance_classes: false,
            class_sampling_factors: Vec::new(),
            max_after_balance_size: default_max_after_balance_size(),
            keep_cross_validation_predictions: false,
            keep_cross_validation_models: false,
            keep_cross_validation_fold_assignment: false,
            export_checkpoints_dir: None,
            stopping: StoppingCriteria::default(),
        }
    }
}

/// Global budget and early-stopping defaults.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoppingCriteria {
    /// Wall-clock budget for the whole run. 0 means unlimited.
    #[serde(default = "default_max_runtime_secs")]
    pub max_runtime_secs: f64,
    /// Maximum number of models to add to the leaderboard. 0 means unlimited.
    #[serde(default)]
    pub max_models: u32,
    /// Per-model runtime cap. 0 means "whatever time remains".
    #[serde(default)]
    pub max_runtime_secs_per_model: f64,
    #[serde(default)]
    pub seed: Seed,
    #[serde(default)]
    pub stopping_metric: StoppingMetric,
    #[serde(default = "default_stopping_rounds")]
    pub stopping_rounds: u32,
    /// `None` picks a tolerance from the training frame size.
    #[serde(default)]
    pub stopping_tolerance: Option<f64>,
}

impl Default for StoppingCriteria {
    fn default() -> Self {
        Self {
            max_runtime_secs: default_max_runtime_secs(),
            max_models: 0,
            max_runtime_secs_per_model: 0.0,
            seed: Seed::Random,
            stopping_metric: StoppingMetric::Auto,
            stopping_rounds: default_stopping_rounds(),
            stopping_tolerance: None,
        }
    }
}

impl StoppingCriteria {
    /// Tolerance recommended for a frame with `rows` rows.
    #[must_use]
    pub fn default_tolerance_for_rows(rows: u64) -> f64 {
        let rows = rows.max(1) as f64;
        (1.0 / rows.sqrt()).clamp(0.001, 0.05)
    }
}

/// Which algorithm families the run may use.
///
/// The two lists are mutually exclusive; an empty list still counts as given.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildModels {
    #[serde(default)]
    pub include_algos: Option<Vec<AlgorithmId>>,
    #[serde(default)]
    pub exclude_algos: Option<Vec<AlgorithmId>>,
}

fn default_nfolds() -> u32 {
    5
}
fn default_max_after_balance_size() -> f32 {
    5.0
}
fn default_max_runtime_secs() -> f64 {
    3600.0
}
fn default_stopping_rounds() -> u32 {
    3
}
