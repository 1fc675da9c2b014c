//! Choosing whether and what to stack once the primary models are built.

use std::collections::HashSet;

use automl_config::AlgorithmId;
use serde_json::{Map, Value, json};

use crate::{leaderboard::Leaderboard, params::RunParams};

/// Ensemble built over the best model of each model type.
pub const BEST_OF_FAMILY: &str = "StackedEnsemble_BestOfFamily";
/// Ensemble built over every non-ensemble model.
pub const ALL_MODELS: &str = "StackedEnsemble_AllModels";

/// Why the ensemble stage did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsembleSkip {
    /// No ensemble allocation in the plan.
    Excluded,
    NoModels,
    OneModel,
    /// Nothing to train the metalearner on.
    NoHoldout,
}

impl EnsembleSkip {
    /// Event log message for the skip.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::Excluded => "StackedEnsemble builds skipped due to the exclude_algos option.",
            Self::NoModels => {
                "No models were built, due to timeouts or the exclude_algos option. StackedEnsemble builds skipped."
            }
            Self::OneModel => "StackedEnsemble builds skipped since there is only one model built",
            Self::NoHoldout => {
                "Cross-validation disabled by the user and no blending frame provided; StackedEnsemble build skipped"
            }
        }
    }

    /// Whether the stage's share is still owed to the progress sink.
    #[must_use]
    pub fn consumes_share(self) -> bool {
        self != Self::Excluded
    }
}

/// Decide whether ensembles can be built.
pub fn check_eligible(
    allocated: bool,
    model_count: usize,
    cv_enabled: bool,
    has_blending_frame: bool,
) -> Result<(), EnsembleSkip> {
    if !allocated {
        Err(EnsembleSkip::Excluded)
    } else if model_count == 0 {
        Err(EnsembleSkip::NoModels)
    } else if model_count == 1 {
        Err(EnsembleSkip::OneModel)
    } else if !cv_enabled && !has_blending_frame {
        Err(EnsembleSkip::NoHoldout)
    } else {
        Ok(())
    }
}

/// Base models of the two ensembles, in leaderboard order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseModels {
    pub best_of_family: Vec<String>,
    pub all_models: Vec<String>,
}

/// Pick base models from the leaderboard. Earlier ensembles are never stacked.
#[must_use]
pub fn select_base_models(leaderboard: &Leaderboard) -> BaseModels {
    let mut seen_types = HashSet::new();
    let mut best_of_family = Vec::new();
    let mut all_models = Vec::new();

    for model in leaderboard.ranked() {
        if model.algo == AlgorithmId::StackedEnsemble {
            continue;
        }
        all_models.push(model.key.clone());
        if seen_types.insert(model.model_type.as_str()) {
            best_of_family.push(model.key.clone());
        }
    }

    BaseModels {
        best_of_family,
        all_models,
    }
}

/// Ensemble-specific parameters for one stacked model.
#[must_use]
pub fn ensemble_params(
    run: &RunParams,
    base_models: &[String],
    keep_base_predictions: bool,
) -> Map<String, Value> {
    let spec = run.spec();
    let mut params = Map::new();
    params.insert("base_models".into(), json!(base_models));
    if let Some(validation) = run.validation_frame() {
        params.insert("validation_frame".into(), json!(validation));
    }
    if let Some(blending) = run.blending_frame() {
        params.insert("blending_frame".into(), json!(blending));
    }
    params.insert("keep_levelone_frame".into(), json!(true));
    params.insert(
        "keep_base_model_predictions".into(),
        json!(keep_base_predictions),
    );
    params.insert("metalearner_nfolds".into(), json!(spec.control.nfolds));
    if let Some(fold) = &spec.input.fold_column {
        params.insert("metalearner_fold_column".into(), json!(fold));
    }
    params.insert(
        "metalearner_keep_cross_validation_models".into(),
        json!(spec.control.keep_cross_validation_models),
    );
    params.insert(
        "metalearner_keep_cross_validation_predictions".into(),
        json!(spec.control.keep_cross_validation_predictions),
    );
    params
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use automl_config::SortMetric;

    use super::*;
    use crate::task::ModelResult;

    fn model(key: &str, algo: AlgorithmId, model_type: &str, auc: f64) -> ModelResult {
        ModelResult {
            key: key.to_string(),
            algo,
            model_type: model_type.to_string(),
            metrics: BTreeMap::from([("auc".to_string(), auc)]),
        }
    }

    #[test]
    fn test_decision_table() {
        assert_eq!(check_eligible(false, 10, true, false), Err(EnsembleSkip::Excluded));
        assert_eq!(check_eligible(true, 0, true, false), Err(EnsembleSkip::NoModels));
        assert_eq!(check_eligible(true, 1, true, true), Err(EnsembleSkip::OneModel));
        assert_eq!(check_eligible(true, 5, false, false), Err(EnsembleSkip::NoHoldout));
        assert_eq!(check_eligible(true, 5, false, true), Ok(()));
        assert_eq!(check_eligible(true, 2, true, false), Ok(()));
        assert!(!EnsembleSkip::Excluded.consumes_share());
        assert!(EnsembleSkip::OneModel.consumes_share());
    }

    #[test]
    fn test_base_model_selection() {
        let mut lb = Leaderboard::new("p", SortMetric::Auc);
        lb.add(model("GBM_1", AlgorithmId::Gbm, "GBM", 0.80));
        lb.add(model("GBM_2", AlgorithmId::Gbm, "GBM", 0.85));
        lb.add(model("DRF_1", AlgorithmId::Drf, "DRF", 0.70));
        lb.add(model("XRT_1", AlgorithmId::Drf, "XRT", 0.75));
        lb.add(model("SE_old", AlgorithmId::StackedEnsemble, "StackedEnsemble", 0.99));

        let base = select_base_models(&lb);
        assert_eq!(base.best_of_family, ["GBM_2", "XRT_1", "DRF_1"]);
        assert_eq!(base.all_models, ["GBM_2", "GBM_1", "XRT_1", "DRF_1"]);
    }
}
