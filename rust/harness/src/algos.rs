//! Algorithm registry and the fixed launch sequence.
//!
//! Each family maps to its default parameters for a response kind. The
//! launch sequence lists every routine a run executes, in order, with the
//! per-task parameter variants layered on top of those defaults.

use std::collections::BTreeMap;

use automl_config::{AlgorithmId, ColumnKind};
use serde_json::{Map, Value, json};

use crate::plan::WorkKind;

/// Parameters for one task of a routine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskTemplate {
    pub params: Map<String, Value>,
    pub hyper_params: BTreeMap<String, Vec<Value>>,
}

/// One routine of the launch sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Name used in log messages, e.g. `GBM 5`.
    pub label: &'static str,
    pub algo: AlgorithmId,
    pub kind: WorkKind,
    /// Model type recorded on results and used as the key prefix.
    pub model_type: &'static str,
    pub tasks: Vec<TaskTemplate>,
    /// All searches of the step add to one search key.
    pub shared_search_key: bool,
}

/// Default parameters for a family.
#[must_use]
pub fn default_params(algo: AlgorithmId, response: ColumnKind) -> Map<String, Value> {
    let mut params = Map::new();
    match algo {
        AlgorithmId::XGBoost => {
            params.insert("distribution".into(), json!(distribution(response)));
            params.insert("ntrees".into(), json!(10_000));
            params.insert("learn_rate".into(), json!(0.05));
            params.insert("score_tree_interval".into(), json!(5));
            params.insert("stopping_rounds".into(), json!(5));
        }
        AlgorithmId::Glm => {
            params.insert("lambda_search".into(), json!(true));
            params.insert("family".into(), json!(glm_family(response)));
        }
        AlgorithmId::Gbm => {
            params.insert("score_tree_interval".into(), json!(5));
            params.insert("histogram_type".into(), json!("AUTO"));
        }
        AlgorithmId::DeepLearning => {
            params.insert("epochs".into(), json!(10_000));
        }
        AlgorithmId::Drf => {}
        AlgorithmId::StackedEnsemble => {
            params.insert("keep_levelone_frame".into(), json!(true));
        }
    }
    params
}

fn distribution(response: ColumnKind) -> &'static str {
    match response {
        ColumnKind::Binary => "bernoulli",
        ColumnKind::Categorical => "multinomial",
        ColumnKind::Numeric => "AUTO",
    }
}

fn glm_family(response: ColumnKind) -> &'static str {
    match response {
        ColumnKind::Binary => "binomial",
        ColumnKind::Categorical => "multinomial",
        ColumnKind::Numeric => "gaussian",
    }
}

fn template(params: Value) -> TaskTemplate {
    TaskTemplate {
        params: as_map(params),
        hyper_params: BTreeMap::new(),
    }
}

fn search(params: Value, hyper_params: Value) -> TaskTemplate {
    let hyper_params = as_map(hyper_params)
        .into_iter()
        .map(|(k, v)| match v {
            Value::Array(values) => (k, values),
            other => (k, vec![other]),
        })
        .collect();
    TaskTemplate {
        params: as_map(params),
        hyper_params,
    }
}

fn as_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Every routine a run executes, ensembles excluded, in launch order.
#[must_use]
pub fn launch_sequence() -> Vec<Step> {
    let gbm_depths: Vec<u32> = (3..=17).collect();
    vec![
        Step {
            label: "XGBoost 3",
            algo: AlgorithmId::XGBoost,
            kind: WorkKind::Build,
            model_type: "XGBoost",
            tasks: [(10, 5, 0.6), (20, 10, 0.6), (5, 3, 0.8)]
                .into_iter()
                .map(|(depth, min_rows, sample_rate)| {
                    template(json!({
                        "max_depth": depth,
                        "min_rows": min_rows,
                        "sample_rate": sample_rate,
                        "col_sample_rate": 0.8,
                        "col_sample_rate_per_tree": 0.8,
                    }))
                })
                .collect(),
            shared_search_key: false,
        },
        Step {
            label: "GLM",
            algo: AlgorithmId::Glm,
            kind: WorkKind::Search,
            model_type: "GLM",
            tasks: vec![search(
                json!({ "alpha": [0.0, 0.2, 0.4, 0.6, 0.8, 1.0] }),
                json!({ "missing_values_handling": ["MeanImputation"] }),
            )],
            shared_search_key: false,
        },
        Step {
            label: "DRF",
            algo: AlgorithmId::Drf,
            kind: WorkKind::Build,
            model_type: "DRF",
            tasks: vec![TaskTemplate::default()],
            shared_search_key: false,
        },
        Step {
            label: "GBM 5",
            algo: AlgorithmId::Gbm,
            kind: WorkKind::Build,
            model_type: "GBM",
            tasks: [(6, 1), (7, 10), (8, 10), (10, 10), (15, 100)]
                .into_iter()
                .map(|(depth, min_rows)| {
                    template(json!({
                        "ntrees": 1000,
                        "sample_rate": 0.8,
                        "col_sample_rate": 0.8,
                        "col_sample_rate_per_tree": 0.8,
                        "max_depth": depth,
                        "min_rows": min_rows,
                    }))
                })
                .collect(),
            shared_search_key: false,
        },
        Step {
            label: "DeepLearning",
            algo: AlgorithmId::DeepLearning,
            kind: WorkKind::Build,
            model_type: "DeepLearning",
            tasks: vec![template(json!({ "hidden": [10, 10, 10] }))],
            shared_search_key: false,
        },
        Step {
            label: "XRT",
            algo: AlgorithmId::Drf,
            kind: WorkKind::Build,
            model_type: "XRT",
            tasks: vec![template(json!({ "histogram_type": "Random" }))],
            shared_search_key: false,
        },
        Step {
            label: "XGBoost grid",
            algo: AlgorithmId::XGBoost,
            kind: WorkKind::Search,
            model_type: "XGBoost",
            tasks: vec![search(
                json!({}),
                json!({
                    "max_depth": [5, 10, 15, 20],
                    "min_rows": [0.01, 0.1, 1.0, 3.0, 5.0, 10.0, 15.0, 20.0],
                    "sample_rate": [0.6, 0.8, 1.0],
                    "col_sample_rate": [0.6, 0.8, 1.0],
                    "col_sample_rate_per_tree": [0.7, 0.8, 0.9, 1.0],
                    "booster": ["gbtree", "gbtree", "dart"],
                    "reg_lambda": [0.001, 0.01, 0.1, 1.0, 10.0, 100.0],
                    "reg_alpha": [0.001, 0.01, 0.1, 0.5, 1.0],
                }),
            )],
            shared_search_key: false,
        },
        Step {
            label: "GBM grid",
            algo: AlgorithmId::Gbm,
            kind: WorkKind::Search,
            model_type: "GBM",
            tasks: vec![search(
                json!({}),
                json!({
                    "ntrees": [10_000],
                    "max_depth": gbm_depths,
                    "min_rows": [1, 5, 10, 15, 30, 100],
                    "learn_rate": [0.001, 0.005, 0.008, 0.01, 0.05, 0.08, 0.1, 0.5, 0.8],
                    "sample_rate": [0.5, 0.6, 0.7, 0.8, 0.9, 1.0],
                    "col_sample_rate": [0.4, 0.7, 1.0],
                    "col_sample_rate_per_tree": [0.4, 0.7, 1.0],
                    "min_split_improvement": [1e-4, 1e-5],
                }),
            )],
            shared_search_key: false,
        },
        Step {
            label: "DeepLearning grid",
            algo: AlgorithmId::DeepLearning,
            kind: WorkKind::Search,
            model_type: "DeepLearning",
            tasks: (1..=3).map(deep_learning_search).collect(),
            shared_search_key: true,
        },
    ]
}

/// Random search over networks with `layers` hidden layers.
fn deep_learning_search(layers: usize) -> TaskTemplate {
    let hidden: Vec<Value> = [50, 200, 500]
        .into_iter()
        .map(|width| json!(vec![width; layers]))
        .collect();
    let dropout: Vec<Value> = [0.0, 0.1, 0.2, 0.3, 0.4, 0.5]
        .into_iter()
        .map(|ratio| json!(vec![ratio; layers]))
        .collect();

    search(
        json!({
            "epochs": 10_000,
            "adaptive_rate": true,
            "activation": "RectifierWithDropout",
        }),
        json!({
            "rho": [0.9, 0.95, 0.99],
            "epsilon": [1e-6, 1e-7, 1e-8, 1e-9],
            "input_dropout_ratio": [0.0, 0.05, 0.1, 0.15, 0.2],
            "hidden": hidden,
            "hidden_dropout_ratios": dropout,
        }),
    )
}

/// Merge `overrides` into `base`, overriding keys present in both.
pub fn merge_params(base: &mut Map<String, Value>, overrides: &Map<String, Value>) {
    for (k, v) in overrides {
        base.insert(k.clone(), v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_order() {
        let labels: Vec<&str> = launch_sequence().iter().map(|s| s.label).collect();
        assert_eq!(
            labels,
            [
                "XGBoost 3",
                "GLM",
                "DRF",
                "GBM 5",
                "DeepLearning",
                "XRT",
                "XGBoost grid",
                "GBM grid",
                "DeepLearning grid",
            ]
        );
    }

    #[test]
    fn test_task_counts_match_default_allocations() {
        let steps = launch_sequence();
        let count = |algo, kind| -> usize {
            steps
                .iter()
                .filter(|s| s.algo == algo && s.kind == kind)
                .map(|s| s.tasks.len())
                .sum()
        };
        assert_eq!(count(AlgorithmId::XGBoost, WorkKind::Build), 3);
        assert_eq!(count(AlgorithmId::Gbm, WorkKind::Build), 5);
        // DRF and XRT share the DRF build allocation
        assert_eq!(count(AlgorithmId::Drf, WorkKind::Build), 2);
        assert_eq!(count(AlgorithmId::DeepLearning, WorkKind::Search), 3);
    }

    #[test]
    fn test_deep_learning_layers() {
        let steps = launch_sequence();
        let grid = steps.last().unwrap();
        assert!(grid.shared_search_key);
        let third = &grid.tasks[2].hyper_params["hidden"];
        assert_eq!(third[0], json!([50, 50, 50]));
        assert_eq!(grid.tasks[1].hyper_params["hidden_dropout_ratios"][1], json!([0.1, 0.1]));
    }

    #[test]
    fn test_defaults_follow_response_kind() {
        let xgb = default_params(AlgorithmId::XGBoost, ColumnKind::Categorical);
        assert_eq!(xgb["distribution"], "multinomial");
        let glm = default_params(AlgorithmId::Glm, ColumnKind::Numeric);
        assert_eq!(glm["family"], "gaussian");
        assert_eq!(glm["lambda_search"], true);
    }

    #[test]
    fn test_merge_overrides() {
        let mut base = default_params(AlgorithmId::XGBoost, ColumnKind::Binary);
        let tasks = &launch_sequence()[0].tasks;
        merge_params(&mut base, &tasks[1].params);
        assert_eq!(base["max_depth"], 20);
        assert_eq!(base["ntrees"], 10_000);
    }
}
