//! Algorithm identifiers, metrics and other shared enums.

use serde::{Deserialize, Serialize};

/// Algorithm family a task trains.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum AlgorithmId {
    #[serde(rename = "DeepLearning", alias = "deeplearning", alias = "deep-learning")]
    #[cfg_attr(feature = "clap", value(name = "deeplearning"))]
    DeepLearning,
    #[serde(rename = "DRF", alias = "drf")]
    #[cfg_attr(feature = "clap", value(name = "drf"))]
    Drf,
    #[serde(rename = "GBM", alias = "gbm")]
    #[cfg_attr(feature = "clap", value(name = "gbm"))]
    Gbm,
    #[serde(rename = "GLM", alias = "glm")]
    #[cfg_attr(feature = "clap", value(name = "glm"))]
    Glm,
    #[serde(rename = "XGBoost", alias = "xgboost")]
    #[cfg_attr(feature = "clap", value(name = "xgboost"))]
    XGBoost,
    #[serde(rename = "StackedEnsemble", alias = "stackedensemble", alias = "stacked-ensemble")]
    #[cfg_attr(feature = "clap", value(name = "stackedensemble"))]
    StackedEnsemble,
}

impl AlgorithmId {
    /// Every known family, in allocation-table order.
    pub const ALL: [Self; 6] = [
        Self::DeepLearning,
        Self::Drf,
        Self::Gbm,
        Self::Glm,
        Self::XGBoost,
        Self::StackedEnsemble,
    ];

    /// Name used in result keys and log messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::DeepLearning => "DeepLearning",
            Self::Drf => "DRF",
            Self::Gbm => "GBM",
            Self::Glm => "GLM",
            Self::XGBoost => "XGBoost",
            Self::StackedEnsemble => "StackedEnsemble",
        }
    }

    #[must_use]
    pub fn is_ensemble(self) -> bool {
        self == Self::StackedEnsemble
    }
}

impl std::fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for AlgorithmId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "deeplearning" | "dl" => Ok(Self::DeepLearning),
            "drf" => Ok(Self::Drf),
            "gbm" => Ok(Self::Gbm),
            "glm" => Ok(Self::Glm),
            "xgboost" | "xgb" => Ok(Self::XGBoost),
            "stackedensemble" | "se" => Ok(Self::StackedEnsemble),
            _ => Err(format!(
                "unknown algorithm '{s}'. Use: DeepLearning, DRF, GBM, GLM, XGBoost, StackedEnsemble"
            )),
        }
    }
}

/// Kind of the response column, as reported by the data layer.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    /// Two-level categorical.
    Binary,
    /// Categorical with more than two levels.
    Categorical,
    #[default]
    Numeric,
}

/// Metric the leaderboard ranks by.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum SortMetric {
    Auc,
    Logloss,
    MeanPerClassError,
    Rmse,
    Mse,
    Mae,
    Rmsle,
    MeanResidualDeviance,
}

impl SortMetric {
    /// Default ranking metric for a response of the given kind.
    #[must_use]
    pub fn default_for(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Binary => Self::Auc,
            ColumnKind::Categorical => Self::MeanPerClassError,
            ColumnKind::Numeric => Self::MeanResidualDeviance,
        }
    }

    /// Metric key as it appears in result metric maps.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::Auc => "auc",
            Self::Logloss => "logloss",
            Self::MeanPerClassError => "mean_per_class_error",
            Self::Rmse => "rmse",
            Self::Mse => "mse",
            Self::Mae => "mae",
            Self::Rmsle => "rmsle",
            Self::MeanResidualDeviance => "mean_residual_deviance",
        }
    }

    #[must_use]
    pub fn higher_is_better(self) -> bool {
        matches!(self, Self::Auc)
    }
}

impl std::fmt::Display for SortMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl std::str::FromStr for SortMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auc" => Ok(Self::Auc),
            "logloss" => Ok(Self::Logloss),
            "mean_per_class_error" => Ok(Self::MeanPerClassError),
            "rmse" => Ok(Self::Rmse),
            "mse" => Ok(Self::Mse),
            "mae" => Ok(Self::Mae),
            "rmsle" => Ok(Self::Rmsle),
            "mean_residual_deviance" | "deviance" => Ok(Self::MeanResidualDeviance),
            _ => Err(format!("unknown sort metric '{s}'")),
        }
    }
}

/// Early-stopping metric handed to individual model builds.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum StoppingMetric {
    #[default]
    Auto,
    Deviance,
    Logloss,
    Mse,
    Rmse,
    Mae,
    Rmsle,
    Auc,
    LiftTopGroup,
    Misclassification,
    MeanPerClassError,
}

impl StoppingMetric {
    /// Stopping metric that tracks a leaderboard sort metric.
    ///
    /// AUC is not a good early-stopping signal, so it maps to logloss.
    #[must_use]
    pub fn for_sort_metric(sort: Option<SortMetric>) -> Self {
        match sort {
            None => Self::Auto,
            Some(SortMetric::Auc | SortMetric::Logloss) => Self::Logloss,
            Some(SortMetric::MeanResidualDeviance) => Self::Deviance,
            Some(SortMetric::MeanPerClassError) => Self::MeanPerClassError,
            Some(SortMetric::Rmse) => Self::Rmse,
            Some(SortMetric::Mse) => Self::Mse,
            Some(SortMetric::Mae) => Self::Mae,
            Some(SortMetric::Rmsle) => Self::Rmsle,
        }
    }
}

impl std::fmt::Display for StoppingMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auto => "AUTO",
            Self::Deviance => "deviance",
            Self::Logloss => "logloss",
            Self::Mse => "MSE",
            Self::Rmse => "RMSE",
            Self::Mae => "MAE",
            Self::Rmsle => "RMSLE",
            Self::Auc => "AUC",
            Self::LiftTopGroup => "lift_top_group",
            Self::Misclassification => "misclassification",
            Self::MeanPerClassError => "mean_per_class_error",
        };
        f.write_str(s)
    }
}

/// Random seed for the whole run: a fixed value or a fresh one per task.
///
/// Accepts an integer, `-1` or `"random"` when deserialized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Seed {
    #[default]
    Random,
    Fixed(u64),
}

impl Seed {
    #[must_use]
    pub fn fixed(self) -> Option<u64> {
        match self {
            Self::Random => None,
            Self::Fixed(s) => Some(s),
        }
    }
}

impl std::fmt::Display for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Random => write!(f, "-1 (random)"),
            Self::Fixed(s) => write!(f, "{s}"),
        }
    }
}

impl Serialize for Seed {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Random => serializer.serialize_str("random"),
            Self::Fixed(s) => serializer.serialize_u64(*s),
        }
    }
}

impl<'de> Deserialize<'de> for Seed {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(-1) => Ok(Self::Random),
            Raw::Int(n) => u64::try_from(n)
                .map(Self::Fixed)
                .map_err(|_| serde::de::Error::custom(format!("invalid seed {n}"))),
            Raw::Str(s) if s.eq_ignore_ascii_case("random") => Ok(Self::Random),
            Raw::Str(s) => s
                .parse()
                .map(Self::Fixed)
                .map_err(|_| serde::de::Error::custom(format!("invalid seed '{s}'"))),
        }
    }
}
