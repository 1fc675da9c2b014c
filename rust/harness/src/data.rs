//! Dataset handling: the data-layer contract and initial partitioning.
//!
//! The orchestrator never touches frame contents. It asks the data layer to
//! split, clone and delete frames by key and to checksum the caller's
//! training frame so it can verify it was left untouched.

use std::{
    collections::{BTreeMap, HashMap},
    hash::{DefaultHasher, Hash, Hasher},
    sync::Mutex,
};

use automl_config::{BuildSpec, ColumnKind};
use serde::{Deserialize, Serialize};

use crate::events::{EventLog, Stage};

/// Frame metadata as known to the data layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub key: String,
    pub rows: u64,
    pub columns: Vec<String>,
    /// Column kinds; unlisted columns are numeric.
    #[serde(default)]
    pub kinds: BTreeMap<String, ColumnKind>,
}

impl FrameInfo {
    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

impl std::fmt::Display for FrameInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} rows x {} cols)",
            self.key,
            self.rows,
            self.columns.len()
        )
    }
}

/// Storage engine for frames.
pub trait DataLayer: Send + Sync {
    fn frame(&self, key: &str) -> Option<FrameInfo>;

    /// Shuffle-split `source` into three new frames with the given row ratios.
    fn split(
        &self,
        source: &str,
        keys: [&str; 3],
        ratios: [f64; 3],
        seed: Option<u64>,
    ) -> Result<[FrameInfo; 3], DataError>;

    /// Copy `source` under a new key, sharing its data.
    fn clone_frame(&self, source: &str, key: &str) -> Result<FrameInfo, DataError>;

    fn delete(&self, key: &str) -> Result<(), DataError>;

    fn checksum(&self, key: &str) -> Result<u64, DataError>;

    fn column_kind(&self, frame: &str, column: &str) -> Result<ColumnKind, DataError>;
}

/// Metadata-only data layer backed by a frame catalog.
#[derive(Debug, Default)]
pub struct InMemoryData {
    frames: Mutex<HashMap<String, FrameInfo>>,
}

impl InMemoryData {
    #[must_use]
    pub fn new(frames: impl IntoIterator<Item = FrameInfo>) -> Self {
        Self {
            frames: Mutex::new(frames.into_iter().map(|f| (f.key.clone(), f)).collect()),
        }
    }

    pub fn insert(&self, frame: FrameInfo) {
        self.lock().insert(frame.key.clone(), frame);
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, FrameInfo>> {
        self.frames
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn get(&self, key: &str) -> Result<FrameInfo, DataError> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| DataError::MissingFrame(key.to_string()))
    }
}

impl DataLayer for InMemoryData {
    fn frame(&self, key: &str) -> Option<FrameInfo> {
        self.lock().get(key).cloned()
    }

    fn split(
        &self,
        source: &str,
        keys: [&str; 3],
        ratios: [f64; 3],
        _seed: Option<u64>,
    ) -> Result<[FrameInfo; 3], DataError> {
        let source = self.get(source)?;
        let total: f64 = ratios.iter().sum();
        if total <= 0.0 {
            return Err(DataError::Backend(format!(
                "invalid split ratios {ratios:?} for {}",
                source.key
            )));
        }

        let rows = source.rows as f64;
        let first = ((ratios[0] / total) * rows).round() as u64;
        let second = (((ratios[1] / total) * rows).round() as u64).min(source.rows - first);
        let sizes = [first, second, source.rows - first - second];

        let splits = [0, 1, 2].map(|i| FrameInfo {
            key: keys[i].to_string(),
            rows: sizes[i],
            ..source.clone()
        });
        let mut frames = self.lock();
        for split in &splits {
            frames.insert(split.key.clone(), split.clone());
        }
        Ok(splits)
    }

    fn clone_frame(&self, source: &str, key: &str) -> Result<FrameInfo, DataError> {
        let frame = FrameInfo {
            key: key.to_string(),
            ..self.get(source)?
        };
        self.insert(frame.clone());
        Ok(frame)
    }

    fn delete(&self, key: &str) -> Result<(), DataError> {
        self.lock().remove(key);
        Ok(())
    }

    fn checksum(&self, key: &str) -> Result<u64, DataError> {
        let frame = self.get(key)?;
        let mut hasher = DefaultHasher::new();
        frame.rows.hash(&mut hasher);
        frame.columns.hash(&mut hasher);
        frame.kinds.hash(&mut hasher);
        Ok(hasher.finish())
    }

    fn column_kind(&self, frame: &str, column: &str) -> Result<ColumnKind, DataError> {
        let frame = self.get(frame)?;
        if !frame.has_column(column) {
            return Err(DataError::MissingColumn {
                role: "Response",
                column: column.to_string(),
                frame: frame.key,
            });
        }
        Ok(frame.kinds.get(column).copied().unwrap_or_default())
    }
}

/// Frames a run trains and scores on.
#[derive(Debug, Clone)]
pub struct PreparedFrames {
    /// Key of the caller's training frame.
    pub original: String,
    pub original_checksum: u64,
    pub training: FrameInfo,
    pub validation: Option<FrameInfo>,
    pub blending: Option<FrameInfo>,
    pub leaderboard: Option<FrameInfo>,
    pub response_kind: ColumnKind,
    /// Frames created for this run, deleted if construction fails.
    pub created: Vec<String>,
}

/// Validate the input frames and derive training, validation and leaderboard frames.
///
/// Without cross-validation, missing validation and leaderboard frames are
/// carved out of the training frame. On error every frame created so far is
/// deleted again.
pub fn prepare_frames(
    spec: &BuildSpec,
    data: &dyn DataLayer,
    events: &EventLog,
) -> Result<PreparedFrames, DataError> {
    let mut created = Vec::new();
    let result = prepare(spec, data, events, &mut created);
    if result.is_err() {
        delete_frames(data, &created);
    }
    result
}

/// Delete frames, logging failures instead of propagating them.
pub fn delete_frames(data: &dyn DataLayer, keys: &[String]) {
    for key in keys {
        if let Err(e) = data.delete(key) {
            tracing::warn!("Failed to delete frame {key}: {e}");
        }
    }
}

fn prepare(
    spec: &BuildSpec,
    data: &dyn DataLayer,
    events: &EventLog,
    created: &mut Vec<String>,
) -> Result<PreparedFrames, DataError> {
    let input = &spec.input;
    let original = data
        .frame(&input.training_frame)
        .ok_or_else(|| DataError::MissingFrame(input.training_frame.clone()))?;
    let lookup = |key: &Option<String>| -> Result<Option<FrameInfo>, DataError> {
        key.as_deref()
            .map(|k| data.frame(k).ok_or_else(|| DataError::MissingFrame(k.to_string())))
            .transpose()
    };
    let mut validation = lookup(&input.validation_frame)?;
    let blending = lookup(&input.blending_frame)?;
    let mut leaderboard = lookup(&input.leaderboard_frame)?;

    for (role, frame) in [
        ("training", Some(&original)),
        ("validation", validation.as_ref()),
        ("blending", blending.as_ref()),
        ("leaderboard", leaderboard.as_ref()),
    ] {
        if let Some(frame) = frame
            && !frame.has_column(&input.response_column)
        {
            return Err(DataError::MissingColumn {
                role: "Response",
                column: input.response_column.clone(),
                frame: role.to_string(),
            });
        }
    }
    for (role, column) in [
        ("Fold", &input.fold_column),
        ("Weights", &input.weights_column),
    ] {
        if let Some(column) = column
            && !original.has_column(column)
        {
            return Err(DataError::MissingColumn {
                role,
                column: column.clone(),
                frame: "training".to_string(),
            });
        }
    }

    let original_checksum = data.checksum(&original.key)?;
    let keys = [
        format!("automl_training_{}", original.key),
        format!("automl_validation_{}", original.key),
        format!("automl_leaderboard_{}", original.key),
    ];

    let ratios = if spec.is_cv_enabled() {
        None
    } else {
        match (&validation, &leaderboard) {
            (None, None) => {
                events.info(
                    Stage::DataImport,
                    "Since cross-validation is disabled, and none of validation frame and leaderboard frame were provided, automatically split the training data into training, validation and leaderboard frames in the ratio 80/10/10",
                );
                Some([0.8, 0.1, 0.1])
            }
            (None, Some(_)) => {
                events.info(
                    Stage::DataImport,
                    "Since cross-validation is disabled, and no validation frame was provided, automatically split the training data into training and validation frames in the ratio 90/10",
                );
                Some([0.9, 0.1, 0.0])
            }
            (Some(_), None) => {
                events.info(
                    Stage::DataImport,
                    "Since cross-validation is disabled, and no leaderboard frame was provided, automatically split the training data into training and leaderboard frames in the ratio 90/10",
                );
                Some([0.9, 0.0, 0.1])
            }
            (Some(_), Some(_)) => None,
        }
    };

    let training = if let Some(ratios) = ratios {
        let [train, valid, board] = data.split(
            &original.key,
            [&keys[0], &keys[1], &keys[2]],
            ratios,
            spec.control.stopping.seed.fixed(),
        )?;
        created.extend(keys.iter().cloned());

        if validation.is_none() && valid.rows > 0 {
            validation = Some(valid);
        } else {
            data.delete(&valid.key)?;
            created.retain(|k| *k != valid.key);
        }
        if leaderboard.is_none() && board.rows > 0 {
            leaderboard = Some(board);
        } else {
            data.delete(&board.key)?;
            created.retain(|k| *k != board.key);
        }
        train
    } else {
        let training = data.clone_frame(&original.key, &keys[0])?;
        created.push(training.key.clone());
        training
    };

    let response_kind = data.column_kind(&training.key, &input.response_column)?;

    events.info(
        Stage::DataImport,
        format!("training frame: {training} checksum: {original_checksum}"),
    );
    for (role, frame) in [("validation", &validation), ("leaderboard", &leaderboard)] {
        match frame {
            Some(frame) => {
                let checksum = data.checksum(&frame.key)?;
                events.info(
                    Stage::DataImport,
                    format!("{role} frame: {frame} checksum: {checksum}"),
                );
            }
            None => events.info(Stage::DataImport, format!("{role} frame: NULL")),
        }
    }
    events.info(
        Stage::DataImport,
        format!("response column: {}", input.response_column),
    );
    events.info(
        Stage::DataImport,
        format!("fold column: {}", input.fold_column.as_deref().unwrap_or("NULL")),
    );
    events.info(
        Stage::DataImport,
        format!(
            "weights column: {}",
            input.weights_column.as_deref().unwrap_or("NULL")
        ),
    );

    Ok(PreparedFrames {
        original: original.key,
        original_checksum,
        training,
        validation,
        blending,
        leaderboard,
        response_kind,
        created: created.clone(),
    })
}

/// Errors that can occur while preparing data.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("frame {0} not found")]
    MissingFrame(String),
    #[error("{role} column '{column}' is not in the {frame} frame.")]
    MissingColumn {
        role: &'static str,
        column: String,
        frame: String,
    },
    #[error("data layer error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::state::{MemoryStore, ProjectStore};

    fn frame(key: &str, rows: u64) -> FrameInfo {
        FrameInfo {
            key: key.to_string(),
            rows,
            columns: vec!["x".into(), "fold".into(), "y".into()],
            kinds: BTreeMap::from([("y".to_string(), ColumnKind::Binary)]),
        }
    }

    fn events() -> EventLog {
        let store: Arc<dyn ProjectStore> = Arc::new(MemoryStore::default());
        EventLog::new(store, "p")
    }

    fn no_cv(mut spec: BuildSpec) -> BuildSpec {
        spec.control.nfolds = 0;
        spec
    }

    #[test]
    fn test_cv_clones_training_frame() {
        let data = InMemoryData::new([frame("train", 1000)]);
        let prepared =
            prepare_frames(&BuildSpec::new("train", "y"), &data, &events()).unwrap();

        assert_eq!(prepared.training.key, "automl_training_train");
        assert_eq!(prepared.training.rows, 1000);
        assert!(prepared.validation.is_none());
        assert!(prepared.leaderboard.is_none());
        assert_eq!(prepared.response_kind, ColumnKind::Binary);
        assert!(data.frame("train").is_some());
    }

    #[test]
    fn test_split_80_10_10_without_cv() {
        let data = InMemoryData::new([frame("train", 1000)]);
        let prepared =
            prepare_frames(&no_cv(BuildSpec::new("train", "y")), &data, &events()).unwrap();

        assert_eq!(prepared.training.rows, 800);
        assert_eq!(prepared.validation.as_ref().unwrap().rows, 100);
        assert_eq!(
            prepared.leaderboard.as_ref().unwrap().key,
            "automl_leaderboard_train"
        );
        assert_eq!(prepared.leaderboard.as_ref().unwrap().rows, 100);
        assert_eq!(prepared.created.len(), 3);
    }

    #[test]
    fn test_split_90_10_keeps_given_leaderboard() {
        let data = InMemoryData::new([frame("train", 1000), frame("test", 50)]);
        let mut spec = no_cv(BuildSpec::new("train", "y"));
        spec.input.leaderboard_frame = Some("test".into());
        let prepared = prepare_frames(&spec, &data, &events()).unwrap();

        assert_eq!(prepared.training.rows, 900);
        assert_eq!(prepared.validation.as_ref().unwrap().rows, 100);
        assert_eq!(prepared.leaderboard.as_ref().unwrap().key, "test");
        // the empty leaderboard split is deleted again
        assert!(data.frame("automl_leaderboard_train").is_none());
        assert_eq!(prepared.created.len(), 2);
    }

    #[test]
    fn test_split_90_0_10_keeps_given_validation() {
        let data = InMemoryData::new([frame("train", 1000), frame("valid", 50)]);
        let mut spec = no_cv(BuildSpec::new("train", "y"));
        spec.input.validation_frame = Some("valid".into());
        let prepared = prepare_frames(&spec, &data, &events()).unwrap();

        assert_eq!(prepared.training.rows, 900);
        assert_eq!(prepared.validation.as_ref().unwrap().key, "valid");
        assert_eq!(prepared.leaderboard.as_ref().unwrap().rows, 100);
        assert!(data.frame("automl_validation_train").is_none());
    }

    #[test]
    fn test_missing_response_column() {
        let data = InMemoryData::new([frame("train", 100)]);
        let err = prepare_frames(&BuildSpec::new("train", "target"), &data, &events())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Response column 'target' is not in the training frame."
        );
    }

    #[test]
    fn test_missing_weights_column() {
        let data = InMemoryData::new([frame("train", 100)]);
        let mut spec = BuildSpec::new("train", "y");
        spec.input.weights_column = Some("w".into());
        let err = prepare_frames(&spec, &data, &events()).unwrap_err();
        assert!(matches!(err, DataError::MissingColumn { role: "Weights", .. }));
        assert_eq!(data.keys(), ["train"]);
    }

    #[test]
    fn test_missing_training_frame() {
        let data = InMemoryData::default();
        let err = prepare_frames(&BuildSpec::new("nope", "y"), &data, &events()).unwrap_err();
        assert!(matches!(err, DataError::MissingFrame(k) if k == "nope"));
    }

    #[test]
    fn test_checksum_tracks_contents() {
        let data = InMemoryData::new([frame("a", 10)]);
        let before = data.checksum("a").unwrap();
        data.insert(frame("a", 11));
        assert_ne!(before, data.checksum("a").unwrap());
    }
}
