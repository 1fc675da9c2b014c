//! Shared per-project state and its persistence.
//!
//! The leaderboard and event log of a project outlive a single run and are
//! shared by every run of that project. Stores only expose whole-state
//! read-modify-write so concurrent writers never clobber each other.

use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{events::Event, leaderboard::Leaderboard};

/// Format of run stamps embedded in result keys.
pub const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Everything persisted for one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    #[serde(default)]
    pub leaderboard: Option<Leaderboard>,
    #[serde(default)]
    pub events: Vec<Event>,
    /// Stamp of the most recent run, so two runs never share one.
    #[serde(default)]
    pub last_run_stamp: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
}

impl Default for ProjectState {
    fn default() -> Self {
        Self {
            leaderboard: None,
            events: Vec::new(),
            last_run_stamp: None,
            version: default_version(),
        }
    }
}

fn default_version() -> u32 {
    1
}

/// Authoritative storage for project state.
pub trait ProjectStore: Send + Sync {
    fn exists(&self, project: &str) -> Result<bool, StoreError>;

    /// Current state, or an empty one if the project doesn't exist.
    fn load(&self, project: &str) -> Result<ProjectState, StoreError>;

    /// Apply `f` to the project state while holding the store's lock.
    fn update(
        &self,
        project: &str,
        f: &mut dyn FnMut(&mut ProjectState),
    ) -> Result<(), StoreError>;

    /// Delete the project. Missing projects are not an error.
    fn remove(&self, project: &str) -> Result<(), StoreError>;
}

/// Claim a run stamp for `project`, never reusing or going back from the last one.
///
/// If another run already took the stamp for `now`, the next free second is used.
pub fn reserve_run_stamp(
    store: &dyn ProjectStore,
    project: &str,
    now: NaiveDateTime,
) -> Result<String, StoreError> {
    let mut stamp = String::new();
    store.update(project, &mut |state| {
        let last = state
            .last_run_stamp
            .as_deref()
            .and_then(|s| NaiveDateTime::parse_from_str(s, STAMP_FORMAT).ok());
        let at = match last {
            Some(last) if last >= now => last + ChronoDuration::seconds(1),
            _ => now,
        };
        stamp = at.format(STAMP_FORMAT).to_string();
        state.last_run_stamp = Some(stamp.clone());
    })?;
    Ok(stamp)
}

/// One JSON file per project, locked with `fs2` around every access.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Path of the state file for a project.
    #[must_use]
    pub fn path_for(&self, project: &str) -> PathBuf {
        let name: String = project
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl ProjectStore for FileStore {
    fn exists(&self, project: &str) -> Result<bool, StoreError> {
        Ok(self.path_for(project).exists())
    }

    fn load(&self, project: &str) -> Result<ProjectState, StoreError> {
        let path = self.path_for(project);
        if !path.exists() {
            return Ok(ProjectState::default());
        }

        let file = File::open(&path).map_err(|e| StoreError::Io(path.clone(), e))?;
        file.lock_shared()
            .map_err(|e| StoreError::Lock(path.clone(), e))?;

        let state = if file.metadata().map(|m| m.len()).unwrap_or(0) > 0 {
            serde_json::from_reader(BufReader::new(&file))
                .map_err(|e| StoreError::Parse(path.clone(), e.to_string()))?
        } else {
            ProjectState::default()
        };

        file.unlock().map_err(|e| StoreError::Lock(path, e))?;
        Ok(state)
    }

    fn update(
        &self,
        project: &str,
        f: &mut dyn FnMut(&mut ProjectState),
    ) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| StoreError::Io(self.dir.clone(), e))?;
        let path = self.path_for(project);

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::Io(path.clone(), e))?;

        // exclusive for the whole read-modify-write
        file.lock_exclusive()
            .map_err(|e| StoreError::Lock(path.clone(), e))?;

        let mut state: ProjectState = if file.metadata().map(|m| m.len()).unwrap_or(0) > 0 {
            serde_json::from_reader(BufReader::new(&file))
                .map_err(|e| StoreError::Parse(path.clone(), e.to_string()))?
        } else {
            ProjectState::default()
        };

        f(&mut state);

        file.set_len(0)
            .map_err(|e| StoreError::Io(path.clone(), e))?;
        (&file)
            .seek(SeekFrom::Start(0))
            .map_err(|e| StoreError::Io(path.clone(), e))?;
        let mut writer = BufWriter::new(&file);
        serde_json::to_writer_pretty(&mut writer, &state)
            .map_err(|e| StoreError::Write(path.clone(), e.to_string()))?;
        writer
            .flush()
            .map_err(|e| StoreError::Io(path.clone(), e))?;

        file.unlock().map_err(|e| StoreError::Lock(path, e))?;
        Ok(())
    }

    fn remove(&self, project: &str) -> Result<(), StoreError> {
        let path = self.path_for(project);
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(StoreError::Io(path, e)),
            _ => Ok(()),
        }
    }
}

/// In-process store for embedding and tests.
#[derive(Default)]
pub struct MemoryStore {
    projects: Mutex<HashMap<String, ProjectState>>,
}

impl ProjectStore for MemoryStore {
    fn exists(&self, project: &str) -> Result<bool, StoreError> {
        let projects = self
            .projects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(projects.contains_key(project))
    }

    fn load(&self, project: &str) -> Result<ProjectState, StoreError> {
        let projects = self
            .projects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(projects.get(project).cloned().unwrap_or_default())
    }

    fn update(
        &self,
        project: &str,
        f: &mut dyn FnMut(&mut ProjectState),
    ) -> Result<(), StoreError> {
        let mut projects = self
            .projects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(projects.entry(project.to_string()).or_default());
        Ok(())
    }

    fn remove(&self, project: &str) -> Result<(), StoreError> {
        let mut projects = self
            .projects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        projects.remove(project);
        Ok(())
    }
}

/// Get current local time as a log timestamp.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Errors that can occur with the project store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read/write state file {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to lock state file {0}: {1}")]
    Lock(PathBuf, std::io::Error),
    #[error("failed to parse state file {0}: {1}")]
    Parse(PathBuf, String),
    #[error("failed to write state file {0}: {1}")]
    Write(PathBuf, String),
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use automl_config::SortMetric;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    use super::*;
    use crate::events::{EventLevel, Stage};

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 17)
            .and_then(|d| d.and_hms_opt(h, m, s))
            .unwrap()
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().join("store"));

        assert!(!store.exists("p").unwrap());
        store
            .update("p", &mut |state| {
                state.leaderboard = Some(Leaderboard::new("p", SortMetric::Auc));
            })
            .unwrap();
        assert!(store.exists("p").unwrap());

        let loaded = store.load("p").unwrap();
        assert_eq!(loaded.leaderboard.unwrap().sort_metric, SortMetric::Auc);
        assert_eq!(loaded.version, 1);

        store.remove("p").unwrap();
        assert!(!store.exists("p").unwrap());
        store.remove("p").unwrap();
    }

    #[test]
    fn test_file_store_writes_large_state_completely() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());

        // well past the write buffer, so the tail only lands on flush
        store
            .update("big", &mut |state| {
                for i in 0..500 {
                    state.events.push(Event {
                        timestamp: format!("2024-05-17 10:00:{:02}.000", i % 60),
                        stage: Stage::ModelTraining,
                        level: EventLevel::Info,
                        message: format!("AutoML: starting GBM_{i}_AutoML_20240517_100000 model training"),
                        values: BTreeMap::new(),
                    });
                }
            })
            .unwrap();
        assert!(std::fs::metadata(store.path_for("big")).unwrap().len() > 8 * 1024);

        let loaded = store.load("big").unwrap();
        assert_eq!(loaded.events.len(), 500);
        assert!(loaded.events[499].message.contains("GBM_499_"));
    }

    #[test]
    fn test_file_store_project_names_are_sanitized() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let path = store.path_for("../evil/name");
        assert_eq!(path.parent().unwrap(), dir.path());
    }

    #[test]
    fn test_concurrent_updates_serialize() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()));

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        store
                            .update("shared", &mut |state| {
                                state.last_run_stamp = Some(format!("{t}-{i}"));
                                state.version += 1;
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        // default version 1 plus one increment per update
        assert_eq!(store.load("shared").unwrap().version, 41);
    }

    #[test]
    fn test_run_stamps_are_unique_per_project() {
        let store = MemoryStore::default();
        let now = at(10, 0, 0);

        let first = reserve_run_stamp(&store, "p", now).unwrap();
        let second = reserve_run_stamp(&store, "p", now).unwrap();
        let other = reserve_run_stamp(&store, "q", now).unwrap();

        assert_eq!(first, "20240517_100000");
        assert_eq!(second, "20240517_100001");
        assert_eq!(other, "20240517_100000");

        let later = reserve_run_stamp(&store, "p", at(11, 0, 0)).unwrap();
        assert_eq!(later, "20240517_110000");
    }
}
