//! Append-only event log of scheduling decisions.
//!
//! Events live in the project store next to the leaderboard so concurrent
//! runs of one project share a single log. Every append is mirrored to
//! `tracing`.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::state::{ProjectStore, now_timestamp};

/// Phase of the run an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Workflow,
    DataImport,
    ModelTraining,
    ModelSelection,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Workflow => "Workflow",
            Self::DataImport => "DataImport",
            Self::ModelTraining => "ModelTraining",
            Self::ModelSelection => "ModelSelection",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
        };
        f.write_str(s)
    }
}

/// One log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: String,
    pub stage: Stage,
    pub level: EventLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, String>,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:5} {:14} {}",
            self.timestamp, self.level, self.stage, self.message
        )?;
        for (name, value) in &self.values {
            write!(f, " [{name}={value}]")?;
        }
        Ok(())
    }
}

/// Handle for appending to a project's event log.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn ProjectStore>,
    project: String,
}

impl EventLog {
    #[must_use]
    pub fn new(store: Arc<dyn ProjectStore>, project: impl Into<String>) -> Self {
        Self {
            store,
            project: project.into(),
        }
    }

    pub fn debug(&self, stage: Stage, message: impl Into<String>) {
        self.append(stage, EventLevel::Debug, message.into(), BTreeMap::new());
    }

    pub fn info(&self, stage: Stage, message: impl Into<String>) {
        self.append(stage, EventLevel::Info, message.into(), BTreeMap::new());
    }

    pub fn warn(&self, stage: Stage, message: impl Into<String>) {
        self.append(stage, EventLevel::Warn, message.into(), BTreeMap::new());
    }

    /// Info event carrying a named value, e.g. `duration_secs`.
    pub fn info_with(
        &self,
        stage: Stage,
        message: impl Into<String>,
        name: &str,
        value: impl ToString,
    ) {
        let values = BTreeMap::from([(name.to_string(), value.to_string())]);
        self.append(stage, EventLevel::Info, message.into(), values);
    }

    fn append(
        &self,
        stage: Stage,
        level: EventLevel,
        message: String,
        values: BTreeMap<String, String>,
    ) {
        match level {
            EventLevel::Debug => tracing::debug!(project = %self.project, %stage, "{message}"),
            EventLevel::Info => tracing::info!(project = %self.project, %stage, "{message}"),
            EventLevel::Warn => tracing::warn!(project = %self.project, %stage, "{message}"),
        }

        let event = Event {
            timestamp: now_timestamp(),
            stage,
            level,
            message,
            values,
        };
        let mut event = Some(event);
        if let Err(e) = self.store.update(&self.project, &mut |state| {
            if let Some(event) = event.take() {
                state.events.push(event);
            }
        }) {
            tracing::error!("Failed to record event for {}: {}", self.project, e);
        }
    }

    /// Every event recorded for the project so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        match self.store.load(&self.project) {
            Ok(state) => state.events,
            Err(e) => {
                tracing::error!("Failed to read events for {}: {}", self.project, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;

    #[test]
    fn test_events_append_in_order() {
        let store: Arc<dyn ProjectStore> = Arc::new(MemoryStore::default());
        let log = EventLog::new(store.clone(), "p");

        log.info(Stage::Workflow, "first");
        log.warn(Stage::DataImport, "second");
        log.info_with(Stage::Workflow, "third", "duration_secs", 12);

        let events = log.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].message, "first");
        assert_eq!(events[1].level, EventLevel::Warn);
        assert_eq!(events[2].values.get("duration_secs").unwrap(), "12");
        assert!(events[2].to_string().contains("[duration_secs=12]"));
    }

    #[test]
    fn test_logs_are_per_project() {
        let store: Arc<dyn ProjectStore> = Arc::new(MemoryStore::default());
        EventLog::new(store.clone(), "a").info(Stage::Workflow, "a1");
        EventLog::new(store.clone(), "b").info(Stage::Workflow, "b1");
        EventLog::new(store.clone(), "b").info(Stage::Workflow, "b2");

        assert_eq!(EventLog::new(store.clone(), "a").events().len(), 1);
        assert_eq!(EventLog::new(store, "b").events().len(), 2);
    }
}
