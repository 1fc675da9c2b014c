//! Configuration parsing for the AutoML harness.

use std::{path::Path, time::Duration};

use automl_config::BuildSpec;
use serde::{Deserialize, Serialize};

use crate::{automl::RunSettings, data::FrameInfo, plan::Allocation, sim::SimSettings};

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoMlConfig {
    /// The build to run.
    pub automl: BuildSpec,
    #[serde(default)]
    pub harness: HarnessSettings,
    /// Frames registered with the in-memory data layer.
    #[serde(default)]
    pub frames: Vec<FrameInfo>,
    /// Allocation table; the built-in one is used when empty.
    #[serde(default)]
    pub plan: Vec<Allocation>,
}

/// Harness-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessSettings {
    /// Directory holding one state file per project.
    #[serde(default = "default_store_dir")]
    pub store_dir: String,
    /// How often running tasks are polled.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Where trainer processes write task files and logs.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
    /// `RUST_LOG` value to pass to trainer processes.
    #[serde(default)]
    pub rust_log: Option<String>,
    /// Trainer binary; tasks are simulated when not set.
    #[serde(default)]
    pub trainer: Option<String>,
    /// Extra arguments placed before the trainer subcommand.
    #[serde(default)]
    pub trainer_args: Vec<String>,
    #[serde(default)]
    pub simulation: SimSettings,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            artifact_dir: default_artifact_dir(),
            rust_log: None,
            trainer: None,
            trainer_args: Vec::new(),
            simulation: SimSettings::default(),
        }
    }
}

fn default_store_dir() -> String {
    "./automl_projects".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_artifact_dir() -> String {
    "./artifacts".to_string()
}

impl AutoMlConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if config.harness.poll_interval_ms == 0 {
            return Err(ConfigError::Parse(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(config)
    }

    /// Orchestrator settings derived from the harness section and plan.
    #[must_use]
    pub fn run_settings(&self) -> RunSettings {
        let mut settings = RunSettings {
            poll_interval: Duration::from_millis(self.harness.poll_interval_ms),
            ..RunSettings::default()
        };
        if !self.plan.is_empty() {
            settings.allocations.clone_from(&self.plan);
        }
        settings
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}
