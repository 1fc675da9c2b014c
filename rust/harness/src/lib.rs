#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::too_many_lines
)]

//! AutoML Harness
//!
//! Runs a budgeted search over model families: splits the time and model
//! budget across a fixed plan, launches and polls training tasks, collects
//! results on a shared leaderboard and stacks the best of them.

pub mod algos;
pub mod automl;
pub mod clock;
pub mod config;
pub mod data;
pub mod ensemble;
pub mod events;
pub mod keys;
pub mod leaderboard;
pub mod params;
pub mod plan;
pub mod poller;
pub mod progress;
pub mod runner;
pub mod sim;
pub mod state;
pub mod task;

pub use automl::{AutoMl, AutoMlError, RunHandle, RunSettings, RunStatus, RunSummary};
pub use config::AutoMlConfig;
pub use data::{DataLayer, FrameInfo, InMemoryData};
pub use leaderboard::{Leaderboard, LeaderboardHandle};
pub use plan::{Allocation, WorkKind, WorkPlan};
pub use runner::ProcessLauncher;
pub use sim::{SimSettings, SimulatedLauncher};
pub use state::{FileStore, MemoryStore, ProjectStore};
pub use task::{ModelResult, TaskLauncher};
