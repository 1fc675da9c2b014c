//! Subprocess execution of training tasks.
//!
//! Each task runs as `<trainer> [args] <build|search> --task <file>`, where
//! the file holds the JSON task description. The trainer reports back on
//! stdout:
//!
//! ```text
//! PROGRESS 0.35
//! MODEL {"key": "...", "algo": "GBM", "model_type": "GBM", "metrics": {"auc": 0.81}}
//! ```
//!
//! A build reports a single `MODEL` line, a search one per finished model.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use tokio::{
    fs::OpenOptions,
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
};

use crate::{
    plan::WorkKind,
    state::now_timestamp,
    task::{
        LaunchError, ModelResult, TaskHandle, TaskLauncher, TaskOutcome, TaskOutput,
        TaskReporter, TaskSpec, task_channel,
    },
};

/// A line of trainer output the harness understands.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainerLine {
    Progress(f64),
    Model(ModelResult),
}

impl TrainerLine {
    fn parse(line: &str) -> Option<Self> {
        if let Some(rest) = line.strip_prefix("PROGRESS ") {
            return rest.trim().parse().ok().map(Self::Progress);
        }
        if let Some(rest) = line.strip_prefix("MODEL ") {
            return match serde_json::from_str(rest.trim()) {
                Ok(model) => Some(Self::Model(model)),
                Err(e) => {
                    tracing::warn!("Unparseable MODEL line: {e}");
                    None
                }
            };
        }
        None
    }
}

/// Launches each task as a trainer subprocess.
pub struct ProcessLauncher {
    /// Path to the trainer binary.
    trainer: String,
    /// Arguments placed before the task subcommand.
    trainer_args: Vec<String>,
    /// Root of the per-task artifact directories.
    artifact_dir: PathBuf,
    /// `RUST_LOG` value for child processes.
    rust_log: Option<String>,
}

impl ProcessLauncher {
    #[must_use]
    pub fn new(
        trainer: impl Into<String>,
        trainer_args: Vec<String>,
        artifact_dir: impl AsRef<Path>,
        rust_log: Option<String>,
    ) -> Self {
        Self {
            trainer: trainer.into(),
            trainer_args,
            artifact_dir: artifact_dir.as_ref().to_path_buf(),
            rust_log,
        }
    }

    /// Find the trainer binary.
    #[must_use]
    pub fn find_trainer_binary() -> Option<String> {
        let candidates = [
            "./target/release/automl-trainer",
            "./target/debug/automl-trainer",
            "automl-trainer",
        ];

        for candidate in candidates {
            if Path::new(candidate).exists() {
                return Some(candidate.to_string());
            }
        }

        if let Ok(output) = std::process::Command::new("which")
            .arg("automl-trainer")
            .output()
            && output.status.success()
        {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Some(path);
            }
        }

        None
    }

    /// Directory holding a task's description and logs.
    #[must_use]
    pub fn task_dir(&self, key: &str) -> PathBuf {
        self.artifact_dir.join(key)
    }

    fn write_task_file(&self, spec: &TaskSpec) -> Result<PathBuf, LaunchError> {
        let dir = self.task_dir(&spec.key);
        std::fs::create_dir_all(&dir).map_err(|e| LaunchError::Io(dir.clone(), e))?;
        let path = dir.join("task.json");
        let json = serde_json::to_string_pretty(spec)
            .map_err(|e| LaunchError::Serialize(spec.key.clone(), e.to_string()))?;
        std::fs::write(&path, json).map_err(|e| LaunchError::Io(path.clone(), e))?;
        Ok(path)
    }
}

impl TaskLauncher for ProcessLauncher {
    fn launch(&self, spec: TaskSpec) -> Result<TaskHandle, LaunchError> {
        let task_file = self.write_task_file(&spec)?;
        let command = match spec.kind {
            WorkKind::Build => "build",
            WorkKind::Search => "search",
        };

        let mut args = self.trainer_args.clone();
        args.push(command.to_string());
        args.push("--task".to_string());
        args.push(task_file.display().to_string());

        tracing::debug!("Spawning: {} {}", self.trainer, args.join(" "));

        let mut cmd = Command::new(&self.trainer);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref rust_log) = self.rust_log {
            cmd.env("RUST_LOG", rust_log);
        }
        let child = cmd
            .spawn()
            .map_err(|e| LaunchError::Spawn(spec.key.clone(), e))?;
        let pid = child.id().ok_or_else(|| {
            LaunchError::Spawn(spec.key.clone(), std::io::Error::other("no PID"))
        })?;

        tracing::info!("Started trainer for {} (PID {pid})", spec.key);

        let (handle, reporter) = task_channel(spec.key.clone(), spec.kind);
        tokio::spawn(supervise(
            child,
            pid,
            spec.key,
            spec.kind,
            self.task_dir(handle.key()),
            reporter,
        ));
        Ok(handle)
    }
}

/// Stream a trainer's output into the task channel until it exits.
async fn supervise(
    mut child: Child,
    pid: u32,
    key: String,
    kind: WorkKind,
    log_dir: PathBuf,
    reporter: TaskReporter,
) {
    let reporter = Arc::new(reporter);
    let timestamp = now_timestamp();

    // Stream stdout to file and parse progress and models
    let stdout_task = child.stdout.take().map(|stdout| {
        let path = log_dir.join("stdout.log");
        let ts = timestamp.clone();
        let reporter = reporter.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut file = open_log(&path, &ts).await;
            let mut last_model = None;

            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(ref mut f) = file {
                    let _ = f.write_all(line.as_bytes()).await;
                    let _ = f.write_all(b"\n").await;
                }
                match TrainerLine::parse(&line) {
                    Some(TrainerLine::Progress(p)) => reporter.set_progress(p),
                    Some(TrainerLine::Model(model)) => {
                        if kind == WorkKind::Search {
                            reporter.push_result(model.clone());
                        }
                        last_model = Some(model);
                    }
                    None => {}
                }
            }
            last_model
        })
    });

    // Stream stderr to file and keep last 20 lines for error reporting
    let stderr_task = child.stderr.take().map(|stderr| {
        let path = log_dir.join("stderr.log");
        let ts = timestamp;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut file = open_log(&path, &ts).await;

            let mut tail = VecDeque::with_capacity(20);
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(ref mut f) = file {
                    let _ = f.write_all(line.as_bytes()).await;
                    let _ = f.write_all(b"\n").await;
                }
                if tail.len() >= 20 {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>()
        })
    });

    // Wait for the process, forwarding a stop request as SIGTERM
    let status = tokio::select! {
        status = child.wait() => status,
        () = reporter.stopped() => {
            tracing::info!("Stopping trainer for {key} (PID {pid})");
            // SAFETY: pid belongs to a child we spawned and haven't reaped yet
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            child.wait().await
        }
    };

    let last_model = match stdout_task {
        Some(task) => task.await.ok().flatten(),
        None => None,
    };
    let stderr_output = match stderr_task {
        Some(task) => task.await.ok(),
        None => None,
    };

    // a trainer that finished its model before the stop landed still completes
    let stopped = reporter.is_stop_requested();
    let outcome = match status {
        Ok(status) if status.success() => match kind {
            WorkKind::Build => match last_model {
                Some(model) => TaskOutcome::Completed(TaskOutput::Model(model)),
                None if stopped => TaskOutcome::Cancelled,
                None => TaskOutcome::Crashed(format!("{key}: trainer reported no model")),
            },
            WorkKind::Search => {
                TaskOutcome::Completed(TaskOutput::Search(reporter.results()))
            }
        },
        _ if stopped => TaskOutcome::Cancelled,
        Ok(status) => TaskOutcome::Crashed(match stderr_output {
            Some(lines) if !lines.is_empty() => lines.join("\n"),
            _ => format!("Exit code: {:?}", status.code()),
        }),
        Err(e) => TaskOutcome::Crashed(format!("Process error: {e}")),
    };
    reporter.finish(outcome);
}

/// Open a log file for appending, marking where this attempt starts.
async fn open_log(path: &Path, timestamp: &str) -> Option<tokio::fs::File> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .ok()?;
    if file.metadata().await.is_ok_and(|m| m.len() > 0) {
        let _ = file
            .write_all(format!("\n--- task started at {timestamp} ---\n\n").as_bytes())
            .await;
    }
    Some(file)
}
