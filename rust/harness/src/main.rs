//! AutoML Harness CLI
//!
//! Runs a budgeted AutoML build from a TOML config and inspects the
//! leaderboards and event logs of past runs.

use std::sync::Arc;

use automl_harness::{
    automl::AutoMl,
    config::AutoMlConfig,
    data::InMemoryData,
    events::EventLevel,
    plan::build_plan,
    progress::run_progress_bar,
    runner::ProcessLauncher,
    sim::SimulatedLauncher,
    state::{FileStore, ProjectStore},
    task::TaskLauncher,
};
use clap::{Parser, Subcommand};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "automl", about = "Budgeted AutoML orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an AutoML build
    Run {
        /// Path to automl.toml config file
        #[arg(short, long, default_value = "automl.toml")]
        config: String,

        /// Path to the trainer binary (overrides the config)
        #[arg(long, conflicts_with = "simulate")]
        trainer: Option<String>,

        /// Simulate training tasks instead of spawning a trainer
        #[arg(long)]
        simulate: bool,
    },

    /// Print the work plan a config would run
    Plan {
        /// Path to automl.toml config file
        #[arg(short, long, default_value = "automl.toml")]
        config: String,
    },

    /// Show a project's leaderboard
    Leaderboard {
        /// Project store directory
        #[arg(short, long, default_value = "./automl_projects")]
        store: String,

        /// Project name
        #[arg(short, long)]
        project: String,
    },

    /// Show a project's event log
    Events {
        /// Project store directory
        #[arg(short, long, default_value = "./automl_projects")]
        store: String,

        /// Project name
        #[arg(short, long)]
        project: String,

        /// Include debug events
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber progress bars
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            trainer,
            simulate,
        } => {
            let automl_config = AutoMlConfig::load(&config)?;
            let harness = &automl_config.harness;

            let launcher: Arc<dyn TaskLauncher> = match trainer.or_else(|| harness.trainer.clone())
            {
                Some(trainer) if !simulate => Arc::new(ProcessLauncher::new(
                    trainer,
                    harness.trainer_args.clone(),
                    &harness.artifact_dir,
                    harness.rust_log.clone(),
                )),
                _ => {
                    println!("No trainer configured; simulating training tasks");
                    Arc::new(SimulatedLauncher::new(harness.simulation.clone()))
                }
            };
            let data = Arc::new(InMemoryData::new(automl_config.frames.clone()));
            let store = Arc::new(FileStore::new(&harness.store_dir));

            println!("Starting AutoML with config: {config}");
            let automl = Arc::new(AutoMl::new(
                automl_config.automl.clone(),
                automl_config.run_settings(),
                launcher,
                data,
                store,
            )?);
            automl
                .progress()
                .attach(run_progress_bar(automl.project()));

            let summary = automl.clone().start().block_until_done().await?;

            println!();
            println!("=== AutoML Complete ===");
            println!("Project: {}", summary.project);
            println!("Models built: {}", summary.models_built);
            println!("Work: {} / {}", summary.worked, summary.total_work);
            println!("Duration: {:.1}s", summary.duration.as_secs_f64());
            println!();
            print!("{}", automl.leaderboard().snapshot()?.table());
        }

        Commands::Plan { config } => {
            let automl_config = AutoMlConfig::load(&config)?;
            let settings = automl_config.run_settings();
            let (plan, skipped) =
                build_plan(&automl_config.automl.models, &settings.allocations, |_| true)?;

            println!("=== Work Plan ===");
            for item in plan.items() {
                println!(
                    "  {:<16} {:<22} x{}  share {:>3}  = {}",
                    item.family().to_string(),
                    item.kind().to_string(),
                    item.remaining(),
                    item.share(),
                    item.remaining_work()
                );
            }
            println!("Total work: {}", plan.remaining_work());

            if !skipped.is_empty() {
                println!();
                println!("Excluded:");
                for (algo, why) in &skipped {
                    println!("  - {algo} ({why:?})");
                }
            }

            if plan.remaining_work() == 0 {
                println!();
                println!("Nothing to run.");
            }
        }

        Commands::Leaderboard { store, project } => {
            let store = FileStore::new(&store);
            if !store.exists(&project)? {
                println!("No such project: {project}");
                return Ok(());
            }
            match store.load(&project)?.leaderboard {
                Some(leaderboard) => print!("{}", leaderboard.table()),
                None => println!("No leaderboard for project {project}."),
            }
        }

        Commands::Events {
            store,
            project,
            verbose,
        } => {
            let store = FileStore::new(&store);
            if !store.exists(&project)? {
                println!("No such project: {project}");
                return Ok(());
            }
            let state = store.load(&project)?;

            println!("=== Event Log: {project} ===");
            for event in state
                .events
                .iter()
                .filter(|e| verbose || e.level > EventLevel::Debug)
            {
                println!("{event}");
            }
        }
    }

    Ok(())
}
