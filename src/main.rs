mod adapters;
mod cache;
mod config;
mod coverage;
mod error;
mod mutation;
mod project_config;
mod runner;
mod scheduler;
mod score;
mod selector;
mod server;
mod workspace;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::adapters::process::kill_processes_by_prefix;
use crate::cache::SqliteCacheStore;
use crate::config::Config;
use crate::error::{exit_code_for, EngineError};
use crate::mutation::events::EngineEvent;
use crate::runner::Runner;
use crate::scheduler::CancelHandle;
use crate::server::{start_server, ServerState};

#[derive(Parser)]
#[command(name = "mutest")]
#[command(version)]
#[command(about = "Coverage-guided mutation testing with isolated parallel lanes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mutants of one unit
    Run {
        /// Unit manifest produced by the mutant generator
        #[arg(short, long)]
        unit: PathBuf,

        /// Number of parallel lanes
        #[arg(short, long)]
        lanes: Option<usize>,

        /// Build every lane separately instead of one shared build
        #[arg(long)]
        in_isolation: bool,

        /// Work on a temporary copy of the project
        #[arg(long)]
        sandbox: bool,

        /// Write the full report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Serve the result cache over HTTP
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Remove files left behind by an interrupted run
    Clean {
        /// Project root to clean
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        tracing::error!("{:#}", e);
        if let Some(details) = e
            .downcast_ref::<EngineError>()
            .map(EngineError::details)
            .filter(|d| !d.is_empty())
        {
            eprintln!("{}", details);
        }
        std::process::exit(exit_code_for(&e));
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.general.log_level.clone()
    };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .init();

    tracing::debug!("Data directory: {}", config.data_dir().display());

    match cli.command {
        Commands::Run {
            unit,
            lanes,
            in_isolation,
            sandbox,
            output,
        } => {
            if let Some(lanes) = lanes {
                config.engine.lanes = lanes;
            }
            config.engine.in_isolation |= in_isolation;
            config.engine.sandbox |= sandbox;

            let cancel = CancelHandle::new();
            {
                let cancel = cancel.clone();
                let prefixes = config.engine.kill_process_prefixes.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                        let killed = kill_processes_by_prefix(&prefixes);
                        if killed > 0 {
                            tracing::info!("Stopped {} tool process(es)", killed);
                        }
                    }
                });
            }

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let listener = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    log_event(&event);
                }
            });

            let report = Runner::new(config, cancel).with_events(tx).run(&unit).await;
            // The runner owned the only sender; the listener drains and exits.
            let _ = listener.await;
            let report = report?;

            for line in report.summary.lines() {
                println!("{}", line);
            }
            if report.cancelled {
                println!("Run cancelled; remaining mutants were not run");
            } else if report.stopped_early {
                println!("Stopped early; remaining mutants were not run");
            }

            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&report)?;
                std::fs::write(&path, json)?;
                tracing::info!("Report written to {}", path.display());
            }
        }
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);

            let store = SqliteCacheStore::new(&config.database_path()).await?;
            tracing::info!("Cache database: {}", config.database_path().display());

            let state = Arc::new(ServerState { store });
            start_server(state, &host, port).await?;
        }
        Commands::Clean { root } => {
            let report =
                workspace::fs::purge_stale(&root, &config.engine.work_dir_name).await?;
            println!(
                "Restored {} file(s), deleted {} artifact(s)",
                report.restored, report.deleted
            );
        }
    }

    Ok(())
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::RunStarted { total, lanes, .. } => {
            tracing::info!("Running {} mutant(s) on {} lane(s)", total, lanes)
        }
        EngineEvent::MutantFinished {
            mutant_id,
            status,
            completed,
            total,
            ..
        } => tracing::info!("[{}/{}] mutant {}: {}", completed, total, mutant_id, status),
        EngineEvent::FallbackApplied {
            strategy, lanes, ..
        } => tracing::warn!("Build failed, retrying with {} on {} lane(s)", strategy, lanes),
        EngineEvent::ThresholdReached {
            survived_ratio,
            killed_ratio,
            ..
        } => tracing::info!(
            "Threshold reached (survived {:.2}, killed {:.2}), not starting more mutants",
            survived_ratio,
            killed_ratio
        ),
        EngineEvent::RunCompleted {
            completed, not_run, ..
        } => tracing::info!("Finished {} mutant(s), {} not run", completed, not_run),
        other => tracing::debug!("{:?}", other),
    }
}
