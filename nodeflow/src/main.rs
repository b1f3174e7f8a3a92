//! `nodeflow` command line: run workers for a graph, or validate one.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nodeflow::broker;
use nodeflow::config::Settings;
use nodeflow::nodes::HandlerRegistry;
use nodeflow::observability::{init_tracing, LogFormat};
use nodeflow::pipeline::load_graph;
use nodeflow::runtime::WorkerRuntime;
use nodeflow::services::{InMemoryTaskService, TaskService};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "nodeflow", version, about = "Broker-driven pipeline workers")]
struct Cli {
    /// Log output format (pretty or json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start workers for every node this process can run
    RunWorkers {
        /// Graph definition file
        #[arg(long)]
        graph: PathBuf,

        /// Settings file
        #[arg(long)]
        settings: PathBuf,

        /// Settings profile merged over [default]
        #[arg(long)]
        profile: Option<String>,
    },

    /// Check a graph definition without connecting to anything
    Validate {
        /// Graph definition file
        #[arg(long)]
        graph: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.log_format) {
        eprintln!("warning: logging not initialized: {e}");
    }

    let result = match cli.command {
        Command::RunWorkers {
            graph,
            settings,
            profile,
        } => run_workers(graph, settings, profile).await,
        Command::Validate { graph } => validate(&graph),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn validate(path: &Path) -> Result<()> {
    let graph = load_graph(path, &HandlerRegistry::with_builtins())
        .with_context(|| format!("graph '{}' is invalid", path.display()))?;
    print!("{graph}");
    Ok(())
}

async fn run_workers(graph_path: PathBuf, settings_path: PathBuf, profile: Option<String>) -> Result<()> {
    let settings = Settings::load(&settings_path, profile.as_deref())
        .with_context(|| format!("cannot load settings '{}'", settings_path.display()))?;
    let graph = load_graph(&graph_path, &HandlerRegistry::with_builtins())
        .with_context(|| format!("graph '{}' is invalid", graph_path.display()))?;

    let broker = broker::connect(&settings.broker_url)
        .await
        .context("cannot reach the broker")?;
    let tasks = task_service(&settings)?;

    let runtime = WorkerRuntime::new(Arc::new(graph), broker, tasks, settings);
    let cancel = runtime.cancellation_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                cancel.cancel("ctrl-c");
            }
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
        }
    });

    runtime.run().await?;
    Ok(())
}

fn task_service(settings: &Settings) -> Result<Arc<dyn TaskService>> {
    match &settings.task_service_url {
        #[cfg(feature = "http")]
        Some(url) => {
            let service = nodeflow::services::HttpTaskService::new(url.clone(), std::time::Duration::from_secs(10))
                .context("cannot create the task service client")?;
            Ok(Arc::new(service))
        }
        #[cfg(not(feature = "http"))]
        Some(url) => anyhow::bail!("task service '{url}' needs the 'http' feature"),
        None => {
            warn!("No task_service_url configured, checkpoints park in memory");
            Ok(Arc::new(InMemoryTaskService::new()))
        }
    }
}
