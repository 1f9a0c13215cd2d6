use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use graphflow_core::config::AppConfig;
use graphflow_core::traits::GraphStore;
use graphflow_core::types::GraphDescription;
use graphflow_engine::ExecutionPlan;
use graphflow_graph::GraphBuilder;
use graphflow_store::SqliteStore;

#[derive(Parser)]
#[command(name = "graphflow", version, about = "Dependency-graph execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "graphflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph description (JSON) without running it
    Validate {
        /// Description file
        file: PathBuf,
    },
    /// Print the schedulable units of a graph description, level by level
    Plan {
        /// Description file
        file: PathBuf,
    },
    /// List the graphs stored for a workflow
    List {
        workflow: String,
    },
    /// Show the stored state of one graph
    Status {
        workflow: String,
        graph: String,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("graphflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { file } => {
            let description = read_description(&file)?;
            GraphBuilder::new(config.engine.max_tasks).validate(&description)?;
            println!(
                "ok: {} tasks, {} channels",
                description.tasks.len(),
                description.channels.len()
            );
        }
        Commands::Plan { file } => {
            let description = read_description(&file)?;
            let plan =
                ExecutionPlan::build(&description, &GraphBuilder::new(config.engine.max_tasks))?;
            println!("{} tasks in {} units", plan.task_count(), plan.unit_count());
            for (depth, level) in plan.levels().iter().enumerate() {
                let units: Vec<String> = level
                    .iter()
                    .map(|&u| {
                        let unit = plan.unit(u);
                        if unit.cyclic {
                            format!("[{}]", unit.member_names.join(", "))
                        } else {
                            unit.name.clone()
                        }
                    })
                    .collect();
                println!("level {}: {}", depth, units.join("  "));
            }
        }
        Commands::List { workflow } => {
            let store = open_store(&config)?;
            let graphs = store.list(&workflow).await?;
            if graphs.is_empty() {
                println!("No graphs for workflow {}", workflow);
            }
            for graph in graphs {
                println!(
                    "{}  {:<9}  {} tasks  updated {}",
                    graph.id,
                    graph.status.as_str(),
                    graph.tasks.len(),
                    graph.updated_at.to_rfc3339()
                );
            }
        }
        Commands::Status { workflow, graph } => {
            let store = open_store(&config)?;
            let state = store
                .get(&workflow, &graph)
                .await?
                .with_context(|| format!("graph {} not found in workflow {}", graph, workflow))?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        let config = AppConfig::load(path)?;
        info!(path = %path.display(), "Loaded config");
        Ok(config)
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        Ok(AppConfig::default())
    }
}

fn read_description(path: &Path) -> anyhow::Result<GraphDescription> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid description in {}", path.display()))
}

fn open_store(config: &AppConfig) -> anyhow::Result<SqliteStore> {
    let path = config.store_path();
    SqliteStore::open(&path).with_context(|| format!("failed to open store {}", path.display()))
}
