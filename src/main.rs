use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gantry_core::config::AppConfig;
use gantry_core::types::GraphDefinition;
use gantry_engine::GraphRegistry;
use gantry_store::SqliteSnapshotStore;

#[derive(Parser)]
#[command(name = "gantry", version, about = "Workflow graph execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "gantry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a graph definition and create a workflow instance
    Create {
        /// Graph definition file (.json or .toml)
        file: PathBuf,
    },
    /// List all workflows
    List,
    /// Show the full state of a workflow
    Show { id: String },
    /// Show the nodes ready to run
    Next { id: String },
    /// Mark a node as started
    Start { id: String, node: String },
    /// Mark a running node as completed
    Complete {
        id: String,
        node: String,
        /// Result payload as JSON, stored for edge conditions
        #[arg(long)]
        result: Option<String>,
    },
    /// Report a node failure
    Fail {
        id: String,
        node: String,
        /// Error message to record
        #[arg(long, default_value = "unspecified")]
        error: String,
    },
    /// Skip a pending node
    Skip { id: String, node: String },
    /// Attach evidence to a node
    Attach {
        id: String,
        node: String,
        /// Evidence kind, e.g. "test" or "guard"
        kind: String,
        /// Evidence value as JSON
        #[arg(long, default_value = "true")]
        value: String,
        /// Tool or system that produced the evidence
        #[arg(long)]
        source: Option<String>,
    },
    /// Force a blocked node past its gate (recorded in the audit trail)
    Bypass {
        id: String,
        node: String,
        #[arg(long)]
        reason: String,
    },
    /// Critical path, parallelism and cost analysis
    Analyze { id: String },
    /// Batched execution plan from the current state
    Plan {
        id: String,
        #[arg(long, default_value = "4")]
        max_parallel: usize,
    },
    /// Currently blocked nodes with suggested next tool calls
    Blockers { id: String },
    /// Pause a workflow
    Pause { id: String },
    /// Resume a paused workflow
    Resume { id: String },
    /// Delete a workflow and its persisted state
    Delete { id: String },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gantry=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Completions need no config or store
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "gantry", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)?;
    let store = Arc::new(SqliteSnapshotStore::open(&config.storage.db_path())?);
    let registry = GraphRegistry::open(store, config.engine)?;

    match cli.command {
        Commands::Create { file } => {
            let definition = read_definition(&file)?;
            let id = registry.create(definition)?;
            println!("{}", id);
        }
        Commands::List => {
            for summary in registry.list()? {
                println!(
                    "{}  {:<9}  {:>5.1}%  {} nodes  {}",
                    summary.id,
                    summary.status.to_string(),
                    summary.progress * 100.0,
                    summary.node_count,
                    summary.updated_at.to_rfc3339(),
                );
            }
        }
        Commands::Show { id } => {
            let instance = registry.get(&id)?;
            println!("{}", serde_json::to_string_pretty(&instance)?);
        }
        Commands::Next { id } => {
            for node in registry.ready_nodes(&id)? {
                println!("{}  [{:?}] {}", node.id, node.kind, node.label);
            }
        }
        Commands::Start { id, node } => {
            registry.start_node(&id, &node)?;
            println!("{} running", node);
        }
        Commands::Complete { id, node, result } => {
            let result = result.map(|s| serde_json::from_str(&s)).transpose()?;
            let outcome = registry.complete_node(&id, &node, result)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Fail { id, node, error } => {
            let outcome = registry.fail_node(&id, &node, &error)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Skip { id, node } => {
            let skipped = registry.skip_node(&id, &node)?;
            println!("skipped: {}", skipped.join(", "));
        }
        Commands::Attach {
            id,
            node,
            kind,
            value,
            source,
        } => {
            let value = serde_json::from_str(&value)?;
            registry.attach_evidence(&id, &node, &kind, value, source)?;
            println!("evidence '{}' attached to {}", kind, node);
        }
        Commands::Bypass { id, node, reason } => {
            let unlocked = registry.bypass_gate(&id, &node, &reason)?;
            println!("{} done (gate bypassed); unlocked: {}", node, unlocked.join(", "));
        }
        Commands::Analyze { id } => {
            let analysis = registry.analyze(&id)?;
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Commands::Plan { id, max_parallel } => {
            for (i, batch) in registry.plan(&id, max_parallel)?.iter().enumerate() {
                println!("batch {}: {}", i + 1, batch.join(", "));
            }
        }
        Commands::Blockers { id } => {
            let blockers = registry.blockers(&id)?;
            if blockers.is_empty() {
                println!("no blocked nodes");
            }
            for blocker in blockers {
                println!(
                    "#{} {}: {} (next: {})",
                    blocker.priority,
                    blocker.node_id,
                    blocker.reason,
                    blocker.next_tool_calls.join(", "),
                );
            }
        }
        Commands::Pause { id } => {
            registry.pause(&id)?;
            println!("{} paused", id);
        }
        Commands::Resume { id } => {
            registry.resume(&id)?;
            println!("{} resumed", id);
        }
        Commands::Delete { id } => {
            registry.delete(&id)?;
            println!("{} deleted", id);
        }
        Commands::Completions { .. } => unreachable!(),
    }

    Ok(())
}

/// Parse a graph definition from JSON or TOML, chosen by extension.
fn read_definition(path: &PathBuf) -> anyhow::Result<GraphDefinition> {
    let text = std::fs::read_to_string(path)?;
    let definition = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&text)?,
        _ => serde_json::from_str(&text)?,
    };
    Ok(definition)
}
