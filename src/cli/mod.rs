pub mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use crate::domain::{Event, Plan};
use crate::storage::RunStore;
use crate::storage::replay::EventFeed;
use config::RunStoreSettings;

#[derive(Parser)]
#[command(name = "runstore", version, about = "Inspect and manage workflow run state")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a runstore.yaml settings file (default: auto-detect in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store backend: memory (default) or redis
    #[arg(long, global = true, env = "ORCH_RUNSTORE")]
    backend: Option<String>,

    /// Redis connection URL
    #[arg(long, global = true, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Key prefix of the Redis backend
    #[arg(long, global = true, env = "RUNSTORE_PREFIX")]
    prefix: Option<String>,

    /// Run expiry in seconds (0 disables expiry)
    #[arg(long, global = true, env = "RUNSTORE_TTL_SECS")]
    ttl_secs: Option<u64>,

    /// Maximum events retained per run
    #[arg(long, global = true, env = "EVENT_MAX_LEN")]
    event_max_len: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventFormat {
    /// One JSON object per line
    Json,
    /// Server-Sent Events frames
    Sse,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List known runs
    List {
        /// Output format
        #[arg(long, value_enum, default_value = "table")]
        format: ListFormat,
    },

    /// Show a run, its plan and every node state
    Inspect {
        /// Run ID
        run_id: String,
    },

    /// Print retained events of a run
    Events {
        /// Run ID
        run_id: String,

        /// Only events after this event id
        #[arg(long, default_value = "")]
        since: String,

        #[arg(long, value_enum, default_value = "json")]
        format: EventFormat,
    },

    /// Follow a run's events until it is cancelled or interrupted
    Tail {
        /// Run ID
        run_id: String,

        /// Replay events after this event id before following
        #[arg(long, default_value = "")]
        since: String,

        #[arg(long, value_enum, default_value = "json")]
        format: EventFormat,
    },

    /// Cancel a run
    Cancel {
        /// Run ID
        run_id: String,
    },

    /// Create a queued run from a plan file (.json, .yaml or .yml)
    Create {
        /// Path to the plan file
        plan: PathBuf,

        /// Run name
        #[arg(short, long, default_value = "")]
        name: String,
    },

    /// Validate a plan file without creating a run
    Validate {
        /// Path to the plan file
        plan: PathBuf,
    },

    /// Show backend diagnostics
    Info,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let overrides = RunStoreSettings {
        backend: cli.backend,
        redis_url: cli.redis_url,
        prefix: cli.prefix,
        ttl_secs: cli.ttl_secs,
        event_max_len: cli.event_max_len,
        ..Default::default()
    };

    if let Commands::Validate { plan } = &cli.command {
        return cmd_validate(plan);
    }

    let settings = RunStoreSettings::load(cli.config.as_deref())?.merge(overrides);
    let store = settings.open().await?;

    let result = match cli.command {
        Commands::List { format } => cmd_list(store.as_ref(), format).await,
        Commands::Inspect { run_id } => cmd_inspect(store.as_ref(), &run_id).await,
        Commands::Events {
            run_id,
            since,
            format,
        } => cmd_events(store.as_ref(), &run_id, &since, format).await,
        Commands::Tail {
            run_id,
            since,
            format,
        } => cmd_tail(Arc::clone(&store), &run_id, &since, format).await,
        Commands::Cancel { run_id } => cmd_cancel(store.as_ref(), &run_id).await,
        Commands::Create { plan, name } => cmd_create(store.as_ref(), &plan, &name).await,
        Commands::Info => cmd_info(store.as_ref()).await,
        Commands::Validate { .. } => Ok(()),
    };

    store.close().await?;
    result
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

/// Read a plan from JSON or YAML, chosen by file extension.
pub fn load_plan(path: &Path) -> Result<Plan> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    let plan = if is_yaml {
        serde_yml::from_str(&contents).map_err(anyhow::Error::from)
    } else {
        serde_json::from_str(&contents).map_err(anyhow::Error::from)
    };
    plan.with_context(|| format!("Failed to parse plan file: {}", path.display()))
}

fn format_event(event: &Event, format: EventFormat) -> Result<String> {
    Ok(match format {
        EventFormat::Json => serde_json::to_string(event)?,
        EventFormat::Sse => event.to_sse()?.trim_end().to_string() + "\n",
    })
}

fn cmd_validate(path: &Path) -> Result<()> {
    let plan = load_plan(path)?;
    println!("Nodes: {}", plan.nodes.len());
    println!("Edges: {}", plan.edges.len());

    let errors = plan.validate();
    if errors.is_empty() {
        println!("Validation: OK");
        return Ok(());
    }

    println!("Validation: FAILED");
    for err in &errors {
        println!("  - {}", err);
    }
    anyhow::bail!("{} validation error(s) found", errors.len());
}

async fn cmd_list(store: &dyn RunStore, format: ListFormat) -> Result<()> {
    let ids = store.list_runs().await?;

    let mut runs = Vec::with_capacity(ids.len());
    for id in &ids {
        match store.get_run_meta(id).await {
            Ok(meta) => runs.push(meta),
            // Expired between listing and reading.
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.into()),
        }
    }

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    if format == ListFormat::Json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    println!(
        "{:<34} {:<20} {:<10} {:<20}",
        "RUN ID", "NAME", "STATUS", "CREATED"
    );
    println!("{}", "-".repeat(86));

    for run in &runs {
        println!(
            "{:<34} {:<20} {:<10} {:<20}",
            run.id,
            run.name,
            run.status,
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\nTotal: {} run(s)", runs.len());
    Ok(())
}

async fn cmd_inspect(store: &dyn RunStore, run_id: &str) -> Result<()> {
    let run = store
        .get_run(run_id)
        .await
        .with_context(|| format!("Run '{}' not found", run_id))?;
    let nodes = store.list_node_states(run_id).await?;

    let report = serde_json::json!({
        "run": run,
        "nodes": nodes,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_events(
    store: &dyn RunStore,
    run_id: &str,
    since: &str,
    format: EventFormat,
) -> Result<()> {
    let events = store
        .get_events_since(run_id, since)
        .await
        .with_context(|| format!("Failed to read events of run '{}'", run_id))?;
    for event in &events {
        println!("{}", format_event(event, format)?);
    }
    Ok(())
}

async fn cmd_tail(
    store: Arc<dyn RunStore>,
    run_id: &str,
    since: &str,
    format: EventFormat,
) -> Result<()> {
    let mut feed = EventFeed::open(store, run_id, since)
        .await
        .with_context(|| format!("Failed to follow run '{}'", run_id))?;

    loop {
        let next = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = feed.next() => next?,
        };
        match next {
            Some(event) => println!("{}", format_event(&event, format)?),
            None => {
                info!(run_id = %run_id, last = feed.last_seq(), "Run stopped streaming");
                break;
            }
        }
    }
    Ok(())
}

async fn cmd_cancel(store: &dyn RunStore, run_id: &str) -> Result<()> {
    store
        .cancel_run(run_id)
        .await
        .with_context(|| format!("Failed to cancel run '{}'", run_id))?;
    let meta = store.get_run_meta(run_id).await?;
    println!("Run {}: {}", run_id, meta.status);
    Ok(())
}

async fn cmd_create(store: &dyn RunStore, path: &Path, name: &str) -> Result<()> {
    let plan = load_plan(path)?;
    let errors = plan.validate();
    if !errors.is_empty() {
        for err in &errors {
            eprintln!("  - {}", err);
        }
        anyhow::bail!("Plan is invalid: {} error(s)", errors.len());
    }

    let run_id = store.create_run(name, plan).await?;
    println!("{}", run_id);
    Ok(())
}

async fn cmd_info(store: &dyn RunStore) -> Result<()> {
    let info = store.adapter_info().await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
