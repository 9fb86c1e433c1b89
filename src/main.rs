use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use accredit_core::config::AppConfig;
use accredit_core::participant::Participant;
use accredit_core::traits::WorkflowStore;
use accredit_core::types::{Action, Actor, BranchStateId, ParticipantId, WorkflowId};
use accredit_core::workflow::Workflow;
use accredit_engine::{EventJournal, WorkflowEngine};
use accredit_store::SqliteStore;

#[derive(Parser)]
#[command(name = "accredit", version, about = "Accreditation approval workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "accredit.toml", env = "ACCREDIT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or replace a workflow definition from a JSON file
    Publish {
        /// Path to the workflow JSON
        file: PathBuf,
    },
    /// Register a participant that has not entered any workflow yet
    Register { participant: String },
    /// Place a participant on a workflow's entry step
    Enter {
        participant: String,
        workflow: String,
        /// User id recorded in the audit trail
        #[arg(long)]
        actor: String,
    },
    /// Apply an action to a participant's current step
    Apply {
        participant: String,
        /// approve, reject or bypass
        action: Action,
        /// User id recorded in the audit trail
        #[arg(long)]
        actor: String,
        #[arg(long)]
        remarks: Option<String>,
    },
    /// Approve or reject one parallel branch
    ResolveBranch {
        branch: String,
        /// approve or reject
        action: Action,
        /// User id recorded in the audit trail
        #[arg(long)]
        actor: String,
        #[arg(long)]
        remarks: Option<String>,
    },
    /// List the branches of the fork a participant sits on
    Branches { participant: String },
    /// Check which participants an action could be applied to
    Batch {
        action: String,
        #[arg(required = true)]
        participants: Vec<String>,
    },
    /// Show a participant's audit trail
    Audit { participant: String },
    /// Run one SLA scan and exit
    SlaScan,
    /// Run the SLA scheduler until interrupted
    SlaRun {
        /// Override the configured scan interval
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        interval_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log.filter.as_deref().unwrap_or("accredit=info,warn")))
        .unwrap_or_else(|_| EnvFilter::new("accredit=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let db_path = config.store_path();
    let store: Arc<dyn WorkflowStore> = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("opening store at {}", db_path.display()))?,
    );
    let engine = WorkflowEngine::builder(store.clone()).config(&config).build();

    // Journal every event produced by this invocation.
    let cancel = CancellationToken::new();
    let journal = if config.journal.enabled {
        let journal = EventJournal::new(config.journal_dir(), engine.clock().clone());
        Some(journal.spawn(engine.event_bus(), cancel.clone()))
    } else {
        None
    };

    let result = run(cli.command, &config, &engine, store.as_ref()).await;

    cancel.cancel();
    if let Some(handle) = journal {
        handle.await.ok();
    }
    result
}

async fn run(
    command: Commands,
    config: &AppConfig,
    engine: &WorkflowEngine,
    store: &dyn WorkflowStore,
) -> anyhow::Result<()> {
    match command {
        Commands::Publish { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let workflow: Workflow = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", file.display()))?;
            store.save_workflow(&workflow).await?;
            info!(workflow = %workflow.id, steps = workflow.steps.len(), "Workflow published");
            print_json(&workflow)?;
        }
        Commands::Register { participant } => {
            let participant = Participant::new(participant);
            store.register_participant(&participant).await?;
            print_json(&participant)?;
        }
        Commands::Enter {
            participant,
            workflow,
            actor,
        } => {
            let outcome = engine
                .entry
                .enter(
                    &ParticipantId::from(participant),
                    &WorkflowId::from(workflow),
                    Actor::user(actor),
                )
                .await?;
            print_json(&outcome)?;
        }
        Commands::Apply {
            participant,
            action,
            actor,
            remarks,
        } => {
            let outcome = engine
                .transitions
                .apply(
                    &ParticipantId::from(participant),
                    action,
                    remarks,
                    Actor::user(actor),
                )
                .await?;
            print_json(&outcome)?;
        }
        Commands::ResolveBranch {
            branch,
            action,
            actor,
            remarks,
        } => {
            let resolution = engine
                .forks
                .resolve_branch(
                    &BranchStateId::from(branch),
                    action,
                    remarks,
                    Actor::user(actor),
                )
                .await?;
            print_json(&resolution)?;
        }
        Commands::Branches { participant } => {
            let branches = engine
                .forks
                .open_branches(&ParticipantId::from(participant))
                .await?;
            print_json(&branches)?;
        }
        Commands::Batch {
            action,
            participants,
        } => {
            let ids: Vec<ParticipantId> = participants.into_iter().map(ParticipantId::from).collect();
            let result = engine.batch.evaluate_named(&ids, &action).await?;
            print_json(&result)?;
        }
        Commands::Audit { participant } => {
            let audit = store.list_audit(&ParticipantId::from(participant)).await?;
            print_json(&audit)?;
        }
        Commands::SlaScan => {
            let summary = engine.sla.check_overdue_slas().await?;
            print_json(&summary)?;
        }
        Commands::SlaRun { interval_secs } => {
            if !config.sla.enabled {
                warn!("SLA monitoring is disabled in config; nothing to run");
                return Ok(());
            }
            let scheduler = match interval_secs {
                Some(secs) => engine.sla_scheduler_every(std::time::Duration::from_secs(secs)),
                None => engine.sla_scheduler(),
            };
            scheduler.start();
            info!("SLA scheduler running, press Ctrl-C to stop");

            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down SLA scheduler...");
            scheduler.stop().await;
            print_json(&scheduler.status())?;
        }
    }
    Ok(())
}

/// Load the config file, falling back to `~/.accredit/config.toml` and then
/// to built-in defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".accredit").join("config.toml")) {
        if home_config.exists() {
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    Ok(AppConfig::default())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
