use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cadre::config::Config;
use cadre::core::{InteractionId, Priority, TaskId};
use cadre::events::DispatchMode;
use cadre::oracle::ClaudeOracle;
use cadre::orchestration::{ChannelDispatcher, Orchestrator, QueuedUnit, TaskTree};
use cadre::store::{MemoryStore, Snapshot, Store};
use cadre::Result;

/// Cadre - hierarchical multi-agent task orchestrator
#[derive(Parser, Debug)]
#[command(name = "cadre")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CADRE_DEBUG=1   Enable debug logging (alternative to --debug)\n    RUST_LOG        Override the log filter")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.cadre/cadre.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Dispatch events inline instead of through the work queue
    #[arg(long, global = true)]
    pub sync_events: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Submit a root task and run until no work is left
    Run {
        /// Short title of the task
        title: String,

        /// What should be done (defaults to the title)
        #[arg(long, short = 'm')]
        description: Option<String>,

        /// high, normal or low
        #[arg(long, short = 'p', default_value = "normal", value_parser = parse_priority)]
        priority: Priority,
    },

    /// Show every root task and pending human interactions
    Status,

    /// Answer a pending human interaction and continue
    Answer {
        /// Interaction ID
        id: InteractionId,
        /// Free text, or `ACTION: <TOKEN>` for a failed subtask
        response: String,
    },

    /// Dismiss an optional human interaction
    Ignore {
        /// Interaction ID
        id: InteractionId,
    },

    /// Stop scheduling new subtasks for a task
    Pause {
        task_id: TaskId,
    },

    /// Resume a paused task and continue
    Unpause {
        task_id: TaskId,
    },

    /// Print the effective configuration
    Config {
        /// Write it to ~/.cadre/cadre.toml
        #[arg(long)]
        write: bool,
    },
}

fn parse_priority(s: &str) -> std::result::Result<Priority, String> {
    Priority::parse(s).ok_or_else(|| format!("unknown priority: {}", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cadre::log::init(cli.debug);

    let config = Config::load()?;
    if let Command::Config { write } = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        if write {
            config.save()?;
            println!("# written to {}", Config::config_path()?.display());
        }
        return Ok(());
    }

    let store = Arc::new(MemoryStore::from_snapshot(Snapshot::load()?));
    if cli.command == Command::Status {
        return print_status(store.as_ref()).await;
    }

    let oracle = Arc::new(ClaudeOracle::new(&config.oracle)?);
    let (dispatcher, rx) = ChannelDispatcher::new();
    let mode = if cli.sync_events {
        DispatchMode::Sync
    } else {
        DispatchMode::Async
    };
    let orchestrator = Arc::new(Orchestrator::new(
        config,
        store.clone(),
        oracle,
        Arc::new(dispatcher),
        mode,
    ));

    let expired = orchestrator.expire_interactions(Utc::now()).await?;
    if !expired.is_empty() {
        info!(count = expired.len(), "Expired human interactions");
    }

    let focus = match cli.command {
        Command::Run {
            title,
            description,
            priority,
        } => {
            let description = description.unwrap_or_else(|| title.clone());
            let id = orchestrator.submit(&title, &description, priority).await?;
            println!("Submitted {}", id);
            Some(id)
        }
        Command::Answer { id, response } => {
            let interaction = orchestrator.answer(id, &response).await?;
            Some(interaction.task_id)
        }
        Command::Ignore { id } => {
            let interaction = orchestrator.ignore(id).await?;
            Some(interaction.task_id)
        }
        Command::Pause { task_id } => {
            orchestrator.pause(task_id).await?;
            Some(task_id)
        }
        Command::Unpause { task_id } => {
            orchestrator.unpause(task_id).await?;
            Some(task_id)
        }
        Command::Status | Command::Config { .. } => None,
    };

    run_until_idle(orchestrator.clone(), rx).await;
    store.snapshot().await.save()?;

    if let Some(id) = focus {
        let root = orchestrator.root_of(id).await?;
        print!("{}", orchestrator.task_tree(root).await?.render());
    }
    print_pending(store.as_ref()).await
}

async fn run_until_idle(orchestrator: Arc<Orchestrator>, rx: UnboundedReceiver<QueuedUnit>) {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing running units");
            on_signal.cancel();
        }
    });

    let summary = orchestrator.run(rx, cancel).await;
    if summary.failed > 0 {
        eprintln!("{} work unit(s) failed; see ~/.cadre/cadre.log", summary.failed);
    }
}

async fn print_status(store: &dyn Store) -> Result<()> {
    let roots = store.root_tasks().await?;
    if roots.is_empty() {
        println!("No tasks.");
    }
    for root in roots {
        print!("{}", TaskTree::load(store, root.id).await?.render());
    }
    print_pending(store).await
}

async fn print_pending(store: &dyn Store) -> Result<()> {
    let pending = store.pending_interactions(None).await?;
    if pending.is_empty() {
        return Ok(());
    }
    println!("\nWaiting on you:");
    for interaction in pending {
        let marker = if interaction.required { "required" } else { "optional" };
        println!("  {} ({})\n    {}", interaction.id, marker, interaction.question);
    }
    Ok(())
}
