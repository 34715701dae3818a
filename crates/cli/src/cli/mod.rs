use crate::{AppConfig, SnapshotStore, config::expand_home_in_path};
use competition::{CompetitionCommands, CompetitionHandler};
use entry::{EntryCommands, EntryHandler};
use verify::{VerifyCommands, VerifyHandler};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use confique::Config;
use fairdraw_core::{Actor, DrawTarget, EventType, OsEntropy, Registry};
use serde_json::Value;
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// Re-export PartialAppConfig for public usage
pub use crate::config::confique_app_config_layer::AppConfigLayer as PartialAppConfig;

mod competition;
mod entry;
mod verify;

#[cfg(test)]
mod tests;

#[derive(Parser)]
#[command(name = "fairdraw")]
#[command(about = "Verifiable prize draws on a hash-chained ledger")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "$HOME/.fairdraw/config.toml")]
    config_path: PathBuf,

    /// Configuration object
    #[command(flatten)]
    config: PartialAppConfig,

    /// Who is recorded as the actor of ledger events
    #[arg(long, default_value = "operator")]
    actor: Actor,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Internal helper struct that holds the resolved configuration
pub struct ResolvedCli {
    command: Commands,
    config: AppConfig,
    actor: Actor,
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Competition management commands
    Competition {
        #[command(subcommand)]
        command: CompetitionCommands,
    },
    /// Entry management commands
    Entry {
        #[command(subcommand)]
        command: EntryCommands,
    },
    /// Draw one prize, or every remaining prize with --all
    Draw {
        competition: String,
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        prize: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Public audit of a completed draw
    Audit { draw_id: Uuid },
    /// Chain and draw verification commands
    Verify {
        #[command(subcommand)]
        command: VerifyCommands,
    },
    /// Print the operator's ledger
    Events {
        /// Only events of this type, e.g. `draw.completed`
        #[arg(long)]
        event_type: Option<EventType>,
        /// Only events after this sequence number
        #[arg(long, default_value = "0")]
        after: u64,
    },
    /// Record a complaint against the operator
    Complaint {
        reference: String,
        summary: String,
        #[arg(long)]
        competition: Option<String>,
    },
}

impl Commands {
    /// Whether the command appends to the ledger.
    fn is_mutating(&self) -> bool {
        match self {
            Commands::Competition { command } => command.is_mutating(),
            Commands::Entry { command } => command.is_mutating(),
            Commands::Draw { .. } | Commands::Complaint { .. } => true,
            Commands::Audit { .. } | Commands::Verify { .. } | Commands::Events { .. } => false,
        }
    }
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        // Load and resolve configuration once at the beginning
        let resolved_cli = self.resolve_config().await?;
        resolved_cli.init_logging()?;

        let store = SnapshotStore::new(&resolved_cli.config.store.snapshot_path);
        let output = resolved_cli.apply(&store).await?;

        println!("{}", serde_json::to_string_pretty(&output)?);
        Ok(())
    }

    /// Load the configuration and resolve all $HOME placeholders
    async fn resolve_config(self) -> Result<ResolvedCli> {
        let config_path = expand_home_in_path(&self.config_path)?;

        // Flags > environment > file > defaults
        let config = AppConfig::builder()
            .preloaded(self.config)
            .env()
            .file(&config_path)
            .load()?
            .with_resolved_paths()?;

        Ok(ResolvedCli {
            command: self.command,
            config,
            actor: self.actor,
            verbose: self.verbose,
        })
    }
}

impl ResolvedCli {
    fn init_logging(&self) -> Result<()> {
        let filter = if self.verbose {
            EnvFilter::try_new("fairdraw_core=debug,fairdraw_cli=debug,info")?
        } else {
            EnvFilter::try_new(&self.config.log.log_filter)?
        };
        // Logs go to stderr; stdout carries the JSON result.
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    }

    /// Load the snapshot, run the command, and write the snapshot back if the
    /// command appended to the ledger. A failed command writes nothing.
    async fn apply(&self, store: &SnapshotStore) -> Result<Value> {
        let registry = Arc::new(store.load(Arc::new(OsEntropy)).await?);
        let output = self.execute(&registry).await?;

        if self.command.is_mutating() {
            self.check_chain(&registry)?;
            store.save(&registry).await?;
            info!("Snapshot written to {}", store.path().display());
        }
        Ok(output)
    }

    async fn execute(&self, registry: &Arc<Registry>) -> Result<Value> {
        match &self.command {
            Commands::Competition { command } => {
                CompetitionHandler::new(registry, self.config.operator_id()?, self.actor).handle(command)
            }
            Commands::Entry { command } => {
                EntryHandler::new(registry, self.config.operator_id()?, self.actor).handle(command)
            }
            Commands::Draw {
                competition,
                prize,
                all,
            } => {
                let target = match (prize, all) {
                    (Some(prize), false) => DrawTarget::Prize(prize.clone()),
                    (None, true) => DrawTarget::All,
                    _ => bail!("pass either --prize <id> or --all"),
                };
                let audits =
                    registry.request_draw(self.config.operator_id()?, competition, &target)?;
                Ok(serde_json::to_value(audits)?)
            }
            Commands::Audit { draw_id } => Ok(serde_json::to_value(
                registry.audit(self.config.operator_id()?, draw_id)?,
            )?),
            Commands::Verify { command } => {
                VerifyHandler::new(Arc::clone(registry), self.config.operator.operator_id.clone())
                    .handle(command)
                    .await
            }
            Commands::Events { event_type, after } => {
                let events: Vec<_> = registry
                    .events(self.config.operator_id()?)?
                    .into_iter()
                    .filter(|e| e.sequence > *after)
                    .filter(|e| event_type.is_none_or(|t| e.event_type == t))
                    .collect();
                Ok(serde_json::to_value(events)?)
            }
            Commands::Complaint {
                reference,
                summary,
                competition,
            } => {
                let event = registry.record_complaint(
                    self.config.operator_id()?,
                    competition.as_deref(),
                    reference,
                    summary,
                    self.actor,
                )?;
                Ok(serde_json::to_value(event)?)
            }
        }
    }

    /// Re-verify the operator's event chain after a write.
    fn check_chain(&self, registry: &Registry) -> Result<()> {
        let operator = self.config.operator_id()?;
        let report = registry.verify_events(operator)?;
        if !report.is_valid() {
            warn!(
                operator,
                broken_links = report.broken_links.len(),
                invalid_hashes = report.invalid_hashes.len(),
                "Ledger failed verification after write; run `fairdraw verify events` for details"
            );
        }
        Ok(())
    }
}
