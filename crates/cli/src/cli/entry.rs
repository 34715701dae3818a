use anyhow::Result;
use clap::Subcommand;
use fairdraw_core::{Actor, EntryKind, Registry};
use serde_json::Value;

#[derive(Subcommand)]
pub enum EntryCommands {
    /// Register an entry and assign it a ticket
    Submit {
        competition: String,
        /// The caller's reference for this entry (order id, postal entry number, ...)
        external_ref: String,
        /// Free-entry route rather than a paid entry
        #[arg(long)]
        free: bool,
        /// Record the entry but keep it out of every draw
        #[arg(long)]
        ineligible: bool,
    },
    /// Void an entry so later draws skip it
    Void {
        competition: String,
        external_ref: String,
        #[arg(long)]
        reason: String,
    },
    /// Show one entry
    Show {
        competition: String,
        external_ref: String,
    },
    /// List a competition's entries in ticket order
    List { competition: String },
}

impl EntryCommands {
    pub fn is_mutating(&self) -> bool {
        matches!(self, EntryCommands::Submit { .. } | EntryCommands::Void { .. })
    }
}

pub struct EntryHandler<'a> {
    registry: &'a Registry,
    operator: &'a str,
    actor: Actor,
}

impl<'a> EntryHandler<'a> {
    pub fn new(registry: &'a Registry, operator: &'a str, actor: Actor) -> Self {
        Self {
            registry,
            operator,
            actor,
        }
    }

    pub fn handle(&self, command: &EntryCommands) -> Result<Value> {
        let value = match command {
            EntryCommands::Submit {
                competition,
                external_ref,
                free,
                ineligible,
            } => {
                let kind = if *free { EntryKind::Free } else { EntryKind::Paid };
                let entry = self.registry.submit_entry(
                    self.operator,
                    competition,
                    external_ref,
                    kind,
                    !ineligible,
                    self.actor,
                )?;
                serde_json::to_value(entry)?
            }
            EntryCommands::Void {
                competition,
                external_ref,
                reason,
            } => {
                let voided = self.registry.void_entry(
                    self.operator,
                    competition,
                    external_ref,
                    reason,
                    self.actor,
                )?;
                serde_json::to_value(voided)?
            }
            EntryCommands::Show {
                competition,
                external_ref,
            } => serde_json::to_value(self.registry.entry(self.operator, competition, external_ref)?)?,
            EntryCommands::List { competition } => {
                serde_json::to_value(self.registry.entries(self.operator, competition)?)?
            }
        };
        Ok(value)
    }
}
