use anyhow::Result;
use clap::Subcommand;
use fairdraw_core::{Actor, Prize, Registry};
use serde_json::Value;

#[derive(Subcommand)]
pub enum CompetitionCommands {
    /// Create a competition
    Create {
        /// Competition id
        id: String,
        /// Human-readable title
        #[arg(long)]
        title: String,
        /// A prize as `id=name`; repeat in draw order
        #[arg(long = "prize", value_parser = parse_prize)]
        prizes: Vec<Prize>,
    },
    /// Append a prize, drawn after the existing ones
    AddPrize {
        competition: String,
        /// The prize as `id=name`
        #[arg(value_parser = parse_prize)]
        prize: Prize,
    },
    /// Stop accepting entries
    Close { competition: String },
    /// Show one competition
    Show { competition: String },
    /// List the operator's competitions
    List,
}

impl CompetitionCommands {
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            CompetitionCommands::Show { .. } | CompetitionCommands::List
        )
    }
}

/// Parse `id=name`.
pub fn parse_prize(s: &str) -> Result<Prize, String> {
    let (id, name) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=name, got {s:?}"))?;
    Ok(Prize::new(id.trim(), name.trim()))
}

pub struct CompetitionHandler<'a> {
    registry: &'a Registry,
    operator: &'a str,
    actor: Actor,
}

impl<'a> CompetitionHandler<'a> {
    pub fn new(registry: &'a Registry, operator: &'a str, actor: Actor) -> Self {
        Self {
            registry,
            operator,
            actor,
        }
    }

    pub fn handle(&self, command: &CompetitionCommands) -> Result<Value> {
        let value = match command {
            CompetitionCommands::Create { id, title, prizes } => {
                let competition = self.registry.create_competition(
                    self.operator,
                    id,
                    title,
                    prizes.clone(),
                    self.actor,
                )?;
                serde_json::to_value(competition)?
            }
            CompetitionCommands::AddPrize { competition, prize } => {
                let competition =
                    self.registry
                        .add_prize(self.operator, competition, prize.clone(), self.actor)?;
                serde_json::to_value(competition)?
            }
            CompetitionCommands::Close { competition } => {
                let competition =
                    self.registry
                        .close_competition(self.operator, competition, self.actor)?;
                serde_json::to_value(competition)?
            }
            CompetitionCommands::Show { competition } => {
                serde_json::to_value(self.registry.competition(self.operator, competition)?)?
            }
            CompetitionCommands::List => {
                serde_json::to_value(self.registry.competitions(self.operator)?)?
            }
        };
        Ok(value)
    }
}
