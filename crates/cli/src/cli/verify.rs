use anyhow::{Context, Result};
use clap::Subcommand;
use fairdraw_core::{ChainReport, Registry};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Subcommand)]
pub enum VerifyCommands {
    /// Check the operator's event chain
    Events,
    /// Check the operator's audit signature chain
    Audits,
    /// Re-derive one draw from the ledger
    Draw { draw_id: Uuid },
    /// Check that an entry was in a draw's pool
    Ticket { draw_id: Uuid, external_ref: String },
    /// Check both chains of every operator in the snapshot
    All,
}

#[derive(Serialize)]
struct OperatorReport {
    events: ChainReport,
    audits: ChainReport,
}

pub struct VerifyHandler {
    registry: Arc<Registry>,
    operator: Option<String>,
}

impl VerifyHandler {
    pub fn new(registry: Arc<Registry>, operator: Option<String>) -> Self {
        Self { registry, operator }
    }

    fn operator(&self) -> Result<&str> {
        self.operator.as_deref().ok_or_else(|| {
            anyhow::anyhow!("no operator configured: pass --operator or set FAIRDRAW_OPERATOR")
        })
    }

    pub async fn handle(&self, command: &VerifyCommands) -> Result<Value> {
        let value = match command {
            VerifyCommands::Events => {
                serde_json::to_value(self.registry.verify_events(self.operator()?)?)?
            }
            VerifyCommands::Audits => {
                serde_json::to_value(self.registry.verify_audits(self.operator()?)?)?
            }
            VerifyCommands::Draw { draw_id } => {
                serde_json::to_value(self.registry.verify_draw(self.operator()?, draw_id)?)?
            }
            VerifyCommands::Ticket {
                draw_id,
                external_ref,
            } => serde_json::to_value(self.registry.verify_ticket(
                self.operator()?,
                draw_id,
                external_ref,
            )?)?,
            VerifyCommands::All => serde_json::to_value(self.verify_all().await?)?,
        };
        Ok(value)
    }

    /// Verify every operator concurrently, one blocking task each.
    async fn verify_all(&self) -> Result<BTreeMap<String, OperatorReport>> {
        let tasks: Vec<_> = self
            .registry
            .operators()
            .into_iter()
            .map(|operator| {
                let registry = Arc::clone(&self.registry);
                tokio::task::spawn_blocking(move || -> Result<(String, OperatorReport)> {
                    let report = OperatorReport {
                        events: registry.verify_events(&operator)?,
                        audits: registry.verify_audits(&operator)?,
                    };
                    Ok((operator, report))
                })
            })
            .collect();

        let mut reports = BTreeMap::new();
        for task in tasks {
            let (operator, report) = task.await.context("Verification task panicked")??;
            reports.insert(operator, report);
        }

        let invalid = reports
            .values()
            .filter(|r| !r.events.is_valid() || !r.audits.is_valid())
            .count();
        info!(operators = reports.len(), invalid, "verification finished");
        Ok(reports)
    }
}
