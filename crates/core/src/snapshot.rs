//! Whole-registry snapshots.
//!
//! A snapshot is the persisted form of a [`Registry`]: every operator scope
//! with its ledger, entries, audits and in-flight commitments. Loading one
//! does not verify the chains; run the verifier for that.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::{EntropySource, Error, OperatorId, OperatorScope, Registry};

/// Current snapshot format.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub operators: BTreeMap<OperatorId, OperatorScope>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            operators: BTreeMap::new(),
        }
    }
}

impl Snapshot {
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, Error> {
        let snapshot: Snapshot = serde_json::from_slice(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Validation(format!(
                "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }
        for (operator, scope) in &snapshot.operators {
            if scope.operator() != operator {
                return Err(Error::Validation(format!(
                    "snapshot lists operator {operator} but its ledger belongs to {}",
                    scope.operator()
                )));
            }
        }
        Ok(snapshot)
    }
}

impl Registry {
    /// Capture every operator, each under its own lock.
    pub fn export(&self) -> Snapshot {
        let operators = self.scopes();
        debug!(operators = operators.len(), "registry exported");
        Snapshot {
            version: SNAPSHOT_VERSION,
            operators,
        }
    }

    pub fn from_snapshot(snapshot: Snapshot, entropy: Arc<dyn EntropySource>) -> Self {
        debug!(operators = snapshot.operators.len(), "registry restored");
        Registry::with_scopes(snapshot.operators, entropy)
    }
}
