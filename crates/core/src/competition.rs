//! Competitions and their prizes.
//!
//! A competition is only ever changed through a ledger event: prizes are
//! appended with `competition.prize_added` and closing emits
//! `competition.closed`. Nothing here is edited in place otherwise.

use serde::{Deserialize, Serialize};

use crate::canonical::validate_identifier;
use crate::{CompetitionId, Error, OperatorId, PrizeId};

/// A prize, drawn in the order it was added to its competition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prize {
    pub id: PrizeId,
    pub name: String,
}

impl Prize {
    pub fn new(id: impl Into<PrizeId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Whether a competition still accepts entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompetitionStatus {
    Open,
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competition {
    pub id: CompetitionId,
    pub operator: OperatorId,
    pub title: String,
    pub prizes: Vec<Prize>,
    pub status: CompetitionStatus,
    pub created_at: u64,
}

impl Competition {
    /// Validate and build an open competition.
    pub fn new(
        operator: &str,
        id: &str,
        title: &str,
        prizes: Vec<Prize>,
        created_at: u64,
    ) -> Result<Self, Error> {
        validate_identifier("operator id", operator)?;
        validate_identifier("competition id", id)?;
        if title.trim().is_empty() {
            return Err(Error::Validation("competition title must not be empty".into()));
        }

        let mut competition = Self {
            id: id.to_string(),
            operator: operator.to_string(),
            title: title.to_string(),
            prizes: Vec::with_capacity(prizes.len()),
            status: CompetitionStatus::Open,
            created_at,
        };
        for prize in prizes {
            competition.check_new_prize(&prize)?;
            competition.prizes.push(prize);
        }
        Ok(competition)
    }

    pub fn is_open(&self) -> bool {
        self.status == CompetitionStatus::Open
    }

    pub fn prize(&self, id: &str) -> Option<&Prize> {
        self.prizes.iter().find(|p| p.id == id)
    }

    /// Check that a prize can be appended without touching the competition.
    pub fn check_new_prize(&self, prize: &Prize) -> Result<(), Error> {
        validate_identifier("prize id", &prize.id)?;
        if self.prize(&prize.id).is_some() {
            return Err(Error::Conflict(format!(
                "prize {} already exists in competition {}",
                prize.id, self.id
            )));
        }
        Ok(())
    }
}
