//! Entry store.
//!
//! Entries are keyed by `(competition_id, external_ref)`. Ticket ids are
//! assigned per competition starting at 1 and never reused. Voiding adds a
//! marker; nothing is removed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

use crate::canonical::validate_identifier;
use crate::{Competition, CompetitionId, Error};

/// Internal ticket number, ordered numerically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub u64);

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Paid,
    Free,
}

/// Why and when an entry was voided.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoidMarker {
    pub reason: String,
    pub voided_at: u64,
}

/// One ticket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub competition_id: CompetitionId,
    pub external_ref: String,
    pub ticket: TicketId,
    pub kind: EntryKind,
    pub eligible: bool,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub void: Option<VoidMarker>,
}

impl Entry {
    pub fn is_voided(&self) -> bool {
        self.void.is_some()
    }

    /// Eligible and not voided.
    pub fn is_drawable(&self) -> bool {
        self.eligible && !self.is_voided()
    }
}

/// The result of voiding an entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoidedEntry {
    pub competition_id: CompetitionId,
    pub external_ref: String,
    pub ticket: TicketId,
    pub reason: String,
    pub voided_at: u64,
}

/// All entries of one operator, grouped by competition.
#[derive(Clone, Debug, Default)]
pub struct EntryStore {
    tickets: BTreeMap<CompetitionId, BTreeMap<TicketId, Entry>>,
    refs: BTreeMap<(CompetitionId, String), TicketId>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new entry.
    ///
    /// `accept` runs after validation and before the entry is stored; if it
    /// fails (typically the ledger append), the store is left untouched.
    pub fn record_entry<F>(
        &mut self,
        competition: &Competition,
        external_ref: &str,
        kind: EntryKind,
        eligible: bool,
        created_at: u64,
        accept: F,
    ) -> Result<Entry, Error>
    where
        F: FnOnce(&Entry) -> Result<(), Error>,
    {
        validate_identifier("external ref", external_ref)?;
        if !competition.is_open() {
            return Err(Error::CompetitionClosed(competition.id.clone()));
        }
        let key = (competition.id.clone(), external_ref.to_string());
        if self.refs.contains_key(&key) {
            return Err(Error::DuplicateEntry {
                competition: competition.id.clone(),
                external_ref: external_ref.to_string(),
            });
        }

        let next = self
            .tickets
            .get(&competition.id)
            .and_then(|t| t.keys().next_back())
            .map_or(1, |last| last.0 + 1);

        let entry = Entry {
            competition_id: competition.id.clone(),
            external_ref: external_ref.to_string(),
            ticket: TicketId(next),
            kind,
            eligible,
            created_at,
            void: None,
        };

        accept(&entry)?;

        self.refs.insert(key, entry.ticket);
        self.tickets
            .entry(competition.id.clone())
            .or_default()
            .insert(entry.ticket, entry.clone());
        Ok(entry)
    }

    /// Mark an entry void. `accept` behaves as in [`Self::record_entry`].
    pub fn void_entry<F>(
        &mut self,
        competition_id: &str,
        external_ref: &str,
        reason: &str,
        voided_at: u64,
        accept: F,
    ) -> Result<VoidedEntry, Error>
    where
        F: FnOnce(&VoidedEntry) -> Result<(), Error>,
    {
        if reason.trim().is_empty() {
            return Err(Error::Validation("void reason must not be empty".into()));
        }
        let ticket = *self
            .refs
            .get(&(competition_id.to_string(), external_ref.to_string()))
            .ok_or_else(|| Error::not_found("entry", format!("{competition_id}/{external_ref}")))?;
        let entry = self
            .tickets
            .get_mut(competition_id)
            .and_then(|t| t.get_mut(&ticket))
            .ok_or_else(|| Error::not_found("entry", format!("{competition_id}/{external_ref}")))?;
        if entry.is_voided() {
            return Err(Error::AlreadyVoided(external_ref.to_string()));
        }

        let voided = VoidedEntry {
            competition_id: competition_id.to_string(),
            external_ref: external_ref.to_string(),
            ticket,
            reason: reason.to_string(),
            voided_at,
        };

        accept(&voided)?;

        entry.void = Some(VoidMarker {
            reason: voided.reason.clone(),
            voided_at,
        });
        Ok(voided)
    }

    /// Every drawable ticket of the competition not in `exclude`, ascending.
    pub fn pool_for_draw(
        &self,
        competition_id: &str,
        prize_id: &str,
        exclude: &BTreeSet<TicketId>,
    ) -> Vec<TicketId> {
        let pool: Vec<TicketId> = self
            .tickets
            .get(competition_id)
            .into_iter()
            .flat_map(|t| t.values())
            .filter(|e| e.is_drawable() && !exclude.contains(&e.ticket))
            .map(|e| e.ticket)
            .collect();
        debug!(
            competition = competition_id,
            prize = prize_id,
            excluded = exclude.len(),
            pool_size = pool.len(),
            "pool selected"
        );
        pool
    }

    pub fn get(&self, competition_id: &str, external_ref: &str) -> Option<&Entry> {
        let ticket = self
            .refs
            .get(&(competition_id.to_string(), external_ref.to_string()))?;
        self.by_ticket(competition_id, *ticket)
    }

    pub fn by_ticket(&self, competition_id: &str, ticket: TicketId) -> Option<&Entry> {
        self.tickets.get(competition_id)?.get(&ticket)
    }

    /// Entries of a competition in ticket order, voided ones included.
    pub fn entries(&self, competition_id: &str) -> impl Iterator<Item = &Entry> {
        self.tickets
            .get(competition_id)
            .into_iter()
            .flat_map(|t| t.values())
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

// Persisted as a flat list; the indexes are rebuilt on load.
impl Serialize for EntryStore {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.tickets.values().flat_map(|t| t.values()))
    }
}

impl<'de> Deserialize<'de> for EntryStore {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        let mut store = EntryStore::new();
        for entry in entries {
            let key = (entry.competition_id.clone(), entry.external_ref.clone());
            if store.refs.insert(key, entry.ticket).is_some() {
                return Err(serde::de::Error::custom(format!(
                    "duplicate entry {} in competition {}",
                    entry.external_ref, entry.competition_id
                )));
            }
            store
                .tickets
                .entry(entry.competition_id.clone())
                .or_default()
                .insert(entry.ticket, entry);
        }
        Ok(store)
    }
}
