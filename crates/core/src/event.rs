//! Ledger events and their payloads.
//!
//! ```text
//! Event {
//!   sequence            : u64          // strictly increasing per operator, from 1
//!   event_type          : EventType
//!   actor               : Actor
//!   timestamp           : u64          // Unix milliseconds
//!   payload             : JSON object
//!   previous_event_hash : Hash | null  // null only for the genesis event
//!   event_hash          : Hash         // BLAKE3 over canonical::event_material
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::canonical::{self, EventFields};
use crate::{CompetitionId, DrawId, EntryKind, Error, Hash, Prize, PrizeId, TicketId};

/// Every kind of event the ledger records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "competition.created")]
    CompetitionCreated,
    #[serde(rename = "competition.prize_added")]
    PrizeAdded,
    #[serde(rename = "competition.closed")]
    CompetitionClosed,
    #[serde(rename = "entry.created")]
    EntryCreated,
    #[serde(rename = "entry.voided")]
    EntryVoided,
    #[serde(rename = "draw.seed_committed")]
    SeedCommitted,
    #[serde(rename = "draw.pool_frozen")]
    PoolFrozen,
    #[serde(rename = "draw.completed")]
    DrawCompleted,
    #[serde(rename = "complaint.submitted")]
    ComplaintSubmitted,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::CompetitionCreated,
        EventType::PrizeAdded,
        EventType::CompetitionClosed,
        EventType::EntryCreated,
        EventType::EntryVoided,
        EventType::SeedCommitted,
        EventType::PoolFrozen,
        EventType::DrawCompleted,
        EventType::ComplaintSubmitted,
    ];

    /// The wire name, as hashed.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CompetitionCreated => "competition.created",
            EventType::PrizeAdded => "competition.prize_added",
            EventType::CompetitionClosed => "competition.closed",
            EventType::EntryCreated => "entry.created",
            EventType::EntryVoided => "entry.voided",
            EventType::SeedCommitted => "draw.seed_committed",
            EventType::PoolFrozen => "draw.pool_frozen",
            EventType::DrawCompleted => "draw.completed",
            EventType::ComplaintSubmitted => "complaint.submitted",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown event type: {s}")))
    }
}

/// Who caused an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Operator,
    System,
    Admin,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::Operator => "operator",
            Actor::System => "system",
            Actor::Admin => "admin",
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Actor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operator" => Ok(Actor::Operator),
            "system" => Ok(Actor::System),
            "admin" => Ok(Actor::Admin),
            _ => Err(Error::Validation(format!("unknown actor: {s}"))),
        }
    }
}

/// An immutable ledger record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub event_type: EventType,
    pub actor: Actor,
    pub timestamp: u64,
    pub payload: serde_json::Value,
    pub previous_event_hash: Option<Hash>,
    pub event_hash: Hash,
}

impl Event {
    /// Hash the given header and payload.
    pub fn compute_hash(
        sequence: u64,
        event_type: EventType,
        actor: Actor,
        timestamp: u64,
        payload: &serde_json::Value,
        previous_event_hash: Option<&Hash>,
    ) -> Result<Hash, Error> {
        let material = canonical::event_material(&EventFields {
            sequence,
            event_type: event_type.as_str(),
            actor: actor.as_str(),
            timestamp,
            payload,
            previous_event_hash,
        })?;
        Ok(Hash::of(&material))
    }

    /// Recompute this event's hash from its stored fields.
    pub fn recompute_hash(&self) -> Result<Hash, Error> {
        Self::compute_hash(
            self.sequence,
            self.event_type,
            self.actor,
            self.timestamp,
            &self.payload,
            self.previous_event_hash.as_ref(),
        )
    }

    /// Decode the payload, checking the event type first.
    pub fn decode<P: EventPayload>(&self) -> Result<P, Error> {
        if self.event_type != P::EVENT_TYPE {
            return Err(Error::Validation(format!(
                "event {} is {}, expected {}",
                self.sequence,
                self.event_type,
                P::EVENT_TYPE
            )));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// A typed payload bound to one event type.
pub trait EventPayload: Serialize + DeserializeOwned {
    const EVENT_TYPE: EventType;

    fn to_value(&self) -> Result<serde_json::Value, Error> {
        Ok(serde_json::to_value(self)?)
    }
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompetitionCreated {
    pub competition_id: CompetitionId,
    pub title: String,
    pub prizes: Vec<Prize>,
}

impl EventPayload for CompetitionCreated {
    const EVENT_TYPE: EventType = EventType::CompetitionCreated;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrizeAdded {
    pub competition_id: CompetitionId,
    pub prize_id: PrizeId,
    pub name: String,
    /// Position in the draw order, from 0.
    pub position: usize,
}

impl EventPayload for PrizeAdded {
    const EVENT_TYPE: EventType = EventType::PrizeAdded;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompetitionClosed {
    pub competition_id: CompetitionId,
    pub total_entries: u64,
}

impl EventPayload for CompetitionClosed {
    const EVENT_TYPE: EventType = EventType::CompetitionClosed;
}

/// Tickets stay off the ledger until a pool is frozen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryCreated {
    pub competition_id: CompetitionId,
    pub external_ref: String,
    pub kind: EntryKind,
    pub eligible: bool,
}

impl EventPayload for EntryCreated {
    const EVENT_TYPE: EventType = EventType::EntryCreated;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryVoided {
    pub competition_id: CompetitionId,
    pub external_ref: String,
    pub reason: String,
}

impl EventPayload for EntryVoided {
    const EVENT_TYPE: EventType = EventType::EntryVoided;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedCommittedPayload {
    pub draw_id: DrawId,
    pub competition_id: CompetitionId,
    pub prize_id: PrizeId,
    pub seed_hash: Hash,
    pub committed_at: u64,
}

impl EventPayload for SeedCommittedPayload {
    const EVENT_TYPE: EventType = EventType::SeedCommitted;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolFrozenPayload {
    pub draw_id: DrawId,
    pub competition_id: CompetitionId,
    pub prize_id: PrizeId,
    /// Frozen tickets, ascending.
    pub pool: Vec<TicketId>,
    pub pool_hash: Hash,
    pub total_entries: u64,
    /// Winners of earlier prizes in the same request.
    pub excluded: Vec<TicketId>,
}

impl EventPayload for PoolFrozenPayload {
    const EVENT_TYPE: EventType = EventType::PoolFrozen;
}

/// Everything needed to re-derive a draw: revealed seed and full pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawCompletedPayload {
    pub draw_id: DrawId,
    pub competition_id: CompetitionId,
    pub prize_id: PrizeId,
    pub drawn_at: u64,
    /// Revealed seed, lowercase hex.
    pub seed: String,
    pub seed_hash: Hash,
    pub pool: Vec<TicketId>,
    pub pool_hash: Hash,
    pub total_entries: u64,
    pub winning_ticket: Option<TicketId>,
}

impl EventPayload for DrawCompletedPayload {
    const EVENT_TYPE: EventType = EventType::DrawCompleted;
}

/// Recorded on behalf of the complaint-handling collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplaintSubmitted {
    pub competition_id: Option<CompetitionId>,
    pub reference: String,
    pub summary: String,
}

impl EventPayload for ComplaintSubmitted {
    const EVENT_TYPE: EventType = EventType::ComplaintSubmitted;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_names_round_trip() {
        for t in EventType::ALL {
            let json = serde_json::to_value(t).unwrap();
            assert_eq!(json, json!(t.as_str()));
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
        }
        assert!("draw.cancelled".parse::<EventType>().is_err());
    }

    #[test]
    fn hash_covers_every_header_field() {
        let payload = json!({"competition_id": "c"});
        let base = Event::compute_hash(1, EventType::CompetitionClosed, Actor::Operator, 5, &payload, None).unwrap();

        let variants = [
            Event::compute_hash(2, EventType::CompetitionClosed, Actor::Operator, 5, &payload, None),
            Event::compute_hash(1, EventType::CompetitionCreated, Actor::Operator, 5, &payload, None),
            Event::compute_hash(1, EventType::CompetitionClosed, Actor::Admin, 5, &payload, None),
            Event::compute_hash(1, EventType::CompetitionClosed, Actor::Operator, 6, &payload, None),
            Event::compute_hash(1, EventType::CompetitionClosed, Actor::Operator, 5, &json!({"competition_id": "d"}), None),
            Event::compute_hash(1, EventType::CompetitionClosed, Actor::Operator, 5, &payload, Some(&Hash::of(b"x"))),
        ];
        for v in variants {
            assert_ne!(v.unwrap(), base);
        }
    }

    #[test]
    fn decode_checks_event_type() {
        let payload = EntryVoided {
            competition_id: "c".into(),
            external_ref: "r".into(),
            reason: "fraud".into(),
        };
        let value = payload.to_value().unwrap();
        let event = Event {
            sequence: 3,
            event_type: EventType::EntryVoided,
            actor: Actor::Admin,
            timestamp: 9,
            event_hash: Event::compute_hash(3, EventType::EntryVoided, Actor::Admin, 9, &value, None).unwrap(),
            payload: value,
            previous_event_hash: None,
        };
        assert_eq!(event.decode::<EntryVoided>().unwrap(), payload);
        assert!(matches!(
            event.decode::<EntryCreated>(),
            Err(Error::Validation(_))
        ));
    }
}
