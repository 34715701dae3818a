//! Append-only, hash-linked event chain for one operator.
//!
//! The chain is the single writer of event hashes. Callers serialize appends
//! by holding the operator lock (see `Registry`); the chain itself refuses to
//! extend a history whose recorded head does not match its last event.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error};

use crate::{Actor, Error, Event, EventPayload, EventType, Hash, OperatorId};

/// One operator's event chain.
#[derive(Clone, Debug)]
pub struct EventChain {
    operator: OperatorId,
    events: Vec<Event>,
    /// Hash of the last committed event, tracked apart from `events` so a
    /// lost or foreign write shows up as a mismatch.
    head: Option<Hash>,
    by_hash: BTreeMap<Hash, usize>,
}

impl EventChain {
    pub fn new(operator: impl Into<OperatorId>) -> Self {
        Self {
            operator: operator.into(),
            events: Vec::new(),
            head: None,
            by_hash: BTreeMap::new(),
        }
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }

    /// Append an event and return it.
    pub fn append(
        &mut self,
        event_type: EventType,
        payload: serde_json::Value,
        actor: Actor,
        timestamp: u64,
    ) -> Result<&Event, Error> {
        if !payload.is_object() {
            return Err(Error::Validation(format!(
                "{event_type} payload must be a JSON object"
            )));
        }

        let previous = self.resolve_head()?;
        let sequence = self.events.last().map_or(1, |e| e.sequence + 1);
        let event_hash = Event::compute_hash(
            sequence,
            event_type,
            actor,
            timestamp,
            &payload,
            previous.as_ref(),
        )?;

        self.events.push(Event {
            sequence,
            event_type,
            actor,
            timestamp,
            payload,
            previous_event_hash: previous,
            event_hash,
        });
        self.by_hash.insert(event_hash, self.events.len() - 1);
        self.head = Some(event_hash);

        debug!(
            operator = %self.operator,
            sequence,
            event_type = %event_type,
            hash = %event_hash,
            "event appended"
        );

        Ok(&self.events[self.events.len() - 1])
    }

    /// Append a typed payload.
    pub fn append_payload<P: EventPayload>(
        &mut self,
        payload: &P,
        actor: Actor,
        timestamp: u64,
    ) -> Result<&Event, Error> {
        self.append(P::EVENT_TYPE, payload.to_value()?, actor, timestamp)
    }

    /// The hash the next event must link to.
    fn resolve_head(&self) -> Result<Option<Hash>, Error> {
        let last = self.events.last().map(|e| e.event_hash);
        if last != self.head {
            error!(
                operator = %self.operator,
                recorded_head = ?self.head,
                last_event = ?last,
                "chain head does not match last stored event"
            );
            return Err(Error::ChainDesynchronized {
                operator: self.operator.clone(),
                detail: format!(
                    "recorded head {} but last stored event hash is {}",
                    display_hash(self.head.as_ref()),
                    display_hash(last.as_ref())
                ),
            });
        }
        Ok(last)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Consistent copy of the chain as of now.
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.clone()
    }

    pub fn head(&self) -> Option<&Hash> {
        self.head.as_ref()
    }

    pub fn get(&self, sequence: u64) -> Option<&Event> {
        let first = self.events.first()?.sequence;
        let idx = usize::try_from(sequence.checked_sub(first)?).ok()?;
        self.events.get(idx).filter(|e| e.sequence == sequence)
    }

    pub fn by_hash(&self, hash: &Hash) -> Option<&Event> {
        self.by_hash.get(hash).and_then(|&i| self.events.get(i))
    }

    /// Events of one type, in sequence order.
    pub fn of_type(&self, event_type: EventType) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(move |e| e.event_type == event_type)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn events_mut(&mut self) -> &mut Vec<Event> {
        &mut self.events
    }
}

fn display_hash(hash: Option<&Hash>) -> String {
    hash.map_or_else(|| "<genesis>".to_string(), Hash::to_hex)
}

/// Persisted form of a chain. The hash index is rebuilt on load; the head is
/// kept as written.
#[derive(Serialize, Deserialize)]
struct ChainRecord {
    operator: OperatorId,
    head: Option<Hash>,
    events: Vec<Event>,
}

impl Serialize for EventChain {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ChainRecord {
            operator: self.operator.clone(),
            head: self.head,
            events: self.events.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EventChain {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = ChainRecord::deserialize(deserializer)?;
        let by_hash = record
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| (e.event_hash, i))
            .collect();
        Ok(Self {
            operator: record.operator,
            events: record.events,
            head: record.head,
            by_hash,
        })
    }
}
