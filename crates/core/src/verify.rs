//! Chain verification.
//!
//! Walks a chain in order and, for every item, recomputes its hash from its
//! own fields and checks that its back-link names the recomputed hash of the
//! item before it. Every break is reported; verification never stops early
//! and never writes.
//!
//! A chain cut at its tail still links cleanly, so callers also compare the
//! last item with the head recorded apart from the chain, and the audit chain
//! with the `draw.completed` events it was built from.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::event::DrawCompletedPayload;
use crate::{DrawAudit, DrawId, Error, Event, EventType, Hash};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    Valid,
    Invalid,
}

/// An item whose back-link does not match its predecessor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenLink {
    pub sequence: u64,
    /// What the link should be: the predecessor's recomputed hash, or null
    /// at the start of the chain.
    pub expected_previous: Option<Hash>,
    pub found_previous: Option<Hash>,
    /// Sequence expected at this position, when it differs from the stored one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sequence: Option<u64>,
}

/// An item whose stored hash does not match its contents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidHash {
    pub sequence: u64,
    pub stored: Hash,
    /// `None` when the item could not be re-encoded at all.
    pub recomputed: Option<Hash>,
}

/// The recorded head names a different item than the chain ends with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadMismatch {
    pub recorded: Option<Hash>,
    pub last: Option<Hash>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingRecord {
    /// A `draw.completed` event has no audit.
    Audit,
    /// An audit has no matching `draw.completed` event.
    Event,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmatchedDraw {
    pub draw_id: DrawId,
    pub missing: MissingRecord,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub status: ChainStatus,
    pub total: u64,
    pub verified: u64,
    pub broken_links: Vec<BrokenLink>,
    pub invalid_hashes: Vec<InvalidHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_mismatch: Option<HeadMismatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unmatched_draws: Vec<UnmatchedDraw>,
}

impl ChainReport {
    pub fn is_valid(&self) -> bool {
        self.status == ChainStatus::Valid
    }

    /// Compare the chain's last stored hash with the separately recorded head.
    pub fn check_head(mut self, recorded: Option<Hash>, last: Option<Hash>) -> Self {
        if recorded != last {
            self.head_mismatch = Some(HeadMismatch { recorded, last });
            self.status = ChainStatus::Invalid;
        }
        self
    }

    /// Attach draws whose event and audit do not correspond.
    pub fn with_unmatched_draws(mut self, unmatched: Vec<UnmatchedDraw>) -> Self {
        if !unmatched.is_empty() {
            self.status = ChainStatus::Invalid;
        }
        self.unmatched_draws = unmatched;
        self
    }
}

/// A hash-linked record.
pub trait Chained {
    fn sequence(&self) -> u64;
    fn stored_hash(&self) -> Hash;
    fn previous_hash(&self) -> Option<Hash>;
    fn recompute_hash(&self) -> Result<Hash, Error>;
}

impl Chained for Event {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn stored_hash(&self) -> Hash {
        self.event_hash
    }

    fn previous_hash(&self) -> Option<Hash> {
        self.previous_event_hash
    }

    fn recompute_hash(&self) -> Result<Hash, Error> {
        Event::recompute_hash(self)
    }
}

impl Chained for DrawAudit {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn stored_hash(&self) -> Hash {
        self.signature_hash
    }

    fn previous_hash(&self) -> Option<Hash> {
        self.previous_signature_hash
    }

    fn recompute_hash(&self) -> Result<Hash, Error> {
        Ok(self.compute_signature())
    }
}

/// Verify a chain that starts at sequence 1 with a genesis item.
pub fn verify_chain<T: Chained>(items: &[T]) -> ChainReport {
    let mut broken_links = Vec::new();
    let mut invalid_hashes = Vec::new();
    let mut verified = 0u64;

    let mut expected_previous: Option<Hash> = None;
    let mut expected_sequence = 1u64;

    for item in items {
        let sequence = item.sequence();
        let stored = item.stored_hash();
        let recomputed = item.recompute_hash().ok();

        let hash_ok = recomputed == Some(stored);
        if !hash_ok {
            invalid_hashes.push(InvalidHash {
                sequence,
                stored,
                recomputed,
            });
        }

        let found_previous = item.previous_hash();
        let link_ok = found_previous == expected_previous && sequence == expected_sequence;
        if !link_ok {
            broken_links.push(BrokenLink {
                sequence,
                expected_previous,
                found_previous,
                expected_sequence: (sequence != expected_sequence).then_some(expected_sequence),
            });
        }

        if hash_ok && link_ok {
            verified += 1;
        }

        // The next link must name what this item actually hashes to, so an
        // edited item breaks its successor's link even if its stored hash
        // was rewritten to match.
        expected_previous = Some(recomputed.unwrap_or(stored));
        expected_sequence = sequence.saturating_add(1);
    }

    let total = items.len() as u64;
    ChainReport {
        status: if verified == total {
            ChainStatus::Valid
        } else {
            ChainStatus::Invalid
        },
        total,
        verified,
        broken_links,
        invalid_hashes,
        head_mismatch: None,
        unmatched_draws: Vec::new(),
    }
}

/// Pair every `draw.completed` event with its audit.
///
/// An audit matches when the event at its `event_sequence` completes the same
/// draw and reveals the same seed.
pub fn unmatched_draws(events: &[Event], audits: &[DrawAudit]) -> Vec<UnmatchedDraw> {
    let completed: BTreeMap<DrawId, (u64, DrawCompletedPayload)> = events
        .iter()
        .filter(|e| e.event_type == EventType::DrawCompleted)
        .filter_map(|e| {
            let payload: DrawCompletedPayload = e.decode().ok()?;
            Some((payload.draw_id, (e.sequence, payload)))
        })
        .collect();

    let mut unmatched: Vec<UnmatchedDraw> = audits
        .iter()
        .filter(|a| {
            !completed.get(&a.draw_id).is_some_and(|(sequence, payload)| {
                *sequence == a.event_sequence && payload.seed == a.revealed_seed
            })
        })
        .map(|a| UnmatchedDraw {
            draw_id: a.draw_id,
            missing: MissingRecord::Event,
        })
        .collect();

    let audited: BTreeSet<DrawId> = audits.iter().map(|a| a.draw_id).collect();
    unmatched.extend(
        completed
            .keys()
            .filter(|id| !audited.contains(id))
            .map(|&draw_id| UnmatchedDraw {
                draw_id,
                missing: MissingRecord::Audit,
            }),
    );
    unmatched
}
