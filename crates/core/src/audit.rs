//! Draw audits.
//!
//! One audit per completed prize draw, derived from its `draw.completed`
//! event. Audits form a single signature chain per operator across all of its
//! competitions: each signature binds the audit's fields and the previous
//! audit's signature.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::canonical::{self, SignatureFields};
use crate::draw::{Seed, pool_hash};
use crate::event::DrawCompletedPayload;
use crate::{CompetitionId, DrawId, Error, Event, Hash, PrizeId, TicketId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawAudit {
    /// Position in the operator's audit chain, from 1.
    pub sequence: u64,
    pub draw_id: DrawId,
    pub competition_id: CompetitionId,
    pub prize_id: PrizeId,
    pub drawn_at: u64,
    pub total_entries: u64,
    pub winning_ticket: Option<TicketId>,
    pub pool_hash: Hash,
    pub seed_hash: Hash,
    /// Revealed seed, lowercase hex. Bound to the signature through `seed_hash`.
    pub revealed_seed: String,
    /// Sequence of the `draw.completed` event this audit was built from.
    pub event_sequence: u64,
    pub signature_hash: Hash,
    pub previous_signature_hash: Option<Hash>,
}

impl DrawAudit {
    /// Recompute the signature from this audit's own fields.
    pub fn compute_signature(&self) -> Hash {
        let draw_id = self.draw_id.to_string();
        Hash::of_str(&canonical::signature_material(&SignatureFields {
            competition_id: &self.competition_id,
            prize_id: &self.prize_id,
            draw_id: &draw_id,
            drawn_at: self.drawn_at,
            total_entries: self.total_entries,
            winning_ticket: self.winning_ticket,
            pool_hash: &self.pool_hash,
            seed_hash: &self.seed_hash,
            previous_signature_hash: self.previous_signature_hash.as_ref(),
        }))
    }
}

/// Derive the audit for a `draw.completed` event.
///
/// The pool hash is recomputed from the revealed pool rather than copied, so
/// an event whose pool and pool hash disagree is refused.
pub fn build_audit(completed: &Event, previous: Option<&DrawAudit>) -> Result<DrawAudit, Error> {
    let payload: DrawCompletedPayload = completed.decode()?;

    let recomputed = pool_hash(&payload.pool);
    if recomputed != payload.pool_hash {
        return Err(Error::Validation(format!(
            "draw {} records pool hash {} but its pool hashes to {}",
            payload.draw_id, payload.pool_hash, recomputed
        )));
    }
    if payload.total_entries != payload.pool.len() as u64 {
        return Err(Error::Validation(format!(
            "draw {} records {} entries but its pool holds {}",
            payload.draw_id,
            payload.total_entries,
            payload.pool.len()
        )));
    }

    let seed_matches = Seed::from_hex(&payload.seed).is_some_and(|s| s.commitment() == payload.seed_hash);
    if !seed_matches {
        return Err(Error::Validation(format!(
            "draw {} reveals a seed that does not hash to {}",
            payload.draw_id, payload.seed_hash
        )));
    }

    let mut audit = DrawAudit {
        sequence: previous.map_or(1, |p| p.sequence + 1),
        draw_id: payload.draw_id,
        competition_id: payload.competition_id,
        prize_id: payload.prize_id,
        drawn_at: payload.drawn_at,
        total_entries: payload.total_entries,
        winning_ticket: payload.winning_ticket,
        pool_hash: recomputed,
        seed_hash: payload.seed_hash,
        revealed_seed: payload.seed,
        event_sequence: completed.sequence,
        signature_hash: Hash::ZERO,
        previous_signature_hash: previous.map(|p| p.signature_hash),
    };
    audit.signature_hash = audit.compute_signature();
    Ok(audit)
}

/// An operator's audit chain.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditChain {
    audits: Vec<DrawAudit>,
}

impl AuditChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the audit for `completed` and append it.
    pub fn record(&mut self, completed: &Event) -> Result<&DrawAudit, Error> {
        let audit = build_audit(completed, self.audits.last())?;
        if self.by_draw(&audit.draw_id).is_some() {
            return Err(Error::Conflict(format!(
                "draw {} already has an audit",
                audit.draw_id
            )));
        }

        info!(
            draw_id = %audit.draw_id,
            competition = %audit.competition_id,
            prize = %audit.prize_id,
            sequence = audit.sequence,
            total_entries = audit.total_entries,
            signature = %audit.signature_hash,
            "draw audit recorded"
        );

        self.audits.push(audit);
        Ok(&self.audits[self.audits.len() - 1])
    }

    pub fn audits(&self) -> &[DrawAudit] {
        &self.audits
    }

    pub fn by_draw(&self, draw_id: &DrawId) -> Option<&DrawAudit> {
        self.audits.iter().find(|a| &a.draw_id == draw_id)
    }

    /// The audit of a prize, if it has been drawn.
    pub fn for_prize(&self, competition_id: &str, prize_id: &str) -> Option<&DrawAudit> {
        self.audits
            .iter()
            .find(|a| a.competition_id == competition_id && a.prize_id == prize_id)
    }

    pub fn last(&self) -> Option<&DrawAudit> {
        self.audits.last()
    }

    pub fn len(&self) -> usize {
        self.audits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.audits.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn audits_mut(&mut self) -> &mut Vec<DrawAudit> {
        &mut self.audits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw::{DrawRequest, EntropySource, SEED_LEN, Seed};
    use crate::{Actor, EventChain};

    struct Fixed(u8);

    impl EntropySource for Fixed {
        fn fill_seed(&self, seed: &mut [u8; SEED_LEN]) -> Result<(), Error> {
            seed.fill(self.0);
            Ok(())
        }
    }

    fn completed_event(chain: &mut EventChain, competition: &str, pool: &[u64]) -> Event {
        let seed = Seed::generate(&Fixed(3)).unwrap();
        let done = DrawRequest::new(competition, "first")
            .commit(seed, 10)
            .freeze(pool.iter().copied().map(TicketId).collect(), vec![])
            .select()
            .reveal(11);
        chain
            .append_payload(&done.payload(), Actor::System, 11)
            .unwrap()
            .clone()
    }

    #[test]
    fn first_audit_starts_chain() {
        let mut ledger = EventChain::new("op");
        let event = completed_event(&mut ledger, "spring", &[1, 2, 3]);
        let audit = build_audit(&event, None).unwrap();

        assert_eq!(audit.sequence, 1);
        assert_eq!(audit.previous_signature_hash, None);
        assert_eq!(audit.pool_hash, Hash::of_str("1,2,3"));
        assert_eq!(audit.total_entries, 3);
        assert_eq!(audit.signature_hash, audit.compute_signature());
        assert_eq!(audit.event_sequence, event.sequence);
        assert_eq!(audit.revealed_seed, "03".repeat(32));
    }

    #[test]
    fn audits_chain_across_competitions() {
        let mut ledger = EventChain::new("op");
        let mut chain = AuditChain::new();
        let a = completed_event(&mut ledger, "spring", &[1, 2]);
        let b = completed_event(&mut ledger, "summer", &[1]);

        let first = chain.record(&a).unwrap().signature_hash;
        let second = chain.record(&b).unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(second.previous_signature_hash, Some(first));
        assert_eq!(second.competition_id, "summer");
    }

    #[test]
    fn signature_covers_every_field() {
        let mut ledger = EventChain::new("op");
        let event = completed_event(&mut ledger, "spring", &[1, 2, 3]);
        let audit = build_audit(&event, None).unwrap();

        let mutations: Vec<Box<dyn Fn(&mut DrawAudit)>> = vec![
            Box::new(|a: &mut DrawAudit| a.competition_id.push('x')),
            Box::new(|a: &mut DrawAudit| a.prize_id.push('x')),
            Box::new(|a: &mut DrawAudit| a.draw_id = DrawId::new_v4()),
            Box::new(|a: &mut DrawAudit| a.drawn_at += 1),
            Box::new(|a: &mut DrawAudit| a.total_entries += 1),
            Box::new(|a: &mut DrawAudit| a.winning_ticket = None),
            Box::new(|a: &mut DrawAudit| a.pool_hash = Hash::of(b"other")),
            Box::new(|a: &mut DrawAudit| a.seed_hash = Hash::of(b"other")),
            Box::new(|a: &mut DrawAudit| a.previous_signature_hash = Some(Hash::of(b"other"))),
        ];
        for mutate in mutations {
            let mut tampered = audit.clone();
            mutate(&mut tampered);
            assert_ne!(tampered.compute_signature(), audit.signature_hash);
        }
    }

    #[test]
    fn mismatched_pool_hash_refused() {
        let mut ledger = EventChain::new("op");
        let mut event = completed_event(&mut ledger, "spring", &[1, 2, 3]);
        event.payload["pool"] = serde_json::json!([1, 2]);
        assert!(matches!(build_audit(&event, None), Err(Error::Validation(_))));
    }

    #[test]
    fn revealed_seed_must_match_commitment() {
        let mut ledger = EventChain::new("op");
        let mut event = completed_event(&mut ledger, "spring", &[1, 2, 3]);
        event.payload["seed"] = serde_json::json!("04".repeat(32));
        assert!(matches!(build_audit(&event, None), Err(Error::Validation(_))));
    }

    #[test]
    fn non_draw_event_refused() {
        let mut ledger = EventChain::new("op");
        let event = ledger
            .append(
                crate::EventType::CompetitionClosed,
                serde_json::json!({"competition_id": "c", "total_entries": 0}),
                Actor::Operator,
                1,
            )
            .unwrap()
            .clone();
        assert!(build_audit(&event, None).is_err());
    }

    #[test]
    fn same_draw_cannot_be_audited_twice() {
        let mut ledger = EventChain::new("op");
        let mut chain = AuditChain::new();
        let event = completed_event(&mut ledger, "spring", &[1]);
        chain.record(&event).unwrap();
        assert!(matches!(chain.record(&event), Err(Error::Conflict(_))));
        assert_eq!(chain.len(), 1);
    }
}
