//! Operator-scoped facade over the ledger, entry store, draw engine and audit
//! chain.
//!
//! Each operator owns one [`OperatorScope`] behind its own mutex, so writes
//! for one operator are strictly ordered while different operators proceed
//! in parallel. Every state change appends its ledger event before the
//! in-memory state is touched; a failed append leaves the scope as it was.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{info, warn};

use crate::canonical::validate_identifier;
use crate::draw::{DrawRequest, Seed, SeedCommitted, pool_hash, select_winner};
use crate::event::{
    CompetitionClosed, CompetitionCreated, ComplaintSubmitted, DrawCompletedPayload, EntryCreated,
    EntryVoided, PoolFrozenPayload, PrizeAdded, SeedCommittedPayload,
};
use crate::{
    Actor, AuditChain, ChainReport, Competition, CompetitionId, CompetitionStatus, DrawAudit,
    DrawId, EntropySource, Entry, EntryKind, EntryStore, Error, Event, EventChain, EventType, Hash,
    OperatorId, OsEntropy, Prize, PrizeId, TicketId, VoidedEntry, now_millis, unmatched_draws,
    verify_chain,
};

/// Which prizes a draw request covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrawTarget {
    /// One prize.
    Prize(PrizeId),
    /// Every prize not drawn yet, in the order they were added. A ticket
    /// wins at most one prize per request.
    All,
}

/// A published commitment that has not completed yet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingDraw {
    pub committed: SeedCommitted,
    /// Tickets the committing request had already excluded as earlier winners.
    #[serde(default)]
    pub exclude: BTreeSet<TicketId>,
}

/// Everything one operator owns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperatorScope {
    competitions: BTreeMap<CompetitionId, Competition>,
    entries: EntryStore,
    ledger: EventChain,
    audits: AuditChain,
    /// Commitments published but not yet completed.
    #[serde(default)]
    pending: Vec<PendingDraw>,
}

impl OperatorScope {
    pub fn new(operator: impl Into<OperatorId>) -> Self {
        Self {
            competitions: BTreeMap::new(),
            entries: EntryStore::new(),
            ledger: EventChain::new(operator),
            audits: AuditChain::new(),
            pending: Vec::new(),
        }
    }

    pub fn operator(&self) -> &str {
        self.ledger.operator()
    }

    pub fn ledger(&self) -> &EventChain {
        &self.ledger
    }

    pub fn audits(&self) -> &AuditChain {
        &self.audits
    }

    pub fn entries(&self) -> &EntryStore {
        &self.entries
    }

    pub fn pending(&self) -> &[PendingDraw] {
        &self.pending
    }

    fn competition(&self, id: &str) -> Result<&Competition, Error> {
        self.competitions
            .get(id)
            .ok_or_else(|| Error::not_found("competition", id))
    }

    #[cfg(test)]
    pub(crate) fn ledger_mut(&mut self) -> &mut EventChain {
        &mut self.ledger
    }

    #[cfg(test)]
    pub(crate) fn audits_mut(&mut self) -> &mut AuditChain {
        &mut self.audits
    }

    /// Prizes a request would draw, in draw order.
    fn prizes_to_draw(&self, competition_id: &str, target: &DrawTarget) -> Result<Vec<PrizeId>, Error> {
        let competition = self.competition(competition_id)?;
        match target {
            DrawTarget::Prize(prize_id) => {
                if competition.prize(prize_id).is_none() {
                    return Err(Error::not_found(
                        "prize",
                        format!("{competition_id}/{prize_id}"),
                    ));
                }
                if let Some(audit) = self.audits.for_prize(competition_id, prize_id) {
                    return Err(Error::Conflict(format!(
                        "prize {prize_id} of {competition_id} was already drawn in draw {}",
                        audit.draw_id
                    )));
                }
                Ok(vec![prize_id.clone()])
            }
            DrawTarget::All => {
                if competition.prizes.is_empty() {
                    return Err(Error::Validation(format!(
                        "competition {competition_id} has no prizes"
                    )));
                }
                let remaining: Vec<PrizeId> = competition
                    .prizes
                    .iter()
                    .filter(|p| self.audits.for_prize(competition_id, &p.id).is_none())
                    .map(|p| p.id.clone())
                    .collect();
                if remaining.is_empty() {
                    return Err(Error::Conflict(format!(
                        "every prize of {competition_id} has been drawn"
                    )));
                }
                Ok(remaining)
            }
        }
    }

    fn pending_for(&self, competition_id: &str, prize_id: &str) -> Option<&PendingDraw> {
        self.pending.iter().find(|p| {
            let request = p.committed.request();
            request.competition_id() == competition_id && request.prize_id() == prize_id
        })
    }

    /// Publish a fresh commitment and remember it, with the request's
    /// exclusions, until the draw completes.
    fn commit(
        &mut self,
        competition_id: &str,
        prize_id: &str,
        seed: Seed,
        exclude: &BTreeSet<TicketId>,
    ) -> Result<SeedCommitted, Error> {
        let committed = DrawRequest::new(competition_id, prize_id).commit(seed, now_millis());
        self.ledger
            .append_payload(&committed.payload(), Actor::System, committed.committed_at())?;
        self.pending.push(PendingDraw {
            committed: committed.clone(),
            exclude: exclude.clone(),
        });
        info!(
            operator = %self.ledger.operator(),
            draw_id = %committed.request().draw_id(),
            competition = competition_id,
            prize = prize_id,
            seed_hash = %committed.seed_hash(),
            "seed committed"
        );
        Ok(committed)
    }

    /// Freeze, select, reveal and audit a committed draw.
    fn complete(&mut self, committed: SeedCommitted, exclude: &mut BTreeSet<TicketId>) -> Result<DrawAudit, Error> {
        let request = committed.request().clone();
        let pool = self
            .entries
            .pool_for_draw(request.competition_id(), request.prize_id(), exclude);
        let frozen = committed.freeze(pool, exclude.iter().copied().collect());
        self.ledger
            .append_payload(&frozen.payload(), Actor::System, now_millis())?;

        let done = frozen.select().reveal(now_millis());
        let event = self
            .ledger
            .append_payload(&done.payload(), Actor::System, done.drawn_at)?
            .clone();
        let audit = self.audits.record(&event)?.clone();

        self.pending
            .retain(|p| p.committed.request().draw_id() != request.draw_id());
        if let Some(winner) = done.winning_ticket {
            exclude.insert(winner);
        }

        info!(
            operator = %self.ledger.operator(),
            draw_id = %audit.draw_id,
            competition = %audit.competition_id,
            prize = %audit.prize_id,
            total_entries = audit.total_entries,
            winner = ?audit.winning_ticket,
            "draw completed"
        );
        Ok(audit)
    }
}

/// What the public sees for a completed draw.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicAudit {
    pub draw_id: DrawId,
    pub competition_id: CompetitionId,
    pub prize_id: PrizeId,
    pub drawn_at: u64,
    pub total_entries: u64,
    pub winning_ticket: Option<TicketId>,
    pub pool_hash: Hash,
    pub seed_hash: Hash,
    /// The seed, hex, as revealed in `draw.completed`.
    pub revealed_seed: String,
    pub pool: Vec<TicketId>,
    pub signature_hash: Hash,
    pub previous_signature_hash: Option<Hash>,
}

/// Result of re-deriving one draw from the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawVerification {
    pub draw_id: DrawId,
    /// `draw.seed_committed` precedes `draw.pool_frozen`, which precedes
    /// `draw.completed`.
    pub commitment_precedes_pool: bool,
    pub seed_matches_commitment: bool,
    pub pool_matches_hash: bool,
    pub winner_reproduced: bool,
    pub signature_valid: bool,
    /// The audit points at this draw's `draw.completed` event and carries its seed.
    pub audit_matches_event: bool,
    pub valid: bool,
}

/// Whether one entry took part in a draw.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketVerification {
    pub draw_id: DrawId,
    pub external_ref: String,
    pub ticket: TicketId,
    pub in_pool: bool,
    pub won: bool,
    /// The revealed pool hashes to the audited pool hash.
    pub pool_matches_hash: bool,
}

/// The per-operator registry.
pub struct Registry {
    scopes: RwLock<BTreeMap<OperatorId, Arc<Mutex<OperatorScope>>>>,
    entropy: Arc<dyn EntropySource>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Arc::new(OsEntropy))
    }
}

fn lock(scope: &Mutex<OperatorScope>) -> MutexGuard<'_, OperatorScope> {
    scope.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Registry {
    pub fn new(entropy: Arc<dyn EntropySource>) -> Self {
        Self {
            scopes: RwLock::new(BTreeMap::new()),
            entropy,
        }
    }

    /// Build a registry around existing scopes.
    pub(crate) fn with_scopes(
        scopes: BTreeMap<OperatorId, OperatorScope>,
        entropy: Arc<dyn EntropySource>,
    ) -> Self {
        let scopes = scopes
            .into_iter()
            .map(|(op, scope)| (op, Arc::new(Mutex::new(scope))))
            .collect();
        Self {
            scopes: RwLock::new(scopes),
            entropy,
        }
    }

    /// Copy of every scope, each taken under its own lock.
    pub(crate) fn scopes(&self) -> BTreeMap<OperatorId, OperatorScope> {
        let scopes = self.scopes.read().unwrap_or_else(PoisonError::into_inner);
        scopes
            .iter()
            .map(|(op, scope)| (op.clone(), lock(scope).clone()))
            .collect()
    }

    fn scope(&self, operator: &str) -> Result<Arc<Mutex<OperatorScope>>, Error> {
        let scopes = self.scopes.read().unwrap_or_else(PoisonError::into_inner);
        scopes
            .get(operator)
            .cloned()
            .ok_or_else(|| Error::not_found("operator", operator))
    }

    fn scope_or_insert(&self, operator: &str) -> Result<Arc<Mutex<OperatorScope>>, Error> {
        validate_identifier("operator id", operator)?;
        if let Ok(scope) = self.scope(operator) {
            return Ok(scope);
        }
        let mut scopes = self.scopes.write().unwrap_or_else(PoisonError::into_inner);
        Ok(scopes
            .entry(operator.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(OperatorScope::new(operator))))
            .clone())
    }

    pub fn operators(&self) -> Vec<OperatorId> {
        let scopes = self.scopes.read().unwrap_or_else(PoisonError::into_inner);
        scopes.keys().cloned().collect()
    }

    // =========================================================================
    // Competitions
    // =========================================================================

    pub fn create_competition(
        &self,
        operator: &str,
        competition_id: &str,
        title: &str,
        prizes: Vec<Prize>,
        actor: Actor,
    ) -> Result<Competition, Error> {
        let scope = self.scope_or_insert(operator)?;
        let mut guard = lock(&scope);
        if guard.competitions.contains_key(competition_id) {
            return Err(Error::Conflict(format!(
                "competition {competition_id} already exists"
            )));
        }

        let now = now_millis();
        let competition = Competition::new(operator, competition_id, title, prizes, now)?;
        guard.ledger.append_payload(
            &CompetitionCreated {
                competition_id: competition.id.clone(),
                title: competition.title.clone(),
                prizes: competition.prizes.clone(),
            },
            actor,
            now,
        )?;
        guard
            .competitions
            .insert(competition.id.clone(), competition.clone());

        info!(operator, competition = competition_id, prizes = competition.prizes.len(), "competition created");
        Ok(competition)
    }

    /// Append a prize; it is drawn after the existing ones.
    pub fn add_prize(
        &self,
        operator: &str,
        competition_id: &str,
        prize: Prize,
        actor: Actor,
    ) -> Result<Competition, Error> {
        let scope = self.scope(operator)?;
        let mut guard = lock(&scope);
        let scope = &mut *guard;
        let competition = scope
            .competitions
            .get_mut(competition_id)
            .ok_or_else(|| Error::not_found("competition", competition_id))?;
        competition.check_new_prize(&prize)?;

        scope.ledger.append_payload(
            &PrizeAdded {
                competition_id: competition_id.to_string(),
                prize_id: prize.id.clone(),
                name: prize.name.clone(),
                position: competition.prizes.len(),
            },
            actor,
            now_millis(),
        )?;
        competition.prizes.push(prize);
        Ok(competition.clone())
    }

    /// Stop accepting entries.
    pub fn close_competition(
        &self,
        operator: &str,
        competition_id: &str,
        actor: Actor,
    ) -> Result<Competition, Error> {
        let scope = self.scope(operator)?;
        let mut guard = lock(&scope);
        let scope = &mut *guard;
        let competition = scope
            .competitions
            .get_mut(competition_id)
            .ok_or_else(|| Error::not_found("competition", competition_id))?;
        if !competition.is_open() {
            return Err(Error::CompetitionClosed(competition_id.to_string()));
        }

        let total_entries = scope.entries.entries(competition_id).count() as u64;
        scope.ledger.append_payload(
            &CompetitionClosed {
                competition_id: competition_id.to_string(),
                total_entries,
            },
            actor,
            now_millis(),
        )?;
        competition.status = CompetitionStatus::Closed;

        info!(operator, competition = competition_id, total_entries, "competition closed");
        Ok(competition.clone())
    }

    pub fn competition(&self, operator: &str, competition_id: &str) -> Result<Competition, Error> {
        let scope = self.scope(operator)?;
        let guard = lock(&scope);
        guard.competition(competition_id).cloned()
    }

    pub fn competitions(&self, operator: &str) -> Result<Vec<Competition>, Error> {
        let scope = self.scope(operator)?;
        let guard = lock(&scope);
        Ok(guard.competitions.values().cloned().collect())
    }

    // =========================================================================
    // Entries
    // =========================================================================

    /// Register an entry and assign its ticket.
    pub fn submit_entry(
        &self,
        operator: &str,
        competition_id: &str,
        external_ref: &str,
        kind: EntryKind,
        eligible: bool,
        actor: Actor,
    ) -> Result<Entry, Error> {
        let scope = self.scope(operator)?;
        let mut guard = lock(&scope);
        let OperatorScope {
            competitions,
            entries,
            ledger,
            ..
        } = &mut *guard;
        let competition = competitions
            .get(competition_id)
            .ok_or_else(|| Error::not_found("competition", competition_id))?;

        let now = now_millis();
        entries.record_entry(competition, external_ref, kind, eligible, now, |entry| {
            ledger
                .append_payload(
                    &EntryCreated {
                        competition_id: entry.competition_id.clone(),
                        external_ref: entry.external_ref.clone(),
                        kind: entry.kind,
                        eligible: entry.eligible,
                    },
                    actor,
                    now,
                )
                .map(|_| ())
        })
    }

    /// Void an entry. Audits of draws it already took part in are unaffected.
    pub fn void_entry(
        &self,
        operator: &str,
        competition_id: &str,
        external_ref: &str,
        reason: &str,
        actor: Actor,
    ) -> Result<VoidedEntry, Error> {
        let scope = self.scope(operator)?;
        let mut guard = lock(&scope);
        let OperatorScope {
            competitions,
            entries,
            ledger,
            ..
        } = &mut *guard;
        if !competitions.contains_key(competition_id) {
            return Err(Error::not_found("competition", competition_id));
        }

        let now = now_millis();
        let voided = entries.void_entry(competition_id, external_ref, reason, now, |voided| {
            ledger
                .append_payload(
                    &EntryVoided {
                        competition_id: voided.competition_id.clone(),
                        external_ref: voided.external_ref.clone(),
                        reason: voided.reason.clone(),
                    },
                    actor,
                    now,
                )
                .map(|_| ())
        })?;

        info!(operator, competition = competition_id, ticket = %voided.ticket, "entry voided");
        Ok(voided)
    }

    pub fn entry(&self, operator: &str, competition_id: &str, external_ref: &str) -> Result<Entry, Error> {
        let scope = self.scope(operator)?;
        let guard = lock(&scope);
        guard
            .entries
            .get(competition_id, external_ref)
            .cloned()
            .ok_or_else(|| Error::not_found("entry", format!("{competition_id}/{external_ref}")))
    }

    pub fn entries(&self, operator: &str, competition_id: &str) -> Result<Vec<Entry>, Error> {
        let scope = self.scope(operator)?;
        let guard = lock(&scope);
        guard.competition(competition_id)?;
        Ok(guard.entries.entries(competition_id).cloned().collect())
    }

    // =========================================================================
    // Draws
    // =========================================================================

    /// Draw one prize or every remaining prize of a competition.
    ///
    /// A prize whose commitment was published by an earlier, interrupted
    /// request resumes from that commitment instead of taking a new seed.
    pub fn request_draw(
        &self,
        operator: &str,
        competition_id: &str,
        target: &DrawTarget,
    ) -> Result<Vec<DrawAudit>, Error> {
        let scope = self.scope(operator)?;

        let fresh = {
            let guard = lock(&scope);
            guard
                .prizes_to_draw(competition_id, target)?
                .iter()
                .filter(|p| guard.pending_for(competition_id, p).is_none())
                .count()
        };

        // Entropy may block; keep it outside the operator lock.
        let mut seeds = (0..fresh)
            .map(|_| Seed::generate(self.entropy.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut guard = lock(&scope);
        // Recheck: a concurrent request may have drawn some of these.
        let prizes = guard.prizes_to_draw(competition_id, target)?;
        let mut exclude = BTreeSet::new();
        let mut audits = Vec::with_capacity(prizes.len());
        for prize_id in prizes {
            let committed = match guard.pending_for(competition_id, &prize_id) {
                Some(pending) => {
                    info!(
                        operator,
                        draw_id = %pending.committed.request().draw_id(),
                        prize = %prize_id,
                        excluded = pending.exclude.len(),
                        "resuming draw from published commitment"
                    );
                    // Winners the interrupted request had already excluded stay out.
                    exclude.extend(pending.exclude.iter().copied());
                    pending.committed.clone()
                }
                None => {
                    let seed = match seeds.pop() {
                        Some(seed) => seed,
                        None => Seed::generate(self.entropy.as_ref())?,
                    };
                    guard.commit(competition_id, &prize_id, seed, &exclude)?
                }
            };
            audits.push(guard.complete(committed, &mut exclude)?);
        }
        Ok(audits)
    }

    /// Public view of a completed draw, including its revealed seed.
    pub fn audit(&self, operator: &str, draw_id: &DrawId) -> Result<PublicAudit, Error> {
        let scope = self.scope(operator)?;
        let guard = lock(&scope);
        let audit = guard
            .audits
            .by_draw(draw_id)
            .ok_or_else(|| Error::not_found("draw", draw_id.to_string()))?;
        let (_, payload) = completed_event(guard.ledger.events(), draw_id)?;
        Ok(PublicAudit {
            draw_id: audit.draw_id,
            competition_id: audit.competition_id.clone(),
            prize_id: audit.prize_id.clone(),
            drawn_at: audit.drawn_at,
            total_entries: audit.total_entries,
            winning_ticket: audit.winning_ticket,
            pool_hash: audit.pool_hash,
            seed_hash: audit.seed_hash,
            revealed_seed: audit.revealed_seed.clone(),
            pool: payload.pool,
            signature_hash: audit.signature_hash,
            previous_signature_hash: audit.previous_signature_hash,
        })
    }

    // =========================================================================
    // Reads and verification
    // =========================================================================

    /// Snapshot of the operator's events.
    pub fn events(&self, operator: &str) -> Result<Vec<Event>, Error> {
        let scope = self.scope(operator)?;
        let guard = lock(&scope);
        Ok(guard.ledger.snapshot())
    }

    /// Snapshot of the operator's audits.
    pub fn audits(&self, operator: &str) -> Result<Vec<DrawAudit>, Error> {
        let scope = self.scope(operator)?;
        let guard = lock(&scope);
        Ok(guard.audits.audits().to_vec())
    }

    /// Check the event chain. Runs on a snapshot, so appends are not held up.
    pub fn verify_events(&self, operator: &str) -> Result<ChainReport, Error> {
        let (events, head) = {
            let scope = self.scope(operator)?;
            let guard = lock(&scope);
            (guard.ledger.snapshot(), guard.ledger.head().copied())
        };
        let last = events.last().map(|e| e.event_hash);
        let report = verify_chain(&events).check_head(head, last);
        log_report(operator, "events", &report);
        Ok(report)
    }

    /// Check the audit signature chain and that it covers every completed draw.
    pub fn verify_audits(&self, operator: &str) -> Result<ChainReport, Error> {
        let (events, audits) = self.history(operator)?;
        let report = verify_chain(&audits).with_unmatched_draws(unmatched_draws(&events, &audits));
        log_report(operator, "audits", &report);
        Ok(report)
    }

    /// Re-derive one draw from its ledger events and audit.
    pub fn verify_draw(&self, operator: &str, draw_id: &DrawId) -> Result<DrawVerification, Error> {
        let (events, audits) = self.history(operator)?;
        let verification = verify_draw_history(&events, &audits, draw_id)?;
        if !verification.valid {
            warn!(operator, draw_id = %draw_id, ?verification, "draw failed verification");
        }
        Ok(verification)
    }

    /// Check whether an entry was in a draw's pool.
    pub fn verify_ticket(
        &self,
        operator: &str,
        draw_id: &DrawId,
        external_ref: &str,
    ) -> Result<TicketVerification, Error> {
        let scope = self.scope(operator)?;
        let guard = lock(&scope);
        let audit = guard
            .audits
            .by_draw(draw_id)
            .ok_or_else(|| Error::not_found("draw", draw_id.to_string()))?;
        let entry = guard
            .entries
            .get(&audit.competition_id, external_ref)
            .ok_or_else(|| {
                Error::not_found("entry", format!("{}/{external_ref}", audit.competition_id))
            })?;
        let (_, payload) = completed_event(guard.ledger.events(), draw_id)?;

        Ok(TicketVerification {
            draw_id: *draw_id,
            external_ref: external_ref.to_string(),
            ticket: entry.ticket,
            in_pool: payload.pool.binary_search(&entry.ticket).is_ok(),
            won: audit.winning_ticket == Some(entry.ticket),
            pool_matches_hash: pool_hash(&payload.pool) == audit.pool_hash,
        })
    }

    fn history(&self, operator: &str) -> Result<(Vec<Event>, Vec<DrawAudit>), Error> {
        let scope = self.scope(operator)?;
        let guard = lock(&scope);
        Ok((guard.ledger.snapshot(), guard.audits.audits().to_vec()))
    }

    // =========================================================================
    // Complaints
    // =========================================================================

    /// Record a complaint raised against an operator.
    pub fn record_complaint(
        &self,
        operator: &str,
        competition_id: Option<&str>,
        reference: &str,
        summary: &str,
        actor: Actor,
    ) -> Result<Event, Error> {
        validate_identifier("complaint reference", reference)?;
        if summary.trim().is_empty() {
            return Err(Error::Validation("complaint summary must not be empty".into()));
        }
        let scope = self.scope_or_insert(operator)?;
        let mut guard = lock(&scope);
        if let Some(id) = competition_id {
            guard.competition(id)?;
        }
        let event = guard
            .ledger
            .append_payload(
                &ComplaintSubmitted {
                    competition_id: competition_id.map(str::to_string),
                    reference: reference.to_string(),
                    summary: summary.to_string(),
                },
                actor,
                now_millis(),
            )?
            .clone();
        info!(operator, reference, sequence = event.sequence, "complaint recorded");
        Ok(event)
    }

    #[cfg(test)]
    pub(crate) fn with_scope_mut<R>(&self, operator: &str, f: impl FnOnce(&mut OperatorScope) -> R) -> R {
        let scope = self.scope(operator).unwrap();
        let mut guard = lock(&scope);
        f(&mut guard)
    }
}

fn log_report(operator: &str, chain: &str, report: &ChainReport) {
    if report.is_valid() {
        info!(operator, chain, total = report.total, "chain verified");
    } else {
        warn!(
            operator,
            chain,
            total = report.total,
            verified = report.verified,
            broken_links = report.broken_links.len(),
            invalid_hashes = report.invalid_hashes.len(),
            head_mismatch = report.head_mismatch.is_some(),
            unmatched_draws = report.unmatched_draws.len(),
            "chain failed verification"
        );
    }
}

/// The `draw.completed` event of a draw.
fn completed_event<'a>(events: &'a [Event], draw_id: &DrawId) -> Result<(&'a Event, DrawCompletedPayload), Error> {
    events
        .iter()
        .filter(|e| e.event_type == EventType::DrawCompleted)
        .find_map(|e| {
            e.decode::<DrawCompletedPayload>()
                .ok()
                .filter(|p| &p.draw_id == draw_id)
                .map(|p| (e, p))
        })
        .ok_or_else(|| Error::not_found("draw", draw_id.to_string()))
}

/// Re-derive a draw from a consistent copy of the ledger and audit chain.
pub(crate) fn verify_draw_history(
    events: &[Event],
    audits: &[DrawAudit],
    draw_id: &DrawId,
) -> Result<DrawVerification, Error> {
    let audit = audits
        .iter()
        .find(|a| &a.draw_id == draw_id)
        .ok_or_else(|| Error::not_found("draw", draw_id.to_string()))?;
    let (completed, payload) = completed_event(events, draw_id)?;

    let commitment = events
        .iter()
        .filter(|e| e.event_type == EventType::SeedCommitted)
        .find_map(|e| {
            let p: SeedCommittedPayload = e.decode().ok()?;
            (&p.draw_id == draw_id).then_some((e.sequence, p))
        });
    // A resumed draw may have frozen more than once; the last freeze counts.
    let frozen = events
        .iter()
        .filter(|e| e.event_type == EventType::PoolFrozen && e.sequence < completed.sequence)
        .filter_map(|e| {
            let p: PoolFrozenPayload = e.decode().ok()?;
            (&p.draw_id == draw_id).then_some((e.sequence, p))
        })
        .last();

    let commitment_precedes_pool = match (&commitment, &frozen) {
        (Some((committed_at, _)), Some((frozen_at, _))) => committed_at < frozen_at,
        _ => false,
    };

    let seed = Seed::from_hex(&payload.seed);
    let seed_matches_commitment = match (&seed, &commitment) {
        (Some(seed), Some((_, committed))) => {
            seed.commitment() == committed.seed_hash
                && committed.seed_hash == payload.seed_hash
                && payload.seed_hash == audit.seed_hash
        }
        _ => false,
    };

    let revealed_pool_hash = pool_hash(&payload.pool);
    let pool_matches_hash = revealed_pool_hash == payload.pool_hash
        && revealed_pool_hash == audit.pool_hash
        && payload.pool.len() as u64 == audit.total_entries
        && frozen
            .as_ref()
            .is_some_and(|(_, p)| p.pool == payload.pool && p.pool_hash == revealed_pool_hash);

    let winner_reproduced = seed.as_ref().is_some_and(|seed| {
        let winner = select_winner(seed, &payload.pool);
        winner == payload.winning_ticket && winner == audit.winning_ticket
    });

    let signature_valid = audit.compute_signature() == audit.signature_hash;
    let audit_matches_event =
        audit.event_sequence == completed.sequence && audit.revealed_seed == payload.seed;

    Ok(DrawVerification {
        draw_id: *draw_id,
        commitment_precedes_pool,
        seed_matches_commitment,
        pool_matches_hash,
        winner_reproduced,
        signature_valid,
        audit_matches_event,
        valid: commitment_precedes_pool
            && seed_matches_commitment
            && pool_matches_hash
            && winner_reproduced
            && signature_valid
            && audit_matches_event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw::SEED_LEN;
    use crate::{MissingRecord, UnmatchedDraw};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Deterministic entropy that can be switched off.
    struct Switch {
        byte: u8,
        dead: AtomicBool,
    }

    impl EntropySource for Switch {
        fn fill_seed(&self, seed: &mut [u8; SEED_LEN]) -> Result<(), Error> {
            if self.dead.load(Ordering::SeqCst) {
                return Err(Error::SeedUnavailable("entropy pool exhausted".into()));
            }
            seed.fill(self.byte);
            Ok(())
        }
    }

    fn registry() -> (Registry, Arc<Switch>) {
        let entropy = Arc::new(Switch {
            byte: 5,
            dead: AtomicBool::new(false),
        });
        (Registry::new(entropy.clone()), entropy)
    }

    fn competition(reg: &Registry, prizes: &[&str], entrants: usize) {
        let prizes = prizes.iter().map(|p| Prize::new(*p, format!("{p} prize"))).collect();
        reg.create_competition("acme", "spring", "Spring Giveaway", prizes, Actor::Operator)
            .unwrap();
        for i in 0..entrants {
            reg.submit_entry("acme", "spring", &format!("order-{i}"), EntryKind::Paid, true, Actor::Operator)
                .unwrap();
        }
    }

    #[test]
    fn entries_get_sequential_tickets_and_events() {
        let (reg, _) = registry();
        competition(&reg, &["first"], 3);

        let tickets: Vec<_> = reg
            .entries("acme", "spring")
            .unwrap()
            .iter()
            .map(|e| e.ticket)
            .collect();
        assert_eq!(tickets, [TicketId(1), TicketId(2), TicketId(3)]);

        let types: Vec<_> = reg.events("acme").unwrap().iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            [
                EventType::CompetitionCreated,
                EventType::EntryCreated,
                EventType::EntryCreated,
                EventType::EntryCreated
            ]
        );
    }

    #[test]
    fn duplicate_entry_leaves_no_event() {
        let (reg, _) = registry();
        competition(&reg, &["first"], 1);
        let before = reg.events("acme").unwrap().len();
        let err = reg
            .submit_entry("acme", "spring", "order-0", EntryKind::Free, true, Actor::Operator)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateEntry { .. }));
        assert_eq!(reg.events("acme").unwrap().len(), before);
    }

    #[test]
    fn closed_competition_refuses_entries() {
        let (reg, _) = registry();
        competition(&reg, &["first"], 2);
        reg.close_competition("acme", "spring", Actor::Operator).unwrap();
        let err = reg
            .submit_entry("acme", "spring", "late", EntryKind::Paid, true, Actor::Operator)
            .unwrap_err();
        assert!(matches!(err, Error::CompetitionClosed(_)));
        assert!(matches!(
            reg.close_competition("acme", "spring", Actor::Operator),
            Err(Error::CompetitionClosed(_))
        ));
    }

    #[test]
    fn draw_emits_commit_freeze_complete_in_order() {
        let (reg, _) = registry();
        competition(&reg, &["first"], 3);
        let audits = reg
            .request_draw("acme", "spring", &DrawTarget::Prize("first".into()))
            .unwrap();
        assert_eq!(audits.len(), 1);

        let tail: Vec<_> = reg
            .events("acme")
            .unwrap()
            .iter()
            .rev()
            .take(3)
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            tail,
            [EventType::DrawCompleted, EventType::PoolFrozen, EventType::SeedCommitted]
        );
        assert_eq!(audits[0].pool_hash, Hash::of_str("1,2,3"));

        let check = reg.verify_draw("acme", &audits[0].draw_id).unwrap();
        assert!(check.valid, "{check:?}");
    }

    #[test]
    fn prize_cannot_be_drawn_twice() {
        let (reg, _) = registry();
        competition(&reg, &["first"], 2);
        reg.request_draw("acme", "spring", &DrawTarget::Prize("first".into()))
            .unwrap();
        assert!(matches!(
            reg.request_draw("acme", "spring", &DrawTarget::Prize("first".into())),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            reg.request_draw("acme", "spring", &DrawTarget::All),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn all_prizes_never_share_a_winner() {
        let (reg, _) = registry();
        competition(&reg, &["gold", "silver", "bronze"], 3);
        let audits = reg.request_draw("acme", "spring", &DrawTarget::All).unwrap();

        let winners: BTreeSet<_> = audits.iter().filter_map(|a| a.winning_ticket).collect();
        assert_eq!(winners.len(), 3);
        let prizes: Vec<_> = audits.iter().map(|a| a.prize_id.as_str()).collect();
        assert_eq!(prizes, ["gold", "silver", "bronze"]);
        assert_eq!(audits[1].total_entries, 2);
        assert_eq!(audits[2].total_entries, 1);
    }

    #[test]
    fn seed_failure_writes_nothing() {
        let (reg, entropy) = registry();
        competition(&reg, &["first"], 2);
        let before = reg.events("acme").unwrap();
        entropy.dead.store(true, Ordering::SeqCst);

        let err = reg
            .request_draw("acme", "spring", &DrawTarget::Prize("first".into()))
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(reg.events("acme").unwrap(), before);
        assert!(reg.audits("acme").unwrap().is_empty());

        entropy.dead.store(false, Ordering::SeqCst);
        assert_eq!(
            reg.request_draw("acme", "spring", &DrawTarget::Prize("first".into()))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn interrupted_draw_resumes_from_commitment() {
        let (reg, entropy) = registry();
        competition(&reg, &["first"], 2);

        // Publish the commitment by hand, as if the process died right after.
        let published = reg.with_scope_mut("acme", |scope| {
            let seed = Seed::generate(entropy.as_ref()).unwrap();
            let committed = scope.commit("spring", "first", seed, &BTreeSet::new()).unwrap();
            (committed.request().draw_id(), *committed.seed_hash())
        });

        entropy.dead.store(true, Ordering::SeqCst);
        let audits = reg
            .request_draw("acme", "spring", &DrawTarget::Prize("first".into()))
            .unwrap();
        assert_eq!(audits[0].draw_id, published.0);
        assert_eq!(audits[0].seed_hash, published.1);
        assert!(reg.with_scope_mut("acme", |scope| scope.pending().is_empty()));
        assert!(reg.verify_draw("acme", &published.0).unwrap().valid);
    }

    #[test]
    fn resumed_all_run_keeps_earlier_winners_out() {
        let (reg, entropy) = registry();
        competition(&reg, &["gold", "silver"], 2);

        // Gold completes, silver is committed, then the process dies.
        let (gold_winner, silver_draw) = reg.with_scope_mut("acme", |scope| {
            let mut exclude = BTreeSet::new();
            let seed = Seed::generate(entropy.as_ref()).unwrap();
            let gold = scope.commit("spring", "gold", seed, &exclude).unwrap();
            let gold = scope.complete(gold, &mut exclude).unwrap();
            let seed = Seed::generate(entropy.as_ref()).unwrap();
            let silver = scope.commit("spring", "silver", seed, &exclude).unwrap();
            (gold.winning_ticket.unwrap(), silver.request().draw_id())
        });

        let audits = reg.request_draw("acme", "spring", &DrawTarget::All).unwrap();
        assert_eq!(audits.len(), 1);
        let silver = &audits[0];
        assert_eq!(silver.draw_id, silver_draw);
        assert_eq!(silver.total_entries, 1);
        assert_ne!(silver.winning_ticket, Some(gold_winner));
        assert!(reg.verify_draw("acme", &silver_draw).unwrap().valid);
    }

    #[test]
    fn empty_pool_draw_has_no_winner() {
        let (reg, _) = registry();
        competition(&reg, &["first"], 0);
        let audits = reg
            .request_draw("acme", "spring", &DrawTarget::Prize("first".into()))
            .unwrap();
        assert_eq!(audits[0].winning_ticket, None);
        assert_eq!(audits[0].total_entries, 0);
        assert_eq!(audits[0].pool_hash, Hash::of_str(""));
    }

    #[test]
    fn public_audit_reveals_seed_matching_commitment() {
        let (reg, _) = registry();
        competition(&reg, &["first"], 4);
        let audit = reg
            .request_draw("acme", "spring", &DrawTarget::Prize("first".into()))
            .unwrap()
            .remove(0);
        let public = reg.audit("acme", &audit.draw_id).unwrap();
        let seed = Seed::from_hex(&public.revealed_seed).unwrap();
        assert_eq!(seed.commitment(), public.seed_hash);
        assert_eq!(select_winner(&seed, &public.pool), public.winning_ticket);
    }

    #[test]
    fn voided_entry_leaves_later_pools_but_not_earlier_audits() {
        let (reg, _) = registry();
        competition(&reg, &["first", "second"], 3);
        let first = reg
            .request_draw("acme", "spring", &DrawTarget::Prize("first".into()))
            .unwrap()
            .remove(0);
        reg.void_entry("acme", "spring", "order-1", "chargeback", Actor::Admin)
            .unwrap();
        let second = reg
            .request_draw("acme", "spring", &DrawTarget::Prize("second".into()))
            .unwrap()
            .remove(0);

        assert_eq!(first.total_entries, 3);
        assert_eq!(second.total_entries, 2);
        assert!(reg.verify_ticket("acme", &first.draw_id, "order-1").unwrap().in_pool);
        assert!(!reg.verify_ticket("acme", &second.draw_id, "order-1").unwrap().in_pool);
        assert!(reg.verify_draw("acme", &first.draw_id).unwrap().valid);
        assert!(reg.verify_audits("acme").unwrap().is_valid());
    }

    #[test]
    fn tampered_event_is_localized() {
        let (reg, _) = registry();
        competition(&reg, &["first"], 4);
        reg.with_scope_mut("acme", |scope| {
            scope.ledger_mut().events_mut()[2].payload["external_ref"] = "forged".into();
        });
        let report = reg.verify_events("acme").unwrap();
        assert!(!report.is_valid());
        assert_eq!(report.invalid_hashes[0].sequence, 3);
        assert_eq!(report.broken_links[0].sequence, 4);
    }

    #[test]
    fn removed_tail_is_reported() {
        let (reg, _) = registry();
        competition(&reg, &["first", "second"], 3);
        let first = reg
            .request_draw("acme", "spring", &DrawTarget::Prize("first".into()))
            .unwrap()
            .remove(0);
        assert!(reg.verify_events("acme").unwrap().is_valid());
        assert!(reg.verify_audits("acme").unwrap().is_valid());

        // An audit whose draw.completed event was cut off.
        reg.with_scope_mut("acme", |scope| scope.ledger_mut().events_mut().pop());
        let events = reg.verify_events("acme").unwrap();
        assert!(!events.is_valid());
        assert!(events.broken_links.is_empty());
        assert!(events.head_mismatch.is_some());
        let audits = reg.verify_audits("acme").unwrap();
        assert!(!audits.is_valid());
        assert_eq!(
            audits.unmatched_draws,
            [UnmatchedDraw {
                draw_id: first.draw_id,
                missing: MissingRecord::Event,
            }]
        );

        // Cutting the audit as well still leaves the ledger short of its head.
        reg.with_scope_mut("acme", |scope| scope.audits_mut().audits_mut().pop());
        assert!(reg.verify_events("acme").unwrap().head_mismatch.is_some());
        assert!(matches!(
            reg.request_draw("acme", "spring", &DrawTarget::Prize("second".into())),
            Err(Error::ChainDesynchronized { .. })
        ));
    }

    #[test]
    fn completed_draw_without_audit_is_reported() {
        let (reg, _) = registry();
        competition(&reg, &["first"], 2);
        let audit = reg
            .request_draw("acme", "spring", &DrawTarget::Prize("first".into()))
            .unwrap()
            .remove(0);
        reg.with_scope_mut("acme", |scope| scope.audits_mut().audits_mut().pop());

        assert!(reg.verify_events("acme").unwrap().is_valid());
        let report = reg.verify_audits("acme").unwrap();
        assert_eq!(report.status, crate::ChainStatus::Invalid);
        assert_eq!(report.total, 0);
        assert_eq!(
            report.unmatched_draws,
            [UnmatchedDraw {
                draw_id: audit.draw_id,
                missing: MissingRecord::Audit,
            }]
        );
    }

    #[test]
    fn entry_events_keep_tickets_private() {
        let (reg, _) = registry();
        competition(&reg, &["first"], 2);
        reg.void_entry("acme", "spring", "order-0", "duplicate", Actor::Admin)
            .unwrap();

        let events = reg.events("acme").unwrap();
        let entry_events: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.event_type, EventType::EntryCreated | EventType::EntryVoided))
            .collect();
        assert_eq!(entry_events.len(), 3);
        assert!(entry_events.iter().all(|e| e.payload.get("ticket").is_none()));

        // Tickets appear once a pool is frozen.
        reg.request_draw("acme", "spring", &DrawTarget::Prize("first".into()))
            .unwrap();
        let frozen = reg
            .events("acme")
            .unwrap()
            .into_iter()
            .find(|e| e.event_type == EventType::PoolFrozen)
            .unwrap();
        assert_eq!(frozen.payload["pool"], serde_json::json!([2]));
    }

    #[test]
    fn tampered_audit_fails_draw_verification() {
        let (reg, _) = registry();
        competition(&reg, &["first"], 3);
        let audit = reg
            .request_draw("acme", "spring", &DrawTarget::Prize("first".into()))
            .unwrap()
            .remove(0);
        reg.with_scope_mut("acme", |scope| {
            scope.audits_mut().audits_mut()[0].total_entries = 99;
        });
        let check = reg.verify_draw("acme", &audit.draw_id).unwrap();
        assert!(!check.valid);
        assert!(!check.signature_valid);
        assert!(!check.pool_matches_hash);
        assert!(!reg.verify_audits("acme").unwrap().is_valid());
    }

    #[test]
    fn operators_are_isolated() {
        let (reg, _) = registry();
        competition(&reg, &["first"], 1);
        reg.create_competition("globex", "spring", "Other", vec![], Actor::Operator)
            .unwrap();
        assert_eq!(reg.entries("globex", "spring").unwrap().len(), 0);
        assert_eq!(reg.operators(), ["acme", "globex"]);
        assert!(matches!(reg.events("initech"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn complaint_is_recorded_on_the_chain() {
        let (reg, _) = registry();
        competition(&reg, &["first"], 0);
        let event = reg
            .record_complaint("acme", Some("spring"), "case-17", "winner never notified", Actor::Admin)
            .unwrap();
        assert_eq!(event.event_type, EventType::ComplaintSubmitted);
        assert!(matches!(
            reg.record_complaint("acme", Some("autumn"), "case-18", "?", Actor::Admin),
            Err(Error::NotFound { .. })
        ));
        assert!(reg.verify_events("acme").unwrap().is_valid());
    }
}
