//! fairdraw-core: tamper-evident ledger and commit-reveal draw engine for
//! prize competitions.
//!
//! The crate is built from four pieces:
//! - `EventChain`: an append-only, hash-linked event log per operator
//! - `EntryStore`: tickets and their void markers
//! - `draw`: seed commitment, pool freezing and deterministic selection
//! - `AuditChain`: one signed audit per prize draw, itself hash-linked
//!
//! `Registry` ties them together behind an operator-scoped facade, and
//! `verify_chain` checks either chain without writing to it.

mod hash;
mod error;
pub mod canonical;
mod competition;
mod entry;
pub mod event;
mod ledger;
pub mod draw;
mod audit;
mod verify;
mod registry;
mod snapshot;

pub use hash::Hash;
pub use error::Error;
pub use competition::{Competition, CompetitionStatus, Prize};
pub use entry::{Entry, EntryKind, EntryStore, TicketId, VoidMarker, VoidedEntry};
pub use event::{Actor, Event, EventPayload, EventType};
pub use ledger::EventChain;
pub use draw::{EntropySource, OsEntropy};
pub use audit::{AuditChain, DrawAudit, build_audit};
pub use verify::{
    BrokenLink, ChainReport, ChainStatus, Chained, HeadMismatch, InvalidHash, MissingRecord,
    UnmatchedDraw, unmatched_draws, verify_chain,
};
pub use registry::{
    DrawTarget, DrawVerification, OperatorScope, PendingDraw, PublicAudit, Registry,
    TicketVerification,
};
pub use snapshot::{SNAPSHOT_VERSION, Snapshot};

pub type OperatorId = String;
pub type CompetitionId = String;
pub type PrizeId = String;
pub type DrawId = uuid::Uuid;

/// Milliseconds since the Unix epoch, or 0 if the clock is before it.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
