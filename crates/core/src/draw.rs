//! Commit-reveal draw engine.
//!
//! A draw for one prize moves through
//!
//! ```text
//! DrawRequest --commit--> SeedCommitted --freeze--> PoolFrozen --select--> Selected --reveal--> CompletedDraw
//! ```
//!
//! Each state is its own type and every transition consumes the previous
//! one. The seed exists only inside these states and leaves them only through
//! [`Selected::reveal`], so a seed cannot be produced after the pool is known
//! and the pool cannot be frozen before a seed is committed.

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::canonical::pool_material;
use crate::event::{DrawCompletedPayload, PoolFrozenPayload, SeedCommittedPayload};
use crate::{CompetitionId, DrawId, Error, Hash, PrizeId, TicketId};

/// Seed length in bytes.
pub const SEED_LEN: usize = 32;

/// Source of seed material.
pub trait EntropySource: Send + Sync {
    /// Fill `seed` with unpredictable bytes, blocking until enough entropy is
    /// available.
    fn fill_seed(&self, seed: &mut [u8; SEED_LEN]) -> Result<(), Error>;
}

/// The operating system CSPRNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill_seed(&self, seed: &mut [u8; SEED_LEN]) -> Result<(), Error> {
        OsRng
            .try_fill_bytes(seed)
            .map_err(|e| Error::SeedUnavailable(e.to_string()))
    }
}

/// A draw seed. Its `Debug` output never shows the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Seed([u8; SEED_LEN]);

impl Seed {
    pub fn generate(source: &dyn EntropySource) -> Result<Self, Error> {
        let mut bytes = [0u8; SEED_LEN];
        source.fill_seed(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// The commitment published before the pool is frozen.
    pub fn commitment(&self) -> Hash {
        Hash::of(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes: [u8; SEED_LEN] = hex::decode(s).ok()?.try_into().ok()?;
        Some(Self(bytes))
    }

    fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Seed(<sealed>)")
    }
}

impl Serialize for Seed {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Seed {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Seed::from_hex(&s).ok_or_else(|| serde::de::Error::custom("expected 64 hex characters"))
    }
}

/// `BLAKE3(join(ascending ticket ids, ","))`.
pub fn pool_hash(pool: &[TicketId]) -> Hash {
    Hash::of_str(&pool_material(pool))
}

/// Winner index for a pool of `pool_size` tickets.
///
/// `u128` from the first 16 bytes (big-endian) of `BLAKE3(seed || pool_hash)`,
/// reduced modulo `pool_size`. `None` for an empty pool.
pub fn select_index(seed: &[u8; SEED_LEN], pool_hash: &Hash, pool_size: usize) -> Option<usize> {
    if pool_size == 0 {
        return None;
    }
    let digest = Hash::of_parts(&[seed.as_slice(), pool_hash.as_bytes().as_slice()]);
    let mut head = [0u8; 16];
    head.copy_from_slice(&digest.as_bytes()[..16]);
    let value = u128::from_be_bytes(head);
    usize::try_from(value % pool_size as u128).ok()
}

/// Select the winning ticket. The index is taken over the ascending pool.
pub fn select_winner(seed: &Seed, pool: &[TicketId]) -> Option<TicketId> {
    let mut sorted = pool.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let hash = pool_hash(&sorted);
    select_index(&seed.0, &hash, sorted.len()).map(|i| sorted[i])
}

/// Which prize is being drawn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawRequest {
    draw_id: DrawId,
    competition_id: CompetitionId,
    prize_id: PrizeId,
}

impl DrawRequest {
    pub fn new(competition_id: impl Into<CompetitionId>, prize_id: impl Into<PrizeId>) -> Self {
        Self {
            draw_id: DrawId::new_v4(),
            competition_id: competition_id.into(),
            prize_id: prize_id.into(),
        }
    }

    pub fn draw_id(&self) -> DrawId {
        self.draw_id
    }

    pub fn competition_id(&self) -> &str {
        &self.competition_id
    }

    pub fn prize_id(&self) -> &str {
        &self.prize_id
    }

    /// Bind a seed to this draw.
    pub fn commit(self, seed: Seed, committed_at: u64) -> SeedCommitted {
        let seed_hash = seed.commitment();
        SeedCommitted {
            request: self,
            seed,
            seed_hash,
            committed_at,
        }
    }
}

/// A draw whose seed hash is fixed and published.
///
/// Persisted while a draw is in flight so an interrupted draw resumes from
/// the same commitment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedCommitted {
    request: DrawRequest,
    seed: Seed,
    seed_hash: Hash,
    committed_at: u64,
}

impl SeedCommitted {
    pub fn request(&self) -> &DrawRequest {
        &self.request
    }

    pub fn seed_hash(&self) -> &Hash {
        &self.seed_hash
    }

    pub fn committed_at(&self) -> u64 {
        self.committed_at
    }

    /// The `draw.seed_committed` payload.
    pub fn payload(&self) -> SeedCommittedPayload {
        SeedCommittedPayload {
            draw_id: self.request.draw_id,
            competition_id: self.request.competition_id.clone(),
            prize_id: self.request.prize_id.clone(),
            seed_hash: self.seed_hash,
            committed_at: self.committed_at,
        }
    }

    /// Fix the pool. Tickets are sorted so the hash does not depend on the
    /// order the store returned them in.
    pub fn freeze(self, mut pool: Vec<TicketId>, excluded: Vec<TicketId>) -> PoolFrozen {
        pool.sort_unstable();
        pool.dedup();
        let pool_hash = pool_hash(&pool);
        PoolFrozen {
            committed: self,
            pool,
            pool_hash,
            excluded,
        }
    }
}

/// A draw with a committed seed and a hashed pool.
#[derive(Debug)]
pub struct PoolFrozen {
    committed: SeedCommitted,
    pool: Vec<TicketId>,
    pool_hash: Hash,
    excluded: Vec<TicketId>,
}

impl PoolFrozen {
    pub fn pool(&self) -> &[TicketId] {
        &self.pool
    }

    pub fn pool_hash(&self) -> &Hash {
        &self.pool_hash
    }

    /// The `draw.pool_frozen` payload.
    pub fn payload(&self) -> PoolFrozenPayload {
        let request = &self.committed.request;
        PoolFrozenPayload {
            draw_id: request.draw_id,
            competition_id: request.competition_id.clone(),
            prize_id: request.prize_id.clone(),
            pool: self.pool.clone(),
            pool_hash: self.pool_hash,
            total_entries: self.pool.len() as u64,
            excluded: self.excluded.clone(),
        }
    }

    pub fn select(self) -> Selected {
        let winner = select_index(&self.committed.seed.0, &self.pool_hash, self.pool.len())
            .map(|i| self.pool[i]);
        Selected {
            frozen: self,
            winner,
        }
    }
}

/// A draw whose winner is determined but whose seed is still sealed.
#[derive(Debug)]
pub struct Selected {
    frozen: PoolFrozen,
    winner: Option<TicketId>,
}

impl Selected {
    pub fn winner(&self) -> Option<TicketId> {
        self.winner
    }

    /// Reveal the seed and finish the draw.
    pub fn reveal(self, drawn_at: u64) -> CompletedDraw {
        let PoolFrozen {
            committed,
            pool,
            pool_hash,
            ..
        } = self.frozen;
        CompletedDraw {
            draw_id: committed.request.draw_id,
            competition_id: committed.request.competition_id,
            prize_id: committed.request.prize_id,
            seed: committed.seed,
            seed_hash: committed.seed_hash,
            total_entries: pool.len() as u64,
            pool,
            pool_hash,
            winning_ticket: self.winner,
            drawn_at,
        }
    }
}

/// A finished draw with its seed revealed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedDraw {
    pub draw_id: DrawId,
    pub competition_id: CompetitionId,
    pub prize_id: PrizeId,
    pub seed: Seed,
    pub seed_hash: Hash,
    pub pool: Vec<TicketId>,
    pub pool_hash: Hash,
    pub total_entries: u64,
    pub winning_ticket: Option<TicketId>,
    pub drawn_at: u64,
}

impl CompletedDraw {
    /// The `draw.completed` payload.
    pub fn payload(&self) -> DrawCompletedPayload {
        DrawCompletedPayload {
            draw_id: self.draw_id,
            competition_id: self.competition_id.clone(),
            prize_id: self.prize_id.clone(),
            drawn_at: self.drawn_at,
            seed: self.seed.to_hex(),
            seed_hash: self.seed_hash,
            pool: self.pool.clone(),
            pool_hash: self.pool_hash,
            total_entries: self.total_entries,
            winning_ticket: self.winning_ticket,
        }
    }
}
