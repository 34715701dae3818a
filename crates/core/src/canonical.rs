//! Canonical encodings behind every published digest.
//!
//! Third parties recompute these hashes from the public record, so the byte
//! layouts here are fixed:
//!
//! ```text
//! pool      = join(ascending decimal ticket ids, ",")
//! signature = join([competition_id, prize_id, draw_id, drawn_at_ms,
//!                   total_entries, winning_ticket | "", pool_hash,
//!                   seed_hash, previous_signature_hash | ""], "|")
//! event     = CBOR map { sequence, event_type, actor, timestamp_ms,
//!                        payload (object keys sorted), previous_event_hash | null }
//! ```
//!
//! Hashes inside these layouts are lowercase hex. Identifiers never contain a
//! delimiter (see [`validate_identifier`]), so no escaping exists.

use ciborium::Value as Cbor;
use serde_json::Value as Json;

use crate::{Error, Hash, TicketId};

/// Separates ticket ids in the pool layout.
pub const POOL_DELIMITER: &str = ",";

/// Separates fields in the signature layout.
pub const FIELD_DELIMITER: &str = "|";

/// Longest identifier accepted anywhere in a canonical layout.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Reject identifiers that would make a canonical layout ambiguous.
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Err(Error::Validation(format!("{kind} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::Validation(format!(
            "{kind} exceeds {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    if value.contains(POOL_DELIMITER)
        || value.contains(FIELD_DELIMITER)
        || value.chars().any(char::is_control)
    {
        return Err(Error::Validation(format!(
            "{kind} {value:?} contains a reserved delimiter or control character"
        )));
    }
    Ok(())
}

/// The pool layout. Input order does not matter; duplicates are kept.
pub fn pool_material(pool: &[TicketId]) -> String {
    let mut sorted = pool.to_vec();
    sorted.sort_unstable();
    sorted
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(POOL_DELIMITER)
}

/// Fields bound by a draw audit signature, in layout order.
#[derive(Clone, Copy, Debug)]
pub struct SignatureFields<'a> {
    pub competition_id: &'a str,
    pub prize_id: &'a str,
    pub draw_id: &'a str,
    pub drawn_at: u64,
    pub total_entries: u64,
    pub winning_ticket: Option<TicketId>,
    pub pool_hash: &'a Hash,
    pub seed_hash: &'a Hash,
    pub previous_signature_hash: Option<&'a Hash>,
}

/// The signature layout.
pub fn signature_material(fields: &SignatureFields<'_>) -> String {
    [
        fields.competition_id.to_string(),
        fields.prize_id.to_string(),
        fields.draw_id.to_string(),
        fields.drawn_at.to_string(),
        fields.total_entries.to_string(),
        fields
            .winning_ticket
            .map(|t| t.to_string())
            .unwrap_or_default(),
        fields.pool_hash.to_hex(),
        fields.seed_hash.to_hex(),
        fields
            .previous_signature_hash
            .map(Hash::to_hex)
            .unwrap_or_default(),
    ]
    .join(FIELD_DELIMITER)
}

/// Fields bound by an event hash.
#[derive(Clone, Copy, Debug)]
pub struct EventFields<'a> {
    pub sequence: u64,
    pub event_type: &'a str,
    pub actor: &'a str,
    pub timestamp: u64,
    pub payload: &'a Json,
    pub previous_event_hash: Option<&'a Hash>,
}

/// The event layout, CBOR-encoded.
pub fn event_material(fields: &EventFields<'_>) -> Result<Vec<u8>, Error> {
    let doc = Cbor::Map(vec![
        (text("sequence"), Cbor::Integer(fields.sequence.into())),
        (text("event_type"), text(fields.event_type)),
        (text("actor"), text(fields.actor)),
        (text("timestamp_ms"), Cbor::Integer(fields.timestamp.into())),
        (text("payload"), json_to_cbor(fields.payload)),
        (
            text("previous_event_hash"),
            fields
                .previous_event_hash
                .map_or(Cbor::Null, |h| Cbor::Text(h.to_hex())),
        ),
    ]);

    let mut buf = Vec::new();
    ciborium::into_writer(&doc, &mut buf)?;
    Ok(buf)
}

fn text(s: &str) -> Cbor {
    Cbor::Text(s.to_string())
}

/// Convert JSON to CBOR with object keys sorted bytewise, independent of how
/// `serde_json` orders its maps.
fn json_to_cbor(value: &Json) -> Cbor {
    match value {
        Json::Null => Cbor::Null,
        Json::Bool(b) => Cbor::Bool(*b),
        Json::Number(n) => {
            if let Some(u) = n.as_u64() {
                Cbor::Integer(u.into())
            } else if let Some(i) = n.as_i64() {
                Cbor::Integer(i.into())
            } else {
                n.as_f64().map_or(Cbor::Null, Cbor::Float)
            }
        }
        Json::String(s) => Cbor::Text(s.clone()),
        Json::Array(items) => Cbor::Array(items.iter().map(json_to_cbor).collect()),
        Json::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            Cbor::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (Cbor::Text(k.clone()), json_to_cbor(v)))
                    .collect(),
            )
        }
    }
}
