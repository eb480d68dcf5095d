//! Core data structures for indexed greeting events

use serde::{Deserialize, Serialize};

/// Zero-address sentinel marking a broadcast greeting (no specific recipient)
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Seconds per UTC day, used for day-index truncation
pub const SECONDS_PER_DAY: i64 = 86_400;

/// A greeting log as returned by the chain, before timestamp resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawGreetingLog {
    pub actor: String,
    pub recipient: String,
    pub block_number: u64,
    pub log_index: u64,
}

/// An indexed greeting event
///
/// Matches the `greeting_events` table. Addresses are lower-cased before the
/// event is constructed, so comparisons downstream are plain string equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GreetingEvent {
    pub id: String,
    pub actor: String,
    pub recipient: String,
    pub block_number: u64,
    pub log_index: u64,
    /// Unix seconds of the containing block
    pub occurred_at: i64,
    /// `lastGM(actor)` as read from the contract when the event was indexed
    pub contract_last_seen: Option<i64>,
}

impl GreetingEvent {
    /// Build an event from a raw log, normalizing address casing
    pub fn from_log(log: &RawGreetingLog, occurred_at: i64, contract_last_seen: Option<i64>) -> Self {
        Self {
            id: event_id(log.block_number, log.log_index),
            actor: log.actor.to_lowercase(),
            recipient: log.recipient.to_lowercase(),
            block_number: log.block_number,
            log_index: log.log_index,
            occurred_at,
            contract_last_seen,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient == ZERO_ADDRESS
    }
}

/// Persisted indexing progress for one contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    pub key: String,
    pub last_indexed_block: u64,
    /// Bumped on every successful compare-and-swap
    pub version: u64,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
}

/// Ranked per-actor statistics, recomputed on every query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub actor: String,
    pub sent_count: u64,
    pub received_count: u64,
    pub streak_days: u64,
    pub last_event_at: i64,
    pub score: u64,
}

/// Deterministic event id from chain position
pub fn event_id(block_number: u64, log_index: u64) -> String {
    format!("{}-{}", block_number, log_index)
}

/// UTC day index: `floor(occurred_at / 86400)`
pub fn day_index(occurred_at: i64) -> i64 {
    occurred_at.div_euclid(SECONDS_PER_DAY)
}

/// Validate and lower-case a `0x`-prefixed 20-byte hex address
///
/// Returns `None` for anything malformed.
pub fn normalize_address(address: &str) -> Option<String> {
    let trimmed = address.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))?;

    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    Some(format!("0x{}", hex_part.to_ascii_lowercase()))
}
