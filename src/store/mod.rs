//! # Event Store
//!
//! Durable, append-mostly collection of greeting events keyed by deterministic
//! id, plus the versioned sync cursor the indexer advances.
//!
//! ## Guarantees
//!
//! - `upsert_many` is idempotent on id: re-inserting an existing event is a
//!   no-op and does not count as inserted
//! - `commit_window` makes a window's events and the cursor advance visible
//!   together, or not at all
//! - Cursor updates are compare-and-swap on `version` and never move backwards
//! - Committed writes are visible to subsequent reads (read-after-write)
//!
//! ## Module Organization
//!
//! - `sqlite` - rusqlite implementation (WAL mode, embedded schema)

pub mod sqlite;

use crate::error::StoreError;
use crate::types::{GreetingEvent, SyncCursor};
use async_trait::async_trait;

pub use sqlite::SqliteEventStore;

/// `latest_block_number` for an empty store
pub const EMPTY_STORE_FLOOR: u64 = 0;

/// Result of committing one indexing window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCommit {
    /// Events that were new to the store
    pub inserted: usize,
    pub cursor: SyncCursor,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert events, ignoring ids already present
    ///
    /// Returns how many events were actually new.
    async fn upsert_many(&self, events: &[GreetingEvent]) -> Result<usize, StoreError>;

    /// Events with `occurred_at >= min_occurred_at` (all events for `None`),
    /// ordered by block number then log index
    async fn query_by_time_range(&self, min_occurred_at: Option<i64>) -> Result<Vec<GreetingEvent>, StoreError>;

    /// Highest indexed block, `EMPTY_STORE_FLOOR` when empty
    async fn latest_block_number(&self) -> Result<u64, StoreError>;

    async fn load_cursor(&self, key: &str) -> Result<Option<SyncCursor>, StoreError>;

    /// Create the cursor at `last_indexed_block` unless it already exists,
    /// then return the stored record
    async fn init_cursor(&self, key: &str, last_indexed_block: u64) -> Result<SyncCursor, StoreError>;

    /// Compare-and-swap the cursor to `new_block`
    ///
    /// Fails with `CursorConflict` if the stored version is not
    /// `expected_version`, and with `CursorRegression` if `new_block` is behind
    /// the stored block.
    async fn advance_cursor(
        &self,
        key: &str,
        expected_version: u64,
        new_block: u64,
    ) -> Result<SyncCursor, StoreError>;

    /// Upsert a window's events and advance the cursor as one unit
    ///
    /// The default runs the two steps in sequence; the cursor only moves after
    /// the events are stored. Transactional backends override it.
    async fn commit_window(
        &self,
        key: &str,
        events: &[GreetingEvent],
        expected_version: u64,
        new_block: u64,
    ) -> Result<WindowCommit, StoreError> {
        let inserted = self.upsert_many(events).await?;
        let cursor = self.advance_cursor(key, expected_version, new_block).await?;
        Ok(WindowCommit { inserted, cursor })
    }

    /// Take or renew the advisory lease on the cursor record
    ///
    /// Succeeds if the lease is free, expired at `now`, or already held by
    /// `owner`. The cursor must exist.
    async fn acquire_lease(&self, key: &str, owner: &str, now: i64, ttl_secs: i64) -> Result<bool, StoreError>;

    /// Drop the lease if `owner` holds it
    async fn release_lease(&self, key: &str, owner: &str) -> Result<(), StoreError>;
}
