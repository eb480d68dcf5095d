//! SQLite event store
//!
//! Single connection behind a mutex, WAL mode, schema embedded from `sql/`.
//! Window commits run in one `IMMEDIATE` transaction so events and the cursor
//! advance become visible together.

use super::{EventStore, WindowCommit, EMPTY_STORE_FLOOR};
use crate::error::StoreError;
use crate::sqlite_pragma::apply_optimized_pragmas;
use crate::types::{GreetingEvent, SyncCursor};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Schema files, applied in order. Every statement uses IF NOT EXISTS.
const SCHEMA_MIGRATIONS: &[(&str, &str)] = &[
    ("01_greeting_events.sql", include_str!("../../sql/01_greeting_events.sql")),
    ("02_sync_cursor.sql", include_str!("../../sql/02_sync_cursor.sql")),
];

const EVENT_COLUMNS: &str = "id, actor, recipient, block_number, log_index, occurred_at, contract_last_seen";

/// Run the embedded schema migrations (idempotent)
pub fn apply_schema(conn: &Connection) -> Result<(), StoreError> {
    log::debug!("🔧 Running schema migrations");
    for (name, sql) in SCHEMA_MIGRATIONS {
        conn.execute_batch(sql)?;
        log::debug!("   └─ ✅ {}", name);
    }
    Ok(())
}

#[derive(Clone)]
pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventStore {
    /// Open (or create) the database at `db_path` and apply the schema
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path.as_ref())?;
        apply_optimized_pragmas(&conn)?;
        apply_schema(&conn)?;

        log::info!("✅ Event store ready: {}", db_path.as_ref().display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database, mainly for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn insert_events(conn: &Connection, events: &[GreetingEvent]) -> Result<usize, StoreError> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO greeting_events
         (id, actor, recipient, block_number, log_index, occurred_at, contract_last_seen, indexed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;

    let indexed_at = now_secs();
    let mut inserted = 0;
    for event in events {
        inserted += stmt.execute(params![
            event.id,
            event.actor.to_lowercase(),
            event.recipient.to_lowercase(),
            event.block_number as i64,
            event.log_index as i64,
            event.occurred_at,
            event.contract_last_seen,
            indexed_at,
        ])?;
    }

    let duplicates = events.len() - inserted;
    if duplicates > 0 {
        log::debug!("Ignored {} duplicate event ids", duplicates);
    }
    Ok(inserted)
}

fn read_cursor(conn: &Connection, key: &str) -> Result<Option<SyncCursor>, StoreError> {
    let cursor = conn
        .query_row(
            "SELECT cursor_key, last_indexed_block, version, lease_owner, lease_expires_at
             FROM sync_cursor WHERE cursor_key = ?1",
            [key],
            |row| {
                Ok(SyncCursor {
                    key: row.get(0)?,
                    last_indexed_block: row.get::<_, i64>(1)? as u64,
                    version: row.get::<_, i64>(2)? as u64,
                    lease_owner: row.get(3)?,
                    lease_expires_at: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(cursor)
}

fn cas_cursor(
    conn: &Connection,
    key: &str,
    expected_version: u64,
    new_block: u64,
) -> Result<SyncCursor, StoreError> {
    let current = read_cursor(conn, key)?;
    let current = match current {
        Some(c) if c.version == expected_version => c,
        other => {
            return Err(StoreError::CursorConflict {
                key: key.to_string(),
                expected: expected_version,
                found: other.map(|c| c.version),
            })
        }
    };

    if new_block < current.last_indexed_block {
        return Err(StoreError::CursorRegression {
            key: key.to_string(),
            current: current.last_indexed_block,
            requested: new_block,
        });
    }

    let changed = conn.execute(
        "UPDATE sync_cursor
         SET last_indexed_block = ?1, version = version + 1, updated_at = ?2
         WHERE cursor_key = ?3 AND version = ?4",
        params![new_block as i64, now_secs(), key, expected_version as i64],
    )?;
    if changed == 0 {
        return Err(StoreError::CursorConflict {
            key: key.to_string(),
            expected: expected_version,
            found: None,
        });
    }

    read_cursor(conn, key)?.ok_or_else(|| StoreError::CursorConflict {
        key: key.to_string(),
        expected: expected_version,
        found: None,
    })
}

fn map_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<GreetingEvent> {
    Ok(GreetingEvent {
        id: row.get(0)?,
        actor: row.get(1)?,
        recipient: row.get(2)?,
        block_number: row.get::<_, i64>(3)? as u64,
        log_index: row.get::<_, i64>(4)? as u64,
        occurred_at: row.get(5)?,
        contract_last_seen: row.get(6)?,
    })
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn upsert_many(&self, events: &[GreetingEvent]) -> Result<usize, StoreError> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = insert_events(&tx, events)?;
        tx.commit()?;
        Ok(inserted)
    }

    async fn query_by_time_range(&self, min_occurred_at: Option<i64>) -> Result<Vec<GreetingEvent>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM greeting_events
             WHERE (?1 IS NULL OR occurred_at >= ?1)
             ORDER BY block_number ASC, log_index ASC",
            EVENT_COLUMNS
        ))?;

        let rows = stmt.query_map([min_occurred_at], map_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    async fn latest_block_number(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let max: Option<i64> = conn.query_row("SELECT MAX(block_number) FROM greeting_events", [], |row| {
            row.get(0)
        })?;
        Ok(max.map(|b| b as u64).unwrap_or(EMPTY_STORE_FLOOR))
    }

    async fn load_cursor(&self, key: &str) -> Result<Option<SyncCursor>, StoreError> {
        let conn = self.lock()?;
        read_cursor(&conn, key)
    }

    async fn init_cursor(&self, key: &str, last_indexed_block: u64) -> Result<SyncCursor, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO sync_cursor (cursor_key, last_indexed_block, version, updated_at)
             VALUES (?1, ?2, 0, ?3)",
            params![key, last_indexed_block as i64, now_secs()],
        )?;
        read_cursor(&conn, key)?.ok_or_else(|| StoreError::CursorConflict {
            key: key.to_string(),
            expected: 0,
            found: None,
        })
    }

    async fn advance_cursor(
        &self,
        key: &str,
        expected_version: u64,
        new_block: u64,
    ) -> Result<SyncCursor, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let cursor = cas_cursor(&tx, key, expected_version, new_block)?;
        tx.commit()?;
        Ok(cursor)
    }

    async fn commit_window(
        &self,
        key: &str,
        events: &[GreetingEvent],
        expected_version: u64,
        new_block: u64,
    ) -> Result<WindowCommit, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = insert_events(&tx, events)?;
        // A failed CAS drops `tx`, rolling the inserts back with it
        let cursor = cas_cursor(&tx, key, expected_version, new_block)?;
        tx.commit()?;
        Ok(WindowCommit { inserted, cursor })
    }

    async fn acquire_lease(&self, key: &str, owner: &str, now: i64, ttl_secs: i64) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE sync_cursor
             SET lease_owner = ?2, lease_expires_at = ?3
             WHERE cursor_key = ?1
               AND (lease_owner IS NULL OR lease_owner = ?2
                    OR lease_expires_at IS NULL OR lease_expires_at <= ?4)",
            params![key, owner, now + ttl_secs, now],
        )?;
        Ok(changed == 1)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sync_cursor SET lease_owner = NULL, lease_expires_at = NULL
             WHERE cursor_key = ?1 AND lease_owner = ?2",
            params![key, owner],
        )?;
        Ok(())
    }
}
