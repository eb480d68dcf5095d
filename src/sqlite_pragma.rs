//! Shared SQLite connection tuning
//!
//! Applied to every connection the store opens. WAL lets the leaderboard read
//! path run while the indexer holds a write transaction.

use rusqlite::Connection;

/// Apply optimized PRAGMAs (WAL, NORMAL sync, MEMORY temp store, busy timeout)
///
/// In-memory databases ignore `journal_mode=WAL` and stay in `memory` mode,
/// which is fine for tests.
pub fn apply_optimized_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    log::debug!("📊 SQLite pragmas applied (journal_mode={})", mode);
    Ok(())
}
