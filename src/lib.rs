//! # gmflow
//!
//! Indexes on-chain greeting (`GM`) events into SQLite and ranks actors on
//! daily, weekly and all-time leaderboards.
//!
//! ## Module Organization
//!
//! - `chain` - JSON-RPC log source, event signature hashing, retry/backoff
//! - `store` - event store trait and SQLite implementation with sync cursor
//! - `indexer` - windowed, resumable, idempotent ingestion
//! - `scheduler` - periodic indexer trigger with cancellation
//! - `aggregator` - timeframe filtering, streaks, scoring, ranking
//! - `profile` - optional display-name lookup for leaderboard entries
//! - `leaderboard` - ranked response assembly for consumers
//! - `config` - environment configuration
//! - `error` - typed errors for every layer

pub mod aggregator;
pub mod chain;
pub mod config;
pub mod error;
pub mod indexer;
pub mod leaderboard;
pub mod profile;
pub mod scheduler;
pub mod sqlite_pragma;
pub mod store;
pub mod types;

pub use aggregator::{Aggregator, Timeframe};
pub use config::{GmflowConfig, IndexerConfig, LeaderboardConfig, ScoringWeights};
pub use error::{IndexerError, LeaderboardError, SourceError, StoreError};
pub use indexer::{Indexer, SyncReport};
pub use leaderboard::{LeaderboardResponse, LeaderboardService, RankedEntry};
pub use store::{EventStore, SqliteEventStore};
pub use types::{GreetingEvent, LeaderboardEntry, SyncCursor};
