//! Error types shared across the indexing and leaderboard pipeline
//!
//! Remote failures (`SourceError`) are classified so the retry layer knows
//! which ones are worth another attempt. Store failures (`StoreError`) abort
//! the window being committed. `LeaderboardError` is the only error the read
//! path ever surfaces.

use thiserror::Error;

/// Failure talking to the chain log source
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The call did not finish within the configured timeout
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// The node told us to slow down (HTTP 429 or a rate-limit RPC code)
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Non-success HTTP status
    #[error("http status {status}: {message}")]
    Http { status: u16, message: String },

    /// Connection reset, DNS failure, TLS failure...
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON-RPC error object returned by the node
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Response could not be decoded into the expected shape
    #[error("decode error: {0}")]
    Decode(String),
}

impl SourceError {
    /// Whether retrying the same call could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Timeout(_) | SourceError::RateLimited(_) | SourceError::Transport(_) => {
                true
            }
            SourceError::Http { status, .. } => *status >= 500,
            // -32005 is the de-facto "limit exceeded" code, -32603 covers
            // overloaded nodes returning internal errors
            SourceError::Rpc { code, .. } => matches!(code, -32005 | -32603),
            SourceError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Timeout(0)
        } else if err.is_decode() {
            SourceError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            SourceError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SourceError::Transport(err.to_string())
        }
    }
}

/// Failure reading or writing the event store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Compare-and-swap on the cursor lost against another writer
    #[error("cursor '{key}' version conflict: expected {expected}, found {found:?}")]
    CursorConflict {
        key: String,
        expected: u64,
        found: Option<u64>,
    },

    /// Refused to move the cursor backwards
    #[error("cursor '{key}' cannot move from block {current} back to {requested}")]
    CursorRegression {
        key: String,
        current: u64,
        requested: u64,
    },

    #[error("store connection lock poisoned")]
    LockPoisoned,
}

/// Failure of a single indexer invocation
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("chain source failure: {0}")]
    Source(#[from] SourceError),

    #[error("persistence failure: {0}")]
    Persistence(StoreError),

    /// Another indexer instance holds the cursor lease
    #[error("cursor '{key}' is leased by another indexer")]
    Busy { key: String },

    /// Another writer advanced the cursor underneath us
    #[error("cursor '{key}' was advanced concurrently")]
    CursorConflict { key: String },
}

impl From<StoreError> for IndexerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CursorConflict { key, .. } => IndexerError::CursorConflict { key },
            other => IndexerError::Persistence(other),
        }
    }
}

/// Failure building a leaderboard
#[derive(Debug, Error)]
pub enum LeaderboardError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

/// Failure of the external profile lookup; never escapes the leaderboard service
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("profile service error: {0}")]
    Service(String),
}
