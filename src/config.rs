//! Runtime configuration from environment variables
//!
//! Every tunable of the pipeline (window size, endpoint, contract, event
//! signature, polling interval, scoring weights...) lives here. Binaries call
//! `GmflowConfig::from_env()` after `dotenv()`.

use crate::chain::retry::RetryPolicy;
use crate::types::normalize_address;
use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Block the GM contract was deployed at; nothing earlier can hold events
pub const DEFAULT_START_BLOCK: u64 = 7_653_631;
pub const DEFAULT_EVENT_SIGNATURE: &str = "GM(address,address)";
pub const DEFAULT_LAST_SEEN_FUNCTION: &str = "lastGM(address)";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Score weights: `sent*sent_weight + streak*streak_weight + received*received_weight`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringWeights {
    pub sent: u64,
    pub streak: u64,
    pub received: u64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            sent: 10,
            streak: 5,
            received: 2,
        }
    }
}

/// Settings consumed by the indexer
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Lower-cased contract address; also the cursor key
    pub contract_address: String,
    pub event_signature: String,
    pub last_seen_function: String,
    /// Read `lastGM(actor)` for each indexed actor
    pub read_last_seen: bool,
    pub start_block: u64,
    /// Blocks per `eth_getLogs` call
    pub window_size: u64,
    /// Max in-flight block timestamp lookups
    pub timestamp_concurrency: usize,
    pub lease_ttl_secs: i64,
    pub retry: RetryPolicy,
}

impl IndexerConfig {
    /// Defaults for a given contract
    pub fn new(contract_address: &str) -> Self {
        Self {
            contract_address: contract_address.to_lowercase(),
            event_signature: DEFAULT_EVENT_SIGNATURE.to_string(),
            last_seen_function: DEFAULT_LAST_SEEN_FUNCTION.to_string(),
            read_last_seen: true,
            start_block: DEFAULT_START_BLOCK,
            window_size: 100,
            timestamp_concurrency: 8,
            lease_ttl_secs: 300,
            retry: RetryPolicy::default(),
        }
    }
}

/// Full runtime configuration
#[derive(Debug, Clone)]
pub struct GmflowConfig {
    pub rpc_url: String,
    pub db_path: String,
    pub poll_interval_ms: u64,
    /// Base URL of the users API; `None` disables profile decoration
    pub profile_api_url: Option<String>,
    pub default_limit: usize,
    pub scoring: ScoringWeights,
    pub indexer: IndexerConfig,
}

impl GmflowConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `GMFLOW_RPC_URL` (required)
    /// - `GMFLOW_CONTRACT_ADDRESS` (required)
    /// - `GMFLOW_EVENT_SIGNATURE` (default: GM(address,address))
    /// - `GMFLOW_LAST_SEEN_FUNCTION` (default: lastGM(address))
    /// - `GMFLOW_READ_LAST_SEEN` (default: true)
    /// - `GMFLOW_START_BLOCK` (default: 7653631)
    /// - `GMFLOW_WINDOW_SIZE` (default: 100)
    /// - `GMFLOW_POLL_INTERVAL_MS` (default: 60000)
    /// - `GMFLOW_DB_PATH` (default: gmflow.db)
    /// - `GMFLOW_TIMESTAMP_CONCURRENCY` (default: 8)
    /// - `GMFLOW_RPC_TIMEOUT_MS` (default: 10000)
    /// - `GMFLOW_MAX_RETRIES` (default: 5)
    /// - `GMFLOW_BACKOFF_INITIAL_MS` (default: 500)
    /// - `GMFLOW_BACKOFF_MAX_MS` (default: 10000)
    /// - `GMFLOW_LEASE_TTL_SECS` (default: 300)
    /// - `GMFLOW_PROFILE_API_URL` (default: unset)
    /// - `GMFLOW_SCORE_WEIGHT_SENT` / `_STREAK` / `_RECEIVED` (default: 10 / 5 / 2)
    /// - `GMFLOW_DEFAULT_LIMIT` (default: 50)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rpc_url = lookup("GMFLOW_RPC_URL")
            .ok_or_else(|| ConfigError::MissingVariable("GMFLOW_RPC_URL".to_string()))?;
        if !rpc_url.starts_with("http://") && !rpc_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "GMFLOW_RPC_URL must start with http:// or https://".to_string(),
            ));
        }

        let raw_contract = lookup("GMFLOW_CONTRACT_ADDRESS")
            .ok_or_else(|| ConfigError::MissingVariable("GMFLOW_CONTRACT_ADDRESS".to_string()))?;
        let contract_address = normalize_address(&raw_contract).ok_or_else(|| {
            ConfigError::InvalidValue(format!("GMFLOW_CONTRACT_ADDRESS is not an address: {}", raw_contract))
        })?;

        let mut indexer = IndexerConfig::new(&contract_address);
        if let Some(sig) = lookup("GMFLOW_EVENT_SIGNATURE") {
            indexer.event_signature = sig;
        }
        if let Some(func) = lookup("GMFLOW_LAST_SEEN_FUNCTION") {
            indexer.last_seen_function = func;
        }
        indexer.read_last_seen = parse_or(&lookup, "GMFLOW_READ_LAST_SEEN", indexer.read_last_seen)?;
        indexer.start_block = parse_or(&lookup, "GMFLOW_START_BLOCK", indexer.start_block)?;
        indexer.window_size = parse_or(&lookup, "GMFLOW_WINDOW_SIZE", indexer.window_size)?;
        indexer.timestamp_concurrency =
            parse_or(&lookup, "GMFLOW_TIMESTAMP_CONCURRENCY", indexer.timestamp_concurrency)?;
        indexer.lease_ttl_secs = parse_or(&lookup, "GMFLOW_LEASE_TTL_SECS", indexer.lease_ttl_secs)?;
        indexer.retry = RetryPolicy {
            timeout_ms: parse_or(&lookup, "GMFLOW_RPC_TIMEOUT_MS", indexer.retry.timeout_ms)?,
            max_retries: parse_or(&lookup, "GMFLOW_MAX_RETRIES", indexer.retry.max_retries)?,
            initial_backoff_ms: parse_or(&lookup, "GMFLOW_BACKOFF_INITIAL_MS", indexer.retry.initial_backoff_ms)?,
            max_backoff_ms: parse_or(&lookup, "GMFLOW_BACKOFF_MAX_MS", indexer.retry.max_backoff_ms)?,
        };

        if indexer.window_size == 0 {
            return Err(ConfigError::InvalidValue("GMFLOW_WINDOW_SIZE must be > 0".to_string()));
        }
        if indexer.timestamp_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "GMFLOW_TIMESTAMP_CONCURRENCY must be > 0".to_string(),
            ));
        }
        if indexer.lease_ttl_secs <= 0 {
            return Err(ConfigError::InvalidValue("GMFLOW_LEASE_TTL_SECS must be > 0".to_string()));
        }

        let read_side = LeaderboardConfig::from_lookup(&lookup)?;

        Ok(Self {
            rpc_url,
            db_path: read_side.db_path,
            poll_interval_ms: parse_or(&lookup, "GMFLOW_POLL_INTERVAL_MS", 60_000)?,
            profile_api_url: read_side.profile_api_url,
            default_limit: read_side.default_limit,
            scoring: read_side.scoring,
            indexer,
        })
    }
}

/// Read-side settings for serving leaderboards from an existing database
///
/// Needs no chain endpoint or contract, so reader binaries can run without
/// `GMFLOW_RPC_URL` / `GMFLOW_CONTRACT_ADDRESS`.
#[derive(Debug, Clone)]
pub struct LeaderboardConfig {
    pub db_path: String,
    pub profile_api_url: Option<String>,
    pub profile_timeout_ms: u64,
    pub default_limit: usize,
    pub scoring: ScoringWeights,
}

impl LeaderboardConfig {
    /// Environment variables: `GMFLOW_DB_PATH`, `GMFLOW_PROFILE_API_URL`,
    /// `GMFLOW_RPC_TIMEOUT_MS` (profile request timeout),
    /// `GMFLOW_DEFAULT_LIMIT`, `GMFLOW_SCORE_WEIGHT_*`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key: &str| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ScoringWeights::default();
        let scoring = ScoringWeights {
            sent: parse_or(lookup, "GMFLOW_SCORE_WEIGHT_SENT", defaults.sent)?,
            streak: parse_or(lookup, "GMFLOW_SCORE_WEIGHT_STREAK", defaults.streak)?,
            received: parse_or(lookup, "GMFLOW_SCORE_WEIGHT_RECEIVED", defaults.received)?,
        };

        let default_limit = parse_or(lookup, "GMFLOW_DEFAULT_LIMIT", 50)?;
        if default_limit == 0 {
            return Err(ConfigError::InvalidValue("GMFLOW_DEFAULT_LIMIT must be > 0".to_string()));
        }

        Ok(Self {
            db_path: lookup("GMFLOW_DB_PATH").unwrap_or_else(|| "gmflow.db".to_string()),
            profile_api_url: lookup("GMFLOW_PROFILE_API_URL").filter(|url| !url.trim().is_empty()),
            profile_timeout_ms: parse_or(lookup, "GMFLOW_RPC_TIMEOUT_MS", RetryPolicy::default().timeout_ms)?,
            default_limit,
            scoring,
        })
    }
}

/// Parse `key` if present, otherwise fall back to `default`
///
/// A value that is present but unparsable is an error.
fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .to_lowercase()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(default),
    }
}
