//! Incremental greeting indexer
//!
//! Brings the event store to parity with the chain head, one fixed-size block
//! window at a time:
//!
//! 1. Take the advisory lease on the cursor (single-flight per contract)
//! 2. Split `[cursor + 1, head]` into windows of `window_size` blocks
//! 3. Per window: fetch logs, resolve block timestamps with bounded
//!    parallelism, build events, then commit events + cursor atomically
//! 4. Release the lease
//!
//! A failure inside a window aborts it without moving the cursor; windows
//! committed before it stay committed, so the next invocation resumes at the
//! failed window. Cancellation is only checked between windows.

use crate::chain::retry::with_retry;
use crate::chain::{ChainLogSource, EventSignature};
use crate::config::IndexerConfig;
use crate::error::{IndexerError, SourceError};
use crate::store::EventStore;
use crate::types::{GreetingEvent, RawGreetingLog, SyncCursor};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Inclusive block range processed as one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockWindow {
    pub from: u64,
    pub to: u64,
}

/// Split `[start, end]` into consecutive windows of at most `size` blocks
pub fn plan_windows(start: u64, end: u64, size: u64) -> Vec<BlockWindow> {
    let size = size.max(1);
    let mut windows = Vec::new();
    let mut from = start;
    while from <= end {
        let to = from.saturating_add(size - 1).min(end);
        windows.push(BlockWindow { from, to });
        if to == u64::MAX {
            break;
        }
        from = to + 1;
    }
    windows
}

/// Outcome of one `sync` invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// First block this invocation tried to index
    pub start_block: u64,
    /// Chain height observed at the start
    pub target_height: u64,
    pub windows_committed: usize,
    pub logs_fetched: usize,
    /// Events new to the store (duplicates excluded)
    pub events_inserted: usize,
    /// Cursor position when the invocation finished
    pub cursor: u64,
    /// Stopped early because cancellation was requested
    pub cancelled: bool,
}

impl SyncReport {
    pub fn is_caught_up(&self) -> bool {
        self.cursor >= self.target_height
    }
}

pub struct Indexer {
    source: Arc<dyn ChainLogSource>,
    store: Arc<dyn EventStore>,
    config: IndexerConfig,
    event: EventSignature,
    owner_id: String,
}

impl Indexer {
    pub fn new(source: Arc<dyn ChainLogSource>, store: Arc<dyn EventStore>, config: IndexerConfig) -> Self {
        let event = EventSignature::new(&config.event_signature);
        let owner_id = format!("gmflow-{}-{:016x}", std::process::id(), rand::random::<u64>());
        log::debug!("Indexer {} watching {} for {} ({})", owner_id, config.contract_address, event.signature, event.topic);

        Self {
            source,
            store,
            config,
            event,
            owner_id,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn cursor_key(&self) -> &str {
        &self.config.contract_address
    }

    /// Current persisted cursor, if indexing ever started
    pub async fn cursor(&self) -> Result<Option<SyncCursor>, IndexerError> {
        Ok(self.store.load_cursor(self.cursor_key()).await?)
    }

    /// Index everything up to the current chain height
    pub async fn sync(&self) -> Result<SyncReport, IndexerError> {
        self.sync_with_cancel(&CancellationToken::new()).await
    }

    /// Like `sync`, stopping at the next window boundary once `cancel` fires
    pub async fn sync_with_cancel(&self, cancel: &CancellationToken) -> Result<SyncReport, IndexerError> {
        let key = self.cursor_key();
        self.ensure_cursor().await?;

        if !self
            .store
            .acquire_lease(key, &self.owner_id, now_secs(), self.config.lease_ttl_secs)
            .await?
        {
            log::info!("⏸️  Cursor {} is leased by another indexer, skipping", key);
            return Err(IndexerError::Busy { key: key.to_string() });
        }

        let result = self.run_windows(cancel).await;

        if let Err(e) = self.store.release_lease(key, &self.owner_id).await {
            log::warn!("⚠️  Failed to release lease on {}: {}", key, e);
        }

        result
    }

    /// Create the cursor on first run
    ///
    /// Starts just before the deployment block, or after whatever the store
    /// already holds if events were indexed before the cursor existed.
    async fn ensure_cursor(&self) -> Result<SyncCursor, IndexerError> {
        let key = self.cursor_key();
        if let Some(cursor) = self.store.load_cursor(key).await? {
            return Ok(cursor);
        }

        let floor = self.config.start_block.saturating_sub(1);
        let latest = self.store.latest_block_number().await?;
        let initial = floor.max(latest);
        log::info!("🆕 Initializing cursor {} at block {}", key, initial);
        Ok(self.store.init_cursor(key, initial).await?)
    }

    async fn run_windows(&self, cancel: &CancellationToken) -> Result<SyncReport, IndexerError> {
        let key = self.cursor_key();
        let mut cursor = self
            .store
            .load_cursor(key)
            .await?
            .ok_or_else(|| IndexerError::CursorConflict { key: key.to_string() })?;

        let height = with_retry(&self.config.retry, "eth_blockNumber", || self.source.current_height()).await?;

        let start = cursor.last_indexed_block + 1;
        let mut report = SyncReport {
            start_block: start,
            target_height: height,
            windows_committed: 0,
            logs_fetched: 0,
            events_inserted: 0,
            cursor: cursor.last_indexed_block,
            cancelled: false,
        };

        if start > height {
            log::debug!("No new blocks (cursor {}, head {})", cursor.last_indexed_block, height);
            return Ok(report);
        }

        let windows = plan_windows(start, height, self.config.window_size);
        log::info!(
            "🔄 Indexing blocks {}..={} in {} window(s) of {}",
            start,
            height,
            windows.len(),
            self.config.window_size
        );

        for window in windows {
            if cancel.is_cancelled() {
                log::info!("🛑 Cancellation requested, stopping at block {}", cursor.last_indexed_block);
                report.cancelled = true;
                break;
            }

            // Renew per window; a long catch-up can outlast the TTL
            if !self
                .store
                .acquire_lease(key, &self.owner_id, now_secs(), self.config.lease_ttl_secs)
                .await?
            {
                log::warn!("⚠️  Lost lease on {} at block {}", key, cursor.last_indexed_block);
                return Err(IndexerError::Busy { key: key.to_string() });
            }

            let (events, logs_fetched) = self.fetch_window(window).await.map_err(|e| {
                log::error!(
                    "❌ Window {}..={} aborted: {} (cursor stays at {})",
                    window.from,
                    window.to,
                    e,
                    cursor.last_indexed_block
                );
                e
            })?;

            let commit = self
                .store
                .commit_window(key, &events, cursor.version, window.to)
                .await
                .map_err(|e| {
                    log::error!("❌ Commit of window {}..={} failed: {}", window.from, window.to, e);
                    IndexerError::from(e)
                })?;
            cursor = commit.cursor;

            report.windows_committed += 1;
            report.logs_fetched += logs_fetched;
            report.events_inserted += commit.inserted;
            report.cursor = cursor.last_indexed_block;

            log::info!(
                "✅ Window {}..={}: {} logs, {} new events, cursor → {}",
                window.from,
                window.to,
                logs_fetched,
                commit.inserted,
                cursor.last_indexed_block
            );
        }

        Ok(report)
    }

    /// Fetch and materialize one window's events without touching the store
    async fn fetch_window(&self, window: BlockWindow) -> Result<(Vec<GreetingEvent>, usize), IndexerError> {
        let logs = with_retry(&self.config.retry, "eth_getLogs", || {
            self.source.get_logs(&self.event, window.from, window.to)
        })
        .await?;
        let fetched = logs.len();

        let logs: Vec<RawGreetingLog> = logs
            .into_iter()
            .filter(|log| {
                let inside = log.block_number >= window.from && log.block_number <= window.to;
                if !inside {
                    log::warn!(
                        "⚠️  Dropping log at block {} outside requested window {}..={}",
                        log.block_number,
                        window.from,
                        window.to
                    );
                }
                inside
            })
            .collect();

        if logs.is_empty() {
            return Ok((Vec::new(), fetched));
        }

        let blocks: BTreeSet<u64> = logs.iter().map(|log| log.block_number).collect();
        let timestamps = self.resolve_timestamps(blocks).await?;

        let last_seen = if self.config.read_last_seen {
            let actors: BTreeSet<String> = logs.iter().map(|log| log.actor.to_lowercase()).collect();
            self.resolve_last_seen(actors).await
        } else {
            HashMap::new()
        };

        // Keyed by chain position: drops duplicate deliveries and sorts
        let mut events: BTreeMap<(u64, u64), GreetingEvent> = BTreeMap::new();
        for log in &logs {
            let Some(occurred_at) = timestamps.get(&log.block_number).copied() else {
                return Err(SourceError::Decode(format!("no timestamp resolved for block {}", log.block_number)).into());
            };
            let seen = last_seen.get(&log.actor.to_lowercase()).copied().flatten();
            events
                .entry((log.block_number, log.log_index))
                .or_insert_with(|| GreetingEvent::from_log(log, occurred_at, seen));
        }

        if events.len() < logs.len() {
            log::debug!("Collapsed {} duplicate logs in window", logs.len() - events.len());
        }

        Ok((events.into_values().collect(), fetched))
    }

    /// Block number → unix timestamp for every block in `blocks`
    ///
    /// Blocks the node reports as unknown fall back to wall-clock now. Any
    /// remote failure fails the whole resolution.
    async fn resolve_timestamps(&self, blocks: BTreeSet<u64>) -> Result<HashMap<u64, i64>, IndexerError> {
        let source = Arc::clone(&self.source);
        let policy = self.config.retry;

        let results = bounded_fan_out(blocks.into_iter().collect(), self.config.timestamp_concurrency, move |&block| {
            let source = Arc::clone(&source);
            async move {
                with_retry(&policy, "eth_getBlockByNumber", || source.get_block_timestamp(block)).await
            }
        })
        .await;

        let mut resolved = HashMap::with_capacity(results.len());
        for (block, result) in results {
            match result? {
                Some(ts) => {
                    resolved.insert(block, ts);
                }
                None => {
                    let fallback = now_secs();
                    log::warn!(
                        "⚠️  Block {} timestamp unresolved, falling back to wall clock {}",
                        block,
                        fallback
                    );
                    resolved.insert(block, fallback);
                }
            }
        }
        Ok(resolved)
    }

    /// Actor → `lastGM` value; failures only cost the optional field
    async fn resolve_last_seen(&self, actors: BTreeSet<String>) -> HashMap<String, Option<i64>> {
        let source = Arc::clone(&self.source);
        let policy = self.config.retry;

        let results = bounded_fan_out(actors.into_iter().collect(), self.config.timestamp_concurrency, move |actor: &String| {
            let source = Arc::clone(&source);
            let actor = actor.clone();
            async move { with_retry(&policy, "eth_call lastGM", || source.last_seen(&actor)).await }
        })
        .await;

        results
            .into_iter()
            .map(|(actor, result)| {
                let value = match result {
                    Ok(value) => value,
                    Err(e) => {
                        log::warn!("⚠️  lastGM({}) unavailable: {}", actor, e);
                        None
                    }
                };
                (actor, value)
            })
            .collect()
    }
}

/// Run `f` for every key with at most `concurrency` calls in flight
///
/// Results come back in completion order. A task that panics drops out of the
/// results; callers treat a missing key as unresolved.
async fn bounded_fan_out<K, V, F, Fut>(keys: Vec<K>, concurrency: usize, f: F) -> Vec<(K, Result<V, SourceError>)>
where
    K: Send + 'static,
    V: Send + 'static,
    F: Fn(&K) -> Fut,
    Fut: Future<Output = Result<V, SourceError>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for key in keys {
        let permits = Arc::clone(&semaphore);
        let call = f(&key);
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            (key, call.await)
        });
    }

    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(pair) => results.push(pair),
            Err(e) => log::error!("❌ Lookup task failed: {}", e),
        }
    }
    results
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
