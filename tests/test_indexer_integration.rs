//! Integration tests for the indexer against a scripted chain
//!
//! Run with: cargo test --test test_indexer_integration

use async_trait::async_trait;
use gmflow::chain::retry::RetryPolicy;
use gmflow::chain::{ChainLogSource, EventSignature};
use gmflow::config::IndexerConfig;
use gmflow::error::{IndexerError, SourceError};
use gmflow::indexer::Indexer;
use gmflow::scheduler::run_indexer_loop;
use gmflow::store::{EventStore, SqliteEventStore};
use gmflow::types::{event_id, RawGreetingLog, ZERO_ADDRESS};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const CONTRACT: &str = "0x1C0A2B3C4D5E6F708192A3B4C5D6E7F809102030";
const GENESIS_TIME: i64 = 1_700_000_000;
const BLOCK_TIME: i64 = 12;

fn block_time(block: u64) -> i64 {
    GENESIS_TIME + block as i64 * BLOCK_TIME
}

fn address(n: u64) -> String {
    format!("0xABCDEF{:034x}", n)
}

/// In-memory chain with knobs for failure injection
struct ScriptedChain {
    height: AtomicU64,
    logs: Mutex<Vec<RawGreetingLog>>,
    /// `get_logs` fails (non-retryable) for any window containing this block
    fail_logs_at: Mutex<Option<u64>>,
    /// `get_block_timestamp` fails (transport error) for this block
    fail_timestamp_at: Mutex<Option<u64>>,
    /// Remaining `current_height` calls that fail with a retryable error
    transient_height_failures: AtomicUsize,
    /// Blocks the node claims not to know
    unknown_blocks: Mutex<HashSet<u64>>,
    deliver_twice: AtomicBool,
    last_seen_fails: AtomicBool,
    /// Cancel this token once `get_logs` has been called this many times
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    get_logs_calls: AtomicUsize,
    requested_ranges: Mutex<Vec<(u64, u64)>>,
}

impl ScriptedChain {
    fn new(height: u64, logs: Vec<RawGreetingLog>) -> Self {
        Self {
            height: AtomicU64::new(height),
            logs: Mutex::new(logs),
            fail_logs_at: Mutex::new(None),
            fail_timestamp_at: Mutex::new(None),
            transient_height_failures: AtomicUsize::new(0),
            unknown_blocks: Mutex::new(HashSet::new()),
            deliver_twice: AtomicBool::new(false),
            last_seen_fails: AtomicBool::new(false),
            cancel_after: Mutex::new(None),
            get_logs_calls: AtomicUsize::new(0),
            requested_ranges: Mutex::new(Vec::new()),
        }
    }

    fn all_ids(&self) -> BTreeSet<String> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .map(|log| event_id(log.block_number, log.log_index))
            .collect()
    }
}

#[async_trait]
impl ChainLogSource for ScriptedChain {
    async fn current_height(&self) -> Result<u64, SourceError> {
        let remaining = self.transient_height_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_height_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SourceError::RateLimited("too many requests".into()));
        }
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn get_logs(
        &self,
        _event: &EventSignature,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawGreetingLog>, SourceError> {
        let calls = self.get_logs_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requested_ranges.lock().unwrap().push((from_block, to_block));

        if let Some((after, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if calls >= *after {
                token.cancel();
            }
        }

        if let Some(bad) = *self.fail_logs_at.lock().unwrap() {
            if bad >= from_block && bad <= to_block {
                return Err(SourceError::Http {
                    status: 400,
                    message: "query returned more than 10000 results".into(),
                });
            }
        }

        let mut logs: Vec<RawGreetingLog> = self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| log.block_number >= from_block && log.block_number <= to_block)
            .cloned()
            .collect();

        if self.deliver_twice.load(Ordering::SeqCst) {
            let copy = logs.clone();
            logs.extend(copy);
        }
        Ok(logs)
    }

    async fn get_block_timestamp(&self, block_number: u64) -> Result<Option<i64>, SourceError> {
        if *self.fail_timestamp_at.lock().unwrap() == Some(block_number) {
            return Err(SourceError::Transport("connection reset by peer".into()));
        }
        if self.unknown_blocks.lock().unwrap().contains(&block_number) {
            return Ok(None);
        }
        Ok(Some(block_time(block_number)))
    }

    async fn last_seen(&self, _actor: &str) -> Result<Option<i64>, SourceError> {
        if self.last_seen_fails.load(Ordering::SeqCst) {
            return Err(SourceError::Rpc {
                code: 3,
                message: "execution reverted".into(),
            });
        }
        Ok(Some(GENESIS_TIME))
    }
}

/// One greeting every `every` blocks up to `height`, alternating broadcast and direct
fn generate_logs(height: u64, every: u64) -> Vec<RawGreetingLog> {
    (1..=height)
        .filter(|b| b % every == 0)
        .enumerate()
        .map(|(i, block)| RawGreetingLog {
            actor: address(i as u64 % 5),
            recipient: if i % 2 == 0 {
                ZERO_ADDRESS.to_string()
            } else {
                address((i as u64 + 1) % 5)
            },
            block_number: block,
            log_index: i as u64 % 3,
        })
        .collect()
}

fn test_config(window_size: u64) -> IndexerConfig {
    let mut config = IndexerConfig::new(CONTRACT);
    config.start_block = 1;
    config.window_size = window_size;
    config.timestamp_concurrency = 4;
    config.retry = RetryPolicy {
        timeout_ms: 1_000,
        max_retries: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
    };
    config
}

fn build(chain: &Arc<ScriptedChain>, store: &Arc<SqliteEventStore>, window_size: u64) -> Indexer {
    Indexer::new(chain.clone(), store.clone(), test_config(window_size))
}

async fn stored_ids(store: &SqliteEventStore) -> BTreeSet<String> {
    store
        .query_by_time_range(None)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect()
}

#[tokio::test]
async fn test_complete_regardless_of_window_size() {
    let logs = generate_logs(250, 3);
    for window_size in [1, 7, 100, 1_000] {
        let chain = Arc::new(ScriptedChain::new(250, logs.clone()));
        let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
        let indexer = build(&chain, &store, window_size);

        let report = indexer.sync().await.unwrap();

        assert!(report.is_caught_up(), "window size {}", window_size);
        assert_eq!(report.cursor, 250);
        assert_eq!(report.events_inserted, logs.len());
        assert_eq!(stored_ids(&store).await, chain.all_ids(), "window size {}", window_size);

        let expected_windows = (250 + window_size as usize - 1) / window_size as usize;
        assert_eq!(report.windows_committed, expected_windows);

        let cursor = indexer.cursor().await.unwrap().unwrap();
        assert_eq!(cursor.last_indexed_block, 250);
        assert!(cursor.lease_owner.is_none(), "lease released after sync");
    }
}

#[tokio::test]
async fn test_events_carry_block_time_and_lowercase_addresses() {
    let chain = Arc::new(ScriptedChain::new(20, generate_logs(20, 10)));
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
    build(&chain, &store, 5).sync().await.unwrap();

    let events = store.query_by_time_range(None).await.unwrap();
    assert_eq!(events.len(), 2);
    for event in &events {
        assert_eq!(event.occurred_at, block_time(event.block_number));
        assert_eq!(event.actor, event.actor.to_lowercase());
        assert_eq!(event.recipient, event.recipient.to_lowercase());
        assert_eq!(event.contract_last_seen, Some(GENESIS_TIME));
    }
    assert!(events.windows(2).all(|w| w[0].block_number <= w[1].block_number));
}

#[tokio::test]
async fn test_second_sync_is_a_no_op() {
    let chain = Arc::new(ScriptedChain::new(120, generate_logs(120, 4)));
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
    let indexer = build(&chain, &store, 50);

    let first = indexer.sync().await.unwrap();
    let before = stored_ids(&store).await;
    let calls = chain.get_logs_calls.load(Ordering::SeqCst);

    let second = indexer.sync().await.unwrap();
    assert_eq!(second.windows_committed, 0);
    assert_eq!(second.events_inserted, 0);
    assert_eq!(second.cursor, first.cursor);
    assert_eq!(stored_ids(&store).await, before);
    assert_eq!(chain.get_logs_calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_resumes_after_chain_grows() {
    let all = generate_logs(300, 7);
    let chain = Arc::new(ScriptedChain::new(150, all.clone()));
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
    let indexer = build(&chain, &store, 40);

    indexer.sync().await.unwrap();
    let early = stored_ids(&store).await;
    assert!(early.len() < all.len());

    chain.height.store(300, Ordering::SeqCst);
    chain.requested_ranges.lock().unwrap().clear();
    let report = indexer.sync().await.unwrap();

    assert_eq!(report.start_block, 151);
    assert_eq!(report.cursor, 300);
    assert_eq!(stored_ids(&store).await, chain.all_ids());
    let ranges = chain.requested_ranges.lock().unwrap().clone();
    assert_eq!(ranges.first(), Some(&(151, 190)));
    assert_eq!(ranges.last(), Some(&(271, 300)));
}

#[tokio::test]
async fn test_empty_windows_still_advance_cursor() {
    let logs = vec![RawGreetingLog {
        actor: address(1),
        recipient: ZERO_ADDRESS.to_string(),
        block_number: 3,
        log_index: 0,
    }];
    let chain = Arc::new(ScriptedChain::new(500, logs));
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());

    let report = build(&chain, &store, 100).sync().await.unwrap();

    assert_eq!(report.windows_committed, 5);
    assert_eq!(report.events_inserted, 1);
    assert_eq!(report.cursor, 500);
}

#[tokio::test]
async fn test_partial_failure_keeps_committed_windows() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("gm.db");
    let logs = generate_logs(300, 5);

    let chain = Arc::new(ScriptedChain::new(300, logs.clone()));
    *chain.fail_logs_at.lock().unwrap() = Some(150);
    let store = Arc::new(SqliteEventStore::open(&db_path).unwrap());
    let indexer = build(&chain, &store, 100);

    let err = indexer.sync().await.unwrap_err();
    assert!(matches!(err, IndexerError::Source(SourceError::Http { status: 400, .. })));

    let cursor = indexer.cursor().await.unwrap().unwrap();
    assert_eq!(cursor.last_indexed_block, 100, "only the first window committed");
    assert!(cursor.lease_owner.is_none(), "lease released on failure");
    let first_window: BTreeSet<String> = logs
        .iter()
        .filter(|l| l.block_number <= 100)
        .map(|l| event_id(l.block_number, l.log_index))
        .collect();
    assert_eq!(stored_ids(&store).await, first_window);

    // Fresh process against the same database file
    drop(indexer);
    drop(store);
    *chain.fail_logs_at.lock().unwrap() = None;
    let store = Arc::new(SqliteEventStore::open(&db_path).unwrap());
    let report = build(&chain, &store, 100).sync().await.unwrap();

    assert_eq!(report.start_block, 101);
    assert_eq!(report.cursor, 300);
    assert_eq!(stored_ids(&store).await, chain.all_ids());
}

#[tokio::test]
async fn test_timestamp_failure_aborts_window_and_resumes() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("gm.db");
    let logs = generate_logs(300, 10);

    let chain = Arc::new(ScriptedChain::new(300, logs.clone()));
    *chain.fail_timestamp_at.lock().unwrap() = Some(150);
    let store = Arc::new(SqliteEventStore::open(&db_path).unwrap());
    let indexer = build(&chain, &store, 100);

    let err = indexer.sync().await.unwrap_err();
    assert!(matches!(err, IndexerError::Source(SourceError::Transport(_))));

    let cursor = indexer.cursor().await.unwrap().unwrap();
    assert_eq!(cursor.last_indexed_block, 100);
    assert!(cursor.lease_owner.is_none(), "lease released on failure");
    assert_eq!(stored_ids(&store).await.len(), 10, "nothing from the failed window");

    drop(indexer);
    drop(store);
    *chain.fail_timestamp_at.lock().unwrap() = None;
    chain.requested_ranges.lock().unwrap().clear();
    let store = Arc::new(SqliteEventStore::open(&db_path).unwrap());
    let report = build(&chain, &store, 100).sync().await.unwrap();

    assert_eq!(report.start_block, 101);
    assert_eq!(chain.requested_ranges.lock().unwrap().first(), Some(&(101, 200)));
    assert_eq!(report.cursor, 300);
    assert_eq!(report.events_inserted, 20);
    assert_eq!(stored_ids(&store).await, chain.all_ids());
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let chain = Arc::new(ScriptedChain::new(50, generate_logs(50, 5)));
    chain.transient_height_failures.store(2, Ordering::SeqCst);
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());

    let report = build(&chain, &store, 25).sync().await.unwrap();
    assert_eq!(report.cursor, 50);
}

#[tokio::test]
async fn test_retries_exhausted_surfaces_error() {
    let chain = Arc::new(ScriptedChain::new(50, generate_logs(50, 5)));
    chain.transient_height_failures.store(10, Ordering::SeqCst);
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
    let indexer = build(&chain, &store, 25);

    let err = indexer.sync().await.unwrap_err();
    assert!(matches!(err, IndexerError::Source(SourceError::RateLimited(_))));
    assert_eq!(indexer.cursor().await.unwrap().unwrap().last_indexed_block, 0);
}

#[tokio::test]
async fn test_leased_cursor_reports_busy() {
    let chain = Arc::new(ScriptedChain::new(50, generate_logs(50, 5)));
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
    let indexer = build(&chain, &store, 25);
    let key = indexer.cursor_key().to_string();

    store.init_cursor(&key, 0).await.unwrap();
    let now = chrono::Utc::now().timestamp();
    assert!(store.acquire_lease(&key, "someone-else", now, 300).await.unwrap());

    assert!(matches!(indexer.sync().await, Err(IndexerError::Busy { .. })));
    assert_eq!(chain.get_logs_calls.load(Ordering::SeqCst), 0);

    store.release_lease(&key, "someone-else").await.unwrap();
    assert_eq!(indexer.sync().await.unwrap().cursor, 50);
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let chain = Arc::new(ScriptedChain::new(50, generate_logs(50, 5)));
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
    let indexer = build(&chain, &store, 25);
    let key = indexer.cursor_key().to_string();

    store.init_cursor(&key, 0).await.unwrap();
    let long_ago = chrono::Utc::now().timestamp() - 3_600;
    assert!(store.acquire_lease(&key, "crashed-indexer", long_ago, 300).await.unwrap());

    assert_eq!(indexer.sync().await.unwrap().cursor, 50);
}

#[tokio::test]
async fn test_cancelled_before_start_changes_nothing() {
    let chain = Arc::new(ScriptedChain::new(100, generate_logs(100, 5)));
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
    let indexer = build(&chain, &store, 10);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = indexer.sync_with_cancel(&cancel).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.windows_committed, 0);
    assert_eq!(report.cursor, 0);
    assert!(stored_ids(&store).await.is_empty());
}

#[tokio::test]
async fn test_cancellation_stops_at_window_boundary() {
    let logs = generate_logs(100, 5);
    let chain = Arc::new(ScriptedChain::new(100, logs.clone()));
    let cancel = CancellationToken::new();
    *chain.cancel_after.lock().unwrap() = Some((3, cancel.clone()));
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
    let indexer = build(&chain, &store, 10);

    let report = indexer.sync_with_cancel(&cancel).await.unwrap();

    // The window in flight when cancellation fired still commits
    assert!(report.cancelled);
    assert_eq!(report.windows_committed, 3);
    assert_eq!(report.cursor, 30);
    let expected: BTreeSet<String> = logs
        .iter()
        .filter(|l| l.block_number <= 30)
        .map(|l| event_id(l.block_number, l.log_index))
        .collect();
    assert_eq!(stored_ids(&store).await, expected);

    // Resuming picks up at the next window
    *chain.cancel_after.lock().unwrap() = None;
    let report = indexer.sync().await.unwrap();
    assert_eq!(report.start_block, 31);
    assert_eq!(stored_ids(&store).await, chain.all_ids());
}

#[tokio::test]
async fn test_duplicate_deliveries_collapse() {
    let logs = generate_logs(60, 3);
    let chain = Arc::new(ScriptedChain::new(60, logs.clone()));
    chain.deliver_twice.store(true, Ordering::SeqCst);
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());

    let report = build(&chain, &store, 20).sync().await.unwrap();

    assert_eq!(report.logs_fetched, logs.len() * 2);
    assert_eq!(report.events_inserted, logs.len());
    assert_eq!(stored_ids(&store).await.len(), logs.len());
}

#[tokio::test]
async fn test_unknown_block_falls_back_to_wall_clock() {
    let logs = vec![RawGreetingLog {
        actor: address(2),
        recipient: ZERO_ADDRESS.to_string(),
        block_number: 7,
        log_index: 1,
    }];
    let chain = Arc::new(ScriptedChain::new(10, logs));
    chain.unknown_blocks.lock().unwrap().insert(7);
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());

    let before = chrono::Utc::now().timestamp();
    build(&chain, &store, 10).sync().await.unwrap();
    let after = chrono::Utc::now().timestamp();

    let events = store.query_by_time_range(None).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].occurred_at >= before && events[0].occurred_at <= after);
}

#[tokio::test]
async fn test_last_seen_failure_leaves_field_empty() {
    let chain = Arc::new(ScriptedChain::new(30, generate_logs(30, 10)));
    chain.last_seen_fails.store(true, Ordering::SeqCst);
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());

    let report = build(&chain, &store, 30).sync().await.unwrap();
    assert_eq!(report.events_inserted, 3);

    let events = store.query_by_time_range(None).await.unwrap();
    assert!(events.iter().all(|e| e.contract_last_seen.is_none()));
}

#[tokio::test]
async fn test_cursor_starts_after_existing_events() {
    let chain = Arc::new(ScriptedChain::new(100, generate_logs(100, 10)));
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());

    // Events indexed before the cursor existed
    let seeded = gmflow::types::GreetingEvent::from_log(
        &RawGreetingLog {
            actor: address(9),
            recipient: ZERO_ADDRESS.to_string(),
            block_number: 60,
            log_index: 0,
        },
        block_time(60),
        None,
    );
    store.upsert_many(&[seeded]).await.unwrap();

    let report = build(&chain, &store, 100).sync().await.unwrap();
    assert_eq!(report.start_block, 61);
    assert_eq!(chain.requested_ranges.lock().unwrap().first(), Some(&(61, 100)));
}

#[tokio::test]
async fn test_start_block_skips_pre_deployment_history() {
    let chain = Arc::new(ScriptedChain::new(100, generate_logs(100, 10)));
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
    let mut config = test_config(100);
    config.start_block = 51;

    let report = Indexer::new(chain.clone(), store.clone(), config).sync().await.unwrap();
    assert_eq!(report.start_block, 51);
    assert_eq!(report.events_inserted, 5);
}

#[tokio::test]
async fn test_scheduler_loop_syncs_until_cancelled() {
    let chain = Arc::new(ScriptedChain::new(80, generate_logs(80, 4)));
    let store = Arc::new(SqliteEventStore::open_in_memory().unwrap());
    let indexer = Arc::new(build(&chain, &store, 20));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run_indexer_loop(indexer.clone(), 10, cancel.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    chain.height.store(120, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let stats = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(stats.ticks >= 2);
    assert_eq!(stats.failed, 0);
    assert_eq!(indexer.cursor().await.unwrap().unwrap().last_indexed_block, 120);
}
