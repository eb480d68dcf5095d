//! JSON-RPC log source
//!
//! Talks to any EVM node over HTTP using plain JSON-RPC:
//! - `eth_blockNumber` for the current height
//! - `eth_getLogs` filtered by contract address and event topic
//! - `eth_getBlockByNumber` for block timestamps
//! - `eth_call` for the `lastGM(address)` view
//!
//! Retries are not handled here; the indexer wraps each call with
//! `retry::with_retry` so any `ChainLogSource` gets the same policy.

use super::{ChainLogSource, EventSignature};
use crate::error::SourceError;
use crate::types::RawGreetingLog;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Log entry as returned by `eth_getLogs`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub block_number: Option<String>,
    pub log_index: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub removed: bool,
}

pub struct JsonRpcLogSource {
    client: reqwest::Client,
    rpc_url: String,
    contract_address: String,
    last_seen_fn: EventSignature,
    next_id: AtomicU64,
}

impl JsonRpcLogSource {
    /// Create a new source for `contract_address` on the node at `rpc_url`
    ///
    /// `last_seen_function` is the canonical signature of the contract's
    /// last-greeting view, e.g. `lastGM(address)`.
    pub fn new(
        rpc_url: &str,
        contract_address: &str,
        last_seen_function: &str,
        request_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            rpc_url: rpc_url.to_string(),
            contract_address: contract_address.to_lowercase(),
            last_seen_fn: EventSignature::new(last_seen_function),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, SourceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        log::debug!("→ {} (id={})", method, id);

        let response = self.client.post(&self.rpc_url).json(&body).send().await?;
        let status = response.status();

        if status.as_u16() == 429 {
            return Err(SourceError::RateLimited(format!("{} returned HTTP 429", method)));
        }
        if !status.is_success() {
            return Err(SourceError::Http {
                status: status.as_u16(),
                message: format!("{} failed", method),
            });
        }

        let parsed: RpcResponse = response.json().await?;
        if let Some(err) = parsed.error {
            let lowered = err.message.to_lowercase();
            if lowered.contains("rate limit") || lowered.contains("too many requests") {
                return Err(SourceError::RateLimited(err.message));
            }
            return Err(SourceError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ChainLogSource for JsonRpcLogSource {
    async fn current_height(&self) -> Result<u64, SourceError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let hex = result
            .as_str()
            .ok_or_else(|| SourceError::Decode("eth_blockNumber result is not a string".to_string()))?;
        parse_hex_u64(hex)
    }

    async fn get_logs(
        &self,
        event: &EventSignature,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawGreetingLog>, SourceError> {
        let filter = json!([{
            "address": self.contract_address,
            "topics": [event.topic],
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": format!("0x{:x}", to_block),
        }]);

        let result = self.call("eth_getLogs", filter).await?;
        let entries: Vec<LogEntry> = serde_json::from_value(result)
            .map_err(|e| SourceError::Decode(format!("eth_getLogs: {}", e)))?;

        let mut logs = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(log) = decode_greeting_log(&entry)? {
                logs.push(log);
            }
        }
        Ok(logs)
    }

    async fn get_block_timestamp(&self, block_number: u64) -> Result<Option<i64>, SourceError> {
        let result = self
            .call(
                "eth_getBlockByNumber",
                json!([format!("0x{:x}", block_number), false]),
            )
            .await?;

        if result.is_null() {
            return Ok(None);
        }

        let hex = result
            .get("timestamp")
            .and_then(Value::as_str)
            .ok_or_else(|| SourceError::Decode(format!("block {} has no timestamp", block_number)))?;
        let ts = parse_hex_u64(hex)?;
        i64::try_from(ts)
            .map(Some)
            .map_err(|_| SourceError::Decode(format!("block {} timestamp out of range", block_number)))
    }

    async fn last_seen(&self, actor: &str) -> Result<Option<i64>, SourceError> {
        let data = encode_address_call(self.last_seen_fn.selector(), actor)?;
        let result = self
            .call(
                "eth_call",
                json!([{ "to": self.contract_address, "data": data }, "latest"]),
            )
            .await?;

        let hex = result
            .as_str()
            .ok_or_else(|| SourceError::Decode("eth_call result is not a string".to_string()))?;
        let value = decode_uint256_as_u64(hex)?;
        Ok(match value {
            0 => None,
            v => i64::try_from(v).ok(),
        })
    }
}

/// Decode one `eth_getLogs` entry into a greeting log
///
/// Returns `Ok(None)` for entries that should be skipped: removed by a reorg,
/// still pending, or not shaped like `GM(address indexed, address indexed)`.
pub fn decode_greeting_log(entry: &LogEntry) -> Result<Option<RawGreetingLog>, SourceError> {
    if entry.removed {
        log::debug!("Skipping removed log: {:?}", entry);
        return Ok(None);
    }

    let (Some(block_hex), Some(index_hex)) = (&entry.block_number, &entry.log_index) else {
        log::debug!("Skipping pending log without block position");
        return Ok(None);
    };

    if entry.topics.len() < 3 {
        log::warn!(
            "⚠️  Skipping log at block {} with {} topics (expected 3)",
            block_hex,
            entry.topics.len()
        );
        return Ok(None);
    }

    Ok(Some(RawGreetingLog {
        actor: topic_to_address(&entry.topics[1])?,
        recipient: topic_to_address(&entry.topics[2])?,
        block_number: parse_hex_u64(block_hex)?,
        log_index: parse_hex_u64(index_hex)?,
    }))
}

/// Parse a `0x`-prefixed hex quantity
pub fn parse_hex_u64(hex: &str) -> Result<u64, SourceError> {
    let digits = hex.strip_prefix("0x").unwrap_or(hex);
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16).map_err(|e| SourceError::Decode(format!("'{}': {}", hex, e)))
}

/// Extract the address from a 32-byte indexed topic (last 20 bytes)
pub fn topic_to_address(topic: &str) -> Result<String, SourceError> {
    let digits = topic.strip_prefix("0x").unwrap_or(topic);
    if digits.len() != 64 || hex::decode(digits).is_err() {
        return Err(SourceError::Decode(format!("malformed address topic '{}'", topic)));
    }
    Ok(format!("0x{}", digits[24..].to_lowercase()))
}

/// ABI-encode a single-address call: selector + left-padded address
fn encode_address_call(selector: &str, address: &str) -> Result<String, SourceError> {
    let addr = address.strip_prefix("0x").unwrap_or(address);
    let bytes = hex::decode(addr).map_err(|e| SourceError::Decode(format!("address '{}': {}", address, e)))?;
    if bytes.len() != 20 {
        return Err(SourceError::Decode(format!("address '{}' is not 20 bytes", address)));
    }
    Ok(format!("{}{:0>64}", selector, addr.to_lowercase()))
}

/// Decode a 32-byte return word, rejecting values that do not fit in u64
fn decode_uint256_as_u64(hex: &str) -> Result<u64, SourceError> {
    let bytes = hex::decode(hex.strip_prefix("0x").unwrap_or(hex))
        .map_err(|e| SourceError::Decode(format!("eth_call result: {}", e)))?;
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() != 32 {
        return Err(SourceError::Decode(format!("eth_call returned {} bytes", bytes.len())));
    }
    if bytes[..24].iter().any(|b| *b != 0) {
        return Err(SourceError::Decode("uint256 overflows u64".to_string()));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[24..]);
    Ok(u64::from_be_bytes(word))
}
