//! # Chain Log Source
//!
//! Abstraction over the remote EVM node. The indexer only needs four calls:
//! current height, ranged greeting logs, block timestamps, and the contract's
//! `lastGM(address)` view. Every call may fail transiently; implementations
//! must have no side effects so the retry layer can re-issue them freely.
//!
//! ## Module Organization
//!
//! - `retry` - per-call timeouts and capped exponential backoff
//! - `rpc` - JSON-RPC over HTTP implementation (`eth_getLogs` et al.)

pub mod retry;
pub mod rpc;

use crate::error::SourceError;
use crate::types::RawGreetingLog;
use async_trait::async_trait;
use sha3::{Digest, Keccak256};

pub use rpc::JsonRpcLogSource;

/// A Solidity event or function signature with its keccak256 hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSignature {
    /// Canonical form, e.g. `GM(address,address)`
    pub signature: String,
    /// `0x`-prefixed keccak256 of the signature (topic0 for events)
    pub topic: String,
}

impl EventSignature {
    pub fn new(signature: &str) -> Self {
        let signature: String = signature.chars().filter(|c| !c.is_whitespace()).collect();
        let topic = format!("0x{}", hex::encode(keccak256(signature.as_bytes())));
        Self { signature, topic }
    }

    /// First four bytes of the hash, as used for function selectors
    pub fn selector(&self) -> &str {
        &self.topic[..10]
    }
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Remote ledger access needed by the indexer
#[async_trait]
pub trait ChainLogSource: Send + Sync {
    /// Latest block height known to the node
    async fn current_height(&self) -> Result<u64, SourceError>;

    /// Greeting logs in `[from_block, to_block]` (inclusive)
    ///
    /// Callers keep the range within the node's per-call limit.
    async fn get_logs(
        &self,
        event: &EventSignature,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawGreetingLog>, SourceError>;

    /// Unix timestamp of a block, `None` if the node does not know the block
    async fn get_block_timestamp(&self, block_number: u64) -> Result<Option<i64>, SourceError>;

    /// The contract's last-greeting timestamp for `actor`, `None` if never set
    async fn last_seen(&self, actor: &str) -> Result<Option<i64>, SourceError>;
}
