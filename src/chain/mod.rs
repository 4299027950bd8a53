//! Chain module - the node RPC boundary and the streams built on top of it
//!
//! This module provides:
//! - The `NodeClient` trait every component talks to
//! - An `ethers`-backed client with multi-RPC failover
//! - The filter polling engine that turns node filters into streams
//! - The bounded-concurrency pending transaction fanout

pub mod fanout;
pub mod filter;
pub mod provider;

#[cfg(test)]
pub(crate) mod fake;

pub use fanout::PendingTxFanout;
pub use filter::{FilterPoller, FilterSpec, LogFilter, PendingTransactionFilter, Subscription};
pub use provider::EthNodeClient;

use crate::error::PipeResult;
use crate::events::FilterKind;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, Log, Transaction, TxpoolContent, H256, U256};
use tokio::sync::mpsc;

/// Request/response surface of a ledger node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Chain id used for replay-protected signing
    async fn chain_id(&self) -> PipeResult<u64>;

    /// Transaction count of `address` at the pending block
    async fn transaction_count(&self, address: Address) -> PipeResult<u64>;

    async fn gas_price(&self) -> PipeResult<U256>;

    /// Submit a signed, RLP-encoded transaction
    async fn send_raw_transaction(&self, raw: Bytes) -> PipeResult<H256>;

    /// Create a node-side filter and return its id
    async fn install_filter(&self, kind: &FilterKind) -> PipeResult<U256>;

    async fn uninstall_filter(&self, id: U256) -> PipeResult<bool>;

    /// Changes since the last poll of a pending transaction filter
    async fn pending_transaction_changes(&self, id: U256) -> PipeResult<Vec<H256>>;

    /// Changes since the last poll of a log filter
    async fn log_changes(&self, id: U256) -> PipeResult<Vec<Log>>;

    async fn transaction_by_hash(&self, hash: H256) -> PipeResult<Option<Transaction>>;

    /// Push subscription of pending transaction hashes, if the node offers one
    async fn subscribe_pending_transactions(
        &self,
        capacity: usize,
    ) -> PipeResult<mpsc::Receiver<H256>>;

    /// Snapshot of the node's transaction pool
    async fn txpool_content(&self) -> PipeResult<TxpoolContent>;
}
