//! Scriptable in-memory node used by unit tests

use super::NodeClient;
use crate::error::{PipeError, PipeResult};
use crate::events::FilterKind;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, Log, Transaction, TxpoolContent, H256, U256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
pub(crate) struct FakeNode {
    pub transaction_count: AtomicU64,
    pub count_queries: AtomicUsize,
    pub count_error: Mutex<Option<String>>,
    pub gas_prices: Mutex<VecDeque<PipeResult<U256>>>,
    pub gas_queries: AtomicUsize,
    pub send_error: Mutex<Option<String>>,
    pub sent: Mutex<Vec<Bytes>>,
    pub installs: Mutex<Vec<FilterKind>>,
    pub uninstalled: Mutex<Vec<U256>>,
    pub polled_ids: Mutex<Vec<U256>>,
    pub hash_changes: Mutex<VecDeque<PipeResult<Vec<H256>>>>,
    pub log_changes: Mutex<VecDeque<PipeResult<Vec<Log>>>>,
    pub transactions: Mutex<HashMap<H256, Transaction>>,
    pub lookup_delay: Mutex<Duration>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub lookups: AtomicUsize,
    pub push_hashes: Mutex<Option<mpsc::Receiver<H256>>>,
    pub txpool: Mutex<TxpoolContent>,
}

impl FakeNode {
    pub fn with_transaction_count(count: u64) -> Self {
        let node = Self::default();
        node.transaction_count.store(count, Ordering::SeqCst);
        node
    }

    pub fn not_found() -> PipeError {
        PipeError::rpc("eth_getFilterChanges", "filter not found")
    }

    pub fn add_transaction(&self, hash: H256) {
        let tx = Transaction {
            hash,
            ..Default::default()
        };
        self.transactions.lock().unwrap().insert(hash, tx);
    }

    pub fn install_count(&self) -> usize {
        self.installs.lock().unwrap().len()
    }
}

#[async_trait]
impl NodeClient for FakeNode {
    async fn chain_id(&self) -> PipeResult<u64> {
        Ok(1337)
    }

    async fn transaction_count(&self, _address: Address) -> PipeResult<u64> {
        self.count_queries.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.count_error.lock().unwrap().clone() {
            return Err(PipeError::rpc("eth_getTransactionCount", message));
        }
        Ok(self.transaction_count.load(Ordering::SeqCst))
    }

    async fn gas_price(&self) -> PipeResult<U256> {
        self.gas_queries.fetch_add(1, Ordering::SeqCst);
        self.gas_prices
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PipeError::rpc("eth_gasPrice", "connection refused")))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> PipeResult<H256> {
        if let Some(message) = self.send_error.lock().unwrap().clone() {
            return Err(PipeError::rpc("eth_sendRawTransaction", message));
        }
        self.sent.lock().unwrap().push(raw);
        Ok(H256::repeat_byte(0x42))
    }

    async fn install_filter(&self, kind: &FilterKind) -> PipeResult<U256> {
        let mut installs = self.installs.lock().unwrap();
        installs.push(kind.clone());
        Ok(U256::from(installs.len()))
    }

    async fn uninstall_filter(&self, id: U256) -> PipeResult<bool> {
        self.uninstalled.lock().unwrap().push(id);
        Ok(true)
    }

    async fn pending_transaction_changes(&self, id: U256) -> PipeResult<Vec<H256>> {
        self.polled_ids.lock().unwrap().push(id);
        self.hash_changes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn log_changes(&self, id: U256) -> PipeResult<Vec<Log>> {
        self.polled_ids.lock().unwrap().push(id);
        self.log_changes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn transaction_by_hash(&self, hash: H256) -> PipeResult<Option<Transaction>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.lookup_delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.transactions.lock().unwrap().get(&hash).cloned())
    }

    async fn subscribe_pending_transactions(
        &self,
        _capacity: usize,
    ) -> PipeResult<mpsc::Receiver<H256>> {
        self.push_hashes
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| PipeError::Subscription("No WebSocket endpoint connected".to_string()))
    }

    async fn txpool_content(&self) -> PipeResult<TxpoolContent> {
        Ok(self.txpool.lock().unwrap().clone())
    }
}
