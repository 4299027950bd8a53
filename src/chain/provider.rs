//! Node client with multi-RPC support and automatic failover

use super::NodeClient;
use crate::config::NodeConfig;
use crate::error::{PipeError, PipeResult};
use crate::events::FilterKind;

use async_trait::async_trait;
use ethers::providers::{
    FilterKind as EthFilterKind, Http, Middleware, Provider, ProviderError, Ws,
};
use ethers::types::{Address, BlockNumber, Bytes, Log, Transaction, TxpoolContent, H256, U256};
use futures::StreamExt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Multi-provider node client with automatic failover
pub struct EthNodeClient {
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// WebSocket provider (optional, for push subscriptions)
    ws_provider: RwLock<Option<Provider<Ws>>>,
    ws_url: Option<String>,
    request_timeout: Duration,
}

impl EthNodeClient {
    /// Create a new node client
    pub async fn new(config: &NodeConfig) -> PipeResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider: {}", url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(PipeError::Config("No valid RPC providers".to_string()));
        }

        let client = Self {
            http_providers,
            current_provider: AtomicUsize::new(0),
            ws_provider: RwLock::new(None),
            ws_url: config.ws_url.clone(),
            request_timeout: config.request_timeout(),
        };

        // A missing websocket only disables the push subscription
        if client.ws_url.is_some() {
            if let Err(e) = client.reconnect_ws().await {
                warn!("{}", e);
            }
        }

        Ok(client)
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Node client failover to provider {}", next);
    }

    /// (Re)connect the WebSocket provider
    pub async fn reconnect_ws(&self) -> PipeResult<()> {
        let Some(ref ws_url) = self.ws_url else {
            return Ok(());
        };

        match Provider::<Ws>::connect(ws_url.as_str()).await {
            Ok(provider) => {
                *self.ws_provider.write().await = Some(provider);
                info!("WebSocket connected to {}", ws_url);
                Ok(())
            }
            Err(e) => Err(PipeError::Subscription(format!(
                "WebSocket connection to {} failed: {}",
                ws_url, e
            ))),
        }
    }

    /// Run one request against the active provider with the request timeout
    async fn timed<T, F>(&self, method: &'static str, request: F) -> PipeResult<T>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match timeout(self.request_timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(PipeError::rpc(method, e)),
            Err(_) => Err(PipeError::Timeout {
                operation: method.to_string(),
            }),
        }
    }

    /// Run a read-only request, moving to the next provider on failure
    ///
    /// Filter requests must not go through here: filter ids only exist on the
    /// node that created them.
    async fn with_failover<T, F, Fut>(&self, method: &'static str, request: F) -> PipeResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = None;

        for _ in 0..self.http_providers.len() {
            match self.timed(method, request(self.http().clone())).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{} failed: {}", method, e);
                    last_error = Some(e);
                    self.failover();
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PipeError::Internal("No RPC providers".to_string())))
    }
}

#[async_trait]
impl NodeClient for EthNodeClient {
    async fn chain_id(&self) -> PipeResult<u64> {
        let chain_id = self
            .with_failover("eth_chainId", |p| async move { p.get_chainid().await })
            .await?;
        Ok(chain_id.as_u64())
    }

    async fn transaction_count(&self, address: Address) -> PipeResult<u64> {
        let count = self
            .with_failover("eth_getTransactionCount", |p| async move {
                p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                    .await
            })
            .await?;
        Ok(count.as_u64())
    }

    async fn gas_price(&self) -> PipeResult<U256> {
        self.with_failover("eth_gasPrice", |p| async move { p.get_gas_price().await })
            .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> PipeResult<H256> {
        let pending = self
            .timed("eth_sendRawTransaction", self.http().send_raw_transaction(raw))
            .await?;
        Ok(pending.tx_hash())
    }

    async fn install_filter(&self, kind: &FilterKind) -> PipeResult<U256> {
        match kind {
            FilterKind::PendingTransactions => {
                self.timed(
                    "eth_newPendingTransactionFilter",
                    self.http().new_filter(EthFilterKind::PendingTransactions),
                )
                .await
            }
            FilterKind::Logs(query) => {
                let filter = query.to_filter()?;
                self.timed(
                    "eth_newFilter",
                    self.http().new_filter(EthFilterKind::Logs(&filter)),
                )
                .await
            }
        }
    }

    async fn uninstall_filter(&self, id: U256) -> PipeResult<bool> {
        self.timed("eth_uninstallFilter", self.http().uninstall_filter(id))
            .await
    }

    async fn pending_transaction_changes(&self, id: U256) -> PipeResult<Vec<H256>> {
        self.timed(
            "eth_getFilterChanges",
            self.http().get_filter_changes::<U256, H256>(id),
        )
        .await
    }

    async fn log_changes(&self, id: U256) -> PipeResult<Vec<Log>> {
        self.timed(
            "eth_getFilterChanges",
            self.http().get_filter_changes::<U256, Log>(id),
        )
        .await
    }

    async fn transaction_by_hash(&self, hash: H256) -> PipeResult<Option<Transaction>> {
        self.with_failover("eth_getTransactionByHash", |p| async move {
            p.get_transaction(hash).await
        })
        .await
    }

    async fn subscribe_pending_transactions(
        &self,
        capacity: usize,
    ) -> PipeResult<mpsc::Receiver<H256>> {
        let ws = self.ws_provider.read().await.clone().ok_or_else(|| {
            PipeError::Subscription("No WebSocket endpoint connected".to_string())
        })?;

        let (hash_tx, hash_rx) = mpsc::channel(capacity);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut stream = match ws.subscribe_pending_txs().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(PipeError::rpc("eth_subscribe", e)));
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = hash_tx.closed() => break,
                    next = stream.next() => match next {
                        Some(hash) => {
                            if hash_tx.send(hash).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            warn!("Pending transaction subscription ended by the node");
                            break;
                        }
                    }
                }
            }

            if let Err(e) = stream.unsubscribe().await {
                debug!("Failed to unsubscribe pending transactions: {}", e);
            }
        });

        ready_rx
            .await
            .map_err(|_| PipeError::Internal("Subscription task exited early".to_string()))??;

        info!("Subscribed to pending transactions");
        Ok(hash_rx)
    }

    async fn txpool_content(&self) -> PipeResult<TxpoolContent> {
        self.with_failover("txpool_content", |p| async move { p.txpool_content().await })
            .await
    }
}
