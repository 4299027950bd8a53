//! Caller-facing entry point tying the node client, submission path and
//! streams together

use crate::chain::{
    EthNodeClient, FilterPoller, LogFilter, NodeClient, PendingTransactionFilter, PendingTxFanout,
    Subscription,
};
use crate::config::{Settings, StreamConfig, WalletConfig};
use crate::error::{PipeError, PipeResult};
use crate::events::LogQuery;
use crate::tx::{GasPriceSource, NonceManager, NoncePolicy, TransactionRequest, TransactionSubmitter};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, Log, Transaction, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Transaction submission and event streams against one node
pub struct Pipeline {
    node: Arc<dyn NodeClient>,
    wallet: Option<LocalWallet>,
    nonces: Arc<NonceManager>,
    gas: Arc<GasPriceSource>,
    submitter: TransactionSubmitter,
    streams: StreamConfig,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Connect to the configured node and load the wallet, if one is set
    pub async fn connect(settings: &Settings) -> PipeResult<Self> {
        let node: Arc<dyn NodeClient> = Arc::new(EthNodeClient::new(&settings.node).await?);
        let wallet = load_wallet(&settings.wallet)?;
        Self::new(node, wallet, settings).await
    }

    pub async fn new(
        node: Arc<dyn NodeClient>,
        wallet: Option<LocalWallet>,
        settings: &Settings,
    ) -> PipeResult<Self> {
        let cancel = CancellationToken::new();

        let nonces = Arc::new(NonceManager::new(
            node.clone(),
            NoncePolicy::from(&settings.nonce),
            cancel.child_token(),
        ));
        let gas = Arc::new(
            GasPriceSource::from_config(node.clone(), &settings.gas, cancel.child_token()).await,
        );
        let submitter = TransactionSubmitter::new(node.clone(), nonces.clone(), gas.clone()).await?;

        if let Some(ref wallet) = wallet {
            info!("Pipeline ready with wallet {:?}", wallet.address());
        } else {
            info!("Pipeline ready without a wallet, submissions need an explicit signer");
        }

        Ok(Self {
            node,
            wallet,
            nonces,
            gas,
            submitter,
            streams: settings.streams.clone(),
            cancel,
        })
    }

    pub fn wallet_address(&self) -> Option<Address> {
        self.wallet.as_ref().map(|wallet| wallet.address())
    }

    /// Sign with the configured wallet and send
    pub async fn execute_transaction(
        &self,
        to: Option<Address>,
        data: Bytes,
        value: U256,
        gas_price: Option<U256>,
        gas_limit: Option<U256>,
    ) -> PipeResult<H256> {
        let wallet = self
            .wallet
            .clone()
            .ok_or_else(|| PipeError::Wallet("No wallet configured".to_string()))?;

        let request = TransactionRequest {
            to,
            data,
            value,
            signer: wallet,
        };
        self.submitter.execute(request, gas_price, gas_limit).await
    }

    /// Send a request carrying its own signer
    pub async fn submit(
        &self,
        request: TransactionRequest,
        gas_price: Option<U256>,
        gas_limit: Option<U256>,
    ) -> PipeResult<H256> {
        self.submitter.execute(request, gas_price, gas_limit).await
    }

    pub async fn get_nonce(&self, account: Address, force_refresh: bool) -> PipeResult<u64> {
        self.nonces.next(account, force_refresh).await
    }

    /// Re-read an account's nonce from the node without handing it out
    pub async fn sync_nonce(&self, account: Address) -> PipeResult<u64> {
        self.nonces.resync(account).await
    }

    pub fn gas_price(&self) -> U256 {
        self.gas.gas_price()
    }

    pub fn gas_limit(&self) -> U256 {
        self.gas.gas_limit()
    }

    /// Stream logs matching `query`, polled every `poll_interval`
    pub fn start_log_stream(&self, query: LogQuery, poll_interval: Duration) -> PipeResult<Subscription<Log>> {
        let spec = LogFilter::new(query)?;
        Ok(FilterPoller::new(self.node.clone(), spec, poll_interval, self.streams.queue_capacity)
            .spawn(self.cancel.child_token()))
    }

    /// Stream pending transaction hashes from a node filter
    pub fn start_pending_tx_stream(&self, poll_interval: Duration) -> Subscription<H256> {
        FilterPoller::new(
            self.node.clone(),
            PendingTransactionFilter,
            poll_interval,
            self.streams.queue_capacity,
        )
        .spawn(self.cancel.child_token())
    }

    /// Stream full pending transactions resolved from a node filter
    pub fn start_pending_tx_fanout(&self, poll_interval: Duration) -> Subscription<Transaction> {
        let hashes = self.start_pending_tx_stream(poll_interval);
        self.fanout().spawn(hashes, self.cancel.child_token())
    }

    /// Stream full pending transactions from the node's push subscription
    pub async fn subscribe_pending_transactions(&self) -> PipeResult<Subscription<Transaction>> {
        let hashes = self
            .node
            .subscribe_pending_transactions(self.streams.queue_capacity)
            .await?;
        Ok(self
            .fanout()
            .spawn(ReceiverStream::new(hashes), self.cancel.child_token()))
    }

    /// Pending and queued transactions currently in the node's pool
    pub async fn pending_pool_transactions<F>(&self, filter: F) -> PipeResult<Vec<Transaction>>
    where
        F: Fn(&Transaction) -> bool,
    {
        let content = self.node.txpool_content().await?;

        Ok(content
            .pending
            .into_values()
            .chain(content.queued.into_values())
            .flat_map(|by_nonce| by_nonce.into_values())
            .filter(|tx| filter(tx))
            .collect())
    }

    /// Stop every background task started by this pipeline
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.gas.shutdown().await;
        self.nonces.shutdown().await;
        info!("Pipeline stopped");
    }

    fn fanout(&self) -> PendingTxFanout {
        PendingTxFanout::new(
            self.node.clone(),
            self.streams.fanout_concurrency,
            self.streams.queue_capacity,
        )
    }
}

/// Load the signing key from the configured environment variable
pub fn load_wallet(config: &WalletConfig) -> PipeResult<Option<LocalWallet>> {
    match std::env::var(&config.private_key_env) {
        Ok(key) => key
            .trim()
            .parse::<LocalWallet>()
            .map(Some)
            .map_err(|e| PipeError::Wallet(format!("Invalid private key in {}: {}", config.private_key_env, e))),
        Err(_) => Ok(None),
    }
}
