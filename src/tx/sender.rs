//! Transaction submission: nonce, gas, sign, send

use super::gas::GasPriceSource;
use super::nonce::NonceManager;
use crate::chain::NodeClient;
use crate::error::{PipeError, PipeResult};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest as LegacyRequest, H256, U256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One transaction to submit, consumed by [`TransactionSubmitter::execute`]
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    /// Recipient; `None` deploys a contract
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
    pub signer: LocalWallet,
}

impl TransactionRequest {
    pub fn new(signer: LocalWallet) -> Self {
        Self {
            to: None,
            data: Bytes::default(),
            value: U256::zero(),
            signer,
        }
    }

    pub fn to(mut self, to: Address) -> Self {
        self.to = Some(to);
        self
    }

    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    pub fn value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn from(&self) -> Address {
        self.signer.address()
    }
}

/// Builds, signs and sends single transactions
///
/// No retries: a stale nonce re-anchors the sequencer once and the error still
/// goes back to the caller.
pub struct TransactionSubmitter {
    node: Arc<dyn NodeClient>,
    chain_id: u64,
    nonces: Arc<NonceManager>,
    gas: Arc<GasPriceSource>,
}

impl TransactionSubmitter {
    /// Create a submitter, reading the chain id from the node
    pub async fn new(
        node: Arc<dyn NodeClient>,
        nonces: Arc<NonceManager>,
        gas: Arc<GasPriceSource>,
    ) -> PipeResult<Self> {
        let chain_id = node.chain_id().await?;
        info!("Transaction submitter initialized for chain {}", chain_id);
        Ok(Self::with_chain_id(node, chain_id, nonces, gas))
    }

    pub fn with_chain_id(
        node: Arc<dyn NodeClient>,
        chain_id: u64,
        nonces: Arc<NonceManager>,
        gas: Arc<GasPriceSource>,
    ) -> Self {
        Self {
            node,
            chain_id,
            nonces,
            gas,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Submit `request`, taking gas settings from the gas source unless given
    pub async fn execute(
        &self,
        request: TransactionRequest,
        gas_price: Option<U256>,
        gas_limit: Option<U256>,
    ) -> PipeResult<H256> {
        let from = request.from();
        let lease = self.nonces.allocate(from, false).await?;
        let nonce = lease.nonce();
        let gas_price = gas_price.unwrap_or_else(|| self.gas.gas_price());
        let gas_limit = gas_limit.unwrap_or_else(|| self.gas.gas_limit());

        let tx = self.build_tx(&request, nonce, gas_price, gas_limit);
        let raw = match self.sign(&request.signer, &tx).await {
            Ok(raw) => raw,
            Err(e) => {
                self.nonces.release(from, lease).await;
                crate::metrics::record_tx_failed("signing");
                return Err(e);
            }
        };

        debug!(
            "Sending transaction from {:?} with nonce {} (gas price {}, limit {})",
            from, nonce, gas_price, gas_limit
        );

        match self.node.send_raw_transaction(raw).await {
            Ok(tx_hash) => {
                info!("Transaction sent: {:?} (nonce {})", tx_hash, nonce);
                crate::metrics::record_tx_submitted();
                Ok(tx_hash)
            }
            Err(e) if e.is_nonce_too_low() => {
                warn!("Nonce {} rejected as stale for {:?}, resyncing", nonce, from);
                crate::metrics::record_tx_failed("stale_nonce");
                if let Err(sync_err) = self.nonces.resync(from).await {
                    warn!("Nonce resync after stale nonce failed: {}", sync_err);
                }
                Err(e)
            }
            Err(e @ PipeError::Timeout { .. }) => {
                // the node may still have accepted it, so the nonce stays used
                warn!("Transaction send timed out (nonce {})", nonce);
                crate::metrics::record_tx_failed("timeout");
                Err(e)
            }
            Err(e) => {
                warn!("Transaction send failed (nonce {}): {}", nonce, e);
                self.nonces.release(from, lease).await;
                crate::metrics::record_tx_failed("rejected");
                Err(e)
            }
        }
    }

    fn build_tx(
        &self,
        request: &TransactionRequest,
        nonce: u64,
        gas_price: U256,
        gas_limit: U256,
    ) -> TypedTransaction {
        let mut tx = LegacyRequest::new()
            .from(request.from())
            .data(request.data.clone())
            .value(request.value)
            .nonce(nonce)
            .gas(gas_limit)
            .gas_price(gas_price)
            .chain_id(self.chain_id);

        if let Some(to) = request.to {
            tx = tx.to(to);
        }

        TypedTransaction::Legacy(tx)
    }

    async fn sign(&self, signer: &LocalWallet, tx: &TypedTransaction) -> PipeResult<Bytes> {
        let wallet = signer.clone().with_chain_id(self.chain_id);
        let signature = wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| PipeError::Wallet(format!("Failed to sign transaction: {}", e)))?;
        Ok(tx.rlp_signed(&signature))
    }
}
