//! Gas price source for outgoing transactions

use crate::chain::NodeClient;
use crate::config::{GasConfig, GasStrategy};
use crate::task::TaskHandle;

use arc_swap::ArcSwap;
use ethers::types::U256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the default gas price and limit of a submission come from
#[derive(Debug)]
pub enum GasPriceSource {
    /// Constants from configuration
    Fixed { gas_price: U256, gas_limit: U256 },
    /// Node-reported price, refreshed in the background
    Refreshed(RefreshedGasPrice),
}

/// Last gas price reported by the node
///
/// Readers never wait on the node; a failed refresh keeps the previous value.
#[derive(Debug)]
pub struct RefreshedGasPrice {
    current: Arc<ArcSwap<U256>>,
    gas_limit: U256,
    refresher: Mutex<Option<TaskHandle>>,
}

impl GasPriceSource {
    pub fn fixed(gas_price: U256, gas_limit: U256) -> Self {
        GasPriceSource::Fixed {
            gas_price,
            gas_limit,
        }
    }

    /// Fetch the price once, then keep refreshing it every `interval`
    ///
    /// When the first fetch fails `fallback` is served until a refresh succeeds.
    pub async fn refreshed(
        node: Arc<dyn NodeClient>,
        fallback: U256,
        gas_limit: U256,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let initial = match node.gas_price().await {
            Ok(price) => {
                crate::metrics::record_gas_price(price);
                price
            }
            Err(e) => {
                warn!("Initial gas price fetch failed, using configured {}: {}", fallback, e);
                crate::metrics::record_gas_refresh_failure();
                fallback
            }
        };
        info!("Gas price source started at {} wei", initial);

        let current = Arc::new(ArcSwap::from_pointee(initial));
        let refresher = spawn_refresh(node, current.clone(), interval, cancel);

        GasPriceSource::Refreshed(RefreshedGasPrice {
            current,
            gas_limit,
            refresher: Mutex::new(Some(refresher)),
        })
    }

    pub async fn from_config(
        node: Arc<dyn NodeClient>,
        config: &GasConfig,
        cancel: CancellationToken,
    ) -> Self {
        match config.strategy {
            GasStrategy::Fixed => Self::fixed(config.gas_price(), config.gas_limit()),
            GasStrategy::Refreshed => {
                Self::refreshed(
                    node,
                    config.gas_price(),
                    config.gas_limit(),
                    config.refresh_interval(),
                    cancel,
                )
                .await
            }
        }
    }

    pub fn gas_price(&self) -> U256 {
        match self {
            GasPriceSource::Fixed { gas_price, .. } => *gas_price,
            GasPriceSource::Refreshed(refreshed) => **refreshed.current.load(),
        }
    }

    pub fn gas_limit(&self) -> U256 {
        match self {
            GasPriceSource::Fixed { gas_limit, .. } => *gas_limit,
            GasPriceSource::Refreshed(refreshed) => refreshed.gas_limit,
        }
    }

    /// Stop background refreshing and wait for it; the last price stays readable
    pub async fn shutdown(&self) {
        if let GasPriceSource::Refreshed(refreshed) = self {
            let refresher = refreshed.refresher.lock().await.take();
            if let Some(refresher) = refresher {
                refresher.shutdown().await;
            }
        }
    }
}

fn spawn_refresh(
    node: Arc<dyn NodeClient>,
    current: Arc<ArcSwap<U256>>,
    interval: Duration,
    cancel: CancellationToken,
) -> TaskHandle {
    TaskHandle::spawn("gas-refresh", cancel.clone(), async move {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = node.gas_price() => result,
            };

            match result {
                Ok(price) => {
                    debug!("Gas price refreshed: {} wei", price);
                    current.store(Arc::new(price));
                    crate::metrics::record_gas_price(price);
                }
                Err(e) => {
                    warn!("Gas price refresh failed, keeping {}: {}", **current.load(), e);
                    crate::metrics::record_gas_refresh_failure();
                }
            }
        }

        debug!("Gas price refresh stopped");
    })
}
