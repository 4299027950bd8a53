//! txpipe - submits transactions and follows pending transactions and logs
//! on an EVM node.

use anyhow::Result;
use futures::StreamExt;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use txpipe::chain::Subscription;
use txpipe::metrics::MetricsServer;
use txpipe::{Pipeline, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting txpipe v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration with {} RPC endpoints and {} log streams",
        settings.node.rpc_urls.len(),
        settings.streams.logs.len()
    );

    let pipeline = Pipeline::connect(&settings).await?;
    if let Some(address) = pipeline.wallet_address() {
        let nonce = pipeline.sync_nonce(address).await?;
        info!("Wallet {:?} next nonce {}", address, nonce);
    }
    info!("Gas price: {} wei", pipeline.gas_price());

    let shutdown = CancellationToken::new();

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        let stop = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(async move { stop.cancelled().await }).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start log streams
    let poll_interval = settings.streams.poll_interval();
    let mut consumers = Vec::new();
    for (index, query) in settings.streams.logs.iter().enumerate() {
        let logs = pipeline.start_log_stream(query.clone(), poll_interval)?;
        consumers.push(consume(format!("logs#{}", index), logs, |log| {
            info!(
                address = ?log.address,
                block = ?log.block_number,
                tx = ?log.transaction_hash,
                "Log received"
            );
        }));
    }

    // Start pending transaction fanout
    if settings.streams.pending_fanout {
        let txs = match pipeline.subscribe_pending_transactions().await {
            Ok(txs) => txs,
            Err(e) => {
                warn!("Push subscription unavailable ({}), polling a filter instead", e);
                pipeline.start_pending_tx_fanout(poll_interval)
            }
        };
        consumers.push(consume("pending".to_string(), txs, |tx| {
            info!(hash = ?tx.hash, from = ?tx.from, nonce = %tx.nonce, "Pending transaction");
        }));
    }

    info!("txpipe is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    shutdown.cancel();
    pipeline.shutdown().await;

    for consumer in consumers {
        if let Err(e) = consumer.await {
            error!("Stream consumer failed: {}", e);
        }
    }
    if let Some(handle) = metrics_handle {
        if let Err(e) = handle.await {
            error!("Metrics server task failed: {}", e);
        }
    }

    info!("txpipe stopped");
    Ok(())
}

/// Drain a stream on its own task until it ends
fn consume<T, F>(name: String, mut items: Subscription<T>, handle: F) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(T) + Send + 'static,
{
    tokio::spawn(async move {
        let mut count = 0u64;
        while let Some(item) = items.next().await {
            count += 1;
            handle(item);
        }
        info!("Stream {} ended after {} items", name, count);
    })
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,txpipe=debug,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("TXPIPE_LOG_FORMAT").is_ok_and(|format| format == "json") {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

