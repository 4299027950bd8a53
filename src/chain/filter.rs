//! Filter polling engine
//!
//! Turns a node-side filter into a typed stream. The node forgets filters that
//! are not polled for a while (or when it restarts); when a poll reports the
//! filter as unknown the engine installs a fresh one and keeps feeding the same
//! output queue. Events emitted between the last successful poll and the new
//! install are not replayed.

use super::NodeClient;
use crate::error::PipeResult;
use crate::events::{FilterKind, LogQuery};
use crate::task::TaskHandle;

use async_trait::async_trait;
use ethers::types::{Log, H256, U256};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How to install one kind of filter and decode its changes
#[async_trait]
pub trait FilterSpec: Send + Sync + 'static {
    type Item: Send + 'static;

    fn kind(&self) -> FilterKind;

    async fn changes(&self, node: &dyn NodeClient, id: U256) -> PipeResult<Vec<Self::Item>>;
}

/// `eth_newPendingTransactionFilter`, yields transaction hashes
#[derive(Debug, Clone, Default)]
pub struct PendingTransactionFilter;

#[async_trait]
impl FilterSpec for PendingTransactionFilter {
    type Item = H256;

    fn kind(&self) -> FilterKind {
        FilterKind::PendingTransactions
    }

    async fn changes(&self, node: &dyn NodeClient, id: U256) -> PipeResult<Vec<H256>> {
        node.pending_transaction_changes(id).await
    }
}

/// `eth_newFilter`, yields log records
#[derive(Debug, Clone)]
pub struct LogFilter {
    query: LogQuery,
}

impl LogFilter {
    pub fn new(query: LogQuery) -> PipeResult<Self> {
        query.validate()?;
        Ok(Self { query })
    }
}

#[async_trait]
impl FilterSpec for LogFilter {
    type Item = Log;

    fn kind(&self) -> FilterKind {
        FilterKind::Logs(self.query.clone())
    }

    async fn changes(&self, node: &dyn NodeClient, id: U256) -> PipeResult<Vec<Log>> {
        let mut logs = node.log_changes(id).await?;

        // some nodes return removed or out-of-range logs on reorgs
        let before = logs.len();
        logs.retain(|log| self.query.matches(log));
        if logs.len() < before {
            debug!("Dropped {} logs outside the query", before - logs.len());
        }
        Ok(logs)
    }
}

/// Receiving end of a background stream plus the task feeding it
///
/// Dropping the subscription stops the task.
#[derive(Debug)]
pub struct Subscription<T> {
    receiver: mpsc::Receiver<T>,
    task: TaskHandle,
}

impl<T> Subscription<T> {
    pub(crate) fn new(receiver: mpsc::Receiver<T>, task: TaskHandle) -> Self {
        Self { receiver, task }
    }

    /// Next item, or `None` once the feeding task has stopped
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Stop the feeding task without waiting; buffered items stay readable
    pub fn cancel(&self) {
        self.task.cancel();
    }

    /// Stop the feeding task and wait for it to exit
    pub async fn shutdown(self) {
        let Subscription { receiver, task } = self;
        task.shutdown().await;
        drop(receiver);
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

/// Why a polling round ended
enum PollExit {
    /// The node no longer knows the filter
    Expired,
    Cancelled,
    /// Every receiver was dropped
    Closed,
}

/// Poll loop for one node-side filter
pub struct FilterPoller<S: FilterSpec> {
    node: Arc<dyn NodeClient>,
    spec: S,
    poll_interval: Duration,
    capacity: usize,
}

impl<S: FilterSpec> FilterPoller<S> {
    pub fn new(node: Arc<dyn NodeClient>, spec: S, poll_interval: Duration, capacity: usize) -> Self {
        Self {
            node,
            spec,
            poll_interval,
            capacity,
        }
    }

    /// Start polling in the background
    pub fn spawn(self, cancel: CancellationToken) -> Subscription<S::Item> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let task = TaskHandle::spawn("filter-poller", cancel.clone(), self.run(sender, cancel));
        Subscription::new(receiver, task)
    }

    async fn run(self, sender: mpsc::Sender<S::Item>, cancel: CancellationToken) {
        let kind = self.spec.kind();
        let label = kind.name();

        loop {
            let Some(id) = self.install(&kind, &sender, &cancel).await else {
                break;
            };
            info!("Installed {} filter {:#x}", label, id);

            match self.poll(id, &sender, &cancel).await {
                PollExit::Expired => {
                    warn!("{} filter {:#x} expired on the node, reinstalling", label, id);
                    crate::metrics::record_filter_reinstall(label);
                }
                PollExit::Cancelled | PollExit::Closed => {
                    match self.node.uninstall_filter(id).await {
                        Ok(_) => debug!("Uninstalled {} filter {:#x}", label, id),
                        Err(e) => debug!("Failed to uninstall {} filter {:#x}: {}", label, id, e),
                    }
                    break;
                }
            }
        }

        info!("{} filter stream stopped", label);
    }

    /// Create the filter, retrying every poll interval until it succeeds
    async fn install(
        &self,
        kind: &FilterKind,
        sender: &mpsc::Sender<S::Item>,
        cancel: &CancellationToken,
    ) -> Option<U256> {
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = sender.closed() => return None,
                result = self.node.install_filter(kind) => result,
            };

            match result {
                Ok(id) => return Some(id),
                Err(e) => {
                    warn!("Failed to install {} filter: {}", kind.name(), e);
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
    }

    async fn poll(
        &self,
        id: U256,
        sender: &mpsc::Sender<S::Item>,
        cancel: &CancellationToken,
    ) -> PollExit {
        let label = self.spec.kind().name();
        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollExit::Cancelled,
                _ = sender.closed() => return PollExit::Closed,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PollExit::Cancelled,
                result = self.spec.changes(self.node.as_ref(), id) => result,
            };

            match result {
                Ok(items) => {
                    if !items.is_empty() {
                        debug!("{} filter {:#x}: {} new items", label, id, items.len());
                        crate::metrics::record_filter_items(label, items.len());
                    }
                    for item in items {
                        // blocks while the queue is full
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return PollExit::Cancelled,
                            sent = sender.send(item) => {
                                if sent.is_err() {
                                    return PollExit::Closed;
                                }
                            }
                        }
                    }
                }
                Err(e) if e.is_filter_not_found() => return PollExit::Expired,
                Err(e) => {
                    if e.is_retryable() {
                        warn!("Failed to poll {} filter {:#x}: {}", label, id, e);
                    } else {
                        error!("Unexpected error polling {} filter {:#x}: {}", label, id, e);
                    }
                    crate::metrics::record_filter_poll_error(label);
                }
            }
        }
    }
}
