//! Pending transaction fanout
//!
//! Resolves a stream of transaction hashes into full transactions with a fixed
//! number of lookups in flight. A hash that cannot be resolved is logged and
//! dropped so one bad hash never stalls the stream.

use super::filter::Subscription;
use super::NodeClient;
use crate::task::TaskHandle;

use ethers::types::{Transaction, H256};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bounded-concurrency hash to transaction resolver
pub struct PendingTxFanout {
    node: Arc<dyn NodeClient>,
    concurrency: usize,
    capacity: usize,
}

impl PendingTxFanout {
    pub fn new(node: Arc<dyn NodeClient>, concurrency: usize, capacity: usize) -> Self {
        Self {
            node,
            concurrency: concurrency.max(1),
            capacity,
        }
    }

    /// Start resolving `hashes` in the background
    pub fn spawn<S>(self, hashes: S, cancel: CancellationToken) -> Subscription<Transaction>
    where
        S: Stream<Item = H256> + Send + Unpin + 'static,
    {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let task = TaskHandle::spawn("pending-tx-fanout", cancel.clone(), self.run(hashes, sender, cancel));
        Subscription::new(receiver, task)
    }

    async fn run<S>(self, mut hashes: S, sender: mpsc::Sender<Transaction>, cancel: CancellationToken)
    where
        S: Stream<Item = H256> + Send + Unpin + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();

        loop {
            let hash = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sender.closed() => break,
                next = hashes.next() => match next {
                    Some(hash) => hash,
                    None => {
                        debug!("Pending transaction hash stream closed");
                        break;
                    }
                },
            };

            // waits for a free slot
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            crate::metrics::record_fanout_in_flight(self.concurrency - semaphore.available_permits());
            workers.spawn(resolve(
                self.node.clone(),
                hash,
                sender.clone(),
                cancel.clone(),
                permit,
            ));

            while let Some(result) = workers.try_join_next() {
                log_worker_result(result);
            }
        }

        if cancel.is_cancelled() {
            workers.abort_all();
        }
        while let Some(result) = workers.join_next().await {
            log_worker_result(result);
        }
        crate::metrics::record_fanout_in_flight(0);

        info!("Pending transaction fanout stopped");
    }
}

async fn resolve(
    node: Arc<dyn NodeClient>,
    hash: H256,
    sender: mpsc::Sender<Transaction>,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let lookup = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        lookup = node.transaction_by_hash(hash) => lookup,
    };

    match lookup {
        Ok(Some(tx)) => {
            crate::metrics::record_fanout_resolved();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = sender.send(tx) => {}
            }
        }
        Ok(None) => {
            debug!("Pending transaction {:?} no longer known to the node", hash);
            crate::metrics::record_fanout_dropped();
        }
        Err(e) => {
            warn!("Failed to resolve pending transaction {:?}: {}", hash, e);
            crate::metrics::record_fanout_dropped();
        }
    }
}

fn log_worker_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("Fanout worker panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fake::FakeNode;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio_stream::wrappers::ReceiverStream;

    fn hashes(n: u8) -> Vec<H256> {
        (1..=n).map(H256::repeat_byte).collect()
    }

    #[tokio::test]
    async fn never_exceeds_the_concurrency_limit() {
        let node = Arc::new(FakeNode::default());
        *node.lookup_delay.lock().unwrap() = Duration::from_millis(20);
        for hash in hashes(10) {
            node.add_transaction(hash);
        }

        let (hash_tx, hash_rx) = mpsc::channel(16);
        for hash in hashes(10) {
            hash_tx.send(hash).await.unwrap();
        }

        let mut sub = PendingTxFanout::new(node.clone(), 3, 16)
            .spawn(ReceiverStream::new(hash_rx), CancellationToken::new());

        let mut resolved = Vec::new();
        for _ in 0..10 {
            resolved.push(sub.recv().await.unwrap().hash);
        }
        resolved.sort();

        assert_eq!(resolved, hashes(10));
        assert_eq!(node.max_in_flight.load(Ordering::SeqCst), 3);
        assert_eq!(node.lookups.load(Ordering::SeqCst), 10);
        sub.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_hashes_are_dropped_and_the_stream_ends_with_its_input() {
        let node = Arc::new(FakeNode::default());
        node.add_transaction(H256::repeat_byte(2));

        let (hash_tx, hash_rx) = mpsc::channel(16);
        for hash in hashes(3) {
            hash_tx.send(hash).await.unwrap();
        }
        drop(hash_tx);

        let mut sub = PendingTxFanout::new(node.clone(), 3, 16)
            .spawn(ReceiverStream::new(hash_rx), CancellationToken::new());

        assert_eq!(sub.recv().await.map(|tx| tx.hash), Some(H256::repeat_byte(2)));
        assert!(sub.recv().await.is_none());
        assert_eq!(node.lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_pending_lookups() {
        let node = Arc::new(FakeNode::default());
        *node.lookup_delay.lock().unwrap() = Duration::from_secs(3600);
        node.add_transaction(H256::repeat_byte(1));

        let (hash_tx, hash_rx) = mpsc::channel(16);
        hash_tx.send(H256::repeat_byte(1)).await.unwrap();

        let cancel = CancellationToken::new();
        let mut sub = PendingTxFanout::new(node.clone(), 3, 16)
            .spawn(ReceiverStream::new(hash_rx), cancel.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let next = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await;
        assert_eq!(next.map(|tx| tx.is_none()).ok(), Some(true));
    }
}
