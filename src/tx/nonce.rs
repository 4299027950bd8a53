//! Nonce management for reliable transaction submission
//!
//! The node only counts a transaction once it is in its pool, so reading the
//! count before every send collides on back-to-back submissions. Each account
//! gets a [`NonceSequencer`] that predicts the next nonce locally and
//! re-anchors to the node:
//! - on first use, on demand, and whenever the last sync is older than the
//!   resync threshold
//! - from a background task once the account has been idle for the debounce
//!   window

use crate::chain::NodeClient;
use crate::config::NonceConfig;
use crate::error::{PipeError, PipeResult};
use crate::task::TaskHandle;

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timing policy for a sequencer
#[derive(Debug, Clone, Copy)]
pub struct NoncePolicy {
    /// Cached values older than this are always re-read from the node
    pub resync_threshold: Duration,
    /// Idle time before the background task re-anchors
    pub debounce: Duration,
    /// Background task period
    pub resync_interval: Duration,
}

impl Default for NoncePolicy {
    fn default() -> Self {
        Self {
            resync_threshold: Duration::from_secs(60),
            debounce: Duration::from_secs(10),
            resync_interval: Duration::from_secs(10),
        }
    }
}

impl From<&NonceConfig> for NoncePolicy {
    fn from(config: &NonceConfig) -> Self {
        Self {
            resync_threshold: config.resync_threshold(),
            debounce: config.debounce(),
            resync_interval: config.resync_interval(),
        }
    }
}

/// What caused a sync with the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncTrigger {
    Initial,
    Forced,
    Stale,
    Background,
}

impl SyncTrigger {
    fn name(self) -> &'static str {
        match self {
            SyncTrigger::Initial => "initial",
            SyncTrigger::Forced => "forced",
            SyncTrigger::Stale => "stale",
            SyncTrigger::Background => "background",
        }
    }
}

/// A nonce handed out by [`NonceSequencer::allocate`]
///
/// Giving it back only works while it is the latest allocation: any later
/// allocation or sync turns the release into a no-op.
#[derive(Debug, PartialEq, Eq)]
pub struct NonceLease {
    nonce: u64,
    generation: u64,
}

impl NonceLease {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }
}

/// Local view of one account's nonce
#[derive(Debug, Default)]
struct NonceState {
    value: u64,
    /// Whether `value` was handed out since it was last set
    dispensed: bool,
    /// Bumped by every sync, allocation and release
    generation: u64,
    last_sync_at: Option<Instant>,
    last_access_at: Option<Instant>,
}

/// Hands out strictly increasing nonces for one account
pub struct NonceSequencer {
    node: Arc<dyn NodeClient>,
    account: Address,
    policy: NoncePolicy,
    state: Mutex<NonceState>,
}

impl NonceSequencer {
    pub fn new(node: Arc<dyn NodeClient>, account: Address, policy: NoncePolicy) -> Self {
        Self {
            node,
            account,
            policy,
            state: Mutex::new(NonceState::default()),
        }
    }

    pub fn account(&self) -> Address {
        self.account
    }

    /// Next nonce to use, re-reading it from the node when `force_refresh` is set
    pub async fn next(&self, force_refresh: bool) -> PipeResult<u64> {
        Ok(self.allocate(force_refresh).await?.nonce)
    }

    /// Like [`next`](Self::next), returning a lease that can be released
    pub async fn allocate(&self, force_refresh: bool) -> PipeResult<NonceLease> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.last_access_at = Some(now);

        let trigger = match state.last_sync_at {
            None => Some(SyncTrigger::Initial),
            Some(_) if force_refresh => Some(SyncTrigger::Forced),
            Some(at) if now.duration_since(at) >= self.policy.resync_threshold => {
                Some(SyncTrigger::Stale)
            }
            Some(_) => None,
        };

        if let Some(trigger) = trigger {
            self.sync(&mut state, trigger, now).await?;
        } else if state.dispensed {
            // a value handed out since the last sync is never reused
            state.value += 1;
        }

        state.dispensed = true;
        state.generation += 1;
        crate::metrics::record_nonce_allocated();

        debug!("Allocated nonce {} for {:?}", state.value, self.account);
        Ok(NonceLease {
            nonce: state.value,
            generation: state.generation,
        })
    }

    /// Re-anchor to the node without handing out a nonce
    pub async fn resync(&self) -> PipeResult<u64> {
        let mut state = self.state.lock().await;
        self.sync(&mut state, SyncTrigger::Forced, Instant::now())
            .await?;
        Ok(state.value)
    }

    /// Give back a nonce whose transaction never reached the node
    ///
    /// Returns false when anything was allocated or synced since the lease.
    pub async fn release(&self, lease: NonceLease) -> bool {
        let mut state = self.state.lock().await;
        if !state.dispensed || state.generation != lease.generation || state.value != lease.nonce {
            debug!(
                "Nonce {} for {:?} superseded, not released",
                lease.nonce, self.account
            );
            return false;
        }

        state.dispensed = false;
        state.generation += 1;
        debug!("Released nonce {} for {:?}", lease.nonce, self.account);
        true
    }

    /// Periodic idle resync, owned by the returned handle
    pub fn spawn_resync(self: &Arc<Self>, cancel: CancellationToken) -> TaskHandle {
        let sequencer = self.clone();
        let period = self.policy.resync_interval;

        TaskHandle::spawn("nonce-resync", cancel.clone(), async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = sequencer.resync_if_idle().await {
                    warn!("Background nonce resync failed for {:?}: {}", sequencer.account, e);
                }
            }

            debug!("Nonce resync task stopped for {:?}", sequencer.account);
        })
    }

    async fn resync_if_idle(&self) -> PipeResult<()> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let idle = state
            .last_access_at
            .map_or(true, |at| now.duration_since(at) >= self.policy.debounce);
        if idle {
            self.sync(&mut state, SyncTrigger::Background, now).await?;
        }
        Ok(())
    }

    async fn sync(&self, state: &mut NonceState, trigger: SyncTrigger, now: Instant) -> PipeResult<()> {
        let on_chain = self
            .node
            .transaction_count(self.account)
            .await
            .map_err(|e| PipeError::Nonce {
                account: format!("{:?}", self.account),
                message: e.to_string(),
            })?;

        if state.last_sync_at.is_some() && on_chain < state.value {
            warn!(
                "Node reports nonce {} for {:?}, below local {}; resetting",
                on_chain, self.account, state.value
            );
        }

        state.value = on_chain;
        state.dispensed = false;
        state.generation += 1;
        state.last_sync_at = Some(now);
        crate::metrics::record_nonce_resync(trigger.name());

        debug!(
            "Synced nonce for {:?} ({}): {}",
            self.account,
            trigger.name(),
            on_chain
        );
        Ok(())
    }
}

struct TrackedSequencer {
    sequencer: Arc<NonceSequencer>,
    resync: TaskHandle,
}

/// One sequencer, with its background resync, per account
pub struct NonceManager {
    node: Arc<dyn NodeClient>,
    policy: NoncePolicy,
    cancel: CancellationToken,
    sequencers: DashMap<Address, TrackedSequencer>,
}

impl NonceManager {
    /// Create a new nonce manager; its tasks stop when `cancel` fires
    pub fn new(node: Arc<dyn NodeClient>, policy: NoncePolicy, cancel: CancellationToken) -> Self {
        Self {
            node,
            policy,
            cancel,
            sequencers: DashMap::new(),
        }
    }

    /// Sequencer for `account`, created on first use
    pub fn sequencer(&self, account: Address) -> Arc<NonceSequencer> {
        self.sequencers
            .entry(account)
            .or_insert_with(|| {
                let sequencer = Arc::new(NonceSequencer::new(self.node.clone(), account, self.policy));
                let resync = sequencer.spawn_resync(self.cancel.child_token());
                info!("Tracking nonce for {:?}", account);
                TrackedSequencer { sequencer, resync }
            })
            .sequencer
            .clone()
    }

    /// Get the next nonce for an account
    pub async fn next(&self, account: Address, force_refresh: bool) -> PipeResult<u64> {
        self.sequencer(account).next(force_refresh).await
    }

    /// Sync an account's nonce with on-chain state
    pub async fn resync(&self, account: Address) -> PipeResult<u64> {
        self.sequencer(account).resync().await
    }

    /// Allocate a releasable nonce for an account
    pub async fn allocate(&self, account: Address, force_refresh: bool) -> PipeResult<NonceLease> {
        self.sequencer(account).allocate(force_refresh).await
    }

    /// Release a nonce (transaction never sent, can be reused)
    pub async fn release(&self, account: Address, lease: NonceLease) -> bool {
        self.sequencer(account).release(lease).await
    }

    pub fn accounts(&self) -> Vec<Address> {
        self.sequencers.iter().map(|entry| *entry.key()).collect()
    }

    /// Stop every background resync
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for account in self.accounts() {
            if let Some((_, tracked)) = self.sequencers.remove(&account) {
                tracked.resync.shutdown().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fake::FakeNode;
    use std::sync::atomic::Ordering;

    fn account() -> Address {
        Address::repeat_byte(0xab)
    }

    fn sequencer(node: &Arc<FakeNode>) -> Arc<NonceSequencer> {
        Arc::new(NonceSequencer::new(node.clone(), account(), NoncePolicy::default()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_get_consecutive_nonces() {
        let node = Arc::new(FakeNode::with_transaction_count(7));
        let seq = sequencer(&node);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let seq = seq.clone();
                tokio::spawn(async move { seq.next(false).await.unwrap() })
            })
            .collect();

        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap());
        }
        nonces.sort_unstable();

        assert_eq!(nonces, (7..57).collect::<Vec<u64>>());
        assert_eq!(node.count_queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forced_refresh_returns_the_node_count() {
        let node = Arc::new(FakeNode::with_transaction_count(7));
        let seq = sequencer(&node);

        assert_eq!(seq.next(false).await.unwrap(), 7);
        assert_eq!(seq.next(false).await.unwrap(), 8);

        node.transaction_count.store(20, Ordering::SeqCst);
        assert_eq!(seq.next(true).await.unwrap(), 20);
        assert_eq!(seq.next(false).await.unwrap(), 21);

        node.transaction_count.store(3, Ordering::SeqCst);
        assert_eq!(seq.next(true).await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn calls_within_the_debounce_window_query_once() {
        let node = Arc::new(FakeNode::with_transaction_count(7));
        let seq = sequencer(&node);

        assert_eq!(seq.next(false).await.unwrap(), 7);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(seq.next(false).await.unwrap(), 8);

        assert_eq!(node.count_queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_values_are_refreshed() {
        let node = Arc::new(FakeNode::with_transaction_count(7));
        let seq = sequencer(&node);

        assert_eq!(seq.next(false).await.unwrap(), 7);
        node.transaction_count.store(9, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(seq.next(false).await.unwrap(), 9);
        assert_eq!(node.count_queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn handed_out_values_are_not_reused_after_the_debounce_window() {
        let node = Arc::new(FakeNode::with_transaction_count(7));
        let seq = sequencer(&node);

        assert_eq!(seq.next(false).await.unwrap(), 7);
        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(seq.next(false).await.unwrap(), 8);
        assert_eq!(node.count_queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_resync_reanchors_an_idle_account() {
        let node = Arc::new(FakeNode::with_transaction_count(7));
        let seq = sequencer(&node);
        let task = seq.spawn_resync(CancellationToken::new());

        assert_eq!(seq.next(false).await.unwrap(), 7);
        node.transaction_count.store(8, Ordering::SeqCst);

        // first tick at 10s finds the account idle for the whole window
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(node.count_queries.load(Ordering::SeqCst), 2);

        assert_eq!(seq.next(false).await.unwrap(), 8);
        assert_eq!(seq.next(false).await.unwrap(), 9);

        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn background_resync_skips_busy_accounts() {
        let node = Arc::new(FakeNode::with_transaction_count(7));
        let seq = sequencer(&node);
        let task = seq.spawn_resync(CancellationToken::new());

        assert_eq!(seq.next(false).await.unwrap(), 7);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(seq.next(false).await.unwrap(), 8);

        // tick at 10s: last access 5s ago
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(node.count_queries.load(Ordering::SeqCst), 1);

        task.shutdown().await;
    }

    #[tokio::test]
    async fn released_nonce_is_handed_out_again() {
        let node = Arc::new(FakeNode::with_transaction_count(7));
        let seq = sequencer(&node);

        let first = seq.allocate(false).await.unwrap();
        let second = seq.allocate(false).await.unwrap();
        assert_eq!((first.nonce(), second.nonce()), (7, 8));
        assert!(!seq.release(first).await);
        assert!(seq.release(second).await);

        assert_eq!(seq.next(false).await.unwrap(), 8);
        assert_eq!(seq.next(false).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn release_after_a_forced_refresh_is_ignored() {
        let node = Arc::new(FakeNode::with_transaction_count(7));
        let seq = sequencer(&node);

        let lease = seq.allocate(false).await.unwrap();
        assert_eq!(lease.nonce(), 7);

        // node still reports 7, so the refresh hands 7 out again
        let refreshed = seq.next(true).await.unwrap();
        assert_eq!(refreshed, 7);

        assert!(!seq.release(lease).await);
        assert_ne!(seq.next(false).await.unwrap(), refreshed);
    }

    #[tokio::test]
    async fn release_after_a_resync_is_ignored() {
        let node = Arc::new(FakeNode::with_transaction_count(7));
        let seq = sequencer(&node);

        let lease = seq.allocate(false).await.unwrap();
        seq.resync().await.unwrap();
        assert!(!seq.release(lease).await);

        assert_eq!(seq.next(false).await.unwrap(), 7);
        assert_eq!(seq.next(false).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn failed_sync_still_counts_as_access() {
        let node = Arc::new(FakeNode::with_transaction_count(7));
        *node.count_error.lock().unwrap() = Some("connection refused".to_string());
        let seq = sequencer(&node);

        assert!(seq.next(false).await.is_err());
        assert!(seq.state.lock().await.last_access_at.is_some());

        *node.count_error.lock().unwrap() = None;
        assert_eq!(seq.next(false).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn resync_does_not_consume_a_nonce() {
        let node = Arc::new(FakeNode::with_transaction_count(7));
        let seq = sequencer(&node);

        assert_eq!(seq.next(false).await.unwrap(), 7);
        node.transaction_count.store(8, Ordering::SeqCst);

        assert_eq!(seq.resync().await.unwrap(), 8);
        assert_eq!(seq.next(false).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn manager_tracks_accounts_independently() {
        let node = Arc::new(FakeNode::with_transaction_count(4));
        let manager = NonceManager::new(node.clone(), NoncePolicy::default(), CancellationToken::new());

        let first = Address::repeat_byte(1);
        let second = Address::repeat_byte(2);

        assert_eq!(manager.next(first, false).await.unwrap(), 4);
        assert_eq!(manager.next(first, false).await.unwrap(), 5);
        assert_eq!(manager.next(second, false).await.unwrap(), 4);
        assert_eq!(manager.accounts().len(), 2);

        manager.shutdown().await;
        assert!(manager.accounts().is_empty());
    }
}
