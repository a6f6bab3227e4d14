//! Nonce management across multiple signing keys
//!
//! Tracks a per-address nonce ledger and a queue of keys that are safe to
//! use concurrently. A key leaves the queue when handed out and only returns
//! once its previous transaction is confirmed on-chain (nonce advanced by
//! exactly one), observed by a rate-limited background watcher.

use crate::chain::NodeProvider;
use crate::config::NonceManagerConfig;
use crate::error::{SleuthError, SleuthResult};

use async_trait::async_trait;
use ethers::types::Address;
#[cfg(test)]
use mockall::automock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, trace, warn};

/// Source of confirmed on-chain nonces. [`NodeProvider`] is the production
/// implementation; tests substitute their own.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn confirmed_nonce(&self, address: Address) -> SleuthResult<u64>;
}

#[async_trait]
impl NonceSource for NodeProvider {
    async fn confirmed_nonce(&self, address: Address) -> SleuthResult<u64> {
        NodeProvider::confirmed_nonce(self, address).await
    }
}

/// Sentinel key number returned when no synced key became available within
/// the timeout. Callers always receive a concrete number, never an
/// ownership-ambiguous nothing; the sentinel is never debited a nonce.
pub const TIMED_OUT_KEY_NUM: usize = usize::MAX;

/// A signing key together with its last confirmed nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyNonce {
    pub key_num: usize,
    pub nonce: u64,
}

/// Shared fixed-window rate limiter for key sync polls
struct SyncRateLimit {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl SyncRateLimit {
    fn new(per_sec: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / per_sec.max(1),
            next_slot: Mutex::new(Instant::now()),
        }
    }

    async fn take(&self) {
        let wait = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let wait = next.saturating_duration_since(now);
            *next = now.max(*next) + self.interval;
            wait
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

/// Tracks nonces for each managed address
pub struct NonceManager {
    cfg: NonceManagerConfig,
    source: Arc<dyn NonceSource>,
    addresses: Vec<Address>,
    nonces: Mutex<HashMap<Address, u64>>,
    queue_tx: Mutex<mpsc::Sender<KeyNonce>>,
    queue_rx: Mutex<mpsc::Receiver<KeyNonce>>,
    /// Keys whose pending transaction never confirmed within the sync
    /// budget; they are refused rather than handed out again
    desynced: Mutex<HashSet<usize>>,
    rate_limit: SyncRateLimit,
    errors: Mutex<Vec<SleuthError>>,
}

impl NonceManager {
    pub fn new(
        cfg: NonceManagerConfig,
        source: Arc<dyn NonceSource>,
        addresses: Vec<Address>,
    ) -> Self {
        let nonces = addresses.iter().map(|a| (*a, 0)).collect();
        let (queue_tx, queue_rx) = mpsc::channel(addresses.len().max(1));
        let rate_limit = SyncRateLimit::new(cfg.key_sync_rate_limit_per_sec);
        Self {
            cfg,
            source,
            addresses,
            nonces: Mutex::new(nonces),
            queue_tx: Mutex::new(queue_tx),
            queue_rx: Mutex::new(queue_rx),
            desynced: Mutex::new(HashSet::new()),
            rate_limit,
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    /// Next nonce for `address`, incrementing the stored counter.
    ///
    /// Never blocks on the network and never fails: asking for an address
    /// this manager does not own is a programming error.
    pub async fn next_nonce(&self, address: Address) -> u64 {
        let mut nonces = self.nonces.lock().await;
        let entry = nonces
            .get_mut(&address)
            .unwrap_or_else(|| panic!("address {address:?} is not managed by this NonceManager"));
        let next = *entry;
        *entry += 1;
        next
    }

    /// Query the node for every managed address's confirmed nonce, rebuild
    /// the ledger and refill the synced-key queue. Key 0 is the root key and
    /// stays out of the queue.
    pub async fn resync_all(&self) -> SleuthResult<()> {
        debug!(addresses = self.addresses.len(), "Resyncing nonces");

        let mut fresh = HashMap::with_capacity(self.addresses.len());
        for address in &self.addresses {
            let nonce = self.source.confirmed_nonce(*address).await?;
            fresh.insert(*address, nonce);
        }

        {
            let mut nonces = self.nonces.lock().await;
            *nonces = fresh.clone();
        }
        self.desynced.lock().await.clear();

        let (tx, rx) = mpsc::channel(self.addresses.len().max(1));
        for (key_num, address) in self.addresses.iter().enumerate().skip(1) {
            let key = KeyNonce {
                key_num,
                nonce: fresh[address],
            };
            tx.send(key).await.map_err(|_| {
                SleuthError::Internal("synced key queue closed during resync".into())
            })?;
        }
        *self.queue_tx.lock().await = tx;
        *self.queue_rx.lock().await = rx;

        debug!(?fresh, "Nonce ledger rebuilt");
        Ok(())
    }

    /// Blocks until any synced key is available or the configured timeout
    /// elapses. On timeout an internal error is recorded and the sentinel
    /// [`TIMED_OUT_KEY_NUM`] is returned.
    pub async fn acquire_any_synced_key(self: &Arc<Self>) -> usize {
        let deadline = self.cfg.sync_timeout();
        loop {
            let received = {
                let mut rx = self.queue_rx.lock().await;
                timeout(deadline, rx.recv()).await
            };
            match received {
                Ok(Some(key)) => {
                    if self.desynced.lock().await.contains(&key.key_num) {
                        warn!(key = key.key_num, "Refusing desynced key");
                        continue;
                    }
                    trace!(key = key.key_num, nonce = key.nonce, "Key selected");
                    self.spawn_key_watcher(key);
                    return key.key_num;
                }
                Ok(None) => {
                    self.record_error(SleuthError::Internal(
                        "synced key queue closed".into(),
                    ))
                    .await;
                    return TIMED_OUT_KEY_NUM;
                }
                Err(_) => {
                    let err = SleuthError::KeySyncTimeout {
                        timeout_secs: self.cfg.key_sync_timeout_secs,
                    };
                    error!("{err}");
                    self.record_error(err).await;
                    return TIMED_OUT_KEY_NUM;
                }
            }
        }
    }

    /// Watches the key's address until its nonce advances by exactly one,
    /// then returns the key to the queue. Node queries happen outside any
    /// lock; only the final hand-off touches shared state.
    fn spawn_key_watcher(self: &Arc<Self>, key: KeyNonce) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let address = manager.addresses[key.key_num];
            for attempt in 1..=manager.cfg.key_sync_retries {
                manager.rate_limit.take().await;
                match manager.source.confirmed_nonce(address).await {
                    Ok(nonce) if nonce == key.nonce + 1 => {
                        trace!(key = key.key_num, nonce, "Key synced");
                        let tx = manager.queue_tx.lock().await.clone();
                        let _ = tx
                            .send(KeyNonce {
                                key_num: key.key_num,
                                nonce,
                            })
                            .await;
                        return;
                    }
                    Ok(nonce) => {
                        trace!(
                            key = key.key_num,
                            nonce,
                            expected = key.nonce + 1,
                            attempt,
                            "Key not yet synced"
                        );
                    }
                    Err(e) => {
                        debug!(key = key.key_num, error = %e, attempt, "Nonce poll failed");
                    }
                }
                sleep(manager.cfg.sync_retry_delay()).await;
            }

            let err = SleuthError::KeySyncFailed {
                key_num: key.key_num,
                retries: manager.cfg.key_sync_retries,
                message: format!(
                    "nonce for {address:?} never advanced past {}",
                    key.nonce
                ),
            };
            error!("{err}");
            manager.desynced.lock().await.insert(key.key_num);
            manager.record_error(err).await;
        });
    }

    /// Put a key back into the synced queue. Used by tests and by callers
    /// that acquired a key but never broadcast a transaction with it.
    pub async fn return_key(&self, key: KeyNonce) -> SleuthResult<()> {
        let tx = self.queue_tx.lock().await.clone();
        tx.send(key)
            .await
            .map_err(|_| SleuthError::Internal("synced key queue closed".into()))
    }

    async fn record_error(&self, err: SleuthError) {
        self.errors.lock().await.push(err);
    }

    /// Manager-level errors collected from timeouts and sync failures
    pub async fn take_errors(&self) -> Vec<SleuthError> {
        std::mem::take(&mut *self.errors.lock().await)
    }

    pub async fn is_desynced(&self, key_num: usize) -> bool {
        self.desynced.lock().await.contains(&key_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GasEstimationConfig, NetworkConfig};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn test_provider() -> Arc<NodeProvider> {
        // no connection is made at construction time
        let network = NetworkConfig {
            name: "test".into(),
            rpc_urls: vec!["http://localhost:1".into()],
            chain_id: Some(31337),
            private_keys: vec![],
            txn_timeout_secs: 1,
            dial_timeout_secs: 1,
            eip1559_dynamic_fees: true,
            gas_price: 0,
            gas_fee_cap: 0,
            gas_tip_cap: 0,
            gas_estimation: GasEstimationConfig {
                enabled: false,
                blocks: 0,
                priority: crate::config::Priority::Standard,
                congestion_strategy: crate::config::CongestionStrategy::Simple,
                attempt_count: 1,
            },
        };
        Arc::new(NodeProvider::new(&network).unwrap())
    }

    fn test_manager(addresses: Vec<Address>) -> Arc<NonceManager> {
        let cfg = NonceManagerConfig {
            key_sync_rate_limit_per_sec: 100,
            key_sync_timeout_secs: 1,
            key_sync_retries: 1,
            key_sync_retry_delay_millis: 1,
        };
        Arc::new(NonceManager::new(cfg, test_provider(), addresses))
    }

    #[tokio::test]
    async fn test_next_nonce_is_strictly_increasing_and_gap_free() {
        let addr = Address::repeat_byte(0x11);
        let manager = test_manager(vec![addr]);
        for expected in 0..5 {
            assert_eq!(manager.next_nonce(addr).await, expected);
        }
    }

    #[tokio::test]
    async fn test_nonce_counters_are_per_address() {
        let a = Address::repeat_byte(0x11);
        let b = Address::repeat_byte(0x22);
        let manager = test_manager(vec![a, b]);
        assert_eq!(manager.next_nonce(a).await, 0);
        assert_eq!(manager.next_nonce(a).await, 1);
        assert_eq!(manager.next_nonce(b).await, 0);
    }

    #[tokio::test]
    #[should_panic(expected = "not managed")]
    async fn test_unmanaged_address_is_a_programming_error() {
        let manager = test_manager(vec![Address::repeat_byte(0x11)]);
        manager.next_nonce(Address::repeat_byte(0xff)).await;
    }

    #[tokio::test]
    async fn test_acquire_times_out_with_sentinel_and_records_error() {
        let manager = test_manager(vec![Address::repeat_byte(0x11)]);
        // queue is empty until resync, so acquisition must time out
        let key = manager.acquire_any_synced_key().await;
        assert_eq!(key, TIMED_OUT_KEY_NUM);
        let errors = manager.take_errors().await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], SleuthError::KeySyncTimeout { .. }));
    }

    #[tokio::test]
    async fn test_acquired_key_leaves_the_queue() {
        let a = Address::repeat_byte(0x11);
        let b = Address::repeat_byte(0x22);
        let manager = test_manager(vec![a, b]);
        manager
            .return_key(KeyNonce {
                key_num: 1,
                nonce: 0,
            })
            .await
            .unwrap();

        let first = manager.acquire_any_synced_key().await;
        assert_eq!(first, 1);
        // the key is out with a caller; until its nonce advances on-chain
        // nobody else may receive it
        let second = manager.acquire_any_synced_key().await;
        assert_eq!(second, TIMED_OUT_KEY_NUM);
    }

    fn manager_with_source(
        source: Arc<dyn NonceSource>,
        retries: u32,
        retry_delay_millis: u64,
    ) -> Arc<NonceManager> {
        let cfg = NonceManagerConfig {
            key_sync_rate_limit_per_sec: 1_000,
            key_sync_timeout_secs: 1,
            key_sync_retries: retries,
            key_sync_retry_delay_millis: retry_delay_millis,
        };
        let addresses = vec![Address::repeat_byte(0x11), Address::repeat_byte(0x22)];
        Arc::new(NonceManager::new(cfg, source, addresses))
    }

    #[tokio::test]
    async fn test_key_returns_to_queue_after_its_nonce_advances() {
        let chain_nonce = Arc::new(AtomicU64::new(0));
        let mut source = MockNonceSource::new();
        let n = Arc::clone(&chain_nonce);
        source
            .expect_confirmed_nonce()
            .returning(move |_| Ok(n.load(Ordering::SeqCst)));
        let manager = manager_with_source(Arc::new(source), 1_000, 10);
        manager.resync_all().await.unwrap();

        assert_eq!(manager.acquire_any_synced_key().await, 1);
        // the key's transaction confirms: its on-chain nonce moves up by one
        chain_nonce.store(1, Ordering::SeqCst);

        // the watcher observes the advance and hands the key back
        assert_eq!(manager.acquire_any_synced_key().await, 1);
        assert!(!manager.is_desynced(1).await);
        assert!(manager.take_errors().await.is_empty());
    }

    #[tokio::test]
    async fn test_desynced_key_is_quarantined_and_refused() {
        let mut source = MockNonceSource::new();
        source.expect_confirmed_nonce().returning(|_| Ok(0));
        let manager = manager_with_source(Arc::new(source), 1, 1);
        manager.resync_all().await.unwrap();
        assert_eq!(manager.acquire_any_synced_key().await, 1);

        // the nonce never advances; the watcher exhausts its retries and
        // quarantines the key
        for _ in 0..200 {
            if manager.is_desynced(1).await {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(manager.is_desynced(1).await);

        // even handed back by force, the key must not be given out again
        manager
            .return_key(KeyNonce {
                key_num: 1,
                nonce: 0,
            })
            .await
            .unwrap();
        assert_eq!(manager.acquire_any_synced_key().await, TIMED_OUT_KEY_NUM);

        let errors = manager.take_errors().await;
        assert!(errors
            .iter()
            .any(|e| matches!(e, SleuthError::KeySyncFailed { .. })));
    }
}
