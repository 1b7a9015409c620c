use crate::metrics::{LockMetrics, LockMetricsSnapshot};
use chrono::Utc;
use juris_core::{every, LockConfig, LockError, TaskHandle, Timestamp};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

// ============================================================================
// TOKENS AND ENTRIES
// ============================================================================

/// Proof of ownership for one grant of a key.
///
/// Every grant mints a fresh token, so a holder whose lock was reclaimed
/// cannot release the next holder's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LockToken(Uuid);

impl LockToken {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The current holder of a key.
#[derive(Debug, Clone)]
pub struct LockEntry {
    pub key: String,
    pub token: LockToken,
    /// Monotonic grant time, used for stale detection.
    pub acquired_at: Instant,
    pub acquired_at_wall: Timestamp,
}

impl LockEntry {
    fn grant(key: &str) -> Self {
        Self {
            key: key.to_string(),
            token: LockToken::new(),
            acquired_at: Instant::now(),
            acquired_at_wall: Utc::now(),
        }
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<LockEntry>,
}

struct KeyState {
    holder: LockEntry,
    /// FIFO of tasks waiting for this key.
    waiters: VecDeque<Waiter>,
}

type LockTable = HashMap<String, KeyState>;

// ============================================================================
// KEYED LOCK MANAGER
// ============================================================================

/// Mutual exclusion per string key, granted in arrival order.
///
/// A key is present in the table only while it is held; the last release
/// removes it, so the table never grows with idle keys.
pub struct KeyedLockManager {
    config: LockConfig,
    table: Mutex<LockTable>,
    next_waiter: AtomicU64,
    metrics: LockMetrics,
}

impl KeyedLockManager {
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            table: Mutex::new(HashMap::new()),
            next_waiter: AtomicU64::new(0),
            metrics: LockMetrics::default(),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire `key`, waiting at most `timeout` behind earlier callers.
    ///
    /// Dropping the returned future while it waits withdraws the request;
    /// if the key was handed over in that window it is passed straight on.
    pub async fn acquire_lock(&self, key: &str, timeout: Duration) -> Result<LockToken, LockError> {
        validate_key(key)?;

        let (id, rx) = {
            let mut table = self.table();
            match table.get_mut(key) {
                None => {
                    let holder = LockEntry::grant(key);
                    let token = holder.token;
                    table.insert(
                        key.to_string(),
                        KeyState {
                            holder,
                            waiters: VecDeque::new(),
                        },
                    );
                    LockMetrics::incr(&self.metrics.acquisitions);
                    return Ok(token);
                }
                Some(state) => {
                    let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(Waiter { id, tx });
                    LockMetrics::incr(&self.metrics.contended);
                    debug!(key, queue_len = state.waiters.len(), "Waiting for lock");
                    (id, rx)
                }
            }
        };

        let mut pending = PendingWait {
            manager: self,
            key,
            id,
            rx,
            armed: true,
        };

        let waited = tokio::time::timeout(timeout, &mut pending.rx).await;
        match waited {
            Ok(Ok(entry)) => {
                pending.armed = false;
                LockMetrics::incr(&self.metrics.acquisitions);
                Ok(entry.token)
            }
            Ok(Err(_)) => {
                pending.armed = false;
                Err(LockError::Closed {
                    key: key.to_string(),
                })
            }
            Err(_) => match pending.withdraw() {
                // Handed over between the deadline and the withdrawal.
                Some(entry) => {
                    LockMetrics::incr(&self.metrics.acquisitions);
                    Ok(entry.token)
                }
                None => {
                    LockMetrics::incr(&self.metrics.timeouts);
                    let timeout_ms = timeout.as_millis() as u64;
                    warn!(key, timeout_ms, "Timed out waiting for lock");
                    Err(LockError::Timeout {
                        key: key.to_string(),
                        timeout_ms,
                    })
                }
            },
        }
    }

    /// Release `key` if `token` is its current grant.
    ///
    /// Returns false, and changes nothing, for an unknown key or a stale token.
    pub fn release_lock(&self, key: &str, token: LockToken) -> bool {
        let mut table = self.table();
        let matches = table
            .get(key)
            .map(|state| state.holder.token == token)
            .unwrap_or(false);

        if !matches {
            LockMetrics::incr(&self.metrics.mismatched_releases);
            debug!(key, %token, "Ignoring release from a non-holder");
            return false;
        }

        LockMetrics::incr(&self.metrics.releases);
        hand_off(&mut table, key);
        true
    }

    /// Acquire `key` and return a guard that releases it on drop.
    pub async fn lock(&self, key: &str, timeout: Duration) -> Result<LockGuard<'_>, LockError> {
        let token = self.acquire_lock(key, timeout).await?;
        Ok(LockGuard {
            manager: self,
            key: key.to_string(),
            token,
            released: false,
        })
    }

    /// Run `f` while holding `key`, waiting at most the configured default.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.with_lock_timeout(key, self.config.default_timeout, f)
            .await
    }

    /// Run `f` while holding `key`.
    ///
    /// The lock is released even if `f` panics or this future is dropped.
    pub async fn with_lock_timeout<F, Fut, T>(
        &self,
        key: &str,
        timeout: Duration,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lock(key, timeout).await?;
        let out = f().await;
        guard.release();
        Ok(out)
    }

    /// Reclaim every hold older than `max_hold`, passing the key to its next
    /// waiter. Returns how many holds were reclaimed.
    pub fn sweep_stale(&self) -> usize {
        let max_hold = self.config.max_hold;
        let mut table = self.table();

        let stale: Vec<String> = table
            .iter()
            .filter(|(_, state)| state.holder.held_for() >= max_hold)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            if let Some(state) = table.get(key) {
                warn!(
                    key = %key,
                    token = %state.holder.token,
                    held_ms = state.holder.held_for().as_millis() as u64,
                    waiting = state.waiters.len(),
                    "Reclaiming stale lock"
                );
            }
            LockMetrics::incr(&self.metrics.stale_reclaimed);
            hand_off(&mut table, key);
        }

        stale.len()
    }

    /// Start the periodic stale-lock sweep.
    ///
    /// The task holds only a weak reference and ends once the manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> TaskHandle {
        let weak = Arc::downgrade(self);
        every("lock-sweeper", self.config.sweep_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(manager) = weak.upgrade() {
                    let reclaimed = manager.sweep_stale();
                    if reclaimed > 0 {
                        debug!(reclaimed, "Lock sweep finished");
                    }
                }
            }
        })
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.table().contains_key(key)
    }

    pub fn holder(&self, key: &str) -> Option<LockEntry> {
        self.table().get(key).map(|state| state.holder.clone())
    }

    /// Number of tasks queued behind `key`.
    pub fn waiting(&self, key: &str) -> usize {
        self.table()
            .get(key)
            .map(|state| state.waiters.len())
            .unwrap_or(0)
    }

    pub fn held_keys(&self) -> usize {
        self.table().len()
    }

    pub fn metrics(&self) -> LockMetricsSnapshot {
        let table = self.table();
        let waiting = table.values().map(|state| state.waiters.len()).sum();
        self.metrics.snapshot(table.len(), waiting)
    }
}

impl Default for KeyedLockManager {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

impl fmt::Debug for KeyedLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLockManager")
            .field("config", &self.config)
            .field("held_keys", &self.held_keys())
            .finish()
    }
}

fn validate_key(key: &str) -> Result<(), LockError> {
    if key.is_empty() {
        return Err(LockError::InvalidKey {
            reason: "key must not be empty".to_string(),
        });
    }
    Ok(())
}

/// Pass `key` to the first waiter still listening, or drop it from the table.
fn hand_off(table: &mut LockTable, key: &str) {
    loop {
        let Some(state) = table.get_mut(key) else {
            return;
        };
        let Some(waiter) = state.waiters.pop_front() else {
            table.remove(key);
            return;
        };
        let entry = LockEntry::grant(key);
        if waiter.tx.send(entry.clone()).is_ok() {
            state.holder = entry;
            return;
        }
        // Receiver gone; try the next one.
    }
}

// ============================================================================
// WAITING AND GUARDS
// ============================================================================

/// A queued acquire. Withdraws itself from the queue if dropped while armed.
struct PendingWait<'a> {
    manager: &'a KeyedLockManager,
    key: &'a str,
    id: u64,
    rx: oneshot::Receiver<LockEntry>,
    armed: bool,
}

impl PendingWait<'_> {
    /// Leave the queue. Returns the entry if the key was already handed over.
    fn withdraw(&mut self) -> Option<LockEntry> {
        self.armed = false;
        let mut table = self.manager.table();
        if let Some(state) = table.get_mut(self.key) {
            let before = state.waiters.len();
            state.waiters.retain(|w| w.id != self.id);
            if state.waiters.len() != before {
                return None;
            }
        }
        // Not queued any more: hand_off sent under the same table lock.
        self.rx.try_recv().ok()
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(entry) = self.withdraw() {
            debug!(key = self.key, "Acquire cancelled after grant; passing lock on");
            self.manager.release_lock(self.key, entry.token);
        }
    }
}

/// Holds a key until dropped or released.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    manager: &'a KeyedLockManager,
    key: String,
    token: LockToken,
    released: bool,
}

impl LockGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> LockToken {
        self.token
    }

    /// Release now. Returns false if the hold had already been reclaimed.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.manager.release_lock(&self.key, self.token)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.manager.release_lock(&self.key, self.token);
        }
    }
}

impl fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> Arc<KeyedLockManager> {
        Arc::new(KeyedLockManager::new(LockConfig {
            default_timeout: Duration::from_secs(5),
            max_hold: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }))
    }

    #[tokio::test]
    async fn test_uncontended_acquire_and_release() {
        let locks = manager();
        let token = locks
            .acquire_lock("chat:u1", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(locks.is_locked("chat:u1"));
        assert!(locks.release_lock("chat:u1", token));
        assert!(!locks.is_locked("chat:u1"));
        assert_eq!(locks.held_keys(), 0);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let locks = manager();
        let err = locks
            .acquire_lock("", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidKey { .. }));
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let locks = manager();
        let a = locks.acquire_lock("a", Duration::from_millis(10)).await;
        let b = locks.acquire_lock("b", Duration::from_millis(10)).await;
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(locks.held_keys(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_overlap_under_contention() {
        let locks = manager();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let locks = locks.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                locks
                    .with_lock("doc", || async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(!locks.is_locked("doc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_granted_in_arrival_order() {
        let locks = manager();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = locks
            .acquire_lock("k", Duration::from_secs(1))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for id in 1..=3 {
            let task_locks = locks.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let token = task_locks
                    .acquire_lock("k", Duration::from_secs(10))
                    .await
                    .unwrap();
                order.lock().unwrap().push(id);
                task_locks.release_lock("k", token);
            }));
            // Let the task enqueue before spawning the next one.
            while locks.waiting("k") < id {
                tokio::task::yield_now().await;
            }
        }

        locks.release_lock("k", first);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_holder_unaffected() {
        let locks = manager();
        let holder = locks
            .acquire_lock("k", Duration::from_secs(1))
            .await
            .unwrap();

        let err = locks
            .acquire_lock("k", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LockError::Timeout {
                key: "k".into(),
                timeout_ms: 100
            }
        );
        assert_eq!(locks.waiting("k"), 0);
        assert_eq!(locks.holder("k").unwrap().token, holder);
        assert!(locks.release_lock("k", holder));
        assert_eq!(locks.metrics().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_sections_serialize() {
        let locks = manager();
        let start = Instant::now();
        let body = || async {
            let entered = Instant::now();
            tokio::time::sleep(Duration::from_millis(50)).await;
            (entered, Instant::now())
        };

        let (a, b) = tokio::join!(locks.with_lock("k", body), locks.with_lock("k", body));
        let (a_enter, a_exit) = a.unwrap();
        let (b_enter, b_exit) = b.unwrap();
        assert!(a_exit - a_enter >= Duration::from_millis(50));
        assert!(b_enter >= a_exit, "second body started before the first finished");
        assert!(b_exit - start >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_release_with_wrong_token_is_noop() {
        let locks = manager();
        let holder = locks
            .acquire_lock("k", Duration::from_millis(10))
            .await
            .unwrap();
        let other = locks
            .acquire_lock("other", Duration::from_millis(10))
            .await
            .unwrap();

        assert!(!locks.release_lock("k", other));
        assert!(!locks.release_lock("missing", holder));
        assert_eq!(locks.holder("k").unwrap().token, holder);
        assert_eq!(locks.metrics().mismatched_releases, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_leaves_queue() {
        let locks = manager();
        let holder = locks
            .acquire_lock("k", Duration::from_secs(1))
            .await
            .unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire_lock("k", Duration::from_secs(30)).await })
        };
        while locks.waiting("k") == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(locks.waiting("k"), 0);
        assert!(locks.release_lock("k", holder));
        assert!(!locks.is_locked("k"));
    }

    #[tokio::test]
    async fn test_guard_released_on_early_return() {
        let locks = manager();

        async fn failing_body(locks: &KeyedLockManager) -> Result<(), String> {
            let _guard = locks
                .lock("k", Duration::from_millis(10))
                .await
                .map_err(|e| e.to_string())?;
            "not a number".parse::<u32>().map_err(|e| e.to_string())?;
            Ok(())
        }

        assert!(failing_body(&locks).await.is_err());
        assert!(!locks.is_locked("k"));
    }

    #[tokio::test]
    async fn test_lock_released_when_body_panics() {
        let locks = manager();
        let task = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .with_lock("k", || async { panic!("boom") })
                    .await
                    .map(|_: ()| ())
            })
        };
        assert!(task.await.is_err());
        assert!(!locks.is_locked("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reclaims_stale_hold() {
        let locks = manager();
        let stale = locks
            .acquire_lock("k", Duration::from_secs(1))
            .await
            .unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire_lock("k", Duration::from_secs(120)).await })
        };
        while locks.waiting("k") == 0 {
            tokio::task::yield_now().await;
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(locks.sweep_stale(), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(locks.sweep_stale(), 1);

        let fresh = waiter.await.unwrap().unwrap();
        assert_ne!(fresh, stale);
        assert!(!locks.release_lock("k", stale));
        assert!(locks.release_lock("k", fresh));
        assert_eq!(locks.metrics().stale_reclaimed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_runs_periodically() {
        let locks = manager();
        let _token = locks
            .acquire_lock("k", Duration::from_secs(1))
            .await
            .unwrap();
        let sweeper = locks.spawn_sweeper();

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(!locks.is_locked("k"));
        sweeper.cancel();
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let locks = manager();
        let token = locks
            .acquire_lock("k", Duration::from_millis(10))
            .await
            .unwrap();
        let snapshot = locks.metrics();
        assert_eq!(snapshot.acquisitions, 1);
        assert_eq!(snapshot.held_keys, 1);
        assert_eq!(snapshot.waiting, 0);
        locks.release_lock("k", token);
        assert_eq!(locks.metrics().releases, 1);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn paused_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        /// Property: however many tasks contend for one key, and however long
        /// each holds it, at most one is inside the critical section and all
        /// eventually finish.
        #[test]
        fn prop_single_holder(holds in prop::collection::vec(1u64..20, 1..8)) {
            let rt = paused_runtime();
            let (peak, done, held_after) = rt.block_on(async {
                let locks = Arc::new(KeyedLockManager::default());
                let active = Arc::new(AtomicUsize::new(0));
                let peak = Arc::new(AtomicUsize::new(0));
                let done = Arc::new(AtomicUsize::new(0));

                let mut tasks = Vec::new();
                for ms in holds.iter().copied() {
                    let (locks, active, peak, done) =
                        (locks.clone(), active.clone(), peak.clone(), done.clone());
                    tasks.push(tokio::spawn(async move {
                        locks
                            .with_lock_timeout("k", Duration::from_secs(60), || async move {
                                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(ms)).await;
                                active.fetch_sub(1, Ordering::SeqCst);
                                done.fetch_add(1, Ordering::SeqCst);
                            })
                            .await
                    }));
                }
                for task in tasks {
                    task.await.unwrap().unwrap();
                }
                (
                    peak.load(Ordering::SeqCst),
                    done.load(Ordering::SeqCst),
                    locks.held_keys(),
                )
            });

            prop_assert_eq!(peak, 1);
            prop_assert_eq!(done, holds.len());
            prop_assert_eq!(held_after, 0);
        }
    }
}
