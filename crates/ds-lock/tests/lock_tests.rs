//! DistributedLockService / LockSession Tests
//!
//! Tests for:
//! - Acquire / release lifecycle and terminal states
//! - Mutual exclusion and hand-over between contenders
//! - Lease renewal and loss detection
//! - Bounded waiting and protocol violations
//! - Scoped acquisition on every exit path

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ds_backend::{
    BackendError, CoordinationBackend, CreateOutcome, DeleteOutcome, MemoryBackend, Node,
    SwapOutcome, WatchAction, WatchEvent,
};
use ds_lock::{DistributedLockService, LockError, LockServiceConfig, LockState};
use futures::FutureExt;
use tokio_test::{assert_err, assert_ok};

fn setup() -> (Arc<MemoryBackend>, DistributedLockService) {
    ds_common::logging::init_test_logging();
    let backend = Arc::new(MemoryBackend::new());
    let service = DistributedLockService::new(backend.clone());
    (backend, service)
}

#[tokio::test(start_paused = true)]
async fn test_acquire_and_release() {
    let (backend, service) = setup();

    let session = service.acquire("orders", 15).await.unwrap();
    assert_eq!(session.key(), "/DistributedLock/locks/orders");
    assert_eq!(session.state(), LockState::Active);

    let stored = backend.get(session.key()).unwrap();
    assert_eq!(stored.value, session.token());
    assert_eq!(stored.ttl, Some(15));

    assert_ok!(session.release().await);
    assert_eq!(session.state(), LockState::Released);
    assert!(backend.get("/DistributedLock/locks/orders").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_double_release_fails() {
    let (_backend, service) = setup();
    let session = service.acquire("orders", 15).await.unwrap();

    assert_ok!(session.release().await);
    assert!(matches!(session.release().await, Err(LockError::LockNotHeld { .. })));
    assert!(matches!(session.renew_lock().await, Err(LockError::LockNotHeld { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_tokens_are_fresh_per_acquisition() {
    let (_backend, service) = setup();

    let first = service.acquire("orders", 15).await.unwrap();
    let first_token = first.token().to_string();
    first.release().await.unwrap();

    let second = service.acquire("orders", 15).await.unwrap();
    assert_ne!(first_token, second.token());
}

#[tokio::test(start_paused = true)]
async fn test_try_acquire_does_not_wait() {
    let (_backend, service) = setup();

    let holder = service.try_acquire("orders", 15).await.unwrap();
    assert!(holder.is_some());

    let contender = service.try_acquire("orders", 15).await.unwrap();
    assert!(contender.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_waiter_acquires_after_release() {
    let (backend, service) = setup();
    let service = Arc::new(service);

    let holder = service.acquire("orders", 15).await.unwrap();

    let waiter = {
        let service = service.clone();
        tokio::spawn(async move { service.acquire("orders", 15).await })
    };

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!waiter.is_finished(), "waiter must block while the lock is held");
    assert_eq!(backend.get(holder.key()).unwrap().value, holder.token());

    holder.release().await.unwrap();

    let session = waiter.await.unwrap().unwrap();
    assert_eq!(session.state(), LockState::Active);
    assert_eq!(backend.get(session.key()).unwrap().value, session.token());
}

#[tokio::test(start_paused = true)]
async fn test_waiter_acquires_after_holder_lease_lapses() {
    let (backend, service) = setup();

    // A holder that crashed: wrote the key and never renews it
    let key = service.lock_key("orders");
    backend.create_if_absent(&key, "crashed-holder", 3).await.unwrap();

    let started = tokio::time::Instant::now();
    let session = service.acquire("orders", 15).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(backend.get(&key).unwrap().value, session.token());
}

#[tokio::test(start_paused = true)]
async fn test_holder_renewals_do_not_wake_waiters() {
    let (backend, service) = setup();
    let service = Arc::new(service);

    let holder = service.acquire("orders", 5).await.unwrap();

    let waiter = {
        let service = service.clone();
        tokio::spawn(async move { service.acquire("orders", 5).await })
    };

    // Several renewals happen in this window; each shows up as a compareAndSwap event
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(!waiter.is_finished());
    assert_eq!(holder.state(), LockState::Active);

    holder.release().await.unwrap();
    let session = waiter.await.unwrap().unwrap();
    assert_eq!(backend.get(session.key()).unwrap().value, session.token());
}

#[tokio::test(start_paused = true)]
async fn test_renewal_keeps_lease_alive() {
    let (backend, service) = setup();

    let session = service.acquire("orders", 4).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(session.state(), LockState::Active);
    assert!(session.is_renewing());
    let stored = backend.get(session.key()).unwrap();
    assert_eq!(stored.value, session.token());
    assert!(stored.ttl.unwrap() > 0);
}

/// Delegates to a MemoryBackend; lease refreshes fail while `swaps_fail` is set
struct PartitionedBackend {
    inner: MemoryBackend,
    swaps_fail: AtomicBool,
}

impl PartitionedBackend {
    fn new() -> Self {
        Self { inner: MemoryBackend::new(), swaps_fail: AtomicBool::new(false) }
    }

    fn partition(&self) {
        self.swaps_fail.store(true, Ordering::SeqCst);
    }

    fn heal(&self) {
        self.swaps_fail.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl CoordinationBackend for PartitionedBackend {
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: u64,
    ) -> ds_backend::Result<CreateOutcome> {
        self.inner.create_if_absent(key, value, ttl).await
    }

    async fn create_sequential(
        &self,
        parent: &str,
        value: &str,
        ttl: u64,
    ) -> ds_backend::Result<Node> {
        self.inner.create_sequential(parent, value, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: u64,
    ) -> ds_backend::Result<SwapOutcome> {
        if self.swaps_fail.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("partitioned".to_string()));
        }
        self.inner.compare_and_swap(key, expected, value, ttl).await
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> ds_backend::Result<DeleteOutcome> {
        self.inner.compare_and_delete(key, expected).await
    }

    async fn set(&self, key: &str, value: &str, ttl: u64) -> ds_backend::Result<Node> {
        self.inner.set(key, value, ttl).await
    }

    async fn list_sorted(&self, key: &str) -> ds_backend::Result<Vec<Node>> {
        self.inner.list_sorted(key).await
    }

    async fn watch(&self, key: &str, wait_index: Option<u64>) -> ds_backend::Result<WatchEvent> {
        self.inner.watch(key, wait_index).await
    }
}

fn partitioned_setup() -> (Arc<PartitionedBackend>, DistributedLockService) {
    ds_common::logging::init_test_logging();
    let backend = Arc::new(PartitionedBackend::new());
    let service = DistributedLockService::new(backend.clone());
    (backend, service)
}

#[tokio::test(start_paused = true)]
async fn test_smallest_ttl_is_renewed() {
    let (backend, service) = setup();

    let session = service.acquire("orders", 1).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(session.state(), LockState::Active);
    assert!(session.is_renewing());
    assert_eq!(backend.get(session.key()).unwrap().value, session.token());
}

#[tokio::test(start_paused = true)]
async fn test_failed_background_renewal_keeps_retrying() {
    let (backend, service) = partitioned_setup();

    let session = service.acquire("orders", 10).await.unwrap();
    backend.partition();
    tokio::time::sleep(Duration::from_millis(8500)).await;
    assert!(session.is_renewing());
    assert_eq!(session.state(), LockState::Active);

    backend.heal();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(session.state(), LockState::Active);
    assert_eq!(backend.inner.get(session.key()).unwrap().value, session.token());
}

#[tokio::test(start_paused = true)]
async fn test_explicit_renew_refreshes_ttl() {
    let (backend, service) = partitioned_setup();
    backend.partition();

    let session = service.acquire("orders", 10).await.unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(backend.inner.get(session.key()).unwrap().ttl, Some(4));

    backend.heal();
    assert_ok!(session.renew_lock().await);
    assert_eq!(backend.inner.get(session.key()).unwrap().ttl, Some(10));
}

#[tokio::test(start_paused = true)]
async fn test_unrenewed_lock_is_reclaimable() {
    let (backend, service) = partitioned_setup();
    backend.partition();

    let stale = service.acquire("orders", 5).await.unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(backend.inner.get(stale.key()).is_none());

    let fresh = service.acquire("orders", 5).await.unwrap();
    assert_eq!(backend.inner.get(fresh.key()).unwrap().value, fresh.token());

    // Once refreshes go through again the stale session finds the new holder's token
    let mut states = stale.subscribe();
    backend.heal();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == LockState::Expired))
        .await
        .expect("stale session should notice the lapse")
        .unwrap();

    assert!(matches!(stale.renew_lock().await, Err(LockError::LockNotHeld { .. })));
    assert!(matches!(stale.release().await, Err(LockError::LockNotHeld { .. })));

    // The stale session must not have touched the new holder's key
    assert_eq!(backend.inner.get(fresh.key()).unwrap().value, fresh.token());
    assert_eq!(fresh.state(), LockState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_renewal_loop_detects_takeover() {
    let (backend, service) = setup();

    let session = service.acquire("orders", 5).await.unwrap();
    let mut states = session.subscribe();

    backend.set(session.key(), "intruder", 0).await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), states.wait_for(|s| *s == LockState::Expired))
        .await
        .expect("renewal loop should notice the takeover")
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!session.is_renewing());
    assert_eq!(backend.get(session.key()).unwrap().value, "intruder");
}

#[tokio::test(start_paused = true)]
async fn test_release_after_lapse_reports_expired() {
    let (backend, service) = partitioned_setup();
    backend.partition();

    let session = service.acquire("orders", 2).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(matches!(session.release().await, Err(LockError::LockExpired { .. })));
    assert_eq!(session.state(), LockState::Expired);
}

#[tokio::test(start_paused = true)]
async fn test_release_stops_renewal_loop() {
    let (_backend, service) = setup();

    let session = service.acquire("orders", 15).await.unwrap();
    assert!(session.is_renewing());

    session.release().await.unwrap();
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!session.is_renewing());
}

#[tokio::test(start_paused = true)]
async fn test_max_wait_times_out() {
    let backend = Arc::new(MemoryBackend::new());
    let config = LockServiceConfig::default().with_max_wait(Duration::from_secs(2));
    let service = DistributedLockService::with_config(backend.clone(), config);

    backend
        .create_if_absent(&service.lock_key("orders"), "forever", 0)
        .await
        .unwrap();

    match service.acquire("orders", 5).await {
        Err(LockError::WaitTimeout { key, waited }) => {
            assert_eq!(key, "/DistributedLock/locks/orders");
            assert!(waited >= Duration::from_secs(2));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

/// Delegates to a MemoryBackend but reports an action outside the known set
struct StrangeWatchBackend {
    inner: MemoryBackend,
}

#[async_trait]
impl CoordinationBackend for StrangeWatchBackend {
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: u64,
    ) -> ds_backend::Result<CreateOutcome> {
        self.inner.create_if_absent(key, value, ttl).await
    }

    async fn create_sequential(
        &self,
        parent: &str,
        value: &str,
        ttl: u64,
    ) -> ds_backend::Result<Node> {
        self.inner.create_sequential(parent, value, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: u64,
    ) -> ds_backend::Result<SwapOutcome> {
        self.inner.compare_and_swap(key, expected, value, ttl).await
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> ds_backend::Result<DeleteOutcome> {
        self.inner.compare_and_delete(key, expected).await
    }

    async fn set(&self, key: &str, value: &str, ttl: u64) -> ds_backend::Result<Node> {
        self.inner.set(key, value, ttl).await
    }

    async fn list_sorted(&self, key: &str) -> ds_backend::Result<Vec<Node>> {
        self.inner.list_sorted(key).await
    }

    async fn watch(&self, key: &str, _wait_index: Option<u64>) -> ds_backend::Result<WatchEvent> {
        Ok(WatchEvent {
            action: WatchAction::Other("get".to_string()),
            node: self.inner.get(key).unwrap_or(Node {
                key: key.to_string(),
                value: String::new(),
                created_index: 0,
                modified_index: 0,
                ttl: None,
                expiration: None,
            }),
        })
    }
}

#[tokio::test]
async fn test_unknown_watch_action_fails_acquisition() {
    let backend = Arc::new(StrangeWatchBackend { inner: MemoryBackend::new() });
    let service = DistributedLockService::new(backend.clone());

    let _holder = service.acquire("orders", 15).await.unwrap();

    match service.acquire("orders", 15).await {
        Err(LockError::UnexpectedWatchAction { action, .. }) => assert_eq!(action, "get"),
        other => panic!("expected protocol violation, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_with_lock_releases_after_success() {
    let (backend, service) = setup();

    let value = service
        .with_lock("orders", 15, |session| {
            async move {
                assert!(session.is_active());
                session.key().to_string()
            }
            .boxed()
        })
        .await
        .unwrap();

    assert_eq!(value, "/DistributedLock/locks/orders");
    assert!(backend.get(&value).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_with_lock_releases_when_work_fails() {
    let (backend, service) = setup();

    let result: Result<Result<(), String>, LockError> = service
        .with_lock("orders", 15, |_session| async move { Err("work failed".to_string()) }.boxed())
        .await;

    assert_eq!(assert_ok!(result), Err("work failed".to_string()));
    assert!(backend.get("/DistributedLock/locks/orders").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_with_lock_releases_on_panic() {
    let (backend, service) = setup();
    let service = Arc::new(service);

    let task = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .with_lock("orders", 15, |_session| async move { panic!("boom") }.boxed())
                .await
        })
    };

    let joined = task.await;
    assert!(joined.unwrap_err().is_panic());
    assert!(backend.get("/DistributedLock/locks/orders").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_with_lock_surfaces_lost_lease() {
    let (backend, service) = setup();
    let intruder = backend.clone();

    let result = service
        .with_lock("orders", 5, move |session| {
            async move {
                intruder.set(session.key(), "intruder", 0).await.unwrap();
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            .boxed()
        })
        .await;

    assert!(matches!(result, Err(LockError::LockExpired { .. })));
    assert_eq!(backend.get("/DistributedLock/locks/orders").unwrap().value, "intruder");
}

#[tokio::test(start_paused = true)]
async fn test_with_lock_tolerates_manual_release() {
    let (_backend, service) = setup();

    let result = service
        .with_lock("orders", 15, |session| async move { session.release().await }.boxed())
        .await;

    assert_ok!(assert_ok!(result));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_session_releases_in_background() {
    let (backend, service) = setup();

    let session = service.acquire("orders", 15).await.unwrap();
    let key = session.key().to_string();
    drop(session);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(backend.get(&key).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_mutual_exclusion_under_contention() {
    let (backend, service) = setup();
    let service = Arc::new(service);
    let inside = Arc::new(AtomicBool::new(false));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let service = service.clone();
        let inside = inside.clone();
        let completed = completed.clone();
        tasks.push(tokio::spawn(async move {
            service
                .with_lock("counter", 5, move |_session| {
                    async move {
                        assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        inside.store(false, Ordering::SeqCst);
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                    .boxed()
                })
                .await
        }));
    }

    for task in tasks {
        assert_ok!(task.await.unwrap());
    }

    assert_eq!(completed.load(Ordering::SeqCst), 5);
    assert!(backend.get("/DistributedLock/locks/counter").is_none());
}

#[tokio::test]
async fn test_acquire_propagates_invalid_input() {
    let (_backend, service) = setup();
    assert_err!(service.acquire("  ", 15).await);
}
