use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use vigil_cache::{CacheConfig, CacheEngine, CacheRequest, CacheType, FetchOptions, FetchResult, RegisterOptions, RequestInfo};
use vigil_core::{BackoffPolicy, Index, UpdateEvent, VigilError, VigilResult};

#[derive(Debug, Clone)]
struct Req {
    min_index: Index,
    timeout: Duration,
    allow_stale: bool,
}

impl CacheRequest for Req {
    fn cache_info(&self) -> RequestInfo {
        RequestInfo {
            key: "service/web".into(),
            token: "t1".into(),
            datacenter: "dc1".into(),
            min_index: self.min_index,
            timeout: self.timeout,
            allow_stale: self.allow_stale,
        }
    }
}

fn req(min_index: Index, timeout: Duration) -> Req {
    Req { min_index, timeout, allow_stale: false }
}

struct State {
    index: Index,
    value: String,
    fail: Option<VigilError>,
}

/// Blocking upstream: returns once its index differs from `min_index`.
struct Upstream {
    state: Mutex<State>,
    changed: Notify,
    calls: AtomicU64,
    answered: AtomicU64,
    saw_allow_stale: AtomicBool,
    stale_calls: AtomicU64,
    consistent_calls: AtomicU64,
    delay: Duration,
}

impl Upstream {
    fn new(index: Index, value: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State { index, value: value.into(), fail: None }),
            changed: Notify::new(),
            calls: AtomicU64::new(0),
            answered: AtomicU64::new(0),
            saw_allow_stale: AtomicBool::new(false),
            stale_calls: AtomicU64::new(0),
            consistent_calls: AtomicU64::new(0),
            delay,
        })
    }

    fn set(&self, index: Index, value: &str) {
        {
            let mut s = self.state.lock().unwrap();
            s.index = index;
            s.value = value.into();
            s.fail = None;
        }
        self.changed.notify_waiters();
    }

    fn fail(&self, err: VigilError) {
        self.state.lock().unwrap().fail = Some(err);
        self.changed.notify_waiters();
    }

    /// Fetches started, including one the refresh task may have parked upstream.
    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fetches that returned a value.
    fn answered(&self) -> u64 {
        self.answered.load(Ordering::SeqCst)
    }
}

struct Fake(Arc<Upstream>);

#[async_trait]
impl CacheType for Fake {
    type Request = Req;
    type Value = String;

    async fn fetch(&self, opts: FetchOptions<String>, _req: &Req) -> VigilResult<FetchResult<String>> {
        let up = &self.0;
        up.calls.fetch_add(1, Ordering::SeqCst);
        up.saw_allow_stale.store(opts.allow_stale, Ordering::SeqCst);
        if opts.allow_stale {
            up.stale_calls.fetch_add(1, Ordering::SeqCst);
        } else {
            up.consistent_calls.fetch_add(1, Ordering::SeqCst);
        }
        if !up.delay.is_zero() {
            tokio::time::sleep(up.delay).await;
        }
        let deadline = tokio::time::Instant::now() + opts.timeout;
        loop {
            let notified = up.changed.notified();
            {
                let s = up.state.lock().unwrap();
                if let Some(err) = &s.fail {
                    return Err(err.clone());
                }
                if opts.min_index == 0 || s.index != opts.min_index {
                    up.answered.fetch_add(1, Ordering::SeqCst);
                    return Ok(FetchResult { value: s.value.clone(), index: s.index });
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let s = up.state.lock().unwrap();
                up.answered.fetch_add(1, Ordering::SeqCst);
                return Ok(FetchResult { value: s.value.clone(), index: s.index });
            }
        }
    }

    fn register_options(&self) -> RegisterOptions {
        RegisterOptions::blocking()
    }
}

fn config() -> CacheConfig {
    CacheConfig {
        idle_ttl: Duration::from_secs(60),
        max_wait: Duration::from_secs(10),
        backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(50)),
    }
}

fn engine(up: &Arc<Upstream>, cfg: CacheConfig) -> CacheEngine<Fake> {
    CacheEngine::new("test-service", Fake(Arc::clone(up)), cfg)
}

async fn next(rx: &mut mpsc::Receiver<UpdateEvent<String>>) -> UpdateEvent<String> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.expect("event in time").expect("stream open")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_waiters_share_one_upstream_call() {
    let up = Upstream::new(6, "v6", Duration::from_millis(100));
    let cache = engine(&up, config());
    let (ra, rb) = (req(5, Duration::from_secs(5)), req(5, Duration::from_secs(5)));
    let (a, b) = tokio::join!(cache.get(&ra), cache.get(&rb));
    let (a, b) = (a.expect("a"), b.expect("b"));
    assert_eq!((a.index, a.value.as_str()), (6, "v6"));
    assert_eq!((b.index, b.value.as_str()), (6, "v6"));
    assert_eq!(up.answered(), 1);
    // At most the follow-up blocking fetch is outstanding.
    assert!(up.calls() <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn many_concurrent_gets_issue_one_fetch() {
    let up = Upstream::new(3, "v3", Duration::from_millis(100));
    let cache = engine(&up, config());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move { cache.get(&req(0, Duration::ZERO)).await }));
    }
    for h in handles {
        assert_eq!(h.await.expect("join").expect("get").index, 3);
    }
    assert_eq!(up.answered(), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn warm_failure_serves_last_value_degraded() {
    let up = Upstream::new(1, "v1", Duration::ZERO);
    let cache = engine(&up, config());
    let first = cache.get(&req(0, Duration::ZERO)).await.expect("first");
    assert!(!first.is_degraded());

    up.fail(VigilError::Upstream("connection refused".into()));
    let second = cache.get(&req(1, Duration::from_secs(2))).await.expect("served stale");
    assert_eq!(second.value, "v1");
    assert_eq!(second.index, 1);
    assert_eq!(second.degraded, Some(VigilError::Upstream("connection refused".into())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cold_failure_returns_the_error() {
    let up = Upstream::new(1, "v1", Duration::ZERO);
    up.fail(VigilError::Upstream("no leader".into()));
    let cache = engine(&up, config());
    let err = cache.get(&req(0, Duration::ZERO)).await.unwrap_err();
    assert_eq!(err, VigilError::Upstream("no leader".into()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permission_denied_is_never_cached() {
    let up = Upstream::new(1, "v1", Duration::ZERO);
    up.fail(VigilError::PermissionDenied("service:read on web not allowed".into()));
    let cache = engine(&up, config());
    assert!(cache.get(&req(0, Duration::ZERO)).await.unwrap_err().is_permission_denied());
    assert!(cache.is_empty());
    assert!(cache.get(&req(0, Duration::ZERO)).await.unwrap_err().is_permission_denied());
    assert_eq!(up.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn allow_stale_is_forwarded() {
    let up = Upstream::new(1, "v1", Duration::ZERO);
    let cache = engine(&up, config());
    let stale = Req { min_index: 0, timeout: Duration::ZERO, allow_stale: true };
    cache.get(&stale).await.expect("get");
    assert!(up.saw_allow_stale.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_and_consistent_consumers_do_not_share_an_entry() {
    let up = Upstream::new(1, "v1", Duration::ZERO);
    let cache = engine(&up, config());
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(8);
    let stale = Req { min_index: 0, timeout: Duration::ZERO, allow_stale: true };
    cache.notify(cancel.clone(), stale.clone(), "stale-sub", tx).expect("subscribe");
    assert_eq!(next(&mut rx).await.index, 1);
    assert_eq!(up.consistent_calls.load(Ordering::SeqCst), 0);

    let strict = cache.get(&req(0, Duration::ZERO)).await.expect("consistent get");
    assert!(!strict.hit, "consistent read served from the stale entry");
    assert!(up.consistent_calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(cache.len(), 2);
    let stale_key = cache.inspect(&stale).expect("stale entry").key;
    let strict_key = cache.inspect(&req(0, Duration::ZERO)).expect("consistent entry").key;
    assert_ne!(stale_key, strict_key);

    up.set(2, "v2");
    let res = cache.get(&req(1, Duration::from_secs(2))).await.expect("consistent long poll");
    assert_eq!((res.index, res.value.as_str()), (2, "v2"));
    assert_eq!(next(&mut rx).await.index, 2);
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unchanged_index_returns_current_value_after_timeout() {
    let up = Upstream::new(1, "v1", Duration::ZERO);
    let cache = engine(&up, config());
    cache.get(&req(0, Duration::ZERO)).await.expect("prime");
    let started = std::time::Instant::now();
    let res = cache.get(&req(1, Duration::from_millis(100))).await.expect("timeout answer");
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!((res.index, res.hit), (1, false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn served_key_keeps_refreshing_within_idle_window() {
    let up = Upstream::new(1, "v1", Duration::ZERO);
    let cache = engine(&up, config());
    cache.get(&req(0, Duration::ZERO)).await.expect("prime");

    up.set(2, "v2");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let before = up.calls();
    let res = cache.get(&req(0, Duration::ZERO)).await.expect("prefetched");
    assert!(res.hit);
    assert_eq!((res.index, res.value.as_str()), (2, "v2"));
    assert_eq!(up.calls(), before, "a hit reached upstream");

    // A long-poll round costs only the refresh task's own follow-up fetch.
    let before = up.calls();
    let poll = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get(&req(2, Duration::from_secs(2))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    up.set(3, "v3");
    let res = poll.await.expect("join").expect("long poll");
    assert_eq!((res.index, res.value.as_str()), (3, "v3"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(up.calls(), before + 1);

    let info = cache.inspect(&req(0, Duration::ZERO)).expect("entry");
    assert!(info.fetched_at.is_some());
    assert_eq!(info.consumers, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_entry_is_evicted() {
    let up = Upstream::new(1, "v1", Duration::ZERO);
    let cache = engine(&up, CacheConfig { idle_ttl: Duration::from_millis(50), ..config() });
    cache.get(&req(0, Duration::ZERO)).await.expect("get");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(cache.is_empty());
    assert_eq!(cache.stats().evictions(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notify_pushes_current_value_then_changes() {
    let up = Upstream::new(1, "v1", Duration::ZERO);
    let cache = engine(&up, config());
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(8);
    cache.notify(cancel.clone(), req(0, Duration::ZERO), "sub-1", tx).expect("subscribe");

    let first = next(&mut rx).await;
    assert_eq!(first.correlation_id, "sub-1");
    assert_eq!((first.index, first.result.expect("value")), (1, "v1".to_string()));

    // The refresh task is now blocked upstream; a hit needs no new fetch.
    let hit = cache.get(&req(0, Duration::ZERO)).await.expect("hit");
    assert!(hit.hit);

    up.set(2, "v2");
    let second = next(&mut rx).await;
    assert_eq!((second.index, second.result.expect("value")), (2, "v2".to_string()));

    let info = cache.inspect(&req(0, Duration::ZERO)).expect("entry");
    assert_eq!(info.consumers, 1);
    assert!(info.has_value);
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_failures_are_pushed_then_recover() {
    let up = Upstream::new(1, "v1", Duration::ZERO);
    let cache = engine(&up, config());
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(32);
    cache.notify(cancel.clone(), req(0, Duration::ZERO), "sub-2", tx).expect("subscribe");
    assert_eq!(next(&mut rx).await.index, 1);

    up.fail(VigilError::Upstream("timeout".into()));
    let failed = next(&mut rx).await;
    assert!(failed.is_error());
    assert_eq!(failed.index, 1);

    up.set(2, "v2");
    loop {
        let ev = next(&mut rx).await;
        if let Ok(value) = ev.result {
            assert_eq!((ev.index, value.as_str()), (2, "v2"));
            break;
        }
    }
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backwards_index_is_rebased_forward() {
    let up = Upstream::new(10, "v10", Duration::ZERO);
    let cache = engine(&up, config());
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(8);
    cache.notify(cancel.clone(), req(0, Duration::ZERO), "sub-3", tx).expect("subscribe");
    assert_eq!(next(&mut rx).await.index, 10);

    up.set(3, "restored");
    let rebased = next(&mut rx).await;
    assert_eq!((rebased.index, rebased.result.expect("value")), (11, "restored".to_string()));

    up.set(4, "after");
    assert_eq!(next(&mut rx).await.index, 12);
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_cancels_waiting_getters() {
    let up = Upstream::new(1, "v1", Duration::ZERO);
    let cache = engine(&up, config());
    cache.get(&req(0, Duration::ZERO)).await.expect("prime");
    let waiter = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get(&req(1, Duration::from_secs(5))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cache.close();
    let res = tokio::time::timeout(Duration::from_secs(2), waiter).await.expect("prompt").expect("join");
    assert!(matches!(res, Err(VigilError::Canceled(_))));
    assert!(matches!(cache.get(&req(0, Duration::ZERO)).await, Err(VigilError::Canceled(_))));
}
