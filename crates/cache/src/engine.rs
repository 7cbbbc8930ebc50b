//! Per-key fetch deduplication with consumer-gated background refresh.
//!
//! Every cache key has one refresh task. It is the only caller of the upstream for that key
//! and publishes [`Snapshot`]s through a `watch` channel; getters and subscriptions only read
//! those snapshots. The task keeps issuing blocking fetches with the last index, so updates
//! land in the snapshot before anyone asks for them. It stops, and the entry is evicted, once
//! the key has had no consumers for `idle_ttl`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::config::{env_millis, env_secs};
use vigil_core::{BackoffPolicy, Index, UpdateEvent, VigilError, VigilResult};

use crate::stats::CacheStats;
use crate::types::{CacheRequest, CacheType, FetchOptions, RegisterOptions, RequestInfo};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// How long an entry without consumers survives.
    pub idle_ttl: Duration,
    /// Upper bound on how long a blocking `get` waits.
    pub max_wait: Duration,
    /// Retry pacing after upstream failures.
    pub backoff: BackoffPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(72 * 3600),
            max_wait: Duration::from_secs(600),
            backoff: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(60)),
        }
    }
}

impl CacheConfig {
    /// `VIGIL_CACHE_IDLE_SECS`, `VIGIL_CACHE_MAX_WAIT_MS`, `VIGIL_CACHE_BACKOFF_BASE_MS`,
    /// `VIGIL_CACHE_BACKOFF_MAX_MS`
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            idle_ttl: env_secs("VIGIL_CACHE_IDLE_SECS", d.idle_ttl),
            max_wait: env_millis("VIGIL_CACHE_MAX_WAIT_MS", d.max_wait),
            backoff: BackoffPolicy::from_env("VIGIL_CACHE", d.backoff),
            ..d
        }
    }

    fn wait_for(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            self.max_wait
        } else {
            requested.min(self.max_wait)
        }
    }
}

/// Answer to a `get`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult<V> {
    pub value: V,
    pub index: Index,
    /// Served from the snapshot without waiting for a fetch.
    pub hit: bool,
    /// Set when the value is the last good one and the latest refresh failed.
    pub degraded: Option<VigilError>,
}

impl<V> CacheResult<V> {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// Point-in-time view of one entry.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub key: String,
    pub index: Index,
    pub has_value: bool,
    pub last_error: Option<VigilError>,
    pub fetch_in_flight: bool,
    pub consumers: usize,
    pub last_access: Instant,
    /// When the last successful upstream fetch completed.
    pub fetched_at: Option<Instant>,
}

#[derive(Debug)]
struct Snapshot<V> {
    value: Option<V>,
    index: Index,
    error: Option<VigilError>,
    generation: u64,
    fetched_at: Option<Instant>,
    /// Nothing is published after this one.
    terminal: bool,
}

impl<V> Snapshot<V> {
    fn empty() -> Self {
        Self { value: None, index: 0, error: None, generation: 0, fetched_at: None, terminal: false }
    }
}

fn result_from<V: Clone>(snap: &Snapshot<V>, hit: bool) -> VigilResult<CacheResult<V>> {
    match &snap.value {
        Some(value) => Ok(CacheResult { value: value.clone(), index: snap.index, hit, degraded: snap.error.clone() }),
        None => Err(snap.error.clone().unwrap_or_else(|| VigilError::Upstream("no value fetched yet".into()))),
    }
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    min_index: Index,
    /// Snapshot generation observed when the getter arrived.
    seen: u64,
}

impl Waiter {
    fn served_by<V>(&self, snap: &Snapshot<V>) -> bool {
        snap.generation > self.seen
            && (snap.error.is_some() || (snap.value.is_some() && (self.min_index == 0 || snap.index > self.min_index)))
    }
}

struct Demand {
    subscribers: usize,
    getters: usize,
    /// Last time a consumer arrived or left.
    last_access: Instant,
}

impl Demand {
    fn consumers(&self) -> usize {
        self.subscribers + self.getters
    }
}

struct Entry<V> {
    key: String,
    state: watch::Sender<Arc<Snapshot<V>>>,
    demand: Mutex<Demand>,
    /// Signalled whenever the consumer count changes.
    wake: Notify,
    fetching: AtomicBool,
}

impl<V> Entry<V> {
    fn new(key: String) -> Self {
        Self {
            key,
            state: watch::channel(Arc::new(Snapshot::empty())).0,
            demand: Mutex::new(Demand { subscribers: 0, getters: 0, last_access: Instant::now() }),
            wake: Notify::new(),
            fetching: AtomicBool::new(false),
        }
    }

    fn demand(&self) -> MutexGuard<'_, Demand> {
        self.demand.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, snap: Snapshot<V>) -> Arc<Snapshot<V>> {
        let snap = Arc::new(snap);
        self.state.send_replace(Arc::clone(&snap));
        snap
    }
}

enum Slot {
    Getter,
    Subscriber,
}

/// Keeps a consumer counted against an entry until dropped.
struct ConsumerGuard<V> {
    entry: Arc<Entry<V>>,
    slot: Slot,
}

impl<V> Drop for ConsumerGuard<V> {
    fn drop(&mut self) {
        {
            let mut d = self.entry.demand();
            match self.slot {
                Slot::Getter => d.getters = d.getters.saturating_sub(1),
                Slot::Subscriber => d.subscribers = d.subscribers.saturating_sub(1),
            }
            d.last_access = Instant::now();
        }
        self.entry.wake.notify_one();
    }
}

enum Joined<V> {
    Hit(Arc<Snapshot<V>>),
    Wait { rx: watch::Receiver<Arc<Snapshot<V>>>, guard: ConsumerGuard<V>, waiter: Waiter },
}

/// Cache for one [`CacheType`].
pub struct CacheEngine<T: CacheType> {
    inner: Arc<Inner<T>>,
}

impl<T: CacheType> Clone for CacheEngine<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct Inner<T: CacheType> {
    name: &'static str,
    ty: T,
    options: RegisterOptions,
    config: CacheConfig,
    entries: RwLock<FxHashMap<String, Arc<Entry<T::Value>>>>,
    stats: CacheStats,
    shutdown: CancellationToken,
}

impl<T: CacheType> CacheEngine<T> {
    pub fn new(name: &'static str, ty: T, config: CacheConfig) -> Self {
        let options = ty.register_options();
        info!(cache = name, blocking = options.supports_blocking, "cache type registered");
        Self {
            inner: Arc::new(Inner {
                name,
                ty,
                options,
                config,
                entries: RwLock::new(FxHashMap::default()),
                stats: CacheStats::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Fetch through the cache.
    ///
    /// `min_index == 0` is answered from the entry's snapshot when it holds a value and
    /// otherwise waits for the first fetch. With `min_index > 0` the call returns once the entry's index exceeds it, or
    /// with the current value when the request's timeout elapses.
    pub async fn get(&self, req: &T::Request) -> VigilResult<CacheResult<T::Value>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(VigilError::Canceled("cache closed".into()));
        }
        let info = req.cache_info();
        if info.key.is_empty() {
            return self.fetch_uncached(req, &info).await;
        }
        let key = info.cache_key();
        let min_index = info.min_index;
        let (mut rx, _guard, waiter) = match self.join(&key, req, |entry| enter_get(entry, min_index)) {
            Joined::Hit(snap) => {
                self.inner.stats.record_hit();
                counter!("cache_requests_total", 1u64, "type" => self.inner.name, "result" => "hit");
                return result_from(&snap, true);
            }
            Joined::Wait { rx, guard, waiter } => (rx, guard, waiter),
        };
        self.inner.stats.record_miss();
        counter!("cache_requests_total", 1u64, "type" => self.inner.name, "result" => "miss");

        let deadline =
            (min_index > 0).then(|| tokio::time::Instant::now() + self.inner.config.wait_for(info.timeout));
        loop {
            let changed = match deadline {
                Some(at) => match tokio::time::timeout_at(at, rx.changed()).await {
                    Ok(changed) => changed,
                    Err(_) => {
                        let current = Arc::clone(&*rx.borrow());
                        return result_from(&current, false);
                    }
                },
                None => rx.changed().await,
            };
            if changed.is_err() {
                return Err(VigilError::Internal(format!("cache entry {key} dropped")));
            }
            let snap = Arc::clone(&*rx.borrow_and_update());
            if snap.terminal {
                return Err(snap.error.clone().unwrap_or_else(|| VigilError::Canceled("cache closed".into())));
            }
            if waiter.served_by(&snap) {
                return result_from(&snap, false);
            }
        }
    }

    /// Push the entry's value to `tx`: the current value first, then one event per index
    /// advance and one `Err` event per failed refresh, until `cancel` fires or `tx` closes.
    pub fn notify(
        &self,
        cancel: CancellationToken,
        req: T::Request,
        correlation_id: impl Into<String>,
        tx: mpsc::Sender<UpdateEvent<T::Value>>,
    ) -> VigilResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(VigilError::Canceled("cache closed".into()));
        }
        let info = req.cache_info();
        if info.key.is_empty() {
            return Err(VigilError::Validation(format!("{}: notify requires a request key", self.inner.name)));
        }
        let key = info.cache_key();
        let (rx, guard) = self.join(&key, &req, enter_subscriber);
        let correlation_id = correlation_id.into();
        debug!(cache = self.inner.name, key = %key, correlation_id = %correlation_id, "subscription opened");
        tokio::spawn(forward_updates(rx, guard, cancel, correlation_id, tx));
        Ok(())
    }

    pub fn inspect(&self, req: &T::Request) -> Option<EntryInfo> {
        let key = req.cache_info().cache_key();
        let entry = {
            let map = self.inner.entries.read().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.get(&key)?)
        };
        let snap = Arc::clone(&*entry.state.borrow());
        let demand = entry.demand();
        Some(EntryInfo {
            key,
            index: snap.index,
            has_value: snap.value.is_some(),
            last_error: snap.error.clone(),
            fetch_in_flight: entry.fetching.load(Ordering::Acquire),
            consumers: demand.consumers(),
            last_access: demand.last_access,
            fetched_at: snap.fetched_at,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    /// Stop every refresh task and drop all entries. Waiting consumers receive `Canceled`.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        let mut map = self.inner.entries.write().unwrap_or_else(|e| e.into_inner());
        let dropped = map.len();
        map.clear();
        gauge!("cache_entries", 0.0, "type" => self.inner.name);
        info!(cache = self.inner.name, entries = dropped, "cache closed");
    }

    /// Find or create the entry for `key` and register with it while the map lock is held,
    /// so eviction (which takes the write lock) never races a joining consumer.
    fn join<R>(&self, key: &str, req: &T::Request, enter: impl Fn(&Arc<Entry<T::Value>>) -> R) -> R {
        {
            let map = self.inner.entries.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = map.get(key) {
                return enter(entry);
            }
        }
        let mut map = self.inner.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get(key) {
            return enter(entry);
        }
        let entry = Arc::new(Entry::new(key.to_string()));
        map.insert(key.to_string(), Arc::clone(&entry));
        gauge!("cache_entries", map.len() as f64, "type" => self.inner.name);
        let joined = enter(&entry);
        drop(map);

        let inner = Arc::clone(&self.inner);
        let req = req.clone();
        tokio::spawn(async move { inner.refresh(entry, req).await });
        joined
    }

    async fn fetch_uncached(&self, req: &T::Request, info: &RequestInfo) -> VigilResult<CacheResult<T::Value>> {
        self.inner.stats.record_miss();
        self.inner.stats.record_fetch();
        let opts =
            FetchOptions { min_index: info.min_index, timeout: info.timeout, allow_stale: info.allow_stale, last_value: None };
        match self.inner.ty.fetch(opts, req).await {
            Ok(res) => Ok(CacheResult { value: res.value, index: res.index.max(1), hit: false, degraded: None }),
            Err(err) => {
                self.inner.stats.record_error();
                Err(err)
            }
        }
    }
}

fn enter_get<V>(entry: &Arc<Entry<V>>, min_index: Index) -> Joined<V> {
    let mut rx = entry.state.subscribe();
    let snap = Arc::clone(&*rx.borrow_and_update());
    {
        let mut d = entry.demand();
        d.last_access = Instant::now();
        if snap.value.is_some() && (min_index == 0 || snap.index > min_index) {
            return Joined::Hit(snap);
        }
        d.getters += 1;
    }
    entry.wake.notify_one();
    let waiter = Waiter { min_index, seen: snap.generation };
    Joined::Wait { rx, guard: ConsumerGuard { entry: Arc::clone(entry), slot: Slot::Getter }, waiter }
}

fn enter_subscriber<V>(entry: &Arc<Entry<V>>) -> (watch::Receiver<Arc<Snapshot<V>>>, ConsumerGuard<V>) {
    let rx = entry.state.subscribe();
    {
        let mut d = entry.demand();
        d.last_access = Instant::now();
        d.subscribers += 1;
    }
    entry.wake.notify_one();
    (rx, ConsumerGuard { entry: Arc::clone(entry), slot: Slot::Subscriber })
}

async fn forward_updates<V: Clone>(
    mut rx: watch::Receiver<Arc<Snapshot<V>>>,
    _guard: ConsumerGuard<V>,
    cancel: CancellationToken,
    correlation_id: String,
    tx: mpsc::Sender<UpdateEvent<V>>,
) {
    let mut sent_index: Option<Index> = None;
    let mut reported_error = 0u64;
    let mut snap = Arc::clone(&*rx.borrow_and_update());
    loop {
        let mut events = Vec::with_capacity(2);
        if let (Some(value), false) = (&snap.value, snap.terminal) {
            if sent_index.map_or(true, |sent| snap.index > sent) {
                events.push(UpdateEvent::value(correlation_id.clone(), snap.index, value.clone()));
                sent_index = Some(snap.index);
            }
        }
        if let Some(err) = &snap.error {
            if snap.generation > reported_error {
                events.push(UpdateEvent::error(correlation_id.clone(), snap.index, err.clone()));
                reported_error = snap.generation;
            }
        }
        for event in events {
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = tx.send(event) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
        if snap.terminal {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tx.closed() => return,
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
                snap = Arc::clone(&*rx.borrow_and_update());
            }
        }
    }
}

impl<T: CacheType> Inner<T> {
    async fn refresh(&self, entry: Arc<Entry<T::Value>>, req: T::Request) {
        let info = req.cache_info();
        let mut current = Arc::clone(&*entry.state.borrow());
        // Upstream's own index and the shift applied after it went backwards.
        let mut cursor: Index = 0;
        let mut offset: Index = 0;
        let mut attempt: u32 = 0;
        debug!(cache = self.name, key = %entry.key, "refresh task started");

        loop {
            let opts = FetchOptions {
                min_index: if self.options.supports_blocking { cursor } else { 0 },
                timeout: self.options.query_timeout,
                allow_stale: info.allow_stale,
                last_value: current.value.clone(),
            };
            entry.fetching.store(true, Ordering::Release);
            self.stats.record_fetch();
            counter!("cache_fetches_total", 1u64, "type" => self.name);
            let fetched = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    entry.fetching.store(false, Ordering::Release);
                    break;
                }
                _ = self.until_expired(&entry) => return,
                res = self.ty.fetch(opts, &req) => res,
            };
            entry.fetching.store(false, Ordering::Release);

            let pause = match fetched {
                Ok(res) => {
                    let raw = res.index.max(1);
                    if raw < cursor {
                        warn!(
                            cache = self.name,
                            key = %entry.key,
                            previous = cursor,
                            index = raw,
                            "upstream index went backwards; rebasing"
                        );
                        offset = (current.index + 1).saturating_sub(raw);
                    }
                    cursor = raw;
                    let index = raw.saturating_add(offset).max(current.index);
                    attempt = 0;
                    current = entry.publish(Snapshot {
                        value: Some(res.value),
                        index,
                        error: None,
                        generation: current.generation + 1,
                        fetched_at: Some(Instant::now()),
                        terminal: false,
                    });
                    (!self.options.supports_blocking).then_some(self.options.refresh_timer)
                }
                Err(err) if err.is_permission_denied() => {
                    info!(cache = self.name, key = %entry.key, error = %err, "fetch denied; evicting entry");
                    self.stats.record_error();
                    self.remove(&entry);
                    entry.publish(Snapshot {
                        value: None,
                        index: current.index,
                        error: Some(err),
                        generation: current.generation + 1,
                        fetched_at: current.fetched_at,
                        terminal: true,
                    });
                    return;
                }
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    self.stats.record_error();
                    counter!("cache_fetch_errors_total", 1u64, "type" => self.name);
                    warn!(cache = self.name, key = %entry.key, attempt, error = %err, "upstream fetch failed");
                    current = entry.publish(Snapshot {
                        value: current.value.clone(),
                        index: current.index,
                        error: Some(err),
                        generation: current.generation + 1,
                        fetched_at: current.fetched_at,
                        terminal: false,
                    });
                    Some(self.config.backoff.delay(attempt))
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = self.until_expired(&entry) => return,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        entry.publish(Snapshot {
            value: None,
            index: current.index,
            error: Some(VigilError::Canceled("cache closed".into())),
            generation: current.generation + 1,
            fetched_at: current.fetched_at,
            terminal: true,
        });
        debug!(cache = self.name, key = %entry.key, "refresh task stopped");
    }

    /// Resolves once the entry has been evicted after `idle_ttl` without consumers.
    async fn until_expired(&self, entry: &Arc<Entry<T::Value>>) {
        loop {
            let notified = entry.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let expires = {
                let d = entry.demand();
                (d.consumers() == 0).then(|| d.last_access + self.config.idle_ttl)
            };
            let at = tokio::time::Instant::from_std(expires.unwrap_or_else(Instant::now));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(at), if expires.is_some() => {
                    if self.try_evict(entry) {
                        return;
                    }
                }
            }
        }
    }

    fn try_evict(&self, entry: &Arc<Entry<T::Value>>) -> bool {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        {
            let d = entry.demand();
            if d.consumers() > 0 || d.last_access.elapsed() < self.config.idle_ttl {
                return false;
            }
        }
        if map.get(&entry.key).map_or(false, |e| Arc::ptr_eq(e, entry)) {
            map.remove(&entry.key);
        }
        gauge!("cache_entries", map.len() as f64, "type" => self.name);
        drop(map);
        self.stats.record_eviction();
        counter!("cache_evictions_total", 1u64, "type" => self.name);
        debug!(cache = self.name, key = %entry.key, "idle entry evicted");
        true
    }

    fn remove(&self, entry: &Arc<Entry<T::Value>>) {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if map.get(&entry.key).map_or(false, |e| Arc::ptr_eq(e, entry)) {
            map.remove(&entry.key);
            self.stats.record_eviction();
            counter!("cache_evictions_total", 1u64, "type" => self.name);
        }
        gauge!("cache_entries", map.len() as f64, "type" => self.name);
    }
}
