use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::config::env_or;
use vigil_core::{BackoffPolicy, ChangeEvent, ResourceId, ResourceType, VigilError, VigilResult};
use vigil_registry::TypeRegistry;
use vigil_store::{BlockingConfig, ResourceStore};

use crate::controller::{Controller, Mapper, ReconcileRequest, Reconciler, Runtime};
use crate::queue::WorkQueue;
use crate::watch::watch_type;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Defaults applied to controllers that do not set their own.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub workers: usize,
    pub backoff: BackoffPolicy,
    /// Long-poll settings of the watch adapters.
    pub blocking: BlockingConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(30)).with_max_retries(10),
            blocking: BlockingConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// `VIGIL_CONTROLLER_WORKERS`, `VIGIL_CONTROLLER_MAX_RETRIES`, `VIGIL_CONTROLLER_BACKOFF_BASE_MS`,
    /// `VIGIL_CONTROLLER_BACKOFF_MAX_MS` and the blocking-query variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_or("VIGIL_CONTROLLER_WORKERS", d.workers).max(1),
            backoff: BackoffPolicy::from_env("VIGIL_CONTROLLER", d.backoff),
            blocking: BlockingConfig::from_env(),
        }
    }
}

/// A resource whose reconcile kept failing past the retry ceiling.
#[derive(Debug, Clone, Serialize)]
pub struct DegradedEntry {
    pub id: ResourceId,
    pub attempts: u32,
    pub error: String,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub managed_type: ResourceType,
    pub queued: usize,
    pub in_flight: usize,
    pub reconciles: u64,
    pub failures: u64,
    pub degraded: Vec<DegradedEntry>,
}

struct ControllerState {
    managed: ResourceType,
    gvk: String,
    queue: WorkQueue,
    reconciles: AtomicU64,
    failures: AtomicU64,
    retries: Mutex<FxHashMap<ResourceId, u32>>,
    degraded: Mutex<FxHashMap<ResourceId, DegradedEntry>>,
}

impl ControllerState {
    fn new(managed: ResourceType) -> Self {
        Self {
            gvk: managed.gvk(),
            managed,
            queue: WorkQueue::new(),
            reconciles: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            retries: Mutex::new(FxHashMap::default()),
            degraded: Mutex::new(FxHashMap::default()),
        }
    }

    fn enqueue(&self, id: ResourceId, reason: &'static str) -> bool {
        if id.ty != self.managed {
            warn!(gvk = %self.gvk, id = %id, "dropping request for a type this controller does not manage");
            return false;
        }
        let added = self.queue.add(id);
        if added {
            counter!("controller_enqueued_total", 1u64, "gvk" => self.gvk.clone(), "reason" => reason);
        }
        added
    }

    fn succeeded(&self, id: &ResourceId) {
        lock(&self.retries).remove(id);
        let recovered = {
            let mut degraded = lock(&self.degraded);
            let hit = degraded.remove(id).is_some();
            if hit {
                gauge!("controller_degraded", degraded.len() as f64, "gvk" => self.gvk.clone());
            }
            hit
        };
        if recovered {
            info!(gvk = %self.gvk, id = %id, "degraded resource reconciled");
        }
    }

    /// Record a failure; returns the delay before the retry, or `None` once retries are exhausted.
    fn failed(&self, id: &ResourceId, err: &VigilError, backoff: &BackoffPolicy) -> Option<Duration> {
        self.failures.fetch_add(1, Ordering::Relaxed);
        counter!("controller_reconcile_failures_total", 1u64, "gvk" => self.gvk.clone(), "error" => err.kind());
        let attempts = {
            let mut retries = lock(&self.retries);
            let n = retries.entry(id.clone()).or_insert(0);
            *n = n.saturating_add(1);
            *n
        };
        if !backoff.exhausted(attempts) {
            let delay = backoff.delay(attempts);
            warn!(
                gvk = %self.gvk,
                id = %id,
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "reconcile failed; retrying"
            );
            return Some(delay);
        }

        // Next external change starts a fresh retry budget.
        lock(&self.retries).remove(id);
        let count = {
            let mut degraded = lock(&self.degraded);
            degraded
                .entry(id.clone())
                .and_modify(|d| {
                    d.attempts = attempts;
                    d.error = err.to_string();
                })
                .or_insert_with(|| DegradedEntry { id: id.clone(), attempts, error: err.to_string(), since: Utc::now() });
            degraded.len()
        };
        gauge!("controller_degraded", count as f64, "gvk" => self.gvk.clone());
        warn!(gvk = %self.gvk, id = %id, attempts, error = %err, "retries exhausted; resource degraded");
        None
    }

    fn status(&self) -> ControllerStatus {
        let mut degraded: Vec<DegradedEntry> = lock(&self.degraded).values().cloned().collect();
        degraded.sort_by(|a, b| a.id.cmp(&b.id));
        ControllerStatus {
            managed_type: self.managed.clone(),
            queued: self.queue.len(),
            in_flight: self.queue.in_flight(),
            reconciles: self.reconciles.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            degraded,
        }
    }
}

/// Runs registered controllers: one watch adapter per watched type and a worker group per
/// controller draining its coalescing queue.
pub struct Manager {
    runtime: Runtime,
    config: ManagerConfig,
    /// Controllers not started yet; `None` once `run` took them.
    pending: Mutex<Option<Vec<(Controller, Arc<ControllerState>)>>>,
    states: RwLock<FxHashMap<ResourceType, Arc<ControllerState>>>,
}

impl Manager {
    pub fn new(store: Arc<dyn ResourceStore>, registry: Arc<TypeRegistry>) -> Self {
        Self::with_config(store, registry, ManagerConfig::default())
    }

    pub fn with_config(store: Arc<dyn ResourceStore>, registry: Arc<TypeRegistry>, config: ManagerConfig) -> Self {
        Self {
            runtime: Runtime { store, registry },
            config,
            pending: Mutex::new(Some(Vec::new())),
            states: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Add a controller. Its managed and watched types must be registered; one controller per
    /// managed type; no registration once [`run`](Self::run) started.
    pub fn register(&self, controller: Controller) -> VigilResult<()> {
        let mut pending = lock(&self.pending);
        let Some(pending) = pending.as_mut() else {
            return Err(VigilError::Internal(format!(
                "cannot register controller for {} while the manager is running",
                controller.managed.gvk()
            )));
        };
        self.runtime.registry.require(&controller.managed)?;
        for ty in controller.watched_types() {
            self.runtime.registry.require(ty)?;
        }
        let mut states = self.states.write().unwrap_or_else(|p| p.into_inner());
        if states.contains_key(&controller.managed) {
            return Err(VigilError::AlreadyRegistered(format!(
                "controller for {} already registered",
                controller.managed.gvk()
            )));
        }
        let state = Arc::new(ControllerState::new(controller.managed.clone()));
        states.insert(controller.managed.clone(), Arc::clone(&state));
        info!(gvk = %state.gvk, watches = controller.watches.len(), "registered controller");
        pending.push((controller, state));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.pending).is_none()
    }

    /// Run every registered controller until `cancel` fires. Pending work is discarded on
    /// shutdown; reconciles already running are awaited.
    pub async fn run(&self, cancel: CancellationToken) -> VigilResult<()> {
        let controllers = lock(&self.pending)
            .take()
            .ok_or_else(|| VigilError::Internal("controller manager already running".into()))?;
        let mut tasks = Vec::new();
        let mut started = Vec::with_capacity(controllers.len());
        for (controller, state) in controllers {
            tasks.extend(self.start(controller, Arc::clone(&state), &cancel));
            started.push(state);
        }
        info!(controllers = started.len(), "controller manager running");

        cancel.cancelled().await;
        for state in &started {
            state.queue.shutdown();
        }
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "controller task ended abnormally");
            }
        }
        info!("controller manager stopped");
        Ok(())
    }

    fn start(&self, controller: Controller, state: Arc<ControllerState>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let Controller { managed, reconciler, watches, workers, backoff } = controller;
        let workers = workers.unwrap_or(self.config.workers).max(1);
        let backoff = backoff.unwrap_or(self.config.backoff);
        let mut tasks = Vec::with_capacity(1 + watches.len() + workers);

        let own = Arc::clone(&state);
        tasks.push(tokio::spawn(watch_type(
            Arc::clone(&self.runtime.store),
            managed,
            self.config.blocking.clone(),
            cancel.clone(),
            move |ev| {
                own.enqueue(ev.resource.id, "changed");
            },
        )));
        for (related, mapper) in watches {
            let st = Arc::clone(&state);
            let rt = self.runtime.clone();
            tasks.push(tokio::spawn(watch_type(
                Arc::clone(&self.runtime.store),
                related,
                self.config.blocking.clone(),
                cancel.clone(),
                move |ev| {
                    fan_out(&st, &rt, &mapper, &ev);
                },
            )));
        }
        for n in 0..workers {
            tasks.push(tokio::spawn(worker(
                n,
                Arc::clone(&state),
                self.runtime.clone(),
                Arc::clone(&reconciler),
                backoff,
                cancel.clone(),
            )));
        }
        debug!(gvk = %state.gvk, workers, "controller started");
        tasks
    }

    pub fn status(&self, ty: &ResourceType) -> Option<ControllerStatus> {
        let states = self.states.read().unwrap_or_else(|p| p.into_inner());
        states.get(ty).map(|s| s.status())
    }

    /// Status of every registered controller, sorted by managed type.
    pub fn statuses(&self) -> Vec<ControllerStatus> {
        let states = self.states.read().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<ControllerStatus> = states.values().map(|s| s.status()).collect();
        out.sort_by(|a, b| a.managed_type.cmp(&b.managed_type));
        out
    }
}

/// Route a related change through the controller's mapper into its queue.
fn fan_out(state: &ControllerState, rt: &Runtime, mapper: &Mapper, ev: &ChangeEvent) -> usize {
    match mapper(rt, ev) {
        Ok(requests) => {
            let total = requests.len();
            let added = requests.into_iter().filter(|req| state.enqueue(req.id.clone(), "mapped")).count();
            debug!(gvk = %state.gvk, from = %ev.resource.id, total, added, "mapped related change");
            added
        }
        Err(err) => {
            counter!("controller_mapper_errors_total", 1u64, "gvk" => state.gvk.clone());
            warn!(gvk = %state.gvk, from = %ev.resource.id, error = %err, "mapper failed; change skipped");
            0
        }
    }
}

async fn worker(
    n: usize,
    state: Arc<ControllerState>,
    rt: Runtime,
    reconciler: Arc<dyn Reconciler>,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
) {
    debug!(gvk = %state.gvk, worker = n, "worker started");
    while let Some(id) = state.queue.next().await {
        let started = Instant::now();
        // Own task so a panicking reconciler only fails this request.
        let task = {
            let reconciler = Arc::clone(&reconciler);
            let rt = rt.clone();
            let req = ReconcileRequest::new(id.clone());
            tokio::spawn(async move { reconciler.reconcile(&rt, req).await })
        };
        let outcome = match task.await {
            Ok(res) => res,
            Err(join) if join.is_panic() => Err(VigilError::Reconcile(format!("reconciler panicked on {id}"))),
            Err(join) => Err(VigilError::Reconcile(format!("reconcile of {id} aborted: {join}"))),
        };
        state.reconciles.fetch_add(1, Ordering::Relaxed);
        counter!("controller_reconciles_total", 1u64, "gvk" => state.gvk.clone());
        histogram!("controller_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0, "gvk" => state.gvk.clone());

        let retry = match outcome {
            Ok(()) => {
                state.succeeded(&id);
                None
            }
            Err(err) => state.failed(&id, &err, &backoff),
        };
        state.queue.done(&id);
        if let Some(delay) = retry {
            schedule_retry(Arc::clone(&state), id, delay, cancel.clone());
        }
    }
    debug!(gvk = %state.gvk, worker = n, "worker stopped");
}

fn schedule_retry(state: Arc<ControllerState>, id: ResourceId, delay: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                state.enqueue(id, "retry");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use vigil_core::{ChangeKind, Resource};
    use vigil_registry::Registration;
    use vigil_store::MemStore;

    fn workload() -> ResourceType {
        ResourceType::new("apps", "v1", "Workload")
    }

    fn node() -> ResourceType {
        ResourceType::new("catalog", "v1", "Node")
    }

    struct Noop;

    #[async_trait]
    impl Reconciler for Noop {
        async fn reconcile(&self, _rt: &Runtime, _req: ReconcileRequest) -> VigilResult<()> {
            Ok(())
        }
    }

    fn runtime() -> Runtime {
        let registry = Arc::new(TypeRegistry::new());
        registry.register(Registration::new(workload())).expect("workload");
        registry.register(Registration::new(node())).expect("node");
        Runtime { store: Arc::new(MemStore::new()), registry }
    }

    #[test]
    fn fan_out_dedups_against_pending_work() {
        let rt = runtime();
        let state = ControllerState::new(workload());
        assert!(state.enqueue(ResourceId::new(workload(), "w1"), "changed"));

        let mapper: Mapper = Arc::new(|_rt: &Runtime, _ev: &ChangeEvent| -> VigilResult<Vec<ReconcileRequest>> {
            Ok(["w1", "w2", "w3", "w2"].iter().map(|n| ReconcileRequest::new(ResourceId::new(workload(), *n))).collect())
        });
        let ev = ChangeEvent {
            kind: ChangeKind::Upsert,
            resource: Resource::new(ResourceId::new(node(), "n1"), json!({ "healthy": false })),
            index: 2,
        };
        assert_eq!(fan_out(&state, &rt, &mapper, &ev), 2);
        assert_eq!(state.queue.len(), 3);
    }

    #[test]
    fn requests_for_other_types_are_dropped() {
        let state = ControllerState::new(workload());
        assert!(!state.enqueue(ResourceId::new(node(), "n1"), "mapped"));
        assert!(state.queue.is_empty());
    }

    #[test]
    fn failures_back_off_then_degrade_until_success() {
        let state = ControllerState::new(workload());
        let policy = BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(25)).with_jitter(0.0).with_max_retries(2);
        let id = ResourceId::new(workload(), "w1");
        let err = VigilError::Reconcile("boom".into());
        assert_eq!(state.failed(&id, &err, &policy), Some(Duration::from_millis(10)));
        assert_eq!(state.failed(&id, &err, &policy), Some(Duration::from_millis(20)));
        assert_eq!(state.failed(&id, &err, &policy), None);

        let status = state.status();
        assert_eq!(status.failures, 3);
        assert_eq!(status.degraded.len(), 1);
        assert_eq!(status.degraded[0].attempts, 3);

        // A fresh budget after an external change.
        assert_eq!(state.failed(&id, &err, &policy), Some(Duration::from_millis(10)));
        state.succeeded(&id);
        assert!(state.status().degraded.is_empty());
    }

    #[test]
    fn register_checks_types_and_duplicates() {
        let rt = runtime();
        let manager = Manager::new(Arc::clone(&rt.store), Arc::clone(&rt.registry));
        manager.register(Controller::new(workload(), Noop)).expect("first");
        assert!(matches!(
            manager.register(Controller::new(workload(), Noop)),
            Err(VigilError::AlreadyRegistered(_))
        ));
        let unknown = ResourceType::new("apps", "v1", "Unknown");
        assert!(matches!(manager.register(Controller::new(unknown.clone(), Noop)), Err(VigilError::NotRegistered(_))));
        assert!(matches!(
            manager.register(Controller::new(node(), Noop).with_watch(unknown, |_: &Runtime, _: &ChangeEvent| Ok(Vec::new()))),
            Err(VigilError::NotRegistered(_))
        ));
        assert!(manager.status(&workload()).is_some());
        assert!(manager.status(&node()).is_none());
    }
}
