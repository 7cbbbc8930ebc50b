use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use vigil_core::{BackoffPolicy, ChangeEvent, ResourceId, ResourceType, VigilResult};
use vigil_registry::TypeRegistry;
use vigil_store::ResourceStore;

/// Ask for the resource `id` of the managed type to be brought in line with its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconcileRequest {
    pub id: ResourceId,
}

impl ReconcileRequest {
    pub fn new(id: ResourceId) -> Self {
        Self { id }
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id, f)
    }
}

/// What reconcilers and mappers get to work with.
#[derive(Clone)]
pub struct Runtime {
    pub store: Arc<dyn ResourceStore>,
    pub registry: Arc<TypeRegistry>,
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Converge `req.id`. An error (or a panic) schedules a retry with backoff.
    async fn reconcile(&self, rt: &Runtime, req: ReconcileRequest) -> VigilResult<()>;
}

/// Turns a change of a related resource into requests for managed resources.
pub type Mapper = Arc<dyn Fn(&Runtime, &ChangeEvent) -> VigilResult<Vec<ReconcileRequest>> + Send + Sync>;

/// Reconciles one managed type, optionally driven by changes of related types.
pub struct Controller {
    pub(crate) managed: ResourceType,
    pub(crate) reconciler: Arc<dyn Reconciler>,
    pub(crate) watches: Vec<(ResourceType, Mapper)>,
    pub(crate) workers: Option<usize>,
    pub(crate) backoff: Option<BackoffPolicy>,
}

impl Controller {
    pub fn new(managed: ResourceType, reconciler: impl Reconciler) -> Self {
        Self { managed, reconciler: Arc::new(reconciler), watches: Vec::new(), workers: None, backoff: None }
    }

    /// Reconcile whatever `mapper` derives from each change of `related`.
    pub fn with_watch<F>(mut self, related: ResourceType, mapper: F) -> Self
    where
        F: Fn(&Runtime, &ChangeEvent) -> VigilResult<Vec<ReconcileRequest>> + Send + Sync + 'static,
    {
        self.watches.push((related, Arc::new(mapper)));
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn managed_type(&self) -> &ResourceType {
        &self.managed
    }

    pub fn watched_types(&self) -> impl Iterator<Item = &ResourceType> {
        self.watches.iter().map(|(ty, _)| ty)
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("managed", &self.managed)
            .field("watches", &self.watched_types().collect::<Vec<_>>())
            .field("workers", &self.workers)
            .finish()
    }
}
