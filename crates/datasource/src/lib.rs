//! Vigil data sources: one `notify` contract over local blocking queries and the cache.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vigil_core::{UpdateEvent, VigilResult};

pub mod cache;
pub mod dispatch;
pub mod local;
mod subscription;

pub use cache::CacheSource;
pub use dispatch::{Authority, Dispatch, Route};
pub use local::{LocalQuery, LocalSource};
pub use subscription::Subscription;

/// Channel capacity used by [`DataSource::subscribe`].
pub const DEFAULT_BUFFER: usize = 16;

/// Routing facts of a request.
pub trait Routable {
    fn datacenter(&self) -> &str;
    fn partition(&self) -> &str;
    fn token(&self) -> &str;
}

#[async_trait]
pub trait DataSource<R, V>: Send + Sync
where
    R: Send + 'static,
    V: Send + 'static,
{
    /// Register interest in `req`. On success one event with the current value is delivered,
    /// then one per change, until `cancel` fires. Errors only when setup fails.
    async fn notify(
        &self,
        cancel: CancellationToken,
        req: R,
        correlation_id: String,
        tx: mpsc::Sender<UpdateEvent<V>>,
    ) -> VigilResult<()>;

    async fn subscribe(&self, req: R, correlation_id: String) -> VigilResult<Subscription<V>> {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(DEFAULT_BUFFER);
        self.notify(cancel.clone(), req, correlation_id, tx).await?;
        Ok(Subscription::new(rx, cancel))
    }
}

pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
