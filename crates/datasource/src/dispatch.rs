use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vigil_core::{UpdateEvent, VigilResult};

use crate::{DataSource, Routable};

/// Datacenter and partition this process reads directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub datacenter: String,
    pub partition: String,
}

impl Authority {
    pub fn new(datacenter: impl Into<String>, partition: impl Into<String>) -> Self {
        Self { datacenter: datacenter.into(), partition: partition.into() }
    }

    /// Empty request fields mean "wherever the caller is".
    pub fn is_local<R: Routable + ?Sized>(&self, req: &R) -> bool {
        let dc = req.datacenter();
        let partition = req.partition();
        (dc.is_empty() || dc == self.datacenter) && (partition.is_empty() || partition == self.partition)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Cache,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Local => "local",
            Route::Cache => "cache",
        }
    }
}

/// Picks the local or cache path once per `notify`; the choice holds for the subscription's
/// lifetime.
pub struct Dispatch<R, V>
where
    R: Send + 'static,
    V: Send + 'static,
{
    authority: Authority,
    local: Arc<dyn DataSource<R, V>>,
    cache: Arc<dyn DataSource<R, V>>,
}

impl<R, V> Dispatch<R, V>
where
    R: Routable + Send + 'static,
    V: Send + 'static,
{
    pub fn new(authority: Authority, local: Arc<dyn DataSource<R, V>>, cache: Arc<dyn DataSource<R, V>>) -> Self {
        Self { authority, local, cache }
    }

    pub fn route(&self, req: &R) -> Route {
        if self.authority.is_local(req) {
            Route::Local
        } else {
            Route::Cache
        }
    }
}

#[async_trait]
impl<R, V> DataSource<R, V> for Dispatch<R, V>
where
    R: Routable + Send + Sync + 'static,
    V: Send + 'static,
{
    async fn notify(
        &self,
        cancel: CancellationToken,
        req: R,
        correlation_id: String,
        tx: mpsc::Sender<UpdateEvent<V>>,
    ) -> VigilResult<()> {
        let route = self.route(&req);
        counter!("datasource_routes_total", 1u64, "route" => route.as_str());
        debug!(
            correlation_id = %correlation_id,
            datacenter = req.datacenter(),
            partition = req.partition(),
            route = route.as_str(),
            "routing subscription"
        );
        match route {
            Route::Local => self.local.notify(cancel, req, correlation_id, tx).await,
            Route::Cache => self.cache.notify(cancel, req, correlation_id, tx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Req(&'static str, &'static str);

    impl Routable for Req {
        fn datacenter(&self) -> &str {
            self.0
        }
        fn partition(&self) -> &str {
            self.1
        }
        fn token(&self) -> &str {
            ""
        }
    }

    #[test]
    fn locality_by_datacenter_and_partition() {
        let here = Authority::new("dc1", "default");
        assert!(here.is_local(&Req("dc1", "default")));
        assert!(here.is_local(&Req("", "")));
        assert!(!here.is_local(&Req("dc2", "default")));
        assert!(!here.is_local(&Req("dc1", "team-b")));
    }
}
