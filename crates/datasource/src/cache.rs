use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vigil_cache::{CacheEngine, CacheType};
use vigil_core::{UpdateEvent, VigilError, VigilResult};

use crate::DataSource;

/// Serves requests through a [`CacheEngine`].
pub struct CacheSource<T: CacheType> {
    cache: CacheEngine<T>,
}

impl<T: CacheType> CacheSource<T> {
    pub fn new(cache: CacheEngine<T>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &CacheEngine<T> {
        &self.cache
    }
}

/// Setup failures a subscriber has to hear about; anything else is retried by the cache.
fn rejects(err: &VigilError) -> bool {
    matches!(
        err,
        VigilError::PermissionDenied(_) | VigilError::Validation(_) | VigilError::InvalidType(_) | VigilError::NotRegistered(_)
    )
}

#[async_trait]
impl<T: CacheType> DataSource<T::Request, T::Value> for CacheSource<T> {
    async fn notify(
        &self,
        cancel: CancellationToken,
        req: T::Request,
        correlation_id: String,
        tx: mpsc::Sender<UpdateEvent<T::Value>>,
    ) -> VigilResult<()> {
        match self.cache.get(&req).await {
            Err(err) if rejects(&err) => return Err(err),
            Err(err) => {
                debug!(cache = self.cache.name(), correlation_id = %correlation_id, error = %err, "initial fetch failed; subscription will retry");
            }
            Ok(_) => {}
        }
        self.cache.notify(cancel, req, correlation_id, tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_setup_errors_are_rejected() {
        assert!(rejects(&VigilError::PermissionDenied("x".into())));
        assert!(rejects(&VigilError::Validation("x".into())));
        assert!(!rejects(&VigilError::Upstream("x".into())));
        assert!(!rejects(&VigilError::Internal("x".into())));
    }
}
