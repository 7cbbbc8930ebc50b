use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vigil_core::{Authorizer, BackoffPolicy, Index, TokenResolver, UpdateEvent, VigilError, VigilResult};
use vigil_store::{blocking_query, BlockingConfig, QueryOptions, ResourceStore, WatchSet};

use crate::{DataSource, Routable};

/// Read against the local store. Must check the authorizer itself and register everything it
/// reads in the WatchSet.
pub type LocalQuery<R, V> =
    Arc<dyn Fn(&mut WatchSet, &dyn ResourceStore, &dyn Authorizer, &R) -> VigilResult<(Index, V)> + Send + Sync>;

/// Serves requests inside the local authority straight from the store.
///
/// The token is resolved again on every refresh, so permission changes reach open
/// subscriptions on their next wake-up.
pub struct LocalSource<R, V> {
    store: Arc<dyn ResourceStore>,
    tokens: Arc<dyn TokenResolver>,
    query: LocalQuery<R, V>,
    blocking: BlockingConfig,
    backoff: BackoffPolicy,
}

impl<R, V> LocalSource<R, V> {
    pub fn new(store: Arc<dyn ResourceStore>, tokens: Arc<dyn TokenResolver>, query: LocalQuery<R, V>) -> Self {
        Self { store, tokens, query, blocking: BlockingConfig::default(), backoff: BackoffPolicy::default() }
    }

    pub fn with_blocking(mut self, blocking: BlockingConfig) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl<R, V> DataSource<R, V> for LocalSource<R, V>
where
    R: Routable + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn notify(
        &self,
        cancel: CancellationToken,
        req: R,
        correlation_id: String,
        tx: mpsc::Sender<UpdateEvent<V>>,
    ) -> VigilResult<()> {
        let authz = self.tokens.resolve(req.token())?;
        let (index, value) = (self.query)(&mut WatchSet::new(), self.store.as_ref(), authz.as_ref(), &req)?;
        let index = index.max(1);
        tx.send(UpdateEvent::value(correlation_id.clone(), index, value))
            .await
            .map_err(|_| VigilError::Canceled("subscriber went away".into()))?;

        let refresher = Refresher {
            store: Arc::clone(&self.store),
            tokens: Arc::clone(&self.tokens),
            query: Arc::clone(&self.query),
            blocking: self.blocking.clone(),
            backoff: self.backoff,
        };
        tokio::spawn(refresher.run(cancel, req, correlation_id, tx, index));
        Ok(())
    }
}

struct Refresher<R, V> {
    store: Arc<dyn ResourceStore>,
    tokens: Arc<dyn TokenResolver>,
    query: LocalQuery<R, V>,
    blocking: BlockingConfig,
    backoff: BackoffPolicy,
}

impl<R: Routable, V> Refresher<R, V> {
    fn read(&self, ws: &mut WatchSet, req: &R) -> VigilResult<(Index, V)> {
        let authz = self.tokens.resolve(req.token())?;
        (self.query)(ws, self.store.as_ref(), authz.as_ref(), req)
    }

    async fn run(
        self,
        cancel: CancellationToken,
        req: R,
        correlation_id: String,
        tx: mpsc::Sender<UpdateEvent<V>>,
        mut last: Index,
    ) {
        let mut attempt: u32 = 0;
        debug!(correlation_id = %correlation_id, index = last, "local subscription started");
        loop {
            let opts = QueryOptions::blocking(last, self.blocking.default_query_time);
            let res = blocking_query(&cancel, &opts, &self.blocking, |ws| self.read(ws, &req)).await;
            if cancel.is_cancelled() {
                break;
            }
            let event = match res {
                Ok((index, value)) => {
                    attempt = 0;
                    if index <= last {
                        continue;
                    }
                    last = index;
                    counter!("datasource_local_updates_total", 1u64);
                    UpdateEvent::value(correlation_id.clone(), index, value)
                }
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    warn!(correlation_id = %correlation_id, attempt, error = %err, "local refresh failed");
                    counter!("datasource_local_errors_total", 1u64);
                    UpdateEvent::error(correlation_id.clone(), last, err)
                }
            };
            let failed = event.is_error();
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = tx.send(event) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
            if failed {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.backoff.delay(attempt)) => {}
                }
            }
        }
        debug!(correlation_id = %correlation_id, "local subscription stopped");
    }
}
