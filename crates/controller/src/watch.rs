use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vigil_core::{ChangeEvent, ChangeKind, Index, Resource, ResourceId, ResourceType};
use vigil_store::{blocking_query, BlockingConfig, QueryOptions, ResourceStore};

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Last seen version of every resource of one type.
#[derive(Default)]
pub(crate) struct Known {
    items: FxHashMap<ResourceId, Resource>,
}

impl Known {
    /// Compare a full listing against what was seen before.
    pub(crate) fn diff(&mut self, listed: Vec<Resource>, index: Index) -> Vec<ChangeEvent> {
        let mut out = Vec::new();
        let mut seen = FxHashSet::default();
        for res in listed {
            seen.insert(res.id.clone());
            let changed = self.items.get(&res.id).map_or(true, |prev| prev.version != res.version);
            if changed {
                self.items.insert(res.id.clone(), res.clone());
                out.push(ChangeEvent { kind: ChangeKind::Upsert, resource: res, index });
            }
        }
        let gone: Vec<ResourceId> = self.items.keys().filter(|id| !seen.contains(*id)).cloned().collect();
        for id in gone {
            if let Some(res) = self.items.remove(&id) {
                out.push(ChangeEvent { kind: ChangeKind::Delete, resource: res, index });
            }
        }
        out
    }
}

/// Long-poll the listing of `ty` and hand every observed change to `emit`.
///
/// The first listing reports every existing resource as an upsert.
pub(crate) async fn watch_type<F>(
    store: Arc<dyn ResourceStore>,
    ty: ResourceType,
    config: BlockingConfig,
    cancel: CancellationToken,
    mut emit: F,
) where
    F: FnMut(ChangeEvent) + Send,
{
    let gvk = ty.gvk();
    let mut known = Known::default();
    let mut index: Index = 0;
    debug!(gvk = %gvk, "watch started");
    loop {
        let opts = QueryOptions::blocking(index, config.default_query_time);
        let res = blocking_query(&cancel, &opts, &config, |ws| store.list(ws, &ty, None)).await;
        if cancel.is_cancelled() {
            break;
        }
        match res {
            Ok((next, listed)) => {
                index = next;
                let events = known.diff(listed, next);
                if !events.is_empty() {
                    counter!("controller_watch_events_total", events.len() as u64, "gvk" => gvk.clone());
                }
                for ev in events {
                    emit(ev);
                }
            }
            Err(err) => {
                warn!(gvk = %gvk, error = %err, "watch list failed; retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
    debug!(gvk = %gvk, "watch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn res(name: &str, version: &str) -> Resource {
        let mut r = Resource::new(ResourceId::new(ResourceType::new("catalog", "v1", "Node"), name), json!({}));
        r.version = version.into();
        r
    }

    fn kinds(events: &[ChangeEvent]) -> Vec<(ChangeKind, String)> {
        events.iter().map(|e| (e.kind, e.resource.id.name.clone())).collect()
    }

    #[test]
    fn diff_reports_new_changed_and_removed() {
        let mut known = Known::default();
        let first = known.diff(vec![res("a", "1"), res("b", "1")], 3);
        assert_eq!(kinds(&first), vec![(ChangeKind::Upsert, "a".into()), (ChangeKind::Upsert, "b".into())]);

        assert!(known.diff(vec![res("a", "1"), res("b", "1")], 3).is_empty());

        let next = known.diff(vec![res("a", "2")], 5);
        assert_eq!(kinds(&next), vec![(ChangeKind::Upsert, "a".into()), (ChangeKind::Delete, "b".into())]);
        assert!(next.iter().all(|e| e.index == 5));
    }
}
