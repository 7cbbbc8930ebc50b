use std::sync::{Mutex, RwLock};

use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::debug;
use vigil_core::{Index, Resource, ResourceId, ResourceType, Tenancy, VigilError, VigilResult};

use crate::watch::WatchSet;

/// Local resource storage as seen by blocking reads.
///
/// Reads register change channels in the caller's [`WatchSet`] before looking at data, so a
/// write that lands after the read always fires the set.
pub trait ResourceStore: Send + Sync {
    /// Returns the type's table index and the resource, if present.
    fn read(&self, ws: &mut WatchSet, id: &ResourceId) -> VigilResult<(Index, Option<Resource>)>;

    /// Resources of `ty`, sorted by id, optionally restricted to one tenancy.
    fn list(&self, ws: &mut WatchSet, ty: &ResourceType, tenancy: Option<&Tenancy>)
        -> VigilResult<(Index, Vec<Resource>)>;

    fn list_where(
        &self,
        ws: &mut WatchSet,
        ty: &ResourceType,
        pred: &dyn Fn(&Resource) -> bool,
    ) -> VigilResult<(Index, Vec<Resource>)> {
        let (index, items) = self.list(ws, ty, None)?;
        Ok((index, items.into_iter().filter(|r| pred(r)).collect()))
    }

    /// Insert or update. A non-empty `version` must match the stored one.
    fn write(&self, resource: Resource) -> VigilResult<Resource>;

    /// Remove `id`; deleting a missing resource is not an error.
    fn delete(&self, id: &ResourceId) -> VigilResult<Index>;

    fn current_index(&self) -> Index;
}

#[derive(Default)]
struct Tables {
    index: Index,
    resources: FxHashMap<ResourceId, Resource>,
    type_index: FxHashMap<ResourceType, Index>,
}

#[derive(Default)]
struct Channels {
    types: FxHashMap<ResourceType, watch::Sender<Index>>,
    items: FxHashMap<ResourceId, watch::Sender<Index>>,
}

/// In-RAM [`ResourceStore`] with a single monotonic modify index.
#[derive(Default)]
pub struct MemStore {
    tables: RwLock<Tables>,
    channels: Mutex<Channels>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.read().unwrap_or_else(|e| e.into_inner()).resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn watch_type(&self, ws: &mut WatchSet, ty: &ResourceType) {
        let mut ch = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if !ch.types.contains_key(ty) {
            ch.types.retain(|_, tx| tx.receiver_count() > 0);
        }
        let tx = ch.types.entry(ty.clone()).or_insert_with(|| watch::channel(0).0);
        ws.add(tx.subscribe());
    }

    /// Ids that are read but never written would otherwise keep their sender forever, so
    /// senders nobody listens to are swept whenever a new one is created.
    fn watch_item(&self, ws: &mut WatchSet, id: &ResourceId) {
        let mut ch = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if !ch.items.contains_key(id) {
            ch.items.retain(|_, tx| tx.receiver_count() > 0);
        }
        let tx = ch.items.entry(id.clone()).or_insert_with(|| watch::channel(0).0);
        ws.add(tx.subscribe());
    }

    #[cfg(test)]
    fn watched_items(&self) -> usize {
        self.channels.lock().unwrap_or_else(|e| e.into_inner()).items.len()
    }

    fn notify(&self, id: &ResourceId, index: Index) {
        let mut ch = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = ch.types.get(&id.ty) {
            tx.send_replace(index);
            if tx.receiver_count() == 0 {
                ch.types.remove(&id.ty);
            }
        }
        if let Some(tx) = ch.items.get(id) {
            tx.send_replace(index);
            if tx.receiver_count() == 0 {
                ch.items.remove(id);
            }
        }
    }
}

impl ResourceStore for MemStore {
    fn read(&self, ws: &mut WatchSet, id: &ResourceId) -> VigilResult<(Index, Option<Resource>)> {
        self.watch_item(ws, id);
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let index = t.type_index.get(&id.ty).copied().unwrap_or(0);
        Ok((index, t.resources.get(id).cloned()))
    }

    fn list(
        &self,
        ws: &mut WatchSet,
        ty: &ResourceType,
        tenancy: Option<&Tenancy>,
    ) -> VigilResult<(Index, Vec<Resource>)> {
        self.watch_type(ws, ty);
        let t = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let index = t.type_index.get(ty).copied().unwrap_or(0);
        let mut items: Vec<Resource> = t
            .resources
            .values()
            .filter(|r| &r.id.ty == ty && tenancy.map_or(true, |tn| &r.id.tenancy == tn))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok((index, items))
    }

    fn write(&self, mut resource: Resource) -> VigilResult<Resource> {
        let index = {
            let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
            let existing = t.resources.get(&resource.id);
            if !resource.version.is_empty() {
                match existing {
                    Some(cur) if cur.version != resource.version => {
                        return Err(VigilError::Conflict(format!(
                            "{}: version {} does not match {}",
                            resource.id, resource.version, cur.version
                        )));
                    }
                    None => {
                        return Err(VigilError::Conflict(format!("{}: version given for a missing resource", resource.id)));
                    }
                    _ => {}
                }
            }
            let generation = match existing {
                Some(cur) if cur.data == resource.data && cur.owner == resource.owner && cur.metadata == resource.metadata => {
                    // Unchanged; keep the stored version so watchers don't wake.
                    return Ok(cur.clone());
                }
                Some(cur) if cur.data == resource.data => cur.generation,
                Some(cur) => cur.generation + 1,
                None => 1,
            };
            t.index += 1;
            let index = t.index;
            resource.version = index.to_string();
            resource.generation = generation;
            t.type_index.insert(resource.id.ty.clone(), index);
            t.resources.insert(resource.id.clone(), resource.clone());
            index
        };
        counter!("store_writes_total", 1u64);
        debug!(id = %resource.id, index, "resource written");
        self.notify(&resource.id, index);
        Ok(resource)
    }

    fn delete(&self, id: &ResourceId) -> VigilResult<Index> {
        let index = {
            let mut t = self.tables.write().unwrap_or_else(|e| e.into_inner());
            if t.resources.remove(id).is_none() {
                return Ok(t.index);
            }
            t.index += 1;
            let index = t.index;
            t.type_index.insert(id.ty.clone(), index);
            index
        };
        counter!("store_deletes_total", 1u64);
        debug!(id = %id, index, "resource deleted");
        self.notify(id, index);
        Ok(index)
    }

    fn current_index(&self) -> Index {
        self.tables.read().unwrap_or_else(|e| e.into_inner()).index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(name: &str) -> ResourceId {
        ResourceId::new(ResourceType::new("catalog", "v1", "Node"), name)
    }

    #[test]
    fn write_assigns_version_and_generation() {
        let store = MemStore::new();
        let a = store.write(Resource::new(node("a"), json!({ "addr": "1" }))).expect("write");
        assert_eq!(a.version, "1");
        assert_eq!(a.generation, 1);

        let mut next = a.clone();
        next.data = json!({ "addr": "2" });
        let b = store.write(next).expect("update");
        assert_eq!(b.version, "2");
        assert_eq!(b.generation, 2);

        let meta_only = b.clone().with_metadata("zone", "z1");
        let c = store.write(meta_only).expect("metadata");
        assert_eq!(c.generation, 2);
        assert_eq!(store.current_index(), 3);
    }

    #[test]
    fn identical_write_is_a_no_op() {
        let store = MemStore::new();
        let a = store.write(Resource::new(node("a"), json!({}))).expect("write");
        let again = store.write(Resource::new(node("a"), json!({}))).expect("rewrite");
        assert_eq!(again.version, a.version);
        assert_eq!(store.current_index(), 1);
    }

    #[test]
    fn stale_version_conflicts() {
        let store = MemStore::new();
        let a = store.write(Resource::new(node("a"), json!({ "v": 1 }))).expect("write");
        let mut first = a.clone();
        first.data = json!({ "v": 2 });
        store.write(first).expect("first writer wins");
        let mut second = a;
        second.data = json!({ "v": 3 });
        assert!(matches!(store.write(second), Err(VigilError::Conflict(_))));
    }

    #[test]
    fn list_filters_by_type_and_tenancy() {
        let store = MemStore::new();
        store.write(Resource::new(node("b"), json!({}))).expect("write");
        store.write(Resource::new(node("a"), json!({}))).expect("write");
        let other = Tenancy { partition: "p2".into(), ..Tenancy::default() };
        store.write(Resource::new(node("c").with_tenancy(other.clone()), json!({}))).expect("write");
        let svc = ResourceId::new(ResourceType::new("catalog", "v1", "Service"), "web");
        store.write(Resource::new(svc, json!({}))).expect("write");

        let ty = ResourceType::new("catalog", "v1", "Node");
        let (index, all) = store.list(&mut WatchSet::new(), &ty, None).expect("list");
        assert_eq!(index, 3);
        let names: Vec<_> = all.iter().map(|r| r.id.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let (_, scoped) = store.list(&mut WatchSet::new(), &ty, Some(&other)).expect("list");
        assert_eq!(scoped.len(), 1);

        let (_, picked) = store.list_where(&mut WatchSet::new(), &ty, &|r: &Resource| r.id.name != "a").expect("list");
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn reads_of_unwritten_ids_do_not_accumulate_channels() {
        let store = MemStore::new();
        for n in 0..100 {
            store.read(&mut WatchSet::new(), &node(&format!("missing-{n}"))).expect("read");
        }
        assert!(store.watched_items() <= 1, "{} item channels kept", store.watched_items());

        let mut held = WatchSet::new();
        store.read(&mut held, &node("watched")).expect("read");
        store.read(&mut WatchSet::new(), &node("other")).expect("read");
        assert_eq!(store.watched_items(), 2);
        drop(held);
        store.read(&mut WatchSet::new(), &node("third")).expect("read");
        assert_eq!(store.watched_items(), 1);
    }

    #[test]
    fn delete_bumps_index_once() {
        let store = MemStore::new();
        store.write(Resource::new(node("a"), json!({}))).expect("write");
        assert_eq!(store.delete(&node("a")).expect("delete"), 2);
        assert_eq!(store.delete(&node("a")).expect("idempotent"), 2);
        let (index, got) = store.read(&mut WatchSet::new(), &node("a")).expect("read");
        assert_eq!(index, 2);
        assert!(got.is_none());
        assert!(store.is_empty());
    }
}
