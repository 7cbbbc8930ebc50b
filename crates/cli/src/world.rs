//! In-process two-datacenter world used by the demo commands.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vigil_cache::{CacheConfig, CacheEngine, CacheRequest, CacheType, FetchOptions, FetchResult, RegisterOptions, RequestInfo};
use vigil_controller::{Controller, ReconcileRequest, Reconciler, Runtime};
use vigil_core::{
    require, AllowAll, Authorizer, Capability, ChangeEvent, DenyAll, Index, Resource, ResourceId, ResourceType,
    StaticAuthorizer, StaticTokens, TokenResolver, VigilResult,
};
use vigil_datasource::{Authority, CacheSource, DataSource, Dispatch, LocalQuery, LocalSource, Routable};
use vigil_registry::{Registration, Schema, TypeRegistry};
use vigil_store::{blocking_query, BlockingConfig, MemStore, QueryOptions, ResourceStore, WatchSet};

pub const LOCAL_DC: &str = "dc1";
pub const REMOTE_DC: &str = "dc2";

pub fn service_type() -> ResourceType {
    ResourceType::new("catalog", "v1", "Service")
}

pub fn node_type() -> ResourceType {
    ResourceType::new("catalog", "v1", "Node")
}

pub fn workload_type() -> ResourceType {
    ResourceType::new("apps", "v1", "Workload")
}

/// Subscription request for the address of a service.
#[derive(Debug, Clone)]
pub struct ServiceQuery {
    pub name: String,
    pub datacenter: String,
    pub token: String,
}

impl Routable for ServiceQuery {
    fn datacenter(&self) -> &str {
        &self.datacenter
    }
    fn partition(&self) -> &str {
        ""
    }
    fn token(&self) -> &str {
        &self.token
    }
}

impl CacheRequest for ServiceQuery {
    fn cache_info(&self) -> RequestInfo {
        RequestInfo {
            key: format!("service/{}", self.name),
            token: self.token.clone(),
            datacenter: self.datacenter.clone(),
            ..RequestInfo::default()
        }
    }
}

fn service_schema() -> Schema {
    Schema::named("catalog.v1.Service").with_description("service instance address").with_json_schema(json!({
        "type": "object",
        "required": ["address"],
        "properties": { "address": { "type": "string", "minLength": 1 } }
    }))
}

/// With the `validate` feature the service schema's JSON schema is compiled into the hook.
#[cfg(feature = "validate")]
fn with_service_validation(reg: Registration) -> VigilResult<Registration> {
    let validate = vigil_registry::json_schema_validator(&reg.schema)?;
    Ok(Registration { validate, ..reg })
}

#[cfg(not(feature = "validate"))]
fn with_service_validation(reg: Registration) -> VigilResult<Registration> {
    Ok(reg.with_validate(|res: &Resource| match res.data.get("address").and_then(|a| a.as_str()) {
        Some(addr) if !addr.is_empty() => Ok(()),
        _ => Err(vigil_core::VigilError::Validation(format!("{}: address is required", res.id))),
    }))
}

fn registry() -> VigilResult<TypeRegistry> {
    let registry = TypeRegistry::new();
    registry.register(with_service_validation(
        Registration::new(service_type())
            .with_schema(service_schema())
            .with_read(|authz: &dyn Authorizer, id: &ResourceId| require(authz, Capability::ServiceRead(id.name.clone())))
            .with_write(|authz: &dyn Authorizer, res: &Resource| {
                require(authz, Capability::ServiceWrite(res.id.name.clone()))
            }),
    )?)?;
    registry.register(
        Registration::new(node_type())
            .with_schema(Schema::named("catalog.v1.Node").with_description("node health"))
            .with_read(|authz: &dyn Authorizer, id: &ResourceId| require(authz, Capability::NodeRead(id.name.clone()))),
    )?;
    registry.register(
        Registration::new(workload_type())
            .with_schema(Schema::named("apps.v1.Workload").with_description("workload placed on a node")),
    )?;
    Ok(registry)
}

/// Address of `query.name` as seen through `store`, authorized by the registry's read hook.
fn service_address(
    registry: &TypeRegistry,
    ws: &mut WatchSet,
    store: &dyn ResourceStore,
    authz: &dyn Authorizer,
    query: &ServiceQuery,
) -> VigilResult<(Index, Option<String>)> {
    let id = ResourceId::new(service_type(), query.name.clone());
    registry.admit_read(authz, &id)?;
    let (index, found) = store.read(ws, &id)?;
    let address = found.and_then(|r| r.data.get("address").and_then(|a| a.as_str()).map(str::to_string));
    Ok((index, address))
}

/// The remote datacenter's catalog, reached through the cache with blocking fetches.
pub struct RemoteCatalog {
    registry: Arc<TypeRegistry>,
    store: Arc<MemStore>,
    tokens: Arc<StaticTokens>,
    blocking: BlockingConfig,
    cancel: CancellationToken,
}

#[async_trait]
impl CacheType for RemoteCatalog {
    type Request = ServiceQuery;
    type Value = Option<String>;

    async fn fetch(&self, opts: FetchOptions<Option<String>>, req: &ServiceQuery) -> VigilResult<FetchResult<Option<String>>> {
        let authz = self.tokens.resolve(&req.token)?;
        let query = QueryOptions {
            min_query_index: opts.min_index,
            max_query_time: opts.timeout,
            allow_stale: opts.allow_stale,
            token: req.token.clone(),
        };
        debug!(dc = %req.datacenter, min_index = opts.min_index, "remote catalog fetch");
        let (index, value) = blocking_query(&self.cancel, &query, &self.blocking, |ws| {
            service_address(&self.registry, ws, self.store.as_ref(), authz.as_ref(), req)
        })
        .await?;
        Ok(FetchResult { value, index })
    }

    fn register_options(&self) -> RegisterOptions {
        RegisterOptions::blocking()
    }
}

/// Marks each workload ready when its node is healthy.
struct WorkloadReadiness;

#[async_trait]
impl Reconciler for WorkloadReadiness {
    async fn reconcile(&self, rt: &Runtime, req: ReconcileRequest) -> VigilResult<()> {
        let mut ws = WatchSet::new();
        let Some(workload) = rt.store.read(&mut ws, &req.id)?.1 else {
            return Ok(());
        };
        let node_name = workload.data.get("node").and_then(|n| n.as_str()).unwrap_or_default().to_string();
        let healthy = rt
            .store
            .read(&mut ws, &ResourceId::new(node_type(), node_name.clone()))?
            .1
            .and_then(|n| n.data.get("healthy").and_then(|h| h.as_bool()))
            .unwrap_or(false);
        let ready = if healthy { "true" } else { "false" };
        if workload.metadata.get("ready").map(String::as_str) == Some(ready) {
            return Ok(());
        }
        debug!(workload = %req.id.name, node = %node_name, ready, "updating readiness");
        rt.store.write(workload.with_metadata("ready", ready))?;
        Ok(())
    }
}

/// Workloads are owned by the node they are placed on.
fn workloads_on_node(rt: &Runtime, ev: &ChangeEvent) -> VigilResult<Vec<ReconcileRequest>> {
    let node = &ev.resource.id;
    let (_, on_node) =
        rt.store.list_where(&mut WatchSet::new(), &workload_type(), &|r: &Resource| r.owner.as_ref() == Some(node))?;
    Ok(on_node.into_iter().map(|r| ReconcileRequest::new(r.id)).collect())
}

pub fn workload_controller() -> Controller {
    Controller::new(workload_type(), WorkloadReadiness).with_watch(node_type(), workloads_on_node)
}

pub struct World {
    pub registry: Arc<TypeRegistry>,
    pub local: Arc<MemStore>,
    pub remote: Arc<MemStore>,
    pub tokens: Arc<StaticTokens>,
    pub cache: CacheEngine<RemoteCatalog>,
    pub dispatch: Dispatch<ServiceQuery, Option<String>>,
}

impl World {
    pub fn build(cancel: CancellationToken) -> VigilResult<Self> {
        let registry = Arc::new(registry()?);
        let local = Arc::new(MemStore::new());
        let remote = Arc::new(MemStore::new());
        let tokens = Arc::new(StaticTokens::new());
        tokens.insert("operator", Arc::new(AllowAll));
        tokens.insert("web-reader", Arc::new(StaticAuthorizer::new([Capability::ServiceRead("web".into())])));
        tokens.insert("anonymous", Arc::new(DenyAll));

        let blocking = BlockingConfig::from_env();
        let cache = CacheEngine::new(
            "remote-catalog",
            RemoteCatalog {
                registry: Arc::clone(&registry),
                store: Arc::clone(&remote),
                tokens: Arc::clone(&tokens),
                blocking: blocking.clone(),
                cancel,
            },
            CacheConfig::from_env(),
        );

        let query_registry = Arc::clone(&registry);
        let query: LocalQuery<ServiceQuery, Option<String>> = Arc::new(
            move |ws: &mut WatchSet, store: &dyn ResourceStore, authz: &dyn Authorizer, req: &ServiceQuery| {
                service_address(&query_registry, ws, store, authz, req)
            },
        );
        let local_source = LocalSource::new(local.clone(), tokens.clone(), query).with_blocking(blocking);
        let dispatch = Dispatch::new(
            Authority::new(LOCAL_DC, "default"),
            Arc::new(local_source) as Arc<dyn DataSource<ServiceQuery, Option<String>>>,
            Arc::new(CacheSource::new(cache.clone())) as Arc<dyn DataSource<ServiceQuery, Option<String>>>,
        );
        Ok(Self { registry, local, remote, tokens, cache, dispatch })
    }

    pub fn seed(&self) -> VigilResult<()> {
        for (name, healthy) in [("n1", true), ("n2", true)] {
            self.local.write(Resource::new(ResourceId::new(node_type(), name), json!({ "healthy": healthy })))?;
        }
        for (name, node) in [("w1", "n1"), ("w2", "n1"), ("w3", "n1"), ("w4", "n2")] {
            let workload = Resource::new(ResourceId::new(workload_type(), name), json!({ "node": node }))
                .with_owner(ResourceId::new(node_type(), node));
            self.local.write(workload)?;
        }
        self.write_service(LOCAL_DC, "web", "10.0.0.1")?;
        self.write_service(REMOTE_DC, "web", "10.1.0.1")?;
        Ok(())
    }

    pub fn write_service(&self, dc: &str, name: &str, address: &str) -> VigilResult<()> {
        let store = if dc == REMOTE_DC { &self.remote } else { &self.local };
        let res = Resource::new(ResourceId::new(service_type(), name), json!({ "address": address }));
        self.registry.admit_write(&AllowAll, &res)?;
        store.write(res)?;
        Ok(())
    }

    /// One round of simulated change: addresses move in both datacenters and node n1 flaps.
    pub fn step(&self, round: u64) -> VigilResult<()> {
        let octet = round % 250 + 1;
        self.write_service(LOCAL_DC, "web", &format!("10.0.0.{octet}"))?;
        self.write_service(REMOTE_DC, "web", &format!("10.1.0.{octet}"))?;
        self.local.write(Resource::new(ResourceId::new(node_type(), "n1"), json!({ "healthy": round % 2 == 0 })))?;
        Ok(())
    }
}
