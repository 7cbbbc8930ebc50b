//! Vigil core types shared by the registry, store, cache, data sources and controllers.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod authz;
pub mod backoff;
pub mod config;
pub mod error;
pub mod event;

pub use authz::{require, AllowAll, Authorizer, Capability, DenyAll, StaticAuthorizer, StaticTokens, TokenResolver};
pub use backoff::BackoffPolicy;
pub use error::{VigilError, VigilResult};
pub use event::UpdateEvent;

/// Monotonically non-decreasing version counter of a dataset.
pub type Index = u64;

/// Group/GroupVersion/Kind identity of a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceType {
    pub group: String,
    pub group_version: String,
    pub kind: String,
}

impl ResourceType {
    pub fn new(group: impl Into<String>, group_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), group_version: group_version.into(), kind: kind.into() }
    }

    /// Single-string key, e.g. `catalog.v1.Service`.
    pub fn gvk(&self) -> String {
        format!("{}.{}.{}", self.group, self.group_version, self.kind)
    }

    pub fn is_complete(&self) -> bool {
        !self.group.is_empty() && !self.group_version.is_empty() && !self.kind.is_empty()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.group, self.group_version, self.kind)
    }
}

/// Parse a GVK key (`group.version.Kind`). The group may itself contain dots.
pub fn parse_gvk_key(key: &str) -> VigilResult<ResourceType> {
    let mut parts = key.rsplitn(3, '.');
    let kind = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("");
    let group = parts.next().unwrap_or("");
    let ty = ResourceType::new(group, version, kind);
    if !ty.is_complete() {
        return Err(VigilError::InvalidType(format!("invalid gvk key: {key} (expect group.version.Kind)")));
    }
    Ok(ty)
}

/// Placement of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tenancy {
    pub partition: String,
    pub namespace: String,
    pub peer_name: String,
}

impl Default for Tenancy {
    fn default() -> Self {
        Self { partition: "default".into(), namespace: "default".into(), peer_name: "local".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub ty: ResourceType,
    pub tenancy: Tenancy,
    pub name: String,
}

impl ResourceId {
    pub fn new(ty: ResourceType, name: impl Into<String>) -> Self {
        Self { ty, tenancy: Tenancy::default(), name: name.into() }
    }

    pub fn with_tenancy(mut self, tenancy: Tenancy) -> Self {
        self.tenancy = tenancy;
        self
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.ty, self.tenancy.partition, self.tenancy.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub owner: Option<ResourceId>,
    /// Assigned by the store on every write; empty for a resource never persisted.
    pub version: String,
    pub generation: u64,
    pub metadata: BTreeMap<String, String>,
    pub data: serde_json::Value,
}

impl Resource {
    pub fn new(id: ResourceId, data: serde_json::Value) -> Self {
        Self { id, owner: None, version: String::new(), generation: 0, metadata: BTreeMap::new(), data }
    }

    pub fn with_owner(mut self, owner: ResourceId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Deserialize `data` into a typed payload.
    pub fn decode<T: DeserializeOwned>(&self) -> VigilResult<DecodedResource<T>> {
        let data = serde_json::from_value(self.data.clone())
            .map_err(|e| VigilError::Validation(format!("{}: {}", self.id, e)))?;
        Ok(DecodedResource { resource: self.clone(), data })
    }
}

/// A resource together with its typed payload.
#[derive(Debug, Clone)]
pub struct DecodedResource<T> {
    pub resource: Resource,
    pub data: T,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    Upsert,
    Delete,
}

/// Observed create/update/delete of a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub resource: Resource,
    pub index: Index,
}

pub mod prelude {
    pub use super::{
        ChangeEvent, ChangeKind, DecodedResource, Index, Resource, ResourceId, ResourceType, Tenancy, UpdateEvent,
        VigilError, VigilResult,
    };
}
