//! Vigil type registry: maps a GVK to its schema, authorization hooks and validator.
//!
//! Registration happens once at startup; resolution happens on every request, so reads go
//! through an `ArcSwap` of an immutable map and never take a lock.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tracing::{debug, info};
use vigil_core::{require, Authorizer, Capability, Resource, ResourceId, ResourceType, Tenancy, VigilError, VigilResult};

mod schema;

pub use schema::Schema;
#[cfg(feature = "jsonschema-validate")]
pub use schema::json_schema_validator;

pub type ReadHook = Arc<dyn Fn(&dyn Authorizer, &ResourceId) -> VigilResult<()> + Send + Sync>;
pub type WriteHook = Arc<dyn Fn(&dyn Authorizer, &Resource) -> VigilResult<()> + Send + Sync>;
pub type ListHook = Arc<dyn Fn(&dyn Authorizer, &Tenancy) -> VigilResult<()> + Send + Sync>;
pub type ValidateHook = Arc<dyn Fn(&Resource) -> VigilResult<()> + Send + Sync>;

/// Authorization hooks supplied by a registrant. Missing hooks get defaults on register.
#[derive(Clone, Default)]
pub struct AclHooks {
    pub read: Option<ReadHook>,
    pub write: Option<WriteHook>,
    pub list: Option<ListHook>,
}

/// What a registrant hands to [`TypeRegistry::register`].
#[derive(Clone)]
pub struct Registration {
    pub ty: ResourceType,
    pub schema: Schema,
    pub acls: AclHooks,
    pub validate: Option<ValidateHook>,
}

impl Registration {
    pub fn new(ty: ResourceType) -> Self {
        let schema = Schema::named(ty.gvk());
        Self { ty, schema, acls: AclHooks::default(), validate: None }
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_read<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn Authorizer, &ResourceId) -> VigilResult<()> + Send + Sync + 'static,
    {
        self.acls.read = Some(Arc::new(f));
        self
    }

    pub fn with_write<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn Authorizer, &Resource) -> VigilResult<()> + Send + Sync + 'static,
    {
        self.acls.write = Some(Arc::new(f));
        self
    }

    pub fn with_list<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn Authorizer, &Tenancy) -> VigilResult<()> + Send + Sync + 'static,
    {
        self.acls.list = Some(Arc::new(f));
        self
    }

    pub fn with_validate<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource) -> VigilResult<()> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(f));
        self
    }
}

/// A resolved registration. Every hook is present.
pub struct RegisteredType {
    pub ty: ResourceType,
    pub schema: Schema,
    read: ReadHook,
    write: WriteHook,
    list: ListHook,
    validate: ValidateHook,
}

impl RegisteredType {
    fn from_registration(reg: Registration) -> Self {
        let read = reg
            .acls
            .read
            .unwrap_or_else(|| Arc::new(|authz: &dyn Authorizer, _: &ResourceId| require(authz, Capability::OperatorRead)));
        let write = reg
            .acls
            .write
            .unwrap_or_else(|| Arc::new(|authz: &dyn Authorizer, _: &Resource| require(authz, Capability::OperatorWrite)));
        let list = reg
            .acls
            .list
            .unwrap_or_else(|| Arc::new(|authz: &dyn Authorizer, _: &Tenancy| require(authz, Capability::OperatorRead)));
        let validate = reg.validate.unwrap_or_else(|| Arc::new(|_: &Resource| Ok(())));
        Self { ty: reg.ty, schema: reg.schema, read, write, list, validate }
    }

    pub fn authorize_read(&self, authz: &dyn Authorizer, id: &ResourceId) -> VigilResult<()> {
        (self.read)(authz, id)
    }

    pub fn authorize_write(&self, authz: &dyn Authorizer, res: &Resource) -> VigilResult<()> {
        (self.write)(authz, res)
    }

    pub fn authorize_list(&self, authz: &dyn Authorizer, tenancy: &Tenancy) -> VigilResult<()> {
        (self.list)(authz, tenancy)
    }

    pub fn validate(&self, res: &Resource) -> VigilResult<()> {
        (self.validate)(res)
    }
}

impl fmt::Debug for RegisteredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredType").field("ty", &self.ty).field("schema", &self.schema).finish_non_exhaustive()
    }
}

type TypeMap = FxHashMap<String, Arc<RegisteredType>>;

/// Resource type registry. One instance is built by the process bootstrap and shared by `Arc`.
pub struct TypeRegistry {
    types: ArcSwap<TypeMap>,
    writer: Mutex<()>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self { types: ArcSwap::from_pointee(TypeMap::default()), writer: Mutex::new(()) }
    }

    /// Register a type. Fails without touching existing state on an incomplete or duplicate GVK.
    pub fn register(&self, reg: Registration) -> VigilResult<Arc<RegisteredType>> {
        if !reg.ty.is_complete() {
            return Err(VigilError::InvalidType(format!(
                "type field(s) cannot be empty: group={:?} group_version={:?} kind={:?}",
                reg.ty.group, reg.ty.group_version, reg.ty.kind
            )));
        }
        let key = reg.ty.gvk();
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.types.load_full();
        if current.contains_key(&key) {
            return Err(VigilError::AlreadyRegistered(format!("resource type {key} already registered")));
        }
        let registered = Arc::new(RegisteredType::from_registration(reg));
        let mut next: TypeMap = (*current).clone();
        next.insert(key.clone(), Arc::clone(&registered));
        let count = next.len();
        self.types.store(Arc::new(next));
        counter!("registry_register_total", 1u64);
        gauge!("registry_types", count as f64);
        info!(gvk = %key, "registered resource type");
        Ok(registered)
    }

    pub fn resolve(&self, ty: &ResourceType) -> Option<Arc<RegisteredType>> {
        self.resolve_gvk(&ty.gvk())
    }

    pub fn resolve_gvk(&self, gvk: &str) -> Option<Arc<RegisteredType>> {
        self.types.load().get(gvk).cloned()
    }

    /// Like [`resolve`](Self::resolve) but maps a miss to `NotRegistered`.
    pub fn require(&self, ty: &ResourceType) -> VigilResult<Arc<RegisteredType>> {
        self.resolve(ty).ok_or_else(|| VigilError::NotRegistered(ty.gvk()))
    }

    /// All registrations, sorted by GVK.
    pub fn types(&self) -> Vec<Arc<RegisteredType>> {
        let mut out: Vec<_> = self.types.load().values().cloned().collect();
        out.sort_by(|a, b| a.ty.cmp(&b.ty));
        out
    }

    pub fn len(&self) -> usize {
        self.types.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve and authorize a point read.
    pub fn admit_read(&self, authz: &dyn Authorizer, id: &ResourceId) -> VigilResult<Arc<RegisteredType>> {
        let reg = self.require(&id.ty)?;
        reg.authorize_read(authz, id)?;
        Ok(reg)
    }

    /// Resolve and authorize a list within a tenancy.
    pub fn admit_list(&self, authz: &dyn Authorizer, ty: &ResourceType, tenancy: &Tenancy) -> VigilResult<Arc<RegisteredType>> {
        let reg = self.require(ty)?;
        reg.authorize_list(authz, tenancy)?;
        Ok(reg)
    }

    /// Resolve, authorize and validate a write before it reaches the store.
    pub fn admit_write(&self, authz: &dyn Authorizer, res: &Resource) -> VigilResult<Arc<RegisteredType>> {
        let reg = self.require(&res.id.ty)?;
        reg.authorize_write(authz, res)?;
        reg.validate(res)?;
        debug!(id = %res.id, "write admitted");
        Ok(reg)
    }
}
