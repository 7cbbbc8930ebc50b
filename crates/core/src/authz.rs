//! Authorization primitives. Token parsing and policy evaluation live outside Vigil;
//! components only see a resolved [`Authorizer`].

use std::fmt;
use std::sync::{Arc, RwLock};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{VigilError, VigilResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    OperatorRead,
    OperatorWrite,
    ServiceRead(String),
    ServiceWrite(String),
    NodeRead(String),
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::OperatorRead => write!(f, "operator:read"),
            Capability::OperatorWrite => write!(f, "operator:write"),
            Capability::ServiceRead(name) => write!(f, "service:read on {name}"),
            Capability::ServiceWrite(name) => write!(f, "service:write on {name}"),
            Capability::NodeRead(name) => write!(f, "node:read on {name}"),
        }
    }
}

pub trait Authorizer: Send + Sync {
    fn allows(&self, capability: &Capability) -> bool;
}

/// Map a denied capability to `PermissionDenied`.
pub fn require(authz: &dyn Authorizer, capability: Capability) -> VigilResult<()> {
    if authz.allows(&capability) {
        Ok(())
    } else {
        Err(VigilError::PermissionDenied(format!("{capability} not allowed")))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn allows(&self, _capability: &Capability) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn allows(&self, _capability: &Capability) -> bool {
        false
    }
}

/// Fixed grant set.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    granted: FxHashSet<Capability>,
}

impl StaticAuthorizer {
    pub fn new(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self { granted: caps.into_iter().collect() }
    }

    pub fn grant(mut self, cap: Capability) -> Self {
        self.granted.insert(cap);
        self
    }
}

impl Authorizer for StaticAuthorizer {
    fn allows(&self, capability: &Capability) -> bool {
        self.granted.contains(capability)
    }
}

/// Resolves a secret token to the authorizer currently attached to it.
pub trait TokenResolver: Send + Sync {
    fn resolve(&self, token: &str) -> VigilResult<Arc<dyn Authorizer>>;
}

/// In-memory token table. Entries may be replaced at runtime, which is how
/// permission changes reach long-lived subscriptions.
#[derive(Default)]
pub struct StaticTokens {
    tokens: RwLock<FxHashMap<String, Arc<dyn Authorizer>>>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, authz: Arc<dyn Authorizer>) {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens.insert(token.into(), authz);
    }

    pub fn revoke(&self, token: &str) {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens.remove(token);
    }
}

impl TokenResolver for StaticTokens {
    fn resolve(&self, token: &str) -> VigilResult<Arc<dyn Authorizer>> {
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        tokens
            .get(token)
            .cloned()
            .ok_or_else(|| VigilError::PermissionDenied("token not found".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_authorizer_checks_grants() {
        let authz = StaticAuthorizer::new([Capability::OperatorRead]).grant(Capability::ServiceRead("web".into()));
        assert!(require(&authz, Capability::OperatorRead).is_ok());
        assert!(require(&authz, Capability::ServiceRead("web".into())).is_ok());
        let err = require(&authz, Capability::OperatorWrite).unwrap_err();
        assert_eq!(err, VigilError::PermissionDenied("operator:write not allowed".into()));
    }

    #[test]
    fn revoked_token_no_longer_resolves() {
        let tokens = StaticTokens::new();
        tokens.insert("t1", Arc::new(AllowAll));
        assert!(tokens.resolve("t1").is_ok());
        tokens.revoke("t1");
        assert!(matches!(tokens.resolve("t1"), Err(e) if e.is_permission_denied()));
    }
}
