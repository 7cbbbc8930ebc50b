use std::time::Duration;

use async_trait::async_trait;
use vigil_core::{Index, VigilResult};

/// Parameters handed to an upstream fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions<V> {
    /// Block upstream until the data index exceeds this (0 = answer immediately).
    pub min_index: Index,
    pub timeout: Duration,
    /// Forwarded verbatim from the request; part of the cache key, so every consumer of an
    /// entry asked for the same consistency.
    pub allow_stale: bool,
    pub last_value: Option<V>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult<V> {
    pub value: V,
    pub index: Index,
}

/// Per-type cache behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOptions {
    /// The upstream honours `min_index` by blocking.
    pub supports_blocking: bool,
    /// Pause between refreshes of a type that cannot block.
    pub refresh_timer: Duration,
    /// Upstream timeout for background blocking fetches.
    pub query_timeout: Duration,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self { supports_blocking: false, refresh_timer: Duration::from_secs(30), query_timeout: Duration::from_secs(600) }
    }
}

impl RegisterOptions {
    pub fn blocking() -> Self {
        Self { supports_blocking: true, ..Self::default() }
    }
}

/// What the engine needs to know about a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    /// Identity of the data requested; empty disables caching for the request.
    pub key: String,
    pub token: String,
    pub datacenter: String,
    pub min_index: Index,
    pub timeout: Duration,
    pub allow_stale: bool,
}

impl RequestInfo {
    /// Entry key. Blocking parameters are excluded; the consistency mode is not.
    pub fn cache_key(&self) -> String {
        let mode = if self.allow_stale { "stale" } else { "consistent" };
        format!("{}/{}/{}/{}", self.datacenter, self.token, mode, self.key)
    }
}

pub trait CacheRequest: Send + Sync {
    fn cache_info(&self) -> RequestInfo;
}

/// An upstream data type served through a [`crate::CacheEngine`].
#[async_trait]
pub trait CacheType: Send + Sync + 'static {
    type Request: CacheRequest + Clone + 'static;
    type Value: Clone + Send + Sync + 'static;

    async fn fetch(&self, opts: FetchOptions<Self::Value>, req: &Self::Request) -> VigilResult<FetchResult<Self::Value>>;

    fn register_options(&self) -> RegisterOptions {
        RegisterOptions::default()
    }
}
