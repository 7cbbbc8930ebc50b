//! Vigil cache engine.
//!
//! Concurrent requests for one key share a single upstream fetch. A requested key is kept
//! current by background blocking fetches until it goes unused for the idle window, and a
//! failed refresh keeps serving the last good value, marked degraded.

#![forbid(unsafe_code)]

pub mod engine;
pub mod stats;
pub mod types;

pub use engine::{CacheConfig, CacheEngine, CacheResult, EntryInfo};
pub use stats::CacheStats;
pub use types::{CacheRequest, CacheType, FetchOptions, FetchResult, RegisterOptions, RequestInfo};
