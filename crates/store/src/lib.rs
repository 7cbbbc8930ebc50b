//! Vigil store: watch sets, the blocking-query primitive and an in-RAM resource store.

#![forbid(unsafe_code)]

pub mod blocking;
pub mod mem;
pub mod watch;

pub use blocking::{blocking_query, BlockingConfig, QueryOptions};
pub use mem::{MemStore, ResourceStore};
pub use watch::{WatchOutcome, WatchSet};
