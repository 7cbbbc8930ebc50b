//! Vigil controller manager.
//!
//! A controller reconciles one managed resource type. Changes of the managed type enqueue the
//! changed id; changes of related types go through a mapper that names the managed ids to
//! reconcile. Queues coalesce by id, so a burst of changes costs one reconcile.

#![forbid(unsafe_code)]

pub mod controller;
pub mod manager;
pub mod queue;
mod watch;

pub use controller::{Controller, Mapper, ReconcileRequest, Reconciler, Runtime};
pub use manager::{ControllerStatus, DegradedEntry, Manager, ManagerConfig};
pub use queue::WorkQueue;
