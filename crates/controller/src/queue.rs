use std::collections::VecDeque;
use std::sync::Mutex;

use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use vigil_core::ResourceId;

#[derive(Default)]
struct QueueState {
    order: VecDeque<ResourceId>,
    queued: FxHashSet<ResourceId>,
    in_flight: FxHashSet<ResourceId>,
    /// Enqueued again while in flight; re-queued by `done`.
    dirty: FxHashSet<ResourceId>,
    shutdown: bool,
}

/// Coalescing work queue keyed by resource id with FIFO order.
///
/// An id is pending at most once and handed to at most one worker at a time.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Returns true when `id` became pending because of this call.
    pub fn add(&self, id: ResourceId) -> bool {
        let mut s = self.lock();
        if s.shutdown {
            return false;
        }
        if s.in_flight.contains(&id) {
            s.dirty.insert(id);
            return false;
        }
        if !s.queued.insert(id.clone()) {
            return false;
        }
        s.order.push_back(id);
        drop(s);
        self.ready.notify_one();
        true
    }

    /// Next pending id, marked in flight. `None` once the queue is shut down.
    pub async fn next(&self) -> Option<ResourceId> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut s = self.lock();
                if s.shutdown {
                    return None;
                }
                if let Some(id) = s.order.pop_front() {
                    s.queued.remove(&id);
                    s.in_flight.insert(id.clone());
                    let more = !s.order.is_empty();
                    drop(s);
                    if more {
                        self.ready.notify_one();
                    }
                    return Some(id);
                }
            }
            notified.await;
        }
    }

    /// Release `id`; if it was enqueued while in flight it becomes pending again.
    pub fn done(&self, id: &ResourceId) {
        let mut s = self.lock();
        s.in_flight.remove(id);
        if s.dirty.remove(id) && !s.shutdown && s.queued.insert(id.clone()) {
            s.order.push_back(id.clone());
            drop(s);
            self.ready.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Drop pending work and release every waiting worker.
    pub fn shutdown(&self) {
        let mut s = self.lock();
        s.shutdown = true;
        s.order.clear();
        s.queued.clear();
        s.dirty.clear();
        drop(s);
        self.ready.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }
}
