use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use vigil_core::Index;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Something a read registered interest in changed.
    Fired,
    TimedOut,
    Canceled,
}

/// Change subscriptions collected while a read runs. Waited on at most once.
#[derive(Debug, Default)]
pub struct WatchSet {
    channels: Vec<watch::Receiver<Index>>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. Only values sent after the receiver was created fire the set.
    pub fn add(&mut self, rx: watch::Receiver<Index>) {
        self.channels.push(rx);
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Block until any channel fires, `timeout` elapses or `cancel` triggers.
    /// A closed channel counts as fired; an empty set only waits for the timeout.
    pub async fn wait(self, cancel: &CancellationToken, timeout: Duration) -> WatchOutcome {
        let mut channels = self.channels;
        let fired = async move {
            if channels.is_empty() {
                std::future::pending::<()>().await;
            }
            let pending: Vec<_> = channels.iter_mut().map(|rx| Box::pin(rx.changed())).collect();
            let _ = futures::future::select_all(pending).await;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => WatchOutcome::Canceled,
            _ = fired => WatchOutcome::Fired,
            _ = tokio::time::sleep(timeout) => WatchOutcome::TimedOut,
        }
    }
}
