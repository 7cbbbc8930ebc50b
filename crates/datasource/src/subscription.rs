use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vigil_core::UpdateEvent;

/// Stream of updates for one subscription. Dropping it cancels the producer.
pub struct Subscription<V> {
    rx: mpsc::Receiver<UpdateEvent<V>>,
    cancel: CancellationToken,
}

impl<V> Subscription<V> {
    pub fn new(rx: mpsc::Receiver<UpdateEvent<V>>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    pub async fn recv(&mut self) -> Option<UpdateEvent<V>> {
        self.rx.recv().await
    }

    /// Stop the producer; events already queued can still be drained.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl<V> Stream for Subscription<V> {
    type Item = UpdateEvent<V>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<V> Drop for Subscription<V> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn yields_events_and_cancels_on_drop() {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let mut sub = Subscription::new(rx, cancel.clone());
        tx.send(UpdateEvent::value("c", 1, "a")).await.expect("send");
        let ev = sub.next().await.expect("event");
        assert_eq!((ev.index, ev.result.expect("value")), (1, "a"));
        drop(sub);
        assert!(cancel.is_cancelled());
    }
}
