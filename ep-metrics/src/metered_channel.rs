//! An mpsc channel wrapper that keeps a gauge in sync with queue depth, so
//! the CheckpointManager's item queue and the Flusher's batch queue show up
//! in `/metrics` without every call site remembering to touch a counter.

use prometheus::IntGauge;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub struct Sender<T> {
    inner: mpsc::Sender<T>,
    gauge: IntGauge,
}

pub struct Receiver<T> {
    inner: mpsc::Receiver<T>,
    gauge: IntGauge,
}

pub fn channel<T>(size: usize, gauge: &IntGauge) -> (Sender<T>, Receiver<T>) {
    gauge.set(0);
    let (tx, rx) = mpsc::channel(size);
    (
        Sender { inner: tx, gauge: gauge.clone() },
        Receiver { inner: rx, gauge: gauge.clone() },
    )
}

impl<T> Sender<T> {
    pub async fn send(&self, value: T) -> Result<(), mpsc::error::SendError<T>> {
        self.inner.send(value).await?;
        self.gauge.inc();
        Ok(())
    }

    pub fn try_send(&self, value: T) -> Result<(), mpsc::error::TrySendError<T>> {
        self.inner.try_send(value)?;
        self.gauge.inc();
        Ok(())
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), gauge: self.gauge.clone() }
    }
}

impl<T> Receiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.inner.recv().await;
        if item.is_some() {
            self.gauge.dec();
        }
        item
    }

    pub fn try_recv(&mut self) -> Result<T, mpsc::error::TryRecvError> {
        let item = self.inner.try_recv()?;
        self.gauge.dec();
        Ok(item)
    }

    pub fn close(&mut self) {
        self.inner.close();
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let poll = self.inner.poll_recv(cx);
        if let Poll::Ready(Some(_)) = &poll {
            self.gauge.dec();
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gauge_tracks_queue_depth() {
        let gauge = IntGauge::new("test_depth", "test").unwrap();
        let (tx, mut rx) = channel(8, &gauge);

        assert_eq!(gauge.get(), 0);
        tx.send(1).await.unwrap();
        assert_eq!(gauge.get(), 1);
        tx.send(2).await.unwrap();
        assert_eq!(gauge.get(), 2);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(gauge.get(), 1);
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(gauge.get(), 0);
    }
}
