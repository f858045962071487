//! Bounded FIFO hand-off of metric families from the collector to the forwarder.
//!
//! Pushing into a full queue waits for the forwarder to free a slot; nothing is
//! dropped. The queue has exactly one sender and one receiver, neither is `Clone`.

use tokio::sync::mpsc;

use crate::model::MetricFamily;

/// Default queue capacity, in metric families.
pub const QUEUE_CAPACITY: usize = 1024;

/// Returned when the receiving side is gone. Carries the rejected family back.
#[derive(Debug)]
pub struct QueueClosed(pub MetricFamily);

impl std::fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue closed, family {} not accepted", self.0.name)
    }
}

impl std::error::Error for QueueClosed {}

/// Creates a queue holding at most `capacity` families.
pub fn bounded(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (QueueSender { tx }, QueueReceiver { rx })
}

/// Producer half, owned by the collector.
#[derive(Debug)]
pub struct QueueSender {
    tx: mpsc::Sender<MetricFamily>,
}

impl QueueSender {
    /// Appends a family, waiting while the queue is full.
    pub async fn push(&self, family: MetricFamily) -> Result<(), QueueClosed> {
        self.tx.send(family).await.map_err(|e| QueueClosed(e.0))
    }

    /// Number of free slots right now.
    pub fn free_slots(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer half, owned by the forwarder.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<MetricFamily>,
}

impl QueueReceiver {
    /// Waits for the next family. Returns `None` once the sender is dropped and the
    /// queue is drained.
    pub async fn pop(&mut self) -> Option<MetricFamily> {
        self.rx.recv().await
    }

    /// Takes the next family if one is already queued.
    pub fn try_pop(&mut self) -> Option<MetricFamily> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
