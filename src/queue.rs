//! Thread-safe FIFO queues connecting the pipeline stages.
//!
//! [`Queue::enqueue`] never blocks and wakes one waiting consumer;
//! [`Dequeue::dequeue`] blocks until an item arrives or shutdown is
//! triggered. Both ends share a depth counter so producers can apply
//! back-pressure and the idle probe can tell when the pipeline drained.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::shutdown::Shutdown;

/// The consumer side went away (only happens during shutdown).
#[derive(Debug, Error, PartialEq, Eq)]
#[error("queue consumer has shut down")]
pub struct QueueClosed;

/// Create a connected producer/consumer pair.
pub fn unbounded<T>() -> (Queue<T>, Dequeue<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        Queue {
            tx,
            depth: Arc::clone(&depth),
        },
        Dequeue { rx, depth },
    )
}

/// Producer handle; cheap to clone.
#[derive(Debug)]
pub struct Queue<T> {
    tx: mpsc::UnboundedSender<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: Arc::clone(&self.depth),
        }
    }
}

impl<T> Queue<T> {
    pub fn enqueue(&self, item: T) -> Result<(), QueueClosed> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(item).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            QueueClosed
        })
    }

    /// Items enqueued but not yet dequeued.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A read-only view of the depth, for observers that must not keep the
    /// queue open.
    pub fn depth(&self) -> QueueDepth {
        QueueDepth(Arc::clone(&self.depth))
    }
}

/// Depth observer that does not hold the channel open.
#[derive(Debug, Clone)]
pub struct QueueDepth(Arc<AtomicUsize>);

impl QueueDepth {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Consumer handle; exactly one per queue.
#[derive(Debug)]
pub struct Dequeue<T> {
    rx: mpsc::UnboundedReceiver<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> Dequeue<T> {
    /// Wait for the next item.
    ///
    /// Returns `None` once `shutdown` is triggered or every producer is gone.
    pub async fn dequeue(&mut self, shutdown: &Shutdown) -> Option<T> {
        if shutdown.is_triggered() {
            return None;
        }
        let item = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            item = self.rx.recv() => item,
        }?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(item)
    }

    /// Take the next item if one is ready.
    pub fn try_dequeue(&mut self) -> Option<T> {
        let item = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(item)
    }
}
