//! Bounded hand-off between the ingestion server and the resync processor.
//!
//! The queue is the only state shared between RPC handlers and the delivery
//! driver. It is split into a cloneable producer half ([`ResyncQueue`]) and a
//! single consumer half ([`ResyncDrain`]); owning the drain half is what makes
//! the processor the one and only consumer.
//!
//! Producers that find the queue full wait for a bounded time and then fail
//! with [`SubmitError::Full`]. Nothing is dropped silently and the queue never
//! grows past its capacity. Waiting producers are admitted in the order they
//! started waiting, so items come out in the order their `submit` completed.

use std::num::NonZeroUsize;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

use crate::error::SubmitError;
use crate::metrics;
use crate::model::ResyncItem;

/// Creates a queue holding at most `capacity` items.
pub fn resync_queue(capacity: NonZeroUsize) -> (ResyncQueue, ResyncDrain) {
    let (tx, rx) = mpsc::channel(capacity.get());
    (ResyncQueue { tx }, ResyncDrain { rx })
}

/// Producer half of the queue.
#[derive(Debug, Clone)]
pub struct ResyncQueue {
    tx: mpsc::Sender<ResyncItem>,
}

impl ResyncQueue {
    /// Enqueues `item`, waiting up to `wait` for space.
    ///
    /// # Errors
    ///
    /// [`SubmitError::Full`] when no space opened up within `wait`,
    /// [`SubmitError::Closed`] when the consumer is gone.
    pub async fn submit(&self, item: ResyncItem, wait: Duration) -> Result<(), SubmitError> {
        let result = match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(SubmitError::Closed),
            Err(TrySendError::Full(item)) => match self.tx.send_timeout(item, wait).await {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => Err(SubmitError::Full(wait)),
                Err(SendTimeoutError::Closed(_)) => Err(SubmitError::Closed),
            },
        };

        metrics::record_queue_depth(self.len());
        result
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed capacity of the queue.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// True once the consumer has closed the queue or gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of the queue. There is exactly one per queue.
#[derive(Debug)]
pub struct ResyncDrain {
    rx: mpsc::Receiver<ResyncItem>,
}

impl ResyncDrain {
    /// Removes up to `max_items` items in FIFO order.
    ///
    /// When the queue is empty this waits at most `max_wait` for the first
    /// item and returns an empty vector if none arrived. It never waits for
    /// more items once at least one is available.
    ///
    /// Cancel safe: if the future is dropped, no item is lost.
    pub async fn drain(&mut self, max_items: usize, max_wait: Duration) -> Vec<ResyncItem> {
        let mut items = Vec::new();
        if max_items == 0 {
            return items;
        }

        // A timeout just leaves `items` empty.
        let _ = tokio::time::timeout(max_wait, self.rx.recv_many(&mut items, max_items)).await;
        metrics::record_queue_depth(self.rx.len());
        items
    }

    /// Removes up to `max_items` items without waiting.
    pub fn try_drain(&mut self, max_items: usize) -> Vec<ResyncItem> {
        let mut items = Vec::new();
        while items.len() < max_items {
            match self.rx.try_recv() {
                Ok(item) => items.push(item),
                Err(_) => break,
            }
        }
        items
    }

    /// Stops accepting new items. Items already queued can still be drained,
    /// and producers see [`SubmitError::Closed`].
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// True when the queue is closed and fully drained.
    pub fn is_finished(&self) -> bool {
        self.rx.is_closed() && self.rx.is_empty()
    }
}
