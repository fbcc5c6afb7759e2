// Bounded ingestion queue (drop-oldest) and non-blocking sink channels.
//
// The ingress side favors current data over stale data: when the bounded
// queue is full the oldest element is evicted, not the incoming one. Sink
// channels do the opposite and drop the incoming payload for that sink only,
// so one slow consumer can never stall the synchronizer.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const DROP_LOG_EVERY: u64 = 256;

/// FIFO producer queue with drop-oldest overflow and timed blocking dequeue.
///
/// Capacity ≤ 0 means unbounded (no drops ever occur). `push` never blocks
/// the calling producer thread; drops are counted and summarized in the log.
pub struct IngressQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl<T> IngressQueue<T> {
    pub fn new(capacity: i64) -> Self {
        let (tx, rx) = if capacity > 0 {
            bounded(capacity as usize)
        } else {
            unbounded()
        };
        Self {
            tx,
            rx,
            capacity: capacity.max(0) as usize,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. On a full bounded queue the oldest queued
    /// item is discarded and counted, then the new item is enqueued. If a
    /// concurrent producer refills the freed slot the new item is dropped
    /// silently, matching the non-blocking contract.
    pub fn push(&self, item: T) {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.pushed.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(item)) => {
                if self.rx.try_recv().is_ok() {
                    let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if n == 1 || n % DROP_LOG_EVERY == 0 {
                        warn!(dropped = n, capacity = self.capacity, "ingress queue full, dropping oldest");
                    }
                }
                if self.tx.try_send(item).is_ok() {
                    self.pushed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Best-effort enqueue used to wake the consumer on shutdown. Never
    /// evicts queued data; the consumer's stop flag covers the full case.
    pub fn wake(&self, item: T) {
        let _ = self.tx.try_send(item);
    }

    /// Blocking dequeue with timeout; the consumer's only suspension point.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// 0 means unbounded.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Discard everything currently queued. Used between sessions so a new
    /// consumer never sees stale items from the previous one.
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

/// Writer half of a sink queue. Cloned into the synchronizer consumer; the
/// reader half is a plain `crossbeam_channel::Receiver` owned by the sink.
pub struct SinkSender<T> {
    tx: Sender<T>,
    label: String,
    dropped: Arc<AtomicU64>,
}

impl<T> SinkSender<T> {
    /// Non-blocking put. A full or closed sink drops the payload for this
    /// sink only and counts it; the caller keeps running either way.
    pub fn send(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(_) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n == 1 || n % DROP_LOG_EVERY == 0 {
                    warn!(sink = %self.label, dropped = n, "sink queue full, payload dropped");
                }
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Identity check used to deduplicate sink registrations.
    pub fn same_queue(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

impl<T> Clone for SinkSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            label: self.label.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

/// Build a sink queue pair. Capacity ≤ 0 means unbounded.
pub fn sink_channel<T>(capacity: i64, label: impl Into<String>) -> (SinkSender<T>, Receiver<T>) {
    let (tx, rx) = if capacity > 0 {
        bounded(capacity as usize)
    } else {
        unbounded()
    };
    (
        SinkSender {
            tx,
            label: label.into(),
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}
