//! Ordered FIFO queues with shared statistics
//!
//! Partition operation queues and network inboxes are both built from these.
//! A bounded queue blocks its producers when full, which is how backpressure
//! propagates from a slow partition back to the callers pushing into it.

use crate::error::{Error, Result};
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Buffer capacity (ignored when unbounded)
    pub capacity: usize,

    /// Whether producers block once `capacity` items are queued
    pub bounded: bool,

    /// Timeout for blocking sends and receives (None = wait forever)
    pub timeout: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            bounded: true,
            timeout: None,
        }
    }
}

impl QueueConfig {
    /// Create a new queue configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set whether the queue is bounded
    pub fn with_bounded(mut self, bounded: bool) -> Self {
        self.bounded = bounded;
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Counters shared by both halves of a queue
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: CachePadded<AtomicU64>,
    dequeued: CachePadded<AtomicU64>,
    send_errors: CachePadded<AtomicU64>,
}

impl QueueStats {
    /// Number of items accepted by the queue
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Number of items taken off the queue
    pub fn dequeued(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }

    /// Number of failed sends
    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    /// Items currently waiting in the queue
    pub fn depth(&self) -> u64 {
        self.enqueued().saturating_sub(self.dequeued())
    }
}

/// Sending half of a queue
pub struct QueueSender<T> {
    inner: flume::Sender<T>,
    stats: Arc<QueueStats>,
    timeout: Option<Duration>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            stats: Arc::clone(&self.stats),
            timeout: self.timeout,
        }
    }
}

impl<T> QueueSender<T> {
    /// Append an item, blocking while a bounded queue is full
    pub fn send(&self, item: T) -> Result<()> {
        let result = if let Some(timeout) = self.timeout {
            self.inner.send_timeout(item, timeout).map_err(|e| match e {
                flume::SendTimeoutError::Timeout(_) => Error::Timeout,
                flume::SendTimeoutError::Disconnected(_) => {
                    Error::Network("Queue disconnected".to_string())
                }
            })
        } else {
            self.inner.send(item).map_err(Error::from)
        };

        match result {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Try to append an item without blocking
    pub fn try_send(&self, item: T) -> Result<()> {
        match self.inner.try_send(item) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(match e {
                    flume::TrySendError::Full(_) => Error::Network("Queue full".to_string()),
                    flume::TrySendError::Disconnected(_) => {
                        Error::Network("Queue disconnected".to_string())
                    }
                })
            }
        }
    }

    /// Get queue statistics
    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }
}

/// Receiving half of a queue
pub struct QueueReceiver<T> {
    inner: flume::Receiver<T>,
    stats: Arc<QueueStats>,
}

impl<T> QueueReceiver<T> {
    /// Take the next item, blocking until one arrives or every sender is gone
    pub fn recv(&self) -> Result<T> {
        let item = self.inner.recv()?;
        self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        Ok(item)
    }

    /// Take the next item, waiting at most `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T> {
        let item = self.inner.recv_timeout(timeout)?;
        self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        Ok(item)
    }

    /// Iterate over items until every sender is dropped
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.recv().ok())
    }

    /// Get queue statistics
    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }
}

/// Create a queue with the given configuration
pub fn with_config<T>(config: &QueueConfig) -> (QueueSender<T>, QueueReceiver<T>) {
    let stats = Arc::new(QueueStats::default());
    let (tx, rx) = if config.bounded {
        flume::bounded(config.capacity)
    } else {
        flume::unbounded()
    };

    (
        QueueSender {
            inner: tx,
            stats: Arc::clone(&stats),
            timeout: config.timeout,
        },
        QueueReceiver { inner: rx, stats },
    )
}

/// Create a bounded queue
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    with_config(&QueueConfig::new().with_capacity(capacity))
}

/// Create an unbounded queue
pub fn unbounded<T>() -> (QueueSender<T>, QueueReceiver<T>) {
    with_config(&QueueConfig::new().with_bounded(false))
}
