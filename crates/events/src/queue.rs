//! Bounded send queue between the dispatcher and the worker pool.
//!
//! Capacity is reserved before anything is persisted, so a full queue turns
//! into a retryable `QueueFull` for the producer instead of an attempt that
//! was stored but never handed to a worker.

use std::time::Duration;

use pitchey_core::channels::Channel;
use pitchey_core::types::DbId;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

/// Smallest usable capacity: one notification reserves a slot per instant
/// channel at once.
pub const MIN_CAPACITY: usize = Channel::ALL.len();

/// Deliver one stored attempt. Workers reload the attempt, so a job is
/// only an id and enqueueing it twice is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendJob {
    pub attempt_id: DbId,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Send queue is full")]
    Full,

    #[error("Send queue is closed")]
    Closed,
}

/// Producer side of the send queue.
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::Sender<SendJob>,
    timeout: Duration,
}

/// Capacity reserved for the jobs of one notification.
pub struct Reservation<'a> {
    permits: Vec<mpsc::Permit<'a, SendJob>>,
}

impl Reservation<'_> {
    /// Use one reserved slot. Returns `false` if the reservation is spent.
    pub fn send(&mut self, job: SendJob) -> bool {
        match self.permits.pop() {
            Some(permit) => {
                permit.send(job);
                true
            }
            None => false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.permits.len()
    }
}

impl SendQueue {
    /// Create a queue of `capacity` jobs whose producers wait at most
    /// `timeout` for room. Capacities below [`MIN_CAPACITY`] are raised to it.
    pub fn bounded(capacity: usize, timeout: Duration) -> (Self, mpsc::Receiver<SendJob>) {
        if capacity < MIN_CAPACITY {
            tracing::warn!(
                requested = capacity,
                capacity = MIN_CAPACITY,
                "Send queue capacity below one slot per channel, raising it"
            );
        }
        let (tx, rx) = mpsc::channel(capacity.max(MIN_CAPACITY));
        (Self { tx, timeout }, rx)
    }

    /// Reserve `n` slots at once, waiting up to the configured timeout.
    pub async fn reserve(&self, n: usize) -> Result<Reservation<'_>, QueueError> {
        if n == 0 {
            return Ok(Reservation {
                permits: Vec::new(),
            });
        }
        // `reserve_many` fails outright past the channel's capacity, which
        // would read as a closed queue.
        if n > self.tx.max_capacity() {
            return Err(QueueError::Full);
        }
        match tokio::time::timeout(self.timeout, self.tx.reserve_many(n)).await {
            Ok(Ok(permits)) => Ok(Reservation {
                permits: permits.collect(),
            }),
            Ok(Err(_)) => Err(QueueError::Closed),
            Err(_) => Err(QueueError::Full),
        }
    }

    /// Enqueue a single job, waiting up to the configured timeout.
    pub async fn enqueue(&self, job: SendJob) -> Result<(), QueueError> {
        self.tx
            .send_timeout(job, self.timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => QueueError::Full,
                SendTimeoutError::Closed(_) => QueueError::Closed,
            })
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}
