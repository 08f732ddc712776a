//! At-least-once job delivery.
//!
//! A received message stays invisible for the visibility timeout. If it is not
//! acked in time it becomes visible again and is redelivered with a higher
//! `delivery_count`. Consumers must tolerate duplicates, and consumers that
//! run longer than the timeout renew it with `extend_visibility`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

use forgebatch_core::BatchJobId;

/// A received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: BatchJobId,
    /// Handle used to ack this particular delivery.
    pub receipt: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// The receipt expired (message redelivered) or was already acked.
    #[error("unknown or expired receipt: {0}")]
    UnknownReceipt(String),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Make `job_id` available for delivery after `delay`.
    async fn enqueue(&self, job_id: BatchJobId, delay: Duration) -> Result<(), QueueError>;

    /// Wait up to `wait` for a message.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Keep an in-flight delivery invisible for another `extension`,
    /// counted from now. Fails with `UnknownReceipt` once it was redelivered
    /// or acked.
    async fn extend_visibility(&self, delivery: &Delivery, extension: Duration) -> Result<(), QueueError>;

    /// How long a received message stays invisible without an extension.
    fn visibility_timeout(&self) -> Duration;
}

#[derive(Debug, Clone, Copy)]
struct Message {
    job_id: BatchJobId,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    delayed: Vec<(Instant, Message)>,
    in_flight: HashMap<String, (Instant, Message)>,
}

impl QueueState {
    /// Move due delayed messages and expired in-flight messages to `ready`.
    fn promote(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, msg) = self.delayed.swap_remove(i);
                self.ready.push_back(msg);
            } else {
                i += 1;
            }
        }

        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((_, msg)) = self.in_flight.remove(&receipt) {
                debug!(job_id = %msg.job_id, "visibility timeout expired; redelivering");
                self.ready.push_back(msg);
            }
        }
    }

    /// Earliest instant at which something may become ready.
    fn next_wakeup(&self) -> Option<Instant> {
        self.delayed
            .iter()
            .map(|(at, _)| *at)
            .chain(self.in_flight.values().map(|(at, _)| *at))
            .min()
    }
}

/// In-memory queue for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InMemoryJobQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// Messages that are ready or delayed (not in flight).
    pub fn pending_len(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.ready.len() + s.delayed.len())
            .unwrap_or(0)
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Unavailable("lock poisoned".to_string()))
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    #[instrument(skip_all, fields(job_id = %job_id, delay_ms = delay.as_millis() as u64))]
    async fn enqueue(&self, job_id: BatchJobId, delay: Duration) -> Result<(), QueueError> {
        let msg = Message {
            job_id,
            delivery_count: 0,
        };
        {
            let mut state = self.lock()?;
            if delay.is_zero() {
                state.ready.push_back(msg);
            } else {
                state.delayed.push((Instant::now() + delay, msg));
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            let wake_at = {
                let mut state = self.lock()?;
                let now = Instant::now();
                state.promote(now);

                if let Some(mut msg) = state.ready.pop_front() {
                    msg.delivery_count += 1;
                    let receipt = Uuid::now_v7().to_string();
                    state
                        .in_flight
                        .insert(receipt.clone(), (now + self.visibility_timeout, msg));
                    return Ok(Some(Delivery {
                        job_id: msg.job_id,
                        receipt,
                        delivery_count: msg.delivery_count,
                    }));
                }

                if now >= deadline {
                    return Ok(None);
                }
                state.next_wakeup().map_or(deadline, |at| at.min(deadline))
            };

            // Woken early by enqueue, or when the next message comes due.
            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        match state.in_flight.remove(&delivery.receipt) {
            Some(_) => Ok(()),
            None => Err(QueueError::UnknownReceipt(delivery.receipt.clone())),
        }
    }

    async fn extend_visibility(&self, delivery: &Delivery, extension: Duration) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        // An expired lease may already be on its way back to `ready`.
        state.promote(now);
        match state.in_flight.get_mut(&delivery.receipt) {
            Some((deadline, _)) => {
                *deadline = now + extension;
                Ok(())
            }
            None => Err(QueueError::UnknownReceipt(delivery.receipt.clone())),
        }
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }
}
