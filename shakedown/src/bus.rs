//! In-memory message bus with redelivery.
//!
//! This is the fully in-memory topology: messages are handed straight to a
//! [`MessageConsumer`] and, when the consumer signals failure, redelivered
//! under a [`RetryPolicy`] schedule. It plays the broker's role so the
//! consumer can be exercised without any container.
//!
//! Every attempt is kept as a [`ConsumedRecord`] so tests can ask what was
//! consumed, how often, and with which error.
//!
//! ```text
//! publish(msg) ──► spawn delivery ──► RetryScheduler::run
//!                                       │  attempt i
//!                                       ├──► consumer.consume(msg, i)
//!                                       ├──► consumed.push(record)
//!                                       └──► Ok → done / Err → wait, i+1
//! ```

use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::consumer::{Delivery, MessageConsumer};
use crate::error::ProcessingError;
use crate::message::Message;
use crate::retry::{RetryPolicy, RetryReport, RetryScheduler};
use crate::stability::AttemptOutcome;
use crate::time::TimeProvider;

/// One consumed attempt.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    /// Message identifier.
    pub message_id: String,
    /// Zero-based attempt index.
    pub attempt: u32,
    /// When the attempt started.
    pub started_at: SystemTime,
    /// The consumer's error, if the attempt failed.
    pub error: Option<ProcessingError>,
}

impl ConsumedRecord {
    /// Whether this attempt failed.
    pub fn faulted(&self) -> bool {
        self.error.is_some()
    }
}

/// Terminal result of delivering one message.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// Message identifier.
    pub message_id: String,
    /// Retry bookkeeping for the message.
    pub retry: RetryReport,
    /// Error of the final attempt, when the message was not consumed.
    pub last_error: Option<ProcessingError>,
}

impl DeliveryReport {
    /// Whether the message was eventually consumed.
    pub fn consumed(&self) -> bool {
        self.retry.succeeded()
    }

    /// Number of delivery attempts made.
    pub fn attempts(&self) -> u32 {
        self.retry.attempts
    }
}

struct BusInner<C, T: TimeProvider> {
    consumer: Arc<C>,
    scheduler: RetryScheduler<T>,
    consumed: Mutex<Vec<ConsumedRecord>>,
    tracker: TaskTracker,
}

/// Redelivering in-memory bus.
pub struct InMemoryBus<C, T: TimeProvider> {
    inner: Arc<BusInner<C, T>>,
}

impl<C, T: TimeProvider> Clone for InMemoryBus<C, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: MessageConsumer, T: TimeProvider> InMemoryBus<C, T> {
    /// Create a bus delivering to `consumer` under `policy`.
    pub fn new(consumer: C, policy: RetryPolicy, time: T) -> Self {
        Self::with_shared_consumer(Arc::new(consumer), policy, time)
    }

    /// Create a bus around an already shared consumer.
    pub fn with_shared_consumer(consumer: Arc<C>, policy: RetryPolicy, time: T) -> Self {
        Self {
            inner: Arc::new(BusInner {
                consumer,
                scheduler: RetryScheduler::new(policy, time),
                consumed: Mutex::new(Vec::new()),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// The retry policy applied to every message.
    pub fn policy(&self) -> &RetryPolicy {
        self.inner.scheduler.policy()
    }

    /// Publish a message and deliver it in the background.
    pub fn publish(&self, message: Message) -> JoinHandle<DeliveryReport> {
        let bus = self.clone();
        self.inner
            .tracker
            .spawn(async move { bus.deliver(message).await })
    }

    /// Deliver a message in the current task, redelivering as needed.
    pub async fn deliver(&self, message: Message) -> DeliveryReport {
        let message = Arc::new(message);
        let span = tracing::debug_span!("delivery", message_id = %message.id);

        let retry = self
            .inner
            .scheduler
            .run(|attempt| {
                let inner = self.inner.clone();
                let message = message.clone();
                async move {
                    let started_at = SystemTime::now();
                    let result = inner
                        .consumer
                        .consume(Delivery {
                            message: &*message,
                            attempt,
                        })
                        .await;

                    let outcome = match &result {
                        Ok(()) => AttemptOutcome::Succeeded,
                        Err(err) => AttemptOutcome::Failed(err.to_string()),
                    };
                    inner.consumed.lock().push(ConsumedRecord {
                        message_id: message.id.clone(),
                        attempt,
                        started_at,
                        error: result.err(),
                    });
                    outcome
                }
            })
            .instrument(span)
            .await;

        let last_error = if retry.succeeded() {
            None
        } else {
            self.attempts_for(&message.id)
                .into_iter()
                .last()
                .and_then(|record| record.error)
        };

        if let Some(err) = &last_error {
            tracing::warn!(
                message_id = %message.id,
                attempts = retry.attempts,
                error = %err,
                "message faulted after exhausting retries"
            );
        }

        DeliveryReport {
            message_id: message.id.clone(),
            retry,
            last_error,
        }
    }

    /// Wait until every published message has reached a terminal outcome.
    pub async fn wait_idle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Snapshot of every consumed attempt.
    pub fn consumed(&self) -> Vec<ConsumedRecord> {
        self.inner.consumed.lock().clone()
    }

    /// Whether any consumed attempt satisfies `predicate`.
    pub fn consumed_any<P>(&self, predicate: P) -> bool
    where
        P: Fn(&ConsumedRecord) -> bool,
    {
        self.inner.consumed.lock().iter().any(predicate)
    }

    /// Attempts made for one message, in order.
    pub fn attempts_for(&self, message_id: &str) -> Vec<ConsumedRecord> {
        self.inner
            .consumed
            .lock()
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect()
    }
}
