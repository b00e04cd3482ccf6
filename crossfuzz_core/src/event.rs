//! In-process publish/subscribe for live job telemetry.
//!
//! Runners push events; dashboards and log viewers subscribe per job. Publishing never waits:
//! every subscriber owns a bounded queue and events that do not fit are dropped and counted
//! on that subscriber instead of slowing the runner down.

use crate::job::{JobId, JobState};
use crate::metrics::JobMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Telemetry pushed to subscribers of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    MetricsSnapshot(JobMetrics),
    LogLine {
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },
    JobStateChanged {
        old: JobState,
        new: JobState,
    },
}

impl Event {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Event::LogLine {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

/// Receiving end of a job's event stream.
///
/// Only events published after `subscribe` returned are delivered. The stream ends
/// (`recv` yields `None`) once the job's topic is closed and the queue is drained.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    job_id: JobId,
    rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Returns the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Events that were discarded because this subscriber's queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Fan-out of job events to any number of subscribers.
pub struct EventBus {
    topics: RwLock<HashMap<JobId, Vec<SubscriberSlot>>>,
    capacity: usize,
    next_subscriber_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            next_subscriber_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Opens a new event stream for one job.
    ///
    /// # Arguments
    /// * `job_id`: The job whose topic to join. The topic is created if it does not exist yet.
    ///
    /// # Returns
    /// A [`Subscription`] with its own bounded queue of `capacity` events. Events published
    /// while the queue is full are dropped for this subscriber and counted.
    pub fn subscribe(&self, job_id: &JobId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(*job_id)
            .or_default()
            .push(SubscriberSlot {
                id,
                tx,
                dropped: Arc::clone(&dropped),
            });
        debug!(job_id = %job_id, subscriber = id, "Subscriber attached");
        Subscription {
            id,
            job_id: *job_id,
            rx,
            dropped,
        }
    }

    /// Stops delivery to `subscription` and releases its queue.
    ///
    /// Events still queued for it are discarded along with the receiver.
    pub fn unsubscribe(&self, subscription: Subscription) {
        self.remove_subscriber(&subscription.job_id, subscription.id);
        drop(subscription);
    }

    /// Publishes `event` to every current subscriber of `job_id` without waiting.
    pub fn publish(&self, job_id: &JobId, event: Event) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut saw_closed = false;
        {
            let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
            let Some(slots) = topics.get(job_id) else {
                return;
            };
            for slot in slots {
                match slot.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        let dropped = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        if dropped.is_power_of_two() {
                            warn!(
                                job_id = %job_id,
                                subscriber = slot.id,
                                dropped,
                                "Subscriber queue full, dropping events"
                            );
                        }
                    }
                    Err(TrySendError::Closed(_)) => saw_closed = true,
                }
            }
        }
        if saw_closed {
            self.prune_closed(job_id);
        }
    }

    /// Ends every subscription of `job_id`; subscribers drain what is queued, then see `None`.
    pub fn close(&self, job_id: &JobId) {
        let removed = self
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
        if let Some(slots) = removed {
            debug!(job_id = %job_id, subscribers = slots.len(), "Closed event topic");
        }
    }

    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .map_or(0, Vec::len)
    }

    /// Events published since the bus was created, whether or not anyone received them.
    pub fn published_total(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Events dropped across all subscribers.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn remove_subscriber(&self, job_id: &JobId, id: u64) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slots) = topics.get_mut(job_id) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                topics.remove(job_id);
            }
        }
        debug!(job_id = %job_id, subscriber = id, "Subscriber detached");
    }

    fn prune_closed(&self, job_id: &JobId) {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slots) = topics.get_mut(job_id) {
            slots.retain(|slot| !slot.tx.is_closed());
            if slots.is_empty() {
                topics.remove(job_id);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics = self
            .topics
            .read()
            .map(|t| t.len())
            .unwrap_or_default();
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("topics", &topics)
            .field("published", &self.published_total())
            .field("dropped", &self.dropped_total())
            .finish()
    }
}
