//! Push notification bus (C9): a single broadcast channel fanning catalog and job lifecycle
//! events out to every connected subscriber (the WS surface, primarily).
//!
//! Grounded on the teacher's `tokio::sync::broadcast` usage pattern for the shutdown signal
//! in `main.rs`, generalized from a one-shot signal to a sustained stream of typed events.
//! Delivery is at-most-once, in order, per subscriber; a subscriber that falls behind the
//! channel's capacity silently misses the oldest events rather than blocking publishers
//! (`broadcast::Receiver::recv` surfaces this as `Lagged`, which callers treat as "resync from
//! a fresh snapshot" rather than an error).

use crate::models::{CatalogSnapshot, Job};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    CatalogSnapshot {
        at: DateTime<Utc>,
        snapshot: CatalogSnapshot,
    },
    JobCreated {
        at: DateTime<Utc>,
        job: Job,
    },
    JobUpdated {
        at: DateTime<Utc>,
        job: Job,
    },
    JobError {
        at: DateTime<Utc>,
        job_id: String,
        reason: String,
    },
    CaptureComplete {
        at: DateTime<Utc>,
        job_id: String,
    },
    ClipComplete {
        at: DateTime<Utc>,
        job_id: String,
    },
    PreviewComplete {
        at: DateTime<Utc>,
        job_id: String,
    },
    UploadComplete {
        at: DateTime<Utc>,
        job_id: String,
        url: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publishing never blocks and never fails loudly: with zero subscribers connected this
    /// is simply a no-op, matching the push channel's best-effort contract.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Job, JobState, Platform, StreamerRef};

    #[tokio::test]
    async fn subscribers_receive_published_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let job = Job::new("job-1".to_string(), Platform::KickLike, StreamerRef::new("abc"), Utc::now());
        bus.publish(Event::JobCreated { at: Utc::now(), job: job.clone() });
        bus.publish(Event::CaptureComplete { at: Utc::now(), job_id: job.id.clone() });

        match rx.recv().await.unwrap() {
            Event::JobCreated { job: received, .. } => assert_eq!(received.id, "job-1"),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            Event::CaptureComplete { job_id, .. } => assert_eq!(job_id, "job-1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(Event::JobError {
            at: Utc::now(),
            job_id: "job-1".to_string(),
            reason: "stalled".to_string(),
        });
    }

    #[tokio::test]
    async fn lagging_subscriber_observes_lagged_not_an_error() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for i in 0..(CHANNEL_CAPACITY + 10) {
            bus.publish(Event::CaptureComplete {
                at: Utc::now(),
                job_id: format!("job-{i}"),
            });
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            other => panic!("expected Lagged, got {other:?}"),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
