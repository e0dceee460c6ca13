//! Job broker (C8): in-memory job registry, transition-graph enforcement, and the stall
//! watchdog.
//!
//! Grounded on the teacher's `ScreenshotService` for the shape of a shared, `Arc`-wrapped
//! service object guarding mutable state behind a lock and exposing async operations, and on
//! `browser_pool.rs`'s periodic `tokio::select!` health-check task for the watchdog's polling
//! loop. Per-job mutation is serialized by holding the registry lock only for the duration of
//! a single transition, matching the teacher's narrow critical sections in `return_browser`.

use crate::clock::Clock;
use crate::error::StreamwatchError;
use crate::events::{Event, EventBus};
use crate::metrics::Metrics;
use crate::models::{Job, JobState, Platform, StreamerRef};
use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// A job with no forward progress for this long is presumed dead; the watchdog force-errors
/// it so downstream consumers are not left polling a corpse.
pub const STALL_THRESHOLD: ChronoDuration = ChronoDuration::minutes(30);

pub struct JobBroker {
    jobs: RwLock<HashMap<String, Job>>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl JobBroker {
    pub fn new(events: EventBus, clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            events,
            clock,
            metrics,
        }
    }

    pub async fn create(&self, platform: Platform, streamer_ref: StreamerRef) -> Job {
        let id = uuid::Uuid::new_v4().to_string();
        let job = Job::new(id, platform, streamer_ref, self.clock.now());

        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id.clone(), job.clone());
        let in_flight = jobs.values().filter(|j| !j.state.is_terminal()).count();
        drop(jobs);

        self.metrics.record_job_created();
        self.metrics.set_jobs_in_flight(in_flight);
        info!(job_id = %job.id, platform = %job.platform, "job created");
        self.events.publish(Event::JobCreated { at: self.clock.now(), job: job.clone() });
        job
    }

    pub async fn get(&self, id: &str) -> Result<Job, StreamwatchError> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StreamwatchError::JobNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Allowed only once the job has reached a terminal state; the GC's daily sweep and the
    /// clip-deletion route are the only callers, and both already know the job is done.
    pub async fn delete(&self, id: &str) -> Result<(), StreamwatchError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get(id).ok_or_else(|| StreamwatchError::JobNotFound(id.to_string()))?;
        if !job.state.is_terminal() {
            return Err(StreamwatchError::InvalidTransition {
                from: job.state.as_str().to_string(),
                to: "deleted".to_string(),
            });
        }
        jobs.remove(id);
        Ok(())
    }

    /// Applies a validated state transition, running `mutate` against the job while the
    /// registry lock is held so no concurrent transition can interleave with this one.
    pub async fn transition(
        &self,
        id: &str,
        next: JobState,
        mutate: impl FnOnce(&mut Job),
    ) -> Result<Job, StreamwatchError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StreamwatchError::JobNotFound(id.to_string()))?;

        if !job.state.can_transition_to(next) {
            return Err(StreamwatchError::InvalidTransition {
                from: job.state.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }

        job.state = next;
        job.updated_at = self.clock.now();
        mutate(job);
        let snapshot = job.clone();
        let in_flight = jobs.values().filter(|j| !j.state.is_terminal()).count();
        drop(jobs);

        self.metrics.set_jobs_in_flight(in_flight);
        let now = self.clock.now();
        if next == JobState::Error {
            self.metrics.record_job_failed();
            self.events.publish(Event::JobError {
                at: now,
                job_id: snapshot.id.clone(),
                reason: snapshot.error_reason.clone().unwrap_or_default(),
            });
        } else {
            self.events.publish(Event::JobUpdated { at: now, job: snapshot.clone() });
            // The three pipeline milestones additionally get their own named event, per the
            // event bus's message-kind catalog (§4.9), on top of the generic job_updated.
            match next {
                JobState::Captured => self
                    .events
                    .publish(Event::CaptureComplete { at: now, job_id: snapshot.id.clone() }),
                JobState::Completed => self
                    .events
                    .publish(Event::ClipComplete { at: now, job_id: snapshot.id.clone() }),
                JobState::Uploaded => self.events.publish(Event::UploadComplete {
                    at: now,
                    job_id: snapshot.id.clone(),
                    url: snapshot.uploaded_url.clone().unwrap_or_default(),
                }),
                _ => {}
            }
        }

        Ok(snapshot)
    }

    /// Updates a job's progress without moving it along the state graph. `transition` only
    /// accepts moves between distinct states in the graph, so stages that report incremental
    /// progress while *remaining* in the same state (capture, upload) go through this instead.
    /// Progress is clamped to never regress, matching the monotonic-within-a-state invariant.
    pub async fn update_progress(&self, id: &str, progress: u8) -> Result<(), StreamwatchError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or_else(|| StreamwatchError::JobNotFound(id.to_string()))?;
        if job.state.is_terminal() {
            return Ok(());
        }
        job.progress = job.progress.max(progress);
        job.updated_at = self.clock.now();
        let snapshot = job.clone();
        drop(jobs);
        self.events.publish(Event::JobUpdated { at: self.clock.now(), job: snapshot });
        Ok(())
    }

    /// Sets a job's display title. Unlike `transition`, this does not move the job along the
    /// state graph — a title is user-facing metadata, not pipeline state — so it is legal in
    /// any non-terminal state and simply republishes `job_updated`.
    pub async fn set_title(&self, id: &str, title: Option<String>) -> Result<Job, StreamwatchError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or_else(|| StreamwatchError::JobNotFound(id.to_string()))?;
        job.title = title;
        job.updated_at = self.clock.now();
        let snapshot = job.clone();
        drop(jobs);
        self.events.publish(Event::JobUpdated { at: self.clock.now(), job: snapshot.clone() });
        Ok(snapshot)
    }

    /// Records the frame paths produced by `generate_previews`. Per §4.6, preview generation
    /// does not affect job state, so this updates the handle list and fires `preview_complete`
    /// without going through `transition`.
    pub async fn set_preview_frames(&self, id: &str, paths: Vec<std::path::PathBuf>) -> Result<Job, StreamwatchError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or_else(|| StreamwatchError::JobNotFound(id.to_string()))?;
        job.preview_frame_paths = paths;
        job.updated_at = self.clock.now();
        let snapshot = job.clone();
        drop(jobs);
        self.events.publish(Event::PreviewComplete { at: self.clock.now(), job_id: snapshot.id.clone() });
        Ok(snapshot)
    }

    /// Force-errors any non-terminal job whose `updated_at` is older than `STALL_THRESHOLD`.
    /// Returns the ids that were swept, for logging/metrics at the call site.
    pub async fn sweep_stalled(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;
        let mut swept = Vec::new();

        for job in jobs.values_mut() {
            if job.state.is_terminal() {
                continue;
            }
            if now - job.updated_at > STALL_THRESHOLD {
                job.state = JobState::Error;
                job.error_reason = Some("stalled: no progress for 30 minutes".to_string());
                job.updated_at = now;
                swept.push(job.id.clone());
            }
        }
        drop(jobs);

        if !swept.is_empty() {
            self.metrics.record_jobs_stalled(swept.len());
        }
        for id in &swept {
            warn!(job_id = %id, "watchdog force-errored stalled job");
            self.events.publish(Event::JobError {
                at: now,
                job_id: id.clone(),
                reason: "stalled".to_string(),
            });
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use chrono::Utc;

    fn broker_with_test_clock() -> (JobBroker, TestClock) {
        let clock = TestClock::new(Utc::now());
        let broker = JobBroker::new(EventBus::new(), Arc::new(clock.clone()), Arc::new(Metrics::new()));
        (broker, clock)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (broker, _clock) = broker_with_test_clock();
        let job = broker.create(Platform::KickLike, StreamerRef::new("abc")).await;
        let fetched = broker.get(&job.id).await.unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.state, JobState::Initializing);
    }

    #[tokio::test]
    async fn delete_rejects_non_terminal_job() {
        let (broker, _clock) = broker_with_test_clock();
        let job = broker.create(Platform::KickLike, StreamerRef::new("abc")).await;
        let result = broker.delete(&job.id).await;
        assert!(matches!(result, Err(StreamwatchError::InvalidTransition { .. })));
        assert!(broker.get(&job.id).await.is_ok());
    }

    #[tokio::test]
    async fn delete_succeeds_once_terminal() {
        let (broker, _clock) = broker_with_test_clock();
        let job = broker.create(Platform::KickLike, StreamerRef::new("abc")).await;
        broker
            .transition(&job.id, JobState::Error, |j| j.error_reason = Some("x".into()))
            .await
            .unwrap();
        broker.delete(&job.id).await.unwrap();
        assert!(broker.get(&job.id).await.is_err());
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let (broker, _clock) = broker_with_test_clock();
        let job = broker.create(Platform::KickLike, StreamerRef::new("abc")).await;
        let result = broker.transition(&job.id, JobState::Capturing, |_| {}).await;
        assert!(matches!(result, Err(StreamwatchError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn valid_transition_chain_succeeds() {
        let (broker, _clock) = broker_with_test_clock();
        let job = broker.create(Platform::KickLike, StreamerRef::new("abc")).await;
        broker.transition(&job.id, JobState::Resolving, |_| {}).await.unwrap();
        broker.transition(&job.id, JobState::Capturing, |_| {}).await.unwrap();
        let job = broker.transition(&job.id, JobState::Captured, |j| j.progress = 100).await.unwrap();
        assert_eq!(job.state, JobState::Captured);
        assert_eq!(job.progress, 100);
    }

    #[tokio::test]
    async fn update_progress_does_not_require_a_state_move() {
        let (broker, _clock) = broker_with_test_clock();
        let job = broker.create(Platform::KickLike, StreamerRef::new("abc")).await;
        broker.transition(&job.id, JobState::Resolving, |_| {}).await.unwrap();
        broker.transition(&job.id, JobState::Capturing, |_| {}).await.unwrap();

        broker.update_progress(&job.id, 40).await.unwrap();
        let job = broker.get(&job.id).await.unwrap();
        assert_eq!(job.state, JobState::Capturing);
        assert_eq!(job.progress, 40);
    }

    #[tokio::test]
    async fn update_progress_never_regresses() {
        let (broker, _clock) = broker_with_test_clock();
        let job = broker.create(Platform::KickLike, StreamerRef::new("abc")).await;
        broker.transition(&job.id, JobState::Resolving, |_| {}).await.unwrap();
        broker.transition(&job.id, JobState::Capturing, |_| {}).await.unwrap();

        broker.update_progress(&job.id, 60).await.unwrap();
        broker.update_progress(&job.id, 30).await.unwrap();
        let job = broker.get(&job.id).await.unwrap();
        assert_eq!(job.progress, 60);
    }

    #[tokio::test]
    async fn watchdog_sweeps_jobs_stalled_past_threshold() {
        let (broker, clock) = broker_with_test_clock();
        let job = broker.create(Platform::KickLike, StreamerRef::new("abc")).await;
        broker.transition(&job.id, JobState::Resolving, |_| {}).await.unwrap();

        clock.advance(ChronoDuration::minutes(29));
        assert!(broker.sweep_stalled().await.is_empty());

        clock.advance(ChronoDuration::minutes(2));
        let swept = broker.sweep_stalled().await;
        assert_eq!(swept, vec![job.id.clone()]);

        let job = broker.get(&job.id).await.unwrap();
        assert_eq!(job.state, JobState::Error);
    }

    #[tokio::test]
    async fn watchdog_ignores_terminal_jobs() {
        let (broker, clock) = broker_with_test_clock();
        let job = broker.create(Platform::KickLike, StreamerRef::new("abc")).await;
        broker
            .transition(&job.id, JobState::Error, |j| j.error_reason = Some("boom".to_string()))
            .await
            .unwrap();

        clock.advance(ChronoDuration::hours(2));
        assert!(broker.sweep_stalled().await.is_empty());
    }
}
