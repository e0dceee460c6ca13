//! Job runner (the worker half of the component design): spawns one tracked task per
//! client-requested operation and gives it cooperative cancellation.
//!
//! Grounded on the teacher's `worker.rs` task-per-unit-of-work shape and on
//! `ws_connection.rs`'s `DashMap<id, CancellationToken>` registry for tracking cancellable work
//! by id; replaces that file's per-connection tracking with per-job tracking, since a job id is
//! this service's natural unit of cancellable work rather than a websocket connection.

use crate::capture::CaptureWorker;
use crate::clipper::ClipExtractor;
use crate::error::StreamwatchError;
use crate::jobs::JobBroker;
use crate::models::JobState;
use crate::uploader::Uploader;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Tracks one cancellation token per in-flight job id. Cancellation is idempotent: cancelling a
/// job id that isn't registered, or that already fired, is simply a no-op.
#[derive(Default)]
struct CancellableRegistry {
    tokens: DashMap<String, CancellationToken>,
}

impl CancellableRegistry {
    fn register(&self, job_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(job_id.to_string(), token.clone());
        token
    }

    fn deregister(&self, job_id: &str) {
        self.tokens.remove(job_id);
    }

    fn cancel(&self, job_id: &str) -> bool {
        match self.tokens.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) {
        for entry in self.tokens.iter() {
            entry.value().cancel();
        }
    }

    fn len(&self) -> usize {
        self.tokens.len()
    }
}

pub struct JobRunner {
    jobs: Arc<JobBroker>,
    capture: Arc<CaptureWorker>,
    clipper: Arc<ClipExtractor>,
    uploader: Arc<Uploader>,
    cancellations: CancellableRegistry,
}

impl JobRunner {
    pub fn new(
        jobs: Arc<JobBroker>,
        capture: Arc<CaptureWorker>,
        clipper: Arc<ClipExtractor>,
        uploader: Arc<Uploader>,
    ) -> Self {
        Self { jobs, capture, clipper, uploader, cancellations: CancellableRegistry::default() }
    }

    /// Cancels the in-flight stage for `job_id`, if one is tracked.
    pub fn cancel(&self, job_id: &str) -> bool {
        self.cancellations.cancel(job_id)
    }

    /// Cancels every tracked job, used by graceful shutdown.
    pub fn cancel_all(&self) {
        self.cancellations.cancel_all();
    }

    pub fn in_flight_count(&self) -> usize {
        self.cancellations.len()
    }

    /// Runs `stage` under a fresh cancellation token registered for `job_id`. On cancellation,
    /// forces the job to `error("cancelled")` and returns `Cancelled` rather than the stage's
    /// own result.
    async fn run_tracked<F>(&self, job_id: &str, stage: F) -> Result<(), StreamwatchError>
    where
        F: std::future::Future<Output = Result<(), StreamwatchError>>,
    {
        let token = self.cancellations.register(job_id);

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                warn!(job_id, "job cancelled");
                let _ = self
                    .jobs
                    .transition(job_id, JobState::Error, |j| j.error_reason = Some("cancelled".to_string()))
                    .await;
                Err(StreamwatchError::Cancelled)
            }
            result = stage => result,
        };

        self.cancellations.deregister(job_id);
        result
    }

    pub fn spawn_capture(self: &Arc<Self>, job_id: String, duration: Duration) {
        let runner = self.clone();
        tokio::spawn(async move {
            let capture = runner.capture.clone();
            let id = job_id.clone();
            let _ = runner.run_tracked(&job_id, async move { capture.run(&id, duration).await }).await;
        });
    }

    pub async fn extract_clip(&self, job_id: &str, start_s: f64, duration_s: f64) -> Result<PathBuf, StreamwatchError> {
        let clipper = self.clipper.clone();
        let id = job_id.to_string();
        let result_slot: Arc<std::sync::Mutex<Option<Result<PathBuf, StreamwatchError>>>> =
            Arc::new(std::sync::Mutex::new(None));
        let slot = result_slot.clone();
        let _ = self
            .run_tracked(job_id, async move {
                let outcome = clipper.extract_clip(&id, start_s, duration_s).await;
                let failed = outcome.is_err();
                *slot.lock().unwrap() = Some(outcome);
                if failed { Err(StreamwatchError::TranscodeError("clip extraction failed".to_string())) } else { Ok(()) }
            })
            .await;

        result_slot.lock().unwrap().take().unwrap_or(Err(StreamwatchError::Cancelled))
    }

    pub async fn generate_previews(&self, job_id: &str, num_frames: u32) -> Result<Vec<PathBuf>, StreamwatchError> {
        self.clipper.generate_previews(job_id, num_frames).await
    }

    pub async fn upload(&self, job_id: &str) -> Result<String, StreamwatchError> {
        let uploader = self.uploader.clone();
        let id = job_id.to_string();
        let result_slot: Arc<std::sync::Mutex<Option<Result<String, StreamwatchError>>>> =
            Arc::new(std::sync::Mutex::new(None));
        let slot = result_slot.clone();
        let _ = self
            .run_tracked(job_id, async move {
                let outcome = uploader.upload(&id).await;
                let failed = outcome.is_err();
                *slot.lock().unwrap() = Some(outcome);
                if failed { Err(StreamwatchError::UploadError("upload failed".to_string())) } else { Ok(()) }
            })
            .await;

        result_slot.lock().unwrap().take().unwrap_or(Err(StreamwatchError::Cancelled))
    }

    /// Cancels every in-flight job and waits up to `grace` for them to drain, per the
    /// shutdown contract in §5.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancellations.cancel_all();
        let deadline = tokio::time::Instant::now() + grace;
        while self.cancellations.len() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.cancellations.len() > 0 {
            warn!(remaining = self.cancellations.len(), "shutdown grace period elapsed with jobs still in flight");
        } else {
            info!("all in-flight jobs drained before shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_then_cancelling_a_job_succeeds_exactly_once_meaningfully() {
        let registry = CancellableRegistry::default();
        let token = registry.register("job-1");
        assert_eq!(registry.len(), 1);

        assert!(registry.cancel("job-1"));
        assert!(token.is_cancelled());

        // Cancelling again is a harmless no-op: the token is already cancelled.
        assert!(registry.cancel("job-1"));
    }

    #[test]
    fn cancelling_an_unregistered_job_is_a_no_op() {
        let registry = CancellableRegistry::default();
        assert!(!registry.cancel("no-such-job"));
    }

    #[test]
    fn deregister_removes_tracking() {
        let registry = CancellableRegistry::default();
        registry.register("job-1");
        registry.deregister("job-1");
        assert_eq!(registry.len(), 0);
        assert!(!registry.cancel("job-1"));
    }

    #[test]
    fn cancel_all_cancels_every_tracked_token() {
        let registry = CancellableRegistry::default();
        let a = registry.register("a");
        let b = registry.register("b");
        registry.cancel_all();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
