//! Uploader (C7): streams a completed clip file to the external upload host as multipart form
//! data and records the host-assigned URL on the job.
//!
//! Grounded on `adapters/oauth.rs`'s reqwest client-construction pattern (timeout-bounded
//! `Client::builder()`) and on `capture.rs`'s progress-reporting idiom of pushing an updated
//! `progress` field from inside a streaming loop via the job broker's `update_progress`.

use crate::error::StreamwatchError;
use crate::jobs::JobBroker;
use crate::metrics::Metrics;
use crate::models::JobState;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct UploadResponse {
    success: bool,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

pub struct Uploader {
    jobs: Arc<JobBroker>,
    client: Client,
    endpoint: String,
    metrics: Arc<Metrics>,
}

impl Uploader {
    pub fn new(jobs: Arc<JobBroker>, endpoint: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build().unwrap_or_default();
        Self { jobs, client, endpoint: endpoint.into(), metrics }
    }

    /// Requires the job to be `completed`. Transitions through `uploading` and, on a
    /// successful host response, to `uploaded`. Any other outcome lands on `error` with the
    /// host's stated reason when one was given. No automatic retry: a failed upload is a
    /// client-triggered decision to retry, not this method's concern.
    pub async fn upload(&self, job_id: &str) -> Result<String, StreamwatchError> {
        let job = self.jobs.get(job_id).await?;
        let clip_path = job
            .clip_path
            .clone()
            .ok_or_else(|| StreamwatchError::UploadError("job has no clip to upload".to_string()))?;

        self.jobs.transition(job_id, JobState::Uploading, |j| j.progress = 0).await?;
        let started = Instant::now();

        let result = self.stream_upload(job_id, &clip_path).await;

        match result {
            Ok(url) => {
                self.jobs
                    .transition(job_id, JobState::Uploaded, |j| {
                        j.uploaded_url = Some(url.clone());
                        j.progress = 100;
                    })
                    .await?;
                self.metrics.record_upload(started.elapsed(), true);
                info!(job_id, "upload complete");
                Ok(url)
            }
            Err(e) => {
                self.jobs
                    .transition(job_id, JobState::Error, |j| j.error_reason = Some(e.to_string()))
                    .await?;
                self.metrics.record_upload(started.elapsed(), false);
                Err(e)
            }
        }
    }

    async fn stream_upload(&self, job_id: &str, clip_path: &std::path::Path) -> Result<String, StreamwatchError> {
        let file = tokio::fs::File::open(clip_path).await?;
        let total_len = file.metadata().await?.len();

        let jobs = self.jobs.clone();
        let job_id_owned = job_id.to_string();
        let mut sent: u64 = 0;

        let stream = tokio_util::io::ReaderStream::new(file).inspect(move |chunk| {
            if let Ok(chunk) = chunk {
                sent += chunk.len() as u64;
                let pct = if total_len == 0 { 100 } else { ((sent * 100) / total_len).min(100) as u8 };
                let jobs = jobs.clone();
                let job_id = job_id_owned.clone();
                tokio::spawn(async move {
                    let _ = jobs.update_progress(&job_id, pct).await;
                });
            }
        });

        let file_name = clip_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("clip.mp4")
            .to_string();
        let part = reqwest::multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), total_len)
            .file_name(file_name)
            .mime_str("video/mp4")
            .map_err(|e| StreamwatchError::UploadError(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("clip", part);

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| StreamwatchError::UploadError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StreamwatchError::UploadError(format!("host returned {}", response.status())));
        }

        let parsed: UploadResponse = response
            .json()
            .await
            .map_err(|e| StreamwatchError::UploadError(format!("unparseable response: {e}")))?;

        if parsed.success {
            parsed
                .url
                .ok_or_else(|| StreamwatchError::UploadError("host reported success with no url".to_string()))
        } else {
            Err(StreamwatchError::UploadError(
                parsed.reason.unwrap_or_else(|| "host reported failure".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, TestClock};
    use crate::events::EventBus;
    use crate::models::{Platform, StreamerRef};

    fn uploader() -> Uploader {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new(chrono::Utc::now()));
        let jobs = Arc::new(JobBroker::new(EventBus::new(), clock, Arc::new(Metrics::new())));
        Uploader::new(jobs, "https://example.invalid/upload", Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn upload_without_clip_path_fails() {
        let uploader = uploader();
        let job = uploader.jobs.create(Platform::KickLike, StreamerRef::new("abc")).await;
        let result = uploader.upload(&job.id).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn upload_requires_completed_state() {
        let uploader = uploader();
        let job = uploader.jobs.create(Platform::KickLike, StreamerRef::new("abc")).await;
        // Still `initializing`, not `completed`: the transition to `uploading` must be rejected.
        let result = uploader.jobs.transition(&job.id, JobState::Uploading, |_| {}).await;
        assert!(matches!(result, Err(StreamwatchError::InvalidTransition { .. })));
    }
}
