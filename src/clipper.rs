//! Clip extractor (C6): cuts a sub-range out of a captured buffer into a web-streamable final
//! file, with a best-effort thumbnail, and separately samples preview frames over the whole
//! buffer.
//!
//! Grounded on the teacher's `utils.rs::sanitize_filename`/`format_duration` for output naming
//! and on `capture.rs`'s transcoder-invocation pattern, reused here for the re-encode and
//! frame-extraction subprocess calls.

use crate::error::StreamwatchError;
use crate::jobs::JobBroker;
use crate::metrics::Metrics;
use crate::models::JobState;
use crate::utils::sanitize_filename;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::info;

pub struct ClipExtractor {
    jobs: std::sync::Arc<JobBroker>,
    transcoder_path: String,
    clips_dir: PathBuf,
    thumbnails_dir: PathBuf,
    temp_dir: PathBuf,
    max_clip_duration_secs: u64,
    metrics: std::sync::Arc<Metrics>,
}

impl ClipExtractor {
    pub fn new(
        jobs: std::sync::Arc<JobBroker>,
        transcoder_path: impl Into<String>,
        clips_dir: PathBuf,
        thumbnails_dir: PathBuf,
        temp_dir: PathBuf,
        max_clip_duration_secs: u64,
        metrics: std::sync::Arc<Metrics>,
    ) -> Self {
        Self {
            jobs,
            transcoder_path: transcoder_path.into(),
            clips_dir,
            thumbnails_dir,
            temp_dir,
            max_clip_duration_secs,
            metrics,
        }
    }

    fn validate_range(&self, start_s: f64, duration_s: f64) -> Result<(), StreamwatchError> {
        if start_s < 0.0 {
            return Err(StreamwatchError::InvalidRange(format!("start_s {start_s} is negative")));
        }
        if duration_s <= 0.0 {
            return Err(StreamwatchError::InvalidRange(format!("duration_s {duration_s} is not positive")));
        }
        if start_s + duration_s > self.max_clip_duration_secs as f64 {
            return Err(StreamwatchError::InvalidRange(format!(
                "start_s + duration_s ({}) exceeds max_clip_duration ({})",
                start_s + duration_s,
                self.max_clip_duration_secs
            )));
        }
        Ok(())
    }

    pub async fn extract_clip(&self, job_id: &str, start_s: f64, duration_s: f64) -> Result<PathBuf, StreamwatchError> {
        self.validate_range(start_s, duration_s)?;
        let started = Instant::now();

        let job = self.jobs.get(job_id).await?;
        let buffer_path = job
            .buffer_path
            .clone()
            .ok_or_else(|| StreamwatchError::InvalidRange("job has no captured buffer".to_string()))?;

        self.jobs.transition(job_id, JobState::Processing, |_| {}).await?;

        tokio::fs::create_dir_all(&self.clips_dir).await?;
        let clip_filename = sanitize_filename(&format!("{job_id}.mp4"));
        let clip_path = self.clips_dir.join(clip_filename);

        let result = self
            .reencode(&buffer_path, &clip_path, start_s, duration_s)
            .await;

        if let Err(e) = result {
            self.jobs
                .transition(job_id, JobState::Error, |j| j.error_reason = Some(e.to_string()))
                .await?;
            return Err(e);
        }

        let thumbnail_path = self
            .generate_thumbnail(job_id, &buffer_path, start_s + duration_s / 2.0)
            .await
            .ok();

        self.jobs
            .transition(job_id, JobState::Completed, |j| {
                j.clip_path = Some(clip_path.clone());
                j.thumbnail_path = thumbnail_path;
                j.progress = 100;
            })
            .await?;
        self.metrics.record_clip_duration(started.elapsed());

        info!(job_id, "clip extraction complete");
        Ok(clip_path)
    }

    async fn reencode(&self, buffer_path: &Path, clip_path: &Path, start_s: f64, duration_s: f64) -> Result<(), StreamwatchError> {
        let status = Command::new(&self.transcoder_path)
            .arg("-ss")
            .arg(start_s.to_string())
            .arg("-i")
            .arg(buffer_path)
            .arg("-t")
            .arg(duration_s.to_string())
            .arg("-c:v")
            .arg("libx264")
            .arg("-preset")
            .arg("medium")
            .arg("-crf")
            .arg("22")
            .arg("-c:a")
            .arg("aac")
            .arg("-b:a")
            .arg("128k")
            .arg("-movflags")
            .arg("+faststart")
            .arg(clip_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| StreamwatchError::TranscodeError(format!("spawn failed: {e}")))?;

        if status.success() {
            Ok(())
        } else {
            Err(StreamwatchError::TranscodeError(format!("exit code {:?}", status.code())))
        }
    }

    /// Best-effort: thumbnail failure never fails the clip.
    async fn generate_thumbnail(&self, job_id: &str, buffer_path: &Path, at_s: f64) -> Result<PathBuf, StreamwatchError> {
        tokio::fs::create_dir_all(&self.thumbnails_dir).await?;
        let thumbnail_path = self.thumbnails_dir.join(sanitize_filename(&format!("{job_id}.jpg")));

        let status = Command::new(&self.transcoder_path)
            .arg("-ss")
            .arg(at_s.to_string())
            .arg("-i")
            .arg(buffer_path)
            .arg("-frames:v")
            .arg("1")
            .arg(&thumbnail_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| StreamwatchError::TranscodeError(format!("spawn failed: {e}")))?;

        if status.success() {
            Ok(thumbnail_path)
        } else {
            Err(StreamwatchError::TranscodeError(format!("thumbnail exit code {:?}", status.code())))
        }
    }

    /// Samples `num_frames` evenly over the whole buffer (not the sub-range) at
    /// `1 / floor(max_clip_duration / num_frames)` frames per second, into a per-job preview
    /// directory. Does not touch job state.
    pub async fn generate_previews(&self, job_id: &str, num_frames: u32) -> Result<Vec<PathBuf>, StreamwatchError> {
        if num_frames == 0 {
            return Err(StreamwatchError::InvalidRange("num_frames must be positive".to_string()));
        }
        let job = self.jobs.get(job_id).await?;
        let buffer_path = job
            .buffer_path
            .clone()
            .ok_or_else(|| StreamwatchError::InvalidRange("job has no captured buffer".to_string()))?;

        let interval_secs = (self.max_clip_duration_secs / num_frames as u64).max(1);
        let fps = 1.0 / interval_secs as f64;

        let preview_dir = self.temp_dir.join(format!("preview_{job_id}"));
        tokio::fs::create_dir_all(&preview_dir).await?;
        let pattern = preview_dir.join("frame_%03d.jpg");

        let status = Command::new(&self.transcoder_path)
            .arg("-i")
            .arg(&buffer_path)
            .arg("-vf")
            .arg(format!("fps={fps}"))
            .arg("-frames:v")
            .arg(num_frames.to_string())
            .arg(&pattern)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| StreamwatchError::TranscodeError(format!("spawn failed: {e}")))?;

        if !status.success() {
            return Err(StreamwatchError::TranscodeError(format!("preview exit code {:?}", status.code())));
        }

        let mut entries = tokio::fs::read_dir(&preview_dir).await?;
        let mut frames = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            frames.push(entry.path());
        }
        frames.sort();
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, TestClock};
    use crate::events::EventBus;
    use crate::models::{Platform, StreamerRef};
    use std::sync::Arc;

    fn extractor() -> ClipExtractor {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new(chrono::Utc::now()));
        let jobs = Arc::new(JobBroker::new(EventBus::new(), clock, Arc::new(Metrics::new())));
        ClipExtractor::new(
            jobs,
            "ffmpeg".to_string(),
            PathBuf::from("/tmp/streamwatch-test-clips"),
            PathBuf::from("/tmp/streamwatch-test-thumbnails"),
            PathBuf::from("/tmp/streamwatch-test-temp"),
            240,
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn rejects_negative_start() {
        let extractor = extractor();
        assert!(matches!(
            extractor.validate_range(-1.0, 10.0),
            Err(StreamwatchError::InvalidRange(_))
        ));
    }

    #[test]
    fn rejects_zero_duration() {
        let extractor = extractor();
        assert!(matches!(
            extractor.validate_range(0.0, 0.0),
            Err(StreamwatchError::InvalidRange(_))
        ));
    }

    #[test]
    fn rejects_range_exceeding_max_clip_duration() {
        let extractor = extractor();
        assert!(matches!(
            extractor.validate_range(200.0, 100.0),
            Err(StreamwatchError::InvalidRange(_))
        ));
    }

    #[test]
    fn accepts_range_within_bounds() {
        let extractor = extractor();
        assert!(extractor.validate_range(10.0, 30.0).is_ok());
    }

    #[tokio::test]
    async fn extract_clip_without_buffer_path_fails() {
        let extractor = extractor();
        let job = extractor.jobs.create(Platform::KickLike, StreamerRef::new("abc")).await;
        let result = extractor.extract_clip(&job.id, 0.0, 10.0).await;
        assert!(result.is_err());
    }
}
