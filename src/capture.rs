//! Segment capture worker (C5): drives one job through
//! `initializing → resolving → capturing → captured` (or `error`) by resolving a stream URL
//! and invoking the external transcoder to copy it into a per-job buffer file.
//!
//! Grounded on the teacher's `cli.rs::run_batch` pattern of spawning a tracked task per unit of
//! work and reporting progress through a side channel, here replaced by parsing the
//! transcoder's own stderr progress lines instead of a local counter.

use crate::error::StreamwatchError;
use crate::jobs::JobBroker;
use crate::metrics::Metrics;
use crate::models::JobState;
use crate::resolver::StreamUrlResolver;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

pub struct CaptureWorker {
    jobs: std::sync::Arc<JobBroker>,
    resolver: std::sync::Arc<StreamUrlResolver>,
    transcoder_path: String,
    temp_dir: PathBuf,
    metrics: std::sync::Arc<Metrics>,
}

impl CaptureWorker {
    pub fn new(
        jobs: std::sync::Arc<JobBroker>,
        resolver: std::sync::Arc<StreamUrlResolver>,
        transcoder_path: impl Into<String>,
        temp_dir: PathBuf,
        metrics: std::sync::Arc<Metrics>,
    ) -> Self {
        Self {
            jobs,
            resolver,
            transcoder_path: transcoder_path.into(),
            temp_dir,
            metrics,
        }
    }

    pub async fn run(&self, job_id: &str, capture_duration: Duration) -> Result<(), StreamwatchError> {
        let started = Instant::now();
        let job = self.jobs.get(job_id).await?;

        self.jobs.transition(job_id, JobState::Resolving, |_| {}).await?;
        let stream_url = match self.resolver.resolve(job.platform, &job.streamer_ref).await {
            Ok(url) => url,
            Err(e) => {
                self.jobs
                    .transition(job_id, JobState::Error, |j| j.error_reason = Some(e.to_string()))
                    .await?;
                return Err(e);
            }
        };
        self.jobs
            .transition(job_id, JobState::Capturing, |j| j.stream_url = Some(stream_url.clone()))
            .await?;

        let buffer_path = self.temp_dir.join(format!("{job_id}.buffer.mp4"));
        tokio::fs::create_dir_all(&self.temp_dir).await?;

        let result = self
            .run_transcoder_copy(&stream_url, &buffer_path, capture_duration, job_id)
            .await;

        match result {
            Ok(()) => {
                self.jobs
                    .transition(job_id, JobState::Captured, |j| {
                        j.buffer_path = Some(buffer_path.clone());
                        j.progress = 100;
                    })
                    .await?;
                self.metrics.record_capture_duration(started.elapsed());
                info!(job_id, "capture complete");
                Ok(())
            }
            Err(e) => {
                self.jobs
                    .transition(job_id, JobState::Error, |j| j.error_reason = Some(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    async fn run_transcoder_copy(
        &self,
        source_url: &str,
        output_path: &PathBuf,
        duration: Duration,
        job_id: &str,
    ) -> Result<(), StreamwatchError> {
        let mut child = Command::new(&self.transcoder_path)
            .arg("-i")
            .arg(source_url)
            .arg("-t")
            .arg(duration.as_secs().to_string())
            .arg("-c")
            .arg("copy")
            .arg(output_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamwatchError::TranscodeError(format!("spawn failed: {e}")))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| StreamwatchError::TranscodeError("no stderr handle".to_string()))?;
        let mut lines = BufReader::new(stderr).lines();
        let timestamp_re = progress_timestamp_regex();
        let jobs = self.jobs.clone();
        let job_id = job_id.to_string();
        let target_secs = duration.as_secs_f64().max(1.0);

        let progress_task = tokio::spawn(async move {
            let mut tail = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(elapsed) = parse_progress_line(&timestamp_re, &line) {
                    let pct = ((elapsed / target_secs) * 100.0).clamp(0.0, 100.0) as u8;
                    let _ = jobs.update_progress(&job_id, pct).await;
                }
                tail.push(line);
                if tail.len() > 20 {
                    tail.remove(0);
                }
            }
            tail.join("\n")
        });

        let status = child
            .wait()
            .await
            .map_err(|e| StreamwatchError::TranscodeError(format!("wait failed: {e}")))?;
        let stderr_tail = progress_task.await.unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            warn!(stderr = %stderr_tail, "transcoder exited with failure");
            Err(StreamwatchError::TranscodeError(format!(
                "exit code {:?}: {}",
                status.code(),
                stderr_tail
            )))
        }
    }
}

fn progress_timestamp_regex() -> Regex {
    Regex::new(r"(\d{2}):(\d{2}):(\d{2})\.(\d{2})").expect("static regex is valid")
}

/// Parses a transcoder progress line's `HH:MM:SS.xx` timestamp into elapsed seconds.
fn parse_progress_line(re: &Regex, line: &str) -> Option<f64> {
    let caps = re.captures(line)?;
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    let centis: f64 = caps.get(4)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds + centis / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hh_mm_ss_centis_timestamp() {
        let re = progress_timestamp_regex();
        let elapsed = parse_progress_line(&re, "frame=100 time=00:02:03.50 bitrate=...").unwrap();
        assert!((elapsed - 123.5).abs() < 0.01);
    }

    #[test]
    fn lines_without_a_timestamp_yield_none() {
        let re = progress_timestamp_regex();
        assert!(parse_progress_line(&re, "Input #0, mov,mp4...").is_none());
    }
}
