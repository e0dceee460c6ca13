//! Garbage collector (C10): the three reclamation sweeps that keep the registry and the
//! filesystem bounded over an unattended service's lifetime.
//!
//! Grounded on `jobs.rs`'s watchdog (the stall sweep, reused verbatim via
//! `JobBroker::sweep_stalled`) and on `browser_pool.rs`'s periodic `tokio::select!` loop for the
//! shape of the scheduler that will drive these sweeps on their documented cadences.

use crate::clock::Clock;
use crate::jobs::JobBroker;
use crate::models::JobState;
use chrono::Duration as ChronoDuration;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

const RETENTION: ChronoDuration = ChronoDuration::hours(24);
const DISK_PRESSURE_THRESHOLD: f64 = 0.9;
const DISK_PRESSURE_BATCH_FRACTION: f64 = 0.1;

pub struct GarbageCollector {
    jobs: Arc<JobBroker>,
    clock: Arc<dyn Clock>,
    clips_dir: PathBuf,
    thumbnails_dir: PathBuf,
    temp_dir: PathBuf,
    disk_root: PathBuf,
}

impl GarbageCollector {
    pub fn new(
        jobs: Arc<JobBroker>,
        clock: Arc<dyn Clock>,
        clips_dir: PathBuf,
        thumbnails_dir: PathBuf,
        temp_dir: PathBuf,
        disk_root: PathBuf,
    ) -> Self {
        Self { jobs, clock, clips_dir, thumbnails_dir, temp_dir, disk_root }
    }

    /// Deletes temp buffers and preview directories older than 24h, and drops terminal jobs
    /// older than 24h from the registry. Runs at midnight local per the scheduler's cadence.
    pub async fn daily_sweep(&self) -> Result<(), std::io::Error> {
        let cutoff = self.clock.now() - RETENTION;

        self.sweep_stale_dir_entries(&self.temp_dir, cutoff).await?;

        let mut removed = 0;
        for job in self.jobs.list().await {
            if job.state.is_terminal() && job.updated_at < cutoff {
                if self.jobs.delete(&job.id).await.is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "daily sweep removed terminal jobs older than 24h");
        }
        Ok(())
    }

    async fn sweep_stale_dir_entries(&self, dir: &Path, cutoff: chrono::DateTime<chrono::Utc>) -> Result<(), std::io::Error> {
        if !dir.exists() {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let modified: chrono::DateTime<chrono::Utc> = modified.into();
            if modified >= cutoff {
                continue;
            }
            let path = entry.path();
            if metadata.is_dir() {
                let _ = tokio::fs::remove_dir_all(&path).await;
            } else {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
        Ok(())
    }

    /// Delegates to the job broker's own stall watchdog. Runs every five minutes.
    pub async fn stall_sweep(&self) -> Vec<String> {
        self.jobs.sweep_stalled().await
    }

    /// If filesystem usage under the data directory exceeds 90%, deletes the oldest finished
    /// clips (and their thumbnails) in 10%-of-remaining batches by creation time until usage is
    /// back under the threshold or there is nothing left to delete. Runs every six hours.
    pub async fn disk_pressure_sweep(&self) -> Result<usize, std::io::Error> {
        let mut deleted = 0;
        loop {
            let usage = crate::utils::disk_usage_fraction(&self.disk_root);
            if usage <= DISK_PRESSURE_THRESHOLD {
                break;
            }

            let mut clips = self.list_clips_by_age().await?;
            if clips.is_empty() {
                warn!(usage, "disk pressure sweep found no clips left to delete");
                break;
            }

            clips.sort_by_key(|(_, created)| *created);
            let batch_len = ((clips.len() as f64 * DISK_PRESSURE_BATCH_FRACTION).ceil() as usize).max(1);

            for (clip_path, _) in clips.into_iter().take(batch_len) {
                self.delete_clip_and_thumbnail(&clip_path).await;
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(deleted, "disk pressure sweep reclaimed space");
        }
        Ok(deleted)
    }

    async fn list_clips_by_age(&self) -> Result<Vec<(PathBuf, SystemTime)>, std::io::Error> {
        let mut out = Vec::new();
        if !self.clips_dir.exists() {
            return Ok(out);
        }
        let mut entries = tokio::fs::read_dir(&self.clips_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let created = metadata.created().or_else(|_| metadata.modified()).unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((entry.path(), created));
        }
        Ok(out)
    }

    async fn delete_clip_and_thumbnail(&self, clip_path: &Path) {
        if let Err(e) = tokio::fs::remove_file(clip_path).await {
            warn!(path = %clip_path.display(), "failed to delete clip: {}", e);
        }
        if let Some(stem) = clip_path.file_stem().and_then(|s| s.to_str()) {
            let thumbnail_path = self.thumbnails_dir.join(format!("{stem}.jpg"));
            let _ = tokio::fs::remove_file(&thumbnail_path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::events::EventBus;
    use crate::metrics::Metrics;
    use crate::models::{Platform, StreamerRef};

    fn gc_with(temp_dir: PathBuf) -> (GarbageCollector, Arc<JobBroker>, TestClock) {
        let clock = TestClock::new(chrono::Utc::now());
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let jobs = Arc::new(JobBroker::new(EventBus::new(), clock_arc.clone(), Arc::new(Metrics::new())));
        let gc = GarbageCollector::new(
            jobs.clone(),
            clock_arc,
            PathBuf::from("/tmp/streamwatch-gc-test-clips"),
            PathBuf::from("/tmp/streamwatch-gc-test-thumbnails"),
            temp_dir,
            PathBuf::from("/tmp"),
        );
        (gc, jobs, clock)
    }

    #[tokio::test]
    async fn daily_sweep_removes_terminal_jobs_older_than_24h() {
        let (gc, jobs, clock) = gc_with(PathBuf::from("/tmp/streamwatch-gc-test-temp-empty"));
        let job = jobs.create(Platform::KickLike, StreamerRef::new("abc")).await;
        jobs.transition(&job.id, JobState::Error, |j| j.error_reason = Some("x".into())).await.unwrap();

        clock.advance(ChronoDuration::hours(25));
        gc.daily_sweep().await.unwrap();

        assert!(jobs.get(&job.id).await.is_err());
    }

    #[tokio::test]
    async fn daily_sweep_keeps_recent_terminal_jobs() {
        let (gc, jobs, clock) = gc_with(PathBuf::from("/tmp/streamwatch-gc-test-temp-empty2"));
        let job = jobs.create(Platform::KickLike, StreamerRef::new("abc")).await;
        jobs.transition(&job.id, JobState::Error, |j| j.error_reason = Some("x".into())).await.unwrap();

        clock.advance(ChronoDuration::hours(1));
        gc.daily_sweep().await.unwrap();

        assert!(jobs.get(&job.id).await.is_ok());
    }

    #[tokio::test]
    async fn daily_sweep_keeps_non_terminal_jobs_regardless_of_age() {
        let (gc, jobs, clock) = gc_with(PathBuf::from("/tmp/streamwatch-gc-test-temp-empty3"));
        let job = jobs.create(Platform::KickLike, StreamerRef::new("abc")).await;

        clock.advance(ChronoDuration::hours(48));
        gc.daily_sweep().await.unwrap();

        assert!(jobs.get(&job.id).await.is_ok());
    }

    #[tokio::test]
    async fn stall_sweep_delegates_to_job_broker() {
        let (gc, jobs, clock) = gc_with(PathBuf::from("/tmp/streamwatch-gc-test-temp-empty4"));
        let job = jobs.create(Platform::KickLike, StreamerRef::new("abc")).await;
        jobs.transition(&job.id, JobState::Resolving, |_| {}).await.unwrap();

        clock.advance(ChronoDuration::minutes(31));
        let swept = gc.stall_sweep().await;
        assert_eq!(swept, vec![job.id]);
    }
}
