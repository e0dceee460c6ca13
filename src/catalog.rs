//! Catalog aggregator (C2): fans the roster out across adapters, merges into one sorted
//! snapshot, and publishes it.
//!
//! Grounded on the teacher's `screenshot_service.rs::process_requests` (bounded-concurrency
//! `try_join_all` fan-out) for the API-adapter side, and on `hua0512-rust-srec`'s
//! `list_streamers` `state_order` sort closure for the four-key total order in §4.2.

use crate::adapters::PlatformAdapter;
use crate::config::AppConfig;
use crate::error::StreamwatchError;
use crate::events::{Event, EventBus};
use crate::metrics::Metrics;
use crate::models::{CatalogSnapshot, Platform, StreamerRecord, StreamerRef, StreamerStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLock, Semaphore};
use tracing::{error, info, warn};

/// API adapters are fanned out with this many in flight at once, per the documented bound.
const API_CONCURRENCY: usize = 5;

pub struct CatalogAggregator {
    adapters: HashMap<Platform, Arc<dyn PlatformAdapter>>,
    roster: HashMap<Platform, Vec<StreamerRef>>,
    snapshot: Arc<RwLock<CatalogSnapshot>>,
    catalog_path: PathBuf,
    events: EventBus,
    metrics: Arc<Metrics>,
}

impl CatalogAggregator {
    pub fn new(
        adapters: HashMap<Platform, Arc<dyn PlatformAdapter>>,
        roster: HashMap<Platform, Vec<StreamerRef>>,
        catalog_path: PathBuf,
        events: EventBus,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            adapters,
            roster,
            snapshot: Arc::new(RwLock::new(CatalogSnapshot::default())),
            catalog_path,
            events,
            metrics,
        }
    }

    pub async fn current_snapshot(&self) -> CatalogSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Loads a previously persisted snapshot from disk at startup, so a cold-start refresh
    /// failure on one platform still has a prior snapshot to fall back to.
    pub async fn load_persisted(&self) -> Result<(), StreamwatchError> {
        if !self.catalog_path.exists() {
            return Ok(());
        }
        let raw = tokio::fs::read_to_string(&self.catalog_path).await?;
        let snapshot: CatalogSnapshot = serde_json::from_str(&raw)?;
        *self.snapshot.write().await = snapshot;
        Ok(())
    }

    /// Refreshes every enabled platform and replaces the published snapshot. Any platform
    /// whose fetch fails keeps its prior entries from the last-known-good snapshot: the whole
    /// refresh never collapses to empty just because one platform misbehaved.
    pub async fn refresh(&self) -> Result<CatalogSnapshot, StreamwatchError> {
        let started = Instant::now();
        let previous = self.current_snapshot().await;

        let (api_platforms, scrape_platforms): (Vec<_>, Vec<_>) =
            self.roster.keys().partition(|p| !p.is_scrape());

        let api_results = self.refresh_api_platforms(&api_platforms, &previous).await;
        let scrape_results = self.refresh_scrape_platforms(&scrape_platforms, &previous).await;

        let mut records: Vec<StreamerRecord> = Vec::new();
        records.extend(api_results);
        records.extend(scrape_results);
        records.sort_by(sort_key);

        let snapshot = CatalogSnapshot {
            generated_at: Utc::now(),
            records,
        };

        let result = self.persist(&snapshot).await;
        self.metrics.record_catalog_refresh(started.elapsed(), result.is_ok());
        result?;
        *self.snapshot.write().await = snapshot.clone();
        self.metrics.set_live_streamer_count(snapshot.live().count());
        self.events.publish(Event::CatalogSnapshot {
            at: snapshot.generated_at,
            snapshot: snapshot.clone(),
        });

        Ok(snapshot)
    }

    /// Refreshes a single platform in isolation and splices its records into the published
    /// snapshot, leaving every other platform's entries untouched. Backs the scoped
    /// `POST /api/refresh/:platform` route, which needs to poll one platform on demand without
    /// paying for a full roster sweep.
    pub async fn refresh_platform(&self, platform: Platform) -> Result<Vec<StreamerRecord>, StreamwatchError> {
        let previous = self.current_snapshot().await;
        let updated = if platform.is_scrape() {
            self.refresh_scrape_platforms(&[&platform], &previous).await
        } else {
            self.refresh_api_platforms(&[&platform], &previous).await
        };

        let mut records: Vec<StreamerRecord> = previous
            .records
            .into_iter()
            .filter(|r| r.platform != platform)
            .collect();
        records.extend(updated.clone());
        records.sort_by(sort_key);

        let snapshot = CatalogSnapshot {
            generated_at: Utc::now(),
            records,
        };

        self.persist(&snapshot).await?;
        *self.snapshot.write().await = snapshot.clone();
        self.metrics.set_live_streamer_count(snapshot.live().count());
        self.events.publish(Event::CatalogSnapshot {
            at: snapshot.generated_at,
            snapshot: snapshot.clone(),
        });

        Ok(updated)
    }

    async fn refresh_api_platforms(
        &self,
        platforms: &[&Platform],
        previous: &CatalogSnapshot,
    ) -> Vec<StreamerRecord> {
        let semaphore = Arc::new(Semaphore::new(API_CONCURRENCY));
        let mut handles = Vec::new();

        for platform in platforms {
            let platform = **platform;
            let Some(adapter) = self.adapters.get(&platform).cloned() else {
                continue;
            };
            let refs = self.roster.get(&platform).cloned().unwrap_or_default();
            let semaphore = semaphore.clone();
            let fallback: Vec<StreamerRecord> = previous.platform_slice(platform).into_iter().cloned().collect();
            let task_fallback = fallback.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let records = adapter.fetch_many(&refs).await;
                if records.is_empty() && !refs.is_empty() {
                    warn!(platform = %platform, "refresh produced no records, falling back to prior snapshot");
                    task_fallback
                } else {
                    records
                }
            });
            handles.push((platform, fallback, handle));
        }

        let mut out = Vec::new();
        for (platform, fallback, handle) in handles {
            match handle.await {
                Ok(records) => out.extend(records),
                Err(e) => {
                    error!(platform = %platform, "api platform refresh task panicked: {}", e);
                    out.extend(fallback);
                }
            }
        }
        out
    }

    async fn refresh_scrape_platforms(
        &self,
        platforms: &[&Platform],
        previous: &CatalogSnapshot,
    ) -> Vec<StreamerRecord> {
        // Scrape platforms are serialized internally (one shared-browser lane each) but run
        // concurrently with each other, since each owns its own lane.
        let mut handles = Vec::new();
        for platform in platforms {
            let platform = **platform;
            let Some(adapter) = self.adapters.get(&platform).cloned() else {
                continue;
            };
            let refs = self.roster.get(&platform).cloned().unwrap_or_default();
            let fallback: Vec<StreamerRecord> = previous.platform_slice(platform).into_iter().cloned().collect();
            let task_fallback = fallback.clone();

            let handle = tokio::spawn(async move {
                let mut records = Vec::with_capacity(refs.len());
                for streamer_ref in &refs {
                    records.push(adapter.fetch(streamer_ref).await);
                }
                if records.is_empty() && !refs.is_empty() {
                    warn!(platform = %platform, "scrape refresh produced no records, falling back to prior snapshot");
                    task_fallback
                } else {
                    records
                }
            });
            handles.push((platform, fallback, handle));
        }

        let mut out = Vec::new();
        for (platform, fallback, handle) in handles {
            match handle.await {
                Ok(records) => out.extend(records),
                Err(e) => {
                    error!(platform = %platform, "scrape platform refresh task panicked: {}", e);
                    out.extend(fallback);
                }
            }
        }
        out
    }

    async fn persist(&self, snapshot: &CatalogSnapshot) -> Result<(), StreamwatchError> {
        let tmp_path = self.catalog_path.with_extension("json.tmp");
        let serialized = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&tmp_path, serialized).await?;
        tokio::fs::rename(&tmp_path, &self.catalog_path).await?;
        info!(path = %self.catalog_path.display(), "catalog snapshot persisted");
        Ok(())
    }
}

pub fn build_roster(config: &AppConfig) -> HashMap<Platform, Vec<StreamerRef>> {
    let mut roster = HashMap::new();
    for platform in &config.enabled_platforms {
        if let Some(entries) = config.roster.get(platform) {
            roster.insert(*platform, entries.iter().map(|id| StreamerRef::new(id.clone())).collect());
        }
    }
    roster
}

pub fn catalog_path(data_dir: &Path) -> PathBuf {
    data_dir.join("catalog.json")
}

fn state_rank(status: &StreamerStatus) -> u8 {
    match status {
        StreamerStatus::Live { .. } => 0,
        StreamerStatus::Offline { .. } => 1,
        StreamerStatus::NotFound => 1,
        StreamerStatus::Error { .. } => 1,
    }
}

fn epoch_zero() -> DateTime<Utc> {
    DateTime::from_timestamp(0, 0).expect("epoch zero is always valid")
}

/// The four-key total order from §4.2: live before not-live; among live, higher viewer_count
/// first; among not-live, more recent `last_broadcast_at` first (absent = epoch zero); ties
/// broken by `(platform, platform_id)` ascending.
pub fn sort_key(a: &StreamerRecord, b: &StreamerRecord) -> std::cmp::Ordering {
    state_rank(&a.status)
        .cmp(&state_rank(&b.status))
        .then_with(|| match (&a.status, &b.status) {
            (StreamerStatus::Live { viewer_count: va, .. }, StreamerStatus::Live { viewer_count: vb, .. }) => {
                vb.cmp(va)
            }
            _ => std::cmp::Ordering::Equal,
        })
        .then_with(|| {
            let la = match &a.status {
                StreamerStatus::Offline { last_broadcast_at } => last_broadcast_at.unwrap_or_else(epoch_zero),
                _ => epoch_zero(),
            };
            let lb = match &b.status {
                StreamerStatus::Offline { last_broadcast_at } => last_broadcast_at.unwrap_or_else(epoch_zero),
                _ => epoch_zero(),
            };
            lb.cmp(&la)
        })
        .then_with(|| a.platform.cmp(&b.platform))
        .then_with(|| a.platform_id.cmp(&b.platform_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(platform: Platform, id: &str, status: StreamerStatus) -> StreamerRecord {
        StreamerRecord {
            platform,
            platform_id: StreamerRef::new(id),
            display_name: id.to_string(),
            avatar_url: None,
            channel_url: String::new(),
            status,
            last_checked: Utc::now(),
            error_details: None,
            cached_stream_url: None,
        }
    }

    #[test]
    fn live_sorts_before_not_live() {
        let mut records = vec![
            record(Platform::KickLike, "a", StreamerStatus::Offline { last_broadcast_at: None }),
            record(
                Platform::KickLike,
                "b",
                StreamerStatus::Live { title: "t".into(), viewer_count: 5, started_at: Utc::now() },
            ),
        ];
        records.sort_by(sort_key);
        assert!(records[0].status.is_live());
    }

    #[test]
    fn live_sorts_by_viewer_count_descending() {
        let mut records = vec![
            record(
                Platform::KickLike,
                "low",
                StreamerStatus::Live { title: "t".into(), viewer_count: 10, started_at: Utc::now() },
            ),
            record(
                Platform::KickLike,
                "high",
                StreamerStatus::Live { title: "t".into(), viewer_count: 1000, started_at: Utc::now() },
            ),
        ];
        records.sort_by(sort_key);
        assert_eq!(records[0].platform_id.0, "high");
    }

    #[test]
    fn not_live_sorts_by_recency_with_absent_as_epoch_zero() {
        let now = Utc::now();
        let mut records = vec![
            record(Platform::KickLike, "never", StreamerStatus::Offline { last_broadcast_at: None }),
            record(
                Platform::KickLike,
                "recent",
                StreamerStatus::Offline { last_broadcast_at: Some(now - Duration::minutes(5)) },
            ),
        ];
        records.sort_by(sort_key);
        assert_eq!(records[0].platform_id.0, "recent");
    }

    #[test]
    fn ties_break_by_platform_then_id() {
        let mut records = vec![
            record(Platform::YouTubeLike, "z", StreamerStatus::NotFound),
            record(Platform::KickLike, "a", StreamerStatus::NotFound),
        ];
        records.sort_by(sort_key);
        assert_eq!(records[0].platform, Platform::KickLike);
    }
}
