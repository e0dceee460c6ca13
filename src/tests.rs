//! Cross-module integration tests: the scenarios that only show up once the catalog aggregator,
//! job broker, event bus, and pipeline runner are wired together, rather than exercised in
//! isolation the way each module's own `#[cfg(test)]` block does.

use crate::adapters::PlatformAdapter;
use crate::catalog::CatalogAggregator;
use crate::clock::TestClock;
use crate::events::{Event, EventBus};
use crate::jobs::JobBroker;
use crate::metrics::Metrics;
use crate::models::{CatalogSnapshot, JobState, Platform, StreamerRecord, StreamerRef, StreamerStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An adapter whose response for a given call is scripted ahead of time, so a test can assert
/// on exactly how the aggregator merges and falls back around it.
struct ScriptedAdapter {
    platform: Platform,
    responses: std::sync::Mutex<Vec<Vec<StreamerRecord>>>,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    fn new(platform: Platform, responses: Vec<Vec<StreamerRecord>>) -> Self {
        Self {
            platform,
            responses: std::sync::Mutex::new(responses),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PlatformAdapter for ScriptedAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn fetch(&self, streamer_ref: &StreamerRef) -> StreamerRecord {
        self.fetch_many(std::slice::from_ref(streamer_ref))
            .await
            .into_iter()
            .next()
            .expect("scripted fetch always returns one record")
    }

    async fn fetch_many(&self, _streamer_refs: &[StreamerRef]) -> Vec<StreamerRecord> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Vec::new()
        } else {
            responses.remove(0)
        }
    }
}

fn live_record(platform: Platform, id: &str, viewer_count: u32) -> StreamerRecord {
    StreamerRecord {
        platform,
        platform_id: StreamerRef::new(id),
        display_name: id.to_string(),
        avatar_url: None,
        channel_url: format!("https://example.invalid/{id}"),
        status: StreamerStatus::Live { title: "live".to_string(), viewer_count, started_at: Utc::now() },
        last_checked: Utc::now(),
        error_details: None,
        cached_stream_url: None,
    }
}

fn offline_record(platform: Platform, id: &str) -> StreamerRecord {
    StreamerRecord {
        platform,
        platform_id: StreamerRef::new(id),
        display_name: id.to_string(),
        avatar_url: None,
        channel_url: format!("https://example.invalid/{id}"),
        status: StreamerStatus::Offline { last_broadcast_at: None },
        last_checked: Utc::now(),
        error_details: None,
        cached_stream_url: None,
    }
}

#[tokio::test]
async fn refresh_merges_api_and_scrape_platforms_into_one_sorted_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let catalog_path = dir.path().join("catalog.json");

    let kick: Arc<dyn PlatformAdapter> = Arc::new(ScriptedAdapter::new(
        Platform::KickLike,
        vec![vec![live_record(Platform::KickLike, "small", 10)]],
    ));
    let tiktok: Arc<dyn PlatformAdapter> = Arc::new(ScriptedAdapter::new(
        Platform::TikTokLike,
        vec![vec![live_record(Platform::TikTokLike, "big", 5_000)]],
    ));

    let mut adapters: HashMap<Platform, Arc<dyn PlatformAdapter>> = HashMap::new();
    adapters.insert(Platform::KickLike, kick);
    adapters.insert(Platform::TikTokLike, tiktok);

    let mut roster: HashMap<Platform, Vec<StreamerRef>> = HashMap::new();
    roster.insert(Platform::KickLike, vec![StreamerRef::new("small")]);
    roster.insert(Platform::TikTokLike, vec![StreamerRef::new("big")]);

    let aggregator = CatalogAggregator::new(adapters, roster, catalog_path.clone(), EventBus::new(), Arc::new(Metrics::new()));
    let snapshot = aggregator.refresh().await.unwrap();

    assert_eq!(snapshot.records.len(), 2);
    assert_eq!(snapshot.records[0].platform_id.0, "big", "higher viewer_count across platforms sorts first");
    assert!(catalog_path.exists(), "refresh persists the snapshot to disk");
}

#[tokio::test]
async fn refresh_calls_each_enabled_platforms_adapter_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let catalog_path = dir.path().join("catalog.json");

    let adapter = Arc::new(ScriptedAdapter::new(Platform::KickLike, vec![vec![live_record(Platform::KickLike, "a", 1)]]));
    let mut adapters: HashMap<Platform, Arc<dyn PlatformAdapter>> = HashMap::new();
    adapters.insert(Platform::KickLike, adapter.clone());
    let mut roster: HashMap<Platform, Vec<StreamerRef>> = HashMap::new();
    roster.insert(Platform::KickLike, vec![StreamerRef::new("a")]);

    let aggregator = CatalogAggregator::new(adapters, roster, catalog_path, EventBus::new(), Arc::new(Metrics::new()));
    aggregator.refresh().await.unwrap();

    assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refresh_falls_back_to_prior_snapshot_when_a_platform_returns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let catalog_path = dir.path().join("catalog.json");

    let adapter: Arc<dyn PlatformAdapter> = Arc::new(ScriptedAdapter::new(
        Platform::KickLike,
        vec![vec![offline_record(Platform::KickLike, "steady")], Vec::new()],
    ));
    let mut adapters: HashMap<Platform, Arc<dyn PlatformAdapter>> = HashMap::new();
    adapters.insert(Platform::KickLike, adapter);
    let mut roster: HashMap<Platform, Vec<StreamerRef>> = HashMap::new();
    roster.insert(Platform::KickLike, vec![StreamerRef::new("steady")]);

    let aggregator = CatalogAggregator::new(adapters, roster, catalog_path, EventBus::new(), Arc::new(Metrics::new()));

    let first = aggregator.refresh().await.unwrap();
    assert_eq!(first.records.len(), 1);

    // Second refresh's scripted response is empty; the aggregator should keep the prior entry
    // rather than publish an empty catalog just because one platform misbehaved.
    let second = aggregator.refresh().await.unwrap();
    assert_eq!(second.records.len(), 1);
    assert_eq!(second.records[0].platform_id.0, "steady");
}

#[tokio::test]
async fn load_persisted_restores_a_snapshot_written_by_a_prior_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let catalog_path = dir.path().join("catalog.json");

    let adapter: Arc<dyn PlatformAdapter> = Arc::new(ScriptedAdapter::new(
        Platform::KickLike,
        vec![vec![live_record(Platform::KickLike, "persisted", 42)]],
    ));
    let mut adapters: HashMap<Platform, Arc<dyn PlatformAdapter>> = HashMap::new();
    adapters.insert(Platform::KickLike, adapter.clone());
    let mut roster: HashMap<Platform, Vec<StreamerRef>> = HashMap::new();
    roster.insert(Platform::KickLike, vec![StreamerRef::new("persisted")]);

    let writer = CatalogAggregator::new(adapters, roster, catalog_path.clone(), EventBus::new(), Arc::new(Metrics::new()));
    writer.refresh().await.unwrap();

    let mut adapters: HashMap<Platform, Arc<dyn PlatformAdapter>> = HashMap::new();
    adapters.insert(Platform::KickLike, adapter);
    let reader = CatalogAggregator::new(adapters, HashMap::new(), catalog_path, EventBus::new(), Arc::new(Metrics::new()));
    reader.load_persisted().await.unwrap();

    let restored: CatalogSnapshot = reader.current_snapshot().await;
    assert_eq!(restored.records.len(), 1);
    assert_eq!(restored.records[0].platform_id.0, "persisted");
}

#[tokio::test]
async fn full_job_lifecycle_publishes_events_in_pipeline_order() {
    let clock = Arc::new(TestClock::new(Utc::now()));
    let events = EventBus::new();
    let mut subscriber = events.subscribe();
    let broker = JobBroker::new(events, clock, Arc::new(Metrics::new()));

    let job = broker.create(Platform::KickLike, StreamerRef::new("abc")).await;
    broker.transition(&job.id, JobState::Resolving, |_| {}).await.unwrap();
    broker.transition(&job.id, JobState::Capturing, |_| {}).await.unwrap();
    broker.transition(&job.id, JobState::Captured, |_| {}).await.unwrap();
    broker.transition(&job.id, JobState::Processing, |_| {}).await.unwrap();
    broker.transition(&job.id, JobState::Completed, |_| {}).await.unwrap();
    broker.transition(&job.id, JobState::Uploading, |_| {}).await.unwrap();
    broker
        .transition(&job.id, JobState::Uploaded, |j| j.uploaded_url = Some("https://cdn.example/clip".to_string()))
        .await
        .unwrap();

    let mut milestones = Vec::new();
    while let Ok(event) = subscriber.try_recv() {
        match event {
            Event::CaptureComplete { .. } => milestones.push("capture"),
            Event::ClipComplete { .. } => milestones.push("clip"),
            Event::UploadComplete { url, .. } => {
                assert_eq!(url, "https://cdn.example/clip");
                milestones.push("upload");
            }
            _ => {}
        }
    }

    assert_eq!(milestones, vec!["capture", "clip", "upload"]);
}

#[tokio::test]
async fn invalid_transition_leaves_job_state_untouched_and_publishes_nothing() {
    let clock = Arc::new(TestClock::new(Utc::now()));
    let events = EventBus::new();
    let mut subscriber = events.subscribe();
    let broker = JobBroker::new(events, clock, Arc::new(Metrics::new()));

    let job = broker.create(Platform::KickLike, StreamerRef::new("abc")).await;
    subscriber.try_recv().expect("job_created was published");

    let result = broker.transition(&job.id, JobState::Uploaded, |_| {}).await;
    assert!(result.is_err());
    assert!(subscriber.try_recv().is_err(), "a rejected transition must not publish an event");

    let unchanged = broker.get(&job.id).await.unwrap();
    assert_eq!(unchanged.state, JobState::Initializing);
}
