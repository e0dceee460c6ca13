//! Core data model: streamer records, the catalog snapshot, and clip jobs.
//!
//! Grounded on `hua0512-rust-srec`'s `StreamerMetadata`/`StreamerState` (identity + tagged
//! status) and `api/models.rs`'s DTO shapes, adapted to this service's six-platform roster
//! and the job lifecycle in the component design.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    KickLike,
    YouTubeLike,
    TwitchLike,
    RumbleLike,
    TikTokLike,
    ChaturbateLike,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::KickLike,
        Platform::YouTubeLike,
        Platform::TwitchLike,
        Platform::RumbleLike,
        Platform::TikTokLike,
        Platform::ChaturbateLike,
    ];

    pub fn is_scrape(&self) -> bool {
        matches!(self, Platform::TikTokLike | Platform::ChaturbateLike)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::KickLike => "kicklike",
            Platform::YouTubeLike => "youtubelike",
            Platform::TwitchLike => "twitchlike",
            Platform::RumbleLike => "rumblelike",
            Platform::TikTokLike => "tiktoklike",
            Platform::ChaturbateLike => "chaturbatelike",
        }
    }

    pub fn parse(s: &str) -> Option<Platform> {
        Platform::ALL.into_iter().find(|p| p.as_str() == s)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The natural key a platform uses to identify a channel: numeric user id, login name, etc.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct StreamerRef(pub String);

impl StreamerRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for StreamerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamerStatus {
    Live {
        title: String,
        viewer_count: u32,
        started_at: DateTime<Utc>,
    },
    Offline {
        last_broadcast_at: Option<DateTime<Utc>>,
    },
    NotFound,
    Error {
        reason: String,
    },
}

impl StreamerStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, StreamerStatus::Live { .. })
    }
}

/// One roster entry's state as of the most recent poll. Supplanted, never mutated, on the
/// next cycle.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamerRecord {
    pub platform: Platform,
    pub platform_id: StreamerRef,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub channel_url: String,
    pub status: StreamerStatus,
    pub last_checked: DateTime<Utc>,
    /// Populated on partial failure (e.g. one of several endpoints failed) alongside otherwise
    /// usable fields; distinct from the `Error` status variant, which means the whole record
    /// is unusable.
    pub error_details: Option<String>,
    /// Media-playlist URL cached from the poll, if the adapter happened to observe one.
    pub cached_stream_url: Option<String>,
}

impl StreamerRecord {
    pub fn identity(&self) -> (Platform, &StreamerRef) {
        (self.platform, &self.platform_id)
    }
}

/// An ordered, totally-sorted snapshot of every roster entry. See `catalog::sort_key` for the
/// four-key ordering.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CatalogSnapshot {
    pub generated_at: DateTime<Utc>,
    pub records: Vec<StreamerRecord>,
}

impl CatalogSnapshot {
    pub fn find(&self, platform: Platform, streamer_ref: &StreamerRef) -> Option<&StreamerRecord> {
        self.records
            .iter()
            .find(|r| r.platform == platform && &r.platform_id == streamer_ref)
    }

    pub fn live(&self) -> impl Iterator<Item = &StreamerRecord> {
        self.records.iter().filter(|r| r.status.is_live())
    }

    pub fn platform_slice(&self, platform: Platform) -> Vec<&StreamerRecord> {
        self.records.iter().filter(|r| r.platform == platform).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Initializing,
    Resolving,
    Capturing,
    Captured,
    Processing,
    Completed,
    Uploading,
    Uploaded,
    Error,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Uploaded | JobState::Completed | JobState::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Initializing => "initializing",
            JobState::Resolving => "resolving",
            JobState::Capturing => "capturing",
            JobState::Captured => "captured",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Uploading => "uploading",
            JobState::Uploaded => "uploaded",
            JobState::Error => "error",
        }
    }

    /// The transition graph in the job broker's contract: every non-error state may advance
    /// to the next pipeline stage or fall into `Error`; `Completed` may additionally advance
    /// to `Uploading` on demand (upload is client-triggered, not automatic).
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Initializing, Resolving) => true,
            (Resolving, Capturing) => true,
            (Capturing, Captured) => true,
            (Captured, Processing) => true,
            (Processing, Completed) => true,
            (Completed, Uploading) => true,
            (Uploading, Uploaded) => true,
            (_, Error) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Job {
    pub id: String,
    pub platform: Platform,
    pub streamer_ref: StreamerRef,
    pub state: JobState,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub title: Option<String>,
    pub buffer_path: Option<PathBuf>,
    pub stream_url: Option<String>,
    pub clip_path: Option<PathBuf>,
    pub thumbnail_path: Option<PathBuf>,
    pub preview_frame_paths: Vec<PathBuf>,
    pub uploaded_url: Option<String>,
    pub error_reason: Option<String>,
}

impl Job {
    pub fn new(id: String, platform: Platform, streamer_ref: StreamerRef, now: DateTime<Utc>) -> Self {
        Self {
            id,
            platform,
            streamer_ref,
            state: JobState::Initializing,
            progress: 0,
            created_at: now,
            updated_at: now,
            title: None,
            buffer_path: None,
            stream_url: None,
            clip_path: None,
            thumbnail_path: None,
            preview_frame_paths: Vec::new(),
            uploaded_url: None,
            error_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_matches_component_design() {
        assert!(JobState::Initializing.can_transition_to(JobState::Resolving));
        assert!(JobState::Resolving.can_transition_to(JobState::Capturing));
        assert!(JobState::Capturing.can_transition_to(JobState::Captured));
        assert!(JobState::Captured.can_transition_to(JobState::Processing));
        assert!(JobState::Processing.can_transition_to(JobState::Completed));
        assert!(JobState::Completed.can_transition_to(JobState::Uploading));
        assert!(JobState::Uploading.can_transition_to(JobState::Uploaded));

        assert!(!JobState::Initializing.can_transition_to(JobState::Capturing));
        assert!(!JobState::Uploaded.can_transition_to(JobState::Error));
        assert!(!JobState::Error.can_transition_to(JobState::Resolving));
    }

    #[test]
    fn every_non_terminal_state_can_error() {
        for state in [
            JobState::Initializing,
            JobState::Resolving,
            JobState::Capturing,
            JobState::Captured,
            JobState::Processing,
            JobState::Completed,
            JobState::Uploading,
        ] {
            assert!(state.can_transition_to(JobState::Error));
        }
    }

    #[test]
    fn platform_round_trips_through_str() {
        for platform in Platform::ALL {
            assert_eq!(Platform::parse(platform.as_str()), Some(platform));
        }
        assert_eq!(Platform::parse("not-a-platform"), None);
    }
}
