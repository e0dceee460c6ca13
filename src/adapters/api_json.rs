//! API-JSON adapters (C1, platforms #1-3 of the roster: Kick-like, YouTube-like, Rumble-like).
//!
//! Grounded on the teacher's `reqwest` usage pattern (implicit in `Cargo.toml`'s `reqwest`
//! dependency, generalized here since the teacher itself never made an outbound HTTP call) and
//! on `hua0512-rust-srec`'s monitor-service pattern of a primary "is it live" call followed by a
//! secondary metadata call, collapsing either call's failure into a populated `error_reason`
//! rather than an aborted fetch.

use super::PlatformAdapter;
use crate::error::StreamwatchError;
use crate::models::{Platform, StreamerRecord, StreamerRef, StreamerStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize, Default)]
struct LiveStatusResponse {
    #[serde(default)]
    is_live: bool,
    #[serde(default)]
    viewer_count: Option<u32>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Default)]
struct ProfileResponse {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default)]
    channel_url: Option<String>,
    #[serde(default)]
    last_broadcast_at: Option<DateTime<Utc>>,
}

pub struct ApiJsonAdapter {
    platform: Platform,
    base_url: String,
    user_agent: String,
    client: Client,
}

impl ApiJsonAdapter {
    pub fn new(platform: Platform, base_url: impl Into<String>, user_agent: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            platform,
            base_url: base_url.into(),
            user_agent: user_agent.into(),
            client,
        }
    }

    async fn fetch_live(&self, streamer_ref: &StreamerRef) -> Result<LiveStatusResponse, StreamwatchError> {
        let url = format!("{}/channels/{}/live", self.base_url, streamer_ref.0);
        let response = self
            .client
            .get(&url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StreamwatchError::NotFound);
        }
        if !response.status().is_success() {
            return Err(StreamwatchError::TransientFetch(format!(
                "live endpoint returned {}",
                response.status()
            )));
        }
        Ok(response.json().await.unwrap_or_default())
    }

    async fn fetch_profile(&self, streamer_ref: &StreamerRef) -> Result<ProfileResponse, StreamwatchError> {
        let url = format!("{}/channels/{}", self.base_url, streamer_ref.0);
        let response = self
            .client
            .get(&url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StreamwatchError::TransientFetch(format!(
                "profile endpoint returned {}",
                response.status()
            )));
        }
        Ok(response.json().await.unwrap_or_default())
    }
}

#[async_trait]
impl PlatformAdapter for ApiJsonAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn fetch(&self, streamer_ref: &StreamerRef) -> StreamerRecord {
        let now = Utc::now();

        let live = match self.fetch_live(streamer_ref).await {
            Ok(live) => live,
            Err(StreamwatchError::NotFound) => {
                return StreamerRecord {
                    platform: self.platform,
                    platform_id: streamer_ref.clone(),
                    display_name: streamer_ref.0.clone(),
                    avatar_url: None,
                    channel_url: format!("{}/{}", self.base_url, streamer_ref.0),
                    status: StreamerStatus::NotFound,
                    last_checked: now,
                    error_details: None,
                    cached_stream_url: None,
                };
            }
            Err(e) => {
                warn!(platform = %self.platform, streamer = %streamer_ref, "live fetch failed: {}", e);
                return StreamerRecord {
                    platform: self.platform,
                    platform_id: streamer_ref.clone(),
                    display_name: streamer_ref.0.clone(),
                    avatar_url: None,
                    channel_url: format!("{}/{}", self.base_url, streamer_ref.0),
                    status: StreamerStatus::Error { reason: e.to_string() },
                    last_checked: now,
                    error_details: Some(e.to_string()),
                    cached_stream_url: None,
                };
            }
        };

        let profile = self.fetch_profile(streamer_ref).await;
        let error_details = profile.as_ref().err().map(|e| e.to_string());
        let profile = profile.unwrap_or_default();

        let status = if live.is_live {
            StreamerStatus::Live {
                title: live.title.unwrap_or_default(),
                viewer_count: live.viewer_count.unwrap_or(0),
                started_at: live.started_at.unwrap_or(now),
            }
        } else {
            StreamerStatus::Offline {
                last_broadcast_at: profile.last_broadcast_at,
            }
        };

        StreamerRecord {
            platform: self.platform,
            platform_id: streamer_ref.clone(),
            display_name: profile.display_name.unwrap_or_else(|| streamer_ref.0.clone()),
            avatar_url: profile.avatar_url,
            channel_url: profile
                .channel_url
                .unwrap_or_else(|| format!("{}/{}", self.base_url, streamer_ref.0)),
            status,
            last_checked: now,
            error_details,
            cached_stream_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_reports_its_own_platform() {
        let adapter = ApiJsonAdapter::new(Platform::KickLike, "https://example.invalid", "streamwatch/0.1");
        assert_eq!(adapter.platform(), Platform::KickLike);
    }
}
