//! API-OAuth adapter (C1, platform #4 of the roster: Twitch-like), the one adapter whose
//! requests are chunked and whose auth is cached.
//!
//! Grounded on the teacher's `CircuitBreaker`-style "cache a resource with an expiry margin"
//! idiom (`error.rs`'s recovery-timeout check), adapted here to a bearer token refreshed 60
//! seconds ahead of its documented expiry rather than a failure-count threshold.

use super::PlatformAdapter;
use crate::config::OAuthCredentials;
use crate::error::StreamwatchError;
use crate::models::{Platform, StreamerRecord, StreamerRef, StreamerStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_REFRESH_MARGIN: chrono::Duration = chrono::Duration::seconds(60);
const BATCH_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct BatchEntry {
    id: String,
    #[serde(default)]
    is_live: bool,
    #[serde(default)]
    viewer_count: Option<u32>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default)]
    last_broadcast_at: Option<DateTime<Utc>>,
}

pub struct OAuthAdapter {
    base_url: String,
    token_url: String,
    credentials: OAuthCredentials,
    client: Client,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl OAuthAdapter {
    pub fn new(base_url: impl Into<String>, token_url: impl Into<String>, credentials: OAuthCredentials) -> Self {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build().unwrap_or_default();
        Self {
            base_url: base_url.into(),
            token_url: token_url.into(),
            credentials,
            client,
            token: Arc::new(Mutex::new(None)),
        }
    }

    async fn bearer_token(&self) -> Result<String, StreamwatchError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at - TOKEN_REFRESH_MARGIN > Utc::now() {
                return Ok(cached.access_token.clone());
            }
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StreamwatchError::TransientFetch(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let parsed: TokenResponse = response.json().await?;
        let cached = CachedToken {
            access_token: parsed.access_token.clone(),
            expires_at: Utc::now() + chrono::Duration::seconds(parsed.expires_in),
        };
        *guard = Some(cached);
        Ok(parsed.access_token)
    }

    fn error_record(&self, streamer_ref: &StreamerRef, reason: String, now: DateTime<Utc>) -> StreamerRecord {
        StreamerRecord {
            platform: Platform::TwitchLike,
            platform_id: streamer_ref.clone(),
            display_name: streamer_ref.0.clone(),
            avatar_url: None,
            channel_url: format!("{}/{}", self.base_url, streamer_ref.0),
            status: StreamerStatus::Error { reason: reason.clone() },
            last_checked: now,
            error_details: Some(reason),
            cached_stream_url: None,
        }
    }

    async fn fetch_batch(&self, chunk: &[StreamerRef]) -> Vec<StreamerRecord> {
        let now = Utc::now();

        let token = match self.bearer_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!("twitchlike token mint failed: {}", e);
                return chunk
                    .iter()
                    .map(|r| self.error_record(r, e.to_string(), now))
                    .collect();
            }
        };

        let ids: Vec<&str> = chunk.iter().map(|r| r.0.as_str()).collect();
        let url = format!("{}/channels/batch", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .query(&[("ids", ids.join(","))])
            .send()
            .await;

        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                let reason = format!("batch endpoint returned {}", r.status());
                return chunk.iter().map(|r2| self.error_record(r2, reason.clone(), now)).collect();
            }
            Err(e) => {
                let reason = e.to_string();
                return chunk.iter().map(|r| self.error_record(r, reason.clone(), now)).collect();
            }
        };

        let entries: Vec<BatchEntry> = match response.json().await {
            Ok(entries) => entries,
            Err(e) => {
                let reason = e.to_string();
                return chunk.iter().map(|r| self.error_record(r, reason.clone(), now)).collect();
            }
        };

        chunk
            .iter()
            .map(|streamer_ref| {
                match entries.iter().find(|e| e.id == streamer_ref.0) {
                    Some(entry) => {
                        let status = if entry.is_live {
                            StreamerStatus::Live {
                                title: entry.title.clone().unwrap_or_default(),
                                viewer_count: entry.viewer_count.unwrap_or(0),
                                started_at: entry.started_at.unwrap_or(now),
                            }
                        } else {
                            StreamerStatus::Offline {
                                last_broadcast_at: entry.last_broadcast_at,
                            }
                        };
                        StreamerRecord {
                            platform: Platform::TwitchLike,
                            platform_id: streamer_ref.clone(),
                            display_name: entry.display_name.clone().unwrap_or_else(|| streamer_ref.0.clone()),
                            avatar_url: entry.avatar_url.clone(),
                            channel_url: format!("{}/{}", self.base_url, streamer_ref.0),
                            status,
                            last_checked: now,
                            error_details: None,
                            cached_stream_url: None,
                        }
                    }
                    None => self.error_record(streamer_ref, "missing from batch response".to_string(), now),
                }
            })
            .collect()
    }
}

#[async_trait]
impl PlatformAdapter for OAuthAdapter {
    fn platform(&self) -> Platform {
        Platform::TwitchLike
    }

    async fn fetch(&self, streamer_ref: &StreamerRef) -> StreamerRecord {
        self.fetch_batch(std::slice::from_ref(streamer_ref))
            .await
            .into_iter()
            .next()
            .unwrap_or_else(|| self.error_record(streamer_ref, "empty batch result".to_string(), Utc::now()))
    }

    async fn fetch_many(&self, streamer_refs: &[StreamerRef]) -> Vec<StreamerRecord> {
        let mut out = Vec::with_capacity(streamer_refs.len());
        for chunk in streamer_refs.chunks(BATCH_SIZE) {
            out.extend(self.fetch_batch(chunk).await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_is_fixed_to_twitchlike() {
        let adapter = OAuthAdapter::new(
            "https://example.invalid",
            "https://example.invalid/token",
            OAuthCredentials::default(),
        );
        assert_eq!(adapter.platform(), Platform::TwitchLike);
    }
}
