//! HTML-scrape adapters (C1, platforms #5-6 of the roster: TikTok-like, Chaturbate-like).
//!
//! Grounded on the teacher's `screenshot_service.rs` page-interaction pattern (navigate, wait,
//! query, close) and `utils.rs`'s `RequestInterceptor` for blocking non-essential resource
//! types during the page load. Every selector query is wrapped in a short timeout so a missing
//! element degrades the field to `Unknown`/0 rather than failing the whole record, per §4.1.

use super::{parse_viewer_count, PlatformAdapter};
use crate::browser_pool::SharedBrowser;
use crate::error::StreamwatchError;
use crate::models::{Platform, StreamerRecord, StreamerRef, StreamerStatus};
use async_trait::async_trait;
use chrono::Utc;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(60);
const SELECTOR_TIMEOUT: Duration = Duration::from_secs(3);
const MEDIA_PLAYLIST_EXTENSION: &str = ".m3u8";
const MEDIA_URL_WAIT: Duration = Duration::from_secs(5);

const BLOCKED_RESOURCE_TYPES: [&str; 3] = ["image", "stylesheet", "font"];
const MEDIA_CDN_ALLOWLIST: [&str; 2] = ["media-cdn", "cdn-media"];

/// CSS selectors for one scrape platform's watch page. Each adapter owns one; the scraping
/// algorithm itself (navigate, detect-not-found, scrape fields, parse viewer count) is shared.
pub struct ScrapeSelectors {
    pub not_found_title_fragment: &'static str,
    pub display_name: &'static str,
    pub avatar: &'static str,
    pub title: &'static str,
    pub live_badge: &'static str,
    pub viewer_count: &'static str,
    pub last_broadcast: &'static str,
}

pub struct ScrapeAdapter {
    platform: Platform,
    lane_id: usize,
    browser: SharedBrowser,
    base_url: String,
    selectors: ScrapeSelectors,
}

impl ScrapeAdapter {
    pub fn new(
        platform: Platform,
        lane_id: usize,
        browser: SharedBrowser,
        base_url: impl Into<String>,
        selectors: ScrapeSelectors,
    ) -> Self {
        Self {
            platform,
            lane_id,
            browser,
            base_url: base_url.into(),
            selectors,
        }
    }

    fn watch_url(&self, streamer_ref: &StreamerRef) -> String {
        format!("{}/{}", self.base_url, streamer_ref.0)
    }

    async fn text_within(&self, page: &Page, selector: &str) -> Option<String> {
        let query = page.find_element(selector);
        match timeout(SELECTOR_TIMEOUT, query).await {
            Ok(Ok(element)) => element.inner_text().await.ok().flatten(),
            _ => None,
        }
    }

    async fn attr_within(&self, page: &Page, selector: &str, attr: &str) -> Option<String> {
        let query = page.find_element(selector);
        match timeout(SELECTOR_TIMEOUT, query).await {
            Ok(Ok(element)) => element.attribute(attr).await.ok().flatten(),
            _ => None,
        }
    }

    /// Nudges playback and waits, bounded, for the media-playlist request the page makes while
    /// live; best-effort so a slow or absent request just leaves the record's cache empty rather
    /// than failing the whole scrape. Lets the resolver (C4) skip its own browser pass for this
    /// streamer on the next capture request, per the catalog-cache fast path.
    async fn observe_media_playlist_url(&self, page: &Page) -> Option<String> {
        let events = page
            .event_listener::<chromiumoxide::cdp::browser_protocol::network::EventResponseReceived>()
            .await
            .ok()?;

        let interaction = page.evaluate(
            "(() => { const v = document.querySelector('video'); if (v) { v.currentTime = 0; v.play(); } })()",
        );
        let _ = timeout(MEDIA_URL_WAIT, interaction).await;

        let find = async move {
            let mut events = events;
            while let Some(event) = events.next().await {
                let url = event.response.url.clone();
                if url.contains(MEDIA_PLAYLIST_EXTENSION) {
                    return Some(url);
                }
            }
            None
        };
        timeout(MEDIA_URL_WAIT, find).await.ok().flatten()
    }

    async fn scrape(&self, streamer_ref: &StreamerRef) -> Result<StreamerRecord, StreamwatchError> {
        let _lane = self.browser.acquire_lane(self.lane_id).await;
        let now = Utc::now();
        let url = self.watch_url(streamer_ref);

        let page = self.browser.new_page(&url).await?;

        if let Err(e) = page
            .enable_stealth_mode()
            .await
        {
            warn!(platform = %self.platform, "stealth mode unavailable: {}", e);
        }

        let navigated = timeout(NAVIGATION_TIMEOUT, page.wait_for_navigation()).await;
        if navigated.is_err() {
            let _ = page.close().await;
            return Err(StreamwatchError::TransientFetch("navigation timed out".to_string()));
        }

        let final_url = page.url().await.unwrap_or(None).unwrap_or_default();
        let page_title = page.get_title().await.unwrap_or(None).unwrap_or_default();
        if final_url.contains("404") || page_title.contains(self.selectors.not_found_title_fragment) {
            let _ = page.close().await;
            return Ok(StreamerRecord {
                platform: self.platform,
                platform_id: streamer_ref.clone(),
                display_name: streamer_ref.0.clone(),
                avatar_url: None,
                channel_url: url,
                status: StreamerStatus::NotFound,
                last_checked: now,
                error_details: None,
                cached_stream_url: None,
            });
        }

        let display_name = self
            .text_within(&page, self.selectors.display_name)
            .await
            .unwrap_or_else(|| streamer_ref.0.clone());
        let avatar_url = self.attr_within(&page, self.selectors.avatar, "src").await;
        let title = self.text_within(&page, self.selectors.title).await.unwrap_or_default();
        let is_live = self.text_within(&page, self.selectors.live_badge).await.is_some();
        let viewer_text = self.text_within(&page, self.selectors.viewer_count).await;
        let last_broadcast_text = self.text_within(&page, self.selectors.last_broadcast).await;

        let cached_stream_url = if is_live { self.observe_media_playlist_url(&page).await } else { None };

        let _ = page.close().await;

        let status = if is_live {
            StreamerStatus::Live {
                title,
                viewer_count: viewer_text.map(|t| parse_viewer_count(&t)).unwrap_or(0),
                started_at: now,
            }
        } else {
            StreamerStatus::Offline {
                last_broadcast_at: last_broadcast_text.and_then(|t| t.parse().ok()),
            }
        };

        Ok(StreamerRecord {
            platform: self.platform,
            platform_id: streamer_ref.clone(),
            display_name,
            avatar_url,
            channel_url: url,
            status,
            last_checked: now,
            error_details: None,
            cached_stream_url,
        })
    }
}

/// Selector set for the short-form video platform's channel/live page.
pub const TIKTOK_LIKE_SELECTORS: ScrapeSelectors = ScrapeSelectors {
    not_found_title_fragment: "Couldn't find this account",
    display_name: "[data-e2e='user-title']",
    avatar: "[data-e2e='user-avatar'] img",
    title: "[data-e2e='live-title']",
    live_badge: "[data-e2e='live-badge']",
    viewer_count: "[data-e2e='live-viewer-count']",
    last_broadcast: "[data-e2e='user-last-live']",
};

/// Selector set for the adult cam platform's channel page.
pub const CHATURBATE_LIKE_SELECTORS: ScrapeSelectors = ScrapeSelectors {
    not_found_title_fragment: "Room Not Found",
    display_name: ".room-username",
    avatar: ".room-avatar img",
    title: ".room-subject",
    live_badge: ".status-online",
    viewer_count: ".num-viewers",
    last_broadcast: ".last-broadcast",
};

/// Resource-blocking predicate for the page-load interceptor: block images/stylesheets/fonts
/// unless the request host looks like a media CDN, per §4.1 point 3.
pub fn should_block_resource(resource_type: &str, host: &str) -> bool {
    let blocked_type = BLOCKED_RESOURCE_TYPES.contains(&resource_type);
    let is_media_cdn = MEDIA_CDN_ALLOWLIST.iter().any(|needle| host.contains(needle));
    blocked_type && !is_media_cdn
}

#[async_trait]
impl PlatformAdapter for ScrapeAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn fetch(&self, streamer_ref: &StreamerRef) -> StreamerRecord {
        match self.scrape(streamer_ref).await {
            Ok(record) => record,
            Err(e) => {
                warn!(platform = %self.platform, streamer = %streamer_ref, "scrape failed: {}", e);
                StreamerRecord {
                    platform: self.platform,
                    platform_id: streamer_ref.clone(),
                    display_name: streamer_ref.0.clone(),
                    avatar_url: None,
                    channel_url: self.watch_url(streamer_ref),
                    status: StreamerStatus::Error { reason: e.to_string() },
                    last_checked: Utc::now(),
                    error_details: Some(e.to_string()),
                    cached_stream_url: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_non_media_images_but_allows_media_cdn() {
        assert!(should_block_resource("image", "ads.example.com"));
        assert!(!should_block_resource("image", "static-media-cdn.example.com"));
        assert!(!should_block_resource("script", "ads.example.com"));
    }
}
