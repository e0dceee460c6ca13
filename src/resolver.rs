//! Stream-URL resolver (C4): resolves a media-playlist URL for a live streamer, preferring a
//! catalog-cached URL before falling back to a browser-driven interception pass.
//!
//! Grounded on the teacher's `screenshot_service.rs::capture_screenshot` page-interaction
//! pattern (navigate, wait, evaluate) for driving the browser, generalized from "take a
//! screenshot of the rendered page" to "intercept the network response the page triggers."

use crate::browser_pool::SharedBrowser;
use crate::catalog::CatalogAggregator;
use crate::error::StreamwatchError;
use crate::models::{Platform, StreamerRef};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

const POST_READINESS_WAIT: Duration = Duration::from_secs(10);
const MEDIA_PLAYLIST_EXTENSION: &str = ".m3u8";

/// Builds the watch-page URL the browser fallback should navigate to for a given platform and
/// streamer. Adapters already know this mapping for scraping; the resolver needs it again for
/// non-scrape platforms whose watch page differs from their API base URL.
pub trait WatchPageResolver: Send + Sync {
    fn watch_url(&self, platform: Platform, streamer_ref: &StreamerRef) -> Option<String>;
}

/// Maps each non-scrape platform to the watch-page URL template the browser fallback
/// navigates to; scrape platforms resolve their own watch page in their adapter and never
/// reach this fallback in practice, but a mapping is accepted for them too so resolution
/// degrades to "no mapping" rather than panicking if one is ever requested.
pub struct ConfiguredWatchPages {
    bases: std::collections::HashMap<Platform, String>,
}

impl ConfiguredWatchPages {
    pub fn new(bases: std::collections::HashMap<Platform, String>) -> Self {
        Self { bases }
    }
}

impl WatchPageResolver for ConfiguredWatchPages {
    fn watch_url(&self, platform: Platform, streamer_ref: &StreamerRef) -> Option<String> {
        self.bases.get(&platform).map(|base| format!("{base}/{}", streamer_ref.0))
    }
}

pub struct StreamUrlResolver {
    catalog: Arc<CatalogAggregator>,
    browser: SharedBrowser,
    watch_pages: Arc<dyn WatchPageResolver>,
}

impl StreamUrlResolver {
    pub fn new(catalog: Arc<CatalogAggregator>, browser: SharedBrowser, watch_pages: Arc<dyn WatchPageResolver>) -> Self {
        Self { catalog, browser, watch_pages }
    }

    pub async fn resolve(&self, platform: Platform, streamer_ref: &StreamerRef) -> Result<String, StreamwatchError> {
        let snapshot = self.catalog.current_snapshot().await;
        if let Some(record) = snapshot.find(platform, streamer_ref) {
            if record.status.is_live() {
                if let Some(cached) = &record.cached_stream_url {
                    return Ok(cached.clone());
                }
            }
        }

        self.resolve_via_browser(platform, streamer_ref).await
    }

    async fn resolve_via_browser(&self, platform: Platform, streamer_ref: &StreamerRef) -> Result<String, StreamwatchError> {
        let Some(url) = self.watch_pages.watch_url(platform, streamer_ref) else {
            return Err(StreamwatchError::ResolveError("no watch page mapping for platform".to_string()));
        };

        // The resolver does not own a dedicated lane: it briefly borrows lane 0, which is
        // acceptable because resolution is a rare, short-lived operation compared to a full
        // scrape pass, and the scrape adapter for lane 0 is otherwise idle between poll ticks.
        let _lane = self.browser.acquire_lane(0).await;

        let page = self.browser.new_page(&url).await?;

        if let Err(e) = page.wait_for_navigation().await {
            let _ = page.close().await;
            return Err(StreamwatchError::ResolveError(format!("navigation failed: {e}")));
        }

        // Force the media-playlist request: seek to the start and play.
        let interaction = page.evaluate(
            "(() => { const v = document.querySelector('video'); if (v) { v.currentTime = 0; v.play(); } })()",
        );
        if let Err(e) = timeout(POST_READINESS_WAIT, interaction).await {
            warn!(platform = %platform, "video interaction timed out: {}", e);
        }

        let intercepted = timeout(POST_READINESS_WAIT, self.wait_for_media_playlist_request(&page)).await;
        let _ = page.close().await;

        match intercepted {
            Ok(Ok(Some(url))) => {
                info!(platform = %platform, streamer = %streamer_ref, "resolved media playlist url");
                Ok(url)
            }
            Ok(Ok(None)) | Err(_) => Err(StreamwatchError::ResolveError(
                "no media playlist url observed within budget".to_string(),
            )),
            Ok(Err(e)) => Err(StreamwatchError::ResolveError(e.to_string())),
        }
    }

    /// Polls the page's network log for the first response whose path contains the media
    /// playlist extension. The shared browser's CDP handler task is responsible for keeping the
    /// event stream advancing; this simply waits for a qualifying entry to appear.
    async fn wait_for_media_playlist_request(
        &self,
        page: &chromiumoxide::page::Page,
    ) -> Result<Option<String>, StreamwatchError> {
        let mut events = page
            .event_listener::<chromiumoxide::cdp::browser_protocol::network::EventResponseReceived>()
            .await
            .map_err(|e| StreamwatchError::ResolveError(e.to_string()))?;

        use futures::StreamExt;
        while let Some(event) = events.next().await {
            let url = event.response.url.clone();
            if url.contains(MEDIA_PLAYLIST_EXTENSION) {
                return Ok(Some(url));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticWatchPages;
    impl WatchPageResolver for StaticWatchPages {
        fn watch_url(&self, _platform: Platform, streamer_ref: &StreamerRef) -> Option<String> {
            Some(format!("https://example.invalid/{}", streamer_ref.0))
        }
    }

    #[test]
    fn watch_page_resolver_builds_expected_url() {
        let resolver = StaticWatchPages;
        let url = resolver.watch_url(Platform::KickLike, &StreamerRef::new("abc"));
        assert_eq!(url, Some("https://example.invalid/abc".to_string()));
    }

    #[test]
    fn configured_watch_pages_builds_url_for_mapped_platform() {
        let mut bases = std::collections::HashMap::new();
        bases.insert(Platform::KickLike, "https://kicklike.example/watch".to_string());
        let resolver = ConfiguredWatchPages::new(bases);
        let url = resolver.watch_url(Platform::KickLike, &StreamerRef::new("abc"));
        assert_eq!(url, Some("https://kicklike.example/watch/abc".to_string()));
    }

    #[test]
    fn configured_watch_pages_returns_none_for_unmapped_platform() {
        let resolver = ConfiguredWatchPages::new(std::collections::HashMap::new());
        assert_eq!(resolver.watch_url(Platform::KickLike, &StreamerRef::new("abc")), None);
    }
}
