//! Platform adapters (C1): one `PlatformAdapter` per roster platform, polymorphic over three
//! capability shapes (API-JSON, API-OAuth, HTML-scrape) per the component design.
//!
//! Grounded on the teacher's `ScreenshotService`/`BrowserPool` split between "thing that talks
//! to the network" and "thing that owns the browser" — adapters here are the network/browser
//! talkers, built independently of the job broker and catalog aggregator that consume them.

pub mod api_json;
pub mod oauth;
pub mod scrape;

use crate::models::{Platform, StreamerRecord, StreamerRef};
use async_trait::async_trait;

/// Every adapter operation is infallible at this boundary: network/parse/selector failures are
/// absorbed into the returned record's `Error`/`error_details` fields rather than propagated,
/// per the error-handling design's propagation policy for C1.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    async fn fetch(&self, streamer_ref: &StreamerRef) -> StreamerRecord;

    /// Batch form used by the catalog aggregator's fan-out. The default sequentially awaits
    /// `fetch` for each ref; the OAuth adapter overrides this to chunk into the documented
    /// batch size and share one cached bearer token across the whole batch.
    async fn fetch_many(&self, streamer_refs: &[StreamerRef]) -> Vec<StreamerRecord> {
        let mut out = Vec::with_capacity(streamer_refs.len());
        for streamer_ref in streamer_refs {
            out.push(self.fetch(streamer_ref).await);
        }
        out
    }
}

/// Parses human-formatted viewer counts as they appear on the HTML-scrape platforms
/// ("1.2k", "3M", "842"): strip commas/whitespace, lowercase, scale by the `k`/`m` suffix, and
/// fall back to 0 on anything that doesn't parse.
pub fn parse_viewer_count(raw: &str) -> u32 {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect::<String>()
        .to_lowercase();

    if cleaned.is_empty() {
        return 0;
    }

    let (number_part, multiplier) = if let Some(stripped) = cleaned.strip_suffix('k') {
        (stripped, 1_000.0)
    } else if let Some(stripped) = cleaned.strip_suffix('m') {
        (stripped, 1_000_000.0)
    } else {
        (cleaned.as_str(), 1.0)
    };

    number_part
        .parse::<f64>()
        .map(|n| (n * multiplier).round() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_integers() {
        assert_eq!(parse_viewer_count("842"), 842);
        assert_eq!(parse_viewer_count("1,234"), 1234);
    }

    #[test]
    fn parses_k_and_m_suffixes() {
        assert_eq!(parse_viewer_count("1.2k"), 1200);
        assert_eq!(parse_viewer_count("3M"), 3_000_000);
        assert_eq!(parse_viewer_count("  2.5K "), 2500);
    }

    #[test]
    fn unparseable_input_is_zero() {
        assert_eq!(parse_viewer_count("live now"), 0);
        assert_eq!(parse_viewer_count(""), 0);
    }
}
