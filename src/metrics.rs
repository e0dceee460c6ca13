//! Metrics instrumentation (C12): counters/gauges/histograms for the catalog refresh cycle and
//! the capture/clip/upload pipeline, exported over Prometheus.
//!
//! Grounded on the teacher's `Metrics` struct (noop-initialized `metrics` crate handles, one
//! field per thing worth counting) and `PrometheusExporter`, generalized from screenshot
//! counters to this service's refresh/job/stage counters.

use metrics::{Counter, Gauge, Histogram};
use std::time::Duration;
use tracing::info;

pub struct Metrics {
    pub catalog_refreshes: Counter,
    pub catalog_refresh_failures: Counter,
    pub catalog_refresh_duration: Histogram,
    pub live_streamer_count: Gauge,
    pub jobs_created: Counter,
    pub jobs_failed: Counter,
    pub jobs_stalled: Counter,
    pub jobs_in_flight: Gauge,
    pub capture_duration: Histogram,
    pub clip_duration: Histogram,
    pub upload_duration: Histogram,
    pub upload_failures: Counter,
    pub browser_restarts: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            catalog_refreshes: Counter::noop(),
            catalog_refresh_failures: Counter::noop(),
            catalog_refresh_duration: Histogram::noop(),
            live_streamer_count: Gauge::noop(),
            jobs_created: Counter::noop(),
            jobs_failed: Counter::noop(),
            jobs_stalled: Counter::noop(),
            jobs_in_flight: Gauge::noop(),
            capture_duration: Histogram::noop(),
            clip_duration: Histogram::noop(),
            upload_duration: Histogram::noop(),
            upload_failures: Counter::noop(),
            browser_restarts: Counter::noop(),
        }
    }

    pub fn record_catalog_refresh(&self, duration: Duration, success: bool) {
        if success {
            self.catalog_refreshes.increment(1);
        } else {
            self.catalog_refresh_failures.increment(1);
        }
        self.catalog_refresh_duration.record(duration.as_secs_f64());
    }

    pub fn set_live_streamer_count(&self, count: usize) {
        self.live_streamer_count.set(count as f64);
    }

    pub fn record_job_created(&self) {
        self.jobs_created.increment(1);
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed.increment(1);
    }

    pub fn record_jobs_stalled(&self, count: usize) {
        self.jobs_stalled.increment(count as u64);
    }

    pub fn set_jobs_in_flight(&self, count: usize) {
        self.jobs_in_flight.set(count as f64);
    }

    pub fn record_capture_duration(&self, duration: Duration) {
        self.capture_duration.record(duration.as_secs_f64());
    }

    pub fn record_clip_duration(&self, duration: Duration) {
        self.clip_duration.record(duration.as_secs_f64());
    }

    pub fn record_upload(&self, duration: Duration, success: bool) {
        if !success {
            self.upload_failures.increment(1);
        }
        self.upload_duration.record(duration.as_secs_f64());
    }

    pub fn record_browser_restart(&self) {
        self.browser_restarts.increment(1);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder and serves `/metrics` on its own port, independent of the
/// main HTTP/WS surface so metrics scraping never competes with API traffic for the same
/// listener's backlog.
pub struct PrometheusExporter {
    port: u16,
}

impl PrometheusExporter {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error>> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], self.port));
        builder.install()?;
        info!(port = self.port, "prometheus metrics exporter listening");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_metrics_record_without_panicking() {
        let metrics = Metrics::new();
        metrics.record_catalog_refresh(Duration::from_millis(10), true);
        metrics.set_live_streamer_count(3);
        metrics.record_job_created();
        metrics.record_jobs_stalled(2);
        metrics.set_jobs_in_flight(1);
        metrics.record_capture_duration(Duration::from_secs(5));
        metrics.record_clip_duration(Duration::from_secs(1));
        metrics.record_upload(Duration::from_millis(500), false);
        metrics.record_browser_restart();
    }
}
