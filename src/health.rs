//! Health aggregation (C12): combines shared-browser liveness, disk pressure, and catalog
//! staleness into one overall level.
//!
//! Grounded on the teacher's `SystemHealthChecker` (`health.rs`): check each subsystem
//! independently, then take the worst of the independent verdicts. Subsystems here are the
//! ones this service actually has (one shared browser, one catalog file, one data directory)
//! rather than a pool of browser instances and a request queue.

use crate::browser_pool::{InstanceStatus, SharedBrowser};
use crate::utils::disk_usage_fraction;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

const DISK_WARNING_THRESHOLD: f64 = 0.85;
const DISK_CRITICAL_THRESHOLD: f64 = 0.95;
/// A catalog snapshot is considered stale once it hasn't been written in this many multiples
/// of the configured refresh interval — long enough to tolerate one dropped/overlapping tick.
const STALE_INTERVAL_MULTIPLIER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

impl HealthLevel {
    fn worst(self, other: HealthLevel) -> HealthLevel {
        use HealthLevel::*;
        match (self, other) {
            (Critical, _) | (_, Critical) => Critical,
            (Warning, _) | (_, Warning) => Warning,
            _ => Healthy,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthLevel,
    pub browser: HealthLevel,
    pub disk: HealthLevel,
    pub catalog: HealthLevel,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub async fn collect(browser: &SharedBrowser, catalog_path: &Path, refresh_interval: Duration) -> Self {
        let browser_level = Self::browser_level(browser).await;
        let disk_level = Self::disk_level(catalog_path);
        let catalog_level = Self::catalog_level(catalog_path, refresh_interval);

        let status = browser_level.worst(disk_level).worst(catalog_level);
        HealthReport {
            status,
            browser: browser_level,
            disk: disk_level,
            catalog: catalog_level,
            checked_at: Utc::now(),
        }
    }

    async fn browser_level(browser: &SharedBrowser) -> HealthLevel {
        let health = browser.health().await;
        if !health.handler_alive || health.status == InstanceStatus::Failed {
            HealthLevel::Critical
        } else if health.failure_count > 5 || health.status == InstanceStatus::Unresponsive {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    fn disk_level(data_path: &Path) -> HealthLevel {
        let root = data_path.parent().unwrap_or(data_path);
        let fraction = disk_usage_fraction(root);
        if fraction >= DISK_CRITICAL_THRESHOLD {
            HealthLevel::Critical
        } else if fraction >= DISK_WARNING_THRESHOLD {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    fn catalog_level(catalog_path: &Path, refresh_interval: Duration) -> HealthLevel {
        let Ok(metadata) = std::fs::metadata(catalog_path) else {
            // No catalog yet (e.g. first boot before the startup refresh has landed) is not
            // itself unhealthy; the scheduler's immediate refresh is responsible for producing
            // one, and the stall/daily sweeps cover the rest of the lifecycle.
            return HealthLevel::Healthy;
        };
        let Ok(modified) = metadata.modified() else {
            return HealthLevel::Healthy;
        };
        let age = modified.elapsed().unwrap_or_default();
        let stale_threshold = refresh_interval * STALE_INTERVAL_MULTIPLIER;
        if age > stale_threshold * 2 {
            HealthLevel::Critical
        } else if age > stale_threshold {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_prefers_critical_over_warning_over_healthy() {
        assert_eq!(HealthLevel::Healthy.worst(HealthLevel::Warning), HealthLevel::Warning);
        assert_eq!(HealthLevel::Warning.worst(HealthLevel::Critical), HealthLevel::Critical);
        assert_eq!(HealthLevel::Healthy.worst(HealthLevel::Healthy), HealthLevel::Healthy);
    }

    #[test]
    fn catalog_level_is_healthy_when_file_missing() {
        let level = HealthReport::catalog_level(
            Path::new("/tmp/streamwatch-health-test-missing.json"),
            Duration::from_secs(60),
        );
        assert_eq!(level, HealthLevel::Healthy);
    }

    #[test]
    fn disk_level_is_within_known_variants() {
        let level = HealthReport::disk_level(Path::new("/tmp"));
        assert!(matches!(level, HealthLevel::Healthy | HealthLevel::Warning | HealthLevel::Critical));
    }
}
