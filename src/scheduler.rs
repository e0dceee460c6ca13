//! Periodic trigger (C3): the background cadences that keep the catalog fresh and the
//! filesystem/registry bounded without an external cron.
//!
//! Grounded on `browser_pool.rs`'s `start_health_check_task` (a `tokio::spawn`'d loop built on
//! `tokio::time::interval`, one tick source per concern) for the shape of each independent
//! cadence, and on the teacher's `MetricsCollector::start_collection` for spawning such loops as
//! detached background tasks off a shared `Arc`.

use crate::catalog::CatalogAggregator;
use crate::gc::GarbageCollector;
use chrono::Timelike;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const REFRESH_INTERVAL_DEFAULT: Duration = Duration::from_secs(60);
const STALL_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DISK_PRESSURE_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const MIDNIGHT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

pub struct Scheduler {
    catalog: Arc<CatalogAggregator>,
    gc: Arc<GarbageCollector>,
    refresh_interval: Duration,
}

impl Scheduler {
    pub fn new(catalog: Arc<CatalogAggregator>, gc: Arc<GarbageCollector>, refresh_interval: Duration) -> Self {
        Self { catalog, gc, refresh_interval }
    }

    /// Spawns the four independent cadences and performs one immediate catalog refresh before
    /// returning. Each cadence runs for the lifetime of the returned handles; dropping none of
    /// them stops anything, since each loop owns its own `Arc` clones — shutdown is handled by
    /// aborting these handles explicitly.
    pub async fn start(self: Arc<Self>) -> SchedulerHandles {
        if let Err(e) = self.catalog.refresh().await {
            warn!("startup catalog refresh failed: {}", e);
        }

        let refresh_handle = {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_refresh_loop().await })
        };
        let stall_handle = {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_stall_sweep_loop().await })
        };
        let midnight_handle = {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_daily_sweep_loop().await })
        };
        let disk_pressure_handle = {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_disk_pressure_sweep_loop().await })
        };

        SchedulerHandles {
            refresh: refresh_handle,
            stall_sweep: stall_handle,
            daily_sweep: midnight_handle,
            disk_pressure_sweep: disk_pressure_handle,
        }
    }

    /// Refreshes on a fixed interval. A still-running refresh causes the next tick to be
    /// dropped rather than overlapping: `in_flight` is a best-effort guard since `refresh()`
    /// does not itself hold a lock across the whole operation.
    async fn run_refresh_loop(&self) {
        let in_flight = Arc::new(AtomicBool::new(false));
        let mut interval = tokio::time::interval(self.refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate refresh already ran in `start`; skip straight to waiting for the tick.
        interval.tick().await;

        loop {
            interval.tick().await;
            if in_flight.swap(true, Ordering::SeqCst) {
                warn!("catalog refresh still running, dropping this tick");
                continue;
            }
            let catalog = self.catalog.clone();
            let in_flight = in_flight.clone();
            tokio::spawn(async move {
                if let Err(e) = catalog.refresh().await {
                    warn!("scheduled catalog refresh failed: {}", e);
                }
                in_flight.store(false, Ordering::SeqCst);
            });
        }
    }

    async fn run_stall_sweep_loop(&self) {
        let mut interval = tokio::time::interval(STALL_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let swept = self.gc.stall_sweep().await;
            if !swept.is_empty() {
                info!(count = swept.len(), "stall sweep force-errored jobs");
            }
        }
    }

    /// Polls once a minute for the local-midnight rollover rather than sleeping until midnight
    /// directly, so a system clock change or daylight-saving shift can't skip or double-fire
    /// the sweep.
    async fn run_daily_sweep_loop(&self) {
        let mut interval = tokio::time::interval(MIDNIGHT_CHECK_INTERVAL);
        let mut last_fired_day = chrono::Local::now().date_naive();
        loop {
            interval.tick().await;
            let now = chrono::Local::now();
            if now.hour() == 0 && now.minute() == 0 && now.date_naive() != last_fired_day {
                last_fired_day = now.date_naive();
                if let Err(e) = self.gc.daily_sweep().await {
                    warn!("daily sweep failed: {}", e);
                }
            }
        }
    }

    async fn run_disk_pressure_sweep_loop(&self) {
        let mut interval = tokio::time::interval(DISK_PRESSURE_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = self.gc.disk_pressure_sweep().await {
                warn!("disk pressure sweep failed: {}", e);
            }
        }
    }
}

/// Handles to the four spawned cadences, aborted together on shutdown.
pub struct SchedulerHandles {
    pub refresh: tokio::task::JoinHandle<()>,
    pub stall_sweep: tokio::task::JoinHandle<()>,
    pub daily_sweep: tokio::task::JoinHandle<()>,
    pub disk_pressure_sweep: tokio::task::JoinHandle<()>,
}

impl SchedulerHandles {
    pub fn abort_all(&self) {
        self.refresh.abort();
        self.stall_sweep.abort();
        self.daily_sweep.abort();
        self.disk_pressure_sweep.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, TestClock};
    use crate::events::EventBus;
    use crate::jobs::JobBroker;
    use crate::metrics::Metrics;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn test_catalog() -> Arc<CatalogAggregator> {
        Arc::new(CatalogAggregator::new(
            HashMap::new(),
            HashMap::new(),
            PathBuf::from("/tmp/streamwatch-scheduler-test-catalog.json"),
            EventBus::new(),
            Arc::new(Metrics::new()),
        ))
    }

    fn test_gc() -> Arc<GarbageCollector> {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new(chrono::Utc::now()));
        let jobs = Arc::new(JobBroker::new(EventBus::new(), clock.clone(), Arc::new(Metrics::new())));
        Arc::new(GarbageCollector::new(
            jobs,
            clock,
            PathBuf::from("/tmp/streamwatch-scheduler-test-clips"),
            PathBuf::from("/tmp/streamwatch-scheduler-test-thumbnails"),
            PathBuf::from("/tmp/streamwatch-scheduler-test-temp"),
            PathBuf::from("/tmp"),
        ))
    }

    #[tokio::test]
    async fn start_performs_immediate_refresh_before_first_tick() {
        let scheduler = Arc::new(Scheduler::new(test_catalog(), test_gc(), Duration::from_secs(3600)));
        let catalog = scheduler.catalog.clone();
        let handles = scheduler.start().await;
        let snapshot = catalog.current_snapshot().await;
        // An empty roster still produces a snapshot (zero records), proving refresh ran.
        assert!(snapshot.records.is_empty());
        handles.abort_all();
    }
}
