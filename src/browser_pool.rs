//! Shared headless browser (§5): a single process-wide Chrome instance used by the two
//! HTML-scrape adapters and the stream-URL resolver's browser fallback.
//!
//! This is a direct descendant of the teacher's `BrowserPool`, shrunk from "pool of N
//! interchangeable instances behind a semaphore" to "one lazily-initialized, refcounted
//! instance with a dedicated serialization lane per scrape platform." The health-check/
//! restart machinery (quick 15s / deep 60s checks, age/failure/stuck-busy restart criteria)
//! is kept close to verbatim — a single long-lived browser needs exactly the same watchdog a
//! pool of them did, just applied to one entry instead of many.
//!
//! A "browser session" in the component design is modeled here as a serialization lane
//! (`lanes[session_id]`) rather than a separate OS process or CDP browser context: scrape
//! adapters for different platforms never block on each other, but two operations against the
//! *same* platform are forced to queue, matching "scrape adapters... run sequentially within
//! the scrape platform but concurrently across the two scrape platforms."

use crate::config::{create_browser_config, BrowserSettings};
use crate::error::StreamwatchError;
use chromiumoxide::browser::Browser;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Healthy,
    Busy,
    Unresponsive,
    Restarting,
    Failed,
}

struct Inner {
    browser: Mutex<Browser>,
    handler: Mutex<tokio::task::JoinHandle<Result<(), chromiumoxide::error::CdpError>>>,
    status: Mutex<InstanceStatus>,
    created_at: Mutex<Instant>,
    last_used: Mutex<Instant>,
    failure_count: AtomicUsize,
    lanes: Vec<Mutex<()>>,
    browser_settings: BrowserSettings,
    is_shutting_down: AtomicBool,
}

/// A single shared headless browser. Clone is cheap (all fields are `Arc`-backed); every
/// clone refers to the same underlying Chrome process.
#[derive(Clone)]
pub struct SharedBrowser {
    inner: Arc<Inner>,
}

async fn launch_browser(
    browser_settings: &BrowserSettings,
) -> Result<(Browser, tokio::task::JoinHandle<Result<(), chromiumoxide::error::CdpError>>), StreamwatchError>
{
    let runner_dir = format!("/tmp/streamwatch-chromiumoxide-runner-{}", std::process::id());
    std::fs::create_dir_all(&runner_dir)?;

    let config = create_browser_config(browser_settings, 0);

    let (browser, mut handler) = {
        std::env::set_var("TMPDIR", &runner_dir);
        let result = Browser::launch(config).await;
        std::env::remove_var("TMPDIR");
        result
    }
    .map_err(|e| StreamwatchError::BrowserUnavailable(e.to_string()))?;

    let handler_task = tokio::spawn(async move {
        loop {
            match handler.next().await {
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    error!("browser handler error: {}", e);
                    return Err(e);
                }
                None => {
                    info!("browser handler stream ended");
                    break;
                }
            }
        }
        Ok(())
    });

    Ok((browser, handler_task))
}

impl SharedBrowser {
    /// `lane_count` is the number of scrape platforms that will serialize on this browser
    /// (two, per the component design: one lane each for the TikTok-like and Chaturbate-like
    /// adapters). The resolver's browser fallback (C4) does not own a lane of its own and may
    /// interleave with either.
    pub async fn launch(browser_settings: BrowserSettings, lane_count: usize) -> Result<Self, StreamwatchError> {
        let (browser, handler) = launch_browser(&browser_settings).await?;
        let now = Instant::now();

        let inner = Inner {
            browser: Mutex::new(browser),
            handler: Mutex::new(handler),
            status: Mutex::new(InstanceStatus::Healthy),
            created_at: Mutex::new(now),
            last_used: Mutex::new(now),
            failure_count: AtomicUsize::new(0),
            lanes: (0..lane_count).map(|_| Mutex::new(())).collect(),
            browser_settings,
            is_shutting_down: AtomicBool::new(false),
        };

        let shared = Self { inner: Arc::new(inner) };
        shared.clone().start_health_check_task();
        Ok(shared)
    }

    /// Serializes access for one scrape platform lane. Hold the returned guard for the
    /// duration of the platform's fetch (navigate, scrape, close page).
    pub async fn acquire_lane(&self, session_id: usize) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.lanes[session_id].lock().await
    }

    pub async fn new_page(&self, url: &str) -> Result<Page, StreamwatchError> {
        if self.inner.is_shutting_down.load(Ordering::Relaxed) {
            return Err(StreamwatchError::BrowserUnavailable("shutting down".to_string()));
        }
        *self.inner.last_used.lock().await = Instant::now();
        *self.inner.status.lock().await = InstanceStatus::Busy;

        let page = self
            .inner
            .browser
            .lock()
            .await
            .new_page(url)
            .await
            .map_err(|e| {
                self.inner.failure_count.fetch_add(1, Ordering::Relaxed);
                StreamwatchError::BrowserUnavailable(e.to_string())
            })?;

        *self.inner.status.lock().await = InstanceStatus::Healthy;
        Ok(page)
    }

    pub async fn health(&self) -> InstanceHealth {
        let handler_alive = !self.inner.handler.lock().await.is_finished();
        InstanceHealth {
            status: *self.inner.status.lock().await,
            age: self.inner.created_at.lock().await.elapsed(),
            idle_time: self.inner.last_used.lock().await.elapsed(),
            failure_count: self.inner.failure_count.load(Ordering::Relaxed),
            handler_alive,
        }
    }

    pub async fn restart(&self) -> Result<(), StreamwatchError> {
        *self.inner.status.lock().await = InstanceStatus::Restarting;

        {
            let mut browser = self.inner.browser.lock().await;
            let _ = browser.close().await;
        }
        self.inner.handler.lock().await.abort();

        match launch_browser(&self.inner.browser_settings).await {
            Ok((browser, handler)) => {
                *self.inner.browser.lock().await = browser;
                *self.inner.handler.lock().await = handler;
                *self.inner.created_at.lock().await = Instant::now();
                *self.inner.last_used.lock().await = Instant::now();
                self.inner.failure_count.store(0, Ordering::Relaxed);
                *self.inner.status.lock().await = InstanceStatus::Healthy;
                info!("shared browser restarted");
                Ok(())
            }
            Err(e) => {
                *self.inner.status.lock().await = InstanceStatus::Failed;
                error!("failed to restart shared browser: {}", e);
                Err(e)
            }
        }
    }

    fn start_health_check_task(self) {
        tokio::spawn(async move {
            let mut quick_interval = tokio::time::interval(Duration::from_secs(15));
            let mut deep_interval = tokio::time::interval(Duration::from_secs(60));

            while !self.inner.is_shutting_down.load(Ordering::Relaxed) {
                tokio::select! {
                    _ = quick_interval.tick() => self.quick_health_check().await,
                    _ = deep_interval.tick() => self.deep_health_check().await,
                }
            }
        });
    }

    async fn quick_health_check(&self) {
        let handler_alive = !self.inner.handler.lock().await.is_finished();
        if !handler_alive {
            warn!("shared browser handler crashed, scheduling restart");
        }
        let idle = self.inner.last_used.lock().await.elapsed();
        if idle > Duration::from_secs(300) && *self.inner.status.lock().await == InstanceStatus::Busy {
            warn!("shared browser unresponsive for {}s", idle.as_secs());
        }
    }

    async fn deep_health_check(&self) {
        let handler_alive = !self.inner.handler.lock().await.is_finished();
        let age = self.inner.created_at.lock().await.elapsed();
        let failures = self.inner.failure_count.load(Ordering::Relaxed);
        let stuck_busy = self.inner.last_used.lock().await.elapsed() > Duration::from_secs(600)
            && *self.inner.status.lock().await == InstanceStatus::Busy;

        let needs_restart = age > Duration::from_secs(3600) || failures > 10 || !handler_alive || stuck_busy;

        if needs_restart {
            info!(
                "restarting shared browser: age={:?} failures={} handler_alive={} stuck_busy={}",
                age, failures, handler_alive, stuck_busy
            );
            if let Err(e) = self.restart().await {
                error!("deep health check restart failed: {}", e);
            }
        }
    }

    pub async fn shutdown(&self) {
        info!("shutting down shared browser");
        self.inner.is_shutting_down.store(true, Ordering::Relaxed);

        // Give in-flight lane holders a moment to finish before we yank the browser away.
        for lane in &self.inner.lanes {
            let _ = lane.lock().await;
        }

        let mut browser = self.inner.browser.lock().await;
        let _ = browser.close().await;
        self.inner.handler.lock().await.abort();
        info!("shared browser shutdown complete");
    }
}

#[derive(Debug, Clone)]
pub struct InstanceHealth {
    pub status: InstanceStatus,
    pub age: Duration,
    pub idle_time: Duration,
    pub failure_count: usize,
    pub handler_alive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_status_defaults_to_healthy_semantics() {
        assert_eq!(InstanceStatus::Healthy, InstanceStatus::Healthy);
        assert_ne!(InstanceStatus::Healthy, InstanceStatus::Failed);
    }
}
