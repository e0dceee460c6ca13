use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use streamwatch_core::adapters::api_json::ApiJsonAdapter;
use streamwatch_core::adapters::oauth::OAuthAdapter;
use streamwatch_core::adapters::scrape::{ScrapeAdapter, CHATURBATE_LIKE_SELECTORS, TIKTOK_LIKE_SELECTORS};
use streamwatch_core::adapters::PlatformAdapter;
use streamwatch_core::browser_pool::SharedBrowser;
use streamwatch_core::capture::CaptureWorker;
use streamwatch_core::catalog::{build_roster, catalog_path, CatalogAggregator};
use streamwatch_core::clipper::ClipExtractor;
use streamwatch_core::clock::{Clock, SystemClock};
use streamwatch_core::cli::{setup_logging, Cli, Commands};
use streamwatch_core::config::{load_config, validate_config, AppConfig};
use streamwatch_core::events::EventBus;
use streamwatch_core::gc::GarbageCollector;
use streamwatch_core::health::{HealthLevel, HealthReport};
use streamwatch_core::jobs::JobBroker;
use streamwatch_core::metrics::{Metrics, PrometheusExporter};
use streamwatch_core::models::Platform;
use streamwatch_core::pipeline::JobRunner;
use streamwatch_core::resolver::{ConfiguredWatchPages, StreamUrlResolver, WatchPageResolver};
use streamwatch_core::scheduler::Scheduler;
use streamwatch_core::server::{self, AppState};
use streamwatch_core::uploader::Uploader;
use tokio::signal;
use tracing::{error, info};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const SCRAPE_LANE_COUNT: usize = 2;
const TWITCH_LIKE_TOKEN_URL: &str = "https://id.twitchlike.example/oauth2/token";
const DEFAULT_USER_AGENT: &str = "streamwatch/0.1";
const TRANSCODER_PATH: &str = "ffmpeg";

/// The watch-page/API base URL for every platform style. Configuration (`AppConfig`) only
/// carries roster entries and, for the OAuth platform, credentials: the upstream hosts
/// themselves are part of this deployment's platform wiring rather than something an
/// operator's INI file would vary per install, so they live here alongside the OAuth token
/// endpoint instead of in `AppConfig`.
struct PlatformEndpoints {
    api_base: &'static str,
    watch_base: &'static str,
}

fn platform_endpoints(platform: Platform) -> PlatformEndpoints {
    match platform {
        Platform::KickLike => PlatformEndpoints {
            api_base: "https://kicklike.example/api/v2/channels",
            watch_base: "https://kicklike.example/watch",
        },
        Platform::YouTubeLike => PlatformEndpoints {
            api_base: "https://youtubelike.example/api/v1/channels",
            watch_base: "https://youtubelike.example/watch",
        },
        Platform::TwitchLike => PlatformEndpoints {
            api_base: "https://api.twitchlike.example/helix",
            watch_base: "https://twitchlike.example/watch",
        },
        Platform::RumbleLike => PlatformEndpoints {
            api_base: "https://rumblelike.example/api/v1/channels",
            watch_base: "https://rumblelike.example/watch",
        },
        Platform::TikTokLike => PlatformEndpoints {
            api_base: "",
            watch_base: "https://tiktoklike.example/@",
        },
        Platform::ChaturbateLike => PlatformEndpoints {
            api_base: "",
            watch_base: "https://chaturbatelike.example",
        },
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();
    let overrides = args.overrides();
    let config = load_config(args.config.as_deref(), &overrides)?;

    setup_logging(&config.log_level);
    info!("starting streamwatch v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Commands::ValidateConfig => {
            validate_config(&config)?;
            println!("configuration is valid");
            println!("  enabled platforms: {:?}", config.enabled_platforms);
            println!("  server: {}:{}", config.server.bind, config.server.port);
            println!("  metrics port: {}", config.server.metrics_port);
            println!("  data dir: {}", config.data_dir.display());
            Ok(())
        }
        Commands::Health => run_health_check(&config).await,
        Commands::Serve { .. } => run_serve(config).await,
    }
}

async fn run_health_check(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    validate_config(config)?;

    let browser = SharedBrowser::launch(config.browser.clone(), SCRAPE_LANE_COUNT).await?;
    let report = HealthReport::collect(&browser, &catalog_path(&config.data_dir), config.refresh_interval).await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    browser.shutdown().await;

    if report.status == HealthLevel::Critical {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_serve(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    validate_config(&config)?;

    let data_dir = config.data_dir.clone();
    let clips_dir = data_dir.join("clips");
    let thumbnails_dir = data_dir.join("thumbnails");
    let temp_dir = data_dir.join("temp");
    for dir in [&data_dir, &clips_dir, &thumbnails_dir, &temp_dir] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let events = EventBus::new();
    let metrics = Arc::new(Metrics::new());
    let exporter = PrometheusExporter::new(config.server.metrics_port);
    if let Err(e) = exporter.start().await {
        error!("failed to start prometheus exporter: {}", e);
    }
    let jobs = Arc::new(JobBroker::new(events.clone(), clock.clone(), metrics.clone()));

    let browser = SharedBrowser::launch(config.browser.clone(), SCRAPE_LANE_COUNT).await?;

    let mut adapters: HashMap<Platform, Arc<dyn PlatformAdapter>> = HashMap::new();
    let mut watch_pages = HashMap::new();
    let mut scrape_lane = 0usize;

    for platform in &config.enabled_platforms {
        let platform = *platform;
        let endpoints = platform_endpoints(platform);
        watch_pages.insert(platform, endpoints.watch_base.to_string());

        let adapter: Arc<dyn PlatformAdapter> = match platform {
            Platform::TwitchLike => {
                let Some(credentials) = config.oauth.get(&platform).cloned() else {
                    return Err(format!("{platform} is enabled but has no oauth credentials").into());
                };
                Arc::new(OAuthAdapter::new(endpoints.api_base, TWITCH_LIKE_TOKEN_URL, credentials))
            }
            Platform::TikTokLike => {
                let lane = scrape_lane;
                scrape_lane += 1;
                Arc::new(ScrapeAdapter::new(platform, lane, browser.clone(), endpoints.watch_base, TIKTOK_LIKE_SELECTORS))
            }
            Platform::ChaturbateLike => {
                let lane = scrape_lane;
                scrape_lane += 1;
                Arc::new(ScrapeAdapter::new(
                    platform,
                    lane,
                    browser.clone(),
                    endpoints.watch_base,
                    CHATURBATE_LIKE_SELECTORS,
                ))
            }
            Platform::KickLike | Platform::YouTubeLike | Platform::RumbleLike => {
                Arc::new(ApiJsonAdapter::new(platform, endpoints.api_base, DEFAULT_USER_AGENT))
            }
        };
        adapters.insert(platform, adapter);
    }

    let roster = build_roster(&config);
    let catalog = Arc::new(CatalogAggregator::new(
        adapters,
        roster,
        catalog_path(&data_dir),
        events.clone(),
        metrics.clone(),
    ));
    if let Err(e) = catalog.load_persisted().await {
        error!("failed to load persisted catalog: {}", e);
    }

    let watch_pages: Arc<dyn WatchPageResolver> = Arc::new(ConfiguredWatchPages::new(watch_pages));
    let resolver = Arc::new(StreamUrlResolver::new(catalog.clone(), browser.clone(), watch_pages));

    let capture = Arc::new(CaptureWorker::new(
        jobs.clone(),
        resolver,
        TRANSCODER_PATH,
        temp_dir.clone(),
        metrics.clone(),
    ));
    let clipper = Arc::new(ClipExtractor::new(
        jobs.clone(),
        TRANSCODER_PATH,
        clips_dir.clone(),
        thumbnails_dir.clone(),
        temp_dir.clone(),
        config.limits.max_clip_duration.as_secs(),
        metrics.clone(),
    ));
    let upload_endpoint = config.upload_endpoint.clone().unwrap_or_default();
    let uploader = Arc::new(Uploader::new(jobs.clone(), upload_endpoint, metrics.clone()));
    let runner = Arc::new(JobRunner::new(jobs.clone(), capture, clipper, uploader));

    let gc = Arc::new(GarbageCollector::new(
        jobs.clone(),
        clock,
        clips_dir.clone(),
        thumbnails_dir.clone(),
        temp_dir.clone(),
        data_dir.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(catalog.clone(), gc, config.refresh_interval));
    let scheduler_handles = scheduler.start().await;

    let state = AppState {
        catalog,
        jobs,
        runner: runner.clone(),
        events,
        config: Arc::new(config.clone()),
        clips_dir,
        thumbnails_dir,
    };
    let app = server::create_router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "listening");

    let server_task = tokio::spawn(async move { axum::serve(listener, app).await.map_err(|e| e.to_string()) });

    tokio::select! {
        result = server_task => {
            if let Ok(Err(e)) = result {
                error!("server task failed: {}", e);
            }
        }
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    info!("shutting down");
    scheduler_handles.abort_all();
    runner.shutdown(SHUTDOWN_GRACE).await;
    browser.shutdown().await;

    info!("streamwatch stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigint =
        signal::unix::signal(signal::unix::SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm =
        signal::unix::signal(signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
