//! Command-line interface (C12): subcommands for running the service, validating configuration
//! without starting it, and checking local health.
//!
//! Grounded on the teacher's `Cli`/`Commands` clap derive shape and `setup_logging`, narrowed
//! from the batch/single/server screenshot commands to this service's serve/validate-config/
//! health set.

use crate::config::CliOverrides;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "streamwatch")]
#[command(about = "Multi-platform live-stream aggregator and clipper")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the INI configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Force debug-level logging regardless of the configured log level.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the catalog aggregator, capture/clip/upload pipeline, and HTTP/WS surface.
    Serve {
        #[arg(long, help = "Server port")]
        port: Option<u16>,

        #[arg(long, help = "Shared-secret API key required on /api/*")]
        api_key: Option<String>,

        #[arg(long, help = "Catalog refresh interval in seconds")]
        refresh_interval: Option<u64>,

        #[arg(long, help = "Chrome executable path")]
        chrome_path: Option<String>,
    },

    /// Loads and validates configuration without starting the service.
    ValidateConfig,

    /// Launches the shared browser, reports its liveness plus disk and catalog staleness, and
    /// exits. Not a network health check against a running instance: this is the same local
    /// diagnostic a deployment's readiness probe would run before traffic is routed to it.
    Health,
}

impl Cli {
    pub fn overrides(&self) -> CliOverrides {
        let log_level = self.verbose.then(|| "debug".to_string());
        match &self.command {
            Commands::Serve { port, api_key, refresh_interval, chrome_path } => CliOverrides {
                port: *port,
                log_level,
                refresh_interval: *refresh_interval,
                api_key: api_key.clone(),
                chrome_path: chrome_path.clone(),
            },
            Commands::ValidateConfig | Commands::Health => CliOverrides {
                log_level,
                ..Default::default()
            },
        }
    }
}

pub fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_override_forces_debug_log_level() {
        let cli = Cli {
            command: Commands::ValidateConfig,
            config: None,
            verbose: true,
        };
        assert_eq!(cli.overrides().log_level, Some("debug".to_string()));
    }

    #[test]
    fn serve_overrides_carry_subcommand_flags() {
        let cli = Cli {
            command: Commands::Serve {
                port: Some(9090),
                api_key: Some("secret".to_string()),
                refresh_interval: Some(30),
                chrome_path: None,
            },
            config: None,
            verbose: false,
        };
        let overrides = cli.overrides();
        assert_eq!(overrides.port, Some(9090));
        assert_eq!(overrides.api_key, Some("secret".to_string()));
        assert_eq!(overrides.refresh_interval, Some(30));
    }
}
