//! Command-line interface of the `release-controller` binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::observability::{LogFormat, filter_for_verbosity};

/// Level-driven release controller.
///
/// Watches source image streams, cuts release payloads from complete
/// component sets, verifies them with jobs and mirrors verified payloads.
#[derive(Debug, Parser)]
#[command(name = "release-controller")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Namespace holding release streams.
    #[arg(long, env = "RELEASE_NAMESPACE")]
    pub release_namespace: Option<String>,

    /// Namespace verification jobs are created in. May equal the release namespace.
    #[arg(long, env = "JOB_NAMESPACE")]
    pub job_namespace: Option<String>,

    /// JSON file with release definitions.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of reconcile workers.
    #[arg(long, default_value_t = 3)]
    pub workers: usize,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// JSON snapshot seeding the in-memory backends.
    #[arg(long)]
    pub seed: Option<PathBuf>,

    /// Address of the Prometheus metrics listener.
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Returns the default log filter for the requested verbosity.
    #[must_use]
    pub const fn log_filter(&self) -> &'static str {
        filter_for_verbosity(self.verbose)
    }

    /// Builds and validates the controller configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a namespace is missing, the release
    /// file cannot be loaded, or the result is inconsistent.
    pub fn controller_config(&self) -> Result<ControllerConfig> {
        let mut config = ControllerConfig::new(
            self.release_namespace.clone().unwrap_or_default(),
            self.job_namespace.clone().unwrap_or_default(),
        );
        config.workers = self.workers;
        if let Some(path) = &self.config {
            config.releases = ControllerConfig::load_releases(path)?;
        }
        config.validate()?;
        Ok(config)
    }
}
