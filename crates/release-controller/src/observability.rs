//! Logging initialization and span helpers.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::model::ObjectKey;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// `default_filter` applies when `RUST_LOG` is unset. Safe to call multiple
/// times; subsequent calls are no-ops.
///
/// # Example
///
/// ```rust
/// use release_controller::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty, "info");
/// ```
pub fn init_logging(format: LogFormat, default_filter: &str) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Maps a `-v` count to a default filter directive.
#[must_use]
pub const fn filter_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "release_controller=debug,info",
        _ => "trace",
    }
}

/// Creates a span for one reconcile pass of a key.
///
/// # Example
///
/// ```rust
/// use release_controller::model::ObjectKey;
/// use release_controller::observability::reconcile_span;
///
/// let span = reconcile_span(&ObjectKey::new("ci", "stable"), 0);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn reconcile_span(key: &ObjectKey, attempt: u32) -> Span {
    tracing::info_span!(
        "reconcile",
        namespace = %key.namespace,
        name = %key.name,
        attempt = attempt,
    )
}

/// Creates a span for work on one payload.
#[must_use]
pub fn payload_span(payload: &str) -> Span {
    tracing::info_span!("payload", payload = payload)
}
