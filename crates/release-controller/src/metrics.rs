//! Observability metrics for the release controller.
//!
//! This module provides Prometheus-compatible metrics for monitoring
//! reconciliation. Metrics are designed to support:
//!
//! - **Alerting**: reconcile error rates and queue growth
//! - **Dashboards**: payload cuts, verification outcomes and promotions
//! - **Debugging**: correlating requeues with backend failures
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `release_controller_reconciles_total` | Counter | `result` | Reconcile passes by outcome |
//! | `release_controller_reconcile_duration_seconds` | Histogram | - | Reconcile pass duration |
//! | `release_controller_queue_depth` | Gauge | `queue` | Keys waiting in the work queue |
//! | `release_controller_watch_events_total` | Counter | `kind`, `event` | Changes applied to caches |
//! | `release_controller_payloads_cut_total` | Counter | `release` | Payload tags created |
//! | `release_controller_jobs_created_total` | Counter | `task` | Verification jobs created |
//! | `release_controller_payload_status_total` | Counter | `phase` | Status annotations written |
//! | `release_controller_promotions_total` | Counter | `result` | Mirror promotions by outcome |
//!
//! ## Integration
//!
//! Metrics are emitted through the `metrics` crate facade. The binary installs
//! a Prometheus recorder when `--metrics-addr` is set:
//!
//! ```rust,ignore
//! use metrics_exporter_prometheus::PrometheusBuilder;
//!
//! PrometheusBuilder::new()
//!     .with_http_listener(([0, 0, 0, 0], 9090))
//!     .install()?;
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Reconcile passes by outcome.
    pub const RECONCILES_TOTAL: &str = "release_controller_reconciles_total";
    /// Histogram: Reconcile pass duration in seconds.
    pub const RECONCILE_DURATION_SECONDS: &str = "release_controller_reconcile_duration_seconds";
    /// Gauge: Keys waiting in the work queue.
    pub const QUEUE_DEPTH: &str = "release_controller_queue_depth";
    /// Counter: Watch events applied to caches.
    pub const WATCH_EVENTS_TOTAL: &str = "release_controller_watch_events_total";
    /// Counter: Payload tags created.
    pub const PAYLOADS_CUT_TOTAL: &str = "release_controller_payloads_cut_total";
    /// Counter: Verification jobs created.
    pub const JOBS_CREATED_TOTAL: &str = "release_controller_jobs_created_total";
    /// Counter: Payload status annotations written.
    pub const PAYLOAD_STATUS_TOTAL: &str = "release_controller_payload_status_total";
    /// Counter: Mirror promotions by outcome.
    pub const PROMOTIONS_TOTAL: &str = "release_controller_promotions_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Outcome of an operation (success, requeue, error, promoted, ...).
    pub const RESULT: &str = "result";
    /// Queue name.
    pub const QUEUE: &str = "queue";
    /// Resource kind (imagestream, job).
    pub const KIND: &str = "kind";
    /// Watch event type (added, modified, deleted).
    pub const EVENT: &str = "event";
    /// Release definition name.
    pub const RELEASE: &str = "release";
    /// Verification task name.
    pub const TASK: &str = "task";
    /// Payload verification phase.
    pub const PHASE: &str = "phase";
}

/// High-level interface for recording controller metrics.
///
/// Cheap to clone and share across workers. Calls are no-ops until a
/// recorder is installed.
#[derive(Debug, Clone, Default)]
pub struct ControllerMetrics;

impl ControllerMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records the outcome of one reconcile pass.
    pub fn record_reconcile(&self, result: &str) {
        counter!(
            names::RECONCILES_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records reconcile pass duration.
    pub fn observe_reconcile_duration(&self, duration: Duration) {
        histogram!(names::RECONCILE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Sets the work queue depth.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        gauge!(
            names::QUEUE_DEPTH,
            labels::QUEUE => queue.to_string(),
        )
        .set(depth as f64);
    }

    /// Records a change applied to a cache.
    pub fn record_watch_event(&self, kind: &'static str, event: &'static str) {
        counter!(
            names::WATCH_EVENTS_TOTAL,
            labels::KIND => kind,
            labels::EVENT => event,
        )
        .increment(1);
    }

    /// Records a payload cut for a release.
    pub fn record_payload_cut(&self, release: &str) {
        counter!(
            names::PAYLOADS_CUT_TOTAL,
            labels::RELEASE => release.to_string(),
        )
        .increment(1);
    }

    /// Records a created verification job.
    pub fn record_job_created(&self, task: &str) {
        counter!(
            names::JOBS_CREATED_TOTAL,
            labels::TASK => task.to_string(),
        )
        .increment(1);
    }

    /// Records a payload status write.
    pub fn record_payload_status(&self, phase: &str) {
        counter!(
            names::PAYLOAD_STATUS_TOTAL,
            labels::PHASE => phase.to_string(),
        )
        .increment(1);
    }

    /// Records a promotion attempt outcome.
    pub fn record_promotion(&self, result: &str) {
        counter!(
            names::PROMOTIONS_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Starts timing a reconcile pass; the duration is recorded on drop.
    #[must_use]
    pub fn time_reconcile(&self) -> TimingGuard<impl FnOnce(Duration) + use<>> {
        let metrics = self.clone();
        TimingGuard::new(move |duration| metrics.observe_reconcile_duration(duration))
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
///
/// ## Example
///
/// ```rust
/// use release_controller::metrics::ControllerMetrics;
///
/// let metrics = ControllerMetrics::new();
/// {
///     let _guard = metrics.time_reconcile();
///     // Reconcile...
/// } // Duration recorded automatically on drop
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
