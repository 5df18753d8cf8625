//! # release-controller
//!
//! Level-driven controller that turns a stream of container image tags into
//! verified, published release payloads.
//!
//! The controller:
//!
//! - **Observes** tag changes in source image streams through watch-fed caches
//! - **Assembles** a release payload once a complete, consistent component set exists
//! - **Verifies** each payload by launching one job per configured task
//! - **Records** the folded verification outcome on the payload tag
//! - **Promotes** verified payloads to a separate publication stream, once
//!
//! ## Core Concepts
//!
//! - **Source stream**: image stream whose tags are component builds
//! - **Release stream**: image stream holding the payload tags this controller cuts
//! - **Payload**: a fingerprinted set of component references, identified by
//!   its tag name (`release-YYYYMMDD-N`)
//! - **Verification job**: one task run against one payload, deterministically named
//!
//! ## Guarantees
//!
//! - **Level-triggered**: every pass re-derives desired state from observed state
//! - **Idempotent**: a repeated pass over unchanged state writes nothing
//! - **At most one job** per payload and task, even under concurrent passes
//! - **Mirrored once**: a payload's mirror record is never rewritten or removed
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use release_controller::backend::memory::{InMemoryJobBackend, InMemoryRegistry};
//! use release_controller::config::{ControllerConfig, ReleaseDefinition};
//! use release_controller::controller::Controller;
//! use release_controller::model::ObjectKey;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> release_controller::error::Result<()> {
//! let config = ControllerConfig::new("ocp", "ci-jobs").with_release(
//!     ReleaseDefinition::new("stable", ObjectKey::new("ocp", "stable"))
//!         .with_required(["cli", "installer"])
//!         .with_task("install", "quay.io/ci/e2e:latest")
//!         .with_mirror("ocp-mirror", "stable"),
//! );
//!
//! let registry = Arc::new(InMemoryRegistry::new());
//! let jobs = Arc::new(InMemoryJobBackend::new());
//! let controller = Controller::new(config, registry, jobs)?;
//!
//! let shutdown = CancellationToken::new();
//! controller.run(3, shutdown).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod assembler;
pub mod backend;
pub mod cache;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod publisher;
pub mod queue;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::assembler::{Assessment, ReleaseAssembler};
    pub use crate::backend::{ImageRegistry, JobBackend, WatchEvent};
    pub use crate::cache::Store;
    pub use crate::config::{ControllerConfig, ReleaseDefinition};
    pub use crate::controller::{Controller, ReconcileOutcome, Reconciler};
    pub use crate::error::{Error, Result};
    pub use crate::model::{
        ComponentTag, ImageStream, Job, JobPhase, ObjectKey, PayloadPhase, ReleasePayload,
    };
    pub use crate::orchestrator::JobOrchestrator;
    pub use crate::publisher::{MirrorPublisher, PromoteOutcome};
    pub use crate::queue::WorkQueue;
}
