//! Shared harness for controller integration tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use release_controller::backend::memory::{InMemoryJobBackend, InMemoryRegistry};
use release_controller::config::{ControllerConfig, ReleaseDefinition};
use release_controller::controller::{Controller, ReconcileOutcome};
use release_controller::error::Result;
use release_controller::model::{ComponentTag, ImageStream, ObjectKey};

pub const RELEASE_NS: &str = "ocp";
pub const JOB_NS: &str = "ci-jobs";
pub const MIRROR_NS: &str = "ocp-mirror";

/// Release reading `ocp/stable`, verified by two tasks, mirrored to `ocp-mirror/stable`.
pub fn stable_release() -> ReleaseDefinition {
    ReleaseDefinition::new("stable", source_key())
        .with_required(["cli", "installer", "machine-os"])
        .with_task("install", "quay.io/ci/e2e:latest")
        .with_task("upgrade", "quay.io/ci/e2e:latest")
        .with_mirror(MIRROR_NS, "stable")
}

pub fn source_key() -> ObjectKey {
    ObjectKey::new(RELEASE_NS, "stable")
}

pub fn config_with(release: ReleaseDefinition) -> ControllerConfig {
    ControllerConfig::new(RELEASE_NS, JOB_NS).with_release(release)
}

pub fn jan_first(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
}

/// Creates both backends with every namespace the default config touches.
pub fn backends() -> (Arc<InMemoryRegistry>, Arc<InMemoryJobBackend>) {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.create_namespace(RELEASE_NS);
    registry.create_namespace(MIRROR_NS);
    let jobs = Arc::new(InMemoryJobBackend::new());
    jobs.create_namespace(JOB_NS);
    (registry, jobs)
}

/// Publishes the three required components, as a build pipeline would.
pub fn push_components(registry: &InMemoryRegistry, cli_digest: &str) {
    let stream = ImageStream::new(RELEASE_NS, "stable")
        .with_tag(ComponentTag::new(
            "cli",
            format!("quay.io/ocp/cli@sha256:{cli_digest}"),
            jan_first(8),
        ))
        .with_tag(ComponentTag::new(
            "installer",
            "quay.io/ocp/installer@sha256:02",
            jan_first(9),
        ))
        .with_tag(ComponentTag::new(
            "machine-os",
            "quay.io/ocp/rhcos@sha256:03",
            jan_first(10),
        ));
    registry.upsert_image_stream(stream).unwrap();
}

/// Waits until `condition` holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// A controller with running informers and no workers, reconciled by hand.
pub struct Harness {
    pub registry: Arc<InMemoryRegistry>,
    pub jobs: Arc<InMemoryJobBackend>,
    pub controller: Controller,
    pub config: ControllerConfig,
    shutdown: CancellationToken,
    informers: Vec<JoinHandle<()>>,
}

impl Harness {
    pub async fn start(config: ControllerConfig) -> Self {
        let (registry, jobs) = backends();
        Self::start_with(config, registry, jobs).await
    }

    pub async fn start_with(
        config: ControllerConfig,
        registry: Arc<InMemoryRegistry>,
        jobs: Arc<InMemoryJobBackend>,
    ) -> Self {
        let mut controller =
            Controller::new(config.clone(), registry.clone(), jobs.clone()).unwrap();
        let shutdown = CancellationToken::new();
        let informers = controller.start_informers(&shutdown);
        assert!(controller.wait_for_sync(&shutdown).await);

        Self {
            registry,
            jobs,
            controller,
            config,
            shutdown,
            informers,
        }
    }

    /// Waits until the caches reflect every write made so far.
    pub async fn settle(&self) {
        let reconciler = self.controller.reconciler();
        let namespaces = self.config.image_stream_namespaces();
        wait_until(|| {
            namespaces.iter().all(|ns| {
                reconciler.streams().latest_version_in(ns) >= self.registry.resource_version_in(ns)
            }) && reconciler.jobs().latest_version_in(JOB_NS)
                >= self.jobs.resource_version_in(JOB_NS)
        })
        .await;
    }

    /// Settles, then runs one pass for the source key.
    pub async fn pass(&self) -> Result<ReconcileOutcome> {
        self.settle().await;
        self.controller.reconciler().reconcile(&source_key()).await
    }

    pub fn payload_tag(&self, name: &str) -> Option<ComponentTag> {
        self.registry
            .image_stream(RELEASE_NS, "release")
            .and_then(|stream| stream.tag(name).cloned())
    }

    pub fn writes(&self) -> [usize; 4] {
        [
            self.registry.calls("create_tag"),
            self.registry.calls("annotate_tag"),
            self.registry.calls("tag_image"),
            self.jobs.calls("create_job"),
        ]
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        for handle in self.informers {
            handle.await.unwrap();
        }
    }
}
