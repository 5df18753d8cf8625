//! The controller loop: watches, work queue, workers and per-key reconcile.
//!
//! ## Lifecycle
//!
//! 1. [`Controller::new`] builds one informer per watched namespace and kind
//!    and wires their changes to queue keys.
//! 2. [`Controller::run`] starts the informers, waits until every cache has
//!    synced, enqueues every configured release once and spawns the workers.
//! 3. Each worker loops `get → reconcile → done` until the queue shuts down.
//! 4. Cancelling the shutdown token stops the queue; workers finish their
//!    in-flight key and exit, then the informers stop.
//!
//! ## Per-key pass
//!
//! Keys are source image streams. A pass for a source first records a newly
//! cut payload (if the assembler asks for one), then walks every payload of
//! the release: reconcile jobs, write the folded status back onto the payload
//! tag, and promote on success. Every step compares observed state with
//! desired state and writes only the difference, so a repeated pass over
//! unchanged state writes nothing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::assembler::{Assessment, ReleaseAssembler};
use crate::backend::{ImageRegistry, ImageStreamSource, JobBackend, JobSource, WatchEvent};
use crate::cache::{Informer, ReadinessGate, Store};
use crate::config::{ControllerConfig, ReleaseDefinition};
use crate::error::{Error, Result};
use crate::metrics::ControllerMetrics;
use crate::model::{
    ComponentTag, ImageStream, Job, ObjectKey, PayloadPhase, ReleasePayload, Resource, annotations,
};
use crate::observability::{payload_span, reconcile_span};
use crate::orchestrator::{JobOrchestrator, Verification};
use crate::publisher::{MirrorPublisher, PromoteOutcome};
use crate::queue::WorkQueue;

/// Name of the controller's work queue.
const QUEUE_NAME: &str = "releases";

/// What one reconcile pass did for a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadReport {
    /// Payload tag name.
    pub payload: String,
    /// Folded verification phase.
    pub phase: PayloadPhase,
    /// Promotion outcome.
    pub promotion: PromoteOutcome,
}

/// What one reconcile pass did for a key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Payload recorded during this pass.
    pub cut: Option<String>,
    /// Per-payload results, oldest payload first.
    pub payloads: Vec<PayloadReport>,
    /// Requested delay before the key should be looked at again.
    pub requeue_after: Option<Duration>,
}

/// Reconciles one source stream key against observed state.
///
/// Cheap to clone; every worker holds its own clone.
#[derive(Clone)]
pub struct Reconciler {
    config: Arc<ControllerConfig>,
    registry: Arc<dyn ImageRegistry>,
    streams: Store<ImageStream>,
    jobs: Store<Job>,
    assembler: ReleaseAssembler,
    orchestrator: JobOrchestrator,
    publisher: MirrorPublisher,
    metrics: ControllerMetrics,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("release_namespace", &self.config.release_namespace)
            .field("job_namespace", &self.config.job_namespace)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler over the given caches and backends.
    #[must_use]
    pub fn new(
        config: Arc<ControllerConfig>,
        registry: Arc<dyn ImageRegistry>,
        job_backend: Arc<dyn JobBackend>,
        streams: Store<ImageStream>,
        jobs: Store<Job>,
        metrics: ControllerMetrics,
    ) -> Self {
        let assembler = ReleaseAssembler::new(config.release_namespace.clone(), streams.clone());
        let orchestrator = JobOrchestrator::new(
            config.job_namespace.clone(),
            jobs.clone(),
            job_backend,
            metrics.clone(),
        );
        let publisher = MirrorPublisher::new(registry.clone(), streams.clone(), metrics.clone());
        Self {
            config,
            registry,
            streams,
            jobs,
            assembler,
            orchestrator,
            publisher,
            metrics,
        }
    }

    /// Returns the image stream cache.
    #[must_use]
    pub fn streams(&self) -> &Store<ImageStream> {
        &self.streams
    }

    /// Returns the job cache.
    #[must_use]
    pub fn jobs(&self) -> &Store<Job> {
        &self.jobs
    }

    /// Runs one reconcile pass for a source stream key.
    ///
    /// Keys without a configured release are ignored.
    ///
    /// # Errors
    ///
    /// Returns the first error hit while writing. Every payload is still
    /// attempted; retryable errors mean the key should be requeued.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let Some(release) = self.config.release_for(key) else {
            debug!(%key, "no release reads from this stream");
            return Ok(ReconcileOutcome::default());
        };

        let mut outcome = ReconcileOutcome::default();
        let mut payloads = self.assembler.existing_payloads(release);

        match self.assembler.assess(release, Utc::now()) {
            Assessment::Cut(payload) => {
                self.record_payload(release, &payload).await?;
                outcome.cut = Some(payload.name.clone());
                if !payloads.iter().any(|existing| existing.name == payload.name) {
                    payloads.push(payload);
                }
            }
            Assessment::CoolingDown { retry_after } => {
                debug!(release = %release.name, ?retry_after, "cut deferred by cooldown");
                outcome.requeue_after = Some(retry_after);
            }
            other => debug!(release = %release.name, assessment = ?other, "no payload to cut"),
        }

        let mut first_error: Option<Error> = None;
        for payload in &payloads {
            match self
                .reconcile_payload(release, payload)
                .instrument(payload_span(&payload.name))
                .await
            {
                Ok(report) => outcome.payloads.push(report),
                Err(error) => {
                    warn!(payload = %payload, %error, "payload reconcile failed");
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(outcome),
        }
    }

    /// Records a newly cut payload as a tag in its release stream.
    ///
    /// A tag of the same name carrying the same fingerprint means an earlier
    /// pass already recorded it.
    ///
    /// # Errors
    ///
    /// Returns a conflict if the tag name is taken by different content, or
    /// a backend error.
    pub async fn record_payload(
        &self,
        release: &ReleaseDefinition,
        payload: &ReleasePayload,
    ) -> Result<()> {
        let tag = ComponentTag {
            name: payload.name.clone(),
            pull_spec: payload.pull_spec(),
            created_at: payload.created_at,
            annotations: payload.to_annotations()?,
        };

        match self
            .registry
            .create_tag(&payload.namespace, &payload.stream, tag)
            .await
        {
            Ok(()) => {
                self.metrics.record_payload_cut(&release.name);
                info!(
                    release = %release.name,
                    payload = %payload,
                    components = payload.components.len(),
                    "cut release payload"
                );
                Ok(())
            }
            Err(error) if error.is_already_exists() => {
                let existing = self
                    .registry
                    .get_image_stream(&payload.namespace, &payload.stream)
                    .await?
                    .and_then(|stream| stream.tag(&payload.name).cloned());
                let same = existing
                    .as_ref()
                    .and_then(|tag| tag.annotation(annotations::FINGERPRINT))
                    == Some(payload.fingerprint.as_str());
                if same {
                    debug!(payload = %payload, "payload already recorded");
                    Ok(())
                } else {
                    Err(Error::conflict(format!(
                        "payload tag {payload} exists with different content"
                    )))
                }
            }
            Err(error) => Err(error),
        }
    }

    async fn reconcile_payload(
        &self,
        release: &ReleaseDefinition,
        payload: &ReleasePayload,
    ) -> Result<PayloadReport> {
        let recorded = match self.cached_tag(payload).map(|tag| tag.job_refs()).transpose() {
            Ok(refs) => refs.unwrap_or_default(),
            Err(error) => {
                warn!(payload = %payload, %error, "ignoring unreadable job references");
                BTreeMap::new()
            }
        };

        // The phase is always folded from the jobs; the recorded phase only
        // decides whether a write-back is needed.
        let verification = self.orchestrator.reconcile(release, payload, &recorded).await?;
        self.sync_status(payload, &verification).await?;
        let phase = verification.phase;

        let promotion = self.publisher.promote_if_ready(release, payload, phase).await?;
        Ok(PayloadReport {
            payload: payload.name.clone(),
            phase,
            promotion,
        })
    }

    /// Writes the folded status onto the payload tag.
    ///
    /// Returns false when the cached annotations already match.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the annotation write fails.
    pub async fn sync_status(
        &self,
        payload: &ReleasePayload,
        verification: &Verification,
    ) -> Result<bool> {
        let mut desired = BTreeMap::new();
        desired.insert(annotations::PHASE.to_string(), verification.phase.to_string());
        desired.insert(annotations::MESSAGE.to_string(), verification.message());
        let refs = verification.job_refs();
        if !refs.is_empty() {
            desired.insert(annotations::JOBS.to_string(), serde_json::to_string(&refs)?);
        }

        let current = self.cached_tag(payload);
        let up_to_date = current.is_some_and(|tag| {
            desired
                .iter()
                .all(|(key, value)| tag.annotation(key) == Some(value.as_str()))
        });
        if up_to_date {
            return Ok(false);
        }

        self.registry
            .annotate_tag(&payload.namespace, &payload.stream, &payload.name, desired)
            .await?;
        self.metrics.record_payload_status(verification.phase.as_str());
        info!(
            payload = %payload,
            phase = %verification.phase,
            message = %verification.message(),
            "updated payload status"
        );
        Ok(true)
    }

    fn cached_tag(&self, payload: &ReleasePayload) -> Option<ComponentTag> {
        self.streams
            .get(&payload.namespace, &payload.stream)
            .and_then(|stream| stream.tag(&payload.name).cloned())
    }
}

/// Checks that every namespace the controller reads or writes exists.
///
/// # Errors
///
/// Returns a configuration error naming the first missing or unreachable
/// namespace.
pub async fn verify_namespaces(
    config: &ControllerConfig,
    registry: &dyn ImageRegistry,
    jobs: &dyn JobBackend,
) -> Result<()> {
    let check = |found: Result<bool>, role: &str, namespace: &str| match found {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::configuration(format!(
            "{role} namespace {namespace} does not exist"
        ))),
        Err(error) => Err(Error::configuration(format!(
            "unable to check {role} namespace {namespace}: {error}"
        ))),
    };

    check(
        registry.namespace_exists(&config.release_namespace).await,
        "release",
        &config.release_namespace,
    )?;
    check(
        jobs.namespace_exists(&config.job_namespace).await,
        "job",
        &config.job_namespace,
    )?;
    for release in &config.releases {
        check(
            registry.namespace_exists(&release.source.namespace).await,
            "source",
            &release.source.namespace,
        )?;
        if let Some(mirror) = &release.mirror {
            check(
                registry.namespace_exists(&mirror.namespace).await,
                "mirror",
                &mirror.namespace,
            )?;
        }
    }
    Ok(())
}

/// Level-driven release controller.
pub struct Controller {
    config: Arc<ControllerConfig>,
    reconciler: Reconciler,
    queue: WorkQueue<ObjectKey>,
    stream_informers: Vec<Informer<ImageStream>>,
    job_informers: Vec<Informer<Job>>,
    gate: ReadinessGate,
    metrics: ControllerMetrics,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("releases", &self.config.releases.len())
            .field("queue", &self.queue.len())
            .field("synced", &self.gate.is_synced())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Builds a controller and its informers.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(
        config: ControllerConfig,
        registry: Arc<dyn ImageRegistry>,
        job_backend: Arc<dyn JobBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let metrics = ControllerMetrics::new();
        let queue = WorkQueue::with_backoff(QUEUE_NAME, config.backoff);
        let streams = Store::new();
        let jobs = Store::new();
        let mut gate = ReadinessGate::new();

        let mut stream_informers = Vec::new();
        for namespace in config.image_stream_namespaces() {
            let mut informer = Informer::new(
                namespace,
                Arc::new(ImageStreamSource(registry.clone())),
                streams.clone(),
            );
            informer.add_handler(stream_handler(config.clone(), queue.clone(), metrics.clone()));
            gate.register(informer.sync_handle());
            stream_informers.push(informer);
        }

        let mut job_informer = Informer::new(
            config.job_namespace.clone(),
            Arc::new(JobSource(job_backend.clone())),
            jobs.clone(),
        );
        job_informer.add_handler(job_handler(config.clone(), queue.clone(), metrics.clone()));
        gate.register(job_informer.sync_handle());

        let reconciler = Reconciler::new(
            config.clone(),
            registry,
            job_backend,
            streams,
            jobs,
            metrics.clone(),
        );

        Ok(Self {
            config,
            reconciler,
            queue,
            stream_informers,
            job_informers: vec![job_informer],
            gate,
            metrics,
        })
    }

    /// Returns the reconciler.
    #[must_use]
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Returns the work queue.
    #[must_use]
    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Spawns every informer not yet started.
    pub fn start_informers(&mut self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for informer in self.stream_informers.drain(..) {
            handles.push(tokio::spawn(informer.run(shutdown.clone())));
        }
        for informer in self.job_informers.drain(..) {
            handles.push(tokio::spawn(informer.run(shutdown.clone())));
        }
        handles
    }

    /// Waits until every informer has synced.
    ///
    /// Returns false if `shutdown` fired first.
    pub async fn wait_for_sync(&self, shutdown: &CancellationToken) -> bool {
        self.gate.wait_for_sync(shutdown).await
    }

    /// Runs the controller with `workers` workers until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if an informer stops before its cache synced.
    pub async fn run(mut self, workers: usize, shutdown: CancellationToken) -> Result<()> {
        let informers = self.start_informers(&shutdown);

        if !self.wait_for_sync(&shutdown).await {
            if shutdown.is_cancelled() {
                info!("shutdown before caches synced");
                join_all(informers).await;
                return Ok(());
            }
            return Err(Error::backend("sync", "informer stopped before syncing"));
        }
        info!(workers, releases = self.config.releases.len(), "caches synced, starting workers");

        for release in &self.config.releases {
            self.queue.add(release.source.clone());
        }

        let handles: Vec<JoinHandle<()>> = (0..workers.max(1))
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    self.queue.clone(),
                    self.reconciler.clone(),
                    self.metrics.clone(),
                ))
            })
            .collect();

        shutdown.cancelled().await;
        info!("shutting down, waiting for in-flight reconciles");
        self.queue.shutdown();
        join_all(handles).await;
        join_all(informers).await;
        info!("controller stopped");
        Ok(())
    }
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(error) = handle.await {
            error!(%error, "task panicked");
        }
    }
}

/// Worker loop: processes keys until the queue shuts down.
async fn run_worker(
    id: usize,
    queue: WorkQueue<ObjectKey>,
    reconciler: Reconciler,
    metrics: ControllerMetrics,
) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        metrics.set_queue_depth(queue.name(), queue.len());
        let attempt = queue.num_requeues(&key);

        let result = {
            let _timer = metrics.time_reconcile();
            reconciler
                .reconcile(&key)
                .instrument(reconcile_span(&key, attempt))
                .await
        };

        match result {
            Ok(outcome) => {
                queue.forget(&key);
                metrics.record_reconcile("success");
                if let Some(delay) = outcome.requeue_after {
                    queue.add_after(key.clone(), delay);
                }
            }
            Err(error) if error.is_retryable() => {
                metrics.record_reconcile("requeue");
                warn!(%key, attempt, %error, "reconcile failed, requeueing with backoff");
                queue.add_rate_limited(key.clone());
            }
            Err(error) => {
                metrics.record_reconcile("error");
                error!(%key, %error, "reconcile failed, dropping key until next change");
                queue.forget(&key);
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}

/// Maps image stream changes to source keys.
///
/// A source stream enqueues itself; a release stream enqueues every release
/// writing into it.
fn stream_handler(
    config: Arc<ControllerConfig>,
    queue: WorkQueue<ObjectKey>,
    metrics: ControllerMetrics,
) -> Arc<dyn Fn(&WatchEvent<ImageStream>) + Send + Sync> {
    Arc::new(move |event| {
        metrics.record_watch_event(ImageStream::KIND, event.kind());
        let stream = event.object();
        let key = stream.key();
        if config.release_for(&key).is_some() {
            queue.add(key);
        }
        for release in config.releases_publishing_into(&stream.namespace, &stream.name) {
            queue.add(release.source.clone());
        }
    })
}

/// Maps job changes to the source key recorded on the job.
fn job_handler(
    config: Arc<ControllerConfig>,
    queue: WorkQueue<ObjectKey>,
    metrics: ControllerMetrics,
) -> Arc<dyn Fn(&WatchEvent<Job>) + Send + Sync> {
    Arc::new(move |event| {
        metrics.record_watch_event(Job::KIND, event.kind());
        if let Some(source) = event.object().source() {
            if config.release_for(&source).is_some() {
                queue.add(source);
            }
        }
    })
}
