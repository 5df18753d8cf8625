//! In-memory registry and job backends.
//!
//! This module provides [`InMemoryRegistry`] and [`InMemoryJobBackend`],
//! implementations of the [`ImageRegistry`] and [`JobBackend`] traits suitable
//! for testing and for running the controller locally from a [`Snapshot`].
//!
//! ## Limitations
//!
//! - **NOT a real backend**: no persistence, no distribution
//! - **Jobs never run**: phases only change through [`InMemoryJobBackend::set_job_phase`]
//! - **Watches are lossy under load**: a slow subscriber sees `Lagged` and must relist
//!
//! Both backends count calls per operation and can be told to fail the next
//! calls of an operation, which tests use to exercise transient errors.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use super::{ImageRegistry, JobBackend, ObjectList, TagOutcome, WatchEvent, WatchReceiver};
use crate::error::{Error, Result};
use crate::model::{ComponentTag, ImageStream, Job, JobPhase, ObjectKey};

/// Capacity of each namespace's watch channel.
const WATCH_CAPACITY: usize = 1024;

/// Converts a lock poison error to a backend error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::backend("lock", "in-memory backend lock poisoned")
}

/// Per-namespace broadcast channels feeding watch subscriptions.
#[derive(Debug)]
struct WatchHub<T> {
    senders: Mutex<HashMap<String, broadcast::Sender<WatchEvent<T>>>>,
}

impl<T: Clone> WatchHub<T> {
    fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn subscribe(&self, namespace: &str) -> WatchReceiver<T> {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders
            .entry(namespace.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CAPACITY).0)
            .subscribe()
    }

    fn publish(&self, namespace: &str, event: WatchEvent<T>) {
        let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = senders.get(namespace) {
            // No receivers is fine: nobody is watching this namespace.
            let _ = sender.send(event);
        }
    }
}

/// Call counters and injected failures shared by both backends.
#[derive(Debug, Default)]
struct Instrumentation {
    calls: Mutex<HashMap<String, usize>>,
    failures: Mutex<HashMap<String, u32>>,
}

impl Instrumentation {
    /// Records a call and returns the injected failure for it, if any.
    fn enter(&self, operation: &str) -> Result<()> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(operation.to_string())
            .or_default() += 1;

        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(remaining) = failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::backend(operation, "injected transient failure"));
            }
        }
        Ok(())
    }

    fn calls(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    fn fail_next(&self, operation: &str, times: u32) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation.to_string(), times);
    }
}

/// Serializable backend contents used to seed local runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Namespaces that exist in both backends.
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Image streams to create.
    #[serde(default)]
    pub image_streams: Vec<ImageStream>,
    /// Jobs to create, with their phases.
    #[serde(default)]
    pub jobs: Vec<Job>,
}

impl Snapshot {
    /// Loads a snapshot from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("unable to read seed {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::configuration(format!("unable to parse seed {}: {e}", path.display()))
        })
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    namespaces: BTreeSet<String>,
    streams: BTreeMap<ObjectKey, ImageStream>,
    /// Highest resource version written per namespace.
    versions: HashMap<String, u64>,
    next_version: u64,
}

impl RegistryState {
    fn bump(&mut self, namespace: &str) -> u64 {
        self.next_version += 1;
        self.versions
            .insert(namespace.to_string(), self.next_version);
        self.next_version
    }

    fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        if self.namespaces.contains(namespace) {
            Ok(())
        } else {
            Err(Error::not_found("namespace", namespace))
        }
    }
}

/// In-memory image registry.
///
/// ## Example
///
/// ```rust
/// use release_controller::backend::memory::InMemoryRegistry;
///
/// let registry = InMemoryRegistry::new();
/// registry.create_namespace("ci");
/// ```
#[derive(Debug)]
pub struct InMemoryRegistry {
    state: RwLock<RegistryState>,
    watchers: WatchHub<ImageStream>,
    instrumentation: Instrumentation,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    /// Creates an empty registry with no namespaces.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            watchers: WatchHub::new(),
            instrumentation: Instrumentation::default(),
        }
    }

    /// Creates a registry populated from a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a stream refers to a namespace the snapshot does
    /// not declare.
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self> {
        let registry = Self::new();
        for namespace in &snapshot.namespaces {
            registry.create_namespace(namespace);
        }
        for stream in &snapshot.image_streams {
            registry.upsert_image_stream(stream.clone())?;
        }
        Ok(registry)
    }

    /// Creates a namespace. Existing namespaces are left untouched.
    pub fn create_namespace(&self, namespace: &str) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.namespaces.insert(namespace.to_string());
    }

    /// Creates or replaces a whole stream, as an external build pipeline would.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the namespace does not exist.
    pub fn upsert_image_stream(&self, mut stream: ImageStream) -> Result<ImageStream> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.ensure_namespace(&stream.namespace)?;

        let key = ObjectKey::new(&stream.namespace, &stream.name);
        stream.resource_version = state.bump(&stream.namespace);
        let existed = state.streams.insert(key, stream.clone()).is_some();
        let event = if existed {
            WatchEvent::Modified(stream.clone())
        } else {
            WatchEvent::Added(stream.clone())
        };
        self.watchers.publish(&stream.namespace, event);
        drop(state);

        Ok(stream)
    }

    /// Pushes a tag into a stream, replacing any tag with the same name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the namespace does not exist.
    pub fn push_tag(&self, namespace: &str, stream: &str, tag: ComponentTag) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.ensure_namespace(namespace)?;

        let key = ObjectKey::new(namespace, stream);
        let existed = state.streams.contains_key(&key);
        let version = state.bump(namespace);
        let entry = state
            .streams
            .entry(key)
            .or_insert_with(|| ImageStream::new(namespace, stream));
        entry.tags.retain(|existing| existing.name != tag.name);
        entry.tags.push(tag);
        entry.resource_version = version;

        let event = if existed {
            WatchEvent::Modified(entry.clone())
        } else {
            WatchEvent::Added(entry.clone())
        };
        self.watchers.publish(namespace, event);
        drop(state);
        Ok(())
    }

    /// Deletes a stream.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the stream does not exist.
    pub fn delete_image_stream(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(mut stream) = state.streams.remove(&ObjectKey::new(namespace, name)) else {
            return Err(Error::not_found("imagestream", format!("{namespace}/{name}")));
        };
        stream.resource_version = state.bump(namespace);
        self.watchers.publish(namespace, WatchEvent::Deleted(stream));
        drop(state);
        Ok(())
    }

    /// Returns a stream without going through the instrumented trait.
    #[must_use]
    pub fn image_stream(&self, namespace: &str, name: &str) -> Option<ImageStream> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.streams.get(&ObjectKey::new(namespace, name)).cloned()
    }

    /// Returns the highest resource version written in a namespace.
    #[must_use]
    pub fn resource_version_in(&self, namespace: &str) -> u64 {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.versions.get(namespace).copied().unwrap_or(0)
    }

    /// Returns how many times an operation was called.
    #[must_use]
    pub fn calls(&self, operation: &str) -> usize {
        self.instrumentation.calls(operation)
    }

    /// Makes the next `times` calls of `operation` fail with a backend error.
    pub fn fail_next(&self, operation: &str, times: u32) {
        self.instrumentation.fail_next(operation, times);
    }
}

#[async_trait]
impl ImageRegistry for InMemoryRegistry {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        self.instrumentation.enter("namespace_exists")?;
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.namespaces.contains(namespace))
    }

    async fn list_image_streams(&self, namespace: &str) -> Result<ObjectList<ImageStream>> {
        self.instrumentation.enter("list_image_streams")?;
        let state = self.state.read().map_err(poison_err)?;
        Ok(ObjectList {
            items: state
                .streams
                .values()
                .filter(|stream| stream.namespace == namespace)
                .cloned()
                .collect(),
            resource_version: state.versions.get(namespace).copied().unwrap_or(0),
        })
    }

    async fn get_image_stream(&self, namespace: &str, name: &str) -> Result<Option<ImageStream>> {
        self.instrumentation.enter("get_image_stream")?;
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.streams.get(&ObjectKey::new(namespace, name)).cloned())
    }

    async fn create_tag(&self, namespace: &str, stream: &str, tag: ComponentTag) -> Result<()> {
        self.instrumentation.enter("create_tag")?;
        let mut state = self.state.write().map_err(poison_err)?;
        state.ensure_namespace(namespace)?;

        let key = ObjectKey::new(namespace, stream);
        if let Some(existing) = state.streams.get(&key) {
            if existing.tag(&tag.name).is_some() {
                return Err(Error::already_exists(
                    "tag",
                    format!("{namespace}/{stream}:{}", tag.name),
                ));
            }
        }

        let existed = state.streams.contains_key(&key);
        let version = state.bump(namespace);
        let entry = state
            .streams
            .entry(key)
            .or_insert_with(|| ImageStream::new(namespace, stream));
        entry.tags.push(tag);
        entry.resource_version = version;

        let event = if existed {
            WatchEvent::Modified(entry.clone())
        } else {
            WatchEvent::Added(entry.clone())
        };
        self.watchers.publish(namespace, event);
        drop(state);
        Ok(())
    }

    async fn annotate_tag(
        &self,
        namespace: &str,
        stream: &str,
        tag: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        self.instrumentation.enter("annotate_tag")?;
        let mut state = self.state.write().map_err(poison_err)?;

        let key = ObjectKey::new(namespace, stream);
        let target = state
            .streams
            .get(&key)
            .and_then(|s| s.tag(tag))
            .ok_or_else(|| Error::not_found("tag", format!("{namespace}/{stream}:{tag}")))?;
        let unchanged = annotations
            .iter()
            .all(|(k, v)| target.annotations.get(k) == Some(v));
        if unchanged {
            return Ok(());
        }

        let version = state.bump(namespace);
        let Some(entry) = state.streams.get_mut(&key) else {
            return Err(Error::not_found("imagestream", key.to_string()));
        };
        if let Some(target) = entry.tag_mut(tag) {
            target.annotations.extend(annotations);
        }
        entry.resource_version = version;
        self.watchers
            .publish(namespace, WatchEvent::Modified(entry.clone()));
        drop(state);
        Ok(())
    }

    async fn tag_image(
        &self,
        namespace: &str,
        stream: &str,
        tag: &str,
        from: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<TagOutcome> {
        self.instrumentation.enter("tag_image")?;
        let mut state = self.state.write().map_err(poison_err)?;
        state.ensure_namespace(namespace)?;

        let key = ObjectKey::new(namespace, stream);
        if let Some(existing) = state.streams.get(&key).and_then(|s| s.tag(tag)) {
            if existing.pull_spec == from {
                return Ok(TagOutcome::Unchanged);
            }
            return Err(Error::conflict(format!(
                "{namespace}/{stream}:{tag} already points at {}",
                existing.pull_spec
            )));
        }

        let existed = state.streams.contains_key(&key);
        let version = state.bump(namespace);
        let entry = state
            .streams
            .entry(key)
            .or_insert_with(|| ImageStream::new(namespace, stream));
        entry.tags.push(ComponentTag {
            name: tag.to_string(),
            pull_spec: from.to_string(),
            created_at: Utc::now(),
            annotations,
        });
        entry.resource_version = version;

        let event = if existed {
            WatchEvent::Modified(entry.clone())
        } else {
            WatchEvent::Added(entry.clone())
        };
        self.watchers.publish(namespace, event);
        drop(state);
        Ok(TagOutcome::Tagged)
    }

    fn watch_image_streams(&self, namespace: &str) -> WatchReceiver<ImageStream> {
        self.watchers.subscribe(namespace)
    }
}

#[derive(Debug, Default)]
struct JobState {
    namespaces: BTreeSet<String>,
    jobs: BTreeMap<ObjectKey, Job>,
    versions: HashMap<String, u64>,
    next_version: u64,
}

impl JobState {
    fn bump(&mut self, namespace: &str) -> u64 {
        self.next_version += 1;
        self.versions
            .insert(namespace.to_string(), self.next_version);
        self.next_version
    }
}

/// In-memory job execution backend.
///
/// Created jobs start `Pending` and stay there until a test (or operator of a
/// local run) moves them with [`set_job_phase`](Self::set_job_phase).
#[derive(Debug)]
pub struct InMemoryJobBackend {
    state: RwLock<JobState>,
    watchers: WatchHub<Job>,
    instrumentation: Instrumentation,
}

impl Default for InMemoryJobBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobBackend {
    /// Creates an empty backend with no namespaces.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(JobState::default()),
            watchers: WatchHub::new(),
            instrumentation: Instrumentation::default(),
        }
    }

    /// Creates a backend populated from a snapshot, keeping job phases.
    #[must_use]
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let backend = Self::new();
        for namespace in &snapshot.namespaces {
            backend.create_namespace(namespace);
        }
        let mut state = backend
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for job in &snapshot.jobs {
            let mut job = job.clone();
            job.resource_version = state.bump(&job.namespace);
            if job.uid.is_empty() {
                job.uid = Ulid::new().to_string();
            }
            state
                .jobs
                .insert(ObjectKey::new(&job.namespace, &job.name), job);
        }
        drop(state);
        backend
    }

    /// Creates a namespace. Existing namespaces are left untouched.
    pub fn create_namespace(&self, namespace: &str) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.namespaces.insert(namespace.to_string());
    }

    /// Moves a job to a new phase, as the executor would.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the job does not exist.
    pub fn set_job_phase(&self, namespace: &str, name: &str, phase: JobPhase) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let key = ObjectKey::new(namespace, name);
        if !state.jobs.contains_key(&key) {
            return Err(Error::not_found("job", key.to_string()));
        }
        let version = state.bump(namespace);
        let Some(job) = state.jobs.get_mut(&key) else {
            return Err(Error::not_found("job", key.to_string()));
        };
        job.phase = phase;
        job.resource_version = version;
        self.watchers
            .publish(namespace, WatchEvent::Modified(job.clone()));
        drop(state);
        Ok(())
    }

    /// Deletes a job, as a cluster garbage collector would.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the job does not exist.
    pub fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let key = ObjectKey::new(namespace, name);
        if !state.jobs.contains_key(&key) {
            return Err(Error::not_found("job", key.to_string()));
        }
        let version = state.bump(namespace);
        let Some(mut job) = state.jobs.remove(&key) else {
            return Err(Error::not_found("job", key.to_string()));
        };
        job.resource_version = version;
        self.watchers.publish(namespace, WatchEvent::Deleted(job));
        drop(state);
        Ok(())
    }

    /// Returns all jobs of a namespace without going through the instrumented trait.
    #[must_use]
    pub fn jobs(&self, namespace: &str) -> Vec<Job> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .jobs
            .values()
            .filter(|job| job.namespace == namespace)
            .cloned()
            .collect()
    }

    /// Returns the highest resource version written in a namespace.
    #[must_use]
    pub fn resource_version_in(&self, namespace: &str) -> u64 {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.versions.get(namespace).copied().unwrap_or(0)
    }

    /// Returns how many times an operation was called.
    #[must_use]
    pub fn calls(&self, operation: &str) -> usize {
        self.instrumentation.calls(operation)
    }

    /// Makes the next `times` calls of `operation` fail with a backend error.
    pub fn fail_next(&self, operation: &str, times: u32) {
        self.instrumentation.fail_next(operation, times);
    }
}

#[async_trait]
impl JobBackend for InMemoryJobBackend {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        self.instrumentation.enter("namespace_exists")?;
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.namespaces.contains(namespace))
    }

    async fn create_job(&self, mut job: Job) -> Result<Job> {
        self.instrumentation.enter("create_job")?;
        let mut state = self.state.write().map_err(poison_err)?;
        if !state.namespaces.contains(&job.namespace) {
            return Err(Error::not_found("namespace", job.namespace));
        }

        let key = ObjectKey::new(&job.namespace, &job.name);
        if state.jobs.contains_key(&key) {
            return Err(Error::already_exists("job", key.to_string()));
        }

        job.uid = Ulid::new().to_string();
        job.phase = JobPhase::Pending;
        job.resource_version = state.bump(&job.namespace);
        state.jobs.insert(key, job.clone());
        self.watchers
            .publish(&job.namespace, WatchEvent::Added(job.clone()));
        drop(state);

        Ok(job)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        self.instrumentation.enter("get_job")?;
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.jobs.get(&ObjectKey::new(namespace, name)).cloned())
    }

    async fn list_jobs(&self, namespace: &str) -> Result<ObjectList<Job>> {
        self.instrumentation.enter("list_jobs")?;
        let state = self.state.read().map_err(poison_err)?;
        Ok(ObjectList {
            items: state
                .jobs
                .values()
                .filter(|job| job.namespace == namespace)
                .cloned()
                .collect(),
            resource_version: state.versions.get(namespace).copied().unwrap_or(0),
        })
    }

    fn watch_jobs(&self, namespace: &str) -> WatchReceiver<Job> {
        self.watchers.subscribe(namespace)
    }
}
