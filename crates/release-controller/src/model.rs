//! Domain objects observed and written by the controller.
//!
//! The controller works with two external resource kinds:
//!
//! - [`ImageStream`]: a namespaced collection of [`ComponentTag`]s. Source
//!   streams hold component builds; release streams hold payload tags cut by
//!   the controller.
//! - [`Job`]: one verification unit created in the job namespace.
//!
//! [`ReleasePayload`] is never stored on its own. It is recorded as a tag in
//! the release stream whose annotations carry everything needed to rebuild it
//! from observed state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Annotation keys written onto tags and jobs.
pub mod annotations {
    /// Source stream key (`namespace/name`) a payload or job was derived from.
    pub const SOURCE: &str = "release.openshift.io/source";
    /// SHA-256 fingerprint of the component set of a payload.
    pub const FINGERPRINT: &str = "release.openshift.io/fingerprint";
    /// JSON-encoded component map of a payload.
    pub const COMPONENTS: &str = "release.openshift.io/components";
    /// RFC 3339 timestamp of when a payload was cut.
    pub const CREATED: &str = "release.openshift.io/created";
    /// Verification phase of a payload, or upstream phase of a component.
    pub const PHASE: &str = "release.openshift.io/phase";
    /// Human-readable explanation of the phase.
    pub const MESSAGE: &str = "release.openshift.io/message";
    /// Mirror record: the publication reference a payload was promoted to.
    pub const MIRRORED: &str = "release.openshift.io/mirrored";
    /// Payload tag a job verifies.
    pub const PAYLOAD: &str = "release.openshift.io/payload";
    /// Verification task a job runs.
    pub const TASK: &str = "release.openshift.io/task";
    /// JSON map from task name to the [`JobRef`](super::JobRef) of its job.
    pub const JOBS: &str = "release.openshift.io/jobs";
}

/// Identifies a namespaced object as `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Namespace of the object.
    pub namespace: String,
    /// Name of the object within its namespace.
    pub name: String,
}

impl ObjectKey {
    /// Creates a new object key.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(Error::configuration(format!(
                "invalid object key {s:?}, expected namespace/name"
            ))),
        }
    }
}

/// A namespaced object tracked by the state store.
///
/// `resource_version` is assigned by the backend and increases on every write,
/// which lets caches discard stale notifications.
pub trait Resource: Clone + Send + Sync + 'static {
    /// Resource kind used in logs and errors.
    const KIND: &'static str;

    /// Namespace of the object.
    fn namespace(&self) -> &str;

    /// Name of the object.
    fn name(&self) -> &str;

    /// Backend-assigned version of this observation.
    fn resource_version(&self) -> u64;

    /// Returns the `namespace/name` key of the object.
    fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.name())
    }
}

/// One buildable unit's published image reference inside an image stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentTag {
    /// Tag name (the component name in source streams).
    pub name: String,
    /// Image reference the tag points at, usually a digest pull spec.
    pub pull_spec: String,
    /// When the tag was last pushed.
    pub created_at: DateTime<Utc>,
    /// Annotations such as upstream phase or verification state.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ComponentTag {
    /// Creates a tag with no annotations.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        pull_spec: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            pull_spec: pull_spec.into(),
            created_at,
            annotations: BTreeMap::new(),
        }
    }

    /// Adds an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Returns the annotation value for `key`, if set.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Returns the phase recorded on the tag, if it parses.
    #[must_use]
    pub fn phase(&self) -> Option<PayloadPhase> {
        self.annotation(annotations::PHASE)
            .and_then(|value| value.parse().ok())
    }

    /// Returns the job references recorded on a payload tag, keyed by task.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the annotation is malformed.
    pub fn job_refs(&self) -> Result<BTreeMap<String, JobRef>> {
        match self.annotation(annotations::JOBS) {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Returns true if the tag carries a mirror record.
    #[must_use]
    pub fn is_mirrored(&self) -> bool {
        self.annotations.contains_key(annotations::MIRRORED)
    }
}

/// A namespaced collection of tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStream {
    /// Namespace of the stream.
    pub namespace: String,
    /// Name of the stream.
    pub name: String,
    /// Backend-assigned version.
    #[serde(default)]
    pub resource_version: u64,
    /// Tags in the stream.
    #[serde(default)]
    pub tags: Vec<ComponentTag>,
}

impl ImageStream {
    /// Creates an empty stream.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            resource_version: 0,
            tags: Vec::new(),
        }
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: ComponentTag) -> Self {
        self.tags.push(tag);
        self
    }

    /// Looks up a tag by name.
    #[must_use]
    pub fn tag(&self, name: &str) -> Option<&ComponentTag> {
        self.tags.iter().find(|tag| tag.name == name)
    }

    /// Looks up a tag by name for modification.
    pub fn tag_mut(&mut self, name: &str) -> Option<&mut ComponentTag> {
        self.tags.iter_mut().find(|tag| tag.name == name)
    }
}

impl Resource for ImageStream {
    const KIND: &'static str = "imagestream";

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn resource_version(&self) -> u64 {
        self.resource_version
    }
}

/// Observed phase of a verification job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobPhase {
    /// Accepted by the backend but not started.
    #[default]
    Pending,
    /// Executing.
    Running,
    /// Terminated successfully.
    Succeeded,
    /// Terminated with a failure.
    Failed,
}

impl JobPhase {
    /// Returns true for `Succeeded` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Immutable execution contract of a verification job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Verification task name.
    pub task: String,
    /// Image that runs the verification.
    pub image: String,
    /// Arguments passed to the image.
    #[serde(default)]
    pub args: Vec<String>,
    /// Pull spec of the payload under verification.
    pub payload: String,
}

/// A verification job in the job namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Namespace of the job.
    pub namespace: String,
    /// Deterministic job name.
    pub name: String,
    /// Backend-assigned unique id.
    #[serde(default)]
    pub uid: String,
    /// Backend-assigned version.
    #[serde(default)]
    pub resource_version: u64,
    /// Annotations linking the job to its payload and source stream.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Execution contract.
    pub spec: JobSpec,
    /// Observed phase.
    #[serde(default)]
    pub phase: JobPhase,
}

impl Job {
    /// Returns the annotation value for `key`, if set.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Returns the source stream key the job was created for.
    #[must_use]
    pub fn source(&self) -> Option<ObjectKey> {
        self.annotation(annotations::SOURCE)
            .and_then(|value| value.parse().ok())
    }
}

impl Resource for Job {
    const KIND: &'static str = "job";

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn resource_version(&self) -> u64 {
        self.resource_version
    }
}

/// Reference to a job recorded on its payload tag once the job was observed.
///
/// A referenced job that later disappears is never recreated; its last
/// recorded terminal phase stands in for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    /// Job name.
    pub name: String,
    /// Backend-assigned unique id of the observed job.
    pub uid: String,
    /// Terminal phase, once reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<JobPhase>,
}

impl JobRef {
    /// Builds the reference for an observed job.
    #[must_use]
    pub fn observed(job: &Job) -> Self {
        Self {
            name: job.name.clone(),
            uid: job.uid.clone(),
            phase: job.phase.is_terminal().then_some(job.phase),
        }
    }
}

/// Verification status of a payload, folded from its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadPhase {
    /// Some job is missing or has not finished.
    Pending,
    /// Every required job succeeded.
    Succeeded,
    /// At least one job failed.
    Failed,
}

impl PayloadPhase {
    /// Returns the annotation value for this phase.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }

    /// Returns true for `Succeeded` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for PayloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Succeeded" => Ok(Self::Succeeded),
            "Failed" => Ok(Self::Failed),
            other => Err(Error::Serialization {
                message: format!("unknown phase {other:?}"),
            }),
        }
    }
}

/// A computed, complete set of component references cut as a release.
///
/// Identity is `namespace/stream:name`. A different component set always
/// produces a different identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasePayload {
    /// Release namespace holding the payload tag.
    pub namespace: String,
    /// Release stream holding the payload tag.
    pub stream: String,
    /// Generated tag name, e.g. `release-20240101-0`.
    pub name: String,
    /// Source stream the components were read from.
    pub source: ObjectKey,
    /// Component name to pull spec.
    pub components: BTreeMap<String, String>,
    /// Fingerprint of `components`.
    pub fingerprint: String,
    /// When the payload was cut.
    pub created_at: DateTime<Utc>,
}

impl ReleasePayload {
    /// Returns the pull spec of the payload tag.
    #[must_use]
    pub fn pull_spec(&self) -> String {
        format!("{}/{}:{}", self.namespace, self.stream, self.name)
    }

    /// Returns the annotations recorded on the payload tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the component map cannot be serialized.
    pub fn to_annotations(&self) -> Result<BTreeMap<String, String>> {
        let mut values = BTreeMap::new();
        values.insert(annotations::SOURCE.to_string(), self.source.to_string());
        values.insert(annotations::FINGERPRINT.to_string(), self.fingerprint.clone());
        values.insert(
            annotations::COMPONENTS.to_string(),
            serde_json::to_string(&self.components)?,
        );
        values.insert(annotations::CREATED.to_string(), self.created_at.to_rfc3339());
        Ok(values)
    }

    /// Rebuilds a payload from a tag in a release stream.
    ///
    /// Returns `Ok(None)` for tags that were not cut by the controller (no
    /// fingerprint annotation).
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload annotations are malformed.
    pub fn from_tag(namespace: &str, stream: &str, tag: &ComponentTag) -> Result<Option<Self>> {
        let Some(fingerprint) = tag.annotation(annotations::FINGERPRINT) else {
            return Ok(None);
        };
        let source = tag
            .annotation(annotations::SOURCE)
            .ok_or_else(|| Error::Serialization {
                message: format!("payload {} has no source annotation", tag.name),
            })?
            .parse()
            .map_err(|_| Error::Serialization {
                message: format!("payload {} has an invalid source annotation", tag.name),
            })?;
        let components = match tag.annotation(annotations::COMPONENTS) {
            Some(raw) => serde_json::from_str(raw)?,
            None => BTreeMap::new(),
        };
        let created_at = match tag.annotation(annotations::CREATED) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|e| Error::Serialization {
                    message: format!("payload {} has an invalid created annotation: {e}", tag.name),
                })?
                .with_timezone(&Utc),
            None => tag.created_at,
        };

        Ok(Some(Self {
            namespace: namespace.to_string(),
            stream: stream.to_string(),
            name: tag.name.clone(),
            source,
            components,
            fingerprint: fingerprint.to_string(),
            created_at,
        }))
    }
}

impl fmt::Display for ReleasePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pull_spec())
    }
}
