//! Controller configuration.
//!
//! Process-level settings (namespaces, worker count) come from the command
//! line. Release definitions come from a JSON file:
//!
//! ```json
//! {
//!   "releases": [
//!     {
//!       "name": "stable",
//!       "source": { "namespace": "ocp", "name": "stable" },
//!       "requiredComponents": ["cli", "installer", "machine-os"],
//!       "verify": [
//!         { "name": "install", "image": "quay.io/ci/e2e:latest", "args": ["--suite=install"] },
//!         { "name": "upgrade", "image": "quay.io/ci/e2e:latest" }
//!       ],
//!       "mirror": { "namespace": "ocp-mirror", "stream": "stable" }
//!     }
//!   ]
//! }
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::ObjectKey;
use crate::queue::BackoffPolicy;

/// One verification task run against every payload of a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationTask {
    /// Task name; part of the deterministic job name.
    pub name: String,
    /// Image that runs the verification.
    pub image: String,
    /// Arguments passed to the image.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Publication stream verified payloads are promoted into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorTarget {
    /// Namespace of the publication stream.
    pub namespace: String,
    /// Name of the publication stream.
    pub stream: String,
}

/// How payloads are cut, verified and published for one source stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseDefinition {
    /// Release name, used in logs and metrics.
    pub name: String,
    /// Source stream holding component tags.
    pub source: ObjectKey,
    /// Stream in the release namespace that holds payload tags.
    #[serde(default = "default_release_stream")]
    pub release_stream: String,
    /// Prefix of generated payload tag names.
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
    /// Components a payload must contain. Empty means every tag in the source.
    #[serde(default)]
    pub required_components: Vec<String>,
    /// Verification tasks run against each payload.
    #[serde(default)]
    pub verify: Vec<VerificationTask>,
    /// Where verified payloads are published. `None` disables promotion.
    #[serde(default)]
    pub mirror: Option<MirrorTarget>,
    /// Minimum time between two cuts, in seconds. Zero disables the cooldown.
    #[serde(default)]
    pub cooldown_secs: u64,
}

fn default_release_stream() -> String {
    "release".to_string()
}

fn default_tag_prefix() -> String {
    "release".to_string()
}

fn default_workers() -> usize {
    3
}

impl ReleaseDefinition {
    /// Creates a release with default stream, prefix and no tasks.
    #[must_use]
    pub fn new(name: impl Into<String>, source: ObjectKey) -> Self {
        Self {
            name: name.into(),
            source,
            release_stream: default_release_stream(),
            tag_prefix: default_tag_prefix(),
            required_components: Vec::new(),
            verify: Vec::new(),
            mirror: None,
            cooldown_secs: 0,
        }
    }

    /// Sets the required components.
    #[must_use]
    pub fn with_required<I, S>(mut self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_components = components.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a verification task.
    #[must_use]
    pub fn with_task(mut self, name: impl Into<String>, image: impl Into<String>) -> Self {
        self.verify.push(VerificationTask {
            name: name.into(),
            image: image.into(),
            args: Vec::new(),
        });
        self
    }

    /// Sets the mirror target.
    #[must_use]
    pub fn with_mirror(mut self, namespace: impl Into<String>, stream: impl Into<String>) -> Self {
        self.mirror = Some(MirrorTarget {
            namespace: namespace.into(),
            stream: stream.into(),
        });
        self
    }

    /// Sets the cut cooldown.
    #[must_use]
    pub const fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_secs = cooldown.as_secs();
        self
    }

    /// Returns the cut cooldown.
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Deserialize)]
struct ReleaseFile {
    #[serde(default)]
    releases: Vec<ReleaseDefinition>,
}

/// Complete configuration of a controller process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Namespace holding release streams.
    pub release_namespace: String,
    /// Namespace verification jobs are created in.
    pub job_namespace: String,
    /// Number of reconcile workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Work queue retry backoff.
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Release definitions.
    #[serde(default)]
    pub releases: Vec<ReleaseDefinition>,
}

impl ControllerConfig {
    /// Creates a configuration with no releases.
    #[must_use]
    pub fn new(release_namespace: impl Into<String>, job_namespace: impl Into<String>) -> Self {
        Self {
            release_namespace: release_namespace.into(),
            job_namespace: job_namespace.into(),
            workers: default_workers(),
            backoff: BackoffPolicy::default(),
            releases: Vec::new(),
        }
    }

    /// Adds a release definition.
    #[must_use]
    pub fn with_release(mut self, release: ReleaseDefinition) -> Self {
        self.releases.push(release);
        self
    }

    /// Loads release definitions from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or parsed.
    pub fn load_releases(path: &Path) -> Result<Vec<ReleaseDefinition>> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("unable to read {}: {e}", path.display()))
        })?;
        let file: ReleaseFile = serde_json::from_str(&raw).map_err(|e| {
            Error::configuration(format!("unable to parse {}: {e}", path.display()))
        })?;
        Ok(file.releases)
    }

    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.release_namespace.is_empty() {
            return Err(Error::configuration(
                "no release namespace set, use --release-namespace",
            ));
        }
        if self.job_namespace.is_empty() {
            return Err(Error::configuration("no job namespace set, use --job-namespace"));
        }
        if self.workers == 0 {
            return Err(Error::configuration("--workers must be at least 1"));
        }

        let mut names = BTreeSet::new();
        let mut sources = BTreeSet::new();
        for release in &self.releases {
            if !names.insert(release.name.as_str()) {
                return Err(Error::configuration(format!(
                    "release {} is defined more than once",
                    release.name
                )));
            }
            if !sources.insert(&release.source) {
                return Err(Error::configuration(format!(
                    "source {} is used by more than one release",
                    release.source
                )));
            }
            if release.tag_prefix.is_empty() || release.release_stream.is_empty() {
                return Err(Error::configuration(format!(
                    "release {} needs a release stream and a tag prefix",
                    release.name
                )));
            }
            if release.source.namespace == self.release_namespace
                && release.source.name == release.release_stream
            {
                return Err(Error::configuration(format!(
                    "release {} reads and writes the same stream {}",
                    release.name, release.source
                )));
            }
            let mut tasks = BTreeSet::new();
            for task in &release.verify {
                if task.name.is_empty() || !tasks.insert(task.name.as_str()) {
                    return Err(Error::configuration(format!(
                        "release {} has an empty or duplicate task name {:?}",
                        release.name, task.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns the release reading from `source`.
    #[must_use]
    pub fn release_for(&self, source: &ObjectKey) -> Option<&ReleaseDefinition> {
        self.releases.iter().find(|release| &release.source == source)
    }

    /// Returns the releases writing payloads into `namespace/stream`.
    pub fn releases_publishing_into<'a>(
        &'a self,
        namespace: &'a str,
        stream: &'a str,
    ) -> impl Iterator<Item = &'a ReleaseDefinition> + 'a {
        self.releases.iter().filter(move |release| {
            namespace == self.release_namespace && release.release_stream == stream
        })
    }

    /// Returns the namespaces whose image streams must be watched: the release
    /// namespace and every source namespace.
    #[must_use]
    pub fn image_stream_namespaces(&self) -> Vec<String> {
        let mut namespaces = BTreeSet::new();
        namespaces.insert(self.release_namespace.clone());
        for release in &self.releases {
            namespaces.insert(release.source.namespace.clone());
        }
        namespaces.into_iter().collect()
    }
}
