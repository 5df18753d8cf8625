//! Contracts for the image registry and job execution services.
//!
//! This module provides:
//!
//! - [`ImageRegistry`]: watch, read and write image streams and their tags
//! - [`JobBackend`]: watch, create and read verification jobs
//! - [`WatchEvent`]: add/update/delete notifications delivered by watches
//! - [`memory`]: in-memory implementations for tests and local runs
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: the controller only sees these traits
//! - **Create fails on collision**: `create_*` returns
//!   [`Error::AlreadyExists`](crate::error::Error::AlreadyExists) so callers
//!   can treat deterministic-name collisions as success
//! - **Idempotent writes**: annotating and tagging the same content twice is a
//!   no-op at the target

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::cache::ListWatch;
use crate::error::Result;
use crate::model::{ComponentTag, ImageStream, Job};

/// A change notification delivered by a watch subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<T> {
    /// The object was created.
    Added(T),
    /// The object was updated.
    Modified(T),
    /// The object was removed. Carries the last state with the delete version.
    Deleted(T),
}

impl<T> WatchEvent<T> {
    /// Returns the object carried by the event.
    #[must_use]
    pub const fn object(&self) -> &T {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => object,
        }
    }

    /// Returns a short name for the event type, for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Modified(_) => "modified",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// A consistent listing of one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectList<T> {
    /// Objects in the namespace when the listing was taken.
    pub items: Vec<T>,
    /// Namespace resource version the listing reflects.
    pub resource_version: u64,
}

/// Receiving end of a watch subscription.
pub type WatchReceiver<T> = broadcast::Receiver<WatchEvent<T>>;

/// Outcome of tagging an image into a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOutcome {
    /// The tag was created or moved to the requested image.
    Tagged,
    /// The tag already pointed at the requested image.
    Unchanged,
}

/// Image registry operations consumed by the controller.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from multiple
/// workers.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Returns true if the namespace exists.
    async fn namespace_exists(&self, namespace: &str) -> Result<bool>;

    /// Lists the image streams of a namespace.
    async fn list_image_streams(&self, namespace: &str) -> Result<ObjectList<ImageStream>>;

    /// Gets one image stream.
    ///
    /// Returns `None` if the stream does not exist.
    async fn get_image_stream(&self, namespace: &str, name: &str) -> Result<Option<ImageStream>>;

    /// Creates a tag in a stream, creating the stream when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the stream already has a tag with that name.
    async fn create_tag(&self, namespace: &str, stream: &str, tag: ComponentTag) -> Result<()>;

    /// Merges annotations into an existing tag.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the stream or tag does not exist.
    async fn annotate_tag(
        &self,
        namespace: &str,
        stream: &str,
        tag: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Points `namespace/stream:tag` at `from`, creating the stream if needed.
    ///
    /// Re-tagging the same source is a no-op. Moving an existing tag to a
    /// different image is refused with a conflict.
    async fn tag_image(
        &self,
        namespace: &str,
        stream: &str,
        tag: &str,
        from: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<TagOutcome>;

    /// Subscribes to image stream changes in a namespace.
    fn watch_image_streams(&self, namespace: &str) -> WatchReceiver<ImageStream>;
}

/// Job execution operations consumed by the controller.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Returns true if the namespace exists.
    async fn namespace_exists(&self, namespace: &str) -> Result<bool>;

    /// Creates a job. The backend assigns `uid`, `resource_version` and the
    /// initial phase.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if a job with the same name exists.
    async fn create_job(&self, job: Job) -> Result<Job>;

    /// Gets one job. Returns `None` if it does not exist.
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    /// Lists the jobs of a namespace.
    async fn list_jobs(&self, namespace: &str) -> Result<ObjectList<Job>>;

    /// Subscribes to job changes in a namespace.
    fn watch_jobs(&self, namespace: &str) -> WatchReceiver<Job>;
}

/// Adapts an [`ImageRegistry`] to the informer list/watch contract.
#[derive(Clone)]
pub struct ImageStreamSource(pub Arc<dyn ImageRegistry>);

#[async_trait]
impl ListWatch<ImageStream> for ImageStreamSource {
    async fn list(&self, namespace: &str) -> Result<ObjectList<ImageStream>> {
        self.0.list_image_streams(namespace).await
    }

    fn watch(&self, namespace: &str) -> WatchReceiver<ImageStream> {
        self.0.watch_image_streams(namespace)
    }
}

/// Adapts a [`JobBackend`] to the informer list/watch contract.
#[derive(Clone)]
pub struct JobSource(pub Arc<dyn JobBackend>);

#[async_trait]
impl ListWatch<Job> for JobSource {
    async fn list(&self, namespace: &str) -> Result<ObjectList<Job>> {
        self.0.list_jobs(namespace).await
    }

    fn watch(&self, namespace: &str) -> WatchReceiver<Job> {
        self.0.watch_jobs(namespace)
    }
}
