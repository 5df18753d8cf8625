//! Promotion of verified payloads to their publication stream.
//!
//! A payload is mirrored at most once. The mirror record is the
//! [`MIRRORED`](crate::model::annotations::MIRRORED) annotation on the payload
//! tag and is written only after the copy landed, so a crash between the two
//! leaves a copy without a record. The retry then finds the target already
//! pointing at the payload, which the registry treats as a no-op, and writes
//! the record.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{ImageRegistry, TagOutcome};
use crate::cache::Store;
use crate::config::ReleaseDefinition;
use crate::error::{Error, Result};
use crate::metrics::ControllerMetrics;
use crate::model::{ImageStream, PayloadPhase, ReleasePayload, annotations};

/// Outcome of a promotion attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// The payload has not succeeded verification.
    NotReady,
    /// The release has no mirror target.
    NotConfigured,
    /// A mirror record already exists.
    AlreadyMirrored,
    /// The payload was copied and the record written.
    Promoted {
        /// Publication reference `namespace/stream:tag`.
        target: String,
    },
}

impl PromoteOutcome {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::NotConfigured => "not_configured",
            Self::AlreadyMirrored => "already_mirrored",
            Self::Promoted { .. } => "promoted",
        }
    }
}

/// Copies verified payloads into publication streams.
#[derive(Clone)]
pub struct MirrorPublisher {
    registry: Arc<dyn ImageRegistry>,
    streams: Store<ImageStream>,
    metrics: ControllerMetrics,
}

impl std::fmt::Debug for MirrorPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorPublisher").finish_non_exhaustive()
    }
}

impl MirrorPublisher {
    /// Creates a publisher.
    #[must_use]
    pub fn new(
        registry: Arc<dyn ImageRegistry>,
        streams: Store<ImageStream>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            registry,
            streams,
            metrics,
        }
    }

    /// Mirrors `payload` if it succeeded verification and was not mirrored yet.
    ///
    /// # Errors
    ///
    /// Returns a backend error if a registry call fails, a conflict if the
    /// target tag points at another image, or `NotFound` if the payload tag
    /// disappeared.
    pub async fn promote_if_ready(
        &self,
        release: &ReleaseDefinition,
        payload: &ReleasePayload,
        phase: PayloadPhase,
    ) -> Result<PromoteOutcome> {
        if phase != PayloadPhase::Succeeded {
            return Ok(PromoteOutcome::NotReady);
        }
        let Some(mirror) = &release.mirror else {
            return Ok(PromoteOutcome::NotConfigured);
        };

        let cached = self
            .streams
            .get(&payload.namespace, &payload.stream)
            .and_then(|stream| stream.tag(&payload.name).cloned());
        if cached.is_some_and(|tag| tag.is_mirrored()) {
            return Ok(PromoteOutcome::AlreadyMirrored);
        }

        // The cache may lag our own record; confirm before copying.
        let live = self
            .registry
            .get_image_stream(&payload.namespace, &payload.stream)
            .await?
            .and_then(|stream| stream.tag(&payload.name).cloned())
            .ok_or_else(|| Error::not_found("tag", payload.pull_spec()))?;
        if live.is_mirrored() {
            debug!(payload = %payload, "mirror record found on live read");
            return Ok(PromoteOutcome::AlreadyMirrored);
        }

        let target = format!("{}/{}:{}", mirror.namespace, mirror.stream, payload.name);
        let mut target_annotations = BTreeMap::new();
        target_annotations.insert(annotations::PAYLOAD.to_string(), payload.pull_spec());
        let copied = self
            .registry
            .tag_image(
                &mirror.namespace,
                &mirror.stream,
                &payload.name,
                &payload.pull_spec(),
                target_annotations,
            )
            .await?;
        if copied == TagOutcome::Unchanged {
            debug!(payload = %payload, %target, "mirror copy already present");
        }

        let mut record = BTreeMap::new();
        record.insert(annotations::MIRRORED.to_string(), target.clone());
        self.registry
            .annotate_tag(&payload.namespace, &payload.stream, &payload.name, record)
            .await?;

        self.metrics.record_promotion("promoted");
        info!(payload = %payload, %target, "promoted payload");
        Ok(PromoteOutcome::Promoted { target })
    }
}
