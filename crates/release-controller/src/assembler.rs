//! Decides when a new release payload should be cut.
//!
//! The assembler is pure decision logic over the image stream cache. It never
//! writes; the controller records whatever payload it returns.
//!
//! ## Decision order
//!
//! 1. The source stream must exist and hold at least one tag.
//! 2. Every required component must be present.
//! 3. No selected component may carry an upstream phase of Pending or Failed.
//! 4. The component set must differ from every payload already recorded.
//! 5. The release's cooldown since the newest payload must have elapsed.
//!
//! Only then is a payload cut, named `{prefix}-{YYYYMMDD}-{N}` after the
//! newest component's creation date.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::cache::Store;
use crate::config::ReleaseDefinition;
use crate::ids;
use crate::model::{ComponentTag, ImageStream, PayloadPhase, ReleasePayload, Resource};

/// Outcome of assessing a release's source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assessment {
    /// The source stream does not exist or holds no tags.
    Missing,
    /// Required components are absent from the source stream.
    Incomplete {
        /// Names of the absent components.
        missing: Vec<String>,
    },
    /// A component is not ready upstream.
    Blocked {
        /// Component carrying the blocking phase.
        component: String,
        /// The upstream phase.
        phase: PayloadPhase,
    },
    /// The component set was already cut.
    Unchanged {
        /// Name of the payload with the same fingerprint.
        payload: String,
    },
    /// The last cut is too recent.
    CoolingDown {
        /// Time until a cut is allowed.
        retry_after: Duration,
    },
    /// A new payload should be recorded.
    Cut(ReleasePayload),
}

impl Assessment {
    /// Returns the payload to cut, if any.
    #[must_use]
    pub fn into_payload(self) -> Option<ReleasePayload> {
        match self {
            Self::Cut(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Computes desired payloads from the image stream cache.
#[derive(Debug, Clone)]
pub struct ReleaseAssembler {
    release_namespace: String,
    streams: Store<ImageStream>,
}

impl ReleaseAssembler {
    /// Creates an assembler reading `streams`, with release streams in
    /// `release_namespace`.
    #[must_use]
    pub fn new(release_namespace: impl Into<String>, streams: Store<ImageStream>) -> Self {
        Self {
            release_namespace: release_namespace.into(),
            streams,
        }
    }

    /// Returns the payload that should be cut for `release`, if any.
    ///
    /// `None` means the inputs are absent, incomplete, blocked, unchanged
    /// since the last cut, or still cooling down.
    #[must_use]
    pub fn compute_desired_payload(
        &self,
        release: &ReleaseDefinition,
        now: DateTime<Utc>,
    ) -> Option<ReleasePayload> {
        self.assess(release, now).into_payload()
    }

    /// Assesses the source stream of `release` at `now`.
    #[must_use]
    pub fn assess(&self, release: &ReleaseDefinition, now: DateTime<Utc>) -> Assessment {
        let source = &release.source;
        let Some(stream) = self.streams.get(&source.namespace, &source.name) else {
            return Assessment::Missing;
        };
        if stream.tags.is_empty() {
            return Assessment::Missing;
        }

        let selected = match select_components(&stream, &release.required_components) {
            Ok(selected) => selected,
            Err(missing) => return Assessment::Incomplete { missing },
        };

        for tag in &selected {
            if let Some(phase @ (PayloadPhase::Pending | PayloadPhase::Failed)) = tag.phase() {
                return Assessment::Blocked {
                    component: tag.name.clone(),
                    phase,
                };
            }
        }

        let components: BTreeMap<String, String> = selected
            .iter()
            .map(|tag| (tag.name.clone(), tag.pull_spec.clone()))
            .collect();
        let fingerprint = ids::fingerprint(&components);

        let existing = self.existing_payloads(release);
        if let Some(same) = existing.iter().find(|p| p.fingerprint == fingerprint) {
            return Assessment::Unchanged {
                payload: same.name.clone(),
            };
        }

        if let Some(retry_after) = existing
            .last()
            .and_then(|latest| remaining_cooldown(release.cooldown(), latest.created_at, now))
        {
            return Assessment::CoolingDown { retry_after };
        }

        // Non-empty: missing components return above, and an empty
        // requirement list selects every tag of a non-empty stream.
        let newest = selected
            .iter()
            .map(|tag| tag.created_at)
            .max()
            .unwrap_or(now);
        let sequence = self.next_sequence(release, newest);

        Assessment::Cut(ReleasePayload {
            namespace: self.release_namespace.clone(),
            stream: release.release_stream.clone(),
            name: ids::payload_tag_name(&release.tag_prefix, newest, sequence),
            source: source.clone(),
            components,
            fingerprint,
            created_at: now,
        })
    }

    /// Returns the payloads recorded for `release`, oldest first.
    ///
    /// Tags whose payload annotations cannot be decoded are skipped.
    #[must_use]
    pub fn existing_payloads(&self, release: &ReleaseDefinition) -> Vec<ReleasePayload> {
        let Some(stream) = self
            .streams
            .get(&self.release_namespace, &release.release_stream)
        else {
            return Vec::new();
        };

        let mut payloads: Vec<ReleasePayload> = stream
            .tags
            .iter()
            .filter_map(|tag| {
                match ReleasePayload::from_tag(&stream.namespace, &stream.name, tag) {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(tag = %tag.name, stream = %stream.key(), %error, "skipping undecodable payload tag");
                        None
                    }
                }
            })
            .filter(|payload| payload.source == release.source)
            .collect();
        payloads.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        payloads
    }

    /// Returns one past the highest sequence already used for `date`.
    fn next_sequence(&self, release: &ReleaseDefinition, date: DateTime<Utc>) -> u32 {
        self.streams
            .get(&self.release_namespace, &release.release_stream)
            .and_then(|stream| {
                stream
                    .tags
                    .iter()
                    .filter_map(|tag| ids::payload_sequence(&release.tag_prefix, date, &tag.name))
                    .max()
            })
            .map_or(0, |highest| highest.saturating_add(1))
    }
}

/// Picks the tags that make up a payload, or returns the missing names.
fn select_components<'a>(
    stream: &'a ImageStream,
    required: &[String],
) -> Result<Vec<&'a ComponentTag>, Vec<String>> {
    if required.is_empty() {
        return Ok(stream.tags.iter().collect());
    }

    let mut selected = Vec::with_capacity(required.len());
    let mut missing = Vec::new();
    for name in required {
        match stream.tag(name) {
            Some(tag) => selected.push(tag),
            None => missing.push(name.clone()),
        }
    }
    if missing.is_empty() {
        Ok(selected)
    } else {
        Err(missing)
    }
}

fn remaining_cooldown(
    cooldown: Duration,
    last_cut: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if cooldown.is_zero() {
        return None;
    }
    // A cut stamped in the future counts as just made.
    let elapsed = now.signed_duration_since(last_cut).to_std().unwrap_or_default();
    cooldown.checked_sub(elapsed).filter(|left| !left.is_zero())
}
