//! Deterministic naming for objects the controller creates.
//!
//! Every created object is named by a pure function of its logical identity.
//! Repeated or concurrent reconciliation of the same payload therefore targets
//! the same names, and "already exists" on create means the work is done.

use std::collections::BTreeMap;

use base32::Alphabet;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Maximum length of an object name accepted by the job backend.
pub const MAX_NAME_LEN: usize = 63;

/// Length of the hash suffix appended to names that would exceed [`MAX_NAME_LEN`].
const HASH_SUFFIX_LEN: usize = 10;

/// Computes the fingerprint of a component set.
///
/// The map is ordered, so the same set always hashes the same way regardless
/// of the order tags appear in the stream.
///
/// Format: `hex(sha256("name=pull_spec\n"...))`
#[must_use]
pub fn fingerprint(components: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, pull_spec) in components {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(pull_spec.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Generates the payload tag name for a cut.
///
/// Format: `{prefix}-{YYYYMMDD}-{sequence}`
#[must_use]
pub fn payload_tag_name(prefix: &str, date: DateTime<Utc>, sequence: u32) -> String {
    format!("{prefix}-{}-{sequence}", date.format("%Y%m%d"))
}

/// Parses the sequence number out of a payload tag name for the given date.
///
/// Returns `None` when `tag` was not generated by [`payload_tag_name`] with
/// the same prefix and date.
#[must_use]
pub fn payload_sequence(prefix: &str, date: DateTime<Utc>, tag: &str) -> Option<u32> {
    let stem = format!("{prefix}-{}-", date.format("%Y%m%d"));
    tag.strip_prefix(&stem)?.parse().ok()
}

/// Generates the name of the verification job for a payload task.
///
/// Format: `{payload}-{task}` when that is already a valid name of at most
/// [`MAX_NAME_LEN`] characters. Otherwise the name is lowercased, characters
/// outside `[a-z0-9-]` become `-`, and it is truncated and suffixed with
/// `{base32(sha256(payload, task))[0..10]}`. Inputs that sanitize to the same
/// text (`e2e.aws`, `e2e_aws`) therefore keep distinct names.
#[must_use]
pub fn job_name(payload: &str, task: &str) -> String {
    let raw = format!("{payload}-{task}");
    let full = sanitize(&raw);
    if full.len() <= MAX_NAME_LEN && full == raw {
        return full;
    }

    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hasher.update(b"\0");
    hasher.update(task.as_bytes());
    let hash = hasher.finalize();
    let encoded = base32::encode(Alphabet::Rfc4648 { padding: false }, &hash);
    let suffix = encoded
        .get(..HASH_SUFFIX_LEN)
        .unwrap_or(&encoded)
        .to_lowercase();

    // sanitize() only emits ASCII, so byte slicing is on char boundaries.
    let keep = MAX_NAME_LEN - HASH_SUFFIX_LEN - 1;
    let prefix = full.get(..keep).unwrap_or(&full).trim_end_matches('-');
    format!("{prefix}-{suffix}")
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
