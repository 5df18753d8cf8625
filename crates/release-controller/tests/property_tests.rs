//! Property-based tests for release controller invariants.
//!
//! These tests use proptest to verify invariants hold across
//! randomly generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashSet};

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use release_controller::ids::{self, MAX_NAME_LEN};
use release_controller::model::{JobPhase, PayloadPhase};
use release_controller::orchestrator::fold_phases;
use release_controller::queue::WorkQueue;

/// Generates an observed job phase; `None` stands for a job not yet seen.
fn arb_observation() -> impl Strategy<Value = Option<JobPhase>> {
    prop_oneof![
        Just(None),
        Just(Some(JobPhase::Pending)),
        Just(Some(JobPhase::Running)),
        Just(Some(JobPhase::Succeeded)),
        Just(Some(JobPhase::Failed)),
    ]
}

/// Generates a component name.
fn arb_component() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{1,12}"
}

/// Generates a component set with digest-pinned pull specs.
fn arb_components() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map(arb_component(), "[0-9a-f]{8}", 1..6).prop_map(|map| {
        map.into_iter()
            .map(|(name, digest)| {
                let spec = format!("quay.io/ocp/{name}@sha256:{digest}");
                (name, spec)
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: one failed job fails the payload, whatever else happened.
    #[test]
    fn any_failure_fails_the_payload(phases in prop::collection::vec(arb_observation(), 0..8)) {
        let folded = fold_phases(phases.iter().copied());
        let any_failed = phases.contains(&Some(JobPhase::Failed));
        let all_succeeded = phases.iter().all(|p| *p == Some(JobPhase::Succeeded));

        prop_assert_eq!(folded == PayloadPhase::Failed, any_failed);
        prop_assert_eq!(folded == PayloadPhase::Succeeded, !any_failed && all_succeeded);
        if !any_failed && !all_succeeded {
            prop_assert_eq!(folded, PayloadPhase::Pending);
        }
    }

    /// Property: the folded phase does not depend on task order.
    #[test]
    fn fold_is_order_independent(mut phases in prop::collection::vec(arb_observation(), 0..8)) {
        let forward = fold_phases(phases.iter().copied());
        phases.reverse();
        prop_assert_eq!(fold_phases(phases.iter().copied()), forward);
    }

    /// Property: job names are valid object names and stable across calls.
    #[test]
    fn job_names_are_bounded_and_deterministic(
        payload in "[a-zA-Z0-9._-]{1,80}",
        task in "[a-zA-Z0-9._ -]{1,40}",
    ) {
        let name = ids::job_name(&payload, &task);
        prop_assert!(name.len() <= MAX_NAME_LEN);
        prop_assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        prop_assert_eq!(name, ids::job_name(&payload, &task));
    }

    /// Property: distinct tasks of one payload never share a job, including
    /// tasks that differ only in case or punctuation.
    #[test]
    fn distinct_tasks_get_distinct_jobs(
        payload in "release-[a-z]{1,60}-20240101-[0-9]{1,3}",
        first in "[a-zA-Z0-9._-]{1,12}",
        second in "[a-zA-Z0-9._-]{1,12}",
    ) {
        prop_assume!(first != second);
        prop_assert_ne!(ids::job_name(&payload, &first), ids::job_name(&payload, &second));
    }

    /// Property: tasks that read the same once lowercased and stripped of
    /// punctuation still get their own jobs.
    #[test]
    fn punctuation_variants_get_distinct_jobs(
        stem in "[a-z][a-z0-9]{0,8}",
        tail in "[a-z0-9]{1,8}",
    ) {
        let payload = "release-release-20240101-0";
        let variants = [
            format!("{stem}-{tail}"),
            format!("{stem}.{tail}"),
            format!("{stem}_{tail}"),
            format!("{}-{tail}", stem.to_uppercase()),
        ];
        let names: HashSet<String> = variants
            .iter()
            .map(|task| ids::job_name(payload, task))
            .collect();
        prop_assert_eq!(names.len(), variants.len());
    }

    /// Property: changing any component reference changes the fingerprint.
    #[test]
    fn fingerprint_tracks_every_component(components in arb_components(), digest in "[0-9a-f]{8}") {
        let original = ids::fingerprint(&components);
        let (name, spec) = components.iter().next().unwrap();
        let replacement = format!("quay.io/ocp/{name}@sha256:{digest}");
        prop_assume!(&replacement != spec);

        let mut changed = components.clone();
        changed.insert(name.clone(), replacement);
        prop_assert_ne!(ids::fingerprint(&changed), original);
    }

    /// Property: generated tag names parse back to their sequence, and only
    /// for the same prefix and day.
    #[test]
    fn tag_names_carry_their_sequence(sequence in 0u32..10_000, day in 1u32..28) {
        let date = Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap();
        let other_day = Utc.with_ymd_and_hms(2024, 4, day, 12, 0, 0).unwrap();
        let name = ids::payload_tag_name("release", date, sequence);

        prop_assert_eq!(ids::payload_sequence("release", date, &name), Some(sequence));
        prop_assert_eq!(ids::payload_sequence("release", other_day, &name), None);
        prop_assert_eq!(ids::payload_sequence("nightly", date, &name), None);
    }

    /// Property: the queue holds each pending key once.
    #[test]
    fn queue_deduplicates_pending_keys(keys in prop::collection::vec(0u8..16, 0..64)) {
        let queue = WorkQueue::new("prop");
        for key in &keys {
            queue.add(*key);
        }
        let distinct: HashSet<u8> = keys.iter().copied().collect();
        prop_assert_eq!(queue.len(), distinct.len());
    }
}
