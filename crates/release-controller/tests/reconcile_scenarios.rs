//! Reconcile scenarios over in-memory backends.
//!
//! Each test drives single passes by hand, settling the caches between
//! passes so every pass sees the effects of the previous one.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use release_controller::controller::PayloadReport;
use release_controller::backend::ImageRegistry;
use release_controller::error::Error;
use release_controller::model::{ImageStream, JobPhase, PayloadPhase, ReleasePayload, annotations};
use release_controller::orchestrator::job_name_for;
use release_controller::publisher::PromoteOutcome;

use common::{Harness, JOB_NS, MIRROR_NS, RELEASE_NS, config_with, push_components, stable_release};

const PAYLOAD: &str = "release-20240101-0";

fn job(task: &str) -> String {
    format!("release-{PAYLOAD}-{task}")
}

async fn cut_first_payload(harness: &Harness) {
    push_components(&harness.registry, "01");
    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.cut.as_deref(), Some(PAYLOAD));
}

/// Cuts the first payload and runs the pass that first observes its jobs.
async fn cut_and_observe(harness: &Harness) {
    cut_first_payload(harness).await;
    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.payloads[0].phase, PayloadPhase::Pending);
}

fn set_phase(harness: &Harness, task: &str, phase: JobPhase) {
    harness.jobs.set_job_phase(JOB_NS, &job(task), phase).unwrap();
}

#[tokio::test]
async fn empty_source_cuts_nothing() {
    let harness = Harness::start(config_with(stable_release())).await;
    harness
        .registry
        .upsert_image_stream(ImageStream::new(RELEASE_NS, "stable"))
        .unwrap();

    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.cut, None);
    assert!(outcome.payloads.is_empty());
    assert_eq!(harness.writes(), [0, 0, 0, 0]);
    harness.stop().await;
}

#[tokio::test]
async fn complete_components_cut_a_payload_and_start_jobs() {
    let harness = Harness::start(config_with(stable_release())).await;
    cut_first_payload(&harness).await;

    let tag = harness.payload_tag(PAYLOAD).unwrap();
    assert_eq!(tag.phase(), Some(PayloadPhase::Pending));
    assert_eq!(tag.annotation(annotations::MESSAGE), Some("waiting for: install, upgrade"));

    let payload = ReleasePayload::from_tag(RELEASE_NS, "release", &tag).unwrap().unwrap();
    assert_eq!(payload.components.len(), 3);
    assert_eq!(job_name_for(&payload, "install"), job("install"));

    let mut names: Vec<String> = harness.jobs.jobs(JOB_NS).into_iter().map(|j| j.name).collect();
    names.sort();
    assert_eq!(names, vec![job("install"), job("upgrade")]);
    harness.stop().await;
}

#[tokio::test]
async fn repeated_pass_over_unchanged_state_writes_nothing() {
    let harness = Harness::start(config_with(stable_release())).await;
    cut_first_payload(&harness).await;
    assert_eq!(harness.writes(), [1, 1, 0, 2]);

    // The pass that first sees the jobs records their references.
    harness.pass().await.unwrap();
    let observed = harness.writes();
    assert_eq!(observed, [1, 2, 0, 2]);
    let refs = harness.payload_tag(PAYLOAD).unwrap().job_refs().unwrap();
    assert_eq!(refs.keys().collect::<Vec<_>>(), ["install", "upgrade"]);
    assert_eq!(refs["install"].name, job("install"));
    assert_eq!(refs["install"].phase, None);

    for _ in 0..3 {
        let outcome = harness.pass().await.unwrap();
        assert_eq!(outcome.cut, None);
        assert_eq!(
            outcome.payloads,
            vec![PayloadReport {
                payload: PAYLOAD.into(),
                phase: PayloadPhase::Pending,
                promotion: PromoteOutcome::NotReady,
            }]
        );
    }
    assert_eq!(harness.writes(), observed);
    harness.stop().await;
}

#[tokio::test]
async fn running_jobs_keep_the_payload_pending() {
    let harness = Harness::start(config_with(stable_release())).await;
    cut_and_observe(&harness).await;
    set_phase(&harness, "install", JobPhase::Running);
    set_phase(&harness, "upgrade", JobPhase::Running);
    let before = harness.writes();

    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.payloads[0].phase, PayloadPhase::Pending);
    assert_eq!(outcome.payloads[0].promotion, PromoteOutcome::NotReady);
    // Same phase and message: nothing to write.
    assert_eq!(harness.writes(), before);
    assert!(harness.registry.image_stream(MIRROR_NS, "stable").is_none());
    harness.stop().await;
}

#[tokio::test]
async fn verified_payload_is_mirrored_exactly_once() {
    let harness = Harness::start(config_with(stable_release())).await;
    cut_first_payload(&harness).await;
    set_phase(&harness, "install", JobPhase::Succeeded);
    set_phase(&harness, "upgrade", JobPhase::Succeeded);

    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.payloads[0].phase, PayloadPhase::Succeeded);
    assert_eq!(
        outcome.payloads[0].promotion,
        PromoteOutcome::Promoted {
            target: format!("{MIRROR_NS}/stable:{PAYLOAD}"),
        }
    );

    let tag = harness.payload_tag(PAYLOAD).unwrap();
    assert_eq!(tag.phase(), Some(PayloadPhase::Succeeded));
    assert_eq!(
        tag.annotation(annotations::MIRRORED),
        Some(format!("{MIRROR_NS}/stable:{PAYLOAD}").as_str())
    );
    let mirrored = harness.registry.image_stream(MIRROR_NS, "stable").unwrap();
    assert_eq!(mirrored.tag(PAYLOAD).unwrap().pull_spec, format!("{RELEASE_NS}/release:{PAYLOAD}"));
    assert_eq!(harness.registry.calls("tag_image"), 1);

    let settled = harness.writes();
    for _ in 0..2 {
        let outcome = harness.pass().await.unwrap();
        assert_eq!(outcome.payloads[0].promotion, PromoteOutcome::AlreadyMirrored);
    }
    assert_eq!(harness.writes(), settled);
    assert_eq!(harness.jobs.jobs(JOB_NS).len(), 2);
    harness.stop().await;
}

#[tokio::test]
async fn failed_job_fails_the_payload_and_is_left_alone() {
    let harness = Harness::start(config_with(stable_release())).await;
    cut_first_payload(&harness).await;
    set_phase(&harness, "install", JobPhase::Failed);
    set_phase(&harness, "upgrade", JobPhase::Running);

    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.payloads[0].phase, PayloadPhase::Failed);
    let tag = harness.payload_tag(PAYLOAD).unwrap();
    assert_eq!(tag.phase(), Some(PayloadPhase::Failed));
    assert_eq!(tag.annotation(annotations::MESSAGE), Some("verification failed: install"));

    let settled = harness.writes();
    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.payloads[0].phase, PayloadPhase::Failed);
    assert_eq!(harness.writes(), settled);

    let failed = harness
        .jobs
        .jobs(JOB_NS)
        .into_iter()
        .find(|j| j.name == job("install"))
        .unwrap();
    assert_eq!(failed.phase, JobPhase::Failed);
    assert_eq!(harness.jobs.jobs(JOB_NS).len(), 2);
    assert_eq!(harness.registry.calls("tag_image"), 0);
    harness.stop().await;
}

#[tokio::test]
async fn transient_job_error_is_retried_not_failed() {
    let harness = Harness::start(config_with(stable_release())).await;
    push_components(&harness.registry, "01");
    harness.jobs.fail_next("create_job", 1);

    let err = harness.pass().await.unwrap_err();
    assert!(err.is_retryable());
    let tag = harness.payload_tag(PAYLOAD).unwrap();
    assert_eq!(tag.phase(), None, "no status is written on error");

    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.cut, None);
    assert_eq!(outcome.payloads[0].phase, PayloadPhase::Pending);
    assert_eq!(harness.jobs.jobs(JOB_NS).len(), 2);
    harness.stop().await;
}

#[tokio::test]
async fn changed_components_cut_a_new_payload() {
    let harness = Harness::start(config_with(stable_release())).await;
    cut_first_payload(&harness).await;

    push_components(&harness.registry, "11");
    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.cut.as_deref(), Some("release-20240101-1"));
    let names: Vec<&str> = outcome.payloads.iter().map(|p| p.payload.as_str()).collect();
    assert_eq!(names, vec![PAYLOAD, "release-20240101-1"]);
    assert_eq!(harness.jobs.jobs(JOB_NS).len(), 4);

    // The first payload keeps its identity and content.
    let first = harness.payload_tag(PAYLOAD).unwrap();
    let first = ReleasePayload::from_tag(RELEASE_NS, "release", &first).unwrap().unwrap();
    assert!(first.components["cli"].ends_with(":01"));
    harness.stop().await;
}

#[tokio::test]
async fn cooldown_defers_the_next_cut() {
    let release = stable_release().with_cooldown(Duration::from_secs(3600));
    let harness = Harness::start(config_with(release)).await;
    cut_first_payload(&harness).await;

    push_components(&harness.registry, "11");
    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.cut, None);
    let retry_after = outcome.requeue_after.unwrap();
    assert!(retry_after <= Duration::from_secs(3600));
    assert!(retry_after > Duration::from_secs(3500));
    assert_eq!(harness.registry.calls("create_tag"), 1);
    harness.stop().await;
}

#[tokio::test]
async fn release_without_tasks_is_promoted_on_first_pass() {
    let release = stable_release();
    let release = release_controller::config::ReleaseDefinition {
        verify: Vec::new(),
        ..release
    };
    let harness = Harness::start(config_with(release)).await;
    push_components(&harness.registry, "01");

    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.payloads[0].phase, PayloadPhase::Succeeded);
    assert!(matches!(outcome.payloads[0].promotion, PromoteOutcome::Promoted { .. }));
    assert_eq!(harness.jobs.calls("create_job"), 0);
    harness.stop().await;
}

#[tokio::test]
async fn payload_name_taken_by_other_content_is_a_conflict() {
    let harness = Harness::start(config_with(stable_release())).await;
    cut_first_payload(&harness).await;
    harness.settle().await;

    let tag = harness.payload_tag(PAYLOAD).unwrap();
    let mut impostor = ReleasePayload::from_tag(RELEASE_NS, "release", &tag).unwrap().unwrap();
    impostor.fingerprint = "0000".into();

    let err = harness
        .controller
        .reconciler()
        .record_payload(&stable_release(), &impostor)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
    assert!(err.is_retryable());

    // The same content is accepted as already recorded.
    let original = ReleasePayload::from_tag(RELEASE_NS, "release", &tag).unwrap().unwrap();
    harness
        .controller
        .reconciler()
        .record_payload(&stable_release(), &original)
        .await
        .unwrap();
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_passes_create_at_most_one_job_per_task() {
    let harness = Harness::start(config_with(stable_release())).await;
    push_components(&harness.registry, "01");
    harness.settle().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let reconciler = harness.controller.reconciler().clone();
        handles.push(tokio::spawn(async move {
            reconciler.reconcile(&common::source_key()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(harness.jobs.jobs(JOB_NS).len(), 2);
    let release = harness.registry.image_stream(RELEASE_NS, "release").unwrap();
    assert_eq!(release.tags.len(), 1);
    assert_eq!(release.tags[0].name, PAYLOAD);
    harness.stop().await;
}

#[tokio::test]
async fn recorded_success_does_not_override_a_failed_job() {
    let harness = Harness::start(config_with(stable_release())).await;
    cut_first_payload(&harness).await;
    harness.settle().await;

    let forged: BTreeMap<String, String> = [
        (annotations::PHASE.to_string(), PayloadPhase::Succeeded.to_string()),
        (annotations::MESSAGE.to_string(), "all 2 verification jobs succeeded".to_string()),
    ]
    .into_iter()
    .collect();
    harness
        .registry
        .annotate_tag(RELEASE_NS, "release", PAYLOAD, forged)
        .await
        .unwrap();
    set_phase(&harness, "install", JobPhase::Failed);
    set_phase(&harness, "upgrade", JobPhase::Succeeded);

    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.payloads[0].phase, PayloadPhase::Failed);
    assert_eq!(outcome.payloads[0].promotion, PromoteOutcome::NotReady);
    let tag = harness.payload_tag(PAYLOAD).unwrap();
    assert_eq!(tag.phase(), Some(PayloadPhase::Failed));
    assert_eq!(tag.annotation(annotations::MESSAGE), Some("verification failed: install"));
    assert_eq!(harness.registry.calls("tag_image"), 0);
    assert!(harness.registry.image_stream(MIRROR_NS, "stable").is_none());
    harness.stop().await;
}

#[tokio::test]
async fn job_deleted_before_finishing_is_not_recreated() {
    let harness = Harness::start(config_with(stable_release())).await;
    cut_and_observe(&harness).await;
    assert_eq!(harness.jobs.calls("create_job"), 2);

    harness.jobs.delete_job(JOB_NS, &job("install")).unwrap();
    set_phase(&harness, "upgrade", JobPhase::Succeeded);

    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.payloads[0].phase, PayloadPhase::Failed);
    assert_eq!(outcome.payloads[0].promotion, PromoteOutcome::NotReady);
    let tag = harness.payload_tag(PAYLOAD).unwrap();
    assert_eq!(
        tag.annotation(annotations::MESSAGE),
        Some("verification failed: install (job lost)")
    );

    let settled = harness.writes();
    harness.pass().await.unwrap();
    assert_eq!(harness.writes(), settled);
    assert_eq!(harness.jobs.calls("create_job"), 2);
    let names: Vec<String> = harness.jobs.jobs(JOB_NS).into_iter().map(|j| j.name).collect();
    assert_eq!(names, vec![job("upgrade")]);
    assert_eq!(harness.registry.calls("tag_image"), 0);
    harness.stop().await;
}

#[tokio::test]
async fn finished_jobs_cleaned_up_after_promotion_keep_the_payload_verified() {
    let harness = Harness::start(config_with(stable_release())).await;
    cut_first_payload(&harness).await;
    set_phase(&harness, "install", JobPhase::Succeeded);
    set_phase(&harness, "upgrade", JobPhase::Succeeded);
    let outcome = harness.pass().await.unwrap();
    assert!(matches!(outcome.payloads[0].promotion, PromoteOutcome::Promoted { .. }));

    harness.jobs.delete_job(JOB_NS, &job("install")).unwrap();
    harness.jobs.delete_job(JOB_NS, &job("upgrade")).unwrap();
    let settled = harness.writes();

    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.payloads[0].phase, PayloadPhase::Succeeded);
    assert_eq!(outcome.payloads[0].promotion, PromoteOutcome::AlreadyMirrored);
    assert_eq!(harness.writes(), settled);
    assert!(harness.jobs.jobs(JOB_NS).is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn tasks_differing_only_in_punctuation_get_their_own_jobs() {
    let release = stable_release();
    let release = release_controller::config::ReleaseDefinition {
        verify: Vec::new(),
        ..release
    }
    .with_task("e2e.aws", "quay.io/ci/e2e:latest")
    .with_task("e2e_aws", "quay.io/ci/e2e:latest")
    .with_task("E2E-AWS", "quay.io/ci/e2e:latest");
    let harness = Harness::start(config_with(release)).await;
    cut_first_payload(&harness).await;

    let jobs = harness.jobs.jobs(JOB_NS);
    assert_eq!(jobs.len(), 3);
    let tasks: Vec<&str> = jobs.iter().map(|j| j.spec.task.as_str()).collect();
    for task in ["e2e.aws", "e2e_aws", "E2E-AWS"] {
        assert!(tasks.contains(&task), "no job for {task}");
    }

    // One failed task fails the payload even though its siblings succeeded.
    for job in &jobs {
        let phase = if job.spec.task == "e2e_aws" {
            JobPhase::Failed
        } else {
            JobPhase::Succeeded
        };
        harness.jobs.set_job_phase(JOB_NS, &job.name, phase).unwrap();
    }
    let outcome = harness.pass().await.unwrap();
    assert_eq!(outcome.payloads[0].phase, PayloadPhase::Failed);
    assert_eq!(harness.registry.calls("tag_image"), 0);
    harness.stop().await;
}
