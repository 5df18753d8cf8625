//! Verification job reconciliation.
//!
//! For each payload the orchestrator makes sure one job exists per configured
//! verification task and folds the observed job phases into a
//! [`PayloadPhase`]:
//!
//! | Observed jobs | Payload phase |
//! |---------------|---------------|
//! | any job `Failed` | `Failed` |
//! | every task's job `Succeeded` (or no tasks) | `Succeeded` |
//! | otherwise (missing, just created, pending, running) | `Pending` |
//!
//! Job creation is strictly additive: jobs are never deleted, replaced or
//! mutated. Job names are a pure function of the payload and task, so a
//! repeated or concurrent create for the same pair lands on `AlreadyExists`,
//! which counts as success.
//!
//! Once a job is observed its [`JobRef`] is recorded on the payload tag. A
//! referenced job that disappears is not created again: its recorded terminal
//! phase stands in for it, and a job lost before finishing fails the task.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::JobBackend;
use crate::cache::Store;
use crate::config::{ReleaseDefinition, VerificationTask};
use crate::error::{Error, Result};
use crate::ids;
use crate::metrics::ControllerMetrics;
use crate::model::{Job, JobPhase, JobRef, JobSpec, PayloadPhase, ReleasePayload, annotations};

/// Observed state of one verification task of a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskObservation {
    /// Task name.
    pub task: String,
    /// Deterministic job name.
    pub job: String,
    /// Observed job phase. `None` until the job shows up in the cache.
    pub phase: Option<JobPhase>,
    /// The job was observed once and has since disappeared unfinished.
    pub lost: bool,
    /// Reference to record on the payload tag, once the job was observed.
    pub reference: Option<JobRef>,
}

impl TaskObservation {
    fn label(&self) -> String {
        if self.lost {
            format!("{} (job lost)", self.task)
        } else {
            self.task.clone()
        }
    }
}

/// Result of reconciling a payload's jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// Folded payload phase.
    pub phase: PayloadPhase,
    /// Per-task observations, in configured task order.
    pub observations: Vec<TaskObservation>,
}

impl Verification {
    /// Builds a verification from observations.
    #[must_use]
    pub fn from_observations(observations: Vec<TaskObservation>) -> Self {
        let phase = fold_phases(observations.iter().map(|o| o.phase));
        Self {
            phase,
            observations,
        }
    }

    /// Returns a human-readable summary naming failed or outstanding tasks.
    #[must_use]
    pub fn message(&self) -> String {
        match self.phase {
            PayloadPhase::Succeeded if self.observations.is_empty() => {
                "no verification tasks configured".to_string()
            }
            PayloadPhase::Succeeded => {
                format!("all {} verification jobs succeeded", self.observations.len())
            }
            PayloadPhase::Failed => {
                format!("verification failed: {}", self.tasks_where(|p| p == Some(JobPhase::Failed)))
            }
            PayloadPhase::Pending => {
                format!(
                    "waiting for: {}",
                    self.tasks_where(|p| !p.is_some_and(JobPhase::is_terminal))
                )
            }
        }
    }

    /// Returns the job references to record, keyed by task.
    #[must_use]
    pub fn job_refs(&self) -> BTreeMap<String, JobRef> {
        self.observations
            .iter()
            .filter_map(|o| Some((o.task.clone(), o.reference.clone()?)))
            .collect()
    }

    fn tasks_where(&self, predicate: impl Fn(Option<JobPhase>) -> bool) -> String {
        self.observations
            .iter()
            .filter(|o| predicate(o.phase))
            .map(TaskObservation::label)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Folds observed job phases into a payload phase.
///
/// `None` stands for a job that is missing or not yet observed.
#[must_use]
pub fn fold_phases<I>(phases: I) -> PayloadPhase
where
    I: IntoIterator<Item = Option<JobPhase>>,
{
    let mut all_succeeded = true;
    for phase in phases {
        match phase {
            Some(JobPhase::Failed) => return PayloadPhase::Failed,
            Some(JobPhase::Succeeded) => {}
            _ => all_succeeded = false,
        }
    }
    if all_succeeded {
        PayloadPhase::Succeeded
    } else {
        PayloadPhase::Pending
    }
}

/// Name of the job verifying `task` for `payload`.
///
/// Includes the release stream so payloads of different streams that share a
/// tag name never share jobs.
#[must_use]
pub fn job_name_for(payload: &ReleasePayload, task: &str) -> String {
    ids::job_name(&format!("{}-{}", payload.stream, payload.name), task)
}

/// Creates and observes verification jobs.
#[derive(Clone)]
pub struct JobOrchestrator {
    job_namespace: String,
    jobs: Store<Job>,
    backend: Arc<dyn JobBackend>,
    metrics: ControllerMetrics,
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("job_namespace", &self.job_namespace)
            .finish_non_exhaustive()
    }
}

impl JobOrchestrator {
    /// Creates an orchestrator writing jobs to `job_namespace`.
    #[must_use]
    pub fn new(
        job_namespace: impl Into<String>,
        jobs: Store<Job>,
        backend: Arc<dyn JobBackend>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            job_namespace: job_namespace.into(),
            jobs,
            backend,
            metrics,
        }
    }

    /// Returns the job that verifies `task` for `payload`.
    #[must_use]
    pub fn desired_job(&self, payload: &ReleasePayload, task: &VerificationTask) -> Job {
        let pull_spec = payload.pull_spec();
        let mut job_annotations = BTreeMap::new();
        job_annotations.insert(annotations::SOURCE.to_string(), payload.source.to_string());
        job_annotations.insert(annotations::PAYLOAD.to_string(), pull_spec.clone());
        job_annotations.insert(annotations::TASK.to_string(), task.name.clone());

        Job {
            namespace: self.job_namespace.clone(),
            name: job_name_for(payload, &task.name),
            uid: String::new(),
            resource_version: 0,
            annotations: job_annotations,
            spec: JobSpec {
                task: task.name.clone(),
                image: task.image.clone(),
                args: task.args.clone(),
                payload: pull_spec,
            },
            phase: JobPhase::Pending,
        }
    }

    /// Reports the cached state of every task's job without writing.
    ///
    /// `recorded` holds the job references already recorded on the payload
    /// tag.
    #[must_use]
    pub fn jobs_for(
        &self,
        release: &ReleaseDefinition,
        payload: &ReleasePayload,
        recorded: &BTreeMap<String, JobRef>,
    ) -> Verification {
        let observations = release
            .verify
            .iter()
            .map(|task| self.observe(payload, &task.name, recorded.get(&task.name)))
            .collect();
        Verification::from_observations(observations)
    }

    /// Creates missing jobs for `payload` and folds the observed phases.
    ///
    /// Only jobs that were never observed are created; a job referenced in
    /// `recorded` is never created again. Every task is attempted even when
    /// an earlier create fails.
    ///
    /// # Errors
    ///
    /// Returns the first create error other than `AlreadyExists`. Such
    /// errors never turn into a `Failed` verification.
    pub async fn reconcile(
        &self,
        release: &ReleaseDefinition,
        payload: &ReleasePayload,
        recorded: &BTreeMap<String, JobRef>,
    ) -> Result<Verification> {
        let mut observations = Vec::with_capacity(release.verify.len());
        let mut first_error: Option<Error> = None;

        for task in &release.verify {
            let observation = self.observe(payload, &task.name, recorded.get(&task.name));
            if observation.reference.is_none() {
                let desired = self.desired_job(payload, task);
                match self.backend.create_job(desired).await {
                    Ok(created) => {
                        self.metrics.record_job_created(&task.name);
                        info!(job = %created.name, task = %task.name, payload = %payload, "created verification job");
                    }
                    Err(error) if error.is_already_exists() => {
                        debug!(job = %observation.job, "verification job already exists");
                    }
                    Err(error) => {
                        warn!(job = %observation.job, task = %task.name, %error, "failed to create verification job");
                        first_error.get_or_insert(error);
                    }
                }
            } else if observation.lost {
                warn!(job = %observation.job, task = %task.name, payload = %payload, "verification job disappeared before finishing");
            }
            observations.push(observation);
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        Ok(Verification::from_observations(observations))
    }

    fn observe(
        &self,
        payload: &ReleasePayload,
        task: &str,
        recorded: Option<&JobRef>,
    ) -> TaskObservation {
        let job = job_name_for(payload, task);
        let recorded = recorded.filter(|reference| reference.name == job);

        if let Some(observed) = self.jobs.get(&self.job_namespace, &job) {
            return TaskObservation {
                task: task.to_string(),
                phase: Some(observed.phase),
                lost: false,
                reference: Some(JobRef::observed(&observed)),
                job,
            };
        }

        match recorded {
            Some(reference) => TaskObservation {
                task: task.to_string(),
                phase: Some(reference.phase.unwrap_or(JobPhase::Failed)),
                lost: reference.phase.is_none(),
                reference: Some(reference.clone()),
                job,
            },
            // Created or about to be; not trusted until observed.
            None => TaskObservation {
                task: task.to_string(),
                phase: None,
                lost: false,
                reference: None,
                job,
            },
        }
    }
}
