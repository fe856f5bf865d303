//! Background job run tracking.
//!
//! The run state machine is `idle -> running -> {succeeded, failed}` with
//! `failed -> retrying -> {succeeded, failed}`. Run outcomes may also be
//! reported from any state, for runners that never announce a start.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tether_storage::{Actor, Repository, StoredEntity, Timestamp};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::metadata::{MetaKey, Metadata, TransitionKind};
use crate::txn::{require_actor, require_non_blank, resolve_at, settle, Transition, NONE_STATE};

/// Entity type under which jobs are persisted.
pub const JOB_ENTITY: &str = "job";

/// Recorded as the failure reason when a failed run carries no diagnostics.
pub const DEFAULT_FAILURE_REASON: &str = "run failed without diagnostics";

// ── State machine ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Succeeded,
    Failed,
    Retrying,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    /// The legal-transition table.
    pub fn apply(self, event: RunEvent) -> Result<RunState, IllegalTransition> {
        match (self, event) {
            (RunState::Running, RunEvent::Start) => Err(IllegalTransition { from: self, event }),
            (_, RunEvent::Start) => Ok(RunState::Running),
            (_, RunEvent::Record(outcome)) => Ok(outcome.into()),
            (RunState::Failed, RunEvent::Retry) => Ok(RunState::Retrying),
            (_, RunEvent::Retry) => Err(IllegalTransition { from: self, event }),
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

impl From<RunOutcome> for RunState {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Succeeded => RunState::Succeeded,
            RunOutcome::Failed => RunState::Failed,
        }
    }
}

impl FromStr for RunOutcome {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(WorkflowError::Validation(format!(
                "run outcome must be 'succeeded' or 'failed', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    Start,
    Record(RunOutcome),
    Retry,
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Record(outcome) => write!(f, "record {}", RunState::from(*outcome)),
            Self::Retry => f.write_str("retry"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {event} a job that is {from}")]
pub struct IllegalTransition {
    pub from: RunState,
    pub event: RunEvent,
}

// ── Job record ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub name: String,
    pub run_state: RunState,
    pub retry_count: u32,
    #[serde(default)]
    pub last_run_at: Option<Timestamp>,
    #[serde(default)]
    pub last_success_at: Option<Timestamp>,
    #[serde(default)]
    pub last_failure_at: Option<Timestamp>,
    #[serde(default)]
    pub last_failure_reason: Option<String>,
    #[serde(default)]
    pub diagnostics: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ── Tracker ───────────────────────────────────────────────────────────────────

pub struct JobRunTracker<R> {
    repo: Arc<R>,
}

impl<R> Clone for JobRunTracker<R> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
        }
    }
}

impl<R: Repository> JobRunTracker<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    pub async fn register(
        &self,
        name: &str,
        actor: &Actor,
        at: Option<Timestamp>,
    ) -> Result<Job, WorkflowError> {
        require_actor(actor)?;
        require_non_blank("job name", name)?;
        let at = resolve_at(at);

        let job = Job {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            run_state: RunState::Idle,
            retry_count: 0,
            last_run_at: None,
            last_success_at: None,
            last_failure_at: None,
            last_failure_reason: None,
            diagnostics: None,
            created_at: at,
            updated_at: at,
        };
        let transition = Transition::new(
            JOB_ENTITY,
            &job.id,
            NONE_STATE,
            RunState::Idle.as_str(),
            actor,
            at,
        )
        .reason(format!("job '{}' registered", job.name))
        .metadata(Metadata::new(TransitionKind::JobRegistered).with(MetaKey::JobName, name))
        .build();

        let mut snapshot = self.repo.begin_snapshot().await?;
        let outcome = async {
            self.store(&mut snapshot, &job).await?;
            self.repo
                .append_audit_transition(&mut snapshot, transition)
                .await?;
            Ok::<(), WorkflowError>(())
        }
        .await;
        settle(self.repo.as_ref(), snapshot, outcome).await?;

        info!(
            entity_type = JOB_ENTITY,
            entity_id = %job.id,
            from = NONE_STATE,
            to = "idle",
            actor = %actor,
            job_name = %job.name,
            "job registered"
        );
        Ok(job)
    }

    /// Mark a run as started. Fails with a conflict if one is already
    /// running.
    pub async fn start_run(
        &self,
        job_id: &str,
        actor: &Actor,
        at: Option<Timestamp>,
    ) -> Result<Job, WorkflowError> {
        self.advance(job_id, RunEvent::Start, actor, at, None).await
    }

    /// Report a finished run. Allowed from every state.
    ///
    /// A failed run records `diagnostics` as its failure reason (or a fixed
    /// placeholder when there are none).
    pub async fn record_run(
        &self,
        job_id: &str,
        outcome: RunOutcome,
        diagnostics: Option<String>,
        actor: &Actor,
        at: Option<Timestamp>,
    ) -> Result<Job, WorkflowError> {
        self.advance(job_id, RunEvent::Record(outcome), actor, at, diagnostics)
            .await
    }

    /// Retry a failed job. Only `failed` jobs can be retried, which bounds
    /// `retry_count` by the number of recorded failures.
    pub async fn retry(
        &self,
        job_id: &str,
        actor: &Actor,
        at: Option<Timestamp>,
        fix_summary: Option<String>,
    ) -> Result<Job, WorkflowError> {
        self.advance(job_id, RunEvent::Retry, actor, at, fix_summary)
            .await
    }

    pub async fn inspect(&self, job_id: &str) -> Result<Job, WorkflowError> {
        let stored = self
            .repo
            .get_entity(JOB_ENTITY, job_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(JOB_ENTITY, job_id))?;
        decode(stored)
    }

    /// All jobs, ordered by name.
    pub async fn list(&self) -> Result<Vec<Job>, WorkflowError> {
        let mut jobs = self
            .repo
            .list_entities(JOB_ENTITY)
            .await?
            .into_iter()
            .map(decode)
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// `note` is the run diagnostics for `Record` and the fix summary for
    /// `Retry`.
    async fn advance(
        &self,
        job_id: &str,
        event: RunEvent,
        actor: &Actor,
        at: Option<Timestamp>,
        note: Option<String>,
    ) -> Result<Job, WorkflowError> {
        require_actor(actor)?;
        let at = resolve_at(at);

        let mut snapshot = self.repo.begin_snapshot().await?;
        let outcome = self
            .advance_in(&mut snapshot, job_id, event, actor, at, note)
            .await;
        let result = settle(self.repo.as_ref(), snapshot, outcome).await;

        match &result {
            Ok((from, job)) => info!(
                entity_type = JOB_ENTITY,
                entity_id = job_id,
                from = %from,
                to = %job.run_state,
                actor = %actor,
                retry_count = job.retry_count,
                "job {}",
                event
            ),
            Err(err) => debug!(
                entity_type = JOB_ENTITY,
                entity_id = job_id,
                actor = %actor,
                error = %err,
                "job {} rejected",
                event
            ),
        }
        result.map(|(_, job)| job)
    }

    async fn advance_in(
        &self,
        snapshot: &mut R::Snapshot,
        job_id: &str,
        event: RunEvent,
        actor: &Actor,
        at: Timestamp,
        note: Option<String>,
    ) -> Result<(RunState, Job), WorkflowError> {
        let stored = self
            .repo
            .get_entity_for_update(snapshot, JOB_ENTITY, job_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(JOB_ENTITY, job_id))?;
        let mut job = decode(stored)?;
        let from = job.run_state;
        let to = from
            .apply(event)
            .map_err(|illegal| WorkflowError::conflict(JOB_ENTITY, job_id, illegal.to_string()))?;

        let (kind, reason) = match event {
            RunEvent::Start => (TransitionKind::JobStarted, "run started".to_string()),
            RunEvent::Record(outcome) => (
                TransitionKind::JobRunRecorded,
                format!("run recorded as {}", RunState::from(outcome)),
            ),
            RunEvent::Retry => (TransitionKind::JobRetried, "retry requested".to_string()),
        };
        let mut metadata = Metadata::new(kind).with(MetaKey::JobName, job.name.as_str());

        match event {
            RunEvent::Start => {}
            RunEvent::Record(outcome) => {
                job.last_run_at = Some(at);
                match outcome {
                    RunOutcome::Succeeded => job.last_success_at = Some(at),
                    RunOutcome::Failed => {
                        let failure = note
                            .clone()
                            .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string());
                        metadata = metadata.with(MetaKey::FailureReason, failure.as_str());
                        job.last_failure_at = Some(at);
                        job.last_failure_reason = Some(failure);
                    }
                }
                metadata = metadata.with_opt(MetaKey::Diagnostics, note.as_deref());
                job.diagnostics = note;
            }
            RunEvent::Retry => {
                job.retry_count = job.retry_count.saturating_add(1);
                metadata = metadata
                    .with_opt(MetaKey::FailureReason, job.last_failure_reason.as_deref())
                    .with_opt(MetaKey::FixSummary, note.as_deref())
                    .with(MetaKey::RetryCount, job.retry_count.to_string());
            }
        }
        job.run_state = to;
        job.updated_at = at;
        self.store(snapshot, &job).await?;

        let transition = Transition::new(JOB_ENTITY, job_id, from.as_str(), to.as_str(), actor, at)
            .reason(reason)
            .metadata(metadata)
            .build();
        self.repo.append_audit_transition(snapshot, transition).await?;
        Ok((from, job))
    }

    async fn store(&self, snapshot: &mut R::Snapshot, job: &Job) -> Result<(), WorkflowError> {
        let value = serde_json::to_value(job)
            .map_err(|e| WorkflowError::corrupted(JOB_ENTITY, &job.id, e.to_string()))?;
        self.repo
            .save_entity(snapshot, JOB_ENTITY, &job.id, value)
            .await?;
        Ok(())
    }
}

fn decode(stored: StoredEntity) -> Result<Job, WorkflowError> {
    serde_json::from_value(stored.value)
        .map_err(|e| WorkflowError::corrupted(JOB_ENTITY, &stored.entity_id, e.to_string()))
}
