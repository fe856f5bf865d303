#![allow(clippy::result_large_err)]
//! tether-core: workflow audit and recovery services.
//!
//! Everything here runs on top of a [`tether_storage::Repository`]: every
//! mutating operation re-reads current state, checks it, writes, and appends
//! one audit transition inside a single repository snapshot.
//!
//! # Public API
//!
//! - [`Workflow`] -- construction point handing out the components below
//! - [`AuditTrail`] -- append-only transition log
//! - [`ActivityQuery`] -- filtered, newest-first activity feed
//! - [`CheckpointManager`] -- capture, keep, and recover entity snapshots
//! - [`ApprovalGate`] -- human approval in front of an [`OutboundActionPort`]
//! - [`JobRunTracker`] -- job run state machine
//! - [`WorkflowError`] -- error type for all of the above

pub mod activity;
pub mod approval;
pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metadata;
pub mod telemetry;
mod txn;
mod workflow;

// ── Convenience re-exports: components ───────────────────────────────

pub use activity::{ActivityFilter, ActivityQuery, ActivitySummary};
pub use approval::{
    ActionType, ApprovalGate, ApprovalResult, ExecutionError, ExecutionReceipt, GateState,
    OutboundAction, OutboundActionPort,
};
pub use audit::{AuditFilter, AuditTrail};
pub use checkpoint::{
    Checkpoint, CheckpointManager, CheckpointRequest, CheckpointStatus, RecoveryResult,
    SnapshotEntry,
};
pub use jobs::{IllegalTransition, Job, JobRunTracker, RunEvent, RunOutcome, RunState};
pub use workflow::Workflow;

// ── Convenience re-exports: ambient types ────────────────────────────

pub use config::{CheckpointConfig, ConfigError, LogFormat, LoggingConfig, WorkflowConfig};
pub use error::{ErrorKind, WorkflowError};
pub use txn::NONE_STATE;

pub use tether_storage::{Actor, ActorKind, AuditTransition, EntityRef, Timestamp};
