//! Metadata vocabulary for transitions written by this crate.
//!
//! Audit metadata is a flat string map. Each transition kind the core emits
//! has a fixed set of keys it may carry; [`Metadata`] only accepts those.

use std::collections::BTreeMap;
use std::fmt;

/// Kinds of transition the workflow core appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    CheckpointCreated,
    CheckpointKept,
    CheckpointRecovered,
    ApprovalRequested,
    ActionExecuted,
    JobRegistered,
    JobStarted,
    JobRunRecorded,
    JobRetried,
}

/// Every metadata key the core ever writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKey {
    CheckpointName,
    AuditCursor,
    RollbackTarget,
    RefCount,
    RestoredCount,
    RemovedCount,
    ActionType,
    ExecutionId,
    JobName,
    Diagnostics,
    FailureReason,
    FixSummary,
    RetryCount,
}

impl MetaKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckpointName => "checkpoint_name",
            Self::AuditCursor => "audit_cursor",
            Self::RollbackTarget => "rollback_target",
            Self::RefCount => "ref_count",
            Self::RestoredCount => "restored_count",
            Self::RemovedCount => "removed_count",
            Self::ActionType => "action_type",
            Self::ExecutionId => "execution_id",
            Self::JobName => "job_name",
            Self::Diagnostics => "diagnostics",
            Self::FailureReason => "failure_reason",
            Self::FixSummary => "fix_summary",
            Self::RetryCount => "retry_count",
        }
    }
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TransitionKind {
    pub fn permitted_keys(&self) -> &'static [MetaKey] {
        use MetaKey::*;
        match self {
            Self::CheckpointCreated => &[CheckpointName, AuditCursor, RollbackTarget, RefCount],
            Self::CheckpointKept => &[CheckpointName],
            Self::CheckpointRecovered => {
                &[CheckpointName, RollbackTarget, RestoredCount, RemovedCount]
            }
            Self::ApprovalRequested => &[ActionType],
            Self::ActionExecuted => &[ActionType, ExecutionId],
            Self::JobRegistered | Self::JobStarted => &[JobName],
            Self::JobRunRecorded => &[JobName, Diagnostics, FailureReason],
            Self::JobRetried => &[JobName, FailureReason, FixSummary, RetryCount],
        }
    }

    pub fn permits(&self, key: MetaKey) -> bool {
        self.permitted_keys().contains(&key)
    }

    /// Whether a raw string key belongs to this kind's vocabulary.
    pub fn permits_str(&self, key: &str) -> bool {
        self.permitted_keys().iter().any(|k| k.as_str() == key)
    }
}

/// Builder for the metadata map of one transition kind.
#[derive(Debug, Clone)]
pub struct Metadata {
    kind: TransitionKind,
    entries: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new(kind: TransitionKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Add one entry. Keys outside the kind's vocabulary are a programming
    /// error and are dropped (with a debug assertion).
    pub fn with(mut self, key: MetaKey, value: impl Into<String>) -> Self {
        debug_assert!(
            self.kind.permits(key),
            "{:?} transitions may not carry `{}`",
            self.kind,
            key
        );
        if self.kind.permits(key) {
            self.entries.insert(key.as_str().to_string(), value.into());
        }
        self
    }

    pub fn with_opt(self, key: MetaKey, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    pub fn kind(&self) -> TransitionKind {
        self.kind
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_vocabulary() {
        let map = Metadata::new(TransitionKind::JobRetried)
            .with(MetaKey::FailureReason, "timeout")
            .with(MetaKey::RetryCount, "1")
            .with_opt(MetaKey::FixSummary, None::<String>)
            .into_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map["failure_reason"], "timeout");
        assert_eq!(map["retry_count"], "1");
    }

    #[test]
    fn kinds_do_not_share_unrelated_keys() {
        assert!(!TransitionKind::CheckpointKept.permits(MetaKey::ExecutionId));
        assert!(!TransitionKind::ApprovalRequested.permits(MetaKey::ExecutionId));
        assert!(TransitionKind::ActionExecuted.permits(MetaKey::ExecutionId));
        assert!(TransitionKind::JobRunRecorded.permits_str("diagnostics"));
        assert!(!TransitionKind::JobRunRecorded.permits_str("fix_summary"));
    }
}
