//! Conformance test suite for `Repository` implementations.
//!
//! This module provides a backend-agnostic test suite that any `Repository`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Entities**: save/get/remove, version counting, listing by type
//! - **Snapshot isolation**: uncommitted writes invisible, committed writes visible
//! - **Atomic commit**: all-or-nothing semantics for entity writes plus audit appends
//! - **Audit trail**: append-only, newest-first ordering, filters, limit, cursor
//! - **Concurrency**: racing read-check-write snapshots produce exactly one winner
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty repository for each test:
//!
//! ```ignore
//! use tether_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test(flavor = "multi_thread")]
//! async fn sqlite_conformance() {
//!     let report = run_conformance_suite(|| async { open_test_sqlite().await }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod audit;
mod commit;
mod concurrent;
mod entity;
mod snapshot;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use crate::record::{Actor, ActorKind, AuditTransition};
use crate::timestamp::Timestamp;
use crate::Repository;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "entity", "snapshot", "audit").
    pub category: String,
    /// Test name (e.g. "save_then_get_returns_value").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// repository, ensuring test isolation. The concurrency category spawns
/// tokio tasks, so run the suite on a multi-threaded runtime.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(entity::run_entity_tests(&factory).await);
    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(commit::run_commit_tests(&factory).await);
    results.extend(audit::run_audit_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

fn at_millis(offset_millis: i64) -> Timestamp {
    // 2025-01-01T00:00:00.000Z
    Timestamp::from_unix_millis(1_735_689_600_000 + offset_millis)
        .unwrap_or_else(|_| Timestamp::now())
}

fn make_transition(
    id: &str,
    entity_type: &str,
    entity_id: &str,
    from_state: &str,
    to_state: &str,
    kind: ActorKind,
    offset_millis: i64,
) -> AuditTransition {
    AuditTransition {
        id: id.to_string(),
        entity_type: entity_type.to_string(),
        entity_id: entity_id.to_string(),
        from_state: from_state.to_string(),
        to_state: to_state.to_string(),
        actor: Actor::new(format!("{}-actor", kind), kind),
        reason: format!("{} -> {}", from_state, to_state),
        at: at_millis(offset_millis),
        metadata: BTreeMap::new(),
    }
}

/// Commit a set of transitions in one snapshot.
async fn seed_transitions<S: Repository>(
    s: &S,
    transitions: Vec<AuditTransition>,
) -> Result<(), String> {
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    for t in transitions {
        s.append_audit_transition(&mut snap, t)
            .await
            .map_err(|e| e.to_string())?;
    }
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())
}

/// Commit one entity value in its own snapshot.
async fn seed_entity<S: Repository>(
    s: &S,
    entity_type: &str,
    entity_id: &str,
    value: serde_json::Value,
) -> Result<(), String> {
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.save_entity(&mut snap, entity_type, entity_id, value)
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())
}
