use std::future::Future;
use std::sync::Arc;

use serde_json::json;

use super::{make_transition, seed_entity, TestResult};
use crate::record::{ActorKind, AuditQuery};
use crate::{Repository, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "read_check_write_exactly_one_wins",
            read_check_write_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_appends_all_recorded",
            concurrent_appends_all_recorded(factory).await,
        ),
    ]
}

// ── Read-check-write: exactly one wins ──────────────────────────────────────

/// N tasks each open a snapshot, read a gating field, and flip it from
/// `pending_approval` to `executed` (appending a transition) only if it is
/// still pending. Exactly one task may observe the pending value.
///
/// This is the property the approval gate relies on for exactly-once
/// execution: `tokio::spawn` creates parallel tasks that race the check.
async fn read_check_write_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_entity(
        storage.as_ref(),
        "draft",
        "d-1",
        json!({"status": "pending_approval"}),
    )
    .await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let current = s.get_entity_for_update(&mut snap, "draft", "d-1").await?;
            let pending = current
                .as_ref()
                .and_then(|e| e.value.get("status"))
                .and_then(|v| v.as_str())
                == Some("pending_approval");
            if !pending {
                s.abort_snapshot(snap).await?;
                return Ok::<bool, StorageError>(false);
            }
            s.save_entity(&mut snap, "draft", "d-1", json!({"status": "executed"}))
                .await?;
            s.append_audit_transition(
                &mut snap,
                make_transition(
                    &format!("t-{i}"),
                    "draft",
                    "d-1",
                    "pending_approval",
                    "executed",
                    ActorKind::User,
                    i as i64,
                ),
            )
            .await?;
            s.commit_snapshot(snap).await?;
            Ok(true)
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    let trail = storage
        .list_audit_trail(&AuditQuery::for_entity("draft", "d-1"))
        .await
        .map_err(|e| e.to_string())?;
    if trail.len() != 1 {
        return Err(format!("expected 1 transition, got {}", trail.len()));
    }
    Ok(())
}

async fn concurrent_appends_all_recorded<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            s.append_audit_transition(
                &mut snap,
                make_transition(
                    &format!("t-{i:02}"),
                    "note",
                    &format!("n-{i}"),
                    "none",
                    "created",
                    ActorKind::System,
                    i as i64,
                ),
            )
            .await?;
            s.commit_snapshot(snap).await
        }));
    }
    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
    }

    let cursor = storage.audit_cursor().await.map_err(|e| e.to_string())?;
    if cursor != N as u64 {
        return Err(format!("expected cursor {N}, got {cursor}"));
    }
    Ok(())
}
