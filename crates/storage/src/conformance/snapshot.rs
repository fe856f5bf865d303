//! Snapshot isolation conformance tests.
//!
//! Verifies that uncommitted writes are invisible outside a snapshot,
//! visible inside it, and that aborted or dropped snapshots are discarded.

use std::future::Future;

use serde_json::json;

use super::{make_transition, seed_entity, TestResult};
use crate::record::{ActorKind, AuditQuery};
use crate::Repository;

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "snapshot",
            "uncommitted_entity_invisible_to_get",
            uncommitted_entity_invisible_to_get(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "uncommitted_entity_invisible_to_list",
            uncommitted_entity_invisible_to_list(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "uncommitted_update_invisible",
            uncommitted_update_invisible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "uncommitted_audit_invisible",
            uncommitted_audit_invisible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "snapshot_reads_its_own_writes",
            snapshot_reads_its_own_writes(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "abort_discards_writes",
            abort_discards_writes(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "dropped_snapshot_discards_writes",
            dropped_snapshot_discards_writes(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "sequential_snapshots_see_prior_commits",
            sequential_snapshots_see_prior_commits(factory).await,
        ),
    ]
}

async fn uncommitted_entity_invisible_to_get<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.save_entity(&mut snap, "note", "note-1", json!({"body": "draft"}))
        .await
        .map_err(|e| e.to_string())?;

    let seen = s
        .get_entity("note", "note-1")
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    match seen {
        None => Ok(()),
        Some(e) => Err(format!("uncommitted entity visible: {:?}", e)),
    }
}

async fn uncommitted_entity_invisible_to_list<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.save_entity(&mut snap, "note", "note-1", json!({}))
        .await
        .map_err(|e| e.to_string())?;

    let listed = s.list_entities("note").await.map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    if !listed.is_empty() {
        return Err(format!("expected empty list, got {} entities", listed.len()));
    }
    Ok(())
}

async fn uncommitted_update_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_entity(&s, "note", "note-1", json!({"body": "A"})).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.save_entity(&mut snap, "note", "note-1", json!({"body": "B"}))
        .await
        .map_err(|e| e.to_string())?;
    let outside = s
        .get_entity("note", "note-1")
        .await
        .map_err(|e| e.to_string())?
        .ok_or("committed entity vanished")?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    if outside.value != json!({"body": "A"}) {
        return Err(format!("uncommitted update leaked: {}", outside.value));
    }
    Ok(())
}

async fn uncommitted_audit_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.append_audit_transition(
        &mut snap,
        make_transition("t-1", "note", "note-1", "none", "created", ActorKind::User, 0),
    )
    .await
    .map_err(|e| e.to_string())?;

    let trail = s
        .list_audit_trail(&AuditQuery::default())
        .await
        .map_err(|e| e.to_string())?;
    let cursor = s.audit_cursor().await.map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    if !trail.is_empty() {
        return Err(format!("uncommitted transitions visible: {}", trail.len()));
    }
    if cursor != 0 {
        return Err(format!("expected cursor 0 before commit, got {}", cursor));
    }
    Ok(())
}

async fn snapshot_reads_its_own_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.save_entity(&mut snap, "note", "note-1", json!({"body": "inside"}))
        .await
        .map_err(|e| e.to_string())?;
    let inside = s
        .get_entity_for_update(&mut snap, "note", "note-1")
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    match inside {
        Some(e) if e.value == json!({"body": "inside"}) => Ok(()),
        other => Err(format!("snapshot did not see its own write: {:?}", other)),
    }
}

async fn abort_discards_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.save_entity(&mut snap, "note", "note-1", json!({}))
        .await
        .map_err(|e| e.to_string())?;
    s.append_audit_transition(
        &mut snap,
        make_transition("t-1", "note", "note-1", "none", "created", ActorKind::User, 0),
    )
    .await
    .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    if s.get_entity("note", "note-1")
        .await
        .map_err(|e| e.to_string())?
        .is_some()
    {
        return Err("entity visible after abort".into());
    }
    let cursor = s.audit_cursor().await.map_err(|e| e.to_string())?;
    if cursor != 0 {
        return Err(format!("audit grew after abort: cursor {}", cursor));
    }
    Ok(())
}

async fn dropped_snapshot_discards_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    {
        let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
        s.save_entity(&mut snap, "note", "note-1", json!({}))
            .await
            .map_err(|e| e.to_string())?;
        // Dropped here without commit or abort.
    }

    if s.get_entity("note", "note-1")
        .await
        .map_err(|e| e.to_string())?
        .is_some()
    {
        return Err("entity visible after dropping uncommitted snapshot".into());
    }
    // A fresh snapshot must still be obtainable.
    let snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())
}

async fn sequential_snapshots_see_prior_commits<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_entity(&s, "note", "note-1", json!({"body": "first"})).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let seen = s
        .get_entity_for_update(&mut snap, "note", "note-1")
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    match seen {
        Some(e) if e.value == json!({"body": "first"}) => Ok(()),
        other => Err(format!("second snapshot missed prior commit: {:?}", other)),
    }
}
