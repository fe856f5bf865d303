use std::future::Future;

use serde_json::json;

use super::{make_transition, seed_entity, TestResult};
use crate::record::{ActorKind, AuditQuery};
use crate::Repository;

pub(super) async fn run_commit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "commit",
            "entity_and_audit_both_visible_after_commit",
            entity_and_audit_both_visible_after_commit(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "entity_and_audit_neither_visible_after_abort",
            entity_and_audit_neither_visible_after_abort(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "multi_entity_restore_all_or_nothing",
            multi_entity_restore_all_or_nothing(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "append_returns_running_cursor",
            append_returns_running_cursor(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "commit_empty_snapshot",
            commit_empty_snapshot(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "multiple_commits_accumulate",
            multiple_commits_accumulate(factory).await,
        ),
    ]
}

async fn entity_and_audit_both_visible_after_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.save_entity(&mut snap, "event", "ev-1", json!({"syncState": "synced"}))
        .await
        .map_err(|e| e.to_string())?;
    s.append_audit_transition(
        &mut snap,
        make_transition(
            "t-1",
            "event",
            "ev-1",
            "pending_approval",
            "synced",
            ActorKind::User,
            0,
        ),
    )
    .await
    .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    let entity = s
        .get_entity("event", "ev-1")
        .await
        .map_err(|e| e.to_string())?;
    let trail = s
        .list_audit_trail(&AuditQuery::for_entity("event", "ev-1"))
        .await
        .map_err(|e| e.to_string())?;
    if entity.is_none() {
        return Err("entity missing after commit".into());
    }
    if trail.len() != 1 || trail[0].to_state != "synced" {
        return Err(format!("expected one synced transition, got {:?}", trail));
    }
    Ok(())
}

async fn entity_and_audit_neither_visible_after_abort<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_entity(&s, "event", "ev-1", json!({"syncState": "pending_approval"})).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.save_entity(&mut snap, "event", "ev-1", json!({"syncState": "synced"}))
        .await
        .map_err(|e| e.to_string())?;
    s.append_audit_transition(
        &mut snap,
        make_transition(
            "t-1",
            "event",
            "ev-1",
            "pending_approval",
            "synced",
            ActorKind::User,
            0,
        ),
    )
    .await
    .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    let entity = s
        .get_entity("event", "ev-1")
        .await
        .map_err(|e| e.to_string())?
        .ok_or("seeded entity missing")?;
    if entity.value != json!({"syncState": "pending_approval"}) {
        return Err(format!("aborted write leaked: {}", entity.value));
    }
    let cursor = s.audit_cursor().await.map_err(|e| e.to_string())?;
    if cursor != 0 {
        return Err(format!("aborted append leaked: cursor {}", cursor));
    }
    Ok(())
}

/// Rewrites, removals and an audit append in one snapshot, then aborted:
/// every entity must keep its pre-snapshot value.
async fn multi_entity_restore_all_or_nothing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_entity(&s, "entry", "e-1", json!({"content": "B"})).await?;
    seed_entity(&s, "entry", "e-2", json!({"content": "C"})).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.save_entity(&mut snap, "entry", "e-1", json!({"content": "A"}))
        .await
        .map_err(|e| e.to_string())?;
    s.remove_entity(&mut snap, "entry", "e-2")
        .await
        .map_err(|e| e.to_string())?;
    s.append_audit_transition(
        &mut snap,
        make_transition("t-1", "checkpoint", "cp-1", "created", "recovered", ActorKind::User, 0),
    )
    .await
    .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    let e1 = s
        .get_entity("entry", "e-1")
        .await
        .map_err(|e| e.to_string())?
        .ok_or("e-1 missing")?;
    let e2 = s
        .get_entity("entry", "e-2")
        .await
        .map_err(|e| e.to_string())?;
    if e1.value != json!({"content": "B"}) {
        return Err(format!("partial restore observed on e-1: {}", e1.value));
    }
    if e2.is_none() {
        return Err("partial restore observed: e-2 removed".into());
    }
    Ok(())
}

async fn append_returns_running_cursor<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let first = s
        .append_audit_transition(
            &mut snap,
            make_transition("t-1", "note", "n-1", "none", "created", ActorKind::User, 0),
        )
        .await
        .map_err(|e| e.to_string())?;
    let second = s
        .append_audit_transition(
            &mut snap,
            make_transition("t-2", "note", "n-1", "created", "archived", ActorKind::User, 1),
        )
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if (first, second) != (1, 2) {
        return Err(format!("expected cursors (1, 2), got ({}, {})", first, second));
    }
    let cursor = s.audit_cursor().await.map_err(|e| e.to_string())?;
    if cursor != 2 {
        return Err(format!("expected committed cursor 2, got {}", cursor));
    }
    Ok(())
}

async fn commit_empty_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())
}

async fn multiple_commits_accumulate<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for i in 0..5 {
        let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
        s.save_entity(&mut snap, "note", &format!("n-{}", i), json!(i))
            .await
            .map_err(|e| e.to_string())?;
        s.append_audit_transition(
            &mut snap,
            make_transition(
                &format!("t-{}", i),
                "note",
                &format!("n-{}", i),
                "none",
                "created",
                ActorKind::System,
                i,
            ),
        )
        .await
        .map_err(|e| e.to_string())?;
        s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;
    }

    let notes = s.list_entities("note").await.map_err(|e| e.to_string())?;
    let cursor = s.audit_cursor().await.map_err(|e| e.to_string())?;
    if notes.len() != 5 || cursor != 5 {
        return Err(format!(
            "expected 5 notes and cursor 5, got {} notes and cursor {}",
            notes.len(),
            cursor
        ));
    }
    Ok(())
}
