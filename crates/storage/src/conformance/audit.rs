//! Audit trail conformance tests: ordering, filtering, and append-only reads.

use std::future::Future;

use super::{at_millis, make_transition, seed_transitions, TestResult};
use crate::record::{ActorKind, AuditQuery};
use crate::Repository;

pub(super) async fn run_audit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "audit",
            "list_is_newest_first",
            list_is_newest_first(factory).await,
        ),
        TestResult::from_result(
            "audit",
            "equal_timestamps_break_ties_by_id",
            equal_timestamps_break_ties_by_id(factory).await,
        ),
        TestResult::from_result(
            "audit",
            "filter_by_entity",
            filter_by_entity(factory).await,
        ),
        TestResult::from_result(
            "audit",
            "filter_by_actor_kind",
            filter_by_actor_kind(factory).await,
        ),
        TestResult::from_result(
            "audit",
            "before_at_is_exclusive",
            before_at_is_exclusive(factory).await,
        ),
        TestResult::from_result(
            "audit",
            "limit_applies_after_filter",
            limit_applies_after_filter(factory).await,
        ),
        TestResult::from_result(
            "audit",
            "earlier_reads_unchanged_by_later_appends",
            earlier_reads_unchanged_by_later_appends(factory).await,
        ),
        TestResult::from_result(
            "audit",
            "metadata_round_trips",
            metadata_round_trips(factory).await,
        ),
    ]
}

fn ids(trail: &[crate::AuditTransition]) -> Vec<&str> {
    trail.iter().map(|t| t.id.as_str()).collect()
}

async fn list_is_newest_first<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    // Appended out of time order on purpose.
    seed_transitions(
        &s,
        vec![
            make_transition("t-b", "task", "1", "open", "done", ActorKind::User, 20),
            make_transition("t-a", "task", "1", "none", "open", ActorKind::User, 10),
            make_transition("t-c", "task", "1", "done", "open", ActorKind::User, 30),
        ],
    )
    .await?;

    let trail = s
        .list_audit_trail(&AuditQuery::default())
        .await
        .map_err(|e| e.to_string())?;
    if ids(&trail) != ["t-c", "t-b", "t-a"] {
        return Err(format!("expected [t-c, t-b, t-a], got {:?}", ids(&trail)));
    }
    Ok(())
}

async fn equal_timestamps_break_ties_by_id<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_transitions(
        &s,
        vec![
            make_transition("t-2", "task", "1", "a", "b", ActorKind::User, 5),
            make_transition("t-3", "task", "1", "b", "c", ActorKind::User, 5),
            make_transition("t-1", "task", "1", "none", "a", ActorKind::User, 5),
        ],
    )
    .await?;

    let trail = s
        .list_audit_trail(&AuditQuery::default())
        .await
        .map_err(|e| e.to_string())?;
    if ids(&trail) != ["t-3", "t-2", "t-1"] {
        return Err(format!("expected [t-3, t-2, t-1], got {:?}", ids(&trail)));
    }
    Ok(())
}

async fn filter_by_entity<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_transitions(
        &s,
        vec![
            make_transition("t-1", "task", "1", "none", "open", ActorKind::User, 1),
            make_transition("t-2", "task", "2", "none", "open", ActorKind::User, 2),
            make_transition("t-3", "note", "1", "none", "created", ActorKind::User, 3),
        ],
    )
    .await?;

    let by_entity = s
        .list_audit_trail(&AuditQuery::for_entity("task", "1"))
        .await
        .map_err(|e| e.to_string())?;
    if ids(&by_entity) != ["t-1"] {
        return Err(format!("entity filter: got {:?}", ids(&by_entity)));
    }

    let by_type = s
        .list_audit_trail(&AuditQuery {
            entity_type: Some("task".into()),
            ..AuditQuery::default()
        })
        .await
        .map_err(|e| e.to_string())?;
    if ids(&by_type) != ["t-2", "t-1"] {
        return Err(format!("type filter: got {:?}", ids(&by_type)));
    }
    Ok(())
}

async fn filter_by_actor_kind<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_transitions(
        &s,
        vec![
            make_transition("t-1", "signal", "1", "new", "triaged", ActorKind::Ai, 1),
            make_transition("t-2", "signal", "1", "triaged", "done", ActorKind::User, 2),
            make_transition("t-3", "signal", "2", "new", "triaged", ActorKind::Ai, 3),
            make_transition("t-4", "job", "j", "idle", "running", ActorKind::System, 4),
        ],
    )
    .await?;

    let ai = s
        .list_audit_trail(&AuditQuery {
            actor_kind: Some(ActorKind::Ai),
            ..AuditQuery::default()
        })
        .await
        .map_err(|e| e.to_string())?;
    if ids(&ai) != ["t-3", "t-1"] {
        return Err(format!("expected [t-3, t-1], got {:?}", ids(&ai)));
    }
    Ok(())
}

async fn before_at_is_exclusive<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_transitions(
        &s,
        vec![
            make_transition("t-1", "task", "1", "none", "open", ActorKind::User, 100),
            make_transition("t-2", "task", "1", "open", "done", ActorKind::User, 200),
            make_transition("t-3", "task", "1", "done", "open", ActorKind::User, 300),
        ],
    )
    .await?;

    let page = s
        .list_audit_trail(&AuditQuery {
            before_at: Some(at_millis(200)),
            ..AuditQuery::default()
        })
        .await
        .map_err(|e| e.to_string())?;
    if ids(&page) != ["t-1"] {
        return Err(format!("expected [t-1], got {:?}", ids(&page)));
    }
    Ok(())
}

async fn limit_applies_after_filter<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_transitions(
        &s,
        vec![
            make_transition("t-1", "task", "1", "none", "open", ActorKind::User, 1),
            make_transition("t-2", "note", "1", "none", "created", ActorKind::User, 2),
            make_transition("t-3", "task", "1", "open", "done", ActorKind::User, 3),
            make_transition("t-4", "note", "1", "created", "archived", ActorKind::User, 4),
            make_transition("t-5", "task", "1", "done", "open", ActorKind::User, 5),
        ],
    )
    .await?;

    let page = s
        .list_audit_trail(&AuditQuery {
            entity_type: Some("task".into()),
            limit: Some(2),
            ..AuditQuery::default()
        })
        .await
        .map_err(|e| e.to_string())?;
    if ids(&page) != ["t-5", "t-3"] {
        return Err(format!("expected [t-5, t-3], got {:?}", ids(&page)));
    }
    Ok(())
}

async fn earlier_reads_unchanged_by_later_appends<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_transitions(
        &s,
        vec![
            make_transition("t-1", "task", "1", "none", "open", ActorKind::User, 1),
            make_transition("t-2", "task", "1", "open", "done", ActorKind::User, 2),
        ],
    )
    .await?;
    let before = s
        .list_audit_trail(&AuditQuery::default())
        .await
        .map_err(|e| e.to_string())?;

    seed_transitions(
        &s,
        vec![make_transition("t-3", "task", "1", "done", "open", ActorKind::Ai, 3)],
    )
    .await?;
    let after = s
        .list_audit_trail(&AuditQuery::default())
        .await
        .map_err(|e| e.to_string())?;

    for earlier in &before {
        match after.iter().find(|t| t.id == earlier.id) {
            Some(now) if now == earlier => {}
            Some(now) => return Err(format!("transition {} changed: {:?}", earlier.id, now)),
            None => return Err(format!("transition {} disappeared", earlier.id)),
        }
    }
    Ok(())
}

async fn metadata_round_trips<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut t = make_transition("t-1", "job", "j-1", "failed", "retrying", ActorKind::User, 1);
    t.metadata
        .insert("failure_reason".to_string(), "timeout".to_string());
    t.metadata
        .insert("fix_summary".to_string(), "raised deadline".to_string());
    seed_transitions(&s, vec![t.clone()]).await?;

    let trail = s
        .list_audit_trail(&AuditQuery::for_entity("job", "j-1"))
        .await
        .map_err(|e| e.to_string())?;
    match trail.first() {
        Some(stored) if *stored == t => Ok(()),
        other => Err(format!("expected stored transition to equal input, got {:?}", other)),
    }
}
