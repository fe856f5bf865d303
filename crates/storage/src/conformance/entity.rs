use std::future::Future;

use serde_json::json;

use super::{seed_entity, TestResult};
use crate::Repository;

pub(super) async fn run_entity_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "entity",
            "get_missing_entity_returns_none",
            get_missing_entity_returns_none(factory).await,
        ),
        TestResult::from_result(
            "entity",
            "save_then_get_returns_value",
            save_then_get_returns_value(factory).await,
        ),
        TestResult::from_result(
            "entity",
            "first_save_is_version_0",
            first_save_is_version_0(factory).await,
        ),
        TestResult::from_result(
            "entity",
            "resave_increments_version",
            resave_increments_version(factory).await,
        ),
        TestResult::from_result(
            "entity",
            "remove_reports_existence",
            remove_reports_existence(factory).await,
        ),
        TestResult::from_result(
            "entity",
            "list_entities_filters_by_type",
            list_entities_filters_by_type(factory).await,
        ),
        TestResult::from_result(
            "entity",
            "same_id_different_type_are_distinct",
            same_id_different_type_are_distinct(factory).await,
        ),
    ]
}

async fn get_missing_entity_returns_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.get_entity("task", "task-404").await {
        Ok(None) => Ok(()),
        other => Err(format!("expected Ok(None), got {:?}", other)),
    }
}

async fn save_then_get_returns_value<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_entity(&s, "task", "task-1", json!({"title": "write report"})).await?;

    let stored = s
        .get_entity("task", "task-1")
        .await
        .map_err(|e| e.to_string())?
        .ok_or("entity missing after commit")?;
    if stored.value != json!({"title": "write report"}) {
        return Err(format!("unexpected value: {}", stored.value));
    }
    if stored.entity_type != "task" || stored.entity_id != "task-1" {
        return Err(format!(
            "unexpected identity: {}/{}",
            stored.entity_type, stored.entity_id
        ));
    }
    Ok(())
}

async fn first_save_is_version_0<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let version = s
        .save_entity(&mut snap, "task", "task-1", json!({}))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;
    if version != 0 {
        return Err(format!("expected version 0, got {}", version));
    }
    Ok(())
}

async fn resave_increments_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_entity(&s, "task", "task-1", json!({"n": 1})).await?;
    seed_entity(&s, "task", "task-1", json!({"n": 2})).await?;
    seed_entity(&s, "task", "task-1", json!({"n": 3})).await?;

    let stored = s
        .get_entity("task", "task-1")
        .await
        .map_err(|e| e.to_string())?
        .ok_or("entity missing")?;
    if stored.version != 2 {
        return Err(format!("expected version 2, got {}", stored.version));
    }
    Ok(())
}

async fn remove_reports_existence<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_entity(&s, "task", "task-1", json!({})).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let existed = s
        .remove_entity(&mut snap, "task", "task-1")
        .await
        .map_err(|e| e.to_string())?;
    let missing = s
        .remove_entity(&mut snap, "task", "task-2")
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if !existed {
        return Err("remove of existing entity reported false".into());
    }
    if missing {
        return Err("remove of missing entity reported true".into());
    }
    if s.get_entity("task", "task-1")
        .await
        .map_err(|e| e.to_string())?
        .is_some()
    {
        return Err("entity still visible after committed removal".into());
    }
    Ok(())
}

async fn list_entities_filters_by_type<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_entity(&s, "job", "job-b", json!({})).await?;
    seed_entity(&s, "job", "job-a", json!({})).await?;
    seed_entity(&s, "note", "note-1", json!({})).await?;

    let jobs = s.list_entities("job").await.map_err(|e| e.to_string())?;
    let ids: Vec<&str> = jobs.iter().map(|e| e.entity_id.as_str()).collect();
    if ids != ["job-a", "job-b"] {
        return Err(format!("expected [job-a, job-b], got {:?}", ids));
    }
    Ok(())
}

async fn same_id_different_type_are_distinct<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: Repository,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_entity(&s, "task", "x", json!("task")).await?;
    seed_entity(&s, "note", "x", json!("note")).await?;

    let task = s
        .get_entity("task", "x")
        .await
        .map_err(|e| e.to_string())?
        .ok_or("task missing")?;
    let note = s
        .get_entity("note", "x")
        .await
        .map_err(|e| e.to_string())?
        .ok_or("note missing")?;
    if task.value != json!("task") || note.value != json!("note") {
        return Err("entities with the same id but different types collided".into());
    }
    Ok(())
}
