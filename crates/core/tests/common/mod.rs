//! Shared fixtures for the tether-core integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tether_core::{
    ExecutionError, ExecutionReceipt, OutboundAction, OutboundActionPort, Workflow, WorkflowConfig,
};
use tether_storage::{
    Actor, AuditQuery, AuditTransition, InMemoryRepository, MemorySnapshot, Repository,
    StorageError, StoredEntity, Timestamp,
};

/// 2025-01-01T00:00:00.000Z
const BASE_MILLIS: i64 = 1_735_689_600_000;

pub fn at(offset_secs: i64) -> Timestamp {
    Timestamp::from_unix_millis(BASE_MILLIS + offset_secs * 1_000).unwrap()
}

pub fn alice() -> Actor {
    Actor::user("alice")
}

pub fn assistant() -> Actor {
    Actor::ai("assistant")
}

pub fn scheduler() -> Actor {
    Actor::system("scheduler")
}

/// Write one entity in its own snapshot, outside any workflow component.
pub async fn seed<R: Repository>(repo: &R, entity_type: &str, entity_id: &str, value: Value) {
    let mut snapshot = repo.begin_snapshot().await.unwrap();
    repo.save_entity(&mut snapshot, entity_type, entity_id, value)
        .await
        .unwrap();
    repo.commit_snapshot(snapshot).await.unwrap();
}

pub async fn value_of<R: Repository>(
    repo: &R,
    entity_type: &str,
    entity_id: &str,
) -> Option<Value> {
    repo.get_entity(entity_type, entity_id)
        .await
        .unwrap()
        .map(|e| e.value)
}

pub fn workflow<R: Repository>(repo: Arc<R>, port: Arc<CountingPort>) -> Workflow<R> {
    Workflow::new(repo, port, WorkflowConfig::default())
}

// ── Outbound port ─────────────────────────────────────────────────────────────

/// Port that counts calls, remembers their idempotency keys and can be
/// switched into failing.
#[derive(Debug, Default)]
pub struct CountingPort {
    calls: AtomicUsize,
    keys: Mutex<Vec<String>>,
    failing: AtomicBool,
    blank_ids: AtomicBool,
}

impl CountingPort {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Idempotency keys in call order.
    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_blank_ids(&self, blank: bool) {
        self.blank_ids.store(blank, Ordering::SeqCst);
    }
}

#[async_trait]
impl OutboundActionPort for CountingPort {
    async fn execute(&self, action: &OutboundAction) -> Result<ExecutionReceipt, ExecutionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.keys.lock().unwrap().push(action.idempotency_key.clone());
        // Give racing approvals a chance to interleave.
        tokio::task::yield_now().await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(ExecutionError::new(format!(
                "{} unavailable",
                action.action_type
            )));
        }
        let execution_id = if self.blank_ids.load(Ordering::SeqCst) {
            String::new()
        } else {
            format!("exec-{}-{}", action.entity_id, n)
        };
        Ok(ExecutionReceipt { execution_id })
    }
}

// ── Fault-injecting repository ────────────────────────────────────────────────

const NEVER: usize = usize::MAX;

/// In-memory repository whose entity writes can be made to fail after a
/// given number of successes.
#[derive(Debug)]
pub struct FlakyRepository {
    inner: InMemoryRepository,
    writes_left: AtomicUsize,
}

impl FlakyRepository {
    pub fn new() -> Self {
        Self {
            inner: InMemoryRepository::new(),
            writes_left: AtomicUsize::new(NEVER),
        }
    }

    /// Let `n` more entity writes through, then fail every one after.
    pub fn fail_writes_after(&self, n: usize) {
        self.writes_left.store(n, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.writes_left.store(NEVER, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), StorageError> {
        let left = self.writes_left.load(Ordering::SeqCst);
        if left == NEVER {
            return Ok(());
        }
        if left == 0 {
            return Err(StorageError::Backend("injected write failure".into()));
        }
        self.writes_left.store(left - 1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        self.inner.begin_snapshot().await
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        self.inner.commit_snapshot(snapshot).await
    }

    async fn abort_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        self.inner.abort_snapshot(snapshot).await
    }

    async fn get_entity_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<StoredEntity>, StorageError> {
        self.inner
            .get_entity_for_update(snapshot, entity_type, entity_id)
            .await
    }

    async fn save_entity(
        &self,
        snapshot: &mut MemorySnapshot,
        entity_type: &str,
        entity_id: &str,
        value: Value,
    ) -> Result<i64, StorageError> {
        self.check_write()?;
        self.inner
            .save_entity(snapshot, entity_type, entity_id, value)
            .await
    }

    async fn remove_entity(
        &self,
        snapshot: &mut MemorySnapshot,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<bool, StorageError> {
        self.check_write()?;
        self.inner
            .remove_entity(snapshot, entity_type, entity_id)
            .await
    }

    async fn append_audit_transition(
        &self,
        snapshot: &mut MemorySnapshot,
        transition: AuditTransition,
    ) -> Result<u64, StorageError> {
        self.inner.append_audit_transition(snapshot, transition).await
    }

    async fn get_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<StoredEntity>, StorageError> {
        self.inner.get_entity(entity_type, entity_id).await
    }

    async fn list_entities(&self, entity_type: &str) -> Result<Vec<StoredEntity>, StorageError> {
        self.inner.list_entities(entity_type).await
    }

    async fn list_audit_trail(
        &self,
        query: &AuditQuery,
    ) -> Result<Vec<AuditTransition>, StorageError> {
        self.inner.list_audit_trail(query).await
    }

    async fn audit_cursor(&self) -> Result<u64, StorageError> {
        self.inner.audit_cursor().await
    }
}
