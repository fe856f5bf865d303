//! In-memory `Repository` backend.
//!
//! Committed state lives behind a `std::sync::RwLock` so query operations
//! never wait on an open snapshot. Snapshots are serialized by an async
//! writer mutex held for their whole lifetime; each snapshot stages its
//! writes privately and applies them under the write lock on commit.
//! Dropping a snapshot releases the writer mutex and discards the staged
//! writes, which is the rollback.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::StorageError;
use crate::record::{AuditQuery, AuditTransition, StoredEntity};
use crate::timestamp::Timestamp;
use crate::traits::Repository;

type EntityKey = (String, String);

#[derive(Debug, Default)]
struct MemoryState {
    entities: BTreeMap<EntityKey, StoredEntity>,
    audit: Vec<AuditTransition>,
}

/// A process-local repository, suitable for tests and embedding.
///
/// Cloning yields another handle onto the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    committed: Arc<RwLock<MemoryState>>,
    writer: Arc<Mutex<()>>,
}

/// Transaction handle for [`InMemoryRepository`].
#[derive(Debug)]
pub struct MemorySnapshot {
    _writer: OwnedMutexGuard<()>,
    /// `None` marks a staged removal.
    staged_entities: BTreeMap<EntityKey, Option<StoredEntity>>,
    staged_audit: Vec<AuditTransition>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, StorageError> {
        self.committed
            .read()
            .map_err(|e| StorageError::Backend(format!("repository lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, StorageError> {
        self.committed
            .write()
            .map_err(|e| StorageError::Backend(format!("repository lock poisoned: {}", e)))
    }

    /// The entity as the snapshot sees it: staged value first, then committed.
    fn visible(
        &self,
        snapshot: &MemorySnapshot,
        key: &EntityKey,
    ) -> Result<Option<StoredEntity>, StorageError> {
        if let Some(staged) = snapshot.staged_entities.get(key) {
            return Ok(staged.clone());
        }
        Ok(self.read()?.entities.get(key).cloned())
    }
}

fn key(entity_type: &str, entity_id: &str) -> EntityKey {
    (entity_type.to_string(), entity_id.to_string())
}

#[async_trait]
impl Repository for InMemoryRepository {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        let writer = self.writer.clone().lock_owned().await;
        Ok(MemorySnapshot {
            _writer: writer,
            staged_entities: BTreeMap::new(),
            staged_audit: Vec::new(),
        })
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        let MemorySnapshot {
            _writer,
            staged_entities,
            staged_audit,
        } = snapshot;
        let mut state = self.write()?;
        for (key, entity) in staged_entities {
            match entity {
                Some(entity) => {
                    state.entities.insert(key, entity);
                }
                None => {
                    state.entities.remove(&key);
                }
            }
        }
        state.audit.extend(staged_audit);
        Ok(())
    }

    async fn abort_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        drop(snapshot);
        Ok(())
    }

    async fn get_entity_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<StoredEntity>, StorageError> {
        self.visible(snapshot, &key(entity_type, entity_id))
    }

    async fn save_entity(
        &self,
        snapshot: &mut MemorySnapshot,
        entity_type: &str,
        entity_id: &str,
        value: serde_json::Value,
    ) -> Result<i64, StorageError> {
        let key = key(entity_type, entity_id);
        let version = match self.visible(snapshot, &key)? {
            Some(existing) => existing.version + 1,
            None => 0,
        };
        snapshot.staged_entities.insert(
            key,
            Some(StoredEntity {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                value,
                version,
                updated_at: Timestamp::now(),
            }),
        );
        Ok(version)
    }

    async fn remove_entity(
        &self,
        snapshot: &mut MemorySnapshot,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<bool, StorageError> {
        let key = key(entity_type, entity_id);
        let existed = self.visible(snapshot, &key)?.is_some();
        snapshot.staged_entities.insert(key, None);
        Ok(existed)
    }

    async fn append_audit_transition(
        &self,
        snapshot: &mut MemorySnapshot,
        transition: AuditTransition,
    ) -> Result<u64, StorageError> {
        snapshot.staged_audit.push(transition);
        let committed = self.read()?.audit.len();
        Ok((committed + snapshot.staged_audit.len()) as u64)
    }

    async fn get_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<StoredEntity>, StorageError> {
        Ok(self.read()?.entities.get(&key(entity_type, entity_id)).cloned())
    }

    async fn list_entities(&self, entity_type: &str) -> Result<Vec<StoredEntity>, StorageError> {
        Ok(self
            .read()?
            .entities
            .values()
            .filter(|e| e.entity_type == entity_type)
            .cloned()
            .collect())
    }

    async fn list_audit_trail(
        &self,
        query: &AuditQuery,
    ) -> Result<Vec<AuditTransition>, StorageError> {
        let mut matched: Vec<AuditTransition> = self
            .read()?
            .audit
            .iter()
            .filter(|t| query.matches(t))
            .cloned()
            .collect();
        matched.sort_by(AuditTransition::newest_first);
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn audit_cursor(&self) -> Result<u64, StorageError> {
        Ok(self.read()?.audit.len() as u64)
    }
}
