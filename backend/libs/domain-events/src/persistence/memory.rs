//! In-memory data-access layer.
//!
//! A keyed table that honours the commit hook contract: hooks fire after the
//! write is visible, updates carry a change set computed from the stored
//! pre-image. Used by tests and by embedded deployments without Postgres.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{ChangeSet, CommitEvent, HookRegistry};
use crate::error::PersistenceError;
use crate::models::Entity;
use crate::reconcile::SnapshotSource;

pub struct MemoryTable<E: Entity> {
    rows: RwLock<BTreeMap<Uuid, E>>,
    hooks: Arc<HookRegistry>,
    pre_images: bool,
}

impl<E: Entity> MemoryTable<E> {
    pub fn new(hooks: Arc<HookRegistry>) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            hooks,
            pre_images: true,
        }
    }

    /// A table that reports updates without a change set, like a store
    /// that cannot read the pre-image.
    pub fn without_pre_images(hooks: Arc<HookRegistry>) -> Self {
        Self {
            pre_images: false,
            ..Self::new(hooks)
        }
    }

    pub async fn insert(&self, entity: E) -> Result<E, PersistenceError> {
        let id = entity.id();
        let _ticket = self.hooks.sequence(E::SCHEMA, id).await;
        {
            let mut rows = self.rows.write();
            if rows.contains_key(&id) {
                return Err(PersistenceError::Duplicate {
                    schema: E::SCHEMA,
                    id,
                });
            }
            rows.insert(id, entity.clone());
        }

        self.hooks
            .fire(&CommitEvent::created(entity.clone().into_row()))
            .await;
        Ok(entity)
    }

    /// Replace a stored row.
    pub async fn update(&self, entity: E) -> Result<E, PersistenceError> {
        let id = entity.id();
        self.write_row(id, move |row| *row = entity).await
    }

    /// Read, modify and write one row under the table lock.
    pub async fn modify<F>(&self, id: Uuid, change: F) -> Result<E, PersistenceError>
    where
        F: FnOnce(&mut E),
    {
        self.write_row(id, change).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<E, PersistenceError> {
        let _ticket = self.hooks.sequence(E::SCHEMA, id).await;
        let removed = self
            .rows
            .write()
            .remove(&id)
            .ok_or(PersistenceError::NotFound {
                schema: E::SCHEMA,
                id,
            })?;

        self.hooks
            .fire(&CommitEvent::deleted(removed.clone().into_row()))
            .await;
        Ok(removed)
    }

    /// The pre-image is taken under the same write lock that stores the new
    /// row, and hooks fire before the row's commit ticket is released.
    async fn write_row<F>(&self, id: Uuid, change: F) -> Result<E, PersistenceError>
    where
        F: FnOnce(&mut E),
    {
        let _ticket = self.hooks.sequence(E::SCHEMA, id).await;
        let (before, after) = {
            let mut rows = self.rows.write();
            let slot = rows.get_mut(&id).ok_or(PersistenceError::NotFound {
                schema: E::SCHEMA,
                id,
            })?;
            let before = slot.clone();
            change(slot);
            (before, slot.clone())
        };

        let changes = if self.pre_images {
            Some(ChangeSet::between(&before, &after)?)
        } else {
            None
        };
        self.hooks
            .fire(&CommitEvent::updated(after.clone().into_row(), changes))
            .await;
        Ok(after)
    }

    pub fn get(&self, id: Uuid) -> Option<E> {
        self.rows.read().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<E> {
        self.rows.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl<E: Entity> SnapshotSource<E> for MemoryTable<E> {
    async fn snapshot(&self) -> anyhow::Result<Vec<E>> {
        Ok(self.all())
    }
}
