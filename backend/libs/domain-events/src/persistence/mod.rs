//! Post-commit callback contract between a data-access layer and the
//! interceptor.
//!
//! A data-access layer fires a [`CommitEvent`] on its [`HookRegistry`] after
//! every committed create, update or delete. Updates carry a [`ChangeSet`]
//! when the layer could read the pre-image; without one only the generic
//! update event is published.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::EventResult;
use crate::events::EventData;
use crate::models::{project, EntityRow};

pub mod memory;

pub use memory::MemoryTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookAction {
    AfterCreate,
    AfterUpdate,
    AfterDelete,
}

impl HookAction {
    pub fn as_str(self) -> &'static str {
        match self {
            HookAction::AfterCreate => "after_create",
            HookAction::AfterUpdate => "after_update",
            HookAction::AfterDelete => "after_delete",
        }
    }
}

/// Fields an update touched, with their pre-change values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    before: EventData,
    changed: BTreeSet<String>,
}

impl ChangeSet {
    /// Diff the JSON projections of the pre-image and the committed row.
    pub fn between<T: Serialize>(before: &T, after: &T) -> EventResult<Self> {
        let before = project(before, "pre-image")?;
        let after = project(after, "row")?;

        let mut changed: BTreeSet<String> = after
            .iter()
            .filter(|(field, value)| before.get(field.as_str()) != Some(*value))
            .map(|(field, _)| field.clone())
            .collect();
        changed.extend(before.keys().filter(|f| !after.contains_key(f.as_str())).cloned());

        Ok(Self { before, changed })
    }

    pub fn is_changed(&self, field: &str) -> bool {
        self.changed.contains(field)
    }

    /// Pre-change value of a field, whether or not it changed.
    pub fn previous(&self, field: &str) -> Option<&Value> {
        self.before.get(field)
    }

    /// Pre-change value of a changed field, decoded. `None` when the field
    /// did not change or the value does not decode as `T`.
    pub fn previous_if_changed<T: DeserializeOwned>(&self, field: &str) -> Option<T> {
        if !self.is_changed(field) {
            return None;
        }
        self.previous(field)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn changed_fields(&self) -> impl Iterator<Item = &str> {
        self.changed.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }
}

/// What a data-access layer reports after a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    pub action: HookAction,
    pub row: EntityRow,
    /// Present on updates whose pre-image could be read.
    pub changes: Option<ChangeSet>,
}

impl CommitEvent {
    pub fn created(row: EntityRow) -> Self {
        Self {
            action: HookAction::AfterCreate,
            row,
            changes: None,
        }
    }

    pub fn updated(row: EntityRow, changes: Option<ChangeSet>) -> Self {
        Self {
            action: HookAction::AfterUpdate,
            row,
            changes,
        }
    }

    pub fn deleted(row: EntityRow) -> Self {
        Self {
            action: HookAction::AfterDelete,
            row,
            changes: None,
        }
    }

    pub fn schema(&self) -> &'static str {
        self.row.schema()
    }
}

#[async_trait]
pub trait CommitHook: Send + Sync {
    async fn on_commit(&self, event: &CommitEvent) -> EventResult<()>;
}

struct NamedHook {
    name: String,
    action: HookAction,
    hook: Arc<dyn CommitHook>,
}

type RowKey = (&'static str, Uuid);
type RowLocks = Arc<Mutex<HashMap<RowKey, Arc<AsyncMutex<()>>>>>;

/// Exclusive right to commit and fire hooks for one row.
///
/// A writer takes the ticket before its write and drops it after `fire`
/// returns, so the hooks of two commits to the same row run in commit order
/// even when a hook stalls.
pub struct CommitTicket {
    key: RowKey,
    locks: RowLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CommitTicket {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // The map and this ticket hold the only references: nobody is waiting.
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 2)
        {
            locks.remove(&self.key);
        }
        self.guard.take();
    }
}

/// Named post-commit hooks for one persistence session.
///
/// Names are unique: registering a name again replaces the earlier hook, so
/// wiring the interceptor twice still yields one event per mutation.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<NamedHook>>,
    rows: RowLocks,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when an existing hook of the same name was replaced.
    pub fn register(
        &self,
        name: impl Into<String>,
        action: HookAction,
        hook: Arc<dyn CommitHook>,
    ) -> bool {
        let name = name.into();
        let mut hooks = self.hooks.write();
        if let Some(existing) = hooks.iter_mut().find(|h| h.name == name) {
            debug!(hook = %name, "Replacing commit hook");
            existing.action = action;
            existing.hook = hook;
            return false;
        }
        info!(hook = %name, action = action.as_str(), "Registered commit hook");
        hooks.push(NamedHook { name, action, hook });
        true
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks.read().iter().map(|h| h.name.clone()).collect()
    }

    /// Wait for the commit ticket of row `id` in `schema`. Hold it across
    /// the write, the commit and [`fire`](Self::fire).
    pub async fn sequence(&self, schema: &'static str, id: Uuid) -> CommitTicket {
        let key = (schema, id);
        let lock = self.rows.lock().entry(key).or_default().clone();
        let guard = lock.lock_owned().await;
        CommitTicket {
            key,
            locks: self.rows.clone(),
            guard: Some(guard),
        }
    }

    /// Rows with a live ticket.
    pub fn sequenced_rows(&self) -> usize {
        self.rows.lock().len()
    }

    /// Run every hook registered for the event's action, in registration
    /// order. Hook failures are logged; the commit already happened.
    pub async fn fire(&self, event: &CommitEvent) {
        let hooks: Vec<(String, Arc<dyn CommitHook>)> = self
            .hooks
            .read()
            .iter()
            .filter(|h| h.action == event.action)
            .map(|h| (h.name.clone(), h.hook.clone()))
            .collect();

        for (name, hook) in hooks {
            if let Err(e) = hook.on_commit(event).await {
                error!(
                    hook = %name,
                    schema = event.schema(),
                    entity_id = %event.row.id(),
                    error = %e,
                    "Commit hook failed"
                );
            }
        }
    }
}
