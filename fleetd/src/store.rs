//! Coordination store: the authoritative view of which tasks exist and what
//! status each one is in.
//!
//! Keys follow the layout in [`fleet_common::task`]. The repository holds the
//! task metadata; this store decides existence and status. A task id present
//! here but missing from the repository is still listed by `select`, and a
//! repository row without a key here is invisible to agents.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use fleet_common::{task_file_prefix, task_id_from_key, task_key, task_prefix, TaskStatus};
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("key {0} does not exist")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub key: String,
    pub value: Option<String>,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    /// Writes the whole batch in one step only when none of its keys exist.
    /// Returns `false`, writing nothing, when any key is already present.
    async fn put_if_absent(&self, entries: &[(String, String)]) -> Result<bool, StoreError>;

    /// Replaces the value of an existing key; `false` when the key is absent.
    async fn update_if_present(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    fn watch(&self, prefix: &str, kind: WatchKind) -> Watch;
}

/// Filtered subscription to store mutations.
pub struct Watch {
    prefix: String,
    kind: WatchKind,
    events: broadcast::Receiver<WatchEvent>,
}

impl Watch {
    /// Next matching event, or `None` once the store is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.kind == self.kind && event.key.starts_with(&self.prefix) => {
                    return Some(event)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Store watch on {} lagged, {} events skipped", self.prefix, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-process store backed by an ordered map.
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: WatchKind, key: &str, value: Option<&str>) {
        // No subscribers is fine.
        let _ = self.events.send(WatchEvent {
            kind,
            key: key.to_string(),
            value: value.map(str::to_string),
        });
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries().insert(key.to_string(), value.to_string());
        self.emit(WatchKind::Put, key, Some(value));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self.entries().remove(key).is_some();
        if removed {
            self.emit(WatchKind::Delete, key, None);
        }
        Ok(removed)
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let entries = self.entries();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KeyValue {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn put_if_absent(&self, batch: &[(String, String)]) -> Result<bool, StoreError> {
        {
            let mut entries = self.entries();
            if batch.iter().any(|(key, _)| entries.contains_key(key)) {
                return Ok(false);
            }
            for (key, value) in batch {
                entries.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in batch {
            self.emit(WatchKind::Put, key, Some(value));
        }
        Ok(true)
    }

    async fn update_if_present(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let updated = match self.entries().get_mut(key) {
            Some(slot) => {
                *slot = value.to_string();
                true
            }
            None => false,
        };
        if updated {
            self.emit(WatchKind::Put, key, Some(value));
        }
        Ok(updated)
    }

    fn watch(&self, prefix: &str, kind: WatchKind) -> Watch {
        Watch {
            prefix: prefix.to_string(),
            kind,
            events: self.events.subscribe(),
        }
    }
}

/// Task-shaped queries over a [`CoordinationStore`].
#[derive(Clone)]
pub struct TaskStates {
    store: Arc<dyn CoordinationStore>,
}

impl TaskStates {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Ids of `client`'s tasks whose status equals `status`.
    pub async fn task_ids(&self, client: &str, status: TaskStatus) -> Result<Vec<String>, StoreError> {
        let entries = self.store.get_prefix(&task_prefix(client)).await?;
        Ok(entries
            .iter()
            .filter(|entry| entry.value == status.as_str())
            .filter_map(|entry| task_id_from_key(&entry.key).map(str::to_string))
            .collect())
    }

    /// File ids registered for each task, in task order.
    pub async fn file_ids(&self, task_ids: &[String]) -> Result<Vec<String>, StoreError> {
        let mut files = Vec::new();
        for task_id in task_ids {
            let entries = self.store.get_prefix(&task_file_prefix(task_id)).await?;
            files.extend(entries.into_iter().map(|entry| entry.value));
        }
        Ok(files)
    }

    /// Rewrites the status of an existing task key.
    pub async fn set_status(&self, client: &str, task_id: &str, status: &str) -> Result<(), StoreError> {
        let key = task_key(client, task_id);
        if self.store.update_if_present(&key, status).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(key))
        }
    }

    pub async fn status(&self, client: &str, task_id: &str) -> Result<Option<String>, StoreError> {
        self.store.get(&task_key(client, task_id)).await
    }
}
