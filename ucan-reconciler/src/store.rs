//! Desired-state store.
//!
//! Holds the declared objects, accepts the engine's writes (external ID,
//! conditions, finalization) and broadcasts author-side changes so the
//! scheduler can react to them.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::object::{Condition, DeclaredObject, ObjectKey, Spec};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Changes made by the author of the declared state.
///
/// Engine writes (external ID, conditions) are deliberately not broadcast,
/// otherwise every status update would trigger another reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// An object was created or its spec changed.
    Applied(ObjectKey),
    /// An object was marked for deletion.
    DeletionRequested(ObjectKey),
    /// An object was finalized and is gone from the store.
    Removed(ObjectKey),
}

impl StoreEvent {
    pub fn key(&self) -> &ObjectKey {
        match self {
            StoreEvent::Applied(key)
            | StoreEvent::DeletionRequested(key)
            | StoreEvent::Removed(key) => key,
        }
    }
}

/// Store trait for declared objects of one spec type.
#[async_trait]
pub trait DesiredStore<S: Spec>: Send + Sync {
    /// Get the latest version of an object.
    async fn get(&self, key: &ObjectKey) -> Option<DeclaredObject<S>>;

    /// List all object keys.
    async fn list(&self) -> Vec<ObjectKey>;

    /// Create an object or replace its spec. Clears a pending deletion.
    async fn apply(&self, key: ObjectKey, spec: S) -> Result<()>;

    /// Mark an object for deletion.
    async fn request_deletion(&self, key: &ObjectKey) -> Result<()>;

    /// Record the remote identifier. Write-once: a different non-empty value
    /// already on the object is a `StoreError::Conflict`.
    async fn set_external_id(&self, key: &ObjectKey, external_id: &str) -> Result<()>;

    /// Forget the remote identifier (the remote resource is known to be gone).
    async fn clear_external_id(&self, key: &ObjectKey) -> Result<()>;

    /// Set a condition. Returns whether anything changed.
    async fn set_condition(&self, key: &ObjectKey, condition: Condition) -> Result<bool>;

    /// Drop the object after its remote resource is gone.
    async fn remove(&self, key: &ObjectKey) -> Result<()>;

    /// Subscribe to author-side change events.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

const EVENT_CAPACITY: usize = 1024;

struct Snapshot {
    path: PathBuf,
    write_lock: Mutex<()>,
}

/// In-memory store sharded per key, optionally backed by a JSON snapshot file.
pub struct MemoryStore<S: Spec> {
    objects: DashMap<ObjectKey, DeclaredObject<S>>,
    events: broadcast::Sender<StoreEvent>,
    snapshot: Option<Snapshot>,
}

impl<S: Spec> MemoryStore<S> {
    /// Create a store that lives only in memory.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            objects: DashMap::new(),
            events,
            snapshot: None,
        }
    }

    /// Open a store persisted to `path`, loading the previous snapshot if any.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        match tokio::fs::read(&path).await {
            Ok(data) => {
                let objects: Vec<DeclaredObject<S>> = serde_json::from_slice(&data).map_err(
                    |e| StoreError::Persist(format!("cannot parse {}: {}", path.display(), e)),
                )?;
                let store = Self::new();
                for object in objects {
                    store.objects.insert(object.key.clone(), object);
                }
                info!(
                    path = %path.display(),
                    objects = store.objects.len(),
                    "Loaded store snapshot"
                );
                Ok(store.with_snapshot(path))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No store snapshot yet");
                Ok(Self::new().with_snapshot(path))
            }
            Err(e) => Err(StoreError::Persist(format!(
                "cannot read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn with_snapshot(mut self, path: PathBuf) -> Self {
        self.snapshot = Some(Snapshot {
            path,
            write_lock: Mutex::new(()),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Write all objects to the snapshot file (temp file + rename).
    async fn persist(&self) -> Result<()> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };
        let _guard = snapshot.write_lock.lock().await;

        let mut objects: Vec<DeclaredObject<S>> =
            self.objects.iter().map(|e| e.value().clone()).collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));

        let data = serde_json::to_vec_pretty(&objects)
            .map_err(|e| StoreError::Persist(format!("cannot encode snapshot: {}", e)))?;
        let tmp = snapshot.path.with_extension("tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| StoreError::Persist(format!("cannot write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &snapshot.path).await.map_err(|e| {
            StoreError::Persist(format!(
                "cannot replace {}: {}",
                snapshot.path.display(),
                e
            ))
        })?;
        Ok(())
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl<S: Spec> Default for MemoryStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: Spec> DesiredStore<S> for MemoryStore<S> {
    async fn get(&self, key: &ObjectKey) -> Option<DeclaredObject<S>> {
        self.objects.get(key).map(|o| o.value().clone())
    }

    async fn list(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    async fn apply(&self, key: ObjectKey, spec: S) -> Result<()> {
        let changed = match self.objects.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let object = entry.get_mut();
                let undeleted = object.deletion_requested.take().is_some();
                let spec_changed = object.spec != spec;
                if spec_changed {
                    object.spec = spec;
                }
                spec_changed || undeleted
            }
            Entry::Vacant(entry) => {
                entry.insert(DeclaredObject::new(key.clone(), spec));
                true
            }
        };

        if changed {
            self.persist().await?;
            debug!(%key, "Declared state applied");
            self.emit(StoreEvent::Applied(key));
        }
        Ok(())
    }

    async fn request_deletion(&self, key: &ObjectKey) -> Result<()> {
        {
            let mut object = self
                .objects
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            if object.is_deletion_requested() {
                return Ok(());
            }
            object.deletion_requested = Some(Utc::now());
        }

        self.persist().await?;
        debug!(%key, "Deletion requested");
        self.emit(StoreEvent::DeletionRequested(key.clone()));
        Ok(())
    }

    async fn set_external_id(&self, key: &ObjectKey, external_id: &str) -> Result<()> {
        if external_id.is_empty() {
            return Err(StoreError::Persist(format!(
                "refusing to record an empty external ID for {}",
                key
            )));
        }

        {
            let mut object = self
                .objects
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            match object.external_id() {
                Some(existing) if existing == external_id => return Ok(()),
                Some(existing) => {
                    return Err(StoreError::Conflict {
                        key: key.clone(),
                        existing: existing.to_string(),
                        attempted: external_id.to_string(),
                    });
                }
                None => object.external_id = Some(external_id.to_string()),
            }
        }

        // Not durable means not recorded
        if let Err(e) = self.persist().await {
            if let Some(mut object) = self.objects.get_mut(key) {
                object.external_id = None;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn clear_external_id(&self, key: &ObjectKey) -> Result<()> {
        let cleared = {
            let mut object = self
                .objects
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            object.external_id.take().is_some()
        };

        if cleared {
            self.persist().await?;
        }
        Ok(())
    }

    async fn set_condition(&self, key: &ObjectKey, condition: Condition) -> Result<bool> {
        let mut object = self
            .objects
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Ok(object.set_condition(condition))
    }

    async fn remove(&self, key: &ObjectKey) -> Result<()> {
        if self.objects.remove(key).is_none() {
            return Ok(());
        }

        self.persist().await?;
        debug!(%key, "Object removed");
        self.emit(StoreEvent::Removed(key.clone()));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
