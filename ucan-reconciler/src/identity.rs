//! Identity tracker - maps declared objects to their remote identifiers.
//!
//! The identifier itself lives on the declared object in the store. The
//! tracker adds one piece of memory the store cannot have: identifiers of
//! resources that were created remotely but could not be recorded. Those are
//! retried before any new create is attempted for the same object.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::object::{DeclaredObject, ObjectKey, Spec};
use crate::store::DesiredStore;

pub struct IdentityTracker<S: Spec> {
    store: Arc<dyn DesiredStore<S>>,
    unrecorded: DashMap<ObjectKey, String>,
}

impl<S: Spec> IdentityTracker<S> {
    pub fn new(store: Arc<dyn DesiredStore<S>>) -> Self {
        Self {
            store,
            unrecorded: DashMap::new(),
        }
    }

    /// The identifier recorded on the object, if any.
    pub fn get<'a>(&self, object: &'a DeclaredObject<S>) -> Option<&'a str> {
        object.external_id()
    }

    /// Record an identifier. Write-once; a different recorded value is a conflict.
    ///
    /// If the write fails for any other reason the identifier is remembered
    /// in memory so it can be recorded on the next attempt.
    pub async fn set(&self, key: &ObjectKey, external_id: &str) -> Result<(), StoreError> {
        match self.store.set_external_id(key, external_id).await {
            Ok(()) => {
                self.unrecorded.remove(key);
                info!(%key, external_id, "Recorded external ID");
                Ok(())
            }
            Err(e @ StoreError::Conflict { .. }) => Err(e),
            Err(e) => {
                warn!(%key, external_id, error = %e, "Failed to record external ID");
                self.unrecorded
                    .insert(key.clone(), external_id.to_string());
                Err(e)
            }
        }
    }

    /// An identifier that was created remotely but never recorded.
    pub fn unrecorded(&self, key: &ObjectKey) -> Option<String> {
        self.unrecorded.get(key).map(|id| id.value().clone())
    }

    /// Forget the recorded identifier so a replacement can be created.
    pub async fn clear(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.store.clear_external_id(key).await?;
        info!(%key, "Cleared external ID");
        Ok(())
    }

    /// Drop any in-memory state for a finalized object.
    pub fn discard(&self, key: &ObjectKey) {
        self.unrecorded.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_set_then_get() {
        let store = Arc::new(MemoryStore::<u64>::new());
        let key = ObjectKey::new("volume", "data");
        store.apply(key.clone(), 1).await.unwrap();
        let tracker = IdentityTracker::new(store.clone());

        tracker.set(&key, "abc123").await.unwrap();

        let object = store.get(&key).await.unwrap();
        assert_eq!(tracker.get(&object), Some("abc123"));
        assert_eq!(tracker.unrecorded(&key), None);
    }

    #[tokio::test]
    async fn test_conflict_is_not_remembered() {
        let store = Arc::new(MemoryStore::<u64>::new());
        let key = ObjectKey::new("volume", "data");
        store.apply(key.clone(), 1).await.unwrap();
        let tracker = IdentityTracker::new(store.clone());

        tracker.set(&key, "abc123").await.unwrap();
        let err = tracker.set(&key, "def456").await.unwrap_err();

        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(tracker.unrecorded(&key), None);
        let object = store.get(&key).await.unwrap();
        assert_eq!(object.external_id(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_failed_write_is_remembered() {
        let store = Arc::new(MemoryStore::<u64>::new());
        let key = ObjectKey::new("volume", "gone");
        let tracker = IdentityTracker::new(store);

        // Object missing from the store - the write cannot land
        assert!(tracker.set(&key, "abc123").await.is_err());
        assert_eq!(tracker.unrecorded(&key).as_deref(), Some("abc123"));

        tracker.discard(&key);
        assert_eq!(tracker.unrecorded(&key), None);
    }
}
