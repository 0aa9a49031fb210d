//! Reconciler core - the per-object state machine.
//!
//! One cycle reads the declared object, decides between create, observe,
//! update and delete, makes at most one mutating remote call and records
//! the result through the identity tracker and condition publisher.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{AbsentPolicy, DeletePolicy, ExternalClient, Observation, Readiness};
use crate::conditions::ConditionPublisher;
use crate::error::{ClientError, Operation, ReconcileError, StoreError};
use crate::identity::IdentityTracker;
use crate::object::{Condition, DeclaredObject, ObjectKey};
use crate::store::DesiredStore;

/// What a successful cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A remote resource was created and its ID recorded.
    Created,
    /// An ID for a resource created earlier was recorded without a new create.
    Recovered,
    /// The remote resource is still converging.
    Pending,
    Available,
    /// The remote resource settled in a state that is not usable.
    Unavailable,
    Updated,
    /// The recorded resource is gone; the ID was cleared for a fresh create.
    Recreate,
    /// The remote resource is deleted and the object finalized.
    Deleted,
    /// The object no longer exists in the store.
    Gone,
}

/// When the scheduler should look at the object again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Poll,
    Immediately,
    Forget,
}

impl Outcome {
    pub fn requeue(self) -> Requeue {
        match self {
            Outcome::Recovered | Outcome::Recreate => Requeue::Immediately,
            Outcome::Deleted | Outcome::Gone => Requeue::Forget,
            Outcome::Created
            | Outcome::Pending
            | Outcome::Available
            | Outcome::Unavailable
            | Outcome::Updated => Requeue::Poll,
        }
    }
}

type Result<T> = std::result::Result<T, ReconcileError>;

/// Lock table keyed by object.
///
/// An entry is only dropped while no other cycle holds or waits on it, so a
/// queued cycle always serializes against the one running.
#[derive(Default)]
struct KeyLocks {
    locks: DashMap<ObjectKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    fn get(&self, key: &ObjectKey) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    /// Drop the entry for `key` if `lock` is it and the caller holds the
    /// only other reference.
    fn evict(&self, key: &ObjectKey, lock: &Arc<Mutex<()>>) {
        // The table's own reference plus the caller's
        self.locks
            .remove_if(key, |_, held| Arc::ptr_eq(held, lock) && Arc::strong_count(held) == 2);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

pub struct Reconciler<C: ExternalClient> {
    client: Arc<C>,
    store: Arc<dyn DesiredStore<C::Spec>>,
    identities: IdentityTracker<C::Spec>,
    conditions: ConditionPublisher<C::Spec>,
    cancel: CancellationToken,
    /// Per-key locks; cycles for different objects never contend.
    locks: KeyLocks,
}

impl<C: ExternalClient> Reconciler<C> {
    pub fn new(
        client: Arc<C>,
        store: Arc<dyn DesiredStore<C::Spec>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            identities: IdentityTracker::new(store.clone()),
            conditions: ConditionPublisher::new(store.clone()),
            store,
            cancel,
            locks: KeyLocks::default(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.client.kind()
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn store(&self) -> &Arc<dyn DesiredStore<C::Spec>> {
        &self.store
    }

    pub fn identities(&self) -> &IdentityTracker<C::Spec> {
        &self.identities
    }

    /// Run one reconcile cycle for `key`.
    ///
    /// Cycles for the same key are serialized. A failed cycle is recorded
    /// as a `Synced=False` condition before the error is returned.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome> {
        let lock = self.locks.get(key);
        let _guard = lock.lock().await;

        let result = self.reconcile_locked(key).await;
        match &result {
            Ok(Outcome::Deleted | Outcome::Gone) => {
                self.locks.evict(key, &lock);
            }
            Ok(_) => {}
            // Nothing left to annotate
            Err(ReconcileError::Store(StoreError::NotFound(_)) | ReconcileError::Cancelled) => {}
            Err(e) => {
                self.conditions
                    .publish(key, Condition::reconcile_error(e.to_string()))
                    .await;
            }
        }
        result
    }

    async fn reconcile_locked(&self, key: &ObjectKey) -> Result<Outcome> {
        let Some(object) = self.store.get(key).await else {
            debug!(%key, "Object no longer declared");
            return Ok(Outcome::Gone);
        };

        if object.is_deletion_requested() {
            return self.finalize(&object).await;
        }

        match self.identities.get(&object) {
            Some(external_id) => self.observe(&object, external_id).await,
            None => self.create(&object).await,
        }
    }

    /// Issue a remote call, aborting it if the process is shutting down.
    async fn call<T>(
        &self,
        operation: Operation,
        request: impl Future<Output = std::result::Result<T, ClientError>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ReconcileError::Cancelled),
            result = request => {
                result.map_err(|source| ReconcileError::Client { operation, source })
            }
        }
    }

    /// Record `external_id` for an object whose remote resource exists.
    async fn record(&self, key: &ObjectKey, external_id: String) -> Result<()> {
        self.identities
            .set(key, &external_id)
            .await
            .map_err(|source| {
                error!(
                    %key,
                    %external_id,
                    error = %source,
                    "Remote resource exists but its ID could not be recorded"
                );
                ReconcileError::IdentityLost {
                    external_id,
                    source,
                }
            })
    }

    async fn create(&self, object: &DeclaredObject<C::Spec>) -> Result<Outcome> {
        let key = &object.key;

        // A previous create succeeded but was never recorded
        if let Some(external_id) = self.identities.unrecorded(key) {
            info!(%key, %external_id, "Recording previously created resource");
            self.record(key, external_id).await?;
            return Ok(Outcome::Recovered);
        }

        self.client
            .validate(&object.spec)
            .map_err(ReconcileError::Validation)?;

        if let Some(external_id) = self
            .call(Operation::Lookup, self.client.find_existing(object))
            .await?
        {
            info!(%key, %external_id, "Adopting existing remote resource");
            self.record(key, external_id).await?;
            return Ok(Outcome::Recovered);
        }

        let external_id = self
            .call(Operation::Create, self.client.create(object))
            .await?;
        // Nothing may run between a successful create and recording its ID
        self.record(key, external_id.clone()).await?;
        info!(%key, %external_id, "Created remote resource");

        self.conditions.publish(key, Condition::creating()).await;
        self.conditions
            .publish(key, Condition::reconcile_success())
            .await;
        Ok(Outcome::Created)
    }

    async fn observe(
        &self,
        object: &DeclaredObject<C::Spec>,
        external_id: &str,
    ) -> Result<Outcome> {
        let key = &object.key;

        let observation = match self
            .call(Operation::Observe, self.client.observe(object, external_id))
            .await
        {
            Err(ReconcileError::Client {
                source: ClientError::NotFound,
                ..
            }) => Observation::Absent,
            other => other?,
        };

        let remote = match observation {
            Observation::Present(remote) => remote,
            Observation::Absent => return self.absent(key, external_id).await,
        };

        match self.client.readiness(&remote) {
            Readiness::Transitional => {
                debug!(
                    %key,
                    external_id,
                    state = %remote.state,
                    "Remote resource still converging"
                );
                Ok(Outcome::Pending)
            }
            Readiness::Failed => {
                self.conditions
                    .publish(
                        key,
                        Condition::unavailable()
                            .with_message(format!("remote state is {}", remote.state)),
                    )
                    .await;
                self.conditions
                    .publish(key, Condition::reconcile_success())
                    .await;
                Ok(Outcome::Unavailable)
            }
            Readiness::Ready if !self.client.is_up_to_date(&object.spec, &remote) => {
                self.client
                    .validate(&object.spec)
                    .map_err(ReconcileError::Validation)?;
                info!(%key, external_id, "Remote resource drifted, updating");
                self.call(Operation::Update, self.client.update(object, &remote))
                    .await?;
                self.conditions
                    .publish(key, Condition::reconcile_success())
                    .await;
                Ok(Outcome::Updated)
            }
            Readiness::Ready => {
                self.conditions.publish(key, Condition::available()).await;
                self.conditions
                    .publish(key, Condition::reconcile_success())
                    .await;
                Ok(Outcome::Available)
            }
        }
    }

    /// The recorded resource was confirmed absent on observe.
    async fn absent(&self, key: &ObjectKey, external_id: &str) -> Result<Outcome> {
        match self.client.policy().on_absent {
            AbsentPolicy::Recreate => {
                warn!(%key, external_id, "Remote resource disappeared, scheduling recreate");
                self.identities.clear(key).await?;
                self.conditions
                    .publish(
                        key,
                        Condition::unavailable().with_message(format!(
                            "remote resource {} no longer exists",
                            external_id
                        )),
                    )
                    .await;
                Ok(Outcome::Recreate)
            }
            AbsentPolicy::Fail => Err(ReconcileError::ExternalResourceMissing(
                external_id.to_string(),
            )),
        }
    }

    async fn finalize(&self, object: &DeclaredObject<C::Spec>) -> Result<Outcome> {
        let key = &object.key;

        let mut external_id = self
            .identities
            .get(object)
            .map(str::to_string)
            .or_else(|| self.identities.unrecorded(key));
        if external_id.is_none() {
            external_id = self
                .call(Operation::Lookup, self.client.find_existing(object))
                .await?;
        }

        match external_id {
            Some(external_id) => {
                self.conditions.publish(key, Condition::deleting()).await;
                match self
                    .call(Operation::Delete, self.client.delete(object, &external_id))
                    .await
                {
                    Ok(()) => info!(%key, %external_id, "Deleted remote resource"),
                    Err(ReconcileError::Client {
                        source: ClientError::NotFound,
                        ..
                    }) => info!(%key, %external_id, "Remote resource already gone"),
                    Err(e) => return Err(e),
                }
            }
            None if self.client.policy().on_delete_without_id == DeletePolicy::Fail => {
                return Err(ReconcileError::MissingIdentity);
            }
            None => debug!(%key, "No remote resource was ever recorded"),
        }

        self.store.remove(key).await?;
        self.identities.discard(key);
        info!(%key, "Finalized object");
        Ok(Outcome::Deleted)
    }
}
