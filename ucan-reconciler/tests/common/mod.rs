//! Shared test utilities for ucan-reconciler integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use ucan_reconciler::{
    ClientError, Condition, DeclaredObject, DesiredStore, ExternalClient, KindPolicy,
    MemoryStore, ObjectKey, Observation, Operation, Readiness, Reconciler, RemoteResource,
    StoreError, StoreEvent,
};

pub const KIND: &str = "disk";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub size_gb: u64,
    pub label: String,
}

pub fn disk(size_gb: u64, label: &str) -> DiskSpec {
    DiskSpec {
        size_gb,
        label: label.to_string(),
    }
}

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(KIND, name)
}

/// Decrements the in-flight counter when a stubbed call ends.
struct Probe<'a>(&'a AtomicUsize);

impl Drop for Probe<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory remote API with call counters and injectable failures.
pub struct StubClient {
    remote: Mutex<HashMap<String, RemoteResource>>,
    ids: Mutex<VecDeque<String>>,
    failures: Mutex<HashMap<Operation, VecDeque<ClientError>>>,
    existing: Mutex<Option<String>>,
    delay: Duration,
    policy: KindPolicy,
    initial_state: String,
    pub creates: AtomicUsize,
    pub observes: AtomicUsize,
    pub updates: AtomicUsize,
    pub deletes: AtomicUsize,
    pub lookups: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StubClient {
    pub fn new() -> Self {
        Self {
            remote: Mutex::new(HashMap::new()),
            ids: Mutex::new(VecDeque::from(["abc123".to_string(), "def456".to_string()])),
            failures: Mutex::new(HashMap::new()),
            existing: Mutex::new(None),
            delay: Duration::ZERO,
            policy: KindPolicy::default(),
            initial_state: "available".to_string(),
            creates: AtomicUsize::new(0),
            observes: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every call sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_policy(mut self, policy: KindPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// State of freshly created resources.
    pub fn with_initial_state(mut self, state: &str) -> Self {
        self.initial_state = state.to_string();
        self
    }

    /// Fail the next call of `operation` with `error`.
    pub fn fail_next(&self, operation: Operation, error: ClientError) {
        self.failures
            .lock()
            .unwrap()
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub fn insert_remote(&self, id: &str, state: &str, label: &str) {
        let resource = RemoteResource::new(id, state).with_attribute("label", label);
        self.remote.lock().unwrap().insert(id.to_string(), resource);
    }

    pub fn set_state(&self, id: &str, state: &str) {
        if let Some(resource) = self.remote.lock().unwrap().get_mut(id) {
            resource.state = state.to_string();
        }
    }

    pub fn remove_remote(&self, id: &str) {
        self.remote.lock().unwrap().remove(id);
    }

    pub fn remote(&self, id: &str) -> Option<RemoteResource> {
        self.remote.lock().unwrap().get(id).cloned()
    }

    pub fn remote_count(&self) -> usize {
        self.remote.lock().unwrap().len()
    }

    /// Make `find_existing` report `id`.
    pub fn set_existing(&self, id: &str) {
        *self.existing.lock().unwrap() = Some(id.to_string());
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(
        &self,
        operation: Operation,
        counter: &AtomicUsize,
    ) -> Result<Probe<'_>, ClientError> {
        counter.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let probe = Probe(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let injected = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&operation)
            .and_then(VecDeque::pop_front);
        match injected {
            Some(error) => Err(error),
            None => Ok(probe),
        }
    }

    fn next_id(&self) -> String {
        let mut ids = self.ids.lock().unwrap();
        ids.pop_front()
            .unwrap_or_else(|| format!("disk-{}", Self::count(&self.creates)))
    }
}

#[async_trait]
impl ExternalClient for StubClient {
    type Spec = DiskSpec;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn policy(&self) -> KindPolicy {
        self.policy
    }

    fn validate(&self, spec: &DiskSpec) -> Result<(), String> {
        if spec.size_gb == 0 {
            return Err("size_gb must be positive".to_string());
        }
        Ok(())
    }

    async fn observe(
        &self,
        _object: &DeclaredObject<DiskSpec>,
        external_id: &str,
    ) -> Result<Observation, ClientError> {
        let _probe = self.enter(Operation::Observe, &self.observes).await?;
        match self.remote(external_id) {
            Some(resource) => Ok(Observation::Present(resource)),
            None => Err(ClientError::NotFound),
        }
    }

    async fn create(&self, object: &DeclaredObject<DiskSpec>) -> Result<String, ClientError> {
        let _probe = self.enter(Operation::Create, &self.creates).await?;
        let id = self.next_id();
        self.insert_remote(&id, &self.initial_state, &object.spec.label);
        Ok(id)
    }

    async fn update(
        &self,
        object: &DeclaredObject<DiskSpec>,
        remote: &RemoteResource,
    ) -> Result<(), ClientError> {
        let _probe = self.enter(Operation::Update, &self.updates).await?;
        self.insert_remote(&remote.id, &remote.state, &object.spec.label);
        Ok(())
    }

    async fn delete(
        &self,
        _object: &DeclaredObject<DiskSpec>,
        external_id: &str,
    ) -> Result<(), ClientError> {
        let _probe = self.enter(Operation::Delete, &self.deletes).await?;
        match self.remote.lock().unwrap().remove(external_id) {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound),
        }
    }

    fn readiness(&self, remote: &RemoteResource) -> Readiness {
        match remote.state.as_str() {
            "available" => Readiness::Ready,
            "creating" => Readiness::Transitional,
            _ => Readiness::Failed,
        }
    }

    fn is_up_to_date(&self, spec: &DiskSpec, remote: &RemoteResource) -> bool {
        remote.str_attribute("label") == spec.label
    }

    async fn find_existing(
        &self,
        _object: &DeclaredObject<DiskSpec>,
    ) -> Result<Option<String>, ClientError> {
        let _probe = self.enter(Operation::Lookup, &self.lookups).await?;
        Ok(self.existing.lock().unwrap().clone())
    }
}

/// Store wrapper that fails a number of external ID writes.
pub struct FlakyStore {
    inner: MemoryStore<DiskSpec>,
    identity_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            identity_failures: AtomicUsize::new(0),
        }
    }

    pub fn fail_identity_writes(&self, times: usize) {
        self.identity_failures.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl DesiredStore<DiskSpec> for FlakyStore {
    async fn get(&self, key: &ObjectKey) -> Option<DeclaredObject<DiskSpec>> {
        self.inner.get(key).await
    }

    async fn list(&self) -> Vec<ObjectKey> {
        self.inner.list().await
    }

    async fn apply(&self, key: ObjectKey, spec: DiskSpec) -> Result<(), StoreError> {
        self.inner.apply(key, spec).await
    }

    async fn request_deletion(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.inner.request_deletion(key).await
    }

    async fn set_external_id(&self, key: &ObjectKey, external_id: &str) -> Result<(), StoreError> {
        let failing = self
            .identity_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Persist("disk full".to_string()));
        }
        self.inner.set_external_id(key, external_id).await
    }

    async fn clear_external_id(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.inner.clear_external_id(key).await
    }

    async fn set_condition(
        &self,
        key: &ObjectKey,
        condition: Condition,
    ) -> Result<bool, StoreError> {
        self.inner.set_condition(key, condition).await
    }

    async fn remove(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.inner.remove(key).await
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.subscribe()
    }
}

/// A reconciler over a fresh in-memory store.
pub fn setup(
    client: StubClient,
) -> (
    Arc<StubClient>,
    Arc<MemoryStore<DiskSpec>>,
    Reconciler<StubClient>,
) {
    let client = Arc::new(client);
    let store: Arc<MemoryStore<DiskSpec>> = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::new(client.clone(), store.clone(), CancellationToken::new());
    (client, store, reconciler)
}
