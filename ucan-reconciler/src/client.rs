//! External client contract - the four primitive remote operations.
//!
//! One implementation exists per resource kind. The engine never talks to a
//! remote API directly; everything goes through this trait.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::ClientError;
use crate::object::{DeclaredObject, Spec};

/// The provider's view of a resource, fetched fresh on every observe.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResource {
    pub id: String,
    /// Provider-defined lifecycle label, e.g. "creating" or "available".
    pub state: String,
    pub attributes: Map<String, Value>,
}

impl RemoteResource {
    pub fn new(id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: state.into(),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// String attribute, with null and missing read as "".
    pub fn str_attribute(&self, name: &str) -> &str {
        self.attributes
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn u64_attribute(&self, name: &str) -> Option<u64> {
        self.attributes.get(name).and_then(Value::as_u64)
    }
}

/// Result of an observe call.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// The remote confirmed the resource does not exist.
    Absent,
    Present(RemoteResource),
}

/// Where a remote resource is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Usable; eligible for drift detection.
    Ready,
    /// Still converging on the provider side; leave it alone.
    Transitional,
    /// Settled in a state that is not usable (error, shut off).
    Failed,
}

/// What to do when a recorded resource is gone on observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbsentPolicy {
    /// Clear the external ID so the next cycle creates a replacement.
    #[default]
    Recreate,
    /// Surface a permanent error and leave the identity in place.
    Fail,
}

/// What to do when deletion is requested before any ID was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Nothing exists remotely; drop the object.
    #[default]
    Finalize,
    /// Refuse and keep the object until an operator intervenes.
    Fail,
}

/// Per-kind handling of the two ambiguous not-found cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KindPolicy {
    pub on_absent: AbsentPolicy,
    pub on_delete_without_id: DeletePolicy,
}

/// Trait for per-kind remote clients.
#[async_trait]
pub trait ExternalClient: Send + Sync + 'static {
    /// The declared parameters of this kind.
    type Spec: Spec;

    /// Kind name, matching `ObjectKey::kind` of the objects it serves.
    fn kind(&self) -> &'static str;

    fn policy(&self) -> KindPolicy {
        KindPolicy::default()
    }

    /// Reject specs that can never produce a valid create request.
    fn validate(&self, _spec: &Self::Spec) -> Result<(), String> {
        Ok(())
    }

    /// Fetch the current remote state. Not-found must map to `Observation::Absent`.
    async fn observe(
        &self,
        object: &DeclaredObject<Self::Spec>,
        external_id: &str,
    ) -> Result<Observation, ClientError>;

    /// Create the remote resource and return its ID.
    async fn create(&self, object: &DeclaredObject<Self::Spec>) -> Result<String, ClientError>;

    /// Push the declared spec onto an existing resource.
    async fn update(
        &self,
        object: &DeclaredObject<Self::Spec>,
        remote: &RemoteResource,
    ) -> Result<(), ClientError>;

    /// Delete the remote resource. Implementations may return either `Ok` or
    /// `ClientError::NotFound` when it is already gone.
    async fn delete(
        &self,
        object: &DeclaredObject<Self::Spec>,
        external_id: &str,
    ) -> Result<(), ClientError>;

    fn readiness(&self, remote: &RemoteResource) -> Readiness;

    /// Field-level comparison of the declared spec against observed attributes.
    fn is_up_to_date(&self, spec: &Self::Spec, remote: &RemoteResource) -> bool;

    /// Find a resource created for this object whose ID was never recorded.
    async fn find_existing(
        &self,
        _object: &DeclaredObject<Self::Spec>,
    ) -> Result<Option<String>, ClientError> {
        Ok(None)
    }
}

/// Builds a client from opaque credential bytes.
pub trait ClientFactory: Send + Sync {
    type Client: ExternalClient;

    fn connect(&self, credentials: &[u8]) -> Result<Self::Client, ClientError>;
}
