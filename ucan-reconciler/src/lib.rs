//! ucan-reconciler: drives remote resources toward their declared state.
//!
//! The engine is split into:
//! - `store`: desired-state objects and their change events
//! - `identity` / `conditions`: the two writers the engine owns on a declared object
//! - `reconciler`: the per-object state machine (observe, create, update, delete)
//! - `queue` / `scheduler`: keyed work queue, worker pool, poll and backoff requeues

pub mod backoff;
pub mod client;
pub mod conditions;
pub mod error;
pub mod identity;
pub mod object;
pub mod queue;
pub mod reconciler;
pub mod scheduler;
pub mod store;

pub use backoff::Backoff;
pub use client::{
    AbsentPolicy, ClientFactory, DeletePolicy, ExternalClient, KindPolicy, Observation, Readiness,
    RemoteResource,
};
pub use conditions::ConditionPublisher;
pub use error::{ClientError, ErrorClass, Operation, ReconcileError, StoreError};
pub use identity::IdentityTracker;
pub use object::{
    Condition, ConditionStatus, ConditionType, DeclaredObject, ObjectKey, Reason, Spec,
};
pub use queue::WorkQueue;
pub use reconciler::{Outcome, Reconciler, Requeue};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{DesiredStore, MemoryStore, StoreEvent};
