//! Error types for the reconciliation engine.

use std::fmt;

use thiserror::Error;

use crate::object::ObjectKey;

/// Errors returned by an external client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// The request never produced a response (connect, timeout, TLS).
    #[error("transport: {0}")]
    Transport(String),

    /// The remote answered with a non-success status other than not-found.
    #[error("remote returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The remote resource does not exist.
    #[error("remote resource not found")]
    NotFound,

    /// The response could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),

    /// The request could not be built from the declared state.
    #[error("invalid request: {0}")]
    Invalid(String),
}

/// Errors that can occur during desired-state store operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Object not found.
    #[error("not found: {0}")]
    NotFound(ObjectKey),

    /// A different external ID is already recorded for the object.
    #[error("identity conflict on {key}: {existing} is recorded, refusing {attempted}")]
    Conflict {
        key: ObjectKey,
        existing: String,
        attempted: String,
    },

    /// The change could not be made durable.
    #[error("persist: {0}")]
    Persist(String),
}

/// The remote operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Observe,
    Create,
    Update,
    Delete,
    Lookup,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Observe => "observe",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Lookup => "lookup",
        };
        f.write_str(s)
    }
}

/// How the scheduler should treat a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry on the exponential backoff ladder.
    Transient,
    /// Do not retry until the declared spec changes.
    Permanent,
    /// The remote sent something undecodable; retry at the slowest rate.
    Poison,
}

/// Errors produced by one reconcile cycle.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{operation} failed: {source}")]
    Client {
        operation: Operation,
        #[source]
        source: ClientError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The remote resource was created but its ID could not be recorded.
    #[error("created remote resource {external_id} but could not record it: {source}")]
    IdentityLost {
        external_id: String,
        #[source]
        source: StoreError,
    },

    #[error("invalid spec: {0}")]
    Validation(String),

    #[error("remote resource {0} no longer exists and this kind does not recreate")]
    ExternalResourceMissing(String),

    #[error("deletion requested but no external ID is recorded")]
    MissingIdentity,

    #[error("reconcile cancelled")]
    Cancelled,
}

impl ReconcileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Client { source, .. } => match source {
                ClientError::Decode(_) => ErrorClass::Poison,
                ClientError::Invalid(_) => ErrorClass::Permanent,
                _ => ErrorClass::Transient,
            },
            ReconcileError::Store(StoreError::Conflict { .. })
            | ReconcileError::IdentityLost {
                source: StoreError::Conflict { .. },
                ..
            } => ErrorClass::Permanent,
            ReconcileError::Store(_) | ReconcileError::IdentityLost { .. } => ErrorClass::Transient,
            ReconcileError::Validation(_)
            | ReconcileError::ExternalResourceMissing(_)
            | ReconcileError::MissingIdentity => ErrorClass::Permanent,
            ReconcileError::Cancelled => ErrorClass::Transient,
        }
    }
}
