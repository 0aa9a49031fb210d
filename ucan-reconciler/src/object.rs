//! Declared objects and their status conditions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identity of a declared object: resource kind plus object name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Desired parameters of one resource kind.
///
/// Blanket-implemented for any plain data type, so kinds only need the derives.
pub trait Spec:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Spec for T where
    T: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    /// The remote resource is usable.
    Ready,
    /// The last reconcile cycle completed without error.
    Synced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    Available,
    Creating,
    Deleting,
    Unavailable,
    ReconcileSuccess,
    ReconcileError,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::Available => "Available",
            Reason::Creating => "Creating",
            Reason::Deleting => "Deleting",
            Reason::Unavailable => "Unavailable",
            Reason::ReconcileSuccess => "ReconcileSuccess",
            Reason::ReconcileError => "ReconcileError",
        };
        f.write_str(s)
    }
}

/// One observable status entry on a declared object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: Reason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(condition_type: ConditionType, status: ConditionStatus, reason: Reason) -> Self {
        Self {
            condition_type,
            status,
            reason,
            message: None,
            last_transition_time: Utc::now(),
        }
    }

    pub fn available() -> Self {
        Self::new(ConditionType::Ready, ConditionStatus::True, Reason::Available)
    }

    pub fn creating() -> Self {
        Self::new(ConditionType::Ready, ConditionStatus::False, Reason::Creating)
    }

    pub fn deleting() -> Self {
        Self::new(ConditionType::Ready, ConditionStatus::False, Reason::Deleting)
    }

    pub fn unavailable() -> Self {
        Self::new(ConditionType::Ready, ConditionStatus::False, Reason::Unavailable)
    }

    pub fn reconcile_success() -> Self {
        Self::new(
            ConditionType::Synced,
            ConditionStatus::True,
            Reason::ReconcileSuccess,
        )
    }

    pub fn reconcile_error(message: impl Into<String>) -> Self {
        Self::new(
            ConditionType::Synced,
            ConditionStatus::False,
            Reason::ReconcileError,
        )
        .with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Equal in everything but the transition time.
    pub fn same_state(&self, other: &Condition) -> bool {
        self.condition_type == other.condition_type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// A user's desired state for one remote resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclaredObject<S> {
    pub key: ObjectKey,
    pub spec: S,
    /// Opaque remote identifier, written once after a successful create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_requested: Option<DateTime<Utc>>,
}

impl<S> DeclaredObject<S> {
    pub fn new(key: ObjectKey, spec: S) -> Self {
        Self {
            key,
            spec,
            external_id: None,
            conditions: Vec::new(),
            deletion_requested: None,
        }
    }

    /// The recorded remote identifier; an empty string counts as absent.
    pub fn external_id(&self) -> Option<&str> {
        self.external_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn is_deletion_requested(&self) -> bool {
        self.deletion_requested.is_some()
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Set a condition, last writer wins per type.
    ///
    /// Returns false when an identical condition was already present; the
    /// existing transition time is kept in that case.
    pub fn set_condition(&mut self, condition: Condition) -> bool {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) if existing.same_state(&condition) => false,
            Some(existing) => {
                *existing = condition;
                true
            }
            None => {
                self.conditions.push(condition);
                true
            }
        }
    }
}
