//! Condition publisher - records observable status on declared objects.

use std::sync::Arc;

use tracing::{info, warn};

use crate::object::{Condition, ObjectKey, Spec};
use crate::store::DesiredStore;

pub struct ConditionPublisher<S: Spec> {
    store: Arc<dyn DesiredStore<S>>,
}

impl<S: Spec> ConditionPublisher<S> {
    pub fn new(store: Arc<dyn DesiredStore<S>>) -> Self {
        Self { store }
    }

    /// Publish a condition. Safe to call every cycle; only transitions are logged.
    ///
    /// Failures are logged and swallowed: status is a side effect and never
    /// steers the reconcile cycle.
    pub async fn publish(&self, key: &ObjectKey, condition: Condition) {
        let condition_type = condition.condition_type;
        let status = condition.status;
        let reason = condition.reason;
        let detail = condition.message.clone().unwrap_or_default();

        match self.store.set_condition(key, condition).await {
            Ok(true) => info!(
                target: "conditions",
                %key,
                condition = ?condition_type,
                status = ?status,
                %reason,
                detail = %detail,
                "Condition changed"
            ),
            Ok(false) => {}
            Err(e) => warn!(%key, error = %e, "Failed to publish condition"),
        }
    }
}
