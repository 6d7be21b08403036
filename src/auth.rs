//! Actor context for stock mutations.
//!
//! Authentication itself happens in the outer layers. The engine only needs to
//! know who is acting so every ledger entry can be stamped, and it refuses to
//! mutate stock for an anonymous caller.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Identity of the caller of a mutating operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub user_id: Option<Uuid>,
}

impl ActorContext {
    pub fn authenticated(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
        }
    }

    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    /// Returns the actor id or `AuthenticationRequired`.
    pub fn require(&self) -> Result<Uuid, ServiceError> {
        self.user_id.ok_or(ServiceError::AuthenticationRequired)
    }
}
