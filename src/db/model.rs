//! Row models returned by the local store.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};

use crate::model::{Id, Role, TransitionKind, TransitionOutcome, User};

/// The persisted login, at most one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub token: String,
    pub user: User,
    pub logged_in_at: DateTime<Utc>,
}

impl StoredSession {
    pub fn role(&self) -> Role {
        self.user.role
    }
}

/// One status write attempted by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub id: i64,
    pub card_id: Id,
    pub from_status: Option<String>,
    pub to_status: String,
    pub kind: TransitionKind,
    pub outcome: TransitionOutcome,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
