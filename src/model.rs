use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::pipeline::{Status, UnknownStatus};

/// Backend identifiers are opaque integers.
pub type Id = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "user" => Some(Role::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: Id,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::User
}

impl User {
    /// Stand-in used when the backend has not returned a user record yet.
    pub fn placeholder(id: Id) -> Self {
        Self {
            id,
            name: format!("User {}", id),
            email: String::new(),
            role: Role::User,
        }
    }
}

/// One immutable entry in a card's status history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEvent {
    #[serde(default)]
    pub id: Option<Id>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn status(&self) -> Result<Status, UnknownStatus> {
        self.status.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Certificate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    pub cert_url: String,
}

impl Certificate {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: None,
            cert_url: url.into(),
        }
    }
}

/// A single card submitted for grading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardSubmission {
    pub id: Id,
    pub user_id: Id,
    #[serde(default)]
    pub batch_id: Option<Id>,
    pub name: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub grade_target: String,
    #[serde(default)]
    pub grade: Option<String>,
    #[serde(default)]
    pub payment_url: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub certificates: Vec<Certificate>,
    #[serde(default)]
    pub latest_status: Option<StatusEvent>,
    #[serde(default)]
    pub statuses: Vec<StatusEvent>,
    #[serde(default)]
    pub user: Option<User>,
    pub created_at: DateTime<Utc>,
}

impl CardSubmission {
    /// Most recent status event across `statuses` and `latest_status`.
    pub fn latest_event(&self) -> Option<&StatusEvent> {
        let from_history = self.statuses.iter().max_by_key(|e| e.created_at);
        match (from_history, self.latest_status.as_ref()) {
            (Some(h), Some(l)) if l.created_at > h.created_at => Some(l),
            (Some(h), _) => Some(h),
            (None, l) => l,
        }
    }

    /// Current pipeline status. A card without any event is freshly submitted.
    pub fn current_status(&self) -> Result<Status, UnknownStatus> {
        match self.latest_event() {
            Some(event) => event.status(),
            None => Ok(Status::Submit),
        }
    }

    pub fn owner_name(&self) -> String {
        self.user
            .as_ref()
            .map(|u| u.name.clone())
            .unwrap_or_else(|| User::placeholder(self.user_id).name)
    }
}

/// Payload for a new submission; the backend assigns status `submit`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewSubmission {
    pub name: String,
    pub year: Option<i32>,
    pub brand: String,
    pub grade_target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Id>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BatchCategory {
    #[serde(rename = "PSA-Japan")]
    PsaJapan,
    #[serde(rename = "PSA-USA")]
    PsaUsa,
    #[serde(rename = "CGC")]
    Cgc,
}

impl BatchCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchCategory::PsaJapan => "PSA-Japan",
            BatchCategory::PsaUsa => "PSA-USA",
            BatchCategory::Cgc => "CGC",
        }
    }
}

impl fmt::Display for BatchCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PSA-JAPAN" => Ok(BatchCategory::PsaJapan),
            "PSA-USA" => Ok(BatchCategory::PsaUsa),
            "CGC" => Ok(BatchCategory::Cgc),
            other => Err(format!(
                "unknown batch category '{}' (expected PSA-Japan, PSA-USA or CGC)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Batch {
    pub id: Id,
    pub name: String,
    pub category: BatchCategory,
    #[serde(default)]
    pub services: String,
    pub is_active: bool,
    #[serde(default)]
    pub register_number: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewBatch {
    pub name: String,
    pub category: BatchCategory,
    pub services: String,
    pub register_number: String,
    pub is_active: bool,
}

/// Partial update for `PUT /batches/{id}`; absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

/// Payment-link record for one (batch, user) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchPayment {
    pub id: Id,
    pub batch_id: Id,
    pub user_id: Id,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub payment_url: Option<String>,
    #[serde(default)]
    pub is_sent: bool,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
}

impl BatchPayment {
    /// A link counts as set only when it has non-blank text.
    pub fn has_link(&self) -> bool {
        self.payment_url
            .as_deref()
            .is_some_and(|u| !u.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewBatchPayment {
    pub batch_id: Id,
    pub user_id: Id,
    pub payment_url: String,
}

/// Entry-level queue row returned by `GET /batches/{id}/entries`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: Id,
    pub batch_id: Id,
    pub user_id: Id,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub user: Option<User>,
}

/// User-level queue row returned by `GET /batches/{id}/user-queue`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserQueueSlot {
    pub user_id: Id,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

/// Kind of status write issued by this client, kept in the local log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransitionKind {
    Advance,
    Reject,
    Certify,
    UserConfirm,
    Override,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Advance => "advance",
            TransitionKind::Reject => "reject",
            TransitionKind::Certify => "certify",
            TransitionKind::UserConfirm => "user_confirm",
            TransitionKind::Override => "override",
        }
    }

    pub fn parse(raw: &str) -> Option<TransitionKind> {
        match raw {
            "advance" => Some(TransitionKind::Advance),
            "reject" => Some(TransitionKind::Reject),
            "certify" => Some(TransitionKind::Certify),
            "user_confirm" => Some(TransitionKind::UserConfirm),
            "override" => Some(TransitionKind::Override),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    Failed,
}

impl TransitionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionOutcome::Applied => "applied",
            TransitionOutcome::Failed => "failed",
        }
    }
}
