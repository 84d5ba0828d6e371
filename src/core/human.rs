//! Human interaction records.

use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InteractionId(pub Uuid);

impl InteractionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for InteractionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InteractionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for InteractionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    /// The system needs information before it can continue.
    InputRequest,
    /// A human should look at something that went wrong.
    Intervention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    Pending,
    Answered,
    Ignored,
}

/// A request for (or record of) human intervention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanInteraction {
    pub id: InteractionId,
    pub interaction_type: InteractionType,
    /// Required requests block the owning task.
    pub required: bool,
    pub status: InteractionStatus,
    /// The task that is blocked (or advised).
    pub task_id: TaskId,
    /// The failed subtask that prompted the request, if any.
    pub subtask_id: Option<TaskId>,
    pub question: String,
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl HumanInteraction {
    pub fn new(
        interaction_type: InteractionType,
        task_id: TaskId,
        question: &str,
        required: bool,
    ) -> Self {
        Self {
            id: InteractionId::new(),
            interaction_type,
            required,
            status: InteractionStatus::Pending,
            task_id,
            subtask_id: None,
            question: question.to_string(),
            response: None,
            created_at: Utc::now(),
            expires_at: None,
            resolved_at: None,
        }
    }

    pub fn about_subtask(mut self, subtask_id: TaskId) -> Self {
        self.subtask_id = Some(subtask_id);
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == InteractionStatus::Pending
    }

    pub fn is_blocking(&self) -> bool {
        self.required && self.is_pending()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}
