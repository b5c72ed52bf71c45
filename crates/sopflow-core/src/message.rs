use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload handed to a worker when the dispatch loop activates one of its tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskActivation {
    /// The task being activated.
    pub task_id: String,
    /// The plan that owns the task.
    pub plan_id: String,
    /// Free-text description of the work.
    pub description: String,
    /// Worker identity the task is assigned to.
    pub assignee: String,
}

/// Lifecycle of a collaboration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Submitted, waiting for a response or a timeout.
    Pending,
    /// The target finished the delegated work.
    Completed,
    /// The target tried and failed.
    Error,
    /// The target refused the delegation.
    Rejected,
    /// Nobody answered before the deadline.
    TimedOut,
}

impl RequestStatus {
    /// Every status except `Pending` is final.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }

    /// Whether the delegated work should count as done for the requester.
    pub fn is_success(self) -> bool {
        matches!(self, RequestStatus::Completed)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Completed => write!(f, "completed"),
            RequestStatus::Error => write!(f, "error"),
            RequestStatus::Rejected => write!(f, "rejected"),
            RequestStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Delegation message delivered to the target worker's inbound channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationMessage {
    /// Correlation id allocated by the broker.
    pub request_id: Uuid,
    /// Worker that asked for help.
    pub requester: String,
    /// Worker expected to answer.
    pub target: String,
    /// What the requester wants done.
    pub description: String,
    /// Opaque payload forwarded untouched.
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Answer to a [`CollaborationMessage`], delivered back to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationResponse {
    /// The request being answered.
    pub request_id: Uuid,
    /// Terminal status chosen by the responder.
    pub status: RequestStatus,
    /// Result text or failure reason.
    #[serde(default)]
    pub result: String,
}

impl CollaborationResponse {
    /// A successful answer.
    pub fn completed(request_id: Uuid, result: impl Into<String>) -> Self {
        Self {
            request_id,
            status: RequestStatus::Completed,
            result: result.into(),
        }
    }

    /// A failed answer.
    pub fn error(request_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            request_id,
            status: RequestStatus::Error,
            result: reason.into(),
        }
    }

    /// A refusal.
    pub fn rejected(request_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            request_id,
            status: RequestStatus::Rejected,
            result: reason.into(),
        }
    }
}
