use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sopflow_core::RequestStatus;
use std::collections::HashMap;
use uuid::Uuid;

/// Aggregate status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    /// At least one task is not terminal yet.
    Running,
    /// Every task is terminal and none failed.
    Completed,
    /// Every task is terminal and at least one failed.
    Error,
}

impl PlanStatus {
    /// `completed` or `error`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, PlanStatus::Running)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStatus::Running => write!(f, "running"),
            PlanStatus::Completed => write!(f, "completed"),
            PlanStatus::Error => write!(f, "error"),
        }
    }
}

/// Status of a task in a plan.
///
/// Tasks only move forward: `ready → inprogress → {completed, error, skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for its assignee.
    Ready,
    /// Owned by a worker context.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with a failure.
    Error,
    /// Closed without running.
    Skipped,
}

impl TaskStatus {
    /// `completed`, `error` or `skipped`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Skipped
        )
    }

    /// Whether the task state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Ready => next == TaskStatus::InProgress,
            TaskStatus::InProgress => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::InProgress => write!(f, "inprogress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Error => write!(f, "error"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// A free-form remark attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub note_id: Uuid,
    /// Worker or operator that wrote the note.
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Note {
    /// A note stamped with the current time.
    pub fn new(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            note_id: Uuid::new_v4(),
            author: author.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The internal sub-plan a worker ran for a task, kept for audit once the
/// worker's context has been reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub agent_id: String,
    /// Internal steps with the status and result each one ended with.
    pub steps: Vec<InternalStep>,
    pub recorded_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Collaboration requests the worker submitted, in step order.
    pub fn request_ids(&self) -> Vec<Uuid> {
        self.steps.iter().filter_map(|s| s.request_id).collect()
    }
}

/// A task in a plan. Snapshots handed out by the store are clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub name: String,
    pub description: String,
    /// Worker the task is dispatched to.
    pub assignee: String,
    pub status: TaskStatus,
    /// Outcome text written when the task reaches a terminal status.
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
    /// Set by the worker when it finalizes the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionRecord>,
    /// Position of the owning step in the plan.
    pub step_index: usize,
    /// Position of the task inside its step.
    pub task_index: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether the task is waiting for dispatch.
    pub fn is_ready(&self) -> bool {
        self.status == TaskStatus::Ready
    }

    /// Dispatch tie-break key: template order.
    pub fn ordinal(&self) -> (usize, usize) {
        (self.step_index, self.task_index)
    }
}

/// A named group of tasks. Steps impose no ordering on their tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub name: String,
    pub task_ids: Vec<String>,
}

/// A plan instantiated from a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub template_id: Option<String>,
    pub steps: Vec<Step>,
    pub tasks: HashMap<String, Task>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Aggregate rule: `running` while any task is non-terminal, then `error`
    /// if any task failed, `completed` otherwise.
    pub fn aggregate_status(&self) -> PlanStatus {
        if self.tasks.values().any(|t| !t.status.is_terminal()) {
            PlanStatus::Running
        } else if self.tasks.values().any(|t| t.status == TaskStatus::Error) {
            PlanStatus::Error
        } else {
            PlanStatus::Completed
        }
    }

    /// Tasks in template order.
    pub fn ordered_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.ordinal());
        tasks
    }

    /// Count of tasks with the given status.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }
}

// --- Inbound plan structure ---

/// Structure accepted by `PlanStore::create_plan`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanStructure {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Id of the template this plan was instantiated from.
    #[serde(default, alias = "id")]
    pub template_id: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    #[serde(default)]
    pub name: String,
    pub assignee: String,
    #[serde(default)]
    pub description: String,
    /// Internal sub-plan declared by the template. Ignored by the store,
    /// consumed by `TemplatePlanner`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub internal_steps: Vec<InternalStep>,
}

// --- Worker-side types ---

/// Kind of an internal step in a worker's sub-plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Work done by the worker itself.
    LocalAction,
    /// A named tool invocation run by the worker's executor.
    ToolCall,
    /// Delegation to another worker through the broker.
    Collaboration,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::LocalAction => write!(f, "local_action"),
            StepKind::ToolCall => write!(f, "tool_call"),
            StepKind::Collaboration => write!(f, "collaboration"),
        }
    }
}

/// Progress of one internal step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternalStepStatus {
    /// Not run yet.
    #[default]
    Pending,
    /// Ran, or its delegation completed.
    Done,
    /// Failed, or its delegation did not complete.
    Failed,
}

/// One step of a worker's internal sub-plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalStep {
    pub kind: StepKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Failure of an optional collaboration step may be tolerated,
    /// depending on the failure policy.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub status: InternalStepStatus,
    #[serde(default)]
    pub result: Option<String>,
    /// Request submitted for a collaboration step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
}

impl InternalStep {
    /// A pending step with no parameters.
    pub fn new(kind: StepKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            params: serde_json::Value::Null,
            optional: false,
            status: InternalStepStatus::Pending,
            result: None,
            request_id: None,
        }
    }

    /// A [`StepKind::LocalAction`] step.
    pub fn local(description: impl Into<String>) -> Self {
        Self::new(StepKind::LocalAction, description)
    }

    /// A [`StepKind::ToolCall`] step; `params` names the tool.
    pub fn tool(description: impl Into<String>, params: serde_json::Value) -> Self {
        Self::new(StepKind::ToolCall, description).with_params(params)
    }

    /// A delegation to `target`.
    pub fn collaboration(target: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(StepKind::Collaboration, description)
            .with_params(serde_json::json!({ "target": target.into() }))
    }

    /// Replace the step's parameters.
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Merge a single parameter into the step's parameter object.
    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        if !self.params.is_object() {
            self.params = serde_json::json!({});
        }
        if let Some(map) = self.params.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }

    /// Mark the step optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Lifecycle of a worker's execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// No task owned.
    Idle,
    /// Building the internal plan for a fresh task.
    Planning,
    /// Running internal steps.
    ExecutingStep,
    /// Suspended on a collaboration request.
    WaitingForCollaboration,
    /// Finalizing; the context returns to idle right after.
    Done,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Planning => write!(f, "planning"),
            AgentStatus::ExecutingStep => write!(f, "executing_step"),
            AgentStatus::WaitingForCollaboration => write!(f, "waiting_for_collaboration"),
            AgentStatus::Done => write!(f, "done"),
        }
    }
}

/// Snapshot of a worker's execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub plan_id: Option<String>,
    pub current_task: Option<String>,
    pub internal_plan: Vec<InternalStep>,
    pub cursor: usize,
    pub status: AgentStatus,
    pub pending_request_id: Option<Uuid>,
}

impl AgentState {
    /// A context that owns no task.
    pub fn idle(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            plan_id: None,
            current_task: None,
            internal_plan: Vec::new(),
            cursor: 0,
            status: AgentStatus::Idle,
            pending_request_id: None,
        }
    }
}

/// Broker record of a delegation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationRequest {
    pub request_id: Uuid,
    pub requester: String,
    pub target: String,
    pub description: String,
    #[serde(default)]
    pub context: serde_json::Value,
    pub status: RequestStatus,
    #[serde(default)]
    pub result: Option<String>,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
}

/// Counters tracked per worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_started: u32,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub steps_executed: u32,
    pub collaborations_submitted: u32,
    pub collaborations_timed_out: u32,
    pub duration_ms: u64,
}
