use crate::types::{InternalStep, PlanStructure, StepKind};
use async_trait::async_trait;
use sopflow_core::{
    CollaborationMessage, CollaborationResponse, SopflowError, SopflowResult, TaskActivation,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// How a worker intends to handle an activated task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assessment {
    /// One local action carrying the task description.
    Simple,
    /// Needs an ordered internal plan from [`TaskPlanner::decompose`].
    Plan,
    /// The worker cannot tell what is being asked.
    Unclear {
        /// Why the task could not be planned.
        reason: String,
    },
}

/// Turns an activation into a worker's internal sub-plan.
#[async_trait]
pub trait TaskPlanner: Send + Sync {
    /// Decide whether the task is simple, needs a plan, or is unclear.
    async fn assess(&self, activation: &TaskActivation) -> SopflowResult<Assessment>;

    /// Ordered internal steps for a task assessed as [`Assessment::Plan`].
    async fn decompose(&self, activation: &TaskActivation) -> SopflowResult<Vec<InternalStep>>;
}

/// Runs `local_action` and `tool_call` steps. Collaboration steps never reach it.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Execute `step` on behalf of `agent_id`, returning its result text.
    async fn execute(
        &self,
        agent_id: &str,
        activation: &TaskActivation,
        step: &InternalStep,
    ) -> SopflowResult<String>;
}

/// Answers delegations addressed to a worker.
#[async_trait]
pub trait CollaborationHandler: Send + Sync {
    /// Produce the response for one delegation. Must not fail; errors are
    /// reported through the response status.
    async fn handle(&self, message: CollaborationMessage) -> CollaborationResponse;
}

/// Every task is handled as a single local action.
pub struct DirectPlanner;

#[async_trait]
impl TaskPlanner for DirectPlanner {
    async fn assess(&self, _activation: &TaskActivation) -> SopflowResult<Assessment> {
        Ok(Assessment::Simple)
    }

    async fn decompose(&self, activation: &TaskActivation) -> SopflowResult<Vec<InternalStep>> {
        Ok(vec![InternalStep::local(activation.description.clone())])
    }
}

/// Uses the internal steps declared per task in the template.
///
/// Tasks without declared steps are simple, unless they have no description
/// either, in which case there is nothing to act on.
pub struct TemplatePlanner {
    plans: HashMap<String, Vec<InternalStep>>,
}

impl TemplatePlanner {
    /// A planner with no per-task plans.
    pub fn new() -> Self {
        Self {
            plans: HashMap::new(),
        }
    }

    /// Use the `internal_steps` declared on each task of `structure`.
    pub fn from_structure(structure: &PlanStructure) -> Self {
        let plans = structure
            .steps
            .iter()
            .flat_map(|s| s.tasks.iter())
            .filter(|t| !t.internal_steps.is_empty())
            .map(|t| (t.task_id.clone(), t.internal_steps.clone()))
            .collect();
        Self { plans }
    }

    /// Declare the sub-plan for `task_id`.
    pub fn with_plan(mut self, task_id: impl Into<String>, steps: Vec<InternalStep>) -> Self {
        self.plans.insert(task_id.into(), steps);
        self
    }
}

impl Default for TemplatePlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskPlanner for TemplatePlanner {
    async fn assess(&self, activation: &TaskActivation) -> SopflowResult<Assessment> {
        if self.plans.contains_key(&activation.task_id) {
            Ok(Assessment::Plan)
        } else if activation.description.trim().is_empty() {
            Ok(Assessment::Unclear {
                reason: format!("task '{}' has no description", activation.task_id),
            })
        } else {
            Ok(Assessment::Simple)
        }
    }

    async fn decompose(&self, activation: &TaskActivation) -> SopflowResult<Vec<InternalStep>> {
        Ok(self
            .plans
            .get(&activation.task_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Executor that echoes each step back as its result.
///
/// A step fails when its parameters carry `"fail": true` or an `"error"` string.
pub struct EchoExecutor;

#[async_trait]
impl StepExecutor for EchoExecutor {
    async fn execute(
        &self,
        agent_id: &str,
        activation: &TaskActivation,
        step: &InternalStep,
    ) -> SopflowResult<String> {
        if let Some(reason) = step.params.get("error").and_then(|e| e.as_str()) {
            return Err(SopflowError::StepExecutionFailure(reason.to_string()));
        }
        if step.params.get("fail").and_then(|f| f.as_bool()) == Some(true) {
            return Err(SopflowError::StepExecutionFailure(format!(
                "{} '{}' failed",
                step.kind, step.description
            )));
        }

        debug!(agent_id = %agent_id, task_id = %activation.task_id, kind = %step.kind, "Echo step");
        Ok(match step.kind {
            StepKind::ToolCall => {
                let tool = step
                    .params
                    .get("tool")
                    .and_then(|t| t.as_str())
                    .unwrap_or("tool");
                format!("{agent_id} called {tool}: {}", step.description)
            }
            _ => format!("{agent_id}: {}", step.description),
        })
    }
}

/// Answers a delegation by running it as a local action through an executor.
pub struct ExecutorCollaborationHandler {
    agent_id: String,
    executor: Arc<dyn StepExecutor>,
}

impl ExecutorCollaborationHandler {
    /// Answer delegations for `agent_id` by running them through `executor`.
    pub fn new(agent_id: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            agent_id: agent_id.into(),
            executor,
        }
    }
}

#[async_trait]
impl CollaborationHandler for ExecutorCollaborationHandler {
    async fn handle(&self, message: CollaborationMessage) -> CollaborationResponse {
        let field = |key: &str| {
            message
                .context
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let activation = TaskActivation {
            task_id: field("task_id"),
            plan_id: field("plan_id"),
            description: message.description.clone(),
            assignee: self.agent_id.clone(),
        };
        let step =
            InternalStep::local(message.description.clone()).with_params(message.context.clone());

        match self.executor.execute(&self.agent_id, &activation, &step).await {
            Ok(result) => CollaborationResponse::completed(message.request_id, result),
            Err(e) => CollaborationResponse::error(message.request_id, e.to_string()),
        }
    }
}
