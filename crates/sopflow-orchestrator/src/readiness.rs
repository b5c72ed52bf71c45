use crate::plan_store::PlanStore;
use crate::types::{Task, TaskStatus};
use sopflow_core::SopflowResult;
use std::sync::Arc;

/// Read-only queries over the plan store.
///
/// Every call reads through to the store; nothing is cached. Result order is
/// unspecified, callers apply their own tie-break.
#[derive(Clone)]
pub struct ReadinessIndex {
    store: Arc<PlanStore>,
}

impl ReadinessIndex {
    /// Query view over `store`.
    pub fn new(store: Arc<PlanStore>) -> Self {
        Self { store }
    }

    /// All tasks of the plan currently `ready`.
    pub async fn get_ready_tasks(&self, plan_id: &str) -> SopflowResult<Vec<Task>> {
        let plan = self.store.get_plan(plan_id).await?;
        Ok(plan.tasks.into_values().filter(Task::is_ready).collect())
    }

    /// Tasks assigned to `role` with the given status.
    pub async fn get_tasks_for_role(
        &self,
        plan_id: &str,
        role: &str,
        status: TaskStatus,
    ) -> SopflowResult<Vec<Task>> {
        let plan = self.store.get_plan(plan_id).await?;
        Ok(plan
            .tasks
            .into_values()
            .filter(|t| t.assignee == role && t.status == status)
            .collect())
    }

    /// Shorthand for `get_tasks_for_role(plan_id, role, TaskStatus::Ready)`.
    pub async fn get_ready_tasks_for_role(&self, plan_id: &str, role: &str) -> SopflowResult<Vec<Task>> {
        self.get_tasks_for_role(plan_id, role, TaskStatus::Ready).await
    }
}
