use crate::broker::CollaborationBroker;
use crate::config::{parse_timeout_secs, CollaborationFailurePolicy};
use crate::monitor::AgentMonitor;
use crate::plan_store::PlanStore;
use crate::strategy::{Assessment, StepExecutor, TaskPlanner};
use crate::types::{
    AgentState, AgentStatus, ExecutionRecord, InternalStep, InternalStepStatus, StepKind,
    TaskStatus,
};
use chrono::Utc;
use sopflow_core::{RequestStatus, SopflowError, SopflowResult, TaskActivation};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Result of [`AgentExecutionContext::start_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// An internal plan is ready; call `advance`.
    Planned { steps: usize },
    /// Planning failed and the task was already finalized.
    Finalized(TaskStatus),
}

/// Result of [`AgentExecutionContext::advance`] and `resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The task was finalized with this status; the context is idle again.
    Finished(TaskStatus),
    /// Waiting on the given collaboration request.
    Suspended(Uuid),
}

/// Runs one worker's internal sub-plan for the task it currently owns.
///
/// A context owns at most one task. Only `finalize` writes the task's
/// terminal status to the store, exactly once per activation.
pub struct AgentExecutionContext {
    state: AgentState,
    activation: Option<TaskActivation>,
    store: Arc<PlanStore>,
    broker: Arc<CollaborationBroker>,
    planner: Arc<dyn TaskPlanner>,
    executor: Arc<dyn StepExecutor>,
    monitor: Arc<AgentMonitor>,
    policy: CollaborationFailurePolicy,
    default_timeout: Duration,
    started_at: Option<Instant>,
}

impl AgentExecutionContext {
    /// Create an idle context for `agent_id` with the default failure policy and a 30s collaboration timeout.
    pub fn new(
        agent_id: impl Into<String>,
        store: Arc<PlanStore>,
        broker: Arc<CollaborationBroker>,
        planner: Arc<dyn TaskPlanner>,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        Self {
            state: AgentState::idle(agent_id),
            activation: None,
            store,
            broker,
            planner,
            executor,
            monitor: Arc::new(AgentMonitor::new()),
            policy: CollaborationFailurePolicy::default(),
            default_timeout: Duration::from_secs(30),
            started_at: None,
        }
    }

    /// Report lifecycle events to a shared monitor.
    pub fn with_monitor(mut self, monitor: Arc<AgentMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Set how failed delegations affect the owning task.
    pub fn with_policy(mut self, policy: CollaborationFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Timeout for collaboration steps that do not set `timeout_secs`.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Id of the worker this context runs for.
    pub fn agent_id(&self) -> &str {
        &self.state.agent_id
    }

    /// Current execution state.
    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Whether the context can take a new task.
    pub fn is_idle(&self) -> bool {
        self.state.status == AgentStatus::Idle
    }

    /// Take ownership of an activated task and build its internal plan.
    ///
    /// The caller must already have moved the task to `inprogress`.
    pub async fn start_task(&mut self, activation: TaskActivation) -> SopflowResult<StartOutcome> {
        if !self.is_idle() {
            return Err(SopflowError::Dispatch(format!(
                "agent '{}' is {} and cannot take task '{}'",
                self.state.agent_id, self.state.status, activation.task_id
            )));
        }

        self.state = AgentState {
            plan_id: Some(activation.plan_id.clone()),
            current_task: Some(activation.task_id.clone()),
            status: AgentStatus::Planning,
            ..AgentState::idle(self.state.agent_id.clone())
        };
        self.started_at = Some(Instant::now());
        self.monitor
            .start_task(&self.state.agent_id, &activation.task_id)
            .await;
        info!(
            agent_id = %self.state.agent_id,
            plan_id = %activation.plan_id,
            task_id = %activation.task_id,
            "Task activated"
        );

        let planned = match self.planner.assess(&activation).await {
            Ok(Assessment::Simple) => Ok(vec![InternalStep::local(activation.description.clone())]),
            Ok(Assessment::Plan) => match self.planner.decompose(&activation).await {
                Ok(steps) if steps.is_empty() => Err("planner produced an empty plan".to_string()),
                Ok(steps) => Ok(steps),
                Err(e) => Err(format!("planning failed: {e}")),
            },
            Ok(Assessment::Unclear { reason }) => Err(format!("task unclear: {reason}")),
            Err(e) => Err(format!("assessment failed: {e}")),
        };
        self.activation = Some(activation);

        match planned {
            Ok(steps) => {
                let count = steps.len();
                self.state.internal_plan = steps;
                Ok(StartOutcome::Planned { steps: count })
            }
            Err(reason) => {
                warn!(agent_id = %self.state.agent_id, reason = %reason, "Planning failed");
                self.finalize(TaskStatus::Error, reason).await?;
                Ok(StartOutcome::Finalized(TaskStatus::Error))
            }
        }
    }

    /// `start_task` followed by `advance` when planning succeeded.
    pub async fn run_task(&mut self, activation: TaskActivation) -> SopflowResult<AdvanceOutcome> {
        match self.start_task(activation).await? {
            StartOutcome::Planned { .. } => self.advance().await,
            StartOutcome::Finalized(status) => Ok(AdvanceOutcome::Finished(status)),
        }
    }

    /// Execute internal steps in order until the plan is exhausted, a step
    /// fails, or a collaboration step suspends the context.
    pub async fn advance(&mut self) -> SopflowResult<AdvanceOutcome> {
        if !matches!(
            self.state.status,
            AgentStatus::Planning | AgentStatus::ExecutingStep
        ) {
            return Err(SopflowError::Dispatch(format!(
                "agent '{}' cannot advance while {}",
                self.state.agent_id, self.state.status
            )));
        }
        let activation = self.activation.clone().ok_or_else(|| {
            SopflowError::Dispatch(format!("agent '{}' has no activation", self.state.agent_id))
        })?;

        loop {
            let cursor = self.state.cursor;
            let Some(step) = self.state.internal_plan.get(cursor).cloned() else {
                let summary = self.summary();
                self.finalize(TaskStatus::Completed, summary).await?;
                return Ok(AdvanceOutcome::Finished(TaskStatus::Completed));
            };
            self.set_status(AgentStatus::ExecutingStep).await;

            if step.kind == StepKind::Collaboration {
                match self.submit_collaboration(&activation, &step) {
                    Ok(request_id) => {
                        if let Some(current) = self.state.internal_plan.get_mut(cursor) {
                            current.request_id = Some(request_id);
                        }
                        self.state.pending_request_id = Some(request_id);
                        self.state.status = AgentStatus::WaitingForCollaboration;
                        self.monitor.record_collaboration(&self.state.agent_id).await;
                        return Ok(AdvanceOutcome::Suspended(request_id));
                    }
                    Err(e) => {
                        let reason = format!("collaboration not submitted: {e}");
                        if let Some(outcome) = self.step_failed(&step, reason).await? {
                            return Ok(outcome);
                        }
                        continue;
                    }
                }
            }

            match self
                .executor
                .execute(&self.state.agent_id, &activation, &step)
                .await
            {
                Ok(result) => {
                    self.mark_current(InternalStepStatus::Done, result);
                    self.state.cursor += 1;
                    self.monitor.record_step(&self.state.agent_id).await;
                }
                Err(e) => {
                    let reason = format!("step {} ({}) failed: {e}", cursor + 1, step.kind);
                    if let Some(outcome) = self.step_failed(&step, reason).await? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Apply the resolution of the pending collaboration request and continue.
    pub async fn resume(
        &mut self,
        request_id: Uuid,
        status: RequestStatus,
        result: impl Into<String>,
    ) -> SopflowResult<AdvanceOutcome> {
        if self.state.pending_request_id != Some(request_id) {
            return Err(SopflowError::UnknownRequest(request_id));
        }
        if !status.is_terminal() {
            return Err(SopflowError::InvalidTransition(format!(
                "request {request_id}: cannot resume on a pending request"
            )));
        }
        let result = result.into();
        self.state.pending_request_id = None;
        self.set_status(AgentStatus::ExecutingStep).await;

        let step = self
            .state
            .internal_plan
            .get(self.state.cursor)
            .cloned()
            .ok_or_else(|| {
                SopflowError::Dispatch(format!(
                    "agent '{}' resumed past the end of its plan",
                    self.state.agent_id
                ))
            })?;

        info!(
            agent_id = %self.state.agent_id,
            request_id = %request_id,
            status = %status,
            "Collaboration resolved"
        );

        if status.is_success() {
            self.mark_current(InternalStepStatus::Done, result);
            self.state.cursor += 1;
            self.monitor.record_step(&self.state.agent_id).await;
        } else {
            if status == RequestStatus::TimedOut {
                self.monitor.record_timeout(&self.state.agent_id).await;
            }
            let target = step
                .params
                .get("target")
                .and_then(|t| t.as_str())
                .unwrap_or("?");
            let reason = format!("collaboration with '{target}' {status}: {result}");
            if let Some(outcome) = self.step_failed(&step, reason).await? {
                return Ok(outcome);
            }
        }

        self.advance().await
    }

    /// Write the terminal status of the owned task and return to idle.
    ///
    /// The executed internal plan is attached to the task first, so the
    /// audit trail survives the context reset.
    pub async fn finalize(&mut self, status: TaskStatus, summary: String) -> SopflowResult<()> {
        let (Some(plan_id), Some(task_id)) =
            (self.state.plan_id.clone(), self.state.current_task.take())
        else {
            return Err(SopflowError::Dispatch(format!(
                "agent '{}' has no task to finalize",
                self.state.agent_id
            )));
        };
        self.state.status = AgentStatus::Done;

        let record = ExecutionRecord {
            agent_id: self.state.agent_id.clone(),
            steps: std::mem::take(&mut self.state.internal_plan),
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.store.record_execution(&plan_id, &task_id, record).await {
            warn!(agent_id = %self.state.agent_id, task_id = %task_id, error = %e, "Execution record not stored");
        }

        let written = self
            .store
            .update_task_status(&plan_id, &task_id, status, Some(summary))
            .await;

        let duration_ms = self
            .started_at
            .take()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or_default();
        self.monitor
            .finish_task(&self.state.agent_id, status, duration_ms)
            .await;

        let agent_id = self.state.agent_id.clone();
        self.state = AgentState::idle(agent_id.clone());
        self.activation = None;

        match written {
            Ok(task) => {
                info!(
                    agent_id = %agent_id,
                    plan_id = %plan_id,
                    task_id = %task_id,
                    status = %task.status,
                    "Task finalized"
                );
                Ok(())
            }
            Err(e) => {
                error!(agent_id = %agent_id, task_id = %task_id, error = %e, "Finalize rejected by store");
                Err(e)
            }
        }
    }

    fn submit_collaboration(
        &self,
        activation: &TaskActivation,
        step: &InternalStep,
    ) -> SopflowResult<Uuid> {
        let target = step
            .params
            .get("target")
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                SopflowError::InvalidStructure(format!(
                    "collaboration step '{}' has no target",
                    step.description
                ))
            })?;
        let timeout = match step.params.get("timeout_secs") {
            Some(raw) => parse_timeout_secs(raw)?,
            None => self.default_timeout,
        };

        let mut context = step
            .params
            .get("context")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        if let Some(map) = context.as_object_mut() {
            map.entry("plan_id")
                .or_insert_with(|| activation.plan_id.clone().into());
            map.entry("task_id")
                .or_insert_with(|| activation.task_id.clone().into());
        }

        self.broker.submit(
            &self.state.agent_id,
            target,
            &step.description,
            context,
            timeout,
        )
    }

    /// Record the current step as failed. Returns `Some` when the task was
    /// finalized, `None` when the policy lets execution continue.
    async fn step_failed(
        &mut self,
        step: &InternalStep,
        reason: String,
    ) -> SopflowResult<Option<AdvanceOutcome>> {
        self.mark_current(InternalStepStatus::Failed, reason.clone());

        if self.policy.tolerates(step) {
            warn!(
                agent_id = %self.state.agent_id,
                reason = %reason,
                "Optional collaboration failed, continuing"
            );
            self.note(&format!("skipped optional step: {reason}")).await;
            self.state.cursor += 1;
            return Ok(None);
        }

        warn!(agent_id = %self.state.agent_id, reason = %reason, "Task failed");
        self.finalize(TaskStatus::Error, reason).await?;
        Ok(Some(AdvanceOutcome::Finished(TaskStatus::Error)))
    }

    async fn set_status(&mut self, status: AgentStatus) {
        if self.state.status != status {
            self.state.status = status;
            self.monitor.set_status(&self.state.agent_id, status).await;
        }
    }

    /// Attach a note from this worker to its current task. Failures are logged.
    async fn note(&self, content: &str) {
        let (Some(plan_id), Some(task_id)) = (&self.state.plan_id, &self.state.current_task) else {
            return;
        };
        if let Err(e) = self
            .store
            .add_note(plan_id, task_id, &self.state.agent_id, content)
            .await
        {
            warn!(agent_id = %self.state.agent_id, task_id = %task_id, error = %e, "Note not stored");
        }
    }

    fn mark_current(&mut self, status: InternalStepStatus, result: String) {
        if let Some(step) = self.state.internal_plan.get_mut(self.state.cursor) {
            step.status = status;
            step.result = Some(result);
        }
    }

    fn summary(&self) -> String {
        let results: Vec<&str> = self
            .state
            .internal_plan
            .iter()
            .filter(|s| s.status == InternalStepStatus::Done)
            .filter_map(|s| s.result.as_deref())
            .collect();
        if results.is_empty() {
            "done".to_string()
        } else {
            results.join("; ")
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::strategy::{DirectPlanner, EchoExecutor, TemplatePlanner};
    use crate::transport::InMemoryTransport;
    use crate::types::{PlanStructure, StepSpec, TaskSpec};
    use async_trait::async_trait;

    struct Harness {
        store: Arc<PlanStore>,
        broker: Arc<CollaborationBroker>,
        _inbox: tokio::sync::mpsc::UnboundedReceiver<sopflow_core::CollaborationMessage>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(PlanStore::new());
        let structure = PlanStructure {
            steps: vec![StepSpec {
                step_id: "s1".into(),
                name: "Triage".into(),
                tasks: vec![TaskSpec {
                    task_id: "t1".into(),
                    name: "Log".into(),
                    assignee: "x".into(),
                    description: "Log event".into(),
                    internal_steps: vec![],
                }],
            }],
            ..Default::default()
        };
        store.create_plan("p1", &structure).await.unwrap();
        store
            .update_task_status("p1", "t1", TaskStatus::InProgress, None)
            .await
            .unwrap();

        let transport = Arc::new(InMemoryTransport::new());
        let inbox = transport.register("y");
        Harness {
            store,
            broker: Arc::new(CollaborationBroker::new(transport)),
            _inbox: inbox,
        }
    }

    fn activation() -> TaskActivation {
        TaskActivation {
            task_id: "t1".into(),
            plan_id: "p1".into(),
            description: "Log event".into(),
            assignee: "x".into(),
        }
    }

    fn context(h: &Harness, steps: Vec<InternalStep>) -> AgentExecutionContext {
        AgentExecutionContext::new(
            "x",
            h.store.clone(),
            h.broker.clone(),
            Arc::new(TemplatePlanner::new().with_plan("t1", steps)),
            Arc::new(EchoExecutor),
        )
    }

    #[tokio::test]
    async fn test_simple_task_completes() {
        let h = harness().await;
        let mut ctx = AgentExecutionContext::new(
            "x",
            h.store.clone(),
            h.broker.clone(),
            Arc::new(DirectPlanner),
            Arc::new(EchoExecutor),
        );

        assert_eq!(
            ctx.start_task(activation()).await.unwrap(),
            StartOutcome::Planned { steps: 1 }
        );
        assert_eq!(
            ctx.advance().await.unwrap(),
            AdvanceOutcome::Finished(TaskStatus::Completed)
        );
        assert!(ctx.is_idle());

        let task = h.store.get_task("p1", "t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.summary.as_deref(), Some("x: Log event"));
    }

    #[tokio::test]
    async fn test_failing_step_finalizes_error() {
        let h = harness().await;
        let mut ctx = context(
            &h,
            vec![
                InternalStep::local("ok"),
                InternalStep::local("boom").with_param("fail", serde_json::json!(true)),
                InternalStep::local("never"),
            ],
        );
        ctx.start_task(activation()).await.unwrap();
        assert_eq!(
            ctx.advance().await.unwrap(),
            AdvanceOutcome::Finished(TaskStatus::Error)
        );
        let task = h.store.get_task("p1", "t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.summary.unwrap().contains("step 2"));
    }

    #[tokio::test]
    async fn test_empty_decomposition_finalizes_on_start() {
        let h = harness().await;
        let mut ctx = context(&h, vec![]);
        assert_eq!(
            ctx.start_task(activation()).await.unwrap(),
            StartOutcome::Finalized(TaskStatus::Error)
        );
        assert!(ctx.is_idle());
        assert_eq!(
            h.store.get_task("p1", "t1").await.unwrap().status,
            TaskStatus::Error
        );
    }

    #[tokio::test]
    async fn test_busy_context_rejects_second_task() {
        let h = harness().await;
        let mut ctx = context(&h, vec![InternalStep::collaboration("y", "ask")]);
        ctx.start_task(activation()).await.unwrap();
        assert!(matches!(
            ctx.start_task(activation()).await,
            Err(SopflowError::Dispatch(_))
        ));
    }

    #[tokio::test]
    async fn test_collaboration_suspends_and_resumes() {
        let h = harness().await;
        let mut ctx = context(
            &h,
            vec![
                InternalStep::collaboration("y", "check severity"),
                InternalStep::local("wrap up"),
            ],
        );
        ctx.start_task(activation()).await.unwrap();

        let AdvanceOutcome::Suspended(request_id) = ctx.advance().await.unwrap() else {
            panic!("expected suspension");
        };
        assert_eq!(ctx.state().status, AgentStatus::WaitingForCollaboration);
        assert_eq!(ctx.state().pending_request_id, Some(request_id));

        let request = h.broker.get_request(request_id).unwrap();
        assert_eq!(request.context["plan_id"], "p1");
        assert_eq!(request.timeout_ms, 30_000);

        // A stranger's id is refused without touching state.
        assert!(matches!(
            ctx.resume(Uuid::new_v4(), RequestStatus::Completed, "").await,
            Err(SopflowError::UnknownRequest(_))
        ));
        assert_eq!(ctx.state().status, AgentStatus::WaitingForCollaboration);

        let outcome = ctx
            .resume(request_id, RequestStatus::Completed, "severity high")
            .await
            .unwrap();
        assert_eq!(outcome, AdvanceOutcome::Finished(TaskStatus::Completed));
        let task = h.store.get_task("p1", "t1").await.unwrap();
        assert_eq!(task.summary.as_deref(), Some("severity high; x: wrap up"));
    }

    #[tokio::test]
    async fn test_rejected_collaboration_fails_parent() {
        let h = harness().await;
        let mut ctx = context(&h, vec![InternalStep::collaboration("y", "ask").optional()]);
        ctx.start_task(activation()).await.unwrap();
        let AdvanceOutcome::Suspended(id) = ctx.advance().await.unwrap() else {
            panic!("expected suspension");
        };
        let outcome = ctx.resume(id, RequestStatus::Rejected, "busy").await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Finished(TaskStatus::Error));
        let summary = h.store.get_task("p1", "t1").await.unwrap().summary.unwrap();
        assert!(summary.contains("rejected"));
    }

    #[tokio::test]
    async fn test_allow_optional_continues() {
        let h = harness().await;
        let mut ctx = context(
            &h,
            vec![
                InternalStep::collaboration("y", "ask").optional(),
                InternalStep::local("carry on"),
            ],
        )
        .with_policy(CollaborationFailurePolicy::AllowOptional);
        ctx.start_task(activation()).await.unwrap();
        let AdvanceOutcome::Suspended(id) = ctx.advance().await.unwrap() else {
            panic!("expected suspension");
        };
        let outcome = ctx.resume(id, RequestStatus::TimedOut, "late").await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Finished(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_undeliverable_collaboration_fails_task() {
        let h = harness().await;
        let mut ctx = context(&h, vec![InternalStep::collaboration("ghost", "ask")]);
        ctx.start_task(activation()).await.unwrap();
        assert_eq!(
            ctx.advance().await.unwrap(),
            AdvanceOutcome::Finished(TaskStatus::Error)
        );
        assert_eq!(h.broker.pending_count(), 0);
    }

    struct FailingPlanner;

    #[async_trait]
    impl TaskPlanner for FailingPlanner {
        async fn assess(&self, _a: &TaskActivation) -> SopflowResult<Assessment> {
            Err(SopflowError::StepExecutionFailure("planner offline".into()))
        }

        async fn decompose(&self, _a: &TaskActivation) -> SopflowResult<Vec<InternalStep>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_planner_failure_finalizes_error() {
        let h = harness().await;
        let mut ctx = AgentExecutionContext::new(
            "x",
            h.store.clone(),
            h.broker.clone(),
            Arc::new(FailingPlanner),
            Arc::new(EchoExecutor),
        );
        assert_eq!(
            ctx.start_task(activation()).await.unwrap(),
            StartOutcome::Finalized(TaskStatus::Error)
        );
        let summary = h.store.get_task("p1", "t1").await.unwrap().summary.unwrap();
        assert!(summary.contains("planner offline"));
    }

    #[tokio::test]
    async fn test_unclear_task_finalizes_on_start() {
        let h = harness().await;
        let mut ctx = context(&h, vec![]);
        ctx.planner = Arc::new(TemplatePlanner::new());
        let mut act = activation();
        act.description = String::new();
        assert_eq!(
            ctx.start_task(act).await.unwrap(),
            StartOutcome::Finalized(TaskStatus::Error)
        );
        let summary = h.store.get_task("p1", "t1").await.unwrap().summary.unwrap();
        assert!(summary.starts_with("task unclear"));
    }

    #[tokio::test]
    async fn test_advance_on_idle_is_an_error() {
        let h = harness().await;
        let mut ctx = context(&h, vec![]);
        assert!(matches!(ctx.advance().await, Err(SopflowError::Dispatch(_))));
    }

    #[tokio::test]
    async fn test_out_of_range_step_timeout_fails_task() {
        let h = harness().await;
        let mut ctx = context(
            &h,
            vec![InternalStep::collaboration("y", "ask")
                .with_param("timeout_secs", serde_json::json!(1e20))],
        );
        ctx.start_task(activation()).await.unwrap();
        assert_eq!(
            ctx.advance().await.unwrap(),
            AdvanceOutcome::Finished(TaskStatus::Error)
        );
        assert!(ctx.is_idle());
        let task = h.store.get_task("p1", "t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.summary.unwrap().contains("timeout_secs"));
        assert_eq!(h.broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_default_timeout_fails_task() {
        let h = harness().await;
        let mut ctx = context(&h, vec![InternalStep::collaboration("y", "ask")])
            .with_default_timeout(Duration::from_secs(u64::MAX));
        ctx.start_task(activation()).await.unwrap();
        assert_eq!(
            ctx.advance().await.unwrap(),
            AdvanceOutcome::Finished(TaskStatus::Error)
        );
        assert!(ctx.is_idle());
        assert_eq!(
            h.store.get_task("p1", "t1").await.unwrap().status,
            TaskStatus::Error
        );
    }

    #[tokio::test]
    async fn test_finalize_records_internal_plan() {
        let h = harness().await;
        let mut ctx = context(
            &h,
            vec![
                InternalStep::local("gather"),
                InternalStep::collaboration("y", "check severity"),
            ],
        );
        ctx.start_task(activation()).await.unwrap();
        let AdvanceOutcome::Suspended(id) = ctx.advance().await.unwrap() else {
            panic!("expected suspension");
        };
        assert!(h.store.get_task("p1", "t1").await.unwrap().execution.is_none());

        ctx.resume(id, RequestStatus::Completed, "high").await.unwrap();
        assert!(ctx.state().internal_plan.is_empty());

        let record = h.store.get_task("p1", "t1").await.unwrap().execution.unwrap();
        assert_eq!(record.agent_id, "x");
        assert_eq!(record.steps.len(), 2);
        assert_eq!(record.steps[0].kind, StepKind::LocalAction);
        assert_eq!(record.steps[0].result.as_deref(), Some("x: gather"));
        assert_eq!(record.steps[1].status, InternalStepStatus::Done);
        assert_eq!(record.request_ids(), vec![id]);
    }

    #[tokio::test]
    async fn test_skipped_optional_step_leaves_note() {
        let h = harness().await;
        let mut ctx = context(
            &h,
            vec![
                InternalStep::collaboration("y", "ask").optional(),
                InternalStep::local("carry on"),
            ],
        )
        .with_policy(CollaborationFailurePolicy::AllowOptional);
        ctx.start_task(activation()).await.unwrap();
        let AdvanceOutcome::Suspended(id) = ctx.advance().await.unwrap() else {
            panic!("expected suspension");
        };
        ctx.resume(id, RequestStatus::Rejected, "busy").await.unwrap();

        let task = h.store.get_task("p1", "t1").await.unwrap();
        assert_eq!(task.notes.len(), 1);
        assert_eq!(task.notes[0].author, "x");
        assert!(task.notes[0].content.contains("rejected"));
        let record = task.execution.unwrap();
        assert_eq!(record.steps[0].status, InternalStepStatus::Failed);
    }

    #[tokio::test]
    async fn test_monitor_tracks_lifecycle() {
        let h = harness().await;
        let monitor = Arc::new(AgentMonitor::new());
        let mut ctx = context(&h, vec![InternalStep::collaboration("y", "ask")])
            .with_monitor(monitor.clone());
        ctx.start_task(activation()).await.unwrap();
        assert_eq!(
            monitor.get_state("x").await.unwrap().status,
            AgentStatus::Planning
        );
        let AdvanceOutcome::Suspended(id) = ctx.advance().await.unwrap() else {
            panic!("expected suspension");
        };
        assert_eq!(
            monitor.get_state("x").await.unwrap().status,
            AgentStatus::WaitingForCollaboration
        );

        ctx.resume(id, RequestStatus::Completed, "ok").await.unwrap();
        let state = monitor.get_state("x").await.unwrap();
        assert_eq!(state.status, AgentStatus::Idle);
        assert_eq!(state.metrics.tasks_completed, 1);
    }
}
