use crate::broker::{CollaborationBroker, Resolution};
use crate::config::{EngineConfig, EngineSettings};
use crate::context::{AdvanceOutcome, AgentExecutionContext};
use crate::monitor::AgentMonitor;
use crate::plan_store::PlanStore;
use crate::readiness::ReadinessIndex;
use crate::strategy::{
    CollaborationHandler, EchoExecutor, ExecutorCollaborationHandler, StepExecutor, TaskPlanner,
    TemplatePlanner,
};
use crate::transport::InMemoryTransport;
use crate::types::{PlanStatus, Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sopflow_core::{CollaborationMessage, SopflowError, SopflowResult, TaskActivation};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Emitted once per plan when its aggregate status becomes terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationSignal {
    pub plan_id: String,
    /// `completed` or `error`.
    pub status: PlanStatus,
    pub emitted_at: DateTime<Utc>,
}

/// What a single [`DispatchLoop::run_cycle`] did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Requests moved to `timed_out` by this cycle's sweep.
    pub timed_out: usize,
    /// Suspended contexts handed a resolution.
    pub resumed: usize,
    /// Delegations passed to a collaboration handler.
    pub answered: usize,
    /// Ready tasks moved to `inprogress`.
    pub dispatched: usize,
    /// Set only on the cycle that first observed the terminal status.
    pub terminated: Option<TerminationSignal>,
}

type SharedContext = Arc<Mutex<AgentExecutionContext>>;

struct Inbox {
    rx: mpsc::UnboundedReceiver<CollaborationMessage>,
    handler: Option<Arc<dyn CollaborationHandler>>,
}

/// The single driver of plan execution.
///
/// Each cycle sweeps broker timeouts, hands resolutions back to suspended
/// contexts, lets handlers answer queued delegations, dispatches ready tasks
/// to idle contexts and checks for termination. The loop never waits on a
/// busy context: contexts are taken with `try_lock_owned` and the guard moves
/// into the spawned work.
pub struct DispatchLoop {
    store: Arc<PlanStore>,
    readiness: ReadinessIndex,
    transport: Arc<InMemoryTransport>,
    broker: Arc<CollaborationBroker>,
    monitor: Arc<AgentMonitor>,
    settings: EngineSettings,
    contexts: HashMap<String, SharedContext>,
    inboxes: HashMap<String, Inbox>,
    notifications: mpsc::UnboundedReceiver<Resolution>,
    backlog: VecDeque<Resolution>,
    in_flight: Vec<JoinHandle<()>>,
    emitted: HashMap<String, TerminationSignal>,
}

impl DispatchLoop {
    /// Create a loop over `store` with its own broker, transport and monitor.
    pub fn new(store: Arc<PlanStore>, settings: EngineSettings) -> SopflowResult<Self> {
        let transport = Arc::new(InMemoryTransport::new());
        let broker = Arc::new(CollaborationBroker::new(transport.clone()));
        let notifications = broker.take_notifications().ok_or_else(|| {
            SopflowError::Dispatch("broker notifications already taken".to_string())
        })?;

        Ok(Self {
            readiness: ReadinessIndex::new(store.clone()),
            store,
            transport,
            broker,
            monitor: Arc::new(AgentMonitor::new()),
            settings,
            contexts: HashMap::new(),
            inboxes: HashMap::new(),
            notifications,
            backlog: VecDeque::new(),
            in_flight: Vec::new(),
            emitted: HashMap::new(),
        })
    }

    /// Build a loop for every agent the configuration names. Planning follows
    /// the template's declared internal steps and steps run on [`EchoExecutor`].
    pub fn from_config(store: Arc<PlanStore>, config: &EngineConfig) -> SopflowResult<Self> {
        let mut dispatch = Self::new(store, config.engine.clone())?;
        let planner: Arc<dyn TaskPlanner> = Arc::new(TemplatePlanner::from_structure(&config.template));
        let executor: Arc<dyn StepExecutor> = Arc::new(EchoExecutor);

        for agent_id in config.agent_ids() {
            dispatch.register_agent(&agent_id, planner.clone(), executor.clone());
            if config.responds_to_collaboration(&agent_id) {
                dispatch.register_handler(
                    &agent_id,
                    Arc::new(ExecutorCollaborationHandler::new(agent_id.clone(), executor.clone())),
                );
            }
        }
        Ok(dispatch)
    }

    /// The plan store being driven.
    pub fn store(&self) -> &Arc<PlanStore> {
        &self.store
    }

    /// The broker shared by all contexts.
    pub fn broker(&self) -> &Arc<CollaborationBroker> {
        &self.broker
    }

    /// Per-worker metrics.
    pub fn monitor(&self) -> &Arc<AgentMonitor> {
        &self.monitor
    }

    /// Create the execution context of `agent_id` with the engine's policy and
    /// default timeout, and open its inbound channel.
    pub fn register_agent(
        &mut self,
        agent_id: &str,
        planner: Arc<dyn TaskPlanner>,
        executor: Arc<dyn StepExecutor>,
    ) -> &mut Self {
        let context = AgentExecutionContext::new(
            agent_id,
            self.store.clone(),
            self.broker.clone(),
            planner,
            executor,
        )
        .with_monitor(self.monitor.clone())
        .with_policy(self.settings.failure_policy)
        .with_default_timeout(self.settings.collaboration_timeout());
        self.register_context(context)
    }

    /// Register a context built by the caller. It must share this loop's
    /// store and broker.
    pub fn register_context(&mut self, context: AgentExecutionContext) -> &mut Self {
        let agent_id = context.agent_id().to_string();
        self.open_inbox(&agent_id);
        self.contexts
            .insert(agent_id, Arc::new(Mutex::new(context)));
        self
    }

    /// Answer delegations addressed to `agent_id` with `handler`.
    ///
    /// Agents without a handler keep their delegations queued, so those
    /// requests resolve by timeout.
    pub fn register_handler(
        &mut self,
        agent_id: &str,
        handler: Arc<dyn CollaborationHandler>,
    ) -> &mut Self {
        self.open_inbox(agent_id);
        if let Some(inbox) = self.inboxes.get_mut(agent_id) {
            inbox.handler = Some(handler);
        }
        self
    }

    /// The registered context of `agent_id`.
    pub fn context(&self, agent_id: &str) -> Option<SharedContext> {
        self.contexts.get(agent_id).cloned()
    }

    /// The signal already emitted for `plan_id`, if any.
    pub fn termination(&self, plan_id: &str) -> Option<&TerminationSignal> {
        self.emitted.get(plan_id)
    }

    /// Run cycles until `plan_id` terminates, then return its signal.
    pub async fn run(&mut self, plan_id: &str) -> SopflowResult<TerminationSignal> {
        if let Some(signal) = self.emitted.get(plan_id) {
            return Ok(signal.clone());
        }
        self.store.get_plan_status(plan_id).await?;
        for agent_id in self.contexts.keys() {
            self.monitor.register(agent_id).await;
        }
        info!(plan_id = %plan_id, agents = self.contexts.len(), "Dispatch loop started");

        let sweeper = self.broker.spawn_sweeper(self.settings.sweep_interval());
        let result = self.drive(plan_id).await;
        sweeper.abort();
        result
    }

    async fn drive(&mut self, plan_id: &str) -> SopflowResult<TerminationSignal> {
        let mut ticker = tokio::time::interval(self.settings.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let report = self.run_cycle(plan_id).await?;
            if let Some(signal) = report.terminated {
                return Ok(signal);
            }
            self.check_stalled(plan_id).await?;
        }
    }

    /// One pass of the loop.
    pub async fn run_cycle(&mut self, plan_id: &str) -> SopflowResult<CycleReport> {
        let mut report = CycleReport::default();
        self.reap().await;

        // 1. Timeouts.
        report.timed_out = self.broker.sweep_timeouts().len();

        // 2. Resolutions back to suspended contexts.
        self.pull_notifications();
        while let Some(resolution) = self.backlog.pop_front() {
            if self.spawn_resume(resolution) {
                report.resumed += 1;
            }
        }

        // 3. Delegations addressed to workers with a handler.
        report.answered = self.answer_delegations();

        // 4. Ready tasks to idle contexts, in template order.
        report.dispatched = self.dispatch_ready(plan_id).await?;

        // 5. Termination.
        let status = self.store.get_plan_status(plan_id).await?;
        if status.is_terminal() && !self.emitted.contains_key(plan_id) {
            let signal = TerminationSignal {
                plan_id: plan_id.to_string(),
                status,
                emitted_at: Utc::now(),
            };
            info!(plan_id = %plan_id, status = %status, "Plan terminated");
            self.emitted.insert(plan_id.to_string(), signal.clone());
            report.terminated = Some(signal);
        }

        if report.dispatched + report.resumed + report.answered + report.timed_out > 0 {
            debug!(
                plan_id = %plan_id,
                dispatched = report.dispatched,
                resumed = report.resumed,
                answered = report.answered,
                timed_out = report.timed_out,
                "Cycle"
            );
        }
        Ok(report)
    }

    /// Wait for all spawned work to finish.
    pub async fn quiesce(&mut self) {
        for handle in self.in_flight.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Spawned work panicked");
            }
        }
    }

    fn open_inbox(&mut self, agent_id: &str) {
        if !self.inboxes.contains_key(agent_id) {
            let rx = self.transport.register(agent_id);
            self.inboxes
                .insert(agent_id.to_string(), Inbox { rx, handler: None });
        }
    }

    async fn reap(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) =
            self.in_flight.drain(..).partition(JoinHandle::is_finished);
        self.in_flight = running;
        for handle in done {
            if let Err(e) = handle.await {
                error!(error = %e, "Spawned work panicked");
            }
        }
    }

    fn pull_notifications(&mut self) {
        while let Ok(resolution) = self.notifications.try_recv() {
            self.backlog.push_back(resolution);
        }
    }

    fn spawn_resume(&mut self, resolution: Resolution) -> bool {
        let Some(context) = self.contexts.get(&resolution.requester).cloned() else {
            warn!(
                request_id = %resolution.request_id,
                requester = %resolution.requester,
                "Resolution for an unregistered agent dropped"
            );
            return false;
        };

        self.in_flight.push(tokio::spawn(async move {
            let mut context = context.lock().await;
            let Resolution {
                request_id,
                requester,
                status,
                result,
            } = resolution;
            match context.resume(request_id, status, result).await {
                Ok(AdvanceOutcome::Suspended(next)) => {
                    debug!(agent_id = %requester, request_id = %next, "Suspended again");
                }
                Ok(AdvanceOutcome::Finished(task_status)) => {
                    debug!(agent_id = %requester, status = %task_status, "Resumed task finished");
                }
                Err(e) => {
                    error!(agent_id = %requester, request_id = %request_id, error = %e, "Resume failed");
                }
            }
        }));
        true
    }

    fn answer_delegations(&mut self) -> usize {
        let mut answered = 0;
        for (agent_id, inbox) in &mut self.inboxes {
            let Some(handler) = inbox.handler.clone() else {
                continue;
            };
            while let Ok(message) = inbox.rx.try_recv() {
                let broker = self.broker.clone();
                let handler = handler.clone();
                let agent_id = agent_id.clone();
                self.in_flight.push(tokio::spawn(async move {
                    let request_id = message.request_id;
                    let response = handler.handle(message).await;
                    match broker.on_response_payload(response) {
                        Ok(request) => {
                            debug!(agent_id = %agent_id, request_id = %request_id, status = %request.status, "Delegation answered");
                        }
                        Err(SopflowError::AlreadyResolved(_)) => {
                            warn!(agent_id = %agent_id, request_id = %request_id, "Answer arrived after resolution");
                        }
                        Err(e) => {
                            error!(agent_id = %agent_id, request_id = %request_id, error = %e, "Answer rejected");
                        }
                    }
                }));
                answered += 1;
            }
        }
        answered
    }

    async fn dispatch_ready(&mut self, plan_id: &str) -> SopflowResult<usize> {
        let mut ready = self.readiness.get_ready_tasks(plan_id).await?;
        ready.sort_by_key(Task::ordinal);

        let mut dispatched = 0;
        for task in ready {
            let Some(context) = self.contexts.get(&task.assignee).cloned() else {
                debug!(plan_id = %plan_id, task_id = %task.task_id, assignee = %task.assignee, "No context for assignee");
                continue;
            };
            let Ok(mut guard) = context.try_lock_owned() else {
                continue;
            };
            if !guard.is_idle() {
                continue;
            }

            if let Err(e) = self
                .store
                .update_task_status(plan_id, &task.task_id, TaskStatus::InProgress, None)
                .await
            {
                warn!(plan_id = %plan_id, task_id = %task.task_id, error = %e, "Could not claim task");
                continue;
            }

            info!(plan_id = %plan_id, task_id = %task.task_id, agent_id = %task.assignee, "Task dispatched");
            let activation = TaskActivation {
                task_id: task.task_id,
                plan_id: plan_id.to_string(),
                description: task.description,
                assignee: task.assignee,
            };
            self.in_flight.push(tokio::spawn(async move {
                let agent_id = activation.assignee.clone();
                let task_id = activation.task_id.clone();
                if let Err(e) = guard.run_task(activation).await {
                    error!(agent_id = %agent_id, task_id = %task_id, error = %e, "Task execution failed");
                }
            }));
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Fails when the plan is running but nothing can ever move it forward.
    async fn check_stalled(&mut self, plan_id: &str) -> SopflowResult<()> {
        self.reap().await;
        self.pull_notifications();
        if !self.in_flight.is_empty() || !self.backlog.is_empty() || self.broker.pending_count() > 0 {
            return Ok(());
        }
        let plan = self.store.get_plan(plan_id).await?;
        if plan.status.is_terminal() {
            return Ok(());
        }

        let dispatchable = plan.tasks.values().any(|t| {
            t.is_ready()
                && self
                    .contexts
                    .get(&t.assignee)
                    .is_some_and(|c| c.try_lock().map_or(true, |ctx| ctx.is_idle()))
        });
        if dispatchable {
            return Ok(());
        }

        let stuck: Vec<String> = plan
            .ordered_tasks()
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| format!("{} ({}, {})", t.task_id, t.assignee, t.status))
            .collect();
        error!(plan_id = %plan_id, stuck = ?stuck, "Dispatch deadlock");
        Err(SopflowError::Dispatch(format!(
            "plan '{plan_id}' cannot make progress: {}",
            stuck.join(", ")
        )))
    }
}

impl Drop for DispatchLoop {
    fn drop(&mut self) {
        for handle in &self.in_flight {
            handle.abort();
        }
    }
}

/// Convenience for callers that only need the plan's final status.
pub async fn run_to_completion(
    dispatch: &mut DispatchLoop,
    plan_id: &str,
    limit: Duration,
) -> SopflowResult<TerminationSignal> {
    tokio::time::timeout(limit, dispatch.run(plan_id))
        .await
        .map_err(|_| SopflowError::Timeout(format!("plan '{plan_id}' did not terminate within {limit:?}")))?
}
