use crate::types::{AgentMetrics, AgentStatus, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What the monitor knows about one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub current_task: Option<String>,
    pub status: AgentStatus,
    pub metrics: AgentMetrics,
}

impl AgentSnapshot {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            current_task: None,
            status: AgentStatus::Idle,
            metrics: AgentMetrics::default(),
        }
    }
}

/// Tracks lifecycle and counters for every worker in the team.
///
/// Unknown agents are registered on first mention.
pub struct AgentMonitor {
    states: Arc<RwLock<HashMap<String, AgentSnapshot>>>,
}

impl AgentMonitor {
    /// An empty monitor.
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start tracking `agent_id` as idle. Re-registering keeps its metrics.
    pub async fn register(&self, agent_id: &str) {
        let mut states = self.states.write().await;
        states
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentSnapshot::new(agent_id));
    }

    /// Mark an agent as planning `task_id`.
    pub async fn start_task(&self, agent_id: &str, task_id: &str) {
        self.update(agent_id, |state| {
            state.current_task = Some(task_id.to_string());
            state.status = AgentStatus::Planning;
            state.metrics.tasks_started += 1;
        })
        .await;
    }

    /// Record a lifecycle change.
    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) {
        self.update(agent_id, |state| state.status = status).await;
    }

    /// Mark the agent idle again and count the outcome of its task.
    pub async fn finish_task(&self, agent_id: &str, outcome: TaskStatus, duration_ms: u64) {
        self.update(agent_id, |state| {
            state.current_task = None;
            state.status = AgentStatus::Idle;
            state.metrics.duration_ms += duration_ms;
            match outcome {
                TaskStatus::Completed => state.metrics.tasks_completed += 1,
                TaskStatus::Error => state.metrics.tasks_failed += 1,
                _ => {}
            }
        })
        .await;
    }

    /// Count one executed internal step.
    pub async fn record_step(&self, agent_id: &str) {
        self.update(agent_id, |state| state.metrics.steps_executed += 1)
            .await;
    }

    /// Record a submitted delegation; the agent is now waiting on it.
    pub async fn record_collaboration(&self, agent_id: &str) {
        self.update(agent_id, |state| {
            state.metrics.collaborations_submitted += 1;
            state.status = AgentStatus::WaitingForCollaboration;
        })
        .await;
    }

    /// Count one timed-out delegation.
    pub async fn record_timeout(&self, agent_id: &str) {
        self.update(agent_id, |state| state.metrics.collaborations_timed_out += 1)
            .await;
    }

    /// All agents, sorted by id.
    pub async fn snapshot(&self) -> Vec<AgentSnapshot> {
        let states = self.states.read().await;
        let mut all: Vec<AgentSnapshot> = states.values().cloned().collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    /// Snapshot of one worker.
    pub async fn get_state(&self, agent_id: &str) -> Option<AgentSnapshot> {
        let states = self.states.read().await;
        states.get(agent_id).cloned()
    }

    /// Sum of every agent's counters.
    pub async fn aggregate_metrics(&self) -> AgentMetrics {
        let states = self.states.read().await;
        let mut total = AgentMetrics::default();
        for state in states.values() {
            total.tasks_started += state.metrics.tasks_started;
            total.tasks_completed += state.metrics.tasks_completed;
            total.tasks_failed += state.metrics.tasks_failed;
            total.steps_executed += state.metrics.steps_executed;
            total.collaborations_submitted += state.metrics.collaborations_submitted;
            total.collaborations_timed_out += state.metrics.collaborations_timed_out;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    /// Every snapshot plus the aggregate, as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let agents = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "agents": agents,
            "aggregate": aggregate,
        })
    }

    async fn update(&self, agent_id: &str, apply: impl FnOnce(&mut AgentSnapshot)) {
        let mut states = self.states.write().await;
        let state = states
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentSnapshot::new(agent_id));
        apply(state);
    }
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}
