//! Hierarchical task orchestration: plans of steps and tasks, a dispatch loop
//! that hands ready tasks to worker contexts, and a broker that lets a worker
//! suspend its own sub-plan while it delegates part of the work.
//!
//! # Main types
//!
//! - [`PlanStore`] — Authoritative plan state with per-plan serialized transitions.
//! - [`ReadinessIndex`] — Read-only queries for ready tasks and tasks by assignee.
//! - [`CollaborationBroker`] — Delegation requests, response correlation and timeouts.
//! - [`AgentExecutionContext`] — One worker's internal sub-plan, suspended at collaboration steps.
//! - [`DispatchLoop`] — Drives a plan to termination and emits its [`TerminationSignal`].
//! - [`AgentMonitor`] — Per-worker lifecycle and counters.

/// Collaboration request tracking.
pub mod broker;
/// TOML engine configuration.
pub mod config;
/// Per-worker execution context.
pub mod context;
/// The dispatch loop.
pub mod dispatch;
/// Worker lifecycle and metrics monitoring.
pub mod monitor;
/// Plan state store.
pub mod plan_store;
/// Ready-task queries.
pub mod readiness;
/// Planner, executor and collaboration handler seams with default implementations.
pub mod strategy;
/// Delivery of delegation messages.
pub mod transport;
/// Shared orchestration types (Plan, Task, InternalStep, AgentState, etc.).
pub mod types;

pub use broker::{CollaborationBroker, Resolution};
pub use config::{
    parse_timeout_secs, AgentConfig, CollaborationFailurePolicy, EngineConfig, EngineSettings,
    MAX_COLLABORATION_TIMEOUT_SECS,
};
pub use context::{AdvanceOutcome, AgentExecutionContext, StartOutcome};
pub use dispatch::{run_to_completion, CycleReport, DispatchLoop, TerminationSignal};
pub use monitor::{AgentMonitor, AgentSnapshot};
pub use plan_store::PlanStore;
pub use readiness::ReadinessIndex;
pub use strategy::{
    Assessment, CollaborationHandler, DirectPlanner, EchoExecutor, ExecutorCollaborationHandler,
    StepExecutor, TaskPlanner, TemplatePlanner,
};
pub use transport::{InMemoryTransport, Transport};
pub use types::{
    AgentMetrics, AgentState, AgentStatus, CollaborationRequest, ExecutionRecord, InternalStep,
    InternalStepStatus, Note, Plan, PlanStatus, PlanStructure, Step, StepKind, StepSpec, Task,
    TaskSpec, TaskStatus,
};
