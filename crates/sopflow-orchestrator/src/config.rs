use crate::types::{InternalStep, PlanStructure, StepKind};
use serde::{Deserialize, Serialize};
use sopflow_core::{SopflowError, SopflowResult};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for any collaboration timeout, in seconds (one week).
pub const MAX_COLLABORATION_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Parse a step's `timeout_secs` value.
///
/// Rejects negative, non-finite and non-numeric values as well as anything
/// above [`MAX_COLLABORATION_TIMEOUT_SECS`].
pub fn parse_timeout_secs(value: &serde_json::Value) -> SopflowResult<Duration> {
    let secs = value.as_f64().ok_or_else(|| {
        SopflowError::InvalidStructure(format!("timeout_secs must be a number, got {value}"))
    })?;
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| *d <= Duration::from_secs(MAX_COLLABORATION_TIMEOUT_SECS))
        .ok_or_else(|| {
            SopflowError::InvalidStructure(format!(
                "timeout_secs {secs} is outside 0..={MAX_COLLABORATION_TIMEOUT_SECS}"
            ))
        })
}

/// What a context does when a delegation does not come back `completed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationFailurePolicy {
    /// Any failed delegation fails the owning task.
    #[default]
    FailParent,
    /// A failed delegation on a step flagged `optional` is recorded and skipped.
    AllowOptional,
}

impl CollaborationFailurePolicy {
    /// Whether a failed `step` may be stepped over instead of failing the task.
    pub fn tolerates(self, step: &InternalStep) -> bool {
        match self {
            CollaborationFailurePolicy::FailParent => false,
            CollaborationFailurePolicy::AllowOptional => {
                step.optional && step.kind == StepKind::Collaboration
            }
        }
    }
}

impl std::fmt::Display for CollaborationFailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollaborationFailurePolicy::FailParent => write!(f, "fail_parent"),
            CollaborationFailurePolicy::AllowOptional => write!(f, "allow_optional"),
        }
    }
}

/// `[engine]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Pause between dispatch cycles.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Default collaboration timeout, at most [`MAX_COLLABORATION_TIMEOUT_SECS`].
    #[serde(default = "default_collaboration_timeout_secs")]
    pub collaboration_timeout_secs: u64,
    #[serde(default)]
    pub failure_policy: CollaborationFailurePolicy,
    /// Where `plans.json` is written.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            collaboration_timeout_secs: default_collaboration_timeout_secs(),
            failure_policy: CollaborationFailurePolicy::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl EngineSettings {
    /// Pause between dispatch cycles.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Period of the broker's timeout sweeper.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Timeout used by collaboration steps that do not set `timeout_secs`.
    pub fn collaboration_timeout(&self) -> Duration {
        Duration::from_secs(self.collaboration_timeout_secs)
    }
}

/// One `[[agents]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Worker id, matched against task assignees and delegation targets.
    pub id: String,
    /// Register a handler that answers delegations addressed to this agent.
    #[serde(default = "default_true")]
    pub responds_to_collaboration: bool,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    /// Structure every run instantiates.
    pub template: PlanStructure,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

fn default_poll_interval_ms() -> u64 {
    50
}
fn default_sweep_interval_ms() -> u64 {
    250
}
fn default_collaboration_timeout_secs() -> u64 {
    30
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_true() -> bool {
    true
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> SopflowResult<Self> {
        let config: EngineConfig =
            toml::from_str(raw).map_err(|e| SopflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> SopflowResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SopflowError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Checks that do not need a plan store. Structural template checks are
    /// left to `PlanStore::create_plan`.
    pub fn validate(&self) -> SopflowResult<()> {
        if self.engine.poll_interval_ms == 0 {
            return Err(SopflowError::Config("engine.poll_interval_ms must be > 0".into()));
        }
        if self.engine.sweep_interval_ms == 0 {
            return Err(SopflowError::Config("engine.sweep_interval_ms must be > 0".into()));
        }
        if self.engine.collaboration_timeout_secs > MAX_COLLABORATION_TIMEOUT_SECS {
            return Err(SopflowError::Config(format!(
                "engine.collaboration_timeout_secs must be <= {MAX_COLLABORATION_TIMEOUT_SECS}"
            )));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(SopflowError::Config("agent id must not be empty".into()));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(SopflowError::Config(format!("agent '{}' declared twice", agent.id)));
            }
        }

        for step in &self.template.steps {
            for task in &step.tasks {
                for internal in &task.internal_steps {
                    if internal.kind != StepKind::Collaboration {
                        continue;
                    }
                    if internal.params.get("target").and_then(|t| t.as_str()).is_none() {
                        return Err(SopflowError::Config(format!(
                            "task '{}': collaboration step '{}' has no target",
                            task.task_id, internal.description
                        )));
                    }
                    if let Some(raw) = internal.params.get("timeout_secs") {
                        parse_timeout_secs(raw).map_err(|e| {
                            SopflowError::Config(format!("task '{}': {e}", task.task_id))
                        })?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Configured agents followed by any template assignee not listed there,
    /// in first-seen order.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        let configured = self.agents.iter().map(|a| a.id.clone());
        let assignees = self
            .template
            .steps
            .iter()
            .flat_map(|s| s.tasks.iter().map(|t| t.assignee.clone()));
        for id in configured.chain(assignees) {
            if !id.is_empty() && !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    /// Whether `agent_id` should answer delegations. Agents that only appear
    /// as assignees respond by default.
    pub fn responds_to_collaboration(&self, agent_id: &str) -> bool {
        self.agents
            .iter()
            .find(|a| a.id == agent_id)
            .map_or(true, |a| a.responds_to_collaboration)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[engine]
poll_interval_ms = 10
failure_policy = "allow_optional"

[template]
id = "incident-sop"
name = "Incident response"

[[template.steps]]
step_id = "triage"
name = "Triage"

  [[template.steps.tasks]]
  task_id = "t1"
  name = "Log event"
  assignee = "analyst"
  description = "Log the incoming event"

    [[template.steps.tasks.internal_steps]]
    kind = "collaboration"
    description = "Ask reviewer"
    optional = true
    params = { target = "reviewer", timeout_secs = 5 }

[[template.steps]]
step_id = "report"

  [[template.steps.tasks]]
  task_id = "t2"
  assignee = "writer"

[[agents]]
id = "analyst"

[[agents]]
id = "reviewer"
responds_to_collaboration = false
"#;

    #[test]
    fn test_parse_sample() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.engine.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.engine.sweep_interval_ms, 250);
        assert_eq!(config.engine.collaboration_timeout(), Duration::from_secs(30));
        assert_eq!(config.engine.failure_policy, CollaborationFailurePolicy::AllowOptional);
        assert_eq!(config.template.template_id.as_deref(), Some("incident-sop"));
        assert_eq!(config.template.steps.len(), 2);

        let internal = &config.template.steps[0].tasks[0].internal_steps[0];
        assert_eq!(internal.kind, StepKind::Collaboration);
        assert_eq!(internal.params["timeout_secs"], 5);
        assert!(internal.optional);
    }

    #[test]
    fn test_agent_ids_include_assignees() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.agent_ids(), vec!["analyst", "reviewer", "writer"]);
        assert!(config.responds_to_collaboration("analyst"));
        assert!(!config.responds_to_collaboration("reviewer"));
        assert!(config.responds_to_collaboration("writer"));
    }

    #[test]
    fn test_missing_template_is_config_error() {
        let err = EngineConfig::from_toml_str("[engine]\npoll_interval_ms = 5\n").unwrap_err();
        assert!(matches!(err, SopflowError::Config(_)));
    }

    #[test]
    fn test_duplicate_agent_rejected() {
        let raw = r#"
[template]
[[agents]]
id = "a"
[[agents]]
id = "a"
"#;
        assert!(matches!(
            EngineConfig::from_toml_str(raw),
            Err(SopflowError::Config(msg)) if msg.contains("twice")
        ));
    }

    #[test]
    fn test_collaboration_without_target_rejected() {
        let raw = r#"
[template]
[[template.steps]]
step_id = "s"
  [[template.steps.tasks]]
  task_id = "t"
  assignee = "a"
    [[template.steps.tasks.internal_steps]]
    kind = "collaboration"
    description = "nobody to ask"
"#;
        assert!(matches!(
            EngineConfig::from_toml_str(raw),
            Err(SopflowError::Config(_))
        ));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let raw = "[engine]\npoll_interval_ms = 0\n[template]\n";
        assert!(EngineConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_oversized_default_timeout_rejected() {
        let raw = "[engine]\ncollaboration_timeout_secs = 9223372036854775807\n[template]\n";
        assert!(matches!(
            EngineConfig::from_toml_str(raw),
            Err(SopflowError::Config(msg)) if msg.contains("collaboration_timeout_secs")
        ));

        let week = format!(
            "[engine]\ncollaboration_timeout_secs = {MAX_COLLABORATION_TIMEOUT_SECS}\n[template]\n"
        );
        assert!(EngineConfig::from_toml_str(&week).is_ok());
    }

    #[test]
    fn test_step_timeout_bounds() {
        let raw = r#"
[template]
[[template.steps]]
step_id = "s"
  [[template.steps.tasks]]
  task_id = "t"
  assignee = "a"
    [[template.steps.tasks.internal_steps]]
    kind = "collaboration"
    description = "ask"
    params = { target = "b", timeout_secs = 1e20 }
"#;
        assert!(matches!(
            EngineConfig::from_toml_str(raw),
            Err(SopflowError::Config(msg)) if msg.contains("timeout_secs")
        ));

        assert_eq!(
            parse_timeout_secs(&serde_json::json!(1.5)).unwrap(),
            Duration::from_millis(1500)
        );
        assert_eq!(
            parse_timeout_secs(&serde_json::json!(MAX_COLLABORATION_TIMEOUT_SECS)).unwrap(),
            Duration::from_secs(MAX_COLLABORATION_TIMEOUT_SECS)
        );
        for bad in [
            serde_json::json!(1e20),
            serde_json::json!(-1),
            serde_json::json!(MAX_COLLABORATION_TIMEOUT_SECS + 1),
            serde_json::json!("soon"),
        ] {
            assert!(matches!(
                parse_timeout_secs(&bad),
                Err(SopflowError::InvalidStructure(_))
            ));
        }
    }

    #[test]
    fn test_policy_tolerates_only_optional_collaboration() {
        let optional = InternalStep::collaboration("y", "ask").optional();
        let required = InternalStep::collaboration("y", "ask");
        let local = InternalStep::local("work").optional();

        let allow = CollaborationFailurePolicy::AllowOptional;
        assert!(allow.tolerates(&optional));
        assert!(!allow.tolerates(&required));
        assert!(!allow.tolerates(&local));
        assert!(!CollaborationFailurePolicy::FailParent.tolerates(&optional));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sopflow.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.agents.len(), 2);

        let missing = EngineConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, SopflowError::Config(_)));
    }
}
