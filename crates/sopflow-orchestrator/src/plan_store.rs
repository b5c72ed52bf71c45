use crate::types::{
    ExecutionRecord, Note, Plan, PlanStatus, PlanStructure, Step, Task, TaskStatus,
};
use chrono::Utc;
use sopflow_core::{SopflowError, SopflowResult};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

const PLANS_FILE: &str = "plans.json";

#[derive(Default)]
struct PlanTable {
    plans: HashMap<String, Arc<Mutex<Plan>>>,
    order: Vec<String>,
}

/// Authoritative store for plans, steps and tasks.
///
/// The plan table is guarded by an `RwLock`; each plan sits behind its own
/// `Mutex`, so every mutation of one plan is serialized while different plans
/// proceed independently.
pub struct PlanStore {
    table: RwLock<PlanTable>,
}

impl PlanStore {
    /// An empty store.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(PlanTable::default()),
        }
    }

    /// Instantiate a plan. Every task starts `ready`, the plan starts `running`.
    pub async fn create_plan(&self, plan_id: &str, structure: &PlanStructure) -> SopflowResult<Plan> {
        let mut table = self.table.write().await;
        if table.plans.contains_key(plan_id) {
            return Err(SopflowError::DuplicateId(format!("plan '{plan_id}' already exists")));
        }

        let plan = build_plan(plan_id, structure)?;
        let snapshot = plan.clone();
        table.plans.insert(plan_id.to_string(), Arc::new(Mutex::new(plan)));
        table.order.push(plan_id.to_string());

        info!(
            plan_id = %plan_id,
            steps = snapshot.steps.len(),
            tasks = snapshot.tasks.len(),
            "Plan created"
        );
        Ok(snapshot)
    }

    async fn handle(&self, plan_id: &str) -> SopflowResult<Arc<Mutex<Plan>>> {
        let table = self.table.read().await;
        table
            .plans
            .get(plan_id)
            .cloned()
            .ok_or_else(|| SopflowError::NotFound(format!("plan '{plan_id}'")))
    }

    /// Snapshot of a single task.
    pub async fn get_task(&self, plan_id: &str, task_id: &str) -> SopflowResult<Task> {
        let handle = self.handle(plan_id).await?;
        let plan = handle.lock().await;
        plan.tasks.get(task_id).cloned().ok_or_else(|| {
            SopflowError::NotFound(format!("task '{task_id}' in plan '{plan_id}'"))
        })
    }

    /// The single mutation entry point for tasks.
    ///
    /// Rejects anything outside `ready → inprogress → {completed, error, skipped}`
    /// with `InvalidTransition` and leaves the plan untouched. On success the
    /// plan aggregate is recomputed under the same lock.
    pub async fn update_task_status(
        &self,
        plan_id: &str,
        task_id: &str,
        new_status: TaskStatus,
        summary: Option<String>,
    ) -> SopflowResult<Task> {
        let handle = self.handle(plan_id).await?;
        let mut plan = handle.lock().await;

        let task = plan.tasks.get_mut(task_id).ok_or_else(|| {
            SopflowError::NotFound(format!("task '{task_id}' in plan '{plan_id}'"))
        })?;

        let from = task.status;
        if !from.can_transition_to(new_status) {
            return Err(SopflowError::InvalidTransition(format!(
                "task '{task_id}' in plan '{plan_id}': {from} -> {new_status}"
            )));
        }

        task.status = new_status;
        if summary.is_some() {
            task.summary = summary;
        }
        task.updated_at = Utc::now();
        let snapshot = task.clone();

        let before = plan.status;
        plan.status = plan.aggregate_status();

        debug!(plan_id = %plan_id, task_id = %task_id, from = %from, to = %new_status, "Task status updated");
        if plan.status != before {
            info!(plan_id = %plan_id, status = %plan.status, "Plan status changed");
        }

        Ok(snapshot)
    }

    /// Aggregate status of a plan.
    pub async fn get_plan_status(&self, plan_id: &str) -> SopflowResult<PlanStatus> {
        let handle = self.handle(plan_id).await?;
        let plan = handle.lock().await;
        Ok(plan.status)
    }

    /// Append a note to a task. Allowed in any task status.
    pub async fn add_note(
        &self,
        plan_id: &str,
        task_id: &str,
        author: &str,
        content: &str,
    ) -> SopflowResult<Note> {
        if content.trim().is_empty() {
            return Err(SopflowError::InvalidStructure(format!(
                "note for task '{task_id}' is empty"
            )));
        }
        let handle = self.handle(plan_id).await?;
        let mut plan = handle.lock().await;
        let task = plan.tasks.get_mut(task_id).ok_or_else(|| {
            SopflowError::NotFound(format!("task '{task_id}' in plan '{plan_id}'"))
        })?;

        let note = Note::new(author, content);
        task.notes.push(note.clone());
        task.updated_at = note.timestamp;
        debug!(plan_id = %plan_id, task_id = %task_id, author = %author, "Note added");
        Ok(note)
    }

    /// Attach the worker's executed sub-plan to a task it still owns.
    ///
    /// Only an `inprogress` task accepts a record; a later record replaces an
    /// earlier one.
    pub async fn record_execution(
        &self,
        plan_id: &str,
        task_id: &str,
        record: ExecutionRecord,
    ) -> SopflowResult<()> {
        let handle = self.handle(plan_id).await?;
        let mut plan = handle.lock().await;
        let task = plan.tasks.get_mut(task_id).ok_or_else(|| {
            SopflowError::NotFound(format!("task '{task_id}' in plan '{plan_id}'"))
        })?;
        if task.status != TaskStatus::InProgress {
            return Err(SopflowError::InvalidTransition(format!(
                "task '{task_id}' in plan '{plan_id}' is {}; execution can only be recorded while inprogress",
                task.status
            )));
        }

        debug!(
            plan_id = %plan_id,
            task_id = %task_id,
            agent_id = %record.agent_id,
            steps = record.steps.len(),
            "Execution recorded"
        );
        task.execution = Some(record);
        Ok(())
    }

    /// Full snapshot of a plan.
    pub async fn get_plan(&self, plan_id: &str) -> SopflowResult<Plan> {
        let handle = self.handle(plan_id).await?;
        let plan = handle.lock().await;
        Ok(plan.clone())
    }

    /// Plan ids in creation order.
    pub async fn list_plans(&self) -> Vec<String> {
        self.table.read().await.order.clone()
    }

    /// Number of plans held.
    pub async fn plan_count(&self) -> usize {
        self.table.read().await.plans.len()
    }

    /// Write every plan to `<dir>/plans.json`, in creation order.
    pub async fn save_to_dir(&self, dir: &Path) -> SopflowResult<PathBuf> {
        let handles: Vec<Arc<Mutex<Plan>>> = {
            let table = self.table.read().await;
            table
                .order
                .iter()
                .filter_map(|id| table.plans.get(id).cloned())
                .collect()
        };

        let mut plans = Vec::with_capacity(handles.len());
        for handle in handles {
            plans.push(handle.lock().await.clone());
        }

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(PLANS_FILE);
        let json = serde_json::to_string_pretty(&plans)?;
        tokio::fs::write(&path, json).await?;

        info!(path = %path.display(), plans = plans.len(), "Plans saved");
        Ok(path)
    }

    /// Load plans previously written by [`PlanStore::save_to_dir`].
    ///
    /// A missing file loads nothing. If any stored id is already present the
    /// whole load fails with `DuplicateId` and nothing is inserted.
    pub async fn load_from_dir(&self, dir: &Path) -> SopflowResult<usize> {
        let path = dir.join(PLANS_FILE);
        if !path.exists() {
            return Ok(0);
        }

        let data = tokio::fs::read_to_string(&path).await?;
        let plans: Vec<Plan> = serde_json::from_str(&data)?;

        let mut table = self.table.write().await;
        let mut seen = HashSet::new();
        for plan in &plans {
            if table.plans.contains_key(&plan.plan_id) || !seen.insert(plan.plan_id.as_str()) {
                return Err(SopflowError::DuplicateId(format!(
                    "plan '{}' already exists",
                    plan.plan_id
                )));
            }
        }

        let count = plans.len();
        for plan in plans {
            table.order.push(plan.plan_id.clone());
            table.plans.insert(plan.plan_id.clone(), Arc::new(Mutex::new(plan)));
        }

        info!(path = %path.display(), plans = count, "Plans loaded");
        Ok(count)
    }
}

impl Default for PlanStore {
    fn default() -> Self {
        Self::new()
    }
}

fn build_plan(plan_id: &str, structure: &PlanStructure) -> SopflowResult<Plan> {
    if structure.steps.is_empty() {
        return Err(SopflowError::InvalidStructure(format!(
            "plan '{plan_id}' has no steps"
        )));
    }

    let now = Utc::now();
    let mut step_ids = HashSet::new();
    let mut steps = Vec::with_capacity(structure.steps.len());
    let mut tasks: HashMap<String, Task> = HashMap::new();

    for (step_index, spec) in structure.steps.iter().enumerate() {
        if !step_ids.insert(spec.step_id.as_str()) {
            return Err(SopflowError::InvalidStructure(format!(
                "duplicate step id '{}'",
                spec.step_id
            )));
        }
        if spec.tasks.is_empty() {
            return Err(SopflowError::InvalidStructure(format!(
                "step '{}' has no tasks",
                spec.step_id
            )));
        }

        let mut task_ids = Vec::with_capacity(spec.tasks.len());
        for (task_index, task) in spec.tasks.iter().enumerate() {
            if task.assignee.trim().is_empty() {
                return Err(SopflowError::InvalidStructure(format!(
                    "task '{}' has no assignee",
                    task.task_id
                )));
            }
            if tasks.contains_key(&task.task_id) {
                return Err(SopflowError::InvalidStructure(format!(
                    "duplicate task id '{}'",
                    task.task_id
                )));
            }
            tasks.insert(
                task.task_id.clone(),
                Task {
                    task_id: task.task_id.clone(),
                    name: task.name.clone(),
                    description: task.description.clone(),
                    assignee: task.assignee.clone(),
                    status: TaskStatus::Ready,
                    summary: None,
                    notes: Vec::new(),
                    execution: None,
                    step_index,
                    task_index,
                    created_at: now,
                    updated_at: now,
                },
            );
            task_ids.push(task.task_id.clone());
        }

        steps.push(Step {
            step_id: spec.step_id.clone(),
            name: spec.name.clone(),
            task_ids,
        });
    }

    Ok(Plan {
        plan_id: plan_id.to_string(),
        name: structure.name.clone(),
        description: structure.description.clone(),
        template_id: structure.template_id.clone(),
        steps,
        tasks,
        status: PlanStatus::Running,
        created_at: now,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{StepSpec, TaskSpec};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn task_spec(id: &str, assignee: &str) -> TaskSpec {
        TaskSpec {
            task_id: id.into(),
            name: format!("Task {id}"),
            assignee: assignee.into(),
            description: format!("Do {id}"),
            internal_steps: vec![],
        }
    }

    fn two_step_structure() -> PlanStructure {
        PlanStructure {
            name: "Incident".into(),
            description: "Handle an incident".into(),
            template_id: Some("incident-sop".into()),
            steps: vec![
                StepSpec {
                    step_id: "s1".into(),
                    name: "Triage".into(),
                    tasks: vec![task_spec("A", "X")],
                },
                StepSpec {
                    step_id: "s2".into(),
                    name: "Fix".into(),
                    tasks: vec![task_spec("B", "Y"), task_spec("C", "Y")],
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_create_plan_all_ready() {
        let store = PlanStore::new();
        let plan = store.create_plan("p1", &two_step_structure()).await.unwrap();

        assert_eq!(plan.status, PlanStatus::Running);
        assert_eq!(plan.tasks.len(), 3);
        assert!(plan.tasks.values().all(Task::is_ready));
        assert_eq!(plan.template_id.as_deref(), Some("incident-sop"));
        assert_eq!(store.get_plan_status("p1").await.unwrap(), PlanStatus::Running);

        let c = store.get_task("p1", "C").await.unwrap();
        assert_eq!(c.ordinal(), (1, 1));
    }

    #[tokio::test]
    async fn test_duplicate_plan_leaves_first_unchanged() {
        let store = PlanStore::new();
        store.create_plan("p1", &two_step_structure()).await.unwrap();
        store
            .update_task_status("p1", "A", TaskStatus::InProgress, None)
            .await
            .unwrap();

        let mut other = two_step_structure();
        other.name = "Other".into();
        let err = store.create_plan("p1", &other).await.unwrap_err();
        assert!(matches!(err, SopflowError::DuplicateId(_)));

        let plan = store.get_plan("p1").await.unwrap();
        assert_eq!(plan.name, "Incident");
        assert_eq!(plan.tasks["A"].status, TaskStatus::InProgress);
        assert_eq!(store.plan_count().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_structures() {
        let store = PlanStore::new();

        let empty = PlanStructure::default();
        assert!(matches!(
            store.create_plan("p0", &empty).await,
            Err(SopflowError::InvalidStructure(_))
        ));

        let mut empty_step = two_step_structure();
        empty_step.steps[1].tasks.clear();
        assert!(matches!(
            store.create_plan("p1", &empty_step).await,
            Err(SopflowError::InvalidStructure(_))
        ));

        let mut colliding = two_step_structure();
        colliding.steps[1].tasks[0].task_id = "A".into();
        assert!(matches!(
            store.create_plan("p2", &colliding).await,
            Err(SopflowError::InvalidStructure(_))
        ));

        let mut same_step = two_step_structure();
        same_step.steps[1].step_id = "s1".into();
        assert!(matches!(
            store.create_plan("p3", &same_step).await,
            Err(SopflowError::InvalidStructure(_))
        ));

        assert_eq!(store.plan_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_plan_and_task() {
        let store = PlanStore::new();
        assert!(matches!(
            store.get_plan_status("missing").await,
            Err(SopflowError::NotFound(_))
        ));
        assert!(matches!(
            store
                .update_task_status("missing", "A", TaskStatus::InProgress, None)
                .await,
            Err(SopflowError::NotFound(_))
        ));

        store.create_plan("p1", &two_step_structure()).await.unwrap();
        assert!(matches!(
            store.get_task("p1", "Z").await,
            Err(SopflowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_skipping_inprogress() {
        let store = PlanStore::new();
        store.create_plan("p1", &two_step_structure()).await.unwrap();

        let err = store
            .update_task_status("p1", "A", TaskStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SopflowError::InvalidTransition(_)));
        assert_eq!(store.get_task("p1", "A").await.unwrap().status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn test_second_terminal_update_is_invalid() {
        let store = PlanStore::new();
        store.create_plan("p1", &two_step_structure()).await.unwrap();
        store
            .update_task_status("p1", "A", TaskStatus::InProgress, None)
            .await
            .unwrap();
        let done = store
            .update_task_status("p1", "A", TaskStatus::Completed, Some("ok".into()))
            .await
            .unwrap();
        assert_eq!(done.summary.as_deref(), Some("ok"));

        let err = store
            .update_task_status("p1", "A", TaskStatus::Completed, Some("again".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SopflowError::InvalidTransition(_)));
        assert_eq!(
            store.get_task("p1", "A").await.unwrap().summary.as_deref(),
            Some("ok")
        );
    }

    #[tokio::test]
    async fn test_aggregate_follows_tasks() {
        let store = PlanStore::new();
        store.create_plan("p1", &two_step_structure()).await.unwrap();

        for id in ["A", "B", "C"] {
            store
                .update_task_status("p1", id, TaskStatus::InProgress, None)
                .await
                .unwrap();
        }
        store
            .update_task_status("p1", "B", TaskStatus::Error, Some("boom".into()))
            .await
            .unwrap();
        // Still running while A and C are open.
        assert_eq!(store.get_plan_status("p1").await.unwrap(), PlanStatus::Running);

        store
            .update_task_status("p1", "A", TaskStatus::Completed, None)
            .await
            .unwrap();
        store
            .update_task_status("p1", "C", TaskStatus::Skipped, None)
            .await
            .unwrap();
        assert_eq!(store.get_plan_status("p1").await.unwrap(), PlanStatus::Error);
    }

    #[tokio::test]
    async fn test_concurrent_completions() {
        let store = Arc::new(PlanStore::new());
        let tasks: Vec<TaskSpec> = (0..32).map(|i| task_spec(&format!("t{i}"), "w")).collect();
        let structure = PlanStructure {
            steps: vec![StepSpec {
                step_id: "s".into(),
                name: "all".into(),
                tasks,
            }],
            ..PlanStructure::default()
        };
        store.create_plan("p", &structure).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let id = format!("t{i}");
                store
                    .update_task_status("p", &id, TaskStatus::InProgress, None)
                    .await
                    .unwrap();
                store
                    .update_task_status("p", &id, TaskStatus::Completed, None)
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let plan = store.get_plan("p").await.unwrap();
        assert_eq!(plan.count(TaskStatus::Completed), 32);
        assert_eq!(plan.status, PlanStatus::Completed);
    }

    #[tokio::test]
    async fn test_random_sequences_never_revisit_ready() {
        let all = [
            TaskStatus::Ready,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Error,
            TaskStatus::Skipped,
        ];

        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let store = PlanStore::new();
            store.create_plan("p", &two_step_structure()).await.unwrap();
            let mut left_ready: HashSet<String> = HashSet::new();

            for _ in 0..40 {
                let id = ["A", "B", "C"][rng.gen_range(0..3)];
                let target = all[rng.gen_range(0..all.len())];
                let before = store.get_task("p", id).await.unwrap().status;
                let result = store.update_task_status("p", id, target, None).await;
                let after = store.get_task("p", id).await.unwrap().status;

                match result {
                    Ok(_) => assert!(before.can_transition_to(target)),
                    Err(_) => assert_eq!(before, after),
                }
                if after != TaskStatus::Ready {
                    left_ready.insert(id.to_string());
                }
                if left_ready.contains(id) {
                    assert_ne!(after, TaskStatus::Ready, "seed {seed}: {id} went back to ready");
                }
            }

            let plan = store.get_plan("p").await.unwrap();
            assert_eq!(plan.status, plan.aggregate_status());
        }
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new();
        store.create_plan("p1", &two_step_structure()).await.unwrap();
        store
            .update_task_status("p1", "A", TaskStatus::InProgress, None)
            .await
            .unwrap();
        let path = store.save_to_dir(dir.path()).await.unwrap();
        assert!(path.ends_with("plans.json"));

        let restored = PlanStore::new();
        assert_eq!(restored.load_from_dir(dir.path()).await.unwrap(), 1);
        let task = restored.get_task("p1", "A").await.unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);

        // Loading the same ids twice is refused wholesale.
        assert!(matches!(
            restored.load_from_dir(dir.path()).await,
            Err(SopflowError::DuplicateId(_))
        ));
        assert_eq!(restored.plan_count().await, 1);
    }

    #[tokio::test]
    async fn test_notes_attach_to_tasks() {
        let store = PlanStore::new();
        store.create_plan("p1", &two_step_structure()).await.unwrap();

        let note = store.add_note("p1", "B", "Y", "waiting on vendor").await.unwrap();
        store.add_note("p1", "B", "X", "vendor replied").await.unwrap();
        let task = store.get_task("p1", "B").await.unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.notes.len(), 2);
        assert_eq!(task.notes[0], note);
        assert_eq!(task.notes[1].author, "X");

        assert!(matches!(
            store.add_note("p1", "Z", "Y", "x").await,
            Err(SopflowError::NotFound(_))
        ));
        assert!(matches!(
            store.add_note("nope", "B", "Y", "x").await,
            Err(SopflowError::NotFound(_))
        ));
        assert!(matches!(
            store.add_note("p1", "B", "Y", "  ").await,
            Err(SopflowError::InvalidStructure(_))
        ));
    }

    #[tokio::test]
    async fn test_execution_recorded_only_while_inprogress() {
        let store = PlanStore::new();
        store.create_plan("p1", &two_step_structure()).await.unwrap();
        let record = ExecutionRecord {
            agent_id: "X".into(),
            steps: vec![crate::types::InternalStep::local("look")],
            recorded_at: Utc::now(),
        };

        assert!(matches!(
            store.record_execution("p1", "A", record.clone()).await,
            Err(SopflowError::InvalidTransition(_))
        ));
        store
            .update_task_status("p1", "A", TaskStatus::InProgress, None)
            .await
            .unwrap();
        store.record_execution("p1", "A", record.clone()).await.unwrap();
        store
            .update_task_status("p1", "A", TaskStatus::Completed, None)
            .await
            .unwrap();
        assert!(matches!(
            store.record_execution("p1", "A", record).await,
            Err(SopflowError::InvalidTransition(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        store.save_to_dir(dir.path()).await.unwrap();
        let restored = PlanStore::new();
        restored.load_from_dir(dir.path()).await.unwrap();
        let task = restored.get_task("p1", "A").await.unwrap();
        assert_eq!(task.execution.unwrap().steps[0].description, "look");
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new();
        assert_eq!(store.load_from_dir(dir.path()).await.unwrap(), 0);
        assert!(store.list_plans().await.is_empty());
    }
}
