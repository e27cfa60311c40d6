use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use af_core::config::Config;
use af_core::state_store::PipelineState;
use af_core::types::{
    Objective, ObjectiveLevel, ObjectiveProfile, ObjectiveSpec, ObjectiveStatus, PhaseKind,
    PhaseOutcome, Task, TaskKind, TaskSpec, TaskStatus, ToolCall,
};
use af_pilot::coordinator::{PhaseCoordinator, StopCause};
use af_pilot::executor::{DispatchContext, ExecutorError, PhaseExecutor};
use async_trait::async_trait;
use uuid::Uuid;

// -- Scripted mock executor --

struct ScriptedExecutor {
    script: Mutex<VecDeque<PhaseOutcome>>,
    log: Mutex<Vec<(PhaseKind, Option<Uuid>)>>,
}

impl ScriptedExecutor {
    fn new(outcomes: Vec<PhaseOutcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into()),
            log: Mutex::new(Vec::new()),
        })
    }

    fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }

    fn phases(&self) -> Vec<PhaseKind> {
        self.log.lock().unwrap().iter().map(|(p, _)| *p).collect()
    }
}

#[async_trait]
impl PhaseExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        phase: PhaseKind,
        task: Option<&Task>,
        _ctx: &DispatchContext,
    ) -> Result<PhaseOutcome, ExecutorError> {
        self.log.lock().unwrap().push((phase, task.map(|t| t.id)));
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(PhaseOutcome::no_work))
    }
}

// -- Helpers --

fn coordinator(
    executor: Arc<ScriptedExecutor>,
    dir: &tempfile::TempDir,
    max_iterations: u64,
) -> PhaseCoordinator {
    let mut config = Config::default();
    config.pipeline.max_iterations = max_iterations;
    PhaseCoordinator::new(config, dir.path().to_path_buf(), executor)
}

fn seed_objective(state: &mut PipelineState, status: ObjectiveStatus) -> Uuid {
    let objective = Objective::new("seed objective", ObjectiveLevel::Primary)
        .with_status(status)
        .with_profile(ObjectiveProfile {
            readiness: 0.8,
            ..ObjectiveProfile::default()
        });
    let id = objective.id;
    state.objectives.insert(id, objective);
    id
}

fn seed_task(
    state: &mut PipelineState,
    objective_id: Uuid,
    title: &str,
    priority: i32,
    status: TaskStatus,
    target: Option<&str>,
) -> Uuid {
    let mut task = Task::new(title, TaskKind::Feature, priority).with_objective(objective_id);
    task.target_path = target.map(String::from);
    task.status = status;
    let id = task.id;
    state
        .objectives
        .get_mut(&objective_id)
        .unwrap()
        .task_ids
        .push(id);
    state.tasks.insert(id, task);
    id
}

// -- Selection cascade --

#[tokio::test]
async fn lower_priority_number_is_selected_first() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator(ScriptedExecutor::empty(), &dir, 0);

    let mut state = PipelineState::new();
    let oid = seed_objective(&mut state, ObjectiveStatus::Active);
    let _t1 = seed_task(&mut state, oid, "t1", 10, TaskStatus::New, Some("src/t1.rs"));
    let t2 = seed_task(&mut state, oid, "t2", 5, TaskStatus::New, Some("src/t2.rs"));

    let decision = coordinator.select_next_action(&mut state);
    assert_eq!(decision.phase, PhaseKind::Coding);
    assert_eq!(decision.task_id, Some(t2), "priority 5 beats priority 10");
}

#[tokio::test]
async fn review_failed_work_preempts_new_work() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator(ScriptedExecutor::empty(), &dir, 0);

    let mut state = PipelineState::new();
    let oid = seed_objective(&mut state, ObjectiveStatus::Active);
    let _fresh = seed_task(&mut state, oid, "fresh", 1, TaskStatus::New, Some("src/a.rs"));
    let rejected = seed_task(
        &mut state,
        oid,
        "rejected",
        9,
        TaskStatus::ReviewFailed,
        Some("src/b.rs"),
    );

    let decision = coordinator.select_next_action(&mut state);
    assert_eq!(decision.phase, PhaseKind::Debugging);
    assert_eq!(decision.task_id, Some(rejected));
}

#[tokio::test]
async fn review_never_starves_construction() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator(ScriptedExecutor::empty(), &dir, 0);

    let mut state = PipelineState::new();
    let oid = seed_objective(&mut state, ObjectiveStatus::Active);
    let building = seed_task(&mut state, oid, "building", 5, TaskStatus::New, Some("src/a.rs"));
    let waiting = seed_task(
        &mut state,
        oid,
        "waiting",
        1,
        TaskStatus::AwaitingReview,
        Some("src/b.rs"),
    );

    let decision = coordinator.select_next_action(&mut state);
    assert_eq!(decision.phase, PhaseKind::Coding);
    assert_eq!(decision.task_id, Some(building));

    // Once construction is done, review runs.
    state.tasks.get_mut(&building).unwrap().status = TaskStatus::Completed;
    let decision = coordinator.select_next_action(&mut state);
    assert_eq!(decision.phase, PhaseKind::Qa);
    assert_eq!(decision.task_id, Some(waiting));
}

#[tokio::test]
async fn artifactless_task_is_skipped_not_dispatched() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator(ScriptedExecutor::empty(), &dir, 0);

    let mut state = PipelineState::new();
    let oid = seed_objective(&mut state, ObjectiveStatus::Active);
    let malformed = seed_task(&mut state, oid, "no-target", 1, TaskStatus::AwaitingReview, None);

    let decision = coordinator.select_next_action(&mut state);
    assert_ne!(decision.task_id, Some(malformed));
    assert_eq!(state.tasks[&malformed].status, TaskStatus::Skipped);
}

// -- Failure handling --

#[tokio::test]
async fn five_failures_freeze_the_task_permanently() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator(ScriptedExecutor::empty(), &dir, 0);

    let mut state = PipelineState::new();
    let oid = seed_objective(&mut state, ObjectiveStatus::Active);
    let tid = seed_task(&mut state, oid, "doomed", 1, TaskStatus::InProgress, Some("src/a.rs"));

    for i in 0..5 {
        let decision = coordinator.select_next_action(&mut state);
        assert_eq!(decision.task_id, Some(tid), "iteration {i} should retry the task");
        coordinator.record_outcome(&mut state, &decision, &PhaseOutcome::failed("boom"));
        // Keep the detector out of the way: this test is about the
        // permanent-failure threshold, not the rate floor.
        state.stats_mut(decision.phase).recent.clear();
    }

    let task = &state.tasks[&tid];
    assert!(task.permanently_failed);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failure_count, 5);

    // Excluded from every subsequent selection.
    let decision = coordinator.select_next_action(&mut state);
    assert_ne!(decision.task_id, Some(tid));
}

#[tokio::test]
async fn failing_phase_triggers_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator(ScriptedExecutor::empty(), &dir, 0);

    let mut state = PipelineState::new();
    let oid = seed_objective(&mut state, ObjectiveStatus::Active);
    let _tid = seed_task(&mut state, oid, "shaky", 1, TaskStatus::InProgress, Some("src/a.rs"));

    for _ in 0..3 {
        let decision = coordinator.select_next_action(&mut state);
        coordinator.record_outcome(&mut state, &decision, &PhaseOutcome::failed("boom"));
    }

    // Rolling success rate over the last 3 runs is 0%: recovery.
    let decision = coordinator.select_next_action(&mut state);
    assert!(decision.forced);
    assert_eq!(decision.phase, PhaseKind::Debugging);
}

// -- Success immunity --

#[tokio::test]
async fn productive_same_phase_streak_is_never_interrupted() {
    let dir = tempfile::tempdir().unwrap();
    let executor = ScriptedExecutor::new(
        (0..6)
            .map(|_| PhaseOutcome::succeeded().with_changes())
            .collect(),
    );
    let coordinator = coordinator(executor.clone(), &dir, 6);

    let mut state = PipelineState::new();
    let oid = seed_objective(&mut state, ObjectiveStatus::Active);
    for i in 0..6 {
        seed_task(
            &mut state,
            oid,
            &format!("t{i}"),
            i,
            TaskStatus::New,
            Some(&format!("src/t{i}.rs")),
        );
    }
    coordinator.store().save(&mut state).unwrap();

    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.stop, StopCause::MaxIterationsReached);

    let phases = executor.phases();
    assert_eq!(phases.len(), 6);
    assert!(
        phases.iter().all(|p| *p == PhaseKind::Coding),
        "six successful artifact-changing runs stay in coding: {phases:?}"
    );
}

// -- Planning loop --

#[tokio::test]
async fn planning_twice_with_no_new_tasks_forces_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let executor = ScriptedExecutor::new(vec![
        PhaseOutcome::succeeded(),
        PhaseOutcome::succeeded(),
        PhaseOutcome::succeeded(),
    ]);
    let coordinator = coordinator(executor.clone(), &dir, 3);

    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.stop, StopCause::MaxIterationsReached);

    let phases = executor.phases();
    assert_eq!(
        phases,
        vec![PhaseKind::Planning, PhaseKind::Planning, PhaseKind::Debugging],
        "the third iteration must escalate, not plan again"
    );
}

// -- No premature closure --

#[tokio::test]
async fn review_pass_without_terminal_operation_keeps_task_open() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator(ScriptedExecutor::empty(), &dir, 0);

    let mut state = PipelineState::new();
    let oid = seed_objective(&mut state, ObjectiveStatus::Active);
    let tid = seed_task(
        &mut state,
        oid,
        "feature",
        1,
        TaskStatus::InProgress,
        Some("src/feat.rs"),
    );

    // Analysis-only coding run: read, but never apply a change.
    let decision = coordinator.select_next_action(&mut state);
    assert_eq!(decision.task_id, Some(tid));
    let outcome = PhaseOutcome::succeeded()
        .with_calls(vec![ToolCall::on("read_file", "src/feat.rs")]);
    coordinator.record_outcome(&mut state, &decision, &outcome);
    assert_eq!(state.tasks[&tid].status, TaskStatus::InProgress);

    // Force it into review anyway; the tracker still refuses completion.
    state.tasks.get_mut(&tid).unwrap().status = TaskStatus::AwaitingReview;
    let decision = coordinator.select_next_action(&mut state);
    assert_eq!(decision.phase, PhaseKind::Qa);
    coordinator.record_outcome(
        &mut state,
        &decision,
        &PhaseOutcome::succeeded().with_hint(TaskStatus::Completed),
    );
    assert_eq!(
        state.tasks[&tid].status,
        TaskStatus::InProgress,
        "no terminal operation in the log, the task must not close"
    );

    // Now the terminal operation actually runs; review may close it.
    let decision = coordinator.select_next_action(&mut state);
    let outcome = PhaseOutcome::succeeded().with_changes().with_calls(vec![
        ToolCall::on("edit_file", "src/feat.rs"),
    ]);
    coordinator.record_outcome(&mut state, &decision, &outcome);
    assert_eq!(state.tasks[&tid].status, TaskStatus::AwaitingReview);

    let decision = coordinator.select_next_action(&mut state);
    assert_eq!(decision.phase, PhaseKind::Qa);
    coordinator.record_outcome(&mut state, &decision, &PhaseOutcome::succeeded());
    assert_eq!(state.tasks[&tid].status, TaskStatus::Completed);
}

#[tokio::test]
async fn rejected_review_routes_back_through_debugging() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator(ScriptedExecutor::empty(), &dir, 0);

    let mut state = PipelineState::new();
    let oid = seed_objective(&mut state, ObjectiveStatus::Active);
    let tid = seed_task(
        &mut state,
        oid,
        "feature",
        1,
        TaskStatus::AwaitingReview,
        Some("src/feat.rs"),
    );

    let decision = coordinator.select_next_action(&mut state);
    assert_eq!(decision.phase, PhaseKind::Qa);
    coordinator.record_outcome(
        &mut state,
        &decision,
        &PhaseOutcome::succeeded().with_hint(TaskStatus::ReviewFailed),
    );
    assert_eq!(state.tasks[&tid].status, TaskStatus::ReviewFailed);

    let decision = coordinator.select_next_action(&mut state);
    assert_eq!(decision.phase, PhaseKind::Debugging);
    assert_eq!(decision.task_id, Some(tid));
}

// -- Full pipeline --

#[tokio::test]
async fn pipeline_runs_to_completion_from_empty_state() {
    let dir = tempfile::tempdir().unwrap();

    let plan_objective = {
        let mut outcome = PhaseOutcome::succeeded();
        outcome.new_objectives = vec![ObjectiveSpec {
            title: "ship the widget".into(),
            level: ObjectiveLevel::Primary,
            profile: ObjectiveProfile::default(),
        }];
        outcome
    };
    let plan_task = {
        let mut outcome = PhaseOutcome::succeeded();
        outcome.new_tasks = vec![TaskSpec {
            title: "implement widget".into(),
            description: None,
            target_path: Some("src/widget.rs".into()),
            kind: TaskKind::Feature,
            priority: 3,
            resolution_mode: Default::default(),
            objective_id: None,
        }];
        outcome
    };
    let code = PhaseOutcome::succeeded().with_changes().with_calls(vec![
        ToolCall::on("read_file", "src/widget.rs"),
        ToolCall::on("edit_file", "src/widget.rs"),
    ]);
    let review = PhaseOutcome::succeeded();
    let idle_plan = PhaseOutcome::succeeded();

    let executor = ScriptedExecutor::new(vec![plan_objective, plan_task, code, review, idle_plan]);
    let coordinator = coordinator(executor.clone(), &dir, 10);

    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.stop, StopCause::AllObjectivesCompleted);
    assert_eq!(summary.tasks_completed, 1);
    assert_eq!(summary.tasks_failed, 0);
    assert_eq!(summary.objectives_completed, 1);

    assert_eq!(
        executor.phases(),
        vec![
            PhaseKind::Planning,
            PhaseKind::Planning,
            PhaseKind::Coding,
            PhaseKind::Qa,
            PhaseKind::Planning,
        ]
    );

    // State survived on disk and reloads cleanly.
    let reloaded = coordinator.store().load().unwrap();
    assert!(reloaded.all_objectives_completed());
    assert_eq!(reloaded.iteration, 5);
}

#[tokio::test]
async fn executor_error_is_a_transient_task_failure() {
    struct FailingExecutor;

    #[async_trait]
    impl PhaseExecutor for FailingExecutor {
        async fn execute(
            &self,
            phase: PhaseKind,
            _task: Option<&Task>,
            _ctx: &DispatchContext,
        ) -> Result<PhaseOutcome, ExecutorError> {
            Err(ExecutorError::NotConfigured(phase))
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.pipeline.max_iterations = 1;
    let coordinator =
        PhaseCoordinator::new(config, dir.path().to_path_buf(), Arc::new(FailingExecutor));

    let mut state = PipelineState::new();
    let oid = seed_objective(&mut state, ObjectiveStatus::Active);
    let tid = seed_task(&mut state, oid, "t", 1, TaskStatus::New, Some("src/a.rs"));
    coordinator.store().save(&mut state).unwrap();

    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.stop, StopCause::MaxIterationsReached);

    let reloaded = coordinator.store().load().unwrap();
    assert_eq!(reloaded.tasks[&tid].failure_count, 1);
    assert!(!reloaded.tasks[&tid].permanently_failed);
    assert_eq!(reloaded.tasks[&tid].attempts, 1);
}
