use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use af_core::config::Config;
use af_core::state_store::{PipelineState, StateStore, StateStoreError};
use af_core::types::{
    PhaseKind, PhaseOutcome, ResolutionMode, TaskStatus,
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoints::CheckpointTracker;
use crate::events::{emit, EventSender, PipelineEvent};
use crate::executor::{DispatchContext, PhaseExecutor};
use crate::objectives::ObjectiveModel;
use crate::signal::StopSignal;
use crate::stagnation::StagnationDetector;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PilotError {
    /// State persistence failed. Corrupt state is fatal by design: the
    /// pipeline refuses to run rather than silently reinitialize.
    #[error("state store: {0}")]
    Store(#[from] StateStoreError),
}

// ---------------------------------------------------------------------------
// Decision / RunSummary
// ---------------------------------------------------------------------------

/// One selected unit of work: which phase to dispatch, on which task, and
/// why.
#[derive(Debug, Clone)]
pub struct Decision {
    pub phase: PhaseKind,
    pub task_id: Option<Uuid>,
    pub objective_id: Option<Uuid>,
    pub reason: String,
    /// Set when the stagnation detector overrode normal selection.
    pub forced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    AllObjectivesCompleted,
    MaxIterationsReached,
    Stopped,
}

impl std::fmt::Display for StopCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StopCause::AllObjectivesCompleted => "all objectives completed",
            StopCause::MaxIterationsReached => "max iterations reached",
            StopCause::Stopped => "stop requested",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Iterations executed by this invocation of `run`.
    pub iterations: u64,
    /// Lifetime iteration count across resumes.
    pub total_iterations: u64,
    pub stop: StopCause,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub objectives_completed: usize,
}

impl RunSummary {
    fn from_state(state: &PipelineState, stop: StopCause, iterations: u64) -> Self {
        Self {
            iterations,
            total_iterations: state.iteration,
            stop,
            tasks_completed: state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Completed)
                .count(),
            tasks_failed: state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Failed)
                .count(),
            objectives_completed: state
                .objectives
                .values()
                .filter(|o| o.status == af_core::types::ObjectiveStatus::Completed)
                .count(),
        }
    }
}

// ---------------------------------------------------------------------------
// PhaseCoordinator
// ---------------------------------------------------------------------------

/// The top-level loop. On every iteration it asks the objective model for
/// the current target, the checkpoint tracker for the required next step,
/// and the stagnation detector whether to override, then dispatches one
/// unit of work to the external executor and records the outcome back.
///
/// Single logical thread of control: one iteration completes fully
/// (select → dispatch → await → record → persist) before the next begins.
/// The only suspension point is awaiting the executor; stop requests are
/// honored between iterations only.
pub struct PhaseCoordinator {
    config: Config,
    project_dir: PathBuf,
    store: StateStore,
    executor: Arc<dyn PhaseExecutor>,
    model: ObjectiveModel,
    checkpoints: CheckpointTracker,
    detector: StagnationDetector,
    stop: StopSignal,
    events: EventSender,
}

impl PhaseCoordinator {
    /// Build a coordinator. Every dependency is supplied here; there is no
    /// late opt-in initialization a call site could forget.
    pub fn new(config: Config, project_dir: PathBuf, executor: Arc<dyn PhaseExecutor>) -> Self {
        let store = StateStore::for_project(&project_dir, &config.pipeline.state_path);
        let model = ObjectiveModel::new(config.selection, &config.thresholds);
        let checkpoints = CheckpointTracker::new(config.checkpoints.clone());
        let detector =
            StagnationDetector::new(config.thresholds, config.pipeline.recovery_phase);
        Self {
            config,
            project_dir,
            store,
            executor,
            model,
            checkpoints,
            detector,
            stop: StopSignal::new(),
            events: None,
        }
    }

    /// Attach a progress event channel.
    pub fn with_events(mut self, sender: flume::Sender<PipelineEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Handle for requesting a stop from outside (ctrl-c, operator command).
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    /// Decide the next unit of work. Strict priority cascade, first match
    /// wins:
    ///
    /// 1. stagnation escalation forces the recovery phase;
    /// 2. review-rejected tasks are revisited before anything new starts;
    /// 3. the highest-priority new/in-flight task of the active objective;
    /// 4. tasks awaiting review, only once construction yields nothing;
    /// 5. planning, itself escalated when it keeps producing no work.
    pub fn select_next_action(&self, state: &mut PipelineState) -> Decision {
        if let Some(escalation) = self.detector.assess(state) {
            self.detector.apply_resets(state, &escalation);
            emit(
                &self.events,
                PipelineEvent::EscalationTriggered {
                    recovery: escalation.recovery,
                    reason: escalation.reason.to_string(),
                },
            );
            return Decision {
                phase: escalation.recovery,
                task_id: None,
                objective_id: None,
                reason: escalation.reason.to_string(),
                forced: true,
            };
        }

        if let Some(task_id) =
            self.pick_workable(state, &[TaskStatus::ReviewFailed], None)
        {
            let objective_id = state.tasks[&task_id].objective_id;
            return Decision {
                phase: PhaseKind::Debugging,
                task_id: Some(task_id),
                objective_id,
                reason: "review-rejected work is revisited first".into(),
                forced: false,
            };
        }

        let objective = self.model.select_optimal(state);

        if let Some(objective_id) = objective {
            if let Some(task_id) = self.pick_workable(
                state,
                &[TaskStatus::New, TaskStatus::InProgress],
                Some(objective_id),
            ) {
                let kind = state.tasks[&task_id].kind;
                return Decision {
                    phase: PhaseKind::execution_for(kind),
                    task_id: Some(task_id),
                    objective_id: Some(objective_id),
                    reason: "highest-priority task of the active objective".into(),
                    forced: false,
                };
            }
        }

        if let Some(task_id) = self.pick_workable(state, &[TaskStatus::AwaitingReview], None) {
            let objective_id = state.tasks[&task_id].objective_id;
            return Decision {
                phase: PhaseKind::review(),
                task_id: Some(task_id),
                objective_id,
                reason: "no construction work pending, reviewing".into(),
                forced: false,
            };
        }

        // Nothing to execute or review: plan. A planning streak that
        // produced no work short-circuits into recovery instead of waiting
        // for the general stagnation threshold.
        let planning = state.stats_mut(PhaseKind::Planning);
        let repeat = self.config.thresholds.planning_repeat;
        if planning.consecutive_same_phase >= repeat
            && planning.consecutive_without_new_work >= repeat
        {
            warn!(
                streak = planning.consecutive_same_phase,
                "planning keeps producing nothing, forcing recovery"
            );
            planning.consecutive_same_phase = 0;
            planning.consecutive_without_new_work = 0;
            let recovery = self.detector.recovery_phase();
            emit(
                &self.events,
                PipelineEvent::EscalationTriggered {
                    recovery,
                    reason: "planning loop with no new work".into(),
                },
            );
            return Decision {
                phase: recovery,
                task_id: None,
                objective_id: None,
                reason: "planning loop with no new work".into(),
                forced: true,
            };
        }

        Decision {
            phase: PhaseKind::Planning,
            task_id: None,
            objective_id: objective,
            reason: match objective {
                Some(_) => "active objective has no pending tasks".into(),
                None => "no selectable objectives".into(),
            },
            forced: false,
        }
    }

    /// Highest-priority workable task among `statuses`, scoped to an
    /// objective when given. Malformed tasks (no target artifact) are
    /// marked `Skipped` on the spot and never dispatched.
    fn pick_workable(
        &self,
        state: &mut PipelineState,
        statuses: &[TaskStatus],
        objective: Option<Uuid>,
    ) -> Option<Uuid> {
        let mut candidates: Vec<(i32, DateTime<Utc>, Uuid)> = state
            .tasks
            .values()
            .filter(|t| statuses.contains(&t.status) && !t.permanently_failed)
            .filter(|t| objective.is_none() || t.objective_id == objective)
            .map(|t| (t.priority, t.created_at, t.id))
            .collect();
        candidates.sort();

        for (_, _, id) in candidates {
            let Some(task) = state.tasks.get_mut(&id) else {
                continue;
            };
            if task.target_path.is_none() {
                warn!(task = %id, title = %task.title, "task has no target artifact, skipping");
                task.set_status(TaskStatus::Skipped);
                continue;
            }
            return Some(id);
        }
        None
    }

    // ------------------------------------------------------------------
    // Outcome recording
    // ------------------------------------------------------------------

    /// Fold one phase result back into the state: phase stats, planning
    /// products, checkpoint progress, task transitions, and objective
    /// progress, in that order.
    pub fn record_outcome(
        &self,
        state: &mut PipelineState,
        decision: &Decision,
        outcome: &PhaseOutcome,
    ) {
        let phase = decision.phase;
        let prev_phase = state.last_phase;

        if prev_phase != Some(phase) {
            if let Some(prev) = prev_phase {
                state.stats_mut(prev).consecutive_same_phase = 0;
            }
        }
        {
            let stats = state.stats_mut(phase);
            stats.record(outcome.success, outcome.artifacts_changed, outcome.no_work_found);
            stats.consecutive_same_phase = if prev_phase == Some(phase) {
                stats.consecutive_same_phase + 1
            } else {
                1
            };
            stats.consecutive_no_progress = if outcome.no_work_found {
                stats.consecutive_no_progress + 1
            } else {
                0
            };
        }

        // Planning products become real objectives and tasks.
        let mut created = 0usize;
        for spec in &outcome.new_objectives {
            self.model.add_objective(state, spec);
            created += 1;
        }
        for spec in &outcome.new_tasks {
            self.model.add_task(state, spec, decision.objective_id);
            created += 1;
        }
        {
            // A dispatch that carried a task mutated that task (attempts,
            // status, failure counters); that is measurable change. Only
            // taskless runs that also created nothing feed the loop trigger.
            let measurable_change = created > 0 || decision.task_id.is_some();
            let stats = state.stats_mut(phase);
            stats.consecutive_without_new_work = if measurable_change {
                0
            } else {
                stats.consecutive_without_new_work + 1
            };
        }

        if let Some(task_id) = decision.task_id {
            let newly = self
                .checkpoints
                .record_outcome(state, task_id, &outcome.tool_calls);
            if !newly.is_empty() {
                debug!(task = %task_id, steps = ?newly, "checkpoints advanced");
            }
            self.apply_task_outcome(state, task_id, phase, outcome);
        }

        // Refresh progress on every objective touched by this iteration.
        let mut touched: BTreeSet<Uuid> = BTreeSet::new();
        if let Some(oid) = decision.objective_id {
            touched.insert(oid);
        }
        if let Some(oid) = decision
            .task_id
            .and_then(|id| state.tasks.get(&id))
            .and_then(|t| t.objective_id)
        {
            touched.insert(oid);
        }
        for oid in touched {
            if self.model.refresh(state, oid) {
                let title = state
                    .objectives
                    .get(&oid)
                    .map(|o| o.title.clone())
                    .unwrap_or_default();
                emit(
                    &self.events,
                    PipelineEvent::ObjectiveCompleted {
                        objective_id: oid,
                        title,
                    },
                );
            }
        }

        state.last_run_progressed = outcome.success && outcome.artifacts_changed;
        state.last_phase = Some(phase);
        state.iteration += 1;
    }

    fn apply_task_outcome(
        &self,
        state: &mut PipelineState,
        task_id: Uuid,
        phase: PhaseKind,
        outcome: &PhaseOutcome,
    ) {
        let terminal = self.checkpoints.terminal_observed(state, task_id);
        let threshold = self.config.thresholds.permanent_failure;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return;
        };

        if !outcome.success {
            let frozen = task.record_failure(threshold);
            if frozen {
                warn!(
                    task = %task_id,
                    title = %task.title,
                    failures = task.failure_count,
                    "task permanently failed, excluded from future selection"
                );
                emit(
                    &self.events,
                    PipelineEvent::TaskPermanentlyFailed {
                        task_id,
                        title: task.title.clone(),
                        failure_count: task.failure_count,
                    },
                );
            } else {
                debug!(
                    task = %task_id,
                    failures = task.failure_count,
                    "task failure recorded, still eligible for retry"
                );
            }
            return;
        }

        match phase {
            PhaseKind::Qa => match outcome.status_hint {
                Some(TaskStatus::ReviewFailed) => {
                    info!(task = %task_id, title = %task.title, "review rejected the work");
                    task.set_status(TaskStatus::ReviewFailed);
                }
                _ => {
                    if terminal {
                        task.set_status(TaskStatus::Completed);
                        info!(task = %task_id, title = %task.title, "task completed");
                        emit(
                            &self.events,
                            PipelineEvent::TaskCompleted {
                                task_id,
                                title: task.title.clone(),
                            },
                        );
                    } else {
                        // Review passed, but the resolving operation was
                        // never observed in the operation log. Progress,
                        // not completion.
                        debug!(
                            task = %task_id,
                            "review passed without the terminal operation, task stays open"
                        );
                        task.set_status(TaskStatus::InProgress);
                    }
                }
            },
            PhaseKind::Coding | PhaseKind::Debugging | PhaseKind::Documentation => {
                if outcome.artifacts_changed {
                    let autonomous_done = terminal
                        && task.resolution_mode == ResolutionMode::Autonomous
                        && outcome.status_hint == Some(TaskStatus::Completed);
                    if autonomous_done {
                        task.set_status(TaskStatus::Completed);
                        info!(task = %task_id, title = %task.title, "task resolved autonomously");
                        emit(
                            &self.events,
                            PipelineEvent::TaskCompleted {
                                task_id,
                                title: task.title.clone(),
                            },
                        );
                    } else {
                        task.set_status(TaskStatus::AwaitingReview);
                    }
                }
                // Analysis-only success: the task simply stays in progress.
            }
            PhaseKind::Planning => {}
        }
    }

    // ------------------------------------------------------------------
    // The loop
    // ------------------------------------------------------------------

    /// Drive iterations until all objectives complete, a stop is requested,
    /// or the configured iteration cap is hit. State is persisted after the
    /// selection (so an activation is durable before dispatch) and again
    /// after the outcome is recorded, making a crash resumable from the
    /// last completed iteration.
    pub async fn run(&self) -> Result<RunSummary, PilotError> {
        let mut state = self.store.load()?;
        info!(
            run_id = %state.run_id,
            iteration = state.iteration,
            tasks = state.tasks.len(),
            objectives = state.objectives.len(),
            "pipeline loop starting"
        );

        let max = self.config.pipeline.max_iterations;
        let mut executed = 0u64;

        let stop = loop {
            if self.stop.is_stopping() {
                break StopCause::Stopped;
            }
            if state.all_objectives_completed() {
                break StopCause::AllObjectivesCompleted;
            }
            if max > 0 && executed >= max {
                break StopCause::MaxIterationsReached;
            }

            emit(
                &self.events,
                PipelineEvent::IterationStarted {
                    iteration: state.iteration,
                },
            );

            let decision = self.select_next_action(&mut state);
            info!(
                phase = %decision.phase,
                task = ?decision.task_id,
                forced = decision.forced,
                reason = %decision.reason,
                "action selected"
            );
            emit(
                &self.events,
                PipelineEvent::PhaseSelected {
                    phase: decision.phase,
                    task_id: decision.task_id,
                    reason: decision.reason.clone(),
                    forced: decision.forced,
                },
            );

            // Durable before dispatch: a re-load must observe the activated
            // objective, not its pre-selection status.
            self.store.save(&mut state)?;

            let task_snapshot = decision.task_id.and_then(|id| {
                let task = state.tasks.get_mut(&id)?;
                task.attempts += 1;
                if task.status == TaskStatus::New {
                    task.set_status(TaskStatus::InProgress);
                }
                Some(task.clone())
            });

            let ctx = DispatchContext {
                project_dir: self.project_dir.clone(),
                iteration: state.iteration,
                attempt: task_snapshot.as_ref().map(|t| t.attempts).unwrap_or(0),
                next_checkpoint: decision.task_id.and_then(|id| {
                    self.checkpoints
                        .next_step(&state, id)
                        .checkpoint_name()
                        .map(String::from)
                }),
            };

            let outcome = match self
                .executor
                .execute(decision.phase, task_snapshot.as_ref(), &ctx)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Executor trouble is a transient task failure, never
                    // fatal to the loop; the coordinator always produces a
                    // next action.
                    warn!(phase = %decision.phase, error = %e, "executor error recorded as failure");
                    PhaseOutcome::failed(e.to_string())
                }
            };

            emit(
                &self.events,
                PipelineEvent::OutcomeRecorded {
                    phase: decision.phase,
                    success: outcome.success,
                    artifacts_changed: outcome.artifacts_changed,
                },
            );

            self.record_outcome(&mut state, &decision, &outcome);
            self.store.save(&mut state)?;
            executed += 1;
        };

        let summary = RunSummary::from_state(&state, stop, executed);
        info!(
            stop = %summary.stop,
            iterations = summary.iterations,
            tasks_completed = summary.tasks_completed,
            tasks_failed = summary.tasks_failed,
            "pipeline loop finished"
        );
        emit(
            &self.events,
            PipelineEvent::Finished {
                iterations: summary.iterations,
                at: Utc::now(),
            },
        );
        Ok(summary)
    }
}
