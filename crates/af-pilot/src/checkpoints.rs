use af_core::config::{CheckpointsConfig, StepRule, TargetRule};
use af_core::state_store::PipelineState;
use af_core::types::{TaskKind, ToolCall};
use tracing::debug;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// NextStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// The named checkpoint is the next required step.
    Checkpoint(String),
    /// Every required step has been observed.
    ReadyToResolve,
}

impl NextStep {
    pub fn checkpoint_name(&self) -> Option<&str> {
        match self {
            NextStep::Checkpoint(name) => Some(name),
            NextStep::ReadyToResolve => None,
        }
    }
}

// ---------------------------------------------------------------------------
// CheckpointTracker
// ---------------------------------------------------------------------------

/// Validates task progress against the required checkpoint sequence for its
/// kind. Everything is computed from the literal `(operation, arguments)`
/// log the executor reported; free-text output never marks a step done.
pub struct CheckpointTracker {
    config: CheckpointsConfig,
}

impl CheckpointTracker {
    pub fn new(config: CheckpointsConfig) -> Self {
        Self { config }
    }

    /// The ordered checkpoint sequence for a task kind. Kinds without a
    /// configured sequence have no required steps.
    pub fn required_steps(&self, kind: TaskKind) -> &[StepRule] {
        self.config.sequence_for(kind).unwrap_or(&[])
    }

    /// Append the reported calls to the task's history and recompute which
    /// steps are satisfied. Returns the names of steps newly completed by
    /// this outcome. Completed steps are monotonic: recomputation only ever
    /// adds.
    pub fn record_outcome(
        &self,
        state: &mut PipelineState,
        task_id: Uuid,
        calls: &[ToolCall],
    ) -> Vec<String> {
        let Some((kind, target)) = state
            .tasks
            .get(&task_id)
            .map(|t| (t.kind, t.target_path.clone()))
        else {
            return Vec::new();
        };

        let design_doc = self.config.design_doc.clone();
        let rules: Vec<StepRule> = self.required_steps(kind).to_vec();

        let checkpoint = state.checkpoint_mut(task_id);
        for call in calls {
            checkpoint.record_call(call.clone());
        }

        let mut newly = Vec::new();
        for rule in &rules {
            if checkpoint.is_complete(&rule.name) {
                continue;
            }
            let satisfied = checkpoint
                .tool_call_history
                .iter()
                .any(|call| rule_satisfied(rule, call, target.as_deref(), &design_doc));
            if satisfied {
                checkpoint.mark_step(rule.name.clone());
                debug!(task = %task_id, step = %rule.name, "checkpoint completed");
                newly.push(rule.name.clone());
            }
        }
        newly
    }

    /// The single next required step to present to the executor.
    pub fn next_step(&self, state: &PipelineState, task_id: Uuid) -> NextStep {
        let Some(task) = state.tasks.get(&task_id) else {
            return NextStep::ReadyToResolve;
        };
        let completed = state.checkpoints.get(&task_id);
        for rule in self.required_steps(task.kind) {
            let done = completed.is_some_and(|cp| cp.is_complete(&rule.name));
            if !done {
                return NextStep::Checkpoint(rule.name.clone());
            }
        }
        NextStep::ReadyToResolve
    }

    /// Whether the terminal, artifact-changing operation of the task's
    /// sequence has been observed. A task whose kind has no required steps
    /// is vacuously terminal. The coordinator refuses to close a task while
    /// this is `false`: analysis-only progress is progress, not completion.
    pub fn terminal_observed(&self, state: &PipelineState, task_id: Uuid) -> bool {
        let Some(task) = state.tasks.get(&task_id) else {
            return false;
        };
        let steps = self.required_steps(task.kind);
        let Some(terminal) = steps.last() else {
            return true;
        };
        state
            .checkpoints
            .get(&task_id)
            .is_some_and(|cp| cp.is_complete(&terminal.name))
    }
}

/// A call satisfies a step when its tool is listed and its target matches
/// the step's target rule.
fn rule_satisfied(
    rule: &StepRule,
    call: &ToolCall,
    task_target: Option<&str>,
    design_doc: &str,
) -> bool {
    if !rule.tools.iter().any(|t| t == &call.name) {
        return false;
    }
    match rule.target {
        TargetRule::Any => true,
        TargetRule::DesignDoc => call
            .target
            .as_deref()
            .is_some_and(|t| t.contains(design_doc)),
        TargetRule::TaskArtifact => match (call.target.as_deref(), task_target) {
            (Some(called), Some(wanted)) => called.contains(wanted) || wanted.contains(called),
            _ => false,
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
