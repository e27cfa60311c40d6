use af_core::config::Thresholds;
use af_core::state_store::PipelineState;
use af_core::types::PhaseKind;
use std::fmt;
use tracing::warn;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StagnationReason / Escalation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StagnationReason {
    /// The same `(operation, arguments)` pair ran repeatedly for one task.
    RepeatedAction {
        task_id: Uuid,
        signature: String,
        count: u32,
    },
    /// A phase's rolling success rate fell through the floor.
    LowSuccessRate {
        phase: PhaseKind,
        rate: f64,
        window: u32,
    },
    /// A phase kept reporting that it found nothing to do.
    NoWorkStreak { phase: PhaseKind, count: u32 },
    /// The same phase kept being selected without producing any new tasks
    /// or objectives.
    SelectionLoop { phase: PhaseKind, count: u32 },
}

impl fmt::Display for StagnationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagnationReason::RepeatedAction {
                signature, count, ..
            } => {
                write!(f, "operation `{}` repeated {} times", signature, count)
            }
            StagnationReason::LowSuccessRate {
                phase,
                rate,
                window,
            } => write!(
                f,
                "phase {} success rate {:.0}% over last {} runs",
                phase,
                rate * 100.0,
                window
            ),
            StagnationReason::NoWorkStreak { phase, count } => {
                write!(f, "phase {} reported no work {} times in a row", phase, count)
            }
            StagnationReason::SelectionLoop { phase, count } => {
                write!(
                    f,
                    "phase {} selected {} consecutive iterations with no new work",
                    phase, count
                )
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Escalation {
    pub reason: StagnationReason,
    pub recovery: PhaseKind,
}

// ---------------------------------------------------------------------------
// StagnationDetector
// ---------------------------------------------------------------------------

/// Recognizes non-progress from the recent history of operations and phase
/// outcomes, and names the recovery phase to force.
///
/// One explicit non-trigger: a previous iteration that succeeded *and*
/// changed artifacts stands every check down. Long streaks of productive
/// same-phase work are normal multi-step construction, and interrupting
/// them is the most damaging false positive in this domain.
pub struct StagnationDetector {
    thresholds: Thresholds,
    recovery: PhaseKind,
}

impl StagnationDetector {
    pub fn new(thresholds: Thresholds, recovery: PhaseKind) -> Self {
        Self {
            thresholds,
            recovery,
        }
    }

    pub fn recovery_phase(&self) -> PhaseKind {
        self.recovery
    }

    /// Evaluate every trigger against the current state. Returns the first
    /// escalation found, or `None` while progress looks healthy.
    pub fn assess(&self, state: &PipelineState) -> Option<Escalation> {
        if state.last_run_progressed {
            return None;
        }

        if let Some(reason) = self.repeated_action(state) {
            return Some(self.escalate(reason));
        }

        for (phase, stats) in &state.phase_stats {
            let window = self.thresholds.min_runs_for_rate as usize;
            if let Some(rate) = stats.recent_success_rate(window) {
                if rate < self.thresholds.success_rate_floor {
                    return Some(self.escalate(StagnationReason::LowSuccessRate {
                        phase: *phase,
                        rate,
                        window: window as u32,
                    }));
                }
            }

            if stats.consecutive_no_progress >= self.thresholds.no_work {
                return Some(self.escalate(StagnationReason::NoWorkStreak {
                    phase: *phase,
                    count: stats.consecutive_no_progress,
                }));
            }

            if stats.consecutive_same_phase >= self.thresholds.planning_repeat
                && stats.consecutive_without_new_work >= self.thresholds.planning_repeat
            {
                return Some(self.escalate(StagnationReason::SelectionLoop {
                    phase: *phase,
                    count: stats.consecutive_same_phase,
                }));
            }
        }

        None
    }

    /// Clear the counters behind a fired trigger so one stale streak cannot
    /// re-escalate forever.
    pub fn apply_resets(&self, state: &mut PipelineState, escalation: &Escalation) {
        match &escalation.reason {
            StagnationReason::RepeatedAction { task_id, .. } => {
                let checkpoint = state.checkpoint_mut(*task_id);
                checkpoint.scan_cursor = checkpoint.tool_call_history.len();
            }
            StagnationReason::LowSuccessRate { phase, .. } => {
                let stats = state.stats_mut(*phase);
                stats.recent.clear();
                stats.consecutive_same_phase = 0;
            }
            StagnationReason::NoWorkStreak { phase, .. } => {
                state.stats_mut(*phase).consecutive_no_progress = 0;
            }
            StagnationReason::SelectionLoop { phase, .. } => {
                let stats = state.stats_mut(*phase);
                stats.consecutive_same_phase = 0;
                stats.consecutive_without_new_work = 0;
            }
        }
    }

    fn escalate(&self, reason: StagnationReason) -> Escalation {
        warn!(recovery = %self.recovery, %reason, "stagnation detected, forcing recovery phase");
        Escalation {
            reason,
            recovery: self.recovery,
        }
    }

    fn repeated_action(&self, state: &PipelineState) -> Option<StagnationReason> {
        for (task_id, checkpoint) in &state.checkpoints {
            let workable = state
                .tasks
                .get(task_id)
                .is_some_and(|t| t.is_workable());
            if !workable {
                continue;
            }
            if let Some((signature, count)) = checkpoint.trailing_repeat() {
                if count >= self.thresholds.repeated_action {
                    return Some(StagnationReason::RepeatedAction {
                        task_id: *task_id,
                        signature,
                        count,
                    });
                }
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
