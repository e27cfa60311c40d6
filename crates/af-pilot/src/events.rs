use af_core::types::PhaseKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// PipelineEvent
// ---------------------------------------------------------------------------

/// Progress notifications emitted by the coordinator. Consumers (the CLI)
/// drain these from a channel; dropping the receiver silently disables
/// emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    IterationStarted {
        iteration: u64,
    },
    PhaseSelected {
        phase: PhaseKind,
        task_id: Option<Uuid>,
        reason: String,
        forced: bool,
    },
    OutcomeRecorded {
        phase: PhaseKind,
        success: bool,
        artifacts_changed: bool,
    },
    EscalationTriggered {
        recovery: PhaseKind,
        reason: String,
    },
    TaskCompleted {
        task_id: Uuid,
        title: String,
    },
    TaskPermanentlyFailed {
        task_id: Uuid,
        title: String,
        failure_count: u32,
    },
    ObjectiveCompleted {
        objective_id: Uuid,
        title: String,
    },
    Finished {
        iterations: u64,
        at: DateTime<Utc>,
    },
}

/// Sending half handed to the coordinator. `None` disables event emission.
pub type EventSender = Option<flume::Sender<PipelineEvent>>;

pub(crate) fn emit(sender: &EventSender, event: PipelineEvent) {
    if let Some(tx) = sender {
        let _ = tx.send(event);
    }
}
