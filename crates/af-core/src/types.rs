use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    InProgress,
    AwaitingReview,
    ReviewFailed,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Returns `true` for statuses a task can never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::New, TaskStatus::InProgress)
                | (TaskStatus::New, TaskStatus::Skipped)
                | (TaskStatus::InProgress, TaskStatus::AwaitingReview)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::InProgress, TaskStatus::Skipped)
                | (TaskStatus::AwaitingReview, TaskStatus::Completed)
                | (TaskStatus::AwaitingReview, TaskStatus::ReviewFailed)
                | (TaskStatus::AwaitingReview, TaskStatus::InProgress)
                | (TaskStatus::AwaitingReview, TaskStatus::Skipped)
                | (TaskStatus::ReviewFailed, TaskStatus::AwaitingReview)
                | (TaskStatus::ReviewFailed, TaskStatus::InProgress)
                | (TaskStatus::ReviewFailed, TaskStatus::Failed)
                | (TaskStatus::ReviewFailed, TaskStatus::Skipped)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::New => "new",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::AwaitingReview => "awaiting_review",
            TaskStatus::ReviewFailed => "review_failed",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// TaskKind / ResolutionMode
// ---------------------------------------------------------------------------

/// Kind of work a task represents. Drives which checkpoint sequence the
/// executor must walk before the task may be resolved.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Feature,
    BugFix,
    Refactor,
    Consolidation,
    Documentation,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskKind::Feature => "feature",
            TaskKind::BugFix => "bug_fix",
            TaskKind::Refactor => "refactor",
            TaskKind::Consolidation => "consolidation",
            TaskKind::Documentation => "documentation",
        };
        write!(f, "{}", label)
    }
}

/// Whether the external executor may resolve a task unattended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    #[default]
    Autonomous,
    NeedsHumanReview,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub objective_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    /// Opaque artifact identifier (usually a file path). A task without a
    /// target is malformed and is skipped at selection time instead of
    /// dispatched.
    pub target_path: Option<String>,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Lower number = more urgent.
    pub priority: i32,
    pub attempts: u32,
    pub failure_count: u32,
    pub permanently_failed: bool,
    pub resolution_mode: ResolutionMode,
    /// Open bag for phase-specific context; owned by whichever phase last
    /// wrote it.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>, kind: TaskKind, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            objective_id: None,
            title: title.into(),
            description: None,
            target_path: None,
            kind,
            status: TaskStatus::New,
            priority,
            attempts: 0,
            failure_count: 0,
            permanently_failed: false,
            resolution_mode: ResolutionMode::default(),
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target_path = Some(target.into());
        self
    }

    pub fn with_objective(mut self, objective_id: Uuid) -> Self {
        self.objective_id = Some(objective_id);
        self
    }

    /// Move the task to `status`, bumping `updated_at`.
    pub fn set_status(&mut self, status: TaskStatus) {
        if self.status != status && !self.status.can_transition_to(&status) {
            tracing::debug!(
                task = %self.id,
                from = %self.status,
                to = %status,
                "task status transition outside the usual matrix"
            );
        }
        self.status = status;
        self.touch();
    }

    /// Record one failed dispatch. Once `failure_count` reaches `threshold`
    /// the task is frozen: `permanently_failed` is set and the status becomes
    /// `Failed`. Returns `true` if this call crossed the threshold.
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        self.failure_count += 1;
        self.touch();
        if !self.permanently_failed && self.failure_count >= threshold {
            self.permanently_failed = true;
            self.status = TaskStatus::Failed;
            return true;
        }
        false
    }

    /// Eligible for selection: non-terminal and not frozen.
    pub fn is_workable(&self) -> bool {
        !self.permanently_failed && !self.status.is_terminal()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// PhaseKind
// ---------------------------------------------------------------------------

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Planning,
    Coding,
    Qa,
    Debugging,
    Documentation,
}

impl PhaseKind {
    /// The phase that executes new or in-flight work of the given kind.
    pub fn execution_for(kind: TaskKind) -> PhaseKind {
        match kind {
            TaskKind::Feature | TaskKind::BugFix | TaskKind::Refactor | TaskKind::Consolidation => {
                PhaseKind::Coding
            }
            TaskKind::Documentation => PhaseKind::Documentation,
        }
    }

    /// The phase that reviews work awaiting review.
    pub fn review() -> PhaseKind {
        PhaseKind::Qa
    }

    pub fn all() -> &'static [PhaseKind] {
        &[
            PhaseKind::Planning,
            PhaseKind::Coding,
            PhaseKind::Qa,
            PhaseKind::Debugging,
            PhaseKind::Documentation,
        ]
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PhaseKind::Planning => "planning",
            PhaseKind::Coding => "coding",
            PhaseKind::Qa => "qa",
            PhaseKind::Debugging => "debugging",
            PhaseKind::Documentation => "documentation",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// ToolCall
// ---------------------------------------------------------------------------

/// One operation the executor actually performed, reported literally and in
/// order. The checkpoint tracker and the stagnation detector both consume
/// this log; neither ever parses the agent's natural-language output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: None,
            args: serde_json::Value::Null,
        }
    }

    pub fn on(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: Some(target.into()),
            args: serde_json::Value::Null,
        }
    }

    /// Stable key identifying "the same operation with the same arguments".
    /// Arguments are folded in truncated so huge payloads (file contents)
    /// cannot blow up the signature.
    pub fn signature(&self) -> String {
        let mut sig = self.name.clone();
        if let Some(target) = &self.target {
            sig.push_str(":");
            sig.push_str(target);
        }
        if !self.args.is_null() {
            let rendered = self.args.to_string();
            let clipped: String = rendered.chars().take(64).collect();
            sig.push_str(":");
            sig.push_str(&clipped);
        }
        sig
    }
}

// ---------------------------------------------------------------------------
// PhaseOutcome
// ---------------------------------------------------------------------------

/// The single consolidated result a phase executor reports back for one
/// dispatch. One explicit type per contract -- collaborators cannot hand back
/// loosely-shaped data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub success: bool,
    pub artifacts_changed: bool,
    /// The phase looked for work and found none. Feeds the stagnation
    /// detector; distinct from failure.
    #[serde(default)]
    pub no_work_found: bool,
    /// Optional hint for the task's next status (e.g. a review verdict).
    #[serde(default)]
    pub status_hint: Option<TaskStatus>,
    /// Literal, ordered log of every operation performed, read-only ones
    /// included.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Tasks proposed by a planning run.
    #[serde(default)]
    pub new_tasks: Vec<TaskSpec>,
    /// Objectives proposed by a planning run.
    #[serde(default)]
    pub new_objectives: Vec<ObjectiveSpec>,
    #[serde(default)]
    pub summary: String,
}

impl PhaseOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            artifacts_changed: false,
            no_work_found: false,
            status_hint: None,
            tool_calls: Vec::new(),
            new_tasks: Vec::new(),
            new_objectives: Vec::new(),
            summary: String::new(),
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            artifacts_changed: false,
            no_work_found: false,
            status_hint: None,
            tool_calls: Vec::new(),
            new_tasks: Vec::new(),
            new_objectives: Vec::new(),
            summary: summary.into(),
        }
    }

    pub fn no_work() -> Self {
        Self {
            no_work_found: true,
            ..Self::succeeded()
        }
    }

    pub fn with_changes(mut self) -> Self {
        self.artifacts_changed = true;
        self
    }

    pub fn with_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn with_hint(mut self, hint: TaskStatus) -> Self {
        self.status_hint = Some(hint);
        self
    }
}

/// Shape of a task proposed by the planning phase. The objective model turns
/// these into real [`Task`]s; executors never construct tasks directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub target_path: Option<String>,
    pub kind: TaskKind,
    pub priority: i32,
    #[serde(default)]
    pub resolution_mode: ResolutionMode,
    #[serde(default)]
    pub objective_id: Option<Uuid>,
}

/// Shape of an objective proposed by the planning phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveSpec {
    pub title: String,
    pub level: ObjectiveLevel,
    #[serde(default)]
    pub profile: ObjectiveProfile,
}

// ---------------------------------------------------------------------------
// ObjectiveLevel / ObjectiveStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveLevel {
    Primary,
    Secondary,
    Tertiary,
}

impl ObjectiveLevel {
    /// Weight of this level in objective scoring.
    pub fn weight(&self) -> f64 {
        match self {
            ObjectiveLevel::Primary => 1.0,
            ObjectiveLevel::Secondary => 0.6,
            ObjectiveLevel::Tertiary => 0.3,
        }
    }
}

impl fmt::Display for ObjectiveLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ObjectiveLevel::Primary => "primary",
            ObjectiveLevel::Secondary => "secondary",
            ObjectiveLevel::Tertiary => "tertiary",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveStatus {
    Proposed,
    Approved,
    Active,
    Completing,
    Completed,
}

impl ObjectiveStatus {
    /// Active or further along. All checks against "is this objective being
    /// worked" compare enum variants -- never a rendered string, which would
    /// drag the type name into the comparison.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ObjectiveStatus::Active | ObjectiveStatus::Completing)
    }

    /// Statuses eligible for selection.
    pub fn is_selectable(&self) -> bool {
        matches!(
            self,
            ObjectiveStatus::Approved | ObjectiveStatus::Active | ObjectiveStatus::Completing
        )
    }
}

impl fmt::Display for ObjectiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ObjectiveStatus::Proposed => "proposed",
            ObjectiveStatus::Approved => "approved",
            ObjectiveStatus::Active => "active",
            ObjectiveStatus::Completing => "completing",
            ObjectiveStatus::Completed => "completed",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// ObjectiveProfile
// ---------------------------------------------------------------------------

/// Fixed-size vector of scalar scores in `[0, 1]` used as selection input.
/// These are advisory signals, never ground truth about the objective.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveProfile {
    pub complexity: f64,
    pub risk: f64,
    pub readiness: f64,
    pub urgency: f64,
    pub dependency_depth: f64,
    pub resource_cost: f64,
    pub strategic_weight: f64,
}

impl ObjectiveProfile {
    /// Build a profile with every score clamped into `[0, 1]`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        complexity: f64,
        risk: f64,
        readiness: f64,
        urgency: f64,
        dependency_depth: f64,
        resource_cost: f64,
        strategic_weight: f64,
    ) -> Self {
        Self {
            complexity: clamp01(complexity),
            risk: clamp01(risk),
            readiness: clamp01(readiness),
            urgency: clamp01(urgency),
            dependency_depth: clamp01(dependency_depth),
            resource_cost: clamp01(resource_cost),
            strategic_weight: clamp01(strategic_weight),
        }
    }

    /// Re-clamp every score (useful after deserializing untrusted input).
    pub fn clamped(&self) -> Self {
        Self::new(
            self.complexity,
            self.risk,
            self.readiness,
            self.urgency,
            self.dependency_depth,
            self.resource_cost,
            self.strategic_weight,
        )
    }
}

impl Default for ObjectiveProfile {
    fn default() -> Self {
        Self {
            complexity: 0.5,
            risk: 0.5,
            readiness: 0.5,
            urgency: 0.5,
            dependency_depth: 0.5,
            resource_cost: 0.5,
            strategic_weight: 0.5,
        }
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Objective
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    pub id: Uuid,
    pub level: ObjectiveLevel,
    pub title: String,
    pub status: ObjectiveStatus,
    /// Member task ids, insertion-ordered for display; order is irrelevant
    /// for selection.
    pub task_ids: Vec<Uuid>,
    pub profile: ObjectiveProfile,
    /// Recomputed from constituent task statuses; written directly only at
    /// the `Completed` transition.
    pub completion_ratio: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Objective {
    pub fn new(title: impl Into<String>, level: ObjectiveLevel) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            level,
            title: title.into(),
            status: ObjectiveStatus::Proposed,
            task_ids: Vec::new(),
            profile: ObjectiveProfile::default(),
            completion_ratio: 0.0,
            created_at: now,
            updated_at: now,
            activated_at: None,
            completed_at: None,
        }
    }

    pub fn with_profile(mut self, profile: ObjectiveProfile) -> Self {
        self.profile = profile.clamped();
        self
    }

    pub fn with_status(mut self, status: ObjectiveStatus) -> Self {
        self.status = status;
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// PhaseRunStats
// ---------------------------------------------------------------------------

/// Cap on the per-phase run history kept for rolling metrics.
pub const RUN_HISTORY_CAP: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub success: bool,
    pub artifacts_changed: bool,
    pub no_work_found: bool,
    pub at: DateTime<Utc>,
}

/// Per-phase counters consumed exclusively by the stagnation detector.
/// All loop-prevention state lives here, not in ambient module variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseRunStats {
    pub runs: u64,
    pub successes: u64,
    /// Immediately-preceding iterations that selected this same phase.
    pub consecutive_same_phase: u32,
    /// Immediately-preceding runs of this phase that reported "no work".
    pub consecutive_no_progress: u32,
    /// Immediately-preceding runs of this phase that created zero tasks
    /// and zero objectives. Catches planning loops.
    pub consecutive_without_new_work: u32,
    /// Bounded recent-run window for rolling success-rate checks.
    #[serde(default)]
    pub recent: Vec<RunRecord>,
}

impl PhaseRunStats {
    pub fn record(&mut self, success: bool, artifacts_changed: bool, no_work_found: bool) {
        self.runs += 1;
        if success {
            self.successes += 1;
        }
        self.recent.push(RunRecord {
            success,
            artifacts_changed,
            no_work_found,
            at: Utc::now(),
        });
        if self.recent.len() > RUN_HISTORY_CAP {
            let excess = self.recent.len() - RUN_HISTORY_CAP;
            self.recent.drain(..excess);
        }
    }

    /// Consecutive failures counted back from the most recent run.
    pub fn consecutive_failures(&self) -> u32 {
        let mut count = 0;
        for run in self.recent.iter().rev() {
            if run.success {
                break;
            }
            count += 1;
        }
        count
    }

    /// Success rate over the last `n` runs, or `None` when fewer than `n`
    /// runs are recorded.
    pub fn recent_success_rate(&self, n: usize) -> Option<f64> {
        if self.recent.len() < n || n == 0 {
            return None;
        }
        let window = &self.recent[self.recent.len() - n..];
        let ok = window.iter().filter(|r| r.success).count();
        Some(ok as f64 / n as f64)
    }
}

// ---------------------------------------------------------------------------
// CheckpointState
// ---------------------------------------------------------------------------

/// Per-task record of which required sub-steps have actually been executed,
/// derived strictly from the literal operation log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Completed checkpoint names. Insert-only: once a step is marked
    /// complete it never un-completes for the task's lifetime.
    pub completed_steps: BTreeSet<String>,
    /// Append-only ordered log of executed operations for the task.
    pub tool_call_history: Vec<ToolCall>,
    /// Index the repetition scan starts from. Bumped forward when a
    /// repeated-action escalation fires so one stale streak cannot
    /// re-trigger forever; the history itself is never truncated.
    #[serde(default)]
    pub scan_cursor: usize,
}

impl CheckpointState {
    pub fn record_call(&mut self, call: ToolCall) {
        self.tool_call_history.push(call);
    }

    pub fn mark_step(&mut self, name: impl Into<String>) -> bool {
        self.completed_steps.insert(name.into())
    }

    pub fn is_complete(&self, step: &str) -> bool {
        self.completed_steps.contains(step)
    }

    /// Length of the trailing run of identical call signatures, looking only
    /// past `scan_cursor`.
    pub fn trailing_repeat(&self) -> Option<(String, u32)> {
        let window = self.tool_call_history.get(self.scan_cursor..)?;
        let last = window.last()?;
        let sig = last.signature();
        let count = window
            .iter()
            .rev()
            .take_while(|c| c.signature() == sig)
            .count() as u32;
        Some((sig, count))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
