use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::types::{CheckpointState, Objective, PhaseKind, PhaseRunStats, Task};

/// Current on-disk schema version. Bump on incompatible layout changes.
pub const STATE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

/// The full persisted graph: tasks, objectives, per-phase stats, and
/// per-task checkpoint state. Mutated only by the coordinator's single
/// thread between dispatches and written to disk at the end of every
/// iteration so a crash resumes from the last completed iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub version: u32,
    pub run_id: String,
    pub updated: DateTime<Utc>,
    /// Completed iterations since the run started.
    pub iteration: u64,
    /// Phase selected on the previous iteration.
    #[serde(default)]
    pub last_phase: Option<PhaseKind>,
    /// Whether the previous iteration succeeded *and* changed artifacts.
    /// Stagnation triggers stand down while this is true.
    #[serde(default)]
    pub last_run_progressed: bool,
    #[serde(default)]
    pub tasks: BTreeMap<Uuid, Task>,
    #[serde(default)]
    pub objectives: BTreeMap<Uuid, Objective>,
    #[serde(default)]
    pub phase_stats: BTreeMap<PhaseKind, PhaseRunStats>,
    #[serde(default)]
    pub checkpoints: BTreeMap<Uuid, CheckpointState>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            run_id: format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S")),
            updated: Utc::now(),
            iteration: 0,
            last_phase: None,
            last_run_progressed: false,
            tasks: BTreeMap::new(),
            objectives: BTreeMap::new(),
            phase_stats: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
        }
    }

    pub fn stats_mut(&mut self, phase: PhaseKind) -> &mut PhaseRunStats {
        self.phase_stats.entry(phase).or_default()
    }

    pub fn checkpoint_mut(&mut self, task_id: Uuid) -> &mut CheckpointState {
        self.checkpoints.entry(task_id).or_default()
    }

    /// Count of tasks not yet in a terminal status for the given objective.
    pub fn non_terminal_task_count(&self, objective: &Objective) -> usize {
        objective
            .task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.is_workable())
            .count()
    }

    /// Terminal condition: at least one objective exists and every one of
    /// them is completed.
    pub fn all_objectives_completed(&self) -> bool {
        !self.objectives.is_empty()
            && self
                .objectives
                .values()
                .all(|o| o.status == crate::types::ObjectiveStatus::Completed)
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// An existing state file could not be read back. Fatal: proceeding
    /// would silently discard progress, so the process must refuse to run
    /// rather than reinitialize.
    #[error("state file {path} is corrupt: {detail}")]
    Corrupt { path: PathBuf, detail: String },
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// File-backed persistence for [`PipelineState`].
///
/// Writes are atomic: the state is serialized to a temp file in the same
/// directory and renamed over the target, so a crash mid-write never leaves
/// a half-written state file behind.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store rooted at a project directory using the configured relative
    /// state path.
    pub fn for_project(project_dir: &Path, state_path: &str) -> Self {
        Self::new(project_dir.join(state_path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load persisted state. A missing file yields a fresh state; an
    /// unreadable, unparsable, or version-mismatched file is an error.
    pub fn load(&self) -> Result<PipelineState, StateStoreError> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "no state file, starting fresh");
            return Ok(PipelineState::new());
        }

        let data = std::fs::read_to_string(&self.path)?;
        let state: PipelineState =
            serde_json::from_str(&data).map_err(|e| StateStoreError::Corrupt {
                path: self.path.clone(),
                detail: e.to_string(),
            })?;

        if state.version != STATE_VERSION {
            return Err(StateStoreError::Corrupt {
                path: self.path.clone(),
                detail: format!(
                    "unsupported state version {} (expected {})",
                    state.version, STATE_VERSION
                ),
            });
        }

        tracing::debug!(
            path = %self.path.display(),
            iteration = state.iteration,
            tasks = state.tasks.len(),
            objectives = state.objectives.len(),
            "state loaded"
        );
        Ok(state)
    }

    /// Persist the state atomically, stamping `updated`.
    pub fn save(&self, state: &mut PipelineState) -> Result<(), StateStoreError> {
        state.updated = Utc::now();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(state).map_err(|e| StateStoreError::Corrupt {
            path: self.path.clone(),
            detail: format!("serialize: {}", e),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
