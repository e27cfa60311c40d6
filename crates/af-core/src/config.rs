use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::types::{PhaseKind, TaskKind};

/// Top-level configuration loaded from `<project>/.auto-forge/config.toml`.
///
/// Selection weights, stagnation thresholds, checkpoint sequences, and the
/// per-phase executor commands are policy knobs; the mechanisms consuming
/// them are fixed in `af-pilot`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub selection: SelectionWeights,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub executors: ExecutorsConfig,
    #[serde(default)]
    pub checkpoints: CheckpointsConfig,
}

impl Config {
    /// Load the config for a project directory, falling back to defaults
    /// when no config file exists.
    pub fn load_for(project_dir: &Path) -> Result<Self, ConfigError> {
        let path = Self::path_for(project_dir);
        if path.exists() {
            Self::load_from(&path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn path_for(project_dir: &Path) -> PathBuf {
        project_dir.join(".auto-forge").join("config.toml")
    }

    /// Semantic validation for settings not expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.selection.validate()?;
        self.thresholds.validate()?;
        self.executors.validate()?;
        self.checkpoints.validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// General
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_project_name() -> String {
    "auto-forge".into()
}
fn default_log_level() -> String {
    "info".into()
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stop after this many iterations; 0 means run until a terminal
    /// condition.
    #[serde(default)]
    pub max_iterations: u64,
    /// State file location, relative to the project directory.
    #[serde(default = "default_state_path")]
    pub state_path: String,
    /// Phase forced when the stagnation detector escalates.
    #[serde(default = "default_recovery_phase")]
    pub recovery_phase: PhaseKind,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            state_path: default_state_path(),
            recovery_phase: default_recovery_phase(),
        }
    }
}

fn default_state_path() -> String {
    ".auto-forge/state.json".into()
}
fn default_recovery_phase() -> PhaseKind {
    PhaseKind::Debugging
}

// ---------------------------------------------------------------------------
// Selection weights
// ---------------------------------------------------------------------------

/// Weights for the objective scoring function:
///
/// ```text
/// score = readiness·w_readiness + (1 − risk)·w_risk + urgency·w_urgency
///       − complexity·w_complexity − dependency_depth·w_depth
///       − resource_cost·w_cost
///       + level_weight · strategic_weight · w_level
/// ```
///
/// The defaults follow a 40/20/10/30 readiness/risk/urgency/complexity
/// split with a small level bonus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SelectionWeights {
    #[serde(default = "default_w_readiness")]
    pub readiness: f64,
    #[serde(default = "default_w_risk")]
    pub risk: f64,
    #[serde(default = "default_w_urgency")]
    pub urgency: f64,
    #[serde(default = "default_w_complexity")]
    pub complexity: f64,
    #[serde(default = "default_w_depth")]
    pub dependency_depth: f64,
    #[serde(default = "default_w_cost")]
    pub resource_cost: f64,
    #[serde(default = "default_w_level")]
    pub level: f64,
}

impl SelectionWeights {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let all = [
            ("readiness", self.readiness),
            ("risk", self.risk),
            ("urgency", self.urgency),
            ("complexity", self.complexity),
            ("dependency_depth", self.dependency_depth),
            ("resource_cost", self.resource_cost),
            ("level", self.level),
        ];
        for (name, value) in all {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "selection.{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            readiness: default_w_readiness(),
            risk: default_w_risk(),
            urgency: default_w_urgency(),
            complexity: default_w_complexity(),
            dependency_depth: default_w_depth(),
            resource_cost: default_w_cost(),
            level: default_w_level(),
        }
    }
}

fn default_w_readiness() -> f64 {
    0.4
}
fn default_w_risk() -> f64 {
    0.2
}
fn default_w_urgency() -> f64 {
    0.1
}
fn default_w_complexity() -> f64 {
    0.3
}
fn default_w_depth() -> f64 {
    0.05
}
fn default_w_cost() -> f64 {
    0.05
}
fn default_w_level() -> f64 {
    0.15
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    /// Failures before a task is frozen as permanently failed.
    #[serde(default = "default_permanent_failure")]
    pub permanent_failure: u32,
    /// A phase whose rolling success rate drops below this floor triggers
    /// recovery.
    #[serde(default = "default_success_rate_floor")]
    pub success_rate_floor: f64,
    /// Minimum runs before the success-rate floor applies.
    #[serde(default = "default_min_runs_for_rate")]
    pub min_runs_for_rate: u32,
    /// Identical operations in a row before the repetition trigger fires.
    #[serde(default = "default_repeated_action")]
    pub repeated_action: u32,
    /// Consecutive "no work found" reports before recovery.
    #[serde(default = "default_no_work")]
    pub no_work: u32,
    /// Consecutive same-phase selections with zero new work before the
    /// planning-loop trigger fires.
    #[serde(default = "default_planning_repeat")]
    pub planning_repeat: u32,
    /// Completion ratio at which an objective moves toward completion.
    #[serde(default = "default_completing_ratio")]
    pub completing_ratio: f64,
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.permanent_failure == 0 {
            return Err(ConfigError::Validation(
                "thresholds.permanent_failure must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.success_rate_floor) {
            return Err(ConfigError::Validation(
                "thresholds.success_rate_floor must be in [0, 1]".into(),
            ));
        }
        if self.min_runs_for_rate == 0 {
            return Err(ConfigError::Validation(
                "thresholds.min_runs_for_rate must be at least 1".into(),
            ));
        }
        if self.repeated_action < 2 {
            return Err(ConfigError::Validation(
                "thresholds.repeated_action must be at least 2".into(),
            ));
        }
        if self.no_work == 0 || self.planning_repeat == 0 {
            return Err(ConfigError::Validation(
                "thresholds.no_work and thresholds.planning_repeat must be at least 1".into(),
            ));
        }
        if !(self.completing_ratio > 0.0 && self.completing_ratio <= 1.0) {
            return Err(ConfigError::Validation(
                "thresholds.completing_ratio must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            permanent_failure: default_permanent_failure(),
            success_rate_floor: default_success_rate_floor(),
            min_runs_for_rate: default_min_runs_for_rate(),
            repeated_action: default_repeated_action(),
            no_work: default_no_work(),
            planning_repeat: default_planning_repeat(),
            completing_ratio: default_completing_ratio(),
        }
    }
}

fn default_permanent_failure() -> u32 {
    5
}
fn default_success_rate_floor() -> f64 {
    0.3
}
fn default_min_runs_for_rate() -> u32 {
    3
}
fn default_repeated_action() -> u32 {
    3
}
fn default_no_work() -> u32 {
    3
}
fn default_planning_repeat() -> u32 {
    2
}
fn default_completing_ratio() -> f64 {
    0.8
}

// ---------------------------------------------------------------------------
// Executors
// ---------------------------------------------------------------------------

/// External phase executor commands. Each entry is a program followed by its
/// arguments; the dispatch payload is written to the child's stdin and the
/// outcome read from its stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorsConfig {
    #[serde(default = "default_executor_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub commands: BTreeMap<PhaseKind, Vec<String>>,
}

impl ExecutorsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "executors.timeout_secs must be at least 1".into(),
            ));
        }
        for (phase, command) in &self.commands {
            if command.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "executors.commands.{} must not be empty",
                    phase
                )));
            }
        }
        Ok(())
    }
}

impl Default for ExecutorsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_executor_timeout(),
            commands: BTreeMap::new(),
        }
    }
}

fn default_executor_timeout() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// What a tool call must have operated on to satisfy a checkpoint step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRule {
    /// The call's target must match the task's target artifact.
    TaskArtifact,
    /// The call must have read the project design document.
    DesignDoc,
    /// Any target (or none) satisfies the step.
    Any,
}

/// One required step in a task kind's checkpoint sequence. A step is
/// satisfied by any listed tool whose target matches the rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRule {
    pub name: String,
    pub tools: Vec<String>,
    #[serde(default = "default_target_rule")]
    pub target: TargetRule,
}

impl StepRule {
    fn new(name: &str, tools: &[&str], target: TargetRule) -> Self {
        Self {
            name: name.into(),
            tools: tools.iter().map(|t| (*t).into()).collect(),
            target,
        }
    }
}

fn default_target_rule() -> TargetRule {
    TargetRule::Any
}

/// Ordered checkpoint sequences per task kind. The final step of every
/// sequence is the terminal, artifact-changing operation; a task is never
/// resolved until that step has been observed in its operation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointsConfig {
    /// File name of the design document consulted by `DesignDoc` steps.
    #[serde(default = "default_design_doc")]
    pub design_doc: String,
    #[serde(default = "default_sequences")]
    pub sequences: BTreeMap<TaskKind, Vec<StepRule>>,
}

impl CheckpointsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (kind, steps) in &self.sequences {
            if steps.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "checkpoints.sequences.{} must not be empty",
                    kind
                )));
            }
            let mut seen = std::collections::BTreeSet::new();
            for step in steps {
                if step.tools.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "checkpoint step '{}' for {} lists no tools",
                        step.name, kind
                    )));
                }
                if !seen.insert(step.name.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "checkpoint step '{}' duplicated for {}",
                        step.name, kind
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn sequence_for(&self, kind: TaskKind) -> Option<&[StepRule]> {
        self.sequences.get(&kind).map(|s| s.as_slice())
    }
}

impl Default for CheckpointsConfig {
    fn default() -> Self {
        Self {
            design_doc: default_design_doc(),
            sequences: default_sequences(),
        }
    }
}

fn default_design_doc() -> String {
    "ARCHITECTURE.md".into()
}

fn default_sequences() -> BTreeMap<TaskKind, Vec<StepRule>> {
    let mut map = BTreeMap::new();
    map.insert(
        TaskKind::Feature,
        vec![
            StepRule::new("read_targets", &["read_file"], TargetRule::TaskArtifact),
            StepRule::new(
                "apply_change",
                &["write_file", "edit_file", "create_file"],
                TargetRule::TaskArtifact,
            ),
        ],
    );
    map.insert(
        TaskKind::BugFix,
        vec![
            StepRule::new("read_targets", &["read_file"], TargetRule::TaskArtifact),
            StepRule::new(
                "diagnose",
                &["run_tests", "analyze_failure", "search_code"],
                TargetRule::Any,
            ),
            StepRule::new(
                "apply_change",
                &["write_file", "edit_file"],
                TargetRule::TaskArtifact,
            ),
        ],
    );
    map.insert(
        TaskKind::Refactor,
        vec![
            StepRule::new("read_targets", &["read_file"], TargetRule::TaskArtifact),
            StepRule::new("read_design_doc", &["read_file"], TargetRule::DesignDoc),
            StepRule::new(
                "analyze",
                &["analyze_complexity", "detect_dead_code", "analyze_imports"],
                TargetRule::Any,
            ),
            StepRule::new(
                "apply_change",
                &["write_file", "edit_file", "move_file"],
                TargetRule::TaskArtifact,
            ),
        ],
    );
    map.insert(
        TaskKind::Consolidation,
        vec![
            StepRule::new("read_targets", &["read_file"], TargetRule::TaskArtifact),
            StepRule::new("read_design_doc", &["read_file"], TargetRule::DesignDoc),
            StepRule::new(
                "compare",
                &["compare_implementations", "diff_files"],
                TargetRule::Any,
            ),
            StepRule::new(
                "resolve",
                &["merge_implementations", "remove_file", "rewrite_file"],
                TargetRule::Any,
            ),
        ],
    );
    map.insert(
        TaskKind::Documentation,
        vec![
            StepRule::new("read_targets", &["read_file"], TargetRule::Any),
            StepRule::new(
                "update_docs",
                &["write_file", "edit_file"],
                TargetRule::TaskArtifact,
            ),
        ],
    );
    map
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        cfg.validate().expect("default config should be valid");
        assert_eq!(cfg.thresholds.permanent_failure, 5);
        assert_eq!(cfg.pipeline.recovery_phase, PhaseKind::Debugging);
    }

    #[test]
    fn every_kind_has_a_default_sequence() {
        let cfg = CheckpointsConfig::default();
        for kind in [
            TaskKind::Feature,
            TaskKind::BugFix,
            TaskKind::Refactor,
            TaskKind::Consolidation,
            TaskKind::Documentation,
        ] {
            let seq = cfg.sequence_for(kind).expect("sequence missing");
            assert!(!seq.is_empty());
        }
    }

    #[test]
    fn consolidation_sequence_ends_in_resolve() {
        let cfg = CheckpointsConfig::default();
        let seq = cfg.sequence_for(TaskKind::Consolidation).unwrap();
        assert_eq!(seq.first().unwrap().name, "read_targets");
        assert_eq!(seq.last().unwrap().name, "resolve");
    }

    #[test]
    fn negative_weight_is_rejected() {
        let mut cfg = Config::default();
        cfg.selection.readiness = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_failure_threshold_is_rejected() {
        let mut cfg = Config::default();
        cfg.thresholds.permanent_failure = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let text = r#"
            [general]
            project_name = "demo"

            [thresholds]
            permanent_failure = 3

            [executors.commands]
            coding = ["/usr/local/bin/forge-coder", "--json"]
        "#;
        let cfg: Config = toml::from_str(text).expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.general.project_name, "demo");
        assert_eq!(cfg.thresholds.permanent_failure, 3);
        assert_eq!(cfg.thresholds.no_work, 3);
        assert_eq!(
            cfg.executors.commands.get(&PhaseKind::Coding).unwrap()[0],
            "/usr/local/bin/forge-coder"
        );
    }

    #[test]
    fn empty_executor_command_is_rejected() {
        let mut cfg = Config::default();
        cfg.executors.commands.insert(PhaseKind::Qa, vec![]);
        assert!(cfg.validate().is_err());
    }
}
