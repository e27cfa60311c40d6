use af_core::config::{SelectionWeights, Thresholds};
use af_core::state_store::PipelineState;
use af_core::types::{
    Objective, ObjectiveSpec, ObjectiveStatus, Task, TaskSpec, TaskStatus,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ObjectiveModel
// ---------------------------------------------------------------------------

/// Owns every objective mutation. The coordinator asks for selections and
/// refreshes; it never writes objective fields directly.
pub struct ObjectiveModel {
    weights: SelectionWeights,
    completing_ratio: f64,
}

impl ObjectiveModel {
    pub fn new(weights: SelectionWeights, thresholds: &Thresholds) -> Self {
        Self {
            weights,
            completing_ratio: thresholds.completing_ratio,
        }
    }

    /// Scalarized objective score. Higher is better. The profile is advisory
    /// selection input only; nothing here treats it as ground truth.
    pub fn score(&self, objective: &Objective) -> f64 {
        let p = &objective.profile;
        self.weights.readiness * p.readiness
            + self.weights.risk * (1.0 - p.risk)
            + self.weights.urgency * p.urgency
            - self.weights.complexity * p.complexity
            - self.weights.dependency_depth * p.dependency_depth
            - self.weights.resource_cost * p.resource_cost
            + self.weights.level * objective.level.weight() * p.strategic_weight
    }

    /// Pick the objective to work on and activate it if it was merely
    /// approved. Returns `None` only when no objective is selectable at all.
    ///
    /// Selection is sticky: an `Active` objective with pending work is kept
    /// regardless of how other candidates score, so in-progress strategy is
    /// never abandoned for a marginal score difference. Among the rest, an
    /// objective with zero pending tasks never outranks one that has work
    /// queued, since selecting an empty objective would yield an immediately
    /// empty work queue.
    pub fn select_optimal(&self, state: &mut PipelineState) -> Option<Uuid> {
        let sticky = state.objectives.values().find(|o| {
            o.status == ObjectiveStatus::Active
                && state.non_terminal_task_count(o) > 0
                && o.completion_ratio < self.completing_ratio
        });
        if let Some(active) = sticky {
            debug!(objective = %active.id, title = %active.title, "keeping active objective");
            return Some(active.id);
        }

        let mut candidates: Vec<(Uuid, f64, usize)> = state
            .objectives
            .values()
            .filter(|o| o.status.is_selectable())
            .map(|o| (o.id, self.score(o), state.non_terminal_task_count(o)))
            .collect();

        if candidates.is_empty() {
            return None;
        }

        candidates.sort_by(|a, b| {
            let a_has_work = a.2 > 0;
            let b_has_work = b.2 > 0;
            b_has_work
                .cmp(&a_has_work)
                .then(b.1.total_cmp(&a.1))
                .then(b.2.cmp(&a.2))
                .then(a.0.cmp(&b.0))
        });

        let (chosen, score, pending) = candidates[0];
        debug!(objective = %chosen, score, pending, "objective selected");
        self.activate(state, chosen);
        Some(chosen)
    }

    /// Transition an approved objective to `Active`. The caller persists the
    /// state in the same iteration, before anything re-reads it, so the next
    /// load observes `Active` rather than the pre-selection status.
    fn activate(&self, state: &mut PipelineState, id: Uuid) {
        if let Some(objective) = state.objectives.get_mut(&id) {
            if objective.status == ObjectiveStatus::Approved {
                objective.status = ObjectiveStatus::Active;
                objective.activated_at = Some(chrono::Utc::now());
                objective.touch();
                info!(objective = %id, title = %objective.title, "objective activated");
            }
        }
    }

    /// Recompute `completion_ratio` from constituent task statuses and apply
    /// the forward status transitions. Returns `true` when the objective
    /// reached `Completed` on this call.
    ///
    /// The ratio is a pure function of the tasks; recomputation never unwinds
    /// a status past `Active`; only an activated objective that has no tasks
    /// at all drops back to `Approved`.
    pub fn refresh(&self, state: &mut PipelineState, id: Uuid) -> bool {
        let (total, completed) = {
            let Some(objective) = state.objectives.get(&id) else {
                return false;
            };
            let total = objective.task_ids.len();
            let completed = objective
                .task_ids
                .iter()
                .filter_map(|tid| state.tasks.get(tid))
                .filter(|t| t.status == TaskStatus::Completed)
                .count();
            (total, completed)
        };

        let ratio = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64
        };

        let Some(objective) = state.objectives.get_mut(&id) else {
            return false;
        };
        objective.completion_ratio = ratio;
        objective.touch();

        if total == 0 && objective.status == ObjectiveStatus::Active {
            objective.status = ObjectiveStatus::Approved;
            debug!(objective = %id, "active objective has no tasks, releasing claim");
            return false;
        }

        if ratio >= self.completing_ratio {
            match objective.status {
                ObjectiveStatus::Active => {
                    objective.status = ObjectiveStatus::Completing;
                    info!(objective = %id, ratio, "objective completing");
                }
                // Both gates hold: the ratio and the native-enum in-flight
                // check on the underlying variant.
                ObjectiveStatus::Completing if objective.status.is_in_flight() => {
                    objective.status = ObjectiveStatus::Completed;
                    objective.completed_at = Some(chrono::Utc::now());
                    info!(objective = %id, title = %objective.title, "objective completed");
                    return true;
                }
                _ => {}
            }
        }
        false
    }

    /// Register an objective proposed by planning. Planning-created
    /// objectives enter directly as `Approved`: the proposed→approved gate
    /// is an operator concern outside this control plane.
    pub fn add_objective(&self, state: &mut PipelineState, spec: &ObjectiveSpec) -> Uuid {
        let objective = Objective::new(spec.title.clone(), spec.level)
            .with_profile(spec.profile)
            .with_status(ObjectiveStatus::Approved);
        let id = objective.id;
        info!(objective = %id, title = %objective.title, level = %objective.level, "objective created");
        state.objectives.insert(id, objective);
        id
    }

    /// Register a task proposed by planning, attaching it to the spec's
    /// objective or to `default_objective`. Tasks are created in `New` and
    /// never deleted afterwards.
    pub fn add_task(
        &self,
        state: &mut PipelineState,
        spec: &TaskSpec,
        default_objective: Option<Uuid>,
    ) -> Uuid {
        let mut task = Task::new(spec.title.clone(), spec.kind, spec.priority);
        task.description = spec.description.clone();
        task.target_path = spec.target_path.clone();
        task.resolution_mode = spec.resolution_mode;

        let objective_id = spec
            .objective_id
            .filter(|id| state.objectives.contains_key(id))
            .or(default_objective);

        if let Some(oid) = objective_id {
            if let Some(objective) = state.objectives.get_mut(&oid) {
                objective.task_ids.push(task.id);
                objective.touch();
                task.objective_id = Some(oid);
            }
        }

        if task.target_path.is_none() {
            warn!(task = %task.id, title = %task.title, "task created without a target artifact");
        }

        let id = task.id;
        info!(task = %id, title = %task.title, priority = task.priority, "task created");
        state.tasks.insert(id, task);
        id
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use af_core::types::{ObjectiveLevel, ObjectiveProfile, TaskKind};

    fn model() -> ObjectiveModel {
        ObjectiveModel::new(SelectionWeights::default(), &Thresholds::default())
    }

    fn objective_with_task(
        state: &mut PipelineState,
        title: &str,
        status: ObjectiveStatus,
        readiness: f64,
    ) -> Uuid {
        let obj = Objective::new(title, ObjectiveLevel::Primary)
            .with_status(status)
            .with_profile(ObjectiveProfile {
                readiness,
                ..ObjectiveProfile::default()
            });
        let oid = obj.id;
        state.objectives.insert(oid, obj);
        let task = Task::new(format!("{title}-task"), TaskKind::Feature, 5)
            .with_target("src/x.rs")
            .with_objective(oid);
        state
            .objectives
            .get_mut(&oid)
            .unwrap()
            .task_ids
            .push(task.id);
        state.tasks.insert(task.id, task);
        oid
    }

    #[test]
    fn higher_readiness_scores_higher() {
        let m = model();
        let low = Objective::new("low", ObjectiveLevel::Primary).with_profile(ObjectiveProfile {
            readiness: 0.1,
            ..ObjectiveProfile::default()
        });
        let high = Objective::new("high", ObjectiveLevel::Primary).with_profile(ObjectiveProfile {
            readiness: 0.9,
            ..ObjectiveProfile::default()
        });
        assert!(m.score(&high) > m.score(&low));
    }

    #[test]
    fn empty_objective_never_outranks_one_with_work() {
        let m = model();
        let mut state = PipelineState::new();

        // Glamorous but empty.
        let empty = Objective::new("empty", ObjectiveLevel::Primary)
            .with_status(ObjectiveStatus::Approved)
            .with_profile(ObjectiveProfile {
                readiness: 1.0,
                risk: 0.0,
                urgency: 1.0,
                ..ObjectiveProfile::default()
            });
        let empty_id = empty.id;
        state.objectives.insert(empty_id, empty);

        let busy = objective_with_task(&mut state, "busy", ObjectiveStatus::Approved, 0.1);

        let chosen = m.select_optimal(&mut state).expect("selection");
        assert_eq!(chosen, busy);
    }

    #[test]
    fn selection_activates_approved_objective() {
        let m = model();
        let mut state = PipelineState::new();
        let oid = objective_with_task(&mut state, "obj", ObjectiveStatus::Approved, 0.8);

        let chosen = m.select_optimal(&mut state).unwrap();
        assert_eq!(chosen, oid);
        assert_eq!(state.objectives[&oid].status, ObjectiveStatus::Active);
        assert!(state.objectives[&oid].activated_at.is_some());
    }

    #[test]
    fn refresh_moves_through_completing_to_completed() {
        let m = model();
        let mut state = PipelineState::new();
        let oid = objective_with_task(&mut state, "obj", ObjectiveStatus::Active, 0.5);

        // Complete the only task: ratio 1.0.
        let tid = state.objectives[&oid].task_ids[0];
        state.tasks.get_mut(&tid).unwrap().status = TaskStatus::Completed;

        assert!(!m.refresh(&mut state, oid));
        assert_eq!(state.objectives[&oid].status, ObjectiveStatus::Completing);

        assert!(m.refresh(&mut state, oid));
        assert_eq!(state.objectives[&oid].status, ObjectiveStatus::Completed);
        assert!(state.objectives[&oid].completed_at.is_some());
    }

    #[test]
    fn refresh_never_unwinds_completing() {
        let m = model();
        let mut state = PipelineState::new();
        let oid = objective_with_task(&mut state, "obj", ObjectiveStatus::Completing, 0.5);

        // Task not completed: ratio is 0, but Completing must survive.
        m.refresh(&mut state, oid);
        assert_eq!(state.objectives[&oid].status, ObjectiveStatus::Completing);
    }

    #[test]
    fn taskless_active_objective_releases_claim() {
        let m = model();
        let mut state = PipelineState::new();
        let obj = Objective::new("hollow", ObjectiveLevel::Secondary)
            .with_status(ObjectiveStatus::Active);
        let oid = obj.id;
        state.objectives.insert(oid, obj);

        m.refresh(&mut state, oid);
        assert_eq!(state.objectives[&oid].status, ObjectiveStatus::Approved);
    }

    #[test]
    fn add_task_links_to_objective() {
        let m = model();
        let mut state = PipelineState::new();
        let oid = m.add_objective(
            &mut state,
            &ObjectiveSpec {
                title: "obj".into(),
                level: ObjectiveLevel::Primary,
                profile: ObjectiveProfile::default(),
            },
        );

        let tid = m.add_task(
            &mut state,
            &TaskSpec {
                title: "t".into(),
                description: None,
                target_path: Some("src/a.rs".into()),
                kind: TaskKind::Feature,
                priority: 4,
                resolution_mode: Default::default(),
                objective_id: None,
            },
            Some(oid),
        );

        assert_eq!(state.tasks[&tid].objective_id, Some(oid));
        assert!(state.objectives[&oid].task_ids.contains(&tid));
        assert_eq!(state.tasks[&tid].status, TaskStatus::New);
    }
}
