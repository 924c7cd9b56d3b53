use crate::gating::errors::{CyclePath, GatingError};
use crate::gating::evaluators::{mismatch, EvalContext, RuleEvaluator};
use crate::gating::types::{
    AccessControlConfig, AccessControlType, PartialDecision, PrerequisiteEdge, RequiredAction,
    RequiredActionType, RequiredStatus, TargetType,
};

/// Opens a resource once the listed modules, lessons, quizzes or course
/// enrollments reach their required status.
pub struct PrerequisiteEvaluator;

enum EdgeOutcome {
    Met,
    Unmet(RequiredAction),
    /// Target no longer exists; can never be met
    Broken(RequiredAction),
}

impl RuleEvaluator for PrerequisiteEvaluator {
    fn rule_type(&self) -> AccessControlType {
        AccessControlType::Prerequisite
    }

    fn evaluate(
        &self,
        config: &AccessControlConfig,
        ctx: &EvalContext<'_>,
    ) -> Result<PartialDecision, GatingError> {
        let AccessControlConfig::Prerequisite(cfg) = config else {
            return Err(mismatch(self.rule_type(), config, ctx));
        };

        // Writes are cycle-checked; stored data may still predate that.
        if let Some(path) = ctx.graph.find_cycle_from(ctx.resource) {
            return Err(GatingError::CycleDetected {
                course_id: ctx.outline.course_id.clone(),
                path: CyclePath(path),
            });
        }

        if cfg.prerequisites.is_empty() {
            return Ok(PartialDecision::satisfied());
        }

        let outcomes: Vec<EdgeOutcome> = cfg
            .prerequisites
            .iter()
            .map(|edge| edge_outcome(edge, ctx))
            .collect();

        let met = outcomes
            .iter()
            .filter(|o| matches!(o, EdgeOutcome::Met))
            .count();
        let satisfied = if cfg.require_all {
            met == outcomes.len()
        } else {
            met > 0
        };
        if satisfied {
            return Ok(PartialDecision::satisfied());
        }

        let broken = outcomes
            .iter()
            .find_map(|o| match o {
                EdgeOutcome::Broken(action) => Some(action.description.clone()),
                _ => None,
            });
        let reason = match broken {
            Some(description) => description,
            None if cfg.require_all => "Complete the required prerequisites first".to_string(),
            None => "Complete at least one of the prerequisites first".to_string(),
        };

        let mut decision = PartialDecision::locked(reason);
        for outcome in outcomes {
            match outcome {
                EdgeOutcome::Met => {}
                EdgeOutcome::Unmet(action) | EdgeOutcome::Broken(action) => {
                    decision = decision.with_action(action);
                }
            }
        }
        Ok(decision)
    }
}

fn edge_outcome(edge: &PrerequisiteEdge, ctx: &EvalContext<'_>) -> EdgeOutcome {
    let Some(target) = edge.target() else {
        // enrollment in another course
        return if ctx.user.enrolled_course_ids.contains(&edge.prerequisite_id) {
            EdgeOutcome::Met
        } else {
            EdgeOutcome::Unmet(
                RequiredAction::new(
                    RequiredActionType::Enroll,
                    format!("Enroll in course {}", edge.prerequisite_id),
                )
                .on(TargetType::Course, edge.prerequisite_id.clone()),
            )
        };
    };

    let noun = target.kind.as_str().to_lowercase();
    if !ctx.outline.contains(&target) {
        return EdgeOutcome::Broken(
            RequiredAction::new(
                RequiredActionType::Other,
                format!(
                    "Prerequisite {noun} {} no longer exists; contact your instructor",
                    target.id
                ),
            )
            .on(target.kind.into(), target.id.clone()),
        );
    }

    if ctx.user.status_of(&target).meets(edge.required_status) {
        return EdgeOutcome::Met;
    }

    let (action_type, verb) = match edge.required_status {
        RequiredStatus::Started => (RequiredActionType::Start, "Start"),
        RequiredStatus::Completed | RequiredStatus::Any => {
            (RequiredActionType::Complete, "Complete")
        }
    };
    EdgeOutcome::Unmet(
        RequiredAction::new(action_type, format!("{verb} {noun} {}", target.id))
            .on(target.kind.into(), target.id.clone()),
    )
}
