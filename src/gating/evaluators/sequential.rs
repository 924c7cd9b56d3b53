use chrono::{DateTime, TimeDelta, Utc};

use crate::gating::errors::GatingError;
use crate::gating::evaluators::{mismatch, offset, EvalContext, RuleEvaluator};
use crate::gating::types::{
    AccessControlConfig, AccessControlType, PartialDecision, ProgressStatus, RequiredAction,
    RequiredActionType, ResourceKey,
};

/// Opens an item once its immediate predecessor in the outline is completed,
/// or once the grace period after the predecessor became available has run
/// out.
pub struct SequentialEvaluator;

impl RuleEvaluator for SequentialEvaluator {
    fn rule_type(&self) -> AccessControlType {
        AccessControlType::Sequential
    }

    fn evaluate(
        &self,
        config: &AccessControlConfig,
        ctx: &EvalContext<'_>,
    ) -> Result<PartialDecision, GatingError> {
        let AccessControlConfig::Sequential(cfg) = config else {
            return Err(mismatch(self.rule_type(), config, ctx));
        };

        if !ctx.outline.contains(ctx.resource) {
            return Err(GatingError::ResourceNotInCourse {
                resource: ctx.resource.clone(),
                course_id: ctx.outline.course_id.clone(),
            });
        }

        let Some(predecessor) = ctx.outline.predecessor(ctx.resource) else {
            return Ok(PartialDecision::satisfied());
        };
        let predecessor = predecessor.key();

        if ctx.user.status_of(&predecessor) == ProgressStatus::Completed {
            return Ok(PartialDecision::satisfied());
        }

        let noun = predecessor.kind.as_str().to_lowercase();
        let mut decision = PartialDecision::locked(format!("Complete the previous {noun} first"))
            .with_action(
                RequiredAction::new(
                    RequiredActionType::Complete,
                    format!("Complete {noun} {}", predecessor.id),
                )
                .on(predecessor.kind.into(), predecessor.id.clone()),
            );

        if let Some(hours) = cfg.grace_period.filter(|h| *h > 0) {
            if let Some(available) = predecessor_available_at(&predecessor, ctx)? {
                let opens = offset(
                    available,
                    TimeDelta::try_hours(i64::from(hours)),
                    "gracePeriod",
                    ctx,
                )?;
                if ctx.now >= opens {
                    return Ok(PartialDecision::satisfied());
                }
                decision = decision.with_unlock(opens);
            }
        }

        Ok(decision)
    }
}

/// When `predecessor` became available to the learner: the enrollment date,
/// pushed later by the predecessor's own TIME_BASED start and
/// ENROLLMENT_DURATION minimum. `None` when the learner is not enrolled.
pub fn predecessor_available_at(
    predecessor: &ResourceKey,
    ctx: &EvalContext<'_>,
) -> Result<Option<DateTime<Utc>>, GatingError> {
    let Some(enrolled_at) = ctx.user.enrolled_at else {
        return Ok(None);
    };
    let mut available = enrolled_at;

    for rule in ctx
        .course_rules
        .iter()
        .filter(|r| r.active && r.resource_key() == *predecessor)
    {
        match rule.config() {
            Ok(AccessControlConfig::TimeBased(t)) => {
                if let Some(start) = t.start_date {
                    available = available.max(start);
                }
            }
            Ok(AccessControlConfig::EnrollmentDuration(e)) => {
                let opens = offset(
                    enrolled_at,
                    TimeDelta::try_days(i64::from(e.min_days)),
                    "predecessor minDays",
                    ctx,
                )?;
                available = available.max(opens);
            }
            _ => {}
        }
    }

    Ok(Some(available))
}
