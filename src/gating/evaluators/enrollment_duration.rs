use chrono::TimeDelta;

use crate::gating::errors::GatingError;
use crate::gating::evaluators::{mismatch, offset, EvalContext, RuleEvaluator};
use crate::gating::types::{
    AccessControlConfig, AccessControlType, PartialDecision, RequiredAction, RequiredActionType,
    TargetType,
};

/// Opens a resource between `minDays` and `maxDays` whole days after
/// enrollment.
pub struct EnrollmentDurationEvaluator;

impl RuleEvaluator for EnrollmentDurationEvaluator {
    fn rule_type(&self) -> AccessControlType {
        AccessControlType::EnrollmentDuration
    }

    fn evaluate(
        &self,
        config: &AccessControlConfig,
        ctx: &EvalContext<'_>,
    ) -> Result<PartialDecision, GatingError> {
        let AccessControlConfig::EnrollmentDuration(cfg) = config else {
            return Err(mismatch(self.rule_type(), config, ctx));
        };

        if let Some(max) = cfg.max_days {
            if max < cfg.min_days {
                return Err(GatingError::InvalidConfiguration {
                    rule_id: ctx.rule.id.clone(),
                    message: format!("maxDays ({max}) is below minDays ({})", cfg.min_days),
                });
            }
        }

        let Some(enrolled_at) = ctx.user.enrolled_at else {
            return Ok(PartialDecision::locked("Enroll in this course to unlock")
                .with_action(
                    RequiredAction::new(RequiredActionType::Enroll, "Enroll in this course")
                        .on(TargetType::Course, ctx.user.course_id.clone()),
                ));
        };

        let days = (ctx.now - enrolled_at).num_days();
        if days < i64::from(cfg.min_days) {
            let opens = offset(
                enrolled_at,
                TimeDelta::try_days(i64::from(cfg.min_days)),
                "minDays",
                ctx,
            )?;
            return Ok(PartialDecision::locked(format!(
                "Available {} days after enrollment",
                cfg.min_days
            ))
            .with_unlock(opens)
            .with_action(RequiredAction::new(
                RequiredActionType::Wait,
                format!("Wait until {}", opens.format("%Y-%m-%d %H:%M UTC")),
            )));
        }

        let Some(max) = cfg.max_days else {
            return Ok(PartialDecision::satisfied());
        };
        if days > i64::from(max) {
            return Ok(PartialDecision::locked(format!(
                "Only available during the first {max} days of enrollment"
            ))
            .with_action(RequiredAction::new(
                RequiredActionType::Other,
                "The enrollment window for this content has ended; contact your instructor",
            )));
        }

        // open through the whole of day `max`
        let closes = offset(
            enrolled_at,
            TimeDelta::try_days(i64::from(max) + 1),
            "maxDays",
            ctx,
        )?;
        Ok(PartialDecision::satisfied().until(closes))
    }
}
