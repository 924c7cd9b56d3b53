use crate::gating::errors::GatingError;
use crate::gating::evaluators::{mismatch, EvalContext, RuleEvaluator};
use crate::gating::types::{
    AccessControlConfig, AccessControlType, PartialDecision, RequiredAction, RequiredActionType,
    TargetType,
};

/// Opens a resource to members of the configured groups: every group when
/// `requireAll`, otherwise any one of them.
pub struct UserGroupEvaluator;

impl RuleEvaluator for UserGroupEvaluator {
    fn rule_type(&self) -> AccessControlType {
        AccessControlType::UserGroup
    }

    fn evaluate(
        &self,
        config: &AccessControlConfig,
        ctx: &EvalContext<'_>,
    ) -> Result<PartialDecision, GatingError> {
        let AccessControlConfig::UserGroup(cfg) = config else {
            return Err(mismatch(self.rule_type(), config, ctx));
        };

        // An empty list holds vacuously for requireAll and never for any-of.
        let mut missing: Vec<&String> = cfg
            .group_ids
            .iter()
            .filter(|g| !ctx.user.group_ids.contains(*g))
            .collect();
        missing.sort();
        missing.dedup();

        let satisfied = if cfg.require_all {
            missing.is_empty()
        } else {
            cfg.group_ids.iter().any(|g| ctx.user.group_ids.contains(g))
        };
        if satisfied {
            return Ok(PartialDecision::satisfied());
        }

        let reason = if cfg.require_all {
            "Restricted to members of specific groups"
        } else {
            "Restricted to members of one of the allowed groups"
        };
        let decision = missing
            .into_iter()
            .fold(PartialDecision::locked(reason), |decision, group| {
                decision.with_action(
                    RequiredAction::new(
                        RequiredActionType::JoinGroup,
                        format!("Join group {group}"),
                    )
                    .on(TargetType::Group, group.clone()),
                )
            });
        Ok(decision)
    }
}
