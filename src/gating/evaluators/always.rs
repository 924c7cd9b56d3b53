use crate::gating::errors::GatingError;
use crate::gating::evaluators::{mismatch, EvalContext, RuleEvaluator};
use crate::gating::types::{AccessControlConfig, AccessControlType, PartialDecision};

/// Explicit "open" marker; also what a resource without rules behaves like.
pub struct AlwaysEvaluator;

impl RuleEvaluator for AlwaysEvaluator {
    fn rule_type(&self) -> AccessControlType {
        AccessControlType::Always
    }

    fn evaluate(
        &self,
        config: &AccessControlConfig,
        ctx: &EvalContext<'_>,
    ) -> Result<PartialDecision, GatingError> {
        match config {
            AccessControlConfig::Always => Ok(PartialDecision::satisfied()),
            other => Err(mismatch(self.rule_type(), other, ctx)),
        }
    }
}
