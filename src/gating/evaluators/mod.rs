//! One evaluator per `AccessControlType`.
//!
//! Evaluators are pure: everything they read is in [`EvalContext`], and they
//! never touch the Rule Store, the Progress Oracle or the cache. Returning an
//! `Err` is always safe; the engine turns it into a locked decision.

mod always;
mod custom;
mod enrollment_duration;
mod prerequisite;
mod sequential;
mod time_based;
mod user_group;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::gating::errors::GatingError;
use crate::gating::graph::PrerequisiteGraph;
use crate::gating::types::{
    AccessControl, AccessControlConfig, AccessControlType, CourseOutline, PartialDecision,
    ResourceKey, UserContext,
};

pub use always::AlwaysEvaluator;
pub use custom::{CourseCompletionRule, CustomEvaluator, CustomRule, QuizScoreThresholdRule};
pub use enrollment_duration::EnrollmentDurationEvaluator;
pub use prerequisite::PrerequisiteEvaluator;
pub use sequential::{predecessor_available_at, SequentialEvaluator};
pub use time_based::TimeBasedEvaluator;
pub use user_group::UserGroupEvaluator;

/// Read-only inputs for evaluating one rule of one resource.
pub struct EvalContext<'a> {
    pub resource: &'a ResourceKey,
    pub rule: &'a AccessControl,
    pub user: &'a UserContext,
    pub outline: &'a CourseOutline,
    /// All active rules of the course, including `rule`
    pub course_rules: &'a [AccessControl],
    pub graph: &'a PrerequisiteGraph,
    pub now: DateTime<Utc>,
}

pub trait RuleEvaluator: Send + Sync {
    fn rule_type(&self) -> AccessControlType;

    fn evaluate(
        &self,
        config: &AccessControlConfig,
        ctx: &EvalContext<'_>,
    ) -> Result<PartialDecision, GatingError>;
}

/// Error for an evaluator handed another variant's configuration.
pub(crate) fn mismatch(
    expected: AccessControlType,
    config: &AccessControlConfig,
    ctx: &EvalContext<'_>,
) -> GatingError {
    GatingError::ConfigurationMismatch {
        rule_id: ctx.rule.id.clone(),
        declared: expected,
        found: config.rule_type(),
    }
}

/// `at + delta`, or an invalid-configuration error when the offset or the
/// resulting instant is out of range. `delta` is `None` when the
/// `TimeDelta::try_*` constructor already overflowed.
pub(crate) fn offset(
    at: DateTime<Utc>,
    delta: Option<TimeDelta>,
    field: &str,
    ctx: &EvalContext<'_>,
) -> Result<DateTime<Utc>, GatingError> {
    delta
        .and_then(|d| at.checked_add_signed(d))
        .ok_or_else(|| GatingError::InvalidConfiguration {
            rule_id: ctx.rule.id.clone(),
            message: format!("{field} is out of range"),
        })
}

/// Dispatch table from rule type to evaluator.
#[derive(Clone)]
pub struct EvaluatorRegistry {
    evaluators: HashMap<AccessControlType, Arc<dyn RuleEvaluator>>,
    custom: CustomEvaluator,
}

impl EvaluatorRegistry {
    /// Registry with every built-in evaluator and the built-in custom rules.
    pub fn new() -> Self {
        let custom = CustomEvaluator::with_builtins();
        let mut registry = Self {
            evaluators: HashMap::new(),
            custom: custom.clone(),
        };
        registry.register(Arc::new(TimeBasedEvaluator));
        registry.register(Arc::new(SequentialEvaluator));
        registry.register(Arc::new(PrerequisiteEvaluator));
        registry.register(Arc::new(EnrollmentDurationEvaluator));
        registry.register(Arc::new(UserGroupEvaluator));
        registry.register(Arc::new(AlwaysEvaluator));
        registry.register(Arc::new(custom));
        registry
    }

    pub fn register(&mut self, evaluator: Arc<dyn RuleEvaluator>) {
        self.evaluators.insert(evaluator.rule_type(), evaluator);
    }

    /// Add a named rule for CUSTOM configurations.
    pub fn register_custom(&mut self, rule: Arc<dyn CustomRule>) {
        self.custom.register(rule);
        self.register(Arc::new(self.custom.clone()));
    }

    pub fn get(&self, rule_type: AccessControlType) -> Option<&Arc<dyn RuleEvaluator>> {
        self.evaluators.get(&rule_type)
    }

    pub fn has_custom(&self, name: &str) -> bool {
        self.custom.contains(name)
    }
}

impl Default for EvaluatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
