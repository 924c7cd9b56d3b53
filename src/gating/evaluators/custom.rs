//! CUSTOM rules: a named condition plus free-form JSON parameters, resolved
//! against rules registered at startup.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::gating::errors::GatingError;
use crate::gating::evaluators::{mismatch, EvalContext, RuleEvaluator};
use crate::gating::types::{
    AccessControlConfig, AccessControlType, PartialDecision, ProgressStatus, RequiredAction,
    RequiredActionType, TargetType,
};

pub const UNKNOWN_CUSTOM_RULE: &str = "unknown custom rule";

/// A named condition that CUSTOM configurations can refer to.
pub trait CustomRule: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(
        &self,
        parameters: &Value,
        ctx: &EvalContext<'_>,
    ) -> Result<PartialDecision, GatingError>;
}

#[derive(Clone, Default)]
pub struct CustomEvaluator {
    rules: HashMap<String, Arc<dyn CustomRule>>,
}

impl CustomEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut evaluator = Self::new();
        evaluator.register(Arc::new(QuizScoreThresholdRule));
        evaluator.register(Arc::new(CourseCompletionRule));
        evaluator
    }

    /// Register `rule`, replacing any rule with the same name.
    pub fn register(&mut self, rule: Arc<dyn CustomRule>) {
        self.rules.insert(rule.name().to_string(), rule);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }
}

impl RuleEvaluator for CustomEvaluator {
    fn rule_type(&self) -> AccessControlType {
        AccessControlType::Custom
    }

    fn evaluate(
        &self,
        config: &AccessControlConfig,
        ctx: &EvalContext<'_>,
    ) -> Result<PartialDecision, GatingError> {
        let AccessControlConfig::Custom(cfg) = config else {
            return Err(mismatch(self.rule_type(), config, ctx));
        };

        match self.rules.get(&cfg.condition_name) {
            Some(rule) => rule.evaluate(&cfg.parameters, ctx),
            None => {
                tracing::warn!(
                    rule_id = %ctx.rule.id,
                    condition = %cfg.condition_name,
                    "No custom rule registered under this name"
                );
                Ok(PartialDecision::locked(UNKNOWN_CUSTOM_RULE).with_action(
                    RequiredAction::new(
                        RequiredActionType::Other,
                        "This content uses a condition that is not available; \
                         contact your instructor",
                    ),
                ))
            }
        }
    }
}

fn parse_parameters<T: DeserializeOwned>(name: &str, parameters: &Value) -> Result<T, GatingError> {
    serde_json::from_value(parameters.clone()).map_err(|e| GatingError::InvalidParameters {
        name: name.to_string(),
        message: e.to_string(),
    })
}

fn check_percent(name: &str, field: &str, value: f64) -> Result<(), GatingError> {
    if !(0.0..=100.0).contains(&value) {
        return Err(GatingError::InvalidParameters {
            name: name.to_string(),
            message: format!("{field} must be between 0 and 100, got {value}"),
        });
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuizScoreParams {
    quiz_id: String,
    min_score: f64,
}

/// `quiz-score-threshold`: best recorded score on `quizId` must reach
/// `minScore` percent.
pub struct QuizScoreThresholdRule;

impl CustomRule for QuizScoreThresholdRule {
    fn name(&self) -> &str {
        "quiz-score-threshold"
    }

    fn evaluate(
        &self,
        parameters: &Value,
        ctx: &EvalContext<'_>,
    ) -> Result<PartialDecision, GatingError> {
        let params: QuizScoreParams = parse_parameters(self.name(), parameters)?;
        check_percent(self.name(), "minScore", params.min_score)?;

        let score = ctx.user.quiz_scores.get(&params.quiz_id).copied();
        if score.is_some_and(|s| s >= params.min_score) {
            return Ok(PartialDecision::satisfied());
        }

        let reason = match score {
            Some(s) => format!(
                "Requires a score of at least {}% on quiz {} (best so far {s}%)",
                params.min_score, params.quiz_id
            ),
            None => format!(
                "Requires a score of at least {}% on quiz {}",
                params.min_score, params.quiz_id
            ),
        };
        Ok(PartialDecision::locked(reason).with_action(
            RequiredAction::new(
                RequiredActionType::Complete,
                format!("Score at least {}% on quiz {}", params.min_score, params.quiz_id),
            )
            .on(TargetType::Quiz, params.quiz_id),
        ))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CourseCompletionParams {
    min_percent: f64,
}

/// `course-completion`: share of the course's lessons the learner has
/// completed must reach `minPercent`.
pub struct CourseCompletionRule;

impl CustomRule for CourseCompletionRule {
    fn name(&self) -> &str {
        "course-completion"
    }

    fn evaluate(
        &self,
        parameters: &Value,
        ctx: &EvalContext<'_>,
    ) -> Result<PartialDecision, GatingError> {
        let params: CourseCompletionParams = parse_parameters(self.name(), parameters)?;
        check_percent(self.name(), "minPercent", params.min_percent)?;

        let mut total = 0usize;
        let mut completed = 0usize;
        for lesson in ctx.outline.lessons() {
            total += 1;
            if ctx.user.status_of(&lesson.key()) == ProgressStatus::Completed {
                completed += 1;
            }
        }
        // a course without lessons counts as fully completed
        let percent = if total == 0 {
            100.0
        } else {
            completed as f64 * 100.0 / total as f64
        };
        if percent >= params.min_percent {
            return Ok(PartialDecision::satisfied());
        }

        Ok(PartialDecision::locked(format!(
            "Complete at least {}% of the course lessons ({completed} of {total} done)",
            params.min_percent
        ))
        .with_action(
            RequiredAction::new(
                RequiredActionType::Complete,
                format!("Complete at least {}% of the course lessons", params.min_percent),
            )
            .on(TargetType::Course, ctx.outline.course_id.clone()),
        ))
    }
}
