//! Read-only collaborators the engine consults: the Rule Store for rules and
//! course structure, the Progress Oracle for learner state.

use async_trait::async_trait;

use crate::gating::errors::GatingError;
use crate::gating::types::{AccessControl, CourseOutline, ResourceType, UserContext};

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Active rules attached to one resource.
    async fn get_active_rules(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<Vec<AccessControl>, GatingError>;

    async fn get_all_active_rules_for_course(
        &self,
        course_id: &str,
    ) -> Result<Vec<AccessControl>, GatingError>;

    /// Modules, lessons and quizzes of the course with their positions.
    async fn get_course_outline(&self, course_id: &str) -> Result<CourseOutline, GatingError>;
}

#[async_trait]
pub trait ProgressOracle: Send + Sync {
    /// A learner who never enrolled gets an empty context, not an error.
    async fn get_user_context(
        &self,
        user_id: &str,
        course_id: &str,
    ) -> Result<UserContext, GatingError>;
}
