use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

use crate::gating::types::{AccessControlType, ResourceKey};

/// Ordered list of nodes forming a prerequisite cycle, first node repeated
/// at the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePath(pub Vec<ResourceKey>);

impl std::fmt::Display for CyclePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|k| k.to_string()).collect();
        f.write_str(&parts.join(" -> "))
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum GatingError {
    #[error("Invalid configuration for rule `{rule_id}`: {message}")]
    #[diagnostic(
        code(coursegate::gating::invalid_configuration),
        help("The configuration must be a JSON object tagged with a `type` matching the rule type")
    )]
    InvalidConfiguration { rule_id: String, message: String },

    #[error("Rule `{rule_id}` is declared {declared} but its configuration is {found}")]
    #[diagnostic(
        code(coursegate::gating::configuration_mismatch),
        help("Make `configuration.type` agree with the rule's `type`")
    )]
    ConfigurationMismatch {
        rule_id: String,
        declared: AccessControlType,
        found: AccessControlType,
    },

    #[error("Prerequisite cycle detected in course `{course_id}`: {path}")]
    #[diagnostic(
        code(coursegate::gating::prerequisite_cycle),
        help("Remove one of the prerequisite edges along the reported path")
    )]
    CycleDetected { course_id: String, path: CyclePath },

    #[error("Resource `{resource}` is not part of course `{course_id}`")]
    #[diagnostic(code(coursegate::gating::resource_not_in_course))]
    ResourceNotInCourse {
        resource: ResourceKey,
        course_id: String,
    },

    #[error("Invalid parameters for custom rule `{name}`: {message}")]
    #[diagnostic(
        code(coursegate::gating::invalid_parameters),
        help("Check the `parameters` object expected by the named custom rule")
    )]
    InvalidParameters { name: String, message: String },

    #[error("{source_name} unavailable: {message}")]
    #[diagnostic(code(coursegate::gating::upstream))]
    Upstream {
        source_name: &'static str,
        message: String,
    },

    #[error("{source_name} did not answer within {after_ms} ms")]
    #[diagnostic(
        code(coursegate::gating::timeout),
        help(
            "Raise `gating.store_timeout_ms` / `gating.oracle_timeout_ms` or check the \
             backing database"
        )
    )]
    Timeout {
        source_name: &'static str,
        after_ms: u64,
    },

    #[error("Not found: {0}")]
    #[diagnostic(code(coursegate::gating::not_found))]
    NotFound(String),

    #[error("Invalid request: {0}")]
    #[diagnostic(code(coursegate::gating::invalid_request))]
    InvalidRequest(String),

    #[error("Database error: {0}")]
    #[diagnostic(code(coursegate::gating::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(coursegate::gating::serde))]
    Serde(#[from] serde_json::Error),
}

impl GatingError {
    /// Failures of the Rule Store or Progress Oracle, as opposed to problems
    /// with the rules themselves.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            GatingError::Upstream { .. } | GatingError::Timeout { .. } | GatingError::Db(_)
        )
    }
}

impl IntoResponse for GatingError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            GatingError::InvalidConfiguration { .. }
            | GatingError::ConfigurationMismatch { .. }
            | GatingError::CycleDetected { .. }
            | GatingError::ResourceNotInCourse { .. }
            | GatingError::InvalidParameters { .. }
            | GatingError::InvalidRequest(_)
            | GatingError::Serde(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            GatingError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            GatingError::Upstream { .. } | GatingError::Timeout { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            GatingError::Db(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };
        let body = json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
