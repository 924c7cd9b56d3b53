use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use serde_json::json;

use crate::errors::AppError;
use crate::gating::cache::{InMemoryDecisionCache, InvalidationScope};
use crate::gating::clock::SystemClock;
use crate::gating::engine::{AuditReport, GatingEngine};
use crate::gating::errors::GatingError;
use crate::gating::events::{EventBus, GatingEvent};
use crate::gating::types::{
    AccessControl, BatchResponse, CheckRequest, CheckResponse, CourseItem, CourseOutline,
    ItemKind, NewRuleRequest, ProgressStatus, ResourceKey, ResourceType, UpdateRuleRequest,
    ValidateResponse,
};
use crate::jobs;
use crate::settings::Gating as GatingCfg;
use crate::storage;

pub struct GatingState {
    pub engine: Arc<GatingEngine>,
    pub db: DatabaseConnection,
    pub events: EventBus,
}

impl GatingState {
    /// Database-backed engine configured from `[gating]`.
    pub fn new(db: DatabaseConnection, cfg: &GatingCfg) -> Self {
        let mut engine = GatingEngine::new(
            Arc::new(storage::DbRuleStore::new(db.clone())),
            Arc::new(storage::DbProgressOracle::new(db.clone())),
        )
        .with_timeouts(cfg.store_timeout(), cfg.oracle_timeout());
        if cfg.cache_enabled {
            engine = engine.with_cache(Arc::new(InMemoryDecisionCache::new(
                cfg.cache_ttl(),
                Arc::new(SystemClock),
            )));
        }
        Self {
            engine: Arc::new(engine),
            db,
            events: EventBus::new(cfg.event_buffer),
        }
    }

    /// Invalidate before answering so the caller reads its own write, then
    /// fan the event out to other subscribers.
    fn notify(&self, event: GatingEvent) {
        self.engine.apply_event(&event);
        self.events.publish(event);
    }
}

pub fn router(state: Arc<GatingState>) -> Router {
    Router::new()
        .route("/v1/access/check", post(handle_check))
        .route(
            "/v1/access/courses/{course_id}/users/{user_id}",
            get(handle_batch),
        )
        .route("/v1/events", post(handle_event))
        .route("/v1/rules", post(create_rule))
        .route("/v1/rules/validate", post(validate_rule))
        .route("/v1/rules/{id}", get(get_rule).put(update_rule))
        .route("/v1/rules/{id}/disable", post(disable_rule))
        .route("/v1/rules/{id}/enable", post(enable_rule))
        .route("/v1/courses/{course_id}/audit", get(audit_course))
        .route("/v1/courses/{course_id}/outline", put(replace_outline))
        .route(
            "/v1/courses/{course_id}/items/{item_type}/{item_id}",
            axum::routing::delete(delete_item),
        )
        .route(
            "/v1/courses/{course_id}/users/{user_id}/progress",
            put(record_progress),
        )
        .route(
            "/v1/courses/{course_id}/users/{user_id}/enrollment",
            put(update_enrollment),
        )
        .route(
            "/v1/courses/{course_id}/users/{user_id}/groups/{group_id}",
            put(join_group).delete(leave_group),
        )
        .route("/v1/admin/jobs/{name}", post(trigger_job))
        .route("/healthz", get(health))
        .with_state(state)
}

async fn handle_check(
    State(state): State<Arc<GatingState>>,
    Json(req): Json<CheckRequest>,
) -> impl IntoResponse {
    if req.strict {
        match state
            .engine
            .check_access_strict(&req.user_id, req.resource_type, &req.resource_id)
            .await
        {
            Ok(result) => Json(CheckResponse::from(result)).into_response(),
            Err(e) => e.into_response(),
        }
    } else {
        let result = state
            .engine
            .check_access(&req.user_id, req.resource_type, &req.resource_id)
            .await;
        Json(CheckResponse::from(result)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct BatchQuery {
    #[serde(default)]
    strict: bool,
}

async fn handle_batch(
    State(state): State<Arc<GatingState>>,
    Path((course_id, user_id)): Path<(String, String)>,
    Query(query): Query<BatchQuery>,
) -> Result<Json<BatchResponse>, GatingError> {
    let resources = if query.strict {
        state
            .engine
            .check_access_batch_strict(&user_id, &course_id)
            .await?
    } else {
        state.engine.check_access_batch(&user_id, &course_id).await?
    };
    Ok(Json(BatchResponse {
        user_id,
        course_id,
        resources,
    }))
}

async fn handle_event(
    State(state): State<Arc<GatingState>>,
    Json(event): Json<GatingEvent>,
) -> impl IntoResponse {
    state.notify(event);
    StatusCode::ACCEPTED
}

fn rule_changed(rule: &AccessControl) -> GatingEvent {
    GatingEvent::RuleChanged {
        resource_type: rule.resource_type,
        resource_id: rule.resource_id.clone(),
    }
}

async fn create_rule(
    State(state): State<Arc<GatingState>>,
    Json(req): Json<NewRuleRequest>,
) -> Result<impl IntoResponse, GatingError> {
    let rule = storage::create_rule(&state.db, req).await?;
    state.notify(rule_changed(&rule));
    Ok((StatusCode::CREATED, Json(rule)))
}

/// Dry run of `create_rule`. Always 200; problems are reported in the body.
async fn validate_rule(
    State(state): State<Arc<GatingState>>,
    Json(req): Json<NewRuleRequest>,
) -> Result<Json<ValidateResponse>, GatingError> {
    let response = match storage::preview_rule(&state.db, &req).await {
        Ok(_) => ValidateResponse {
            valid: true,
            cycle: None,
            error: None,
        },
        Err(e) if e.is_upstream() => return Err(e),
        Err(e) => {
            let cycle = match &e {
                GatingError::CycleDetected { path, .. } => {
                    Some(path.0.iter().map(|k| k.to_string()).collect())
                }
                _ => None,
            };
            ValidateResponse {
                valid: false,
                cycle,
                error: Some(e.to_string()),
            }
        }
    };
    Ok(Json(response))
}

async fn get_rule(
    State(state): State<Arc<GatingState>>,
    Path(id): Path<String>,
) -> Result<Json<AccessControl>, GatingError> {
    storage::get_rule(&state.db, &id)
        .await?
        .map(Json)
        .ok_or_else(|| GatingError::NotFound(format!("rule `{id}`")))
}

async fn update_rule(
    State(state): State<Arc<GatingState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateRuleRequest>,
) -> Result<Json<AccessControl>, GatingError> {
    let rule = storage::update_rule(&state.db, &id, req.configuration).await?;
    state.notify(rule_changed(&rule));
    Ok(Json(rule))
}

async fn disable_rule(
    State(state): State<Arc<GatingState>>,
    Path(id): Path<String>,
) -> Result<Json<AccessControl>, GatingError> {
    let rule = storage::set_rule_active(&state.db, &id, false).await?;
    state.notify(rule_changed(&rule));
    Ok(Json(rule))
}

async fn enable_rule(
    State(state): State<Arc<GatingState>>,
    Path(id): Path<String>,
) -> Result<Json<AccessControl>, GatingError> {
    let rule = storage::set_rule_active(&state.db, &id, true).await?;
    state.notify(rule_changed(&rule));
    Ok(Json(rule))
}

async fn audit_course(
    State(state): State<Arc<GatingState>>,
    Path(course_id): Path<String>,
) -> Result<Json<AuditReport>, GatingError> {
    Ok(Json(state.engine.audit_course(&course_id).await?))
}

#[derive(Debug, Deserialize)]
struct OutlineUpdate {
    items: Vec<CourseItem>,
}

async fn replace_outline(
    State(state): State<Arc<GatingState>>,
    Path(course_id): Path<String>,
    Json(req): Json<OutlineUpdate>,
) -> Result<impl IntoResponse, GatingError> {
    let outline = CourseOutline {
        course_id,
        items: req.items,
    };
    let items = storage::replace_course_outline(&state.db, &outline).await?;
    // Sibling order feeds every SEQUENTIAL decision, so nothing cached for
    // any learner can be trusted.
    state.engine.invalidate(&InvalidationScope::All);
    Ok(Json(json!({ "courseId": outline.course_id, "items": items })))
}

async fn delete_item(
    State(state): State<Arc<GatingState>>,
    Path((_course_id, item_type, item_id)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, GatingError> {
    let kind = ItemKind::parse(&item_type)
        .ok_or_else(|| GatingError::InvalidRequest(format!("unknown item type `{item_type}`")))?;
    let item = ResourceKey::new(kind, item_id.clone());
    let removed = storage::delete_course_item(&state.db, &item).await?;
    // Rules elsewhere may name the item as a prerequisite and siblings shift
    // position, so no cached decision can be trusted.
    state.engine.invalidate(&InvalidationScope::All);
    if let Some(resource_type) = ResourceType::parse(kind.as_str()) {
        state.events.publish(GatingEvent::RuleChanged {
            resource_type,
            resource_id: item_id,
        });
    }
    Ok(Json(json!({ "rulesDeleted": removed })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressUpdate {
    item_type: ItemKind,
    item_id: String,
    status: ProgressStatus,
    #[serde(default)]
    score: Option<f64>,
}

async fn record_progress(
    State(state): State<Arc<GatingState>>,
    Path((course_id, user_id)): Path<(String, String)>,
    Json(req): Json<ProgressUpdate>,
) -> Result<impl IntoResponse, GatingError> {
    if req.score.is_some_and(|s| !(0.0..=100.0).contains(&s)) {
        return Err(GatingError::InvalidRequest(
            "score must be between 0 and 100".to_string(),
        ));
    }
    let item = ResourceKey::new(req.item_type, req.item_id);
    storage::record_progress(&state.db, &user_id, &course_id, &item, req.status, req.score)
        .await?;
    state.notify(GatingEvent::ProgressChanged {
        user_id,
        course_id,
        resource_id: item.id,
    });
    Ok(StatusCode::NO_CONTENT)
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrollmentUpdate {
    #[serde(default = "default_active")]
    active: bool,
    /// Defaults to now
    #[serde(default)]
    enrolled_at: Option<DateTime<Utc>>,
}

async fn update_enrollment(
    State(state): State<Arc<GatingState>>,
    Path((course_id, user_id)): Path<(String, String)>,
    Json(req): Json<EnrollmentUpdate>,
) -> Result<impl IntoResponse, GatingError> {
    let at = req.enrolled_at.unwrap_or_else(|| state.engine.now());
    if req.active {
        storage::enroll(&state.db, &user_id, &course_id, at).await?;
    } else if !storage::end_enrollment(&state.db, &user_id, &course_id, state.engine.now())
        .await?
    {
        return Err(GatingError::NotFound(format!(
            "enrollment of `{user_id}` in `{course_id}`"
        )));
    }
    state.notify(GatingEvent::EnrollmentChanged { user_id, course_id });
    Ok(StatusCode::NO_CONTENT)
}

async fn join_group(
    State(state): State<Arc<GatingState>>,
    Path((course_id, user_id, group_id)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, GatingError> {
    storage::add_group_membership(&state.db, &user_id, &course_id, &group_id).await?;
    state.notify(GatingEvent::EnrollmentChanged { user_id, course_id });
    Ok(StatusCode::NO_CONTENT)
}

async fn leave_group(
    State(state): State<Arc<GatingState>>,
    Path((course_id, user_id, group_id)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, GatingError> {
    storage::remove_group_membership(&state.db, &user_id, &course_id, &group_id).await?;
    state.notify(GatingEvent::EnrollmentChanged { user_id, course_id });
    Ok(StatusCode::NO_CONTENT)
}

async fn trigger_job(
    State(state): State<Arc<GatingState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    if !jobs::JOB_NAMES.contains(&name.as_str()) {
        return Err(GatingError::NotFound(format!("job `{name}`")).into());
    }
    let records = jobs::trigger_job_manually(&state.db, &state.engine, &name).await?;
    Ok(Json(json!({ "job": name, "recordsProcessed": records })))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
