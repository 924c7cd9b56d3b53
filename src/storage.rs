use crate::entities;
use crate::errors::AppError;
use crate::gating::graph;
use crate::gating::{
    AccessControl, AccessControlConfig, AccessControlType, CourseItem, CourseOutline,
    GatingError, ItemKind, NewRuleRequest, ProgressOracle, ProgressStatus, ResourceKey,
    ResourceType, RuleStore, UserContext,
};
use crate::settings::Database as DbCfg;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, DatabaseTransaction, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, QuerySelect, Set, Statement, TransactionTrait,
};
use serde_json::Value;

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, AppError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

pub async fn migrate(db: &DatabaseConnection) -> Result<(), AppError> {
    Migrator::up(db, None).await?;
    Ok(())
}

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Now, truncated to the precision the tables store.
fn now_secs() -> DateTime<Utc> {
    from_unix(Utc::now().timestamp())
}

// Access control rules

fn rule_from_model(model: entities::access_control::Model) -> Result<AccessControl, GatingError> {
    let resource_type = ResourceType::parse(&model.resource_type).ok_or_else(|| {
        GatingError::InvalidConfiguration {
            rule_id: model.id.clone(),
            message: format!("unknown resource type `{}`", model.resource_type),
        }
    })?;
    let rule_type = AccessControlType::parse(&model.rule_type).ok_or_else(|| {
        GatingError::InvalidConfiguration {
            rule_id: model.id.clone(),
            message: format!("unknown rule type `{}`", model.rule_type),
        }
    })?;
    // Unparseable text stays a JSON string: the rule fails closed on decode
    // instead of vanishing from the read.
    let configuration = serde_json::from_str(&model.configuration)
        .unwrap_or_else(|_| Value::String(model.configuration.clone()));

    Ok(AccessControl {
        id: model.id,
        resource_type,
        resource_id: model.resource_id,
        course_id: model.course_id,
        rule_type,
        active: model.active != 0,
        configuration,
        created_by_id: model.created_by_id,
        created_at: from_unix(model.created_at),
        updated_at: from_unix(model.updated_at),
    })
}

fn rules_from_models(
    models: Vec<entities::access_control::Model>,
) -> Result<Vec<AccessControl>, GatingError> {
    models.into_iter().map(rule_from_model).collect()
}

async fn course_rules<C: ConnectionTrait>(
    conn: &C,
    course_id: &str,
) -> Result<Vec<AccessControl>, GatingError> {
    use entities::access_control::{Column, Entity};

    let models = Entity::find()
        .filter(Column::CourseId.eq(course_id))
        .filter(Column::Active.eq(1))
        .order_by_asc(Column::CreatedAt)
        .order_by_asc(Column::Id)
        .all(conn)
        .await?;
    rules_from_models(models)
}

async fn course_outline<C: ConnectionTrait>(
    conn: &C,
    course_id: &str,
) -> Result<CourseOutline, GatingError> {
    use entities::course_item::{Column, Entity};

    let models = Entity::find()
        .filter(Column::CourseId.eq(course_id))
        .order_by_asc(Column::Position)
        .all(conn)
        .await?;

    let mut outline = CourseOutline::new(course_id);
    for model in models {
        let kind = ItemKind::parse(&model.item_type).ok_or_else(|| {
            GatingError::InvalidRequest(format!(
                "course item `{}` has unknown type `{}`",
                model.id, model.item_type
            ))
        })?;
        outline.items.push(CourseItem {
            kind,
            id: model.id,
            parent_id: model.parent_id,
            position: model.position,
        });
    }
    Ok(outline)
}

/// Reject `candidate` if it is malformed, targets an item outside its
/// course, or would close a prerequisite cycle with the course's other
/// active rules.
async fn check_rule_fits<C: ConnectionTrait>(
    conn: &C,
    candidate: &AccessControl,
) -> Result<(), GatingError> {
    candidate.config()?;

    let outline = course_outline(conn, &candidate.course_id).await?;
    // an outline that was never synced cannot be checked against
    if !outline.items.is_empty() && !outline.contains(&candidate.resource_key()) {
        return Err(GatingError::ResourceNotInCourse {
            resource: candidate.resource_key(),
            course_id: candidate.course_id.clone(),
        });
    }

    if candidate.active {
        let existing = course_rules(conn, &candidate.course_id).await?;
        let links = graph::candidate_links(&existing, candidate);
        graph::validate(&candidate.course_id, &links, &candidate.resource_key())?;
    }
    Ok(())
}

/// Transaction for a rule write in `course_id`. Rule writes of one course
/// are serialized so two of them never cycle-check against the same
/// snapshot. Postgres takes a transaction-scoped advisory lock on the course;
/// SQLite admits a single writer and fails the loser with `SQLITE_BUSY`.
async fn begin_rule_write(
    db: &DatabaseConnection,
    course_id: &str,
) -> Result<DatabaseTransaction, GatingError> {
    let txn = db.begin().await?;
    if txn.get_database_backend() == DatabaseBackend::Postgres {
        txn.execute(Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT pg_advisory_xact_lock(hashtext($1))",
            [course_id.into()],
        ))
        .await?;
    }
    Ok(txn)
}

/// [`begin_rule_write`] for the course of an existing rule. The rule's
/// course never changes, so reading it before the lock is safe.
async fn lock_rule(
    db: &DatabaseConnection,
    rule_id: &str,
) -> Result<DatabaseTransaction, GatingError> {
    let course_id = entities::AccessControl::find_by_id(rule_id)
        .one(db)
        .await?
        .map(|m| m.course_id)
        .ok_or_else(|| GatingError::NotFound(format!("rule `{rule_id}`")))?;
    begin_rule_write(db, &course_id).await
}

fn validated(
    rule_id: &str,
    configuration: &AccessControlConfig,
) -> Result<Value, GatingError> {
    configuration
        .validate()
        .map_err(|message| GatingError::InvalidConfiguration {
            rule_id: rule_id.to_string(),
            message,
        })?;
    Ok(serde_json::to_value(configuration)?)
}

fn candidate_from_request(id: &str, input: &NewRuleRequest) -> Result<AccessControl, GatingError> {
    if input.resource_id.trim().is_empty() || input.course_id.trim().is_empty() {
        return Err(GatingError::InvalidRequest(
            "resourceId and courseId are required".to_string(),
        ));
    }
    let now = now_secs();
    Ok(AccessControl {
        id: id.to_string(),
        resource_type: input.resource_type,
        resource_id: input.resource_id.clone(),
        course_id: input.course_id.clone(),
        rule_type: input.configuration.rule_type(),
        active: true,
        configuration: validated(id, &input.configuration)?,
        created_by_id: input.created_by_id.clone(),
        created_at: now,
        updated_at: now,
    })
}

/// Validate, cycle-check and persist a new rule.
pub async fn create_rule(
    db: &DatabaseConnection,
    input: NewRuleRequest,
) -> Result<AccessControl, GatingError> {
    let rule = candidate_from_request(&random_id(), &input)?;

    let txn = begin_rule_write(db, &rule.course_id).await?;
    check_rule_fits(&txn, &rule).await?;

    let model = entities::access_control::ActiveModel {
        id: Set(rule.id.clone()),
        resource_type: Set(rule.resource_type.as_str().to_string()),
        resource_id: Set(rule.resource_id.clone()),
        course_id: Set(rule.course_id.clone()),
        rule_type: Set(rule.rule_type.as_str().to_string()),
        active: Set(1),
        configuration: Set(rule.configuration.to_string()),
        created_by_id: Set(rule.created_by_id.clone()),
        created_at: Set(rule.created_at.timestamp()),
        updated_at: Set(rule.updated_at.timestamp()),
    };
    model.insert(&txn).await?;
    txn.commit().await?;

    tracing::info!(
        rule_id = %rule.id,
        course_id = %rule.course_id,
        resource = %rule.resource_key(),
        rule_type = %rule.rule_type,
        "Created access rule"
    );
    Ok(rule)
}

/// Run every check `create_rule` would, without writing anything.
pub async fn preview_rule(
    db: &DatabaseConnection,
    input: &NewRuleRequest,
) -> Result<AccessControl, GatingError> {
    let rule = candidate_from_request("candidate", input)?;
    check_rule_fits(db, &rule).await?;
    Ok(rule)
}

pub async fn get_rule(
    db: &DatabaseConnection,
    rule_id: &str,
) -> Result<Option<AccessControl>, GatingError> {
    entities::AccessControl::find_by_id(rule_id)
        .one(db)
        .await?
        .map(rule_from_model)
        .transpose()
}

/// Replace a rule's configuration; the rule type follows the new
/// configuration.
pub async fn update_rule(
    db: &DatabaseConnection,
    rule_id: &str,
    configuration: AccessControlConfig,
) -> Result<AccessControl, GatingError> {
    let txn = lock_rule(db, rule_id).await?;
    let model = entities::AccessControl::find_by_id(rule_id)
        .one(&txn)
        .await?
        .ok_or_else(|| GatingError::NotFound(format!("rule `{rule_id}`")))?;

    let mut rule = rule_from_model(model.clone())?;
    rule.configuration = validated(rule_id, &configuration)?;
    rule.rule_type = configuration.rule_type();
    rule.updated_at = now_secs();
    check_rule_fits(&txn, &rule).await?;

    let mut active: entities::access_control::ActiveModel = model.into_active_model();
    active.rule_type = Set(rule.rule_type.as_str().to_string());
    active.configuration = Set(rule.configuration.to_string());
    active.updated_at = Set(rule.updated_at.timestamp());
    active.update(&txn).await?;
    txn.commit().await?;

    tracing::info!(rule_id, rule_type = %rule.rule_type, "Updated access rule");
    Ok(rule)
}

/// Soft-enable or soft-disable a rule. Re-enabling runs the cycle check
/// again because other rules may have changed in the meantime.
pub async fn set_rule_active(
    db: &DatabaseConnection,
    rule_id: &str,
    enabled: bool,
) -> Result<AccessControl, GatingError> {
    let txn = lock_rule(db, rule_id).await?;
    let model = entities::AccessControl::find_by_id(rule_id)
        .one(&txn)
        .await?
        .ok_or_else(|| GatingError::NotFound(format!("rule `{rule_id}`")))?;

    let mut rule = rule_from_model(model.clone())?;
    rule.active = enabled;
    rule.updated_at = now_secs();
    if enabled {
        check_rule_fits(&txn, &rule).await?;
    }

    let mut active: entities::access_control::ActiveModel = model.into_active_model();
    active.active = Set(if enabled { 1 } else { 0 });
    active.updated_at = Set(rule.updated_at.timestamp());
    active.update(&txn).await?;
    txn.commit().await?;

    tracing::info!(rule_id, enabled, "Changed access rule state");
    Ok(rule)
}

/// Hard delete, for when the resource itself is removed.
pub async fn delete_rules_for_resource(
    db: &DatabaseConnection,
    resource_type: ResourceType,
    resource_id: &str,
) -> Result<u64, GatingError> {
    use entities::access_control::{Column, Entity};

    let result = Entity::delete_many()
        .filter(Column::ResourceType.eq(resource_type.as_str()))
        .filter(Column::ResourceId.eq(resource_id))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

pub async fn get_active_rules(
    db: &DatabaseConnection,
    resource_type: ResourceType,
    resource_id: &str,
) -> Result<Vec<AccessControl>, GatingError> {
    use entities::access_control::{Column, Entity};

    let models = Entity::find()
        .filter(Column::ResourceType.eq(resource_type.as_str()))
        .filter(Column::ResourceId.eq(resource_id))
        .filter(Column::Active.eq(1))
        .order_by_asc(Column::CreatedAt)
        .order_by_asc(Column::Id)
        .all(db)
        .await?;
    rules_from_models(models)
}

pub async fn get_active_rules_for_course(
    db: &DatabaseConnection,
    course_id: &str,
) -> Result<Vec<AccessControl>, GatingError> {
    course_rules(db, course_id).await
}

/// Courses with at least one active rule.
pub async fn list_courses_with_rules(db: &DatabaseConnection) -> Result<Vec<String>, GatingError> {
    use entities::access_control::{Column, Entity};

    let courses: Vec<String> = Entity::find()
        .select_only()
        .column(Column::CourseId)
        .distinct()
        .filter(Column::Active.eq(1))
        .order_by_asc(Column::CourseId)
        .into_tuple()
        .all(db)
        .await?;
    Ok(courses)
}

// Course outline

pub async fn get_course_outline(
    db: &DatabaseConnection,
    course_id: &str,
) -> Result<CourseOutline, GatingError> {
    course_outline(db, course_id).await
}

/// Replace the stored outline of a course with `outline`.
pub async fn replace_course_outline(
    db: &DatabaseConnection,
    outline: &CourseOutline,
) -> Result<usize, GatingError> {
    use entities::course_item::{Column, Entity};

    let txn = db.begin().await?;
    Entity::delete_many()
        .filter(Column::CourseId.eq(outline.course_id.as_str()))
        .exec(&txn)
        .await?;

    for item in &outline.items {
        let model = entities::course_item::ActiveModel {
            item_type: Set(item.kind.as_str().to_string()),
            id: Set(item.id.clone()),
            course_id: Set(outline.course_id.clone()),
            parent_id: Set(item.parent_id.clone()),
            position: Set(item.position),
        };
        model.insert(&txn).await?;
    }
    txn.commit().await?;

    tracing::info!(
        course_id = %outline.course_id,
        items = outline.items.len(),
        "Replaced course outline"
    );
    Ok(outline.items.len())
}

/// Remove one outline item and, for modules and lessons, the rules attached
/// to it. Prerequisites elsewhere that point at it are left dangling.
pub async fn delete_course_item(
    db: &DatabaseConnection,
    key: &ResourceKey,
) -> Result<u64, GatingError> {
    use entities::course_item::{Column, Entity};

    Entity::delete_many()
        .filter(Column::ItemType.eq(key.kind.as_str()))
        .filter(Column::Id.eq(key.id.as_str()))
        .exec(db)
        .await?;

    let resource_type = match key.kind {
        ItemKind::Module => ResourceType::Module,
        ItemKind::Lesson => ResourceType::Lesson,
        ItemKind::Quiz => return Ok(0),
    };
    delete_rules_for_resource(db, resource_type, &key.id).await
}

// Learner state, mirrored from the LMS

pub async fn enroll(
    db: &DatabaseConnection,
    user_id: &str,
    course_id: &str,
    enrolled_at: DateTime<Utc>,
) -> Result<(), GatingError> {
    use entities::enrollment::{Column, Entity};

    let enrollment = entities::enrollment::ActiveModel {
        user_id: Set(user_id.to_string()),
        course_id: Set(course_id.to_string()),
        enrolled_at: Set(enrolled_at.timestamp()),
        ended_at: Set(None),
    };

    Entity::insert(enrollment)
        .on_conflict(
            OnConflict::columns([Column::UserId, Column::CourseId])
                .update_columns([Column::EnrolledAt, Column::EndedAt])
                .to_owned(),
        )
        .exec(db)
        .await?;
    Ok(())
}

/// Returns false when the learner had no enrollment to end.
pub async fn end_enrollment(
    db: &DatabaseConnection,
    user_id: &str,
    course_id: &str,
    ended_at: DateTime<Utc>,
) -> Result<bool, GatingError> {
    let Some(model) = entities::Enrollment::find_by_id((user_id.to_string(), course_id.to_string()))
        .one(db)
        .await?
    else {
        return Ok(false);
    };

    let mut active: entities::enrollment::ActiveModel = model.into_active_model();
    active.ended_at = Set(Some(ended_at.timestamp()));
    active.update(db).await?;
    Ok(true)
}

pub async fn add_group_membership(
    db: &DatabaseConnection,
    user_id: &str,
    course_id: &str,
    group_id: &str,
) -> Result<(), GatingError> {
    use entities::group_membership::{Column, Entity};

    let membership = entities::group_membership::ActiveModel {
        user_id: Set(user_id.to_string()),
        course_id: Set(course_id.to_string()),
        group_id: Set(group_id.to_string()),
        joined_at: Set(Utc::now().timestamp()),
    };

    Entity::insert(membership)
        .on_conflict(
            OnConflict::columns([Column::UserId, Column::CourseId, Column::GroupId])
                .do_nothing()
                .to_owned(),
        )
        .do_nothing()
        .exec(db)
        .await?;
    Ok(())
}

pub async fn remove_group_membership(
    db: &DatabaseConnection,
    user_id: &str,
    course_id: &str,
    group_id: &str,
) -> Result<bool, GatingError> {
    use entities::group_membership::{Column, Entity};

    let result = Entity::delete_many()
        .filter(Column::UserId.eq(user_id))
        .filter(Column::CourseId.eq(course_id))
        .filter(Column::GroupId.eq(group_id))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}

/// Record a learner's status on one item. Quiz scores keep the best
/// attempt.
pub async fn record_progress(
    db: &DatabaseConnection,
    user_id: &str,
    course_id: &str,
    item: &ResourceKey,
    status: ProgressStatus,
    score: Option<f64>,
) -> Result<(), GatingError> {
    use entities::progress::{Column, Entity};

    let existing = Entity::find_by_id((
        user_id.to_string(),
        item.kind.as_str().to_string(),
        item.id.clone(),
    ))
    .one(db)
    .await?;
    let best = match (existing.and_then(|m| m.score), score) {
        (Some(old), Some(new)) => Some(old.max(new)),
        (old, new) => new.or(old),
    };

    let progress = entities::progress::ActiveModel {
        user_id: Set(user_id.to_string()),
        item_type: Set(item.kind.as_str().to_string()),
        item_id: Set(item.id.clone()),
        course_id: Set(course_id.to_string()),
        status: Set(status.as_str().to_string()),
        score: Set(best),
        updated_at: Set(Utc::now().timestamp()),
    };

    Entity::insert(progress)
        .on_conflict(
            OnConflict::columns([Column::UserId, Column::ItemType, Column::ItemId])
                .update_columns([
                    Column::CourseId,
                    Column::Status,
                    Column::Score,
                    Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec(db)
        .await?;
    Ok(())
}

/// Assemble everything the evaluators need to know about one learner in one
/// course. Ended enrollments count as not enrolled.
pub async fn load_user_context(
    db: &DatabaseConnection,
    user_id: &str,
    course_id: &str,
) -> Result<UserContext, GatingError> {
    let mut context = UserContext::new(user_id, course_id);

    let enrollments = entities::Enrollment::find()
        .filter(entities::enrollment::Column::UserId.eq(user_id))
        .filter(entities::enrollment::Column::EndedAt.is_null())
        .all(db)
        .await?;
    for enrollment in enrollments {
        if enrollment.course_id == course_id {
            context.enrolled_at = Some(from_unix(enrollment.enrolled_at));
        }
        context.enrolled_course_ids.insert(enrollment.course_id);
    }

    let groups = entities::GroupMembership::find()
        .filter(entities::group_membership::Column::UserId.eq(user_id))
        .filter(entities::group_membership::Column::CourseId.eq(course_id))
        .all(db)
        .await?;
    context.group_ids = groups.into_iter().map(|g| g.group_id).collect();

    let progress = entities::Progress::find()
        .filter(entities::progress::Column::UserId.eq(user_id))
        .filter(entities::progress::Column::CourseId.eq(course_id))
        .all(db)
        .await?;
    for row in progress {
        let (Some(kind), Some(status)) =
            (ItemKind::parse(&row.item_type), ProgressStatus::parse(&row.status))
        else {
            tracing::warn!(
                user_id,
                course_id,
                item_type = %row.item_type,
                status = %row.status,
                "Skipping unreadable progress row"
            );
            continue;
        };
        if kind == ItemKind::Quiz {
            if let Some(score) = row.score {
                context.quiz_scores.insert(row.item_id.clone(), score);
            }
        }
        context
            .completion
            .insert(ResourceKey::new(kind, row.item_id), status);
    }

    Ok(context)
}

/// Rule Store backed by the `access_controls` and `course_items` tables.
#[derive(Clone)]
pub struct DbRuleStore {
    db: DatabaseConnection,
}

impl DbRuleStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RuleStore for DbRuleStore {
    async fn get_active_rules(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<Vec<AccessControl>, GatingError> {
        get_active_rules(&self.db, resource_type, resource_id).await
    }

    async fn get_all_active_rules_for_course(
        &self,
        course_id: &str,
    ) -> Result<Vec<AccessControl>, GatingError> {
        get_active_rules_for_course(&self.db, course_id).await
    }

    async fn get_course_outline(&self, course_id: &str) -> Result<CourseOutline, GatingError> {
        get_course_outline(&self.db, course_id).await
    }
}

/// Progress Oracle backed by the mirrored enrollment, group and progress
/// tables.
#[derive(Clone)]
pub struct DbProgressOracle {
    db: DatabaseConnection,
}

impl DbProgressOracle {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ProgressOracle for DbProgressOracle {
    async fn get_user_context(
        &self,
        user_id: &str,
        course_id: &str,
    ) -> Result<UserContext, GatingError> {
        load_user_context(&self.db, user_id, course_id).await
    }
}
