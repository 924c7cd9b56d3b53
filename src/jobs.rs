use crate::entities;
use crate::errors::AppError;
use crate::gating::GatingEngine;
use crate::settings::Gating as GatingCfg;
use crate::storage;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    Set,
};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub const SWEEP_DECISION_CACHE: &str = "sweep_decision_cache";
pub const AUDIT_COURSE_RULES: &str = "audit_course_rules";

pub const JOB_NAMES: [&str; 2] = [SWEEP_DECISION_CACHE, AUDIT_COURSE_RULES];

/// Initialize and start the job scheduler with all background tasks
pub async fn init_scheduler(
    db: DatabaseConnection,
    engine: Arc<GatingEngine>,
    cfg: &GatingCfg,
) -> Result<JobScheduler, AppError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| AppError::Other(format!("Failed to create job scheduler: {}", e)))?;

    for (job_name, schedule) in [
        (SWEEP_DECISION_CACHE, cfg.cache_sweep_schedule.as_str()),
        (AUDIT_COURSE_RULES, cfg.audit_schedule.as_str()),
    ] {
        let db = db.clone();
        let engine = engine.clone();
        let job = Job::new_async(schedule, move |_uuid, _l| {
            let db = db.clone();
            let engine = engine.clone();
            Box::pin(async move {
                info!("Running {} job", job_name);
                let execution_id = start_job_execution(&db, job_name).await.ok();

                match run_job(&db, &engine, job_name).await {
                    Ok(count) => {
                        info!("{} processed {} records", job_name, count);
                        if let Some(id) = execution_id {
                            let _ = complete_job_execution(&db, id, true, None, Some(count)).await;
                        }
                    }
                    Err(e) => {
                        error!("{} failed: {}", job_name, e);
                        if let Some(id) = execution_id {
                            let _ =
                                complete_job_execution(&db, id, false, Some(e.to_string()), None)
                                    .await;
                        }
                    }
                }
            })
        })
        .map_err(|e| AppError::Other(format!("Failed to create {} job: {}", job_name, e)))?;

        sched
            .add(job)
            .await
            .map_err(|e| AppError::Other(format!("Failed to add {} job: {}", job_name, e)))?;
    }

    // Start the scheduler
    sched
        .start()
        .await
        .map_err(|e| AppError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!("Job scheduler started with {} jobs", JOB_NAMES.len());

    Ok(sched)
}

async fn run_job(
    db: &DatabaseConnection,
    engine: &GatingEngine,
    job_name: &str,
) -> Result<i64, AppError> {
    match job_name {
        SWEEP_DECISION_CACHE => Ok(engine.purge_expired() as i64),
        AUDIT_COURSE_RULES => audit_all_courses(db, engine).await,
        _ => Err(AppError::Other(format!("Unknown job name: {}", job_name))),
    }
}

/// Audit every course that has active rules. Fails on the first store error;
/// findings are logged by the engine. Returns the number of courses checked.
async fn audit_all_courses(
    db: &DatabaseConnection,
    engine: &GatingEngine,
) -> Result<i64, AppError> {
    let courses = storage::list_courses_with_rules(db).await?;
    let mut flagged = 0;
    for course_id in &courses {
        let report = engine.audit_course(course_id).await?;
        if !report.is_clean() {
            flagged += 1;
        }
    }
    if flagged > 0 {
        tracing::warn!(flagged, checked = courses.len(), "Rule audit found inconsistent courses");
    }
    Ok(courses.len() as i64)
}

/// Record the start of a job execution
pub async fn start_job_execution(
    db: &DatabaseConnection,
    job_name: &str,
) -> Result<i64, AppError> {
    use entities::job_execution;

    let now = Utc::now().timestamp();

    let execution = job_execution::ActiveModel {
        id: Set(0), // Will be auto-generated
        job_name: Set(job_name.to_string()),
        started_at: Set(now),
        completed_at: Set(None),
        success: Set(None),
        error_message: Set(None),
        records_processed: Set(None),
    };

    let result = execution.insert(db).await?;
    Ok(result.id)
}

/// Record the completion of a job execution
pub async fn complete_job_execution(
    db: &DatabaseConnection,
    execution_id: i64,
    success: bool,
    error_message: Option<String>,
    records_processed: Option<i64>,
) -> Result<(), AppError> {
    use entities::job_execution::{Column, Entity};

    let now = Utc::now().timestamp();

    if let Some(execution) = Entity::find()
        .filter(Column::Id.eq(execution_id))
        .one(db)
        .await?
    {
        let mut active: entities::job_execution::ActiveModel = execution.into_active_model();
        active.completed_at = Set(Some(now));
        active.success = Set(Some(if success { 1 } else { 0 }));
        active.error_message = Set(error_message);
        active.records_processed = Set(records_processed);
        active.update(db).await?;
    }

    Ok(())
}

/// Manually trigger a job by name (used by the admin endpoint). The
/// execution is recorded whether it succeeds or not.
pub async fn trigger_job_manually(
    db: &DatabaseConnection,
    engine: &GatingEngine,
    job_name: &str,
) -> Result<i64, AppError> {
    if !JOB_NAMES.contains(&job_name) {
        return Err(AppError::Other(format!("Unknown job name: {}", job_name)));
    }

    info!("Manually triggering job: {}", job_name);
    let execution_id = start_job_execution(db, job_name).await?;

    match run_job(db, engine, job_name).await {
        Ok(count) => {
            info!(
                "Manually triggered job {} completed: {} records",
                job_name, count
            );
            complete_job_execution(db, execution_id, true, None, Some(count)).await?;
            Ok(count)
        }
        Err(e) => {
            error!("Manually triggered job {} failed: {}", job_name, e);
            complete_job_execution(db, execution_id, false, Some(e.to_string()), None).await?;
            Err(e)
        }
    }
}
