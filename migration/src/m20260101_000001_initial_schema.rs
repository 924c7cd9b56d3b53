use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // Course outline: modules, lessons and quizzes with their ordering
        manager
            .create_table(
                Table::create()
                    .table(CourseItems::Table)
                    .if_not_exists()
                    .col(string(CourseItems::ItemType))
                    .col(string(CourseItems::Id))
                    .col(string(CourseItems::CourseId))
                    .col(string_null(CourseItems::ParentId))
                    .col(big_integer(CourseItems::Position))
                    .primary_key(
                        Index::create()
                            .col(CourseItems::ItemType)
                            .col(CourseItems::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_course_items_course")
                    .table(CourseItems::Table)
                    .col(CourseItems::CourseId)
                    .to_owned(),
            )
            .await?;

        // Access control rules, one row per rule
        manager
            .create_table(
                Table::create()
                    .table(AccessControls::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AccessControls::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(string(AccessControls::ResourceType))
                    .col(string(AccessControls::ResourceId))
                    .col(string(AccessControls::CourseId))
                    .col(string(AccessControls::RuleType))
                    .col(
                        ColumnDef::new(AccessControls::Active)
                            .big_integer()
                            .not_null()
                            .default(1),
                    )
                    .col(text(AccessControls::Configuration))
                    .col(string(AccessControls::CreatedById))
                    .col(big_integer(AccessControls::CreatedAt))
                    .col(big_integer(AccessControls::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_access_controls_resource")
                    .table(AccessControls::Table)
                    .col(AccessControls::ResourceType)
                    .col(AccessControls::ResourceId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_access_controls_course")
                    .table(AccessControls::Table)
                    .col(AccessControls::CourseId)
                    .to_owned(),
            )
            .await?;

        // Create job_executions table with backend-specific ID type
        let id_col = match manager.get_database_backend() {
            sea_orm::DatabaseBackend::Postgres => ColumnDef::new(JobExecutions::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
            _ => ColumnDef::new(JobExecutions::Id)
                .integer()
                .not_null()
                .auto_increment()
                .primary_key()
                .to_owned(),
        };

        manager
            .create_table(
                Table::create()
                    .table(JobExecutions::Table)
                    .if_not_exists()
                    .col(id_col)
                    .col(string(JobExecutions::JobName))
                    .col(big_integer(JobExecutions::StartedAt))
                    .col(big_integer_null(JobExecutions::CompletedAt))
                    .col(big_integer_null(JobExecutions::Success))
                    .col(string_null(JobExecutions::ErrorMessage))
                    .col(big_integer_null(JobExecutions::RecordsProcessed))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobExecutions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AccessControls::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CourseItems::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum CourseItems {
    Table,
    ItemType,
    Id,
    CourseId,
    ParentId,
    Position,
}

#[derive(DeriveIden)]
enum AccessControls {
    Table,
    Id,
    ResourceType,
    ResourceId,
    CourseId,
    RuleType,
    Active,
    Configuration,
    CreatedById,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum JobExecutions {
    Table,
    Id,
    JobName,
    StartedAt,
    CompletedAt,
    Success,
    ErrorMessage,
    RecordsProcessed,
}
