use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Enrollments::Table)
                    .if_not_exists()
                    .col(string(Enrollments::UserId))
                    .col(string(Enrollments::CourseId))
                    .col(big_integer(Enrollments::EnrolledAt))
                    .col(big_integer_null(Enrollments::EndedAt))
                    .primary_key(
                        Index::create()
                            .col(Enrollments::UserId)
                            .col(Enrollments::CourseId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(GroupMemberships::Table)
                    .if_not_exists()
                    .col(string(GroupMemberships::UserId))
                    .col(string(GroupMemberships::CourseId))
                    .col(string(GroupMemberships::GroupId))
                    .col(big_integer(GroupMemberships::JoinedAt))
                    .primary_key(
                        Index::create()
                            .col(GroupMemberships::UserId)
                            .col(GroupMemberships::CourseId)
                            .col(GroupMemberships::GroupId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Progress::Table)
                    .if_not_exists()
                    .col(string(Progress::UserId))
                    .col(string(Progress::ItemType))
                    .col(string(Progress::ItemId))
                    .col(string(Progress::CourseId))
                    .col(string(Progress::Status))
                    .col(double_null(Progress::Score))
                    .col(big_integer(Progress::UpdatedAt))
                    .primary_key(
                        Index::create()
                            .col(Progress::UserId)
                            .col(Progress::ItemType)
                            .col(Progress::ItemId),
                    )
                    .to_owned(),
            )
            .await?;

        // Progress is always read per (user, course)
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_progress_user_course")
                    .table(Progress::Table)
                    .col(Progress::UserId)
                    .col(Progress::CourseId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Progress::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(GroupMemberships::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Enrollments::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Enrollments {
    Table,
    UserId,
    CourseId,
    EnrolledAt,
    EndedAt,
}

#[derive(DeriveIden)]
enum GroupMemberships {
    Table,
    UserId,
    CourseId,
    GroupId,
    JoinedAt,
}

#[derive(DeriveIden)]
enum Progress {
    Table,
    UserId,
    ItemType,
    ItemId,
    CourseId,
    Status,
    Score,
    UpdatedAt,
}
