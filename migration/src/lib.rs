pub use sea_orm_migration::prelude::*;

mod m20260101_000001_initial_schema;
mod m20260115_000001_add_learner_progress;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260101_000001_initial_schema::Migration),
            Box::new(m20260115_000001_add_learner_progress::Migration),
        ]
    }
}
