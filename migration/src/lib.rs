pub use sea_orm_migration::prelude::*;

mod m20220301_create_job_table;
mod m20220302_create_job_index;
pub struct Migrator;

/// Number of migrations that create the tables without any secondary index.
/// The bulk import stops here and applies the rest after all rows are inserted.
pub const TABLE_MIGRATIONS: u32 = 1;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20220301_create_job_table::Migration),
            Box::new(m20220302_create_job_index::Migration),
        ]
    }
}
