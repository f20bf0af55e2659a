use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[derive(DeriveIden)]
enum Job {
    Table,
    User,
    StartTime,
    JobId,
    JobState,
}

fn indexes() -> Vec<(&'static str, Job)> {
    vec![
        ("job_by_user", Job::User),
        ("job_by_starttime", Job::StartTime),
        ("job_by_job_id", Job::JobId),
        ("job_by_state", Job::JobState),
    ]
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for (name, col) in indexes() {
            manager
                .create_index(
                    Index::create()
                        .name(name)
                        .table(Job::Table)
                        .col(col)
                        .to_owned(),
                )
                .await?;
        }
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for (name, _) in indexes() {
            manager
                .drop_index(Index::drop().name(name).table(Job::Table).to_owned())
                .await?;
        }
        Ok(())
    }
}
