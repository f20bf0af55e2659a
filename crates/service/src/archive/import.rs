use std::{
    collections::HashMap,
    path::Path,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use entity::{jobtag, prelude::*, tag};
use migration::{Migrator, MigratorTrait, TABLE_MIGRATIONS};
use sea_orm::{DatabaseConnection, DatabaseTransaction, EntityTrait, Set, TransactionTrait};
use tracing::{info, warn};

use super::ArchiveStore;
use crate::schema::MonitoringStatus;

/// Jobs inserted per transaction.
const BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportSummary {
    pub jobs: usize,
    pub tags: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Recreate the job tables from the archive. Indexes are created once all
/// rows are in; broken entries are logged and skipped.
pub async fn init_db(db: &DatabaseConnection, archive: &ArchiveStore) -> Result<ImportSummary> {
    let started = Instant::now();
    Migrator::down(db, None).await.context("drop job tables")?;
    Migrator::up(db, Some(TABLE_MIGRATIONS))
        .await
        .context("create job tables")?;

    let entries = archive.entries().await?;
    let mut tag_ids: HashMap<String, i64> = HashMap::new();
    let mut summary = ImportSummary::default();

    for batch in entries.chunks(BATCH_SIZE) {
        let txn = db.begin().await?;
        for (cluster, dir) in batch {
            let savepoint = txn.begin().await?;
            match import_entry(&savepoint, &tag_ids, cluster, dir).await {
                Ok(created) => {
                    savepoint.commit().await?;
                    summary.jobs += 1;
                    summary.tags += created.len();
                    tag_ids.extend(created);
                }
                Err(e) => {
                    savepoint.rollback().await?;
                    summary.failed += 1;
                    warn!("skipping archive entry {}: {e:#}", dir.display());
                }
            }
        }
        txn.commit().await?;
    }

    Migrator::up(db, None).await.context("create job indexes")?;

    summary.elapsed = started.elapsed();
    info!(
        "imported {} jobs ({} tags, {} skipped) in {:.2?}",
        summary.jobs, summary.tags, summary.failed, summary.elapsed
    );
    Ok(summary)
}

/// Insert one job with its tags; returns the tags it had to create.
async fn import_entry(
    txn: &DatabaseTransaction,
    known_tags: &HashMap<String, i64>,
    cluster: &str,
    dir: &Path,
) -> Result<Vec<(String, i64)>> {
    let mut meta = ArchiveStore::read_meta_at(dir).await?;
    if meta.base.cluster != cluster {
        anyhow::bail!(
            "job belongs to cluster {:?} but is archived below {cluster:?}",
            meta.base.cluster
        );
    }
    if meta.base.resources.is_empty() {
        anyhow::bail!("job has no resources");
    }
    meta.base.monitoring_status = MonitoringStatus::ArchivingSuccessful;

    let job_id = Job::insert(meta.to_active_model()?)
        .exec(txn)
        .await?
        .last_insert_id;

    let mut created: Vec<(String, i64)> = vec![];
    let mut attached: Vec<i64> = vec![];
    for t in &meta.base.tags {
        let key = format!("{}:{}", t.name, t.tag_type);
        let known = known_tags
            .get(&key)
            .copied()
            .or_else(|| created.iter().find(|(k, _)| *k == key).map(|(_, id)| *id));

        let tag_id = match known {
            Some(id) => id,
            None => {
                let id = Tag::insert(tag::ActiveModel {
                    tag_type: Set(t.tag_type.clone()),
                    tag_name: Set(t.name.clone()),
                    ..Default::default()
                })
                .exec(txn)
                .await?
                .last_insert_id;
                created.push((key, id));
                id
            }
        };

        if attached.contains(&tag_id) {
            continue;
        }
        Jobtag::insert(jobtag::ActiveModel {
            job_id: Set(job_id),
            tag_id: Set(tag_id),
        })
        .exec_without_returning(txn)
        .await?;
        attached.push(tag_id);
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use sea_orm::{ColumnTrait, Database, PaginatorTrait, QueryFilter};

    use super::*;
    use crate::{
        archive::shard_dir,
        schema::{JobData, JobMeta, JobStatistics, Resource, Tag as JobTag},
    };

    fn meta(job_id: i64, start_time: i64, tags: Vec<JobTag>) -> JobMeta {
        let mut meta = JobMeta {
            start_time,
            ..Default::default()
        };
        meta.base.job_id = job_id;
        meta.base.cluster = "testcluster".into();
        meta.base.user = "alice".into();
        meta.base.num_nodes = 1;
        meta.base.duration = 600;
        meta.base.state = crate::schema::JobState::Completed;
        meta.base.resources = vec![Resource {
            hostname: "host123".into(),
            ..Default::default()
        }];
        meta.base.tags = tags;
        meta.statistics = HashMap::from([
            (
                "flops_any".to_string(),
                JobStatistics {
                    unit: "GF/s".into(),
                    avg: 12.5,
                    min: 1.0,
                    max: 20.0,
                },
            ),
            (
                "mem_used".to_string(),
                JobStatistics {
                    unit: "GB".into(),
                    avg: 3.0,
                    min: 1.0,
                    max: 7.0,
                },
            ),
        ]);
        meta
    }

    fn tag(name: &str) -> JobTag {
        JobTag {
            id: None,
            tag_type: "testing".into(),
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn test_init_db() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("archive");
        let store = ArchiveStore::new(&root, false, 1 << 20);

        store
            .write(&meta(1, 100, vec![tag("a"), tag("b")]), &JobData::default())
            .await
            .unwrap();
        store
            .write(&meta(1001, 200, vec![tag("a")]), &JobData::default())
            .await
            .unwrap();

        // legacy layout
        let legacy = shard_dir(&root.join("testcluster"), 2002, None);
        std::fs::create_dir_all(&legacy).unwrap();
        std::fs::write(
            legacy.join("meta.json"),
            serde_json::to_vec(&meta(2002, 300, vec![])).unwrap(),
        )
        .unwrap();

        // broken entries
        let broken = shard_dir(&root.join("testcluster"), 3003, Some(400));
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("meta.json"), b"{ not json").unwrap();
        let mut no_resources = meta(4004, 500, vec![tag("c")]);
        no_resources.base.resources.clear();
        store.write(&no_resources, &JobData::default()).await.unwrap();

        let db = Database::connect(format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("job.db").display()
        ))
        .await
        .unwrap();

        let summary = init_db(&db, &store).await.unwrap();
        assert_eq!(summary.jobs, 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.tags, 2);

        assert_eq!(Job::find().count(&db).await.unwrap(), 3);
        assert_eq!(Tag::find().count(&db).await.unwrap(), 2);
        assert_eq!(Jobtag::find().count(&db).await.unwrap(), 3);

        let row = Job::find()
            .filter(entity::job::Column::JobId.eq(1))
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.monitoring_status, MonitoringStatus::ArchivingSuccessful as i8);
        assert_eq!(row.flops_any_avg, 12.5);
        assert_eq!(row.mem_used_max, 7.0);
        assert_eq!(row.job_state, "completed");

        assert!(Migrator::get_pending_migrations(&db).await.unwrap().is_empty());

        // importing again starts from scratch
        let summary = init_db(&db, &store).await.unwrap();
        assert_eq!(summary.jobs, 3);
        assert_eq!(Job::find().count(&db).await.unwrap(), 3);
    }
}
