use std::collections::HashMap;

use anyhow::{Context, Result};
use entity::{job, prelude::Job as JobEntity};
use sea_orm::{
    ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect, QueryTrait, TransactionTrait,
};
use sea_query::Expr;
use tracing::{info, warn};

use super::types::{ClusterCount, JobOrUser, StopJobRequest, UserInfo};
use crate::{
    error::MonitorError,
    schema::{BaseJob, Job, JobMeta, JobState, JobStatistics, MonitoringStatus, footprint_column},
    state::AppContext,
};

pub struct JobLogic<'a> {
    ctx: &'a AppContext,
}

impl<'a> JobLogic<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    fn check_job_data(&self, job: &mut BaseJob) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(MonitorError::Validation(msg).into()) };

        if self.ctx.clusters.get(&job.cluster).is_none() {
            return invalid(format!("no such cluster: {:?}", job.cluster));
        }
        if job.user.is_empty() {
            return invalid("user is required".into());
        }
        if job.resources.is_empty() {
            return invalid("resources are required".into());
        }
        if job.num_nodes < 1 {
            return invalid(format!("numNodes must be at least 1, got {}", job.num_nodes));
        }
        if job.num_hwthreads < 0 || job.num_acc < 0 {
            return invalid("numHwthreads and numAcc must not be negative".into());
        }
        if job.resources.len() != job.num_nodes as usize {
            return invalid(format!(
                "numNodes is {} but {} resources are given",
                job.num_nodes,
                job.resources.len()
            ));
        }
        if !(0..=2).contains(&job.exclusive) || !(0..=1).contains(&job.smt) {
            return invalid("exclusive must be 0, 1 or 2 and smt 0 or 1".into());
        }
        self.ctx.clusters.assign_sub_cluster(job)
    }

    /// Insert a new running job together with its tags.
    pub async fn start(&self, mut req: JobMeta) -> Result<i64> {
        self.check_job_data(&mut req.base)?;
        if req.base.state != JobState::Running {
            return Err(MonitorError::Validation(format!(
                "a job starts in state running, not {}",
                req.base.state
            ))
            .into());
        }
        req.base.duration = 0;
        req.statistics.clear();

        let id = {
            let _guard = self.ctx.start_lock.lock().await;

            let window = self.ctx.conf.duplicate_start_window;
            let duplicate = JobEntity::find()
                .filter(job::Column::JobId.eq(req.base.job_id))
                .filter(job::Column::Cluster.eq(&req.base.cluster))
                .filter(job::Column::StartTime.gt(req.start_time - window))
                .filter(job::Column::StartTime.lt(req.start_time + window))
                .one(&self.ctx.db)
                .await?;
            if let Some(d) = duplicate {
                return Err(MonitorError::Conflict(format!(
                    "a job with that jobId, cluster and startTime already exists: dbid: {}",
                    d.id
                ))
                .into());
            }

            // the job and its tags land together or not at all
            let txn = self.ctx.db.begin().await?;
            let id = JobEntity::insert(req.to_active_model()?)
                .exec(&txn)
                .await
                .context("insert job")?
                .last_insert_id;

            let tag = self.ctx.service().tag;
            for t in &req.base.tags {
                tag.add_tag_or_create_with(&txn, id, &t.tag_type, &t.name)
                    .await?;
            }
            txn.commit().await?;
            id
        };

        info!(
            "new job (id: {id}): cluster={}, jobId={}, user={}, startTime={}",
            req.base.cluster,
            req.base.job_id,
            req.base.user,
            utils::local_time!(req.start_time)
        );
        Ok(id)
    }

    /// Mark a running job as finished and hand it to the archiving pipeline.
    pub async fn stop(&self, req: StopJobRequest) -> Result<Job> {
        let mut job = self
            .find(req.job_id, Some(&req.cluster), req.start_time)
            .await?;

        let state = req.state.unwrap_or(JobState::Completed);
        if !state.is_terminal() {
            return Err(MonitorError::Validation(format!("invalid stop state: {state}")).into());
        }
        if job.state != JobState::Running {
            return Err(MonitorError::Validation(format!(
                "job {} (dbid: {}) is not running but {}",
                job.job_id, job.id, job.state
            ))
            .into());
        }
        if req.stop_time <= job.start_time {
            return Err(MonitorError::Validation(format!(
                "stopTime {} must be after startTime {}",
                req.stop_time, job.start_time
            ))
            .into());
        }

        let duration = i32::try_from(req.stop_time - job.start_time)
            .map_err(|_| MonitorError::Validation("job duration out of range".into()))?;
        self.stop_by_id(job.id, duration, state, job.monitoring_status)
            .await?;
        job.state = state;
        job.duration = duration;

        if job.monitoring_status == MonitoringStatus::Disabled {
            return Ok(job);
        }
        info!(
            "archiving job... (dbid: {}): cluster={}, jobId={}, user={}, startTime={}",
            job.id, job.cluster, job.job_id, job.user, job.start_time
        );
        self.ctx.service().archiver.spawn(job.clone());
        Ok(job)
    }

    /// Finish a running job. Only one of several concurrent calls for the
    /// same job succeeds.
    pub async fn stop_by_id(
        &self,
        id: i64,
        duration: i32,
        state: JobState,
        monitoring_status: MonitoringStatus,
    ) -> Result<()> {
        let ret = JobEntity::update_many()
            .col_expr(job::Column::JobState, Expr::value(state.as_str()))
            .col_expr(job::Column::Duration, Expr::value(duration))
            .col_expr(
                job::Column::MonitoringStatus,
                Expr::value(monitoring_status as i8),
            )
            .filter(job::Column::Id.eq(id))
            .filter(job::Column::JobState.eq(JobState::Running.as_str()))
            .exec(&self.ctx.db)
            .await?;
        if ret.rows_affected > 0 {
            return Ok(());
        }

        let current: Option<String> = JobEntity::find_by_id(id)
            .select_only()
            .column(job::Column::JobState)
            .into_tuple()
            .one(&self.ctx.db)
            .await?;
        match current {
            None => Err(MonitorError::NotFound(format!("no job with id {id}")).into()),
            Some(current) => Err(MonitorError::Validation(format!(
                "job (dbid: {id}) is not running but {current}"
            ))
            .into()),
        }
    }

    /// The most recently started job matching the scheduler's id.
    pub async fn find(
        &self,
        job_id: i64,
        cluster: Option<&str>,
        start_time: Option<i64>,
    ) -> Result<Job> {
        let record = JobEntity::find()
            .filter(job::Column::JobId.eq(job_id))
            .apply_if(cluster, |q, v| q.filter(job::Column::Cluster.eq(v)))
            .apply_if(start_time, |q, v| q.filter(job::Column::StartTime.eq(v)))
            .order_by_desc(job::Column::StartTime)
            .one(&self.ctx.db)
            .await?
            .ok_or(MonitorError::NotFound(format!("no job with jobId {job_id}")))?;
        record.try_into()
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Job> {
        let record = JobEntity::find_by_id(id)
            .one(&self.ctx.db)
            .await?
            .ok_or(MonitorError::NotFound(format!("no job with id {id}")))?;
        record.try_into()
    }

    /// Store the outcome of archiving: the monitoring status and the
    /// footprint columns of the metrics that have one.
    pub async fn archive(
        &self,
        id: i64,
        monitoring_status: MonitoringStatus,
        stats: &HashMap<String, JobStatistics>,
    ) -> Result<()> {
        let mut update = JobEntity::update_many().col_expr(
            job::Column::MonitoringStatus,
            Expr::value(monitoring_status as i8),
        );
        for (metric, s) in stats {
            if let Some((col, v)) = footprint_column(metric, s) {
                update = update.col_expr(col, Expr::value(v));
            }
        }
        let ret = update
            .filter(job::Column::Id.eq(id))
            .exec(&self.ctx.db)
            .await?;
        if ret.rows_affected == 0 {
            return Err(MonitorError::NotFound(format!("no job with id {id}")).into());
        }
        Ok(())
    }

    pub async fn update_monitoring_status(&self, id: i64, status: MonitoringStatus) -> Result<()> {
        JobEntity::update_many()
            .col_expr(job::Column::MonitoringStatus, Expr::value(status as i8))
            .filter(job::Column::Id.eq(id))
            .exec(&self.ctx.db)
            .await?;
        Ok(())
    }

    /// Decode the metadata blob of a job and keep it on the job.
    pub async fn fetch_metadata(&self, job: &mut Job) -> Result<HashMap<String, String>> {
        let raw: Option<Option<String>> = JobEntity::find_by_id(job.id)
            .select_only()
            .column(job::Column::MetaData)
            .into_tuple()
            .one(&self.ctx.db)
            .await?;
        let Some(raw) = raw else {
            return Err(MonitorError::NotFound(format!("no job with id {}", job.id)).into());
        };

        let meta_data: HashMap<String, String> = match raw.as_deref() {
            None | Some("") => HashMap::new(),
            Some(s) => serde_json::from_str(s).context("decode job metadata")?,
        };
        job.meta_data = meta_data.clone();
        Ok(meta_data)
    }

    /// Number of jobs per cluster, optionally in one state.
    pub async fn count_jobs(
        &self,
        user_info: &UserInfo,
        state: Option<JobState>,
    ) -> Result<HashMap<String, i64>> {
        let counts = JobEntity::find()
            .select_only()
            .column(job::Column::Cluster)
            .column_as(job::Column::Id.count(), "total")
            .apply_if(user_info.scope(), |q, v| q.filter(job::Column::User.eq(v)))
            .apply_if(state, |q, v| q.filter(job::Column::JobState.eq(v.as_str())))
            .group_by(job::Column::Cluster)
            .into_model::<ClusterCount>()
            .all(&self.ctx.db)
            .await?;
        Ok(counts.into_iter().map(|v| (v.cluster, v.total)).collect())
    }

    /// Interpret a search term as a job id visible to the caller, or else
    /// as a username (only for admins).
    pub async fn find_job_or_user(&self, user_info: &UserInfo, term: &str) -> Result<JobOrUser> {
        if let Ok(job_id) = term.parse::<i64>() {
            let id: Option<i64> = JobEntity::find()
                .select_only()
                .column(job::Column::Id)
                .filter(job::Column::JobId.eq(job_id))
                .apply_if(user_info.scope(), |q, v| q.filter(job::Column::User.eq(v)))
                .into_tuple()
                .one(&self.ctx.db)
                .await?;
            if let Some(id) = id {
                return Ok(JobOrUser::Job(id));
            }
        }

        if user_info.is_admin {
            let user: Option<String> = JobEntity::find()
                .select_only()
                .column(job::Column::User)
                .filter(job::Column::User.eq(term))
                .distinct()
                .into_tuple()
                .one(&self.ctx.db)
                .await?;
            if let Some(user) = user {
                return Ok(JobOrUser::User(user));
            }
        }

        warn!("search term {term:?} matches neither a job nor a user");
        Err(MonitorError::NotFound(format!("nothing found for {term:?}")).into())
    }
}

#[cfg(test)]
mod tests {
    use sea_orm::ConnectionTrait;

    use super::*;
    use crate::{
        logic::types::StopJobRequest,
        schema::{JobState, MonitoringStatus, Resource, Tag},
        state::testing::test_env,
    };

    #[tokio::test]
    async fn test_start_and_find() {
        let env = test_env().await;
        let svc = env.ctx.service();

        let mut req = JobMeta::example(123, 123456789);
        req.base.tags = vec![Tag {
            id: None,
            tag_type: "testing".into(),
            name: "start".into(),
        }];
        req.base.meta_data = HashMap::from([("jobScript".to_string(), "#!/bin/bash".to_string())]);
        let id = svc.job.start(req).await.unwrap();

        let mut job = svc.job.find_by_id(id).await.unwrap();
        assert_eq!(job.job_id, 123);
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.sub_cluster, "sc1");
        assert_eq!(job.monitoring_status, MonitoringStatus::RunningOrArchiving);
        assert_eq!(job.resources[0].hostname, "host123");

        let found = svc
            .job
            .find(123, Some("testcluster"), Some(123456789))
            .await
            .unwrap();
        assert_eq!(found.id, id);
        assert!(MonitorError::is_not_found(
            &svc.job.find(124, None, None).await.unwrap_err()
        ));

        let meta = svc.job.fetch_metadata(&mut job).await.unwrap();
        assert_eq!(meta["jobScript"], "#!/bin/bash");
        assert_eq!(job.meta_data, meta);

        assert_eq!(svc.tag.get_job_tags(id).await.unwrap()[0].name, "start");
    }

    #[tokio::test]
    async fn test_start_sanity_checks() {
        let env = test_env().await;
        let svc = env.ctx.service();
        let is_validation = |e: anyhow::Error| {
            matches!(MonitorError::of(&e), Some(MonitorError::Validation(_)))
        };

        let mut req = JobMeta::example(1, 100);
        req.base.cluster = "unknown".into();
        assert!(is_validation(svc.job.start(req).await.unwrap_err()));

        let mut req = JobMeta::example(1, 100);
        req.base.num_nodes = 2;
        assert!(is_validation(svc.job.start(req).await.unwrap_err()));

        let mut req = JobMeta::example(1, 100);
        req.base.user.clear();
        assert!(is_validation(svc.job.start(req).await.unwrap_err()));

        let mut req = JobMeta::example(1, 100);
        req.base.resources = vec![Resource {
            hostname: "host999".into(),
            ..Default::default()
        }];
        assert!(is_validation(svc.job.start(req).await.unwrap_err()));

        let mut req = JobMeta::example(1, 100);
        req.base.sub_cluster = "sc0".into();
        let id = svc.job.start(req).await.unwrap();
        assert_eq!(svc.job.find_by_id(id).await.unwrap().sub_cluster, "sc0");
    }

    #[tokio::test]
    async fn test_duplicate_start_guard() {
        let env = test_env().await;
        let svc = env.ctx.service();

        svc.job.start(JobMeta::example(7, 1_000_000)).await.unwrap();
        let err = svc
            .job
            .start(JobMeta::example(7, 1_000_005))
            .await
            .unwrap_err();
        assert!(matches!(MonitorError::of(&err), Some(MonitorError::Conflict(_))));

        // the same scheduler id a few days later is a different job
        svc.job
            .start(JobMeta::example(7, 1_000_000 + 3 * 86400))
            .await
            .unwrap();

        // concurrent duplicates: exactly one wins
        let ctx = env.ctx.clone();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    ctx.service()
                        .job
                        .start(JobMeta::example(8, 5_000_000 + i))
                        .await
                })
            })
            .collect();
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn test_stop_validation() {
        let env = test_env().await;
        let svc = env.ctx.service();
        svc.job.start(JobMeta::example(9, 1000)).await.unwrap();

        let req = |stop_time, state| StopJobRequest {
            job_id: 9,
            cluster: "testcluster".into(),
            start_time: None,
            state,
            stop_time,
        };

        let err = svc.job.stop(req(1000, None)).await.unwrap_err();
        assert!(matches!(MonitorError::of(&err), Some(MonitorError::Validation(_))));
        let err = svc
            .job
            .stop(req(2000, Some(JobState::Running)))
            .await
            .unwrap_err();
        assert!(matches!(MonitorError::of(&err), Some(MonitorError::Validation(_))));

        let mut unknown = req(2000, None);
        unknown.job_id = 10;
        assert!(MonitorError::is_not_found(
            &svc.job.stop(unknown).await.unwrap_err()
        ));

        let job = svc.job.stop(req(2000, Some(JobState::Failed))).await.unwrap();
        assert_eq!(job.duration, 1000);
        assert_eq!(job.state, JobState::Failed);

        // already stopped
        assert!(svc.job.stop(req(3000, None)).await.is_err());
        env.ctx.archivings.wait_all().await;
    }

    #[tokio::test]
    async fn test_concurrent_stops_finish_once() {
        let env = test_env().await;
        let svc = env.ctx.service();
        let id = svc.job.start(JobMeta::example(500, 1000)).await.unwrap();

        let states = [
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
            JobState::Timeout,
        ];
        let handles: Vec<_> = states
            .into_iter()
            .enumerate()
            .map(|(i, state)| {
                let ctx = env.ctx.clone();
                tokio::spawn(async move {
                    ctx.service()
                        .job
                        .stop(StopJobRequest {
                            job_id: 500,
                            cluster: "testcluster".into(),
                            start_time: None,
                            state: Some(state),
                            stop_time: 1100 + 100 * i as i64,
                        })
                        .await
                })
            })
            .collect();

        let mut stopped = vec![];
        for h in handles {
            match h.await.unwrap() {
                Ok(job) => stopped.push(job),
                Err(e) => assert!(matches!(
                    MonitorError::of(&e),
                    Some(MonitorError::Validation(_))
                )),
            }
        }
        assert_eq!(stopped.len(), 1);
        env.ctx.archivings.wait_all().await;

        let job = svc.job.find_by_id(id).await.unwrap();
        assert_eq!(job.state, stopped[0].state);
        assert_eq!(job.duration, stopped[0].duration);
        // one archiving task, one adapter request per metric
        assert_eq!(
            env.repo.calls(),
            env.ctx.clusters.metric_names("testcluster").len()
        );

        let err = svc
            .job
            .stop_by_id(id, 10, JobState::Completed, MonitoringStatus::RunningOrArchiving)
            .await
            .unwrap_err();
        assert!(matches!(MonitorError::of(&err), Some(MonitorError::Validation(_))));
        assert!(MonitorError::is_not_found(
            &svc.job
                .stop_by_id(4242, 10, JobState::Completed, MonitoringStatus::RunningOrArchiving)
                .await
                .unwrap_err()
        ));
    }

    #[tokio::test]
    async fn test_failed_tagging_leaves_no_job() {
        let env = test_env().await;
        let svc = env.ctx.service();
        env.ctx
            .db
            .execute_unprepared("DROP TABLE jobtag")
            .await
            .unwrap();

        let mut req = JobMeta::example(600, 1000);
        req.base.tags = vec![Tag {
            id: None,
            tag_type: "testing".into(),
            name: "lost".into(),
        }];
        assert!(svc.job.start(req).await.is_err());

        assert!(MonitorError::is_not_found(
            &svc.job.find(600, None, None).await.unwrap_err()
        ));
        assert!(svc.tag.tag_id("testing", "lost").await.unwrap().is_none());

        // untagged starts are unaffected
        svc.job.start(JobMeta::example(600, 1000)).await.unwrap();
    }

    #[tokio::test]
    async fn test_archive_sets_footprint() {
        let env = test_env().await;
        let svc = env.ctx.service();
        let id = svc.job.start(JobMeta::example(11, 1000)).await.unwrap();

        let stat = |avg, max| JobStatistics {
            unit: String::new(),
            avg,
            min: 0.0,
            max,
        };
        let stats = HashMap::from([
            ("flops_any".to_string(), stat(10.0, 20.0)),
            ("mem_used".to_string(), stat(1.0, 4.0)),
            ("load".to_string(), stat(f64::NAN, 1.0)),
            ("ipc".to_string(), stat(0.5, 1.0)),
        ]);
        svc.job
            .archive(id, MonitoringStatus::ArchivingSuccessful, &stats)
            .await
            .unwrap();

        let job = svc.job.find_by_id(id).await.unwrap();
        assert_eq!(job.monitoring_status, MonitoringStatus::ArchivingSuccessful);
        assert_eq!(job.footprint.flops_any_avg, 10.0);
        assert_eq!(job.footprint.mem_used_max, 4.0);
        assert_eq!(job.footprint.load_avg, 0.0);

        assert!(MonitorError::is_not_found(
            &svc.job
                .archive(4242, MonitoringStatus::ArchivingFailed, &stats)
                .await
                .unwrap_err()
        ));
    }

    #[tokio::test]
    async fn test_count_and_search() {
        let env = test_env().await;
        let svc = env.ctx.service();
        let id = svc.job.start(JobMeta::example(21, 1000)).await.unwrap();
        let mut other = JobMeta::example(22, 1000);
        other.base.user = "bob".into();
        svc.job.start(other).await.unwrap();

        let admin = UserInfo::admin();
        let counts = svc.job.count_jobs(&admin, None).await.unwrap();
        assert_eq!(counts["testcluster"], 2);
        let counts = svc
            .job
            .count_jobs(&UserInfo::user("bob"), Some(JobState::Running))
            .await
            .unwrap();
        assert_eq!(counts["testcluster"], 1);
        let counts = svc
            .job
            .count_jobs(&admin, Some(JobState::Completed))
            .await
            .unwrap();
        assert!(counts.is_empty());

        assert_eq!(
            svc.job.find_job_or_user(&admin, "21").await.unwrap(),
            JobOrUser::Job(id)
        );
        assert_eq!(
            svc.job.find_job_or_user(&admin, "bob").await.unwrap(),
            JobOrUser::User("bob".into())
        );
        // bob may not see alice's job, nor look up users
        let bob = UserInfo::user("bob");
        assert!(svc.job.find_job_or_user(&bob, "21").await.is_err());
        assert!(svc.job.find_job_or_user(&bob, "alice").await.is_err());
    }
}
