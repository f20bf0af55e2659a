use std::sync::Arc;

use anyhow::Result;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::MonitorError,
    schema::{
        Job, JobData, JobMeta, JobStatistics, MetricScope, MetricStatistics, MonitoringStatus,
    },
    state::AppContext,
};

/// Jobs with at most this many nodes are archived at core scope as well.
const CORE_SCOPE_MAX_NODES: i32 = 8;

/// Counts the archiving tasks that are still running.
#[derive(Clone)]
pub struct InFlight {
    tx: Arc<watch::Sender<usize>>,
}

impl Default for InFlight {
    fn default() -> Self {
        Self {
            tx: Arc::new(watch::channel(0).0),
        }
    }
}

/// Deregisters its task when dropped, however the task ends.
pub struct InFlightGuard {
    tx: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tx.send_modify(|n| *n -= 1);
    }
}

impl InFlight {
    pub fn enter(&self) -> InFlightGuard {
        self.tx.send_modify(|n| *n += 1);
        InFlightGuard {
            tx: self.tx.clone(),
        }
    }

    pub fn count(&self) -> usize {
        *self.tx.borrow()
    }

    /// Wait until no task is in flight. Tasks entering while waiting are
    /// waited for too.
    pub async fn wait_all(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in self, so this cannot fail
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

pub struct ArchiverLogic<'a> {
    ctx: &'a AppContext,
}

impl<'a> ArchiverLogic<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    /// Load the job's metrics one by one into `into`, so whatever arrived
    /// survives if this future is dropped halfway.
    async fn gather(&self, job: &Job, into: &Mutex<JobData>) -> Result<()> {
        let cluster = self.ctx.clusters.must_get(&job.cluster)?;
        let mut scopes = vec![MetricScope::Node];
        if job.num_nodes <= CORE_SCOPE_MAX_NODES {
            scopes.push(MetricScope::Core);
        }

        let svc = self.ctx.service();
        for metric in cluster.metric_names() {
            let data = svc
                .metric_data
                .load_data(job, Some(std::slice::from_ref(&metric)), Some(&scopes))
                .await?;
            let mut into = into.lock().await;
            for (name, per_scope) in data.iter() {
                into.insert(name.clone(), per_scope.clone());
            }
        }
        Ok(())
    }

    /// Compute the statistics of `data` and write the archive entry with
    /// `status` as its monitoring status.
    async fn persist(
        &self,
        job: &Job,
        data: &JobData,
        status: MonitoringStatus,
    ) -> Result<JobMeta> {
        let cluster = self.ctx.clusters.must_get(&job.cluster)?;
        let svc = self.ctx.service();

        let mut job = job.clone();
        svc.job.fetch_metadata(&mut job).await?;
        job.tags = svc.tag.get_job_tags(job.id).await?;
        job.monitoring_status = status;

        let mut meta = JobMeta::from_job(&job);
        for (metric, per_scope) in data.iter() {
            let Some(node) = per_scope.get(&MetricScope::Node) else {
                continue;
            };
            if node.series.is_empty() {
                continue;
            }

            let (mut avg, mut min, mut max) = (0.0, f64::MAX, f64::MIN);
            for s in &node.series {
                let st = s
                    .statistics
                    .unwrap_or_else(|| MetricStatistics::from_samples(&s.data));
                avg += st.avg;
                min = min.min(st.min);
                max = max.max(st.max);
            }

            let unit = cluster
                .metric_config(metric)
                .map_or_else(|| node.unit.clone(), |mc| mc.unit.clone());
            meta.statistics.insert(
                metric.clone(),
                JobStatistics {
                    unit,
                    avg: avg / job.num_nodes.max(1) as f64,
                    min,
                    max,
                },
            );
        }

        if self.ctx.archive.is_disabled() {
            debug!("archive disabled, not writing job {}", job.id);
            return Ok(meta);
        }
        self.ctx.archive.write(&meta, data).await?;
        Ok(meta)
    }

    /// Archive `job` in the background. The task is registered with
    /// `AppContext::archivings` before this returns.
    ///
    /// A task that fails or times out still archives the metrics it had
    /// already loaded, and the job ends up `ArchivingFailed`.
    pub fn spawn(&self, job: Job) -> JoinHandle<()> {
        let guard = self.ctx.archivings.enter();
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let svc = ctx.service();
            let timeout = ctx.conf.archiving_timeout();

            let gathered = Mutex::new(JobData::default());
            let gathering = svc.archiver.gather(&job, &gathered);
            let aborted = match tokio::time::timeout(timeout, gathering).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => Some(
                    MonitorError::ArchivingFailure(format!("timed out after {timeout:?}")).into(),
                ),
            };
            let data = gathered.into_inner();

            let status = match &aborted {
                None => MonitoringStatus::ArchivingSuccessful,
                Some(e) => {
                    error!("archiving job (dbid: {}) failed: {e:#}", job.id);
                    MonitoringStatus::ArchivingFailed
                }
            };

            if aborted.is_none() || !data.is_empty() {
                if aborted.is_some() {
                    warn!(
                        "archiving the {} metrics of job (dbid: {}) loaded before the failure",
                        data.len(),
                        job.id
                    );
                }
                let stored = match svc.archiver.persist(&job, &data, status).await {
                    Ok(meta) => svc.job.archive(job.id, status, &meta.statistics).await,
                    Err(e) => Err(e),
                };
                match stored {
                    Ok(()) if aborted.is_none() => {
                        info!("archiving job (dbid: {}) successful", job.id);
                        return;
                    }
                    Ok(()) => return,
                    Err(e) => error!("archiving job (dbid: {}) failed to store: {e:#}", job.id),
                }
            }

            if let Err(e) = svc
                .job
                .update_monitoring_status(job.id, MonitoringStatus::ArchivingFailed)
                .await
            {
                error!(
                    "setting monitoring status of job (dbid: {}) failed: {e:#}",
                    job.id
                );
            }
        })
    }
}
