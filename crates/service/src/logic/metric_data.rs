use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tracing::error;

use crate::{
    cache::Computed,
    error::MonitorError,
    metricdata::MetricDataRepository,
    schema::{Float, Job, JobData, JobState, MetricScope, MonitoringStatus, NodeData},
    state::AppContext,
};

/// Above this many series a metric also gets a min/mean/max statistics series.
const MAX_SERIES: usize = 15;

const RUNNING_TTL: Duration = Duration::from_secs(2 * 60);
const FINISHED_TTL: Duration = Duration::from_secs(5 * 60 * 60);

/// Decides whether a job's metrics come from the live repository or from
/// the archive, and caches what it got.
pub struct MetricDataLogic<'a> {
    ctx: &'a AppContext,
}

impl<'a> MetricDataLogic<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    fn repo(&self, cluster: &str) -> Result<Arc<dyn MetricDataRepository>> {
        self.ctx.metric_repos.get(cluster).ok_or_else(|| {
            MonitorError::NotFound(format!(
                "no metric data repository configured for {cluster:?}"
            ))
            .into()
        })
    }

    fn is_live(&self, job: &Job) -> bool {
        job.state == JobState::Running
            || job.monitoring_status == MonitoringStatus::RunningOrArchiving
            || self.ctx.archive.is_disabled()
    }

    /// `None` for `metrics` means every metric of the cluster, `None` for
    /// `scopes` means node scope (live) or whatever was archived.
    pub async fn load_data(
        &self,
        job: &Job,
        metrics: Option<&[String]>,
        scopes: Option<&[MetricScope]>,
    ) -> Result<Arc<JobData>> {
        let key = format!("{}({}):[{:?}],[{:?}]", job.id, job.state, metrics, scopes);
        let ttl = if job.state == JobState::Running {
            RUNNING_TTL
        } else {
            FINISHED_TTL
        };

        self.ctx
            .data_cache
            .get_or_compute(&key, async {
                let (mut data, weight) = if self.is_live(job) {
                    let data = self.load_live(job, metrics, scopes).await?;
                    let size = data.size();
                    (data, size)
                } else {
                    // archive reads are cached by the archive store itself
                    (self.load_archived(job, metrics, scopes).await?, 1)
                };
                prepare_job_data(&mut data, scopes.unwrap_or_default());
                Ok(Computed::new(Arc::new(data), ttl, weight))
            })
            .await
    }

    async fn load_live(
        &self,
        job: &Job,
        metrics: Option<&[String]>,
        scopes: Option<&[MetricScope]>,
    ) -> Result<JobData> {
        let repo = self.repo(&job.cluster)?;
        let metrics = match metrics {
            Some(m) => m.to_vec(),
            None => self.ctx.clusters.metric_names(&job.cluster),
        };
        let scopes = scopes.unwrap_or(&[MetricScope::Node]);

        let loaded = repo.load_data(job, &metrics, scopes).await?;
        if loaded.is_partial() {
            let msg = loaded.errors.join(", ");
            if loaded.data.is_empty() {
                return Err(MonitorError::Adapter(msg).into());
            }
            error!("partial error: {msg}");
        }
        Ok(loaded.data)
    }

    async fn load_archived(
        &self,
        job: &Job,
        metrics: Option<&[String]>,
        scopes: Option<&[MetricScope]>,
    ) -> Result<JobData> {
        let archived = self.ctx.archive.load_data(job).await?;
        if metrics.is_none() && scopes.is_none() {
            return Ok(archived.as_ref().clone());
        }

        let metrics: Vec<&String> = match metrics {
            Some(m) => m.iter().collect(),
            None => archived.keys().collect(),
        };
        let scopes = scopes.unwrap_or_default();

        let mut data = JobData::default();
        for metric in metrics {
            let Some(per_scope) = archived.get(metric) else {
                continue;
            };
            // a metric archived at a single scope is returned as is
            let mut selected = per_scope.clone();
            if per_scope.len() > 1 {
                let subset: std::collections::HashMap<_, _> = per_scope
                    .iter()
                    .filter(|(scope, _)| scopes.contains(scope))
                    .map(|(scope, jm)| (*scope, jm.clone()))
                    .collect();
                if !subset.is_empty() {
                    selected = subset;
                }
            }
            data.insert(metric.clone(), selected);
        }
        Ok(data)
    }

    /// Append one average per metric to `out`, NaN where nothing is known.
    pub async fn load_averages(
        &self,
        job: &Job,
        metrics: &[String],
        out: &mut [Vec<Float>],
    ) -> Result<()> {
        if out.len() != metrics.len() {
            return Err(MonitorError::Validation(format!(
                "{} metrics but {} output columns",
                metrics.len(),
                out.len()
            ))
            .into());
        }

        if job.state != JobState::Running && !self.ctx.archive.is_disabled() {
            let meta = self.ctx.archive.load_meta(job).await?;
            for (metric, col) in metrics.iter().zip(out.iter_mut()) {
                let avg = meta.statistics.get(metric).map_or(f64::NAN, |s| s.avg);
                col.push(Float(avg));
            }
            return Ok(());
        }

        let stats = self.repo(&job.cluster)?.load_stats(job, metrics).await?;
        for (metric, col) in metrics.iter().zip(out.iter_mut()) {
            match stats.get(metric) {
                Some(per_host) => col.push(Float(per_host.values().map(|s| s.avg).sum())),
                None => col.push(Float::NAN),
            }
        }
        Ok(())
    }

    /// Live data of whole nodes over `[from, to]`, never read from the archive.
    pub async fn load_node_data(
        &self,
        cluster: &str,
        metrics: Option<&[String]>,
        nodes: Option<&[String]>,
        scopes: Option<&[MetricScope]>,
        from: i64,
        to: i64,
    ) -> Result<NodeData> {
        let repo = self.repo(cluster)?;
        let metrics = match metrics {
            Some(m) => m.to_vec(),
            None => self.ctx.clusters.metric_names(cluster),
        };
        let nodes = match nodes {
            Some(n) => n.to_vec(),
            None => self
                .ctx
                .clusters
                .must_get(cluster)?
                .sub_clusters
                .iter()
                .flat_map(|sc| sc.nodes.expand())
                .collect(),
        };
        let scopes = scopes.unwrap_or(&[MetricScope::Node]);

        let Some(loaded) = repo
            .load_node_data(cluster, &metrics, &nodes, scopes, from, to)
            .await?
        else {
            return Err(MonitorError::Validation(format!(
                "the metric data repository for {cluster:?} does not support this query"
            ))
            .into());
        };

        if loaded.is_partial() {
            let msg = loaded.errors.join(", ");
            if loaded.data.is_empty() {
                return Err(MonitorError::Adapter(msg).into());
            }
            error!("partial error: {msg}");
        }
        Ok(loaded.data)
    }
}

/// Large jobs get a statistics series per metric; when node scope is asked
/// for, flops_any and mem_bw are made available at node scope.
fn prepare_job_data(data: &mut JobData, scopes: &[MetricScope]) {
    for jm in data.values_mut().flat_map(|per_scope| per_scope.values_mut()) {
        if jm.statistics_series.is_none() && jm.series.len() > MAX_SERIES {
            jm.add_statistics_series();
        }
    }

    if scopes.contains(&MetricScope::Node) {
        data.add_node_scope("flops_any");
        data.add_node_scope("mem_bw");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        schema::{JobMeta, JobStatistics, test_metric},
        state::testing::test_env,
    };

    fn node_data(hosts: usize, samples: &[f64]) -> JobData {
        let series = (0..hosts)
            .map(|i| (format!("host{i}"), samples.to_vec()))
            .collect::<Vec<_>>();
        let jm = test_metric(
            MetricScope::Node,
            series
                .iter()
                .map(|(h, d)| (h.as_str(), None, d.clone()))
                .collect(),
        );
        let mut jd = JobData::default();
        jd.insert("load_one".into(), HashMap::from([(MetricScope::Node, jm)]));
        jd
    }

    #[tokio::test]
    async fn test_live_reads_are_cached() {
        let env = test_env().await;
        let svc = env.ctx.service();
        let id = svc.job.start(JobMeta::example(1, 1000)).await.unwrap();
        let job = svc.job.find_by_id(id).await.unwrap();

        env.repo.set_job_data(1, node_data(1, &[1.0, 2.0])).await;
        let a = svc.metric_data.load_data(&job, None, None).await.unwrap();
        let b = svc.metric_data.load_data(&job, None, None).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(env.repo.calls(), 1);
        assert_eq!(
            a["load_one"][&MetricScope::Node].series[0].data,
            vec![Float(1.0), Float(2.0)]
        );

        // another scope selection is another key
        svc.metric_data
            .load_data(&job, None, Some(&[MetricScope::Core]))
            .await
            .unwrap();
        assert_eq!(env.repo.calls(), 2);
    }

    #[tokio::test]
    async fn test_partial_and_total_failures() {
        let env = test_env().await;
        let svc = env.ctx.service();
        let id = svc.job.start(JobMeta::example(2, 1000)).await.unwrap();
        let job = svc.job.find_by_id(id).await.unwrap();

        env.repo.set_partial_errors(vec!["flops_any: no data".into()]).await;
        let err = svc.metric_data.load_data(&job, None, None).await.unwrap_err();
        assert!(matches!(MonitorError::of(&err), Some(MonitorError::Adapter(_))));

        // not cached, and partial data is returned
        env.repo.set_job_data(2, node_data(1, &[3.0])).await;
        let data = svc.metric_data.load_data(&job, None, None).await.unwrap();
        assert!(data.contains_key("load_one"));

        env.repo.set_failure(Some("unreachable")).await;
        let err = svc
            .metric_data
            .load_data(&job, Some(&["load_one".to_string()]), None)
            .await
            .unwrap_err();
        assert!(matches!(MonitorError::of(&err), Some(MonitorError::Adapter(_))));
    }

    #[tokio::test]
    async fn test_statistics_series_for_many_nodes() {
        let env = test_env().await;
        let svc = env.ctx.service();
        let id = svc.job.start(JobMeta::example(3, 1000)).await.unwrap();
        let job = svc.job.find_by_id(id).await.unwrap();

        env.repo.set_job_data(3, node_data(16, &[1.0, 2.0])).await;
        let data = svc.metric_data.load_data(&job, None, None).await.unwrap();
        let stats = data["load_one"][&MetricScope::Node]
            .statistics_series
            .as_ref()
            .unwrap();
        assert_eq!(stats.mean, vec![Float(1.0), Float(2.0)]);
        assert_eq!(stats.max, vec![Float(1.0), Float(2.0)]);

        let env = test_env().await;
        let svc = env.ctx.service();
        let id = svc.job.start(JobMeta::example(3, 1000)).await.unwrap();
        let job = svc.job.find_by_id(id).await.unwrap();
        env.repo.set_job_data(3, node_data(15, &[1.0])).await;
        let data = svc.metric_data.load_data(&job, None, None).await.unwrap();
        assert!(data["load_one"][&MetricScope::Node].statistics_series.is_none());
    }

    #[tokio::test]
    async fn test_node_scope_is_derived_for_flops() {
        let env = test_env().await;
        let svc = env.ctx.service();
        let id = svc.job.start(JobMeta::example(4, 1000)).await.unwrap();
        let job = svc.job.find_by_id(id).await.unwrap();

        let mut jd = JobData::default();
        jd.insert(
            "flops_any".into(),
            HashMap::from([(
                MetricScope::HwThread,
                test_metric(
                    MetricScope::HwThread,
                    vec![
                        ("host123", Some("0"), vec![1.0, 2.0]),
                        ("host123", Some("1"), vec![3.0, 4.0]),
                    ],
                ),
            )]),
        );
        env.repo.set_job_data(4, jd).await;

        let scopes = [MetricScope::Node, MetricScope::HwThread];
        let data = svc
            .metric_data
            .load_data(&job, None, Some(&scopes))
            .await
            .unwrap();
        let node = &data["flops_any"][&MetricScope::Node];
        assert_eq!(node.series[0].data, vec![Float(4.0), Float(6.0)]);
    }

    #[tokio::test]
    async fn test_archived_reads_are_trimmed() {
        let env = test_env().await;
        let svc = env.ctx.service();

        let mut meta = JobMeta::example(5, 1000);
        meta.base.state = JobState::Completed;
        meta.base.duration = 120;
        meta.base.monitoring_status = MonitoringStatus::ArchivingSuccessful;
        meta.statistics.insert(
            "load_one".into(),
            JobStatistics {
                unit: "load".into(),
                avg: 1.5,
                min: 1.0,
                max: 2.0,
            },
        );
        let mut data = node_data(1, &[1.0, 2.0]);
        data.get_mut("load_one").unwrap().insert(
            MetricScope::Core,
            test_metric(MetricScope::Core, vec![("host0", Some("0"), vec![0.5])]),
        );
        data.insert(
            "flops_any".into(),
            HashMap::from([(
                MetricScope::Core,
                test_metric(MetricScope::Core, vec![("host0", Some("0"), vec![9.0])]),
            )]),
        );
        env.ctx.archive.write(&meta, &data).await.unwrap();
        let job = meta.to_job();

        let all = svc.metric_data.load_data(&job, None, None).await.unwrap();
        assert_eq!(all.as_ref(), &data);

        let node = svc
            .metric_data
            .load_data(&job, Some(&["load_one".to_string()]), Some(&[MetricScope::Node]))
            .await
            .unwrap();
        assert_eq!(node.len(), 1);
        assert_eq!(node["load_one"].len(), 1);
        assert!(node["load_one"].contains_key(&MetricScope::Node));

        // single scope metrics are kept; node scope is not invented on archived data
        let flops = svc
            .metric_data
            .load_data(&job, Some(&["flops_any".to_string()]), Some(&[MetricScope::Socket]))
            .await
            .unwrap();
        assert!(flops["flops_any"].contains_key(&MetricScope::Core));
        assert_eq!(env.repo.calls(), 0);

        let metrics = ["load_one".to_string(), "mem_bw".to_string()];
        let mut out = vec![vec![], vec![]];
        svc.metric_data
            .load_averages(&job, &metrics, &mut out)
            .await
            .unwrap();
        assert_eq!(out[0], vec![Float(1.5)]);
        assert!(out[1][0].is_nan());
    }

    #[tokio::test]
    async fn test_live_averages_sum_hosts() {
        let env = test_env().await;
        let svc = env.ctx.service();
        let id = svc.job.start(JobMeta::example(6, 1000)).await.unwrap();
        let job = svc.job.find_by_id(id).await.unwrap();
        env.repo.set_job_data(6, node_data(3, &[1.0, 3.0])).await;

        let metrics = ["load_one".to_string(), "flops_any".to_string()];
        let mut out = vec![vec![Float(0.0)], vec![]];
        svc.metric_data
            .load_averages(&job, &metrics, &mut out)
            .await
            .unwrap();
        assert_eq!(out[0], vec![Float(0.0), Float(6.0)]);
        assert!(out[1][0].is_nan());

        assert!(svc
            .metric_data
            .load_averages(&job, &metrics, &mut [vec![]])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_node_data() {
        let env = test_env().await;
        let svc = env.ctx.service();

        let err = svc
            .metric_data
            .load_node_data("testcluster", None, None, None, 0, 60)
            .await
            .unwrap_err();
        assert!(matches!(MonitorError::of(&err), Some(MonitorError::Validation(_))));
        assert!(MonitorError::is_not_found(
            &svc.metric_data
                .load_node_data("nope", None, None, None, 0, 60)
                .await
                .unwrap_err()
        ));

        let jm = test_metric(MetricScope::Node, vec![("host120", None, vec![1.0])]);
        env.repo
            .set_node_data(HashMap::from([
                (
                    "host120".to_string(),
                    HashMap::from([("load_one".to_string(), vec![jm.clone()])]),
                ),
                (
                    "other".to_string(),
                    HashMap::from([("load_one".to_string(), vec![jm])]),
                ),
            ]))
            .await;
        let data = svc
            .metric_data
            .load_node_data("testcluster", None, None, None, 0, 60)
            .await
            .unwrap();
        assert_eq!(data.len(), 1);
        assert!(data.contains_key("host120"));
    }
}
