use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Loaded, MetricDataRepository};
use crate::{
    error::MonitorError,
    schema::{Job, JobData, MetricScope, MetricStatistics, NodeData},
};

#[derive(Default)]
struct State {
    /// keyed by the scheduler's job id
    jobs: HashMap<i64, JobData>,
    fallback: Option<JobData>,
    node_data: Option<NodeData>,
    failure: Option<String>,
    partial_errors: Vec<String>,
    /// requests including this metric take this long
    slow_metric: Option<(String, Duration)>,
}

/// In-memory repository serving whatever data was put into it.
///
/// Clones share their state, so a test can keep one handle while the
/// registry owns another.
#[derive(Clone, Default)]
pub struct TestMetricDataRepository {
    state: Arc<RwLock<State>>,
    calls: Arc<AtomicUsize>,
}

impl TestMetricDataRepository {
    pub async fn set_job_data(&self, job_id: i64, data: JobData) {
        self.state.write().await.jobs.insert(job_id, data);
    }

    /// Data served for jobs without their own entry.
    pub async fn set_fallback(&self, data: JobData) {
        self.state.write().await.fallback = Some(data);
    }

    pub async fn set_node_data(&self, data: NodeData) {
        self.state.write().await.node_data = Some(data);
    }

    /// Make every call fail, or stop failing with `None`.
    pub async fn set_failure(&self, message: Option<&str>) {
        self.state.write().await.failure = message.map(str::to_string);
    }

    pub async fn set_partial_errors(&self, errors: Vec<String>) {
        self.state.write().await.partial_errors = errors;
    }

    pub async fn set_slow_metric(&self, metric: &str, delay: Duration) {
        self.state.write().await.slow_metric = Some((metric.to_string(), delay));
    }

    /// Number of `load_data` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn check_failure(&self) -> Result<()> {
        match &self.state.read().await.failure {
            Some(msg) => Err(MonitorError::Adapter(msg.clone()).into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MetricDataRepository for TestMetricDataRepository {
    async fn load_data(
        &self,
        job: &Job,
        metrics: &[String],
        scopes: &[MetricScope],
    ) -> Result<Loaded<JobData>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure().await?;

        let delay = match &self.state.read().await.slow_metric {
            Some((slow, delay)) if metrics.contains(slow) => Some(*delay),
            _ => None,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.read().await;
        let Some(all) = state.jobs.get(&job.job_id).or(state.fallback.as_ref()) else {
            return Ok(Loaded {
                data: JobData::default(),
                errors: state.partial_errors.clone(),
            });
        };

        let mut data = JobData::default();
        for metric in metrics {
            let Some(per_scope) = all.get(metric) else {
                continue;
            };
            let selected: HashMap<_, _> = per_scope
                .iter()
                .filter(|(scope, _)| scopes.contains(scope))
                .map(|(scope, jm)| (*scope, jm.clone()))
                .collect();
            if !selected.is_empty() {
                data.insert(metric.clone(), selected);
            }
        }

        Ok(Loaded {
            data,
            errors: state.partial_errors.clone(),
        })
    }

    async fn load_stats(
        &self,
        job: &Job,
        metrics: &[String],
    ) -> Result<HashMap<String, HashMap<String, MetricStatistics>>> {
        let loaded = self.load_data(job, metrics, &[MetricScope::Node]).await?;

        let mut stats = HashMap::new();
        for (metric, per_scope) in loaded.data.0 {
            let Some(jm) = per_scope.get(&MetricScope::Node) else {
                continue;
            };
            let per_host: HashMap<String, MetricStatistics> = jm
                .series
                .iter()
                .map(|s| {
                    let st = s
                        .statistics
                        .unwrap_or_else(|| MetricStatistics::from_samples(&s.data));
                    (s.hostname.clone(), st)
                })
                .collect();
            stats.insert(metric, per_host);
        }
        Ok(stats)
    }

    async fn load_node_data(
        &self,
        _cluster: &str,
        metrics: &[String],
        nodes: &[String],
        _scopes: &[MetricScope],
        _from: i64,
        _to: i64,
    ) -> Result<Option<Loaded<NodeData>>> {
        self.check_failure().await?;

        let state = self.state.read().await;
        let Some(all) = &state.node_data else {
            return Ok(None);
        };

        let data = all
            .iter()
            .filter(|(host, _)| nodes.is_empty() || nodes.contains(host))
            .map(|(host, per_metric)| {
                let per_metric = per_metric
                    .iter()
                    .filter(|(m, _)| metrics.is_empty() || metrics.contains(m))
                    .map(|(m, v)| (m.clone(), v.clone()))
                    .collect();
                (host.clone(), per_metric)
            })
            .collect();
        Ok(Some(Loaded::complete(data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::test_metric;

    #[tokio::test]
    async fn test_filters_metrics_and_scopes() {
        let repo = TestMetricDataRepository::default();
        let mut jd = JobData::default();
        jd.insert(
            "load_one".into(),
            HashMap::from([
                (
                    MetricScope::Node,
                    test_metric(MetricScope::Node, vec![("h1", None, vec![1.0, 3.0])]),
                ),
                (
                    MetricScope::Core,
                    test_metric(MetricScope::Core, vec![("h1", Some("0"), vec![1.0])]),
                ),
            ]),
        );
        repo.set_job_data(7, jd).await;

        let mut job = Job::default();
        job.job_id = 7;
        let loaded = repo
            .load_data(
                &job,
                &["load_one".into(), "mem_bw".into()],
                &[MetricScope::Node],
            )
            .await
            .unwrap();
        assert!(!loaded.is_partial());
        assert_eq!(loaded.data.len(), 1);
        assert_eq!(loaded.data["load_one"].len(), 1);

        let stats = repo.load_stats(&job, &["load_one".into()]).await.unwrap();
        assert_eq!(stats["load_one"]["h1"].avg, 2.0);
        assert_eq!(repo.calls(), 2);

        job.job_id = 8;
        let loaded = repo
            .load_data(&job, &["load_one".into()], &[MetricScope::Node])
            .await
            .unwrap();
        assert!(loaded.data.is_empty());
        assert!(!loaded.is_partial());

        repo.set_partial_errors(vec!["load_one: no data".into()]).await;
        let loaded = repo
            .load_data(&job, &["load_one".into()], &[MetricScope::Node])
            .await
            .unwrap();
        assert!(loaded.data.is_empty());
        assert!(loaded.is_partial());
    }

    #[tokio::test]
    async fn test_failure_and_node_data() {
        let repo = TestMetricDataRepository::default();
        let none = repo
            .load_node_data("c", &[], &[], &[MetricScope::Node], 0, 10)
            .await
            .unwrap();
        assert!(none.is_none());

        repo.set_failure(Some("down")).await;
        let err = repo
            .load_data(&Job::default(), &[], &[MetricScope::Node])
            .await
            .unwrap_err();
        assert!(matches!(MonitorError::of(&err), Some(MonitorError::Adapter(_))));
    }
}
