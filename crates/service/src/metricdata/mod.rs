use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    clusters::ClusterRegistry,
    schema::{Job, JobData, MetricScope, MetricStatistics, NodeData},
};

mod cc_metric_store;
mod influxdb;
mod testing;

pub use cc_metric_store::CcMetricStore;
pub use influxdb::InfluxDb;
pub use testing::TestMetricDataRepository;

/// The `metricDataRepository` object of a `cluster.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum MetricDataConfig {
    #[serde(rename = "cc-metric-store")]
    CcMetricStore {
        url: String,
        #[serde(default)]
        token: String,
        /// local metric name -> name in the store
        #[serde(default)]
        renamings: HashMap<String, String>,
    },
    #[serde(rename = "influxdb")]
    InfluxDb {
        url: String,
        #[serde(default)]
        token: String,
        bucket: String,
        org: String,
        /// accept invalid TLS certificates
        #[serde(default, rename = "skiptls")]
        skip_tls: bool,
    },
    #[serde(rename = "test")]
    Test,
}

/// Data returned together with the errors of the parts that could not be loaded.
#[derive(Debug, Clone, Default)]
pub struct Loaded<T> {
    pub data: T,
    pub errors: Vec<String>,
}

impl<T> Loaded<T> {
    pub fn complete(data: T) -> Self {
        Self {
            data,
            errors: vec![],
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// A live source of metric samples for one cluster.
#[async_trait]
pub trait MetricDataRepository: Send + Sync {
    /// Data of the job's time window, only for the requested metrics and scopes.
    async fn load_data(
        &self,
        job: &Job,
        metrics: &[String],
        scopes: &[MetricScope],
    ) -> Result<Loaded<JobData>>;

    /// metric -> host -> statistics over the job's time window, node scope.
    async fn load_stats(
        &self,
        job: &Job,
        metrics: &[String],
    ) -> Result<HashMap<String, HashMap<String, MetricStatistics>>>;

    /// `None` when the repository does not support node queries.
    async fn load_node_data(
        &self,
        cluster: &str,
        metrics: &[String],
        nodes: &[String],
        scopes: &[MetricScope],
        from: i64,
        to: i64,
    ) -> Result<Option<Loaded<NodeData>>>;
}

/// One repository per cluster.
#[derive(Clone, Default)]
pub struct MetricDataRegistry {
    repos: HashMap<String, Arc<dyn MetricDataRepository>>,
}

impl MetricDataRegistry {
    pub fn init(clusters: &ClusterRegistry, http_client: reqwest::Client) -> Result<Self> {
        let mut registry = Self::default();
        for cluster in clusters.all() {
            let Some(conf) = &cluster.metric_data_repository else {
                continue;
            };
            let repo: Arc<dyn MetricDataRepository> = match conf {
                MetricDataConfig::CcMetricStore {
                    url,
                    token,
                    renamings,
                } => Arc::new(CcMetricStore::new(
                    http_client.clone(),
                    url,
                    token,
                    renamings.clone(),
                    clusters.clone(),
                )?),
                MetricDataConfig::InfluxDb {
                    url,
                    token,
                    bucket,
                    org,
                    skip_tls,
                } => Arc::new(InfluxDb::new(
                    http_client.clone(),
                    url,
                    token,
                    bucket,
                    org,
                    *skip_tls,
                    clusters.clone(),
                )?),
                MetricDataConfig::Test => Arc::new(TestMetricDataRepository::default()),
            };
            info!("metric data repository for cluster {} initialized", cluster.name);
            registry.repos.insert(cluster.name.clone(), repo);
        }
        Ok(registry)
    }

    pub fn register(&mut self, cluster: &str, repo: Arc<dyn MetricDataRepository>) {
        self.repos.insert(cluster.to_string(), repo);
    }

    pub fn get(&self, cluster: &str) -> Option<Arc<dyn MetricDataRepository>> {
        self.repos.get(cluster).cloned()
    }
}

#[test]
fn test_config_kinds() {
    let c: MetricDataConfig = serde_json::from_str(
        r#"{"kind": "cc-metric-store", "url": "http://localhost:8082", "token": "t"}"#,
    )
    .unwrap();
    assert!(matches!(c, MetricDataConfig::CcMetricStore { ref token, .. } if token == "t"));

    let c: MetricDataConfig = serde_json::from_str(r#"{"kind": "test"}"#).unwrap();
    assert_eq!(c, MetricDataConfig::Test);

    let c: MetricDataConfig = serde_json::from_str(
        r#"{"kind": "influxdb", "url": "https://influx:8086", "token": "t",
            "bucket": "metrics", "org": "hpc", "skiptls": true}"#,
    )
    .unwrap();
    assert!(matches!(
        c,
        MetricDataConfig::InfluxDb { ref bucket, skip_tls: true, .. } if bucket == "metrics"
    ));

    // a bucket is required
    let no_bucket = r#"{"kind": "influxdb", "url": "x", "org": "o"}"#;
    assert!(serde_json::from_str::<MetricDataConfig>(no_bucket).is_err());
    assert!(serde_json::from_str::<MetricDataConfig>(r#"{"kind": "prometheus"}"#).is_err());
}
