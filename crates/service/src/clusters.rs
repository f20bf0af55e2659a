use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    error::MonitorError,
    schema::{BaseJob, Cluster, MetricConfig},
};

/// Per cluster configuration read from `<archive>/<cluster>/cluster.json`.
#[derive(Debug, Clone, Default)]
pub struct ClusterRegistry {
    clusters: Vec<Cluster>,
}

impl ClusterRegistry {
    pub fn new(clusters: Vec<Cluster>) -> Self {
        Self { clusters }
    }

    pub fn load(archive_root: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(archive_root)
            .with_context(|| format!("read job archive {}", archive_root.display()))?;

        let mut clusters = vec![];
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path().join("cluster.json");
            let bytes =
                std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            let cluster: Cluster = serde_json::from_slice(&bytes)
                .with_context(|| format!("parse {}", path.display()))?;

            if cluster.name != dir_name {
                anyhow::bail!(
                    "the file '{dir_name}/cluster.json' contains the cluster name '{}'",
                    cluster.name
                );
            }
            info!(
                "loaded cluster {} ({} sub clusters, {} metrics)",
                cluster.name,
                cluster.sub_clusters.len(),
                cluster.metric_config.len()
            );
            clusters.push(cluster);
        }

        Ok(Self { clusters })
    }

    pub fn all(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn get(&self, name: &str) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.name == name)
    }

    pub fn must_get(&self, name: &str) -> Result<&Cluster> {
        self.get(name)
            .ok_or_else(|| MonitorError::NotFound(format!("no such cluster: {name:?}")).into())
    }

    pub fn metric_config(&self, cluster: &str, metric: &str) -> Option<&MetricConfig> {
        self.get(cluster).and_then(|c| c.metric_config(metric))
    }

    pub fn metric_names(&self, cluster: &str) -> Vec<String> {
        self.get(cluster)
            .map(|c| c.metric_names())
            .unwrap_or_default()
    }

    /// Fill in `job.sub_cluster` from the first assigned host, or check the given one.
    pub fn assign_sub_cluster(&self, job: &mut BaseJob) -> Result<()> {
        let cluster = self
            .get(&job.cluster)
            .ok_or_else(|| MonitorError::Validation(format!("no such cluster: {:?}", job.cluster)))?;

        if !job.sub_cluster.is_empty() {
            if cluster.sub_cluster(&job.sub_cluster).is_none() {
                return Err(MonitorError::Validation(format!(
                    "sub cluster {:?} not found in cluster {}",
                    job.sub_cluster, cluster.name
                ))
                .into());
            }
            return Ok(());
        }

        if let [only] = cluster.sub_clusters.as_slice() {
            job.sub_cluster = only.name.clone();
            return Ok(());
        }

        let host = job
            .resources
            .first()
            .map(|r| r.hostname.as_str())
            .ok_or_else(|| MonitorError::Validation("job has no resources".into()))?;

        let sc = cluster.sub_cluster_of(host).ok_or_else(|| {
            MonitorError::Validation(format!(
                "no sub cluster found for cluster {} and host {host}",
                cluster.name
            ))
        })?;
        job.sub_cluster = sc.name.clone();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) const TEST_CLUSTER_JSON: &str = r#"{
    "name": "testcluster",
    "subClusters": [
        {
            "name": "sc0",
            "nodes": "host120,host121,host122"
        },
        {
            "name": "sc1",
            "nodes": "host[123-125]",
            "processorType": "Intel Core i7-4770",
            "socketsPerNode": 1,
            "coresPerSocket": 4,
            "threadsPerCore": 2,
            "flopRateScalar": 44,
            "flopRateSimd": 704,
            "memoryBandwidth": 80,
            "topology": {
                "node": [0, 1, 2, 3, 4, 5, 6, 7],
                "socket": [[0, 1, 2, 3, 4, 5, 6, 7]],
                "memoryDomain": [[0, 1, 2, 3, 4, 5, 6, 7]],
                "die": [[0, 1, 2, 3, 4, 5, 6, 7]],
                "core": [[0, 4], [1, 5], [2, 6], [3, 7]],
                "accelerators": []
            }
        }
    ],
    "metricDataRepository": {"kind": "test"},
    "metricConfig": [
        {
            "name": "load_one",
            "unit": "load",
            "scope": "node",
            "timestep": 60,
            "peak": 8,
            "normal": 0,
            "caution": 0,
            "alert": 0
        },
        {
            "name": "flops_any",
            "unit": "GF/s",
            "scope": "hwthread",
            "timestep": 60,
            "peak": 700,
            "normal": 100,
            "caution": 10,
            "alert": 1
        }
    ],
    "filterRanges": {
        "numNodes": { "from": 1, "to": 1 },
        "duration": { "from": 0, "to": 172800 },
        "startTime": { "from": "2010-01-01T00:00:00Z", "to": null }
    }
}"#;

#[test]
fn test_load_and_assign() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("testcluster")).unwrap();
    std::fs::write(
        dir.path().join("testcluster").join("cluster.json"),
        TEST_CLUSTER_JSON,
    )
    .unwrap();

    let reg = ClusterRegistry::load(dir.path()).unwrap();
    assert_eq!(reg.all().len(), 1);
    assert_eq!(reg.metric_names("testcluster"), vec!["load_one", "flops_any"]);
    assert!(reg.get("testcluster").unwrap().filter_ranges.start_time.to.is_none());

    let mut job = BaseJob {
        cluster: "testcluster".into(),
        resources: vec![crate::schema::Resource {
            hostname: "host124".into(),
            ..Default::default()
        }],
        ..Default::default()
    };
    reg.assign_sub_cluster(&mut job).unwrap();
    assert_eq!(job.sub_cluster, "sc1");

    job.resources[0].hostname = "host999".into();
    job.sub_cluster.clear();
    assert!(reg.assign_sub_cluster(&mut job).is_err());

    job.cluster = "nope".into();
    assert!(reg.assign_sub_cluster(&mut job).is_err());
}

#[test]
fn test_cluster_name_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("other")).unwrap();
    std::fs::write(dir.path().join("other").join("cluster.json"), TEST_CLUSTER_JSON).unwrap();
    assert!(ClusterRegistry::load(dir.path()).is_err());
}
