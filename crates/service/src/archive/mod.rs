use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use nanoid::nanoid;
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    cache::{Computed, MetricCache},
    error::MonitorError,
    schema::{Job, JobData, JobMeta},
};

mod import;

pub use import::{ImportSummary, init_db};

const META_FILE: &str = "meta.json";
const DATA_FILE: &str = "data.json";

/// Archived entries never change, keep them around long.
const ARCHIVE_TTL: Duration = Duration::from_secs(5 * 60 * 60);

/// Directory of one job below the cluster directory.
pub fn shard_dir(cluster_dir: &Path, job_id: i64, start_time: Option<i64>) -> PathBuf {
    let dir = cluster_dir
        .join((job_id / 1000).to_string())
        .join(format!("{:03}", job_id % 1000));
    match start_time {
        Some(t) => dir.join(t.to_string()),
        None => dir,
    }
}

/// The on-disk job archive: `<root>/<cluster>/<id / 1000>/<id % 1000>/<start>/`.
///
/// Entries without a start time directory are read as well. An entry exists
/// once its `meta.json` exists; it is written last.
#[derive(Clone)]
pub struct ArchiveStore {
    root: PathBuf,
    disabled: bool,
    meta_cache: MetricCache<Arc<JobMeta>>,
    data_cache: MetricCache<Arc<JobData>>,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>, disabled: bool, cache_capacity: u64) -> Self {
        Self {
            root: root.into(),
            disabled,
            meta_cache: MetricCache::new(cache_capacity),
            data_cache: MetricCache::new(cache_capacity),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn job_dir(&self, cluster: &str, job_id: i64, start_time: i64) -> PathBuf {
        shard_dir(&self.root.join(cluster), job_id, Some(start_time))
    }

    fn cache_key(job: &Job) -> String {
        format!("{}:{}:{}", job.cluster, job.job_id, job.start_time)
    }

    /// The directory holding the job's entry, in either layout.
    async fn locate(&self, job: &Job) -> Result<PathBuf> {
        let cluster_dir = self.root.join(&job.cluster);
        for dir in [
            shard_dir(&cluster_dir, job.job_id, Some(job.start_time)),
            shard_dir(&cluster_dir, job.job_id, None),
        ] {
            let meta = dir.join(META_FILE);
            let found = tokio::fs::try_exists(&meta)
                .await
                .map_err(|e| MonitorError::Storage(format!("stat {}: {e}", meta.display())))?;
            if found {
                return Ok(dir);
            }
        }
        Err(MonitorError::NotFound(format!(
            "job {} on {} started at {} is not archived",
            job.job_id, job.cluster, job.start_time
        ))
        .into())
    }

    pub async fn load_meta(&self, job: &Job) -> Result<Arc<JobMeta>> {
        self.meta_cache
            .get_or_compute(&Self::cache_key(job), async {
                let dir = self.locate(job).await?;
                let (meta, len) = read_json::<JobMeta>(&dir.join(META_FILE)).await?;
                Ok(Computed::new(Arc::new(meta), ARCHIVE_TTL, len))
            })
            .await
    }

    pub async fn load_data(&self, job: &Job) -> Result<Arc<JobData>> {
        self.data_cache
            .get_or_compute(&Self::cache_key(job), async {
                let dir = self.locate(job).await?;
                let (data, _) = read_json::<JobData>(&dir.join(DATA_FILE)).await?;
                let size = data.size();
                Ok(Computed::new(Arc::new(data), ARCHIVE_TTL, size))
            })
            .await
    }

    /// Write a job's entry; `data.json` first so a present `meta.json` implies complete data.
    pub async fn write(&self, meta: &JobMeta, data: &JobData) -> Result<PathBuf> {
        if self.disabled {
            return Err(MonitorError::Storage("the job archive is disabled".into()).into());
        }
        let dir = self.job_dir(&meta.base.cluster, meta.base.job_id, meta.start_time);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| MonitorError::Storage(format!("create {}: {e}", dir.display())))?;

        write_json_atomic(&dir.join(DATA_FILE), data).await?;
        write_json_atomic(&dir.join(META_FILE), meta).await?;

        let key = Self::cache_key(&meta.to_job());
        self.meta_cache.invalidate(&key).await;
        self.data_cache.invalidate(&key).await;
        debug!("archived job {} to {}", meta.base.job_id, dir.display());
        Ok(dir)
    }

    /// Every entry directory below the root, by cluster.
    pub async fn entries(&self) -> Result<Vec<(String, PathBuf)>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || walk_entries(&root)).await?
    }

    pub async fn read_meta_at(dir: &Path) -> Result<JobMeta> {
        Ok(read_json(&dir.join(META_FILE)).await?.0)
    }
}

fn walk_entries(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = vec![];
    for cluster in subdirs(root)? {
        let name = file_name(&cluster);
        for lvl1 in subdirs(&cluster)? {
            for lvl2 in subdirs(&lvl1)? {
                if lvl2.join(META_FILE).is_file() {
                    out.push((name.clone(), lvl2));
                    continue;
                }
                for start in subdirs(&lvl2)? {
                    if start.join(META_FILE).is_file() {
                        out.push((name.clone(), start));
                    }
                }
            }
        }
    }
    Ok(out)
}

fn file_name(p: &Path) -> String {
    p.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = vec![];
    for entry in std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<(T, usize)> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| MonitorError::Storage(format!("read {}: {e}", path.display())))?;
    let v = serde_json::from_slice(&bytes)
        .map_err(|e| MonitorError::Storage(format!("decode {}: {e}", path.display())))?;
    Ok((v, bytes.len()))
}

async fn write_json_atomic<T: Serialize>(path: &Path, v: &T) -> Result<()> {
    let bytes = serde_json::to_vec(v)?;
    let tmp = path.with_extension(format!("{}.tmp", nanoid!(8)));
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| MonitorError::Storage(format!("write {}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| MonitorError::Storage(format!("rename to {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::schema::{Float, JobStatistics, MetricScope, test_metric};

    fn meta(job_id: i64, start_time: i64) -> JobMeta {
        let mut meta = JobMeta {
            start_time,
            ..Default::default()
        };
        meta.base.job_id = job_id;
        meta.base.cluster = "testcluster".into();
        meta.statistics.insert(
            "load_one".into(),
            JobStatistics {
                unit: "load".into(),
                avg: f64::NAN,
                min: 0.5,
                max: 2.0,
            },
        );
        meta
    }

    #[test]
    fn test_shard_dir() {
        let p = shard_dir(Path::new("/a/emmy"), 1404397, Some(1609300556));
        assert_eq!(p, Path::new("/a/emmy/1404/397/1609300556"));
        let p = shard_dir(Path::new("/a/emmy"), 7, None);
        assert_eq!(p, Path::new("/a/emmy/0/007"));
    }

    #[tokio::test]
    async fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path(), false, 1 << 20);

        let meta = meta(123, 123456789);
        let mut data = JobData::default();
        data.insert(
            "load_one".into(),
            HashMap::from([(
                MetricScope::Node,
                test_metric(MetricScope::Node, vec![("host123", None, vec![1.0, f64::NAN])]),
            )]),
        );

        let job = meta.to_job();
        assert!(MonitorError::is_not_found(
            &store.load_meta(&job).await.unwrap_err()
        ));

        let path = store.write(&meta, &data).await.unwrap();
        assert!(path.ends_with("testcluster/0/123/123456789"));

        let back = store.load_meta(&job).await.unwrap();
        assert_eq!(back.base.job_id, 123);
        assert!(back.statistics["load_one"].avg.is_nan());

        let back = store.load_data(&job).await.unwrap();
        let series = &back["load_one"][&MetricScope::Node].series[0];
        assert_eq!(series.data, vec![Float(1.0), Float::NAN]);

        let entries = store.entries().await.unwrap();
        assert_eq!(entries, vec![("testcluster".to_string(), path)]);
    }

    #[tokio::test]
    async fn test_legacy_layout_and_incomplete_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path(), false, 1 << 20);

        let meta = meta(1404397, 1609300556);
        let legacy = shard_dir(&dir.path().join("testcluster"), 1404397, None);
        std::fs::create_dir_all(&legacy).unwrap();
        std::fs::write(legacy.join(META_FILE), serde_json::to_vec(&meta).unwrap()).unwrap();
        std::fs::write(legacy.join(DATA_FILE), b"{}").unwrap();

        // data without meta is not an entry
        let partial = store.job_dir("testcluster", 5, 10);
        std::fs::create_dir_all(&partial).unwrap();
        std::fs::write(partial.join(DATA_FILE), b"{}").unwrap();

        let loaded = store.load_meta(&meta.to_job()).await.unwrap();
        assert_eq!(loaded.start_time, 1609300556);
        assert!(store.load_data(&meta.to_job()).await.unwrap().is_empty());

        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, legacy);
    }

    #[tokio::test]
    async fn test_unreadable_entry_is_not_reported_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path(), false, 1 << 20);
        // a file where the cluster directory belongs makes every lookup fail with ENOTDIR
        std::fs::write(dir.path().join("testcluster"), b"").unwrap();

        let err = store.load_meta(&meta(7, 70).to_job()).await.unwrap_err();
        assert!(
            matches!(MonitorError::of(&err), Some(MonitorError::Storage(_))),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_disabled_archive_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path(), true, 1 << 20);
        assert!(store.write(&meta(1, 1), &JobData::default()).await.is_err());
    }
}
