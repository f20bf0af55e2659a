use std::{collections::HashMap, fmt::Display, str::FromStr};

use anyhow::{Context, Result, anyhow};
use entity::job;
use sea_orm::{ActiveModelTrait, ActiveValue::NotSet, Set};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Running,
    Completed,
    Failed,
    Cancelled,
    Stopped,
    Timeout,
    Preempted,
    OutOfMemory,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        *self != JobState::Running
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Stopped => "stopped",
            JobState::Timeout => "timeout",
            JobState::Preempted => "preempted",
            JobState::OutOfMemory => "out_of_memory",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "running" => JobState::Running,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            "cancelled" => JobState::Cancelled,
            "stopped" => JobState::Stopped,
            "timeout" => JobState::Timeout,
            "preempted" => JobState::Preempted,
            "out_of_memory" => JobState::OutOfMemory,
            other => anyhow::bail!("not a valid job state: {other:?}"),
        })
    }
}

/// Orthogonal to the job state: tracks whether monitoring data of the job
/// is still live, was archived, or could not be archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr, Default)]
#[repr(i8)]
pub enum MonitoringStatus {
    Disabled = 0,
    #[default]
    RunningOrArchiving = 1,
    ArchivingFailed = 2,
    ArchivingSuccessful = 3,
}

impl TryFrom<i8> for MonitoringStatus {
    type Error = anyhow::Error;

    fn try_from(v: i8) -> Result<Self> {
        Ok(match v {
            0 => MonitoringStatus::Disabled,
            1 => MonitoringStatus::RunningOrArchiving,
            2 => MonitoringStatus::ArchivingFailed,
            3 => MonitoringStatus::ArchivingSuccessful,
            other => anyhow::bail!("invalid monitoring status {other}"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Resource {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hwthreads: Option<Vec<i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerators: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Tag {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(rename = "type")]
    pub tag_type: String,
    pub name: String,
}

/// Fields shared by the database row and the archived `meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BaseJob {
    pub job_id: i64,
    pub user: String,
    pub project: String,
    pub cluster: String,
    pub sub_cluster: String,
    pub partition: String,
    pub array_job_id: i64,
    pub num_nodes: i32,
    #[serde(rename = "numHwthreads")]
    pub num_hwthreads: i32,
    pub num_acc: i32,
    pub exclusive: i8,
    pub monitoring_status: MonitoringStatus,
    pub smt: i8,
    #[serde(rename = "jobState")]
    pub state: JobState,
    pub duration: i32,
    pub walltime: i64,
    pub tags: Vec<Tag>,
    pub resources: Vec<Resource>,
    pub meta_data: HashMap<String, String>,
}

impl Default for BaseJob {
    fn default() -> Self {
        Self {
            job_id: 0,
            user: String::new(),
            project: String::new(),
            cluster: String::new(),
            sub_cluster: String::new(),
            partition: String::new(),
            array_job_id: 0,
            num_nodes: 0,
            num_hwthreads: 0,
            num_acc: 0,
            exclusive: 1,
            monitoring_status: MonitoringStatus::RunningOrArchiving,
            smt: 1,
            state: JobState::Running,
            duration: 0,
            walltime: 0,
            tags: vec![],
            resources: vec![],
            meta_data: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobStatistics {
    pub unit: String,
    #[serde(with = "super::nan_as_null")]
    pub avg: f64,
    #[serde(with = "super::nan_as_null")]
    pub min: f64,
    #[serde(with = "super::nan_as_null")]
    pub max: f64,
}

/// The aggregate columns filled in once a job is archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct JobFootprint {
    pub flops_any_avg: f64,
    pub mem_used_max: f64,
    pub mem_bw_avg: f64,
    pub load_avg: f64,
    pub net_bw_avg: f64,
    pub file_bw_avg: f64,
}

/// The job column fed by an archived metric, with the statistic it takes.
/// Metrics without a column are not part of the footprint, NaN is never stored.
pub fn footprint_column(metric: &str, stats: &JobStatistics) -> Option<(job::Column, f64)> {
    let column = match metric {
        "flops_any" => (job::Column::FlopsAnyAvg, stats.avg),
        "mem_used" => (job::Column::MemUsedMax, stats.max),
        "mem_bw" => (job::Column::MemBwAvg, stats.avg),
        "load" => (job::Column::LoadAvg, stats.avg),
        "net_bw" => (job::Column::NetBwAvg, stats.avg),
        "file_bw" => (job::Column::FileBwAvg, stats.avg),
        _ => return None,
    };
    (!column.1.is_nan()).then_some(column)
}

/// A job as stored in the job table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: i64,
    #[serde(flatten)]
    pub base: BaseJob,
    pub start_time: i64,
    #[serde(flatten)]
    pub footprint: JobFootprint,
}

impl std::ops::Deref for Job {
    type Target = BaseJob;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl std::ops::DerefMut for Job {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

impl Job {
    /// End of the job's time window; running jobs end now.
    pub fn end_time(&self) -> i64 {
        if self.state == JobState::Running {
            utils::unix_now().max(self.start_time)
        } else {
            self.start_time + self.duration as i64
        }
    }

    pub fn hosts(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.hostname.as_str()).collect()
    }
}

impl TryFrom<job::Model> for Job {
    type Error = anyhow::Error;

    fn try_from(m: job::Model) -> Result<Self> {
        let resources: Vec<Resource> =
            serde_json::from_str(&m.resources).context("decode job resources")?;
        Ok(Job {
            id: m.id,
            start_time: m.start_time,
            base: BaseJob {
                job_id: m.job_id,
                user: m.user,
                project: m.project,
                cluster: m.cluster,
                sub_cluster: m.subcluster,
                partition: m.partition,
                array_job_id: m.array_job_id,
                num_nodes: m.num_nodes,
                num_hwthreads: m.num_hwthreads,
                num_acc: m.num_acc,
                exclusive: m.exclusive,
                monitoring_status: MonitoringStatus::try_from(m.monitoring_status)?,
                smt: m.smt,
                state: m
                    .job_state
                    .parse()
                    .map_err(|e| anyhow!("job {}: {e}", m.id))?,
                duration: m.duration,
                walltime: m.walltime,
                // tags and metadata are fetched on demand
                tags: vec![],
                resources,
                meta_data: HashMap::new(),
            },
            footprint: JobFootprint {
                flops_any_avg: m.flops_any_avg,
                mem_used_max: m.mem_used_max,
                mem_bw_avg: m.mem_bw_avg,
                load_avg: m.load_avg,
                net_bw_avg: m.net_bw_avg,
                file_bw_avg: m.file_bw_avg,
            },
        })
    }
}

/// Contents of an archived job's `meta.json`; also the body of a start request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(flatten)]
    pub base: BaseJob,
    pub start_time: i64,
    #[serde(default)]
    pub statistics: HashMap<String, JobStatistics>,
}

impl JobMeta {
    pub fn from_job(job: &Job) -> Self {
        JobMeta {
            id: Some(job.id),
            base: job.base.clone(),
            start_time: job.start_time,
            statistics: HashMap::new(),
        }
    }

    /// The job as it would look after being read back from the database.
    pub fn to_job(&self) -> Job {
        Job {
            id: self.id.unwrap_or_default(),
            base: self.base.clone(),
            start_time: self.start_time,
            footprint: JobFootprint::default(),
        }
    }

    pub fn stat_avg(&self, metric: &str) -> f64 {
        self.statistics.get(metric).map_or(0.0, |s| s.avg)
    }

    /// A new job row; footprint columns are filled from `statistics`.
    pub fn to_active_model(&self) -> Result<job::ActiveModel> {
        let b = &self.base;
        let meta_data = if b.meta_data.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&b.meta_data)?)
        };

        let mut model = job::ActiveModel {
            id: NotSet,
            job_id: Set(b.job_id),
            cluster: Set(b.cluster.clone()),
            subcluster: Set(b.sub_cluster.clone()),
            start_time: Set(self.start_time),
            user: Set(b.user.clone()),
            project: Set(b.project.clone()),
            partition: Set(b.partition.clone()),
            array_job_id: Set(b.array_job_id),
            duration: Set(b.duration),
            walltime: Set(b.walltime),
            job_state: Set(b.state.to_string()),
            meta_data: Set(meta_data),
            resources: Set(serde_json::to_string(&b.resources)?),
            num_nodes: Set(b.num_nodes),
            num_hwthreads: Set(b.num_hwthreads),
            num_acc: Set(b.num_acc),
            smt: Set(b.smt),
            exclusive: Set(b.exclusive),
            monitoring_status: Set(b.monitoring_status as i8),
            ..Default::default()
        };

        for (metric, stats) in &self.statistics {
            if let Some((col, v)) = footprint_column(metric, stats) {
                model.set(col, v.into());
            }
        }
        Ok(model)
    }
}

#[test]
fn test_job_state_roundtrip() {
    for state in ["running", "completed", "out_of_memory"] {
        let s: JobState = state.parse().unwrap();
        assert_eq!(s.to_string(), state);
        assert_eq!(serde_json::to_string(&s).unwrap(), format!("\"{state}\""));
    }
    assert!("out-of-memory".parse::<JobState>().is_err());
    assert!(!JobState::Running.is_terminal());
    assert!(JobState::Timeout.is_terminal());
}

#[test]
fn test_job_meta_defaults() {
    let meta: JobMeta = serde_json::from_str(
        r#"{"jobId": 1, "user": "u", "cluster": "c", "numNodes": 1, "startTime": 10,
            "resources": [{"hostname": "h1"}]}"#,
    )
    .unwrap();
    assert_eq!(meta.base.exclusive, 1);
    assert_eq!(meta.base.smt, 1);
    assert_eq!(meta.base.state, JobState::Running);
    assert_eq!(
        meta.base.monitoring_status,
        MonitoringStatus::RunningOrArchiving
    );
    assert_eq!(meta.base.resources[0].hwthreads, None);
    assert_eq!(meta.start_time, 10);
}
