use poem::{Result, web::Data};
use poem_openapi::{
    OpenApi,
    param::{Path, Query},
    payload::Json,
};
use serde_json::Value;
use service::{logic::types::StopJobRequest, schema::MetricScope, state::AppContext};

use crate::error::{anyhow_into_error, bad_request};

pub mod types {
    use std::collections::HashMap;

    use anyhow::Result;
    use poem_openapi::{ApiResponse, Object, payload::Json};
    use serde::{Deserialize, Serialize};
    use service::schema::{BaseJob, JobMeta, MonitoringStatus, Resource, Tag};

    fn default_exclusive() -> i8 {
        1
    }

    fn default_smt() -> i8 {
        1
    }

    fn default_monitoring_status() -> i8 {
        MonitoringStatus::RunningOrArchiving as i8
    }

    #[derive(Object, Serialize, Deserialize)]
    pub struct TagReq {
        #[oai(rename = "type")]
        pub tag_type: String,
        pub name: String,
    }

    #[derive(Object, Serialize, Deserialize)]
    pub struct ResourceReq {
        pub hostname: String,
        pub hwthreads: Option<Vec<i32>>,
        pub accelerators: Option<Vec<String>>,
        pub configuration: Option<String>,
    }

    #[derive(Object, Serialize, Deserialize)]
    #[oai(rename_all = "camelCase")]
    pub struct StartJobReq {
        pub job_id: i64,
        pub user: String,
        #[oai(default)]
        pub project: String,
        pub cluster: String,
        #[oai(default)]
        pub sub_cluster: String,
        #[oai(default)]
        pub partition: String,
        #[oai(default)]
        pub array_job_id: i64,
        pub num_nodes: i32,
        #[oai(rename = "numHwthreads", default)]
        pub num_hwthreads: i32,
        #[oai(default)]
        pub num_acc: i32,
        #[oai(default = "default_exclusive", validator(minimum(value = "0"), maximum(value = "2")))]
        pub exclusive: i8,
        #[oai(
            default = "default_monitoring_status",
            validator(minimum(value = "0"), maximum(value = "3"))
        )]
        pub monitoring_status: i8,
        #[oai(default = "default_smt", validator(minimum(value = "0"), maximum(value = "1")))]
        pub smt: i8,
        /// seconds
        #[oai(default)]
        pub walltime: i64,
        #[oai(default)]
        pub tags: Vec<TagReq>,
        pub resources: Vec<ResourceReq>,
        #[oai(default)]
        pub meta_data: HashMap<String, String>,
        /// unix seconds
        pub start_time: i64,
    }

    impl StartJobReq {
        pub fn into_job_meta(self) -> Result<JobMeta> {
            Ok(JobMeta {
                id: None,
                start_time: self.start_time,
                statistics: HashMap::new(),
                base: BaseJob {
                    job_id: self.job_id,
                    user: self.user,
                    project: self.project,
                    cluster: self.cluster,
                    sub_cluster: self.sub_cluster,
                    partition: self.partition,
                    array_job_id: self.array_job_id,
                    num_nodes: self.num_nodes,
                    num_hwthreads: self.num_hwthreads,
                    num_acc: self.num_acc,
                    exclusive: self.exclusive,
                    monitoring_status: MonitoringStatus::try_from(self.monitoring_status)?,
                    smt: self.smt,
                    walltime: self.walltime,
                    tags: self
                        .tags
                        .into_iter()
                        .map(|t| Tag {
                            id: None,
                            tag_type: t.tag_type,
                            name: t.name,
                        })
                        .collect(),
                    resources: self
                        .resources
                        .into_iter()
                        .map(|r| Resource {
                            hostname: r.hostname,
                            hwthreads: r.hwthreads,
                            accelerators: r.accelerators,
                            configuration: r.configuration,
                        })
                        .collect(),
                    meta_data: self.meta_data,
                    ..Default::default()
                },
            })
        }
    }

    #[derive(Object, Serialize, Deserialize)]
    pub struct StartJobResp {
        pub id: i64,
    }

    #[derive(ApiResponse)]
    pub enum StartJobResponse {
        /// the job was recorded
        #[oai(status = 201)]
        Created(Json<StartJobResp>),
    }

    #[derive(Object, Serialize, Deserialize)]
    #[oai(rename_all = "camelCase")]
    pub struct StopJobReq {
        pub job_id: i64,
        pub cluster: String,
        /// tells apart jobs whose id the scheduler reused
        pub start_time: Option<i64>,
        /// completed, failed, cancelled, stopped, timeout, preempted or out_of_memory
        pub job_state: Option<String>,
        pub stop_time: i64,
    }
}

fn to_json<T: serde::Serialize>(v: &T) -> Result<Json<Value>> {
    serde_json::to_value(v)
        .map(Json)
        .map_err(|e| anyhow_into_error(e.into()))
}

pub struct JobApi;

#[OpenApi(prefix_path = "/jobs", tag = super::Tag::Job)]
impl JobApi {
    /// Record a job that has just started
    #[oai(path = "/start_job", method = "post")]
    pub async fn start_job(
        &self,
        state: Data<&AppContext>,
        Json(req): Json<types::StartJobReq>,
    ) -> Result<types::StartJobResponse> {
        let meta = req
            .into_job_meta()
            .map_err(|e| bad_request(format!("{e:#}")))?;
        let id = state
            .service()
            .job
            .start(meta)
            .await
            .map_err(anyhow_into_error)?;
        Ok(types::StartJobResponse::Created(Json(types::StartJobResp {
            id,
        })))
    }

    /// Mark a running job as finished; its data is archived in the background
    #[oai(path = "/stop_job", method = "post")]
    pub async fn stop_job(
        &self,
        state: Data<&AppContext>,
        Json(req): Json<types::StopJobReq>,
    ) -> Result<Json<Value>> {
        let job_state = req
            .job_state
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|e: anyhow::Error| bad_request(format!("{e:#}")))?;

        let job = state
            .service()
            .job
            .stop(StopJobRequest {
                job_id: req.job_id,
                cluster: req.cluster,
                start_time: req.start_time,
                state: job_state,
                stop_time: req.stop_time,
            })
            .await
            .map_err(anyhow_into_error)?;
        to_json(&job)
    }

    #[oai(path = "/:id", method = "get")]
    pub async fn get_job(&self, state: Data<&AppContext>, Path(id): Path<i64>) -> Result<Json<Value>> {
        let svc = state.service();
        let mut job = svc.job.find_by_id(id).await.map_err(anyhow_into_error)?;
        svc.job
            .fetch_metadata(&mut job)
            .await
            .map_err(anyhow_into_error)?;
        job.tags = svc.tag.get_job_tags(id).await.map_err(anyhow_into_error)?;
        to_json(&job)
    }

    /// Metric data of a job, from the live repository or from the archive
    #[oai(path = "/:id/metrics", method = "get")]
    pub async fn job_metrics(
        &self,
        state: Data<&AppContext>,
        Path(id): Path<i64>,
        Query(metric): Query<Option<Vec<String>>>,
        Query(scope): Query<Option<Vec<String>>>,
    ) -> Result<Json<Value>> {
        let scopes = scope
            .map(|v| {
                v.iter()
                    .map(|s| s.parse::<MetricScope>())
                    .collect::<anyhow::Result<Vec<_>>>()
            })
            .transpose()
            .map_err(|e| bad_request(format!("{e:#}")))?;

        let svc = state.service();
        let job = svc.job.find_by_id(id).await.map_err(anyhow_into_error)?;
        let data = svc
            .metric_data
            .load_data(&job, metric.as_deref(), scopes.as_deref())
            .await
            .map_err(anyhow_into_error)?;
        to_json(&*data)
    }
}
