use std::{collections::HashMap, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use serde::Serialize;
use tracing::debug;

use super::{Loaded, MetricDataRepository};
use crate::{
    clusters::ClusterRegistry,
    error::MonitorError,
    schema::{Float, Job, JobData, JobMetric, MetricScope, MetricStatistics, NodeData, Series},
};

#[derive(Debug, Serialize)]
struct FluxRequest<'a> {
    query: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    dialect: Dialect,
}

#[derive(Debug, Serialize)]
struct Dialect {
    header: bool,
    annotations: Vec<String>,
}

/// Client of the InfluxDB v2 Flux query API.
///
/// Samples are expected per node: the metric is the measurement, the host
/// the `hostname` tag and the sample the `value` field. Only node scope is
/// served.
pub struct InfluxDb {
    client: reqwest::Client,
    query_url: String,
    token: String,
    bucket: String,
    clusters: ClusterRegistry,
}

impl InfluxDb {
    pub fn new(
        client: reqwest::Client,
        url: &str,
        token: &str,
        bucket: &str,
        org: &str,
        skip_tls: bool,
        clusters: ClusterRegistry,
    ) -> Result<Self> {
        let base = url::Url::parse(url)
            .map_err(|e| anyhow::anyhow!("invalid influxdb url {url:?}: {e}"))?;
        let query_url = url::Url::parse_with_params(
            &format!("{}/api/v2/query", base.as_str().trim_end_matches('/')),
            &[("org", org)],
        )?;

        let client = if skip_tls {
            reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .timeout(Duration::from_secs(60))
                .build()?
        } else {
            client
        };

        Ok(Self {
            client,
            query_url: query_url.to_string(),
            token: token.to_string(),
            bucket: bucket.to_string(),
            clusters,
        })
    }

    fn flux_query(
        &self,
        metric: &str,
        hosts: &[String],
        timestep: i64,
        from: i64,
        to: i64,
    ) -> Result<String> {
        let hosts = hosts
            .iter()
            .map(|h| format!("r.hostname == \"{}\"", escape(h)))
            .collect::<Vec<_>>()
            .join(" or ");
        Ok(format!(
            r#"from(bucket: "{bucket}")
  |> range(start: {start}, stop: {stop})
  |> filter(fn: (r) => r._measurement == "{metric}" and r._field == "value")
  |> filter(fn: (r) => {hosts})
  |> aggregateWindow(every: {timestep}s, fn: mean, createEmpty: true)
  |> keep(columns: ["_time", "_value", "hostname"])"#,
            bucket = escape(&self.bucket),
            start = rfc3339(from)?,
            stop = rfc3339(to)?,
            metric = escape(metric),
            timestep = timestep.max(1),
        ))
    }

    /// host -> samples
    async fn query(&self, flux: &str) -> Result<HashMap<String, Vec<Float>>> {
        debug!("querying {} with flux:\n{flux}", self.query_url);
        let adapter_err = |e: reqwest::Error| MonitorError::Adapter(e.to_string());
        let body = self
            .client
            .post(&self.query_url)
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.token))
            .header(reqwest::header::ACCEPT, "application/csv")
            .json(&FluxRequest {
                query: flux,
                kind: "flux",
                dialect: Dialect {
                    header: true,
                    annotations: vec![],
                },
            })
            .send()
            .await
            .map_err(adapter_err)?
            .error_for_status()
            .map_err(adapter_err)?
            .text()
            .await
            .map_err(adapter_err)?;
        parse_csv(&body)
    }

    /// One node scope record of `metric` with a series per host, and the
    /// hosts that had no data.
    async fn load_metric(
        &self,
        cluster: &str,
        metric: &str,
        hosts: &[String],
        from: i64,
        to: i64,
    ) -> Result<(JobMetric, Vec<String>)> {
        let Some(mc) = self.clusters.metric_config(cluster, metric) else {
            return Err(MonitorError::Validation(format!(
                "metric {metric:?} is not configured for cluster {cluster}"
            ))
            .into());
        };

        let flux = self.flux_query(metric, hosts, mc.timestep, from, to)?;
        let mut samples = self.query(&flux).await?;

        let mut jm = JobMetric {
            unit: mc.unit.clone(),
            scope: MetricScope::Node,
            timestep: mc.timestep,
            statistics: None,
            series: vec![],
            statistics_series: None,
        };
        let mut missing = vec![];
        for host in hosts {
            match samples.remove(host) {
                Some(data) => jm.series.push(Series {
                    hostname: host.clone(),
                    id: None,
                    statistics: None,
                    data,
                }),
                None => missing.push(format!("{metric}: no data for host {host}")),
            }
        }
        jm.ensure_series_statistics();
        Ok((jm, missing))
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn rfc3339(unix: i64) -> Result<String> {
    DateTime::from_timestamp(unix, 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .ok_or_else(|| MonitorError::Validation(format!("timestamp {unix} out of range")).into())
}

/// Read a header-only (no annotations) flux CSV response. Every table
/// repeats its header; empty values are gaps.
fn parse_csv(body: &str) -> Result<HashMap<String, Vec<Float>>> {
    let invalid = |msg: String| MonitorError::Adapter(format!("invalid flux response: {msg}"));
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let position = |record: &csv::StringRecord, name: &str| record.iter().position(|f| f == name);
    let mut columns: Option<(usize, usize)> = None;
    let mut error_column: Option<usize> = None;
    let mut series: HashMap<String, Vec<Float>> = HashMap::new();

    for record in reader.records() {
        let record = record.map_err(|e| invalid(e.to_string()))?;
        if let Some(e) = error_column {
            let msg = record.get(e).unwrap_or_default();
            return Err(MonitorError::Adapter(format!("influxdb: {msg}")).into());
        }
        if let (Some(v), Some(h)) = (position(&record, "_value"), position(&record, "hostname")) {
            columns = Some((v, h));
            continue;
        }
        if let Some(e) = position(&record, "error") {
            error_column = Some(e);
            continue;
        }

        let Some((v, h)) = columns else {
            return Err(invalid("data before header".into()).into());
        };
        let (Some(value), Some(host)) = (record.get(v), record.get(h)) else {
            continue;
        };
        let sample = if value.is_empty() {
            Float::NAN
        } else {
            value
                .parse::<f64>()
                .map(Float)
                .map_err(|e| invalid(format!("{value:?}: {e}")))?
        };
        series.entry(host.to_string()).or_default().push(sample);
    }

    if error_column.is_some() {
        return Err(MonitorError::Adapter("influxdb reported an error without message".into()).into());
    }
    Ok(series)
}

#[async_trait]
impl MetricDataRepository for InfluxDb {
    async fn load_data(
        &self,
        job: &Job,
        metrics: &[String],
        scopes: &[MetricScope],
    ) -> Result<Loaded<JobData>> {
        let mut loaded = Loaded::<JobData>::default();
        if !scopes.contains(&MetricScope::Node) {
            debug!("influxdb serves node scope only, skipping {scopes:?}");
            return Ok(loaded);
        }

        let hosts: Vec<String> = job.hosts().into_iter().map(str::to_string).collect();
        if hosts.is_empty() {
            return Ok(loaded);
        }
        for metric in metrics {
            match self
                .load_metric(&job.cluster, metric, &hosts, job.start_time, job.end_time())
                .await
            {
                Ok((jm, missing)) => {
                    loaded.errors.extend(missing);
                    if !jm.series.is_empty() {
                        loaded
                            .data
                            .insert(metric.clone(), HashMap::from([(MetricScope::Node, jm)]));
                    }
                }
                Err(e) if matches!(MonitorError::of(&e), Some(MonitorError::Validation(_))) => {
                    return Err(e);
                }
                Err(e) => loaded.errors.push(format!("{metric}: {e:#}")),
            }
        }
        Ok(loaded)
    }

    async fn load_stats(
        &self,
        job: &Job,
        metrics: &[String],
    ) -> Result<HashMap<String, HashMap<String, MetricStatistics>>> {
        let loaded = self.load_data(job, metrics, &[MetricScope::Node]).await?;
        if loaded.data.is_empty() && loaded.is_partial() {
            return Err(MonitorError::Adapter(loaded.errors.join(", ")).into());
        }

        let mut stats = HashMap::new();
        for (metric, per_scope) in loaded.data.0 {
            let Some(jm) = per_scope.get(&MetricScope::Node) else {
                continue;
            };
            let per_host = jm
                .series
                .iter()
                .filter_map(|s| s.statistics.map(|st| (s.hostname.clone(), st)))
                .collect();
            stats.insert(metric, per_host);
        }
        Ok(stats)
    }

    async fn load_node_data(
        &self,
        cluster: &str,
        metrics: &[String],
        nodes: &[String],
        scopes: &[MetricScope],
        from: i64,
        to: i64,
    ) -> Result<Option<Loaded<NodeData>>> {
        if scopes.iter().any(|s| *s != MetricScope::Node) {
            return Ok(None);
        }

        let mut loaded = Loaded::<NodeData>::default();
        if nodes.is_empty() {
            return Ok(Some(loaded));
        }
        for metric in metrics {
            let (jm, missing) = match self.load_metric(cluster, metric, nodes, from, to).await {
                Ok(v) => v,
                Err(e) => {
                    loaded.errors.push(format!("{metric}: {e:#}"));
                    continue;
                }
            };
            loaded.errors.extend(missing);
            for s in &jm.series {
                let mut single = jm.clone();
                single.series = vec![s.clone()];
                loaded
                    .data
                    .entry(s.hostname.clone())
                    .or_default()
                    .entry(metric.clone())
                    .or_default()
                    .push(single);
            }
        }
        Ok(Some(loaded))
    }
}
