use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Loaded, MetricDataRepository};
use crate::{
    clusters::ClusterRegistry,
    error::MonitorError,
    schema::{
        Float, Job, JobData, JobMetric, MetricConfig, MetricScope, MetricStatistics, NodeData,
        Series, Topology,
    },
};

#[derive(Debug, Serialize)]
struct ApiQueryRequest<'a> {
    cluster: &'a str,
    from: i64,
    to: i64,
    #[serde(rename = "with-stats")]
    with_stats: bool,
    #[serde(rename = "with-data")]
    with_data: bool,
    queries: &'a [ApiQuery],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ApiQuery {
    metric: String,
    #[serde(rename = "host")]
    hostname: String,
    #[serde(rename = "aggreg")]
    aggregate: bool,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
    #[serde(rename = "type-ids", skip_serializing_if = "Option::is_none")]
    type_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ApiQueryResponse {
    #[serde(default)]
    results: Vec<Vec<ApiMetricData>>,
}

#[derive(Debug, Deserialize)]
struct ApiMetricData {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Vec<Float>,
    #[serde(default)]
    avg: Float,
    #[serde(default)]
    min: Float,
    #[serde(default)]
    max: Float,
}

impl ApiMetricData {
    fn statistics(&self) -> MetricStatistics {
        MetricStatistics {
            avg: self.avg.0,
            min: self.min.0,
            max: self.max.0,
        }
    }
}

/// Where the results of one query end up.
#[derive(Debug, Clone, PartialEq)]
struct Target {
    metric: String,
    scope: MetricScope,
    hostname: String,
    /// one per expected result; `None` for node level series
    ids: Vec<Option<String>>,
}

/// Client of the cc-metric-store `/api/query` endpoint.
pub struct CcMetricStore {
    client: reqwest::Client,
    query_url: String,
    token: String,
    renamings: HashMap<String, String>,
    clusters: ClusterRegistry,
}

impl CcMetricStore {
    pub fn new(
        client: reqwest::Client,
        url: &str,
        token: &str,
        renamings: HashMap<String, String>,
        clusters: ClusterRegistry,
    ) -> Result<Self> {
        let base = url::Url::parse(url)
            .map_err(|e| anyhow::anyhow!("invalid cc-metric-store url {url:?}: {e}"))?;
        Ok(Self {
            client,
            query_url: format!("{}/api/query", base.as_str().trim_end_matches('/')),
            token: token.to_string(),
            renamings,
            clusters,
        })
    }

    fn remote_name(&self, metric: &str) -> String {
        self.renamings
            .get(metric)
            .cloned()
            .unwrap_or_else(|| metric.to_string())
    }

    async fn query(&self, req: &ApiQueryRequest<'_>) -> Result<ApiQueryResponse> {
        debug!(
            "querying {} with {} queries for cluster {}",
            self.query_url,
            req.queries.len(),
            req.cluster
        );
        let adapter_err = |e: reqwest::Error| MonitorError::Adapter(e.to_string());
        let resp = self
            .client
            .post(&self.query_url)
            .bearer_auth(&self.token)
            .json(req)
            .send()
            .await
            .map_err(adapter_err)?
            .error_for_status()
            .map_err(adapter_err)?
            .json::<ApiQueryResponse>()
            .await
            .map_err(adapter_err)?;

        if resp.results.len() != req.queries.len() {
            return Err(MonitorError::Adapter(format!(
                "expected {} results, got {}",
                req.queries.len(),
                resp.results.len()
            ))
            .into());
        }
        Ok(resp)
    }

    fn topology(&self, job: &Job) -> Result<Topology> {
        self.clusters
            .get(&job.cluster)
            .and_then(|c| c.sub_cluster(&job.sub_cluster))
            .map(|sc| sc.topology.clone())
            .ok_or_else(|| {
                MonitorError::Adapter(format!(
                    "no topology for {}/{}",
                    job.cluster, job.sub_cluster
                ))
                .into()
            })
    }

    fn build_queries(
        &self,
        job: &Job,
        metrics: &[String],
        scopes: &[MetricScope],
    ) -> Result<(Vec<ApiQuery>, Vec<Target>)> {
        let topology = self.topology(job)?;
        let mut queries = vec![];
        let mut targets = vec![];

        for metric in metrics {
            let Some(mc) = self.clusters.metric_config(&job.cluster, metric) else {
                return Err(MonitorError::Validation(format!(
                    "metric {metric:?} is not configured for cluster {}",
                    job.cluster
                ))
                .into());
            };
            let remote = self.remote_name(metric);

            for resource in &job.resources {
                let hwthreads = resource
                    .hwthreads
                    .clone()
                    .unwrap_or_else(|| topology.node.clone());
                let accelerators = resource.accelerators.clone().unwrap_or_default();

                for &scope in scopes {
                    let Some((query, ids)) =
                        derive_query(&topology, mc.scope, scope, &hwthreads, &accelerators)
                    else {
                        continue;
                    };
                    for (kind, type_ids, aggregate, ids) in query_parts(query, ids) {
                        queries.push(ApiQuery {
                            metric: remote.clone(),
                            hostname: resource.hostname.clone(),
                            aggregate,
                            kind,
                            type_ids,
                        });
                        targets.push(Target {
                            metric: metric.clone(),
                            scope,
                            hostname: resource.hostname.clone(),
                            ids,
                        });
                    }
                }
            }
        }

        Ok((queries, targets))
    }
}

/// How native units of a host are queried to produce series at a requested scope.
#[derive(Debug, Clone, PartialEq)]
enum Derived {
    /// One series for the whole node, aggregated from native units when given.
    Node { aggregate_from: Option<(&'static str, Vec<String>)> },
    /// One series per native unit.
    Units { kind: &'static str },
    /// One aggregated series per group of native units.
    Groups { kind: &'static str },
}

/// Type name the store uses for a native scope.
fn store_type(scope: MetricScope) -> Option<&'static str> {
    match scope {
        MetricScope::Node => None,
        MetricScope::Socket => Some("socket"),
        MetricScope::MemoryDomain => Some("memoryDomain"),
        MetricScope::Core => Some("core"),
        MetricScope::HwThread => Some("hwthread"),
        MetricScope::Accelerator => Some("accelerator"),
    }
}

/// Decide how to fetch `scope` from data measured at `native`. Returns `None`
/// when the requested scope is finer than what is measured, or cannot be
/// derived. The second value lists (series id, native type ids) groups.
fn derive_query(
    topology: &Topology,
    native: MetricScope,
    scope: MetricScope,
    hwthreads: &[i32],
    accelerators: &[String],
) -> Option<(Derived, Vec<(Option<String>, Vec<String>)>)> {
    let ids_of = |v: &[i32]| v.iter().map(|i| i.to_string()).collect::<Vec<_>>();

    if native == MetricScope::Accelerator {
        let acc_ids: Vec<String> = accelerators
            .iter()
            .map(|a| {
                topology
                    .accelerator_index(a)
                    .map_or_else(|| a.clone(), |i| i.to_string())
            })
            .collect();
        if acc_ids.is_empty() {
            return None;
        }
        return match scope {
            MetricScope::Accelerator => Some((
                Derived::Units {
                    kind: "accelerator",
                },
                acc_ids.iter().map(|id| (Some(id.clone()), vec![id.clone()])).collect(),
            )),
            MetricScope::Node => Some((
                Derived::Node {
                    aggregate_from: Some(("accelerator", acc_ids)),
                },
                vec![(None, vec![])],
            )),
            _ => None,
        };
    }
    if scope == MetricScope::Accelerator {
        return None;
    }

    if scope.granularity() < native.granularity() {
        return None;
    }

    let kind = store_type(native);
    if scope == MetricScope::Node {
        return Some(match kind {
            None => (Derived::Node { aggregate_from: None }, vec![(None, vec![])]),
            Some(kind) => {
                let units = match native {
                    MetricScope::HwThread => ids_of(hwthreads),
                    _ => topology
                        .touched(native, hwthreads)
                        .into_iter()
                        .map(|(id, _)| id.to_string())
                        .collect(),
                };
                (
                    Derived::Node {
                        aggregate_from: Some((kind, units)),
                    },
                    vec![(None, vec![])],
                )
            }
        });
    }
    let kind = kind?;

    if scope == native {
        let units: Vec<String> = match native {
            MetricScope::HwThread => ids_of(hwthreads),
            _ => topology
                .touched(native, hwthreads)
                .into_iter()
                .map(|(id, _)| id.to_string())
                .collect(),
        };
        return Some((
            Derived::Units { kind },
            units.into_iter().map(|u| (Some(u.clone()), vec![u])).collect(),
        ));
    }

    let groups = topology
        .group(native, scope, hwthreads)
        .into_iter()
        .map(|(target, natives)| (Some(target.to_string()), ids_of(natives.as_slice())))
        .collect();
    Some((Derived::Groups { kind }, groups))
}

/// Split a derived query into store queries: (type, type ids, aggregate, series ids).
fn query_parts(
    derived: Derived,
    groups: Vec<(Option<String>, Vec<String>)>,
) -> Vec<(Option<&'static str>, Option<Vec<String>>, bool, Vec<Option<String>>)> {
    match derived {
        Derived::Node {
            aggregate_from: None,
        } => vec![(None, None, false, vec![None])],
        Derived::Node {
            aggregate_from: Some((kind, units)),
        } => vec![(Some(kind), Some(units), true, vec![None])],
        Derived::Units { kind } => {
            let (ids, type_ids): (Vec<_>, Vec<_>) = groups
                .into_iter()
                .map(|(id, mut natives)| (id, natives.pop().unwrap_or_default()))
                .unzip();
            vec![(Some(kind), Some(type_ids), false, ids)]
        }
        Derived::Groups { kind } => groups
            .into_iter()
            .map(|(id, natives)| (Some(kind), Some(natives), true, vec![id]))
            .collect(),
    }
}

fn new_metric(mc: &MetricConfig, scope: MetricScope) -> JobMetric {
    JobMetric {
        unit: mc.unit.clone(),
        scope,
        timestep: mc.timestep,
        statistics: None,
        series: vec![],
        statistics_series: None,
    }
}

/// Place the store's results into job data following the query targets.
fn assemble(
    clusters: &ClusterRegistry,
    cluster: &str,
    targets: &[Target],
    results: Vec<Vec<ApiMetricData>>,
) -> Loaded<JobData> {
    let mut loaded = Loaded::<JobData>::default();
    for (target, rows) in targets.iter().zip(results) {
        let Some(mc) = clusters.metric_config(cluster, &target.metric) else {
            continue;
        };
        for (row, id) in rows.into_iter().zip(target.ids.iter()) {
            if let Some(err) = &row.error {
                loaded.errors.push(format!(
                    "{}/{}/{}: {err}",
                    target.metric, target.hostname, target.scope
                ));
                continue;
            }
            let statistics = row.statistics();
            loaded
                .data
                .entry(target.metric.clone())
                .or_default()
                .entry(target.scope)
                .or_insert_with(|| new_metric(mc, target.scope))
                .series
                .push(Series {
                    hostname: target.hostname.clone(),
                    id: id.clone(),
                    statistics: Some(statistics),
                    data: row.data,
                });
        }
    }
    loaded
}

#[async_trait]
impl MetricDataRepository for CcMetricStore {
    async fn load_data(
        &self,
        job: &Job,
        metrics: &[String],
        scopes: &[MetricScope],
    ) -> Result<Loaded<JobData>> {
        let (queries, targets) = self.build_queries(job, metrics, scopes)?;
        if queries.is_empty() {
            return Ok(Loaded::default());
        }
        let resp = self
            .query(&ApiQueryRequest {
                cluster: &job.cluster,
                from: job.start_time,
                to: job.end_time(),
                with_stats: true,
                with_data: true,
                queries: &queries,
            })
            .await?;
        Ok(assemble(&self.clusters, &job.cluster, &targets, resp.results))
    }

    async fn load_stats(
        &self,
        job: &Job,
        metrics: &[String],
    ) -> Result<HashMap<String, HashMap<String, MetricStatistics>>> {
        let (queries, targets) = self.build_queries(job, metrics, &[MetricScope::Node])?;
        if queries.is_empty() {
            return Ok(HashMap::new());
        }
        let resp = self
            .query(&ApiQueryRequest {
                cluster: &job.cluster,
                from: job.start_time,
                to: job.end_time(),
                with_stats: true,
                with_data: false,
                queries: &queries,
            })
            .await?;

        let mut stats: HashMap<String, HashMap<String, MetricStatistics>> = HashMap::new();
        for (target, rows) in targets.iter().zip(resp.results) {
            let Some(row) = rows.into_iter().next() else {
                continue;
            };
            if let Some(err) = row.error {
                return Err(MonitorError::Adapter(format!(
                    "{}/{}: {err}",
                    target.metric, target.hostname
                ))
                .into());
            }
            stats
                .entry(target.metric.clone())
                .or_default()
                .insert(target.hostname.clone(), row.statistics());
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

        let mut queries = vec![];
        let mut targets = vec![];
        for node in nodes {
            for metric in metrics {
                queries.push(ApiQuery {
                    metric: self.remote_name(metric),
                    hostname: node.clone(),
                    aggregate: false,
                    kind: None,
                    type_ids: None,
                });
                targets.push(Target {
                    metric: metric.clone(),
                    scope: MetricScope::Node,
                    hostname: node.clone(),
                    ids: vec![None],
                });
            }
        }
        if queries.is_empty() {
            return Ok(Some(Loaded::default()));
        }

        let resp = self
            .query(&ApiQueryRequest {
                cluster,
                from,
                to,
                with_stats: true,
                with_data: true,
                queries: &queries,
            })
            .await?;

        let jobdata = assemble(&self.clusters, cluster, &targets, resp.results);
        let mut data: NodeData = HashMap::new();
        for (metric, per_scope) in jobdata.data.0 {
            let Some(jm) = per_scope.get(&MetricScope::Node) else {
                continue;
            };
            for s in &jm.series {
                let mut single = jm.clone();
                single.series = vec![s.clone()];
                data.entry(s.hostname.clone())
                    .or_default()
                    .entry(metric.clone())
                    .or_default()
                    .push(single);
            }
        }
        Ok(Some(Loaded {
            data,
            errors: jobdata.errors,
        }))
    }
}
