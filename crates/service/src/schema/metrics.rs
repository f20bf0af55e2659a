use std::{
    collections::HashMap,
    fmt::Display,
    ops::{Deref, DerefMut},
    str::FromStr,
};

use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A sample value. NaN marks a gap and is encoded as JSON `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Float(pub f64);

impl Float {
    pub const NAN: Float = Float(f64::NAN);

    pub fn is_nan(&self) -> bool {
        self.0.is_nan()
    }
}

impl PartialEq for Float {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0 || (self.0.is_nan() && other.0.is_nan())
    }
}

impl From<f64> for Float {
    fn from(v: f64) -> Self {
        Float(v)
    }
}

impl Serialize for Float {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_f64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Float {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Float(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN)))
    }
}

/// Serde helper for plain `f64` fields that may hold NaN.
pub mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if v.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_f64(*v)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// Granularity at which a metric is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricScope {
    #[serde(rename = "node")]
    Node,
    #[serde(rename = "socket")]
    Socket,
    #[serde(rename = "memoryDomain")]
    MemoryDomain,
    #[serde(rename = "core")]
    Core,
    #[serde(rename = "hwthread")]
    HwThread,
    #[serde(rename = "accelerator")]
    Accelerator,
}

impl MetricScope {
    /// Higher means coarser.
    pub fn granularity(&self) -> u8 {
        match self {
            MetricScope::Node => 10,
            MetricScope::Socket => 5,
            MetricScope::MemoryDomain => 3,
            MetricScope::Core => 2,
            MetricScope::HwThread => 1,
            MetricScope::Accelerator => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricScope::Node => "node",
            MetricScope::Socket => "socket",
            MetricScope::MemoryDomain => "memoryDomain",
            MetricScope::Core => "core",
            MetricScope::HwThread => "hwthread",
            MetricScope::Accelerator => "accelerator",
        }
    }
}

impl Display for MetricScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "node" => MetricScope::Node,
            "socket" => MetricScope::Socket,
            "memoryDomain" => MetricScope::MemoryDomain,
            "core" => MetricScope::Core,
            "hwthread" => MetricScope::HwThread,
            "accelerator" => MetricScope::Accelerator,
            other => anyhow::bail!("unknown metric scope {other:?}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricStatistics {
    #[serde(with = "nan_as_null")]
    pub avg: f64,
    #[serde(with = "nan_as_null")]
    pub min: f64,
    #[serde(with = "nan_as_null")]
    pub max: f64,
}

impl MetricStatistics {
    /// Statistics over the non-NaN samples; all NaN when there are none.
    pub fn from_samples(data: &[Float]) -> Self {
        let (mut min, mut max, mut sum, mut n) = (f64::MAX, f64::MIN, 0.0, 0usize);
        for x in data.iter().filter(|x| !x.is_nan()) {
            min = min.min(x.0);
            max = max.max(x.0);
            sum += x.0;
            n += 1;
        }
        if n == 0 {
            return MetricStatistics {
                avg: f64::NAN,
                min: f64::NAN,
                max: f64::NAN,
            };
        }
        MetricStatistics {
            avg: sum / n as f64,
            min,
            max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Series {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<MetricStatistics>,
    pub data: Vec<Float>,
}

/// Per-timestep min/mean/max across all series of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatsSeries {
    pub mean: Vec<Float>,
    pub min: Vec<Float>,
    pub max: Vec<Float>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetric {
    pub unit: String,
    pub scope: MetricScope,
    pub timestep: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<MetricStatistics>,
    pub series: Vec<Series>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics_series: Option<StatsSeries>,
}

/// Fewer non-NaN values than this at a timestep yield NaN in the statistics series.
const MIN_VALUES_PER_TIMESTEP: usize = 3;

impl JobMetric {
    pub fn add_statistics_series(&mut self) {
        if self.statistics_series.is_some() || self.series.len() <= MIN_VALUES_PER_TIMESTEP {
            return;
        }

        let n = self.series.iter().map(|s| s.data.len()).max().unwrap_or(0);
        let mut stats = StatsSeries {
            mean: Vec::with_capacity(n),
            min: Vec::with_capacity(n),
            max: Vec::with_capacity(n),
        };

        for i in 0..n {
            let (mut smin, mut smax, mut sum, mut count) = (f64::MAX, f64::MIN, 0.0, 0usize);
            for x in self.series.iter().filter_map(|s| s.data.get(i)) {
                if x.is_nan() {
                    continue;
                }
                smin = smin.min(x.0);
                smax = smax.max(x.0);
                sum += x.0;
                count += 1;
            }

            if count < MIN_VALUES_PER_TIMESTEP {
                stats.min.push(Float::NAN);
                stats.mean.push(Float::NAN);
                stats.max.push(Float::NAN);
            } else {
                stats.min.push(Float(smin));
                stats.mean.push(Float(sum / count as f64));
                stats.max.push(Float(smax));
            }
        }

        self.statistics_series = Some(stats);
    }

    /// Fill in missing per-series statistics from the samples.
    pub fn ensure_series_statistics(&mut self) {
        for s in self.series.iter_mut().filter(|s| s.statistics.is_none()) {
            s.statistics = Some(MetricStatistics::from_samples(&s.data));
        }
    }

    fn size(&self) -> usize {
        let samples: usize = self.series.iter().map(|s| s.data.len()).sum();
        let stats = self
            .statistics_series
            .as_ref()
            .map_or(0, |s| s.mean.len() * 3);
        (samples + stats) * size_of::<Float>() + self.series.len() * 64 + 64
    }
}

/// metric name -> scope -> data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct JobData(pub HashMap<String, HashMap<MetricScope, JobMetric>>);

impl Deref for JobData {
    type Target = HashMap<String, HashMap<MetricScope, JobMetric>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for JobData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl JobData {
    /// Approximate memory footprint in bytes, used as cache weight.
    pub fn size(&self) -> usize {
        self.0
            .iter()
            .map(|(name, scopes)| name.len() + scopes.values().map(|m| m.size()).sum::<usize>())
            .sum()
    }

    /// Derive a node scope view of `metric` from the coarsest scope that is
    /// finer than node, summing the series of each host. Returns false if the
    /// metric is missing or already present at node scope.
    pub fn add_node_scope(&mut self, metric: &str) -> bool {
        let Some(scopes) = self.0.get_mut(metric) else {
            return false;
        };
        if scopes.contains_key(&MetricScope::Node) {
            return false;
        }
        let Some(source) = scopes
            .keys()
            .copied()
            .max_by_key(|s| s.granularity())
            .and_then(|s| scopes.get(&s))
        else {
            return false;
        };

        let mut hosts: Vec<(&str, Vec<&Series>)> = Vec::new();
        for s in &source.series {
            match hosts.iter_mut().find(|(h, _)| *h == s.hostname) {
                Some((_, list)) => list.push(s),
                None => hosts.push((&s.hostname, vec![s])),
            }
        }

        let mut node = JobMetric {
            unit: source.unit.clone(),
            scope: MetricScope::Node,
            timestep: source.timestep,
            statistics: None,
            series: Vec::with_capacity(hosts.len()),
            statistics_series: None,
        };

        for (hostname, series) in hosts {
            let statistics = if series.iter().all(|s| s.statistics.is_some()) {
                let mut st = MetricStatistics {
                    avg: 0.0,
                    min: f64::MAX,
                    max: f64::MIN,
                };
                for s in series.iter().filter_map(|s| s.statistics) {
                    st.avg += s.avg;
                    st.min = st.min.min(s.min);
                    st.max = st.max.max(s.max);
                }
                st
            } else {
                MetricStatistics {
                    avg: f64::NAN,
                    min: f64::NAN,
                    max: f64::NAN,
                }
            };

            let n = series.iter().map(|s| s.data.len()).min().unwrap_or(0);
            let data = (0..n)
                .map(|i| Float(series.iter().map(|s| s.data[i].0).sum()))
                .collect();

            node.series.push(Series {
                hostname: hostname.to_string(),
                id: None,
                statistics: Some(statistics),
                data,
            });
        }

        scopes.insert(MetricScope::Node, node);
        true
    }
}

/// host -> metric -> data at the requested scopes
pub type NodeData = HashMap<String, HashMap<String, Vec<JobMetric>>>;

#[cfg(test)]
pub(crate) fn test_metric(scope: MetricScope, series: Vec<(&str, Option<&str>, Vec<f64>)>) -> JobMetric {
    JobMetric {
        unit: "load".to_string(),
        scope,
        timestep: 60,
        statistics: None,
        series: series
            .into_iter()
            .map(|(host, id, data)| Series {
                hostname: host.to_string(),
                id: id.map(str::to_string),
                statistics: None,
                data: data.into_iter().map(Float).collect(),
            })
            .collect(),
        statistics_series: None,
    }
}

#[test]
fn test_float_nan_is_null() {
    let data = vec![Float(1.5), Float::NAN, Float(2.0)];
    let s = serde_json::to_string(&data).unwrap();
    assert_eq!(s, "[1.5,null,2.0]");
    let back: Vec<Float> = serde_json::from_str(&s).unwrap();
    assert_eq!(back, data);
    assert!(back[1].is_nan());
}

#[test]
fn test_statistics_series() {
    let series = (0..20)
        .map(|i| {
            let v = i as f64;
            let third = if i == 0 { f64::NAN } else { v * 3.0 };
            (format!("host{i}"), vec![v, v * 2.0, third])
        })
        .collect::<Vec<_>>();
    let mut jm = test_metric(
        MetricScope::Node,
        series
            .iter()
            .map(|(h, d)| (h.as_str(), None, d.clone()))
            .collect(),
    );
    jm.add_statistics_series();

    let stats = jm.statistics_series.as_ref().unwrap();
    assert_eq!(stats.min, vec![Float(0.0), Float(0.0), Float(3.0)]);
    assert_eq!(stats.max, vec![Float(19.0), Float(38.0), Float(57.0)]);
    assert_eq!(stats.mean[0], Float(9.5));
    assert_eq!(stats.mean[1], Float(19.0));
    // host0's NaN is skipped: mean of 3..=57 step 3
    assert_eq!(stats.mean[2], Float(30.0));
}

#[test]
fn test_statistics_series_needs_enough_values() {
    let mut jm = test_metric(
        MetricScope::Node,
        vec![
            ("a", None, vec![1.0, f64::NAN]),
            ("b", None, vec![1.0, f64::NAN]),
            ("c", None, vec![1.0, 1.0]),
            ("d", None, vec![1.0, f64::NAN]),
        ],
    );
    jm.add_statistics_series();
    let stats = jm.statistics_series.unwrap();
    assert_eq!(stats.mean[0], Float(1.0));
    assert!(stats.mean[1].is_nan());
}

#[test]
fn test_add_node_scope() {
    let mut core = test_metric(
        MetricScope::Core,
        vec![
            ("h1", Some("0"), vec![1.0, 2.0]),
            ("h1", Some("1"), vec![3.0, 4.0]),
            ("h2", Some("0"), vec![5.0, 6.0]),
        ],
    );
    core.ensure_series_statistics();
    let mut jd = JobData::default();
    jd.insert(
        "flops_any".to_string(),
        HashMap::from([(MetricScope::Core, core)]),
    );

    assert!(jd.add_node_scope("flops_any"));
    assert!(!jd.add_node_scope("flops_any"));
    assert!(!jd.add_node_scope("mem_bw"));

    let node = &jd["flops_any"][&MetricScope::Node];
    assert_eq!(node.series.len(), 2);
    let h1 = node.series.iter().find(|s| s.hostname == "h1").unwrap();
    assert_eq!(h1.data, vec![Float(4.0), Float(6.0)]);
    let st = h1.statistics.unwrap();
    assert_eq!((st.avg, st.min, st.max), (5.0, 1.0, 4.0));
}
