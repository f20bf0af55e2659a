use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::MetricScope;
use crate::metricdata::MetricDataConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub metric_data_repository: Option<MetricDataConfig>,
    #[serde(default)]
    pub metric_config: Vec<MetricConfig>,
    #[serde(default)]
    pub sub_clusters: Vec<SubCluster>,
    #[serde(default)]
    pub filter_ranges: FilterRanges,
}

impl Cluster {
    pub fn metric_names(&self) -> Vec<String> {
        self.metric_config.iter().map(|m| m.name.clone()).collect()
    }

    pub fn metric_config(&self, metric: &str) -> Option<&MetricConfig> {
        self.metric_config.iter().find(|m| m.name == metric)
    }

    pub fn sub_cluster(&self, name: &str) -> Option<&SubCluster> {
        self.sub_clusters.iter().find(|s| s.name == name)
    }

    /// Sub cluster a host belongs to; a cluster with one sub cluster owns all hosts.
    pub fn sub_cluster_of(&self, hostname: &str) -> Option<&SubCluster> {
        if self.sub_clusters.len() == 1 {
            return self.sub_clusters.first();
        }
        self.sub_clusters.iter().find(|s| s.nodes.contains(hostname))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricConfig {
    pub name: String,
    pub unit: String,
    pub scope: MetricScope,
    pub timestep: i64,
    #[serde(default)]
    pub peak: f64,
    #[serde(default)]
    pub normal: f64,
    #[serde(default)]
    pub caution: f64,
    #[serde(default)]
    pub alert: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SubCluster {
    pub name: String,
    pub nodes: NodeList,
    pub processor_type: String,
    pub sockets_per_node: i32,
    pub cores_per_socket: i32,
    pub threads_per_core: i32,
    pub flop_rate_scalar: f64,
    pub flop_rate_simd: f64,
    pub memory_bandwidth: f64,
    pub topology: Topology,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Accelerator {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub model: String,
}

/// Hardware topology of one node, every unit listed by the hwthreads it contains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Topology {
    pub node: Vec<i32>,
    pub socket: Vec<Vec<i32>>,
    pub memory_domain: Vec<Vec<i32>>,
    pub die: Vec<Vec<i32>>,
    pub core: Vec<Vec<i32>>,
    pub accelerators: Vec<Accelerator>,
}

impl Topology {
    /// The units of `scope` as (type id, hwthreads). Node is a single unit with id 0,
    /// hwthreads are addressed by their own number.
    pub fn units(&self, scope: MetricScope) -> Vec<(i32, Vec<i32>)> {
        let indexed = |v: &Vec<Vec<i32>>| {
            v.iter()
                .enumerate()
                .map(|(i, h)| (i as i32, h.clone()))
                .collect()
        };
        match scope {
            MetricScope::Node => vec![(0, self.node.clone())],
            MetricScope::Socket => indexed(&self.socket),
            MetricScope::MemoryDomain => indexed(&self.memory_domain),
            MetricScope::Core => indexed(&self.core),
            MetricScope::HwThread => self.node.iter().map(|h| (*h, vec![*h])).collect(),
            MetricScope::Accelerator => vec![],
        }
    }

    /// Units of `scope` that overlap the given hwthreads.
    pub fn touched(&self, scope: MetricScope, hwthreads: &[i32]) -> Vec<(i32, Vec<i32>)> {
        self.units(scope)
            .into_iter()
            .filter(|(_, hw)| hw.iter().any(|h| hwthreads.contains(h)))
            .collect()
    }

    /// Group the `native` units touched by `hwthreads` by the coarser `target` unit they belong to.
    pub fn group(
        &self,
        native: MetricScope,
        target: MetricScope,
        hwthreads: &[i32],
    ) -> Vec<(i32, Vec<i32>)> {
        let natives = self.touched(native, hwthreads);
        self.touched(target, hwthreads)
            .into_iter()
            .filter_map(|(tid, thw)| {
                let ids: Vec<i32> = natives
                    .iter()
                    .filter(|(_, hw)| hw.first().is_some_and(|h| thw.contains(h)))
                    .map(|(id, _)| *id)
                    .collect();
                (!ids.is_empty()).then_some((tid, ids))
            })
            .collect()
    }

    pub fn accelerator_index(&self, id: &str) -> Option<i32> {
        self.accelerators
            .iter()
            .position(|a| a.id == id)
            .map(|i| i as i32)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IntRange {
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Ranges the job list filters offer; consumed by query layers, not by this crate.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterRanges {
    pub num_nodes: IntRange,
    pub duration: IntRange,
    pub start_time: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeTerm {
    Host(String),
    Range {
        prefix: String,
        suffix: String,
        /// inclusive bounds and zero padded width
        spans: Vec<(u64, u64, usize)>,
    },
}

/// A hostlist expression like `host1,host2,rack[01-04,08]x`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeList {
    raw: String,
    terms: Vec<NodeTerm>,
}

impl NodeList {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut terms = vec![];
        for term in split_top_level(raw) {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            let Some(open) = term.find('[') else {
                terms.push(NodeTerm::Host(term.to_string()));
                continue;
            };
            let close = term
                .find(']')
                .filter(|c| *c > open)
                .ok_or(anyhow!("unbalanced brackets in node list term {term:?}"))?;

            let mut spans = vec![];
            for span in term[open + 1..close].split(',') {
                let (lo, hi) = span.split_once('-').unwrap_or((span, span));
                let width = if lo.starts_with('0') { lo.len() } else { 0 };
                let lo: u64 = lo
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid range in {term:?}"))?;
                let hi: u64 = hi
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid range in {term:?}"))?;
                spans.push((lo, hi, width));
            }
            terms.push(NodeTerm::Range {
                prefix: term[..open].to_string(),
                suffix: term[close + 1..].to_string(),
                spans,
            });
        }

        Ok(NodeList {
            raw: raw.to_string(),
            terms,
        })
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.terms.iter().any(|t| match t {
            NodeTerm::Host(h) => h == hostname,
            NodeTerm::Range {
                prefix,
                suffix,
                spans,
            } => hostname
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_suffix(suffix.as_str()))
                .filter(|num| !num.is_empty() && num.bytes().all(|b| b.is_ascii_digit()))
                .is_some_and(|num| {
                    let Ok(n) = num.parse::<u64>() else {
                        return false;
                    };
                    spans.iter().any(|(lo, hi, width)| {
                        (*lo..=*hi).contains(&n) && (*width == 0 || num.len() == *width)
                    })
                }),
        })
    }

    pub fn expand(&self) -> Vec<String> {
        let mut out = vec![];
        for t in &self.terms {
            match t {
                NodeTerm::Host(h) => out.push(h.clone()),
                NodeTerm::Range {
                    prefix,
                    suffix,
                    spans,
                } => {
                    for &(lo, hi, width) in spans {
                        for n in lo..=hi {
                            out.push(format!("{prefix}{n:0width$}{suffix}"));
                        }
                    }
                }
            }
        }
        out
    }
}

fn split_top_level(raw: &str) -> Vec<&str> {
    let (mut parts, mut depth, mut start) = (vec![], 0i32, 0usize);
    for (i, c) in raw.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

impl Serialize for NodeList {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for NodeList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NodeList::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[test]
fn test_node_list() {
    let nl = NodeList::parse("host120,host121,rack[01-04,08]x,f[7-9]").unwrap();
    assert!(nl.contains("host120"));
    assert!(!nl.contains("host122"));
    assert!(nl.contains("rack03x"));
    assert!(nl.contains("rack08x"));
    assert!(!nl.contains("rack3x"));
    assert!(!nl.contains("rack05x"));
    assert!(nl.contains("f8"));
    assert!(!nl.contains("f10"));
    assert_eq!(nl.expand().len(), 2 + 5 + 3);
    assert_eq!(nl.expand()[2], "rack01x");

    assert!(NodeList::parse("a[1-2").is_err());
}

#[test]
fn test_topology_group() {
    let topo = Topology {
        node: (0..8).collect(),
        socket: vec![(0..4).collect(), (4..8).collect()],
        core: (0..4).map(|c| vec![c * 2, c * 2 + 1]).collect(),
        ..Default::default()
    };

    // hwthreads 2..6 touch cores 1 and 2, sockets 0 and 1
    let hw = [2, 3, 4, 5];
    let cores = topo.touched(MetricScope::Core, &hw);
    assert_eq!(cores.iter().map(|c| c.0).collect::<Vec<_>>(), vec![1, 2]);

    let by_socket = topo.group(MetricScope::HwThread, MetricScope::Socket, &hw);
    assert_eq!(by_socket, vec![(0, vec![2, 3]), (1, vec![4, 5])]);

    let by_node = topo.group(MetricScope::Core, MetricScope::Node, &hw);
    assert_eq!(by_node, vec![(0, vec![1, 2])]);
}
