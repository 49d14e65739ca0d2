//! Shared types used by the Druid CRD

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Druid process role.
///
/// Declared in rollout precedence order: ingestion and compute tiers come
/// before the serving tiers so upgrades never start at the query path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeType {
    /// Serves segments from local cache
    Historical,
    /// Task management and locking
    Overlord,
    /// Runs ingestion tasks in forked peons
    MiddleManager,
    /// Runs ingestion tasks in-process
    Indexer,
    /// Query fan-out and merge
    Broker,
    /// Segment balancing and retention
    Coordinator,
    /// API gateway and web console
    Router,
}

impl NodeType {
    /// Every node type in rollout precedence order
    pub const PRECEDENCE: [NodeType; 7] = [
        NodeType::Historical,
        NodeType::Overlord,
        NodeType::MiddleManager,
        NodeType::Indexer,
        NodeType::Broker,
        NodeType::Coordinator,
        NodeType::Router,
    ];

    /// The value used in `spec.nodes.*.nodeType`
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Historical => "historical",
            NodeType::Overlord => "overlord",
            NodeType::MiddleManager => "middleManager",
            NodeType::Indexer => "indexer",
            NodeType::Broker => "broker",
            NodeType::Coordinator => "coordinator",
            NodeType::Router => "router",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeType::PRECEDENCE
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unrecognized node type '{s}'"))
    }
}

/// Workload kind backing a node-type-instance
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum WorkloadKind {
    /// Ordinal pods, each bound to its own PVCs
    #[default]
    StatefulSet,
    /// Interchangeable pods without volume claim templates
    Deployment,
}

/// Pod replacement strategy for the node's workload
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Replace pods automatically on template change
    #[default]
    RollingUpdate,
    /// Replace pods only when deleted (StatefulSet only)
    OnDelete,
}

/// Template for the PVCs of a StatefulSet node.
///
/// `annotations` and `volumeAttributesClassName` are immutable on a live
/// StatefulSet; changing them triggers the orphan-and-recreate migration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    /// Template name, the prefix of every PVC it creates
    pub name: String,

    /// Annotations carried onto each PVC
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Storage class for new PVCs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// VolumeAttributesClass applied to each PVC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_attributes_class_name: Option<String>,

    /// Requested size (e.g. "100Gi")
    pub storage: String,

    /// Access modes, defaults to ReadWriteOnce
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,

    /// Where the volume is mounted in the Druid container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
}

/// Binary and decimal suffixes of Kubernetes quantities, two-letter
/// suffixes first so "Mi" is not read as "M"
const QUANTITY_SUFFIXES: [(&str, f64); 14] = [
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
    ("", 1.0),
];

/// Parse a Kubernetes quantity such as "100Gi", "500M" or "1e3" into base
/// units. Returns `None` for anything that is not a non-negative quantity.
pub fn parse_quantity(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    QUANTITY_SUFFIXES.iter().find_map(|(suffix, factor)| {
        let number = quantity.strip_suffix(suffix)?;
        if number.is_empty() || number.ends_with(['e', 'E']) {
            return None;
        }
        let value: f64 = number.parse().ok()?;
        (value.is_finite() && value >= 0.0).then(|| value * factor)
    })
}

/// PodDisruptionBudget settings for a node
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionBudgetSpec {
    /// Minimum pods that must remain available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<i32>,
    /// Maximum pods that may be unavailable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,
}

/// HorizontalPodAutoscaler settings for a node
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerSpec {
    /// Lower replica bound
    #[serde(default = "default_min_replicas")]
    pub min_replicas: i32,
    /// Upper replica bound
    pub max_replicas: i32,
    /// Target average CPU utilization percentage
    #[serde(default = "default_cpu_target")]
    pub target_cpu_utilization: i32,
}

fn default_min_replicas() -> i32 {
    1
}

fn default_cpu_target() -> i32 {
    80
}

/// Ingress exposing a node's Druid port
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Host name routed to the node's Service
    pub host: String,
    /// Path prefix, defaults to "/"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// IngressClass to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}
