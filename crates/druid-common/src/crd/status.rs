//! Status sub-resource of the Druid CRD

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::ConditionStatus;
use crate::Error;

/// Node name used by the summary condition when every node is ready
pub const ALL_NODES: &str = "All";

/// Condition of a node-type-instance. Exactly one applies at a time.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum NodeConditionType {
    /// Workload exists and all replicas are ready
    Ready,
    /// Workload is being created, replaced or is not fully ready
    #[default]
    RollingUpdate,
    /// The last reconcile of this node failed
    Error,
}

/// Condition of one node-type-instance (or of the whole cluster when
/// `druid_node` is [`ALL_NODES`])
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DruidNodeTypeStatus {
    /// Node-type-instance key, or "All"
    pub druid_node: String,
    /// Kubernetes-style status of the condition
    pub druid_node_condition_status: ConditionStatus,
    /// Which condition applies
    pub druid_node_condition_type: NodeConditionType,
    /// Human-readable reason
    pub reason: String,
}

impl DruidNodeTypeStatus {
    /// Every node is ready
    pub fn all_ready() -> Self {
        Self {
            druid_node: ALL_NODES.to_string(),
            druid_node_condition_status: ConditionStatus::True,
            druid_node_condition_type: NodeConditionType::Ready,
            reason: "All Druid Nodes are in Ready Condition".to_string(),
        }
    }

    /// One node's workload is ready
    pub fn ready(node: impl Into<String>) -> Self {
        let node = node.into();
        Self {
            reason: format!("Druid Node [{node}] is Ready"),
            druid_node: node,
            druid_node_condition_status: ConditionStatus::True,
            druid_node_condition_type: NodeConditionType::Ready,
        }
    }

    /// One node is mid-rollout
    pub fn rolling_update(node: impl Into<String>) -> Self {
        let node = node.into();
        Self {
            reason: format!("Druid Node [{node}] is Rolling Update"),
            druid_node: node,
            druid_node_condition_status: ConditionStatus::True,
            druid_node_condition_type: NodeConditionType::RollingUpdate,
        }
    }

    /// One node failed to reconcile
    pub fn error(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            druid_node: node.into(),
            druid_node_condition_status: ConditionStatus::False,
            druid_node_condition_type: NodeConditionType::Error,
            reason: reason.into(),
        }
    }
}

/// Status for a Druid cluster.
///
/// Name lists are sorted so two statuses built from the same live objects
/// compare equal regardless of API list order.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DruidClusterStatus {
    /// Generation of the spec last processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Cluster-wide summary condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub druid_node_status: Option<DruidNodeTypeStatus>,

    /// Per node-type-instance condition, keyed by node key
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_conditions: BTreeMap<String, DruidNodeTypeStatus>,

    /// Live StatefulSets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stateful_sets: Vec<String>,

    /// Live Deployments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployments: Vec<String>,

    /// Live Services
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,

    /// Live ConfigMaps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_maps: Vec<String>,

    /// Live PodDisruptionBudgets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_disruption_budgets: Vec<String>,

    /// Live HorizontalPodAutoscalers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hp_auto_scalers: Vec<String>,

    /// Live Ingresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<String>,

    /// Pods of the cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<String>,

    /// PersistentVolumeClaims of the cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub persistent_volume_claims: Vec<String>,

    /// When status was last written by a reconcile pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_time: Option<DateTime<Utc>>,

    /// When status was last written by a pass that finished without errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_time: Option<DateTime<Utc>>,
}

impl DruidClusterStatus {
    /// Structural equality ignoring the write timestamps.
    ///
    /// Name lists are compared as sets so ordering differences never count
    /// as a change.
    pub fn equivalent(&self, other: &Self) -> bool {
        fn same_names(a: &[String], b: &[String]) -> bool {
            let mut a: Vec<&String> = a.iter().collect();
            let mut b: Vec<&String> = b.iter().collect();
            a.sort();
            b.sort();
            a == b
        }

        self.observed_generation == other.observed_generation
            && self.druid_node_status == other.druid_node_status
            && self.node_conditions == other.node_conditions
            && same_names(&self.stateful_sets, &other.stateful_sets)
            && same_names(&self.deployments, &other.deployments)
            && same_names(&self.services, &other.services)
            && same_names(&self.config_maps, &other.config_maps)
            && same_names(&self.pod_disruption_budgets, &other.pod_disruption_budgets)
            && same_names(&self.hp_auto_scalers, &other.hp_auto_scalers)
            && same_names(&self.ingress, &other.ingress)
            && same_names(&self.pods, &other.pods)
            && same_names(&self.persistent_volume_claims, &other.persistent_volume_claims)
    }

    /// True when the summary condition is Ready
    pub fn is_ready(&self) -> bool {
        self.druid_node_status
            .as_ref()
            .is_some_and(|s| s.druid_node_condition_type == NodeConditionType::Ready)
    }

    /// JSON merge patch (RFC 7386) that turns `previous` into `self`.
    ///
    /// Empty lists are not serialized, so a field or node condition that
    /// `previous` has and `self` lacks is sent as `null` to remove it.
    pub fn merge_patch_from(&self, previous: &Self) -> Result<Value, Error> {
        let to_value = |status: &Self| {
            serde_json::to_value(status)
                .map_err(|e| Error::serialization_for_kind("DruidClusterStatus", e.to_string()))
        };
        Ok(merge_diff(&to_value(previous)?, &to_value(self)?))
    }
}

fn merge_diff(from: &Value, to: &Value) -> Value {
    let (Value::Object(from), Value::Object(to)) = (from, to) else {
        return to.clone();
    };

    let mut patch = Map::new();
    for (key, old) in from {
        match to.get(key) {
            None => {
                patch.insert(key.clone(), Value::Null);
            }
            Some(new) if new != old => {
                patch.insert(key.clone(), merge_diff(old, new));
            }
            Some(_) => {}
        }
    }
    for (key, new) in to {
        if !from.contains_key(key) {
            patch.insert(key.clone(), new.clone());
        }
    }
    Value::Object(patch)
}
