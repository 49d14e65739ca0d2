//! Druid Custom Resource Definition
//!
//! A `Druid` object describes one Apache Druid cluster: a map of
//! independently scaled node-type-instances plus cluster-wide settings.

use std::collections::{BTreeMap, BTreeSet};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::DruidClusterStatus;
use super::types::{
    parse_quantity, AutoscalerSpec, DisruptionBudgetSpec, IngressSpec, NodeType, UpdateStrategy,
    VolumeClaimTemplate, WorkloadKind,
};
use crate::Error;

/// Default Druid HTTP port
pub const DEFAULT_DRUID_PORT: i32 = 8088;

/// Longest node key that still yields a valid `druid-<cluster>-<key>` name
const MAX_NODE_KEY_LEN: usize = 40;

/// Specification for a Druid cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "druid.apache.org",
    version = "v1alpha1",
    kind = "Druid",
    plural = "druids",
    shortname = "druid",
    status = "DruidClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.druidNodeStatus.druidNode"}"#,
    printcolumn = r#"{"name":"Condition","type":"string","jsonPath":".status.druidNodeStatus.druidNodeConditionType"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DruidSpec {
    /// Default image for every node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Contents of `common.runtime.properties`, shared by all nodes
    #[serde(default)]
    pub common_runtime_properties: String,

    /// Node-type-instances keyed by a unique name (e.g. "brokers")
    pub nodes: BTreeMap<String, DruidNodeSpec>,

    /// Keep PVCs when the Druid object is deleted
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_pvc_deletion_finalizer: bool,

    /// Leave the annotations and VolumeAttributesClass of existing PVCs as they are
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_pvc_updates: bool,

    /// Ignore annotation changes on volume claim templates
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_pvc_annotation_update: bool,

    /// Roll out one node at a time: once the cluster exists, a node is only
    /// applied after every node before it has fully rolled out
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rolling_deploy: bool,

    /// Grow existing PVCs when a volume claim template asks for more storage.
    /// The template's StorageClass must allow volume expansion.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub scale_pvc_sts: bool,
}

/// Desired configuration of one node-type-instance
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DruidNodeSpec {
    /// Druid role (historical, overlord, middleManager, indexer, broker,
    /// coordinator, router)
    pub node_type: String,

    /// Workload kind
    #[serde(default)]
    pub kind: WorkloadKind,

    /// Desired replica count
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Image override for this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Druid HTTP port
    #[serde(default = "default_druid_port")]
    pub druid_port: i32,

    /// Contents of this node's `runtime.properties`
    #[serde(default)]
    pub runtime_properties: String,

    /// PVC templates (StatefulSet only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,

    /// Optional PodDisruptionBudget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_disruption_budget: Option<DisruptionBudgetSpec>,

    /// Optional HorizontalPodAutoscaler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaler: Option<AutoscalerSpec>,

    /// Optional Ingress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,

    /// Pod replacement strategy
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
}

fn default_replicas() -> i32 {
    1
}

fn default_druid_port() -> i32 {
    DEFAULT_DRUID_PORT
}

impl DruidNodeSpec {
    /// Parse the node type
    pub fn parsed_node_type(&self) -> Result<NodeType, String> {
        self.node_type.parse()
    }

    /// Returns true if this node runs as a StatefulSet
    pub fn is_stateful(&self) -> bool {
        self.kind == WorkloadKind::StatefulSet
    }
}

impl DruidSpec {
    /// Image for a node: the node's own, else the cluster default
    pub fn image_for<'a>(&'a self, node: &'a DruidNodeSpec) -> Option<&'a str> {
        node.image.as_deref().or(self.image.as_deref())
    }

    /// Validate the cluster specification
    pub fn validate(&self, cluster: &str) -> Result<(), Error> {
        if self.nodes.is_empty() {
            return Err(Error::validation_for_field(
                cluster,
                "spec.nodes",
                "at least one node is required",
            ));
        }

        for (key, node) in &self.nodes {
            let field = |suffix: &str| format!("spec.nodes.{key}{suffix}");

            if key.len() > MAX_NODE_KEY_LEN {
                return Err(Error::validation_for_field(
                    cluster,
                    field(""),
                    format!("node key must be at most {MAX_NODE_KEY_LEN} characters"),
                ));
            }
            validate_dns_identifier(key)
                .map_err(|e| Error::validation_for_field(cluster, field(""), e))?;

            node.parsed_node_type()
                .map_err(|e| Error::validation_for_field(cluster, field(".nodeType"), e))?;

            if self.image_for(node).is_none_or(str::is_empty) {
                return Err(Error::validation_for_field(
                    cluster,
                    field(".image"),
                    "image must be set on the cluster or the node",
                ));
            }

            if node.replicas < 0 {
                return Err(Error::validation_for_field(
                    cluster,
                    field(".replicas"),
                    "replicas cannot be negative",
                ));
            }

            if !node.is_stateful() && !node.volume_claim_templates.is_empty() {
                return Err(Error::validation_for_field(
                    cluster,
                    field(".volumeClaimTemplates"),
                    "volume claim templates require kind StatefulSet",
                ));
            }

            let mut seen = BTreeSet::new();
            for vct in &node.volume_claim_templates {
                validate_dns_identifier(&vct.name).map_err(|e| {
                    Error::validation_for_field(cluster, field(".volumeClaimTemplates"), e)
                })?;
                if !seen.insert(vct.name.as_str()) {
                    return Err(Error::validation_for_field(
                        cluster,
                        field(".volumeClaimTemplates"),
                        format!("duplicate volume claim template '{}'", vct.name),
                    ));
                }
                if parse_quantity(&vct.storage).is_none() {
                    return Err(Error::validation_for_field(
                        cluster,
                        field(".volumeClaimTemplates"),
                        format!(
                            "volume claim template '{}' has invalid storage '{}'",
                            vct.name, vct.storage
                        ),
                    ));
                }
            }

            if let Some(pdb) = &node.pod_disruption_budget {
                if pdb.min_available.is_some() == pdb.max_unavailable.is_some() {
                    return Err(Error::validation_for_field(
                        cluster,
                        field(".podDisruptionBudget"),
                        "exactly one of minAvailable and maxUnavailable must be set",
                    ));
                }
            }

            if let Some(hpa) = &node.autoscaler {
                if hpa.min_replicas > hpa.max_replicas {
                    return Err(Error::validation_for_field(
                        cluster,
                        field(".autoscaler"),
                        "minReplicas cannot exceed maxReplicas",
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Validate a DNS-style identifier (lowercase alphanumeric with hyphens,
/// starting with a letter, not ending with a hyphen).
fn validate_dns_identifier(s: &str) -> Result<(), String> {
    let mut chars = s.chars();

    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        None => return Err("identifier cannot be empty".to_string()),
        _ => return Err(format!("identifier must start with lowercase letter: {s}")),
    }

    if chars.any(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-') {
        return Err(format!(
            "identifier must be lowercase alphanumeric with hyphens: {s}"
        ));
    }

    if s.ends_with('-') {
        return Err(format!("identifier cannot end with hyphen: {s}"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(node_type: &str) -> DruidNodeSpec {
        DruidNodeSpec {
            node_type: node_type.to_string(),
            kind: WorkloadKind::StatefulSet,
            replicas: 1,
            image: None,
            druid_port: DEFAULT_DRUID_PORT,
            runtime_properties: String::new(),
            volume_claim_templates: vec![],
            pod_disruption_budget: None,
            autoscaler: None,
            ingress: None,
            update_strategy: UpdateStrategy::RollingUpdate,
        }
    }

    fn spec(nodes: Vec<(&str, DruidNodeSpec)>) -> DruidSpec {
        DruidSpec {
            image: Some("apache/druid:30.0.0".to_string()),
            common_runtime_properties: String::new(),
            nodes: nodes
                .into_iter()
                .map(|(k, n)| (k.to_string(), n))
                .collect(),
            ..Default::default()
        }
    }

    fn field_of(err: Error) -> Option<String> {
        match err {
            Error::Validation { field, .. } => field,
            other => panic!("Expected Validation variant, got {other:?}"),
        }
    }

    #[test]
    fn valid_spec_passes() {
        let s = spec(vec![("brokers", node("broker")), ("historicals", node("historical"))]);
        assert!(s.validate("wiki").is_ok());
    }

    #[test]
    fn empty_nodes_rejected() {
        let err = spec(vec![]).validate("wiki").unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("spec.nodes"));
    }

    #[test]
    fn unknown_node_type_rejected() {
        let err = spec(vec![("q", node("querier"))]).validate("wiki").unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("spec.nodes.q.nodeType"));
    }

    #[test]
    fn bad_node_key_rejected() {
        for key in ["Brokers", "1brokers", "brokers-", "bro_kers"] {
            let err = spec(vec![(key, node("broker"))]).validate("wiki").unwrap_err();
            assert_eq!(field_of(err), Some(format!("spec.nodes.{key}")));
        }
    }

    #[test]
    fn image_required_somewhere() {
        let mut s = spec(vec![("brokers", node("broker"))]);
        s.image = None;
        let err = s.validate("wiki").unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("spec.nodes.brokers.image"));

        if let Some(n) = s.nodes.get_mut("brokers") {
            n.image = Some("apache/druid:30.0.0".to_string());
        }
        assert!(s.validate("wiki").is_ok());
    }

    #[test]
    fn duplicate_volume_templates_rejected() {
        let mut n = node("historical");
        let vct = VolumeClaimTemplate {
            name: "segment-cache".to_string(),
            storage: "10Gi".to_string(),
            ..Default::default()
        };
        n.volume_claim_templates = vec![vct.clone(), vct];
        let err = spec(vec![("historicals", n)]).validate("wiki").unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn deployment_with_volume_templates_rejected() {
        let mut n = node("broker");
        n.kind = WorkloadKind::Deployment;
        n.volume_claim_templates = vec![VolumeClaimTemplate {
            name: "data".to_string(),
            storage: "1Gi".to_string(),
            ..Default::default()
        }];
        assert!(spec(vec![("brokers", n)]).validate("wiki").is_err());
    }

    #[test]
    fn unparseable_storage_rejected() {
        let mut n = node("historical");
        n.volume_claim_templates = vec![VolumeClaimTemplate {
            name: "segment-cache".to_string(),
            storage: "lots".to_string(),
            ..Default::default()
        }];
        let err = spec(vec![("historicals", n)]).validate("wiki").unwrap_err();
        assert!(err.to_string().contains("invalid storage 'lots'"));
    }

    #[test]
    fn pdb_and_autoscaler_bounds() {
        let mut n = node("broker");
        n.pod_disruption_budget = Some(DisruptionBudgetSpec {
            min_available: Some(1),
            max_unavailable: Some(1),
        });
        assert!(spec(vec![("brokers", n.clone())]).validate("wiki").is_err());

        n.pod_disruption_budget = None;
        n.autoscaler = Some(AutoscalerSpec {
            min_replicas: 5,
            max_replicas: 2,
            target_cpu_utilization: 80,
        });
        assert!(spec(vec![("brokers", n)]).validate("wiki").is_err());
    }

    #[test]
    fn crd_deserializes_with_defaults() {
        let yaml = r#"
apiVersion: druid.apache.org/v1alpha1
kind: Druid
metadata:
  name: wiki
  namespace: druid
spec:
  image: apache/druid:30.0.0
  nodes:
    brokers:
      nodeType: broker
      kind: Deployment
    historicals:
      nodeType: historical
      replicas: 3
      volumeClaimTemplates:
        - name: segment-cache
          storage: 100Gi
          volumeAttributesClassName: fast
"#;
        let druid: Druid = serde_yaml::from_str(yaml).expect("valid Druid");
        let brokers = &druid.spec.nodes["brokers"];
        assert_eq!(brokers.kind, WorkloadKind::Deployment);
        assert_eq!(brokers.replicas, 1);
        assert_eq!(brokers.druid_port, DEFAULT_DRUID_PORT);

        let historicals = &druid.spec.nodes["historicals"];
        assert!(historicals.is_stateful());
        assert_eq!(
            historicals.volume_claim_templates[0]
                .volume_attributes_class_name
                .as_deref(),
            Some("fast")
        );
        assert!(!druid.spec.disable_pvc_deletion_finalizer);
        assert!(!druid.spec.rolling_deploy);
        assert!(!druid.spec.scale_pvc_sts);
        assert!(druid.spec.validate("wiki").is_ok());
    }
}
