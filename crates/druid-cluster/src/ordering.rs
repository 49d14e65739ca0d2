//! Desired-state resolution: turn the node map into an ordered rollout plan

use std::collections::BTreeMap;

use druid_common::crd::{DruidNodeSpec, DruidSpec, NodeType};
use druid_common::labels;
use druid_common::Error;

/// One node-type-instance, ready to be rendered and applied
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedNode<'a> {
    /// Key in `spec.nodes`
    pub key: &'a str,
    /// Parsed role
    pub node_type: NodeType,
    /// `druid-<cluster>-<key>`: workload name and `nodeSpecUniqueStr` label
    pub unique_name: String,
    /// Labels for every child of this node
    pub labels: BTreeMap<String, String>,
    /// The node's spec
    pub spec: &'a DruidNodeSpec,
}

/// Order the cluster's nodes by role precedence, then by key.
///
/// Historicals roll first and routers last so ingestion and compute tiers
/// are updated before the query path. Fails on the first node whose type
/// is not recognized.
pub fn resolve<'a>(cluster: &str, spec: &'a DruidSpec) -> Result<Vec<ResolvedNode<'a>>, Error> {
    let mut nodes = spec
        .nodes
        .iter()
        .map(|(key, node)| {
            let node_type = node.parsed_node_type().map_err(|e| {
                Error::validation_for_field(cluster, format!("spec.nodes.{key}.nodeType"), e)
            })?;
            Ok(ResolvedNode {
                key: key.as_str(),
                node_type,
                unique_name: labels::node_unique_name(cluster, key),
                labels: labels::node_labels(cluster, key, node_type.as_str()),
                spec: node,
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    nodes.sort_by(|a, b| (a.node_type, a.key).cmp(&(b.node_type, b.key)));
    Ok(nodes)
}
