//! Ownership labels stamped on every object the operator manages.
//!
//! The cluster label pair (`app=druid`, `druid_cr=<name>`) is the only
//! selector garbage collection and teardown use. `nodeSpecUniqueStr`
//! narrows it to one node-type-instance and is what ties a PVC back to
//! the StatefulSet that created it.

use std::collections::BTreeMap;

/// Application label key
pub const APP_LABEL: &str = "app";
/// Application label value
pub const APP_VALUE: &str = "druid";
/// Label key holding the owning Druid object's name
pub const CLUSTER_LABEL: &str = "druid_cr";
/// Label key holding the node-type-instance unique name
pub const NODE_LABEL: &str = "nodeSpecUniqueStr";
/// Label key holding the node role (broker, historical, ...)
pub const COMPONENT_LABEL: &str = "component";

/// Labels identifying every child of a Druid cluster
pub fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), APP_VALUE.to_string()),
        (CLUSTER_LABEL.to_string(), cluster.to_string()),
    ])
}

/// Unique name of a node-type-instance, also used as its workload name
pub fn node_unique_name(cluster: &str, key: &str) -> String {
    format!("druid-{cluster}-{key}")
}

/// Labels for the children of one node-type-instance
pub fn node_labels(cluster: &str, key: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster);
    labels.insert(NODE_LABEL.to_string(), node_unique_name(cluster, key));
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());
    labels
}

/// Render a label map as a Kubernetes equality selector (`a=b,c=d`)
pub fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Selector matching every child of a Druid cluster
pub fn cluster_selector(cluster: &str) -> String {
    selector(&cluster_labels(cluster))
}

/// Selector matching the PVCs guarded by the deletion finalizer
pub fn pvc_finalizer_selector(cluster: &str) -> String {
    format!("{CLUSTER_LABEL}={cluster}")
}

/// Selector matching the children of one node-type-instance
pub fn node_selector(unique_name: &str) -> String {
    format!("{NODE_LABEL}={unique_name}")
}
