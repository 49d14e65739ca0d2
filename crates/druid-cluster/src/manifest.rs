//! Rendering of a node-type-instance into child manifests
//!
//! The reconciler only depends on [`ManifestBuilder`]: it looks at the
//! kind and name of each manifest and at a StatefulSet's volume claim
//! templates. [`DefaultManifestBuilder`] is a plain rendering good enough
//! to run a cluster; deployments with richer pod needs plug in their own.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;

use druid_common::crd::{Druid, UpdateStrategy, VolumeClaimTemplate, WorkloadKind};
use druid_common::Error;

use crate::kinds::{ChildKind, ChildManifest};
use crate::ordering::ResolvedNode;

/// Directory holding `common.runtime.properties`
pub const COMMON_CONFIG_DIR: &str = "/opt/druid/conf/druid/cluster/_common";
/// Directory holding the node's `runtime.properties`
pub const NODE_CONFIG_DIR: &str = "/opt/druid/conf/druid/cluster/node";

/// Renders the child objects of one node-type-instance
pub trait ManifestBuilder: Send + Sync {
    /// Build every child manifest for `node`
    fn build(&self, cluster: &Druid, node: &ResolvedNode<'_>) -> Result<Vec<ChildManifest>, Error>;
}

/// Name of a node's ConfigMap
pub fn config_map_name(unique_name: &str) -> String {
    format!("{unique_name}-config")
}

/// Default rendering: ConfigMap, Service, workload, and optional
/// PodDisruptionBudget, HorizontalPodAutoscaler and Ingress
#[derive(Clone, Debug, Default)]
pub struct DefaultManifestBuilder;

impl ManifestBuilder for DefaultManifestBuilder {
    fn build(&self, cluster: &Druid, node: &ResolvedNode<'_>) -> Result<Vec<ChildManifest>, Error> {
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::manifest(node.key, "Druid object has no namespace"))?;
        let image = cluster
            .spec
            .image_for(node.spec)
            .ok_or_else(|| Error::manifest(node.key, "no image set on cluster or node"))?;

        let mut manifests = vec![
            ChildManifest::ConfigMap(config_map(cluster, node, &namespace)),
            ChildManifest::Service(from_manifest(
                node.key,
                ChildKind::Service,
                service(node, &namespace),
            )?),
        ];

        let pod_template = pod_template(node, image);
        match node.spec.kind {
            WorkloadKind::StatefulSet => manifests.push(ChildManifest::StatefulSet(
                from_manifest(
                    node.key,
                    ChildKind::StatefulSet,
                    stateful_set(node, &namespace, pod_template),
                )?,
            )),
            WorkloadKind::Deployment => manifests.push(ChildManifest::Deployment(from_manifest(
                node.key,
                ChildKind::Deployment,
                deployment(node, &namespace, pod_template),
            )?)),
        }

        if let Some(pdb) = &node.spec.pod_disruption_budget {
            let mut spec = json!({ "selector": { "matchLabels": node.labels } });
            if let Some(min) = pdb.min_available {
                spec["minAvailable"] = json!(min);
            }
            if let Some(max) = pdb.max_unavailable {
                spec["maxUnavailable"] = json!(max);
            }
            manifests.push(ChildManifest::PodDisruptionBudget(from_manifest(
                node.key,
                ChildKind::PodDisruptionBudget,
                json!({
                    "apiVersion": "policy/v1",
                    "kind": "PodDisruptionBudget",
                    "metadata": metadata(node, &node.unique_name, &namespace),
                    "spec": spec,
                }),
            )?));
        }

        if let Some(hpa) = &node.spec.autoscaler {
            let target_kind = match node.spec.kind {
                WorkloadKind::StatefulSet => "StatefulSet",
                WorkloadKind::Deployment => "Deployment",
            };
            manifests.push(ChildManifest::HorizontalPodAutoscaler(from_manifest(
                node.key,
                ChildKind::HorizontalPodAutoscaler,
                json!({
                    "apiVersion": "autoscaling/v2",
                    "kind": "HorizontalPodAutoscaler",
                    "metadata": metadata(node, &node.unique_name, &namespace),
                    "spec": {
                        "scaleTargetRef": {
                            "apiVersion": "apps/v1",
                            "kind": target_kind,
                            "name": node.unique_name,
                        },
                        "minReplicas": hpa.min_replicas,
                        "maxReplicas": hpa.max_replicas,
                        "metrics": [{
                            "type": "Resource",
                            "resource": {
                                "name": "cpu",
                                "target": {
                                    "type": "Utilization",
                                    "averageUtilization": hpa.target_cpu_utilization,
                                },
                            },
                        }],
                    },
                }),
            )?));
        }

        if let Some(ingress) = &node.spec.ingress {
            let mut spec = json!({
                "rules": [{
                    "host": ingress.host,
                    "http": {
                        "paths": [{
                            "path": ingress.path.as_deref().unwrap_or("/"),
                            "pathType": "Prefix",
                            "backend": {
                                "service": {
                                    "name": node.unique_name,
                                    "port": { "number": node.spec.druid_port },
                                },
                            },
                        }],
                    },
                }],
            });
            if let Some(class) = &ingress.ingress_class_name {
                spec["ingressClassName"] = json!(class);
            }
            manifests.push(ChildManifest::Ingress(from_manifest(
                node.key,
                ChildKind::Ingress,
                json!({
                    "apiVersion": "networking.k8s.io/v1",
                    "kind": "Ingress",
                    "metadata": metadata(node, &node.unique_name, &namespace),
                    "spec": spec,
                }),
            )?));
        }

        if let Some(owner) = cluster.controller_owner_ref(&()) {
            for manifest in &mut manifests {
                manifest.metadata_mut().owner_references = Some(vec![owner.clone()]);
            }
        }

        Ok(manifests)
    }
}

/// Build the PVC template a StatefulSet carries for `vct`.
///
/// Node labels are stamped on the template so every PVC it creates can be
/// found by `nodeSpecUniqueStr` and by the finalizer's `druid_cr` selector.
pub fn volume_claim_template(
    node: &ResolvedNode<'_>,
    vct: &VolumeClaimTemplate,
) -> PersistentVolumeClaim {
    let access_modes = if vct.access_modes.is_empty() {
        vec!["ReadWriteOnce".to_string()]
    } else {
        vct.access_modes.clone()
    };

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(vct.name.clone()),
            labels: Some(node.labels.clone()),
            annotations: (!vct.annotations.is_empty()).then(|| vct.annotations.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(access_modes),
            storage_class_name: vct.storage_class_name.clone(),
            volume_attributes_class_name: vct.volume_attributes_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(vct.storage.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn from_manifest<K: DeserializeOwned>(
    node: &str,
    kind: ChildKind,
    value: serde_json::Value,
) -> Result<K, Error> {
    serde_json::from_value(value).map_err(|e| {
        Error::serialization_for_kind(kind.as_str(), format!("node {node}: {e}"))
    })
}

fn metadata(node: &ResolvedNode<'_>, name: &str, namespace: &str) -> serde_json::Value {
    json!({
        "name": name,
        "namespace": namespace,
        "labels": node.labels,
    })
}

fn config_map(cluster: &Druid, node: &ResolvedNode<'_>, namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(&node.unique_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(node.labels.clone()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (
                "common.runtime.properties".to_string(),
                cluster.spec.common_runtime_properties.clone(),
            ),
            (
                "runtime.properties".to_string(),
                format!(
                    "druid.service=druid/{}\ndruid.plaintextPort={}\n{}",
                    node.node_type, node.spec.druid_port, node.spec.runtime_properties
                ),
            ),
        ])),
        ..Default::default()
    }
}

fn service(node: &ResolvedNode<'_>, namespace: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": metadata(node, &node.unique_name, namespace),
        "spec": {
            "selector": node.labels,
            "ports": [{
                "name": "druid",
                "port": node.spec.druid_port,
                "targetPort": node.spec.druid_port,
            }],
        },
    })
}

fn pod_template(node: &ResolvedNode<'_>, image: &str) -> serde_json::Value {
    let mut mounts = vec![
        json!({
            "name": "common-config",
            "mountPath": COMMON_CONFIG_DIR,
            "subPath": "common.runtime.properties",
        }),
        json!({
            "name": "node-config",
            "mountPath": format!("{NODE_CONFIG_DIR}/runtime.properties"),
            "subPath": "runtime.properties",
        }),
    ];
    for vct in &node.spec.volume_claim_templates {
        if let Some(path) = &vct.mount_path {
            mounts.push(json!({ "name": vct.name, "mountPath": path }));
        }
    }

    let config = config_map_name(&node.unique_name);
    json!({
        "metadata": { "labels": node.labels },
        "spec": {
            "containers": [{
                "name": "druid",
                "image": image,
                "args": [node.node_type.as_str()],
                "ports": [{ "name": "druid", "containerPort": node.spec.druid_port }],
                "volumeMounts": mounts,
            }],
            "volumes": [
                { "name": "common-config", "configMap": { "name": config } },
                { "name": "node-config", "configMap": { "name": config } },
            ],
        },
    })
}

/// Replica count to apply; left unset once an autoscaler owns the scale
fn applied_replicas(node: &ResolvedNode<'_>) -> Option<i32> {
    node.spec
        .autoscaler
        .is_none()
        .then_some(node.spec.replicas)
}

fn stateful_set(
    node: &ResolvedNode<'_>,
    namespace: &str,
    template: serde_json::Value,
) -> serde_json::Value {
    let strategy = match node.spec.update_strategy {
        UpdateStrategy::RollingUpdate => "RollingUpdate",
        UpdateStrategy::OnDelete => "OnDelete",
    };
    let claims: Vec<PersistentVolumeClaim> = node
        .spec
        .volume_claim_templates
        .iter()
        .map(|vct| volume_claim_template(node, vct))
        .collect();

    json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": metadata(node, &node.unique_name, namespace),
        "spec": {
            "replicas": applied_replicas(node),
            "serviceName": node.unique_name,
            "podManagementPolicy": "Parallel",
            "selector": { "matchLabels": node.labels },
            "updateStrategy": { "type": strategy },
            "template": template,
            "volumeClaimTemplates": claims,
        },
    })
}

fn deployment(
    node: &ResolvedNode<'_>,
    namespace: &str,
    template: serde_json::Value,
) -> serde_json::Value {
    let strategy = match node.spec.update_strategy {
        UpdateStrategy::RollingUpdate => "RollingUpdate",
        UpdateStrategy::OnDelete => "Recreate",
    };
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": metadata(node, &node.unique_name, namespace),
        "spec": {
            "replicas": applied_replicas(node),
            "selector": { "matchLabels": node.labels },
            "strategy": { "type": strategy },
            "template": template,
        },
    })
}
