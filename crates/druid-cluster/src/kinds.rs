//! The seven child object kinds a Druid cluster owns.
//!
//! `ChildKind` is the closed set the garbage collector walks; adding a kind
//! means adding a variant and the compiler points at every `match` that
//! must learn about it.

use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use druid_common::crd::DruidClusterStatus;

/// Kind of a child object managed for a Druid cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChildKind {
    /// apps/v1 StatefulSet
    StatefulSet,
    /// apps/v1 Deployment
    Deployment,
    /// v1 Service
    Service,
    /// v1 ConfigMap
    ConfigMap,
    /// policy/v1 PodDisruptionBudget
    PodDisruptionBudget,
    /// autoscaling/v2 HorizontalPodAutoscaler
    HorizontalPodAutoscaler,
    /// networking.k8s.io/v1 Ingress
    Ingress,
}

impl ChildKind {
    /// Every kind, in the order the controller reports them
    pub const ALL: [ChildKind; 7] = [
        ChildKind::StatefulSet,
        ChildKind::Deployment,
        ChildKind::Service,
        ChildKind::ConfigMap,
        ChildKind::PodDisruptionBudget,
        ChildKind::HorizontalPodAutoscaler,
        ChildKind::Ingress,
    ];

    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildKind::StatefulSet => "StatefulSet",
            ChildKind::Deployment => "Deployment",
            ChildKind::Service => "Service",
            ChildKind::ConfigMap => "ConfigMap",
            ChildKind::PodDisruptionBudget => "PodDisruptionBudget",
            ChildKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            ChildKind::Ingress => "Ingress",
        }
    }

    /// The status field recording live names of this kind
    pub fn status_names(self, status: &DruidClusterStatus) -> &Vec<String> {
        match self {
            ChildKind::StatefulSet => &status.stateful_sets,
            ChildKind::Deployment => &status.deployments,
            ChildKind::Service => &status.services,
            ChildKind::ConfigMap => &status.config_maps,
            ChildKind::PodDisruptionBudget => &status.pod_disruption_budgets,
            ChildKind::HorizontalPodAutoscaler => &status.hp_auto_scalers,
            ChildKind::Ingress => &status.ingress,
        }
    }

    /// Mutable access to the status field recording live names of this kind
    pub fn status_names_mut(self, status: &mut DruidClusterStatus) -> &mut Vec<String> {
        match self {
            ChildKind::StatefulSet => &mut status.stateful_sets,
            ChildKind::Deployment => &mut status.deployments,
            ChildKind::Service => &mut status.services,
            ChildKind::ConfigMap => &mut status.config_maps,
            ChildKind::PodDisruptionBudget => &mut status.pod_disruption_budgets,
            ChildKind::HorizontalPodAutoscaler => &mut status.hp_auto_scalers,
            ChildKind::Ingress => &mut status.ingress,
        }
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deletion propagation for child deletes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cascade {
    /// Delete dependents in the background
    Background,
    /// Leave dependents (pods, PVCs) in place
    Orphan,
}

/// A rendered child object ready to be applied
#[derive(Clone, Debug, PartialEq)]
pub enum ChildManifest {
    /// StatefulSet workload
    StatefulSet(StatefulSet),
    /// Deployment workload
    Deployment(Deployment),
    /// Service
    Service(Service),
    /// ConfigMap
    ConfigMap(ConfigMap),
    /// PodDisruptionBudget
    PodDisruptionBudget(PodDisruptionBudget),
    /// HorizontalPodAutoscaler
    HorizontalPodAutoscaler(HorizontalPodAutoscaler),
    /// Ingress
    Ingress(Ingress),
}

impl ChildManifest {
    /// Kind of the wrapped object
    pub fn kind(&self) -> ChildKind {
        match self {
            ChildManifest::StatefulSet(_) => ChildKind::StatefulSet,
            ChildManifest::Deployment(_) => ChildKind::Deployment,
            ChildManifest::Service(_) => ChildKind::Service,
            ChildManifest::ConfigMap(_) => ChildKind::ConfigMap,
            ChildManifest::PodDisruptionBudget(_) => ChildKind::PodDisruptionBudget,
            ChildManifest::HorizontalPodAutoscaler(_) => ChildKind::HorizontalPodAutoscaler,
            ChildManifest::Ingress(_) => ChildKind::Ingress,
        }
    }

    /// Name of the wrapped object
    pub fn name(&self) -> String {
        match self {
            ChildManifest::StatefulSet(o) => o.name_any(),
            ChildManifest::Deployment(o) => o.name_any(),
            ChildManifest::Service(o) => o.name_any(),
            ChildManifest::ConfigMap(o) => o.name_any(),
            ChildManifest::PodDisruptionBudget(o) => o.name_any(),
            ChildManifest::HorizontalPodAutoscaler(o) => o.name_any(),
            ChildManifest::Ingress(o) => o.name_any(),
        }
    }

    /// Mutable metadata of the wrapped object
    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ChildManifest::StatefulSet(o) => o.meta_mut(),
            ChildManifest::Deployment(o) => o.meta_mut(),
            ChildManifest::Service(o) => o.meta_mut(),
            ChildManifest::ConfigMap(o) => o.meta_mut(),
            ChildManifest::PodDisruptionBudget(o) => o.meta_mut(),
            ChildManifest::HorizontalPodAutoscaler(o) => o.meta_mut(),
            ChildManifest::Ingress(o) => o.meta_mut(),
        }
    }

    /// The StatefulSet, if this is one
    pub fn as_stateful_set(&self) -> Option<&StatefulSet> {
        match self {
            ChildManifest::StatefulSet(sts) => Some(sts),
            _ => None,
        }
    }
}
