//! Multi-pass reconcile stories against an in-memory API server
//!
//! `FakeApi` keeps objects in maps and mimics the parts of the API server
//! the controller relies on: StatefulSets create one PVC per template and
//! ordinal, reject changes to `volumeClaimTemplates`, and report every
//! replica ready unless the workload is marked stalled.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus, StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;

use druid_cluster::{
    reconcile, Cascade, ChildKind, ChildManifest, Context, KubeClient, VolumeClaimPatch,
};
use druid_common::crd::{
    Druid, DruidClusterStatus, DruidNodeSpec, DruidSpec, IngressSpec, NodeConditionType,
    UpdateStrategy, VolumeClaimTemplate, WorkloadKind,
};
use druid_common::events::NoopEventPublisher;
use druid_common::{Error, PVC_DELETION_FINALIZER};

#[derive(Default)]
struct ApiState {
    children: BTreeMap<(ChildKind, String), ChildManifest>,
    pvcs: BTreeMap<String, PersistentVolumeClaim>,
    finalizers: Vec<String>,
    status: Option<DruidClusterStatus>,
    status_writes: usize,
    /// StorageClass name to `allowVolumeExpansion`
    storage_classes: BTreeMap<String, bool>,
    /// Workloads whose replicas never become ready
    stalled: BTreeSet<String>,
    log: Vec<String>,
}

#[derive(Default)]
struct FakeApi {
    state: Mutex<ApiState>,
}

impl FakeApi {
    fn with<T>(&self, f: impl FnOnce(&mut ApiState) -> T) -> T {
        f(&mut self.state.lock().expect("mutex should not be poisoned"))
    }

    fn log(&self) -> Vec<String> {
        self.with(|s| s.log.clone())
    }

    fn status_writes(&self) -> usize {
        self.with(|s| s.status_writes)
    }

    fn pvc(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.with(|s| s.pvcs.get(name).cloned())
    }

    fn add_storage_class(&self, name: &str, allow_expansion: bool) {
        self.with(|s| s.storage_classes.insert(name.to_string(), allow_expansion));
    }

    fn set_stalled(&self, workload: &str, stalled: bool) {
        self.with(|s| {
            if stalled {
                s.stalled.insert(workload.to_string());
            } else {
                s.stalled.remove(workload);
            }
        });
    }

    fn deployment_replicas(&self, name: &str) -> Option<i32> {
        self.with(|s| {
            s.deployments()
                .find(|d| d.name_any() == name)
                .and_then(|d| d.spec.as_ref()?.replicas)
        })
    }

    fn has_child(&self, kind: ChildKind, name: &str) -> bool {
        self.with(|s| s.children.contains_key(&(kind, name.to_string())))
    }

    /// The Druid object as the next watch event would deliver it
    fn refresh(&self, druid: &Druid) -> Druid {
        let mut next = druid.clone();
        self.with(|s| {
            next.metadata.finalizers = Some(s.finalizers.clone());
            next.status = s.status.clone();
        });
        next
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| {
            term.split_once('=')
                .is_some_and(|(k, v)| labels.get(k).map(String::as_str) == Some(v))
        })
}

fn labels_of(manifest: &ChildManifest) -> BTreeMap<String, String> {
    match manifest {
        ChildManifest::StatefulSet(o) => o.labels().clone(),
        ChildManifest::Deployment(o) => o.labels().clone(),
        ChildManifest::Service(o) => o.labels().clone(),
        ChildManifest::ConfigMap(o) => o.labels().clone(),
        ChildManifest::PodDisruptionBudget(o) => o.labels().clone(),
        ChildManifest::HorizontalPodAutoscaler(o) => o.labels().clone(),
        ChildManifest::Ingress(o) => o.labels().clone(),
    }
}

fn templates_of(sts: &StatefulSet) -> Vec<PersistentVolumeClaim> {
    sts.spec
        .as_ref()
        .and_then(|s| s.volume_claim_templates.clone())
        .unwrap_or_default()
}

fn replicas_of(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

/// JSON merge patch (RFC 7386) as the API server applies it
fn merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    let serde_json::Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = serde_json::json!({});
    }
    if let serde_json::Value::Object(fields) = target {
        for (key, value) in patch {
            if value.is_null() {
                fields.remove(key);
            } else {
                merge(
                    fields.entry(key.clone()).or_insert(serde_json::Value::Null),
                    value,
                );
            }
        }
    }
}

const IMMUTABLE_STATEFULSET_SPEC: &str = "StatefulSet.apps is invalid: spec: Forbidden: \
    updates to statefulset spec for fields other than 'replicas', 'ordinals', 'template', \
    'updateStrategy', 'persistentVolumeClaimRetentionPolicy' and 'minReadySeconds' are forbidden";

fn invalid(message: &str) -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "Invalid".to_string(),
        code: 422,
    }))
}

impl ApiState {
    fn statefulsets(&self) -> impl Iterator<Item = &StatefulSet> {
        self.children.values().filter_map(ChildManifest::as_stateful_set)
    }

    fn deployments(&self) -> impl Iterator<Item = &Deployment> {
        self.children.values().filter_map(|m| match m {
            ChildManifest::Deployment(d) => Some(d),
            _ => None,
        })
    }

    /// What the StatefulSet controller does for a new StatefulSet
    fn provision_claims(&mut self, sts: &StatefulSet) {
        let sts_name = sts.name_any();
        for template in templates_of(sts) {
            for ordinal in 0..replicas_of(sts) {
                let name = format!("{}-{sts_name}-{ordinal}", template.name_any());
                self.pvcs.entry(name.clone()).or_insert_with(|| PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some(name),
                        ..template.metadata.clone()
                    },
                    spec: template.spec.clone(),
                    ..Default::default()
                });
            }
        }
    }
}

#[async_trait]
impl KubeClient for FakeApi {
    async fn list_names(
        &self,
        kind: ChildKind,
        _namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>, Error> {
        Ok(self.with(|s| {
            s.children
                .iter()
                .filter(|((k, _), m)| *k == kind && matches_selector(&labels_of(m), selector))
                .map(|((_, name), _)| name.clone())
                .collect()
        }))
    }

    async fn delete_child(
        &self,
        kind: ChildKind,
        _namespace: &str,
        name: &str,
        cascade: Cascade,
    ) -> Result<(), Error> {
        self.with(|s| {
            s.children.remove(&(kind, name.to_string()));
            s.log.push(format!("delete {kind} {name} {cascade:?}"));
        });
        Ok(())
    }

    async fn apply_child(&self, _namespace: &str, manifest: &ChildManifest) -> Result<(), Error> {
        self.with(|s| {
            let key = (manifest.kind(), manifest.name());
            let mut manifest = manifest.clone();

            let stalled = s.stalled.contains(&key.1);
            match &mut manifest {
                ChildManifest::StatefulSet(sts) => {
                    let live = s.children.get(&key).and_then(ChildManifest::as_stateful_set);
                    if let Some(live) = live {
                        if templates_of(live) != templates_of(sts) {
                            return Err(invalid(IMMUTABLE_STATEFULSET_SPEC));
                        }
                    } else {
                        s.log.push(format!("create StatefulSet {}", key.1));
                    }
                    let replicas = replicas_of(sts);
                    sts.status = Some(StatefulSetStatus {
                        replicas,
                        ready_replicas: Some(if stalled { 0 } else { replicas }),
                        ..Default::default()
                    });
                    let sts = sts.clone();
                    s.provision_claims(&sts);
                }
                ChildManifest::Deployment(d) => {
                    let replicas = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                    let ready = if stalled { 0 } else { replicas };
                    d.status = Some(DeploymentStatus {
                        replicas: Some(replicas),
                        updated_replicas: Some(ready),
                        ready_replicas: Some(ready),
                        ..Default::default()
                    });
                }
                _ => {}
            }

            s.children.insert(key, manifest);
            Ok(())
        })
    }

    async fn get_statefulset(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>, Error> {
        Ok(self.with(|s| {
            s.children
                .get(&(ChildKind::StatefulSet, name.to_string()))
                .and_then(ChildManifest::as_stateful_set)
                .cloned()
        }))
    }

    async fn list_statefulsets(
        &self,
        _namespace: &str,
        selector: &str,
    ) -> Result<Vec<StatefulSet>, Error> {
        Ok(self.with(|s| {
            s.statefulsets()
                .filter(|o| matches_selector(o.labels(), selector))
                .cloned()
                .collect()
        }))
    }

    async fn list_deployments(
        &self,
        _namespace: &str,
        selector: &str,
    ) -> Result<Vec<Deployment>, Error> {
        Ok(self.with(|s| {
            s.deployments()
                .filter(|o| matches_selector(o.labels(), selector))
                .cloned()
                .collect()
        }))
    }

    async fn list_pvcs(
        &self,
        _namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, Error> {
        Ok(self.with(|s| {
            s.pvcs
                .values()
                .filter(|p| matches_selector(p.labels(), selector))
                .cloned()
                .collect()
        }))
    }

    async fn patch_pvc(
        &self,
        _namespace: &str,
        name: &str,
        patch: &VolumeClaimPatch,
    ) -> Result<(), Error> {
        self.with(|s| {
            let pvc = s
                .pvcs
                .get_mut(name)
                .ok_or_else(|| Error::internal(format!("pvc {name} not found")))?;
            let annotations = pvc.metadata.annotations.get_or_insert_with(BTreeMap::new);
            for (key, value) in &patch.annotations {
                match value {
                    Some(v) => annotations.insert(key.clone(), v.clone()),
                    None => annotations.remove(key),
                };
            }
            let spec = pvc.spec.get_or_insert_with(Default::default);
            if let Some(class) = &patch.volume_attributes_class_name {
                spec.volume_attributes_class_name = class.clone();
            }
            if let Some(storage) = &patch.storage {
                spec.resources
                    .get_or_insert_with(Default::default)
                    .requests
                    .get_or_insert_with(BTreeMap::new)
                    .insert("storage".to_string(), Quantity(storage.clone()));
            }
            s.log.push(format!("patch pvc {name}"));
            Ok(())
        })
    }

    async fn delete_pvc(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        self.with(|s| {
            s.pvcs.remove(name);
            s.log.push(format!("delete pvc {name}"));
        });
        Ok(())
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>, Error> {
        Ok(self.with(|s| {
            s.storage_classes.get(name).map(|allow| StorageClass {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                allow_volume_expansion: Some(*allow),
                ..Default::default()
            })
        }))
    }

    async fn list_pod_names(&self, _namespace: &str, selector: &str) -> Result<Vec<String>, Error> {
        Ok(self.with(|s| {
            let mut pods = Vec::new();
            for sts in s.statefulsets().filter(|o| matches_selector(o.labels(), selector)) {
                pods.extend((0..replicas_of(sts)).map(|i| format!("{}-{i}", sts.name_any())));
            }
            for d in s.deployments().filter(|o| matches_selector(o.labels(), selector)) {
                pods.push(format!("{}-0", d.name_any()));
            }
            pods
        }))
    }

    async fn add_finalizer(
        &self,
        _namespace: &str,
        _name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.with(|s| {
            if !s.finalizers.iter().any(|f| f == finalizer) {
                s.finalizers.push(finalizer.to_string());
            }
        });
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        _namespace: &str,
        _name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.with(|s| {
            s.finalizers.retain(|f| f != finalizer);
            s.log.push("remove finalizer".to_string());
        });
        Ok(())
    }

    async fn patch_status(
        &self,
        _namespace: &str,
        _name: &str,
        previous: &DruidClusterStatus,
        status: &DruidClusterStatus,
    ) -> Result<(), Error> {
        let patch = status.merge_patch_from(previous)?;
        self.with(|s| {
            let mut stored = serde_json::to_value(s.status.clone().unwrap_or_default())
                .map_err(|e| Error::internal(e.to_string()))?;
            merge(&mut stored, &patch);
            s.status =
                Some(serde_json::from_value(stored).map_err(|e| Error::internal(e.to_string()))?);
            s.status_writes += 1;
            Ok(())
        })
    }
}

fn node(node_type: &str, kind: WorkloadKind, replicas: i32) -> DruidNodeSpec {
    DruidNodeSpec {
        node_type: node_type.to_string(),
        kind,
        replicas,
        image: None,
        druid_port: 8088,
        runtime_properties: String::new(),
        volume_claim_templates: vec![],
        pod_disruption_budget: None,
        autoscaler: None,
        ingress: None,
        update_strategy: UpdateStrategy::RollingUpdate,
    }
}

fn segment_cache(tier: &str, class: &str) -> VolumeClaimTemplate {
    VolumeClaimTemplate {
        name: "segment-cache".to_string(),
        annotations: BTreeMap::from([("tier".to_string(), tier.to_string())]),
        volume_attributes_class_name: Some(class.to_string()),
        storage: "10Gi".to_string(),
        ..Default::default()
    }
}

fn wiki() -> Druid {
    let mut historicals = node("historical", WorkloadKind::StatefulSet, 2);
    historicals.volume_claim_templates = vec![segment_cache("cold", "standard")];

    let mut druid = Druid::new(
        "wiki",
        DruidSpec {
            image: Some("apache/druid:30.0.0".to_string()),
            nodes: BTreeMap::from([
                ("historicals".to_string(), historicals),
                (
                    "brokers".to_string(),
                    node("broker", WorkloadKind::Deployment, 1),
                ),
            ]),
            ..Default::default()
        },
    );
    druid.metadata.namespace = Some("druid".to_string());
    druid.metadata.uid = Some("7d1c0c2e-0000-4000-8000-000000000001".to_string());
    druid.metadata.generation = Some(1);
    druid
}

type PassResult = Result<kube::runtime::controller::Action, Error>;

/// Run one pass and return the object as the next pass would see it
async fn pass(api: &Arc<FakeApi>, druid: &Druid) -> (PassResult, Druid) {
    let ctx = Arc::new(Context::with_clients(api.clone(), Arc::new(NoopEventPublisher)));
    let result = reconcile(Arc::new(druid.clone()), ctx).await;
    (result, api.refresh(druid))
}

fn summary(druid: &Druid) -> NodeConditionType {
    druid
        .status
        .as_ref()
        .and_then(|s| s.druid_node_status.as_ref())
        .map(|s| s.druid_node_condition_type)
        .unwrap_or_default()
}

fn annotation(pvc: &PersistentVolumeClaim, key: &str) -> Option<String> {
    pvc.annotations().get(key).cloned()
}

fn attributes_class(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.spec
        .as_ref()
        .and_then(|s| s.volume_attributes_class_name.clone())
}

fn requested_storage(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .map(|q| q.0.clone())
}

mod steady_state {
    use super::*;

    #[tokio::test]
    async fn first_pass_converges_and_second_pass_is_quiet() {
        let api = Arc::new(FakeApi::default());

        let (result, druid) = pass(&api, &wiki()).await;
        result.expect("first pass");
        assert_eq!(
            druid.metadata.finalizers,
            Some(vec![PVC_DELETION_FINALIZER.to_string()])
        );
        assert_eq!(summary(&druid), NodeConditionType::Ready);
        assert_eq!(api.status_writes(), 1);

        let status = druid.status.clone().expect("status");
        assert_eq!(status.stateful_sets, vec!["druid-wiki-historicals"]);
        assert_eq!(status.deployments, vec!["druid-wiki-brokers"]);
        assert_eq!(
            status.persistent_volume_claims,
            vec![
                "segment-cache-druid-wiki-historicals-0",
                "segment-cache-druid-wiki-historicals-1",
            ]
        );

        let (result, _) = pass(&api, &druid).await;
        result.expect("second pass");
        assert_eq!(api.status_writes(), 1, "unchanged status is not rewritten");
    }

    #[tokio::test]
    async fn removed_node_is_garbage_collected() {
        let api = Arc::new(FakeApi::default());
        let (_, mut druid) = pass(&api, &wiki()).await;
        assert!(api.has_child(ChildKind::Deployment, "druid-wiki-brokers"));

        druid.spec.nodes.remove("brokers");
        druid.metadata.generation = Some(2);
        let (result, druid) = pass(&api, &druid).await;
        result.expect("gc pass");

        assert!(!api.has_child(ChildKind::Deployment, "druid-wiki-brokers"));
        assert!(!api.has_child(ChildKind::Service, "druid-wiki-brokers"));
        assert!(!api.has_child(ChildKind::ConfigMap, "druid-wiki-brokers-config"));
        assert!(api.has_child(ChildKind::StatefulSet, "druid-wiki-historicals"));
        assert!(api
            .log()
            .contains(&"delete Deployment druid-wiki-brokers Background".to_string()));

        let status = druid.status.clone().expect("status");
        assert!(status.deployments.is_empty());
        assert!(!status.node_conditions.contains_key("brokers"));

        let writes = api.status_writes();
        let (result, _) = pass(&api, &druid).await;
        result.expect("settled pass");
        assert_eq!(api.status_writes(), writes, "cleared status is not rewritten");
    }

    #[tokio::test]
    async fn last_ingress_removal_clears_status_and_goes_quiet() {
        let mut cluster = wiki();
        if let Some(brokers) = cluster.spec.nodes.get_mut("brokers") {
            brokers.ingress = Some(IngressSpec {
                host: "wiki.example.com".to_string(),
                path: None,
                ingress_class_name: None,
            });
        }
        let api = Arc::new(FakeApi::default());
        let (result, mut druid) = pass(&api, &cluster).await;
        result.expect("first pass");
        let status = druid.status.clone().expect("status");
        assert_eq!(status.ingress, vec!["druid-wiki-brokers"]);

        if let Some(brokers) = druid.spec.nodes.get_mut("brokers") {
            brokers.ingress = None;
        }
        druid.metadata.generation = Some(2);
        let (result, druid) = pass(&api, &druid).await;
        result.expect("gc pass");
        assert!(!api.has_child(ChildKind::Ingress, "druid-wiki-brokers"));
        assert!(druid.status.clone().expect("status").ingress.is_empty());

        let writes = api.status_writes();
        let (result, _) = pass(&api, &druid).await;
        result.expect("settled pass");
        assert_eq!(api.status_writes(), writes);
    }
}

mod template_migration {
    use super::*;

    fn with_hot_tier(druid: &Druid) -> Druid {
        let mut next = druid.clone();
        if let Some(h) = next.spec.nodes.get_mut("historicals") {
            h.volume_claim_templates = vec![segment_cache("hot", "fast")];
        }
        next.metadata.generation = Some(2);
        next
    }

    fn orphan_deletes(api: &FakeApi) -> usize {
        api.log()
            .iter()
            .filter(|l| *l == "delete StatefulSet druid-wiki-historicals Orphan")
            .count()
    }

    #[tokio::test]
    async fn template_change_orphans_once_and_converges() {
        let api = Arc::new(FakeApi::default());
        let (_, druid) = pass(&api, &wiki()).await;
        let druid = with_hot_tier(&druid);

        // Pass 2: drift detected, StatefulSet orphaned, PVCs patched
        let (result, druid) = pass(&api, &druid).await;
        result.expect("migrating pass");
        assert_eq!(orphan_deletes(&api), 1);
        assert!(!api.has_child(ChildKind::StatefulSet, "druid-wiki-historicals"));
        assert_eq!(summary(&druid), NodeConditionType::RollingUpdate);
        for ordinal in 0..2 {
            let pvc = api
                .pvc(&format!("segment-cache-druid-wiki-historicals-{ordinal}"))
                .expect("pvc kept");
            assert_eq!(annotation(&pvc, "tier").as_deref(), Some("hot"));
            assert_eq!(attributes_class(&pvc).as_deref(), Some("fast"));
        }

        // Pass 3: StatefulSet recreated from the new templates
        let (result, druid) = pass(&api, &druid).await;
        result.expect("recreate pass");
        assert!(api.has_child(ChildKind::StatefulSet, "druid-wiki-historicals"));

        // Pass 4: nothing left to do
        let (result, druid) = pass(&api, &druid).await;
        result.expect("settled pass");
        assert_eq!(orphan_deletes(&api), 1, "StatefulSet deleted exactly once");
        assert_eq!(summary(&druid), NodeConditionType::Ready);
    }

    #[tokio::test]
    async fn disabled_updates_never_delete_the_statefulset() {
        let api = Arc::new(FakeApi::default());
        let (_, druid) = pass(&api, &wiki()).await;
        let mut druid = with_hot_tier(&druid);
        druid.spec.disable_pvc_updates = true;

        let (result, _) = pass(&api, &druid).await;
        let err = result.expect_err("immutable template update is rejected");
        assert!(!err.is_retryable());
        assert_eq!(orphan_deletes(&api), 0);
        let pvc = api
            .pvc("segment-cache-druid-wiki-historicals-0")
            .expect("pvc kept");
        assert_eq!(annotation(&pvc, "tier").as_deref(), Some("cold"));
    }

    #[tokio::test]
    async fn annotation_only_change_is_ignored_when_disabled() {
        let api = Arc::new(FakeApi::default());
        let (_, druid) = pass(&api, &wiki()).await;

        let mut next = druid.clone();
        next.spec.disable_pvc_annotation_update = true;
        if let Some(h) = next.spec.nodes.get_mut("historicals") {
            h.volume_claim_templates = vec![segment_cache("hot", "standard")];
        }

        let (_, _) = pass(&api, &next).await;
        assert_eq!(orphan_deletes(&api), 0);
    }

    fn on_gp3(druid: &Druid, storage: &str, generation: i64) -> Druid {
        let mut next = druid.clone();
        next.spec.scale_pvc_sts = true;
        if let Some(h) = next.spec.nodes.get_mut("historicals") {
            h.volume_claim_templates = vec![VolumeClaimTemplate {
                storage: storage.to_string(),
                storage_class_name: Some("gp3".to_string()),
                ..segment_cache("cold", "standard")
            }];
        }
        next.metadata.generation = Some(generation);
        next
    }

    #[tokio::test]
    async fn storage_growth_expands_claims_through_recreation() {
        let api = Arc::new(FakeApi::default());
        api.add_storage_class("gp3", true);
        let (result, druid) = pass(&api, &on_gp3(&wiki(), "10Gi", 1)).await;
        result.expect("first pass");

        let (result, druid) = pass(&api, &on_gp3(&druid, "20Gi", 2)).await;
        result.expect("expanding pass");
        assert_eq!(orphan_deletes(&api), 1);
        for ordinal in 0..2 {
            let pvc = api
                .pvc(&format!("segment-cache-druid-wiki-historicals-{ordinal}"))
                .expect("pvc kept");
            assert_eq!(requested_storage(&pvc).as_deref(), Some("20Gi"));
        }

        let (result, druid) = pass(&api, &druid).await;
        result.expect("recreate pass");
        let (result, druid) = pass(&api, &druid).await;
        result.expect("settled pass");
        assert_eq!(orphan_deletes(&api), 1);
        assert_eq!(summary(&druid), NodeConditionType::Ready);
    }

    #[tokio::test]
    async fn storage_growth_on_fixed_class_is_refused() {
        let api = Arc::new(FakeApi::default());
        api.add_storage_class("gp3", false);
        let (_, druid) = pass(&api, &on_gp3(&wiki(), "10Gi", 1)).await;

        let (result, _) = pass(&api, &on_gp3(&druid, "20Gi", 2)).await;
        let err = result.expect_err("expansion refused");
        assert!(err.needs_spec_change());
        assert_eq!(orphan_deletes(&api), 0);
        let pvc = api
            .pvc("segment-cache-druid-wiki-historicals-0")
            .expect("pvc kept");
        assert_eq!(requested_storage(&pvc).as_deref(), Some("10Gi"));
    }
}

mod rolling_deploy {
    use super::*;

    fn rolling(druid: &Druid, broker_replicas: i32, generation: i64) -> Druid {
        let mut next = druid.clone();
        next.spec.rolling_deploy = true;
        if let Some(brokers) = next.spec.nodes.get_mut("brokers") {
            brokers.replicas = broker_replicas;
        }
        next.metadata.generation = Some(generation);
        next
    }

    #[tokio::test]
    async fn update_waits_for_earlier_node_to_roll_out() {
        let api = Arc::new(FakeApi::default());
        let (result, druid) = pass(&api, &rolling(&wiki(), 1, 1)).await;
        result.expect("first pass");

        api.set_stalled("druid-wiki-historicals", true);
        let update = rolling(&druid, 3, 2);
        let (result, druid) = pass(&api, &update).await;
        result.expect("held pass");
        assert_eq!(api.deployment_replicas("druid-wiki-brokers"), Some(1));
        assert!(api.has_child(ChildKind::Deployment, "druid-wiki-brokers"));
        assert_eq!(summary(&druid), NodeConditionType::RollingUpdate);

        api.set_stalled("druid-wiki-historicals", false);
        let (result, druid) = pass(&api, &druid).await;
        result.expect("released pass");
        assert_eq!(api.deployment_replicas("druid-wiki-brokers"), Some(3));
        assert_eq!(summary(&druid), NodeConditionType::Ready);
    }
}

mod deletion {
    use super::*;

    #[tokio::test]
    async fn teardown_deletes_statefulsets_then_claims_then_releases() {
        let api = Arc::new(FakeApi::default());
        let (_, mut druid) = pass(&api, &wiki()).await;
        druid.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let (result, druid) = pass(&api, &druid).await;
        result.expect("teardown pass");

        let log = api.log();
        let teardown: Vec<&String> = log
            .iter()
            .skip_while(|l| !l.starts_with("delete StatefulSet"))
            .collect();
        assert_eq!(
            teardown,
            vec![
                "delete StatefulSet druid-wiki-historicals Background",
                "delete pvc segment-cache-druid-wiki-historicals-0",
                "delete pvc segment-cache-druid-wiki-historicals-1",
                "remove finalizer",
            ]
        );
        assert_eq!(druid.metadata.finalizers, Some(vec![]));
        assert!(api.pvc("segment-cache-druid-wiki-historicals-0").is_none());
    }

    #[tokio::test]
    async fn disabled_finalizer_keeps_claims() {
        let api = Arc::new(FakeApi::default());
        let mut cluster = wiki();
        cluster.spec.disable_pvc_deletion_finalizer = true;
        let (_, mut druid) = pass(&api, &cluster).await;
        assert_eq!(druid.metadata.finalizers, Some(vec![]));

        druid.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let (result, _) = pass(&api, &druid).await;
        result.expect("deletion pass");
        assert!(api.pvc("segment-cache-druid-wiki-historicals-0").is_some());
    }
}
