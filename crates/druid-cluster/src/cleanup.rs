//! Garbage collection of child objects that left the desired state
//!
//! Each of the seven kinds is listed by the cluster selector and every
//! object whose name the current pass did not render is deleted. Kinds are
//! independent, so they run concurrently; each future owns its own
//! survivor list.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::join_all;
use tracing::{debug, info, warn};

use druid_common::Error;

use crate::client::KubeClient;
use crate::kinds::{Cascade, ChildKind, ChildManifest};

/// Names each kind is expected to have after this pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceExpectations {
    names: BTreeMap<ChildKind, BTreeSet<String>>,
}

impl ResourceExpectations {
    /// Record that `name` of `kind` belongs to the desired state
    pub fn expect(&mut self, kind: ChildKind, name: impl Into<String>) {
        self.names.entry(kind).or_default().insert(name.into());
    }

    /// Record every manifest in `manifests`
    pub fn expect_manifests(&mut self, manifests: &[ChildManifest]) {
        for m in manifests {
            self.expect(m.kind(), m.name());
        }
    }

    /// Returns true if `name` of `kind` is expected
    pub fn contains(&self, kind: ChildKind, name: &str) -> bool {
        self.names.get(&kind).is_some_and(|n| n.contains(name))
    }
}

/// A child object removed by garbage collection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeletedObject {
    /// Kind of the removed object
    pub kind: ChildKind,
    /// Name of the removed object
    pub name: String,
}

/// A child object garbage collection failed to remove
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedDelete {
    /// Kind of the object
    pub kind: ChildKind,
    /// Name of the object
    pub name: String,
    /// Why the delete failed
    pub reason: String,
}

/// Result of one garbage collection pass
#[derive(Debug, Default)]
pub struct CleanupOutcome {
    /// Sorted survivor names per kind; `None` when the kind could not be listed
    pub survivors: BTreeMap<ChildKind, Option<Vec<String>>>,
    /// Objects deleted in this pass
    pub deleted: Vec<DeletedObject>,
    /// Objects whose delete failed; they stay in the survivor lists
    pub failed: Vec<FailedDelete>,
    /// Every list or delete failure
    pub errors: Vec<Error>,
}

impl CleanupOutcome {
    /// Survivors of `kind`, if it was listed successfully
    pub fn survivors_of(&self, kind: ChildKind) -> Option<&[String]> {
        self.survivors.get(&kind).and_then(|s| s.as_deref())
    }

    /// Collapse the per-object failures into one error
    pub fn into_error(self) -> Option<Error> {
        Error::aggregate("cleanup", self.errors)
    }
}

struct KindResult {
    kind: ChildKind,
    survivors: Option<Vec<String>>,
    deleted: Vec<String>,
    failed: Vec<(String, String)>,
    errors: Vec<Error>,
}

/// Delete every live child not in `expected` and report what survives.
///
/// Never fails as a whole: list and delete errors are collected in the
/// outcome so one failing object or kind does not stop the others.
pub async fn cleanup_unused_resources(
    kube: &dyn KubeClient,
    namespace: &str,
    selector: &str,
    expected: &ResourceExpectations,
) -> CleanupOutcome {
    let results = join_all(
        ChildKind::ALL
            .into_iter()
            .map(|kind| cleanup_kind(kube, kind, namespace, selector, expected)),
    )
    .await;

    let mut outcome = CleanupOutcome::default();
    for result in results {
        outcome.survivors.insert(result.kind, result.survivors);
        outcome
            .deleted
            .extend(result.deleted.into_iter().map(|name| DeletedObject {
                kind: result.kind,
                name,
            }));
        outcome
            .failed
            .extend(result.failed.into_iter().map(|(name, reason)| FailedDelete {
                kind: result.kind,
                name,
                reason,
            }));
        outcome.errors.extend(result.errors);
    }
    outcome
}

async fn cleanup_kind(
    kube: &dyn KubeClient,
    kind: ChildKind,
    namespace: &str,
    selector: &str,
    expected: &ResourceExpectations,
) -> KindResult {
    let live = match kube.list_names(kind, namespace, selector).await {
        Ok(names) => names,
        Err(e) => {
            warn!(%kind, error = %e, "failed to list child objects");
            return KindResult {
                kind,
                survivors: None,
                deleted: vec![],
                failed: vec![],
                errors: vec![e],
            };
        }
    };

    let mut survivors = Vec::with_capacity(live.len());
    let mut deleted = Vec::new();
    let mut failed = Vec::new();
    let mut errors = Vec::new();

    for name in live {
        if expected.contains(kind, &name) {
            survivors.push(name);
            continue;
        }

        debug!(%kind, %name, "deleting unused child object");
        match kube
            .delete_child(kind, namespace, &name, Cascade::Background)
            .await
        {
            Ok(()) => {
                info!(%kind, %name, "deleted unused child object");
                deleted.push(name);
            }
            Err(e) => {
                warn!(%kind, %name, error = %e, "failed to delete unused child object");
                errors.push(Error::internal_with_context(
                    "cleanup",
                    format!("delete {kind} {name}: {e}"),
                ));
                failed.push((name.clone(), e.to_string()));
                survivors.push(name);
            }
        }
    }

    survivors.sort();
    KindResult {
        kind,
        survivors: Some(survivors),
        deleted,
        failed,
        errors,
    }
}
