//! Cluster lifecycle management for Druid
//!
//! This crate provides the Kubernetes controller for Druid CRDs: ordered
//! rollout of node-type-instances, garbage collection of children that
//! left the spec, migration of immutable volume claim template fields, PVC
//! cleanup on deletion, and status.
//!
//! Related crates:
//! - `druid-common`: CRD types, errors, labels and events
//! - `druid-operator`: the operator binary

#![deny(missing_docs)]

pub mod cleanup;
pub mod client;
pub mod controller;
pub mod finalizer;
pub mod kinds;
pub mod manifest;
pub mod ordering;
pub mod status;
pub mod volume_migration;

// Re-export controller types
pub use controller::{error_policy, reconcile, Context, ContextBuilder};

pub use client::{KubeClient, KubeClientImpl, VolumeClaimPatch};
pub use kinds::{Cascade, ChildKind, ChildManifest};
pub use manifest::{DefaultManifestBuilder, ManifestBuilder};

// Re-export common error types
pub use druid_common::{Error, Result};
