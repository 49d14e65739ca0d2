//! Common types for the Druid operator: CRDs, errors, labels and events

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod labels;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer guarding PVC deletion until the cluster's StatefulSets are gone
pub const PVC_DELETION_FINALIZER: &str = "deletepvc.finalizers.druid.apache.org";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "druid-operator";
