//! Custom Resource Definitions for the Druid operator

mod druid;
mod status;
mod types;

pub use druid::{Druid, DruidNodeSpec, DruidSpec, DEFAULT_DRUID_PORT};
pub use status::{DruidClusterStatus, DruidNodeTypeStatus, NodeConditionType, ALL_NODES};
pub use types::{
    parse_quantity, AutoscalerSpec, ConditionStatus, DisruptionBudgetSpec, IngressSpec, NodeType,
    UpdateStrategy, VolumeClaimTemplate, WorkloadKind,
};
