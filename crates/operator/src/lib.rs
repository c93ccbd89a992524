//! The long-running operator process and its Kubernetes plumbing: CRD
//! wiring, the StatefulSet/Job-backed orchestrator implementation, leader
//! election, and the probe/metrics HTTP surface.

pub mod elect;
pub mod http;
pub mod kube_plane;
pub mod resources;
pub mod serve;
pub mod task;

/// Name of the store container inside every pod; metric queries and the
/// pod template must agree on it.
pub const STORE_CONTAINER: &str = "store";

/// Label keys stamped on every owned child resource.
pub const CLUSTER_LABEL: &str = "shardscale.io/cluster";
pub const ROLE_LABEL: &str = "shardscale.io/role";
