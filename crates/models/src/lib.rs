//! Data model of the `ShardedCluster` resource: the user-authored spec,
//! the controller-authored status, and the shard-ordering conventions that
//! tie pod ordinals to cluster roles.

mod ordering;
mod spec;
mod status;

pub use ordering::{
    client_port, desired_pods, group_size, is_primary_ordinal, ordinal_of_pod, pod_fqdn, pod_name,
    primary_ordinal, replica_ordinals, shard_of_ordinal, standby_primary_ordinal,
};
pub use spec::{ClusterSpec, ShardedCluster, ValidationError, ABSOLUTE_MIN_SHARDS};
pub use status::{ClusterStatus, Condition, DrainStage, Phase, MAX_CONDITIONS};
