//! Shard-ordering conventions of the ordered replica set.
//!
//! Pods are named `<cluster>-<ordinal>` with contiguous ordinals from 0.
//! Position `i × (replicasPerShard + 1)` is primary `i`; the next
//! `replicasPerShard` positions are its replicas. The standby primary sits
//! at position `activeShards × (replicasPerShard + 1)`, its replicas after.

const CLIENT_PORT: u16 = 6379;

pub fn client_port() -> u16 {
    CLIENT_PORT
}

/// Pods per shard group: one primary plus its replicas.
pub fn group_size(replicas_per_shard: i32) -> i32 {
    replicas_per_shard + 1
}

/// Total pods of the deployment, standby group included.
pub fn desired_pods(active_shards: i32, replicas_per_shard: i32) -> i32 {
    (active_shards + 1) * group_size(replicas_per_shard)
}

/// Ordinal of the primary of shard `index`.
pub fn primary_ordinal(index: i32, replicas_per_shard: i32) -> i32 {
    index * group_size(replicas_per_shard)
}

/// Whether `ordinal` is a primary position.
pub fn is_primary_ordinal(ordinal: i32, replicas_per_shard: i32) -> bool {
    ordinal % group_size(replicas_per_shard) == 0
}

/// Shard index owning `ordinal` (primary or replica position).
pub fn shard_of_ordinal(ordinal: i32, replicas_per_shard: i32) -> i32 {
    ordinal / group_size(replicas_per_shard)
}

/// Ordinal of the standby primary by convention.
pub fn standby_primary_ordinal(active_shards: i32, replicas_per_shard: i32) -> i32 {
    primary_ordinal(active_shards, replicas_per_shard)
}

/// Replica ordinals of the primary at `primary_ordinal`.
pub fn replica_ordinals(primary_ordinal: i32, replicas_per_shard: i32) -> Vec<i32> {
    (primary_ordinal + 1..=primary_ordinal + replicas_per_shard).collect()
}

pub fn pod_name(cluster: &str, ordinal: i32) -> String {
    format!("{cluster}-{ordinal}")
}

/// Ordinal parsed from a pod name, or None for names outside the
/// `<cluster>-<ordinal>` convention.
pub fn ordinal_of_pod(cluster: &str, pod: &str) -> Option<i32> {
    let suffix = pod.strip_prefix(cluster)?.strip_prefix('-')?;
    suffix.parse().ok()
}

/// Stable DNS name of a pod's client port behind the headless service.
pub fn pod_fqdn(cluster: &str, service: &str, namespace: &str, ordinal: i32) -> String {
    format!(
        "{cluster}-{ordinal}.{service}.{namespace}.svc.cluster.local:{CLIENT_PORT}",
    )
}
