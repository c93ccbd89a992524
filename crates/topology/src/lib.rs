//! Typed client for the sharded store's cluster-admin surface.
//!
//! Node listings are parsed into structured [`NodeInfo`] values and every
//! administrative operation is a first-class method, so callers reason
//! about slot counts and membership instead of scraping tool output.

mod client;
mod nodes;

pub use client::{Client, ClientConfig};
pub use nodes::{
    parse_cluster_nodes, zero_slot_primary, NodeInfo, ParseError, Role, SlotRange, SLOT_SPACE,
};

use std::time::Duration;

/// Administrative operations of one sharded cluster.
///
/// Implementations retry a failed command at most once on transient I/O
/// error; persistent failure escalates to the caller.
#[async_trait::async_trait]
pub trait Admin: Send + Sync {
    /// Current membership as reported by the first reachable node.
    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeInfo>>;

    /// True when every reachable primary reports a consistent, fully
    /// covered slot map.
    async fn health(&self) -> anyhow::Result<bool>;

    /// Idempotent reconciliation of topology inconsistencies: completes
    /// or aborts half-migrated slots and assigns unowned slots. Tolerates
    /// unreachable primaries.
    async fn fix(&self) -> anyhow::Result<()>;

    /// Broadcasts `FORGET id` to every currently-healthy primary.
    async fn forget(&self, id: &str) -> anyhow::Result<()>;

    /// Removes a member: `FORGET id` broadcast to every healthy node,
    /// replicas included.
    async fn del_node(&self, id: &str) -> anyhow::Result<()>;

    /// Synchronously migrates `slots` hash slots from one primary to
    /// another, bounded by `deadline` and a fixed key-batch depth.
    async fn reshard(
        &self,
        from_id: &str,
        to_id: &str,
        slots: u16,
        deadline: Duration,
    ) -> anyhow::Result<()>;

    /// Joins the node at `addr` to the cluster as an empty primary.
    async fn add_primary(&self, addr: &str) -> anyhow::Result<()>;

    /// Joins the node at `addr` and attaches it as a replica of
    /// `primary_id`.
    async fn add_replica(&self, addr: &str, primary_id: &str) -> anyhow::Result<()>;

    /// Returns the node at `addr` to an empty, unclustered state.
    async fn reset_hard(&self, addr: &str) -> anyhow::Result<()>;

    /// Drops all keys held by the node at `addr`.
    async fn flush_all(&self, addr: &str) -> anyhow::Result<()>;

    /// Broadcasts the full-coverage requirement flag. Best-effort: a node
    /// that cannot be reached is skipped, but at least one node must
    /// accept the change.
    async fn set_full_coverage(&self, enabled: bool) -> anyhow::Result<()>;

    /// Assigns the given slot ranges to the node at `addr`. Used by
    /// bootstrap and by coverage repair.
    async fn assign_slots(&self, addr: &str, ranges: &[SlotRange]) -> anyhow::Result<()>;
}
