//! Contract of the orchestrator hosting the cluster: the ordered replica
//! set, the one-shot task runner, and the desired-state record itself.
//!
//! Keeping the reconciler behind this trait keeps every protocol testable
//! without a live cluster; the operator binary provides the production
//! implementation.

use chrono::{DateTime, Utc};

/// Observed state of one pod of the replica set.
#[derive(Clone, Debug, PartialEq)]
pub struct PodState {
    pub name: String,
    pub ordinal: i32,
    /// Pod IP, used to join orchestrator pods with data-plane membership
    /// entries (nodes gossip IPs, not DNS names).
    pub ip: Option<String>,
    pub ready: bool,
}

/// Terminal-or-not state of an externally-run task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Not yet terminal.
    Running,
    Succeeded,
    Failed,
}

/// A one-shot task handed to the external runner.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskSpec {
    pub name: String,
    /// Arguments of the admin operation to run to completion.
    pub args: Vec<String>,
    /// Active deadline; expiry is observed as task failure.
    pub timeout_seconds: u32,
}

/// One cluster's view of its orchestrator. All operations are scoped to
/// the cluster object the implementation was constructed for.
#[async_trait::async_trait]
pub trait Orchestrator: Send + Sync {
    /// Current time. Routed through the trait so protocol tests are
    /// deterministic.
    fn now(&self) -> DateTime<Utc>;

    /// Pods of the replica set (or of the discovery selector, in
    /// existing mode), ordinal-sorted.
    async fn pods(&self) -> anyhow::Result<Vec<PodState>>;

    /// Desired pod count of the replica set, or None when it does not
    /// exist yet.
    async fn desired_pods(&self) -> anyhow::Result<Option<i32>>;

    /// Creates the replica set (and its headless service) when missing.
    async fn ensure_replica_set(&self, pods: i32) -> anyhow::Result<()>;

    /// Sets the desired pod count.
    async fn resize(&self, pods: i32) -> anyhow::Result<()>;

    /// Writes `activeShards` back to the desired-state record. Written
    /// before any status change so that a crash between the two leaves a
    /// reshaped replica set and a status that converges on the next tick.
    async fn persist_active_shards(&self, shards: i32) -> anyhow::Result<()>;

    /// State of the named task, or None if it does not exist.
    async fn find_task(&self, name: &str) -> anyhow::Result<Option<TaskState>>;

    /// Any scaling task currently present for this cluster, regardless of
    /// name. The health gate refuses to scale while one exists.
    async fn any_task(&self) -> anyhow::Result<Option<(String, TaskState)>>;

    async fn launch_task(&self, task: TaskSpec) -> anyhow::Result<()>;

    /// Removes a task record. Absent tasks are not an error.
    async fn delete_task(&self, name: &str) -> anyhow::Result<()>;
}
