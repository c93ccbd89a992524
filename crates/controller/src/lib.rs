//! The control core: health gate, decision engine, scaling protocols, and
//! the per-cluster reconciliation state machine that drives them.

pub mod decision;
pub mod gate;
pub mod metrics;
pub mod plane;
pub mod provision;
pub mod reconciler;
pub mod scale_down;
pub mod scale_up;

#[cfg(test)]
mod test_util;

pub use plane::{Orchestrator, PodState, TaskSpec, TaskState};
pub use reconciler::Reconciler;

use std::time::Duration;

/// Everything a tick needs to know about the cluster object it serves,
/// beyond the mutable status.
#[derive(Clone, Debug)]
pub struct ClusterCx {
    pub name: String,
    pub namespace: String,
    /// Headless service exposing the pods.
    pub service: String,
    /// Name of the store container, for metric label matching.
    pub container: String,
    pub spec: models::ClusterSpec,
}

impl ClusterCx {
    pub fn pod_name(&self, ordinal: i32) -> String {
        models::pod_name(&self.name, ordinal)
    }

    /// Stable `host:port` of a pod's client interface.
    pub fn pod_addr(&self, ordinal: i32) -> String {
        models::pod_fqdn(&self.name, &self.service, &self.namespace, ordinal)
    }

    /// Name of an externally-run scaling task owned by this cluster.
    pub fn task_name(&self, suffix: &str) -> String {
        format!("{}-{suffix}", self.name)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.spec.poll_interval_seconds.into())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.spec.task_timeout_seconds.into())
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.spec.cooldown_seconds.into())
    }

    /// Whether the controller owns the replica set's desired pod count.
    /// Externally-managed deployments may opt out of resizes.
    pub fn manages_pods(&self) -> bool {
        !self.spec.existing_mode || self.spec.manage_replica_set
    }
}
