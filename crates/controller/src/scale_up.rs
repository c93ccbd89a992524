//! Scale-up: activate the standby by moving half of the overloaded
//! primary's slots into it, then request a fresh standby.
//!
//! The slot migration itself runs out-of-band as a one-shot task; each
//! tick observes task state and advances at most one step. The task
//! record is collected by the provisioning phase only after the phase
//! transition has been persisted, so a crash anywhere in between is
//! recovered by observation: a standby that already owns slots means the
//! migration landed, and the protocol short-circuits to its final steps.

use crate::plane::{Orchestrator, TaskSpec, TaskState};
use crate::reconciler::{
    self, node_for_pod, pod_named, protocol_failed, protocol_fatal, POLL_AGAIN, TASK_POLL,
};
use crate::{metrics, ClusterCx};
use models::{ClusterStatus, Phase};
use std::time::Duration;
use topology::Admin;

/// Task-name suffix of the scale-up migration.
pub const RESHARD_TASK: &str = "reshard";

pub async fn advance(
    cx: &ClusterCx,
    plane: &dyn Orchestrator,
    admin: &dyn Admin,
    status: &mut ClusterStatus,
    overloaded: &str,
) -> anyhow::Result<Duration> {
    let task = cx.task_name(RESHARD_TASK);
    match plane.find_task(&task).await? {
        Some(TaskState::Running) => Ok(TASK_POLL),
        Some(TaskState::Failed) => {
            plane.delete_task(&task).await?;
            restore_coverage(admin).await;
            protocol_failed(
                plane,
                status,
                "reshard",
                format!("reshard task {task} failed or timed out"),
            );
            Ok(POLL_AGAIN)
        }
        Some(TaskState::Succeeded) => finish(cx, plane, admin, status).await,
        None => start(cx, plane, admin, status, overloaded, &task).await,
    }
}

/// Pre-migration steps, ending in the task launch.
async fn start(
    cx: &ClusterCx,
    plane: &dyn Orchestrator,
    admin: &dyn Admin,
    status: &mut ClusterStatus,
    overloaded: &str,
    task: &str,
) -> anyhow::Result<Duration> {
    if let Err(err) = admin.fix().await {
        protocol_failed(plane, status, "fix", format!("topology fix failed: {err:#}"));
        return Ok(POLL_AGAIN);
    }
    if !admin.health().await? {
        protocol_failed(
            plane,
            status,
            "health",
            "cluster unhealthy after topology fix".to_string(),
        );
        return Ok(POLL_AGAIN);
    }

    let pods = plane.pods().await?;
    let nodes = admin.list_nodes().await?;

    let Some(standby_pod) = status.standby.clone() else {
        protocol_failed(
            plane,
            status,
            "resolve",
            "standby identity missing from status".to_string(),
        );
        return Ok(POLL_AGAIN);
    };
    let standby_node = pod_named(&pods, &standby_pod).and_then(|p| node_for_pod(&nodes, p));
    let Some(standby_node) = standby_node else {
        protocol_failed(
            plane,
            status,
            "resolve",
            format!("standby pod {standby_pod} maps to no cluster member"),
        );
        return Ok(POLL_AGAIN);
    };

    // Re-confirm the standby is empty. With no migration task on record
    // this cannot be our own progress, and moving slots into a non-empty
    // target would interleave two shards' data: stop for the operator.
    if standby_node.slot_count() > 0 {
        protocol_fatal(
            plane,
            status,
            "confirm-standby",
            format!(
                "standby {standby_pod} holds {} slots but no migration is on record",
                standby_node.slot_count()
            ),
        );
        return Ok(POLL_AGAIN);
    }

    let source = pod_named(&pods, overloaded).and_then(|p| node_for_pod(&nodes, p));
    let Some(source) = source else {
        protocol_failed(
            plane,
            status,
            "resolve",
            format!("overloaded pod {overloaded} maps to no cluster member"),
        );
        return Ok(POLL_AGAIN);
    };

    let slots_to_move = source.slot_count() / 2;
    if slots_to_move == 0 {
        // A one-slot shard cannot be split; exit the protocol cleanly.
        let now = plane.now();
        status.record(
            "ScaleUpNoop",
            format!(
                "{overloaded} holds {} slot(s); nothing to migrate",
                source.slot_count()
            ),
            now,
        );
        status.phase = Phase::Stable;
        status.last_scale_at = Some(now);
        return Ok(POLL_AGAIN);
    }

    // Relax the full-coverage guard for the duration of the migration so
    // readers are not refused while a slot is in flight.
    admin.set_full_coverage(false).await?;

    plane
        .launch_task(TaskSpec {
            name: task.to_string(),
            args: vec![
                "reshard".to_string(),
                "--from".to_string(),
                source.id.clone(),
                "--to".to_string(),
                standby_node.id.clone(),
                "--slots".to_string(),
                slots_to_move.to_string(),
            ],
            timeout_seconds: cx.spec.task_timeout_seconds,
        })
        .await?;

    status.record(
        "Resharding",
        format!("moving {slots_to_move} slots from {overloaded} into standby {standby_pod}"),
        plane.now(),
    );
    Ok(TASK_POLL)
}

/// Post-migration steps: restore the coverage guard, grow the replica
/// set by one shard group, and hand over to standby provisioning.
///
/// Also the crash-recovery entry point: the task record is still present
/// (the provisioning phase collects it), so a restarted controller lands
/// here again until the phase transition is durably persisted.
async fn finish(
    cx: &ClusterCx,
    plane: &dyn Orchestrator,
    admin: &dyn Admin,
    status: &mut ClusterStatus,
) -> anyhow::Result<Duration> {
    admin.set_full_coverage(true).await?;

    // The shard count is re-derived from the data plane rather than
    // incremented, so re-entry after a crash persists the same value.
    let nodes = admin.list_nodes().await?;
    let new_active = reconciler::slot_owning_primaries(&nodes);
    if new_active != cx.spec.active_shards + 1 {
        tracing::warn!(
            observed = new_active,
            expected = cx.spec.active_shards + 1,
            "unexpected active shard count after migration"
        );
    }

    plane.persist_active_shards(new_active).await?;
    if cx.manages_pods() {
        plane
            .resize(models::desired_pods(new_active, cx.spec.replicas_per_shard))
            .await?;
    }

    metrics::RESHARDS_COMPLETED.inc();
    let now = plane.now();
    status.phase = Phase::ProvisioningStandby { attempts: 0 };
    status.standby = None;
    status.last_scale_at = Some(now);
    status.record(
        "ScaledUp",
        format!("standby activated; {new_active} active shards"),
        now,
    );
    Ok(POLL_AGAIN)
}

/// Best-effort restoration of the coverage guard on the failure path.
async fn restore_coverage(admin: &dyn Admin) {
    if let Err(err) = admin.set_full_coverage(true).await {
        tracing::warn!(error = ?err, "could not restore full-coverage requirement");
    }
}
