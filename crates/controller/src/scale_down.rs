//! Scale-down: drain one victim primary, then rotate it into the standby
//! role while the old standby's pods are excised and reclaimed.
//!
//! Drain moves the victim's slots to the destinations as two sequential
//! out-of-band tasks with a stabilization pause between them. Rotation is
//! the subtle part: slot migration alone would leave membership entries
//! pointing at the ordered replica set's tail, and a bare replica-set
//! shrink would orphan them as phantom primaries. The del / reset / re-add
//! sequence matches membership to the intended index layout before the
//! shrink lands.

use crate::plane::{Orchestrator, TaskSpec, TaskState};
use crate::reconciler::{
    node_for_pod, pod_addr_of, pod_at, pod_named, protocol_failed, protocol_fatal,
    resolve_node_id_by_ip, slot_owning_primaries, POLL_AGAIN, STABILIZE_PAUSE, TASK_POLL,
};
use crate::{metrics, ClusterCx};
use anyhow::Context;
use models::{ClusterStatus, DrainStage, Phase};
use std::time::Duration;
use topology::{Admin, NodeInfo};

/// Task-name suffixes of the two drain migrations.
pub const DRAIN_TASK_A: &str = "drain-1";
pub const DRAIN_TASK_B: &str = "drain-2";

/// Witness fields of an in-flight scale-down.
#[derive(Clone, Debug)]
pub struct Drain {
    pub victim: String,
    pub dest_a: String,
    pub dest_b: Option<String>,
    pub stage: DrainStage,
}

impl Drain {
    fn phase(&self, stage: DrainStage) -> Phase {
        Phase::ScalingDown {
            victim: self.victim.clone(),
            dest_a: self.dest_a.clone(),
            dest_b: self.dest_b.clone(),
            stage,
        }
    }
}

pub async fn advance(
    cx: &ClusterCx,
    plane: &dyn Orchestrator,
    admin: &dyn Admin,
    status: &mut ClusterStatus,
    drain: Drain,
) -> anyhow::Result<Duration> {
    match drain.stage {
        DrainStage::DrainFirstHalf => first_half(cx, plane, admin, status, &drain).await,
        DrainStage::DrainSecondHalf => second_half(cx, plane, admin, status, &drain).await,
        DrainStage::Rotate => rotate(cx, plane, admin, status, &drain).await,
    }
}

async fn first_half(
    cx: &ClusterCx,
    plane: &dyn Orchestrator,
    admin: &dyn Admin,
    status: &mut ClusterStatus,
    drain: &Drain,
) -> anyhow::Result<Duration> {
    let task = cx.task_name(DRAIN_TASK_A);
    match plane.find_task(&task).await? {
        Some(TaskState::Running) => Ok(TASK_POLL),
        Some(TaskState::Failed) => {
            plane.delete_task(&task).await?;
            restore_coverage(admin).await;
            protocol_failed(
                plane,
                status,
                "drain",
                format!("drain task {task} failed or timed out"),
            );
            Ok(POLL_AGAIN)
        }
        Some(TaskState::Succeeded) => {
            plane.delete_task(&task).await?;
            if drain.dest_b.is_some() {
                status.phase = drain.phase(DrainStage::DrainSecondHalf);
                // Let the migrated half settle before moving the rest.
                Ok(STABILIZE_PAUSE)
            } else {
                admin.set_full_coverage(true).await?;
                status.phase = drain.phase(DrainStage::Rotate);
                Ok(POLL_AGAIN)
            }
        }
        None => start_drain(cx, plane, admin, status, drain, &task).await,
    }
}

/// Pre-drain checks, ghost cleanup, and the first migration launch.
async fn start_drain(
    cx: &ClusterCx,
    plane: &dyn Orchestrator,
    admin: &dyn Admin,
    status: &mut ClusterStatus,
    drain: &Drain,
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

    let nodes = admin.list_nodes().await?;
    for ghost in nodes.iter().filter(|n| n.is_ghost()) {
        tracing::info!(id = %ghost.id, "forgetting ghost node before drain");
        if let Err(err) = admin.forget(&ghost.id).await {
            tracing::warn!(id = %ghost.id, error = ?err, "ghost cleanup failed");
        }
    }

    let pods = plane.pods().await?;

    // The standby should still be empty. Stray slots there are survivable
    // for a drain (it is not a destination), so warn and continue.
    if let Some(standby) = status.standby.clone() {
        let standby_slots = pod_named(&pods, &standby)
            .and_then(|p| node_for_pod(&nodes, p))
            .map_or(0, NodeInfo::slot_count);
        if standby_slots > 0 {
            tracing::warn!(%standby, slots = standby_slots, "standby holds slots during drain");
            status.record(
                "StandbyNotEmpty",
                format!("standby {standby} holds {standby_slots} slots during drain"),
                plane.now(),
            );
        }
    }

    let Some(victim) = pod_named(&pods, &drain.victim).and_then(|p| node_for_pod(&nodes, p))
    else {
        protocol_failed(
            plane,
            status,
            "resolve",
            format!("drain victim {} maps to no cluster member", drain.victim),
        );
        return Ok(POLL_AGAIN);
    };
    let Some(dest_a) = pod_named(&pods, &drain.dest_a).and_then(|p| node_for_pod(&nodes, p))
    else {
        protocol_failed(
            plane,
            status,
            "resolve",
            format!("drain destination {} maps to no cluster member", drain.dest_a),
        );
        return Ok(POLL_AGAIN);
    };

    let victim_slots = victim.slot_count();
    if victim_slots == 0 {
        // Already drained (or re-entering after a crash): straight to
        // rotation.
        status.phase = drain.phase(DrainStage::Rotate);
        return Ok(POLL_AGAIN);
    }

    let first_share = if drain.dest_b.is_some() {
        victim_slots / 2
    } else {
        victim_slots
    };

    admin.set_full_coverage(false).await?;
    plane
        .launch_task(TaskSpec {
            name: task.to_string(),
            args: vec![
                "reshard".to_string(),
                "--from".to_string(),
                victim.id.clone(),
                "--to".to_string(),
                dest_a.id.clone(),
                "--slots".to_string(),
                first_share.to_string(),
            ],
            timeout_seconds: cx.spec.task_timeout_seconds,
        })
        .await?;

    status.record(
        "Draining",
        format!(
            "moving {first_share} of {victim_slots} slots from {} to {}",
            drain.victim, drain.dest_a
        ),
        plane.now(),
    );
    Ok(TASK_POLL)
}

async fn second_half(
    cx: &ClusterCx,
    plane: &dyn Orchestrator,
    admin: &dyn Admin,
    status: &mut ClusterStatus,
    drain: &Drain,
) -> anyhow::Result<Duration> {
    let task = cx.task_name(DRAIN_TASK_B);
    let dest_b = drain
        .dest_b
        .clone()
        .context("second drain stage without a second destination")?;

    match plane.find_task(&task).await? {
        Some(TaskState::Running) => Ok(TASK_POLL),
        Some(TaskState::Failed) => {
            plane.delete_task(&task).await?;
            restore_coverage(admin).await;
            protocol_failed(
                plane,
                status,
                "drain",
                format!("drain task {task} failed or timed out"),
            );
            Ok(POLL_AGAIN)
        }
        Some(TaskState::Succeeded) => {
            plane.delete_task(&task).await?;
            admin.set_full_coverage(true).await?;
            status.phase = drain.phase(DrainStage::Rotate);
            Ok(POLL_AGAIN)
        }
        None => {
            let pods = plane.pods().await?;
            let nodes = admin.list_nodes().await?;
            let Some(victim) =
                pod_named(&pods, &drain.victim).and_then(|p| node_for_pod(&nodes, p))
            else {
                protocol_failed(
                    plane,
                    status,
                    "resolve",
                    format!("drain victim {} maps to no cluster member", drain.victim),
                );
                return Ok(POLL_AGAIN);
            };
            // Whatever the first migration left behind goes to the second
            // destination, which keeps this stage restart-safe.
            let remaining = victim.slot_count();
            if remaining == 0 {
                admin.set_full_coverage(true).await?;
                status.phase = drain.phase(DrainStage::Rotate);
                return Ok(POLL_AGAIN);
            }
            let Some(dest) = pod_named(&pods, &dest_b).and_then(|p| node_for_pod(&nodes, p))
            else {
                protocol_failed(
                    plane,
                    status,
                    "resolve",
                    format!("drain destination {dest_b} maps to no cluster member"),
                );
                return Ok(POLL_AGAIN);
            };

            plane
                .launch_task(TaskSpec {
                    name: task.clone(),
                    args: vec![
                        "reshard".to_string(),
                        "--from".to_string(),
                        victim.id.clone(),
                        "--to".to_string(),
                        dest.id.clone(),
                        "--slots".to_string(),
                        remaining.to_string(),
                    ],
                    timeout_seconds: cx.spec.task_timeout_seconds,
                })
                .await?;
            status.record(
                "Draining",
                format!(
                    "moving remaining {remaining} slots from {} to {dest_b}",
                    drain.victim
                ),
                plane.now(),
            );
            Ok(TASK_POLL)
        }
    }
}

/// Rotate the drained victim into the standby role.
///
/// Membership of every pod at or above the victim's position (the victim
/// group and the old standby group) is deleted; the victim's pods are
/// reset to empty; the replica set shrinks by one group, deleting the old
/// standby's pods; the victim rejoins as a fresh zero-slot primary with
/// its replicas re-attached.
async fn rotate(
    cx: &ClusterCx,
    plane: &dyn Orchestrator,
    admin: &dyn Admin,
    status: &mut ClusterStatus,
    drain: &Drain,
) -> anyhow::Result<Duration> {
    let pods = plane.pods().await?;
    let nodes = admin.list_nodes().await?;
    let replicas = cx.spec.replicas_per_shard;

    let Some(victim_pod) = pod_named(&pods, &drain.victim) else {
        protocol_failed(
            plane,
            status,
            "rotate",
            format!("victim pod {} disappeared before rotation", drain.victim),
        );
        return Ok(POLL_AGAIN);
    };
    let victim_ordinal = victim_pod.ordinal;
    let victim_group: Vec<i32> = std::iter::once(victim_ordinal)
        .chain(models::replica_ordinals(victim_ordinal, replicas))
        .collect();

    // The victim's pods are about to be flushed and hard-reset so they
    // rejoin empty under reused ordinals. That discards whatever they
    // hold, which is only sound if they own no slots: the drain just
    // emptied the primary, and replicas own none by definition. Verify
    // rather than assume.
    for ordinal in &victim_group {
        let Some(pod) = pod_at(&pods, *ordinal) else {
            continue;
        };
        if let Some(node) = node_for_pod(&nodes, pod) {
            if node.slot_count() > 0 {
                protocol_fatal(
                    plane,
                    status,
                    "rotate",
                    format!(
                        "pod {} still owns {} slots; refusing to reset it",
                        pod.name,
                        node.slot_count()
                    ),
                );
                return Ok(POLL_AGAIN);
            }
        }
    }

    // The shrunken shard count is the victim's shard index: it was the
    // highest-index active primary. Deriving it from the ordinal keeps
    // rotation idempotent across crashes and spec re-reads.
    let new_active = models::shard_of_ordinal(victim_ordinal, replicas);
    let observed = slot_owning_primaries(&nodes);
    if observed != new_active {
        tracing::warn!(
            observed,
            expected = new_active,
            "unexpected active shard count entering rotation"
        );
    }

    // 1. Delete the membership of every pod at or above the victim's
    //    position: the victim group (rejoining empty) and the old standby
    //    group (whose pods the shrink below will delete).
    for pod in pods.iter().filter(|p| p.ordinal >= victim_ordinal) {
        if let Some(node) = node_for_pod(&nodes, pod) {
            admin
                .del_node(&node.id)
                .await
                .with_context(|| format!("removing membership of {}", pod.name))?;
        }
    }

    // 2. Reset the victim's pods so they can rejoin empty.
    for ordinal in &victim_group {
        if let Some(pod) = pod_at(&pods, *ordinal) {
            admin
                .reset_hard(&pod_addr_of(pod)?)
                .await
                .with_context(|| format!("resetting {}", pod.name))?;
        }
    }

    // 3. Shrink: spec first, then the replica set. The highest-indexed
    //    pods deleted by the shrink are, by construction, the old
    //    standby's.
    plane.persist_active_shards(new_active).await?;
    if cx.manages_pods() {
        plane
            .resize(models::desired_pods(new_active, replicas))
            .await?;
    }

    // 4. Rejoin the drained victim as the fresh standby and re-attach
    //    its replicas.
    admin.add_primary(&pod_addr_of(victim_pod)?).await?;
    let victim_ip = victim_pod.ip.as_deref().context("victim pod has no IP")?;
    let standby_id = resolve_node_id_by_ip(admin, victim_ip).await?;
    for ordinal in victim_group.iter().skip(1) {
        if let Some(pod) = pod_at(&pods, *ordinal) {
            admin
                .add_replica(&pod_addr_of(pod)?, &standby_id)
                .await
                .with_context(|| format!("re-attaching replica {}", pod.name))?;
        }
    }

    // 5. Persist the rotation.
    metrics::DRAINS_COMPLETED.inc();
    let now = plane.now();
    status.phase = Phase::Stable;
    status.standby = Some(drain.victim.clone());
    status.observed_shards = new_active + 1;
    status.observed_replicas = models::desired_pods(new_active, replicas);
    status.last_scale_at = Some(now);
    status.record(
        "ScaledDown",
        format!(
            "{} drained and rotated to standby; {new_active} active shards",
            drain.victim
        ),
        now,
    );
    Ok(POLL_AGAIN)
}

async fn restore_coverage(admin: &dyn Admin) {
    if let Err(err) = admin.set_full_coverage(true).await {
        tracing::warn!(error = ?err, "could not restore full-coverage requirement");
    }
}
