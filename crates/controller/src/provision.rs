//! Standby provisioning: onboard the freshly created tail pods as the
//! cluster's new zero-slot standby (primary plus replicas).

use crate::plane::Orchestrator;
use crate::reconciler::{
    node_for_pod, pod_addr_of, pod_at, protocol_fatal, resolve_node_id_by_ip, POLL_AGAIN, TASK_POLL,
};
use crate::{scale_up, ClusterCx};
use anyhow::Context;
use models::{ClusterStatus, Phase};
use std::time::Duration;
use topology::Admin;

/// Join attempts before the protocol gives up and fails the cluster.
pub const PROVISION_RETRY_LIMIT: i32 = 5;

pub async fn advance(
    cx: &ClusterCx,
    plane: &dyn Orchestrator,
    admin: &dyn Admin,
    status: &mut ClusterStatus,
    attempts: i32,
) -> anyhow::Result<Duration> {
    // The scale-up phase left its completed task on record as the crash
    // witness; the phase transition is durable now, so collect it.
    plane
        .delete_task(&cx.task_name(scale_up::RESHARD_TASK))
        .await?;

    let replicas = cx.spec.replicas_per_shard;
    // `activeShards` was already bumped when scale-up completed, so the
    // conventional tail position is the standby being provisioned.
    let primary_ordinal = models::standby_primary_ordinal(cx.spec.active_shards, replicas);
    let group: Vec<i32> = std::iter::once(primary_ordinal)
        .chain(models::replica_ordinals(primary_ordinal, replicas))
        .collect();

    // Wait (without consuming an attempt) until the whole tail group is
    // running and ready.
    let pods = plane.pods().await?;
    for ordinal in &group {
        match pod_at(&pods, *ordinal) {
            Some(pod) if pod.ready => {}
            _ => return Ok(TASK_POLL),
        }
    }

    match join_tail(plane, admin, primary_ordinal, &group).await {
        Ok(standby_pod) => {
            let now = plane.now();
            status.phase = Phase::Stable;
            status.standby = Some(standby_pod.clone());
            status.observed_shards = cx.spec.active_shards + 1;
            status.observed_replicas = pods.len() as i32;
            status.record(
                "StandbyProvisioned",
                format!("{standby_pod} joined as the new standby"),
                now,
            );
            Ok(POLL_AGAIN)
        }
        Err(err) => {
            let attempts = attempts + 1;
            if attempts >= PROVISION_RETRY_LIMIT {
                protocol_fatal(
                    plane,
                    status,
                    "provision",
                    format!("standby join failed {attempts} times, last: {err:#}"),
                );
            } else {
                status.record(
                    "ProvisionRetry",
                    format!("standby join attempt {attempts} failed: {err:#}"),
                    plane.now(),
                );
                status.phase = Phase::ProvisioningStandby { attempts };
            }
            Ok(TASK_POLL)
        }
    }
}

/// Joins the tail primary as an empty member, then attaches each of its
/// replicas. Idempotent: members already joined are left alone.
async fn join_tail(
    plane: &dyn Orchestrator,
    admin: &dyn Admin,
    primary_ordinal: i32,
    group: &[i32],
) -> anyhow::Result<String> {
    let pods = plane.pods().await?;
    let nodes = admin.list_nodes().await?;

    let primary_pod = pod_at(&pods, primary_ordinal).context("tail primary pod disappeared")?;
    let primary_ip = primary_pod
        .ip
        .as_deref()
        .context("tail primary pod has no IP")?;

    let primary_id = match node_for_pod(&nodes, primary_pod) {
        Some(node) if node.slot_count() == 0 => node.id.clone(),
        Some(node) => anyhow::bail!(
            "joining pod {} already owns {} slots",
            primary_pod.name,
            node.slot_count()
        ),
        None => {
            admin.add_primary(&pod_addr_of(primary_pod)?).await?;
            resolve_node_id_by_ip(admin, primary_ip).await?
        }
    };

    for ordinal in group.iter().skip(1) {
        let pod = pod_at(&pods, *ordinal).context("tail replica pod disappeared")?;
        let already_attached = node_for_pod(&nodes, pod)
            .is_some_and(|n| n.primary_id.as_deref() == Some(primary_id.as_str()));
        if already_attached {
            continue;
        }
        admin
            .add_replica(&pod_addr_of(pod)?, &primary_id)
            .await
            .with_context(|| format!("attaching replica {}", pod.name))?;
    }

    Ok(primary_pod.name.clone())
}
