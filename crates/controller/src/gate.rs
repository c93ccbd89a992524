//! Pre-scaling invariants. A verdict is considered only when every gate
//! holds; any failing gate soft-requeues the tick with a recorded reason.

use crate::plane::{Orchestrator, TaskState};
use crate::ClusterCx;
use models::ClusterStatus;
use topology::{Admin, NodeInfo, Role};

/// One active (slot-owning or about-to-own) primary, joined across the
/// orchestrator and the data plane.
#[derive(Clone, Debug, PartialEq)]
pub struct ActivePrimary {
    pub pod: String,
    pub ordinal: i32,
    pub node_id: String,
    pub slots: u16,
}

/// Everything the decision path needs once the gates pass.
#[derive(Debug)]
pub struct GatePass {
    /// Membership snapshot the gates were evaluated against.
    pub nodes: Vec<NodeInfo>,
    /// Pod identity of the unique zero-slot primary.
    pub standby_pod: String,
    pub standby_node_id: String,
    /// Active primaries, ordinal-sorted, standby excluded.
    pub actives: Vec<ActivePrimary>,
    /// Pods observed in the replica set.
    pub pod_count: i32,
}

#[derive(Debug, PartialEq)]
pub enum GateHold {
    Cooldown { remaining_seconds: i64 },
    ReplicaSetMissing,
    PodCountMismatch { want: i32, have: i32 },
    PodNotReady { pod: String },
    TaskInFlight { name: String, state: TaskState },
    StandbyUnidentified { zero_slot_primaries: usize },
    StandbyNotReady { pod: String },
    /// Standby identity changed; the new identity must be persisted and
    /// the tick abandoned as a stabilization window.
    StandbyChanged { to: String },
    TopologyMismatch { detail: String },
}

pub enum GateOutcome {
    Pass(GatePass),
    Hold(GateHold),
}

impl GateHold {
    pub fn reason(&self) -> &'static str {
        match self {
            GateHold::Cooldown { .. } => "CooldownActive",
            GateHold::ReplicaSetMissing => "ReplicaSetMissing",
            GateHold::PodCountMismatch { .. } => "PodCountMismatch",
            GateHold::PodNotReady { .. } => "PodNotReady",
            GateHold::TaskInFlight { .. } => "TaskInFlight",
            GateHold::StandbyUnidentified { .. } => "StandbyUnidentified",
            GateHold::StandbyNotReady { .. } => "StandbyNotReady",
            GateHold::StandbyChanged { .. } => "StandbyChanged",
            GateHold::TopologyMismatch { .. } => "TopologyMismatch",
        }
    }
}

impl std::fmt::Display for GateHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateHold::Cooldown { remaining_seconds } => {
                write!(f, "cooldown remaining {remaining_seconds}s")
            }
            GateHold::ReplicaSetMissing => write!(f, "replica set does not exist yet"),
            GateHold::PodCountMismatch { want, have } => {
                write!(f, "expected {want} pods, observed {have}")
            }
            GateHold::PodNotReady { pod } => write!(f, "pod {pod} is not ready"),
            GateHold::TaskInFlight { name, state } => {
                write!(f, "scaling task {name} is present ({state:?})")
            }
            GateHold::StandbyUnidentified { zero_slot_primaries } => write!(
                f,
                "expected exactly one zero-slot primary, found {zero_slot_primaries}"
            ),
            GateHold::StandbyNotReady { pod } => write!(f, "standby pod {pod} is not ready"),
            GateHold::StandbyChanged { to } => write!(f, "standby is now {to}; stabilizing"),
            GateHold::TopologyMismatch { detail } => write!(f, "{detail}"),
        }
    }
}

/// Evaluates every pre-scaling gate in order. `Err` is a transient
/// observation failure; a `Hold` is an orderly refusal with its reason.
pub async fn evaluate(
    cx: &ClusterCx,
    plane: &dyn Orchestrator,
    admin: &dyn Admin,
    status: &ClusterStatus,
) -> anyhow::Result<GateOutcome> {
    // Cooldown, measured from the completion of the last protocol.
    if let Some(last) = status.last_scale_at {
        let elapsed = plane.now() - last;
        if elapsed < cx.cooldown() {
            let remaining_seconds = (cx.cooldown() - elapsed).num_seconds().max(1);
            return Ok(GateOutcome::Hold(GateHold::Cooldown { remaining_seconds }));
        }
    }

    // The replica set must be exactly at the desired shape, fully ready.
    let want = cx.spec.desired_pods();
    if !cx.spec.existing_mode && plane.desired_pods().await?.is_none() {
        return Ok(GateOutcome::Hold(GateHold::ReplicaSetMissing));
    }
    let pods = plane.pods().await?;
    if pods.len() as i32 != want {
        return Ok(GateOutcome::Hold(GateHold::PodCountMismatch {
            want,
            have: pods.len() as i32,
        }));
    }
    if let Some(pod) = pods.iter().find(|p| !p.ready) {
        return Ok(GateOutcome::Hold(GateHold::PodNotReady {
            pod: pod.name.clone(),
        }));
    }

    // No scaling task may be running or lingering.
    if let Some((name, state)) = plane.any_task().await? {
        if state == TaskState::Succeeded {
            // A completed task that was never collected; clean it up and
            // hold one tick.
            plane.delete_task(&name).await?;
        }
        return Ok(GateOutcome::Hold(GateHold::TaskInFlight { name, state }));
    }

    let nodes = admin.list_nodes().await?;

    // Forget membership entries of unreachable or failed nodes before
    // they can confuse standby detection or a later drain.
    for ghost in nodes.iter().filter(|n| n.is_ghost()) {
        tracing::info!(id = %ghost.id, addr = %ghost.addr, "forgetting ghost node");
        if let Err(err) = admin.forget(&ghost.id).await {
            tracing::warn!(id = %ghost.id, error = ?err, "ghost cleanup failed");
        }
    }

    // Join data-plane membership with orchestrator pods by IP.
    let by_ip: std::collections::BTreeMap<&str, &crate::PodState> = pods
        .iter()
        .filter_map(|p| p.ip.as_deref().map(|ip| (ip, p)))
        .collect();

    let mut zero_slot: Vec<(&NodeInfo, &crate::PodState)> = Vec::new();
    let mut actives: Vec<ActivePrimary> = Vec::new();
    for node in nodes
        .iter()
        .filter(|n| n.role == Role::Primary && !n.is_ghost())
    {
        let Some(pod) = by_ip.get(node.host()).copied() else {
            return Ok(GateOutcome::Hold(GateHold::TopologyMismatch {
                detail: format!("primary {} maps to no pod of this cluster", node.addr),
            }));
        };
        if node.slot_count() == 0 {
            zero_slot.push((node, pod));
        } else {
            actives.push(ActivePrimary {
                pod: pod.name.clone(),
                ordinal: pod.ordinal,
                node_id: node.id.clone(),
                slots: node.slot_count(),
            });
        }
    }

    let (standby_node, standby_pod) = match zero_slot.as_slice() {
        [(node, pod)] => (*node, *pod),
        others => {
            return Ok(GateOutcome::Hold(GateHold::StandbyUnidentified {
                zero_slot_primaries: others.len(),
            }))
        }
    };
    if !standby_pod.ready {
        return Ok(GateOutcome::Hold(GateHold::StandbyNotReady {
            pod: standby_pod.name.clone(),
        }));
    }

    // A changed standby identity is persisted by the caller and the tick
    // is abandoned as a stabilization window.
    if status.standby.as_deref() != Some(standby_pod.name.as_str()) {
        return Ok(GateOutcome::Hold(GateHold::StandbyChanged {
            to: standby_pod.name.clone(),
        }));
    }

    actives.sort_by_key(|a| a.ordinal);
    if actives.len() as i32 != cx.spec.active_shards {
        return Ok(GateOutcome::Hold(GateHold::TopologyMismatch {
            detail: format!(
                "expected {} slot-owning primaries, observed {}",
                cx.spec.active_shards,
                actives.len()
            ),
        }));
    }

    // By convention the standby sits at the tail primary position; the
    // detected identity wins, but a drifted convention is worth a note.
    let conventional =
        models::standby_primary_ordinal(cx.spec.active_shards, cx.spec.replicas_per_shard);
    if standby_pod.ordinal != conventional {
        tracing::warn!(
            standby = %standby_pod.name,
            expected_ordinal = conventional,
            "standby is off the conventional tail position"
        );
    }

    Ok(GateOutcome::Pass(GatePass {
        standby_pod: standby_pod.name.clone(),
        standby_node_id: standby_node.id.clone(),
        actives,
        pod_count: pods.len() as i32,
        nodes,
    }))
}
