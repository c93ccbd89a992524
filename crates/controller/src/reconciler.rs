//! The per-cluster reconciliation state machine.
//!
//! One tick reads the desired and observed state, dispatches on the
//! current phase, mutates the status, and returns the requeue delay. No
//! error escapes a tick: transient failures requeue unchanged, protocol
//! failures return the cluster to `Stable` under cooldown, and invariant
//! violations park it in `Failed` for the operator.

use crate::gate::{self, GateHold, GateOutcome};
use crate::plane::{Orchestrator, PodState};
use crate::scale_down::Drain;
use crate::{decision, metrics, provision, scale_down, scale_up, ClusterCx};
use anyhow::Context;
use models::{ClusterStatus, Phase};
use probe::MetricsSource;
use std::sync::Arc;
use std::time::Duration;
use topology::{Admin, NodeInfo, Role, SlotRange};

/// Requeue immediately: the tick wrote status and wants right back in.
pub const POLL_AGAIN: Duration = Duration::ZERO;
/// Short poll while an out-of-band task runs or pods come up.
pub const TASK_POLL: Duration = Duration::from_secs(10);
/// Settling time between the two drain migrations of a scale-down.
pub const STABILIZE_PAUSE: Duration = Duration::from_secs(5);

pub struct Reconciler {
    pub plane: Arc<dyn Orchestrator>,
    pub admin: Arc<dyn Admin>,
    pub metrics_source: Arc<dyn MetricsSource>,
}

impl Reconciler {
    #[tracing::instrument(
        skip_all,
        fields(cluster = %cx.name, phase = status.phase.name()),
    )]
    pub async fn tick(&self, cx: &ClusterCx, status: &mut ClusterStatus) -> Duration {
        let _timer = metrics::TICK_DURATION.start_timer();

        if let Err(err) = cx.spec.validate() {
            tracing::warn!(error = %err, "rejecting invalid spec");
            status.record("SpecInvalid", err.to_string(), self.plane.now());
            return cx.poll_interval();
        }

        let result = match status.phase.clone() {
            Phase::Uninitialized => self.on_uninitialized(cx, status).await,
            Phase::Stable => self.on_stable(cx, status).await,
            Phase::ScalingUp { overloaded } => {
                scale_up::advance(
                    cx,
                    self.plane.as_ref(),
                    self.admin.as_ref(),
                    status,
                    &overloaded,
                )
                .await
            }
            Phase::ProvisioningStandby { attempts } => {
                provision::advance(
                    cx,
                    self.plane.as_ref(),
                    self.admin.as_ref(),
                    status,
                    attempts,
                )
                .await
            }
            Phase::ScalingDown {
                victim,
                dest_a,
                dest_b,
                stage,
            } => {
                scale_down::advance(
                    cx,
                    self.plane.as_ref(),
                    self.admin.as_ref(),
                    status,
                    Drain {
                        victim,
                        dest_a,
                        dest_b,
                        stage,
                    },
                )
                .await
            }
            Phase::Failed { step, .. } => {
                tracing::debug!(%step, "cluster is failed; awaiting operator intervention");
                Ok(cx.poll_interval())
            }
        };

        match result {
            Ok(requeue) => requeue,
            Err(err) => {
                // Transient observation or I/O failure. Nothing was
                // persisted; the next tick re-reads and retries.
                tracing::warn!(error = ?err, "tick failed transiently; retrying shortly");
                TASK_POLL
            }
        }
    }

    async fn on_uninitialized(
        &self,
        cx: &ClusterCx,
        status: &mut ClusterStatus,
    ) -> anyhow::Result<Duration> {
        if cx.spec.existing_mode {
            self.discover(cx, status).await
        } else {
            self.bootstrap(cx, status).await
        }
    }

    /// The stable monitoring path: gates, probe, decide, act.
    async fn on_stable(
        &self,
        cx: &ClusterCx,
        status: &mut ClusterStatus,
    ) -> anyhow::Result<Duration> {
        if !cx.spec.auto_scale {
            return Ok(cx.poll_interval());
        }

        let pass = match gate::evaluate(cx, self.plane.as_ref(), self.admin.as_ref(), status)
            .await?
        {
            GateOutcome::Pass(pass) => pass,
            GateOutcome::Hold(GateHold::StandbyChanged { to }) => {
                // Persist the new identity and abandon the tick as a
                // stabilization window.
                status.record(
                    "StandbyChanged",
                    format!("standby is now {to}"),
                    self.plane.now(),
                );
                status.standby = Some(to);
                return Ok(cx.poll_interval());
            }
            GateOutcome::Hold(hold) => {
                tracing::debug!(reason = hold.reason(), detail = %hold, "gate held the tick");
                status.record(hold.reason(), hold.to_string(), self.plane.now());
                return Ok(cx.poll_interval());
            }
        };

        status.observed_shards = pass.actives.len() as i32 + 1;
        status.observed_replicas = pass.pod_count;

        let query = probe::Query {
            endpoint: cx.spec.metrics_endpoint.clone(),
            namespace: cx.namespace.clone(),
            cluster: cx.name.clone(),
            container: cx.container.clone(),
            primaries: pass.actives.iter().map(|a| a.pod.clone()).collect(),
        };
        let samples = match self.metrics_source.sample(&query).await {
            Ok(samples) if !samples.is_empty() => samples,
            Ok(_) => {
                // Metric starvation is not a failure; skip this tick.
                tracing::debug!("no metric samples; skipping tick");
                return Ok(cx.poll_interval());
            }
            Err(err) => {
                tracing::warn!(error = ?err, "metrics probe failed; skipping tick");
                return Ok(cx.poll_interval());
            }
        };

        match decision::decide(&cx.spec, &samples, &pass.actives) {
            decision::Verdict::None => Ok(cx.poll_interval()),
            decision::Verdict::Grow { trigger, reason } => {
                tracing::info!(%trigger, %reason, "grow verdict");
                status.record(
                    "ScaleUpStarted",
                    format!("{trigger}: {reason}"),
                    self.plane.now(),
                );
                status.phase = Phase::ScalingUp {
                    overloaded: trigger,
                };
                Ok(POLL_AGAIN)
            }
            decision::Verdict::Shrink {
                victim,
                dest_a,
                dest_b,
            } => {
                tracing::info!(%victim, %dest_a, ?dest_b, "shrink verdict");
                status.record(
                    "ScaleDownStarted",
                    match &dest_b {
                        Some(dest_b) => {
                            format!("draining {victim} into {dest_a} and {dest_b}")
                        }
                        None => format!("draining {victim} into {dest_a}"),
                    },
                    self.plane.now(),
                );
                status.phase = Phase::ScalingDown {
                    victim,
                    dest_a,
                    dest_b,
                    stage: models::DrainStage::DrainFirstHalf,
                };
                Ok(POLL_AGAIN)
            }
        }
    }

    /// Creates and wires the initial topology of a controller-managed
    /// deployment. Idempotent across ticks: members already joined,
    /// slices already assigned, and replicas already attached are left
    /// alone.
    async fn bootstrap(
        &self,
        cx: &ClusterCx,
        status: &mut ClusterStatus,
    ) -> anyhow::Result<Duration> {
        let desired = cx.spec.desired_pods();
        self.plane.ensure_replica_set(desired).await?;

        let pods = self.plane.pods().await?;
        if (pods.len() as i32) != desired || pods.iter().any(|p| !p.ready) {
            status.record(
                "Bootstrapping",
                format!("waiting for {desired} ready pods"),
                self.plane.now(),
            );
            return Ok(TASK_POLL);
        }

        let mut nodes = self.admin.list_nodes().await?;
        for pod in &pods {
            if node_for_pod(&nodes, pod).is_none() {
                self.admin.add_primary(&pod_addr_of(pod)?).await?;
            }
        }
        nodes = self.admin.list_nodes().await?;
        if pods.iter().any(|p| node_for_pod(&nodes, p).is_none()) {
            // Gossip is still spreading the introductions.
            return Ok(TASK_POLL);
        }

        let replicas = cx.spec.replicas_per_shard;
        for shard in 0..cx.spec.active_shards {
            let ordinal = models::primary_ordinal(shard, replicas);
            let pod = pod_at(&pods, ordinal).context("bootstrap primary pod missing")?;
            let node = node_for_pod(&nodes, pod).context("bootstrap primary not a member")?;
            if node.slot_count() == 0 {
                self.admin
                    .assign_slots(
                        &pod_addr_of(pod)?,
                        &[bootstrap_slice(shard, cx.spec.active_shards)],
                    )
                    .await
                    .with_context(|| format!("assigning slots to {}", pod.name))?;
            }
        }

        // Attach replicas of every group, the standby's included.
        for shard in 0..=cx.spec.active_shards {
            let primary_ordinal = models::primary_ordinal(shard, replicas);
            let primary_pod = pod_at(&pods, primary_ordinal).context("primary pod missing")?;
            let primary_node =
                node_for_pod(&nodes, primary_pod).context("primary not a member")?;
            for ordinal in models::replica_ordinals(primary_ordinal, replicas) {
                let pod = pod_at(&pods, ordinal).context("replica pod missing")?;
                let attached = node_for_pod(&nodes, pod)
                    .is_some_and(|n| n.primary_id.as_deref() == Some(primary_node.id.as_str()));
                if !attached {
                    self.admin
                        .add_replica(&pod_addr_of(pod)?, &primary_node.id)
                        .await
                        .with_context(|| format!("attaching replica {}", pod.name))?;
                }
            }
        }

        if !self.admin.health().await? {
            status.record(
                "Bootstrapping",
                "waiting for cluster health",
                self.plane.now(),
            );
            return Ok(TASK_POLL);
        }

        let standby_ordinal =
            models::standby_primary_ordinal(cx.spec.active_shards, replicas);
        let standby = pod_at(&pods, standby_ordinal)
            .context("standby pod missing")?
            .name
            .clone();
        let now = self.plane.now();
        status.phase = Phase::Stable;
        status.standby = Some(standby);
        status.observed_shards = cx.spec.active_shards + 1;
        status.observed_replicas = pods.len() as i32;
        status.record("Bootstrapped", "initial topology created", now);
        Ok(POLL_AGAIN)
    }

    /// Adopts an externally-managed deployment. The standby is found by
    /// querying the data plane for the unique zero-slot primary, never
    /// inferred from pod ordinals.
    async fn discover(
        &self,
        cx: &ClusterCx,
        status: &mut ClusterStatus,
    ) -> anyhow::Result<Duration> {
        let pods = self.plane.pods().await?;
        if pods.is_empty() {
            status.record(
                "Discovering",
                "no pods matched the discovery selector",
                self.plane.now(),
            );
            return Ok(cx.poll_interval());
        }

        let nodes = self.admin.list_nodes().await?;
        let mut zero_slot = nodes
            .iter()
            .filter(|n| n.role == Role::Primary && !n.is_ghost() && n.slot_count() == 0);
        let standby_node = match (zero_slot.next(), zero_slot.next()) {
            (Some(node), None) => node,
            (None, _) => {
                status.record(
                    "StandbyUnidentified",
                    "no zero-slot primary in the discovered cluster",
                    self.plane.now(),
                );
                return Ok(cx.poll_interval());
            }
            (Some(_), Some(_)) => {
                status.record(
                    "StandbyUnidentified",
                    "multiple zero-slot primaries in the discovered cluster",
                    self.plane.now(),
                );
                return Ok(cx.poll_interval());
            }
        };

        let Some(standby_pod) = pods
            .iter()
            .find(|p| p.ip.as_deref() == Some(standby_node.host()))
        else {
            status.record(
                "TopologyMismatch",
                format!("standby {} maps to no discovered pod", standby_node.addr),
                self.plane.now(),
            );
            return Ok(cx.poll_interval());
        };

        let primaries = nodes
            .iter()
            .filter(|n| n.role == Role::Primary && !n.is_ghost())
            .count();
        let now = self.plane.now();
        status.phase = Phase::Stable;
        status.standby = Some(standby_pod.name.clone());
        status.observed_shards = primaries as i32;
        status.observed_replicas = pods.len() as i32;
        status.record("Discovered", "adopted externally-managed cluster", now);
        Ok(POLL_AGAIN)
    }
}

/// Even slice of the slot space owned by `shard` at bootstrap.
fn bootstrap_slice(shard: i32, active: i32) -> SlotRange {
    let space = i32::from(topology::SLOT_SPACE);
    SlotRange {
        start: (shard * space / active) as u16,
        end: ((shard + 1) * space / active - 1) as u16,
    }
}

/// Marks a recoverable protocol failure: the cluster returns to `Stable`
/// and `lastScaleAt` advances so a failing protocol backs off through the
/// cooldown instead of busy-looping.
pub(crate) fn protocol_failed(
    plane: &dyn Orchestrator,
    status: &mut ClusterStatus,
    step: &'static str,
    detail: String,
) {
    metrics::PROTOCOL_FAILURES.with_label_values(&[step]).inc();
    tracing::warn!(step, %detail, "scaling protocol failed; returning to stable");
    let now = plane.now();
    status.record("ProtocolFailed", detail, now);
    status.phase = Phase::Stable;
    status.last_scale_at = Some(now);
}

/// Marks a protocol invariant violation. No automatic recovery.
pub(crate) fn protocol_fatal(
    plane: &dyn Orchestrator,
    status: &mut ClusterStatus,
    step: &'static str,
    detail: String,
) {
    metrics::PROTOCOL_FAILURES.with_label_values(&[step]).inc();
    tracing::error!(step, %detail, "protocol invariant violated; operator intervention required");
    status.record("ProtocolFatal", detail.clone(), plane.now());
    status.phase = Phase::Failed {
        step: step.to_string(),
        detail,
    };
}

pub(crate) fn pod_named<'p>(pods: &'p [PodState], name: &str) -> Option<&'p PodState> {
    pods.iter().find(|p| p.name == name)
}

pub(crate) fn pod_at(pods: &[PodState], ordinal: i32) -> Option<&PodState> {
    pods.iter().find(|p| p.ordinal == ordinal)
}

/// Joins a pod to its data-plane membership entry by IP.
pub(crate) fn node_for_pod<'n>(nodes: &'n [NodeInfo], pod: &PodState) -> Option<&'n NodeInfo> {
    let ip = pod.ip.as_deref()?;
    nodes.iter().find(|n| n.host() == ip && !n.noaddr)
}

/// Client address of a pod, from its IP.
pub(crate) fn pod_addr_of(pod: &PodState) -> anyhow::Result<String> {
    let ip = pod
        .ip
        .as_deref()
        .with_context(|| format!("pod {} has no IP", pod.name))?;
    Ok(format!("{ip}:{}", models::client_port()))
}

/// Count of healthy primaries that own at least one slot.
pub(crate) fn slot_owning_primaries(nodes: &[NodeInfo]) -> i32 {
    nodes
        .iter()
        .filter(|n| n.role == Role::Primary && !n.is_ghost() && n.slot_count() > 0)
        .count() as i32
}

/// Resolves the member id of a freshly joined node, waiting out gossip.
pub(crate) async fn resolve_node_id_by_ip(
    admin: &dyn Admin,
    ip: &str,
) -> anyhow::Result<String> {
    for _ in 0..10 {
        let nodes = admin.list_nodes().await?;
        if let Some(node) = nodes.iter().find(|n| n.host() == ip && !n.noaddr) {
            return Ok(node.id.clone());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    anyhow::bail!("node at {ip} never appeared in the membership")
}
