//! Deterministic in-memory collaborators for protocol tests: a scripted
//! orchestrator, a fake data plane, and a fixed metrics source.

use crate::plane::{Orchestrator, PodState, TaskSpec, TaskState};
use crate::{ClusterCx, Reconciler};
use chrono::{DateTime, TimeZone, Utc};
use probe::{MetricsSource, Query, Sample};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use topology::{Admin, NodeInfo, Role, SlotRange};

pub fn test_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
}

pub fn cluster_cx(active_shards: i32, replicas_per_shard: i32) -> ClusterCx {
    let spec: models::ClusterSpec = serde_json::from_value(serde_json::json!({
        "activeShards": active_shards,
        "minShards": 3,
        "replicasPerShard": replicas_per_shard,
        "autoScale": true,
        "cpuHigh": 70, "cpuLow": 20,
        "memHigh": 70, "memLow": 30,
        "cooldownSeconds": 60,
        "taskTimeoutSeconds": 120,
        "pollIntervalSeconds": 30,
        "metricsEndpoint": "http://prometheus:9090",
    }))
    .unwrap();
    ClusterCx {
        name: "kv".to_string(),
        namespace: "default".to_string(),
        service: "kv".to_string(),
        container: "store".to_string(),
        spec,
    }
}

pub fn pod_ip(ordinal: i32) -> String {
    format!("10.0.0.{}", 10 + ordinal)
}

pub fn node_id(ordinal: i32) -> String {
    format!("{:040}", ordinal)
}

fn make_pods(cx: &ClusterCx) -> Vec<PodState> {
    (0..cx.spec.desired_pods())
        .map(|ordinal| PodState {
            name: cx.pod_name(ordinal),
            ordinal,
            ip: Some(pod_ip(ordinal)),
            ready: true,
        })
        .collect()
}

fn primary_node(ordinal: i32, slots: Vec<SlotRange>) -> NodeInfo {
    NodeInfo {
        id: node_id(ordinal),
        addr: format!("{}:6379", pod_ip(ordinal)),
        role: Role::Primary,
        primary_id: None,
        myself: false,
        failed: false,
        noaddr: false,
        connected: true,
        slots,
        importing: Vec::new(),
        migrating: Vec::new(),
    }
}

fn replica_node(ordinal: i32, primary_ordinal: i32) -> NodeInfo {
    NodeInfo {
        id: node_id(ordinal),
        addr: format!("{}:6379", pod_ip(ordinal)),
        role: Role::Replica,
        primary_id: Some(node_id(primary_ordinal)),
        myself: false,
        failed: false,
        noaddr: false,
        connected: true,
        slots: Vec::new(),
        importing: Vec::new(),
        migrating: Vec::new(),
    }
}

/// A bootstrapped topology matching the ordering convention: even slot
/// slices on the active primaries, an empty standby at the tail.
fn make_nodes(cx: &ClusterCx) -> Vec<NodeInfo> {
    let replicas = cx.spec.replicas_per_shard;
    let active = cx.spec.active_shards;
    let space = i32::from(topology::SLOT_SPACE);
    let mut nodes = Vec::new();
    for shard in 0..=active {
        let primary_ordinal = models::primary_ordinal(shard, replicas);
        let slots = if shard < active {
            vec![SlotRange {
                start: (shard * space / active) as u16,
                end: ((shard + 1) * space / active - 1) as u16,
            }]
        } else {
            Vec::new()
        };
        nodes.push(primary_node(primary_ordinal, slots));
        for ordinal in models::replica_ordinals(primary_ordinal, replicas) {
            nodes.push(replica_node(ordinal, primary_ordinal));
        }
    }
    nodes
}

#[derive(Default)]
pub struct MockPlane {
    pub now: Mutex<DateTime<Utc>>,
    pub pods: Mutex<Vec<PodState>>,
    pub desired: Mutex<Option<i32>>,
    pub tasks: Mutex<BTreeMap<String, TaskState>>,
    pub launched: Mutex<Vec<TaskSpec>>,
    pub shard_writes: Mutex<Vec<i32>>,
    pub resizes: Mutex<Vec<i32>>,
}

#[async_trait::async_trait]
impl Orchestrator for MockPlane {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn pods(&self) -> anyhow::Result<Vec<PodState>> {
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn desired_pods(&self) -> anyhow::Result<Option<i32>> {
        Ok(*self.desired.lock().unwrap())
    }

    async fn ensure_replica_set(&self, pods: i32) -> anyhow::Result<()> {
        let mut desired = self.desired.lock().unwrap();
        if desired.is_none() {
            *desired = Some(pods);
        }
        Ok(())
    }

    async fn resize(&self, pods: i32) -> anyhow::Result<()> {
        self.resizes.lock().unwrap().push(pods);
        *self.desired.lock().unwrap() = Some(pods);
        Ok(())
    }

    async fn persist_active_shards(&self, shards: i32) -> anyhow::Result<()> {
        self.shard_writes.lock().unwrap().push(shards);
        Ok(())
    }

    async fn find_task(&self, name: &str) -> anyhow::Result<Option<TaskState>> {
        Ok(self.tasks.lock().unwrap().get(name).copied())
    }

    async fn any_task(&self) -> anyhow::Result<Option<(String, TaskState)>> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .next()
            .map(|(name, state)| (name.clone(), *state)))
    }

    async fn launch_task(&self, task: TaskSpec) -> anyhow::Result<()> {
        self.tasks
            .lock()
            .unwrap()
            .insert(task.name.clone(), TaskState::Running);
        self.launched.lock().unwrap().push(task);
        Ok(())
    }

    async fn delete_task(&self, name: &str) -> anyhow::Result<()> {
        self.tasks.lock().unwrap().remove(name);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockAdmin {
    pub nodes: Mutex<Vec<NodeInfo>>,
    pub unhealthy: Mutex<bool>,
    pub ops: Mutex<Vec<String>>,
}

impl MockAdmin {
    fn log(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn slot_count_of(&self, id: &str) -> u16 {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.id == id)
            .map_or(0, NodeInfo::slot_count)
    }

    /// Applies a slot migration to the fake topology.
    pub fn move_slots(&self, from_id: &str, to_id: &str, count: u16) {
        let mut nodes = self.nodes.lock().unwrap();
        let src = nodes.iter().position(|n| n.id == from_id).unwrap();
        let moved: Vec<u16> = expand(&nodes[src].slots)
            .into_iter()
            .take(count as usize)
            .collect();
        let remaining: Vec<u16> = expand(&nodes[src].slots)
            .into_iter()
            .skip(count as usize)
            .collect();
        nodes[src].slots = compress(&remaining);
        let dst = nodes.iter().position(|n| n.id == to_id).unwrap();
        let mut dst_slots = expand(&nodes[dst].slots);
        dst_slots.extend(moved);
        dst_slots.sort_unstable();
        nodes[dst].slots = compress(&dst_slots);
    }
}

fn expand(ranges: &[SlotRange]) -> Vec<u16> {
    let mut slots: Vec<u16> = ranges.iter().flat_map(SlotRange::slots).collect();
    slots.sort_unstable();
    slots
}

fn compress(slots: &[u16]) -> Vec<SlotRange> {
    let mut ranges: Vec<SlotRange> = Vec::new();
    for &slot in slots {
        match ranges.last_mut() {
            Some(last) if last.end + 1 == slot => last.end = slot,
            _ => ranges.push(SlotRange {
                start: slot,
                end: slot,
            }),
        }
    }
    ranges
}

#[async_trait::async_trait]
impl Admin for MockAdmin {
    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeInfo>> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn health(&self) -> anyhow::Result<bool> {
        Ok(!*self.unhealthy.lock().unwrap())
    }

    async fn fix(&self) -> anyhow::Result<()> {
        self.log("fix".to_string());
        Ok(())
    }

    async fn forget(&self, id: &str) -> anyhow::Result<()> {
        self.log(format!("forget {id}"));
        self.nodes.lock().unwrap().retain(|n| n.id != id);
        Ok(())
    }

    async fn del_node(&self, id: &str) -> anyhow::Result<()> {
        self.log(format!("del {id}"));
        self.nodes.lock().unwrap().retain(|n| n.id != id);
        Ok(())
    }

    async fn reshard(
        &self,
        from_id: &str,
        to_id: &str,
        slots: u16,
        _deadline: std::time::Duration,
    ) -> anyhow::Result<()> {
        self.log(format!("reshard {from_id} -> {to_id} ({slots})"));
        self.move_slots(from_id, to_id, slots);
        Ok(())
    }

    async fn add_primary(&self, addr: &str) -> anyhow::Result<()> {
        self.log(format!("add-primary {addr}"));
        let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
        let mut nodes = self.nodes.lock().unwrap();
        nodes.retain(|n| n.addr != addr);
        nodes.push(NodeInfo {
            id: format!("fresh-{host}"),
            addr: addr.to_string(),
            role: Role::Primary,
            primary_id: None,
            myself: false,
            failed: false,
            noaddr: false,
            connected: true,
            slots: Vec::new(),
            importing: Vec::new(),
            migrating: Vec::new(),
        });
        Ok(())
    }

    async fn add_replica(&self, addr: &str, primary_id: &str) -> anyhow::Result<()> {
        self.log(format!("add-replica {addr} of {primary_id}"));
        let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
        let mut nodes = self.nodes.lock().unwrap();
        nodes.retain(|n| n.addr != addr);
        nodes.push(NodeInfo {
            id: format!("fresh-{host}"),
            addr: addr.to_string(),
            role: Role::Replica,
            primary_id: Some(primary_id.to_string()),
            myself: false,
            failed: false,
            noaddr: false,
            connected: true,
            slots: Vec::new(),
            importing: Vec::new(),
            migrating: Vec::new(),
        });
        Ok(())
    }

    async fn reset_hard(&self, addr: &str) -> anyhow::Result<()> {
        self.log(format!("reset {addr}"));
        Ok(())
    }

    async fn flush_all(&self, addr: &str) -> anyhow::Result<()> {
        self.log(format!("flush {addr}"));
        Ok(())
    }

    async fn set_full_coverage(&self, enabled: bool) -> anyhow::Result<()> {
        self.log(format!("coverage {enabled}"));
        Ok(())
    }

    async fn assign_slots(&self, addr: &str, ranges: &[SlotRange]) -> anyhow::Result<()> {
        self.log(format!("assign {addr} ({} ranges)", ranges.len()));
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .iter_mut()
            .find(|n| n.addr == addr)
            .ok_or_else(|| anyhow::anyhow!("no node at {addr}"))?;
        node.slots.extend_from_slice(ranges);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockMetrics {
    pub samples: Mutex<BTreeMap<String, Sample>>,
}

#[async_trait::async_trait]
impl MetricsSource for MockMetrics {
    async fn sample(&self, query: &Query) -> anyhow::Result<BTreeMap<String, Sample>> {
        let samples = self.samples.lock().unwrap();
        Ok(samples
            .iter()
            .filter(|(pod, _)| query.primaries.contains(pod))
            .map(|(pod, sample)| (pod.clone(), *sample))
            .collect())
    }
}

/// One cluster under test: scripted collaborators plus the live status.
pub struct Harness {
    pub cx: ClusterCx,
    pub plane: Arc<MockPlane>,
    pub admin: Arc<MockAdmin>,
    pub metrics: Arc<MockMetrics>,
    pub status: models::ClusterStatus,
}

impl Harness {
    /// A cluster sitting in `Stable` with a bootstrapped topology.
    pub fn stable(active_shards: i32, replicas_per_shard: i32) -> Self {
        let cx = cluster_cx(active_shards, replicas_per_shard);
        let pods = make_pods(&cx);
        let nodes = make_nodes(&cx);
        let standby_ordinal =
            models::standby_primary_ordinal(active_shards, replicas_per_shard);

        let plane = MockPlane::default();
        *plane.now.lock().unwrap() = test_time();
        *plane.pods.lock().unwrap() = pods.clone();
        *plane.desired.lock().unwrap() = Some(cx.spec.desired_pods());

        let admin = MockAdmin::default();
        *admin.nodes.lock().unwrap() = nodes;

        let status = models::ClusterStatus {
            phase: models::Phase::Stable,
            observed_shards: active_shards + 1,
            observed_replicas: pods.len() as i32,
            standby: Some(cx.pod_name(standby_ordinal)),
            last_scale_at: None,
            conditions: Vec::new(),
        };

        Self {
            cx,
            plane: Arc::new(plane),
            admin: Arc::new(admin),
            metrics: Arc::new(MockMetrics::default()),
            status,
        }
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler {
            plane: self.plane.clone(),
            admin: self.admin.clone(),
            metrics_source: self.metrics.clone(),
        }
    }

    pub async fn tick(&mut self) -> std::time::Duration {
        let reconciler = self.reconciler();
        let cx = self.cx.clone();
        reconciler.tick(&cx, &mut self.status).await
    }

    pub fn set_samples(&self, load: &[(&str, f64, f64)]) {
        let mut samples = self.metrics.samples.lock().unwrap();
        samples.clear();
        for (pod, cpu_pct, mem_pct) in load {
            samples.insert(
                pod.to_string(),
                Sample {
                    cpu_pct: *cpu_pct,
                    mem_pct: *mem_pct,
                },
            );
        }
    }

    /// Simulates the external task runner executing a launched migration
    /// to completion, applying its slot movement to the fake topology.
    pub fn complete_task(&self, name: &str) {
        let launched = self.plane.launched.lock().unwrap();
        let task = launched
            .iter()
            .find(|t| t.name == name)
            .unwrap_or_else(|| panic!("task {name} was never launched"));
        assert_eq!(task.args[0], "reshard");
        let from = &task.args[2];
        let to = &task.args[4];
        let slots: u16 = task.args[6].parse().unwrap();
        self.admin.move_slots(from, to, slots);
        self.plane
            .tasks
            .lock()
            .unwrap()
            .insert(name.to_string(), TaskState::Succeeded);
    }

    pub fn fail_task(&self, name: &str) {
        self.plane
            .tasks
            .lock()
            .unwrap()
            .insert(name.to_string(), TaskState::Failed);
    }

    pub fn advance_time(&self, seconds: i64) {
        let mut now = self.plane.now.lock().unwrap();
        *now += chrono::Duration::seconds(seconds);
    }

    /// The pods a replica-set shrink to `count` pods would leave behind.
    pub fn apply_shrink(&self, count: i32) {
        self.plane
            .pods
            .lock()
            .unwrap()
            .retain(|p| p.ordinal < count);
    }

    /// Grows the pod set to `count`, with new pods ready.
    pub fn apply_growth(&self, count: i32) {
        let mut pods = self.plane.pods.lock().unwrap();
        let mut ordinal = pods.last().map_or(0, |p| p.ordinal + 1);
        while (pods.len() as i32) < count {
            pods.push(PodState {
                name: models::pod_name(&self.cx.name, ordinal),
                ordinal,
                ip: Some(pod_ip(ordinal)),
                ready: true,
            });
            ordinal += 1;
        }
    }
}
