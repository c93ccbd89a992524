use crate::nodes::{parse_cluster_nodes, NodeInfo, Role, SlotRange};
use crate::Admin;
use anyhow::Context;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Addresses (`host:port`) of the pods that may be queried for
    /// membership. The first reachable one answers listing queries.
    pub seeds: Vec<String>,
    /// Per-command deadline.
    pub command_timeout: Duration,
    /// Keys moved per `MIGRATE` call during a reshard.
    pub migrate_batch: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            command_timeout: Duration::from_secs(10),
            migrate_batch: 256,
        }
    }
}

/// Production [`Admin`] implementation speaking the store's native
/// protocol. One multiplexed connection is cached per node address; a
/// connection observed failing is dropped and re-dialed once before the
/// command error escalates.
pub struct Client {
    config: ClientConfig,
    conns: Mutex<HashMap<String, MultiplexedConnection>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            conns: Mutex::new(HashMap::new()),
        }
    }

    async fn connect(&self, addr: &str) -> anyhow::Result<MultiplexedConnection> {
        if let Some(conn) = self.conns.lock().await.get(addr) {
            return Ok(conn.clone());
        }
        let client = redis::Client::open(format!("redis://{addr}"))
            .with_context(|| format!("invalid node address {addr}"))?;
        let conn = tokio::time::timeout(
            self.config.command_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .with_context(|| format!("timed out dialing {addr}"))?
        .with_context(|| format!("failed to dial {addr}"))?;

        self.conns
            .lock()
            .await
            .insert(addr.to_string(), conn.clone());
        Ok(conn)
    }

    async fn evict(&self, addr: &str) {
        self.conns.lock().await.remove(addr);
    }

    async fn try_exec<T: redis::FromRedisValue>(
        &self,
        addr: &str,
        cmd: &redis::Cmd,
    ) -> anyhow::Result<T> {
        let mut conn = self.connect(addr).await?;
        let value = tokio::time::timeout(self.config.command_timeout, cmd.query_async(&mut conn))
            .await
            .with_context(|| format!("command timed out against {addr}"))?
            .with_context(|| format!("command failed against {addr}"))?;
        Ok(value)
    }

    /// Runs one command, re-dialing and retrying once on failure.
    async fn exec<T: redis::FromRedisValue>(
        &self,
        addr: &str,
        cmd: &redis::Cmd,
    ) -> anyhow::Result<T> {
        match self.try_exec(addr, cmd).await {
            Ok(value) => Ok(value),
            Err(first) => {
                self.evict(addr).await;
                tracing::debug!(addr, error = ?first, "retrying command after transient failure");
                self.try_exec(addr, cmd).await
            }
        }
    }

    async fn nodes_from_any_seed(&self) -> anyhow::Result<Vec<NodeInfo>> {
        let mut last_err = None;
        for seed in &self.config.seeds {
            match self
                .exec::<String>(seed, redis::cmd("CLUSTER").arg("NODES"))
                .await
            {
                Ok(raw) => {
                    return parse_cluster_nodes(&raw)
                        .with_context(|| format!("parsing node listing from {seed}"))
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no seed addresses configured")))
    }

    fn reachable_primaries(nodes: &[NodeInfo]) -> impl Iterator<Item = &NodeInfo> {
        nodes
            .iter()
            .filter(|n| n.role == Role::Primary && !n.is_ghost())
    }

    fn node_by_id<'n>(nodes: &'n [NodeInfo], id: &str) -> anyhow::Result<&'n NodeInfo> {
        nodes
            .iter()
            .find(|n| n.id == id)
            .with_context(|| format!("node {id} is not a cluster member"))
    }

    /// Moves one slot end to end: mark both ends, drain keys in bounded
    /// batches, then hand ownership to the destination everywhere.
    async fn migrate_slot(
        &self,
        nodes: &[NodeInfo],
        src: &NodeInfo,
        dst: &NodeInfo,
        slot: u16,
    ) -> anyhow::Result<()> {
        self.exec::<()>(
            &dst.addr,
            redis::cmd("CLUSTER")
                .arg("SETSLOT")
                .arg(slot)
                .arg("IMPORTING")
                .arg(&src.id),
        )
        .await
        .context("marking destination importing")?;
        self.exec::<()>(
            &src.addr,
            redis::cmd("CLUSTER")
                .arg("SETSLOT")
                .arg(slot)
                .arg("MIGRATING")
                .arg(&dst.id),
        )
        .await
        .context("marking source migrating")?;

        self.drain_slot_keys(src, dst, slot).await?;
        self.broadcast_slot_owner(nodes, src, dst, slot).await
    }

    async fn drain_slot_keys(
        &self,
        src: &NodeInfo,
        dst: &NodeInfo,
        slot: u16,
    ) -> anyhow::Result<()> {
        let timeout_ms = self.config.command_timeout.as_millis() as u64;
        loop {
            let keys: Vec<String> = self
                .exec(
                    &src.addr,
                    redis::cmd("CLUSTER")
                        .arg("GETKEYSINSLOT")
                        .arg(slot)
                        .arg(self.config.migrate_batch),
                )
                .await
                .context("listing keys of migrating slot")?;
            if keys.is_empty() {
                return Ok(());
            }

            let dst_port = dst
                .port()
                .with_context(|| format!("destination {} has no port", dst.addr))?;
            let mut cmd = redis::cmd("MIGRATE");
            cmd.arg(dst.host())
                .arg(dst_port)
                .arg("")
                .arg(0)
                .arg(timeout_ms)
                .arg("REPLACE")
                .arg("KEYS");
            for key in &keys {
                cmd.arg(key);
            }
            self.exec::<()>(&src.addr, &cmd)
                .await
                .with_context(|| format!("migrating {} keys of slot {slot}", keys.len()))?;
        }
    }

    async fn broadcast_slot_owner(
        &self,
        nodes: &[NodeInfo],
        src: &NodeInfo,
        dst: &NodeInfo,
        slot: u16,
    ) -> anyhow::Result<()> {
        let assign = |id: &str| {
            let mut cmd = redis::cmd("CLUSTER");
            cmd.arg("SETSLOT").arg(slot).arg("NODE").arg(id);
            cmd
        };
        // The two participants must learn the hand-off; other primaries
        // are told best-effort and converge through gossip otherwise.
        self.exec::<()>(&dst.addr, &assign(&dst.id))
            .await
            .context("assigning slot on destination")?;
        self.exec::<()>(&src.addr, &assign(&dst.id))
            .await
            .context("assigning slot on source")?;
        for other in Self::reachable_primaries(nodes) {
            if other.id == src.id || other.id == dst.id {
                continue;
            }
            if let Err(err) = self.exec::<()>(&other.addr, &assign(&dst.id)).await {
                tracing::warn!(addr = %other.addr, slot, error = ?err, "slot owner broadcast failed");
            }
        }
        Ok(())
    }
}

/// The first `count` slots of `ranges`, ascending.
pub(crate) fn pick_slots(ranges: &[SlotRange], count: u16) -> Vec<u16> {
    let mut slots: Vec<u16> = ranges.iter().flat_map(SlotRange::slots).collect();
    slots.sort_unstable();
    slots.truncate(count as usize);
    slots
}

/// Collapses a sorted slot list into contiguous inclusive ranges.
pub(crate) fn contiguous_ranges(slots: &[u16]) -> Vec<SlotRange> {
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
impl Admin for Client {
    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeInfo>> {
        self.nodes_from_any_seed().await
    }

    async fn health(&self) -> anyhow::Result<bool> {
        let nodes = self.nodes_from_any_seed().await?;
        let mut primaries = 0;
        for primary in Self::reachable_primaries(&nodes) {
            primaries += 1;
            let info: String = match self.exec(&primary.addr, &redis::cmd("CLUSTER").arg("INFO")).await
            {
                Ok(info) => info,
                Err(err) => {
                    tracing::warn!(addr = %primary.addr, error = ?err, "primary unreachable during health check");
                    return Ok(false);
                }
            };
            if !info.contains("cluster_state:ok") {
                return Ok(false);
            }
        }
        Ok(primaries > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn fix(&self) -> anyhow::Result<()> {
        let nodes = self.nodes_from_any_seed().await?;

        // Complete or abort half-finished slot migrations.
        let importing_by_slot: HashMap<u16, &NodeInfo> = nodes
            .iter()
            .flat_map(|n| n.importing.iter().map(move |(slot, _)| (*slot, n)))
            .collect();

        for src in nodes.iter().filter(|n| !n.migrating.is_empty()) {
            for (slot, dst_id) in &src.migrating {
                let resolved = importing_by_slot
                    .get(slot)
                    .copied()
                    .or_else(|| Self::node_by_id(&nodes, dst_id).ok());
                match resolved {
                    Some(dst) if !dst.is_ghost() => {
                        if let Err(err) = self.migrate_slot(&nodes, src, dst, *slot).await {
                            tracing::warn!(slot, error = ?err, "could not complete half-migrated slot");
                        }
                    }
                    _ => {
                        if let Err(err) = self
                            .exec::<()>(
                                &src.addr,
                                redis::cmd("CLUSTER").arg("SETSLOT").arg(*slot).arg("STABLE"),
                            )
                            .await
                        {
                            tracing::warn!(slot, error = ?err, "could not stabilize migrating slot");
                        }
                    }
                }
            }
        }
        for node in nodes.iter().filter(|n| !n.importing.is_empty() && !n.is_ghost()) {
            for (slot, src_id) in &node.importing {
                let source_still_migrating = nodes
                    .iter()
                    .any(|n| n.id == *src_id && n.migrating.iter().any(|(s, _)| s == slot));
                if source_still_migrating {
                    continue; // handled above from the source side
                }
                if let Err(err) = self
                    .exec::<()>(
                        &node.addr,
                        redis::cmd("CLUSTER").arg("SETSLOT").arg(*slot).arg("STABLE"),
                    )
                    .await
                {
                    tracing::warn!(slot, error = ?err, "could not stabilize importing slot");
                }
            }
        }

        // Assign any uncovered slots to the emptiest reachable primary
        // that already owns slots, or to any reachable primary.
        let mut covered = vec![false; usize::from(crate::SLOT_SPACE)];
        for node in &nodes {
            for range in &node.slots {
                for slot in range.slots() {
                    covered[usize::from(slot)] = true;
                }
            }
        }
        let uncovered: Vec<u16> = (0..crate::SLOT_SPACE)
            .filter(|slot| !covered[usize::from(*slot)])
            .collect();
        if uncovered.is_empty() {
            return Ok(());
        }

        let target = Self::reachable_primaries(&nodes)
            .filter(|n| n.slot_count() > 0)
            .min_by_key(|n| n.slot_count())
            .or_else(|| Self::reachable_primaries(&nodes).next())
            .context("no reachable primary to take uncovered slots")?;
        tracing::warn!(
            count = uncovered.len(),
            target = %target.addr,
            "assigning uncovered slots"
        );
        self.assign_slots(&target.addr, &contiguous_ranges(&uncovered))
            .await
    }

    async fn forget(&self, id: &str) -> anyhow::Result<()> {
        let nodes = self.nodes_from_any_seed().await?;
        let mut delivered = 0usize;
        let mut recipients = 0usize;
        for primary in Self::reachable_primaries(&nodes) {
            if primary.id == id {
                continue;
            }
            recipients += 1;
            match self
                .exec::<()>(&primary.addr, redis::cmd("CLUSTER").arg("FORGET").arg(id))
                .await
            {
                Ok(()) => delivered += 1,
                Err(err) => {
                    // "unknown node" means this member already forgot it.
                    tracing::debug!(addr = %primary.addr, error = ?err, "forget not accepted");
                }
            }
        }
        anyhow::ensure!(
            recipients == 0 || delivered > 0,
            "no primary accepted FORGET {id}"
        );
        Ok(())
    }

    async fn del_node(&self, id: &str) -> anyhow::Result<()> {
        let nodes = self.nodes_from_any_seed().await?;
        for member in nodes.iter().filter(|n| !n.is_ghost() && n.id != id) {
            if let Err(err) = self
                .exec::<()>(&member.addr, redis::cmd("CLUSTER").arg("FORGET").arg(id))
                .await
            {
                tracing::debug!(addr = %member.addr, error = ?err, "forget not accepted");
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(from = from_id, to = to_id, slots))]
    async fn reshard(
        &self,
        from_id: &str,
        to_id: &str,
        slots: u16,
        deadline: Duration,
    ) -> anyhow::Result<()> {
        let started = tokio::time::Instant::now();
        let nodes = self.nodes_from_any_seed().await?;
        let src = Self::node_by_id(&nodes, from_id)?.clone();
        let dst = Self::node_by_id(&nodes, to_id)?.clone();
        anyhow::ensure!(src.role == Role::Primary, "reshard source is not a primary");
        anyhow::ensure!(dst.role == Role::Primary, "reshard target is not a primary");

        let moving = pick_slots(&src.slots, slots);
        tracing::info!(count = moving.len(), "starting slot migration");

        for (index, slot) in moving.iter().enumerate() {
            if started.elapsed() >= deadline {
                anyhow::bail!(
                    "reshard deadline exceeded after {index} of {} slots",
                    moving.len()
                );
            }
            self.migrate_slot(&nodes, &src, &dst, *slot)
                .await
                .with_context(|| format!("migrating slot {slot}"))?;
        }
        tracing::info!(count = moving.len(), "slot migration complete");
        Ok(())
    }

    async fn add_primary(&self, addr: &str) -> anyhow::Result<()> {
        let nodes = self.nodes_from_any_seed().await?;
        let seed = Self::reachable_primaries(&nodes)
            .next()
            .context("no reachable primary to introduce the new node")?;
        let (host, port) = addr
            .rsplit_once(':')
            .with_context(|| format!("malformed node address {addr}"))?;
        self.exec::<()>(
            &seed.addr,
            redis::cmd("CLUSTER").arg("MEET").arg(host).arg(port),
        )
        .await
        .with_context(|| format!("introducing {addr} to the cluster"))
    }

    async fn add_replica(&self, addr: &str, primary_id: &str) -> anyhow::Result<()> {
        self.add_primary(addr).await?;

        // The new member learns of its primary through gossip; replication
        // can only be configured once the id is known locally.
        for _ in 0..10 {
            let known: String = self
                .exec(addr, redis::cmd("CLUSTER").arg("NODES"))
                .await
                .context("listing membership of the joining node")?;
            if known.contains(primary_id) {
                return self
                    .exec::<()>(
                        addr,
                        redis::cmd("CLUSTER").arg("REPLICATE").arg(primary_id),
                    )
                    .await
                    .with_context(|| format!("attaching {addr} to primary {primary_id}"));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        anyhow::bail!("{addr} never learned of primary {primary_id}")
    }

    async fn reset_hard(&self, addr: &str) -> anyhow::Result<()> {
        self.flush_all(addr).await?;
        self.exec::<()>(addr, redis::cmd("CLUSTER").arg("RESET").arg("HARD"))
            .await
            .with_context(|| format!("hard-resetting {addr}"))?;
        self.evict(addr).await;
        Ok(())
    }

    async fn flush_all(&self, addr: &str) -> anyhow::Result<()> {
        self.exec::<()>(addr, &redis::cmd("FLUSHALL"))
            .await
            .with_context(|| format!("flushing {addr}"))
    }

    async fn set_full_coverage(&self, enabled: bool) -> anyhow::Result<()> {
        let nodes = self.nodes_from_any_seed().await?;
        let value = if enabled { "yes" } else { "no" };
        let mut delivered = 0usize;
        for node in Self::reachable_primaries(&nodes) {
            match self
                .exec::<()>(
                    &node.addr,
                    redis::cmd("CONFIG")
                        .arg("SET")
                        .arg("cluster-require-full-coverage")
                        .arg(value),
                )
                .await
            {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(addr = %node.addr, error = ?err, "coverage flag not applied");
                }
            }
        }
        anyhow::ensure!(delivered > 0, "no node accepted the coverage flag");
        Ok(())
    }

    async fn assign_slots(&self, addr: &str, ranges: &[SlotRange]) -> anyhow::Result<()> {
        // ADDSLOTS is variadic; keep argument lists bounded.
        const CHUNK: usize = 512;
        let slots: Vec<u16> = ranges.iter().flat_map(SlotRange::slots).collect();
        for chunk in slots.chunks(CHUNK) {
            let mut cmd = redis::cmd("CLUSTER");
            cmd.arg("ADDSLOTS");
            for slot in chunk {
                cmd.arg(*slot);
            }
            self.exec::<()>(addr, &cmd)
                .await
                .with_context(|| format!("assigning {} slots to {addr}", chunk.len()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pick_slots_is_ascending_and_bounded() {
        let ranges = [
            SlotRange { start: 100, end: 102 },
            SlotRange { start: 5, end: 6 },
        ];
        assert_eq!(pick_slots(&ranges, 4), vec![5, 6, 100, 101]);
        assert_eq!(pick_slots(&ranges, 0), Vec::<u16>::new());
        assert_eq!(pick_slots(&ranges, 99).len(), 5);
    }

    #[test]
    fn contiguous_ranges_collapse_runs() {
        let ranges = contiguous_ranges(&[1, 2, 3, 7, 9, 10]);
        assert_eq!(
            ranges,
            vec![
                SlotRange { start: 1, end: 3 },
                SlotRange { start: 7, end: 7 },
                SlotRange { start: 9, end: 10 },
            ]
        );
        assert!(contiguous_ranges(&[]).is_empty());
    }
}
