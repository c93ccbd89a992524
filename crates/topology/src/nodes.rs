//! Structured parsing of the store's `CLUSTER NODES` listing.

/// The fixed hash-slot space of the sharded store.
pub const SLOT_SPACE: u16 = 16384;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed node line: {0:?}")]
    MalformedLine(String),
    #[error("malformed slot token: {0:?}")]
    MalformedSlot(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

/// An inclusive range of hash slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn count(&self) -> u16 {
        self.end - self.start + 1
    }

    pub fn slots(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

/// One membership entry of the cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeInfo {
    pub id: String,
    /// `ip:port` of the client interface.
    pub addr: String,
    pub role: Role,
    /// For replicas, the id of the primary they follow.
    pub primary_id: Option<String>,
    /// Entry describes the node answering the query.
    pub myself: bool,
    /// Marked `fail` or `fail?` by the cluster.
    pub failed: bool,
    /// Membership entry without a reachable address.
    pub noaddr: bool,
    /// Gossip link state.
    pub connected: bool,
    /// Slot ranges owned by this node.
    pub slots: Vec<SlotRange>,
    /// Slots being imported: `(slot, source node id)`.
    pub importing: Vec<(u16, String)>,
    /// Slots being migrated away: `(slot, destination node id)`.
    pub migrating: Vec<(u16, String)>,
}

impl NodeInfo {
    /// Slots this node owns. Slots still marked migrating are owned until
    /// the final `SETSLOT NODE` hand-off and are counted.
    pub fn slot_count(&self) -> u16 {
        self.slots.iter().map(SlotRange::count).sum()
    }

    /// A membership entry that no longer corresponds to a live, reachable
    /// node and should be forgotten.
    pub fn is_ghost(&self) -> bool {
        self.failed || self.noaddr || !self.connected
    }

    /// The host portion of `addr`.
    pub fn host(&self) -> &str {
        self.addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.addr)
    }

    pub fn port(&self) -> Option<u16> {
        self.addr.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
    }
}

/// Parses the multi-line `CLUSTER NODES` reply.
///
/// Line shape:
/// `<id> <ip:port@cport> <flags> <primary|-> <ping> <pong> <epoch> <link> [slots…]`
pub fn parse_cluster_nodes(text: &str) -> Result<Vec<NodeInfo>, ParseError> {
    let mut nodes = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(id), Some(addr), Some(flags), Some(primary), _ping, _pong, _epoch, Some(link)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(ParseError::MalformedLine(line.to_string()));
        };

        let flags: Vec<&str> = flags.split(',').collect();
        let role = if flags.contains(&"master") {
            Role::Primary
        } else {
            Role::Replica
        };

        // The address field carries the cluster-bus port after '@' and may
        // carry a hostname after ','.
        let addr = addr.split_once('@').map_or(addr, |(a, _)| a);
        let addr = addr.split_once(',').map_or(addr, |(a, _)| a);

        let mut node = NodeInfo {
            id: id.to_string(),
            addr: addr.to_string(),
            role,
            primary_id: (primary != "-").then(|| primary.to_string()),
            myself: flags.contains(&"myself"),
            failed: flags.contains(&"fail") || flags.contains(&"fail?"),
            noaddr: flags.contains(&"noaddr"),
            connected: link == "connected",
            slots: Vec::new(),
            importing: Vec::new(),
            migrating: Vec::new(),
        };

        for token in fields {
            parse_slot_token(token, &mut node)?;
        }

        nodes.push(node);
    }

    Ok(nodes)
}

fn parse_slot_token(token: &str, node: &mut NodeInfo) -> Result<(), ParseError> {
    let malformed = || ParseError::MalformedSlot(token.to_string());

    if let Some(inner) = token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        // "[93->-abcd…]" migrating, "[77-<-abcd…]" importing.
        if let Some((slot, id)) = inner.split_once("->-") {
            let slot = slot.parse().map_err(|_| malformed())?;
            node.migrating.push((slot, id.to_string()));
        } else if let Some((slot, id)) = inner.split_once("-<-") {
            let slot = slot.parse().map_err(|_| malformed())?;
            node.importing.push((slot, id.to_string()));
        } else {
            return Err(malformed());
        }
    } else if let Some((start, end)) = token.split_once('-') {
        let start = start.parse().map_err(|_| malformed())?;
        let end = end.parse().map_err(|_| malformed())?;
        if start > end {
            return Err(malformed());
        }
        node.slots.push(SlotRange { start, end });
    } else {
        let slot = token.parse().map_err(|_| malformed())?;
        node.slots.push(SlotRange { start: slot, end: slot });
    }
    Ok(())
}

/// The unique zero-slot primary among `nodes`, if exactly one exists.
pub fn zero_slot_primary(nodes: &[NodeInfo]) -> Option<&NodeInfo> {
    let mut it = nodes
        .iter()
        .filter(|n| n.role == Role::Primary && !n.is_ghost() && n.slot_count() == 0);
    match (it.next(), it.next()) {
        (Some(n), None) => Some(n),
        _ => None,
    }
}
