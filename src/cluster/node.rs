//! CLUSTER NODES line parsing

use crate::config::ServerAddress;

/// One node as reported by CLUSTER NODES
#[derive(Debug, Clone)]
pub struct ClusterNodeEntry {
    /// Node ID from CLUSTER NODES
    pub id: String,
    pub address: ServerAddress,
    /// Cluster bus port
    pub bus_port: u16,
    pub is_primary: bool,
    pub is_replica: bool,
    /// The node that answered the query
    pub myself: bool,
    /// Primary node ID (if replica)
    pub primary_id: Option<String>,
    /// Owned slot ranges, inclusive (primaries only)
    pub slot_ranges: Vec<(u16, u16)>,
    /// Node flags (fail, handshake, etc.)
    pub flags: Vec<String>,
    /// Link state is "connected"
    pub connected: bool,
}

impl ClusterNodeEntry {
    /// Check if node is usable for routing
    pub fn is_available(&self) -> bool {
        self.connected
            && !self
                .flags
                .iter()
                .any(|f| f == "fail" || f == "handshake" || f == "noaddr")
    }
}

/// Parse a line from CLUSTER NODES response
///
/// Format: `<id> <ip:port@cport> <flags> <master> <ping-sent> <pong-recv> <config-epoch> <link-state> <slot> <slot> ... <slot>`
///
/// `fallback_host` replaces an empty host, which a node reports for itself
/// when it does not know its own address.
pub fn parse_cluster_node_line(line: &str, fallback_host: &str) -> Option<ClusterNodeEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 8 {
        return None;
    }

    let id = parts[0].to_string();
    let (host, port, bus_port) = parse_node_address(parts[1])?;
    let host = if host.is_empty() {
        fallback_host.to_string()
    } else {
        host
    };

    let flags: Vec<String> = parts[2].split(',').map(String::from).collect();
    let has_flag = |name: &str| flags.iter().any(|f| f == name);

    let is_primary = has_flag("master");
    let is_replica = has_flag("slave") || has_flag("replica");
    let myself = has_flag("myself");

    let primary_id = if is_replica && parts[3] != "-" {
        Some(parts[3].to_string())
    } else {
        None
    };

    let connected = parts[7] == "connected";

    let mut slot_ranges = Vec::new();
    if is_primary {
        for &slot_str in &parts[8..] {
            if let Some(range) = parse_slot_range(slot_str) {
                slot_ranges.push(range);
            }
        }
    }

    Some(ClusterNodeEntry {
        id,
        address: ServerAddress::new(host, port),
        bus_port,
        is_primary,
        is_replica,
        myself,
        primary_id,
        slot_ranges,
        flags,
        connected,
    })
}

/// Parse node address from CLUSTER NODES
/// Formats: "host:port@cport", "host:port", "host:port@cport,hostname"
fn parse_node_address(addr: &str) -> Option<(String, u16, u16)> {
    // ip:port@cport,hostname
    let addr = addr.split(',').next().unwrap_or(addr);

    let (host_port, bus_port) = match addr.split_once('@') {
        Some((hp, bus)) => (hp, bus.parse().unwrap_or(0)),
        None => (addr, 0),
    };

    let (host, port) = host_port.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;

    Some((host.to_string(), port, bus_port))
}

/// Parse slot range: "0-5460" or "0"
fn parse_slot_range(s: &str) -> Option<(u16, u16)> {
    // Skip migrating/importing markers like "[123->-node_id]"
    if s.contains('[') {
        return None;
    }

    if let Some((start, end)) = s.split_once('-') {
        let start: u16 = start.parse().ok()?;
        let end: u16 = end.parse().ok()?;
        (start <= end).then_some((start, end))
    } else {
        let slot: u16 = s.parse().ok()?;
        Some((slot, slot))
    }
}
