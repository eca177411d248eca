//! Immutable view of the deployment, replaced wholesale each cycle

use std::sync::Arc;

use serde::Serialize;

use crate::cluster::ShardMap;
use crate::config::ServerAddress;
use crate::node::{NodeHandle, NodeRole};

/// Overall shape of the deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentKind {
    /// Nothing has answered yet
    Unknown,
    /// One or more standalone servers, primary chosen by election
    Standalone,
    /// Sharded cluster
    Cluster,
    /// Stateless proxy endpoints
    Proxy,
}

#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    pub version: u64,
    pub kind: DeploymentKind,
    pub nodes: Vec<Arc<NodeHandle>>,
    pub shard_map: Option<Arc<ShardMap>>,
    pub elected_primary: Option<ServerAddress>,
}

impl TopologySnapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            kind: DeploymentKind::Unknown,
            nodes: Vec::new(),
            shard_map: None,
            elected_primary: None,
        }
    }

    pub fn node(&self, address: &ServerAddress) -> Option<&Arc<NodeHandle>> {
        self.nodes.iter().find(|n| n.address() == address)
    }

    /// Replicas whose primary is `primary`
    pub fn replicas_of<'a>(
        &'a self,
        primary: &'a ServerAddress,
    ) -> impl Iterator<Item = &'a Arc<NodeHandle>> + 'a {
        self.nodes.iter().filter(move |n| {
            n.role() == NodeRole::Replica && n.primary().as_ref() == Some(primary)
        })
    }

    pub fn summary(&self) -> TopologySummary {
        TopologySummary {
            version: self.version,
            kind: self.kind,
            elected_primary: self.elected_primary.as_ref().map(|a| a.to_string()),
            nodes: self.nodes.len(),
            primaries: self
                .nodes
                .iter()
                .filter(|n| n.role() == NodeRole::Primary)
                .count(),
            replicas: self
                .nodes
                .iter()
                .filter(|n| n.role() == NodeRole::Replica)
                .count(),
            assigned_slots: self.shard_map.as_ref().map(|m| m.assigned_slots()),
        }
    }
}

/// Serializable counts for reporting
#[derive(Debug, Clone, Serialize)]
pub struct TopologySummary {
    pub version: u64,
    pub kind: DeploymentKind,
    pub elected_primary: Option<String>,
    pub nodes: usize,
    pub primaries: usize,
    pub replicas: usize,
    pub assigned_slots: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicas_of() {
        let primary = ServerAddress::new("p", 1);
        let replica = Arc::new(NodeHandle::new(ServerAddress::new("r", 2)));
        replica.set_role(NodeRole::Replica);
        replica.set_primary(Some(primary.clone()));
        let other = Arc::new(NodeHandle::new(ServerAddress::new("o", 3)));
        other.set_role(NodeRole::Replica);

        let snapshot = TopologySnapshot {
            nodes: vec![replica, other],
            ..TopologySnapshot::empty()
        };
        let found: Vec<_> = snapshot.replicas_of(&primary).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address().host, "r");
        assert_eq!(snapshot.summary().replicas, 2);
    }
}
