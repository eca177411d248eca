//! Server selection
//!
//! Picks the node for a request from the current snapshot. Only established,
//! selectable nodes are candidates. In a cluster the slot owner and its
//! replicas are considered; otherwise the elected primary and the replicas.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::ReadPreference;
use crate::node::{NodeHandle, NodeRole};
use crate::topology::{DeploymentKind, TopologySnapshot};
use crate::utils::{MuxError, Result};

#[derive(Debug, Default)]
pub struct Router {
    cursor: AtomicUsize,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node to serve a request for `slot` (`None` for keyless requests)
    pub fn select(
        &self,
        snapshot: &TopologySnapshot,
        slot: Option<u16>,
        preference: ReadPreference,
    ) -> Result<Arc<NodeHandle>> {
        let (primaries, replicas) = self.candidates(snapshot, slot)?;

        let (first, fallback) = match preference {
            ReadPreference::DemandPrimary => (primaries, Vec::new()),
            ReadPreference::PreferPrimary => (primaries, replicas),
            ReadPreference::DemandReplica => (replicas, Vec::new()),
            ReadPreference::PreferReplica => (replicas, primaries),
        };

        let pool = if first.is_empty() { fallback } else { first };
        if pool.is_empty() {
            return Err(MuxError::NoRoute(match slot {
                Some(slot) => format!("no {} node for slot {}", role_word(preference), slot),
                None => format!("no {} node available", role_word(preference)),
            }));
        }
        Ok(self.pick(pool, slot))
    }

    /// Check a caller-chosen node against the read preference
    pub fn validate_pinned(node: &NodeHandle, preference: ReadPreference) -> Result<()> {
        let ok = match preference {
            ReadPreference::DemandPrimary => node.role() != NodeRole::Replica,
            ReadPreference::DemandReplica => node.role() == NodeRole::Replica,
            ReadPreference::PreferPrimary | ReadPreference::PreferReplica => true,
        };
        if ok {
            Ok(())
        } else {
            Err(MuxError::NoRoute(format!(
                "{} is a {:?} and the request demands a {}",
                node.address(),
                node.role(),
                role_word(preference)
            )))
        }
    }

    fn candidates(
        &self,
        snapshot: &TopologySnapshot,
        slot: Option<u16>,
    ) -> Result<(Vec<Arc<NodeHandle>>, Vec<Arc<NodeHandle>>)> {
        let eligible = |n: &&Arc<NodeHandle>| n.is_eligible();

        match (snapshot.kind, &snapshot.shard_map, slot) {
            (DeploymentKind::Cluster, Some(map), Some(slot)) => {
                let owner = map
                    .node_for(slot)
                    .ok_or_else(|| MuxError::NoRoute(format!("slot {} is not covered", slot)))?;
                let primaries = snapshot
                    .node(owner)
                    .filter(eligible)
                    .cloned()
                    .into_iter()
                    .collect();
                let replicas = snapshot
                    .replicas_of(owner)
                    .filter(eligible)
                    .cloned()
                    .collect();
                Ok((primaries, replicas))
            }
            (DeploymentKind::Proxy, _, _) => {
                // proxies have no roles; every endpoint is equivalent
                let all: Vec<_> = snapshot.nodes.iter().filter(eligible).cloned().collect();
                Ok((all.clone(), all))
            }
            _ => {
                let of_role = |role: NodeRole| {
                    snapshot
                        .nodes
                        .iter()
                        .filter(eligible)
                        .filter(|n| n.role() == role)
                        .cloned()
                        .collect::<Vec<_>>()
                };
                Ok((of_role(NodeRole::Primary), of_role(NodeRole::Replica)))
            }
        }
    }

    fn pick(&self, mut pool: Vec<Arc<NodeHandle>>, slot: Option<u16>) -> Arc<NodeHandle> {
        let idx = match (pool.len(), slot) {
            (1, _) => 0,
            // spread reads for one slot across its replicas
            (len, Some(_)) => fastrand::usize(..len),
            (len, None) => self.cursor.fetch_add(1, Ordering::Relaxed) % len,
        };
        pool.swap_remove(idx)
    }
}

fn role_word(preference: ReadPreference) -> &'static str {
    match preference {
        ReadPreference::DemandPrimary | ReadPreference::PreferPrimary => "primary",
        ReadPreference::DemandReplica | ReadPreference::PreferReplica => "replica",
    }
}
