//! Reconfiguration cycle
//!
//! One cycle connects every known node, queries them all against a single
//! deadline, classifies the responders and then either reads the cluster's
//! shard map or elects a primary among standalone servers. The result is
//! published as a new snapshot.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::election::{elect, ElectionBallot, ElectionOutcome, Verdict};
use super::discovery::{LivenessVerb, ServerInfo};
use super::snapshot::{DeploymentKind, TopologySnapshot};
use crate::cluster::{ClusterNodeEntry, ShardMap};
use crate::config::{Proxy, ServerAddress};
use crate::dispatch::{CompletionWaiter, MessageKind};
use crate::engine::Engine;
use crate::events::{ChangeSource, MuxEvent};
use crate::node::{ConnectionState, NodeHandle, NodeRole, ServerKind, UnselectableReason};
use crate::utils::{ConnectionError, MuxError, ProtocolError, RespValue};

/// Summary of one completed cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub reason: String,
    pub queried: usize,
    pub responded: usize,
    pub kind: DeploymentKind,
    pub elected: Option<ServerAddress>,
    pub election: Option<ElectionOutcome>,
    /// A snapshot was published
    pub published: bool,
    /// Primary, shard map or deployment kind differ from before
    pub changed: bool,
    pub version: u64,
    pub elapsed_ms: u64,
}

struct NodeReport {
    node: Arc<NodeHandle>,
    responded: bool,
    info: ServerInfo,
    nomination: Option<String>,
}

struct PendingQueries {
    liveness: Option<CompletionWaiter>,
    info: Vec<CompletionWaiter>,
    vote: Option<CompletionWaiter>,
}

impl Engine {
    /// Run one cycle unless another one holds the single-flight marker
    pub(crate) fn reconfigure(self: &Arc<Self>, reason: &str) -> Option<CycleReport> {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Reconfiguration already running, skipping '{}'", reason);
            return None;
        }
        let report = self.run_cycle(reason);
        self.cycle_running.store(false, Ordering::Release);
        Some(report)
    }

    fn is_proxy(&self) -> bool {
        self.config.proxy == Proxy::Twemproxy
    }

    /// Seeds first, then every address learned since
    fn known_addresses(&self) -> Vec<ServerAddress> {
        let mut addresses = self.config.seeds.clone();
        for node in self.registry.all().iter() {
            if !addresses.contains(node.address()) {
                addresses.push(node.address().clone());
            }
        }
        addresses
    }

    fn run_cycle(self: &Arc<Self>, reason: &str) -> CycleReport {
        let started = Instant::now();
        info!("Reconfiguring: {}", reason);
        let previous = self.topology.load_full();

        let mut pending = self.known_addresses();
        let mut results: Vec<NodeReport> = Vec::new();
        let mut cluster: Option<ShardMap> = None;
        let mut extra_pass = false;

        loop {
            let nodes: Vec<Arc<NodeHandle>> = pending
                .iter()
                .map(|a| self.registry.get_or_insert(a).0)
                .collect();
            self.connect_all(&nodes);
            let batch = self.query_all(&nodes);
            for result in &batch {
                self.classify(result);
            }
            results.extend(batch);

            let mut discovered: Vec<ServerAddress> = Vec::new();
            if cluster.is_none() && !self.is_proxy() {
                let cluster_node = results
                    .iter()
                    .find(|r| r.responded && r.node.kind() == ServerKind::Cluster)
                    .map(|r| Arc::clone(&r.node));
                if let Some(node) = cluster_node {
                    match self.discover_cluster(&node) {
                        Ok((map, entries)) => {
                            self.apply_cluster_roles(&entries);
                            discovered.extend(entries.into_iter().map(|e| e.address));
                            cluster = Some(map);
                        }
                        Err(e) => warn!("CLUSTER NODES on {} failed: {}", node.address(), e),
                    }
                }
            }
            // replicas point at primaries we may not know yet
            discovered.extend(results.iter().filter_map(|r| r.info.primary.clone()));

            let mut fresh: Vec<ServerAddress> = Vec::new();
            for address in discovered {
                if !fresh.contains(&address) && !results.iter().any(|r| r.node.address() == &address) {
                    fresh.push(address);
                }
            }
            if fresh.is_empty() {
                break;
            }
            if extra_pass {
                debug!("{} addresses left for the next cycle", fresh.len());
                break;
            }
            debug!("Discovered {} new addresses, probing them", fresh.len());
            extra_pass = true;
            pending = fresh;
        }

        let responded = results.iter().filter(|r| r.responded).count();
        let mut report = CycleReport {
            reason: reason.to_string(),
            queried: results.len(),
            responded,
            kind: previous.kind,
            elected: previous.elected_primary.clone(),
            election: None,
            published: false,
            changed: false,
            version: previous.version,
            elapsed_ms: 0,
        };

        if responded == 0 {
            warn!(
                "No server responded during reconfiguration ({} queried); keeping previous topology",
                results.len()
            );
            report.elapsed_ms = started.elapsed().as_millis() as u64;
            return report;
        }

        let kind = if self.is_proxy() {
            DeploymentKind::Proxy
        } else if cluster.is_some()
            || results
                .iter()
                .any(|r| r.responded && r.node.kind() == ServerKind::Cluster)
        {
            DeploymentKind::Cluster
        } else {
            DeploymentKind::Standalone
        };

        let (elected, shard_map) = match kind {
            DeploymentKind::Standalone => {
                let outcome = self.run_election(&results);
                let inconclusive = outcome.verdict == Verdict::NoCandidates;
                let elected = outcome.elected.clone();
                report.election = Some(outcome);
                // the first snapshot is still published so replicas can serve reads
                if inconclusive && previous.version > 0 {
                    warn!(
                        "Election inconclusive ({} responded, none primary); keeping topology v{}",
                        responded, previous.version
                    );
                    report.elapsed_ms = started.elapsed().as_millis() as u64;
                    return report;
                }
                (elected, None)
            }
            DeploymentKind::Cluster => {
                for r in &results {
                    r.node.set_unselectable(UnselectableReason::RedundantPrimary, false);
                }
                let map = match cluster {
                    Some(map) => {
                        if !map.is_complete() {
                            warn!(
                                "Shard map covers {} of {} slots",
                                map.assigned_slots(),
                                crate::cluster::TOTAL_SLOTS
                            );
                        }
                        Some(Arc::new(map))
                    }
                    None => previous.shard_map.clone(),
                };
                (None, map)
            }
            DeploymentKind::Proxy | DeploymentKind::Unknown => (None, None),
        };

        let changed = previous.kind != kind
            || previous.elected_primary != elected
            || shard_ranges(&previous.shard_map) != shard_ranges(&shard_map);

        let snapshot = TopologySnapshot {
            version: previous.version + 1,
            kind,
            nodes: self.registry.all().to_vec(),
            shard_map,
            elected_primary: elected.clone(),
        };
        let version = snapshot.version;
        self.topology.store(Arc::new(snapshot));

        info!(
            "Topology v{}: {:?}, {}/{} responded, primary {} ({}ms)",
            version,
            kind,
            responded,
            results.len(),
            elected
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            started.elapsed().as_millis()
        );

        if changed {
            self.events.publish(MuxEvent::ConfigurationChanged {
                address: elected.as_ref().map(|a| a.to_string()),
                source: ChangeSource::Local,
            });
            if let (Some(old), Some(new)) = (&previous.elected_primary, &elected) {
                if old != new {
                    info!("Primary changed from {} to {}", old, new);
                    self.broadcast_primary(new, &results);
                }
            }
        }

        report.kind = kind;
        report.elected = elected;
        report.published = true;
        report.changed = changed;
        report.version = version;
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report
    }

    /// Connect every disconnected node in parallel
    fn connect_all(self: &Arc<Self>, nodes: &[Arc<NodeHandle>]) {
        let disconnected: Vec<&Arc<NodeHandle>> = nodes
            .iter()
            .filter(|n| n.state() == ConnectionState::Disconnected)
            .collect();
        if disconnected.is_empty() {
            return;
        }
        thread::scope(|scope| {
            for node in disconnected {
                scope.spawn(move || {
                    if let Err(e) = self.connect_node(node) {
                        debug!("Connect to {} failed: {}", node.address(), e);
                    }
                });
            }
        });
    }

    /// Send every query first, then collect replies against one deadline
    fn query_all(&self, nodes: &[Arc<NodeHandle>]) -> Vec<NodeReport> {
        let map = &self.config.command_map;
        let tiebreaker = self.config.tiebreaker.as_deref();
        let proxy = self.is_proxy();
        let verb = LivenessVerb::choose(map, tiebreaker);
        let info_available = !proxy && map.is_available("INFO");
        let vote_key = tiebreaker.filter(|_| {
            !proxy && map.is_available("GET") && verb != Some(LivenessVerb::GetTiebreaker)
        });

        let pending: Vec<Option<PendingQueries>> = nodes
            .iter()
            .map(|node| {
                if !node.is_established() {
                    return None;
                }
                Some(PendingQueries {
                    liveness: verb.map(|v| {
                        self.send_internal(node, &v.args(tiebreaker), MessageKind::Discovery)
                    }),
                    info: if info_available {
                        vec![
                            self.send_internal(node, &["INFO", "replication"], MessageKind::Discovery),
                            self.send_internal(node, &["INFO", "server"], MessageKind::Discovery),
                        ]
                    } else {
                        Vec::new()
                    },
                    vote: vote_key
                        .map(|key| self.send_internal(node, &["GET", key], MessageKind::Discovery)),
                })
            })
            .collect();

        let deadline = Instant::now() + self.config.discovery_timeout();
        let remaining = || deadline.saturating_duration_since(Instant::now());

        nodes
            .iter()
            .zip(pending)
            .map(|(node, pending)| {
                let mut result = NodeReport {
                    node: Arc::clone(node),
                    responded: false,
                    info: ServerInfo::default(),
                    nomination: None,
                };

                if let Some(mut pending) = pending {
                    let liveness_reply =
                        pending.liveness.as_mut().and_then(|w| w.wait(remaining()));
                    result.responded = match (verb, &liveness_reply) {
                        (Some(v), Some(Ok(reply))) => v.accepts(reply),
                        (Some(_), _) => false,
                        // no liveness verb is available; a live connection has to do
                        (None, _) => true,
                    };
                    if verb == Some(LivenessVerb::GetTiebreaker) {
                        if let Some(Ok(ref reply)) = liveness_reply {
                            result.nomination = reply.as_str().map(str::to_string);
                        }
                    }
                    for waiter in pending.info.iter_mut() {
                        if let Some(Ok(reply)) = waiter.wait(remaining()) {
                            if let Some(text) = reply.as_str() {
                                result.info.merge(ServerInfo::parse(text));
                            }
                        }
                    }
                    if let Some(waiter) = pending.vote.as_mut() {
                        if let Some(Ok(reply)) = waiter.wait(remaining()) {
                            result.nomination = reply.as_str().map(str::to_string);
                        }
                    }
                }

                if !result.responded {
                    debug!("{} did not respond to the liveness check", node.address());
                }
                node.set_unselectable(UnselectableReason::DidNotRespond, !result.responded);
                result
            })
            .collect()
    }

    /// Apply kind and role from a discovery report to its node
    fn classify(&self, result: &NodeReport) {
        if !result.responded {
            return;
        }
        let node = &result.node;
        if self.is_proxy() {
            node.set_kind(ServerKind::Proxy);
            node.set_role(NodeRole::Unknown);
            node.set_unselectable(UnselectableReason::WrongServerKind, false);
            node.set_unselectable(UnselectableReason::RedundantPrimary, false);
            return;
        }

        let kind = result.info.kind.unwrap_or(ServerKind::Standalone);
        node.set_kind(kind);
        if kind == ServerKind::Sentinel {
            debug!("{} is a sentinel", node.address());
            node.set_role(NodeRole::Unknown);
            node.set_unselectable(UnselectableReason::WrongServerKind, true);
            return;
        }
        node.set_unselectable(UnselectableReason::WrongServerKind, false);

        let role = match (result.info.role, node.role()) {
            (Some(role), _) => role,
            (None, NodeRole::Unknown) => NodeRole::Primary,
            (None, known) => known,
        };
        node.set_role(role);
        if role == NodeRole::Replica {
            if result.info.primary.is_some() {
                node.set_primary(result.info.primary.clone());
            }
        } else {
            node.set_primary(None);
        }
    }

    /// CLUSTER NODES on one cluster node
    fn discover_cluster(
        &self,
        node: &Arc<NodeHandle>,
    ) -> Result<(ShardMap, Vec<ClusterNodeEntry>), MuxError> {
        if !self.config.command_map.is_available("CLUSTER") {
            return Err(MuxError::CommandDisabled("CLUSTER".to_string()));
        }
        let timeout = self.config.discovery_timeout();
        let mut waiter = self.send_internal(node, &["CLUSTER", "NODES"], MessageKind::Discovery);
        match waiter.wait(timeout) {
            Some(Ok(RespValue::Error(e))) => Err(MuxError::Server(e)),
            Some(Ok(reply)) => {
                let text = reply
                    .as_str()
                    .ok_or_else(|| ProtocolError::unexpected("bulk string", &reply))?;
                let (map, entries) = ShardMap::from_cluster_nodes(text, node.address())?;
                debug!(
                    "CLUSTER NODES on {}: {} nodes, {} ranges",
                    node.address(),
                    entries.len(),
                    map.ranges().len()
                );
                Ok((map, entries))
            }
            Some(Err(e)) => Err(e),
            None => Err(ConnectionError::NoResponse {
                address: node.address().to_string(),
                elapsed_ms: timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    /// Roles and replica links as reported by the cluster
    fn apply_cluster_roles(&self, entries: &[ClusterNodeEntry]) {
        let primaries: HashMap<&str, &ServerAddress> = entries
            .iter()
            .filter(|e| e.is_primary)
            .map(|e| (e.id.as_str(), &e.address))
            .collect();

        for entry in entries {
            let (node, created) = self.registry.get_or_insert(&entry.address);
            if created {
                debug!("Cluster member {} registered", entry.address);
            }
            node.set_kind(ServerKind::Cluster);
            node.set_cluster_id(Some(entry.id.clone()));
            if entry.is_primary {
                node.set_role(NodeRole::Primary);
                node.set_primary(None);
            } else if entry.is_replica {
                node.set_role(NodeRole::Replica);
                node.set_primary(
                    entry
                        .primary_id
                        .as_deref()
                        .and_then(|id| primaries.get(id))
                        .map(|a| (*a).clone()),
                );
            }
        }
    }

    /// Tie-breaker election among responding standalone primaries
    fn run_election(&self, results: &[NodeReport]) -> ElectionOutcome {
        let candidates: Vec<ServerAddress> = results
            .iter()
            .filter(|r| r.responded && r.node.role() == NodeRole::Primary)
            .filter(|r| r.node.kind() != ServerKind::Sentinel)
            .map(|r| r.node.address().clone())
            .collect();

        let mut ballot = ElectionBallot::new();
        if self.config.tiebreaker.is_some() {
            for r in results.iter().filter(|r| r.responded) {
                ballot.record(r.nomination.as_deref());
            }
        }

        let outcome = elect(&candidates, &ballot);
        log_election(&outcome, candidates.len());

        for r in results {
            let redundant = r.node.role() == NodeRole::Primary
                && outcome.elected.as_ref() != Some(r.node.address());
            r.node
                .set_unselectable(UnselectableReason::RedundantPrimary, redundant);
        }
        outcome
    }

    /// Tell sibling clients about a new primary
    fn broadcast_primary(&self, primary: &ServerAddress, results: &[NodeReport]) {
        let Some(ref channel) = self.config.broadcast_channel else {
            return;
        };
        if !self.config.command_map.is_available("PUBLISH") {
            return;
        }
        let announced = primary.to_string();
        for r in results.iter().filter(|r| r.responded && r.node.is_established()) {
            let message = self.internal_message(
                &["PUBLISH", channel.as_str(), announced.as_str()],
                MessageKind::Broadcast,
            );
            r.node.enqueue(message);
            self.flush_node(&r.node);
        }
        info!("Announced primary {} on '{}'", announced, channel);
    }
}

fn shard_ranges(map: &Option<Arc<ShardMap>>) -> Option<Vec<crate::cluster::SlotRange>> {
    map.as_ref().map(|m| m.ranges())
}

fn log_election(outcome: &ElectionOutcome, candidates: usize) {
    let elected = outcome
        .elected
        .as_ref()
        .map(|a| a.to_string())
        .unwrap_or_default();
    match outcome.verdict {
        Verdict::NoCandidates => warn!("No primary responded; nothing to elect"),
        Verdict::Single => debug!("Single primary {}", elected),
        Verdict::Contested => warn!(
            "Election contested among {} primaries, tally {:?}; arbitrarily chose {}",
            candidates, outcome.tally, elected
        ),
        Verdict::NoNominations => warn!(
            "No tie-breaker nominations among {} primaries; arbitrarily chose {}",
            candidates, elected
        ),
        Verdict::Unanimous | Verdict::Plurality if outcome.arbitrary => warn!(
            "Nomination {:?} matches no responding primary; arbitrarily chose {}",
            outcome.winning_nomination, elected
        ),
        Verdict::Unanimous | Verdict::Plurality => info!(
            "Elected {} ({:?}, tally {:?})",
            elected, outcome.verdict, outcome.tally
        ),
    }
}
