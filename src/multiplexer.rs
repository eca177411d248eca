//! Multiplexer facade
//!
//! Owns the engine and its background threads: the reconfiguration worker,
//! the heartbeat, and (when replies may complete out of order) the
//! completion workers.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::{Connector, Raw, Request, ResultProcessor};
use crate::config::{MuxConfig, ServerAddress};
use crate::dispatch::{CompletionMode, Dispatched, PoolStats, ReplyFuture};
use crate::engine::{CompletionJob, Engine};
use crate::events::{ChangeSource, MuxEvent};
use crate::heartbeat::Heartbeat;
use crate::node::NodeStatus;
use crate::topology::{
    trigger_channel, CycleReport, ReconfigureWorker, TopologySnapshot, TopologySummary,
};
use crate::utils::{MuxError, ProtocolError, Result};

/// Point-in-time view for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct MuxStatus {
    pub topology: TopologySummary,
    pub nodes: Vec<NodeStatus>,
    pub pool: PoolStats,
    pub last_heartbeat_ms_ago: Option<u64>,
    pub last_exception: Option<String>,
}

/// Connection multiplexer for a standalone, replicated, proxied or
/// clustered deployment
///
/// ```no_run
/// use std::sync::Arc;
/// use valkey_mux::{Multiplexer, MuxConfig, Request, StringReply, TcpConnector};
///
/// let config = MuxConfig::new(["127.0.0.1:6379"]).unwrap();
/// let mux = Multiplexer::connect(config, Arc::new(TcpConnector::new())).unwrap();
/// let value = mux.execute(&Request::cmd("GET").key("user:1"), StringReply).unwrap();
/// println!("{:?}", value);
/// ```
pub struct Multiplexer {
    engine: Arc<Engine>,
    heartbeat: Mutex<Option<Heartbeat>>,
    worker: ReconfigureWorker,
    completion_workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Connect to the configured seeds and publish the first topology
    ///
    /// Runs the initial reconfiguration synchronously, repeating it up to
    /// `connect_retry` times while no server responds.
    pub fn connect(config: MuxConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate().map_err(MuxError::Config)?;

        let (trigger, triggers) = trigger_channel();
        let (sink, completion_workers) = if config.preserve_order {
            (None, Vec::new())
        } else {
            let (tx, rx) = unbounded::<CompletionJob>();
            let workers = spawn_completion_workers(config.completion_workers.max(1), rx)?;
            (Some(tx), workers)
        };
        let attempts = config.connect_retry.max(1);
        let abort_on_fail = config.abort_on_connect_fail;
        let interval = config.heartbeat_interval();

        let engine = Arc::new(Engine::new(config, connector, trigger, sink));
        let worker = ReconfigureWorker::spawn(Arc::downgrade(&engine), triggers)
            .map_err(|e| MuxError::Config(format!("failed to spawn reconfiguration worker: {}", e)))?;
        // from here on an early return closes everything through Drop
        let mux = Self {
            engine,
            heartbeat: Mutex::new(None),
            worker,
            completion_workers: Mutex::new(completion_workers),
        };

        let mut attempt = 0;
        while attempt < attempts {
            match mux.engine.reconfigure("initial connect") {
                Some(report) if report.published => break,
                Some(_) => {
                    attempt += 1;
                    info!("Connect attempt {}/{}: no server responded", attempt, attempts);
                }
                // the worker is mid-cycle; ours runs after it
                None => thread::sleep(Duration::from_millis(10)),
            }
            if mux.engine.topology.load().version > 0 {
                break;
            }
        }

        if mux.engine.topology.load().version == 0 {
            let error = mux.connect_failure();
            if abort_on_fail {
                return Err(error);
            }
            warn!("Starting without a reachable server: {}", error);
            *mux.engine.last_exception.lock() = Some(error);
        }

        let heartbeat = Heartbeat::spawn(Arc::downgrade(&mux.engine), interval)
            .map_err(|e| MuxError::Config(format!("failed to spawn heartbeat: {}", e)))?;
        *mux.heartbeat.lock() = Some(heartbeat);
        Ok(mux)
    }

    /// The most specific reason the initial connect failed
    fn connect_failure(&self) -> MuxError {
        self.engine
            .registry
            .all()
            .iter()
            .find_map(|n| n.last_exception())
            .map(MuxError::Connection)
            .unwrap_or_else(|| {
                MuxError::NoRoute(format!(
                    "none of {} endpoints responded",
                    self.engine.config.seeds.len()
                ))
            })
    }

    /// Submit a request in the given completion mode
    pub fn dispatch<P: ResultProcessor>(
        &self,
        request: &Request,
        processor: P,
        mode: CompletionMode,
    ) -> Result<Dispatched<P>> {
        self.engine.dispatch(request, processor, mode)
    }

    /// Send and wait up to the sync timeout
    pub fn execute<P: ResultProcessor>(&self, request: &Request, processor: P) -> Result<P::Output> {
        match self.engine.dispatch(request, processor, CompletionMode::Blocking)? {
            Dispatched::Completed(result) => result,
            Dispatched::Sent | Dispatched::Pending(_) => Err(MuxError::Protocol(
                ProtocolError::unexpected("completed dispatch", "deferred"),
            )),
        }
    }

    /// Send and return a future for the processed reply
    pub fn execute_async<P: ResultProcessor + Unpin>(
        &self,
        request: &Request,
        processor: P,
    ) -> Result<ReplyFuture<P>> {
        match self.engine.dispatch(request, processor, CompletionMode::Future)? {
            Dispatched::Pending(future) => Ok(future),
            Dispatched::Sent | Dispatched::Completed(_) => Err(MuxError::Protocol(
                ProtocolError::unexpected("pending dispatch", "completed"),
            )),
        }
    }

    /// Send without waiting; errors in the reply are only logged
    pub fn execute_detached(&self, request: &Request) -> Result<()> {
        self.engine
            .dispatch(request, Raw, CompletionMode::FireAndForget)
            .map(|_| ())
    }

    /// Node a request would be sent to, without sending it
    pub fn select(&self, request: &Request) -> Result<ServerAddress> {
        let slot = self.engine.request_slot(request)?;
        Ok(self.engine.route(request, slot)?.address().clone())
    }

    pub fn current_topology(&self) -> Arc<TopologySnapshot> {
        self.engine.topology.load_full()
    }

    /// Ask for a reconfiguration; false if one is already pending
    pub fn force_reconfigure(&self, reason: &str) -> bool {
        self.engine.trigger_reconfigure(reason)
    }

    /// Run a reconfiguration on the calling thread and wait for it
    ///
    /// Returns `None` when a cycle was already running.
    pub fn reconfigure_now(&self, reason: &str) -> Option<CycleReport> {
        if self.engine.is_closed() {
            return None;
        }
        self.engine.reconfigure(reason)
    }

    /// Another client announced a topology change
    pub fn notify_configuration_changed(&self, address: Option<&ServerAddress>) {
        info!(
            "Configuration change announced for {}",
            address.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string())
        );
        self.engine.events.publish(MuxEvent::ConfigurationChanged {
            address: address.map(|a| a.to_string()),
            source: ChangeSource::Broadcast,
        });
        self.engine.trigger_reconfigure("configuration change announced");
    }

    pub fn subscribe(&self) -> Receiver<MuxEvent> {
        self.engine.events.subscribe()
    }

    /// Milliseconds since the heartbeat last ran
    pub fn last_heartbeat(&self) -> Option<u64> {
        self.engine.last_heartbeat_ms_ago()
    }

    pub fn last_exception(&self) -> Option<MuxError> {
        self.engine.last_exception.lock().clone()
    }

    pub fn status(&self) -> MuxStatus {
        let topology = self.engine.topology.load();
        MuxStatus {
            topology: topology.summary(),
            nodes: self.engine.registry.all().iter().map(|n| n.status()).collect(),
            pool: self.engine.pool.stats(),
            last_heartbeat_ms_ago: self.last_heartbeat(),
            last_exception: self.last_exception().map(|e| e.to_string()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    /// Stop background threads and fail everything outstanding with
    /// [`MuxError::Closed`]
    pub fn close(&self) {
        if !self.engine.mark_closed() {
            return;
        }
        debug!("Closing multiplexer");
        if let Some(mut heartbeat) = self.heartbeat.lock().take() {
            heartbeat.stop();
        }
        self.engine.wake_worker();
        self.worker.join();
        self.engine.teardown_nodes();

        // closing the sink lets the completion workers drain and exit
        drop(self.engine.take_completion_sink());
        for handle in self.completion_workers.lock().drain(..) {
            if handle.join().is_err() {
                warn!("Completion worker panicked");
            }
        }
        info!("Multiplexer closed");
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_completion_workers(
    count: usize,
    jobs: Receiver<CompletionJob>,
) -> Result<Vec<JoinHandle<()>>> {
    (0..count)
        .map(|id| {
            let jobs = jobs.clone();
            thread::Builder::new()
                .name(format!("mux-complete-{}", id))
                .spawn(move || {
                    for (mut completion, reply) in jobs.iter() {
                        completion.complete(reply);
                    }
                })
                .map_err(|e| MuxError::Config(format!("failed to spawn completion worker: {}", e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::client::{Raw, StringReply};
    use crate::cluster::{slot_for_key, TOTAL_SLOTS};
    use crate::config::mux_config::DEFAULT_TIEBREAKER;
    use crate::config::{AuthConfig, CommandMap, Proxy, ReadPreference};
    use crate::node::UnselectableReason;
    use crate::testing::{cluster_nodes, wait_until, FakeServer, MockConnector, Mode};
    use crate::topology::{DeploymentKind, Verdict};
    use crate::utils::{ConnectionError, ConnectionFailureKind, RespValue};

    fn config(seeds: &[&str]) -> MuxConfig {
        let mut config = MuxConfig::new(seeds)
            .unwrap()
            .with_sync_timeout(Duration::from_millis(1000))
            .with_heartbeat_interval(Duration::from_millis(50));
        config.connect_timeout_ms = 500;
        config.connect_retry = 1;
        config
    }

    fn next_event(events: &Receiver<MuxEvent>, wanted: impl Fn(&MuxEvent) -> bool) -> Option<MuxEvent> {
        let deadline = Instant::now() + Duration::from_secs(3);
        while let Ok(event) = events.recv_deadline(deadline) {
            if wanted(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Run a cycle on this thread, waiting out any cycle already running
    fn reconfigure(mux: &Multiplexer, reason: &str) -> CycleReport {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if let Some(report) = mux.reconfigure_now(reason) {
                return report;
            }
            assert!(Instant::now() < deadline, "no cycle ran for '{}'", reason);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn nominate(servers: &[&Arc<FakeServer>], winner: &FakeServer) {
        for server in servers {
            server.set(DEFAULT_TIEBREAKER, &winner.address().to_string());
        }
    }

    #[test]
    fn test_unanimous_election_routes_to_winner() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        let b = connector.add("10.0.0.2:6379");
        nominate(&[&a, &b], &b);

        let mux = Multiplexer::connect(config(&["10.0.0.1:6379", "10.0.0.2:6379"]), connector.clone())
            .unwrap();
        let topology = mux.current_topology();
        assert_eq!(topology.kind, DeploymentKind::Standalone);
        assert_eq!(topology.elected_primary.as_ref(), Some(b.address()));
        assert!(topology
            .node(a.address())
            .unwrap()
            .is_unselectable_for(UnselectableReason::RedundantPrimary));

        let write = Request::cmd("SET").key("user:1").arg("x");
        assert_eq!(mux.select(&write).unwrap(), *b.address());
        assert_eq!(mux.execute(&write, Raw).unwrap(), RespValue::simple("OK"));
        assert!(b.saw(&["SET", "user:1", "x"]));
        assert!(!a.saw(&["SET", "user:1", "x"]));
    }

    #[test]
    fn test_contested_election_picks_first_responder() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        let b = connector.add("10.0.0.2:6379");
        a.set(DEFAULT_TIEBREAKER, "10.0.0.1:6379");
        b.set(DEFAULT_TIEBREAKER, "10.0.0.2:6379");

        let mux = Multiplexer::connect(config(&["10.0.0.1:6379", "10.0.0.2:6379"]), connector.clone())
            .unwrap();
        let report = mux.reconfigure_now("test").expect("no other cycle running");
        let outcome = report.election.unwrap();
        assert_eq!(outcome.verdict, Verdict::Contested);
        assert!(outcome.arbitrary);
        assert_eq!(report.elected.as_ref(), Some(a.address()));
        // nothing changed since the first cycle
        assert!(!report.changed);
    }

    #[test]
    fn test_no_nominations_is_arbitrary() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        connector.add("10.0.0.2:6379");

        let mux = Multiplexer::connect(config(&["10.0.0.1:6379", "10.0.0.2:6379"]), connector.clone())
            .unwrap();
        let report = mux.reconfigure_now("test").unwrap();
        let outcome = report.election.unwrap();
        assert_eq!(outcome.verdict, Verdict::NoNominations);
        assert!(outcome.arbitrary);
        assert_eq!(outcome.elected.as_ref(), Some(a.address()));
    }

    #[test]
    fn test_replica_leads_to_primary() {
        let connector = MockConnector::new();
        let primary = connector.add("10.0.0.1:6379");
        let replica = connector.add("10.0.0.3:6379");
        replica.set_replica_of(primary.address());

        // only the replica is configured
        let mux = Multiplexer::connect(config(&["10.0.0.3:6379"]), connector.clone()).unwrap();
        let topology = mux.current_topology();
        assert_eq!(topology.nodes.len(), 2);
        assert_eq!(topology.elected_primary.as_ref(), Some(primary.address()));

        let read = |pref| Request::cmd("GET").key("k").prefer(pref);
        assert_eq!(mux.select(&read(ReadPreference::DemandReplica)).unwrap(), *replica.address());
        assert_eq!(mux.select(&read(ReadPreference::PreferPrimary)).unwrap(), *primary.address());

        primary.set_refuse(true);
        primary.kill();
        // primary gone: PreferPrimary falls back, DemandPrimary does not
        assert!(wait_until(Duration::from_secs(1), || {
            mux.select(&read(ReadPreference::DemandPrimary)).is_err()
        }));
        assert_eq!(mux.select(&read(ReadPreference::PreferPrimary)).unwrap(), *replica.address());
        assert!(mux
            .select(&read(ReadPreference::DemandPrimary))
            .unwrap_err()
            .is_no_route());
    }

    #[test]
    fn test_primary_change_is_broadcast() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        let b = connector.add("10.0.0.2:6379");
        nominate(&[&a, &b], &a);

        let mut cfg = config(&["10.0.0.1:6379", "10.0.0.2:6379"]);
        cfg.broadcast_channel = Some("mux-primary".to_string());
        let mux = Multiplexer::connect(cfg, connector.clone()).unwrap();
        assert_eq!(mux.current_topology().elected_primary.as_ref(), Some(a.address()));
        // the first election announces nothing
        assert_eq!(a.received("PUBLISH"), 0);

        let events = mux.subscribe();
        nominate(&[&a, &b], &b);
        let report = mux.reconfigure_now("failover").unwrap();
        assert!(report.changed);
        assert_eq!(report.elected.as_ref(), Some(b.address()));

        let announced = ["PUBLISH", "mux-primary", "10.0.0.2:6379"];
        assert!(wait_until(Duration::from_secs(1), || a.saw(&announced) && b.saw(&announced)));
        let event = next_event(&events, |e| matches!(e, MuxEvent::ConfigurationChanged { .. }));
        assert_eq!(
            event,
            Some(MuxEvent::ConfigurationChanged {
                address: Some("10.0.0.2:6379".to_string()),
                source: ChangeSource::Local,
            })
        );
    }

    #[test]
    fn test_inconclusive_election_keeps_topology() {
        let connector = MockConnector::new();
        let primary = connector.add("10.0.0.1:6379");
        let replica = connector.add("10.0.0.2:6379");
        replica.set_replica_of(primary.address());

        let mut cfg = config(&["10.0.0.1:6379", "10.0.0.2:6379"]);
        cfg.broadcast_channel = Some("mux-primary".to_string());
        let mux = Multiplexer::connect(cfg, connector.clone()).unwrap();
        let before = mux.current_topology();
        assert_eq!(before.elected_primary.as_ref(), Some(primary.address()));

        let events = mux.subscribe();
        primary.set_refuse(true);
        primary.kill();

        // only the replica answers: nothing to elect
        let report = reconfigure(&mux, "primary lost");
        assert_eq!(
            report.election.as_ref().map(|e| e.verdict),
            Some(Verdict::NoCandidates)
        );
        assert!(!report.published);
        assert_eq!(report.version, before.version);

        let after = mux.current_topology();
        assert_eq!(after.version, before.version);
        assert_eq!(after.elected_primary.as_ref(), Some(primary.address()));
        assert!(!events
            .try_iter()
            .any(|e| matches!(e, MuxEvent::ConfigurationChanged { .. })));
        // reads still fall back to the replica
        let read = Request::cmd("GET").key("k").prefer(ReadPreference::PreferPrimary);
        assert_eq!(mux.select(&read).unwrap(), *replica.address());

        // the replica is promoted: a real change from the old primary, made
        // by whichever cycle runs first
        replica.promote();
        mux.force_reconfigure("replica promoted");
        assert!(wait_until(Duration::from_secs(2), || {
            mux.current_topology().elected_primary.as_ref() == Some(replica.address())
        }));
        let announced = ["PUBLISH", "mux-primary", "10.0.0.2:6379"];
        assert!(wait_until(Duration::from_secs(1), || replica.saw(&announced)));
    }

    #[test]
    fn test_triggers_during_a_cycle_coalesce() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        let mux = Arc::new(Multiplexer::connect(config(&["10.0.0.1:6379"]), connector.clone()).unwrap());
        let before = a.received("ECHO");

        // the next cycle waits out its discovery deadline
        a.set_stalled(true);
        let slow = {
            let mux = Arc::clone(&mux);
            thread::spawn(move || mux.reconfigure_now("slow"))
        };
        assert!(wait_until(Duration::from_secs(1), || a.received("ECHO") == before + 1));

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let mux = Arc::clone(&mux);
                thread::spawn(move || {
                    mux.force_reconfigure("burst");
                    mux.reconfigure_now("burst")
                })
            })
            .collect();
        for caller in callers {
            assert!(caller.join().unwrap().is_none());
        }

        a.set_stalled(false);
        assert!(slow.join().unwrap().is_some());
        // one follow-up for every trigger raised during the slow cycle
        assert!(wait_until(Duration::from_secs(2), || a.received("ECHO") == before + 2));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(a.received("ECHO"), before + 2);
    }

    fn cluster_pair(connector: &MockConnector) -> (Arc<FakeServer>, Arc<FakeServer>) {
        let x = connector.add("10.0.1.1:7000");
        let y = connector.add("10.0.1.2:7000");
        x.set_mode(Mode::Cluster);
        y.set_mode(Mode::Cluster);
        let text = cluster_nodes(&[(&x, &[(0, TOTAL_SLOTS - 1)]), (&y, &[])]);
        x.set_cluster_nodes(&text);
        y.set_cluster_nodes(&text);
        (x, y)
    }

    #[test]
    fn test_moved_resends_and_relocates_slot() {
        let connector = MockConnector::new();
        let (x, y) = cluster_pair(&connector);
        let mux = Multiplexer::connect(config(&["10.0.1.1:7000"]), connector.clone()).unwrap();

        let topology = mux.current_topology();
        assert_eq!(topology.kind, DeploymentKind::Cluster);
        assert_eq!(topology.nodes.len(), 2);
        let key = "user:1000";
        let slot = slot_for_key(key.as_bytes());
        assert_eq!(topology.shard_map.as_ref().unwrap().node_for(slot), Some(x.address()));

        // the slot migrates to y
        let mut x_ranges = Vec::new();
        if slot > 0 {
            x_ranges.push((0, slot - 1));
        }
        if slot < TOTAL_SLOTS - 1 {
            x_ranges.push((slot + 1, TOTAL_SLOTS - 1));
        }
        let text = cluster_nodes(&[(&x, &x_ranges), (&y, &[(slot, slot)])]);
        x.set_cluster_nodes(&text);
        y.set_cluster_nodes(&text);
        x.set_moved(slot, y.address());
        y.set(key, "moved-value");

        let events = mux.subscribe();
        let value = mux.execute(&Request::cmd("GET").key(key), StringReply).unwrap();
        assert_eq!(value.as_deref(), Some("moved-value"));
        assert!(x.saw(&["GET", key]));
        assert!(y.saw(&["GET", key]));

        let shard_map = mux.current_topology().shard_map.clone().unwrap();
        assert_eq!(shard_map.node_for(slot), Some(y.address()));
        assert_eq!(
            topology
                .node(x.address())
                .unwrap()
                .counters
                .redirects
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        let moved = next_event(&events, |e| matches!(e, MuxEvent::ShardOwnershipMoved { .. }));
        assert_eq!(
            moved,
            Some(MuxEvent::ShardOwnershipMoved {
                slot,
                from: Some(x.address().to_string()),
                to: y.address().to_string(),
            })
        );
        // later requests go straight to the new owner
        assert_eq!(mux.select(&Request::cmd("GET").key(key)).unwrap(), *y.address());
    }

    #[test]
    fn test_redirect_is_followed_once() {
        let connector = MockConnector::new();
        let (x, y) = cluster_pair(&connector);
        let mux = Multiplexer::connect(config(&["10.0.1.1:7000"]), connector.clone()).unwrap();

        let key = "ping-pong";
        let slot = slot_for_key(key.as_bytes());
        x.set_moved(slot, y.address());
        y.set_moved(slot, x.address());

        match mux.execute(&Request::cmd("GET").key(key), Raw) {
            Err(MuxError::Server(text)) => {
                assert_eq!(text, format!("MOVED {} {}", slot, x.address()))
            }
            other => panic!("expected the second MOVED, got {:?}", other),
        }
        assert_eq!(x.received("GET"), 1);
        assert_eq!(y.received("GET"), 1);
    }

    #[test]
    fn test_ask_resends_with_asking_and_keeps_shard_map() {
        let connector = MockConnector::new();
        let (x, y) = cluster_pair(&connector);
        let mux = Multiplexer::connect(config(&["10.0.1.1:7000"]), connector.clone()).unwrap();
        let events = mux.subscribe();

        let key = "migrating";
        let slot = slot_for_key(key.as_bytes());
        x.set_ask(slot, y.address());
        y.set(key, "imported");

        let value = mux.execute(&Request::cmd("GET").key(key), StringReply).unwrap();
        assert_eq!(value.as_deref(), Some("imported"));

        let log = y.log();
        let get = log.iter().position(|c| c == &["GET", key]).unwrap();
        assert!(get > 0);
        assert_eq!(log[get - 1], ["ASKING"]);

        // a migrating slot stays with its owner
        let shard_map = mux.current_topology().shard_map.clone().unwrap();
        assert_eq!(shard_map.node_for(slot), Some(x.address()));
        assert!(!events
            .try_iter()
            .any(|e| matches!(e, MuxEvent::ShardOwnershipMoved { .. })));
    }

    #[test]
    fn test_multi_slot_rejected_before_sending() {
        let connector = MockConnector::new();
        let (x, _y) = cluster_pair(&connector);
        let mux = Multiplexer::connect(config(&["10.0.1.1:7000"]), connector.clone()).unwrap();
        assert_ne!(slot_for_key(b"a"), slot_for_key(b"b"));

        let request = Request::cmd("MGET").key("a").key("b");
        let err = mux.execute(&request, Raw).unwrap_err();
        assert!(matches!(err, MuxError::MultiSlot { .. }));
        assert_eq!(x.received("MGET"), 0);

        // hash tags keep related keys together
        let tagged = Request::cmd("MGET").key("{user}:a").key("{user}:b");
        // the fake server does not know MGET; reaching it is what counts
        assert!(matches!(mux.execute(&tagged, Raw), Err(MuxError::Server(_))));
        assert_eq!(x.received("MGET"), 1);
    }

    #[test]
    fn test_multi_key_outside_cluster_routes_normally() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        let mux = Multiplexer::connect(config(&["10.0.0.1:6379"]), connector.clone()).unwrap();
        let request = Request::cmd("DEL").key("a").key("b");
        assert_eq!(mux.select(&request).unwrap(), *a.address());
    }

    #[test]
    fn test_blocking_timeout_keeps_cell_until_reply() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        a.set("k", "v");
        let mut cfg = config(&["10.0.0.1:6379"]).with_sync_timeout(Duration::from_millis(200));
        cfg.response_timeout_ms = 10_000;
        let mux = Multiplexer::connect(cfg, connector.clone()).unwrap();
        let idle = mux.status().pool.in_use;

        a.set_stalled(true);
        let err = mux
            .execute(&Request::cmd("GET").key("k"), StringReply)
            .unwrap_err();
        let MuxError::Timeout(details) = err else {
            panic!("expected timeout, got {:?}", err);
        };
        assert_eq!(details.command, "GET");
        assert_eq!(details.node, "10.0.0.1:6379");
        assert_eq!(details.in_flight, 1);
        assert!(!details.send_canceled);
        assert_eq!(details.state, "established");
        // the abandoned cell stays out of the pool while its reply is owed
        assert_eq!(mux.status().pool.in_use, idle + 1);

        a.set_stalled(false);
        assert!(wait_until(Duration::from_secs(1), || mux.status().pool.in_use == idle));
        // the late reply was discarded, not handed to the next caller
        a.set("k", "v2");
        let value = mux.execute(&Request::cmd("GET").key("k"), StringReply).unwrap();
        assert_eq!(value.as_deref(), Some("v2"));
    }

    #[test]
    fn test_future_mode() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        a.set("k", "v");
        let mux = Multiplexer::connect(config(&["10.0.0.1:6379"]), connector.clone()).unwrap();

        let future = mux.execute_async(&Request::cmd("GET").key("k"), StringReply).unwrap();
        assert_eq!(futures::executor::block_on(future).unwrap().as_deref(), Some("v"));

        // server errors surface only when the result is unwrapped
        let future = mux.execute_async(&Request::cmd("NOSUCH"), Raw).unwrap();
        let err = futures::executor::block_on(future).unwrap_err();
        assert!(matches!(err, MuxError::Server(ref msg) if msg.starts_with("ERR unknown")));
    }

    #[test]
    fn test_heartbeat_expires_futures() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        let mut cfg = config(&["10.0.0.1:6379"]).with_sync_timeout(Duration::from_millis(150));
        cfg.response_timeout_ms = 10_000;
        let mux = Multiplexer::connect(cfg, connector.clone()).unwrap();

        a.set_stalled(true);
        let future = mux.execute_async(&Request::cmd("GET").key("k"), StringReply).unwrap();
        let err = futures::executor::block_on(future).unwrap_err();
        assert!(err.is_timeout());
        assert!(mux.last_heartbeat().is_some());
        a.set_stalled(false);
    }

    #[test]
    fn test_unresponsive_node_is_failed_and_restored() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        a.set("k", "v");
        let mut cfg = config(&["10.0.0.1:6379"]);
        cfg.response_timeout_ms = 100;
        let mux = Multiplexer::connect(cfg, connector.clone()).unwrap();
        let events = mux.subscribe();

        a.set_stalled(true);
        mux.execute_detached(&Request::cmd("GET").key("k")).unwrap();
        let failed = next_event(&events, |e| matches!(e, MuxEvent::ConnectionFailed { .. }));
        match failed {
            Some(MuxEvent::ConnectionFailed { address, kind, .. }) => {
                assert_eq!(address, "10.0.0.1:6379");
                assert_eq!(kind, ConnectionFailureKind::NoResponse);
            }
            other => panic!("expected connection failure, got {:?}", other),
        }

        a.set_stalled(false);
        assert!(next_event(&events, |e| matches!(e, MuxEvent::ConnectionRestored { .. })).is_some());
        assert!(wait_until(Duration::from_secs(3), || {
            mux.execute(&Request::cmd("GET").key("k"), StringReply).is_ok()
        }));
    }

    #[test]
    fn test_dead_node_reconnects_with_backoff() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        let b = connector.add("10.0.0.2:6379");
        nominate(&[&a, &b], &a);
        let mux = Multiplexer::connect(config(&["10.0.0.1:6379", "10.0.0.2:6379"]), connector.clone())
            .unwrap();
        let events = mux.subscribe();

        b.set_refuse(true);
        b.kill();
        let deadline = Instant::now() + Duration::from_millis(800);
        let mut failures = 0;
        while let Ok(event) = events.recv_deadline(deadline) {
            if matches!(event, MuxEvent::ConnectionFailed { ref address, .. } if address == "10.0.0.2:6379")
            {
                failures += 1;
            }
        }
        // one attempt per 50ms tick would be about sixteen
        assert!(failures >= 2, "only {} failures", failures);
        assert!(failures <= 7, "{} failures without backing off", failures);
        assert_eq!(mux.current_topology().elected_primary.as_ref(), Some(a.address()));
    }

    #[test]
    fn test_socket_failure_fails_in_flight() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        let mut cfg = config(&["10.0.0.1:6379"]);
        cfg.response_timeout_ms = 10_000;
        let mux = Arc::new(Multiplexer::connect(cfg, connector.clone()).unwrap());
        let events = mux.subscribe();

        a.set_stalled(true);
        let waiting = {
            let mux = Arc::clone(&mux);
            thread::spawn(move || mux.execute(&Request::cmd("GET").key("slow"), StringReply))
        };
        assert!(wait_until(Duration::from_secs(1), || a.saw(&["GET", "slow"])));
        a.kill();

        let err = waiting.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            MuxError::Connection(ConnectionError::SocketFailure { .. })
        ));
        assert!(next_event(&events, |e| matches!(
            e,
            MuxEvent::ConnectionFailed {
                kind: ConnectionFailureKind::SocketFailure,
                ..
            }
        ))
        .is_some());
        a.set_stalled(false);
    }

    #[test]
    fn test_connect_failure_aborts_or_is_stored() {
        let connector = MockConnector::new();
        let err = Multiplexer::connect(config(&["10.0.9.9:6379"]), connector.clone())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            MuxError::Connection(ConnectionError::ConnectFailed { .. })
        ));

        let mut cfg = config(&["10.0.9.9:6379"]);
        cfg.abort_on_connect_fail = false;
        let mux = Multiplexer::connect(cfg, connector.clone()).unwrap();
        assert!(mux.last_exception().is_some());
        assert!(mux
            .select(&Request::cmd("GET").key("k"))
            .unwrap_err()
            .is_no_route());
    }

    #[test]
    fn test_auth_failure() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        a.require_password("secret");

        let mut cfg = config(&["10.0.0.1:6379"]);
        cfg.auth = Some(AuthConfig {
            password: "wrong".to_string(),
            username: None,
        });
        let err = Multiplexer::connect(cfg.clone(), connector.clone()).err().unwrap();
        assert!(matches!(
            err,
            MuxError::Connection(ConnectionError::AuthFailed(_))
        ));

        cfg.auth = Some(AuthConfig {
            password: "secret".to_string(),
            username: None,
        });
        let mux = Multiplexer::connect(cfg, connector.clone()).unwrap();
        assert!(mux.execute(&Request::cmd("SET").key("k").arg("v"), Raw).is_ok());
    }

    #[test]
    fn test_admin_and_disabled_commands() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        let mut cfg = config(&["10.0.0.1:6379"]);
        cfg.command_map = CommandMap::default().disable(&["SORT"]);
        let mux = Multiplexer::connect(cfg, connector.clone()).unwrap();

        let err = mux.execute(&Request::cmd("flushall"), Raw).unwrap_err();
        assert!(matches!(err, MuxError::AdminNotPermitted(ref c) if c == "FLUSHALL"));
        let err = mux.execute(&Request::cmd("SORT").key("list"), Raw).unwrap_err();
        assert!(matches!(err, MuxError::CommandDisabled(_)));
        assert_eq!(a.received("FLUSHALL") + a.received("SORT"), 0);
    }

    #[test]
    fn test_sentinel_is_not_selectable() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        let s = connector.add("10.0.0.5:26379");
        s.set_mode(Mode::Sentinel);

        let mux = Multiplexer::connect(config(&["10.0.0.5:26379", "10.0.0.1:6379"]), connector.clone())
            .unwrap();
        let topology = mux.current_topology();
        assert!(topology
            .node(s.address())
            .unwrap()
            .is_unselectable_for(UnselectableReason::WrongServerKind));
        assert_eq!(topology.elected_primary.as_ref(), Some(a.address()));
    }

    #[test]
    fn test_proxy_endpoints_are_interchangeable() {
        let connector = MockConnector::new();
        connector.add("10.0.2.1:22121");
        connector.add("10.0.2.2:22121");
        let mut cfg = config(&["10.0.2.1:22121", "10.0.2.2:22121"]).with_tiebreaker(None);
        cfg.proxy = Proxy::Twemproxy;
        cfg.command_map = CommandMap::twemproxy();
        let mux = Multiplexer::connect(cfg, connector.clone()).unwrap();

        let topology = mux.current_topology();
        assert_eq!(topology.kind, DeploymentKind::Proxy);
        assert!(topology.nodes.iter().all(|n| n.is_eligible()));
        let first = mux.select(&Request::cmd("TIME")).unwrap();
        let second = mux.select(&Request::cmd("TIME")).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_unordered_completion_workers() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        a.set("k", "v");
        let mut cfg = config(&["10.0.0.1:6379"]);
        cfg.preserve_order = false;
        cfg.completion_workers = 2;
        let mux = Multiplexer::connect(cfg, connector.clone()).unwrap();
        for _ in 0..20 {
            let value = mux.execute(&Request::cmd("GET").key("k"), StringReply).unwrap();
            assert_eq!(value.as_deref(), Some("v"));
        }
        mux.close();
    }

    #[test]
    fn test_close_fails_outstanding_requests() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:6379");
        let mut cfg = config(&["10.0.0.1:6379"]);
        cfg.response_timeout_ms = 10_000;
        let mux = Multiplexer::connect(cfg, connector.clone()).unwrap();

        a.set_stalled(true);
        let future = mux.execute_async(&Request::cmd("GET").key("k"), StringReply).unwrap();
        mux.close();
        assert!(matches!(
            futures::executor::block_on(future),
            Err(MuxError::Closed)
        ));
        assert!(matches!(
            mux.execute(&Request::cmd("GET").key("k"), StringReply),
            Err(MuxError::Closed)
        ));
        assert!(mux.is_closed());
    }
}
