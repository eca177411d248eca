//! One logical connection to one server
//!
//! The handle owns the node's queues and its link. Writes go through a
//! try-lock writer: whichever thread wins the link lock drains `outbound`
//! into `in_flight` and the transport, so the order messages were queued is
//! the order they hit the wire and the order replies are matched.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::client::Transport;
use crate::config::ServerAddress;
use crate::dispatch::Message;
use crate::utils::clock;
use crate::utils::ConnectionError;

/// Replication role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum NodeRole {
    Unknown = 0,
    Primary = 1,
    Replica = 2,
}

impl NodeRole {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => NodeRole::Primary,
            2 => NodeRole::Replica,
            _ => NodeRole::Unknown,
        }
    }
}

/// What kind of server answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum ServerKind {
    Unknown = 0,
    Standalone = 1,
    Cluster = 2,
    Sentinel = 3,
    Proxy = 4,
}

impl ServerKind {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ServerKind::Standalone,
            2 => ServerKind::Cluster,
            3 => ServerKind::Sentinel,
            4 => ServerKind::Proxy,
            _ => ServerKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Established = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Established,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Established => "established",
        }
    }
}

/// Why routing skips a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnselectableReason {
    /// A primary that lost the election
    RedundantPrimary = 0b001,
    /// Missed the last liveness deadline
    DidNotRespond = 0b010,
    /// Sentinel, or otherwise not a data node
    WrongServerKind = 0b100,
}

impl UnselectableReason {
    const ALL: [UnselectableReason; 3] = [
        UnselectableReason::RedundantPrimary,
        UnselectableReason::DidNotRespond,
        UnselectableReason::WrongServerKind,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UnselectableReason::RedundantPrimary => "redundant-primary",
            UnselectableReason::DidNotRespond => "did-not-respond",
            UnselectableReason::WrongServerKind => "wrong-server-kind",
        }
    }
}

/// Operation counters and latency
pub struct NodeCounters {
    pub ops_sent: AtomicU64,
    pub completed: AtomicU64,
    pub errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub redirects: AtomicU64,
    pub send_canceled: AtomicU64,
    pub reconnects: AtomicU64,
    latency_us: Mutex<Histogram<u64>>,
}

impl NodeCounters {
    fn new() -> Self {
        Self {
            ops_sent: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            redirects: AtomicU64::new(0),
            send_canceled: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            latency_us: Mutex::new(
                Histogram::new_with_bounds(1, 60_000_000, 3).expect("valid histogram bounds"),
            ),
        }
    }

    /// Record a reply
    #[inline]
    pub fn record_reply(&self, latency_us: u64, is_error: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_us.lock().saturating_record(latency_us.max(1));
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn latency_percentile_us(&self, percentile: f64) -> u64 {
        let hist = self.latency_us.lock();
        if hist.len() == 0 {
            0
        } else {
            hist.value_at_percentile(percentile)
        }
    }
}

#[derive(Clone)]
struct Link {
    transport: Arc<dyn Transport>,
    generation: u64,
}

/// Write failure seen while flushing; the caller tears the link down
#[derive(Debug)]
pub struct LinkFailure {
    pub generation: u64,
    pub error: ConnectionError,
}

/// State of one server connection
pub struct NodeHandle {
    address: ServerAddress,
    role: AtomicU8,
    kind: AtomicU8,
    state: AtomicU8,
    unselectable: AtomicU8,
    primary: RwLock<Option<ServerAddress>>,
    cluster_id: RwLock<Option<String>>,
    pub counters: NodeCounters,
    last_exception: Mutex<Option<ConnectionError>>,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
    heartbeat_running: AtomicBool,
    ever_connected: AtomicBool,
    connect_failures: AtomicU32,
    /// Clock reading before which the heartbeat leaves this node alone
    reconnect_after_ms: AtomicU64,
    resolved: Mutex<Option<SocketAddr>>,
    next_generation: AtomicU64,
    /// Generation of the attached link, 0 when none; read without the writer lock
    live_generation: AtomicU64,
    /// Also the writer lock; held across blocking writes
    link: Mutex<Option<Link>>,
    /// The same link for teardown; never held across I/O
    attached: Mutex<Option<Link>>,
    outbound: Mutex<VecDeque<Message>>,
    in_flight: Mutex<VecDeque<Message>>,
}

impl NodeHandle {
    pub fn new(address: ServerAddress) -> Self {
        Self {
            address,
            role: AtomicU8::new(NodeRole::Unknown as u8),
            kind: AtomicU8::new(ServerKind::Unknown as u8),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            unselectable: AtomicU8::new(0),
            primary: RwLock::new(None),
            cluster_id: RwLock::new(None),
            counters: NodeCounters::new(),
            last_exception: Mutex::new(None),
            last_read_ms: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
            heartbeat_running: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            connect_failures: AtomicU32::new(0),
            reconnect_after_ms: AtomicU64::new(0),
            resolved: Mutex::new(None),
            next_generation: AtomicU64::new(1),
            live_generation: AtomicU64::new(0),
            link: Mutex::new(None),
            attached: Mutex::new(None),
            outbound: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(VecDeque::new()),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn role(&self) -> NodeRole {
        NodeRole::from_u8(self.role.load(Ordering::Acquire))
    }

    pub fn set_role(&self, role: NodeRole) {
        self.role.store(role as u8, Ordering::Release);
    }

    pub fn kind(&self) -> ServerKind {
        ServerKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    pub fn set_kind(&self, kind: ServerKind) {
        self.kind.store(kind as u8, Ordering::Release);
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move Disconnected -> Connecting; false if someone else is connecting
    /// or the node is already up
    pub fn begin_connect(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Disconnected as u8,
                ConnectionState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_established(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    pub fn set_unselectable(&self, reason: UnselectableReason, flagged: bool) {
        if flagged {
            self.unselectable.fetch_or(reason as u8, Ordering::AcqRel);
        } else {
            self.unselectable.fetch_and(!(reason as u8), Ordering::AcqRel);
        }
    }

    pub fn is_unselectable_for(&self, reason: UnselectableReason) -> bool {
        self.unselectable.load(Ordering::Acquire) & reason as u8 != 0
    }

    pub fn unselectable_reasons(&self) -> Vec<UnselectableReason> {
        let bits = self.unselectable.load(Ordering::Acquire);
        UnselectableReason::ALL
            .into_iter()
            .filter(|r| bits & *r as u8 != 0)
            .collect()
    }

    pub fn is_selectable(&self) -> bool {
        self.unselectable.load(Ordering::Acquire) == 0
    }

    /// Established and not flagged; the only nodes routing may pick
    pub fn is_eligible(&self) -> bool {
        self.is_established() && self.is_selectable()
    }

    pub fn primary(&self) -> Option<ServerAddress> {
        self.primary.read().clone()
    }

    pub fn set_primary(&self, primary: Option<ServerAddress>) {
        *self.primary.write() = primary;
    }

    pub fn cluster_id(&self) -> Option<String> {
        self.cluster_id.read().clone()
    }

    pub fn set_cluster_id(&self, id: Option<String>) {
        *self.cluster_id.write() = id;
    }

    pub fn last_exception(&self) -> Option<ConnectionError> {
        self.last_exception.lock().clone()
    }

    pub fn set_last_exception(&self, error: Option<ConnectionError>) {
        *self.last_exception.lock() = error;
    }

    pub fn mark_read(&self) {
        self.last_read_ms.store(clock::now_ms(), Ordering::Relaxed);
    }

    pub fn last_read_ms_ago(&self) -> Option<u64> {
        clock::since_ms(self.last_read_ms.load(Ordering::Relaxed))
    }

    /// Time since the last read or write
    pub fn idle_ms(&self) -> Option<u64> {
        let last = self
            .last_read_ms
            .load(Ordering::Relaxed)
            .max(self.last_write_ms.load(Ordering::Relaxed));
        clock::since_ms(last)
    }

    /// Claim the heartbeat flag; false if a previous beat is still running
    pub fn try_begin_heartbeat(&self) -> bool {
        self.heartbeat_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_heartbeat(&self) {
        self.heartbeat_running.store(false, Ordering::Release);
    }

    /// Record that a connection came up; true if it had been up before
    pub fn mark_connected(&self) -> bool {
        let before = self.ever_connected.swap(true, Ordering::AcqRel);
        if before {
            NodeCounters::incr(&self.counters.reconnects);
        }
        before
    }

    /// Note a failed connect attempt; the next heartbeat reconnect waits
    /// `base` doubled per consecutive failure, at most `cap`
    pub fn record_connect_failure(&self, base: Duration, cap: Duration) -> Duration {
        let failures = self.connect_failures.fetch_add(1, Ordering::AcqRel).min(16);
        let delay = base.saturating_mul(1 << failures).min(cap);
        self.reconnect_after_ms
            .store(clock::now_ms() + delay.as_millis() as u64, Ordering::Release);
        delay
    }

    pub fn clear_connect_failures(&self) {
        self.connect_failures.store(0, Ordering::Release);
        self.reconnect_after_ms.store(0, Ordering::Release);
    }

    /// Whether the heartbeat should ask for a reconnect yet
    pub fn reconnect_due(&self) -> bool {
        clock::now_ms() >= self.reconnect_after_ms.load(Ordering::Acquire)
    }

    pub fn cached_peer(&self) -> Option<SocketAddr> {
        *self.resolved.lock()
    }

    pub fn remember_peer(&self, addr: Option<SocketAddr>) {
        if addr.is_some() {
            *self.resolved.lock() = addr;
        }
    }

    pub fn next_link_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Install a freshly connected transport; the node stays Connecting
    /// until [`NodeHandle::set_state`] marks it established
    pub fn attach(&self, transport: Box<dyn Transport>, generation: u64) {
        let link = Link {
            transport: Arc::from(transport),
            generation,
        };
        // lock order is attached then link; writers only ever hold link
        let mut attached = self.attached.lock();
        if let Some(old) = attached.replace(link.clone()) {
            // a writer still on the old link fails once it is closed
            old.transport.close();
        }
        self.live_generation.store(generation, Ordering::Release);
        *self.link.lock() = Some(link);
    }

    pub fn link_generation(&self) -> Option<u64> {
        match self.live_generation.load(Ordering::Acquire) {
            0 => None,
            g => Some(g),
        }
    }

    /// Events from a link that was since replaced are ignored
    pub fn is_current_link(&self, generation: u64) -> bool {
        self.live_generation.load(Ordering::Acquire) == generation
    }

    /// Tear down the link if it is still `generation` (any link when `None`)
    ///
    /// Returns the in-flight messages, which will never see a reply. The
    /// outbound backlog is kept for the next connection.
    pub fn detach(&self, generation: Option<u64>) -> Option<Vec<Message>> {
        let link = {
            let mut attached = self.attached.lock();
            match attached.as_ref() {
                Some(l) if generation.map_or(true, |g| g == l.generation) => attached.take(),
                Some(_) => return None,
                None if generation.is_none() => None,
                None => return None,
            }
        };
        self.live_generation.store(0, Ordering::Release);
        self.set_state(ConnectionState::Disconnected);
        if let Some(link) = link {
            // close before taking the writer lock: a write blocked on a full
            // socket only returns once the stream is shut down
            link.transport.close();
            let mut writer = self.link.lock();
            if writer.as_ref().is_some_and(|l| l.generation == link.generation) {
                writer.take();
            }
        }
        Some(self.in_flight.lock().drain(..).collect())
    }

    /// Write directly, bypassing the outbound queue
    ///
    /// Used for the connection handshake, which must precede any backlog.
    pub fn send_now(&self, mut message: Message) -> Result<(), LinkFailure> {
        let guard = self.link.lock();
        let link = guard.as_ref().ok_or(LinkFailure {
            generation: 0,
            error: ConnectionError::Closed,
        })?;
        let bytes = message.bytes.clone();
        message.sent_at = Some(Instant::now());
        self.in_flight.lock().push_back(message);
        link.transport.send(&bytes).map_err(|error| LinkFailure {
            generation: link.generation,
            error,
        })?;
        self.last_write_ms.store(clock::now_ms(), Ordering::Relaxed);
        NodeCounters::incr(&self.counters.ops_sent);
        Ok(())
    }

    pub fn enqueue(&self, message: Message) {
        self.outbound.lock().push_back(message);
    }

    /// Queue several messages back to back
    pub fn enqueue_all(&self, messages: impl IntoIterator<Item = Message>) {
        self.outbound.lock().extend(messages);
    }

    /// Drop a still-queued message; true if it had not been written
    pub fn cancel_queued(&self, id: u64) -> bool {
        let removed = {
            let mut outbound = self.outbound.lock();
            outbound
                .iter()
                .position(|m| m.id == id)
                .and_then(|pos| outbound.remove(pos))
        };
        match removed {
            Some(_) => {
                NodeCounters::incr(&self.counters.send_canceled);
                true
            }
            None => false,
        }
    }

    /// Drain the outbound queue onto the wire
    ///
    /// Returns immediately if another thread holds the writer; that thread
    /// re-checks the queue before it leaves.
    pub fn flush(&self) -> Result<(), LinkFailure> {
        loop {
            let Some(guard) = self.link.try_lock() else {
                return Ok(());
            };
            let Some(link) = guard.as_ref() else {
                return Ok(());
            };
            if !self.is_established() {
                return Ok(());
            }

            loop {
                let next = self.outbound.lock().pop_front();
                let Some(mut message) = next else {
                    break;
                };
                if message.is_abandoned() {
                    NodeCounters::incr(&self.counters.send_canceled);
                    continue;
                }
                let bytes = message.bytes.clone();
                message.sent_at = Some(Instant::now());
                self.in_flight.lock().push_back(message);

                if let Err(error) = link.transport.send(&bytes) {
                    return Err(LinkFailure {
                        generation: link.generation,
                        error,
                    });
                }
                self.last_write_ms.store(clock::now_ms(), Ordering::Relaxed);
                NodeCounters::incr(&self.counters.ops_sent);
            }
            drop(guard);

            if self.outbound.lock().is_empty() {
                return Ok(());
            }
        }
    }

    /// Oldest message awaiting a reply
    pub fn pop_in_flight(&self) -> Option<Message> {
        self.in_flight.lock().pop_front()
    }

    /// Age of the oldest written message still waiting for its reply
    pub fn oldest_in_flight_ms(&self) -> Option<u64> {
        self.in_flight
            .lock()
            .front()
            .and_then(|m| m.sent_at)
            .map(|t| t.elapsed().as_millis() as u64)
    }

    /// Apply `f` to every in-flight and queued message
    pub fn for_each_pending(&self, mut f: impl FnMut(&mut Message)) {
        self.in_flight.lock().iter_mut().for_each(&mut f);
        self.outbound.lock().iter_mut().for_each(&mut f);
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Drain queued messages (shutdown)
    pub fn drain_outbound(&self) -> Vec<Message> {
        self.outbound.lock().drain(..).collect()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            address: self.address.to_string(),
            role: self.role(),
            kind: self.kind(),
            state: self.state(),
            selectable: self.is_selectable(),
            unselectable: self
                .unselectable_reasons()
                .iter()
                .map(UnselectableReason::as_str)
                .collect(),
            primary: self.primary().map(|p| p.to_string()),
            outbound: self.outbound_len(),
            in_flight: self.in_flight_len(),
            ops_sent: self.counters.ops_sent.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            redirects: self.counters.redirects.load(Ordering::Relaxed),
            send_canceled: self.counters.send_canceled.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            latency_p50_us: self.counters.latency_percentile_us(50.0),
            latency_p99_us: self.counters.latency_percentile_us(99.0),
            last_read_ms_ago: self.last_read_ms_ago(),
            last_exception: self.last_exception().map(|e| e.to_string()),
        }
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("address", &self.address)
            .field("role", &self.role())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

/// Point-in-time view of one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub address: String,
    pub role: NodeRole,
    pub kind: ServerKind,
    pub state: ConnectionState,
    pub selectable: bool,
    pub unselectable: Vec<&'static str>,
    pub primary: Option<String>,
    pub outbound: usize,
    pub in_flight: usize,
    pub ops_sent: u64,
    pub completed: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub redirects: u64,
    pub send_canceled: u64,
    pub reconnects: u64,
    pub latency_p50_us: u64,
    pub latency_p99_us: u64,
    pub last_read_ms_ago: Option<u64>,
    pub last_exception: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MessageKind;
    use parking_lot::Condvar;
    use std::thread;
    use std::time::Duration;

    /// Transport recording what was written
    struct Recorder {
        written: Arc<Mutex<Vec<u8>>>,
        fail: bool,
    }

    impl Transport for Recorder {
        fn send(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
            if self.fail {
                return Err(ConnectionError::SocketFailure {
                    address: "test".into(),
                    reason: "broken pipe".into(),
                });
            }
            self.written.lock().extend_from_slice(bytes);
            Ok(())
        }

        fn close(&self) {}
    }

    fn node_with_link(fail: bool) -> (NodeHandle, Arc<Mutex<Vec<u8>>>) {
        let node = NodeHandle::new(ServerAddress::new("127.0.0.1", 6379));
        let written = Arc::new(Mutex::new(Vec::new()));
        node.attach(
            Box::new(Recorder {
                written: Arc::clone(&written),
                fail,
            }),
            node.next_link_generation(),
        );
        (node, written)
    }

    #[test]
    fn test_unselectable_bits() {
        let node = NodeHandle::new(ServerAddress::new("a", 1));
        assert!(node.is_selectable());
        node.set_unselectable(UnselectableReason::RedundantPrimary, true);
        node.set_unselectable(UnselectableReason::DidNotRespond, true);
        assert!(!node.is_selectable());
        assert_eq!(node.unselectable_reasons().len(), 2);
        node.set_unselectable(UnselectableReason::RedundantPrimary, false);
        assert!(!node.is_unselectable_for(UnselectableReason::RedundantPrimary));
        assert!(node.is_unselectable_for(UnselectableReason::DidNotRespond));
    }

    #[test]
    fn test_backlog_waits_for_established() {
        let (node, written) = node_with_link(false);
        node.enqueue(Message::internal(&["PING"], MessageKind::User));
        node.flush().unwrap();
        assert_eq!(node.outbound_len(), 1);
        assert!(written.lock().is_empty());

        node.set_state(ConnectionState::Established);
        node.flush().unwrap();
        assert_eq!(node.outbound_len(), 0);
        assert_eq!(node.in_flight_len(), 1);
        assert_eq!(&*written.lock(), b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn test_wire_order_matches_queue_order() {
        let (node, written) = node_with_link(false);
        node.set_state(ConnectionState::Established);
        node.enqueue(Message::internal(&["A"], MessageKind::User));
        node.enqueue(Message::internal(&["B"], MessageKind::User));
        node.flush().unwrap();
        assert_eq!(&*written.lock(), b"*1\r\n$1\r\nA\r\n*1\r\n$1\r\nB\r\n");
        assert_eq!(node.pop_in_flight().unwrap().command, "A");
        assert_eq!(node.pop_in_flight().unwrap().command, "B");
    }

    #[test]
    fn test_send_failure_reports_generation() {
        let (node, _) = node_with_link(true);
        node.set_state(ConnectionState::Established);
        let generation = node.link_generation().unwrap();
        node.enqueue(Message::internal(&["PING"], MessageKind::User));
        let failure = node.flush().unwrap_err();
        assert_eq!(failure.generation, generation);

        let lost = node.detach(Some(generation)).unwrap();
        assert_eq!(lost.len(), 1);
        assert_eq!(node.state(), ConnectionState::Disconnected);
        assert!(node.detach(Some(generation)).is_none());
    }

    /// Writes block until the transport is closed, like a socket whose
    /// peer stopped reading
    struct Stuck(Arc<(Mutex<bool>, Condvar)>);

    impl Transport for Stuck {
        fn send(&self, _bytes: &[u8]) -> Result<(), ConnectionError> {
            let (closed, wake) = &*self.0;
            let mut closed = closed.lock();
            while !*closed {
                wake.wait(&mut closed);
            }
            Err(ConnectionError::Closed)
        }

        fn close(&self) {
            let (closed, wake) = &*self.0;
            *closed.lock() = true;
            wake.notify_all();
        }
    }

    #[test]
    fn test_detach_while_writer_blocked() {
        let node = Arc::new(NodeHandle::new(ServerAddress::new("127.0.0.1", 6379)));
        let state = Arc::new((Mutex::new(false), Condvar::new()));
        node.attach(Box::new(Stuck(Arc::clone(&state))), node.next_link_generation());
        node.set_state(ConnectionState::Established);
        let generation = node.link_generation().unwrap();
        node.enqueue(Message::internal(&["PING"], MessageKind::User));

        let writer = {
            let node = Arc::clone(&node);
            thread::spawn(move || node.flush())
        };
        while node.in_flight_len() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let lost = node.detach(Some(generation)).unwrap();
        assert_eq!(lost.len(), 1);
        assert_eq!(node.state(), ConnectionState::Disconnected);
        let failure = writer.join().unwrap().unwrap_err();
        assert_eq!(failure.generation, generation);
        assert!(node.detach(Some(generation)).is_none());
        assert!(*state.0.lock());
    }

    #[test]
    fn test_reconnect_backoff_doubles_and_caps() {
        let node = NodeHandle::new(ServerAddress::new("a", 1));
        assert!(node.reconnect_due());
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(350);
        assert_eq!(node.record_connect_failure(base, cap), base);
        assert!(!node.reconnect_due());
        assert_eq!(node.record_connect_failure(base, cap), Duration::from_millis(200));
        assert_eq!(node.record_connect_failure(base, cap), cap);
        assert_eq!(node.record_connect_failure(base, cap), cap);

        node.clear_connect_failures();
        assert!(node.reconnect_due());
        assert_eq!(node.record_connect_failure(base, cap), base);
    }

    #[test]
    fn test_cancel_queued() {
        let node = NodeHandle::new(ServerAddress::new("a", 1));
        let msg = Message::internal(&["GET", "k"], MessageKind::User);
        let id = msg.id;
        node.enqueue(msg);
        assert!(node.cancel_queued(id));
        assert!(!node.cancel_queued(id));
        assert_eq!(node.status().send_canceled, 1);
    }

    #[test]
    fn test_heartbeat_flag_is_exclusive() {
        let node = NodeHandle::new(ServerAddress::new("a", 1));
        assert!(node.try_begin_heartbeat());
        assert!(!node.try_begin_heartbeat());
        node.end_heartbeat();
        assert!(node.try_begin_heartbeat());
    }

    #[test]
    fn test_status_serializes() {
        let node = NodeHandle::new(ServerAddress::new("a", 1));
        node.set_role(NodeRole::Replica);
        node.counters.record_reply(250, false);
        let json = serde_json::to_value(node.status()).unwrap();
        assert_eq!(json["role"], "replica");
        assert_eq!(json["state"], "disconnected");
        assert_eq!(json["completed"], 1);
    }
}
