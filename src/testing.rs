//! In-memory fake servers for end-to-end tests
//!
//! Each [`FakeServer`] speaks RESP through the real codec: requests are
//! decoded with [`RespDecoder`] and replies are delivered from a responder
//! thread, the way a socket reader thread would deliver them.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::client::{ConnectTarget, Connector, Transport, TransportEvents};
use crate::cluster::slot_for_key;
use crate::config::ServerAddress;
use crate::utils::{ConnectionError, RespDecoder, RespValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Standalone,
    Cluster,
    Sentinel,
}

#[derive(Default)]
struct ServerState {
    mode: Option<Mode>,
    primary_of: Option<ServerAddress>,
    password: Option<String>,
    stalled: bool,
    refuse: bool,
    data: HashMap<Vec<u8>, Vec<u8>>,
    cluster_nodes: Option<String>,
    moved: HashMap<u16, ServerAddress>,
    asking: HashMap<u16, ServerAddress>,
    log: Vec<Vec<String>>,
    links: Vec<Link>,
}

struct Link {
    events: Arc<dyn TransportEvents>,
    closed: Arc<AtomicBool>,
}

/// Scriptable server behind a [`MockConnector`]
pub struct FakeServer {
    address: ServerAddress,
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn set_mode(&self, mode: Mode) {
        self.state.lock().mode = Some(mode);
    }

    /// Report `role:slave` with this primary in INFO
    pub fn set_replica_of(&self, primary: &ServerAddress) {
        self.state.lock().primary_of = Some(primary.clone());
    }

    pub fn require_password(&self, password: &str) {
        self.state.lock().password = Some(password.to_string());
    }

    /// Hold replies back until unstalled; requests are still read
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    fn is_stalled(&self) -> bool {
        self.state.lock().stalled
    }

    /// Refuse new connections
    pub fn set_refuse(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    pub fn set(&self, key: &str, value: &str) {
        self.state
            .lock()
            .data
            .insert(key.as_bytes().to_vec(), value.as_bytes().to_vec());
    }

    pub fn set_cluster_nodes(&self, text: &str) {
        self.state.lock().cluster_nodes = Some(text.to_string());
    }

    /// Answer keyed commands for `slot` with MOVED to `target`
    pub fn set_moved(&self, slot: u16, target: &ServerAddress) {
        self.state.lock().moved.insert(slot, target.clone());
    }

    /// Answer keyed commands for `slot` with ASK to `target`
    pub fn set_ask(&self, slot: u16, target: &ServerAddress) {
        self.state.lock().asking.insert(slot, target.clone());
    }

    /// Answer as a primary from now on
    pub fn promote(&self) {
        self.state.lock().primary_of = None;
    }

    /// Commands received, upper-cased name first
    pub fn log(&self) -> Vec<Vec<String>> {
        self.state.lock().log.clone()
    }

    /// Whether exactly this command line was received
    pub fn saw(&self, args: &[&str]) -> bool {
        self.state
            .lock()
            .log
            .iter()
            .any(|c| c.iter().map(String::as_str).eq(args.iter().copied()))
    }

    pub fn received(&self, command: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some(command))
            .count()
    }

    /// Drop every open link with a socket failure
    pub fn kill(&self) {
        let links: Vec<Link> = self.state.lock().links.drain(..).collect();
        for link in links {
            if !link.closed.swap(true, Ordering::AcqRel) {
                link.events.on_error(ConnectionError::SocketFailure {
                    address: self.address.to_string(),
                    reason: "connection reset by fake server".to_string(),
                });
            }
        }
    }

    fn respond(&self, args: Vec<Vec<u8>>) -> RespValue {
        let text: Vec<String> = args
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        let command = text.first().map(|c| c.to_ascii_uppercase()).unwrap_or_default();

        let mut state = self.state.lock();
        let mut logged = text.clone();
        if let Some(first) = logged.first_mut() {
            *first = command.clone();
        }
        state.log.push(logged);

        let arg = |i: usize| text.get(i).map(String::as_str).unwrap_or_default();
        if matches!(command.as_str(), "GET" | "SET" | "DEL") && text.len() > 1 {
            let slot = slot_for_key(args[1].as_slice());
            if let Some(target) = state.moved.get(&slot) {
                return RespValue::Error(format!("MOVED {} {}", slot, target));
            }
            if let Some(target) = state.asking.get(&slot) {
                return RespValue::Error(format!("ASK {} {}", slot, target));
            }
        }

        match command.as_str() {
            "PING" => RespValue::simple("PONG"),
            "ECHO" => RespValue::bulk(arg(1)),
            "ASKING" | "SELECT" => RespValue::simple("OK"),
            "AUTH" => {
                let given = text.last().map(String::as_str);
                match state.password {
                    Some(ref expected) if Some(expected.as_str()) != given => {
                        RespValue::error("WRONGPASS invalid username-password pair")
                    }
                    _ => RespValue::simple("OK"),
                }
            }
            "INFO" => RespValue::bulk(self.info(&state, arg(1))),
            "GET" => match state.data.get(args[1].as_slice()) {
                Some(value) => RespValue::BulkString(value.clone()),
                None => RespValue::Null,
            },
            "SET" if args.len() > 2 => {
                state.data.insert(args[1].clone(), args[2].clone());
                RespValue::simple("OK")
            }
            "DEL" => RespValue::Integer(state.data.remove(args[1].as_slice()).is_some() as i64),
            "PUBLISH" => RespValue::Integer(0),
            "CLUSTER" => match state.cluster_nodes {
                Some(ref nodes) => RespValue::bulk(nodes.as_str()),
                None => RespValue::error("ERR This instance has cluster support disabled"),
            },
            _ => RespValue::Error(format!("ERR unknown command '{}'", command)),
        }
    }

    fn info(&self, state: &ServerState, section: &str) -> String {
        if section.eq_ignore_ascii_case("server") {
            let mode = match state.mode.unwrap_or(Mode::Standalone) {
                Mode::Standalone => "standalone",
                Mode::Cluster => "cluster",
                Mode::Sentinel => "sentinel",
            };
            return format!("# Server\r\nredis_version:7.2.4\r\nredis_mode:{}\r\n", mode);
        }
        match state.primary_of {
            Some(ref primary) => format!(
                "# Replication\r\nrole:slave\r\nmaster_host:{}\r\nmaster_port:{}\r\n",
                primary.host, primary.port
            ),
            None => "# Replication\r\nrole:master\r\nconnected_slaves:0\r\n".to_string(),
        }
    }
}

/// Connector over a set of [`FakeServer`]s; unknown addresses refuse
#[derive(Default)]
pub struct MockConnector {
    servers: Mutex<HashMap<ServerAddress, Arc<FakeServer>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, address: &str) -> Arc<FakeServer> {
        let address: ServerAddress = address.parse().expect("valid test address");
        let server = Arc::new(FakeServer {
            address: address.clone(),
            state: Mutex::new(ServerState::default()),
        });
        self.servers.lock().insert(address, Arc::clone(&server));
        server
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        target: &ConnectTarget,
        events: Arc<dyn TransportEvents>,
    ) -> Result<Box<dyn Transport>, ConnectionError> {
        let refused = || {
            ConnectionError::connect_failed(
                target.address.to_string(),
                io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            )
        };
        let server = self
            .servers
            .lock()
            .get(&target.address)
            .cloned()
            .ok_or_else(refused)?;
        if server.state.lock().refuse {
            return Err(refused());
        }

        let closed = Arc::new(AtomicBool::new(false));
        server.state.lock().links.push(Link {
            events: Arc::clone(&events),
            closed: Arc::clone(&closed),
        });

        let (tx, rx) = unbounded::<Vec<u8>>();
        let responder_server = Arc::clone(&server);
        let responder_closed = Arc::clone(&closed);
        thread::Builder::new()
            .name(format!("fake-{}", target.address))
            .spawn(move || {
                for bytes in rx.iter() {
                    let mut decoder = RespDecoder::new(bytes.as_slice());
                    while let Ok(RespValue::Array(items)) = decoder.decode() {
                        let args = items
                            .into_iter()
                            .filter_map(|v| v.as_bytes().map(<[u8]>::to_vec))
                            .collect();
                        let reply = responder_server.respond(args);
                        while responder_server.is_stalled()
                            && !responder_closed.load(Ordering::Acquire)
                        {
                            thread::sleep(Duration::from_millis(5));
                        }
                        if responder_closed.load(Ordering::Acquire) {
                            return;
                        }
                        events.on_reply(reply);
                    }
                }
            })
            .map_err(|e| ConnectionError::connect_failed(target.address.to_string(), e))?;

        Ok(Box::new(MockTransport {
            tx: Mutex::new(Some(tx)),
            closed,
            address: target.address.to_string(),
        }))
    }
}

struct MockTransport {
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
    address: String,
}

impl Transport for MockTransport {
    fn send(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let failed = || ConnectionError::SocketFailure {
            address: self.address.clone(),
            reason: "broken pipe".to_string(),
        };
        if self.closed.load(Ordering::Acquire) {
            return Err(failed());
        }
        match *self.tx.lock() {
            Some(ref tx) => tx.send(bytes.to_vec()).map_err(|_| failed()),
            None => Err(failed()),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.tx.lock().take();
    }
}

/// CLUSTER NODES text for primaries with the given slot ranges
pub fn cluster_nodes(primaries: &[(&FakeServer, &[(u16, u16)])]) -> String {
    primaries
        .iter()
        .enumerate()
        .map(|(i, (server, ranges))| {
            let slots: Vec<String> = ranges
                .iter()
                .map(|&(start, end)| {
                    if start == end {
                        start.to_string()
                    } else {
                        format!("{}-{}", start, end)
                    }
                })
                .collect();
            format!(
                "{:040x} {}@{} master - 0 0 {} connected {}\n",
                i + 1,
                server.address(),
                server.address().port as u32 + 10000,
                i + 1,
                slots.join(" ")
            )
        })
        .collect()
}

/// Poll `check` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::RespEncoder;

    struct Collect(Sender<RespValue>);

    impl TransportEvents for Collect {
        fn on_reply(&self, reply: RespValue) {
            self.0.send(reply).ok();
        }
        fn on_error(&self, _: ConnectionError) {}
    }

    fn target(address: &str) -> ConnectTarget {
        ConnectTarget {
            address: address.parse().unwrap(),
            resolved: None,
            timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_fake_server_answers_through_codec() {
        let connector = MockConnector::new();
        let server = connector.add("10.0.0.1:6379");
        server.set("k", "v");

        let (tx, rx) = unbounded();
        let transport = connector
            .connect(&target("10.0.0.1:6379"), Arc::new(Collect(tx)))
            .unwrap();

        let mut encoder = RespEncoder::with_capacity(64);
        encoder.encode_command(&["PING"]);
        encoder.encode_command(&["GET", "k"]);
        transport.send(encoder.as_bytes()).unwrap();

        let timeout = Duration::from_secs(1);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), RespValue::simple("PONG"));
        assert_eq!(rx.recv_timeout(timeout).unwrap(), RespValue::bulk("v"));
        assert_eq!(server.received("GET"), 1);
    }

    #[test]
    fn test_unknown_address_refuses() {
        let connector = MockConnector::new();
        let (tx, _rx) = unbounded();
        let err = connector
            .connect(&target("10.0.0.9:6379"), Arc::new(Collect(tx)))
            .err()
            .unwrap();
        assert!(matches!(err, ConnectionError::ConnectFailed { .. }));
    }

    #[test]
    fn test_cluster_nodes_text_parses() {
        let connector = MockConnector::new();
        let a = connector.add("10.0.0.1:7000");
        let b = connector.add("10.0.0.1:7001");
        let text = cluster_nodes(&[(&a, &[(0, 99), (101, 16383)]), (&b, &[(100, 100)])]);
        let (map, entries) =
            crate::cluster::ShardMap::from_cluster_nodes(&text, a.address()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(map.is_complete());
        assert_eq!(map.node_for(100), Some(b.address()));
    }
}
