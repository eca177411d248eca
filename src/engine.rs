//! Shared state behind a multiplexer
//!
//! The engine is split by concern: dispatch and reply handling live in
//! `dispatch::dispatcher`, reconfiguration in `topology::coordinator` and
//! liveness in `heartbeat`. This file holds the state and the connection
//! lifecycle they share.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::client::{ConnectTarget, Connector, TransportEvents};
use crate::cluster::Router;
use crate::config::MuxConfig;
use crate::dispatch::{CompletionPool, CompletionRef, Message, MessageKind, Reply};
use crate::events::{EventBus, MuxEvent};
use crate::node::{ConnectionState, NodeHandle, NodeRegistry};
use crate::topology::worker::ReconfigureTrigger;
use crate::topology::TopologySnapshot;
use crate::utils::{clock, ConnectionError, MuxError, RespValue};

/// Completion handed to a worker when replies may complete out of order
pub(crate) type CompletionJob = (CompletionRef, Reply);

/// Longest the heartbeat waits between reconnect attempts to a dead node
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

pub struct Engine {
    pub(crate) config: MuxConfig,
    connector: Arc<dyn Connector>,
    pub(crate) registry: NodeRegistry,
    pub(crate) topology: ArcSwap<TopologySnapshot>,
    pub(crate) router: Router,
    pub(crate) pool: Arc<CompletionPool>,
    pub(crate) events: EventBus,
    trigger: ReconfigureTrigger,
    completion_sink: RwLock<Option<Sender<CompletionJob>>>,
    /// Single-flight marker for reconfiguration cycles
    pub(crate) cycle_running: AtomicBool,
    closed: AtomicBool,
    pub(crate) last_heartbeat_ms: AtomicU64,
    pub(crate) last_exception: Mutex<Option<MuxError>>,
}

impl Engine {
    pub(crate) fn new(
        config: MuxConfig,
        connector: Arc<dyn Connector>,
        trigger: ReconfigureTrigger,
        completion_sink: Option<Sender<CompletionJob>>,
    ) -> Self {
        let pool = CompletionPool::new(config.completion_pool_size);
        Self {
            config,
            connector,
            registry: NodeRegistry::new(),
            topology: ArcSwap::from_pointee(TopologySnapshot::empty()),
            router: Router::new(),
            pool,
            events: EventBus::new(),
            trigger,
            completion_sink: RwLock::new(completion_sink),
            cycle_running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_heartbeat_ms: AtomicU64::new(0),
            last_exception: Mutex::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed; true the first time
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn trigger_reconfigure(&self, reason: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        self.trigger.fire(reason)
    }

    /// Wake the worker so it notices the engine closed
    pub(crate) fn wake_worker(&self) {
        self.trigger.fire("shutdown");
    }

    pub(crate) fn take_completion_sink(&self) -> Option<Sender<CompletionJob>> {
        self.completion_sink.write().take()
    }

    /// Deliver a message's result, inline or through the completion workers
    pub(crate) fn complete(&self, mut message: Message, reply: Reply) {
        let Some(mut completion) = message.completion.take() else {
            if let Ok(RespValue::Error(ref e)) = reply {
                debug!("{} ({:?}) failed: {}", message.command, message.kind, e);
            }
            return;
        };
        if !self.config.preserve_order {
            if let Some(ref sink) = *self.completion_sink.read() {
                if let Err(err) = sink.send((completion, reply)) {
                    let (mut completion, reply) = err.into_inner();
                    completion.complete(reply);
                }
                return;
            }
        }
        completion.complete(reply);
    }

    /// Internal command with command-map renames applied
    pub(crate) fn internal_message(&self, args: &[&str], kind: MessageKind) -> Message {
        let command = args.first().map(|a| a.to_ascii_uppercase()).unwrap_or_default();
        let mut wire = args.to_vec();
        if let Some(first) = wire.first_mut() {
            *first = self.config.command_map.wire_name(first);
        }
        let mut message = Message::internal(&wire, kind);
        message.command = command;
        message
    }

    /// Send an internal command and return a waiter for its reply
    pub(crate) fn send_internal(
        &self,
        node: &Arc<NodeHandle>,
        args: &[&str],
        kind: MessageKind,
    ) -> crate::dispatch::CompletionWaiter {
        let (carrier, waiter) = self.pool.acquire();
        let message = self
            .internal_message(args, kind)
            .with_completion(carrier, crate::dispatch::CompletionMode::Blocking);
        node.enqueue(message);
        self.flush_node(node);
        waiter
    }

    pub(crate) fn flush_node(&self, node: &Arc<NodeHandle>) {
        if let Err(failure) = node.flush() {
            self.node_failed(node, Some(failure.generation), failure.error);
        }
    }

    /// Open a connection to `node` and run the handshake
    ///
    /// Does nothing if the node is already connecting or established.
    pub(crate) fn connect_node(self: &Arc<Self>, node: &Arc<NodeHandle>) -> Result<(), ConnectionError> {
        if self.is_closed() || !node.begin_connect() {
            return Ok(());
        }
        let generation = node.next_link_generation();
        let events: Arc<dyn TransportEvents> = Arc::new(LinkEvents {
            node: Arc::clone(node),
            engine: Arc::downgrade(self),
            generation,
        });
        let target = ConnectTarget {
            address: node.address().clone(),
            resolved: if self.config.resolve_dns_once {
                node.cached_peer()
            } else {
                None
            },
            timeout: self.config.connect_timeout(),
            write_timeout: self.config.response_timeout(),
        };

        let transport = match self.connector.connect(&target, events) {
            Ok(transport) => transport,
            Err(error) => {
                node.set_state(ConnectionState::Disconnected);
                self.backoff(node);
                self.report_failure(node, &error);
                return Err(error);
            }
        };
        if self.config.resolve_dns_once {
            node.remember_peer(transport.peer_addr());
        }
        node.attach(transport, generation);

        if let Err(error) = self.handshake(node) {
            self.backoff(node);
            self.node_failed(node, Some(generation), error.clone());
            return Err(error);
        }

        node.set_state(ConnectionState::Established);
        node.clear_connect_failures();
        node.set_last_exception(None);
        debug!("Connected to {}", node.address());

        if node.mark_connected() {
            info!("Connection to {} restored", node.address());
            self.events.publish(MuxEvent::ConnectionRestored {
                address: node.address().to_string(),
            });
            self.trigger_reconfigure("connection restored");
        }

        // backlog queued while the node was down
        self.flush_node(node);
        Ok(())
    }

    fn backoff(&self, node: &NodeHandle) {
        let delay =
            node.record_connect_failure(self.config.heartbeat_interval(), MAX_RECONNECT_BACKOFF);
        debug!(
            "Next reconnect to {} in {}ms at the earliest",
            node.address(),
            delay.as_millis()
        );
    }

    /// AUTH and SELECT, written ahead of any queued traffic
    fn handshake(&self, node: &Arc<NodeHandle>) -> Result<(), ConnectionError> {
        let db;
        let mut steps: Vec<Vec<&str>> = Vec::new();
        if let Some(ref auth) = self.config.auth {
            match auth.username {
                Some(ref user) => steps.push(vec!["AUTH", user.as_str(), auth.password.as_str()]),
                None => steps.push(vec!["AUTH", auth.password.as_str()]),
            }
        }
        if let Some(n) = self.config.default_database {
            if n != 0 && self.config.command_map.is_available("SELECT") {
                db = n.to_string();
                steps.push(vec!["SELECT", db.as_str()]);
            }
        }

        let timeout = self.config.connect_timeout();
        for args in steps {
            let (carrier, mut waiter) = self.pool.acquire();
            let message = self
                .internal_message(&args, MessageKind::Handshake)
                .with_completion(carrier, crate::dispatch::CompletionMode::Blocking);
            node.send_now(message).map_err(|f| f.error)?;

            match waiter.wait(timeout) {
                Some(Ok(RespValue::Error(e))) if args[0] == "AUTH" => {
                    return Err(ConnectionError::AuthFailed(e))
                }
                Some(Ok(RespValue::Error(e))) => {
                    warn!("{} on {} failed: {}", args[0], node.address(), e);
                }
                Some(Ok(_)) => {}
                Some(Err(MuxError::Connection(e))) => return Err(e),
                Some(Err(_)) => return Err(ConnectionError::Closed),
                None => {
                    return Err(ConnectionError::NoResponse {
                        address: node.address().to_string(),
                        elapsed_ms: timeout.as_millis() as u64,
                    })
                }
            }
        }
        Ok(())
    }

    /// Tear down a failed link and fail everything written on it
    ///
    /// `generation` guards against a late failure from a link that was
    /// already replaced; `None` tears down whatever is attached.
    pub(crate) fn node_failed(
        &self,
        node: &Arc<NodeHandle>,
        generation: Option<u64>,
        error: ConnectionError,
    ) {
        let Some(lost) = node.detach(generation) else {
            return;
        };
        if !lost.is_empty() {
            debug!("Failing {} in-flight messages on {}", lost.len(), node.address());
        }
        for message in lost {
            self.complete(message, Err(MuxError::Connection(error.clone())));
        }
        if self.is_closed() {
            return;
        }
        self.report_failure(node, &error);
        self.trigger_reconfigure("connection failed");
    }

    fn report_failure(&self, node: &NodeHandle, error: &ConnectionError) {
        warn!("Connection to {} failed: {}", node.address(), error);
        node.set_last_exception(Some(error.clone()));
        self.events.publish(MuxEvent::ConnectionFailed {
            address: node.address().to_string(),
            kind: error.kind(),
            cause: error.to_string(),
        });
    }

    pub(crate) fn last_heartbeat_ms_ago(&self) -> Option<u64> {
        clock::since_ms(self.last_heartbeat_ms.load(Ordering::Relaxed))
    }

    /// Close every node, failing anything queued or in flight
    pub(crate) fn teardown_nodes(&self) {
        for node in self.registry.clear() {
            if let Some(lost) = node.detach(None) {
                for message in lost {
                    self.complete(message, Err(MuxError::Closed));
                }
            }
            for message in node.drain_outbound() {
                self.complete(message, Err(MuxError::Closed));
            }
        }
        self.topology.store(Arc::new(TopologySnapshot::empty()));
    }

    pub(crate) fn sync_timeout(&self) -> Duration {
        self.config.sync_timeout()
    }
}

/// Routes one link's transport callbacks back to the engine
struct LinkEvents {
    node: Arc<NodeHandle>,
    engine: Weak<Engine>,
    generation: u64,
}

impl TransportEvents for LinkEvents {
    fn on_reply(&self, reply: RespValue) {
        if !self.node.is_current_link(self.generation) {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.on_reply(&self.node, reply);
        }
    }

    fn on_error(&self, error: ConnectionError) {
        if let Some(engine) = self.engine.upgrade() {
            engine.node_failed(&self.node, Some(self.generation), error);
        }
    }
}
