//! Liveness monitor
//!
//! A background thread ticks at the heartbeat interval. Each tick, per node:
//! a link whose oldest written request has waited longer than the response
//! timeout is torn down, future-mode requests older than the sync timeout are
//! failed, idle links get a keep-alive PING, and disconnected nodes ask for a
//! reconfiguration once their reconnect backoff has passed.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::dispatch::{CompletionMode, MessageKind};
use crate::engine::Engine;
use crate::node::{ConnectionState, NodeHandle};
use crate::utils::{clock, ConnectionError, MuxError, TimeoutDetails};

pub struct Heartbeat {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub(crate) fn spawn(engine: Weak<Engine>, interval: std::time::Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("mux-heartbeat".to_string())
            .spawn(move || run(engine, stop_rx, interval))?;
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it
    pub fn stop(&mut self) {
        // dropping the sender disconnects the channel and ends the loop
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Heartbeat thread panicked");
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(engine: Weak<Engine>, stop: Receiver<()>, interval: std::time::Duration) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
        let Some(engine) = engine.upgrade() else {
            return;
        };
        if engine.is_closed() {
            return;
        }
        engine.beat();
    }
}

impl Engine {
    /// One heartbeat pass over every node
    pub(crate) fn beat(&self) {
        self.last_heartbeat_ms
            .store(clock::now_ms(), Ordering::Relaxed);

        let mut wants_reconfigure = false;
        for node in self.registry.all().iter() {
            // a previous pass on this node is still running
            if !node.try_begin_heartbeat() {
                continue;
            }
            match node.state() {
                ConnectionState::Established => self.beat_node(node),
                ConnectionState::Disconnected => wants_reconfigure |= node.reconnect_due(),
                ConnectionState::Connecting => {}
            }
            node.end_heartbeat();
        }

        if wants_reconfigure {
            self.trigger_reconfigure("heartbeat found disconnected node");
        }
    }

    fn beat_node(&self, node: &Arc<NodeHandle>) {
        let response_timeout = self.config.response_timeout().as_millis() as u64;
        if let Some(oldest) = node.oldest_in_flight_ms() {
            if oldest > response_timeout {
                warn!(
                    "{} has not answered for {}ms ({} in flight), dropping the link",
                    node.address(),
                    oldest,
                    node.in_flight_len()
                );
                self.node_failed(
                    node,
                    node.link_generation(),
                    ConnectionError::NoResponse {
                        address: node.address().to_string(),
                        elapsed_ms: oldest,
                    },
                );
                return;
            }
        }

        self.expire_futures(node);

        let keep_alive = self.config.keep_alive().as_millis() as u64;
        if keep_alive > 0
            && self.config.command_map.is_available("PING")
            && node.idle_ms().is_some_and(|idle| idle >= keep_alive)
        {
            debug!("Keep-alive PING to {}", node.address());
            node.enqueue(self.internal_message(&["PING"], MessageKind::Heartbeat));
            self.flush_node(node);
        }
    }

    /// Fail future-mode requests that outlived the sync timeout
    ///
    /// The messages stay queued; their late replies find the completion
    /// already done and are dropped.
    fn expire_futures(&self, node: &NodeHandle) {
        let timeout_ms = self.config.sync_timeout_ms;
        // queue depths are read before the queues are locked for the sweep
        let outbound = node.outbound_len();
        let in_flight = node.in_flight_len();
        let state = node.state().as_str().to_string();
        let last_read_ms_ago = node.last_read_ms_ago();
        let address = node.address().to_string();

        let mut expired = 0u64;
        node.for_each_pending(|message| {
            if message.mode != CompletionMode::Future || !message.is_pending() {
                return;
            }
            let elapsed_ms = message.created.elapsed().as_millis() as u64;
            if elapsed_ms <= timeout_ms {
                return;
            }
            let details = TimeoutDetails {
                command: message.command.clone(),
                node: address.clone(),
                timeout_ms,
                elapsed_ms,
                outbound,
                in_flight,
                state: state.clone(),
                last_read_ms_ago,
                send_canceled: false,
            };
            if message.complete(Err(MuxError::Timeout(Box::new(details)))) {
                expired += 1;
            }
        });

        if expired > 0 {
            node.counters
                .timeouts
                .fetch_add(expired, Ordering::Relaxed);
            debug!("Expired {} pending futures on {}", expired, node.address());
        }
    }
}
