//! Request dispatch and reply handling
//!
//! Submission: checks, routing, then enqueue on the chosen node. Replies are
//! matched to messages in FIFO order on the node's reader thread; MOVED and
//! ASK are followed once before the caller sees anything.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tracing::{debug, info};

use super::completion::{CompletionMode, CompletionWaiter};
use super::message::{Message, MessageKind};
use crate::client::{Request, ResultProcessor};
use crate::cluster::{is_cluster_down, RedirectInfo, RedirectKind, Router};
use crate::engine::Engine;
use crate::events::MuxEvent;
use crate::node::{NodeCounters, NodeHandle};
use crate::topology::DeploymentKind;
use crate::utils::{MuxError, RespValue, Result, TimeoutDetails};

/// Outcome of [`crate::Multiplexer::dispatch`]
pub enum Dispatched<P: ResultProcessor> {
    /// Fire-and-forget: written (or queued) with nobody waiting
    Sent,
    /// Blocking: the result, already waited for
    Completed(Result<P::Output>),
    /// Future: resolves when the reply arrives
    Pending(ReplyFuture<P>),
}

/// Future returned by future-mode dispatch
///
/// Resolves with the processed reply, a connection failure, or a timeout
/// once the heartbeat notices the request outlived the sync timeout.
pub struct ReplyFuture<P: ResultProcessor> {
    waiter: CompletionWaiter,
    processor: P,
}

impl<P: ResultProcessor + Unpin> Future for ReplyFuture<P> {
    type Output = Result<P::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.waiter.poll_reply(cx) {
            Poll::Ready(reply) => Poll::Ready(reply.and_then(|r| this.processor.process(r))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Engine {
    /// Validate, route and enqueue a request
    pub(crate) fn dispatch<P: ResultProcessor>(
        &self,
        request: &Request,
        processor: P,
        mode: CompletionMode,
    ) -> Result<Dispatched<P>> {
        if self.is_closed() {
            return Err(MuxError::Closed);
        }

        let command = request.command_name();
        if request.is_admin() && !self.config.allow_admin {
            return Err(MuxError::AdminNotPermitted(command));
        }
        if !self.config.command_map.is_available(&command) {
            return Err(MuxError::CommandDisabled(command));
        }
        let slot = self.request_slot(request)?;
        let node = self.route(request, slot)?;

        let mut message = Message::new(
            command,
            request.encode(&self.config.command_map),
            MessageKind::User,
        );
        message.slot = slot;
        message.redirectable = request.is_redirectable();

        if mode == CompletionMode::FireAndForget {
            node.enqueue(message);
            self.flush_node(&node);
            return Ok(Dispatched::Sent);
        }

        let (carrier, mut waiter) = self.pool.acquire();
        let message = message.with_completion(carrier, mode);
        let id = message.id;
        let command = message.command.clone();
        let started = Instant::now();
        node.enqueue(message);
        self.flush_node(&node);

        if mode == CompletionMode::Future {
            return Ok(Dispatched::Pending(ReplyFuture { waiter, processor }));
        }

        let timeout = self.sync_timeout();
        let result = match waiter.wait(timeout) {
            Some(reply) => reply.and_then(|r| processor.process(r)),
            None => {
                let send_canceled = node.cancel_queued(id);
                NodeCounters::incr(&node.counters.timeouts);
                Err(MuxError::Timeout(Box::new(timeout_details(
                    &node,
                    &command,
                    timeout.as_millis() as u64,
                    started.elapsed().as_millis() as u64,
                    send_canceled,
                ))))
            }
        };
        Ok(Dispatched::Completed(result))
    }

    /// Slot used for routing
    ///
    /// In a cluster, keys spanning several slots fail here, before any node
    /// is contacted. Other deployments hold every key on one server, so such
    /// requests simply route as keyless.
    pub(crate) fn request_slot(&self, request: &Request) -> Result<Option<u16>> {
        match request.slot() {
            Err(MuxError::MultiSlot { .. })
                if self.topology.load().kind != DeploymentKind::Cluster =>
            {
                Ok(None)
            }
            other => other,
        }
    }

    /// Node for a request: the pinned one, or whatever routing picks
    pub(crate) fn route(&self, request: &Request, slot: Option<u16>) -> Result<Arc<NodeHandle>> {
        match request.pinned() {
            Some(address) => {
                let node = self
                    .registry
                    .get(address)
                    .ok_or_else(|| MuxError::NoRoute(format!("{} is not a known node", address)))?;
                Router::validate_pinned(&node, request.preference())?;
                Ok(node)
            }
            None => self
                .router
                .select(&self.topology.load(), slot, request.preference()),
        }
    }

    /// A reply arrived on `node`'s current link
    pub(crate) fn on_reply(&self, node: &Arc<NodeHandle>, reply: RespValue) {
        node.mark_read();
        let Some(message) = node.pop_in_flight() else {
            debug!("Unsolicited reply from {}: {}", node.address(), reply.kind());
            return;
        };

        let latency_us = message
            .sent_at
            .map(|t| t.elapsed().as_micros() as u64)
            .unwrap_or(0);
        node.counters.record_reply(latency_us, reply.is_error());

        if let RespValue::Error(ref text) = reply {
            if message.redirectable {
                if let Some(redirect) = RedirectInfo::parse(text, &node.address().host) {
                    self.follow_redirect(node, message, redirect);
                    return;
                }
            }
            if is_cluster_down(text) {
                self.trigger_reconfigure("cluster down");
            }
        }

        self.complete(message, Ok(reply));
    }

    /// Resend once to the node named by MOVED/ASK
    fn follow_redirect(&self, from: &Arc<NodeHandle>, mut message: Message, redirect: RedirectInfo) {
        NodeCounters::incr(&from.counters.redirects);
        let (target, _) = self.registry.get_or_insert(&redirect.address);

        if redirect.kind == RedirectKind::Moved {
            info!(
                "Slot {} moved from {} to {}",
                redirect.slot,
                from.address(),
                redirect.address
            );
            self.relocate_slot(redirect.slot, &target);
            self.events.publish(MuxEvent::ShardOwnershipMoved {
                slot: redirect.slot,
                from: Some(from.address().to_string()),
                to: redirect.address.to_string(),
            });
            self.trigger_reconfigure("slot moved");
        } else {
            debug!(
                "Slot {} migrating from {} to {}",
                redirect.slot,
                from.address(),
                redirect.address
            );
        }

        let resend = message.redirected();
        match redirect.kind {
            RedirectKind::Ask => target.enqueue_all([
                self.internal_message(&["ASKING"], MessageKind::Handshake),
                resend,
            ]),
            RedirectKind::Moved => target.enqueue(resend),
        }

        if target.is_established() {
            self.flush_node(&target);
        } else {
            // queued as backlog until the next cycle connects it
            self.trigger_reconfigure("redirect target not connected");
        }
    }

    /// Publish a snapshot whose shard map has `slot` owned by `target`
    fn relocate_slot(&self, slot: u16, target: &Arc<NodeHandle>) {
        self.topology.rcu(|current| {
            let mut next = (**current).clone();
            if let Some(ref map) = current.shard_map {
                if map.node_for(slot) != Some(target.address()) {
                    next.shard_map = Some(Arc::new(map.with_relocated(slot, target.address())));
                }
            }
            if next.node(target.address()).is_none() {
                next.nodes.push(Arc::clone(target));
            }
            next
        });
    }
}

/// Diagnostics attached to a timeout
pub(crate) fn timeout_details(
    node: &NodeHandle,
    command: &str,
    timeout_ms: u64,
    elapsed_ms: u64,
    send_canceled: bool,
) -> TimeoutDetails {
    TimeoutDetails {
        command: command.to_string(),
        node: node.address().to_string(),
        timeout_ms,
        elapsed_ms,
        outbound: node.outbound_len(),
        in_flight: node.in_flight_len(),
        state: node.state().as_str().to_string(),
        last_read_ms_ago: node.last_read_ms_ago(),
        send_canceled,
    }
}
