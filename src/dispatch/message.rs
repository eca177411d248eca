//! Encoded request travelling through a node's queues

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::completion::{CompletionMode, CompletionRef, Reply};
use crate::utils::RespEncoder;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Who created the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    User,
    /// Reconfiguration traffic (ECHO/PING, INFO, tie-breaker GET, CLUSTER NODES)
    Discovery,
    /// Keep-alive PING
    Heartbeat,
    /// AUTH / SELECT / ASKING
    Handshake,
    /// PUBLISH of the elected primary
    Broadcast,
}

pub struct Message {
    pub id: u64,
    /// Upper-cased command name, for diagnostics
    pub command: String,
    pub bytes: Arc<[u8]>,
    pub slot: Option<u16>,
    /// May follow one MOVED/ASK
    pub redirectable: bool,
    pub kind: MessageKind,
    pub mode: CompletionMode,
    pub completion: Option<CompletionRef>,
    pub created: Instant,
    pub sent_at: Option<Instant>,
}

impl Message {
    pub fn new(command: impl Into<String>, bytes: Vec<u8>, kind: MessageKind) -> Self {
        Self {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            command: command.into(),
            bytes: bytes.into(),
            slot: None,
            redirectable: false,
            kind,
            mode: CompletionMode::FireAndForget,
            completion: None,
            created: Instant::now(),
            sent_at: None,
        }
    }

    /// Internal command built from plain arguments
    pub fn internal(args: &[&str], kind: MessageKind) -> Self {
        let mut encoder = RespEncoder::with_capacity(64);
        encoder.encode_command(args);
        let command = args.first().map(|a| a.to_ascii_uppercase()).unwrap_or_default();
        Self::new(command, encoder.into_bytes(), kind)
    }

    pub fn with_completion(mut self, completion: CompletionRef, mode: CompletionMode) -> Self {
        self.completion = Some(completion);
        self.mode = mode;
        self
    }

    /// Copy for a redirect resend; the completion moves to the copy
    pub fn redirected(&mut self) -> Self {
        Self {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            command: self.command.clone(),
            bytes: Arc::clone(&self.bytes),
            slot: self.slot,
            redirectable: false,
            kind: self.kind,
            mode: self.mode,
            completion: self.completion.take(),
            created: self.created,
            sent_at: None,
        }
    }

    /// Deliver the reply; false when nobody is waiting for it
    pub fn complete(&mut self, reply: Reply) -> bool {
        match self.completion.as_mut() {
            Some(completion) => completion.complete(reply),
            None => false,
        }
    }

    /// The caller stopped waiting before the message was written
    pub fn is_abandoned(&self) -> bool {
        self.completion
            .as_ref()
            .is_some_and(|c| c.is_abandoned())
    }

    /// Still owed a result
    pub fn is_pending(&self) -> bool {
        self.completion.as_ref().is_some_and(|c| !c.is_done())
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("kind", &self.kind)
            .field("slot", &self.slot)
            .finish()
    }
}
