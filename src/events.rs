//! Connection and topology notifications
//!
//! Subscribers get their own unbounded channel; publishing never blocks and
//! receivers that went away are pruned on the next publish.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use crate::utils::ConnectionFailureKind;

/// Where a configuration change was noticed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeSource {
    /// This client's own reconfiguration
    Local,
    /// Announced by another client over the broadcast channel
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum MuxEvent {
    ConnectionFailed {
        address: String,
        kind: ConnectionFailureKind,
        cause: String,
    },
    ConnectionRestored {
        address: String,
    },
    ConfigurationChanged {
        /// Elected primary, or the node that announced the change
        address: Option<String>,
        source: ChangeSource,
    },
    ShardOwnershipMoved {
        slot: u16,
        from: Option<String>,
        to: String,
    },
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<MuxEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<MuxEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: MuxEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
