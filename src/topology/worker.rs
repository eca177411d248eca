//! Single-flight reconfiguration worker
//!
//! Triggers go through a channel with room for one pending request, so any
//! number of triggers raised while a cycle runs collapse into one follow-up.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::Engine;

/// How long to wait before retrying when another cycle holds the marker
const BUSY_RETRY: Duration = Duration::from_millis(10);

/// Sending side handed to the engine
#[derive(Debug, Clone)]
pub struct ReconfigureTrigger {
    tx: Sender<String>,
}

impl ReconfigureTrigger {
    /// Ask for a cycle; false if one is already pending
    pub fn fire(&self, reason: &str) -> bool {
        match self.tx.try_send(reason.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Reconfiguration already pending, coalescing '{}'", reason);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

pub fn trigger_channel() -> (ReconfigureTrigger, Receiver<String>) {
    let (tx, rx) = bounded(1);
    (ReconfigureTrigger { tx }, rx)
}

/// Long-lived thread running triggered cycles
pub struct ReconfigureWorker {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReconfigureWorker {
    pub(crate) fn spawn(engine: Weak<Engine>, triggers: Receiver<String>) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name("mux-reconfigure".to_string())
            .spawn(move || run(engine, triggers))?;
        Ok(Self {
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Wait for the thread; the engine must already be closed
    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("Reconfiguration worker panicked");
            }
        }
    }
}

fn run(engine: Weak<Engine>, triggers: Receiver<String>) {
    while let Ok(reason) = triggers.recv() {
        loop {
            let Some(engine) = engine.upgrade() else {
                return;
            };
            if engine.is_closed() {
                return;
            }
            if engine.reconfigure(&reason).is_some() {
                break;
            }
            // a synchronous cycle holds the marker; run once after it, taking
            // every trigger raised meanwhile with this one
            drop(engine);
            while triggers.try_recv().is_ok() {}
            thread::sleep(BUSY_RETRY);
        }
    }
}
