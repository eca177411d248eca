//! Monotonic millisecond clock shared by nodes and the heartbeat

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since the first call in this process, never zero
pub fn now_ms() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64 + 1
}

/// Milliseconds elapsed since `then` (a value from [`now_ms`]); `None` if never set
pub fn since_ms(then: u64) -> Option<u64> {
    (then != 0).then(|| now_ms().saturating_sub(then))
}
