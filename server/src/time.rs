use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic milliseconds since the engine first asked for the time.
pub fn msec() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}
