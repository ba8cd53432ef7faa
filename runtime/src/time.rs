use std::sync::OnceLock;
use std::time::Instant;

static START: OnceLock<Instant> = OnceLock::new();

/// Pins the runtime start instant. Called once by [`crate::init`]; harmless
/// to call again.
pub fn init() {
	let _ = START.get_or_init(Instant::now);
}

/// Milliseconds of monotonic time since the runtime started.
pub fn now_ms() -> u64 {
	START.get_or_init(Instant::now).elapsed().as_millis() as u64
}
