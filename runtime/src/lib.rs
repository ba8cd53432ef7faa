mod logger;
mod rt;

/// Counting semaphore with the stack's timeout convention.
pub mod sync;
/// Monotonic millisecond clock.
pub mod time;

pub use rt::{exit_requested, init, request_exit};
