use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use utils::error::{NetError, Result};

use crate::logger::Logger;
use crate::time;

static EXIT: AtomicBool = AtomicBool::new(false);
static LOGGER: Logger = Logger;

/// Initialises the runtime: pins the clock, installs the logger and routes
/// Ctrl+C to the exit flag the worker loop polls.
pub fn init(level: LevelFilter) -> Result {
	time::init();

	log::set_logger(&LOGGER).map_err(|_| NetError::Sys)?;
	log::set_max_level(level);

	ctrlc::set_handler(|| EXIT.store(true, Ordering::Relaxed))
		.map_err(|err| log::error!("Error occurred while setting Ctrl+C handler: {err}"))
		.map_err(|_| NetError::Sys)?;

	Ok(())
}

pub fn exit_requested() -> bool {
	EXIT.load(Ordering::Relaxed)
}

/// Asks the worker loop to shut down on its next pass.
pub fn request_exit() {
	EXIT.store(true, Ordering::Relaxed);
}
