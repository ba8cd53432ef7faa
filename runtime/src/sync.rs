use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use utils::error::{NetError, Result};

/// Counting semaphore.
///
/// Every blocking wait in the stack goes through this: negative `tmo_ms`
/// means fail immediately, zero means wait forever, positive bounds the wait
/// in milliseconds.
pub struct Sem {
	count: Mutex<u32>,
	cond: Condvar,
}

impl Sem {
	pub fn new(initial: u32) -> Self {
		Self { count: Mutex::new(initial), cond: Condvar::new() }
	}

	fn lock(&self) -> MutexGuard<'_, u32> {
		self.count.lock().expect("sem lock")
	}

	/// Takes one unit, waiting per `tmo_ms`.
	pub fn wait(&self, tmo_ms: i32) -> Result {
		let mut count = self.lock();

		if tmo_ms < 0 {
			if *count == 0 {
				return Err(NetError::WouldBlock);
			}
		} else if tmo_ms == 0 {
			while *count == 0 {
				count = self.cond.wait(count).expect("sem lock");
			}
		} else {
			let deadline = Instant::now() + Duration::from_millis(tmo_ms as u64);
			while *count == 0 {
				let now = Instant::now();
				if now >= deadline {
					return Err(NetError::Timeout);
				}

				let (guard, _) = self
					.cond
					.wait_timeout(count, deadline - now)
					.expect("sem lock");
				count = guard;
			}
		}

		*count -= 1;
		Ok(())
	}

	/// Releases one unit, waking one waiter.
	pub fn signal(&self) {
		*self.lock() += 1;
		self.cond.notify_one();
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	#[test]
	fn nonblocking_and_timeout() {
		let sem = Sem::new(1);
		sem.wait(-1).unwrap();
		assert_eq!(sem.wait(-1), Err(NetError::WouldBlock));
		assert_eq!(sem.wait(5), Err(NetError::Timeout));
	}

	#[test]
	fn signal_wakes_waiter() {
		let sem = Arc::new(Sem::new(0));

		let waiter = {
			let sem = Arc::clone(&sem);
			std::thread::spawn(move || sem.wait(0))
		};

		std::thread::sleep(Duration::from_millis(10));
		sem.signal();
		assert!(waiter.join().unwrap().is_ok());
	}
}
