//! Fixed-capacity object pools.
//!
//! A [`Pool`] owns a bounded set of equal records, hands them out by value and
//! takes them back on free. Capacity is fixed at construction; the sum of the
//! free count and the outstanding allocations always equals it.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use utils::error::{NetError, Result};

/// Locking discipline of a pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockMode {
	/// The pool is touched by a single thread; `alloc` never blocks.
	None,
	/// The pool is shared across threads; `alloc` may wait for a slot.
	Thread,
}

pub struct Pool<T> {
	free: Mutex<Vec<T>>,
	avail: Condvar,
	mode: LockMode,
	capacity: usize,
}

impl<T> Pool<T> {
	/// Builds a pool of `count` records produced by `f`.
	pub fn new(mode: LockMode, count: usize, mut f: impl FnMut() -> T) -> Self {
		let mut free = Vec::with_capacity(count);
		free.resize_with(count, &mut f);

		Self {
			free: Mutex::new(free),
			avail: Condvar::new(),
			mode,
			capacity: count,
		}
	}

	fn lock(&self) -> MutexGuard<'_, Vec<T>> {
		self.free.lock().expect("pool lock")
	}

	/// Takes one record out of the pool.
	///
	/// `tmo_ms` follows the stack-wide convention: negative means fail
	/// immediately, zero means wait forever, positive bounds the wait in
	/// milliseconds. A [`LockMode::None`] pool never waits.
	pub fn alloc(&self, tmo_ms: i32) -> Result<T> {
		let mut free = self.lock();

		if tmo_ms < 0 || self.mode == LockMode::None {
			return free.pop().ok_or(NetError::Mem);
		}

		if tmo_ms == 0 {
			loop {
				if let Some(slot) = free.pop() {
					return Ok(slot);
				}
				free = self.avail.wait(free).expect("pool lock");
			}
		}

		let deadline = Instant::now() + Duration::from_millis(tmo_ms as u64);
		loop {
			if let Some(slot) = free.pop() {
				return Ok(slot);
			}

			let now = Instant::now();
			if now >= deadline {
				return Err(NetError::Timeout);
			}

			let (guard, _) = self
				.avail
				.wait_timeout(free, deadline - now)
				.expect("pool lock");
			free = guard;
		}
	}

	/// Returns a record to the pool, waking one blocked `alloc`.
	pub fn free(&self, slot: T) {
		let mut free = self.lock();
		debug_assert!(free.len() < self.capacity, "pool over-freed");
		free.push(slot);
		drop(free);

		if self.mode == LockMode::Thread {
			self.avail.notify_one();
		}
	}

	/// Number of records currently free.
	pub fn free_count(&self) -> usize {
		self.lock().len()
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn alloc_free_accounting() {
		let pool = Pool::new(LockMode::None, 4, || [0u8; 8]);
		assert_eq!(pool.free_count(), 4);

		let a = pool.alloc(-1).unwrap();
		let b = pool.alloc(-1).unwrap();
		assert_eq!(pool.free_count() + 2, pool.capacity());

		pool.free(a);
		pool.free(b);
		assert_eq!(pool.free_count(), pool.capacity());
	}

	#[test]
	fn exhaustion_fails_without_wait() {
		let pool = Pool::new(LockMode::None, 1, || ());
		let slot = pool.alloc(-1).unwrap();
		assert_eq!(pool.alloc(-1), Err(NetError::Mem));
		pool.free(slot);
		assert!(pool.alloc(-1).is_ok());
	}

	#[test]
	fn bounded_wait_times_out() {
		let pool = Pool::new(LockMode::Thread, 1, || ());
		let _held = pool.alloc(-1).unwrap();
		assert_eq!(pool.alloc(10), Err(NetError::Timeout));
	}

	#[test]
	fn blocked_alloc_wakes_on_free() {
		use std::sync::Arc;

		let pool = Arc::new(Pool::new(LockMode::Thread, 1, || 7u32));
		let held = pool.alloc(-1).unwrap();

		let waiter = {
			let pool = Arc::clone(&pool);
			std::thread::spawn(move || pool.alloc(0).unwrap())
		};

		std::thread::sleep(Duration::from_millis(20));
		pool.free(held);
		assert_eq!(waiter.join().unwrap(), 7);
	}
}
