//! Bounded blocking FIFO.
//!
//! The handoff primitive between the NIC threads and the worker: a fixed
//! capacity ring guarded by one mutex and two condition variables playing the
//! part of the empty-slot and filled-slot semaphores. Safe for any number of
//! producers and consumers; the stack uses it single-producer/single-consumer.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub struct Fixq<T> {
	queue: Mutex<VecDeque<T>>,
	cap: usize,
	/// Signalled when a slot frees up.
	space: Condvar,
	/// Signalled when a message arrives.
	filled: Condvar,
}

/// Outcome of a rejected `send`; carries the message back to the caller.
pub struct Rejected<T> {
	pub msg: T,
	pub timed_out: bool,
}

impl<T> Fixq<T> {
	pub fn new(cap: usize) -> Self {
		Self {
			queue: Mutex::new(VecDeque::with_capacity(cap)),
			cap,
			space: Condvar::new(),
			filled: Condvar::new(),
		}
	}

	fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
		self.queue.lock().expect("fixq lock")
	}

	/// Enqueues `msg`, blocking while the queue is full.
	///
	/// Negative `tmo_ms` fails immediately on a full queue, zero waits
	/// forever, positive bounds the wait. On failure the message comes back
	/// in [`Rejected`] so the caller can dispose of it.
	pub fn send(&self, msg: T, tmo_ms: i32) -> Result<(), Rejected<T>> {
		let mut queue = self.lock();

		if tmo_ms < 0 {
			if queue.len() >= self.cap {
				return Err(Rejected { msg, timed_out: false });
			}
		} else if tmo_ms == 0 {
			while queue.len() >= self.cap {
				queue = self.space.wait(queue).expect("fixq lock");
			}
		} else {
			let deadline = Instant::now() + Duration::from_millis(tmo_ms as u64);
			while queue.len() >= self.cap {
				let now = Instant::now();
				if now >= deadline {
					return Err(Rejected { msg, timed_out: true });
				}

				let (guard, _) = self
					.space
					.wait_timeout(queue, deadline - now)
					.expect("fixq lock");
				queue = guard;
			}
		}

		queue.push_back(msg);
		drop(queue);
		self.filled.notify_one();

		Ok(())
	}

	/// Dequeues the oldest message, blocking while the queue is empty.
	///
	/// Timeout semantics mirror [`send`](Self::send); `None` means empty (or
	/// the deadline elapsed).
	pub fn recv(&self, tmo_ms: i32) -> Option<T> {
		let mut queue = self.lock();

		if tmo_ms < 0 {
			// Fall through to the pop below.
		} else if tmo_ms == 0 {
			while queue.is_empty() {
				queue = self.filled.wait(queue).expect("fixq lock");
			}
		} else {
			let deadline = Instant::now() + Duration::from_millis(tmo_ms as u64);
			while queue.is_empty() {
				let now = Instant::now();
				if now >= deadline {
					return None;
				}

				let (guard, _) = self
					.filled
					.wait_timeout(queue, deadline - now)
					.expect("fixq lock");
				queue = guard;
			}
		}

		let msg = queue.pop_front()?;
		drop(queue);
		self.space.notify_one();

		Some(msg)
	}

	pub fn count(&self) -> usize {
		self.lock().len()
	}

	pub fn capacity(&self) -> usize {
		self.cap
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	#[test]
	fn fifo_order() {
		let q = Fixq::new(4);
		for i in 0..4 {
			q.send(i, -1).ok().unwrap();
		}
		for i in 0..4 {
			assert_eq!(q.recv(-1), Some(i));
		}
		assert!(q.recv(-1).is_none());
	}

	#[test]
	fn full_rejects_nonblocking_sender() {
		let q = Fixq::new(1);
		q.send('a', -1).ok().unwrap();

		let back = q.send('b', -1).err().unwrap();
		assert_eq!(back.msg, 'b');
		assert!(!back.timed_out);

		let back = q.send('c', 5).err().unwrap();
		assert!(back.timed_out);
	}

	#[test]
	fn recv_times_out_on_empty() {
		let q: Fixq<u8> = Fixq::new(1);
		assert!(q.recv(5).is_none());
	}

	#[test]
	fn cross_thread_handoff() {
		let q = Arc::new(Fixq::new(2));

		let producer = {
			let q = Arc::clone(&q);
			std::thread::spawn(move || {
				for i in 0..16u32 {
					q.send(i, 0).ok().unwrap();
				}
			})
		};

		let got: Vec<u32> = (0..16).map(|_| q.recv(0).unwrap()).collect();
		producer.join().unwrap();
		assert_eq!(got, (0..16).collect::<Vec<_>>());
	}
}
