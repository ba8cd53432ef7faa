//! The timer list.
//!
//! Timers are kept sorted by expiration encoded as relative deltas: each
//! node's `curr` is the time left after its predecessor fires, so arming and
//! expiring never rewrites the rest of the list. The worker calls
//! [`check_tmo`] with whatever time elapsed since its last pass.

use log::{debug, warn};
use utils::error::{NetError, Result};

use collections::list::{IndexList, NodeId};

use crate::Stack;

/// Timer callback: runs on the worker with the whole stack.
pub type TimerFn = fn(&mut Stack, usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerId(NodeId);

struct Timer {
	name: &'static str,
	/// Delta after the predecessor's expiration.
	curr: u32,
	reload: u32,
	reloads: bool,
	handler: TimerFn,
	arg: usize,
}

pub struct Timers {
	list: IndexList<Timer>,
}

impl Timers {
	pub fn new() -> Self {
		Self { list: IndexList::new() }
	}

	/// Arms a timer `ms` milliseconds out. `reload` re-arms it with the same
	/// period after each expiration.
	pub fn add(
		&mut self,
		name: &'static str,
		handler: TimerFn,
		arg: usize,
		ms: u32,
		reload: bool,
	) -> Result<TimerId> {
		if ms == 0 {
			return Err(NetError::Param);
		}

		debug!("add timer {name}, ms={ms}, reload={reload}");

		let id = self.insert(Timer {
			name,
			curr: ms,
			reload: ms,
			reloads: reload,
			handler,
			arg,
		});

		Ok(TimerId(id))
	}

	/// Walks the deltas until the remaining time fits, then links the timer
	/// in and shrinks its successor by the new delta.
	fn insert(&mut self, mut timer: Timer) -> NodeId {
		let mut at = self.list.head();

		while let Some(id) = at {
			let curr = self.list.get(id).expect("linked node").curr;

			if timer.curr > curr {
				timer.curr -= curr;
				at = self.list.next(id);
			} else if timer.curr == curr {
				timer.curr = 0;
				return self.list.insert_after(id, timer);
			} else {
				self.list.get_mut(id).expect("linked node").curr -= timer.curr;
				return self.list.insert_before(id, timer);
			}
		}

		self.list.push_back(timer)
	}

	/// Disarms a timer, folding its delta into the successor so later
	/// deadlines hold still.
	pub fn remove(&mut self, id: TimerId) {
		if self.list.get(id.0).is_none() {
			warn!("remove of an expired timer ignored");
			return;
		}

		let next = self.list.next(id.0);
		let timer = self.list.remove(id.0);
		debug!("remove timer {}", timer.name);

		if let Some(next) = next {
			self.list.get_mut(next).expect("linked node").curr += timer.curr;
		}
	}

	/// Milliseconds until the earliest timer fires.
	pub fn first_tmo(&self) -> Option<u32> {
		self.list.head().map(|id| self.list.get(id).expect("linked node").curr)
	}

	/// Absolute deadlines front to back; the delta-sum view the tests pin.
	#[cfg(test)]
	fn deadlines(&self) -> Vec<(&'static str, u32)> {
		let mut acc = 0;
		self.list
			.iter()
			.map(|(_, t)| {
				acc += t.curr;
				(t.name, acc)
			})
			.collect()
	}
}

impl Default for Timers {
	fn default() -> Self {
		Self::new()
	}
}

/// Expires everything due within `dt` milliseconds and runs the handlers in
/// deadline order. Reloading timers re-enter the list afterwards.
pub fn check_tmo(stack: &mut Stack, mut dt: u32) {
	let mut fired = Vec::new();

	while let Some(head) = stack.timers.list.head() {
		let curr = stack.timers.list.get(head).expect("linked node").curr;

		if curr <= dt {
			dt -= curr;
			fired.push(stack.timers.list.remove(head));
		} else {
			stack.timers.list.get_mut(head).expect("linked node").curr = curr - dt;
			break;
		}
	}

	for timer in fired {
		(timer.handler)(stack, timer.arg);

		if timer.reloads {
			stack.timers.insert(Timer {
				curr: timer.reload,
				..timer
			});
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	static FIRED: AtomicUsize = AtomicUsize::new(0);

	fn bump(_: &mut Stack, arg: usize) {
		FIRED.fetch_add(arg, Ordering::Relaxed);
	}

	#[test]
	fn deltas_encode_absolute_deadlines() {
		let mut timers = Timers::new();
		timers.add("a", bump, 0, 10, false).unwrap();
		timers.add("b", bump, 0, 30, false).unwrap();
		let c = timers.add("c", bump, 0, 20, false).unwrap();
		timers.add("d", bump, 0, 5, false).unwrap();
		// Same deadline as b; must land after it.
		timers.add("e", bump, 0, 30, false).unwrap();

		assert_eq!(
			timers.deadlines(),
			[("d", 5), ("a", 10), ("c", 20), ("b", 30), ("e", 30)]
		);

		timers.remove(c);
		assert_eq!(timers.deadlines(), [("d", 5), ("a", 10), ("b", 30), ("e", 30)]);
		assert_eq!(timers.first_tmo(), Some(5));
	}

	#[test]
	fn expiration_order_and_reload() {
		let (mut stack, _net) = Stack::new();
		// Stack::new arms its own maintenance timers; clear the table so the
		// assertions below see only ours.
		stack.timers = Timers::new();

		FIRED.store(0, Ordering::Relaxed);
		stack.timers.add("one", bump, 1, 10, false).unwrap();
		stack.timers.add("rep", bump, 100, 25, true).unwrap();

		check_tmo(&mut stack, 10);
		assert_eq!(FIRED.load(Ordering::Relaxed), 1);

		check_tmo(&mut stack, 15);
		assert_eq!(FIRED.load(Ordering::Relaxed), 101);

		// The reloading timer is back with a full period.
		assert_eq!(stack.timers.first_tmo(), Some(25));

		check_tmo(&mut stack, 60);
		assert_eq!(FIRED.load(Ordering::Relaxed), 201);
	}
}
