//! The exchange: one bounded queue of events, one worker that owns every
//! protocol table.
//!
//! NIC reader threads post `NetifRecv` after filling their receive queue.
//! Application threads post `Func`, a closure the worker runs against the
//! [`Stack`], and block on a completion semaphore for the result. Nothing
//! else ever touches protocol state, which is why none of it is locked.

use std::sync::{Arc, Mutex};

use log::{info, warn};
use utils::error::{NetError, Result};

use collections::fixq::Fixq;
use runtime::sync::Sem;
use runtime::time;

use crate::netif::NetifId;
use crate::{cfg, timer, Stack};

pub(crate) enum Msg {
	/// An interface's receive queue has frames waiting.
	NetifRecv(NetifId),
	/// Run an interface driver's send hook.
	NetifSend(NetifId),
	/// A marshalled application call.
	Func(Func),
}

pub(crate) struct Func {
	run: Box<dyn FnOnce(&mut Stack) + Send>,
}

/// Cloneable posting handle to the exchange queue.
#[derive(Clone)]
pub struct MsgSender {
	queue: Arc<Fixq<Msg>>,
}

impl MsgSender {
	pub(crate) fn new(queue: Arc<Fixq<Msg>>) -> Self {
		Self { queue }
	}

	/// Posts a receive notification. Non-blocking: a full exchange queue
	/// only delays the drain until the next notification.
	pub fn netif_recv(&self, id: NetifId) -> Result {
		self.queue
			.send(Msg::NetifRecv(id), -1)
			.map_err(|_| NetError::Full)
	}

	pub fn netif_send(&self, id: NetifId) -> Result {
		self.queue
			.send(Msg::NetifSend(id), -1)
			.map_err(|_| NetError::Full)
	}

	/// Runs `f` on the worker and blocks until it finishes.
	///
	/// The only entry point for application-originated mutations: the closure
	/// executes with the whole stack, the caller sleeps on the completion
	/// semaphore.
	pub fn func_exec<R, F>(&self, f: F) -> Result<R>
	where
		R: Send + 'static,
		F: FnOnce(&mut Stack) -> Result<R> + Send + 'static,
	{
		struct Done<R> {
			sem: Sem,
			slot: Mutex<Option<Result<R>>>,
		}

		let done = Arc::new(Done { sem: Sem::new(0), slot: Mutex::new(None) });
		let finish = Arc::clone(&done);

		let msg = Msg::Func(Func {
			run: Box::new(move |stack| {
				let res = f(stack);
				*finish.slot.lock().expect("func slot") = Some(res);
				finish.sem.signal();
			}),
		});

		if self.queue.send(msg, 0).is_err() {
			warn!("exchange queue rejected a call");
			return Err(NetError::Full);
		}

		done.sem.wait(0)?;
		let result = done
			.slot
			.lock()
			.expect("func slot")
			.take()
			.unwrap_or(Err(NetError::Sys));
		result
	}
}

impl Stack {
	fn dispatch(&mut self, msg: Msg) {
		match msg {
			Msg::NetifRecv(id) => self.handle_netif_recv(id),
			Msg::NetifSend(id) => self.driver_kick(id),
			Msg::Func(func) => (func.run)(self),
		}
	}

	/// Processes at most one event, then folds the elapsed time into the
	/// timer list. Returns whether an event was handled.
	pub fn poll(&mut self, tmo_ms: i32) -> bool {
		let queue = Arc::clone(&self.queue);
		let msg = queue.recv(tmo_ms);

		let now = time::now_ms();
		let dt = now.saturating_sub(self.last_tick) as u32;
		if dt > 0 {
			self.last_tick = now;
			timer::check_tmo(self, dt);
		}

		match msg {
			Some(msg) => {
				self.dispatch(msg);
				true
			}
			None => false,
		}
	}

	/// The worker loop. Blocks until an exit is requested via
	/// [`runtime::request_exit`] or Ctrl+C.
	pub fn run(mut self) {
		info!("exchange worker running");
		self.last_tick = time::now_ms();

		while !runtime::exit_requested() {
			let tmo = match self.timers.first_tmo() {
				Some(next) => next.clamp(1, cfg::EXMSG_TICK_MS),
				None => cfg::EXMSG_TICK_MS,
			};

			self.poll(tmo as i32);
		}

		info!("exchange worker done");
	}

	/// Moves the stack onto its worker thread.
	pub fn start(self) -> std::thread::JoinHandle<()> {
		std::thread::Builder::new()
			.name("net-worker".into())
			.spawn(move || self.run())
			.expect("worker thread")
	}
}
