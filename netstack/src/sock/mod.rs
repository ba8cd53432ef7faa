//! The socket layer: base records, wait objects, the fd table and the
//! operation dispatch the application shims call through `FUNC` events.

pub mod raw;
pub mod udp;

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use log::debug;
use slab::Slab;
use utils::error::{NetError, Result};

use runtime::sync::Sem;

use crate::api::{AF_INET, SOCK_DGRAM, SOCK_RAW, SOCK_STREAM};
use crate::{cfg, ipaddr, tcp, Stack};

pub const WAIT_CONN: u8 = 1 << 0;
pub const WAIT_SEND: u8 = 1 << 1;
pub const WAIT_RECV: u8 = 1 << 2;
pub const WAIT_ALL: u8 = WAIT_CONN | WAIT_SEND | WAIT_RECV;

/// A semaphore plus a stored outcome: how an application thread parks on an
/// asynchronous result. The worker wakes it with the reason; the parked
/// thread returns that reason.
pub struct Wait {
	sem: Sem,
	err: Mutex<Result>,
}

impl Wait {
	pub fn new() -> Arc<Self> {
		Arc::new(Self { sem: Sem::new(0), err: Mutex::new(Ok(())) })
	}

	pub fn wait(&self, tmo_ms: i32) -> Result {
		self.sem.wait(tmo_ms)?;
		*self.err.lock().expect("wait err")
	}

	pub fn wake(&self, res: Result) {
		*self.err.lock().expect("wait err") = res;
		self.sem.signal();
	}
}

/// Two-phase outcome of a worker-side operation: finished, or park on this
/// wait (with the socket's timeout) and ask again.
pub enum Op<R> {
	Done(R),
	Wait(Arc<Wait>, i32),
}

/// State common to every socket variant.
pub struct SockBase {
	pub local_ip: Ipv4Addr,
	pub local_port: u16,
	pub remote_ip: Ipv4Addr,
	pub remote_port: u16,
	pub family: i32,
	pub protocol: i32,
	/// Sticky failure; set once a connection dies, returned until close.
	pub err: Option<NetError>,
	pub recv_tmo: i32,
	pub send_tmo: i32,
	pub conn_wait: Option<Arc<Wait>>,
	pub send_wait: Option<Arc<Wait>>,
	pub recv_wait: Option<Arc<Wait>>,
}

impl SockBase {
	pub fn new(family: i32, protocol: i32) -> Self {
		Self {
			local_ip: ipaddr::ANY,
			local_port: 0,
			remote_ip: ipaddr::ANY,
			remote_port: 0,
			family,
			protocol,
			err: None,
			recv_tmo: 0,
			send_tmo: 0,
			conn_wait: None,
			send_wait: None,
			recv_wait: None,
		}
	}

	/// Wakes the selected wait objects with `res`.
	pub fn wakeup(&self, which: u8, res: Result) {
		if which & WAIT_CONN != 0 {
			if let Some(wait) = &self.conn_wait {
				wait.wake(res);
			}
		}
		if which & WAIT_SEND != 0 {
			if let Some(wait) = &self.send_wait {
				wait.wake(res);
			}
		}
		if which & WAIT_RECV != 0 {
			if let Some(wait) = &self.recv_wait {
				wait.wake(res);
			}
		}
	}
}

pub enum Variant {
	Raw(raw::RawSock),
	Udp(udp::UdpSock),
	Tcp(tcp::TcpSock),
}

pub struct Sock {
	pub base: SockBase,
	pub var: Variant,
}

#[derive(Clone, Copy)]
struct FdSlot {
	key: usize,
	gen: u32,
}

/// Socket storage plus the fd table. Connections outlive their fd (TIME_WAIT
/// has no descriptor), so descriptors map to slab keys with a generation to
/// catch stale fds.
pub struct Table {
	pub(crate) socks: Slab<Sock>,
	fds: [Option<FdSlot>; cfg::SOCKET_MAX_CNT],
	next_gen: u32,
}

impl Table {
	pub fn new() -> Self {
		Self {
			socks: Slab::new(),
			fds: [None; cfg::SOCKET_MAX_CNT],
			next_gen: 0,
		}
	}

	pub(crate) fn attach_fd(&mut self, key: usize) -> Result<i32> {
		let idx = self
			.fds
			.iter()
			.position(|slot| slot.is_none())
			.ok_or(NetError::Mem)?;

		self.next_gen = (self.next_gen + 1) & 0x07FF_FFFF;
		if self.next_gen == 0 {
			self.next_gen = 1;
		}

		self.fds[idx] = Some(FdSlot { key, gen: self.next_gen });
		Ok(((self.next_gen as i32) << 4) | idx as i32)
	}

	pub(crate) fn fd_key(&self, fd: i32) -> Result<usize> {
		if fd < 0 {
			return Err(NetError::Param);
		}

		let idx = (fd & 0xF) as usize;
		let gen = (fd >> 4) as u32;

		match self.fds.get(idx).copied().flatten() {
			Some(slot) if slot.gen == gen => Ok(slot.key),
			_ => Err(NetError::Closed),
		}
	}

	pub(crate) fn detach_fd(&mut self, fd: i32) -> Result<usize> {
		let key = self.fd_key(fd)?;
		self.fds[(fd & 0xF) as usize] = None;
		Ok(key)
	}

	pub(crate) fn detach_key(&mut self, key: usize) {
		for slot in self.fds.iter_mut() {
			if slot.is_some_and(|s| s.key == key) {
				*slot = None;
			}
		}
	}

	pub(crate) fn count(&self, pred: fn(&Variant) -> bool) -> usize {
		self.socks.iter().filter(|(_, s)| pred(&s.var)).count()
	}

	/// Whether `port` is taken by another socket of the same kind.
	pub(crate) fn port_used(&self, pred: fn(&Variant) -> bool, port: u16) -> bool {
		self.socks
			.iter()
			.any(|(_, s)| pred(&s.var) && s.base.local_port == port)
	}
}

impl Default for Table {
	fn default() -> Self {
		Self::new()
	}
}

impl Stack {
	fn sock(&mut self, fd: i32) -> Result<(usize, &mut Sock)> {
		let key = self.socks.fd_key(fd)?;
		let sock = self.socks.socks.get_mut(key).ok_or(NetError::Closed)?;
		Ok((key, sock))
	}

	pub(crate) fn sock_create(&mut self, family: i32, type_: i32, protocol: i32) -> Result<i32> {
		if family != AF_INET {
			return Err(NetError::Param);
		}

		let key = match type_ {
			SOCK_RAW => raw::create(self, protocol)?,
			SOCK_DGRAM => udp::create(self, protocol)?,
			SOCK_STREAM => tcp::create(self, protocol)?,
			_ => return Err(NetError::Param),
		};

		let fd = self.socks.attach_fd(key);
		if fd.is_err() {
			self.sock_free(key);
		}
		fd
	}

	/// Releases a socket record and whatever it queued.
	pub(crate) fn sock_free(&mut self, key: usize) {
		if self.socks.socks.contains(key) {
			self.socks.socks.remove(key);
		}
		self.socks.detach_key(key);
	}

	pub(crate) fn sock_bind(&mut self, fd: i32, ip: Ipv4Addr, port: u16) -> Result {
		// The address must name this host.
		if !ipaddr::is_any(ip) && !self.netifs.iter().any(|(_, n)| n.ipaddr == ip) {
			return Err(NetError::Param);
		}

		let (_, sock) = self.sock(fd)?;
		let bound_port = sock.base.local_port;
		let pred: fn(&Variant) -> bool = match sock.var {
			Variant::Raw(_) => |v| matches!(v, Variant::Raw(_)),
			Variant::Udp(_) => |v| matches!(v, Variant::Udp(_)),
			Variant::Tcp(_) => |v| matches!(v, Variant::Tcp(_)),
		};

		if port != 0 && bound_port != port && self.socks.port_used(pred, port) {
			return Err(NetError::Exist);
		}

		let (_, sock) = self.sock(fd)?;
		sock.base.local_ip = ip;
		sock.base.local_port = port;
		Ok(())
	}

	pub(crate) fn sock_listen(&mut self, fd: i32) -> Result {
		let key = self.socks.fd_key(fd)?;
		tcp::listen(self, key)
	}

	pub(crate) fn sock_connect(&mut self, fd: i32, ip: Ipv4Addr, port: u16) -> Result<Op<()>> {
		let (key, sock) = self.sock(fd)?;

		match sock.var {
			// Datagram connect just pins the default remote.
			Variant::Raw(_) | Variant::Udp(_) => {
				sock.base.remote_ip = ip;
				sock.base.remote_port = port;
				Ok(Op::Done(()))
			}
			Variant::Tcp(_) => tcp::connect(self, key, ip, port),
		}
	}

	pub(crate) fn sock_sendto(
		&mut self,
		fd: i32,
		data: &[u8],
		ip: Ipv4Addr,
		port: u16,
	) -> Result<Op<usize>> {
		let (key, sock) = self.sock(fd)?;
		if let Some(err) = sock.base.err {
			return Err(err);
		}

		match sock.var {
			Variant::Raw(_) => raw::sendto(self, key, data, ip),
			Variant::Udp(_) => udp::sendto(self, key, data, ip, port),
			Variant::Tcp(_) => {
				// Stream sockets only accept their connected peer here.
				if sock.base.remote_ip != ip || sock.base.remote_port != port {
					return Err(NetError::Param);
				}
				tcp::send::send_data(self, key, data)
			}
		}
	}

	pub(crate) fn sock_recvfrom(
		&mut self,
		fd: i32,
		max: usize,
	) -> Result<Op<(Vec<u8>, Ipv4Addr, u16)>> {
		let (key, sock) = self.sock(fd)?;
		if let Some(err) = sock.base.err {
			return Err(err);
		}

		match sock.var {
			Variant::Raw(_) => raw::recvfrom(self, key, max),
			Variant::Udp(_) => udp::recvfrom(self, key, max),
			Variant::Tcp(_) => {
				let (remote_ip, remote_port) = (sock.base.remote_ip, sock.base.remote_port);
				match tcp::recv::recv_app(self, key, max)? {
					Op::Done(data) => Ok(Op::Done((data, remote_ip, remote_port))),
					Op::Wait(wait, tmo) => Ok(Op::Wait(wait, tmo)),
				}
			}
		}
	}

	pub(crate) fn sock_send(&mut self, fd: i32, data: &[u8]) -> Result<Op<usize>> {
		let (_, sock) = self.sock(fd)?;
		let (ip, port) = (sock.base.remote_ip, sock.base.remote_port);

		match sock.var {
			// Datagram send defers to sendto with the bound remote.
			Variant::Raw(_) | Variant::Udp(_) => self.sock_sendto(fd, data, ip, port),
			Variant::Tcp(_) => {
				if let Some(err) = sock.base.err {
					return Err(err);
				}
				let key = self.socks.fd_key(fd)?;
				tcp::send::send_data(self, key, data)
			}
		}
	}

	pub(crate) fn sock_recv(&mut self, fd: i32, max: usize) -> Result<Op<Vec<u8>>> {
		match self.sock_recvfrom(fd, max)? {
			Op::Done((data, _, _)) => Ok(Op::Done(data)),
			Op::Wait(wait, tmo) => Ok(Op::Wait(wait, tmo)),
		}
	}

	pub(crate) fn sock_setopt(&mut self, fd: i32, level: i32, name: i32, val: i32) -> Result {
		use crate::api::{
			SOL_SOCKET, SOL_TCP, SO_KEEPALIVE, SO_RCVTIMEO, SO_SNDTIMEO, TCP_KEEPCNT,
			TCP_KEEPIDLE, TCP_KEEPINTVL,
		};

		let (_, sock) = self.sock(fd)?;

		match (level, name) {
			(SOL_SOCKET, SO_RCVTIMEO) => {
				sock.base.recv_tmo = val;
				Ok(())
			}
			(SOL_SOCKET, SO_SNDTIMEO) => {
				sock.base.send_tmo = val;
				Ok(())
			}
			(SOL_SOCKET, SO_KEEPALIVE) => match &mut sock.var {
				// Accepted and remembered; no keepalive timer runs.
				Variant::Tcp(tcp) => {
					tcp.keepalive = val != 0;
					Ok(())
				}
				_ => Err(NetError::Param),
			},
			(SOL_TCP, TCP_KEEPIDLE | TCP_KEEPINTVL | TCP_KEEPCNT) => match &mut sock.var {
				Variant::Tcp(tcp) => {
					match name {
						TCP_KEEPIDLE => tcp.keep_idle = val,
						TCP_KEEPINTVL => tcp.keep_intvl = val,
						_ => tcp.keep_cnt = val,
					}
					Ok(())
				}
				_ => Err(NetError::Param),
			},
			_ => Err(NetError::Param),
		}
	}

	pub(crate) fn sock_close(&mut self, fd: i32) -> Result<Op<()>> {
		let (key, sock) = self.sock(fd)?;

		match sock.var {
			Variant::Raw(_) | Variant::Udp(_) => {
				debug!("closing datagram socket fd {fd}");
				self.socks.detach_fd(fd)?;
				self.sock_free(key);
				Ok(Op::Done(()))
			}
			Variant::Tcp(_) => tcp::close(self, key),
		}
	}

	/// Second close phase for connection sockets, after the wait resolved.
	pub(crate) fn sock_close_finish(&mut self, fd: i32) -> Result {
		let Ok(key) = self.socks.detach_fd(fd) else {
			// The state machine already tore the mapping down.
			return Ok(());
		};
		tcp::close_finish(self, key);
		Ok(())
	}
}
