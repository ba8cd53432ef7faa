//! The connection-oriented transport.
//!
//! A connection is a socket-table entry carrying the eleven-state machine,
//! the sequence-space bookkeeping and the two byte rings. Everything runs on
//! the worker; application threads only ever park on the connection's wait
//! objects.

pub mod buf;
pub mod recv;
pub mod send;
pub mod state;

use std::net::Ipv4Addr;

use bilge::prelude::*;
use log::{debug, warn};
use utils::endian::{u16be, u32be};
use utils::error::{NetError, Result};

use crate::pktbuf::PktBuf;
use crate::sock::{Op, Sock, SockBase, Variant, Wait, WAIT_ALL};
use crate::timer::TimerId;
use crate::{cfg, ipaddr, Stack};

pub const TCP_HDR_SIZE: usize = 20;

/// `a` strictly precedes `b` in sequence space. Wrap distances under 2^31
/// compare correctly across the wrap.
#[inline]
pub fn seq_before(a: u32, b: u32) -> bool {
	(a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn seq_before_eq(a: u32, b: u32) -> bool {
	(a.wrapping_sub(b) as i32) <= 0
}

#[inline]
pub fn seq_after(a: u32, b: u32) -> bool {
	seq_before(b, a)
}

#[inline]
pub fn seq_after_eq(a: u32, b: u32) -> bool {
	seq_before_eq(b, a)
}

/// `b < a < c` in sequence space.
#[inline]
pub fn seq_between(a: u32, b: u32, c: u32) -> bool {
	seq_after(a, b) && seq_before(a, c)
}

/// `b < a ≤ c` in sequence space.
#[inline]
pub fn seq_between_incl(a: u32, b: u32, c: u32) -> bool {
	seq_after(a, b) && seq_before_eq(a, c)
}

/// Data offset and control bits, as laid out in the 13th and 14th header
/// bytes read as one big-endian word.
#[bitsize(16)]
#[derive(FromBits, Clone, Copy)]
struct Control {
	fin: bool,
	syn: bool,
	rst: bool,
	psh: bool,
	ack: bool,
	urg: bool,
	ece: bool,
	cwr: bool,
	reserved: u4,
	off: u4,
}

/// Decoded control bits.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct Flags {
	pub fin: bool,
	pub syn: bool,
	pub rst: bool,
	pub psh: bool,
	pub ack: bool,
	pub urg: bool,
	pub ece: bool,
	pub cwr: bool,
}

impl Flags {
	/// A segment with no control bits at all is malformed.
	pub fn any(&self) -> bool {
		self.fin || self.syn || self.rst || self.psh || self.ack || self.urg || self.ece || self.cwr
	}
}

#[derive(Clone, Copy)]
pub struct TcpHdr {
	pub src_port: u16,
	pub dst_port: u16,
	pub seq: u32,
	pub ack: u32,
	/// Header bytes (data offset × 4).
	pub hdr_len: usize,
	pub f: Flags,
	pub win: u16,
	pub csum: u16,
	pub urg_ptr: u16,
}

impl TcpHdr {
	pub fn decode(raw: &[u8; TCP_HDR_SIZE]) -> Self {
		let ctl = Control::from(u16be::of([raw[12], raw[13]]).get());

		Self {
			src_port: u16be::of([raw[0], raw[1]]).get(),
			dst_port: u16be::of([raw[2], raw[3]]).get(),
			seq: u32be::of([raw[4], raw[5], raw[6], raw[7]]).get(),
			ack: u32be::of([raw[8], raw[9], raw[10], raw[11]]).get(),
			hdr_len: ctl.off().value() as usize * 4,
			f: Flags {
				fin: ctl.fin(),
				syn: ctl.syn(),
				rst: ctl.rst(),
				psh: ctl.psh(),
				ack: ctl.ack(),
				urg: ctl.urg(),
				ece: ctl.ece(),
				cwr: ctl.cwr(),
			},
			win: u16be::of([raw[14], raw[15]]).get(),
			csum: u16be::of([raw[16], raw[17]]).get(),
			urg_ptr: u16be::of([raw[18], raw[19]]).get(),
		}
	}

	pub fn encode(&self) -> [u8; TCP_HDR_SIZE] {
		let mut raw = [0; TCP_HDR_SIZE];

		raw[0..2].copy_from_slice(&self.src_port.to_be_bytes());
		raw[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
		raw[4..8].copy_from_slice(&self.seq.to_be_bytes());
		raw[8..12].copy_from_slice(&self.ack.to_be_bytes());

		let ctl = Control::new(
			self.f.fin,
			self.f.syn,
			self.f.rst,
			self.f.psh,
			self.f.ack,
			self.f.urg,
			self.f.ece,
			self.f.cwr,
			u4::new((self.hdr_len / 4) as u8),
		);
		raw[12..14].copy_from_slice(&u16::from(ctl).to_be_bytes());

		raw[14..16].copy_from_slice(&self.win.to_be_bytes());
		raw[16..18].copy_from_slice(&self.csum.to_be_bytes());
		raw[18..20].copy_from_slice(&self.urg_ptr.to_be_bytes());
		raw
	}
}

/// Everything derived once per inbound segment.
pub struct Info {
	pub local_ip: Ipv4Addr,
	pub remote_ip: Ipv4Addr,
	pub hdr: TcpHdr,
	pub buf: PktBuf,
	pub data_len: u32,
	pub seq: u32,
	/// Sequence-number footprint: payload plus one each for SYN and FIN.
	pub seq_len: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TcpState {
	Closed,
	Listen,
	SynSent,
	SynRcvd,
	Established,
	FinWait1,
	FinWait2,
	Closing,
	TimeWait,
	CloseWait,
	LastAck,
}

impl TcpState {
	pub fn name(&self) -> &'static str {
		match self {
			TcpState::Closed => "CLOSED",
			TcpState::Listen => "LISTEN",
			TcpState::SynSent => "SYN_SENT",
			TcpState::SynRcvd => "SYN_RCVD",
			TcpState::Established => "ESTABLISHED",
			TcpState::FinWait1 => "FIN_WAIT_1",
			TcpState::FinWait2 => "FIN_WAIT_2",
			TcpState::Closing => "CLOSING",
			TcpState::TimeWait => "TIME_WAIT",
			TcpState::CloseWait => "CLOSE_WAIT",
			TcpState::LastAck => "LAST_ACK",
		}
	}
}

/// Send-side sequence variables: `[isn..una)` acknowledged, `[una..nxt)` in
/// flight; the ring holds every byte not yet acknowledged.
pub struct SndSeq {
	pub isn: u32,
	pub una: u32,
	pub nxt: u32,
	pub buf: buf::TcpRing,
}

/// Receive-side sequence variables: `[isn..nxt)` delivered or buffered.
pub struct RcvSeq {
	pub isn: u32,
	pub nxt: u32,
	pub buf: buf::TcpRing,
	pub fin_rcvd: bool,
}

pub struct TcpSock {
	pub state: TcpState,
	/// SYN sent and not yet acknowledged; it occupies one sequence number.
	pub syn_send: bool,
	/// FIN sent; `fin_acked` once the peer covered it.
	pub fin_send: bool,
	pub fin_acked: bool,
	/// The receive window holds a valid ISN, so segments may carry ACK.
	pub recv_win_valid: bool,
	pub snd: SndSeq,
	pub rcv: RcvSeq,
	pub mss: usize,
	pub peer_win: u16,
	pub keepalive: bool,
	pub keep_idle: i32,
	pub keep_intvl: i32,
	pub keep_cnt: i32,
	pub time_wait: Option<TimerId>,
}

/// Runs `f` with the connection's base and TCP halves split.
pub(crate) fn with<R>(
	stack: &mut Stack,
	key: usize,
	f: impl FnOnce(&mut SockBase, &mut TcpSock) -> R,
) -> Result<R> {
	let sock = stack.socks.socks.get_mut(key).ok_or(NetError::Closed)?;
	let Sock { base, var } = sock;

	match var {
		Variant::Tcp(tcp) => Ok(f(base, tcp)),
		_ => Err(NetError::Param),
	}
}

pub fn create(stack: &mut Stack, protocol: i32) -> Result<usize> {
	if stack.socks.count(|v| matches!(v, Variant::Tcp(_))) >= cfg::TCP_MAXCNT {
		warn!("no free tcp socket");
		return Err(NetError::Mem);
	}

	let mut base = SockBase::new(crate::api::AF_INET, protocol);
	base.conn_wait = Some(Wait::new());
	base.send_wait = Some(Wait::new());
	base.recv_wait = Some(Wait::new());

	Ok(stack.socks.socks.insert(Sock {
		base,
		var: Variant::Tcp(TcpSock {
			state: TcpState::Closed,
			syn_send: false,
			fin_send: false,
			fin_acked: false,
			recv_win_valid: false,
			snd: SndSeq {
				isn: 0,
				una: 0,
				nxt: 0,
				buf: buf::TcpRing::new(cfg::TCP_SBUF_SIZE),
			},
			rcv: RcvSeq {
				isn: 0,
				nxt: 0,
				buf: buf::TcpRing::new(cfg::TCP_RBUF_SIZE),
				fin_rcvd: false,
			},
			mss: cfg::TCP_MSS,
			peer_win: 0,
			keepalive: false,
			keep_idle: 0,
			keep_intvl: 0,
			keep_cnt: 0,
			time_wait: None,
		}),
	}))
}

/// Four-tuple match against the live connections, then a listener match by
/// local address.
pub(crate) fn find(stack: &Stack, info: &Info) -> Option<usize> {
	let exact = stack.socks.socks.iter().find_map(|(key, sock)| {
		let Variant::Tcp(tcp) = &sock.var else { return None };

		if tcp.state == TcpState::Listen {
			return None;
		}
		if !ipaddr::is_any(sock.base.local_ip) && sock.base.local_ip != info.local_ip {
			return None;
		}

		(sock.base.local_port == info.hdr.dst_port
			&& sock.base.remote_port == info.hdr.src_port
			&& sock.base.remote_ip == info.remote_ip)
			.then_some(key)
	});

	exact.or_else(|| {
		stack.socks.socks.iter().find_map(|(key, sock)| {
			let Variant::Tcp(tcp) = &sock.var else { return None };

			(tcp.state == TcpState::Listen
				&& sock.base.local_port == info.hdr.dst_port
				&& (ipaddr::is_any(sock.base.local_ip) || sock.base.local_ip == info.local_ip))
				.then_some(key)
		})
	})
}

fn alloc_port(stack: &mut Stack) -> Result<u16> {
	for _ in cfg::PORT_START..cfg::PORT_END {
		let port = stack.tcp_port_next;
		stack.tcp_port_next = if port + 1 == cfg::PORT_END {
			cfg::PORT_START
		} else {
			port + 1
		};

		if !stack.socks.port_used(|v| matches!(v, Variant::Tcp(_)), port) {
			return Ok(port);
		}
	}

	Err(NetError::Mem)
}

fn pick_isn() -> u32 {
	rand::random()
}

/// Active open: send the SYN and leave the caller parked on `conn_wait`.
pub(crate) fn connect(stack: &mut Stack, key: usize, ip: Ipv4Addr, port: u16) -> Result<Op<()>> {
	let state = with(stack, key, |_, tcp| tcp.state)?;

	match state {
		TcpState::Closed => {}
		// Re-entered after a wake-up: report how far the handshake got.
		TcpState::Established => return Ok(Op::Done(())),
		TcpState::SynSent | TcpState::SynRcvd => {
			let wait = with(stack, key, |base, _| base.conn_wait.clone())?;
			return Ok(Op::Wait(wait.ok_or(NetError::Sys)?, 0));
		}
		_ => return Err(NetError::Param),
	}

	if ipaddr::is_any(ip) || port == 0 {
		return Err(NetError::Param);
	}

	let local_port = {
		let sock = stack.socks.socks.get_mut(key).ok_or(NetError::Closed)?;
		sock.base.remote_ip = ip;
		sock.base.remote_port = port;
		sock.base.local_port
	};

	if local_port == 0 {
		let port = alloc_port(stack)?;
		stack.socks.socks[key].base.local_port = port;
	}

	if ipaddr::is_any(stack.socks.socks[key].base.local_ip) {
		let entry = stack.routes.find(ip).ok_or(NetError::Unreachable)?;
		let src = stack
			.netifs
			.get(entry.netif)
			.ok_or(NetError::Unreachable)?
			.ipaddr;
		stack.socks.socks[key].base.local_ip = src;
	}

	let wait = with(stack, key, |base, tcp| {
		let isn = pick_isn();
		tcp.snd.isn = isn;
		tcp.snd.una = isn;
		tcp.snd.nxt = isn;
		tcp.rcv.isn = 0;
		tcp.rcv.nxt = 0;
		base.conn_wait.clone()
	})?;

	send::send_syn(stack, key)?;
	state::set_state(stack, key, TcpState::SynSent)?;

	Ok(Op::Wait(wait.ok_or(NetError::Sys)?, 0))
}

/// Puts a bound socket into LISTEN.
pub(crate) fn listen(stack: &mut Stack, key: usize) -> Result {
	with(stack, key, |base, tcp| {
		if tcp.state != TcpState::Closed || base.local_port == 0 {
			return Err(NetError::Param);
		}
		tcp.state = TcpState::Listen;
		Ok(())
	})?
}

/// Gives up on the connection: CLOSED, every waiter woken with `err`,
/// subsequent calls fail with it until close.
pub(crate) fn abort(stack: &mut Stack, key: usize, err: NetError) -> Result {
	let timer = with(stack, key, |base, tcp| {
		tcp.state = TcpState::Closed;
		base.err = Some(err);
		base.wakeup(WAIT_ALL, Err(err));
		tcp.time_wait.take()
	})?;

	if let Some(timer) = timer {
		stack.timers.remove(timer);
	}

	Ok(())
}

/// Releases the connection record outright.
pub(crate) fn free(stack: &mut Stack, key: usize) {
	if let Ok(Some(timer)) = with(stack, key, |_, tcp| tcp.time_wait.take()) {
		stack.timers.remove(timer);
	}

	stack.sock_free(key);
}

/// Enters TIME_WAIT and arms the 2·MSL release timer.
pub(crate) fn time_wait_start(stack: &mut Stack, key: usize) -> Result {
	state::set_state(stack, key, TcpState::TimeWait)?;

	let old = with(stack, key, |base, tcp| {
		base.wakeup(crate::sock::WAIT_CONN, Ok(()));
		tcp.time_wait.take()
	})?;
	if let Some(old) = old {
		stack.timers.remove(old);
	}

	let timer = stack
		.timers
		.add("tcp 2msl", on_time_wait, key, 2 * cfg::TCP_MSL_MS, false)?;
	with(stack, key, |_, tcp| tcp.time_wait = Some(timer))?;

	Ok(())
}

fn on_time_wait(stack: &mut Stack, key: usize) {
	let held = with(stack, key, |_, tcp| {
		tcp.time_wait = None;
		tcp.state == TcpState::TimeWait
	});

	if held == Ok(true) {
		debug!("2msl elapsed, releasing connection");
		free(stack, key);
	}
}

/// Close dispatch by state. `Op::Wait` tells the shim to park on
/// `conn_wait` and run [`close_finish`] afterwards.
pub(crate) fn close(stack: &mut Stack, key: usize) -> Result<Op<()>> {
	let state = with(stack, key, |_, tcp| tcp.state)?;

	match state {
		TcpState::Closed | TcpState::Listen => {
			stack.socks.detach_key(key);
			free(stack, key);
			Ok(Op::Done(()))
		}
		TcpState::SynSent | TcpState::SynRcvd => {
			abort(stack, key, NetError::Closed)?;
			stack.socks.detach_key(key);
			free(stack, key);
			Ok(Op::Done(()))
		}
		TcpState::Established => {
			send::send_fin(stack, key)?;
			state::set_state(stack, key, TcpState::FinWait1)?;
			let wait = with(stack, key, |base, _| base.conn_wait.clone())?;
			Ok(Op::Wait(wait.ok_or(NetError::Sys)?, 0))
		}
		TcpState::CloseWait => {
			send::send_fin(stack, key)?;
			state::set_state(stack, key, TcpState::LastAck)?;
			let wait = with(stack, key, |base, _| base.conn_wait.clone())?;
			Ok(Op::Wait(wait.ok_or(NetError::Sys)?, 0))
		}
		// Simplified: an application close in TIME_WAIT releases at once.
		TcpState::TimeWait => {
			stack.socks.detach_key(key);
			free(stack, key);
			Ok(Op::Done(()))
		}
		_ => Ok(Op::Done(())),
	}
}

/// Second close phase: the fd is gone; reap the record if the machine
/// already reached CLOSED.
pub(crate) fn close_finish(stack: &mut Stack, key: usize) {
	if with(stack, key, |_, tcp| tcp.state) == Ok(TcpState::Closed) {
		free(stack, key);
	}
}
