//! Raw IP sockets: matching inbound datagrams are queued whole, header
//! included; sends wrap the payload straight in IPv4.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use log::{debug, warn};
use utils::error::{NetError, Result};

use crate::ipv4::Ipv4Hdr;
use crate::pktbuf::PktBuf;
use crate::sock::{Op, Sock, SockBase, Variant, Wait, WAIT_RECV};
use crate::{cfg, ipaddr, ipv4, Stack};

pub struct RawSock {
	/// Queued datagrams with their source address.
	pub recvq: VecDeque<(PktBuf, Ipv4Addr)>,
}

pub fn create(stack: &mut Stack, protocol: i32) -> Result<usize> {
	if stack.socks.count(|v| matches!(v, Variant::Raw(_))) >= cfg::RAW_MAXCNT {
		warn!("no free raw socket");
		return Err(NetError::Mem);
	}

	let mut base = SockBase::new(crate::api::AF_INET, protocol);
	base.recv_wait = Some(Wait::new());

	Ok(stack.socks.socks.insert(Sock {
		base,
		var: Variant::Raw(RawSock { recvq: VecDeque::new() }),
	}))
}

/// Copies an inbound datagram (header intact) to every matching raw socket.
pub fn deliver(stack: &mut Stack, hdr: &Ipv4Hdr, buf: &PktBuf) {
	let pool = stack.pool.clone();

	for (_, sock) in stack.socks.socks.iter_mut() {
		let Variant::Raw(raw) = &mut sock.var else { continue };

		if sock.base.protocol != 0 && sock.base.protocol != hdr.proto as i32 {
			continue;
		}
		if !ipaddr::is_any(sock.base.local_ip) && sock.base.local_ip != hdr.dst {
			continue;
		}
		if !ipaddr::is_any(sock.base.remote_ip) && sock.base.remote_ip != hdr.src {
			continue;
		}

		if raw.recvq.len() >= cfg::SOCK_RECVQ_MAX {
			debug!("raw socket queue full, datagram dropped");
			continue;
		}

		let Ok(copy) = PktBuf::alloc(&pool, buf.total_size()) else {
			debug!("raw delivery skipped, no free buffer");
			continue;
		};

		let cloned = buf.seek(0).and_then(|_| copy.copy_from(buf, buf.total_size()));
		if cloned.is_err() {
			continue;
		}

		copy.acc_reset();
		raw.recvq.push_back((copy, hdr.src));
		sock.base.wakeup(WAIT_RECV, Ok(()));
	}
}

pub fn sendto(stack: &mut Stack, key: usize, data: &[u8], ip: Ipv4Addr) -> Result<Op<usize>> {
	let sock = &stack.socks.socks[key];
	let (src, proto) = (sock.base.local_ip, sock.base.protocol as u8);

	let buf = PktBuf::from_bytes(&stack.pool, data)?;
	ipv4::send(stack, proto, ip, src, buf)?;

	Ok(Op::Done(data.len()))
}

pub fn recvfrom(
	stack: &mut Stack,
	key: usize,
	max: usize,
) -> Result<Op<(Vec<u8>, Ipv4Addr, u16)>> {
	let sock = &mut stack.socks.socks[key];
	let Variant::Raw(raw) = &mut sock.var else {
		return Err(NetError::Param);
	};

	let Some((buf, src)) = raw.recvq.pop_front() else {
		let wait = sock.base.recv_wait.clone().ok_or(NetError::Sys)?;
		return Ok(Op::Wait(wait, sock.base.recv_tmo));
	};

	let n = buf.total_size().min(max);
	let mut out = vec![0; n];
	buf.seek(0)?;
	buf.read(&mut out)?;

	Ok(Op::Done((out, src, 0)))
}
