//! UDP: the connectionless transport.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use log::{debug, warn};
use utils::endian::u16be;
use utils::error::{NetError, Result};

use crate::pktbuf::{AddMode, PktBuf};
use crate::sock::{Op, Sock, SockBase, Variant, Wait, WAIT_RECV};
use crate::{cfg, ipaddr, ipv4, tools, Stack};

pub const UDP_HDR_SIZE: usize = 8;

pub struct UdpHdr {
	pub src_port: u16be,
	pub dst_port: u16be,
	pub len: u16be,
	pub csum: u16be,
}

impl UdpHdr {
	pub fn decode(raw: &[u8; UDP_HDR_SIZE]) -> Self {
		Self {
			src_port: u16be::of([raw[0], raw[1]]),
			dst_port: u16be::of([raw[2], raw[3]]),
			len: u16be::of([raw[4], raw[5]]),
			csum: u16be::of([raw[6], raw[7]]),
		}
	}

	pub fn encode(&self) -> [u8; UDP_HDR_SIZE] {
		let mut raw = [0; UDP_HDR_SIZE];
		raw[0..2].copy_from_slice(&self.src_port.bytes());
		raw[2..4].copy_from_slice(&self.dst_port.bytes());
		raw[4..6].copy_from_slice(&self.len.bytes());
		raw[6..8].copy_from_slice(&self.csum.bytes());
		raw
	}
}

struct Datagram {
	buf: PktBuf,
	src: Ipv4Addr,
	src_port: u16,
}

pub struct UdpSock {
	recvq: VecDeque<Datagram>,
}

pub fn create(stack: &mut Stack, protocol: i32) -> Result<usize> {
	if stack.socks.count(|v| matches!(v, Variant::Udp(_))) >= cfg::UDP_MAXCNT {
		warn!("no free udp socket");
		return Err(NetError::Mem);
	}

	let mut base = SockBase::new(crate::api::AF_INET, protocol);
	base.recv_wait = Some(Wait::new());

	Ok(stack.socks.socks.insert(Sock {
		base,
		var: Variant::Udp(UdpSock { recvq: VecDeque::new() }),
	}))
}

/// Locates the socket a datagram to `(dst, port)` belongs to.
pub fn find(stack: &Stack, dst: Ipv4Addr, port: u16) -> Option<usize> {
	stack.socks.socks.iter().find_map(|(key, sock)| {
		matches!(sock.var, Variant::Udp(_))
			.then_some(())
			.filter(|_| sock.base.local_port == port)
			.filter(|_| {
				ipaddr::is_any(sock.base.local_ip) || sock.base.local_ip == dst
			})
			.map(|_| key)
	})
}

/// Cycles the ephemeral cursor past ports already bound.
fn alloc_port(stack: &mut Stack) -> Result<u16> {
	for _ in cfg::PORT_START..cfg::PORT_END {
		let port = stack.udp_port_next;
		stack.udp_port_next = if port + 1 == cfg::PORT_END {
			cfg::PORT_START
		} else {
			port + 1
		};

		if !stack.socks.port_used(|v| matches!(v, Variant::Udp(_)), port) {
			return Ok(port);
		}
	}

	Err(NetError::Mem)
}

/// Handles one inbound segment (`buf` holds the UDP header and payload).
pub fn recv(stack: &mut Stack, src: Ipv4Addr, dst: Ipv4Addr, buf: PktBuf) -> Result {
	if buf.total_size() < UDP_HDR_SIZE {
		warn!("udp segment too small");
		return Err(NetError::Broken);
	}

	buf.set_cont(UDP_HDR_SIZE)?;
	buf.seek(0)?;
	let mut raw = [0; UDP_HDR_SIZE];
	buf.read(&mut raw)?;
	let hdr = UdpHdr::decode(&raw);

	if hdr.len.get() as usize != buf.total_size() {
		warn!(
			"udp length field {} disagrees with segment size {}",
			hdr.len.get(),
			buf.total_size()
		);
		return Err(NetError::Broken);
	}

	// A zero checksum means the sender skipped it.
	if hdr.csum.get() != 0 && tools::checksum_pseudo(&buf, src, dst, ipv4::PROTO_UDP)? != 0 {
		warn!("udp checksum mismatch");
		return Err(NetError::Broken);
	}

	let src_port = hdr.src_port.get();
	let dst_port = hdr.dst_port.get();

	let Some(key) = find(stack, dst, dst_port) else {
		debug!("no udp socket for port {dst_port}");
		return Err(NetError::Unreachable);
	};

	// A connected socket only hears its peer.
	let sock = &mut stack.socks.socks[key];
	if !ipaddr::is_any(sock.base.remote_ip)
		&& (sock.base.remote_ip != src || sock.base.remote_port != src_port)
	{
		debug!("udp datagram from unexpected peer {src}:{src_port}");
		return Err(NetError::Unreachable);
	}

	let Variant::Udp(udp) = &mut sock.var else {
		return Err(NetError::Sys);
	};

	if udp.recvq.len() >= cfg::SOCK_RECVQ_MAX {
		warn!("udp socket queue full, datagram dropped");
		return Err(NetError::Full);
	}

	buf.header_remove(UDP_HDR_SIZE)?;
	udp.recvq.push_back(Datagram { buf, src, src_port });
	sock.base.wakeup(WAIT_RECV, Ok(()));

	Ok(())
}

/// Wraps `buf` in a UDP header and hands it to IPv4.
pub(crate) fn send(
	stack: &mut Stack,
	dst: Ipv4Addr,
	dst_port: u16,
	src: Ipv4Addr,
	src_port: u16,
	buf: PktBuf,
) -> Result {
	// The pseudo header needs a concrete source before routing happens.
	let src = if ipaddr::is_any(src) {
		let entry = stack.routes.find(dst).ok_or(NetError::Unreachable)?;
		stack
			.netifs
			.get(entry.netif)
			.ok_or(NetError::Unreachable)?
			.ipaddr
	} else {
		src
	};

	buf.header_add(UDP_HDR_SIZE, AddMode::Cont)?;

	let hdr = UdpHdr {
		src_port: src_port.into(),
		dst_port: dst_port.into(),
		len: (buf.total_size() as u16).into(),
		csum: 0.into(),
	};

	buf.seek(0)?;
	buf.write(&hdr.encode())?;

	let mut csum = tools::checksum_pseudo(&buf, src, dst, ipv4::PROTO_UDP)?;
	if csum == 0 {
		// Zero is reserved for "no checksum" on the wire.
		csum = 0xFFFF;
	}
	buf.seek(6)?;
	buf.write(&csum.to_be_bytes())?;

	ipv4::send(stack, ipv4::PROTO_UDP, dst, src, buf)
}

pub fn sendto(
	stack: &mut Stack,
	key: usize,
	data: &[u8],
	ip: Ipv4Addr,
	port: u16,
) -> Result<Op<usize>> {
	if ipaddr::is_any(ip) || port == 0 {
		return Err(NetError::Param);
	}

	let sock = &stack.socks.socks[key];

	// A previously pinned remote must agree with the destination.
	if !ipaddr::is_any(sock.base.remote_ip)
		&& (sock.base.remote_ip != ip || sock.base.remote_port != port)
	{
		warn!("udp sendto conflicts with the connected remote");
		return Err(NetError::Param);
	}

	if sock.base.local_port == 0 {
		let port = alloc_port(stack)?;
		stack.socks.socks[key].base.local_port = port;
	}

	let sock = &stack.socks.socks[key];
	let (src, src_port) = (sock.base.local_ip, sock.base.local_port);

	let buf = PktBuf::from_bytes(&stack.pool, data)?;
	send(stack, ip, port, src, src_port, buf)?;

	Ok(Op::Done(data.len()))
}

pub fn recvfrom(
	stack: &mut Stack,
	key: usize,
	max: usize,
) -> Result<Op<(Vec<u8>, Ipv4Addr, u16)>> {
	let sock = &mut stack.socks.socks[key];
	let Variant::Udp(udp) = &mut sock.var else {
		return Err(NetError::Param);
	};

	let Some(dgram) = udp.recvq.pop_front() else {
		let wait = sock.base.recv_wait.clone().ok_or(NetError::Sys)?;
		return Ok(Op::Wait(wait, sock.base.recv_tmo));
	};

	// Datagram semantics: bytes past the caller's buffer are gone.
	let n = dgram.buf.total_size().min(max);
	let mut out = vec![0; n];
	dgram.buf.seek(0)?;
	dgram.buf.read(&mut out)?;

	Ok(Op::Done((out, dgram.src, dgram.src_port)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_codec_round_trip() {
		let hdr = UdpHdr {
			src_port: 0xC000.into(),
			dst_port: 53.into(),
			len: 33.into(),
			csum: 0xABCD.into(),
		};

		let raw = hdr.encode();
		assert_eq!(raw[2..4], [0, 53]);

		let back = UdpHdr::decode(&raw);
		assert_eq!(back.src_port.get(), 0xC000);
		assert_eq!(back.dst_port.get(), 53);
		assert_eq!(back.len.get(), 33);
		assert_eq!(back.csum.get(), 0xABCD);
	}
}
