//! The BSD-style surface applications program against.
//!
//! A [`Net`] handle marshals every call into a `FUNC` event for the worker
//! and parks the calling thread on the socket's wait object whenever the
//! operation needs the network to make progress.

use std::net::Ipv4Addr;
use std::sync::Arc;

use utils::error::{NetError, Result};

use crate::exmsg::MsgSender;
use crate::sock::Op;

pub const AF_INET: i32 = 2;

pub const SOCK_STREAM: i32 = 1;
pub const SOCK_DGRAM: i32 = 2;
pub const SOCK_RAW: i32 = 3;

pub const IPPROTO_ICMP: i32 = 1;
pub const IPPROTO_TCP: i32 = 6;
pub const IPPROTO_UDP: i32 = 17;

pub const SOL_SOCKET: i32 = 1;
pub const SOL_TCP: i32 = 6;

pub const SO_RCVTIMEO: i32 = 1;
pub const SO_SNDTIMEO: i32 = 2;
pub const SO_KEEPALIVE: i32 = 3;
pub const TCP_KEEPIDLE: i32 = 4;
pub const TCP_KEEPINTVL: i32 = 5;
pub const TCP_KEEPCNT: i32 = 6;

pub const INADDR_ANY: u32 = 0;
pub const INADDR_NONE: u32 = 0xFFFF_FFFF;

#[inline]
pub const fn htons(v: u16) -> u16 {
	v.to_be()
}

#[inline]
pub const fn ntohs(v: u16) -> u16 {
	u16::from_be(v)
}

#[inline]
pub const fn htonl(v: u32) -> u32 {
	v.to_be()
}

#[inline]
pub const fn ntohl(v: u32) -> u32 {
	u32::from_be(v)
}

/// The classic IPv4 socket address. `sin_port` and `sin_addr` are kept in
/// network byte order, exactly as an application using `htons` expects.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SockAddrIn {
	pub sin_len: u8,
	pub sin_family: u8,
	pub sin_port: u16,
	pub sin_addr: u32,
	pub sin_zero: [u8; 8],
}

impl SockAddrIn {
	pub fn new(addr: Ipv4Addr, port: u16) -> Self {
		Self {
			sin_len: core::mem::size_of::<Self>() as u8,
			sin_family: AF_INET as u8,
			sin_port: htons(port),
			sin_addr: htonl(u32::from(addr)),
			sin_zero: [0; 8],
		}
	}

	pub fn addr(&self) -> Ipv4Addr {
		Ipv4Addr::from(ntohl(self.sin_addr))
	}

	pub fn port(&self) -> u16 {
		ntohs(self.sin_port)
	}
}

/// Dotted-decimal string to a network-order `u32`; [`INADDR_NONE`] on junk.
pub fn inet_addr(s: &str) -> u32 {
	match s.parse::<Ipv4Addr>() {
		Ok(addr) => htonl(u32::from(addr)),
		Err(_) => INADDR_NONE,
	}
}

/// Network-order `u32` to dotted decimal.
pub fn inet_ntoa(addr: u32) -> String {
	Ipv4Addr::from(ntohl(addr)).to_string()
}

pub fn inet_pton(family: i32, s: &str, dst: &mut [u8; 4]) -> Result {
	if family != AF_INET {
		return Err(NetError::Param);
	}

	let addr: Ipv4Addr = s.parse().map_err(|_| NetError::Param)?;
	*dst = addr.octets();
	Ok(())
}

pub fn inet_ntop(family: i32, src: &[u8; 4]) -> Result<String> {
	if family != AF_INET {
		return Err(NetError::Param);
	}

	Ok(Ipv4Addr::from(*src).to_string())
}

/// Application-side handle to a running stack.
#[derive(Clone)]
pub struct Net {
	pub(crate) msgs: MsgSender,
}

impl Net {
	pub fn socket(&self, family: i32, type_: i32, protocol: i32) -> Result<i32> {
		self.msgs
			.func_exec(move |s| s.sock_create(family, type_, protocol))
	}

	pub fn bind(&self, fd: i32, addr: SockAddrIn) -> Result {
		let (ip, port) = (addr.addr(), addr.port());
		self.msgs.func_exec(move |s| s.sock_bind(fd, ip, port))
	}

	pub fn listen(&self, fd: i32) -> Result {
		self.msgs.func_exec(move |s| s.sock_listen(fd))
	}

	pub fn connect(&self, fd: i32, addr: SockAddrIn) -> Result {
		let (ip, port) = (addr.addr(), addr.port());

		loop {
			match self.msgs.func_exec(move |s| s.sock_connect(fd, ip, port))? {
				Op::Done(()) => return Ok(()),
				Op::Wait(wait, tmo) => wait.wait(tmo)?,
			}
		}
	}

	pub fn sendto(&self, fd: i32, data: &[u8], _flags: i32, addr: SockAddrIn) -> Result<usize> {
		let (ip, port) = (addr.addr(), addr.port());
		let data = Arc::new(data.to_vec());
		let mut sent = 0;

		while sent < data.len() || data.is_empty() {
			let chunk = Arc::clone(&data);
			let off = sent;

			match self
				.msgs
				.func_exec(move |s| s.sock_sendto(fd, &chunk[off..], ip, port))?
			{
				Op::Done(n) => {
					sent += n;
					if data.is_empty() {
						break;
					}
				}
				Op::Wait(wait, tmo) => wait.wait(tmo)?,
			}
		}

		Ok(sent)
	}

	pub fn recvfrom(&self, fd: i32, buf: &mut [u8], _flags: i32) -> Result<(usize, SockAddrIn)> {
		let max = buf.len();

		loop {
			match self.msgs.func_exec(move |s| s.sock_recvfrom(fd, max))? {
				Op::Done((data, ip, port)) => {
					buf[..data.len()].copy_from_slice(&data);
					return Ok((data.len(), SockAddrIn::new(ip, port)));
				}
				Op::Wait(wait, tmo) => wait.wait(tmo)?,
			}
		}
	}

	pub fn send(&self, fd: i32, data: &[u8], _flags: i32) -> Result<usize> {
		let data = Arc::new(data.to_vec());
		let mut sent = 0;

		while sent < data.len() {
			let chunk = Arc::clone(&data);
			let off = sent;

			match self.msgs.func_exec(move |s| s.sock_send(fd, &chunk[off..]))? {
				Op::Done(n) => sent += n,
				Op::Wait(wait, tmo) => wait.wait(tmo)?,
			}
		}

		Ok(sent)
	}

	/// Blocks until at least one byte (or EOF) is available; returns zero
	/// only on a peer close.
	pub fn recv(&self, fd: i32, buf: &mut [u8], _flags: i32) -> Result<usize> {
		let max = buf.len();

		loop {
			match self.msgs.func_exec(move |s| s.sock_recv(fd, max))? {
				Op::Done(data) => {
					buf[..data.len()].copy_from_slice(&data);
					return Ok(data.len());
				}
				Op::Wait(wait, tmo) => wait.wait(tmo)?,
			}
		}
	}

	pub fn setsockopt(&self, fd: i32, level: i32, name: i32, val: i32) -> Result {
		self.msgs
			.func_exec(move |s| s.sock_setopt(fd, level, name, val))
	}

	pub fn close(&self, fd: i32) -> Result {
		match self.msgs.func_exec(move |s| s.sock_close(fd))? {
			Op::Done(()) => Ok(()),
			Op::Wait(wait, _) => {
				// Wait out the teardown handshake, then reap.
				let res = wait.wait(0);
				self.msgs.func_exec(move |s| s.sock_close_finish(fd))?;
				res
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn byte_order_helpers() {
		assert_eq!(htons(0x1234).to_ne_bytes()[..], 0x1234u16.to_be_bytes()[..]);
		assert_eq!(ntohs(htons(0xBEEF)), 0xBEEF);
		assert_eq!(ntohl(htonl(0xC0A80105)), 0xC0A80105);
	}

	#[test]
	fn address_conversions() {
		let be = inet_addr("192.168.1.5");
		assert_eq!(inet_ntoa(be), "192.168.1.5");
		assert_eq!(inet_addr("not an ip"), INADDR_NONE);

		let mut bytes = [0; 4];
		inet_pton(AF_INET, "10.0.0.7", &mut bytes).unwrap();
		assert_eq!(bytes, [10, 0, 0, 7]);
		assert_eq!(inet_ntop(AF_INET, &bytes).unwrap(), "10.0.0.7");
		assert!(inet_pton(AF_INET, "999.0.0.1", &mut bytes).is_err());
	}

	#[test]
	fn sockaddr_round_trip() {
		let addr = SockAddrIn::new(Ipv4Addr::new(10, 0, 0, 2), 8080);
		assert_eq!(addr.sin_family, AF_INET as u8);
		assert_eq!(addr.port(), 8080);
		assert_eq!(addr.addr(), Ipv4Addr::new(10, 0, 0, 2));
	}
}
