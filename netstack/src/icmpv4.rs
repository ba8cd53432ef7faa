//! ICMPv4: echo service and destination-unreachable emission.

use std::net::Ipv4Addr;

use log::{debug, warn};
use utils::error::{NetError, Result};

use crate::pktbuf::PktBuf;
use crate::{ipv4, Stack};

pub const ICMP_HDR_SIZE: usize = 8;

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_UNREACH: u8 = 3;
pub const TYPE_ECHO_REQUEST: u8 = 8;

pub const CODE_UNREACH_NET: u8 = 0;
pub const CODE_UNREACH_HOST: u8 = 1;
pub const CODE_UNREACH_PROTO: u8 = 2;
pub const CODE_UNREACH_PORT: u8 = 3;

/// Handles one inbound message; `buf` holds the ICMP message only.
///
/// Echo requests turn into replies in place: swap the roles, flip the type,
/// refresh the checksum and send the same buffer back.
pub fn recv(stack: &mut Stack, src: Ipv4Addr, dst: Ipv4Addr, buf: PktBuf) -> Result {
	let total = buf.total_size();
	if total < ICMP_HDR_SIZE {
		warn!("icmp message too small");
		return Err(NetError::Broken);
	}

	buf.seek(0)?;
	if buf.checksum16(total, 0, true)? != 0 {
		warn!("icmp checksum mismatch");
		return Err(NetError::Broken);
	}

	buf.set_cont(ICMP_HDR_SIZE)?;
	let mut head = [0; 2];
	buf.seek(0)?;
	buf.read(&mut head)?;

	match (head[0], head[1]) {
		(TYPE_ECHO_REQUEST, 0) => {
			buf.seek(0)?;
			buf.write(&[TYPE_ECHO_REPLY, 0, 0, 0])?;

			buf.seek(0)?;
			let csum = buf.checksum16(total, 0, false)?;
			buf.seek(2)?;
			buf.write(&csum.to_be_bytes())?;

			ipv4::send(stack, ipv4::PROTO_ICMPV4, src, dst, buf)
		}
		(kind, code) => {
			debug!("icmp type {kind} code {code} ignored");
			Ok(())
		}
	}
}

/// Emits destination-unreachable for `orig`, an IP datagram still carrying
/// its header. The quote is the offending header plus eight payload bytes.
pub fn send_unreach(
	stack: &mut Stack,
	dst: Ipv4Addr,
	src: Ipv4Addr,
	code: u8,
	orig: &PktBuf,
) -> Result {
	orig.seek(0)?;
	let mut first = [0; 1];
	orig.read(&mut first)?;
	let quoted_hdr = (first[0] & 0x0F) as usize * 4;

	let quote = (quoted_hdr + 8).min(orig.total_size());

	let buf = PktBuf::alloc(&stack.pool, ICMP_HDR_SIZE + quote)?;
	buf.write(&[TYPE_UNREACH, code, 0, 0, 0, 0, 0, 0])?;

	orig.seek(0)?;
	buf.copy_from(orig, quote)?;

	buf.seek(0)?;
	let csum = buf.checksum16(ICMP_HDR_SIZE + quote, 0, false)?;
	buf.seek(2)?;
	buf.write(&csum.to_be_bytes())?;

	ipv4::send(stack, ipv4::PROTO_ICMPV4, dst, src, buf)
}
