//! The IPv4 layer: datagram validation and demux on receive, routing and
//! header construction on send.

pub mod frag;
pub mod route;

use std::net::Ipv4Addr;

use bilge::prelude::*;
use log::{debug, warn};
use utils::endian::u16be;
use utils::error::{NetError, Result};

use crate::netif::NetifId;
use crate::pktbuf::{AddMode, PktBuf};
use crate::sock::{raw, udp};
use crate::{cfg, icmpv4, ipaddr, tcp, Stack};

pub const IPV4_HDR_SIZE: usize = 20;
/// Header length ceiling: a 4-bit IHL in 32-bit words.
pub const IPV4_HDR_MAX: usize = 60;

pub const PROTO_ICMPV4: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Version and header length share the first byte.
#[bitsize(8)]
#[derive(FromBits, Clone, Copy)]
struct Meta {
	ihl: u4,
	ver: u4,
}

/// Flags and the 13-bit fragment offset share a word.
#[bitsize(16)]
#[derive(FromBits, Clone, Copy)]
struct FragWord {
	ofst: u13,
	more: bool,
	dont: bool,
	reserved: bool,
}

#[derive(Clone, Copy)]
pub struct Ipv4Hdr {
	/// Header bytes (IHL × 4).
	pub hdr_len: usize,
	pub tos: u8,
	pub total_len: u16,
	pub id: u16,
	pub more: bool,
	pub dont: bool,
	/// Fragment offset in 8-byte units.
	pub frag_ofst: u16,
	pub ttl: u8,
	pub proto: u8,
	pub csum: u16,
	pub src: Ipv4Addr,
	pub dst: Ipv4Addr,
}

impl Ipv4Hdr {
	pub fn frag_ofst_bytes(&self) -> usize {
		self.frag_ofst as usize * 8
	}

	pub fn decode(raw: &[u8; IPV4_HDR_SIZE]) -> Result<Self> {
		let meta = Meta::from(raw[0]);
		if meta.ver().value() != 4 {
			return Err(NetError::Broken);
		}

		let frag = FragWord::from(u16be::of([raw[6], raw[7]]).get());

		Ok(Self {
			hdr_len: meta.ihl().value() as usize * 4,
			tos: raw[1],
			total_len: u16be::of([raw[2], raw[3]]).get(),
			id: u16be::of([raw[4], raw[5]]).get(),
			more: frag.more(),
			dont: frag.dont(),
			frag_ofst: frag.ofst().value(),
			ttl: raw[8],
			proto: raw[9],
			csum: u16be::of([raw[10], raw[11]]).get(),
			src: Ipv4Addr::from([raw[12], raw[13], raw[14], raw[15]]),
			dst: Ipv4Addr::from([raw[16], raw[17], raw[18], raw[19]]),
		})
	}

	pub fn encode(&self) -> [u8; IPV4_HDR_SIZE] {
		let mut raw = [0; IPV4_HDR_SIZE];

		raw[0] = Meta::new(u4::new((self.hdr_len / 4) as u8), u4::new(4)).into();
		raw[1] = self.tos;
		raw[2..4].copy_from_slice(&self.total_len.to_be_bytes());
		raw[4..6].copy_from_slice(&self.id.to_be_bytes());

		let frag = FragWord::new(u13::new(self.frag_ofst), self.more, self.dont);
		raw[6..8].copy_from_slice(&u16::from(frag).to_be_bytes());

		raw[8] = self.ttl;
		raw[9] = self.proto;
		raw[10..12].copy_from_slice(&self.csum.to_be_bytes());
		raw[12..16].copy_from_slice(&self.src.octets());
		raw[16..20].copy_from_slice(&self.dst.octets());
		raw
	}
}

fn check(hdr: &Ipv4Hdr, buf: &PktBuf) -> Result {
	if hdr.hdr_len < IPV4_HDR_SIZE {
		warn!("ipv4 header length impossible");
		return Err(NetError::Broken);
	}

	let total = hdr.total_len as usize;
	if total < hdr.hdr_len || total > buf.total_size() {
		warn!("ipv4 total length impossible");
		return Err(NetError::Broken);
	}

	// The header sums to zero when the stored checksum is intact.
	if hdr.csum != 0 {
		buf.seek(0)?;
		if buf.checksum16(hdr.hdr_len, 0, true)? != 0 {
			warn!("ipv4 header checksum mismatch");
			return Err(NetError::Broken);
		}
	}

	Ok(())
}

/// The receive pipeline of §network: validate, address-filter, strip
/// padding, then reassemble or demultiplex.
pub fn recv(stack: &mut Stack, id: NetifId, buf: PktBuf) -> Result {
	if buf.total_size() < IPV4_HDR_SIZE {
		warn!("ipv4 packet too small");
		return Err(NetError::Broken);
	}

	buf.set_cont(IPV4_HDR_SIZE)?;
	buf.seek(0)?;
	let mut raw = [0; IPV4_HDR_SIZE];
	buf.read(&mut raw)?;
	let hdr = Ipv4Hdr::decode(&raw)?;

	if hdr.hdr_len > IPV4_HDR_SIZE {
		if hdr.hdr_len > IPV4_HDR_MAX {
			return Err(NetError::Broken);
		}
		// Options stay in the header block; they are skipped, not parsed.
		buf.set_cont(hdr.hdr_len)?;
	}

	check(&hdr, &buf)?;

	let (if_ip, if_mask) = {
		let netif = stack.netifs.get(id).ok_or(NetError::Param)?;
		(netif.ipaddr, netif.netmask)
	};

	if !ipaddr::is_local_dst(hdr.dst, if_ip, if_mask) {
		// Forwarding is out of scope; quietly drop other hosts' traffic.
		debug!("ipv4 packet for {} is not ours", hdr.dst);
		return Err(NetError::Unreachable);
	}

	// Strip link-layer padding.
	buf.resize(hdr.total_len as usize)?;

	if hdr.more || hdr.frag_ofst != 0 {
		return frag::handle(stack, &hdr, buf);
	}

	demux(stack, &hdr, if_ip, buf)
}

/// Hands a full datagram to its transport. `buf` still carries the IP
/// header so the unreachable path can quote it.
fn demux(stack: &mut Stack, hdr: &Ipv4Hdr, if_ip: Ipv4Addr, buf: PktBuf) -> Result {
	raw::deliver(stack, hdr, &buf);

	match hdr.proto {
		PROTO_ICMPV4 => {
			buf.header_remove(hdr.hdr_len)?;
			icmpv4::recv(stack, hdr.src, if_ip, buf)
		}
		PROTO_UDP => {
			// Port lookup happens before the header goes away; a miss turns
			// the whole datagram into an unreachable quote.
			buf.seek(hdr.hdr_len + 2)?;
			let mut port = [0; 2];
			buf.read(&mut port)?;
			let dst_port = u16::from_be_bytes(port);

			if udp::find(stack, hdr.dst, dst_port).is_none() {
				debug!("udp port {dst_port} closed, sending unreachable");
				icmpv4::send_unreach(stack, hdr.src, if_ip, icmpv4::CODE_UNREACH_PORT, &buf)?;
				return Ok(());
			}

			buf.header_remove(hdr.hdr_len)?;
			udp::recv(stack, hdr.src, hdr.dst, buf)
		}
		PROTO_TCP => {
			buf.header_remove(hdr.hdr_len)?;
			tcp::recv::recv(stack, hdr.src, hdr.dst, buf)
		}
		other => {
			debug!("unknown transport protocol {other}");
			Err(NetError::Broken)
		}
	}
}

/// Called by frag reassembly once a datagram is whole; `buf` holds the
/// payload only.
pub(crate) fn deliver_reassembled(
	stack: &mut Stack,
	proto: u8,
	src: Ipv4Addr,
	dst: Ipv4Addr,
	buf: PktBuf,
) -> Result {
	match proto {
		PROTO_ICMPV4 => icmpv4::recv(stack, src, dst, buf),
		PROTO_UDP => udp::recv(stack, src, dst, buf),
		PROTO_TCP => tcp::recv::recv(stack, src, dst, buf),
		other => {
			debug!("unknown transport protocol {other}");
			Err(NetError::Broken)
		}
	}
}

/// Wraps a transport segment in an IPv4 header and routes it out.
pub fn send(stack: &mut Stack, proto: u8, dst: Ipv4Addr, src: Ipv4Addr, buf: PktBuf) -> Result {
	let (ifid, next_hop) = {
		let Some(entry) = stack.routes.find(dst) else {
			warn!("no route to {dst}");
			return Err(NetError::Unreachable);
		};

		let hop = if ipaddr::is_any(entry.next_hop) { dst } else { entry.next_hop };
		(entry.netif, hop)
	};

	let netif = stack.netifs.get(ifid).ok_or(NetError::Param)?;
	let total = buf.total_size() + IPV4_HDR_SIZE;

	// Outbound fragmentation is unimplemented; oversized datagrams fail.
	if netif.mtu != 0 && total > netif.mtu {
		warn!("datagram of {total} bytes exceeds mtu {}", netif.mtu);
		return Err(NetError::Size);
	}

	let src = if ipaddr::is_any(src) { netif.ipaddr } else { src };

	let hdr = Ipv4Hdr {
		hdr_len: IPV4_HDR_SIZE,
		tos: 0,
		total_len: total as u16,
		id: stack.next_ipv4_id(),
		more: false,
		dont: false,
		frag_ofst: 0,
		ttl: cfg::IPV4_TTL_DEFAULT,
		proto,
		csum: 0,
		src,
		dst,
	};

	buf.header_add(IPV4_HDR_SIZE, AddMode::Cont)?;
	buf.seek(0)?;
	buf.write(&hdr.encode())?;

	// Checksum over the zero-filled field, patched in place.
	buf.seek(0)?;
	let csum = buf.checksum16(IPV4_HDR_SIZE, 0, false)?;
	buf.seek(10)?;
	buf.write(&csum.to_be_bytes())?;

	stack.netif_send(ifid, next_hop, buf)
}
