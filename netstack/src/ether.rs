//! Ethernet II framing.

use std::net::Ipv4Addr;

use log::{debug, warn};
use utils::endian::u16be;
use utils::error::{NetError, Result};

use crate::netif::NetifId;
use crate::pktbuf::{AddMode, PktBuf};
use crate::{arp, ipaddr, ipv4, Stack};

pub const ETHER_MTU: usize = 1500;
pub const ETHER_HDR_SIZE: usize = 14;
/// Smallest payload a conforming frame carries; short sends are padded.
pub const ETHER_DATA_MIN: usize = 46;
pub const ETHER_BROADCAST: [u8; 6] = [0xFF; 6];

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub struct EtherHdr {
	pub dst: [u8; 6],
	pub src: [u8; 6],
	pub ethertype: u16be,
}

impl EtherHdr {
	pub fn decode(raw: &[u8; ETHER_HDR_SIZE]) -> Self {
		let mut dst = [0; 6];
		let mut src = [0; 6];
		dst.copy_from_slice(&raw[0..6]);
		src.copy_from_slice(&raw[6..12]);

		Self {
			dst,
			src,
			ethertype: u16be::of([raw[12], raw[13]]),
		}
	}

	pub fn encode(&self) -> [u8; ETHER_HDR_SIZE] {
		let mut raw = [0; ETHER_HDR_SIZE];
		raw[0..6].copy_from_slice(&self.dst);
		raw[6..12].copy_from_slice(&self.src);
		raw[12..14].copy_from_slice(&self.ethertype.bytes());
		raw
	}
}

/// Demultiplexes one inbound frame by ethertype.
///
/// Reception tolerates payloads below the wire minimum because capture
/// adapters strip padding.
pub fn recv(stack: &mut Stack, id: NetifId, buf: PktBuf) -> Result {
	let total = buf.total_size();

	if total < ETHER_HDR_SIZE {
		warn!("ether frame too small ({total} bytes)");
		return Err(NetError::Broken);
	}
	if total > ETHER_HDR_SIZE + ETHER_MTU {
		warn!("ether frame too large ({total} bytes)");
		return Err(NetError::Broken);
	}

	buf.set_cont(ETHER_HDR_SIZE)?;
	buf.seek(0)?;
	let mut raw = [0; ETHER_HDR_SIZE];
	buf.read(&mut raw)?;
	let hdr = EtherHdr::decode(&raw);

	match hdr.ethertype.get() {
		ETHERTYPE_ARP => {
			buf.header_remove(ETHER_HDR_SIZE)?;
			arp::recv(stack, id, buf)
		}
		ETHERTYPE_IPV4 => {
			buf.header_remove(ETHER_HDR_SIZE)?;
			ipv4::recv(stack, id, buf)
		}
		other => {
			debug!("unhandled ethertype 0x{other:04x}");
			Err(NetError::Broken)
		}
	}
}

/// Frames `buf` for `dst` and queues it on the interface.
pub fn raw_send(
	stack: &mut Stack,
	id: NetifId,
	ethertype: u16,
	dst: [u8; 6],
	buf: PktBuf,
) -> Result {
	let payload = buf.total_size();
	if payload > ETHER_MTU {
		warn!("ether payload over mtu ({payload} bytes)");
		return Err(NetError::Size);
	}

	if payload < ETHER_DATA_MIN {
		buf.resize(ETHER_DATA_MIN)?;
		buf.seek(payload)?;
		buf.fill(0, ETHER_DATA_MIN - payload)?;
	}

	let src = {
		let netif = stack.netifs.get(id).ok_or(NetError::Param)?;
		netif.hwaddr.mac()
	};

	buf.header_add(ETHER_HDR_SIZE, AddMode::Cont)?;
	buf.seek(0)?;
	buf.write(&EtherHdr { dst, src, ethertype: ethertype.into() }.encode())?;

	#[cfg(feature = "pcap")]
	stack.capture(&buf);

	stack.netif_push_send(id, buf)
}

/// Sends an IPv4 datagram to the next hop `dst`, resolving the destination
/// MAC through ARP.
pub fn send(stack: &mut Stack, id: NetifId, dst: Ipv4Addr, buf: PktBuf) -> Result {
	let (if_ip, if_mask, if_mac) = {
		let netif = stack.netifs.get(id).ok_or(NetError::Param)?;
		(netif.ipaddr, netif.netmask, netif.hwaddr.mac())
	};

	// Talking to ourselves loops the frame through the wire unchanged.
	if dst == if_ip {
		return raw_send(stack, id, ETHERTYPE_IPV4, if_mac, buf);
	}

	if dst == ipaddr::BROADCAST || dst == ipaddr::broadcast_of(if_ip, if_mask) {
		return raw_send(stack, id, ETHERTYPE_IPV4, ETHER_BROADCAST, buf);
	}

	arp::resolve(stack, id, dst, buf)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_codec_is_identity() {
		let raw: [u8; 14] = [
			0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x02, 0x11, 0x22, 0x33, 0x44, 0x55, 0x08, 0x06,
		];

		let hdr = EtherHdr::decode(&raw);
		assert_eq!(hdr.dst, ETHER_BROADCAST);
		assert_eq!(hdr.ethertype.get(), ETHERTYPE_ARP);
		assert_eq!(hdr.encode(), raw);
	}
}
