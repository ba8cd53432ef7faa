//! Address resolution.
//!
//! The cache is an LRU-ordered list of fixed capacity. Entries are `WAITING`
//! while a request is outstanding, holding the datagrams that provoked it;
//! a reply flushes them. A one-second scan retries, refreshes and expires.

use std::collections::VecDeque;
use std::mem;
use std::net::Ipv4Addr;

use log::{debug, info, warn};
use utils::endian::u16be;
use utils::error::{NetError, Result};

use collections::list::NodeId;

use crate::netif::NetifId;
use crate::pktbuf::PktBuf;
use crate::{cfg, ether, Stack};

pub const ARP_HW_ETHER: u16 = 1;
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;
pub const ARP_PKT_SIZE: usize = 28;

pub struct ArpPkt {
	pub htype: u16be,
	pub ptype: u16be,
	pub hlen: u8,
	pub plen: u8,
	pub opcode: u16be,
	pub sender_mac: [u8; 6],
	pub sender_ip: [u8; 4],
	pub target_mac: [u8; 6],
	pub target_ip: [u8; 4],
}

impl ArpPkt {
	pub fn decode(raw: &[u8; ARP_PKT_SIZE]) -> Self {
		let mut pkt = Self {
			htype: u16be::of([raw[0], raw[1]]),
			ptype: u16be::of([raw[2], raw[3]]),
			hlen: raw[4],
			plen: raw[5],
			opcode: u16be::of([raw[6], raw[7]]),
			sender_mac: [0; 6],
			sender_ip: [0; 4],
			target_mac: [0; 6],
			target_ip: [0; 4],
		};

		pkt.sender_mac.copy_from_slice(&raw[8..14]);
		pkt.sender_ip.copy_from_slice(&raw[14..18]);
		pkt.target_mac.copy_from_slice(&raw[18..24]);
		pkt.target_ip.copy_from_slice(&raw[24..28]);
		pkt
	}

	pub fn encode(&self) -> [u8; ARP_PKT_SIZE] {
		let mut raw = [0; ARP_PKT_SIZE];
		raw[0..2].copy_from_slice(&self.htype.bytes());
		raw[2..4].copy_from_slice(&self.ptype.bytes());
		raw[4] = self.hlen;
		raw[5] = self.plen;
		raw[6..8].copy_from_slice(&self.opcode.bytes());
		raw[8..14].copy_from_slice(&self.sender_mac);
		raw[14..18].copy_from_slice(&self.sender_ip);
		raw[18..24].copy_from_slice(&self.target_mac);
		raw[24..28].copy_from_slice(&self.target_ip);
		raw
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntryState {
	Waiting,
	Resolved,
}

pub struct Entry {
	pub ipaddr: Ipv4Addr,
	pub hwaddr: [u8; 6],
	pub state: EntryState,
	/// Scans left before retry (waiting) or expiry (resolved).
	pub tmo: u32,
	pub retry: u32,
	pub netif: NetifId,
	pub pending: VecDeque<PktBuf>,
}

/// The cache proper: list order is recency, front is hottest.
pub struct Cache {
	list: collections::list::IndexList<Entry>,
}

impl Cache {
	pub fn new() -> Self {
		Self { list: collections::list::IndexList::with_capacity(cfg::ARP_CACHE_SIZE) }
	}

	/// Finds an entry and bumps it to the front.
	fn find(&mut self, ip: Ipv4Addr) -> Option<NodeId> {
		let id = self.list.iter().find(|(_, e)| e.ipaddr == ip).map(|(id, _)| id)?;
		self.list.move_to_front(id);
		Some(id)
	}

	/// Front-inserts a fresh entry, evicting the least recently used one
	/// (and its pending buffers) on overflow.
	fn insert(&mut self, entry: Entry) -> NodeId {
		if self.list.len() >= cfg::ARP_CACHE_SIZE {
			if let Some(evicted) = self.list.pop_back() {
				debug!("arp cache full, evicting {}", evicted.ipaddr);
			}
		}

		self.list.push_front(entry)
	}

	pub fn len(&self) -> usize {
		self.list.len()
	}

	pub fn is_empty(&self) -> bool {
		self.list.is_empty()
	}

	/// Resolved lookup without recency side effects.
	pub fn lookup(&self, ip: Ipv4Addr) -> Option<&Entry> {
		self.list.iter().find(|(_, e)| e.ipaddr == ip).map(|(_, e)| e)
	}
}

impl Default for Cache {
	fn default() -> Self {
		Self::new()
	}
}

fn check(pkt: &ArpPkt, size: usize) -> Result {
	if size < ARP_PKT_SIZE {
		warn!("arp packet too small");
		return Err(NetError::Size);
	}

	if pkt.htype.get() != ARP_HW_ETHER
		|| pkt.ptype.get() != ether::ETHERTYPE_IPV4
		|| pkt.hlen != 6
		|| pkt.plen != 4
	{
		warn!("arp packet field error");
		return Err(NetError::Broken);
	}

	let op = pkt.opcode.get();
	if op != ARP_OP_REQUEST && op != ARP_OP_REPLY {
		warn!("unknown arp opcode {op}");
		return Err(NetError::Broken);
	}

	Ok(())
}

/// Learns `ip → mac`, transmitting whatever was parked on a `WAITING` entry.
fn cache_insert(stack: &mut Stack, id: NetifId, ip: Ipv4Addr, mac: [u8; 6], force: bool) {
	let node = stack.arp.find(ip);

	let node = match node {
		Some(node) => node,
		None if force => stack.arp.insert(Entry {
			ipaddr: ip,
			hwaddr: mac,
			state: EntryState::Waiting,
			tmo: 0,
			retry: 0,
			netif: id,
			pending: VecDeque::new(),
		}),
		None => return,
	};

	let pending = {
		let entry = stack.arp.list.get_mut(node).expect("linked node");
		entry.hwaddr = mac;
		entry.state = EntryState::Resolved;
		entry.tmo = cfg::ARP_RESOLVED_TMO;
		entry.retry = 0;
		entry.netif = id;
		mem::take(&mut entry.pending)
	};

	for buf in pending {
		if let Err(err) = ether::raw_send(stack, id, ether::ETHERTYPE_IPV4, mac, buf) {
			warn!("flushing pending datagram failed: {err}");
		}
	}
}

/// Handles one inbound ARP packet. Requests aimed at this interface are
/// answered in place; any sender that names us refreshes the cache.
pub fn recv(stack: &mut Stack, id: NetifId, buf: PktBuf) -> Result {
	buf.set_cont(ARP_PKT_SIZE.min(buf.total_size()))?;
	buf.seek(0)?;

	let mut raw = [0; ARP_PKT_SIZE];
	let size = buf.total_size();
	if size >= ARP_PKT_SIZE {
		buf.read(&mut raw)?;
	}

	let pkt = ArpPkt::decode(&raw);
	check(&pkt, size)?;

	let if_ip = stack.netifs.get(id).ok_or(NetError::Param)?.ipaddr;
	let sender_ip = Ipv4Addr::from(pkt.sender_ip);
	let target_ip = Ipv4Addr::from(pkt.target_ip);

	let for_us = target_ip == if_ip;
	cache_insert(stack, id, sender_ip, pkt.sender_mac, for_us);

	if for_us && pkt.opcode.get() == ARP_OP_REQUEST {
		debug!("arp request from {sender_ip}, replying");
		return make_reply(stack, id, buf, &pkt);
	}

	Ok(())
}

/// Broadcasts a request for `dst`.
pub fn make_request(stack: &mut Stack, id: NetifId, dst: Ipv4Addr) -> Result {
	let netif = stack.netifs.get(id).ok_or(NetError::Param)?;

	let pkt = ArpPkt {
		htype: ARP_HW_ETHER.into(),
		ptype: ether::ETHERTYPE_IPV4.into(),
		hlen: 6,
		plen: 4,
		opcode: ARP_OP_REQUEST.into(),
		sender_mac: netif.hwaddr.mac(),
		sender_ip: netif.ipaddr.octets(),
		target_mac: [0; 6],
		target_ip: dst.octets(),
	};

	let buf = PktBuf::alloc(&stack.pool, ARP_PKT_SIZE)?;
	buf.write(&pkt.encode())?;

	ether::raw_send(stack, id, ether::ETHERTYPE_ARP, ether::ETHER_BROADCAST, buf)
}

/// Turns a received request into a unicast reply, reusing its buffer.
fn make_reply(stack: &mut Stack, id: NetifId, buf: PktBuf, req: &ArpPkt) -> Result {
	let netif = stack.netifs.get(id).ok_or(NetError::Param)?;

	let reply = ArpPkt {
		htype: req.htype,
		ptype: req.ptype,
		hlen: req.hlen,
		plen: req.plen,
		opcode: ARP_OP_REPLY.into(),
		sender_mac: netif.hwaddr.mac(),
		sender_ip: netif.ipaddr.octets(),
		target_mac: req.sender_mac,
		target_ip: req.sender_ip,
	};

	buf.resize(ARP_PKT_SIZE)?;
	buf.seek(0)?;
	buf.write(&reply.encode())?;

	ether::raw_send(stack, id, ether::ETHERTYPE_ARP, req.sender_mac, buf)
}

/// Requests our own address: advertises the mapping and smokes out
/// conflicts.
pub fn make_gratuitous(stack: &mut Stack, id: NetifId) -> Result {
	info!("sending gratuitous arp");
	let ip = stack.netifs.get(id).ok_or(NetError::Param)?.ipaddr;
	make_request(stack, id, ip)
}

/// Resolves `dst` for an outbound datagram: transmit on a hit, park the
/// buffer and request on a miss.
pub fn resolve(stack: &mut Stack, id: NetifId, dst: Ipv4Addr, buf: PktBuf) -> Result {
	if let Some(node) = stack.arp.find(dst) {
		let entry = stack.arp.list.get_mut(node).expect("linked node");

		match entry.state {
			EntryState::Resolved => {
				let mac = entry.hwaddr;
				return ether::raw_send(stack, id, ether::ETHERTYPE_IPV4, mac, buf);
			}
			EntryState::Waiting => {
				if entry.pending.len() >= cfg::ARP_PENDING_LIMIT {
					warn!("arp pending queue full for {dst}, datagram dropped");
					return Err(NetError::Full);
				}
				entry.pending.push_back(buf);
				return Ok(());
			}
		}
	}

	stack.arp.insert(Entry {
		ipaddr: dst,
		hwaddr: [0; 6],
		state: EntryState::Waiting,
		tmo: cfg::ARP_WAITING_TMO,
		retry: cfg::ARP_RETRY_CNT,
		netif: id,
		pending: VecDeque::from([buf]),
	});

	make_request(stack, id, dst)
}

/// The one-second cache scan: retry `WAITING` entries until the retry budget
/// runs out, expire `RESOLVED` ones after their TTL with a refresh probe
/// shortly before.
pub fn on_timer(stack: &mut Stack, _arg: usize) {
	enum Action {
		Drop(NodeId),
		Request(NetifId, Ipv4Addr),
	}

	let mut actions = Vec::new();
	let mut at = stack.arp.list.head();

	while let Some(node) = at {
		at = stack.arp.list.next(node);
		let entry = stack.arp.list.get_mut(node).expect("linked node");

		entry.tmo = entry.tmo.saturating_sub(1);
		if entry.tmo > 0 {
			continue;
		}

		match entry.state {
			EntryState::Waiting => {
				if entry.retry == 0 {
					warn!("arp for {} unanswered, dropping entry", entry.ipaddr);
					actions.push(Action::Drop(node));
				} else {
					entry.retry -= 1;
					entry.tmo = cfg::ARP_WAITING_TMO;
					actions.push(Action::Request(entry.netif, entry.ipaddr));
				}
			}
			EntryState::Resolved => {
				// One probing round before the entry goes away for good.
				entry.state = EntryState::Waiting;
				entry.tmo = cfg::ARP_WAITING_TMO;
				entry.retry = cfg::ARP_RETRY_CNT;
				actions.push(Action::Request(entry.netif, entry.ipaddr));
			}
		}
	}

	for action in actions {
		match action {
			Action::Drop(node) => {
				// Unanswered forever; pending datagrams go down with it.
				stack.arp.list.remove(node);
			}
			Action::Request(id, ip) => {
				if let Err(err) = make_request(stack, id, ip) {
					debug!("arp refresh for {ip} failed: {err}");
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn packet_codec_round_trip() {
		let pkt = ArpPkt {
			htype: ARP_HW_ETHER.into(),
			ptype: ether::ETHERTYPE_IPV4.into(),
			hlen: 6,
			plen: 4,
			opcode: ARP_OP_REPLY.into(),
			sender_mac: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
			sender_ip: [192, 168, 1, 10],
			target_mac: [2, 4, 6, 8, 10, 12],
			target_ip: [192, 168, 1, 1],
		};

		let raw = pkt.encode();
		let back = ArpPkt::decode(&raw);
		assert_eq!(back.encode(), raw);
		assert_eq!(back.opcode.get(), ARP_OP_REPLY);
		assert_eq!(back.sender_mac, pkt.sender_mac);
	}

	#[test]
	fn validation_rejects_junk() {
		let good = ArpPkt {
			htype: ARP_HW_ETHER.into(),
			ptype: ether::ETHERTYPE_IPV4.into(),
			hlen: 6,
			plen: 4,
			opcode: ARP_OP_REQUEST.into(),
			sender_mac: [0; 6],
			sender_ip: [0; 4],
			target_mac: [0; 6],
			target_ip: [0; 4],
		};
		assert!(check(&good, ARP_PKT_SIZE).is_ok());

		let mut bad = ArpPkt::decode(&good.encode());
		bad.opcode = 7.into();
		assert_eq!(check(&bad, ARP_PKT_SIZE), Err(NetError::Broken));

		let mut bad = ArpPkt::decode(&good.encode());
		bad.hlen = 8;
		assert_eq!(check(&bad, ARP_PKT_SIZE), Err(NetError::Broken));

		assert_eq!(check(&good, 20), Err(NetError::Size));
	}
}
