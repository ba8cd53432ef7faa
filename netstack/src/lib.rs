//! A user-space TCP/IPv4 stack.
//!
//! One worker thread owns every protocol table and serves a central event
//! queue; NIC drivers hand frames across bounded queues at the edge, and
//! applications talk BSD-style sockets through [`Net`], a handle that
//! marshals each call to the worker. See `exmsg` for the concurrency
//! contract, `pktbuf` for the zero-copy currency every layer trades in.

pub mod api;
pub mod arp;
pub mod cfg;
pub mod drivers;
pub mod ether;
pub mod exmsg;
pub mod icmpv4;
pub mod ipaddr;
pub mod ipv4;
pub mod netif;
#[cfg(feature = "pcap")]
pub mod pcap;
pub mod pktbuf;
pub mod sock;
pub mod tcp;
pub mod timer;
pub mod tools;

use std::sync::Arc;

use collections::fixq::Fixq;

pub use api::Net;
use exmsg::{Msg, MsgSender};
use pktbuf::PktPool;

/// Every protocol table of the stack, owned by the worker thread.
pub struct Stack {
	pub(crate) pool: PktPool,
	pub(crate) queue: Arc<Fixq<Msg>>,
	pub(crate) msgs: MsgSender,
	pub(crate) netifs: netif::Netifs,
	pub(crate) arp: arp::Cache,
	pub(crate) routes: ipv4::route::Table,
	pub(crate) frags: ipv4::frag::Table,
	pub(crate) timers: timer::Timers,
	pub(crate) socks: sock::Table,
	pub(crate) ipv4_id: u16,
	pub(crate) udp_port_next: u16,
	pub(crate) tcp_port_next: u16,
	pub(crate) last_tick: u64,
	#[cfg(feature = "pcap")]
	pub(crate) pcap: Option<pcap::Writer>,
}

impl Stack {
	/// Builds a stack and its application handle. The stack does nothing
	/// until [`Stack::run`] or [`Stack::start`] gives it a thread (tests may
	/// instead drive [`Stack::poll`] directly).
	pub fn new() -> (Stack, Net) {
		let pool = PktPool::new();
		let queue = Arc::new(Fixq::new(cfg::EXMSG_MSG_CNT));
		let msgs = MsgSender::new(Arc::clone(&queue));

		let mut timers = timer::Timers::new();
		timers
			.add("arp scan", arp::on_timer, 0, cfg::ARP_TIMER_MS, true)
			.expect("nonzero period");
		timers
			.add("frag watchdog", ipv4::frag::on_timer, 0, cfg::IPV4_FRAG_SCAN_MS, true)
			.expect("nonzero period");

		let stack = Stack {
			pool,
			queue,
			msgs: msgs.clone(),
			netifs: netif::Netifs::new(),
			arp: arp::Cache::new(),
			routes: ipv4::route::Table::new(),
			frags: ipv4::frag::Table::new(),
			timers,
			socks: sock::Table::new(),
			ipv4_id: rand::random(),
			udp_port_next: cfg::PORT_START,
			tcp_port_next: cfg::PORT_START,
			last_tick: 0,
			#[cfg(feature = "pcap")]
			pcap: None,
		};

		let net = Net { msgs };
		(stack, net)
	}

	/// The shared packet pool, for drivers instantiated outside the stack.
	pub fn pool(&self) -> PktPool {
		self.pool.clone()
	}

	pub(crate) fn next_ipv4_id(&mut self) -> u16 {
		let id = self.ipv4_id;
		self.ipv4_id = self.ipv4_id.wrapping_add(1);
		id
	}

	/// Starts appending every frame the stack sees to a capture file.
	#[cfg(feature = "pcap")]
	pub fn capture_to(&mut self, path: &str) -> utils::error::Result {
		self.pcap = Some(pcap::Writer::new(path)?);
		Ok(())
	}

	#[cfg(feature = "pcap")]
	pub(crate) fn capture(&mut self, buf: &pktbuf::PktBuf) {
		let Some(writer) = &mut self.pcap else { return };

		let mut frame = vec![0; buf.total_size()];
		let saved = buf.pos();
		if buf.seek(0).and_then(|_| buf.read(&mut frame)).is_ok() {
			let _ = writer.log(&frame);
		}
		let _ = buf.seek(saved);
	}
}

#[cfg(test)]
mod tests {
	use std::net::Ipv4Addr;

	use utils::error::NetError;

	use crate::api::{AF_INET, SOCK_DGRAM, SOCK_STREAM};
	use crate::drivers::LoopDriver;
	use crate::netif::{Driver, DriverEnv, HwAddr, NetifId, NetifSetup, NetifType};
	use crate::pktbuf::PktBuf;
	use crate::sock::Op;
	use crate::tools::Checksum;
	use crate::{api, ether, ipaddr, ipv4, tcp, Stack};

	const OUR_MAC: [u8; 6] = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
	const PEER_MAC: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
	const OUR_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 5);
	const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 9);

	/// Threadless Ethernet driver: frames pile up on the send queue where
	/// the test pops them synchronously.
	struct TestDriver;

	impl Driver for TestDriver {
		fn open(&mut self, setup: &mut NetifSetup, _env: &DriverEnv) -> utils::error::Result {
			setup.kind = NetifType::Ether;
			setup.mtu = ether::ETHER_MTU;
			setup.hwaddr = HwAddr::new(&OUR_MAC);
			Ok(())
		}

		fn close(&mut self) {}

		fn send(&mut self, _env: &DriverEnv) -> utils::error::Result {
			Ok(())
		}
	}

	fn harness() -> (Stack, NetifId) {
		let (mut stack, _net) = Stack::new();

		let id = stack.netif_open("eth0", Box::new(TestDriver)).unwrap();
		stack
			.netif_set_addr(id, OUR_IP, Ipv4Addr::new(255, 255, 255, 0), ipaddr::ANY)
			.unwrap();
		stack.netif_set_active(id).unwrap();

		// Activation emitted a gratuitous ARP; tests start clean.
		assert!(pop_frame(&mut stack, id).is_some());
		(stack, id)
	}

	fn pop_frame(stack: &mut Stack, id: NetifId) -> Option<Vec<u8>> {
		let buf = stack.netifs.get(id).unwrap().sendq.recv(-1)?;
		let mut frame = vec![0; buf.total_size()];
		buf.acc_reset();
		buf.read(&mut frame).unwrap();
		Some(frame)
	}

	fn inject(stack: &mut Stack, id: NetifId, frame: &[u8]) {
		let buf = PktBuf::from_bytes(&stack.pool, frame).unwrap();
		let _ = ether::recv(stack, id, buf);
	}

	fn eth_frame(dst: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
		let mut frame = Vec::new();
		frame.extend_from_slice(&dst);
		frame.extend_from_slice(&src);
		frame.extend_from_slice(&ethertype.to_be_bytes());
		frame.extend_from_slice(payload);
		frame
	}

	/// IPv4 header + payload with a valid header checksum.
	fn ip_pkt(
		src: Ipv4Addr,
		dst: Ipv4Addr,
		proto: u8,
		id: u16,
		frag_units: u16,
		more: bool,
		payload: &[u8],
	) -> Vec<u8> {
		let mut hdr = [0u8; 20];
		hdr[0] = 0x45;
		hdr[2..4].copy_from_slice(&((20 + payload.len()) as u16).to_be_bytes());
		hdr[4..6].copy_from_slice(&id.to_be_bytes());
		let frag = (u16::from(more) << 13) | frag_units;
		hdr[6..8].copy_from_slice(&frag.to_be_bytes());
		hdr[8] = 64;
		hdr[9] = proto;
		hdr[12..16].copy_from_slice(&src.octets());
		hdr[16..20].copy_from_slice(&dst.octets());

		let mut csum = Checksum::new();
		csum.push(&hdr);
		hdr[10..12].copy_from_slice(&csum.fold().to_be_bytes());

		let mut pkt = hdr.to_vec();
		pkt.extend_from_slice(payload);
		pkt
	}

	fn pseudo_sum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, len: usize) -> Checksum {
		let mut csum = Checksum::new();
		csum.push(&src.octets());
		csum.push(&dst.octets());
		csum.push(&[0, proto]);
		csum.push(&(len as u16).to_be_bytes());
		csum
	}

	fn udp_segment(
		src: Ipv4Addr,
		dst: Ipv4Addr,
		src_port: u16,
		dst_port: u16,
		payload: &[u8],
	) -> Vec<u8> {
		let len = 8 + payload.len();
		let mut seg = Vec::with_capacity(len);
		seg.extend_from_slice(&src_port.to_be_bytes());
		seg.extend_from_slice(&dst_port.to_be_bytes());
		seg.extend_from_slice(&(len as u16).to_be_bytes());
		seg.extend_from_slice(&[0, 0]);
		seg.extend_from_slice(payload);

		let mut csum = pseudo_sum(src, dst, ipv4::PROTO_UDP, len);
		csum.push(&seg);
		seg[6..8].copy_from_slice(&csum.fold().to_be_bytes());
		seg
	}

	fn tcp_segment(
		src: Ipv4Addr,
		dst: Ipv4Addr,
		src_port: u16,
		dst_port: u16,
		seq: u32,
		ack: u32,
		flags: u8,
		payload: &[u8],
	) -> Vec<u8> {
		let len = 20 + payload.len();
		let mut seg = Vec::with_capacity(len);
		seg.extend_from_slice(&src_port.to_be_bytes());
		seg.extend_from_slice(&dst_port.to_be_bytes());
		seg.extend_from_slice(&seq.to_be_bytes());
		seg.extend_from_slice(&ack.to_be_bytes());
		seg.push(0x50);
		seg.push(flags);
		seg.extend_from_slice(&4096u16.to_be_bytes());
		seg.extend_from_slice(&[0, 0]);
		seg.extend_from_slice(&[0, 0]);
		seg.extend_from_slice(payload);

		let mut csum = pseudo_sum(src, dst, ipv4::PROTO_TCP, len);
		csum.push(&seg);
		seg[16..18].copy_from_slice(&csum.fold().to_be_bytes());
		seg
	}

	/// Resolves PEER_IP in the cache by injecting an ARP reply.
	fn resolve_peer(stack: &mut Stack, id: NetifId) {
		let mut arp = Vec::new();
		arp.extend_from_slice(&[0, 1, 0x08, 0, 6, 4, 0, 2]);
		arp.extend_from_slice(&PEER_MAC);
		arp.extend_from_slice(&PEER_IP.octets());
		arp.extend_from_slice(&OUR_MAC);
		arp.extend_from_slice(&OUR_IP.octets());

		let frame = eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_ARP, &arp);
		inject(stack, id, &frame);
	}

	#[test]
	fn echo_request_is_answered() {
		let (mut stack, id) = harness();
		// Learn the peer's MAC so the reply does not stall in ARP.
		resolve_peer(&mut stack, id);

		// Echo request, identifier 0x1234, sequence 7, payload "hello".
		let mut icmp = vec![8, 0, 0, 0, 0x12, 0x34, 0x00, 0x07];
		icmp.extend_from_slice(b"hello");
		let mut csum = Checksum::new();
		csum.push(&icmp);
		icmp[2..4].copy_from_slice(&csum.fold().to_be_bytes());

		let pkt = ip_pkt(PEER_IP, OUR_IP, ipv4::PROTO_ICMPV4, 9, 0, false, &icmp);
		inject(&mut stack, id, &eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &pkt));

		let frame = pop_frame(&mut stack, id).expect("echo reply");
		assert_eq!(&frame[0..6], &PEER_MAC);
		assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), ether::ETHERTYPE_IPV4);

		let ip = &frame[14..];
		assert_eq!(&ip[12..16], &OUR_IP.octets());
		assert_eq!(&ip[16..20], &PEER_IP.octets());

		let reply = &ip[20..33];
		assert_eq!(reply[0], 0);
		assert_eq!(reply[1], 0);
		assert_eq!(&reply[4..8], &[0x12, 0x34, 0x00, 0x07]);
		assert_eq!(&reply[8..], b"hello");

		// The ICMP checksum verifies.
		let mut csum = Checksum::new();
		csum.push(reply);
		assert_eq!(csum.fold(), 0);
	}

	#[test]
	fn arp_resolves_then_sends() {
		let (mut stack, id) = harness();
		let target = Ipv4Addr::new(192, 168, 1, 10);

		let fd = stack.sock_create(AF_INET, SOCK_DGRAM, 0).unwrap();
		let Op::Done(sent) = stack
			.sock_sendto(fd, b"query", target, 53)
			.unwrap()
		else {
			panic!("udp sendto blocked")
		};
		assert_eq!(sent, 5);

		// The datagram is parked; an ARP request went out instead.
		let frame = pop_frame(&mut stack, id).expect("arp request");
		assert_eq!(&frame[0..6], &[0xFF; 6]);
		assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), ether::ETHERTYPE_ARP);
		let arp = &frame[14..];
		assert_eq!(u16::from_be_bytes([arp[6], arp[7]]), 1);
		assert_eq!(&arp[18..24], &[0; 6]);
		assert_eq!(&arp[24..28], &target.octets());
		assert!(pop_frame(&mut stack, id).is_none());

		// The reply releases the pending datagram to the resolved MAC.
		let mut reply = Vec::new();
		reply.extend_from_slice(&[0, 1, 0x08, 0, 6, 4, 0, 2]);
		reply.extend_from_slice(&PEER_MAC);
		reply.extend_from_slice(&target.octets());
		reply.extend_from_slice(&OUR_MAC);
		reply.extend_from_slice(&OUR_IP.octets());
		inject(&mut stack, id, &eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_ARP, &reply));

		let frame = pop_frame(&mut stack, id).expect("released datagram");
		assert_eq!(&frame[0..6], &PEER_MAC);
		assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), ether::ETHERTYPE_IPV4);
		let ip = &frame[14..];
		assert_eq!(ip[9], ipv4::PROTO_UDP);
		assert_eq!(u16::from_be_bytes([ip[22], ip[23]]), 53);

		// A second send goes straight out, no new resolution.
		stack.sock_sendto(fd, b"again", target, 53).unwrap();
		let frame = pop_frame(&mut stack, id).expect("direct datagram");
		assert_eq!(&frame[0..6], &PEER_MAC);
		assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), ether::ETHERTYPE_IPV4);
		assert!(pop_frame(&mut stack, id).is_none());
	}

	/// Opens a connection up to the point where our SYN is on the wire.
	/// Returns the fd, the connection key and the ISN read off the frame.
	fn open_syn_sent(stack: &mut Stack, id: NetifId) -> (i32, usize, u32) {
		resolve_peer(stack, id);

		let fd = stack.sock_create(AF_INET, SOCK_STREAM, 0).unwrap();
		let key = stack.socks.fd_key(fd).unwrap();

		let Op::Wait(..) = stack.sock_connect(fd, PEER_IP, 80).unwrap() else {
			panic!("connect finished without a handshake")
		};

		let frame = pop_frame(stack, id).expect("syn frame");
		let ip = &frame[14..];
		let seg = &ip[20..];
		// SYN alone.
		assert_eq!(seg[13], 0x02);
		let isn = u32::from_be_bytes([seg[4], seg[5], seg[6], seg[7]]);

		let state = tcp::with(stack, key, |_, t| t.state).unwrap();
		assert_eq!(state, tcp::TcpState::SynSent);

		(fd, key, isn)
	}

	#[test]
	fn tcp_three_way_handshake() {
		let (mut stack, id) = harness();
		let (fd, key, isn) = open_syn_sent(&mut stack, id);

		let our_port = stack.socks.socks[key].base.local_port;
		let seg = tcp_segment(PEER_IP, OUR_IP, 80, our_port, 1000, isn.wrapping_add(1), 0x12, b"");
		let pkt = ip_pkt(PEER_IP, OUR_IP, ipv4::PROTO_TCP, 1, 0, false, &seg);
		inject(&mut stack, id, &eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &pkt));

		// The third leg acknowledges the peer's ISN + 1.
		let frame = pop_frame(&mut stack, id).expect("handshake ack");
		let seg = &frame[14 + 20..];
		assert_eq!(seg[13], 0x10);
		assert_eq!(u32::from_be_bytes([seg[4], seg[5], seg[6], seg[7]]), isn.wrapping_add(1));
		assert_eq!(u32::from_be_bytes([seg[8], seg[9], seg[10], seg[11]]), 1001);

		assert_eq!(
			tcp::with(&mut stack, key, |_, t| t.state).unwrap(),
			tcp::TcpState::Established
		);

		// The send window stays ordered: isn ≤ una ≤ nxt.
		tcp::with(&mut stack, key, |_, t| {
			assert!(tcp::seq_before_eq(t.snd.isn, t.snd.una));
			assert!(tcp::seq_before_eq(t.snd.una, t.snd.nxt));
		})
		.unwrap();

		// The parked connect call would now come back successful.
		let Op::Done(()) = stack.sock_connect(fd, PEER_IP, 80).unwrap() else {
			panic!("connect still blocked")
		};
	}

	#[test]
	fn tcp_rst_on_bad_ack_in_syn_sent() {
		let (mut stack, id) = harness();
		let (_fd, key, isn) = open_syn_sent(&mut stack, id);

		let our_port = stack.socks.socks[key].base.local_port;
		let bad_ack = isn.wrapping_sub(50);
		let seg = tcp_segment(PEER_IP, OUR_IP, 80, our_port, 1, bad_ack, 0x10, b"");
		let pkt = ip_pkt(PEER_IP, OUR_IP, ipv4::PROTO_TCP, 2, 0, false, &seg);
		inject(&mut stack, id, &eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &pkt));

		// The reset mirrors the offending ACK as its sequence, no ACK flag.
		let frame = pop_frame(&mut stack, id).expect("rst frame");
		let seg = &frame[14 + 20..];
		assert_eq!(seg[13], 0x04);
		assert_eq!(u32::from_be_bytes([seg[4], seg[5], seg[6], seg[7]]), bad_ack);

		// The connection keeps waiting for a real answer.
		assert_eq!(
			tcp::with(&mut stack, key, |_, t| t.state).unwrap(),
			tcp::TcpState::SynSent
		);
	}

	#[test]
	fn tcp_data_fin_and_close_wait() {
		let (mut stack, id) = harness();
		let (fd, key, isn) = open_syn_sent(&mut stack, id);
		let our_port = stack.socks.socks[key].base.local_port;

		// Finish the handshake.
		let seg = tcp_segment(PEER_IP, OUR_IP, 80, our_port, 1000, isn.wrapping_add(1), 0x12, b"");
		let pkt = ip_pkt(PEER_IP, OUR_IP, ipv4::PROTO_TCP, 1, 0, false, &seg);
		inject(&mut stack, id, &eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &pkt));
		pop_frame(&mut stack, id).expect("handshake ack");

		// In-order data advances rcv.nxt and is acknowledged.
		let seg = tcp_segment(PEER_IP, OUR_IP, 80, our_port, 1001, isn.wrapping_add(1), 0x18, b"abc");
		let pkt = ip_pkt(PEER_IP, OUR_IP, ipv4::PROTO_TCP, 2, 0, false, &seg);
		inject(&mut stack, id, &eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &pkt));

		let frame = pop_frame(&mut stack, id).expect("data ack");
		let seg = &frame[14 + 20..];
		assert_eq!(u32::from_be_bytes([seg[8], seg[9], seg[10], seg[11]]), 1004);

		let Op::Done(data) = stack.sock_recv(fd, 100).unwrap() else {
			panic!("data not delivered")
		};
		assert_eq!(data, b"abc");

		// Out-of-order data is dropped and the expected sequence re-acked.
		let seg = tcp_segment(PEER_IP, OUR_IP, 80, our_port, 2000, isn.wrapping_add(1), 0x18, b"zzz");
		let pkt = ip_pkt(PEER_IP, OUR_IP, ipv4::PROTO_TCP, 3, 0, false, &seg);
		inject(&mut stack, id, &eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &pkt));
		let frame = pop_frame(&mut stack, id).expect("re-ack");
		let seg = &frame[14 + 20..];
		assert_eq!(u32::from_be_bytes([seg[8], seg[9], seg[10], seg[11]]), 1004);

		// FIN moves us to CLOSE_WAIT and the reader sees EOF.
		let seg = tcp_segment(PEER_IP, OUR_IP, 80, our_port, 1004, isn.wrapping_add(1), 0x11, b"");
		let pkt = ip_pkt(PEER_IP, OUR_IP, ipv4::PROTO_TCP, 4, 0, false, &seg);
		inject(&mut stack, id, &eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &pkt));
		pop_frame(&mut stack, id).expect("fin ack");

		assert_eq!(
			tcp::with(&mut stack, key, |_, t| t.state).unwrap(),
			tcp::TcpState::CloseWait
		);

		let Op::Done(data) = stack.sock_recv(fd, 100).unwrap() else {
			panic!("eof not delivered")
		};
		assert!(data.is_empty());
	}

	#[test]
	fn tcp_rst_aborts_established() {
		let (mut stack, id) = harness();
		let (fd, key, isn) = open_syn_sent(&mut stack, id);
		let our_port = stack.socks.socks[key].base.local_port;

		let seg = tcp_segment(PEER_IP, OUR_IP, 80, our_port, 1000, isn.wrapping_add(1), 0x12, b"");
		let pkt = ip_pkt(PEER_IP, OUR_IP, ipv4::PROTO_TCP, 1, 0, false, &seg);
		inject(&mut stack, id, &eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &pkt));
		pop_frame(&mut stack, id).expect("handshake ack");

		let seg = tcp_segment(PEER_IP, OUR_IP, 80, our_port, 1001, isn.wrapping_add(1), 0x14, b"");
		let pkt = ip_pkt(PEER_IP, OUR_IP, ipv4::PROTO_TCP, 2, 0, false, &seg);
		inject(&mut stack, id, &eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &pkt));

		assert_eq!(
			tcp::with(&mut stack, key, |_, t| t.state).unwrap(),
			tcp::TcpState::Closed
		);
		// Later calls surface the reset until close.
		assert_eq!(stack.sock_recv(fd, 10).err(), Some(NetError::Reset));
	}

	#[test]
	fn fragments_reassemble_into_one_datagram() {
		let (mut stack, id) = harness();

		let fd = stack.sock_create(AF_INET, SOCK_DGRAM, 0).unwrap();
		stack.sock_bind(fd, ipaddr::ANY, 7777).unwrap();

		let payload: Vec<u8> = (0..392).map(|i| (i % 251) as u8).collect();
		let segment = udp_segment(PEER_IP, OUR_IP, 5353, 7777, &payload);

		// Three fragments at 8-byte units 0, 23 and 46; only the last has
		// MF clear. Delivered out of order for good measure.
		let parts = [
			(0u16, true, &segment[0..184]),
			(23, true, &segment[184..368]),
			(46, false, &segment[368..]),
		];

		for &(units, more, chunk) in [&parts[1], &parts[0], &parts[2]] {
			let pkt = ip_pkt(PEER_IP, OUR_IP, ipv4::PROTO_UDP, 0x1111, units, more, chunk);
			inject(&mut stack, id, &eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &pkt));
		}

		assert!(stack.frags.is_empty(), "entry lingers after reassembly");

		let Op::Done((data, src, src_port)) = stack.sock_recvfrom(fd, 1000).unwrap() else {
			panic!("datagram not delivered")
		};
		assert_eq!(data, payload);
		assert_eq!(src, PEER_IP);
		assert_eq!(src_port, 5353);
	}

	#[test]
	fn tcp_passive_open() {
		let (mut stack, id) = harness();
		resolve_peer(&mut stack, id);

		let fd = stack.sock_create(AF_INET, SOCK_STREAM, 0).unwrap();
		stack.sock_bind(fd, ipaddr::ANY, 8080).unwrap();
		stack.sock_listen(fd).unwrap();
		let key = stack.socks.fd_key(fd).unwrap();

		// SYN from the peer.
		let seg = tcp_segment(PEER_IP, OUR_IP, 4444, 8080, 500, 0, 0x02, b"");
		let pkt = ip_pkt(PEER_IP, OUR_IP, ipv4::PROTO_TCP, 1, 0, false, &seg);
		inject(&mut stack, id, &eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &pkt));

		// Answered with SYN|ACK acknowledging the peer's ISN + 1.
		let frame = pop_frame(&mut stack, id).expect("syn ack");
		let seg = &frame[14 + 20..];
		assert_eq!(seg[13], 0x12);
		assert_eq!(u32::from_be_bytes([seg[8], seg[9], seg[10], seg[11]]), 501);
		let isn = u32::from_be_bytes([seg[4], seg[5], seg[6], seg[7]]);

		assert_eq!(
			tcp::with(&mut stack, key, |_, t| t.state).unwrap(),
			tcp::TcpState::SynRcvd
		);

		// A duplicate SYN repeats the SYN|ACK verbatim; the send window must
		// not move for a retransmit.
		let seg = tcp_segment(PEER_IP, OUR_IP, 4444, 8080, 500, 0, 0x02, b"");
		let pkt = ip_pkt(PEER_IP, OUR_IP, ipv4::PROTO_TCP, 9, 0, false, &seg);
		inject(&mut stack, id, &eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &pkt));

		let frame = pop_frame(&mut stack, id).expect("repeated syn ack");
		let seg = &frame[14 + 20..];
		assert_eq!(seg[13], 0x12);
		assert_eq!(u32::from_be_bytes([seg[4], seg[5], seg[6], seg[7]]), isn);
		tcp::with(&mut stack, key, |_, t| {
			assert_eq!(t.snd.nxt, isn.wrapping_add(1));
		})
		.unwrap();

		// The final leg of the handshake.
		let seg = tcp_segment(PEER_IP, OUR_IP, 4444, 8080, 501, isn.wrapping_add(1), 0x10, b"");
		let pkt = ip_pkt(PEER_IP, OUR_IP, ipv4::PROTO_TCP, 2, 0, false, &seg);
		inject(&mut stack, id, &eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &pkt));

		assert_eq!(
			tcp::with(&mut stack, key, |_, t| t.state).unwrap(),
			tcp::TcpState::Established
		);
	}

	#[test]
	fn chan_driver_echoes_through_the_worker() {
		use std::time::Duration;

		use crate::drivers::ChanDriver;

		let (mut stack, _net) = Stack::new();

		let (driver, inject_tx, tap_rx) = ChanDriver::new(OUR_MAC);
		let id = stack.netif_open("eth0", Box::new(driver)).unwrap();
		stack
			.netif_set_addr(id, OUR_IP, Ipv4Addr::new(255, 255, 255, 0), ipaddr::ANY)
			.unwrap();
		stack.netif_set_active(id).unwrap();
		stack.start();

		// The activation announcement comes out of the writer thread.
		let frame = tap_rx.recv_timeout(Duration::from_secs(2)).expect("gratuitous arp");
		assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), ether::ETHERTYPE_ARP);

		// Teach the stack the peer's MAC, then ping it.
		let mut arp = Vec::new();
		arp.extend_from_slice(&[0, 1, 0x08, 0, 6, 4, 0, 2]);
		arp.extend_from_slice(&PEER_MAC);
		arp.extend_from_slice(&PEER_IP.octets());
		arp.extend_from_slice(&OUR_MAC);
		arp.extend_from_slice(&OUR_IP.octets());
		inject_tx
			.send(eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_ARP, &arp))
			.unwrap();

		let mut icmp = vec![8, 0, 0, 0, 0, 1, 0, 1];
		icmp.extend_from_slice(b"worker");
		let mut csum = Checksum::new();
		csum.push(&icmp);
		icmp[2..4].copy_from_slice(&csum.fold().to_be_bytes());
		let pkt = ip_pkt(PEER_IP, OUR_IP, ipv4::PROTO_ICMPV4, 77, 0, false, &icmp);
		inject_tx
			.send(eth_frame(OUR_MAC, PEER_MAC, ether::ETHERTYPE_IPV4, &pkt))
			.unwrap();

		let frame = tap_rx.recv_timeout(Duration::from_secs(2)).expect("echo reply");
		assert_eq!(&frame[0..6], &PEER_MAC);
		let ip = &frame[14..];
		assert_eq!(ip[9], ipv4::PROTO_ICMPV4);
		assert_eq!(ip[20], 0);
		assert_eq!(&ip[28..34], b"worker");
	}

	#[test]
	fn udp_echo_over_loopback_worker() {
		let (mut stack, net) = Stack::new();

		let id = stack.netif_open("loop", Box::new(LoopDriver)).unwrap();
		stack
			.netif_set_addr(
				id,
				Ipv4Addr::new(127, 0, 0, 1),
				Ipv4Addr::new(255, 0, 0, 0),
				ipaddr::ANY,
			)
			.unwrap();
		stack.netif_set_active(id).unwrap();
		stack.start();

		let server = net.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
		net.bind(server, api::SockAddrIn::new(Ipv4Addr::new(127, 0, 0, 1), 9000))
			.unwrap();

		let client = net.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
		let dst = api::SockAddrIn::new(Ipv4Addr::new(127, 0, 0, 1), 9000);
		assert_eq!(net.sendto(client, b"ping", 0, dst).unwrap(), 4);

		let mut buf = [0u8; 16];
		let (n, from) = net.recvfrom(server, &mut buf, 0).unwrap();
		assert_eq!(&buf[..n], b"ping");
		assert_eq!(from.addr(), Ipv4Addr::new(127, 0, 0, 1));

		// Echo it back to the client's ephemeral port.
		assert_eq!(net.sendto(server, &buf[..n], 0, from).unwrap(), 4);
		let (n, _) = net.recvfrom(client, &mut buf, 0).unwrap();
		assert_eq!(&buf[..n], b"ping");

		net.close(client).unwrap();
		net.close(server).unwrap();
	}

	#[test]
	fn recv_timeout_is_honored() {
		let (stack, net) = Stack::new();
		stack.start();

		let fd = net.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
		net.setsockopt(fd, api::SOL_SOCKET, api::SO_RCVTIMEO, 30).unwrap();

		let mut buf = [0u8; 8];
		assert_eq!(
			net.recvfrom(fd, &mut buf, 0).err(),
			Some(NetError::Timeout)
		);
	}
}
