//! Network interface registry.
//!
//! An interface couples a driver (the raw-frame adapter, abstracted behind
//! [`Driver`]) with a link layer chosen by type tag. The driver side touches
//! only the two bounded queues and the shared packet pool; every other field
//! belongs to the worker.

use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{info, warn};
use utils::error::{NetError, Result};

use collections::fixq::Fixq;

use crate::exmsg::MsgSender;
use crate::pktbuf::{PktBuf, PktPool};
use crate::{arp, cfg, ether, ipaddr, ipv4, Stack};

pub type NetifId = usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NetifType {
	None,
	Ether,
	Loop,
	Wifi,
	Ppp,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NetifState {
	Closed,
	Opened,
	Active,
}

/// Hardware address with an explicit valid length.
#[derive(Clone, Copy, Default)]
pub struct HwAddr {
	pub bytes: [u8; cfg::NETIF_HWADDR_SIZE],
	pub len: usize,
}

impl HwAddr {
	pub fn new(addr: &[u8]) -> Self {
		let mut bytes = [0; cfg::NETIF_HWADDR_SIZE];
		let len = addr.len().min(cfg::NETIF_HWADDR_SIZE);
		bytes[..len].copy_from_slice(&addr[..len]);
		Self { bytes, len }
	}

	/// The six-byte MAC for Ethernet interfaces.
	pub fn mac(&self) -> [u8; 6] {
		let mut mac = [0; 6];
		mac.copy_from_slice(&self.bytes[..6]);
		mac
	}
}

/// Everything a driver may hold on to: the interface's queues, the shared
/// pool, and the exchange handle for posting receive notifications.
#[derive(Clone)]
pub struct DriverEnv {
	pub id: NetifId,
	pub recvq: Arc<Fixq<PktBuf>>,
	pub sendq: Arc<Fixq<PktBuf>>,
	pub pool: PktPool,
	pub msgs: MsgSender,
}

/// Link parameters a driver fills in while opening.
pub struct NetifSetup {
	pub kind: NetifType,
	pub mtu: usize,
	pub hwaddr: HwAddr,
}

/// The raw-frame adapter seam.
///
/// `open` picks the link type, sets the hardware parameters and may spawn
/// reader/writer threads around the queues in [`DriverEnv`]. `send` is the
/// worker's kick after it queued a frame on `sendq`; thread-backed drivers
/// ignore it.
pub trait Driver: Send {
	fn open(&mut self, setup: &mut NetifSetup, env: &DriverEnv) -> Result;
	fn close(&mut self);
	fn send(&mut self, env: &DriverEnv) -> Result;
}

pub struct Netif {
	pub name: String,
	pub hwaddr: HwAddr,
	pub ipaddr: Ipv4Addr,
	pub netmask: Ipv4Addr,
	pub gateway: Ipv4Addr,
	pub kind: NetifType,
	pub mtu: usize,
	pub state: NetifState,
	pub recvq: Arc<Fixq<PktBuf>>,
	pub sendq: Arc<Fixq<PktBuf>>,
	pub(crate) driver: Option<Box<dyn Driver>>,
	pub(crate) env: DriverEnv,
}

/// The fixed interface table plus the default-route interface choice.
pub struct Netifs {
	slots: Vec<Option<Netif>>,
	default_id: Option<NetifId>,
}

impl Netifs {
	pub fn new() -> Self {
		let mut slots = Vec::with_capacity(cfg::NETIF_MAX_CNT);
		slots.resize_with(cfg::NETIF_MAX_CNT, || None);
		Self { slots, default_id: None }
	}

	pub fn get(&self, id: NetifId) -> Option<&Netif> {
		self.slots.get(id).and_then(|slot| slot.as_ref())
	}

	pub fn get_mut(&mut self, id: NetifId) -> Option<&mut Netif> {
		self.slots.get_mut(id).and_then(|slot| slot.as_mut())
	}

	pub fn default_id(&self) -> Option<NetifId> {
		self.default_id
	}

	pub fn iter(&self) -> impl Iterator<Item = (NetifId, &Netif)> {
		self.slots
			.iter()
			.enumerate()
			.filter_map(|(id, slot)| slot.as_ref().map(|netif| (id, netif)))
	}
}

impl Default for Netifs {
	fn default() -> Self {
		Self::new()
	}
}

impl Stack {
	/// Opens an interface slot around `driver`.
	pub fn netif_open(&mut self, name: &str, mut driver: Box<dyn Driver>) -> Result<NetifId> {
		if name.is_empty() || name.len() >= cfg::NETIF_NAME_SIZE {
			return Err(NetError::Param);
		}

		let id = self
			.netifs
			.slots
			.iter()
			.position(|slot| slot.is_none())
			.ok_or(NetError::Mem)?;

		let env = DriverEnv {
			id,
			recvq: Arc::new(Fixq::new(cfg::NETIF_RECV_BUFSIZE)),
			sendq: Arc::new(Fixq::new(cfg::NETIF_SEND_BUFSIZE)),
			pool: self.pool.clone(),
			msgs: self.msgs.clone(),
		};

		let mut setup = NetifSetup {
			kind: NetifType::None,
			mtu: 0,
			hwaddr: HwAddr::default(),
		};

		driver.open(&mut setup, &env)?;
		if setup.kind == NetifType::None {
			warn!("{name}: driver left the interface typeless");
			driver.close();
			return Err(NetError::Param);
		}

		self.netifs.slots[id] = Some(Netif {
			name: name.into(),
			hwaddr: setup.hwaddr,
			ipaddr: ipaddr::ANY,
			netmask: ipaddr::ANY,
			gateway: ipaddr::ANY,
			kind: setup.kind,
			mtu: setup.mtu,
			state: NetifState::Opened,
			recvq: Arc::clone(&env.recvq),
			sendq: Arc::clone(&env.sendq),
			driver: Some(driver),
			env,
		});

		info!("{name}: opened as netif {id}");
		Ok(id)
	}

	pub fn netif_set_addr(
		&mut self,
		id: NetifId,
		ip: Ipv4Addr,
		mask: Ipv4Addr,
		gateway: Ipv4Addr,
	) -> Result {
		let netif = self.netifs.get_mut(id).ok_or(NetError::Param)?;
		netif.ipaddr = ip;
		netif.netmask = mask;
		netif.gateway = gateway;
		Ok(())
	}

	/// Permits traffic: installs the on-link route (and the gateway default
	/// route when configured) and advertises the address with a gratuitous
	/// ARP on Ethernet interfaces.
	pub fn netif_set_active(&mut self, id: NetifId) -> Result {
		let netif = self.netifs.get_mut(id).ok_or(NetError::Param)?;
		if netif.state != NetifState::Opened {
			return Err(NetError::Param);
		}
		netif.state = NetifState::Active;

		let (ip, mask, gateway, kind) = (netif.ipaddr, netif.netmask, netif.gateway, netif.kind);

		if !ipaddr::is_any(ip) {
			self.route_add(ipaddr::network_of(ip, mask), mask, ipaddr::ANY, id)?;
		}
		if !ipaddr::is_any(gateway) {
			self.route_add(ipaddr::ANY, ipaddr::ANY, gateway, id)?;
		}

		if self.netifs.default_id.is_none() {
			self.netifs.default_id = Some(id);
		}

		if kind == NetifType::Ether {
			if let Err(err) = arp::make_gratuitous(self, id) {
				warn!("gratuitous arp failed: {err}");
			}
		}

		Ok(())
	}

	pub fn netif_set_default(&mut self, id: NetifId) -> Result {
		self.netifs.get(id).ok_or(NetError::Param)?;
		self.netifs.default_id = Some(id);
		Ok(())
	}

	pub fn netif_close(&mut self, id: NetifId) -> Result {
		let mut netif = self
			.netifs
			.slots
			.get_mut(id)
			.and_then(Option::take)
			.ok_or(NetError::Param)?;

		if let Some(mut driver) = netif.driver.take() {
			driver.close();
		}

		// Drain whatever the threads left behind; drops return the blocks.
		while netif.recvq.recv(-1).is_some() {}
		while netif.sendq.recv(-1).is_some() {}

		self.routes.remove_netif(id);
		if self.netifs.default_id == Some(id) {
			self.netifs.default_id = None;
		}

		info!("{}: closed", netif.name);
		Ok(())
	}

	/// Hands an IPv4 datagram to `id`'s link layer.
	pub(crate) fn netif_send(&mut self, id: NetifId, dst: Ipv4Addr, buf: PktBuf) -> Result {
		let netif = self.netifs.get(id).ok_or(NetError::Param)?;
		if netif.state != NetifState::Active {
			return Err(NetError::Closed);
		}

		match netif.kind {
			NetifType::Ether => ether::send(self, id, dst, buf),
			NetifType::Loop => self.netif_push_send(id, buf),
			_ => {
				warn!("netif {id}: no link layer for {:?}", netif.kind);
				Err(NetError::Param)
			}
		}
	}

	/// Queues a finished frame on the send queue and schedules the driver's
	/// send hook through a `NETIF_SEND` event (kicking inline when the
	/// exchange queue has no room).
	pub(crate) fn netif_push_send(&mut self, id: NetifId, buf: PktBuf) -> Result {
		let netif = self.netifs.get_mut(id).ok_or(NetError::Param)?;

		if netif.sendq.send(buf, -1).is_err() {
			warn!("{}: send queue full, frame dropped", netif.name);
			return Err(NetError::Full);
		}

		if self.msgs.netif_send(id).is_err() {
			self.driver_kick(id);
		}
		Ok(())
	}

	/// Runs the driver's send hook for `id`.
	pub(crate) fn driver_kick(&mut self, id: NetifId) {
		let Some(netif) = self.netifs.get_mut(id) else { return };
		let env = netif.env.clone();

		if let Some(mut driver) = netif.driver.take() {
			let res = driver.send(&env);

			if let Some(netif) = self.netifs.get_mut(id) {
				netif.driver = Some(driver);
			}

			if let Err(err) = res {
				warn!("netif {id}: driver send failed: {err}");
			}
		}
	}

	/// `NETIF_RECV`: drain the interface's receive queue into the protocol
	/// chain. A chain error means the frame was already dropped.
	pub(crate) fn handle_netif_recv(&mut self, id: NetifId) {
		loop {
			let Some(netif) = self.netifs.get(id) else { return };
			let Some(buf) = netif.recvq.recv(-1) else { return };
			let kind = netif.kind;

			#[cfg(feature = "pcap")]
			self.capture(&buf);

			let res = match kind {
				NetifType::Ether => ether::recv(self, id, buf),
				// Loopback frames carry bare IPv4.
				NetifType::Loop => ipv4::recv(self, id, buf),
				_ => {
					warn!("netif {id}: frame on linkless interface");
					Err(NetError::Param)
				}
			};

			if let Err(err) = res {
				log::debug!("netif {id}: inbound frame dropped: {err}");
			}
		}
	}
}
