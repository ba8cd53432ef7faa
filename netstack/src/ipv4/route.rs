//! The routing table: a fixed-capacity list searched by longest prefix.

use std::net::Ipv4Addr;

use log::{debug, info};
use utils::error::{NetError, Result};

use crate::netif::NetifId;
use crate::{cfg, ipaddr, Stack};

#[derive(Clone, Copy)]
pub struct RouteEntry {
	/// Destination network.
	pub dest: Ipv4Addr,
	pub mask: Ipv4Addr,
	/// Next hop; the unspecified address means the destination is on-link.
	pub next_hop: Ipv4Addr,
	pub netif: NetifId,
}

pub struct Table {
	entries: Vec<RouteEntry>,
}

impl Table {
	pub fn new() -> Self {
		Self { entries: Vec::with_capacity(cfg::ROUTE_MAX_CNT) }
	}

	pub fn add(&mut self, entry: RouteEntry) -> Result {
		// A route to the same network replaces the old one.
		if let Some(old) = self
			.entries
			.iter_mut()
			.find(|e| e.dest == entry.dest && e.mask == entry.mask)
		{
			*old = entry;
			return Ok(());
		}

		if self.entries.len() >= cfg::ROUTE_MAX_CNT {
			return Err(NetError::Mem);
		}

		self.entries.push(entry);
		Ok(())
	}

	pub fn remove(&mut self, dest: Ipv4Addr, mask: Ipv4Addr) {
		self.entries.retain(|e| e.dest != dest || e.mask != mask);
	}

	pub fn remove_netif(&mut self, id: NetifId) {
		self.entries.retain(|e| e.netif != id);
	}

	/// Longest-prefix match over masked comparison.
	pub fn find(&self, dst: Ipv4Addr) -> Option<&RouteEntry> {
		self.entries
			.iter()
			.filter(|e| ipaddr::network_of(dst, e.mask) == e.dest)
			.max_by_key(|e| u32::from(e.mask))
	}
}

impl Default for Table {
	fn default() -> Self {
		Self::new()
	}
}

impl Stack {
	pub fn route_add(
		&mut self,
		dest: Ipv4Addr,
		mask: Ipv4Addr,
		next_hop: Ipv4Addr,
		netif: NetifId,
	) -> Result {
		info!("route add {dest}/{mask} via {next_hop} dev {netif}");
		self.routes.add(RouteEntry { dest, mask, next_hop, netif })
	}

	pub fn route_remove(&mut self, dest: Ipv4Addr, mask: Ipv4Addr) {
		debug!("route remove {dest}/{mask}");
		self.routes.remove(dest, mask);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn longest_prefix_wins() {
		let mut table = Table::new();
		let any = Ipv4Addr::UNSPECIFIED;

		table
			.add(RouteEntry {
				dest: any,
				mask: any,
				next_hop: Ipv4Addr::new(192, 168, 1, 1),
				netif: 0,
			})
			.unwrap();
		table
			.add(RouteEntry {
				dest: Ipv4Addr::new(192, 168, 1, 0),
				mask: Ipv4Addr::new(255, 255, 255, 0),
				next_hop: any,
				netif: 1,
			})
			.unwrap();
		table
			.add(RouteEntry {
				dest: Ipv4Addr::new(127, 0, 0, 0),
				mask: Ipv4Addr::new(255, 0, 0, 0),
				next_hop: any,
				netif: 2,
			})
			.unwrap();

		// On-link beats the default route.
		assert_eq!(table.find(Ipv4Addr::new(192, 168, 1, 7)).unwrap().netif, 1);
		// Off-link traffic falls back to the gateway.
		let via = table.find(Ipv4Addr::new(8, 8, 8, 8)).unwrap();
		assert_eq!(via.netif, 0);
		assert_eq!(via.next_hop, Ipv4Addr::new(192, 168, 1, 1));
		// Loopback has its own net.
		assert_eq!(table.find(Ipv4Addr::new(127, 0, 0, 1)).unwrap().netif, 2);
	}
}
