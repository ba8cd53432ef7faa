//! Datagram reassembly.
//!
//! Partial datagrams live in an LRU-ordered table keyed by
//! `(source, identification)`. Fragments are held sorted by offset; once a
//! contiguous run from zero ends in a fragment without `MF`, the blocks are
//! spliced into one buffer and the datagram continues up the stack. A
//! watchdog ages the table so a lost fragment cannot pin buffers forever.

use std::net::Ipv4Addr;

use log::{debug, warn};
use utils::error::{NetError, Result};

use collections::list::{IndexList, NodeId};

use super::Ipv4Hdr;
use crate::pktbuf::PktBuf;
use crate::{cfg, Stack};

struct Fragment {
	/// Byte offset within the reassembled datagram.
	start: usize,
	more: bool,
	buf: PktBuf,
}

impl Fragment {
	fn end(&self) -> usize {
		self.start + self.buf.total_size()
	}
}

struct Entry {
	src: Ipv4Addr,
	id: u16,
	dst: Ipv4Addr,
	proto: u8,
	/// Watchdog scans left.
	tmo: u32,
	frags: Vec<Fragment>,
}

impl Entry {
	/// Slots the fragment in by offset; overlaps and duplicates are refused.
	fn try_insert(&mut self, frag: Fragment) -> Result {
		let idx = match self.frags.binary_search_by_key(&frag.start, |f| f.start) {
			Ok(_) => return Err(NetError::Broken),
			Err(idx) => idx,
		};

		if let Some(prev) = idx.checked_sub(1).and_then(|i| self.frags.get(i)) {
			if frag.start < prev.end() {
				return Err(NetError::Broken);
			}
		}

		if let Some(next) = self.frags.get(idx) {
			// A final fragment cannot have successors.
			if !frag.more || next.start < frag.end() {
				return Err(NetError::Broken);
			}
		}

		self.frags.insert(idx, frag);
		Ok(())
	}

	/// Whether a contiguous run from offset zero reaches a last fragment.
	fn complete(&self) -> bool {
		let mut expected = 0;

		for frag in &self.frags {
			if frag.start != expected {
				return false;
			}
			expected = frag.end();
		}

		self.frags.last().is_some_and(|last| !last.more)
	}
}

pub struct Table {
	list: IndexList<Entry>,
}

impl Table {
	pub fn new() -> Self {
		Self { list: IndexList::with_capacity(cfg::IPV4_FRAG_ARR_SIZE) }
	}

	fn find(&mut self, src: Ipv4Addr, id: u16) -> Option<NodeId> {
		let node = self
			.list
			.iter()
			.find(|(_, e)| e.src == src && e.id == id)
			.map(|(node, _)| node)?;

		self.list.move_to_front(node);
		Some(node)
	}

	pub fn len(&self) -> usize {
		self.list.len()
	}

	pub fn is_empty(&self) -> bool {
		self.list.is_empty()
	}
}

impl Default for Table {
	fn default() -> Self {
		Self::new()
	}
}

/// Consumes one fragment; delivers the datagram when it completes.
pub fn handle(stack: &mut Stack, hdr: &Ipv4Hdr, buf: PktBuf) -> Result {
	buf.header_remove(hdr.hdr_len)?;

	let frag = Fragment {
		start: hdr.frag_ofst_bytes(),
		more: hdr.more,
		buf,
	};

	let node = match stack.frags.find(hdr.src, hdr.id) {
		Some(node) => node,
		None => {
			// Space pressure drops the least recently touched datagram.
			if stack.frags.list.len() >= cfg::IPV4_FRAG_ARR_SIZE {
				if let Some(old) = stack.frags.list.pop_back() {
					warn!("frag table full, dropping datagram {} id {}", old.src, old.id);
				}
			}

			stack.frags.list.push_front(Entry {
				src: hdr.src,
				id: hdr.id,
				dst: hdr.dst,
				proto: hdr.proto,
				tmo: cfg::IPV4_FRAG_TMO,
				frags: Vec::new(),
			})
		}
	};

	let entry = stack.frags.list.get_mut(node).expect("linked node");
	entry.try_insert(frag)?;

	if !entry.complete() {
		return Ok(());
	}

	let entry = stack.frags.list.remove(node);
	debug!(
		"datagram {} id {} reassembled from {} fragments",
		entry.src,
		entry.id,
		entry.frags.len()
	);

	let mut frags = entry.frags.into_iter();
	let whole = frags.next().expect("complete run is nonempty").buf;
	for frag in frags {
		whole.join(frag.buf)?;
	}

	super::deliver_reassembled(stack, entry.proto, entry.src, entry.dst, whole)
}

/// Watchdog scan: discard reassemblies that ran out of patience.
pub fn on_timer(stack: &mut Stack, _arg: usize) {
	let mut at = stack.frags.list.head();

	while let Some(node) = at {
		at = stack.frags.list.next(node);

		let entry = stack.frags.list.get_mut(node).expect("linked node");
		entry.tmo = entry.tmo.saturating_sub(1);

		if entry.tmo == 0 {
			let entry = stack.frags.list.remove(node);
			warn!("reassembly of {} id {} timed out", entry.src, entry.id);
		}
	}
}
