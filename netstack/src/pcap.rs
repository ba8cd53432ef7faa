//! Frame capture to the classic pcap file format.
//!
//! <https://wiki.wireshark.org/Development/LibpcapFileFormat>

use std::fs::File;
use std::io::Write as _;
use std::time::SystemTime;

use log::warn;
use utils::error::{NetError, Result};

const SNAPLEN: u32 = u32::MAX;

/// Data link type. See <https://www.tcpdump.org/linktypes.html>
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Linktype(pub u32);

impl Linktype {
	/// IEEE 802.3 Ethernet.
	pub const ETHERNET: Self = Self(1);
}

pub struct Writer {
	file: File,
}

impl Writer {
	/// Creates the capture file and writes the global header.
	pub fn new(path: &str) -> Result<Self> {
		let mut file = File::create(path).map_err(|err| {
			warn!("Unable to create pcap file: {err}");
			NetError::Sys
		})?;

		let mut header = Vec::with_capacity(24);
		// Nanosecond-resolution magic, native byte order.
		header.extend_from_slice(&0xA1B2_3C4Du32.to_ne_bytes());
		// Version 2.4.
		header.extend_from_slice(&2u16.to_ne_bytes());
		header.extend_from_slice(&4u16.to_ne_bytes());
		// thiszone and sigfigs are zero in practice.
		header.extend_from_slice(&0i32.to_ne_bytes());
		header.extend_from_slice(&0u32.to_ne_bytes());
		header.extend_from_slice(&SNAPLEN.to_ne_bytes());
		header.extend_from_slice(&Linktype::ETHERNET.0.to_ne_bytes());

		file.write_all(&header).map_err(|err| {
			warn!("Could not write pcap header: {err}");
			NetError::Sys
		})?;

		Ok(Self { file })
	}

	/// Appends one frame with the current timestamp.
	pub fn log(&mut self, packet: &[u8]) -> Result {
		let timestamp = SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.map_err(|_| NetError::Sys)?;

		let packet_len: u32 = packet.len().try_into().map_err(|_| NetError::Size)?;
		let incl_len = packet_len.min(SNAPLEN);

		let mut record = Vec::with_capacity(16 + incl_len as usize);
		record.extend_from_slice(&(timestamp.as_secs() as u32).to_ne_bytes());
		record.extend_from_slice(&timestamp.subsec_nanos().to_ne_bytes());
		record.extend_from_slice(&incl_len.to_ne_bytes());
		record.extend_from_slice(&packet_len.to_ne_bytes());
		record.extend_from_slice(&packet[..incl_len as usize]);

		self.file.write_all(&record).map_err(|err| {
			warn!("Unable to append to pcap file: {err}");
			NetError::Sys
		})?;

		Ok(())
	}
}
