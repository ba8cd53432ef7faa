//! Bundled drivers: the loopback interface and a channel-backed driver that
//! stands in for a capture adapter in tests and demos.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use log::{debug, warn};
use utils::error::Result;

use crate::netif::{Driver, DriverEnv, HwAddr, NetifSetup, NetifType};
use crate::pktbuf::PktBuf;

/// The loopback interface: frames queued for sending reappear on the receive
/// queue on the next `NETIF_SEND` dispatch.
pub struct LoopDriver;

impl Driver for LoopDriver {
	fn open(&mut self, setup: &mut NetifSetup, _env: &DriverEnv) -> Result {
		setup.kind = NetifType::Loop;
		setup.mtu = 65535;
		Ok(())
	}

	fn close(&mut self) {}

	fn send(&mut self, env: &DriverEnv) -> Result {
		while let Some(buf) = env.sendq.recv(-1) {
			if env.recvq.send(buf, -1).is_err() {
				warn!("loop: receive queue full, frame dropped");
				continue;
			}
			let _ = env.msgs.netif_recv(env.id);
		}

		Ok(())
	}
}

/// An Ethernet driver over a pair of in-process channels.
///
/// Frames pushed into the inject sender appear on the wire side of the
/// interface; everything the stack transmits comes out of the tap receiver.
/// `open` spawns the same reader/writer thread pair a capture adapter would.
pub struct ChanDriver {
	mac: [u8; 6],
	wire_rx: Option<Receiver<Vec<u8>>>,
	tap_tx: Option<Sender<Vec<u8>>>,
}

impl ChanDriver {
	/// Returns the driver plus the test-side handles: inject frames with the
	/// sender, observe transmissions with the receiver.
	pub fn new(mac: [u8; 6]) -> (Self, Sender<Vec<u8>>, Receiver<Vec<u8>>) {
		let (inject_tx, wire_rx) = mpsc::channel();
		let (tap_tx, tap_rx) = mpsc::channel();

		let driver = Self {
			mac,
			wire_rx: Some(wire_rx),
			tap_tx: Some(tap_tx),
		};

		(driver, inject_tx, tap_rx)
	}
}

impl Driver for ChanDriver {
	fn open(&mut self, setup: &mut NetifSetup, env: &DriverEnv) -> Result {
		setup.kind = NetifType::Ether;
		setup.mtu = crate::ether::ETHER_MTU;
		setup.hwaddr = HwAddr::new(&self.mac);

		// Reader: frame in, buffer allocated, queued, worker notified.
		let rx = self.wire_rx.take().expect("driver opened once");
		let renv = env.clone();
		thread::spawn(move || {
			for frame in rx.iter() {
				let Ok(buf) = PktBuf::from_bytes(&renv.pool, &frame) else {
					warn!("chan: packet loss, no free buffer");
					continue;
				};

				if renv.recvq.send(buf, 0).is_err() {
					continue;
				}
				let _ = renv.msgs.netif_recv(renv.id);
			}
			debug!("chan: reader thread done");
		});

		// Writer: pops finished frames and injects them.
		let tx = self.tap_tx.take().expect("driver opened once");
		let wenv = env.clone();
		thread::spawn(move || loop {
			let Some(buf) = wenv.sendq.recv(0) else { continue };

			let mut frame = vec![0; buf.total_size()];
			buf.acc_reset();
			if buf.read(&mut frame).is_err() {
				continue;
			}

			if tx.send(frame).is_err() {
				debug!("chan: writer thread done");
				return;
			}
		});

		Ok(())
	}

	fn close(&mut self) {}

	fn send(&mut self, _env: &DriverEnv) -> Result {
		// The writer thread drains the queue on its own.
		Ok(())
	}
}
