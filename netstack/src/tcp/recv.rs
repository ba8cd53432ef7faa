//! The receive path: segment validation, demux and in-order delivery.

use std::net::Ipv4Addr;

use log::{debug, warn};
use utils::error::{NetError, Result};

use crate::pktbuf::PktBuf;
use crate::sock::{Op, WAIT_RECV};
use crate::{ipv4, tools, Stack};

use super::{send, state, with, Info, TcpHdr, TcpState, TCP_HDR_SIZE};

/// First gate for every inbound segment: checksum, length sanity, ports and
/// flags. Failures drop silently.
fn check(buf: &PktBuf, hdr: &TcpHdr, src: Ipv4Addr, dst: Ipv4Addr) -> Result {
	if hdr.csum != 0 && tools::checksum_pseudo(buf, src, dst, ipv4::PROTO_TCP)? != 0 {
		warn!("tcp checksum mismatch");
		return Err(NetError::Broken);
	}

	if hdr.hdr_len < TCP_HDR_SIZE || hdr.hdr_len > buf.total_size() {
		warn!("tcp header length impossible");
		return Err(NetError::Broken);
	}

	if hdr.src_port == 0 || hdr.dst_port == 0 {
		warn!("tcp segment with a zero port");
		return Err(NetError::Broken);
	}

	if !hdr.f.any() {
		warn!("tcp segment with no flags");
		return Err(NetError::Broken);
	}

	Ok(())
}

/// A SYN may carry the peer's maximum segment size.
fn parse_mss(buf: &PktBuf, hdr: &TcpHdr) -> Option<u16> {
	let mut opts = [0u8; 40];
	let len = hdr.hdr_len - TCP_HDR_SIZE;
	if len == 0 {
		return None;
	}

	buf.seek(TCP_HDR_SIZE).ok()?;
	buf.read(&mut opts[..len]).ok()?;

	let mut at = 0;
	while at < len {
		match opts[at] {
			// End of options.
			0 => return None,
			1 => at += 1,
			2 if at + 4 <= len && opts[at + 1] == 4 => {
				return Some(u16::from_be_bytes([opts[at + 2], opts[at + 3]]));
			}
			_ => {
				let step = *opts.get(at + 1)? as usize;
				if step < 2 {
					return None;
				}
				at += step;
			}
		}
	}

	None
}

/// Entry from IPv4: `buf` holds the TCP segment.
pub fn recv(stack: &mut Stack, src: Ipv4Addr, dst: Ipv4Addr, buf: PktBuf) -> Result {
	if buf.total_size() < TCP_HDR_SIZE {
		warn!("tcp segment too small");
		return Err(NetError::Broken);
	}

	buf.set_cont(TCP_HDR_SIZE)?;
	buf.seek(0)?;
	let mut raw = [0; TCP_HDR_SIZE];
	buf.read(&mut raw)?;
	let hdr = TcpHdr::decode(&raw);

	check(&buf, &hdr, src, dst)?;

	if hdr.hdr_len > TCP_HDR_SIZE {
		buf.set_cont(hdr.hdr_len.min(buf.total_size()))?;
	}
	let mss = hdr.f.syn.then(|| parse_mss(&buf, &hdr)).flatten();

	let data_len = (buf.total_size() - hdr.hdr_len) as u32;
	let mut info = Info {
		local_ip: dst,
		remote_ip: src,
		seq: hdr.seq,
		seq_len: data_len + u32::from(hdr.f.syn) + u32::from(hdr.f.fin),
		data_len,
		hdr,
		buf,
	};

	let Some(key) = super::find(stack, &info) else {
		debug!(
			"no connection for {}:{} -> :{}",
			src, info.hdr.src_port, info.hdr.dst_port
		);
		if !info.hdr.f.rst {
			send::send_reset(stack, &info)?;
		}
		return Ok(());
	};

	if let Some(mss) = mss {
		with(stack, key, |_, tcp| tcp.mss = tcp.mss.min(mss as usize))?;
	}

	state::handle(stack, key, &mut info)
}

/// In-order data (and FIN) intake. Out-of-order segments are dropped and the
/// expected sequence re-acknowledged. Returns whether a FIN was consumed.
pub(crate) fn recv_data(stack: &mut Stack, key: usize, info: &mut Info) -> Result<bool> {
	let hdr_len = info.hdr.hdr_len;

	let (fin, need_ack) = with(stack, key, |base, tcp| -> Result<(bool, bool)> {
		if info.seq != tcp.rcv.nxt {
			debug!(
				"segment seq {} while expecting {}, re-acking",
				info.seq, tcp.rcv.nxt
			);
			return Ok((false, info.seq_len > 0));
		}

		let mut advanced = 0;
		if info.data_len > 0 {
			info.buf.header_remove(hdr_len)?;
			info.buf.seek(0)?;
			let wrote = tcp.rcv.buf.write_from_pktbuf(&info.buf, info.data_len as usize)?;
			tcp.rcv.nxt = tcp.rcv.nxt.wrapping_add(wrote as u32);
			advanced = wrote as u32;
		}

		// The FIN sequences after the payload; only a full intake reaches it.
		let mut fin = false;
		if info.hdr.f.fin && advanced == info.data_len {
			tcp.rcv.nxt = tcp.rcv.nxt.wrapping_add(1);
			tcp.rcv.fin_rcvd = true;
			fin = true;
		}

		if advanced > 0 || fin {
			base.wakeup(WAIT_RECV, Ok(()));
		}

		Ok((fin, advanced > 0 || fin))
	})??;

	if need_ack {
		send::send_ack(stack, key)?;
	}

	Ok(fin)
}

/// Application read: drain the ring, report EOF after a consumed FIN, or
/// park on the receive wait.
pub(crate) fn recv_app(stack: &mut Stack, key: usize, max: usize) -> Result<Op<Vec<u8>>> {
	with(stack, key, |base, tcp| {
		if tcp.rcv.buf.count() > 0 {
			let n = tcp.rcv.buf.count().min(max);
			let mut out = vec![0; n];
			tcp.rcv.buf.read(&mut out);
			return Ok(Op::Done(out));
		}

		if tcp.rcv.fin_rcvd {
			// Peer closed and everything before the FIN was drained.
			return Ok(Op::Done(Vec::new()));
		}

		match tcp.state {
			TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {
				let wait = base.recv_wait.clone().ok_or(NetError::Sys)?;
				Ok(Op::Wait(wait, base.recv_tmo))
			}
			_ => Err(NetError::Closed),
		}
	})?
}
