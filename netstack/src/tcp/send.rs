//! Segment construction and the transmit path.

use std::net::Ipv4Addr;

use log::{debug, warn};
use utils::error::{NetError, Result};

use crate::pktbuf::PktBuf;
use crate::sock::Op;
use crate::{cfg, ipv4, tools, Stack};

use super::{with, Flags, Info, TcpHdr, TcpState, TCP_HDR_SIZE};

/// Checksums `buf` (header already written, checksum field zero) against the
/// pseudo header and hands it to IPv4.
fn send_segment(stack: &mut Stack, buf: PktBuf, dst: Ipv4Addr, src: Ipv4Addr) -> Result {
	let csum = tools::checksum_pseudo(&buf, src, dst, ipv4::PROTO_TCP)?;
	buf.seek(16)?;
	buf.write(&csum.to_be_bytes())?;

	ipv4::send(stack, ipv4::PROTO_TCP, dst, src, buf)
}

/// Sequence numbers the connection currently has in flight, SYN/FIN
/// included.
fn inflight(tcp: &super::TcpSock) -> usize {
	let seqs = tcp.snd.nxt.wrapping_sub(tcp.snd.una) as usize;
	seqs - usize::from(tcp.syn_send) - usize::from(tcp.fin_send && !tcp.fin_acked)
}

/// Builds and sends the next segment: a pending SYN, pending ring data, or
/// nothing.
pub(crate) fn transmit(stack: &mut Stack, key: usize) -> Result {
	struct Seg {
		src_ip: Ipv4Addr,
		dst_ip: Ipv4Addr,
		hdr: TcpHdr,
		data_off: usize,
		data_len: usize,
	}

	let seg = with(stack, key, |base, tcp| {
		let sent = inflight(tcp);
		let unsent = tcp.snd.buf.count() - sent;

		// A SYN rides only while it has not consumed its sequence number
		// yet; a repeat goes through resend_syn instead.
		let syn = tcp.syn_send && tcp.snd.nxt == tcp.snd.isn;

		// No payload rides before the handshake finishes or after our FIN
		// took its sequence number.
		let window = if tcp.syn_send || tcp.fin_send {
			0
		} else {
			(tcp.peer_win as usize).saturating_sub(sent)
		};
		let data_len = unsent.min(tcp.mss).min(window);

		if !syn && data_len == 0 {
			return None;
		}

		let hdr = TcpHdr {
			src_port: base.local_port,
			dst_port: base.remote_port,
			seq: tcp.snd.nxt,
			ack: if tcp.recv_win_valid { tcp.rcv.nxt } else { 0 },
			hdr_len: TCP_HDR_SIZE,
			f: Flags {
				syn,
				ack: tcp.recv_win_valid,
				psh: data_len > 0,
				..Flags::default()
			},
			win: tcp.rcv.buf.free_cnt().min(cfg::TCP_DEFAULT_WIN as usize) as u16,
			csum: 0,
			urg_ptr: 0,
		};

		// SYN and payload each consume sequence numbers now; there is no
		// roll-back if the send below fails.
		tcp.snd.nxt = tcp
			.snd
			.nxt
			.wrapping_add(u32::from(syn) + data_len as u32);

		Some(Seg {
			src_ip: base.local_ip,
			dst_ip: base.remote_ip,
			hdr,
			data_off: sent,
			data_len,
		})
	})?;

	let Some(seg) = seg else { return Ok(()) };

	let buf = PktBuf::alloc(&stack.pool, TCP_HDR_SIZE + seg.data_len)?;
	buf.seek(0)?;
	buf.write(&seg.hdr.encode())?;

	if seg.data_len > 0 {
		with(stack, key, |_, tcp| {
			tcp.snd.buf.read_to_pktbuf(&buf, seg.data_off, seg.data_len)
		})??;
	}

	send_segment(stack, buf, seg.dst_ip, seg.src_ip)
}

/// Header-only segment carrying `f`, sequenced at `seq` (or `snd.nxt` when
/// `None`). Never moves the send window.
fn send_ctrl(stack: &mut Stack, key: usize, f: Flags, seq: Option<u32>) -> Result {
	let (hdr, src, dst) = with(stack, key, |base, tcp| {
		let hdr = TcpHdr {
			src_port: base.local_port,
			dst_port: base.remote_port,
			seq: seq.unwrap_or(tcp.snd.nxt),
			ack: if f.ack { tcp.rcv.nxt } else { 0 },
			hdr_len: TCP_HDR_SIZE,
			f,
			win: tcp.rcv.buf.free_cnt().min(cfg::TCP_DEFAULT_WIN as usize) as u16,
			csum: 0,
			urg_ptr: 0,
		};
		(hdr, base.local_ip, base.remote_ip)
	})?;

	let buf = PktBuf::alloc(&stack.pool, TCP_HDR_SIZE)?;
	buf.write(&hdr.encode())?;

	send_segment(stack, buf, dst, src)
}

/// Requests a connection: flags the pending SYN and pushes a segment out.
pub(crate) fn send_syn(stack: &mut Stack, key: usize) -> Result {
	with(stack, key, |_, tcp| tcp.syn_send = true)?;
	transmit(stack, key)
}

/// Re-emits a SYN (or SYN|ACK) the peer evidently missed. The repeat reuses
/// the original sequence number; `snd.nxt` stays put.
pub(crate) fn resend_syn(stack: &mut Stack, key: usize) -> Result {
	let (isn, acked) = with(stack, key, |_, tcp| (tcp.snd.isn, tcp.recv_win_valid))?;

	send_ctrl(
		stack,
		key,
		Flags { syn: true, ack: acked, ..Flags::default() },
		Some(isn),
	)
}

/// Acknowledges `rcv.nxt` in a bare segment.
pub(crate) fn send_ack(stack: &mut Stack, key: usize) -> Result {
	send_ctrl(stack, key, Flags { ack: true, ..Flags::default() }, None)
}

/// Starts the local close: FIN|ACK, consuming one sequence number.
pub(crate) fn send_fin(stack: &mut Stack, key: usize) -> Result {
	let acked = with(stack, key, |_, tcp| tcp.recv_win_valid)?;

	send_ctrl(
		stack,
		key,
		Flags { fin: true, ack: acked, ..Flags::default() },
		None,
	)?;

	with(stack, key, |_, tcp| {
		tcp.fin_send = true;
		tcp.snd.nxt = tcp.snd.nxt.wrapping_add(1);
	})
}

/// Answers an unacceptable segment with a reset the peer cannot ignore:
/// mirror its ACK as our sequence, or acknowledge its whole footprint.
pub(crate) fn send_reset(stack: &mut Stack, info: &Info) -> Result {
	let incoming = &info.hdr;

	let mut hdr = TcpHdr {
		src_port: incoming.dst_port,
		dst_port: incoming.src_port,
		seq: 0,
		ack: 0,
		hdr_len: TCP_HDR_SIZE,
		f: Flags { rst: true, ..Flags::default() },
		win: 0,
		csum: 0,
		urg_ptr: 0,
	};

	if incoming.f.ack {
		hdr.seq = incoming.ack;
	} else {
		hdr.f.ack = true;
		hdr.ack = info.seq.wrapping_add(info.seq_len);
	}

	debug!("sending rst to {}:{}", info.remote_ip, incoming.src_port);

	let buf = PktBuf::alloc(&stack.pool, TCP_HDR_SIZE)?;
	buf.write(&hdr.encode())?;

	send_segment(stack, buf, info.remote_ip, info.local_ip)
}

/// Application write: into the ring, then onto the wire.
pub(crate) fn send_data(stack: &mut Stack, key: usize, data: &[u8]) -> Result<Op<usize>> {
	let state = with(stack, key, |_, tcp| tcp.state)?;

	match state {
		TcpState::Established | TcpState::CloseWait => {}
		TcpState::SynSent | TcpState::SynRcvd => return Err(NetError::Closed),
		_ => {
			warn!("send on a closing connection");
			return Err(NetError::Closed);
		}
	}

	let (wrote, wait, tmo) = with(stack, key, |base, tcp| {
		(
			tcp.snd.buf.write(data),
			base.send_wait.clone(),
			base.send_tmo,
		)
	})?;

	if wrote == 0 {
		// Ring full until an ACK frees space.
		return Ok(Op::Wait(wait.ok_or(NetError::Sys)?, tmo));
	}

	transmit(stack, key)?;
	Ok(Op::Done(wrote))
}
