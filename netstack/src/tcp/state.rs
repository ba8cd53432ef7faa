//! The eleven-state machine, dispatched on the connection's current state
//! for every validated inbound segment.

use log::{debug, warn};
use utils::error::{NetError, Result};

use crate::sock::{WAIT_CONN, WAIT_SEND};
use crate::Stack;

use super::{
	recv, send, seq_after, seq_before_eq, seq_between_incl, with, Info, TcpState,
};

pub(crate) fn set_state(stack: &mut Stack, key: usize, state: TcpState) -> Result {
	with(stack, key, |_, tcp| {
		debug!("tcp {} -> {}", tcp.state.name(), state.name());
		tcp.state = state;
	})
}

/// Folds a valid ACK into the send window: the SYN first, then ring bytes,
/// then a pending FIN. Freed ring space wakes blocked senders.
pub(crate) fn ack_process(stack: &mut Stack, key: usize, info: &Info) -> Result {
	with(stack, key, |base, tcp| {
		let hdr = &info.hdr;
		if !hdr.f.ack {
			return Ok(());
		}

		tcp.peer_win = hdr.win;

		let ack = hdr.ack;
		if seq_before_eq(ack, tcp.snd.una) {
			// Nothing new.
			return Ok(());
		}
		if seq_after(ack, tcp.snd.nxt) {
			warn!("ack {} beyond snd.nxt {}", ack, tcp.snd.nxt);
			return Err(NetError::Proto);
		}

		let mut n = ack.wrapping_sub(tcp.snd.una);

		if tcp.syn_send {
			tcp.syn_send = false;
			tcp.snd.una = tcp.snd.una.wrapping_add(1);
			n -= 1;
		}

		let data_acked = (n as usize).min(tcp.snd.buf.count());
		if data_acked > 0 {
			tcp.snd.buf.remove(data_acked);
			tcp.snd.una = tcp.snd.una.wrapping_add(data_acked as u32);
			n -= data_acked as u32;
			base.wakeup(WAIT_SEND, Ok(()));
		}

		if n > 0 && tcp.fin_send && !tcp.fin_acked {
			tcp.fin_acked = true;
			tcp.snd.una = tcp.snd.una.wrapping_add(1);
		}

		Ok(())
	})?
}

/// A reset only counts when it lands inside the receive window (or names the
/// exact expected sequence).
fn rst_acceptable(stack: &mut Stack, key: usize, info: &Info) -> Result<bool> {
	with(stack, key, |_, tcp| {
		let wnd = tcp.rcv.buf.free_cnt() as u32;
		info.seq == tcp.rcv.nxt
			|| seq_between_incl(info.seq, tcp.rcv.nxt, tcp.rcv.nxt.wrapping_add(wnd))
	})
}

pub(crate) fn handle(stack: &mut Stack, key: usize, info: &mut Info) -> Result {
	let state = with(stack, key, |_, tcp| tcp.state)?;

	match state {
		TcpState::Closed => on_closed(stack, key, info),
		TcpState::Listen => on_listen(stack, key, info),
		TcpState::SynSent => on_syn_sent(stack, key, info),
		TcpState::SynRcvd => on_syn_rcvd(stack, key, info),
		TcpState::Established => on_established(stack, key, info),
		TcpState::FinWait1 => on_fin_wait_1(stack, key, info),
		TcpState::FinWait2 => on_fin_wait_2(stack, key, info),
		TcpState::Closing => on_closing(stack, key, info),
		TcpState::TimeWait => on_time_wait(stack, key, info),
		TcpState::CloseWait => on_close_wait(stack, key, info),
		TcpState::LastAck => on_last_ack(stack, key, info),
	}
}

/// An aborted connection still owned by the application swallows stragglers.
fn on_closed(_stack: &mut Stack, _key: usize, _info: &mut Info) -> Result {
	Ok(())
}

/// Passive open: a SYN turns the listener into the connection itself.
fn on_listen(stack: &mut Stack, key: usize, info: &mut Info) -> Result {
	let hdr = info.hdr;

	if hdr.f.rst {
		return Ok(());
	}
	if hdr.f.ack {
		// An ACK cannot precede our SYN.
		return send::send_reset(stack, info);
	}

	if hdr.f.syn {
		with(stack, key, |base, tcp| {
			base.remote_ip = info.remote_ip;
			base.remote_port = hdr.src_port;
			if crate::ipaddr::is_any(base.local_ip) {
				base.local_ip = info.local_ip;
			}

			tcp.rcv.isn = info.seq;
			tcp.rcv.nxt = info.seq.wrapping_add(1);
			tcp.recv_win_valid = true;
			tcp.peer_win = hdr.win;

			let isn = super::pick_isn();
			tcp.snd.isn = isn;
			tcp.snd.una = isn;
			tcp.snd.nxt = isn;
		})?;

		// The pending SYN now rides with an ACK: a SYN|ACK.
		send::send_syn(stack, key)?;
		return set_state(stack, key, TcpState::SynRcvd);
	}

	Ok(())
}

fn on_syn_sent(stack: &mut Stack, key: usize, info: &mut Info) -> Result {
	let hdr = info.hdr;

	if hdr.f.ack {
		let (isn, nxt) = with(stack, key, |_, tcp| (tcp.snd.isn, tcp.snd.nxt))?;

		// The ACK must cover our SYN and nothing we never sent.
		if seq_before_eq(hdr.ack, isn) || seq_after(hdr.ack, nxt) {
			warn!("syn_sent: unacceptable ack");
			return send::send_reset(stack, info);
		}
	}

	if hdr.f.rst {
		if !hdr.f.ack {
			return Ok(());
		}
		debug!("connection refused");
		return super::abort(stack, key, NetError::Reset);
	}

	if hdr.f.syn {
		with(stack, key, |_, tcp| {
			tcp.rcv.isn = info.seq;
			tcp.rcv.nxt = info.seq.wrapping_add(1);
			tcp.recv_win_valid = true;
			tcp.peer_win = hdr.win;
		})?;

		if hdr.f.ack {
			// Third leg of the handshake.
			ack_process(stack, key, info)?;
			send::send_ack(stack, key)?;
			set_state(stack, key, TcpState::Established)?;
			with(stack, key, |base, _| base.wakeup(WAIT_CONN, Ok(())))?;
		} else {
			// Simultaneous open: answer the crossing SYN by repeating ours,
			// now carrying their acknowledgment.
			set_state(stack, key, TcpState::SynRcvd)?;
			send::resend_syn(stack, key)?;
		}
	}

	Ok(())
}

fn on_syn_rcvd(stack: &mut Stack, key: usize, info: &mut Info) -> Result {
	let hdr = info.hdr;

	if hdr.f.rst {
		if rst_acceptable(stack, key, info)? {
			return super::abort(stack, key, NetError::Reset);
		}
		return Ok(());
	}

	if hdr.f.syn {
		// The handshake reply got lost; repeat our SYN|ACK.
		return send::resend_syn(stack, key);
	}

	if hdr.f.ack {
		let nxt = with(stack, key, |_, tcp| tcp.snd.nxt)?;
		if hdr.ack != nxt {
			return send::send_reset(stack, info);
		}

		ack_process(stack, key, info)?;
		set_state(stack, key, TcpState::Established)?;
		with(stack, key, |base, _| base.wakeup(WAIT_CONN, Ok(())))?;

		// The third ACK may already carry data.
		if recv::recv_data(stack, key, info)? {
			set_state(stack, key, TcpState::CloseWait)?;
		}
	}

	Ok(())
}

/// Guards shared by every synchronised state. `Ok(true)` means the segment
/// was consumed (reset or stray SYN).
fn sync_guards(stack: &mut Stack, key: usize, info: &mut Info) -> Result<bool> {
	let hdr = info.hdr;

	if hdr.f.rst {
		if rst_acceptable(stack, key, info)? {
			warn!("connection reset by peer");
			super::abort(stack, key, NetError::Reset)?;
		}
		return Ok(true);
	}

	// A SYN inside a synchronised connection is a hard error.
	if hdr.f.syn {
		warn!("unexpected syn on a synchronised connection");
		send::send_reset(stack, info)?;
		super::abort(stack, key, NetError::Reset)?;
		return Ok(true);
	}

	Ok(false)
}

fn on_established(stack: &mut Stack, key: usize, info: &mut Info) -> Result {
	if sync_guards(stack, key, info)? {
		return Ok(());
	}

	ack_process(stack, key, info)?;
	// The ACK may have opened the window for queued ring data.
	send::transmit(stack, key)?;

	if recv::recv_data(stack, key, info)? {
		// Peer has no more data for us.
		set_state(stack, key, TcpState::CloseWait)?;
	}

	Ok(())
}

fn on_fin_wait_1(stack: &mut Stack, key: usize, info: &mut Info) -> Result {
	if sync_guards(stack, key, info)? {
		return Ok(());
	}

	ack_process(stack, key, info)?;
	let got_fin = recv::recv_data(stack, key, info)?;
	let fin_acked = with(stack, key, |_, tcp| tcp.fin_acked)?;

	match (fin_acked, got_fin) {
		// Both sides done.
		(true, true) => super::time_wait_start(stack, key),
		(true, false) => {
			set_state(stack, key, TcpState::FinWait2)?;
			with(stack, key, |base, _| base.wakeup(WAIT_CONN, Ok(())))
		}
		// Simultaneous close.
		(false, true) => set_state(stack, key, TcpState::Closing),
		(false, false) => Ok(()),
	}
}

fn on_fin_wait_2(stack: &mut Stack, key: usize, info: &mut Info) -> Result {
	if sync_guards(stack, key, info)? {
		return Ok(());
	}

	ack_process(stack, key, info)?;

	if recv::recv_data(stack, key, info)? {
		return super::time_wait_start(stack, key);
	}

	Ok(())
}

fn on_closing(stack: &mut Stack, key: usize, info: &mut Info) -> Result {
	if sync_guards(stack, key, info)? {
		return Ok(());
	}

	ack_process(stack, key, info)?;

	if with(stack, key, |_, tcp| tcp.fin_acked)? {
		return super::time_wait_start(stack, key);
	}

	Ok(())
}

fn on_time_wait(stack: &mut Stack, key: usize, info: &mut Info) -> Result {
	let hdr = info.hdr;

	if hdr.f.rst {
		return Ok(());
	}

	// A retransmitted FIN restarts the quiet period.
	if hdr.f.fin {
		send::send_ack(stack, key)?;
		return super::time_wait_start(stack, key);
	}

	Ok(())
}

fn on_close_wait(stack: &mut Stack, key: usize, info: &mut Info) -> Result {
	if sync_guards(stack, key, info)? {
		return Ok(());
	}

	// The peer said FIN already; only ACKs for our data matter now.
	ack_process(stack, key, info)?;
	send::transmit(stack, key)
}

fn on_last_ack(stack: &mut Stack, key: usize, info: &mut Info) -> Result {
	if sync_guards(stack, key, info)? {
		return Ok(());
	}

	ack_process(stack, key, info)?;

	if with(stack, key, |_, tcp| tcp.fin_acked)? {
		set_state(stack, key, TcpState::Closed)?;
		with(stack, key, |base, _| base.wakeup(WAIT_CONN, Ok(())))?;
	}

	Ok(())
}
