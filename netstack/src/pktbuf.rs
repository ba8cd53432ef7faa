//! Block-chained packet buffers.
//!
//! A [`PktBuf`] is a logically contiguous byte sequence carried by a chain of
//! fixed-size blocks. Each block keeps its bytes somewhere inside a
//! [`BLK_SIZE`] payload, so pushing and popping headers moves offsets instead
//! of bytes. Every layer of the stack reads and writes through the buffer's
//! cursor; nothing below the socket layer copies a payload.
//!
//! Blocks and buffer headers come from a shared [`PktPool`] with thread
//! locking, because NIC threads allocate on ingress while the worker
//! allocates on egress. A buffer handle is move-only; [`PktBuf::share`]
//! clones the handle and bumps the reference count, and the last handle to
//! drop returns every block to the pool.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use utils::error::{NetError, Result};

use collections::pool::{LockMode, Pool};

use crate::cfg;
use crate::tools::Checksum;

pub const BLK_SIZE: usize = cfg::PKTBUF_BLK_SIZE;

/// Placement policy for [`PktBuf::header_add`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddMode {
	/// The new header must land in a single block.
	Cont,
	/// The new header may straddle blocks.
	Uncont,
}

struct Blk {
	/// Start of the data region inside `payload`.
	off: usize,
	/// Bytes of data held.
	len: usize,
	payload: [u8; BLK_SIZE],
}

impl Blk {
	fn new() -> Self {
		Self { off: 0, len: 0, payload: [0; BLK_SIZE] }
	}

	fn tail_room(&self) -> usize {
		BLK_SIZE - self.off - self.len
	}
}

struct PoolInner {
	blks: Pool<Blk>,
	/// Buffer-header budget; one unit per live buffer.
	hdrs: Pool<()>,
}

/// Shared handle to the block and buffer pools.
#[derive(Clone)]
pub struct PktPool {
	inner: Arc<PoolInner>,
}

impl PktPool {
	pub fn new() -> Self {
		Self::with_counts(cfg::PKTBUF_BLK_CNT, cfg::PKTBUF_BUF_CNT)
	}

	pub fn with_counts(blk_cnt: usize, buf_cnt: usize) -> Self {
		Self {
			inner: Arc::new(PoolInner {
				blks: Pool::new(LockMode::Thread, blk_cnt, Blk::new),
				hdrs: Pool::new(LockMode::Thread, buf_cnt, || ()),
			}),
		}
	}

	pub fn free_blks(&self) -> usize {
		self.inner.blks.free_count()
	}

	pub fn free_bufs(&self) -> usize {
		self.inner.hdrs.free_count()
	}
}

impl Default for PktPool {
	fn default() -> Self {
		Self::new()
	}
}

struct Body {
	total: usize,
	blks: VecDeque<Blk>,
	/// Cursor: absolute offset plus its block/in-block decomposition.
	pos: usize,
	blk: usize,
	blk_off: usize,
}

impl Body {
	/// Parks the cursor at offset zero.
	fn reset(&mut self) {
		self.pos = 0;
		self.blk = 0;
		self.blk_off = 0;
	}

	fn seek(&mut self, off: usize) -> Result {
		if off > self.total {
			return Err(NetError::Param);
		}

		self.pos = off;
		self.blk = 0;
		self.blk_off = 0;

		let mut left = off;
		while left > 0 {
			let len = self.blks[self.blk].len;
			if left < len {
				self.blk_off = left;
				break;
			}
			left -= len;
			self.blk += 1;
		}

		Ok(())
	}

	/// Runs `f` over the next `n` data bytes, block piece by block piece,
	/// advancing the cursor.
	fn walk(&mut self, n: usize, mut f: impl FnMut(&mut [u8])) -> Result {
		if n > self.total - self.pos {
			return Err(NetError::Size);
		}

		let mut left = n;
		while left > 0 {
			let blk = &mut self.blks[self.blk];
			let take = (blk.len - self.blk_off).min(left);
			let start = blk.off + self.blk_off;

			f(&mut blk.payload[start..start + take]);

			left -= take;
			self.pos += take;
			self.blk_off += take;
			if self.blk_off == blk.len {
				self.blk += 1;
				self.blk_off = 0;
			}
		}

		Ok(())
	}
}

pub struct PktBuf {
	/// `None` only after `into_body` has consumed the handle.
	body: Option<Arc<Mutex<Body>>>,
	pool: PktPool,
}

impl PktBuf {
	/// Allocates a buffer of `size` logical bytes.
	///
	/// The chain is filled from the back: every block but the first carries a
	/// full [`BLK_SIZE`], and the first holds the remainder flush against its
	/// payload end, leaving the front slack that later header pushes consume.
	pub fn alloc(pool: &PktPool, size: usize) -> Result<PktBuf> {
		pool.inner.hdrs.alloc(-1).map_err(|_| NetError::Mem)?;

		let nblks = size.div_ceil(BLK_SIZE);
		let mut blks = VecDeque::with_capacity(nblks);

		for i in 0..nblks {
			let mut blk = match pool.inner.blks.alloc(-1) {
				Ok(blk) => blk,
				Err(_) => {
					// Give back what was taken and fail whole.
					for blk in blks {
						pool.inner.blks.free(blk);
					}
					pool.inner.hdrs.free(());
					return Err(NetError::Mem);
				}
			};

			blk.len = if i == 0 {
				size - (nblks - 1) * BLK_SIZE
			} else {
				BLK_SIZE
			};
			blk.off = BLK_SIZE - blk.len;

			blks.push_back(blk);
		}

		Ok(PktBuf {
			body: Some(Arc::new(Mutex::new(Body {
				total: size,
				blks,
				pos: 0,
				blk: 0,
				blk_off: 0,
			}))),
			pool: pool.clone(),
		})
	}

	/// Allocates a buffer holding a copy of `data`, cursor at zero.
	pub fn from_bytes(pool: &PktPool, data: &[u8]) -> Result<PktBuf> {
		let buf = PktBuf::alloc(pool, data.len())?;
		buf.write(data)?;
		buf.acc_reset();
		Ok(buf)
	}

	fn body(&self) -> MutexGuard<'_, Body> {
		self.body
			.as_ref()
			.expect("live buffer")
			.lock()
			.expect("pktbuf lock")
	}

	/// Second handle to the same buffer; bumps the reference count.
	pub fn share(&self) -> PktBuf {
		PktBuf {
			body: self.body.clone(),
			pool: self.pool.clone(),
		}
	}

	pub fn ref_count(&self) -> usize {
		Arc::strong_count(self.body.as_ref().expect("live buffer"))
	}

	fn same_body(&self, other: &PktBuf) -> bool {
		match (&self.body, &other.body) {
			(Some(a), Some(b)) => Arc::ptr_eq(a, b),
			_ => false,
		}
	}

	/// Takes the body out, failing on a shared buffer. Frees the header
	/// budget; the caller owns the blocks.
	fn into_body(mut self) -> Result<Body> {
		let arc = self.body.take().expect("live buffer");

		match Arc::try_unwrap(arc) {
			Ok(mutex) => {
				self.pool.inner.hdrs.free(());
				Ok(mutex.into_inner().expect("pktbuf lock"))
			}
			Err(arc) => {
				self.body = Some(arc);
				Err(NetError::Param)
			}
		}
	}

	pub fn total_size(&self) -> usize {
		self.body().total
	}

	pub fn blk_count(&self) -> usize {
		self.body().blks.len()
	}

	/// Reserves `n` bytes at the logical front.
	pub fn header_add(&self, n: usize, mode: AddMode) -> Result {
		let mut body = self.body();

		match mode {
			AddMode::Cont => {
				if n > BLK_SIZE {
					return Err(NetError::Size);
				}

				let fits = match body.blks.front_mut() {
					Some(front) if front.off >= n => {
						front.off -= n;
						front.len += n;
						true
					}
					_ => false,
				};

				if !fits {
					let mut blk = self.pool.inner.blks.alloc(-1).map_err(|_| NetError::Mem)?;
					blk.off = BLK_SIZE - n;
					blk.len = n;
					body.blks.push_front(blk);
				}
			}
			AddMode::Uncont => {
				let mut left = n;

				if let Some(front) = body.blks.front_mut() {
					let take = left.min(front.off);
					front.off -= take;
					front.len += take;
					left -= take;
				}

				while left > 0 {
					let mut blk = self.pool.inner.blks.alloc(-1).map_err(|_| NetError::Mem)?;
					let take = left.min(BLK_SIZE);
					blk.off = BLK_SIZE - take;
					blk.len = take;
					body.blks.push_front(blk);
					left -= take;
				}
			}
		}

		body.total += n;
		body.reset();
		Ok(())
	}

	/// Advances the logical front past `n` bytes, releasing drained blocks.
	pub fn header_remove(&self, n: usize) -> Result {
		let mut body = self.body();

		if n > body.total {
			return Err(NetError::Param);
		}

		let mut left = n;
		while left > 0 {
			let front = &mut body.blks[0];
			let take = left.min(front.len);
			front.off += take;
			front.len -= take;
			left -= take;

			if front.len == 0 {
				let blk = body.blks.pop_front().expect("front exists");
				self.pool.inner.blks.free(blk);
			}
		}

		body.total -= n;
		body.reset();
		Ok(())
	}

	/// Grows at the tail (new bytes logically owned, contents unspecified)
	/// or shrinks by dropping tail bytes.
	pub fn resize(&self, new_size: usize) -> Result {
		let mut body = self.body();

		if new_size > body.total {
			let mut grow = new_size - body.total;

			if let Some(back) = body.blks.back_mut() {
				let take = grow.min(back.tail_room());
				back.len += take;
				grow -= take;
			}

			while grow > 0 {
				let mut blk = self.pool.inner.blks.alloc(-1).map_err(|_| NetError::Mem)?;
				let take = grow.min(BLK_SIZE);
				blk.off = 0;
				blk.len = take;
				body.blks.push_back(blk);
				grow -= take;
			}
		} else {
			let mut cut = body.total - new_size;

			while cut > 0 {
				let back = body.blks.back_mut().expect("cut bounded by total");
				let take = cut.min(back.len);
				back.len -= take;
				cut -= take;

				if back.len == 0 {
					let blk = body.blks.pop_back().expect("back exists");
					self.pool.inner.blks.free(blk);
				}
			}
		}

		body.total = new_size;
		body.reset();
		Ok(())
	}

	/// Transfers every block of `src` to the tail of `self` and releases the
	/// `src` header. Fails on a shared `src`.
	pub fn join(&self, src: PktBuf) -> Result {
		if self.same_body(&src) {
			return Err(NetError::Param);
		}

		let mut donor = src.into_body()?;
		let mut body = self.body();

		body.total += donor.total;
		while let Some(blk) = donor.blks.pop_front() {
			body.blks.push_back(blk);
		}

		body.reset();
		Ok(())
	}

	/// Guarantees the first `n` bytes live in one block, compacting into the
	/// front block as needed.
	pub fn set_cont(&self, n: usize) -> Result {
		let mut body = self.body();

		if n > body.total {
			return Err(NetError::Param);
		}
		if n > BLK_SIZE {
			return Err(NetError::Size);
		}
		if n == 0 || body.blks[0].len >= n {
			return Ok(());
		}

		let mut front = body.blks.pop_front().expect("total > 0");

		// Slide the front data to the payload start so the block can take
		// bytes from its successors.
		front.payload.copy_within(front.off..front.off + front.len, 0);
		front.off = 0;

		while front.len < n {
			let mut next = body.blks.pop_front().expect("n bounded by total");
			let take = (n - front.len).min(next.len);

			let (dst, src) = (front.len, next.off);
			front.payload[dst..dst + take].copy_from_slice(&next.payload[src..src + take]);
			front.len += take;
			next.off += take;
			next.len -= take;

			if next.len == 0 {
				self.pool.inner.blks.free(next);
			} else {
				body.blks.push_front(next);
				break;
			}
		}

		body.blks.push_front(front);
		body.reset();
		Ok(())
	}

	/// Parks the cursor at offset zero.
	pub fn acc_reset(&self) {
		self.body().reset();
	}

	pub fn seek(&self, off: usize) -> Result {
		self.body().seek(off)
	}

	pub fn pos(&self) -> usize {
		self.body().pos
	}

	pub fn remaining(&self) -> usize {
		let body = self.body();
		body.total - body.pos
	}

	/// Copies bytes out at the cursor, advancing it.
	pub fn read(&self, out: &mut [u8]) -> Result {
		let mut done = 0;
		self.body().walk(out.len(), |chunk| {
			out[done..done + chunk.len()].copy_from_slice(chunk);
			done += chunk.len();
		})
	}

	/// Copies bytes in at the cursor, advancing it.
	pub fn write(&self, data: &[u8]) -> Result {
		let mut done = 0;
		self.body().walk(data.len(), |chunk| {
			chunk.copy_from_slice(&data[done..done + chunk.len()]);
			done += chunk.len();
		})
	}

	/// Writes `n` copies of `byte` at the cursor, advancing it.
	pub fn fill(&self, byte: u8, n: usize) -> Result {
		self.body().walk(n, |chunk| chunk.fill(byte))
	}

	/// Copies `n` bytes from `src`'s cursor to `self`'s cursor, advancing
	/// both.
	pub fn copy_from(&self, src: &PktBuf, n: usize) -> Result {
		if self.same_body(src) {
			return Err(NetError::Param);
		}

		let mut tmp = [0u8; 64];
		let mut left = n;
		while left > 0 {
			let take = left.min(tmp.len());
			src.read(&mut tmp[..take])?;
			self.write(&tmp[..take])?;
			left -= take;
		}

		Ok(())
	}

	/// One's-complement sum of the next `n` bytes starting at the cursor.
	///
	/// `init` seeds the accumulator (pseudo-header sums chain through here);
	/// `take_back` restores the cursor afterwards. Returns the folded
	/// complement, so verifying data that includes its checksum field yields
	/// zero.
	pub fn checksum16(&self, n: usize, init: u32, take_back: bool) -> Result<u16> {
		let mut body = self.body();
		let saved = body.pos;

		let mut csum = Checksum::with(init);
		body.walk(n, |chunk| csum.push(chunk))?;

		if take_back {
			body.seek(saved)?;
		}

		Ok(csum.fold())
	}
}

impl Drop for PktBuf {
	fn drop(&mut self) {
		let Some(arc) = self.body.take() else { return };

		// Only the final handle tears the buffer down.
		if let Ok(mutex) = Arc::try_unwrap(arc) {
			let mut body = mutex.into_inner().expect("pktbuf lock");
			while let Some(blk) = body.blks.pop_front() {
				self.pool.inner.blks.free(blk);
			}
			self.pool.inner.hdrs.free(());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tools::Checksum;

	fn pattern(n: usize) -> Vec<u8> {
		(0..n).map(|i| (i * 7 + 3) as u8).collect()
	}

	#[test]
	fn alloc_shapes_the_chain() {
		let pool = PktPool::with_counts(16, 4);

		let buf = PktBuf::alloc(&pool, 300).unwrap();
		assert_eq!(buf.total_size(), 300);
		assert_eq!(buf.blk_count(), 3);

		let empty = PktBuf::alloc(&pool, 0).unwrap();
		assert_eq!(empty.blk_count(), 0);
	}

	#[test]
	fn drop_returns_everything() {
		let pool = PktPool::with_counts(8, 2);

		{
			let a = PktBuf::alloc(&pool, 256).unwrap();
			let b = a.share();
			assert_eq!(a.ref_count(), 2);
			assert_eq!(pool.free_blks(), 6);
			assert_eq!(pool.free_bufs(), 1);
			drop(a);
			// One handle left; blocks still held.
			assert_eq!(pool.free_blks(), 6);
			drop(b);
		}

		assert_eq!(pool.free_blks(), 8);
		assert_eq!(pool.free_bufs(), 2);
	}

	#[test]
	fn write_then_read_round_trips() {
		let pool = PktPool::with_counts(16, 2);
		let buf = PktBuf::alloc(&pool, 1000).unwrap();

		let data = pattern(1000);
		buf.write(&data).unwrap();
		buf.acc_reset();

		let mut out = vec![0; 1000];
		buf.read(&mut out).unwrap();
		assert_eq!(out, data);
	}

	#[test]
	fn seek_and_partial_read() {
		let pool = PktPool::with_counts(16, 2);
		let buf = PktBuf::from_bytes(&pool, &pattern(400)).unwrap();

		buf.seek(130).unwrap();
		let mut out = [0; 10];
		buf.read(&mut out).unwrap();
		assert_eq!(out[..], pattern(400)[130..140]);
		assert_eq!(buf.pos(), 140);

		// Reading past the end fails and leaves the cursor alone.
		buf.seek(395).unwrap();
		assert_eq!(buf.read(&mut out), Err(NetError::Size));
		assert_eq!(buf.pos(), 395);
	}

	#[test]
	fn header_push_pop_round_trip() {
		let pool = PktPool::with_counts(32, 2);
		let buf = PktBuf::from_bytes(&pool, &pattern(1000)).unwrap();

		// Two continuous and two straddling headers, popped in reverse.
		for (n, mode) in [
			(20, AddMode::Cont),
			(8, AddMode::Uncont),
			(14, AddMode::Cont),
			(20, AddMode::Uncont),
		] {
			buf.header_add(n, mode).unwrap();
		}
		assert_eq!(buf.total_size(), 1062);

		for n in [20, 14, 8, 20] {
			buf.header_remove(n).unwrap();
		}
		assert_eq!(buf.total_size(), 1000);

		let mut out = vec![0; 1000];
		buf.acc_reset();
		buf.read(&mut out).unwrap();
		assert_eq!(out, pattern(1000));
	}

	#[test]
	fn cont_header_lands_in_one_block() {
		let pool = PktPool::with_counts(8, 2);
		// A full block has no front slack.
		let buf = PktBuf::from_bytes(&pool, &pattern(BLK_SIZE)).unwrap();
		assert_eq!(buf.blk_count(), 1);

		buf.header_add(20, AddMode::Cont).unwrap();
		assert_eq!(buf.blk_count(), 2);

		let mut hdr = [0xAB; 20];
		buf.acc_reset();
		buf.write(&hdr).unwrap();
		buf.acc_reset();
		hdr = [0; 20];
		buf.read(&mut hdr).unwrap();
		assert_eq!(hdr, [0xAB; 20]);

		assert!(buf.header_add(BLK_SIZE + 1, AddMode::Cont).is_err());
	}

	#[test]
	fn resize_grows_and_shrinks() {
		let pool = PktPool::with_counts(16, 2);
		let buf = PktBuf::from_bytes(&pool, &pattern(100)).unwrap();

		buf.resize(500).unwrap();
		assert_eq!(buf.total_size(), 500);
		buf.seek(100).unwrap();
		buf.fill(0xEE, 400).unwrap();

		buf.resize(60).unwrap();
		assert_eq!(buf.total_size(), 60);

		let mut out = vec![0; 60];
		buf.acc_reset();
		buf.read(&mut out).unwrap();
		assert_eq!(out, pattern(100)[..60]);
	}

	#[test]
	fn join_transfers_blocks() {
		let pool = PktPool::with_counts(16, 4);
		let a = PktBuf::from_bytes(&pool, &pattern(200)).unwrap();
		let b = PktBuf::from_bytes(&pool, &[0x55; 100]).unwrap();

		let bufs_before = pool.free_bufs();
		a.join(b).unwrap();
		assert_eq!(a.total_size(), 300);
		// The donor header went back to the pool.
		assert_eq!(pool.free_bufs(), bufs_before + 1);

		a.seek(200).unwrap();
		let mut out = [0; 100];
		a.read(&mut out).unwrap();
		assert_eq!(out, [0x55; 100]);
	}

	#[test]
	fn join_rejects_shared_donor() {
		let pool = PktPool::with_counts(16, 4);
		let a = PktBuf::alloc(&pool, 10).unwrap();
		let b = PktBuf::alloc(&pool, 10).unwrap();
		let held = b.share();

		assert_eq!(a.join(b), Err(NetError::Param));
		drop(held);
	}

	#[test]
	fn set_cont_compacts_the_front() {
		let pool = PktPool::with_counts(16, 2);
		let buf = PktBuf::from_bytes(&pool, &pattern(300)).unwrap();

		// The front block holds 300 % 128 = 44 bytes.
		buf.header_remove(4).unwrap();
		buf.set_cont(100).unwrap();

		let mut out = vec![0; 296];
		buf.acc_reset();
		buf.read(&mut out).unwrap();
		assert_eq!(out, pattern(300)[4..]);

		assert!(buf.set_cont(BLK_SIZE + 1).is_err());
	}

	#[test]
	fn checksum_matches_reference() {
		let pool = PktPool::with_counts(16, 2);

		// RFC 1071 worked example.
		let words = [0x00u8, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
		let buf = PktBuf::from_bytes(&pool, &words).unwrap();
		let csum = buf.checksum16(8, 0, true).unwrap();
		assert_eq!(csum, !0xddf2);
		// take_back left the cursor at zero.
		assert_eq!(buf.pos(), 0);

		// Summing data together with its checksum verifies to zero.
		let mut framed = words.to_vec();
		framed.extend_from_slice(&csum.to_be_bytes());
		let buf = PktBuf::from_bytes(&pool, &framed).unwrap();
		assert_eq!(buf.checksum16(10, 0, false).unwrap(), 0);
	}

	#[test]
	fn checksum_spans_blocks_and_odd_lengths() {
		let pool = PktPool::with_counts(16, 2);
		let data = pattern(301);

		let buf = PktBuf::from_bytes(&pool, &data).unwrap();
		let split = buf.checksum16(301, 0, false).unwrap();

		// Reference: plain one's-complement sum over a flat slice.
		let mut csum = Checksum::new();
		csum.push(&data);
		assert_eq!(split, csum.fold());
	}

	#[test]
	fn exhaustion_reports_mem() {
		let pool = PktPool::with_counts(2, 8);
		assert_eq!(
			PktBuf::alloc(&pool, 3 * BLK_SIZE).err(),
			Some(NetError::Mem)
		);
		// The failed alloc leaked nothing.
		assert_eq!(pool.free_blks(), 2);
		assert_eq!(pool.free_bufs(), 8);
	}
}
