use core::fmt;
use core::result;

/// The error taxonomy shared by every layer of the stack.
///
/// Protocol engines drop malformed or transient failures after logging them;
/// only the application-facing calls surface these values to callers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NetError {
	/// A host primitive failed (thread spawn, poisoned lock).
	Sys,
	/// A pool or buffer allocation came up empty.
	Mem,
	/// A bounded queue refused the message.
	Full,
	/// A non-blocking operation found nothing to do.
	WouldBlock,
	/// The caller-specified deadline elapsed.
	Timeout,
	/// A length was impossible for the operation.
	Size,
	/// Bad argument from the caller.
	Param,
	/// The input failed validation: checksum, length, flag combination.
	Broken,
	/// A packet the current protocol state cannot accept.
	Proto,
	/// The peer reset the connection.
	Reset,
	/// No route, or address resolution gave up.
	Unreachable,
	/// The socket or connection is closed on this side.
	Closed,
	/// The peer closed; no more data will arrive.
	Eof,
	/// The binding already exists.
	Exist,
	/// The operation started correctly but the caller must park on its
	/// wait object until the worker finishes it.
	NeedWait,
}

impl fmt::Display for NetError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			NetError::Sys => "system primitive failed",
			NetError::Mem => "out of pool memory",
			NetError::Full => "queue full",
			NetError::WouldBlock => "would block",
			NetError::Timeout => "timed out",
			NetError::Size => "impossible size",
			NetError::Param => "bad parameter",
			NetError::Broken => "malformed input",
			NetError::Proto => "protocol violation",
			NetError::Reset => "connection reset",
			NetError::Unreachable => "destination unreachable",
			NetError::Closed => "closed",
			NetError::Eof => "end of stream",
			NetError::Exist => "already in use",
			NetError::NeedWait => "wait required",
		};

		f.write_str(name)
	}
}

pub type Result<T = (), E = NetError> = result::Result<T, E>;
