/// Wire-order integer wrappers.
pub mod endian;
/// Error taxonomy and result alias shared by the whole stack.
pub mod error;
