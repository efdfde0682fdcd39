//! Java Debug Wire Protocol (JDWP) client for permscope.
//!
//! Only the async wire client lives here: the command subset needed to read a
//! suspended thread's stack, inspect and invoke on remote objects, and manage
//! breakpoint and class-prepare requests.

/// Size of the fixed JDWP packet header (length, id, flags, command/error).
pub const JDWP_HEADER_LEN: usize = 11;

/// Largest packet the client accepts before treating the stream as corrupt.
pub const MAX_JDWP_PACKET_BYTES: usize = 16 * 1024 * 1024;

pub mod wire;
