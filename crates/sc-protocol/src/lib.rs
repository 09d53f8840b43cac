// sc-protocol: wire message and address types for the snapcomm signalling bus.
//
// This crate is deliberately I/O free.  It knows how to parse and build one
// message line and how to parse, order and classify endpoint addresses; the
// daemon owns every socket.

pub mod address;
pub mod message;

pub use address::{Address, AddressError, NetworkKind};
pub use message::{Message, MessageError};

/// Protocol version exchanged in `CONNECT` and `REGISTER`.
pub const VERSION: i64 = 1;

/// Messages with an empty target service, or this one, are addressed to the
/// local daemon itself.
pub const DAEMON_SERVICE: &str = "snapcommunicator";
