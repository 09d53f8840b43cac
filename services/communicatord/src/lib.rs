// communicatord: one process-to-process signalling daemon per node.
//
// Local services connect over loopback TCP and REGISTER under a name;
// daemons mesh with each other over TCP and route messages to any named
// service anywhere in the cluster.  One-shot signals (STOP, SHUTDOWN)
// arrive over a loopback UDP socket.
//
// The split is reactor/state machine: `reactor` owns sockets, framing and
// timers, `server` owns every connection's protocol state and decides what
// happens; the two meet through `server::Output` commands.

pub mod cache;
pub mod config;
pub mod connection;
pub mod neighbors;
pub mod reactor;
pub mod remote;
pub mod server;

pub use config::{Config, ConfigError};
pub use connection::{ConnectionId, ConnectionKind, ConnectionState};
pub use neighbors::NeighborSet;
pub use reactor::Reactor;
pub use server::{Output, Server};
