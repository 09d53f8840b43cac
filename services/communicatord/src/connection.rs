//! Per-connection state shared by every connection kind.
//!
//! The router owns all connections by value, keyed by [`ConnectionId`];
//! everything else refers to a connection through its id.  The kind is a
//! plain enum rather than a class hierarchy: shared behavior lives in
//! [`ConnectionState`] and the router matches on the kind where variants
//! differ.

use std::collections::BTreeSet;
use std::fmt;

use sc_protocol::Address;

/// Stable identifier of one connection, unique for the daemon's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What kind of endpoint sits behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Accepted on the local listener; becomes a named service on `REGISTER`.
    LocalService,
    /// Accepted on the remote listener; a peer daemon that dialed us.
    RemotePeer,
    /// Outbound, persistent connection to a smaller-addressed peer.
    PeerDialer,
    /// Outbound, one-shot connection whose only job is to deliver `GOSSIP`.
    GossipDialer,
}

/// Outbound dialer bookkeeping: where to dial and how long to wait before
/// trying again.  Realized as one-shot timeout dates on the event loop.
#[derive(Debug, Clone)]
pub struct DialerState {
    pub address: Address,
    /// Current retry delay in microseconds; doubles on failure.
    pub wait: i64,
    pub connected: bool,
    /// Peer dialers stay disabled until the supervisor has sent `SERVICES`.
    pub enabled: bool,
}

/// Initial peer-dialer retry delay.
pub const DIALER_FIRST_WAIT: i64 = 5_000_000;
/// Retry delays stop doubling at one hour.
pub const DIALER_MAX_WAIT: i64 = 3_600_000_000;
/// Backoff applied when a peer answers `CONNECT` with `REFUSE`.
pub const DIALER_TOO_BUSY_WAIT: i64 = 24 * 3_600_000_000;
/// A gossip dialer sits idle this long before its first attempt.
pub const GOSSIP_FIRST_WAIT: i64 = 5_000_000;

impl DialerState {
    pub fn new(address: Address, enabled: bool) -> Self {
        Self {
            address,
            wait: DIALER_FIRST_WAIT,
            connected: false,
            enabled,
        }
    }

    /// Double the retry delay, saturating at the one hour cap.
    pub fn back_off(&mut self) {
        self.wait = (self.wait * 2).min(DIALER_MAX_WAIT);
    }
}

/// State every connection carries, whatever its kind.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    name: String,
    server_name: String,
    /// Empty until the handshake completes; `"client"` for local services,
    /// otherwise the peer's declared server types.
    types: String,
    services: BTreeSet<String>,
    services_heard_of: BTreeSet<String>,
    commands: BTreeSet<String>,
    started_at: i64,
    ended_at: i64,
    remote: bool,
    named: bool,
    address: Option<Address>,
}

impl ConnectionState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_name: String::new(),
            types: String::new(),
            services: BTreeSet::new(),
            services_heard_of: BTreeSet::new(),
            commands: BTreeSet::new(),
            started_at: -1,
            ended_at: -1,
            remote: false,
            named: false,
            address: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn set_server_name(&mut self, name: impl Into<String>) {
        self.server_name = name.into();
    }

    /// The connection types; an empty string marks a connection that has not
    /// completed its handshake.
    pub fn connection_types(&self) -> &str {
        &self.types
    }

    pub fn set_connection_types(&mut self, types: impl Into<String>) {
        self.types = types.into();
    }

    pub fn is_up(&self) -> bool {
        !self.types.is_empty()
    }

    pub fn services(&self) -> &BTreeSet<String> {
        &self.services
    }

    /// Merge a comma-separated list into the offered-services set.
    pub fn set_services(&mut self, list: &str) {
        merge_list(&mut self.services, list);
    }

    pub fn services_heard_of(&self) -> &BTreeSet<String> {
        &self.services_heard_of
    }

    pub fn set_services_heard_of(&mut self, list: &str) {
        merge_list(&mut self.services_heard_of, list);
    }

    /// Merge a `COMMANDS list=` reply into the understood-commands set.
    pub fn set_commands(&mut self, list: &str) {
        merge_list(&mut self.commands, list);
    }

    /// Whether this connection ever declared its commands.  When it did not,
    /// capability checks have nothing to go on and must be skipped.
    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    pub fn understands_command(&self, command: &str) -> bool {
        self.commands.contains(command)
    }

    pub fn remove_command(&mut self, command: &str) {
        self.commands.remove(command);
    }

    /// Stamp the connection as up.  Starting a new lifetime clears any
    /// previous end stamp.
    pub fn connection_started(&mut self, now: i64) {
        self.started_at = now;
        self.ended_at = -1;
    }

    /// Stamp the connection as down.  Only set once per lifetime, and only
    /// when the connection actually started.
    pub fn connection_ended(&mut self, now: i64) {
        if self.started_at != -1 && self.ended_at == -1 {
            self.ended_at = now;
        }
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    pub fn ended_at(&self) -> i64 {
        self.ended_at
    }

    pub fn mark_as_remote(&mut self) {
        self.remote = true;
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Called once a `REGISTER` gave this connection its real service name;
    /// messages received afterwards are stamped with their origin.
    pub fn mark_named(&mut self) {
        self.named = true;
    }

    pub fn is_named(&self) -> bool {
        self.named
    }

    pub fn clear_named(&mut self) {
        self.named = false;
    }

    pub fn address(&self) -> Option<Address> {
        self.address
    }

    pub fn set_address(&mut self, address: Address) {
        self.address = Some(address);
    }
}

fn merge_list(set: &mut BTreeSet<String>, list: &str) {
    for entry in list.split(',') {
        let entry = entry.trim();
        if !entry.is_empty() {
            set.insert(entry.to_owned());
        }
    }
}
