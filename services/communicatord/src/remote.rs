//! Mesh bookkeeping: which remote daemons we dial and which we only gossip
//! at.
//!
//! Exactly one TCP connection must exist per daemon pair.  The rule is
//! deterministic: the smaller address (per the protocol's total order)
//! dials; the larger side only announces itself with `GOSSIP` and waits for
//! the incoming `CONNECT`.

use std::collections::BTreeMap;

use sc_protocol::Address;

use crate::connection::ConnectionId;

/// What to do about a newly learned neighbor address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshRole {
    /// The address is our own; nothing to do.
    Myself,
    /// Already tracked; nothing to do.
    Known,
    /// Smaller than ours: we initiate, with a persistent peer dialer.
    Dial,
    /// Larger than ours: announce ourselves with a gossip dialer.
    Gossip,
}

#[derive(Debug)]
pub struct RemoteConnections {
    my_address: Address,
    /// Whether the supervisor delivered `SERVICES` yet; peer dialers stay
    /// disabled until then.
    started: bool,
    peers: BTreeMap<Address, ConnectionId>,
    gossips: BTreeMap<Address, ConnectionId>,
}

impl RemoteConnections {
    pub fn new(my_address: Address) -> Self {
        Self {
            my_address,
            started: false,
            peers: BTreeMap::new(),
            gossips: BTreeMap::new(),
        }
    }

    pub fn my_address(&self) -> Address {
        self.my_address
    }

    pub fn classify(&self, address: Address) -> MeshRole {
        if address == self.my_address {
            MeshRole::Myself
        } else if self.peers.contains_key(&address) || self.gossips.contains_key(&address) {
            MeshRole::Known
        } else if address < self.my_address {
            MeshRole::Dial
        } else {
            MeshRole::Gossip
        }
    }

    pub fn insert_peer(&mut self, address: Address, id: ConnectionId) {
        self.peers.insert(address, id);
    }

    pub fn insert_gossip(&mut self, address: Address, id: ConnectionId) {
        self.gossips.insert(address, id);
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.peers.values().copied()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// The gossip dialer aimed at `address`, if any.  A `CONNECT` from that
    /// address means the gossip reached its goal another way.
    pub fn remove_gossip(&mut self, address: Address) -> Option<ConnectionId> {
        self.gossips.remove(&address)
    }

    /// Drain every gossip dialer at once (shutdown path).
    pub fn take_gossips(&mut self) -> Vec<ConnectionId> {
        let ids = self.gossips.values().copied().collect();
        self.gossips.clear();
        ids
    }

    pub fn forget(&mut self, id: ConnectionId) {
        self.peers.retain(|_, v| *v != id);
        self.gossips.retain(|_, v| *v != id);
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn mark_started(&mut self) {
        self.started = true;
    }
}
