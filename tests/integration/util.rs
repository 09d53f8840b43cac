// Shared harness for the multi-daemon integration suites.
//
// Runs several router state machines fully in memory: outputs of one daemon
// are delivered as inputs of another over simulated links, and dial timers
// are fired by hand.  No sockets are involved, which keeps the scenarios
// deterministic.

#![allow(dead_code)]

use std::path::PathBuf;

use communicatord::server::Output;
use communicatord::{Config, ConnectionId, NeighborSet, Server};
use sc_protocol::{Address, Message};

/// The harness epoch, in microseconds.
pub const T0: i64 = 1_700_000_000_000_000;

pub fn test_config(server_name: &str, my_address: &str, neighbors: &str) -> Config {
    Config {
        server_name: server_name.to_owned(),
        server_types: "backend".to_owned(),
        neighbors: neighbors.to_owned(),
        my_address: Address::parse(my_address, 4040).unwrap(),
        listen: Address::parse(my_address, 4040).unwrap(),
        local_listen: Address::parse("127.0.0.1", 4040).unwrap(),
        signal: Address::parse("127.0.0.1", 4041).unwrap(),
        max_connections: 100,
        max_pending_connections: 10,
        nice: None,
        cache_path: PathBuf::new(),
        supervisor: "supervisor".to_owned(),
        debug: false,
    }
}

pub fn msg(line: &str) -> Message {
    Message::from_wire(line).unwrap()
}

/// One established in-memory TCP link between two daemons.
#[derive(Debug, Clone, Copy)]
pub struct Link {
    pub a: usize,
    pub a_id: ConnectionId,
    pub b: usize,
    pub b_id: ConnectionId,
}

pub struct Cluster {
    pub servers: Vec<Server>,
    pub addrs: Vec<Address>,
    pub links: Vec<Link>,
    /// Messages sent to connections with no link (local services, mostly).
    pub local_out: Vec<(usize, ConnectionId, Message)>,
    /// Daemons that removed their listeners (the shutdown path).
    pub stopped_listeners: Vec<usize>,
    inbox: Vec<(usize, ConnectionId, Message)>,
    timers: Vec<(usize, ConnectionId)>,
    dials: Vec<(usize, ConnectionId, Address)>,
}

impl Cluster {
    /// Build one daemon per `(name, address, neighbors)` entry.
    pub fn new(nodes: &[(&str, &str, &str)]) -> Self {
        let mut servers = Vec::new();
        let mut addrs = Vec::new();
        for (name, addr, neighbors) in nodes {
            let mut server = Server::new(
                test_config(name, addr, neighbors),
                NeighborSet::in_memory(),
            );
            server.initialize(T0);
            servers.push(server);
            addrs.push(Address::parse(addr, 4040).unwrap());
        }
        let mut cluster = Self {
            servers,
            addrs,
            links: Vec::new(),
            local_out: Vec::new(),
            stopped_listeners: Vec::new(),
            inbox: Vec::new(),
            timers: Vec::new(),
            dials: Vec::new(),
        };
        cluster.settle();
        cluster
    }

    /// Tell daemon `i` which services run on its node (its supervisor
    /// speaking), which also releases its peer dialers.
    pub fn start(&mut self, i: usize, services: &str) {
        let supervisor = self.servers[i].accepted_local();
        self.servers[i].message(supervisor, msg(&format!("SERVICES list={services}")));
        self.settle();
    }

    /// Register a local service on daemon `i` and drive the handshake.
    /// Returns the service's connection id, with its mailbox cleared.
    pub fn register(&mut self, i: usize, service: &str, commands: &str) -> ConnectionId {
        let id = self.servers[i].accepted_local();
        self.servers[i].message(id, msg(&format!("REGISTER service={service};version=1")));
        if !commands.is_empty() {
            self.servers[i].message(id, msg(&format!("COMMANDS list={commands}")));
        }
        self.settle();
        self.take_local(i, id);
        id
    }

    /// Deliver queued messages until every daemon is quiet.  Dials and
    /// timers are collected for `form_mesh` instead of acted upon.
    pub fn settle(&mut self) {
        loop {
            for i in 0..self.servers.len() {
                let outputs: Vec<Output> = self.servers[i].drain().collect();
                for output in outputs {
                    match output {
                        Output::Send(id, message) => match self.route(i, id) {
                            Some((j, jid)) => self.inbox.push((j, jid, message)),
                            None => self.local_out.push((i, id, message)),
                        },
                        Output::Dial(id, address) => self.dials.push((i, id, address)),
                        Output::SetTimeout(id, at) if at >= 0 => self.timers.push((i, id)),
                        Output::Drop(id) => {
                            self.links.retain(|l| {
                                !(l.a == i && l.a_id == id || l.b == i && l.b_id == id)
                            });
                        }
                        Output::StopListeners => self.stopped_listeners.push(i),
                        _ => {}
                    }
                }
            }
            if self.inbox.is_empty() {
                return;
            }
            for (j, jid, message) in std::mem::take(&mut self.inbox) {
                self.servers[j].message(jid, message);
            }
        }
    }

    /// Fire dial timers and complete dials until the mesh stops changing.
    /// Returns the `(dialer, acceptor)` pairs that were established,
    /// including short-lived gossip connections.
    pub fn form_mesh(&mut self) -> Vec<(usize, usize)> {
        let mut established = Vec::new();
        loop {
            self.settle();
            let timers = std::mem::take(&mut self.timers);
            for (i, id) in timers {
                self.servers[i].timeout(id);
            }
            self.settle();
            let dials = std::mem::take(&mut self.dials);
            if dials.is_empty() && self.timers.is_empty() {
                return established;
            }
            for (i, id, address) in dials {
                let Some(j) = self.addrs.iter().position(|a| *a == address) else {
                    continue;
                };
                // The acceptor sees an ephemeral source port.
                let ephemeral = Address::new(self.addrs[i].ip(), 40_000 + id.0 as u16);
                let jid = self.servers[j].accepted_remote(ephemeral);
                self.links.push(Link {
                    a: i,
                    a_id: id,
                    b: j,
                    b_id: jid,
                });
                established.push((i, j));
                self.servers[i].connected(id);
                self.settle();
            }
        }
    }

    /// The established link between daemons `i` and `j`, whoever dialed.
    pub fn link_between(&self, i: usize, j: usize) -> Option<Link> {
        self.links
            .iter()
            .copied()
            .find(|l| (l.a == i && l.b == j) || (l.a == j && l.b == i))
    }

    /// Daemon `i`'s connection id for its link with daemon `j`.
    pub fn conn_for(&self, i: usize, j: usize) -> Option<ConnectionId> {
        self.link_between(i, j)
            .map(|l| if l.a == i { l.a_id } else { l.b_id })
    }

    /// Remove and return every message delivered to `(server, connection)`.
    pub fn take_local(&mut self, i: usize, id: ConnectionId) -> Vec<Message> {
        let mut taken = Vec::new();
        self.local_out.retain(|(s, c, m)| {
            if *s == i && *c == id {
                taken.push(m.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    /// The other end of the link carrying `(server, connection)`.
    fn route(&self, i: usize, id: ConnectionId) -> Option<(usize, ConnectionId)> {
        for link in &self.links {
            if link.a == i && link.a_id == id {
                return Some((link.b, link.b_id));
            }
            if link.b == i && link.b_id == id {
                return Some((link.a, link.a_id));
            }
        }
        None
    }
}
