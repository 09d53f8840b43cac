//! The router: owns every connection's state and implements the protocol
//! state machine.
//!
//! The router is deliberately free of sockets.  The reactor feeds it events
//! (accepted connection, completed dial, inbound message, hangup, timer) and
//! drains [`Output`] commands after every event.  This keeps the whole
//! protocol unit-testable in memory: multi-daemon scenarios run several
//! `Server` values and shuttle their outputs around by hand.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use sc_protocol::{Address, Message, NetworkKind, DAEMON_SERVICE, VERSION};
use tracing::{debug, error, info, trace, warn};

use crate::cache::{BroadcastDedup, LocalCache};
use crate::config::{canonicalize_server_types, Config};
use crate::connection::{
    ConnectionId, ConnectionKind, ConnectionState, DialerState, DIALER_FIRST_WAIT,
    DIALER_TOO_BUSY_WAIT, GOSSIP_FIRST_WAIT,
};
use crate::neighbors::NeighborSet;
use crate::remote::{MeshRole, RemoteConnections};

/// Commands this daemon implements, as advertised in the `COMMANDS` reply.
pub const DAEMON_COMMANDS: &str = "ACCEPT,COMMANDS,CONNECT,DISCONNECT,GOSSIP,HELP,LOG,\
QUITTING,REFUSE,REGISTER,SERVICES,SHUTDOWN,STOP,UNKNOWN,UNREGISTER";

/// Commands accepted over the UDP signal socket.
pub const UDP_COMMANDS: [&str; 2] = ["STOP", "SHUTDOWN"];

/// Broadcast messages become undeliverable this long after origination.
const BROADCAST_TIMEOUT: i64 = 10;
/// Broadcasts stop spreading to further daemons after this many hops.
const BROADCAST_MAX_HOPS: i64 = 5;
/// Peer dialer start times are spaced this far apart.
const DIALER_STAGGER: i64 = 1_000_000;

/// A command the reactor must carry out for the router.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Queue one message on a connection's output buffer.
    Send(ConnectionId, Message),
    /// Start a non-blocking connect for this (dialer) connection.
    Dial(ConnectionId, Address),
    /// Close a dialer's socket but keep the connection (its retry timer
    /// stays on the loop).
    Disconnect(ConnectionId),
    /// Flush pending output, close, and remove the connection.
    Drop(ConnectionId),
    /// Set (or clear, with -1) the connection's one-shot timeout date, in
    /// microseconds since the epoch.
    SetTimeout(ConnectionId, i64),
    /// Remove the listeners and the signal sockets from the loop.
    StopListeners,
    /// Rebuild the logging filter from the environment.
    ReloadLogging,
}

/// One connection owned by the router.
#[derive(Debug)]
pub struct Connection {
    pub kind: ConnectionKind,
    pub state: ConnectionState,
    pub dialer: Option<DialerState>,
}

pub struct Server {
    config: Config,
    now: i64,
    next_id: u64,
    connections: BTreeMap<ConnectionId, Connection>,
    remotes: RemoteConnections,
    neighbors: NeighborSet,
    local_services: BTreeSet<String>,
    local_services_str: String,
    services_heard_of: BTreeSet<String>,
    services_heard_of_str: String,
    cache: LocalCache,
    dedup: BroadcastDedup,
    broadcast_sequence: u64,
    shutdown: bool,
    outputs: VecDeque<Output>,
}

impl Server {
    pub fn new(config: Config, neighbors: NeighborSet) -> Self {
        let remotes = RemoteConnections::new(config.my_address);
        Self {
            config,
            now: 0,
            next_id: 0,
            connections: BTreeMap::new(),
            remotes,
            neighbors,
            local_services: BTreeSet::new(),
            local_services_str: String::new(),
            services_heard_of: BTreeSet::new(),
            services_heard_of_str: String::new(),
            cache: LocalCache::default(),
            dedup: BroadcastDedup::default(),
            broadcast_sequence: 0,
            shutdown: false,
            outputs: VecDeque::new(),
        }
    }

    /// Update the router's clock.  The reactor calls this once per pass.
    pub fn tick(&mut self, now: i64) {
        self.now = now;
    }

    /// Seed the neighbor set from configuration and create a dialer for
    /// every known neighbor.  Called once, before the loop starts.
    pub fn initialize(&mut self, now: i64) {
        self.now = now;
        let explicit = self.config.neighbors.clone();
        if !explicit.is_empty() {
            self.neighbors.add_list(&explicit, self.config.listen.port());
        }
        let known: Vec<Address> = self.neighbors.iter().copied().collect();
        for addr in known {
            self.add_remote(addr);
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Output> + '_ {
        self.outputs.drain(..)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn local_services(&self) -> &BTreeSet<String> {
        &self.local_services
    }

    pub fn services_heard_of(&self) -> &BTreeSet<String> {
        &self.services_heard_of
    }

    pub fn neighbors(&self) -> &NeighborSet {
        &self.neighbors
    }

    pub fn cached_message_count(&self) -> usize {
        self.cache.len()
    }

    // -----------------------------------------------------------------------
    // Reactor-facing events
    // -----------------------------------------------------------------------

    /// A local service connected on the loopback listener.
    pub fn accepted_local(&mut self) -> ConnectionId {
        let id = self.allocate_id();
        let mut state = ConnectionState::new("client connection");
        state.set_server_name(&self.config.server_name);
        self.connections.insert(
            id,
            Connection {
                kind: ConnectionKind::LocalService,
                state,
                dialer: None,
            },
        );
        id
    }

    /// A peer daemon connected on the remote listener.
    pub fn accepted_remote(&mut self, address: Address) -> ConnectionId {
        let id = self.allocate_id();
        let mut state = ConnectionState::new("remote connection");
        state.mark_as_remote();
        state.set_address(address);
        self.connections.insert(
            id,
            Connection {
                kind: ConnectionKind::RemotePeer,
                state,
                dialer: None,
            },
        );
        id
    }

    /// An outbound dial completed.
    pub fn connected(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        match conn.kind {
            ConnectionKind::PeerDialer => {
                if let Some(dialer) = conn.dialer.as_mut() {
                    dialer.connected = true;
                    dialer.wait = DIALER_FIRST_WAIT;
                }
                self.outputs.push_back(Output::SetTimeout(id, -1));

                let mut connect = Message::new("CONNECT");
                connect.set_parameter("version", VERSION);
                connect.set_parameter("types", &self.config.server_types);
                connect.set_parameter("my_address", self.config.my_address.to_string());
                connect.set_parameter("server_name", &self.config.server_name);
                if !self.config.neighbors.is_empty() {
                    connect.set_parameter("neighbors", &self.config.neighbors);
                }
                if !self.local_services_str.is_empty() {
                    connect.set_parameter("services", &self.local_services_str);
                }
                if !self.services_heard_of_str.is_empty() {
                    connect.set_parameter("heard_of", &self.services_heard_of_str);
                }
                self.send(id, connect);
                self.send(id, Message::new("HELP"));
                self.send_status(id);
            }
            ConnectionKind::GossipDialer => {
                if let Some(dialer) = conn.dialer.as_mut() {
                    dialer.connected = true;
                }
                let mut gossip = Message::new("GOSSIP");
                gossip.set_parameter("my_address", self.config.my_address.to_string());
                self.send(id, gossip);
            }
            _ => {}
        }
    }

    /// An outbound dial failed; double the backoff and try again later.
    pub fn dial_failed(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if let Some(dialer) = conn.dialer.as_mut() {
            dialer.connected = false;
            dialer.back_off();
            let next = self.now + dialer.wait;
            debug!(%id, wait_us = dialer.wait, "dial failed, backing off");
            self.outputs.push_back(Output::SetTimeout(id, next));
        }
    }

    /// The transport reported a hangup, error, or invalid socket.
    pub fn hangup(&mut self, id: ConnectionId) {
        let now = self.now;
        let in_shutdown = self.shutdown;
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.state.connection_ended(now);
        let kind = conn.kind;
        let server_name = conn.state.server_name().to_owned();
        let is_remote = conn.state.is_remote();

        match kind {
            ConnectionKind::PeerDialer | ConnectionKind::GossipDialer => {
                if in_shutdown {
                    self.remove_connection(id);
                    return;
                }
                let mut retry_at = None;
                if let Some(dialer) = conn.dialer.as_mut() {
                    dialer.connected = false;
                    retry_at = Some(now + dialer.wait);
                }
                if let Some(at) = retry_at {
                    self.outputs.push_back(Output::SetTimeout(id, at));
                }
                if kind == ConnectionKind::PeerDialer && !server_name.is_empty() {
                    let mut disconnected = Message::new("DISCONNECTED");
                    disconnected.set_service(".");
                    disconnected.set_parameter("server_name", &server_name);
                    self.broadcast_message(&disconnected);
                }
                self.refresh_heard_of();
            }
            ConnectionKind::LocalService | ConnectionKind::RemotePeer => {
                // The dying connection must not receive its own status.
                conn.state.remove_command("STATUS");
                conn.state.set_connection_types("");
                conn.state.clear_named();
                if is_remote && !server_name.is_empty() {
                    let mut disconnected = Message::new("DISCONNECTED");
                    disconnected.set_service(".");
                    disconnected.set_parameter("server_name", &server_name);
                    self.broadcast_message(&disconnected);
                }
                self.send_status(id);
                self.remove_connection(id);
                self.refresh_heard_of();
            }
        }
    }

    /// A dialer's retry timer fired.
    pub fn timeout(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if let Some(dialer) = conn.dialer.as_ref() {
            if dialer.enabled && !dialer.connected {
                let address = dialer.address;
                self.outputs.push_back(Output::Dial(id, address));
            }
        }
    }

    /// One message arrived over TCP.
    pub fn message(&mut self, id: ConnectionId, mut message: Message) {
        if let Some(conn) = self.connections.get(&id) {
            // Stamp the origin so the destination can reply to this exact
            // service instance; only properly registered services qualify.
            if conn.state.is_named() {
                message.set_sent_from_server(self.config.server_name.clone());
                message.set_sent_from_service(conn.state.name().to_owned());
            }
        }
        self.process_message(Some(id), &message, false);
    }

    /// One message arrived as a UDP datagram.
    pub fn udp_message(&mut self, message: Message) {
        if !UDP_COMMANDS.contains(&message.command()) {
            warn!(command = message.command(), "dropping command not allowed over UDP");
            return;
        }
        self.process_message(None, &message, true);
    }

    /// SIGINT/SIGTERM: treated as a local `STOP`.
    pub fn stop_requested(&mut self) {
        info!("termination signal received, stopping");
        self.begin_shutdown(false);
    }

    // -----------------------------------------------------------------------
    // Message processing
    // -----------------------------------------------------------------------

    fn process_message(&mut self, id: Option<ConnectionId>, message: &Message, udp: bool) {
        if let Ok(line) = message.to_wire() {
            trace!(%line, "received a message");
        }

        let service = message.service().to_owned();
        if service.is_empty() || service == DAEMON_SERVICE {
            self.process_daemon_message(id, message, udp);
            return;
        }

        if service == "*" || service == "?" || service == "." {
            self.broadcast_message(message);
            return;
        }

        self.route_message(message);
    }

    fn process_daemon_message(&mut self, id: Option<ConnectionId>, message: &Message, udp: bool) {
        let command = message.command().to_owned();

        if self.shutdown {
            // UNREGISTER is the reply to our own STOP and is still honored;
            // everything else gets a quick QUITTING.  UDP arrivals are
            // silently ignored, there is no channel to reply on.
            if !udp && command != "UNREGISTER" {
                if let Some(id) = id {
                    self.send(id, Message::new("QUITTING"));
                    self.outputs.push_back(Output::Drop(id));
                    self.remove_connection(id);
                }
                return;
            }
            if udp {
                return;
            }
        }

        match command.as_str() {
            "ACCEPT" => self.msg_accept(id, message),
            "COMMANDS" => self.msg_commands(id, message),
            "CONNECT" => self.msg_connect(id, message),
            "DISCONNECT" => self.msg_disconnect(id),
            "GOSSIP" => self.msg_gossip(id, message),
            "HELP" => self.msg_help(id),
            "LOG" => {
                info!("logging reconfiguration");
                self.outputs.push_back(Output::ReloadLogging);
            }
            "QUITTING" => {
                info!("peer is quitting; no reply will come");
            }
            "RECEIVED" => self.msg_received(id),
            "REFUSE" => self.msg_refuse(id),
            "REGISTER" => self.msg_register(id, message),
            "SERVICES" => self.msg_services(id, message),
            "SHUTDOWN" => self.begin_shutdown(true),
            "STOP" => self.begin_shutdown(false),
            "UNKNOWN" => {
                error!(
                    command = message.parameter("command").unwrap_or(""),
                    "a peer did not know a command we sent"
                );
            }
            "UNREGISTER" => self.msg_unregister(id, message),
            _ => {
                error!(%command, "unknown command addressed to the daemon");
                if !udp {
                    if let Some(id) = id {
                        let mut reply = Message::new("UNKNOWN");
                        reply.set_parameter("command", &command);
                        self.verify_and_send(id, reply);
                    }
                }
            }
        }
    }

    fn msg_register(&mut self, id: Option<ConnectionId>, message: &Message) {
        let Some(id) = id else { return };
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.state.is_remote() {
            error!(%id, "REGISTER is only accepted from local services");
            return;
        }
        let Some(service_name) = message.parameter("service").map(str::to_owned) else {
            error!("REGISTER requires \"service\" and \"version\" parameters");
            return;
        };
        match message.integer_parameter("version") {
            Ok(v) if v == VERSION => {}
            Ok(v) => {
                error!(version = v, expected = VERSION, "REGISTER with incompatible version");
                return;
            }
            Err(e) => {
                error!("REGISTER version parameter: {e}");
                return;
            }
        }

        conn.state.set_name(&service_name);
        conn.state.mark_named();
        conn.state.set_connection_types("client");
        conn.state.connection_started(self.now);

        // The service waits for READY before doing anything else.
        self.send(id, Message::new("READY"));

        let mut new_service = Message::new("NEWSERVICE");
        new_service.set_service(".");
        new_service.set_parameter("server", &self.config.server_name);
        new_service.set_parameter("service", &service_name);
        self.broadcast_message(&new_service);

        self.send(id, Message::new("HELP"));
        self.send_status(id);

        // Messages that arrived for this service before it registered.
        for cached in self.cache.drain_for(&service_name) {
            self.send(id, cached);
        }
    }

    fn msg_unregister(&mut self, id: Option<ConnectionId>, message: &Message) {
        let Some(id) = id else { return };
        if !message.has_parameter("service") {
            error!("UNREGISTER requires a \"service\" parameter");
            return;
        }
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        // The dying connection must not receive its own status.
        conn.state.remove_command("STATUS");
        conn.state.set_connection_types("");
        conn.state.connection_ended(self.now);
        let saved_name = conn.state.name().to_owned();

        // The status fan-out needs the name still in place.
        self.send_status(id);

        if let Some(conn) = self.connections.get_mut(&id) {
            conn.state.set_name("");
            conn.state.clear_named();
        }
        self.outputs.push_back(Output::Drop(id));
        self.remove_connection(id);

        // The supervisor unregistering is the supervisor going down: behave
        // as if a STOP had been received.
        if saved_name == self.config.supervisor {
            self.begin_shutdown(false);
        }
    }

    fn msg_connect(&mut self, id: Option<ConnectionId>, message: &Message) {
        let Some(id) = id else { return };
        if message.parameter("types").is_none()
            || message.parameter("my_address").is_none()
            || message.parameter("server_name").is_none()
        {
            error!("CONNECT requires \"types\", \"version\", \"my_address\" and \"server_name\"");
            return;
        }
        match message.integer_parameter("version") {
            Ok(v) if v == VERSION => {}
            Ok(v) => {
                error!(version = v, expected = VERSION, "CONNECT with incompatible version");
                return;
            }
            Err(e) => {
                error!("CONNECT version parameter: {e}");
                return;
            }
        }

        let types = canonicalize_server_types(message.parameter("types").unwrap_or(""));
        let his_address = message.parameter("my_address").unwrap_or("").to_owned();
        let server_name = message.parameter("server_name").unwrap_or("").to_owned();

        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.state.set_connection_types(&types);
        conn.state.set_server_name(&server_name);

        let mut reply = Message::new("REFUSE");
        if !self.config.neighbors.is_empty() {
            reply.set_parameter("neighbors", &self.config.neighbors);
        }
        reply.set_parameter("types", &self.config.server_types);

        if self.connections.len() >= self.config.max_connections {
            // Too many connections; the dialer backs off for a long while.
            warn!(count = self.connections.len(), "refusing CONNECT, at capacity");
            self.send(id, reply);
        } else {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.state.connection_started(self.now);
                if let Some(services) = message.parameter("services") {
                    conn.state.set_services(services);
                }
                if let Some(heard_of) = message.parameter("heard_of") {
                    conn.state.set_services_heard_of(heard_of);
                }
            }
            if let Some(neighbors) = message.parameter("neighbors").map(str::to_owned) {
                self.learn_neighbor_list(&neighbors);
            }
            self.refresh_heard_of();

            reply.set_command("ACCEPT");
            reply.set_parameter("server_name", &self.config.server_name);
            if !self.local_services_str.is_empty() {
                reply.set_parameter("services", &self.local_services_str);
            }
            if !self.services_heard_of_str.is_empty() {
                reply.set_parameter("heard_of", &self.services_heard_of_str);
            }

            // The dialing peer is a neighbor worth remembering across
            // restarts, and any gossip aimed at it has met its goal.
            if let Ok(addr) = Address::parse(&his_address, self.config.listen.port()) {
                self.neighbors.add(addr);
                if let Some(gossip_id) = self.remotes.remove_gossip(addr) {
                    self.outputs.push_back(Output::Drop(gossip_id));
                    self.remove_connection(gossip_id);
                }
            } else {
                warn!(%his_address, "CONNECT carried an unparsable my_address");
            }

            self.send(id, reply);
        }

        self.send(id, Message::new("HELP"));
        self.send_status(id);
    }

    fn msg_accept(&mut self, id: Option<ConnectionId>, message: &Message) {
        let Some(id) = id else { return };
        if message.parameter("types").is_none() || message.parameter("server_name").is_none() {
            error!("ACCEPT requires \"types\" and \"server_name\" parameters");
            return;
        }
        let types = canonicalize_server_types(message.parameter("types").unwrap_or(""));
        let server_name = message.parameter("server_name").unwrap_or("").to_owned();

        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.state.set_connection_types(&types);
        conn.state.set_server_name(&server_name);
        conn.state.connection_started(self.now);
        if let Some(services) = message.parameter("services") {
            conn.state.set_services(services);
        }
        if let Some(heard_of) = message.parameter("heard_of") {
            conn.state.set_services_heard_of(heard_of);
        }
        if let Some(neighbors) = message.parameter("neighbors").map(str::to_owned) {
            self.learn_neighbor_list(&neighbors);
        }
        self.refresh_heard_of();
        self.send(id, Message::new("HELP"));
    }

    fn msg_disconnect(&mut self, id: Option<ConnectionId>) {
        let Some(id) = id else { return };
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.state.connection_ended(self.now);

        let types = conn.state.connection_types().to_owned();
        if types.is_empty() || types == "client" {
            error!(%types, "DISCONNECT from a connection of the wrong type");
            return;
        }
        conn.state.set_connection_types("");
        let server_name = conn.state.server_name().to_owned();
        let kind = conn.kind;

        if kind == ConnectionKind::RemotePeer {
            // The peer that dialed us is gone for good; dialers, by
            // contrast, keep reconnecting on their own cadence.
            self.outputs.push_back(Output::Drop(id));
            self.remove_connection(id);
        }
        self.refresh_heard_of();

        if !server_name.is_empty() {
            let mut disconnected = Message::new("DISCONNECTED");
            disconnected.set_service(".");
            disconnected.set_parameter("server_name", &server_name);
            self.broadcast_message(&disconnected);
        }
    }

    fn msg_gossip(&mut self, id: Option<ConnectionId>, message: &Message) {
        let Some(id) = id else { return };
        if let Some(his_address) = message.parameter("my_address") {
            // A larger-addressed daemon announcing itself: remember it,
            // dial it if the half-mesh rule says so, and confirm.
            match Address::parse(his_address, self.config.listen.port()) {
                Ok(addr) => {
                    self.learn_neighbor(addr);
                    self.send(id, Message::new("RECEIVED"));
                }
                Err(e) => error!(%his_address, "GOSSIP carried a bad my_address: {e}"),
            }
            return;
        }
        // The hop-list flooding variant is reserved.
        error!("GOSSIP without my_address is not supported");
    }

    fn msg_help(&mut self, id: Option<ConnectionId>) {
        let Some(id) = id else { return };
        let mut reply = Message::new("COMMANDS");
        reply.set_parameter("list", DAEMON_COMMANDS);
        self.send(id, reply);
    }

    fn msg_commands(&mut self, id: Option<ConnectionId>, message: &Message) {
        let Some(id) = id else { return };
        let Some(list) = message.parameter("list").map(str::to_owned) else {
            error!("COMMANDS requires a \"list\" parameter");
            return;
        };
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.state.set_commands(&list);

        if self.config.debug {
            // Every connection must understand the commands we are certain
            // to send it; a missing one is a bug in that service.
            let required: &[&str] = if conn.state.is_remote() {
                &["HELP", "QUITTING", "ACCEPT", "STOP", "UNKNOWN"]
            } else {
                &["HELP", "QUITTING", "READY", "STOP", "UNKNOWN"]
            };
            let name = conn.state.name().to_owned();
            let mut ok = true;
            for cmd in required {
                if !conn.state.understands_command(cmd) {
                    error!(connection = %name, command = cmd, "connection does not understand a required command");
                    ok = false;
                }
            }
            assert!(ok, "connection \"{name}\" does not implement some required commands");
        }
    }

    fn msg_services(&mut self, id: Option<ConnectionId>, message: &Message) {
        let Some(id) = id else { return };
        if self
            .connections
            .get(&id)
            .is_some_and(|c| c.state.is_remote())
        {
            error!("SERVICES is only accepted from the local supervisor");
            return;
        }
        let Some(list) = message.parameter("list") else {
            error!("SERVICES requires a \"list\" parameter");
            return;
        };

        self.local_services.clear();
        for entry in list.split(',') {
            let entry = entry.trim();
            if !entry.is_empty() {
                self.local_services.insert(entry.to_owned());
            }
        }
        if self.local_services.is_empty() {
            error!("SERVICES with an empty list");
            return;
        }
        self.local_services_str = join(&self.local_services);
        self.refresh_heard_of();

        // Now that we know what runs here, the mesh can form.  Stagger the
        // dial start times so thousands of nodes do not dial as one.
        if !self.remotes.is_started() {
            self.remotes.mark_started();
            let ids: Vec<ConnectionId> = self.remotes.peer_ids().collect();
            let mut start = self.now;
            for peer_id in ids {
                if let Some(conn) = self.connections.get_mut(&peer_id) {
                    if let Some(dialer) = conn.dialer.as_mut() {
                        dialer.enabled = true;
                        self.outputs.push_back(Output::SetTimeout(peer_id, start));
                        start += DIALER_STAGGER;
                    }
                }
            }
        }
    }

    fn msg_received(&mut self, id: Option<ConnectionId>) {
        let Some(id) = id else { return };
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        if conn.kind == ConnectionKind::GossipDialer {
            // The whole point of this connection was that one RECEIVED.
            if let Some(dialer) = conn.dialer.as_ref() {
                self.remotes.remove_gossip(dialer.address);
            }
            self.outputs.push_back(Output::Drop(id));
            self.remove_connection(id);
        } else {
            debug!(%id, "RECEIVED on a non-gossip connection, ignored");
        }
    }

    fn msg_refuse(&mut self, id: Option<ConnectionId>) {
        let Some(id) = id else { return };
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.kind != ConnectionKind::PeerDialer {
            error!(%id, "REFUSE from a connection we did not dial");
            return;
        }
        // The peer is at capacity; keep the dialer but wait a day.
        if let Some(dialer) = conn.dialer.as_mut() {
            dialer.connected = false;
            dialer.wait = DIALER_TOO_BUSY_WAIT;
            let next = self.now + dialer.wait;
            warn!(address = %dialer.address, "peer refused our connection, backing off");
            self.outputs.push_back(Output::Disconnect(id));
            self.outputs.push_back(Output::SetTimeout(id, next));
        }
    }

    // -----------------------------------------------------------------------
    // Unicast routing
    // -----------------------------------------------------------------------

    fn route_message(&mut self, message: &Message) {
        let service = message.service().to_owned();
        let server_name = message.server().to_owned();
        let all_servers = server_name.is_empty() || server_name == "*";

        let mut matching_peers: Vec<ConnectionId> = Vec::new();
        let mut target: Option<ConnectionId> = None;

        for (cid, conn) in &self.connections {
            if conn.state.server_name().is_empty() {
                // Not handshaken yet; it cannot receive routed messages.
                continue;
            }
            if !all_servers && server_name != conn.state.server_name() {
                continue;
            }
            match conn.kind {
                ConnectionKind::LocalService if conn.state.name() == service => {
                    target = Some(*cid);
                    break;
                }
                ConnectionKind::RemotePeer => matching_peers.push(*cid),
                ConnectionKind::PeerDialer
                    if conn.dialer.as_ref().is_some_and(|d| d.connected) =>
                {
                    matching_peers.push(*cid);
                }
                _ => {}
            }
        }

        if let Some(target) = target {
            self.verify_and_send(target, message.clone());
            return;
        }

        if all_servers && self.local_services.contains(&service) {
            // The service runs on this node but has not registered yet:
            // hold the message until its REGISTER.
            self.cache.push(message.clone());
            return;
        }

        if server_name == self.config.server_name {
            debug!(
                command = message.command(),
                %service,
                "message for an unregistered local service, dropping"
            );
            return;
        }

        for peer in matching_peers {
            self.send(peer, message.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Broadcast
    // -----------------------------------------------------------------------

    fn broadcast_message(&mut self, message: &Message) {
        let mut informed: Vec<String> = Vec::new();
        let mut hops: i64 = 0;
        let mut timeout: i64 = 0;

        if let Some(msgid) = message.parameter("broadcast_msgid").map(str::to_owned) {
            timeout = message.integer_parameter("broadcast_timeout").unwrap_or(0);
            let now_secs = self.now / 1_000_000;
            if timeout < now_secs {
                return;
            }
            // A message seen twice already went around some loop.
            if !self.dedup.check_and_record(&msgid, timeout, now_secs) {
                return;
            }
            if let Some(list) = message.parameter("broadcast_informed_neighbors") {
                informed = list
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect();
            }
            hops = message.integer_parameter("broadcast_hops").unwrap_or(0);
        }

        let service = message.service();
        let all = hops < BROADCAST_MAX_HOPS && service == "*";
        let remote = hops < BROADCAST_MAX_HOPS && (all || service == "?");

        let mut local_recipients: Vec<ConnectionId> = Vec::new();
        let mut peer_recipients: Vec<(ConnectionId, String)> = Vec::new();

        for (cid, conn) in &self.connections {
            match conn.kind {
                ConnectionKind::LocalService => {
                    // Local services always get broadcasts, but only when
                    // they declared the command: `.` carries event-style
                    // messages many services do not care about.
                    if conn.state.understands_command(message.command()) {
                        local_recipients.push(*cid);
                    }
                }
                ConnectionKind::RemotePeer | ConnectionKind::PeerDialer => {
                    if conn.kind == ConnectionKind::PeerDialer
                        && !conn.dialer.as_ref().is_some_and(|d| d.connected)
                    {
                        continue;
                    }
                    let Some(address) = conn
                        .dialer
                        .as_ref()
                        .map(|d| d.address)
                        .or_else(|| conn.state.address())
                    else {
                        continue;
                    };
                    let forward = match address.network_kind() {
                        NetworkKind::Loopback => {
                            debug!(%address, "peer connected over loopback, not broadcasting");
                            false
                        }
                        NetworkKind::Private => remote,
                        NetworkKind::Public => all,
                    };
                    if forward {
                        let ip = address.ip_string();
                        if !informed.contains(&ip) {
                            peer_recipients.push((*cid, ip));
                        }
                    }
                }
                ConnectionKind::GossipDialer => {}
            }
        }

        for cid in local_recipients {
            self.send(cid, message.clone());
        }

        if peer_recipients.is_empty() {
            return;
        }

        let originator = self.config.my_address.ip_string();
        if !informed.contains(&originator) {
            informed.push(originator.clone());
        }
        for (_, ip) in &peer_recipients {
            informed.push(ip.clone());
        }

        let mut forwarded = message.clone();
        if !forwarded.has_parameter("broadcast_msgid") {
            self.broadcast_sequence += 1;
            forwarded.set_parameter(
                "broadcast_msgid",
                format!("{}-{}", self.config.server_name, self.broadcast_sequence),
            );
        }
        forwarded.set_parameter("broadcast_hops", hops + 1);
        forwarded.set_parameter("broadcast_originator", &originator);
        if timeout == 0 {
            timeout = self.now / 1_000_000 + BROADCAST_TIMEOUT;
        }
        forwarded.set_parameter("broadcast_timeout", timeout);
        forwarded.set_parameter("broadcast_informed_neighbors", informed.join(","));

        for (cid, _) in peer_recipients {
            self.send(cid, forwarded.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Tell every STATUS-capable connection that `id` changed state.
    fn send_status(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        let mut status = Message::new("STATUS");
        status.set_parameter("service", conn.state.name().to_owned());
        status.set_parameter("status", if conn.state.is_up() { "up" } else { "down" });
        if conn.state.started_at() != -1 {
            status.set_parameter("up_since", conn.state.started_at() / 1_000_000);
        }
        if conn.state.ended_at() != -1 {
            status.set_parameter("down_since", conn.state.ended_at() / 1_000_000);
        }

        let recipients: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.state.understands_command("STATUS"))
            .map(|(cid, _)| *cid)
            .collect();
        for cid in recipients {
            self.send(cid, status.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Neighbors and the half-mesh rule
    // -----------------------------------------------------------------------

    fn learn_neighbor(&mut self, address: Address) {
        self.neighbors.add(address);
        self.add_remote(address);
    }

    fn learn_neighbor_list(&mut self, list: &str) {
        self.neighbors.add_list(list, self.config.listen.port());
        let known: Vec<Address> = self.neighbors.iter().copied().collect();
        for addr in known {
            self.add_remote(addr);
        }
    }

    /// Apply the half-mesh rule to one address: dial smaller addresses with
    /// a persistent peer dialer, announce ourselves to larger ones with a
    /// gossip dialer.
    fn add_remote(&mut self, address: Address) {
        match self.remotes.classify(address) {
            MeshRole::Myself | MeshRole::Known => {}
            MeshRole::Dial => {
                let id = self.allocate_id();
                let enabled = self.remotes.is_started();
                let mut state = ConnectionState::new("remote communicator connection");
                state.mark_as_remote();
                state.set_address(address);
                self.connections.insert(
                    id,
                    Connection {
                        kind: ConnectionKind::PeerDialer,
                        state,
                        dialer: Some(DialerState::new(address, enabled)),
                    },
                );
                self.remotes.insert_peer(address, id);
                if enabled {
                    self.outputs.push_back(Output::SetTimeout(id, self.now));
                }
            }
            MeshRole::Gossip => {
                let id = self.allocate_id();
                let mut state = ConnectionState::new("gossip connection");
                state.mark_as_remote();
                state.set_address(address);
                let mut dialer = DialerState::new(address, true);
                dialer.wait = GOSSIP_FIRST_WAIT;
                self.connections.insert(
                    id,
                    Connection {
                        kind: ConnectionKind::GossipDialer,
                        state,
                        dialer: Some(dialer),
                    },
                );
                self.remotes.insert_gossip(address, id);
                self.outputs
                    .push_back(Output::SetTimeout(id, self.now + GOSSIP_FIRST_WAIT));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// `STOP` stops this daemon; `SHUTDOWN` takes the whole cluster down.
    fn begin_shutdown(&mut self, full: bool) {
        if self.shutdown {
            return;
        }
        info!(full, "shutting down");
        self.shutdown = true;

        // Gossiping is pointless now.
        for gossip_id in self.remotes.take_gossips() {
            self.outputs.push_back(Output::Drop(gossip_id));
            self.remove_connection(gossip_id);
        }

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            let Some(conn) = self.connections.get(&id) else {
                continue;
            };
            match conn.kind {
                ConnectionKind::PeerDialer => {
                    let connected = conn.dialer.as_ref().is_some_and(|d| d.connected);
                    if !connected {
                        self.outputs.push_back(Output::Drop(id));
                        self.remove_connection(id);
                    } else if full {
                        self.verify_and_send(id, Message::new("SHUTDOWN"));
                        self.outputs.push_back(Output::Drop(id));
                        self.remove_connection(id);
                    } else {
                        // The peer removes its side on DISCONNECT; our
                        // hangup handler then drops the dialer.
                        self.verify_and_send(id, Message::new("DISCONNECT"));
                    }
                }
                ConnectionKind::RemotePeer => {
                    if !conn.state.is_up() {
                        self.outputs.push_back(Output::Drop(id));
                        self.remove_connection(id);
                    } else if full {
                        self.verify_and_send(id, Message::new("SHUTDOWN"));
                        self.outputs.push_back(Output::Drop(id));
                        self.remove_connection(id);
                    } else {
                        self.verify_and_send(id, Message::new("DISCONNECT"));
                    }
                }
                ConnectionKind::LocalService => {
                    if !conn.state.is_up() {
                        self.outputs.push_back(Output::Drop(id));
                        self.remove_connection(id);
                    } else {
                        // Services reply with UNREGISTER (or hang up);
                        // removal happens then, not now.
                        self.verify_and_send(id, Message::new("STOP"));
                    }
                }
                ConnectionKind::GossipDialer => {
                    // Already handled above.
                }
            }
        }

        self.outputs.push_back(Output::StopListeners);
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn allocate_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId(self.next_id)
    }

    fn remove_connection(&mut self, id: ConnectionId) {
        self.remotes.forget(id);
        self.connections.remove(&id);
    }

    fn send(&mut self, id: ConnectionId, message: Message) {
        self.outputs.push_back(Output::Send(id, message));
    }

    /// Check the capability contract before a targeted send: a connection
    /// that advertised its commands must have advertised this one.  In debug
    /// mode a violation aborts so the bug is visible; in release the message
    /// is logged and sent anyway.
    fn verify_and_send(&mut self, id: ConnectionId, message: Message) {
        if let Some(conn) = self.connections.get(&id) {
            if conn.state.has_commands() && !conn.state.understands_command(message.command()) {
                if self.config.debug {
                    error!(
                        connection = conn.state.name(),
                        command = message.command(),
                        "connection does not understand a command we are sending"
                    );
                    panic!(
                        "connection \"{}\" does not implement command \"{}\"",
                        conn.state.name(),
                        message.command()
                    );
                }
                warn!(
                    connection = conn.state.name(),
                    command = message.command(),
                    "sending a command the connection did not advertise"
                );
            }
        }
        self.send(id, message);
    }

    /// Recompute the heard-of view: everything our peers offer or heard of,
    /// minus what runs here.
    fn refresh_heard_of(&mut self) {
        self.services_heard_of.clear();
        for conn in self.connections.values() {
            for s in conn.state.services() {
                self.services_heard_of.insert(s.clone());
            }
            for s in conn.state.services_heard_of() {
                self.services_heard_of.insert(s.clone());
            }
        }
        for local in &self.local_services {
            self.services_heard_of.remove(local);
        }
        self.services_heard_of_str = join(&self.services_heard_of);
    }
}

fn join(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(",")
}
