//! The event loop: a single-threaded, readiness-based `poll` reactor.
//!
//! The reactor owns every socket and the line framing; the router
//! ([`crate::server::Server`]) owns the protocol.  Each pass waits for
//! readiness or the nearest timeout, dispatches per-connection events in
//! priority order, fires timeout callbacks against timestamps saved before
//! the wait, and then applies the router's queued [`Output`] commands.
//!
//! Connections removed from within a callback stay in the current pass's
//! saved dispatch list but are skipped (the entry is gone) and never seen
//! by later sweeps.  The loop returns cleanly once the connection set is
//! empty.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sc_protocol::{Address, Message};
use tracing::{debug, error, trace, warn};

use crate::connection::ConnectionId;
use crate::server::{Output, Server};

/// Upper bound on one wait when no timer is armed.
const WAIT_TIMEOUT: Duration = Duration::from_secs(3600);
/// Socket read chunk size.
const READ_BUFFER_SIZE: usize = 4096;
/// Largest accepted UDP datagram.
const UDP_DATAGRAM_SIZE: usize = 1024;

/// Everything the reactor can wait on.  The derived order doubles as the
/// default dispatch priority: signals first, then listeners, then sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum SourceKey {
    Signal,
    LocalListener,
    RemoteListener,
    Udp,
    Conn(ConnectionId),
}

/// Readiness interests a source can declare for one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Want {
    Read,
    Write,
    All,
}

/// Flags copied out of one popol readiness event.
#[derive(Debug, Clone, Copy)]
struct Ready {
    readable: bool,
    writable: bool,
    errored: bool,
    hangup: bool,
    invalid: bool,
}

/// Recurring-delay and one-shot timeout state for one connection.
///
/// The recurring delay ticks at `next_tick = previous tick + n * delay`,
/// coalescing missed ticks; the one-shot date is cleared just before its
/// callback runs so the callback may re-arm it.
#[derive(Debug, Clone, Copy)]
struct TimerState {
    delay: i64,
    next_tick: i64,
    date: i64,
    saved: i64,
}

impl TimerState {
    fn none() -> Self {
        Self {
            delay: -1,
            next_tick: -1,
            date: -1,
            saved: -1,
        }
    }

    fn set_delay(&mut self, delay: i64, now: i64) {
        self.delay = delay;
        self.next_tick = if delay == -1 { -1 } else { now + delay };
    }

    fn set_date(&mut self, date: i64) {
        self.date = date;
    }

    /// Snapshot the nearest pending timeout before a wait.  Callbacks that
    /// move their own timers during the pass do not affect this snapshot.
    fn save(&mut self) -> i64 {
        let mut nearest = i64::MAX;
        if self.delay != -1 && self.next_tick != -1 {
            nearest = nearest.min(self.next_tick);
        }
        if self.date != -1 {
            nearest = nearest.min(self.date);
        }
        self.saved = if nearest == i64::MAX { -1 } else { nearest };
        self.saved
    }

    /// Whether the saved timeout has now passed; if so, advance the
    /// recurring tick (coalescing missed ones) and clear a passed date.
    fn fire(&mut self, now: i64) -> bool {
        if self.saved == -1 || now < self.saved {
            return false;
        }
        if self.delay != -1 && self.next_tick != -1 && now >= self.next_tick {
            let ticks = (now - self.next_tick) / self.delay + 1;
            self.next_tick += ticks * self.delay;
        }
        if self.date != -1 && now >= self.date {
            self.date = -1;
        }
        true
    }
}

/// An established (or in-progress) TCP stream with its line buffers.
#[derive(Debug)]
struct StreamIo {
    stream: TcpStream,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    connecting: bool,
}

impl StreamIo {
    fn new(stream: TcpStream, connecting: bool) -> Self {
        Self {
            stream,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            connecting,
        }
    }
}

#[derive(Debug)]
enum Endpoint {
    LocalListener(TcpListener),
    RemoteListener(TcpListener),
    Udp(UdpSocket),
    Signal(UnixStream),
    /// A router connection: a live stream, or a dormant dialer waiting on
    /// its retry timer (`io: None`).
    Conn { io: Option<StreamIo>, draining: bool },
}

#[derive(Debug)]
struct Entry {
    priority: u8,
    endpoint: Endpoint,
    timer: TimerState,
}

impl Entry {
    fn new(priority: u8, endpoint: Endpoint) -> Self {
        Self {
            priority,
            endpoint,
            timer: TimerState::none(),
        }
    }

    /// Readiness interests: *listener* and *signal* sources want reads,
    /// streams want reads plus writes while output is pending, and a
    /// dormant dialer participates through its timer only.
    fn interest(&self) -> Option<Want> {
        match &self.endpoint {
            Endpoint::LocalListener(_)
            | Endpoint::RemoteListener(_)
            | Endpoint::Udp(_)
            | Endpoint::Signal(_) => Some(Want::Read),
            Endpoint::Conn { io: Some(io), draining } => {
                if io.connecting || *draining {
                    Some(Want::Write)
                } else if io.outbuf.is_empty() {
                    Some(Want::Read)
                } else {
                    Some(Want::All)
                }
            }
            Endpoint::Conn { io: None, .. } => None,
        }
    }

}

pub struct Reactor {
    entries: BTreeMap<SourceKey, Entry>,
    /// Rebuilt only when priorities change or entries come and go.
    order: Vec<SourceKey>,
    dirty: bool,
    /// Invoked on the router's `ReloadLogging` output.
    on_reload_logging: Option<Box<dyn FnMut()>>,
}

impl Reactor {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            order: Vec::new(),
            dirty: true,
            on_reload_logging: None,
        }
    }

    pub fn set_reload_logging(&mut self, hook: Box<dyn FnMut()>) {
        self.on_reload_logging = Some(hook);
    }

    pub fn set_local_listener(&mut self, listener: TcpListener) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        self.insert(SourceKey::LocalListener, Entry::new(10, Endpoint::LocalListener(listener)));
        Ok(())
    }

    pub fn set_remote_listener(&mut self, listener: TcpListener) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        self.insert(
            SourceKey::RemoteListener,
            Entry::new(11, Endpoint::RemoteListener(listener)),
        );
        Ok(())
    }

    pub fn set_udp(&mut self, socket: UdpSocket) -> io::Result<()> {
        socket.set_nonblocking(true)?;
        self.insert(SourceKey::Udp, Entry::new(20, Endpoint::Udp(socket)));
        Ok(())
    }

    /// The read end of the signal self-pipe; one readable byte per signal.
    pub fn set_signal(&mut self, pipe: UnixStream) -> io::Result<()> {
        pipe.set_nonblocking(true)?;
        self.insert(SourceKey::Signal, Entry::new(0, Endpoint::Signal(pipe)));
        Ok(())
    }

    /// Give a connection a recurring timeout: `server.timeout` fires every
    /// `delay` microseconds, with missed ticks coalesced.  A delay of -1
    /// removes the recurrence.
    pub fn set_timeout_delay(&mut self, id: ConnectionId, delay: i64) {
        let now = now_micros();
        let entry = self.ensure_conn(id);
        entry.timer.set_delay(delay, now);
    }

    fn insert(&mut self, key: SourceKey, entry: Entry) {
        self.entries.insert(key, entry);
        self.dirty = true;
    }

    fn remove(&mut self, key: &SourceKey) {
        self.entries.remove(key);
        self.dirty = true;
    }

    /// Run until the connection set is empty.
    pub fn run(&mut self, server: &mut Server) -> io::Result<()> {
        self.apply(server);

        let mut events = popol::Events::new();
        loop {
            if self.entries.is_empty() {
                return Ok(());
            }

            if self.dirty {
                self.order = self.entries.keys().copied().collect();
                self.order
                    .sort_by_key(|key| self.entries.get(key).map_or(u8::MAX, |e| e.priority));
                self.dirty = false;
            }
            let order = self.order.clone();

            // Snapshot timeouts and compute this pass's wait.
            let now = now_micros();
            let mut next_timeout = i64::MAX;
            let mut sources = popol::Sources::new();
            let mut polled_any = false;
            for key in &order {
                let Some(entry) = self.entries.get_mut(key) else {
                    continue;
                };
                let saved = entry.timer.save();
                if saved != -1 {
                    next_timeout = next_timeout.min(saved);
                }
                let Some(want) = entry.interest() else {
                    continue;
                };
                let interest = match want {
                    Want::Read => popol::interest::READ,
                    Want::Write => popol::interest::WRITE,
                    Want::All => popol::interest::ALL,
                };
                match &entry.endpoint {
                    Endpoint::LocalListener(l) | Endpoint::RemoteListener(l) => {
                        sources.register(*key, l, interest);
                    }
                    Endpoint::Udp(s) => sources.register(*key, s, interest),
                    Endpoint::Signal(s) => sources.register(*key, s, interest),
                    Endpoint::Conn { io: Some(io), .. } => {
                        sources.register(*key, &io.stream, interest);
                    }
                    Endpoint::Conn { io: None, .. } => {}
                }
                polled_any = true;
            }

            let timeout = if next_timeout == i64::MAX {
                if !polled_any {
                    // Nothing to wait on at all would sleep forever.
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "nothing to poll: all connections are idle with no timeout",
                    ));
                }
                WAIT_TIMEOUT
            } else if next_timeout <= now {
                // Already due: a non-blocking sweep.
                Duration::ZERO
            } else {
                // Waits shorter than a millisecond just burn CPU.
                Duration::from_micros(((next_timeout - now) as u64).max(1_000))
            };

            trace!(
                sources = self.entries.len(),
                timeout_ms = timeout.as_millis() as u64,
                "polling"
            );

            let result = sources.wait_timeout(&mut events, timeout);
            let now = now_micros();
            server.tick(now);

            match result {
                Ok(()) => {
                    // Sort ready sources back into connection priority order.
                    let mut ready: Vec<(SourceKey, Ready)> = Vec::new();
                    for (key, event) in events.iter() {
                        ready.push((
                            *key,
                            Ready {
                                readable: event.readable,
                                writable: event.writable,
                                errored: event.errored,
                                hangup: event.hangup,
                                invalid: event.invalid,
                            },
                        ));
                    }
                    ready.sort_by_key(|(key, _)| {
                        order.iter().position(|k| k == key).unwrap_or(usize::MAX)
                    });
                    for (key, event) in ready {
                        self.dispatch(key, event, server);
                        self.apply(server);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    // Signals arrive over the self-pipe; a bare interrupt is
                    // not something this loop can attribute to anything.
                    error!("poll was interrupted outside of signal delivery");
                    return Err(err);
                }
                Err(err) => return Err(err),
            }

            // Timeout callbacks fire against the pre-wait snapshot, so a
            // callback moving its own timer cannot affect this pass.
            for key in &order {
                let fired = match self.entries.get_mut(key) {
                    Some(entry) => entry.timer.fire(now),
                    None => false,
                };
                if fired {
                    if let SourceKey::Conn(id) = key {
                        server.timeout(*id);
                        self.apply(server);
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Event dispatch
    // -----------------------------------------------------------------------

    /// Per-connection callbacks, in fixed order: signal, accept, read,
    /// write, error, hangup, invalid.
    fn dispatch(&mut self, key: SourceKey, event: Ready, server: &mut Server) {
        if event.readable {
            match key {
                SourceKey::Signal => self.read_signal(server),
                SourceKey::LocalListener => self.accept_local(server),
                SourceKey::RemoteListener => self.accept_remote(server),
                SourceKey::Udp => self.read_udp(server),
                SourceKey::Conn(id) => self.read_stream(id, server),
            }
        }

        if event.writable {
            if let SourceKey::Conn(id) = key {
                self.write_stream(id, server);
            }
        }

        if (event.errored || event.hangup) && self.entries.contains_key(&key) {
            if let SourceKey::Conn(id) = key {
                // Reads above may already have detected EOF and removed the
                // entry; this is the path for errors with nothing to read.
                let still_connected = matches!(
                    self.entries.get(&key),
                    Some(Entry { endpoint: Endpoint::Conn { io: Some(_), .. }, .. })
                );
                if still_connected {
                    trace!(%id, "socket error or hangup");
                    self.stream_gone(id, server);
                }
            }
        }

        if event.invalid && self.entries.contains_key(&key) {
            // The descriptor was closed under us; any pending data was
            // drained above, now drop the source.
            error!(?key, "invalid socket in poll set, removing");
            match key {
                SourceKey::Conn(id) => {
                    // The read and hangup paths above may already have torn
                    // the stream down (dialers keep their retry timer).
                    let unhandled = matches!(
                        self.entries.get(&key),
                        Some(Entry { endpoint: Endpoint::Conn { io: Some(_), .. }, .. })
                    );
                    if unhandled {
                        self.stream_gone(id, server);
                    }
                }
                _ => self.remove(&key),
            }
        }
    }

    fn read_signal(&mut self, server: &mut Server) {
        let Some(Entry { endpoint: Endpoint::Signal(pipe), .. }) =
            self.entries.get_mut(&SourceKey::Signal)
        else {
            return;
        };
        let mut buf = [0u8; 16];
        let mut delivered = false;
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => delivered = true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("signal pipe read failed: {e}");
                    break;
                }
            }
        }
        if delivered {
            server.stop_requested();
        }
    }

    fn accept_local(&mut self, server: &mut Server) {
        loop {
            let Some(Entry { endpoint: Endpoint::LocalListener(listener), .. }) =
                self.entries.get(&SourceKey::LocalListener)
            else {
                return;
            };
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!("accept failed on the local listener: {e}");
                    return;
                }
            };
            if !peer.ip().is_loopback() {
                // Still served, but this listener is meant for this node.
                warn!(%peer, "received what should be a local connection from a remote address");
            }
            if let Err(e) = stream.set_nonblocking(true) {
                error!(%peer, "could not make the accepted socket non-blocking: {e}");
                continue;
            }
            let id = server.accepted_local();
            trace!(%id, %peer, "accepted local service connection");
            self.insert(
                SourceKey::Conn(id),
                Entry::new(
                    50,
                    Endpoint::Conn {
                        io: Some(StreamIo::new(stream, false)),
                        draining: false,
                    },
                ),
            );
        }
    }

    fn accept_remote(&mut self, server: &mut Server) {
        loop {
            let Some(Entry { endpoint: Endpoint::RemoteListener(listener), .. }) =
                self.entries.get(&SourceKey::RemoteListener)
            else {
                return;
            };
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!("accept failed on the remote listener: {e}");
                    return;
                }
            };
            if peer.ip().is_loopback() {
                error!(%peer, "received what should be a remote connection from loopback");
                continue;
            }
            if let Err(e) = stream.set_nonblocking(true) {
                error!(%peer, "could not make the accepted socket non-blocking: {e}");
                continue;
            }
            let id = server.accepted_remote(Address::new(peer.ip(), peer.port()));
            trace!(%id, %peer, "accepted peer connection");
            self.insert(
                SourceKey::Conn(id),
                Entry::new(
                    50,
                    Endpoint::Conn {
                        io: Some(StreamIo::new(stream, false)),
                        draining: false,
                    },
                ),
            );
        }
    }

    fn read_udp(&mut self, server: &mut Server) {
        loop {
            let Some(Entry { endpoint: Endpoint::Udp(socket), .. }) =
                self.entries.get(&SourceKey::Udp)
            else {
                return;
            };
            let mut buf = [0u8; UDP_DATAGRAM_SIZE];
            let (len, peer) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("UDP receive failed: {e}");
                    return;
                }
            };
            let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                warn!(%peer, "dropping non-UTF-8 datagram");
                continue;
            };
            let line = text.trim_end_matches(['\n', '\r']);
            match Message::from_wire(line) {
                Ok(message) => server.udp_message(message),
                Err(e) => warn!(%peer, "dropping invalid datagram: {e}"),
            }
        }
    }

    fn read_stream(&mut self, id: ConnectionId, server: &mut Server) {
        let key = SourceKey::Conn(id);
        let Some(Entry { endpoint: Endpoint::Conn { io: Some(io), .. }, .. }) =
            self.entries.get_mut(&key)
        else {
            return;
        };

        let mut buf = [0u8; READ_BUFFER_SIZE];
        match io.stream.read(&mut buf) {
            Ok(0) => {
                // Orderly shutdown from the other side.
                self.stream_gone(id, server);
                return;
            }
            Ok(count) => io.inbuf.extend_from_slice(&buf[..count]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                trace!(%id, "read error: {e}");
                self.stream_gone(id, server);
                return;
            }
        }

        // Split out complete lines; a partial line stays buffered.
        let mut lines: Vec<String> = Vec::new();
        while let Some(pos) = io.inbuf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = io.inbuf.drain(..=pos).collect();
            let raw = &raw[..raw.len() - 1];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }
            match std::str::from_utf8(raw) {
                Ok(line) => lines.push(line.to_owned()),
                Err(_) => warn!(%id, "dropping non-UTF-8 line"),
            }
        }

        for line in lines {
            match Message::from_wire(&line) {
                Ok(message) => {
                    server.message(id, message);
                    self.apply(server);
                }
                Err(e) => warn!(%id, %line, "dropping invalid message: {e}"),
            }
        }
    }

    fn write_stream(&mut self, id: ConnectionId, server: &mut Server) {
        let key = SourceKey::Conn(id);
        let Some(Entry { endpoint: Endpoint::Conn { io: Some(io), draining }, .. }) =
            self.entries.get_mut(&key)
        else {
            return;
        };

        if io.connecting {
            // A non-blocking connect reports completion through
            // writability; failure is carried in SO_ERROR.
            io.connecting = false;
            match io.stream.take_error() {
                Ok(None) => {
                    trace!(%id, "outbound connection established");
                    server.connected(id);
                }
                Ok(Some(e)) => {
                    debug!(%id, "outbound connection failed: {e}");
                    self.dial_gone(id, server);
                }
                Err(e) => {
                    debug!(%id, "outbound connection failed: {e}");
                    self.dial_gone(id, server);
                }
            }
            return;
        }

        while !io.outbuf.is_empty() {
            match io.stream.write(&io.outbuf) {
                Ok(0) => break,
                Ok(count) => {
                    io.outbuf.drain(..count);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    trace!(%id, "write error: {e}");
                    self.stream_gone(id, server);
                    return;
                }
            }
        }

        if io.outbuf.is_empty() && *draining {
            // The final reply is out; now the connection can go.
            self.remove(&key);
        }
    }

    /// An established stream is gone: tell the router and remove or, for a
    /// dialer, keep the timer-only entry so it can reconnect.
    fn stream_gone(&mut self, id: ConnectionId, server: &mut Server) {
        let key = SourceKey::Conn(id);
        // A connect that died before completing is a failed dial, not a
        // hangup of an established connection.
        let was_connecting = matches!(
            self.entries.get(&key),
            Some(Entry { endpoint: Endpoint::Conn { io: Some(io), .. }, .. }) if io.connecting
        );
        if was_connecting {
            self.dial_gone(id, server);
            return;
        }
        let is_dialer = server
            .connection(id)
            .map(|c| c.dialer.is_some())
            .unwrap_or(false);
        if is_dialer {
            if let Some(Entry { endpoint: Endpoint::Conn { io, .. }, .. }) =
                self.entries.get_mut(&key)
            {
                *io = None;
            }
        } else {
            self.remove(&key);
        }
        server.hangup(id);
        self.apply(server);
    }

    /// A dial attempt failed before the connection was up.
    fn dial_gone(&mut self, id: ConnectionId, server: &mut Server) {
        if let Some(Entry { endpoint: Endpoint::Conn { io, .. }, .. }) =
            self.entries.get_mut(&SourceKey::Conn(id))
        {
            *io = None;
        }
        server.dial_failed(id);
        self.apply(server);
    }

    // -----------------------------------------------------------------------
    // Router output application
    // -----------------------------------------------------------------------

    fn apply(&mut self, server: &mut Server) {
        let outputs: Vec<Output> = server.drain().collect();
        for output in outputs {
            match output {
                Output::Send(id, message) => self.queue_message(id, &message),
                Output::Dial(id, address) => self.start_dial(id, address, server),
                Output::Disconnect(id) => {
                    if let Some(Entry { endpoint: Endpoint::Conn { io, .. }, .. }) =
                        self.entries.get_mut(&SourceKey::Conn(id))
                    {
                        *io = None;
                    }
                }
                Output::Drop(id) => self.drop_conn(id),
                Output::SetTimeout(id, date) => {
                    let entry = self.ensure_conn(id);
                    entry.timer.set_date(date);
                }
                Output::StopListeners => {
                    self.remove(&SourceKey::LocalListener);
                    self.remove(&SourceKey::RemoteListener);
                    self.remove(&SourceKey::Udp);
                    self.remove(&SourceKey::Signal);
                }
                Output::ReloadLogging => {
                    if let Some(hook) = self.on_reload_logging.as_mut() {
                        hook();
                    }
                }
            }
        }
    }

    fn ensure_conn(&mut self, id: ConnectionId) -> &mut Entry {
        self.dirty = true;
        self.entries
            .entry(SourceKey::Conn(id))
            .or_insert_with(|| Entry::new(50, Endpoint::Conn { io: None, draining: false }))
    }

    fn queue_message(&mut self, id: ConnectionId, message: &Message) {
        let line = match message.to_wire() {
            Ok(line) => line,
            Err(e) => {
                error!(%id, "refusing to send an incomplete message: {e}");
                return;
            }
        };
        match self.entries.get_mut(&SourceKey::Conn(id)) {
            Some(Entry { endpoint: Endpoint::Conn { io: Some(io), .. }, .. }) => {
                trace!(%id, %line, "queueing message");
                io.outbuf.extend_from_slice(line.as_bytes());
                io.outbuf.push(b'\n');
            }
            _ => {
                // A dormant dialer: the message would go nowhere.
                debug!(%id, command = message.command(), "no socket for message, dropped");
            }
        }
    }

    fn start_dial(&mut self, id: ConnectionId, address: Address, server: &mut Server) {
        match start_connect(address.socket_addr()) {
            Ok(stream) => {
                let entry = self.ensure_conn(id);
                entry.endpoint = Endpoint::Conn {
                    io: Some(StreamIo::new(stream, true)),
                    draining: false,
                };
                trace!(%id, %address, "dialing");
            }
            Err(e) => {
                debug!(%id, %address, "connect failed immediately: {e}");
                server.dial_failed(id);
                // Re-entrancy is bounded: dial_failed only queues a timer.
                self.apply(server);
            }
        }
    }

    fn drop_conn(&mut self, id: ConnectionId) {
        let key = SourceKey::Conn(id);
        if let Some(Entry { endpoint: Endpoint::Conn { io: Some(io), draining }, .. }) =
            self.entries.get_mut(&key)
        {
            if !io.outbuf.is_empty() {
                // Let the final reply flush first; the write path removes
                // the entry once the buffer is empty.
                *draining = true;
                return;
            }
        }
        self.remove(&key);
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn sockaddr_of(addr: SocketAddr) -> (i32, libc::sockaddr_storage, libc::socklen_t) {
    // Safety: sockaddr_storage is plain bytes and large enough for both
    // families; only the matching prefix is written.
    unsafe {
        match addr {
            SocketAddr::V4(v4) => {
                let mut storage: libc::sockaddr_storage = std::mem::zeroed();
                let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                (
                    libc::AF_INET,
                    storage,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
            SocketAddr::V6(v6) => {
                let mut storage: libc::sockaddr_storage = std::mem::zeroed();
                let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (
                    libc::AF_INET6,
                    storage,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        }
    }
}

/// Begin a non-blocking TCP connect.  Returns the socket immediately; the
/// reactor learns the outcome through writability and `SO_ERROR`.
fn start_connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let (domain, storage, len) = sockaddr_of(addr);
    unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let rc = libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len);
        if rc == 0 {
            return Ok(TcpStream::from_raw_fd(fd));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            Ok(TcpStream::from_raw_fd(fd))
        } else {
            libc::close(fd);
            Err(err)
        }
    }
}

/// Bind a listener with an explicit accept backlog (`std` offers no way to
/// set one).
pub fn listen_with_backlog(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let (domain, storage, len) = sockaddr_of(addr);
    unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(one).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) != 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        if libc::listen(fd, backlog as libc::c_int) != 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        Ok(TcpListener::from_raw_fd(fd))
    }
}
