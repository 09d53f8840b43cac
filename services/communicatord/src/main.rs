// communicatord: the cluster signalling bus daemon.

use std::net::UdpSocket;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::exit;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Arg, ArgAction, Command};
use communicatord::config::{self, Config};
use communicatord::reactor;
use communicatord::{NeighborSet, Reactor, Server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn main() {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_filter_reloading();
    let reload_handle = builder.reload_handle();
    builder.init();

    let matches = Command::new("communicatord")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Cluster-wide inter-process signalling bus daemon")
        .arg(
            Arg::new("config")
                .help("Path to the TOML configuration file")
                .short('c')
                .long("config")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(config::DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("debug")
                .help("Enable the strict capability checks (abort on violations)")
                .long("debug")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    info!(version = env!("CARGO_PKG_VERSION"), "communicatord starting");

    let config_path = matches
        .get_one::<PathBuf>("config")
        .expect("config has a default");
    let mut config = match config::load_config_from_path(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            exit(1);
        }
    };
    config.debug = matches.get_flag("debug");

    let reload_hook: Box<dyn FnMut()> = Box::new(move || {
        if reload_handle.reload(env_filter()).is_err() {
            warn!("could not reload the logging filter");
        }
    });

    if let Err(e) = run(config, reload_hook) {
        eprintln!("FATAL: {e}");
        exit(1);
    }
}

fn run(config: Config, reload_hook: Box<dyn FnMut()>) -> Result<(), String> {
    // The advertised address must actually belong to this machine, or no
    // peer would ever reach us back.
    if UdpSocket::bind((config.my_address.ip(), 0)).is_err() {
        return Err(format!(
            "my_address \"{}\" not found on this computer; \
copied the configuration file and forgot to change that entry?",
            config.my_address
        ));
    }

    if let Some(nice) = config.nice {
        // Process 0 is self.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, i32::from(nice)) };
        if rc != 0 {
            warn!(nice, "could not lower process priority");
        }
    }
    raise_fd_limit(config.max_connections);

    let neighbors = match NeighborSet::load(&config.cache_path, config.listen.port()) {
        Ok(neighbors) => neighbors,
        Err(e) => {
            warn!(
                path = %config.cache_path.display(),
                "could not read the neighbor cache, starting empty: {e}"
            );
            NeighborSet::in_memory()
        }
    };

    let mut reactor = Reactor::new();
    reactor.set_reload_logging(reload_hook);

    // The local listener serves services on this node.
    let backlog = config.max_pending_connections;
    let local = reactor::listen_with_backlog(config.local_listen.socket_addr(), backlog)
        .map_err(|e| format!("binding local listener {}: {e}", config.local_listen))?;
    reactor
        .set_local_listener(local)
        .map_err(|e| format!("local listener: {e}"))?;
    info!(address = %config.local_listen, "local listener up");

    // The remote listener serves peer daemons; a loopback binding would be
    // unreachable for them, so it is skipped with a warning.
    if config.listen.is_loopback() {
        warn!(
            address = %config.listen,
            "remote \"listen\" address is loopback, no peer connections will be possible"
        );
    } else {
        let remote = reactor::listen_with_backlog(config.listen.socket_addr(), backlog)
            .map_err(|e| format!("binding remote listener {}: {e}", config.listen))?;
        reactor
            .set_remote_listener(remote)
            .map_err(|e| format!("remote listener: {e}"))?;
        info!(address = %config.listen, "remote listener up");
    }

    let udp = UdpSocket::bind(config.signal.socket_addr())
        .map_err(|e| format!("binding UDP signal socket {}: {e}", config.signal))?;
    reactor.set_udp(udp).map_err(|e| format!("udp socket: {e}"))?;

    // SIGINT/SIGTERM arrive as one byte on a self-pipe and are handled as a
    // local STOP.
    let (signal_read, signal_write) =
        UnixStream::pair().map_err(|e| format!("signal pipe: {e}"))?;
    let write_clone = signal_write
        .try_clone()
        .map_err(|e| format!("signal pipe: {e}"))?;
    signal_hook::low_level::pipe::register(signal_hook::consts::SIGTERM, signal_write)
        .map_err(|e| format!("registering SIGTERM: {e}"))?;
    signal_hook::low_level::pipe::register(signal_hook::consts::SIGINT, write_clone)
        .map_err(|e| format!("registering SIGINT: {e}"))?;
    reactor
        .set_signal(signal_read)
        .map_err(|e| format!("signal pipe: {e}"))?;

    let mut server = Server::new(config, neighbors);
    server.initialize(now_micros());

    info!("entering the event loop");
    reactor.run(&mut server).map_err(|e| e.to_string())?;
    info!("all connections gone, exiting");
    Ok(())
}

/// Lift the open-file soft limit toward the hard limit so `max_connections`
/// sockets actually fit.
fn raise_fd_limit(max_connections: usize) {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return;
    }
    let wanted = (max_connections as libc::rlim_t).saturating_add(64);
    if limit.rlim_cur < wanted {
        limit.rlim_cur = wanted.min(limit.rlim_max);
        let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) };
        if rc != 0 {
            warn!(wanted, "could not raise the open file limit");
        }
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
