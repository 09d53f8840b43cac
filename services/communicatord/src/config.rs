//! Daemon configuration loading.
//!
//! TOML is the sole config source; the CLI can point at a different file and
//! flip the debug flag but does not override individual keys.
//! Default config path: `/etc/snapcomm/communicatord.toml`.
//!
//! # Required fields
//! - `server_name` (unique within the cluster)
//! - `my_address` (the address peers dial; must belong to this machine)
//!
//! Every other key has a default.  Out-of-range values are a startup error:
//! the daemon logs and exits with code 1 rather than guessing.

use std::path::{Path, PathBuf};

use sc_protocol::Address;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Default TCP port for both listeners and for `addr`-only neighbor entries.
pub const DEFAULT_PORT: u16 = 4040;
/// Default UDP signal port.
pub const DEFAULT_SIGNAL_PORT: u16 = 4041;
pub const DEFAULT_CONFIG_PATH: &str = "/etc/snapcomm/communicatord.toml";
pub const DEFAULT_CACHE_PATH: &str = "/var/cache/snapcomm";

/// Server types a daemon may advertise.
pub const KNOWN_SERVER_TYPES: [&str; 4] = ["apache", "frontend", "backend", "cassandra"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config i/o error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Validated configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub server_name: String,
    /// Canonical comma list, subset of [`KNOWN_SERVER_TYPES`].
    pub server_types: String,
    /// Explicit neighbors from configuration, canonicalized; sent verbatim
    /// in handshakes.
    pub neighbors: String,
    /// Our advertised address; what peers dial and what `GOSSIP` carries.
    pub my_address: Address,
    /// Remote listener binding.  A loopback value disables peer listening.
    pub listen: Address,
    /// Local listener binding; must be loopback.
    pub local_listen: Address,
    /// UDP signal binding; must be loopback.
    pub signal: Address,
    pub max_connections: usize,
    pub max_pending_connections: u32,
    pub nice: Option<u8>,
    pub cache_path: PathBuf,
    /// Service whose `UNREGISTER` initiates a local shutdown.
    pub supervisor: String,
    /// Enables the strict capability checks; set from the command line.
    pub debug: bool,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization type (everything optional)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    server_name: Option<String>,
    server_types: Option<String>,
    neighbors: Option<String>,
    my_address: Option<String>,
    listen: Option<String>,
    local_listen: Option<String>,
    signal: Option<String>,
    max_connections: Option<i64>,
    max_pending_connections: Option<i64>,
    nice: Option<i64>,
    cache_path: Option<String>,
    supervisor: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(Path::new(DEFAULT_CONFIG_PATH))
}

pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let server_name = raw
        .server_name
        .ok_or_else(|| ConfigError::Invalid("server_name is required".to_owned()))?;
    if !is_plain_name(&server_name) {
        return Err(ConfigError::Invalid(format!(
            "server_name '{server_name}' must match [A-Za-z0-9_]+"
        )));
    }

    let listen = parse_address(raw.listen.as_deref().unwrap_or("0.0.0.0"), DEFAULT_PORT, "listen")?;

    let my_address = raw
        .my_address
        .ok_or_else(|| ConfigError::Invalid("my_address is required".to_owned()))?;
    let my_address = parse_address(&my_address, listen.port(), "my_address")?;

    let local_listen = parse_address(
        raw.local_listen.as_deref().unwrap_or("127.0.0.1"),
        DEFAULT_PORT,
        "local_listen",
    )?;
    if !local_listen.is_loopback() {
        return Err(ConfigError::Invalid(format!(
            "local_listen must be a loopback address, not {local_listen}"
        )));
    }

    let signal = parse_address(
        raw.signal.as_deref().unwrap_or("127.0.0.1"),
        DEFAULT_SIGNAL_PORT,
        "signal",
    )?;
    if !signal.is_loopback() {
        return Err(ConfigError::Invalid(format!(
            "signal must be a loopback address, not {signal}"
        )));
    }

    let max_connections = match raw.max_connections {
        None => 100,
        Some(n) if n >= 10 => n as usize,
        Some(n) => {
            return Err(ConfigError::Invalid(format!(
                "max_connections must be at least 10, not {n}"
            )));
        }
    };

    let max_pending_connections = match raw.max_pending_connections {
        None => 10,
        Some(n) if (5..=1000).contains(&n) => n as u32,
        Some(n) => {
            return Err(ConfigError::Invalid(format!(
                "max_pending_connections must be between 5 and 1000, not {n}"
            )));
        }
    };

    let nice = match raw.nice {
        None => None,
        Some(n) if (0..=19).contains(&n) => Some(n as u8),
        Some(n) => {
            return Err(ConfigError::Invalid(format!(
                "nice must be between 0 and 19, not {n}"
            )));
        }
    };

    let server_types = canonicalize_server_types(raw.server_types.as_deref().unwrap_or(""));
    let neighbors = canonicalize_neighbors(raw.neighbors.as_deref().unwrap_or(""), listen.port())?;

    Ok(Config {
        server_name,
        server_types,
        neighbors,
        my_address,
        listen,
        local_listen,
        signal,
        max_connections,
        max_pending_connections,
        nice,
        cache_path: PathBuf::from(raw.cache_path.as_deref().unwrap_or(DEFAULT_CACHE_PATH)),
        supervisor: raw.supervisor.unwrap_or_else(|| "supervisor".to_owned()),
        debug: false,
    })
}

fn parse_address(value: &str, default_port: u16, key: &str) -> Result<Address, ConfigError> {
    Address::parse(value, default_port)
        .map_err(|e| ConfigError::Invalid(format!("{key}: {e}")))
}

fn is_plain_name(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Keep the known server types, in input order, without duplicates; anything
/// else is dropped with a warning.
pub fn canonicalize_server_types(types: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for entry in types.split(',') {
        let entry = entry.trim();
        if entry.is_empty() || kept.contains(&entry) {
            continue;
        }
        if KNOWN_SERVER_TYPES.contains(&entry) {
            kept.push(entry);
        } else {
            warn!(server_type = %entry, "ignoring unknown server type");
        }
    }
    kept.join(",")
}

/// Canonicalize a comma list of `addr[:port]` neighbor entries.  Unlike
/// server types, a bad neighbor address is a configuration error.
pub fn canonicalize_neighbors(neighbors: &str, default_port: u16) -> Result<String, ConfigError> {
    let mut kept: Vec<String> = Vec::new();
    for entry in neighbors.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let addr = Address::parse(entry, default_port)
            .map_err(|e| ConfigError::Invalid(format!("neighbors: {e}")))?;
        let canonical = addr.to_string();
        if !kept.contains(&canonical) {
            kept.push(canonical);
        }
    }
    Ok(kept.join(","))
}
