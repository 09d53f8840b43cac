//! The neighbor set and its on-disk cache.
//!
//! Every `addr:port` this daemon has ever learned about, from configuration,
//! handshake `neighbors` parameters or `GOSSIP`.  The whole set is rewritten
//! to `neighbors.txt` on each mutation and reloaded before any dialer is
//! created on startup; a truncated file merely shrinks the known set and
//! gossip recovers the rest.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sc_protocol::Address;
use tracing::{error, warn};

pub const NEIGHBORS_FILE: &str = "neighbors.txt";

#[derive(Debug)]
pub struct NeighborSet {
    /// Cache file location; `None` disables persistence (used by tests and
    /// in-memory router harnesses).
    path: Option<PathBuf>,
    all: BTreeSet<Address>,
}

impl NeighborSet {
    /// Create an in-memory set with no backing file.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            all: BTreeSet::new(),
        }
    }

    /// Load the neighbor cache from `cache_path/neighbors.txt`, creating the
    /// directory when missing.  Unparsable lines are skipped with a warning;
    /// `#` lines are comments.
    pub fn load(cache_path: &Path, default_port: u16) -> io::Result<Self> {
        fs::create_dir_all(cache_path)?;
        let path = cache_path.join(NEIGHBORS_FILE);

        let mut all = BTreeSet::new();
        match fs::read_to_string(&path) {
            Ok(contents) => {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    match Address::parse(line, default_port) {
                        Ok(addr) => {
                            all.insert(addr);
                        }
                        Err(e) => warn!(%line, "skipping bad neighbor cache line: {e}"),
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(Self {
            path: Some(path),
            all,
        })
    }

    /// Add one address.  Returns true when the set changed; a change is
    /// written back to disk immediately.
    pub fn add(&mut self, address: Address) -> bool {
        if !self.all.insert(address) {
            return false;
        }
        self.save();
        true
    }

    /// Add a comma-separated `addr[:port]` list, e.g. from a handshake
    /// `neighbors` parameter.  Returns true when anything new was added.
    pub fn add_list(&mut self, list: &str, default_port: u16) -> bool {
        let mut changed = false;
        for entry in list.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match Address::parse(entry, default_port) {
                Ok(addr) => changed |= self.all.insert(addr),
                Err(e) => warn!(%entry, "ignoring bad neighbor address: {e}"),
            }
        }
        if changed {
            self.save();
        }
        changed
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.all.contains(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.all.iter()
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = self.write_file(path) {
            error!(path = %path.display(), "could not write neighbor cache: {e}");
        }
    }

    fn write_file(&self, path: &Path) -> io::Result<()> {
        let mut file = fs::File::create(path)?;
        for addr in &self.all {
            writeln!(file, "{addr}")?;
        }
        Ok(())
    }
}
