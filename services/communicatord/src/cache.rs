//! In-memory caches owned by the router: the local message cache and the
//! broadcast deduplication table.

use std::collections::HashMap;

use sc_protocol::Message;

/// Messages addressed to a service that is expected on this node but has not
/// registered yet.  Drained in arrival order when the service registers.
#[derive(Debug, Default)]
pub struct LocalCache {
    messages: Vec<Message>,
}

impl LocalCache {
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Remove and return, in FIFO order, every cached message addressed to
    /// `service`.  Messages for other services stay put.
    pub fn drain_for(&mut self, service: &str) -> Vec<Message> {
        let mut drained = Vec::new();
        self.messages.retain(|m| {
            if m.service() == service {
                drained.push(m.clone());
                false
            } else {
                true
            }
        });
        drained
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Remembered broadcast message ids, each with the expiry carried by the
/// message itself.  A msgid seen twice is a flooding loop and the second
/// copy is dropped.
#[derive(Debug, Default)]
pub struct BroadcastDedup {
    seen: HashMap<String, i64>,
}

impl BroadcastDedup {
    /// Record `msgid` with its expiry.  Returns false when the id was
    /// already present (the message must be dropped).  Expired entries are
    /// swept on every call.
    pub fn check_and_record(&mut self, msgid: &str, timeout: i64, now: i64) -> bool {
        if self.seen.contains_key(msgid) {
            return false;
        }
        self.seen.retain(|_, expiry| *expiry >= now);
        self.seen.insert(msgid.to_owned(), timeout);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
