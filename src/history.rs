//! History Store: the process-wide, append-only conversation log.
//!
//! Independent mutual-exclusion domain from the [`crate::registry::Registry`]
//! so that history reads never block presence operations, per the
//! concurrency model. Grounded on the same "plain `HashMap` behind a
//! synchronous `Mutex`" shape as the registry.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::codec::BROADCAST;

/// Maximum entries a `HistoryResponse` frame can declare (one wire byte).
pub const WIRE_CAP: usize = 255;

#[derive(Debug)]
pub struct History {
    conversations: Mutex<HashMap<String, Vec<(String, Vec<u8>)>>>,
}

impl History {
    pub fn new() -> Self {
        Self { conversations: Mutex::new(HashMap::new()) }
    }

    /// The canonical identifier for a conversation between `a` and `b`.
    /// Either side being `~` yields the broadcast channel's own id.
    pub fn chat_id_for(a: &str, b: &str) -> String {
        if a == BROADCAST || b == BROADCAST {
            return BROADCAST.to_owned();
        }
        if a <= b {
            format!("{a}-{b}")
        } else {
            format!("{b}-{a}")
        }
    }

    /// Append one (sender, body) entry under `chat_id`, creating the list
    /// on first use.
    pub fn append(&self, chat_id: &str, sender: &str, body: &[u8]) {
        let mut conversations = self.conversations.lock().expect("history mutex poisoned");
        conversations.entry(chat_id.to_owned()).or_default().push((sender.to_owned(), body.to_vec()));
    }

    /// A stable copy of `chat_id`'s full history, in insertion order.
    pub fn read(&self, chat_id: &str) -> Vec<(String, Vec<u8>)> {
        let conversations = self.conversations.lock().expect("history mutex poisoned");
        conversations.get(chat_id).cloned().unwrap_or_default()
    }

    /// `read`, truncated to the first [`WIRE_CAP`] entries for framing.
    pub fn read_capped(&self, chat_id: &str) -> Vec<(String, Vec<u8>)> {
        let mut entries = self.read(chat_id);
        entries.truncate(WIRE_CAP);
        entries
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}
