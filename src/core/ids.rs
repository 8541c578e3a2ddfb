//! Message identifiers.
//!
//! A [`MessageId`] is a string of the form `base:localIndex`. The `base` is a
//! process-unique prefix assigned at push time; the trailing `:N` encodes the
//! owning mailbox's write slot and is what ack/nack addressing resolves.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use uuid::Uuid;

/// Identifier carried by every persisted and delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append the mailbox-local write slot, producing `base:slot`.
    pub fn append_local_index(&self, slot: u64) -> MessageId {
        MessageId(format!("{}:{}", self.0, slot))
    }

    /// Parse the trailing `:N` local index, if present.
    pub fn local_index(&self) -> Option<u64> {
        let (_, idx) = self.0.rsplit_once(':')?;
        idx.parse().ok()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        MessageId(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_string())
    }
}

static PROCESS_PREFIX: OnceLock<String> = OnceLock::new();
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Yield a process-unique message id. Ids are monotonic per process: a fixed
/// random prefix plus an increasing counter.
pub fn next_message_id() -> MessageId {
    let prefix = PROCESS_PREFIX.get_or_init(|| format!("m{}", Uuid::new_v4().simple()));
    let seq = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    MessageId(format!("{}-{}", prefix, seq))
}

/// Generate a mailbox name suitable for ephemeral reply queues.
pub fn random_mailbox_name() -> String {
    format!("gen-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let a = next_message_id();
        let b = next_message_id();
        assert_ne!(a, b);

        let seq = |id: &MessageId| -> u64 {
            id.as_str().rsplit_once('-').unwrap().1.parse().unwrap()
        };
        assert!(seq(&a) < seq(&b));
    }

    #[test]
    fn local_index_round_trip() {
        let id = next_message_id().append_local_index(7);
        assert_eq!(id.local_index(), Some(7));
    }

    #[test]
    fn local_index_absent() {
        assert_eq!(MessageId::from("plain").local_index(), None);
        assert_eq!(MessageId::from("bad:idx").local_index(), None);
    }
}
