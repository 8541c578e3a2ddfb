//! Key/value storage backing the durable mailboxes.
//!
//! The mailbox engine talks to an abstract [`Store`]: point reads plus atomic
//! multi-key [`WriteBatch`] application with a synchronous flush. Two
//! implementations ship here:
//! - `memory` - a map under a mutex, for tests and memory-only nodes
//! - `disk` - a checksummed write-ahead log over an in-memory index
//!
//! A reserved `system` namespace holds the directory of declared mailbox
//! names; [`MailboxStorage`] is the surface the registry uses to materialize
//! mailboxes and to re-advertise routes at node startup.

pub mod disk;
pub mod memory;

pub use disk::{DiskStore, DiskStoreOptions};
pub use memory::MemoryStore;

use crate::mailbox::DurableMailbox;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

/// Key of the system record listing all declared mailbox names.
pub(crate) const SYSTEM_MAILBOXES_KEY: &str = "system/mailboxes";

/// Storage-layer failures. Decode failures of persisted records are
/// data-integrity errors, not I/O errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// One operation inside a [`WriteBatch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BatchOp {
    Put {
        key: String,
        #[serde(with = "crate::message::body_bytes")]
        value: Vec<u8>,
    },
    Delete {
        key: String,
    },
}

/// An ordered set of writes applied atomically and flushed together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteBatch {
    pub(crate) ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> WriteBatch {
        WriteBatch::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// The embedded key/value store abstraction.
pub trait Store: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Apply every op in order as one atomic, flushed write.
    fn apply(&self, batch: WriteBatch) -> Result<(), StoreError>;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.apply(batch)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.apply(batch)
    }
}

pub(crate) fn decode_names(data: &[u8]) -> Result<BTreeSet<String>, StoreError> {
    serde_json::from_slice(data)
        .map_err(|e| StoreError::Corrupt(format!("mailbox directory: {e}")))
}

pub(crate) fn encode_names(names: &BTreeSet<String>) -> Vec<u8> {
    serde_json::to_vec(names).expect("name set encoding is infallible")
}

/// Directory surface over a [`Store`]: materializes mailboxes and tracks the
/// set of declared names.
#[derive(Clone)]
pub struct MailboxStorage {
    store: Arc<dyn Store>,
}

impl MailboxStorage {
    pub fn new(store: Arc<dyn Store>) -> MailboxStorage {
        MailboxStorage { store }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Open the named mailbox, registering the name in the system directory.
    /// Idempotent: re-opening an existing name is a no-op on the directory.
    pub fn mailbox(&self, name: &str) -> Result<Arc<DurableMailbox>, StoreError> {
        let mut names = match self.store.get(SYSTEM_MAILBOXES_KEY)? {
            Some(data) => decode_names(&data)?,
            None => BTreeSet::new(),
        };
        if names.insert(name.to_string()) {
            self.store
                .put(SYSTEM_MAILBOXES_KEY, encode_names(&names))?;
        }
        Ok(Arc::new(DurableMailbox::new(
            self.store.clone(),
            name.to_string(),
        )))
    }

    /// All currently declared names; used to reinstate routes at startup.
    pub fn mailbox_names(&self) -> Result<Vec<String>, StoreError> {
        match self.store.get(SYSTEM_MAILBOXES_KEY)? {
            Some(data) => Ok(decode_names(&data)?.into_iter().collect()),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_registers_names_once() {
        let storage = MailboxStorage::new(Arc::new(MemoryStore::new()));
        storage.mailbox("a").unwrap();
        storage.mailbox("b").unwrap();
        storage.mailbox("a").unwrap();

        let mut names = storage.mailbox_names().unwrap();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put("k", b"one".to_vec());
        batch.delete("k");
        batch.put("k", b"two".to_vec());
        store.apply(batch).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"two".to_vec()));
    }
}
