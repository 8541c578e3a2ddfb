//! The durable mailbox engine.
//!
//! Persisted header per mailbox: `AckIndex <= ReadIndex <= WriteIndex`,
//! unread `Size`, read-but-unacked `InFlight`, and `DCMessages` - indices
//! re-offered out of order after a nack of a non-tail message. A message at
//! slot `i` is physically present iff `AckIndex <= i < WriteIndex` and `i`
//! has not been acked. Every operation is serialized under the mailbox lock
//! and persisted as one atomic batch.

use crate::core::ids::{next_message_id, MessageId};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::storage::{
    decode_names, encode_names, Store, WriteBatch, SYSTEM_MAILBOXES_KEY,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

/// Counters reported by [`DurableMailbox::stats`]: pollable backlog
/// (including re-offered nacks) and read-but-unacked deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStats {
    pub size: u64,
    pub in_flight: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MailboxHeader {
    ack_index: u64,
    read_index: u64,
    write_index: u64,
    size: u64,
    in_flight: u64,
    #[serde(default)]
    dc_messages: VecDeque<u64>,
}

/// A registered one-shot delivery slot. Dropping the receiver counts as
/// cancellation, as does a fired cancel signal.
struct Watcher {
    tx: oneshot::Sender<Option<Message>>,
    cancel: Option<watch::Receiver<bool>>,
}

impl Watcher {
    fn canceled(&self) -> bool {
        if self.tx.is_closed() {
            return true;
        }
        self.cancel.as_ref().map(|c| *c.borrow()).unwrap_or(false)
    }
}

struct MailboxInner {
    watchers: VecDeque<Watcher>,
}

pub struct DurableMailbox {
    store: Arc<dyn Store>,
    name: String,
    inner: Mutex<MailboxInner>,
}

impl DurableMailbox {
    pub fn new(store: Arc<dyn Store>, name: String) -> DurableMailbox {
        DurableMailbox {
            store,
            name,
            inner: Mutex::new(MailboxInner {
                watchers: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn info_key(&self) -> String {
        format!("{}/info", self.name)
    }

    fn msg_key(&self, slot: u64) -> String {
        format!("{}/m-{}", self.name, slot)
    }

    fn load_header(&self) -> Result<Option<MailboxHeader>> {
        match self.store.get(&self.info_key())? {
            Some(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|_| Error::CorruptMailbox),
            None => Ok(None),
        }
    }

    fn encode_header(header: &MailboxHeader) -> Vec<u8> {
        serde_json::to_vec(header).expect("header encoding is infallible")
    }

    /// Append a message, assigning its id if empty and suffixing the write
    /// slot. If a live watcher is waiting the message is handed to it
    /// directly (counted in-flight); otherwise it joins the backlog.
    pub fn push(&self, msg: &Message) -> Result<MessageId> {
        let mut inner = self.inner.lock();

        let mut header = self.load_header()?.unwrap_or_default();
        let mut msg = msg.clone();
        if msg.message_id.is_empty() {
            msg.message_id = next_message_id();
        }
        let slot = header.write_index;
        msg.message_id = msg.message_id.append_local_index(slot);

        let mut batch = WriteBatch::new();
        batch.put(self.msg_key(slot), msg.encode());
        header.write_index += 1;

        // Deliver to the head of the watcher queue, skipping any whose
        // cancel already fired; a dropped skip completes that watcher.
        let mut target = None;
        while let Some(watcher) = inner.watchers.pop_front() {
            if watcher.canceled() {
                continue;
            }
            target = Some(watcher);
            break;
        }

        if target.is_some() {
            header.read_index += 1;
            header.in_flight += 1;
        } else {
            header.size += 1;
        }

        batch.put(self.info_key(), Self::encode_header(&header));
        self.store.apply(batch)?;

        if let Some(watcher) = target {
            let _ = watcher.tx.send(Some(msg.clone()));
        }
        Ok(msg.message_id)
    }

    /// Non-blocking read. Re-offered nacks come first, then the read cursor.
    /// The slot is kept until acked.
    pub fn poll(&self) -> Result<Option<Message>> {
        let _inner = self.inner.lock();

        let Some(mut header) = self.load_header()? else {
            return Ok(None);
        };

        let slot = if let Some(slot) = header.dc_messages.pop_front() {
            slot
        } else {
            if header.size == 0 {
                return Ok(None);
            }
            let slot = header.read_index;
            header.read_index += 1;
            header.size -= 1;
            slot
        };

        let Some(data) = self.store.get(&self.msg_key(slot))? else {
            return Err(Error::CorruptMailbox);
        };

        header.in_flight += 1;
        self.store.put(&self.info_key(), Self::encode_header(&header))?;
        Message::decode(&data).map(Some)
    }

    /// Acknowledge a delivered message, deleting its slot. Valid only while
    /// the local index lies in `[AckIndex, ReadIndex)`.
    pub fn ack(&self, id: &MessageId) -> Result<()> {
        let _inner = self.inner.lock();

        let Some(mut header) = self.load_header()? else {
            return Err(Error::UnknownMessage);
        };
        let Some(slot) = id.local_index() else {
            return Err(Error::UnknownMessage);
        };

        if header.read_index == header.ack_index {
            return Err(Error::UnknownMessage);
        }
        if slot < header.ack_index || slot >= header.read_index {
            return Err(Error::UnknownMessage);
        }

        let mut batch = WriteBatch::new();
        batch.delete(self.msg_key(slot));

        // Messages may be acked discontiguously; AckIndex tracks the oldest
        // un-acked slot, skipping any already deleted out of order.
        if slot == header.ack_index {
            header.ack_index += 1;
            while header.ack_index < header.read_index
                && self.store.get(&self.msg_key(header.ack_index))?.is_none()
            {
                header.ack_index += 1;
            }
        }

        header.in_flight = header.in_flight.saturating_sub(1);
        batch.put(self.info_key(), Self::encode_header(&header));
        self.store.apply(batch)?;
        Ok(())
    }

    /// Return a delivered message to the mailbox. Nack of the most recent
    /// read rewinds the cursor; earlier slots are queued for discontiguous
    /// redelivery ahead of fresh reads.
    pub fn nack(&self, id: &MessageId) -> Result<()> {
        let _inner = self.inner.lock();

        let Some(slot) = id.local_index() else {
            return Err(Error::UnknownMessage);
        };
        let Some(mut header) = self.load_header()? else {
            return Err(Error::UnknownMessage);
        };

        if slot < header.ack_index || slot >= header.read_index {
            return Err(Error::UnknownMessage);
        }

        header.in_flight = header.in_flight.saturating_sub(1);

        if slot == header.read_index - 1 {
            header.read_index -= 1;
            header.size += 1;
        } else {
            header.dc_messages.push_back(slot);
        }

        self.store.put(&self.info_key(), Self::encode_header(&header))?;
        Ok(())
    }

    /// Signal every watcher with nothing, purge all slots and the header,
    /// and deregister the name from the system directory.
    pub fn abandon(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        for watcher in inner.watchers.drain(..) {
            let _ = watcher.tx.send(None);
        }

        let mut batch = WriteBatch::new();
        if let Some(header) = self.load_header()? {
            for slot in header.ack_index..header.write_index {
                batch.delete(self.msg_key(slot));
            }
        }
        batch.delete(self.info_key());

        if let Some(data) = self.store.get(SYSTEM_MAILBOXES_KEY)? {
            let mut names = decode_names(&data)?;
            if names.remove(&self.name) {
                batch.put(SYSTEM_MAILBOXES_KEY, encode_names(&names));
            }
        }

        self.store.apply(batch)?;
        Ok(())
    }

    /// Register a one-shot delivery slot fed by the next push.
    pub fn add_watcher(&self) -> oneshot::Receiver<Option<Message>> {
        self.register_watcher(None)
    }

    /// Register a watcher that a fired cancel signal invalidates.
    pub fn add_watcher_cancelable(
        &self,
        cancel: watch::Receiver<bool>,
    ) -> oneshot::Receiver<Option<Message>> {
        self.register_watcher(Some(cancel))
    }

    fn register_watcher(
        &self,
        cancel: Option<watch::Receiver<bool>>,
    ) -> oneshot::Receiver<Option<Message>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().watchers.push_back(Watcher { tx, cancel });
        rx
    }

    pub fn stats(&self) -> Result<MailboxStats> {
        let _inner = self.inner.lock();
        let header = self.load_header()?.unwrap_or_default();
        Ok(MailboxStats {
            size: header.size + header.dc_messages.len() as u64,
            in_flight: header.in_flight,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn mailbox(name: &str) -> DurableMailbox {
        DurableMailbox::new(Arc::new(MemoryStore::new()), name.to_string())
    }

    #[test]
    fn push_then_poll() {
        let m = mailbox("a");
        let msg = Message::new(b"hello".to_vec());
        m.push(&msg).unwrap();

        let out = m.poll().unwrap().unwrap();
        assert!(out.equal(&msg));
        assert_eq!(out.message_id.local_index(), Some(0));
        assert!(m.poll().unwrap().is_none());
    }

    #[test]
    fn preserves_fifo_order() {
        let m = mailbox("a");
        m.push(&Message::new(b"first".to_vec())).unwrap();
        m.push(&Message::new(b"second".to_vec())).unwrap();

        assert_eq!(m.poll().unwrap().unwrap().body, b"first");
        assert_eq!(m.poll().unwrap().unwrap().body, b"second");
        assert!(m.poll().unwrap().is_none());
    }

    #[test]
    fn ack_window_is_enforced() {
        let m = mailbox("a");
        m.push(&Message::new(b"x".to_vec())).unwrap();

        // Nothing read yet: nothing ackable.
        assert!(matches!(
            m.ack(&MessageId::from("m:0")),
            Err(Error::UnknownMessage)
        ));

        let out = m.poll().unwrap().unwrap();
        m.ack(&out.message_id).unwrap();

        // Slot gone, second ack rejected.
        assert!(matches!(
            m.ack(&out.message_id),
            Err(Error::UnknownMessage)
        ));
    }

    #[test]
    fn ack_out_of_order_advances_past_holes() {
        let m = mailbox("a");
        for body in [b"0".to_vec(), b"1".to_vec(), b"2".to_vec()] {
            m.push(&Message::new(body)).unwrap();
        }
        let d0 = m.poll().unwrap().unwrap();
        let d1 = m.poll().unwrap().unwrap();
        let d2 = m.poll().unwrap().unwrap();

        m.ack(&d1.message_id).unwrap();
        m.ack(&d2.message_id).unwrap();
        // Acking the oldest must jump over the two deleted slots.
        m.ack(&d0.message_id).unwrap();

        assert_eq!(m.stats().unwrap(), MailboxStats::default());
    }

    #[test]
    fn tail_nack_rewinds_cursor() {
        let m = mailbox("a");
        m.push(&Message::new(b"m1".to_vec())).unwrap();
        m.push(&Message::new(b"m2".to_vec())).unwrap();

        let m1 = m.poll().unwrap().unwrap();
        let m2 = m.poll().unwrap().unwrap();

        // Tail first: cursor rewinds.
        m.nack(&m2.message_id).unwrap();
        let again = m.poll().unwrap().unwrap();
        assert!(again.equal(&m2));

        // Non-tail goes through the discontiguous list, ahead of fresh reads.
        m.nack(&m1.message_id).unwrap();
        m.push(&Message::new(b"m3".to_vec())).unwrap();
        let redelivered = m.poll().unwrap().unwrap();
        assert!(redelivered.equal(&m1));
        assert!(m.poll().unwrap().unwrap().equal(&Message::new(b"m3".to_vec())));
    }

    #[test]
    fn nack_outside_window_is_rejected() {
        let m = mailbox("a");
        m.push(&Message::new(b"x".to_vec())).unwrap();
        assert!(matches!(
            m.nack(&MessageId::from("m:0")),
            Err(Error::UnknownMessage)
        ));
    }

    #[test]
    fn watcher_receives_push_directly() {
        let m = mailbox("a");
        let mut watch = m.add_watcher();

        let msg = Message::new(b"hello".to_vec());
        m.push(&msg).unwrap();

        let got = watch.try_recv().unwrap().unwrap();
        assert!(got.equal(&msg));

        // Delivered in-flight, nothing in the backlog.
        let stats = m.stats().unwrap();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.in_flight, 1);
    }

    #[test]
    fn push_skips_canceled_watchers() {
        let m = mailbox("a");
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut dead = m.add_watcher_cancelable(cancel_rx);
        let mut live = m.add_watcher();
        cancel_tx.send(true).unwrap();

        m.push(&Message::new(b"x".to_vec())).unwrap();

        assert!(dead.try_recv().is_err());
        assert!(live.try_recv().unwrap().is_some());
    }

    #[test]
    fn abandon_signals_watchers_and_purges() {
        let store = Arc::new(MemoryStore::new());
        let storage = crate::storage::MailboxStorage::new(store.clone());
        let m = storage.mailbox("a").unwrap();
        m.push(&Message::new(b"x".to_vec())).unwrap();
        let mut watch = m.add_watcher();

        m.abandon().unwrap();

        assert!(watch.try_recv().unwrap().is_none());
        assert!(storage.mailbox_names().unwrap().is_empty());
        assert!(m.poll().unwrap().is_none());
    }

    #[test]
    fn stats_count_backlog_and_in_flight() {
        let m = mailbox("a");
        assert_eq!(m.stats().unwrap(), MailboxStats::default());

        m.push(&Message::new(b"1".to_vec())).unwrap();
        m.push(&Message::new(b"2".to_vec())).unwrap();
        assert_eq!(m.stats().unwrap().size, 2);

        let d1 = m.poll().unwrap().unwrap();
        let d2 = m.poll().unwrap().unwrap();
        let stats = m.stats().unwrap();
        assert_eq!((stats.size, stats.in_flight), (0, 2));

        // Nacked messages count toward size again until re-polled.
        m.nack(&d2.message_id).unwrap();
        m.nack(&d1.message_id).unwrap();
        let stats = m.stats().unwrap();
        assert_eq!((stats.size, stats.in_flight), (2, 0));
    }
}
