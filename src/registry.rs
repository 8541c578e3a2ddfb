//! The in-process mailbox registry and long-poll coordination.
//!
//! The registry owns every mailbox on this node; external holders keep only
//! the name. Long-polls register a one-shot watcher with the mailbox and
//! wait outside the registry lock, so pushes are never blocked by waiters.

use crate::core::ids::MessageId;
use crate::error::{Error, Result};
use crate::mailbox::DurableMailbox;
use crate::message::Message;
use crate::storage::{MailboxStorage, MemoryStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::warn;

/// Where a delivery's ack/nack lands: the owning mailbox for local
/// deliveries, the remote client for wire deliveries.
#[async_trait]
pub trait AckSource: Send + Sync {
    async fn ack(&self, id: &MessageId) -> Result<()>;
    async fn nack(&self, id: &MessageId) -> Result<()>;
}

#[async_trait]
impl AckSource for DurableMailbox {
    async fn ack(&self, id: &MessageId) -> Result<()> {
        DurableMailbox::ack(self, id)
    }

    async fn nack(&self, id: &MessageId) -> Result<()> {
        DurableMailbox::nack(self, id)
    }
}

/// A polled message plus the handles to settle it. Live from the poll result
/// until the first of ack, nack, or owning-session termination (which nacks).
pub struct Delivery {
    pub message: Message,
    source: Arc<dyn AckSource>,
}

impl Delivery {
    pub fn new(message: Message, source: Arc<dyn AckSource>) -> Delivery {
        Delivery { message, source }
    }

    pub async fn ack(&self) -> Result<()> {
        self.source.ack(&self.message.message_id).await
    }

    pub async fn nack(&self) -> Result<()> {
        self.source.nack(&self.message.message_id).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message.message_id)
            .finish()
    }
}

/// The mailbox surface consumed by the session server and the HTTP gateway.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn declare(&self, name: &str) -> Result<()>;
    async fn abandon(&self, name: &str) -> Result<()>;
    async fn push(&self, name: &str, msg: &Message) -> Result<()>;
    async fn poll(&self, name: &str) -> Result<Option<Delivery>>;
    async fn long_poll(&self, name: &str, wait: Duration) -> Result<Option<Delivery>>;
    async fn long_poll_cancelable(
        &self,
        name: &str,
        wait: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<Option<Delivery>>;
}

pub struct Registry {
    storage: MailboxStorage,
    mailboxes: Mutex<HashMap<String, Arc<DurableMailbox>>>,
}

impl Registry {
    pub fn new(storage: MailboxStorage) -> Registry {
        Registry {
            storage,
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    /// A registry over an in-memory store.
    pub fn memory() -> Registry {
        Registry::new(MailboxStorage::new(Arc::new(MemoryStore::new())))
    }

    /// The mailbox for `name`, if declared.
    pub fn mailbox(&self, name: &str) -> Option<Arc<DurableMailbox>> {
        self.mailboxes.lock().get(name).cloned()
    }

    /// Create-if-absent; redeclare is a no-op.
    pub fn declare(&self, name: &str) -> Result<()> {
        let mut mailboxes = self.mailboxes.lock();
        if !mailboxes.contains_key(name) {
            mailboxes.insert(name.to_string(), self.storage.mailbox(name)?);
        }
        Ok(())
    }

    pub fn abandon(&self, name: &str) -> Result<()> {
        let mailbox = self.mailboxes.lock().remove(name);
        if let Some(mailbox) = mailbox {
            mailbox.abandon()?;
        }
        Ok(())
    }

    pub fn push(&self, name: &str, msg: &Message) -> Result<()> {
        let mailbox = self.mailbox(name).ok_or(Error::NoMailbox)?;
        mailbox.push(msg)?;
        Ok(())
    }

    /// Non-blocking poll. Forgiving: an undeclared name yields `None`.
    pub fn poll(&self, name: &str) -> Result<Option<Delivery>> {
        let Some(mailbox) = self.mailbox(name) else {
            return Ok(None);
        };
        match mailbox.poll()? {
            Some(msg) => Ok(Some(Delivery::new(msg, mailbox))),
            None => Ok(None),
        }
    }

    /// Wait up to `wait` for a message. A timeout or an abandoned mailbox
    /// yields `Ok(None)`.
    pub async fn long_poll(&self, name: &str, wait: Duration) -> Result<Option<Delivery>> {
        let mailbox = self.mailbox(name).ok_or(Error::NoMailbox)?;
        if let Some(msg) = mailbox.poll()? {
            return Ok(Some(Delivery::new(msg, mailbox)));
        }

        let mut rx = mailbox.add_watcher();
        let msg = tokio::select! {
            res = &mut rx => res.ok().flatten(),
            () = tokio::time::sleep(wait) => None,
        };
        Ok(settle_wakeup(&mailbox, &mut rx, msg))
    }

    /// [`Registry::long_poll`] that additionally completes when `cancel`
    /// fires; the session server passes its shutdown channel here so closing
    /// a session unblocks its pollers.
    pub async fn long_poll_cancelable(
        &self,
        name: &str,
        wait: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<Option<Delivery>> {
        let mailbox = self.mailbox(name).ok_or(Error::NoMailbox)?;
        if let Some(msg) = mailbox.poll()? {
            return Ok(Some(Delivery::new(msg, mailbox)));
        }

        let mut rx = mailbox.add_watcher_cancelable(cancel.clone());
        let msg = tokio::select! {
            res = &mut rx => res.ok().flatten(),
            () = tokio::time::sleep(wait) => None,
            () = cancel_fired(cancel) => None,
        };
        Ok(settle_wakeup(&mailbox, &mut rx, msg))
    }
}

/// Resolve the wake-up race: if the watcher slot holds a message but we are
/// returning empty (cancel or timeout won the select), the message was
/// already counted in-flight and must be nacked back so it is not lost.
fn settle_wakeup(
    mailbox: &Arc<DurableMailbox>,
    rx: &mut oneshot::Receiver<Option<Message>>,
    msg: Option<Message>,
) -> Option<Delivery> {
    match msg {
        Some(msg) => Some(Delivery::new(msg, mailbox.clone())),
        None => {
            if let Ok(Some(raced)) = rx.try_recv() {
                if let Err(err) = mailbox.nack(&raced.message_id) {
                    warn!(
                        mailbox = mailbox.name(),
                        error = %err,
                        "failed to return raced delivery"
                    );
                }
            }
            None
        }
    }
}

/// Completes once the cancel signal fires. A dropped sender counts as fired.
pub(crate) async fn cancel_fired(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Backend for Registry {
    async fn declare(&self, name: &str) -> Result<()> {
        Registry::declare(self, name)
    }

    async fn abandon(&self, name: &str) -> Result<()> {
        Registry::abandon(self, name)
    }

    async fn push(&self, name: &str, msg: &Message) -> Result<()> {
        Registry::push(self, name, msg)
    }

    async fn poll(&self, name: &str) -> Result<Option<Delivery>> {
        Registry::poll(self, name)
    }

    async fn long_poll(&self, name: &str, wait: Duration) -> Result<Option<Delivery>> {
        Registry::long_poll(self, name, wait).await
    }

    async fn long_poll_cancelable(
        &self,
        name: &str,
        wait: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<Option<Delivery>> {
        Registry::long_poll_cancelable(self, name, wait, cancel).await
    }
}
