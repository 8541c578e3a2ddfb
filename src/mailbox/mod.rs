//! Durable per-mailbox FIFOs.
//!
//! A mailbox is a named persistent queue with explicit ack/nack delivery:
//! polled messages stay on disk until acknowledged, nacked messages are
//! re-offered ahead of fresh ones, and watchers hand pushed messages
//! directly to waiting long-pollers.

pub mod durable;

pub use durable::{DurableMailbox, MailboxStats};
