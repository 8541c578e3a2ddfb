#![deny(clippy::all)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some request handlers are inherently long
#![allow(clippy::too_many_lines)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]

//! Courier - Distributed mailbox service.
//!
//! Producers push messages to named mailboxes; consumers poll (or long-poll)
//! them, then acknowledge or negatively acknowledge delivery. Mailboxes are
//! durable on disk and routable across a cluster of nodes discovered through
//! a watched Consul KV prefix.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Node configuration and defaults
//! - `core::ids` - Message-id generation and local-index addressing
//! - `core::duration` - Wire-format duration strings
//!
//! ## Mailboxes
//! - `storage` - Key/value store abstraction (memory and WAL-backed disk)
//! - `mailbox` - Durable per-mailbox FIFO with ack/nack and watchers
//! - `registry` - Named mailbox index and long-poll coordination
//!
//! ## Routing
//! - `router` - Pusher capability, route tables, fan-out pushers
//! - `reliable` - Buffered-retry pusher for transient peer failures
//! - `cluster` - Consul-backed routing, pub/sub, and node assembly
//!
//! ## Networking
//! - `proto` - Wire frame tags and bodies
//! - `net::mux` - Stream multiplexer over a single connection
//! - `net::tls` - Optional session encryption
//! - `net::server` - Session/protocol server with LWT handling
//! - `net::client` - Reconnecting client and feature-client helpers

pub mod core;
pub mod error;
pub mod message;
pub mod storage;

pub mod mailbox;
pub mod registry;

pub mod cluster;
pub mod reliable;
pub mod router;

pub mod net;
pub mod proto;

// Re-exports for the common surface.
pub use self::core::config::NodeConfig;
pub use self::core::ids::{next_message_id, random_mailbox_name, MessageId};
pub use error::{Error, Result};
pub use mailbox::{DurableMailbox, MailboxStats};
pub use message::Message;
pub use net::client::{Client, FeatureClient};
pub use net::server::Server;
pub use registry::{Backend, Delivery, Registry};
pub use router::{MultiPusher, Pusher, RouteTable, Router};
pub use storage::{DiskStore, MailboxStorage, MemoryStore, Store};
