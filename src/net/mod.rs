//! Networking layer.
//!
//! - `mux` - stream multiplexer over a single connection
//! - `tls` - optional session encryption
//! - `server` - the session/protocol server
//! - `client` - reconnecting client and feature-client helpers

pub mod client;
pub mod mux;
pub mod server;
pub mod tls;

pub use client::{Client, FeatureClient};
pub use mux::{BoxedIo, MuxSession, MuxStream};
pub use server::Server;
pub use tls::{TlsClientConfig, TlsServerConfig};
