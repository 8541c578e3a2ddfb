//! Cluster routing and node assembly.
//!
//! - `kv` - consistent KV store abstraction with a watched-prefix cache
//! - `routing` - the Consul-backed routing table
//! - `node` - cluster node wiring, pub/sub, and startup/shutdown

pub mod kv;
pub mod node;
pub mod routing;

pub use kv::{ConsulKv, KvCache, KvPair, KvStore, MemoryKv};
pub use node::{ClusterNode, Node, Subscription};
pub use routing::ConsulRoutingTable;
