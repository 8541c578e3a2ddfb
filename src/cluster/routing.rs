//! The Consul-backed routing table.
//!
//! Each node advertises every locally declared name as
//! `<prefix>/<name>/<node-key>` = advertise address, where the node key is a
//! stable hash of that address. Lookups resolve local routes first, then the
//! watched KV snapshot; resolved remote pushers are cached and revalidated
//! against the snapshot clock and the advertiser count.

use crate::cluster::kv::{KvCache, KvStore};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::net::client::Client;
use crate::net::tls::TlsClientConfig;
use crate::reliable::ReliablePusher;
use crate::router::{MemRouteTable, MultiPusher, Pusher, RouteTable};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
struct CachedPusher {
    clock: u64,
    node_count: usize,
    pusher: Arc<dyn Pusher>,
}

pub struct ConsulRoutingTable {
    self_id: String,
    node_key: String,
    prefix: String,
    kv: Arc<dyn KvStore>,
    cache: KvCache,
    local: MemRouteTable,
    /// Peer address -> shared reliable pusher, reused across names.
    connections: Mutex<HashMap<String, Arc<dyn Pusher>>>,
    /// Resolved remote pushers keyed by name, revalidated per lookup.
    resolved: Mutex<HashMap<String, CachedPusher>>,
    /// Names this node advertised, for teardown.
    names: Mutex<HashSet<String>>,
    client_tls: Option<TlsClientConfig>,
}

impl ConsulRoutingTable {
    pub fn new(
        kv: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        self_id: impl Into<String>,
    ) -> ConsulRoutingTable {
        let prefix = prefix.into();
        let self_id = self_id.into();
        let node_key = format!("{:x}", Sha256::digest(self_id.as_bytes()));
        let cache = KvCache::start(kv.clone(), prefix.clone());
        ConsulRoutingTable {
            self_id,
            node_key,
            prefix,
            kv,
            cache,
            local: MemRouteTable::new(),
            connections: Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashMap::new()),
            names: Mutex::new(HashSet::new()),
            client_tls: None,
        }
    }

    /// Dial peers over TLS instead of plaintext.
    pub fn with_client_tls(mut self, tls: TlsClientConfig) -> ConsulRoutingTable {
        self.client_tls = Some(tls);
        self
    }

    fn kv_key(&self, name: &str) -> String {
        format!("{}/{}/{}", self.prefix, name, self.node_key)
    }

    fn connection_to(&self, target: &str) -> Arc<dyn Pusher> {
        let mut connections = self.connections.lock();
        connections
            .entry(target.to_string())
            .or_insert_with(|| {
                let mut client = Client::new(target);
                if let Some(tls) = &self.client_tls {
                    client = client.with_tls(tls.clone());
                }
                Arc::new(ReliablePusher::new(Arc::new(client))) as Arc<dyn Pusher>
            })
            .clone()
    }

    fn peer_targets(&self, name: &str) -> (Vec<String>, usize, u64) {
        let (pairs, clock) = self.cache.get(name);
        let node_count = pairs.len();
        let targets = pairs
            .iter()
            .map(|pair| String::from_utf8_lossy(&pair.value).to_string())
            .filter(|target| *target != self.self_id)
            .collect();
        (targets, node_count, clock)
    }

    /// Delete every advertised key owned by this node. Called on graceful
    /// shutdown; without it the peer list of a dead node decays only when
    /// the KV store expires its entries.
    pub async fn cleanup(&self) -> Result<()> {
        let names: Vec<String> = self.names.lock().drain().collect();
        for name in names {
            self.kv
                .delete(&self.kv_key(&name))
                .await
                .map_err(|e| Error::Discovery(e.to_string()))?;
        }
        Ok(())
    }

    /// Stop the prefix watcher.
    pub fn close(&self) {
        self.cache.stop();
    }
}

#[async_trait]
impl RouteTable for ConsulRoutingTable {
    async fn set(&self, name: &str, pusher: Arc<dyn Pusher>) -> Result<()> {
        self.local.set(name, pusher).await?;
        self.kv
            .put(&self.kv_key(name), self.self_id.as_bytes())
            .await
            .map_err(|e| Error::Discovery(e.to_string()))?;
        self.names.lock().insert(name.to_string());
        debug!(name, key = %self.kv_key(name), "advertised route");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.kv
            .delete(&self.kv_key(name))
            .await
            .map_err(|e| Error::Discovery(e.to_string()))?;
        self.names.lock().remove(name);
        self.resolved.lock().remove(name);
        self.local.remove(name).await
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Pusher>> {
        if let Some(local) = self.local.get(name) {
            return Some(local);
        }

        let (targets, node_count, clock) = self.peer_targets(name);
        if node_count == 0 {
            return None;
        }

        if let Some(entry) = self.resolved.lock().get(name) {
            if entry.clock >= clock && entry.node_count == node_count {
                return Some(entry.pusher.clone());
            }
        }

        // We never loop a push back through the network to ourselves.
        if targets.is_empty() {
            return None;
        }

        let pusher: Arc<dyn Pusher> = if targets.len() == 1 {
            self.connection_to(&targets[0])
        } else {
            let mut multi = MultiPusher::new();
            for target in &targets {
                multi.add(self.connection_to(target));
            }
            Arc::new(multi)
        };

        self.resolved.lock().insert(
            name.to_string(),
            CachedPusher {
                clock,
                node_count,
                pusher: pusher.clone(),
            },
        );
        debug!(name, clock, node_count, "rebuilt remote pusher");
        Some(pusher)
    }

    fn remotes(&self, name: &str) -> Vec<Arc<dyn Pusher>> {
        let (targets, _, _) = self.peer_targets(name);
        targets
            .iter()
            .map(|target| self.connection_to(target))
            .collect()
    }
}

#[async_trait]
impl Pusher for ConsulRoutingTable {
    async fn push(&self, name: &str, msg: &Message) -> Result<()> {
        match self.get(name) {
            Some(pusher) => pusher.push(name, msg).await,
            None => {
                warn!(name, "push with no route");
                Err(Error::NoMailbox)
            }
        }
    }
}
