//! Cluster node wiring: storage + registry + router, topic pub/sub, and the
//! assembled network node.

use crate::cluster::kv::{ConsulKv, KvStore};
use crate::cluster::routing::ConsulRoutingTable;
use crate::core::config::NodeConfig;
use crate::error::Result;
use crate::message::Message;
use crate::net::server::Server;
use crate::net::tls::TlsServerConfig;
use crate::registry::{Backend, Delivery, Registry};
use crate::router::{HybridPusher, Pusher, RouteTable, Router};
use crate::storage::{DiskStore, DiskStoreOptions, MailboxStorage, Store};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Header a fanned-out publish carries so receiving nodes deliver it to
/// their local subscriptions without re-relaying.
const RELAY_HEADER: &str = "relayed-by";

/// A parsed `:subscribe` pattern. Segments split on `/`; `+` matches any one
/// segment and a trailing `#` matches any remainder.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub pattern: String,
    parts: Vec<String>,
    strict: bool,
    pub mailbox: String,
}

impl Subscription {
    pub fn parse(pattern: &str) -> Subscription {
        let mut parts: Vec<String> = pattern.split('/').map(str::to_string).collect();
        let mut strict = true;
        if let Some(last) = parts.last_mut() {
            if last == "#" {
                "+".clone_into(last);
                strict = false;
            }
        }
        Subscription {
            pattern: pattern.to_string(),
            parts,
            strict,
            mailbox: String::new(),
        }
    }

    pub fn matches(&self, literal: &str) -> bool {
        let mut parts: Vec<&str> = literal.split('/').collect();

        if parts.len() != self.parts.len() {
            if self.strict {
                return false;
            }
            if parts.len() < self.parts.len() {
                return false;
            }
            parts.truncate(self.parts.len());
        }

        for (against, concrete) in self.parts.iter().zip(parts) {
            if against != "+" && against != concrete {
                return false;
            }
        }
        true
    }
}

#[derive(Default)]
struct SubscriptionState {
    advertised: bool,
    subscriptions: Vec<Subscription>,
}

/// A node's mailbox surface: local registry plus the cluster router, with
/// `:subscribe` / `:publish` layered on top.
pub struct ClusterNode {
    storage: MailboxStorage,
    registry: Arc<Registry>,
    router: Router,
    subs: Mutex<SubscriptionState>,
    self_ref: Weak<ClusterNode>,
}

impl ClusterNode {
    /// Assemble a node over `store` and `routes`, then re-declare every
    /// mailbox name that survived a restart so its route is reinstated.
    pub async fn new(
        store: Arc<dyn Store>,
        routes: Arc<dyn RouteTable>,
    ) -> Result<Arc<ClusterNode>> {
        let storage = MailboxStorage::new(store);
        let registry = Arc::new(Registry::new(storage.clone()));
        let node = Arc::new_cyclic(|self_ref| ClusterNode {
            storage: storage.clone(),
            registry,
            router: Router::new(routes),
            subs: Mutex::new(SubscriptionState::default()),
            self_ref: self_ref.clone(),
        });

        for name in node.storage.mailbox_names()? {
            node.declare_inner(&name).await?;
        }
        Ok(node)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    async fn declare_inner(&self, name: &str) -> Result<()> {
        self.registry.declare(name)?;
        self.router
            .add(name, self.registry.clone() as Arc<dyn Pusher>)
            .await
    }

    fn published_pusher(&self) -> Arc<dyn Pusher> {
        Arc::new(PublishedPusher {
            node: self.self_ref.clone(),
        })
    }

    async fn subscribe(&self, msg: &Message) -> Result<()> {
        let mut sub = Subscription::parse(&msg.correlation_id);
        sub.mailbox = msg.reply_to.clone();

        let advertise = {
            let mut state = self.subs.lock();
            state.subscriptions.push(sub);
            !std::mem::replace(&mut state.advertised, true)
        };
        if advertise {
            self.router.add(":publish", self.published_pusher()).await?;
        }
        Ok(())
    }

    /// Deliver to matching local subscriptions. Route failures are logged,
    /// not surfaced: a publish is best-effort per subscriber.
    async fn publish_locally(&self, msg: &Message) -> Result<()> {
        let targets: Vec<String> = {
            let state = self.subs.lock();
            state
                .subscriptions
                .iter()
                .filter(|sub| sub.matches(&msg.correlation_id))
                .map(|sub| sub.mailbox.clone())
                .collect()
        };

        let mut clean = msg.clone();
        clean.headers.remove(RELAY_HEADER);
        for target in targets {
            if let Err(err) = self.router.push(&target, &clean).await {
                warn!(target = %target, error = %err, "publish delivery failed");
            }
        }
        Ok(())
    }

    async fn publish(&self, msg: &Message) -> Result<()> {
        // A relayed publish only delivers locally; fanning it out again
        // would ping-pong between subscriber nodes forever.
        if msg.get_header(RELAY_HEADER).is_some() {
            return self.publish_locally(msg).await;
        }

        let mut relayed = msg.clone();
        relayed.add_header(RELAY_HEADER, true);

        let fan_out = HybridPusher::new(
            Some(self.published_pusher()),
            self.router.routes().remotes(":publish"),
        );
        fan_out.push(":publish", &relayed).await
    }
}

#[async_trait]
impl Backend for ClusterNode {
    async fn declare(&self, name: &str) -> Result<()> {
        self.declare_inner(name).await
    }

    async fn abandon(&self, name: &str) -> Result<()> {
        self.registry.abandon(name)?;
        self.router.remove(name).await
    }

    async fn push(&self, name: &str, msg: &Message) -> Result<()> {
        match name {
            ":subscribe" => self.subscribe(msg).await,
            ":publish" => self.publish(msg).await,
            _ => self.router.push(name, msg).await,
        }
    }

    async fn poll(&self, name: &str) -> Result<Option<Delivery>> {
        self.registry.poll(name)
    }

    async fn long_poll(&self, name: &str, wait: Duration) -> Result<Option<Delivery>> {
        self.registry.long_poll(name, wait).await
    }

    async fn long_poll_cancelable(
        &self,
        name: &str,
        wait: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<Option<Delivery>> {
        self.registry.long_poll_cancelable(name, wait, cancel).await
    }
}

/// Local-only delivery leg for `:publish`: what a remote fan-out lands on.
struct PublishedPusher {
    node: Weak<ClusterNode>,
}

#[async_trait]
impl Pusher for PublishedPusher {
    async fn push(&self, _name: &str, msg: &Message) -> Result<()> {
        match self.node.upgrade() {
            Some(node) => node.publish_locally(msg).await,
            None => Ok(()),
        }
    }
}

/// A fully assembled network node: disk store, consul routing, cluster node,
/// and the wire-protocol server.
pub struct Node {
    config: NodeConfig,
    cluster: Arc<ClusterNode>,
    routing: Arc<ConsulRoutingTable>,
    server: Server,
}

impl Node {
    /// Start against the configured Consul agent.
    pub async fn start(config: NodeConfig) -> anyhow::Result<Node> {
        let mut config = config;
        config.normalize()?;
        let kv = Arc::new(ConsulKv::new(config.consul_url.clone()));
        Node::start_with_kv(config, kv).await
    }

    /// Start against an explicit KV store; tests pass a [`MemoryKv`].
    ///
    /// [`MemoryKv`]: crate::cluster::kv::MemoryKv
    pub async fn start_with_kv(
        config: NodeConfig,
        kv: Arc<dyn KvStore>,
    ) -> anyhow::Result<Node> {
        let mut config = config;
        config.normalize()?;

        // Bind first: an ephemeral listen port must be known before the
        // advertise address goes into the routing KV.
        let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
        let bound = listener.local_addr()?;
        if config.advertise_addr.ends_with(":0") {
            config.advertise_addr = format!("127.0.0.1:{}", bound.port());
        }

        let data_dir = config.data_dir.clone().expect("normalized config");
        let store = DiskStore::open_with(
            &data_dir,
            DiskStoreOptions {
                fsync: config.fsync,
                ..Default::default()
            },
        )?;

        let routing = Arc::new(ConsulRoutingTable::new(
            kv,
            config.routing_prefix.clone(),
            config.advertise_id(),
        ));
        let cluster =
            ClusterNode::new(Arc::new(store), routing.clone() as Arc<dyn RouteTable>).await?;

        let tls = match &config.tls {
            Some(settings) => Some(TlsServerConfig::new(
                settings.chain_path.clone(),
                settings.key_path.clone(),
            )?),
            None => None,
        };
        let server = Server::from_listener(listener, cluster.clone(), tls)?;
        server.spawn();

        info!(
            listen = %server.local_addr(),
            advertise = %config.advertise_id(),
            "node started"
        );
        Ok(Node {
            config,
            cluster,
            routing,
            server,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<ClusterNode> {
        &self.cluster
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.server.local_addr()
    }

    /// Withdraw advertised routes and stop serving.
    pub async fn shutdown(&self) -> Result<()> {
        self.routing.cleanup().await?;
        self.routing.close();
        self.server.shutdown();
        Ok(())
    }
}
