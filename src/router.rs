//! Routing: the `Pusher` capability and its compositions.
//!
//! Everything that can accept a `(name, message)` push implements
//! [`Pusher`]: the local registry, remote clients, fan-out combinations,
//! and the buffered-retry wrapper. A [`Router`] resolves names through a
//! [`RouteTable`] and forwards.

use crate::error::{Error, Result};
use crate::message::Message;
use crate::registry::Registry;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// The single capability shared by every message sink.
#[async_trait]
pub trait Pusher: Send + Sync {
    async fn push(&self, name: &str, msg: &Message) -> Result<()>;
}

#[async_trait]
impl Pusher for Registry {
    async fn push(&self, name: &str, msg: &Message) -> Result<()> {
        Registry::push(self, name, msg)
    }
}

/// Thread-safe `name -> Pusher` mapping.
#[async_trait]
pub trait RouteTable: Send + Sync {
    async fn set(&self, name: &str, pusher: Arc<dyn Pusher>) -> Result<()>;
    async fn remove(&self, name: &str) -> Result<()>;
    fn get(&self, name: &str) -> Option<Arc<dyn Pusher>>;

    /// Remote-only children for `name`; empty unless the table is
    /// cluster-aware.
    fn remotes(&self, name: &str) -> Vec<Arc<dyn Pusher>> {
        let _ = name;
        Vec::new()
    }
}

/// Process-local route table.
#[derive(Default)]
pub struct MemRouteTable {
    routes: RwLock<HashMap<String, Arc<dyn Pusher>>>,
}

impl MemRouteTable {
    pub fn new() -> MemRouteTable {
        MemRouteTable::default()
    }
}

#[async_trait]
impl RouteTable for MemRouteTable {
    async fn set(&self, name: &str, pusher: Arc<dyn Pusher>) -> Result<()> {
        self.routes.write().insert(name.to_string(), pusher);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.routes.write().remove(name);
        Ok(())
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Pusher>> {
        self.routes.read().get(name).cloned()
    }
}

/// Forwards pushes to whichever pusher the route table names.
#[derive(Clone)]
pub struct Router {
    routes: Arc<dyn RouteTable>,
}

impl Router {
    pub fn new(routes: Arc<dyn RouteTable>) -> Router {
        Router { routes }
    }

    /// A router over a process-local table.
    pub fn memory() -> Router {
        Router::new(Arc::new(MemRouteTable::new()))
    }

    pub fn routes(&self) -> &Arc<dyn RouteTable> {
        &self.routes
    }

    pub async fn add(&self, name: &str, pusher: Arc<dyn Pusher>) -> Result<()> {
        self.routes.set(name, pusher).await
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.routes.remove(name).await
    }

    pub fn discover(&self, name: &str) -> Option<Arc<dyn Pusher>> {
        self.routes.get(name)
    }

    pub async fn push(&self, name: &str, msg: &Message) -> Result<()> {
        match self.routes.get(name) {
            Some(pusher) => {
                debug!(name, "routing push");
                pusher.push(name, msg).await
            }
            None => Err(Error::NoMailbox),
        }
    }
}

/// Pushes to every child; siblings still receive the message when one
/// fails, and the last failure is reported.
#[derive(Default)]
pub struct MultiPusher {
    pushers: Vec<Arc<dyn Pusher>>,
}

impl MultiPusher {
    pub fn new() -> MultiPusher {
        MultiPusher::default()
    }

    pub fn add(&mut self, pusher: Arc<dyn Pusher>) {
        self.pushers.push(pusher);
    }

    pub fn len(&self) -> usize {
        self.pushers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pushers.is_empty()
    }
}

#[async_trait]
impl Pusher for MultiPusher {
    async fn push(&self, name: &str, msg: &Message) -> Result<()> {
        let mut last_err = None;
        for pusher in &self.pushers {
            if let Err(err) = pusher.push(name, msg).await {
                last_err = Some(err);
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// One optional local child plus any number of remote children, with the
/// same fan-out semantics as [`MultiPusher`].
#[derive(Default)]
pub struct HybridPusher {
    local: Option<Arc<dyn Pusher>>,
    remote: Vec<Arc<dyn Pusher>>,
}

impl HybridPusher {
    pub fn new(local: Option<Arc<dyn Pusher>>, remote: Vec<Arc<dyn Pusher>>) -> HybridPusher {
        HybridPusher { local, remote }
    }

    pub fn count(&self) -> usize {
        self.remote.len() + usize::from(self.local.is_some())
    }
}

#[async_trait]
impl Pusher for HybridPusher {
    async fn push(&self, name: &str, msg: &Message) -> Result<()> {
        let mut last_err = None;
        if let Some(local) = &self.local {
            if let Err(err) = local.push(name, msg).await {
                last_err = Some(err);
            }
        }
        for pusher in &self.remote {
            if let Err(err) = pusher.push(name, msg).await {
                last_err = Some(err);
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Swallows everything.
pub struct NullPusher;

#[async_trait]
impl Pusher for NullPusher {
    async fn push(&self, _name: &str, _msg: &Message) -> Result<()> {
        Ok(())
    }
}
