//! Consistent KV store abstraction and the watched-prefix cache.
//!
//! Cluster routes live under a KV prefix: one key per `(name, node)` whose
//! value is the owning node's advertise address. A [`KvCache`] watches the
//! prefix with long-poll cursors and publishes an atomic snapshot plus a
//! monotonic clock value every time it observes a change; readers pay one
//! map lookup per get.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

/// How long a single watch cycle blocks before cycling.
const WATCH_WAIT: Duration = Duration::from_secs(60);

/// One key/value under the routing prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

/// A consistent KV store with prefix listing and change-index long polls.
///
/// `list` returns all pairs under `prefix` together with the store's change
/// index. With `wait_index` zero it returns immediately; otherwise it blocks
/// until the index differs from `wait_index` or `wait` elapses.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list(
        &self,
        prefix: &str,
        wait_index: u64,
        wait: Duration,
    ) -> Result<(Vec<KvPair>, u64)>;
}

// ---------------------------------------------------------------------------
// In-process store (tests, single-machine clusters)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryKv {
    entries: parking_lot::Mutex<BTreeMap<String, Vec<u8>>>,
    index: AtomicU64,
    notify: Notify,
}

impl MemoryKv {
    pub fn new() -> MemoryKv {
        MemoryKv::default()
    }

    fn snapshot(&self, prefix: &str) -> (Vec<KvPair>, u64) {
        let entries = self.entries.lock();
        let pairs = entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KvPair {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        (pairs, self.index.load(Ordering::SeqCst))
    }

    fn bump(&self) {
        self.index.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        self.bump();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        self.bump();
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        wait_index: u64,
        wait: Duration,
    ) -> Result<(Vec<KvPair>, u64)> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let (pairs, index) = self.snapshot(prefix);
            if wait_index == 0 || index != wait_index {
                return Ok((pairs, index));
            }
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    return Ok(self.snapshot(prefix));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Consul agent
// ---------------------------------------------------------------------------

/// Consul KV API over HTTP, using blocking queries for watches.
pub struct ConsulKv {
    base: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulEntry {
    key: String,
    value: Option<String>,
    modify_index: u64,
}

impl ConsulKv {
    pub fn new(base_url: impl Into<String>) -> ConsulKv {
        let mut base = base_url.into();
        while base.ends_with('/') {
            base.pop();
        }
        ConsulKv {
            base,
            client: reqwest::Client::new(),
        }
    }

    fn kv_url(&self, key: &str) -> String {
        // Mailbox names may carry characters with URL meaning (`#ephemeral`
        // suffixes in particular); escape the ones that would truncate the
        // path.
        let escaped = key
            .replace('%', "%25")
            .replace('#', "%23")
            .replace('?', "%3F")
            .replace(' ', "%20");
        format!("{}/v1/kv/{}", self.base, escaped)
    }
}

fn consul_index(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get("X-Consul-Index")?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

#[async_trait]
impl KvStore for ConsulKv {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.client
            .put(self.kv_url(key))
            .body(value.to_vec())
            .send()
            .await
            .with_context(|| format!("PUT {key}"))?
            .error_for_status()
            .with_context(|| format!("PUT {key}"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete(self.kv_url(key))
            .send()
            .await
            .with_context(|| format!("DELETE {key}"))?
            .error_for_status()
            .with_context(|| format!("DELETE {key}"))?;
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        wait_index: u64,
        wait: Duration,
    ) -> Result<(Vec<KvPair>, u64)> {
        let mut url = format!("{}?recurse=true", self.kv_url(prefix));
        if wait_index > 0 {
            url.push_str(&format!(
                "&index={}&wait={}s",
                wait_index,
                wait.as_secs().max(1)
            ));
        }

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("LIST {prefix}"))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            let index = consul_index(&resp).unwrap_or(wait_index);
            return Ok((Vec::new(), index));
        }

        let resp = resp
            .error_for_status()
            .with_context(|| format!("LIST {prefix}"))?;
        let header_index = consul_index(&resp);
        let entries: Vec<ConsulEntry> = resp
            .json()
            .await
            .with_context(|| format!("LIST {prefix}: decode"))?;

        let mut pairs = Vec::with_capacity(entries.len());
        let mut max_modify = 0;
        for entry in entries {
            max_modify = max_modify.max(entry.modify_index);
            let value = match entry.value {
                Some(encoded) => BASE64
                    .decode(encoded)
                    .with_context(|| format!("LIST {prefix}: value of {}", entry.key))?,
                None => Vec::new(),
            };
            pairs.push(KvPair {
                key: entry.key,
                value,
            });
        }
        Ok((pairs, header_index.unwrap_or(max_modify)))
    }
}

// ---------------------------------------------------------------------------
// Watched-prefix cache
// ---------------------------------------------------------------------------

#[derive(Default)]
struct KvSnapshot {
    clock: u64,
    entries: HashMap<String, Vec<KvPair>>,
}

/// Snapshot cache over one watched prefix.
///
/// A background task long-polls the prefix; every observed change installs a
/// fresh snapshot and advances the clock. The clock never decreases, which
/// is what downstream pusher caches key their validity on.
pub struct KvCache {
    state: Arc<RwLock<KvSnapshot>>,
    shutdown: watch::Sender<bool>,
}

impl KvCache {
    pub fn start(kv: Arc<dyn KvStore>, prefix: impl Into<String>) -> KvCache {
        let prefix = prefix.into();
        let state = Arc::new(RwLock::new(KvSnapshot::default()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(watch_prefix(kv, prefix, state.clone(), shutdown_rx));
        KvCache { state, shutdown }
    }

    /// Values advertised for `name`, plus the clock they were observed at.
    pub fn get(&self, name: &str) -> (Vec<KvPair>, u64) {
        let snap = self.state.read();
        (
            snap.entries.get(name).cloned().unwrap_or_default(),
            snap.clock,
        )
    }

    pub fn clock(&self) -> u64 {
        self.state.read().clock
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for KvCache {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Group pairs by mailbox name: keys look like `<prefix>/<name>/<node-key>`.
fn group_by_name(prefix: &str, pairs: Vec<KvPair>) -> HashMap<String, Vec<KvPair>> {
    let mut grouped: HashMap<String, Vec<KvPair>> = HashMap::new();
    for pair in pairs {
        let Some(rest) = pair.key.strip_prefix(prefix).map(|r| r.trim_start_matches('/'))
        else {
            continue;
        };
        let Some((name, _node_key)) = rest.rsplit_once('/') else {
            continue;
        };
        grouped.entry(name.to_string()).or_default().push(pair);
    }
    grouped
}

async fn watch_prefix(
    kv: Arc<dyn KvStore>,
    prefix: String,
    state: Arc<RwLock<KvSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut wait_index = 0u64;
    loop {
        if *shutdown.borrow() {
            return;
        }

        let listed = tokio::select! {
            res = kv.list(&prefix, wait_index, WATCH_WAIT) => res,
            _ = shutdown.changed() => return,
        };

        match listed {
            Ok((pairs, index)) => {
                if index == wait_index {
                    if wait_index == 0 {
                        // Nothing written yet; do not spin on an empty store.
                        tokio::select! {
                            () = tokio::time::sleep(Duration::from_millis(50)) => {}
                            _ = shutdown.changed() => return,
                        }
                    }
                    continue;
                }
                wait_index = index;
                let entries = group_by_name(&prefix, pairs);
                let mut snap = state.write();
                snap.clock += 1;
                snap.entries = entries;
                debug!(prefix = %prefix, clock = snap.clock, "routing snapshot updated");
            }
            Err(err) => {
                warn!(prefix = %prefix, error = %err, "routing watch failed, retrying");
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_kv_lists_by_prefix() {
        let kv = MemoryKv::new();
        kv.put("routes/a/n1", b"10.0.0.1").await.unwrap();
        kv.put("routes/b/n1", b"10.0.0.1").await.unwrap();
        kv.put("other/c/n1", b"10.0.0.2").await.unwrap();

        let (pairs, index) = kv.list("routes", 0, Duration::ZERO).await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(index, 3);
    }

    #[tokio::test]
    async fn memory_kv_blocks_until_change() {
        let kv = Arc::new(MemoryKv::new());
        kv.put("routes/a/n1", b"x").await.unwrap();
        let (_, index) = kv.list("routes", 0, Duration::ZERO).await.unwrap();

        let waiter = {
            let kv = kv.clone();
            tokio::spawn(async move {
                kv.list("routes", index, Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        kv.put("routes/a/n2", b"y").await.unwrap();

        let (pairs, new_index) = waiter.await.unwrap().unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(new_index > index);
    }

    #[tokio::test]
    async fn cache_clock_is_monotonic() {
        let kv = Arc::new(MemoryKv::new());
        let cache = KvCache::start(kv.clone(), "routes");

        kv.put("routes/a/n1", b"10.0.0.1").await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while cache.get("a").0.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "cache never updated");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (pairs, clock1) = cache.get("a");
        assert_eq!(pairs[0].value, b"10.0.0.1");

        kv.put("routes/a/n2", b"10.0.0.2").await.unwrap();
        while cache.get("a").0.len() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "cache never updated");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (_, clock2) = cache.get("a");
        assert!(clock2 > clock1);
        cache.stop();
    }

    #[test]
    fn grouping_strips_prefix_and_node_key() {
        let pairs = vec![
            KvPair {
                key: "routes/a/deadbeef".into(),
                value: b"x".to_vec(),
            },
            KvPair {
                key: "routes/pipe/a/cafef00d".into(),
                value: b"y".to_vec(),
            },
        ];
        let grouped = group_by_name("routes", pairs);
        assert!(grouped.contains_key("a"));
        // Names may themselves contain slashes; only the node key is split off.
        assert!(grouped.contains_key("pipe/a"));
    }
}
