//! Shared harness for the integration tests: in-memory backends, node
//! spin-up over a shared KV store, TLS material, and eventually-style
//! assertions for propagation windows.

#![allow(dead_code)]

use courier::cluster::{KvStore, MemoryKv, Node};
use courier::{Backend, Client, NodeConfig, Registry, Server};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Bind a protocol server over `backend` on an ephemeral port and return a
/// client dialed at it.
pub async fn start_server(backend: Arc<dyn Backend>) -> (Server, Client) {
    let server = Server::bind("127.0.0.1:0", backend, None)
        .await
        .expect("bind server");
    server.spawn();
    let client = Client::new(server.local_addr().to_string());
    (server, client)
}

pub fn memory_registry() -> Arc<Registry> {
    Arc::new(Registry::memory())
}

/// Start a cluster node over the shared KV store, storing its mailboxes
/// under `dir`.
pub async fn start_node(kv: Arc<MemoryKv>, dir: &Path) -> Node {
    let config = NodeConfig {
        listen_addr: "127.0.0.1:0".into(),
        data_dir: Some(dir.to_path_buf()),
        routing_prefix: "test-routing".into(),
        fsync: false,
        ..Default::default()
    };
    Node::start_with_kv(config, kv as Arc<dyn KvStore>)
        .await
        .expect("start node")
}

/// Poll `check` until it returns true or the propagation window closes.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Self-signed TLS material for one localhost listener.
pub struct TlsMaterial {
    pub chain: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

pub fn write_tls_material(dir: &Path) -> TlsMaterial {
    let ca_key = KeyPair::generate().expect("generate CA key");
    let mut ca_params = CertificateParams::default();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "test-ca");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).expect("self-sign CA");

    let leaf_key = KeyPair::generate().expect("generate leaf key");
    let leaf_params =
        CertificateParams::new(vec!["localhost".into()]).expect("leaf cert params");
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .expect("sign leaf");

    let mut chain_pem = leaf_cert.pem();
    chain_pem.push_str(&ca_cert.pem());

    let chain = dir.join("chain.pem");
    let key_path = dir.join("key.pem");
    let ca = dir.join("ca.pem");
    std::fs::write(&chain, chain_pem).expect("write chain");
    std::fs::write(&key_path, leaf_key.serialize_pem()).expect("write key");
    std::fs::write(&ca, ca_cert.pem()).expect("write ca");

    TlsMaterial {
        chain,
        key: key_path,
        ca,
    }
}
