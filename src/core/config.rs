use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Default wire-protocol listen port.
pub const DEFAULT_PORT: u16 = 8475;

/// Default on-disk data directory.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/courier";

/// Default Consul KV prefix under which routes are advertised.
pub const DEFAULT_ROUTING_PREFIX: &str = "mailbox-routing";

/// Default Consul agent address.
pub const DEFAULT_CONSUL_URL: &str = "http://127.0.0.1:8500";

/// Top-level configuration for a cluster node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    /// Address the protocol listener binds. Empty selects `0.0.0.0:8475`.
    #[serde(default)]
    pub listen_addr: String,
    /// Address other nodes dial to reach this one. Empty derives
    /// `127.0.0.1:<listen port>`; deployments behind real interfaces must
    /// set it explicitly.
    #[serde(default)]
    pub advertise_addr: String,
    /// Directory holding the mailbox store.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// KV prefix for route advertisement.
    #[serde(default)]
    pub routing_prefix: String,
    /// Consul agent base URL.
    #[serde(default)]
    pub consul_url: String,
    /// Optional TLS material for the listener; plaintext when absent.
    #[serde(default)]
    pub tls: Option<TlsSettings>,
    /// Flush the store on every write batch. On by default; tests turn it
    /// off for speed.
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

/// PEM paths for an encrypted listener.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    pub chain_path: PathBuf,
    pub key_path: PathBuf,
}

fn default_fsync() -> bool {
    true
}

impl NodeConfig {
    /// Fill unset fields with their defaults and validate the result.
    pub fn normalize(&mut self) -> Result<()> {
        if self.listen_addr.is_empty() {
            self.listen_addr = format!("0.0.0.0:{}", DEFAULT_PORT);
        }
        let port = match self.listen_addr.rsplit_once(':') {
            Some((_, port)) => port
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("invalid listen_addr {}", self.listen_addr))?,
            None => bail!("invalid listen_addr {}", self.listen_addr),
        };
        if self.advertise_addr.is_empty() {
            self.advertise_addr = format!("127.0.0.1:{}", port);
        }
        if self.data_dir.is_none() {
            self.data_dir = Some(PathBuf::from(DEFAULT_DATA_DIR));
        }
        if self.routing_prefix.is_empty() {
            self.routing_prefix = DEFAULT_ROUTING_PREFIX.to_string();
        }
        if self.consul_url.is_empty() {
            self.consul_url = DEFAULT_CONSUL_URL.to_string();
        }
        Ok(())
    }

    /// The identity advertised in the routing KV: `host:port` peers dial.
    pub fn advertise_id(&self) -> String {
        self.advertise_addr.clone()
    }
}
