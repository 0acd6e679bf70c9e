//! Node configuration (§6): a fluent builder mirroring the teacher's
//! `FederationConfig::builder()...build()?` surface, validated once at `build()` time rather
//! than scattered across getters.

use crate::error::{Error, Result};
use crate::registry::Network;
use std::time::Duration;
use url::Url;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub subpath: String,
    pub concurrency: usize,
    pub networks: Vec<Network>,
    pub registry_node: Option<String>,
    pub storage_dir: Option<std::path::PathBuf>,
    pub storage_max_pending: usize,
    pub storage_max_done: usize,
    pub storage_compact_interval: Duration,
    pub shutdown_grace: Duration,
    pub ack_timeout: Duration,
    pub ask_timeout: Duration,
    pub max_retry_count: u32,
    pub sender_workers: usize,
    pub sender_base_backoff: Duration,
    pub sender_max_backoff: Duration,
    pub token: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            name: "node".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            subpath: String::new(),
            concurrency: 16,
            networks: Vec::new(),
            registry_node: None,
            storage_dir: None,
            storage_max_pending: 10_000,
            storage_max_done: 50_000,
            storage_compact_interval: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(30),
            ask_timeout: Duration::from_secs(10),
            max_retry_count: 5,
            sender_workers: 8,
            sender_base_backoff: Duration::from_secs(1),
            sender_max_backoff: Duration::from_secs(60),
            token: None,
        }
    }
}

/// Builds a [`NodeConfig`], validating cross-field invariants only once, at [`build`](Self::build).
#[derive(Default)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        NodeConfigBuilder {
            config: NodeConfig {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn subpath(mut self, subpath: impl Into<String>) -> Self {
        self.config.subpath = subpath.into();
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn network(mut self, name: impl Into<String>, url: Url) -> Self {
        self.config.networks.push(Network { name: name.into(), url });
        self
    }

    pub fn registry_node(mut self, name: impl Into<String>) -> Self {
        self.config.registry_node = Some(name.into());
        self
    }

    pub fn storage_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.config.storage_dir = Some(dir.into());
        self
    }

    pub fn storage_max_pending(mut self, max: usize) -> Self {
        self.config.storage_max_pending = max;
        self
    }

    pub fn storage_max_done(mut self, max: usize) -> Self {
        self.config.storage_max_done = max;
        self
    }

    pub fn storage_compact_interval(mut self, interval: Duration) -> Self {
        self.config.storage_compact_interval = interval;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    pub fn ask_timeout(mut self, timeout: Duration) -> Self {
        self.config.ask_timeout = timeout;
        self
    }

    pub fn max_retry_count(mut self, max: u32) -> Self {
        self.config.max_retry_count = max;
        self
    }

    pub fn sender_workers(mut self, workers: usize) -> Self {
        self.config.sender_workers = workers;
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    pub fn build(self) -> Result<NodeConfig> {
        if self.config.name.is_empty() {
            return Err(Error::other(anyhow::anyhow!("node name must not be empty")));
        }
        if self.config.concurrency == 0 {
            return Err(Error::other(anyhow::anyhow!("concurrency must be at least 1")));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_empty_name() {
        let err = NodeConfigBuilder::new("").build().unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn builder_applies_overrides() {
        let config = NodeConfigBuilder::new("alpha")
            .port(9001)
            .concurrency(32)
            .ack_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        assert_eq!(config.name, "alpha");
        assert_eq!(config.port, 9001);
        assert_eq!(config.concurrency, 32);
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
    }
}
