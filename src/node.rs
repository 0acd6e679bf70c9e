//! Node composition root (§5): wires registry, storage, executor, sender, monitor, compactor,
//! and receiver together in the same order the original single-process implementation started
//! its subsystems — schema/actors first, then registry, then storage (plus its compactor), then
//! sender, then executor, then monitor, then the HTTP receiver last so nothing can reach it
//! before everything it depends on is already running.

use crate::actor::{ActorDescriptor, Dispatch};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::message::now_unix;
use crate::monitor::Monitor;
use crate::receiver;
use crate::registry::{NodeSpec, Registry};
use crate::sender::Sender;
use crate::storage::{LocalStorage, MemoryStorage, Storage};
use crate::timer::{self, TimerScheduler};
use reqwest_middleware::ClientBuilder;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub struct NodeBuilder {
    config: NodeConfig,
    actors: Vec<ActorDescriptor>,
    registry_node_spec: Option<NodeSpec>,
    initial_peers: Vec<NodeSpec>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        NodeBuilder {
            config,
            actors: Vec::new(),
            registry_node_spec: None,
            initial_peers: Vec::new(),
        }
    }

    pub fn actor(mut self, descriptor: ActorDescriptor) -> Self {
        self.actors.push(descriptor);
        self
    }

    pub fn registry_node(mut self, spec: NodeSpec) -> Self {
        self.registry_node_spec = Some(spec);
        self
    }

    pub fn peer(mut self, spec: NodeSpec) -> Self {
        self.initial_peers.push(spec);
        self
    }

    pub async fn build(self) -> Result<Arc<Node>> {
        let NodeBuilder {
            config,
            mut actors,
            registry_node_spec,
            initial_peers,
        } = self;

        let modules: BTreeSet<String> = actors.iter().map(|a| a.module.clone()).collect();
        let current_spec = NodeSpec {
            name: config.name.clone(),
            modules,
            networks: config.networks.clone(),
        };
        // `NodeBuilder::registry_node(spec)` takes precedence when both are set; a bare name
        // from `NodeConfigBuilder::registry_node` is resolved against the peers this builder
        // already knows about.
        let registry_node_spec = match registry_node_spec {
            Some(spec) => Some(spec),
            None => match &config.registry_node {
                Some(name) => Some(
                    initial_peers
                        .iter()
                        .find(|p| &p.name == name)
                        .cloned()
                        .ok_or_else(|| Error::other(anyhow::anyhow!("registry_node {name:?} is not among the configured peers")))?,
                ),
                None => None,
            },
        };
        let registry = Arc::new(Registry::new(current_spec.clone(), registry_node_spec)?);
        if !initial_peers.is_empty() {
            let mut specs = initial_peers;
            specs.push(current_spec);
            registry.update(specs)?;
        }

        let storage: Arc<dyn Storage> = match &config.storage_dir {
            Some(dir) => Arc::new(
                LocalStorage::open(dir.join(&config.name), config.storage_max_pending, config.storage_max_done).await?,
            ),
            None => Arc::new(MemoryStorage::new(config.storage_max_pending)),
        };
        storage.load().await?;

        let has_health = actors.iter().any(|a| a.name == timer::HEALTH_ACTOR);
        if !has_health {
            actors.push(timer::HealthHandler::descriptor(storage.clone(), registry.clone()));
        }
        let has_init = actors.iter().any(|a| a.name == timer::INIT_ACTOR);

        let http = ClientBuilder::new(reqwest::Client::builder().build().map_err(|e| Error::other(anyhow::anyhow!(e)))?).build();

        let executor = Executor::new(
            registry.clone(),
            storage.clone(),
            actors.clone(),
            http.clone(),
            config.token.clone(),
            config.concurrency,
            config.ask_timeout,
            config.subpath.clone(),
        );

        let sender = Sender::new(
            registry.clone(),
            storage.clone(),
            http.clone(),
            config.token.clone(),
            config.subpath.clone(),
            config.sender_workers,
            config.sender_base_backoff,
            config.sender_max_backoff,
            config.max_retry_count,
        );

        let monitor = Arc::new(Monitor::new(storage.clone(), config.ack_timeout, config.max_retry_count));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let executor_task = tokio::spawn(executor.clone().run(shutdown_rx.clone()));
        let sender_task = tokio::spawn(sender.clone().run(shutdown_rx.clone()));
        let mut background_tasks = Vec::new();
        background_tasks.push(tokio::spawn(monitor.clone().run(shutdown_rx.clone())));

        let compact_storage = storage.clone();
        let compact_interval = config.storage_compact_interval;
        let mut compact_shutdown = shutdown_rx.clone();
        background_tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(compact_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = compact_storage.compact_now().await {
                            tracing::warn!(error = %e, "compaction pass failed");
                        }
                    }
                    _ = compact_shutdown.changed() => {
                        if *compact_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        TimerScheduler::start(&actors, executor.clone() as Arc<dyn Dispatch>);
        timer::fire_init(&*executor, has_init).await;

        let router = receiver::router(executor.clone(), storage.clone(), registry.clone(), config.token.clone(), &config.subpath);
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| Error::other(anyhow::anyhow!("invalid bind address: {e}")))?;
        let mut server_shutdown = shutdown_rx.clone();
        let server_task = tokio::spawn(async move {
            let server = axum::Server::bind(&addr).serve(router.into_make_service());
            let graceful = server.with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            });
            if let Err(e) = graceful.await {
                tracing::error!(error = %e, "receiver server error");
            }
        });

        info!(node = %config.name, addr = %addr, "node started");

        Ok(Arc::new(Node {
            config,
            registry,
            storage,
            executor,
            shutdown_tx,
            server_task: tokio::sync::Mutex::new(Some(server_task)),
            executor_task: tokio::sync::Mutex::new(Some(executor_task)),
            sender_task: tokio::sync::Mutex::new(Some(sender_task)),
            background_tasks: tokio::sync::Mutex::new(background_tasks),
        }))
    }
}

pub struct Node {
    config: NodeConfig,
    registry: Arc<Registry>,
    storage: Arc<dyn Storage>,
    executor: Arc<Executor>,
    shutdown_tx: watch::Sender<bool>,
    server_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    executor_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    sender_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    background_tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    pub async fn ask(&self, dst: &str, content: serde_json::Value) -> Result<serde_json::Value> {
        self.executor.ask(dst, content, None).await
    }

    pub async fn tell(&self, dst: &str, content: serde_json::Value) -> Result<()> {
        self.executor.tell(dst, content, None, None).await
    }

    pub async fn hope(&self, dst: &str, content: serde_json::Value) -> Result<()> {
        self.executor.hope(dst, content, None, None).await
    }

    pub async fn tell_with_expiry(&self, dst: &str, content: serde_json::Value, ttl: std::time::Duration) -> Result<()> {
        self.executor.tell(dst, content, None, Some(now_unix() + ttl.as_secs() as i64)).await
    }

    /// Graceful shutdown, in order: stop the Receiver, drain the Executor (bounded by a grace
    /// window), stop the Sender, flush Storage, then stop the Compactor/Monitor. Handler tasks
    /// still running past the grace window are abandoned; their messages stay `EXECUTING`
    /// durably and are reclaimed as `INBOX` on next startup.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.server_task.lock().await.take() {
            let _ = task.await;
        }

        if let Some(task) = self.executor_task.lock().await.take() {
            let _ = task.await;
        }
        self.executor.drain(self.config.shutdown_grace).await;

        if let Some(task) = self.sender_task.lock().await.take() {
            let _ = task.await;
        }

        if let Err(e) = self.storage.compact_now().await {
            tracing::warn!(error = %e, "final compaction during shutdown failed");
        }

        let mut background = self.background_tasks.lock().await;
        for task in background.drain(..) {
            let _ = task.await;
        }
    }
}
