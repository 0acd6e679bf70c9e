//! The executor (§4.4): dispatches `INBOX` messages to registered actors across three worker
//! pools, and serves `ask` as a synchronous call — local asks invoke the handler directly,
//! bypassing storage entirely; remote asks are a direct HTTP round trip to the owning node's
//! `/ask` endpoint. `tell`/`hope` are durable and asynchronous: they go through storage and are
//! picked up either by this executor's own dispatch loop (local) or by the sender (remote).

pub mod pools;

use crate::actor::{ActorContext, ActorDescriptor, Dispatch, HandlerFn};
use crate::error::{Error, Result};
use crate::message::{now_unix, ErrorInfo, Message};
use crate::registry::Registry;
use crate::storage::Storage;
use async_trait::async_trait;
use pools::{BlockingPool, CooperativePool, CpuPool};
use reqwest_middleware::ClientWithMiddleware;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct Executor {
    registry: Arc<Registry>,
    storage: Arc<dyn Storage>,
    actors: HashMap<String, ActorDescriptor>,
    cooperative: CooperativePool,
    blocking: BlockingPool,
    cpu: CpuPool,
    http: ClientWithMiddleware,
    token: Option<String>,
    ask_timeout: Duration,
    concurrency: usize,
    subpath: String,
    /// Lets `&self` methods (the `Dispatch` trait surface) hand out an `Arc<dyn Dispatch>` to
    /// `ActorContext` without every caller threading one through. Set once, in `new`, via
    /// `Arc::new_cyclic`.
    self_weak: Weak<Executor>,
    /// Handles for per-message `invoke_and_finish` tasks spawned by `dispatch_once`, so
    /// `shutdown` can drain them within a grace window (§5) instead of abandoning them outright.
    in_flight: AsyncMutex<Vec<JoinHandle<()>>>,
}

/// Wire body for an `/ask` request and its response (§6 external interfaces).
#[derive(serde::Serialize, serde::Deserialize)]
pub(crate) struct AskResponseBody {
    pub result: Option<serde_json::Value>,
    pub error: Option<WireError>,
}

#[derive(serde::Serialize, serde::Deserialize)]
pub(crate) struct WireError {
    pub kind: String,
    pub message: String,
}

impl AskResponseBody {
    pub fn ok(value: serde_json::Value) -> Self {
        AskResponseBody { result: Some(value), error: None }
    }

    pub fn err(kind: impl Into<String>, message: impl Into<String>) -> Self {
        AskResponseBody {
            result: None,
            error: Some(WireError { kind: kind.into(), message: message.into() }),
        }
    }
}

impl Executor {
    pub fn new(
        registry: Arc<Registry>,
        storage: Arc<dyn Storage>,
        actors: Vec<ActorDescriptor>,
        http: ClientWithMiddleware,
        token: Option<String>,
        concurrency: usize,
        ask_timeout: Duration,
        subpath: String,
    ) -> Arc<Self> {
        let actors = actors.into_iter().map(|a| (a.name.clone(), a)).collect();
        Arc::new_cyclic(|weak| Executor {
            registry,
            storage,
            actors,
            cooperative: CooperativePool::new(concurrency),
            blocking: BlockingPool::new(concurrency),
            cpu: CpuPool::new(concurrency),
            http,
            token,
            ask_timeout,
            concurrency,
            subpath,
            self_weak: weak.clone(),
            in_flight: AsyncMutex::new(Vec::new()),
        })
    }

    pub fn actor(&self, name: &str) -> Option<&ActorDescriptor> {
        self.actors.get(name)
    }

    pub fn actors(&self) -> impl Iterator<Item = &ActorDescriptor> {
        self.actors.values()
    }

    /// One dispatch pass (§4.4 step 1): pulls up to the executor's concurrency budget from
    /// storage and spawns each on its actor's pool. Excess messages simply stay `INBOX` in
    /// storage until the next pass.
    pub async fn dispatch_once(self: &Arc<Self>) {
        let messages = self.storage.take_pending(self.concurrency).await;
        let mut in_flight = self.in_flight.lock().await;
        in_flight.retain(|h| !h.is_finished());
        for message in messages {
            let this = self.clone();
            let handle = tokio::spawn(async move {
                this.invoke_and_finish(message).await;
            });
            in_flight.push(handle);
        }
    }

    /// Waits for every currently in-flight `invoke_and_finish` task to finish, bounded by
    /// `grace` (§5 "drain Executor, bounded by a shutdown grace window"). Tasks still running
    /// past the window are left to run to completion detached; their message stays `EXECUTING`
    /// and is redispatched on the next start, since `EXECUTING` is never durable.
    pub async fn drain(&self, grace: Duration) {
        let handles: Vec<_> = self.in_flight.lock().await.drain(..).collect();
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, join_all).await.is_err() {
            warn!("executor drain grace window elapsed with tasks still in flight");
        }
    }

    /// Runs `dispatch_once` on a fixed tick until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(25));
        loop {
            tokio::select! {
                _ = interval.tick() => self.dispatch_once().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("executor dispatch loop stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn invoke_and_finish(self: Arc<Self>, message: Message) {
        let id = message.id;
        let dst = message.dst.clone();
        let require_ack = message.require_ack;
        let src_node = message.src_node.clone();
        match self.invoke(message).await {
            Ok(value) => {
                if let Err(e) = self.storage.done(id, Some(value)).await {
                    warn!(error = %e, %id, "failed to persist DONE record");
                }
            }
            Err(e) => {
                let info = ErrorInfo {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                    actor: dst,
                };
                if let Err(e) = self.storage.error(id, info).await {
                    warn!(error = %e, %id, "failed to persist ERROR record");
                }
            }
        }
        if require_ack {
            self.ack_upstream(id, src_node).await;
        }
    }

    /// Sends a best-effort ack back to whichever node originally submitted a `require_ack`
    /// message we just finished processing (§4.6: "for an ACK, call Storage.ack and wake any
    /// Sender future waiting on that id" — on the *origin* node's receiver). A single attempt;
    /// if it's lost, the origin's monitor will re-deliver the message and get another chance.
    async fn ack_upstream(&self, id: crate::message::MessageId, src_node: Option<String>) {
        let Some(src_node) = src_node else { return };
        let snapshot = self.registry.snapshot();
        if src_node == snapshot.current_node().name {
            return; // locally submitted; nothing remote to ack
        }
        let Some(node) = snapshot.node(&src_node) else {
            warn!(%id, node = %src_node, "cannot ack: origin node unknown to registry");
            return;
        };
        let Some(base) = snapshot.choose_url(node) else {
            warn!(%id, node = %src_node, "cannot ack: no reachable network for origin node");
            return;
        };
        let url = format!("{}{}/notify", base.as_str().trim_end_matches('/'), self.subpath);
        let mut req = self.http.post(&url).json(&vec![crate::message::NotifyItem::Ack { id }]);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Err(e) = req.send().await {
            warn!(error = %e, %id, node = %src_node, "failed to deliver ack");
        }
    }

    async fn invoke(self: &Arc<Self>, message: Message) -> Result<serde_json::Value> {
        let descriptor = self
            .actors
            .get(&message.dst)
            .ok_or_else(|| Error::Routing {
                module: message.dst.clone(),
            })?
            .clone();
        descriptor.validate_input(&message.content)?;
        let content = message.content.clone();
        let ctx = ActorContext::new(message, self.clone() as Arc<dyn Dispatch>);
        let result = match &descriptor.handler {
            HandlerFn::Cooperative(handler) => {
                let handler = handler.clone();
                self.cooperative
                    .spawn(async move { handler.call(ctx, content).await })
                    .await
                    .expect("cooperative handler task panicked")?
            }
            HandlerFn::Blocking(handler) => {
                let handler = handler.clone();
                self.blocking.run(move || handler.call(ctx, content)).await?
            }
            HandlerFn::Cpu(handler) => {
                let handler = handler.clone();
                self.cpu.run(move || handler.call(ctx, content)).await?
            }
        };
        if let Some(schema) = &descriptor.output_schema {
            schema.validate(&result).map_err(|message| Error::Schema {
                id: Default::default(),
                actor: descriptor.name.clone(),
                message,
            })?;
        }
        Ok(result)
    }

    async fn ask_remote(&self, message: Message) -> Result<serde_json::Value> {
        let snapshot = self.registry.snapshot();
        let node_name = message
            .dst_node
            .clone()
            .ok_or_else(|| Error::Routing { module: message.dst_module().to_string() })?;
        let node = snapshot.node(&node_name).ok_or_else(|| Error::Routing {
            module: message.dst_module().to_string(),
        })?;
        let base = snapshot.choose_url(node).ok_or_else(|| Error::Routing {
            module: message.dst_module().to_string(),
        })?;
        let url = format!("{}{}/ask", base.as_str().trim_end_matches('/'), self.subpath);

        let mut req = self.http.post(&url).json(&message);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = tokio::time::timeout(self.ask_timeout, req.send())
            .await
            .map_err(|_| Error::Timeout(message.id))?
            .map_err(|e| Error::Transport {
                id: message.id,
                inbox: url.clone(),
                message: e.to_string(),
            })?;
        let body: AskResponseBody = response.json().await.map_err(|e| Error::Transport {
            id: message.id,
            inbox: url,
            message: e.to_string(),
        })?;
        match (body.result, body.error) {
            (Some(value), _) => Ok(value),
            (None, Some(err)) => Err(Error::Handler {
                id: message.id,
                actor: message.dst,
                message: err.message,
            }),
            (None, None) => Ok(serde_json::Value::Null),
        }
    }

    /// Entry point for the receiver's `/ask` handler: a remote peer's request arrived and must
    /// be answered synchronously (§4.6), so it bypasses the dispatch loop just like a local ask
    /// but still writes BEGIN/DONE for observability.
    pub async fn handle_ask(self: &Arc<Self>, message: Message) -> Result<serde_json::Value> {
        self.invoke_as_ask(message).await
    }

    /// Wraps `invoke` with BEGIN/DONE(or ERROR) records for a synchronous ask (§4.4: "still
    /// write BEGIN/DONE for observability, but may mark the entry terminal immediately"). The
    /// BEGIN is reserved straight to EXECUTING so the periodic dispatch loop never also picks
    /// the same message up via `take_pending`.
    async fn invoke_as_ask(self: &Arc<Self>, message: Message) -> Result<serde_json::Value> {
        let id = message.id;
        let dst = message.dst.clone();
        if let Err(e) = self.storage.begin_reserved(message.clone()).await {
            warn!(error = %e, %id, "failed to record BEGIN for ask");
        }
        match self.invoke(message).await {
            Ok(value) => {
                if let Err(e) = self.storage.done(id, Some(value.clone())).await {
                    warn!(error = %e, %id, "failed to persist DONE record for ask");
                }
                Ok(value)
            }
            Err(e) => {
                let info = ErrorInfo {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                    actor: dst,
                };
                if let Err(store_err) = self.storage.error(id, info).await {
                    warn!(error = %store_err, %id, "failed to persist ERROR record for ask");
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Dispatch for Executor {
    async fn ask(
        &self,
        dst: &str,
        content: serde_json::Value,
        dst_node: Option<String>,
    ) -> Result<serde_json::Value> {
        let mut message = Message::new("api.ask", dst, content);
        message.is_ask = true;
        message.dst_node = dst_node;
        let snapshot = self.registry.snapshot();
        let message = snapshot.complete_message(message)?;
        if snapshot.is_local(&message) {
            let this = self
                .self_weak
                .upgrade()
                .expect("executor outlives any in-flight ask against it");
            this.invoke_as_ask(message).await
        } else {
            self.ask_remote(message).await
        }
    }

    async fn tell(
        &self,
        dst: &str,
        content: serde_json::Value,
        dst_node: Option<String>,
        expire_at: Option<i64>,
    ) -> Result<()> {
        self.submit(dst, content, dst_node, expire_at, true).await
    }

    async fn hope(
        &self,
        dst: &str,
        content: serde_json::Value,
        dst_node: Option<String>,
        expire_at: Option<i64>,
    ) -> Result<()> {
        self.submit(dst, content, dst_node, expire_at, false).await
    }

    fn registry(&self) -> crate::registry::RegistrySnapshot {
        self.registry.snapshot()
    }
}

impl Executor {
    /// Durable fire-and-forget send (§4.2 "BEGIN [+ SEND]"): admits the message to storage,
    /// marking it `OUTBOX` immediately when the destination is remote so the sender's scan
    /// picks it up; local messages stay `INBOX` for this executor's own dispatch loop. Blocks
    /// until the admission itself is durable, so a `StorageFull` rejection reaches the caller
    /// instead of being dropped by a detached task (§4.2: "local submit blocks until drained").
    async fn submit(
        &self,
        dst: &str,
        content: serde_json::Value,
        dst_node: Option<String>,
        expire_at: Option<i64>,
        require_ack: bool,
    ) -> Result<()> {
        let mut message = Message::new("api", dst, content);
        message.dst_node = dst_node;
        message.expire_at = expire_at;
        message.require_ack = require_ack;
        let snapshot = self.registry.snapshot();
        message.src_node = Some(snapshot.current_node().name.clone());
        let message = snapshot.complete_message(message)?;
        let is_local = snapshot.is_local(&message);
        let id = message.id;
        self.storage.begin(message).await?;
        if !is_local {
            if let Err(e) = self.storage.send(id).await {
                warn!(error = %e, %id, "failed to mark message OUTBOX");
            }
        }
        Ok(())
    }
}
