//! Built-in scheduling actors (§4.8): periodic timers for any actor that declares one, a
//! one-shot `actor.init` fired at startup, and an `actor.health` handler mirroring `/health`
//! for composition from inside other actors.

use crate::actor::{ActorContext, ActorDescriptor, CooperativeHandler, HandlerFn};
use crate::error::Result;
use crate::registry::Registry;
use crate::storage::Storage;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const INIT_ACTOR: &str = "actor.init";
pub const HEALTH_ACTOR: &str = "actor.health";

/// Fires `hope(descriptor.name, {})` on a fixed interval for every descriptor that declared a
/// timer period (§4.8 "Timer").
pub struct TimerScheduler;

impl TimerScheduler {
    /// Spawns one periodic task per timed actor. Each tick calls `dispatch.hope`, so a missed
    /// tick under backpressure just means the next tick tries again rather than queuing up.
    pub fn start(descriptors: &[ActorDescriptor], dispatch: Arc<dyn crate::actor::Dispatch>) {
        for descriptor in descriptors {
            let Some(period) = descriptor.timer else {
                continue;
            };
            let name = descriptor.name.clone();
            let dispatch = dispatch.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    if let Err(e) = dispatch.hope(&name, json!({}), None, None).await {
                        warn!(error = %e, actor = %name, "timer tick failed to enqueue");
                    }
                }
            });
        }
    }
}

/// Sends `actor.init` once, if and only if some actor registered under that exact name (§4.8
/// "Init"). Fire-and-forget: startup does not block on its completion.
pub async fn fire_init(dispatch: &dyn crate::actor::Dispatch, registered: bool) {
    if !registered {
        return;
    }
    if let Err(e) = dispatch.hope(INIT_ACTOR, json!({}), None, None).await {
        warn!(error = %e, "failed to enqueue actor.init");
    }
}

/// The built-in `actor.health` handler (§4.8), registered automatically unless a user actor
/// already claims the name.
pub struct HealthHandler {
    storage: Arc<dyn Storage>,
    registry: Arc<Registry>,
}

impl HealthHandler {
    pub fn new(storage: Arc<dyn Storage>, registry: Arc<Registry>) -> Self {
        HealthHandler { storage, registry }
    }

    pub fn descriptor(storage: Arc<dyn Storage>, registry: Arc<Registry>) -> ActorDescriptor {
        ActorDescriptor::new(
            HEALTH_ACTOR,
            HandlerFn::Cooperative(Arc::new(HealthHandler::new(storage, registry))),
        )
    }
}

#[async_trait]
impl CooperativeHandler for HealthHandler {
    async fn call(&self, _ctx: ActorContext, _content: serde_json::Value) -> Result<serde_json::Value> {
        let stats = self.storage.stats().await;
        let snapshot = self.registry.snapshot();
        Ok(json!({
            "node": snapshot.current_node().name,
            "pending": stats.pending,
            "done": stats.done,
            "outbox": stats.outbox,
            "peers": snapshot.nodes().map(|n| n.name.clone()).collect::<Vec<_>>(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NodeSpec, Registry};
    use crate::storage::MemoryStorage;
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn health_handler_reports_node_name() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(10));
        let registry = Arc::new(
            Registry::new(
                NodeSpec {
                    name: "local".into(),
                    modules: BTreeSet::new(),
                    networks: vec![],
                },
                None,
            )
            .unwrap(),
        );
        let handler = HealthHandler::new(storage, registry);
        let ctx = ActorContext::new(
            crate::message::Message::new("x", HEALTH_ACTOR, json!({})),
            Arc::new(NullDispatch) as Arc<dyn crate::actor::Dispatch>,
        );
        let result = handler.call(ctx, json!({})).await.unwrap();
        assert_eq!(result["node"], "local");
    }

    struct NullDispatch;
    #[async_trait]
    impl crate::actor::Dispatch for NullDispatch {
        async fn ask(&self, _dst: &str, _content: serde_json::Value, _dst_node: Option<String>) -> Result<serde_json::Value> {
            unimplemented!()
        }
        async fn tell(&self, _dst: &str, _content: serde_json::Value, _dst_node: Option<String>, _expire_at: Option<i64>) -> Result<()> {
            unimplemented!()
        }
        async fn hope(&self, _dst: &str, _content: serde_json::Value, _dst_node: Option<String>, _expire_at: Option<i64>) -> Result<()> {
            unimplemented!()
        }
        fn registry(&self) -> crate::registry::RegistrySnapshot {
            unimplemented!()
        }
    }
}
