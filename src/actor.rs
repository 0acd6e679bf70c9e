//! Actor descriptors, handler kinds, and the context injected into handler invocations.
//!
//! The dynamic handler dispatch of the original implementation becomes a registry of typed
//! records here: `{name, kind, input_schema, output_schema, invoke}` (§9 design notes). Mixed
//! sync/async handlers are modelled as a tagged variant rather than unified into one trait,
//! because the suspension contract genuinely differs between them.

use crate::error::{Error, Result};
use crate::message::Message;
use crate::registry::RegistrySnapshot;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Which worker pool an actor's handler must run on (§4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerKind {
    /// Runs on the cooperative in-process task pool; must never block.
    Cooperative,
    /// Runs on an OS thread via `spawn_blocking`.
    Blocking,
    /// Runs on the CPU-bound pool (semaphore-gated `spawn_blocking`, §4.4).
    Cpu,
}

/// Validates message content against a schema. The real schema compiler is an external
/// collaborator (§1); this trait is the seam a caller plugs a validator into.
pub trait SchemaValidator: Send + Sync + fmt::Debug {
    fn validate(&self, value: &serde_json::Value) -> std::result::Result<(), String>;
}

/// Accepts any content; the default when an actor declares no schema.
#[derive(Debug, Default)]
pub struct NoopValidator;

impl SchemaValidator for NoopValidator {
    fn validate(&self, _value: &serde_json::Value) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// A cooperative (async) handler body.
#[async_trait]
pub trait CooperativeHandler: Send + Sync {
    async fn call(&self, ctx: ActorContext, content: serde_json::Value) -> Result<serde_json::Value>;
}

/// A blocking or CPU-bound (sync) handler body, run inside `spawn_blocking`.
pub trait BlockingHandler: Send + Sync {
    fn call(&self, ctx: ActorContext, content: serde_json::Value) -> Result<serde_json::Value>;
}

/// The tagged union over handler execution kind (§9: "do not unify").
#[derive(Clone)]
pub enum HandlerFn {
    Cooperative(Arc<dyn CooperativeHandler>),
    Blocking(Arc<dyn BlockingHandler>),
    Cpu(Arc<dyn BlockingHandler>),
}

impl HandlerFn {
    pub fn kind(&self) -> HandlerKind {
        match self {
            HandlerFn::Cooperative(_) => HandlerKind::Cooperative,
            HandlerFn::Blocking(_) => HandlerKind::Blocking,
            HandlerFn::Cpu(_) => HandlerKind::Cpu,
        }
    }
}

/// A registered actor: `name` ("module.action"), its pool kind, optional timer period, and
/// optional input/output schemas (§3).
#[derive(Clone)]
pub struct ActorDescriptor {
    pub name: String,
    pub module: String,
    pub handler: HandlerFn,
    pub timer: Option<Duration>,
    pub input_schema: Option<Arc<dyn SchemaValidator>>,
    pub output_schema: Option<Arc<dyn SchemaValidator>>,
}

impl ActorDescriptor {
    pub fn new(name: impl Into<String>, handler: HandlerFn) -> Self {
        let name = name.into();
        let module = name.split('.').next().unwrap_or(&name).to_string();
        ActorDescriptor {
            name,
            module,
            handler,
            timer: None,
            input_schema: None,
            output_schema: None,
        }
    }

    pub fn with_timer(mut self, period: Duration) -> Self {
        self.timer = Some(period);
        self
    }

    pub fn with_input_schema(mut self, schema: Arc<dyn SchemaValidator>) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: Arc<dyn SchemaValidator>) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn kind(&self) -> HandlerKind {
        self.handler.kind()
    }

    pub fn validate_input(&self, content: &serde_json::Value) -> Result<()> {
        if let Some(schema) = &self.input_schema {
            schema.validate(content).map_err(|message| Error::Schema {
                id: Default::default(),
                actor: self.name.clone(),
                message,
            })?;
        }
        Ok(())
    }
}

impl fmt::Debug for ActorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorDescriptor")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("kind", &self.kind())
            .field("timer", &self.timer)
            .finish()
    }
}

/// The interface a handler uses to reach back into the node: `ask`/`tell`/`hope` and a
/// read-only registry view. Implemented by the executor so that `actor.rs` has no dependency
/// on executor internals (avoids a module cycle).
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn ask(
        &self,
        dst: &str,
        content: serde_json::Value,
        dst_node: Option<String>,
    ) -> Result<serde_json::Value>;

    async fn tell(
        &self,
        dst: &str,
        content: serde_json::Value,
        dst_node: Option<String>,
        expire_at: Option<i64>,
    ) -> Result<()>;

    async fn hope(
        &self,
        dst: &str,
        content: serde_json::Value,
        dst_node: Option<String>,
        expire_at: Option<i64>,
    ) -> Result<()>;

    fn registry(&self) -> RegistrySnapshot;
}

/// Injected into every handler invocation (§4.4 step 2).
#[derive(Clone)]
pub struct ActorContext {
    pub message: Message,
    dispatch: Arc<dyn Dispatch>,
}

impl ActorContext {
    pub fn new(message: Message, dispatch: Arc<dyn Dispatch>) -> Self {
        ActorContext { message, dispatch }
    }

    pub async fn ask(&self, dst: &str, content: serde_json::Value) -> Result<serde_json::Value> {
        self.dispatch.ask(dst, content, None).await
    }

    pub async fn ask_node(
        &self,
        dst: &str,
        dst_node: &str,
        content: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.dispatch.ask(dst, content, Some(dst_node.to_string())).await
    }

    pub async fn tell(&self, dst: &str, content: serde_json::Value) -> Result<()> {
        self.dispatch.tell(dst, content, None, None).await
    }

    pub async fn hope(&self, dst: &str, content: serde_json::Value) -> Result<()> {
        self.dispatch.hope(dst, content, None, None).await
    }

    pub async fn hope_node(&self, dst: &str, dst_node: &str, content: serde_json::Value) -> Result<()> {
        self.dispatch.hope(dst, content, Some(dst_node.to_string()), None).await
    }

    pub fn registry(&self) -> RegistrySnapshot {
        self.dispatch.registry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_name_splits_module_on_first_dot() {
        struct Echo;
        #[async_trait]
        impl CooperativeHandler for Echo {
            async fn call(&self, _ctx: ActorContext, content: serde_json::Value) -> Result<serde_json::Value> {
                Ok(content)
            }
        }
        let descriptor = ActorDescriptor::new("worker.ping", HandlerFn::Cooperative(Arc::new(Echo)));
        assert_eq!(descriptor.module, "worker");
        assert_eq!(descriptor.kind(), HandlerKind::Cooperative);
    }
}
