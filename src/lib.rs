//! A durable, HTTP-federated actor runtime.
//!
//! Nodes host named actor handlers (`"module.action"`) and exchange typed JSON messages
//! through three verbs: `ask` (synchronous request/reply), `tell` (durable, retried until
//! acked), and `hope` (durable, best-effort, no ack). A write-ahead log makes `tell`/`hope`
//! delivery crash-safe; `ask` is a plain synchronous call, local or remote.

pub mod actor;
pub mod config;
pub mod error;
pub mod executor;
pub mod message;
pub mod monitor;
pub mod node;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod storage;
pub mod timer;

pub use actor::{ActorContext, ActorDescriptor, BlockingHandler, CooperativeHandler, Dispatch, HandlerFn, HandlerKind};
pub use config::{NodeConfig, NodeConfigBuilder};
pub use error::{Error, Result};
pub use message::{Message, MessageId, Status};
pub use node::{Node, NodeBuilder};
pub use registry::{Network, NodeSpec};
