//! End-to-end scenarios (§8 testable properties): local ask, cross-node tell with ack,
//! handler failure, and backpressure under a tight pending cap.

use actor_mesh::actor::{ActorContext, ActorDescriptor, CooperativeHandler, HandlerFn};
use actor_mesh::config::NodeConfigBuilder;
use actor_mesh::error::Result;
use actor_mesh::node::Node;
use actor_mesh::registry::{Network, NodeSpec};
use actor_mesh::storage::Storage;
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;

struct Echo;
#[async_trait]
impl CooperativeHandler for Echo {
    async fn call(&self, _ctx: ActorContext, content: serde_json::Value) -> Result<serde_json::Value> {
        Ok(content)
    }
}

struct AlwaysFails;
#[async_trait]
impl CooperativeHandler for AlwaysFails {
    async fn call(&self, ctx: ActorContext, _content: serde_json::Value) -> Result<serde_json::Value> {
        Err(actor_mesh::error::Error::Handler {
            id: ctx.message.id,
            actor: ctx.message.dst.clone(),
            message: "intentional failure".to_string(),
        })
    }
}

struct Counter(std::sync::Arc<std::sync::atomic::AtomicUsize>);
#[async_trait]
impl CooperativeHandler for Counter {
    async fn call(&self, _ctx: ActorContext, content: serde_json::Value) -> Result<serde_json::Value> {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(content)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn local_ask_returns_handler_result() {
    let config = NodeConfigBuilder::new("solo").port(18881).build().unwrap();
    let node = Node::builder(config)
        .actor(ActorDescriptor::new("echo.ping", HandlerFn::Cooperative(std::sync::Arc::new(Echo))))
        .build()
        .await
        .unwrap();

    let result = node.ask("echo.ping", json!({"hello": "world"})).await.unwrap();
    assert_eq!(result, json!({"hello": "world"}));

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ask_against_unregistered_actor_is_a_routing_error() {
    let config = NodeConfigBuilder::new("solo2").port(18882).build().unwrap();
    let node = Node::builder(config).build().await.unwrap();

    let err = node.ask("ghost.nothing", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), "routing_error");

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_failure_surfaces_as_handler_error() {
    let config = NodeConfigBuilder::new("faulty").port(18883).build().unwrap();
    let node = Node::builder(config)
        .actor(ActorDescriptor::new("bad.op", HandlerFn::Cooperative(std::sync::Arc::new(AlwaysFails))))
        .build()
        .await
        .unwrap();

    let err = node.ask("bad.op", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), "handler_error");

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tell_across_nodes_is_delivered_and_processed() {
    let counter = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let receiver_config = NodeConfigBuilder::new("receiver")
        .port(18884)
        .network("lan", "http://127.0.0.1:18884".parse().unwrap())
        .build()
        .unwrap();
    let receiver_spec = NodeSpec {
        name: "receiver".to_string(),
        modules: BTreeSet::from(["work".to_string()]),
        networks: vec![Network {
            name: "lan".to_string(),
            url: "http://127.0.0.1:18884".parse().unwrap(),
        }],
    };
    let receiver_node = Node::builder(receiver_config)
        .actor(ActorDescriptor::new(
            "work.count",
            HandlerFn::Cooperative(std::sync::Arc::new(Counter(counter.clone()))),
        ))
        .build()
        .await
        .unwrap();

    let sender_config = NodeConfigBuilder::new("sender")
        .port(18885)
        .network("lan", "http://127.0.0.1:18885".parse().unwrap())
        .build()
        .unwrap();
    let sender_node = Node::builder(sender_config)
        .peer(receiver_spec)
        .build()
        .await
        .unwrap();

    sender_node.tell("work.count", json!({"n": 1})).await.unwrap();

    // Give the sender's scan loop and the receiver's dispatch loop a few ticks to run.
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);

    sender_node.shutdown().await;
    receiver_node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn storage_rejects_new_messages_once_at_capacity() {
    let config = NodeConfigBuilder::new("tiny")
        .port(18886)
        .storage_max_pending(1)
        .build()
        .unwrap();
    let node = Node::builder(config)
        .actor(ActorDescriptor::new("echo.ping", HandlerFn::Cooperative(std::sync::Arc::new(Echo))))
        .build()
        .await
        .unwrap();

    let storage = node.storage();
    let first = actor_mesh::message::Message::new("x", "echo.ping", json!({}));
    storage.begin(first).await.unwrap();
    let second = actor_mesh::message::Message::new("x", "echo.ping", json!({}));
    let err = storage.begin(second).await.unwrap_err();
    assert_eq!(err.kind(), "storage_full");

    node.shutdown().await;
}
