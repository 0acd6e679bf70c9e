//! Inbound HTTP surface (§4.6, §6): `axum` routes for `ask`, `notify`, and `health`, gated by an
//! optional bearer token. `/ask` answers synchronously from the executor; `/notify` admits the
//! message to storage and returns as soon as it is durable, which the sending peer's sender
//! treats as the ack.

use crate::error::Error;
use crate::executor::{AskResponseBody, Executor};
use crate::message::{Message, MessageId, NotifyItem};
use crate::registry::Registry;
use crate::storage::Storage;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
struct ReceiverState {
    executor: Arc<Executor>,
    storage: Arc<dyn Storage>,
    registry: Arc<Registry>,
    token: Option<String>,
}

pub fn router(
    executor: Arc<Executor>,
    storage: Arc<dyn Storage>,
    registry: Arc<Registry>,
    token: Option<String>,
    subpath: &str,
) -> Router {
    let state = ReceiverState {
        executor,
        storage,
        registry,
        token,
    };
    let subpath = if subpath.is_empty() { "/" } else { subpath };
    Router::new()
        .route(&format!("{subpath}/ask"), post(handle_ask))
        .route(&format!("{subpath}/notify"), post(handle_notify))
        .route(&format!("{subpath}/health"), get(handle_health))
        .with_state(state)
}

fn authorized(state: &ReceiverState, headers: &HeaderMap) -> bool {
    match &state.token {
        None => true,
        Some(expected) => headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|got| got == expected)
            .unwrap_or(false),
    }
}

async fn handle_ask(
    State(state): State<ReceiverState>,
    headers: HeaderMap,
    Json(message): Json<Message>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(AskResponseBody::err("unauthorized", "missing or invalid bearer token"))).into_response();
    }
    match state.executor.handle_ask(message).await {
        Ok(value) => (StatusCode::OK, Json(AskResponseBody::ok(value))).into_response(),
        Err(e) => {
            let status = match &e {
                Error::Routing { .. } => StatusCode::NOT_FOUND,
                Error::Schema { .. } => StatusCode::BAD_REQUEST,
                _ => StatusCode::OK,
            };
            (status, Json(AskResponseBody::err(e.kind(), e.to_string()))).into_response()
        }
    }
}

#[derive(Serialize)]
struct NotifyResponseBody {
    received: Vec<MessageId>,
}

async fn handle_notify(
    State(state): State<ReceiverState>,
    headers: HeaderMap,
    Json(items): Json<Vec<NotifyItem>>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut received = Vec::with_capacity(items.len());
    for item in items {
        match item {
            NotifyItem::Deliver(message) => {
                let id = message.id;
                match state.storage.begin(message).await {
                    Ok(()) => received.push(id),
                    Err(Error::StorageFull { .. }) => {
                        return StatusCode::SERVICE_UNAVAILABLE.into_response()
                    }
                    Err(e) => {
                        warn!(error = %e, %id, "failed to admit notified message");
                        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                    }
                }
            }
            NotifyItem::Ack { id } => match state.storage.ack(id).await {
                Ok(()) => received.push(id),
                Err(e) => {
                    warn!(error = %e, %id, "failed to record ack");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            },
        }
    }
    (StatusCode::OK, Json(NotifyResponseBody { received })).into_response()
}

#[derive(Serialize)]
struct HealthBody {
    node: String,
    pending: usize,
    done: usize,
    outbox: usize,
    peers: Vec<String>,
}

async fn handle_health(State(state): State<ReceiverState>) -> impl IntoResponse {
    let stats = state.storage.stats().await;
    let snapshot = state.registry.snapshot();
    let body = HealthBody {
        node: snapshot.current_node().name.clone(),
        pending: stats.pending,
        done: stats.done,
        outbox: stats.outbox,
        peers: snapshot.nodes().map(|n| n.name.clone()).collect(),
    };
    Json(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorDescriptor, CooperativeHandler, HandlerFn};
    use crate::registry::{NodeSpec, Registry};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::BTreeSet;
    use tower::ServiceExt;

    struct Echo;
    #[async_trait]
    impl CooperativeHandler for Echo {
        async fn call(&self, _ctx: crate::actor::ActorContext, content: serde_json::Value) -> crate::error::Result<serde_json::Value> {
            Ok(content)
        }
    }

    fn node(name: &str) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            modules: BTreeSet::from(["echo".to_string()]),
            networks: vec![],
        }
    }

    async fn build_router() -> Router {
        let registry = Arc::new(Registry::new(node("local"), None).unwrap());
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(100));
        let executor = Executor::new(
            registry.clone(),
            storage.clone(),
            vec![ActorDescriptor::new("echo.ping", HandlerFn::Cooperative(Arc::new(Echo)))],
            reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build(),
            None,
            4,
            std::time::Duration::from_secs(5),
            String::new(),
        );
        router(executor, storage, registry, None, "")
    }

    #[tokio::test]
    async fn health_reports_node_name() {
        let app = build_router().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ask_invokes_registered_actor() {
        let app = build_router().await;
        let message = Message::new("peer.x", "echo.ping", serde_json::json!({"v": 1}));
        let body = serde_json::to_vec(&message).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ask")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
