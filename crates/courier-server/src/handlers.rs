//! HTTP and WebSocket handlers for the Courier server.
//!
//! This module wires the broker, cache, store, and dispatcher together
//! and exposes the streaming and unary surfaces.

use crate::config::Config;
use crate::metrics;
use crate::session::{self, MessageResponse};
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use courier_broker::{BrokerBridge, BrokerBridgeConfig, MemoryBroker, PubSubBackend, RedisBroker};
use courier_cache::{Cache, CacheBackend, MemoryCache, RedisCache};
use courier_core::{
    ChatMessage, DispatchError, Dispatcher, DispatcherConfig, MemoryStore, StoredMessage,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The distribution core.
    pub dispatcher: Arc<Dispatcher>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Build the process-wide state: one broker bridge, one cache, one
    /// dispatcher, shared by every session.
    ///
    /// A Redis leg that cannot be reached at startup degrades to its
    /// in-process fallback rather than refusing to boot.
    pub async fn new(config: Config) -> Self {
        let broker_backend: Arc<dyn PubSubBackend> =
            match RedisBroker::connect(&config.broker.url).await {
                Ok(broker) => Arc::new(broker),
                Err(e) => {
                    warn!(
                        error = %e,
                        "Broker Redis unreachable, falling back to in-process pub/sub"
                    );
                    Arc::new(MemoryBroker::new())
                }
            };

        let cache_backend: Arc<dyn CacheBackend> =
            match RedisCache::connect(&config.cache.url).await {
                Ok(cache) => Arc::new(cache),
                Err(e) => {
                    warn!(
                        error = %e,
                        "Cache Redis unreachable, falling back to in-memory cache"
                    );
                    Arc::new(MemoryCache::new())
                }
            };

        let bridge = Arc::new(BrokerBridge::new(
            broker_backend,
            BrokerBridgeConfig {
                publish_deadline: Duration::from_millis(config.broker.publish_deadline_ms),
                ..BrokerBridgeConfig::default()
            },
        ));

        let cache = Cache::with_default_ttl(
            cache_backend,
            Duration::from_secs(config.cache.default_ttl_secs),
        );

        let dispatcher = Dispatcher::new(
            Arc::new(MemoryStore::new()),
            cache,
            bridge,
            DispatcherConfig {
                topic: config.broker.topic.clone(),
                history_ttl: Duration::from_secs(config.cache.history_ttl_secs),
                snapshot_ttl: Duration::from_secs(config.cache.default_ttl_secs),
            },
        );

        Self { dispatcher, config }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()).await);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/messages", post(send_message_handler))
        .route(
            "/groups/:group_id/messages",
            get(history_handler).delete(delete_group_handler),
        )
        .with_state(state.clone());

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Courier server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Release both broker connections; no topic handler runs past this
    // point.
    state.dispatcher.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        session::run_session(socket, state.dispatcher.clone(), state.config.limits.clone())
    })
}

/// Unary send: accept one message, return its enriched response.
async fn send_message_handler(
    State(state): State<Arc<AppState>>,
    Json(message): Json<ChatMessage>,
) -> impl IntoResponse {
    match state.dispatcher.handle(message.clone()).await {
        Ok(enriched) => (StatusCode::OK, Json(MessageResponse::from(enriched))),
        Err(e) => {
            let (status, kind) = match &e {
                DispatchError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
                DispatchError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "persistence"),
            };
            warn!(error = %e, "Unary send failed");
            metrics::record_error(kind);
            (
                status,
                Json(MessageResponse::from(message.failed(e.to_string()))),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    messages: Vec<StoredMessage>,
}

/// Unary history read for a group, newest first.
async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    match state
        .dispatcher
        .get_history(&group_id, params.limit.unwrap_or(0))
        .await
    {
        Ok(messages) => (StatusCode::OK, Json(HistoryResponse { messages })).into_response(),
        Err(e) => {
            error!(group = %group_id, error = %e, "History query failed");
            metrics::record_error("persistence");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Delete every message of a group.
async fn delete_group_handler(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
) -> impl IntoResponse {
    match state.dispatcher.delete_group(&group_id).await {
        Ok(deleted) => {
            (StatusCode::OK, Json(serde_json::json!({ "deleted": deleted }))).into_response()
        }
        Err(e) => {
            error!(group = %group_id, error = %e, "Group delete failed");
            metrics::record_error("persistence");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
