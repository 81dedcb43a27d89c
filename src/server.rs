// ABOUTME: HTTP server: shared state, route table, and startup with graceful shutdown
// ABOUTME: Serves the three dialects, the per-conversation MCP bridge, models, health, and metrics

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::sync::Arc;
use switchyard_agent::AgentRegistry;
use switchyard_core::{metrics, ConversationManager, Gateway};
use tower_http::trace::TraceLayer;

use crate::{
    config::Config,
    dialects::{anthropic, openai, responses, unix_now},
    mcp::mcp_handler,
};

/// State shared by every route
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    /// Absent when the Prometheus recorder could not be installed
    pub metrics: Option<Arc<PrometheusHandle>>,
}

impl AppState {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(Arc::new(handle));
        self
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/models", get(models_handler))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/messages", post(anthropic::messages))
        .route("/v1/responses", post(responses::responses))
        .route("/mcp/{conversation_id}", post(mcp_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build the backend and gateway from config and serve until Ctrl-C
pub async fn start_server(config: Config) -> Result<()> {
    let agent = AgentRegistry::default().start(&config.backend)?;
    tracing::info!(backend = agent.name(), "Backend ready");

    let manager = ConversationManager::new(config.bridge_settings());
    let gateway = Gateway::new(manager.clone(), agent, config.gateway_settings());

    let mut state = AppState::new(gateway);
    match metrics::init_metrics() {
        Ok(handle) => state = state.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "Prometheus metrics disabled"),
    }

    let app = build_router(state);
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(addr = %addr, public_url = %config.public_url(), "Switchyard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    tracing::info!("Shutting down");
    manager.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Handle GET /health
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "conversations": state.gateway.manager().len(),
    }))
}

/// Handle GET /v1/models in OpenAI list shape
async fn models_handler(State(state): State<AppState>) -> Response {
    match state.gateway.list_models().await {
        Ok(models) => {
            let created = unix_now();
            let owner = state.gateway.agent().name();
            let data: Vec<_> = models
                .iter()
                .map(|m| {
                    json!({
                        "id": m.id,
                        "object": "model",
                        "created": created,
                        "owned_by": owner,
                    })
                })
                .collect();
            Json(json!({"object": "list", "data": data})).into_response()
        }
        Err(e) => crate::dialects::error_response::<openai::OpenAiChat>(&e),
    }
}

/// Handle GET /metrics - returns Prometheus text format
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

