// ABOUTME: Shared HTTP plumbing for the three client wire dialects.
// ABOUTME: Parses the body, starts a gateway exchange, and streams its frames as SSE.

pub mod anthropic;
pub mod openai;
pub mod responses;

use crate::server::AppState;
use axum::{
    body::Bytes,
    http::{HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::convert::Infallible;
use switchyard_core::{metrics, Exchange, ExchangeRequest, GatewayError, ProtocolRenderer, WireFrame};

/// Response header carrying the conversation id an exchange landed on
pub const CONVERSATION_HEADER: &str = "x-switchyard-conversation";

/// One client wire format
pub trait Dialect {
    /// Label used in logs and metrics
    const NAME: &'static str;

    type Request: DeserializeOwned + Send;

    /// Validate a parsed body and map it onto the canonical request
    fn into_exchange(request: Self::Request) -> Result<ExchangeRequest, GatewayError>;

    fn renderer(model: &str) -> Box<dyn ProtocolRenderer>;

    /// The dialect's JSON error envelope
    fn error_body(err: &GatewayError) -> Value;
}

/// Drive one request for dialect `D`
pub async fn handle<D: Dialect>(state: AppState, body: Bytes) -> Response {
    let request = match serde_json::from_slice::<D::Request>(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(dialect = D::NAME, error = %e, "Rejecting malformed request body");
            return error_response::<D>(&GatewayError::InvalidRequest(format!(
                "invalid request body: {}",
                e
            )));
        }
    };
    let request = match D::into_exchange(request) {
        Ok(request) => request,
        Err(e) => return error_response::<D>(&e),
    };

    match state.gateway.begin(request, D::renderer).await {
        Ok(exchange) => {
            metrics::record_exchange(D::NAME, exchange.kind.as_str());
            sse_response(D::NAME, exchange)
        }
        Err(e) => {
            metrics::record_error("exchange_rejected");
            error_response::<D>(&e)
        }
    }
}

pub fn error_response<D: Dialect>(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!(dialect = D::NAME, error = %err, "Request failed");
    } else {
        tracing::info!(dialect = D::NAME, error = %err, "Request rejected");
    }
    (status, Json(D::error_body(err))).into_response()
}

fn sse_response(dialect: &'static str, exchange: Exchange) -> Response {
    let Exchange {
        conversation_id,
        kind,
        model,
        stream,
        done,
    } = exchange;

    let started = std::time::Instant::now();
    let log_id = conversation_id.clone();
    tokio::spawn(async move {
        done.wait().await;
        let elapsed = started.elapsed();
        metrics::record_exchange_duration(dialect, elapsed.as_secs_f64());
        tracing::info!(
            conversation_id = %log_id,
            dialect,
            kind = kind.as_str(),
            model = %model,
            elapsed_ms = elapsed.as_millis() as u64,
            "Exchange finished"
        );
    });

    let events = futures_util::stream::unfold(stream, |mut stream| async move {
        let frame = stream.recv().await?;
        Some((Ok::<_, Infallible>(to_event(frame)), stream))
    });

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&conversation_id) {
        response.headers_mut().insert(CONVERSATION_HEADER, value);
    }
    response
}

fn to_event(frame: WireFrame) -> Event {
    match frame {
        WireFrame::Event { event, data } => {
            let frame = match event {
                Some(name) => Event::default().event(name),
                None => Event::default(),
            };
            frame.data(data.to_string())
        }
        WireFrame::Done => Event::default().data("[DONE]"),
    }
}

/// Unix timestamp in seconds for response envelopes
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Short random suffix for response and item ids
pub(crate) fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..24].to_string()
}

/// Parse a JSON-encoded arguments string, keeping it as a string if it is
/// not valid JSON
pub(crate) fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Arguments as the JSON string wire formats carry
pub(crate) fn arguments_string(arguments: &Value) -> String {
    match arguments {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
