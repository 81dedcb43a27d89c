// ABOUTME: Prometheus metrics for conversations, tool routing, exchanges, and backend usage.
// ABOUTME: Thin wrappers over the metrics facade so call sites stay one line.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use switchyard_agent::Usage;

/// Install the global Prometheus recorder
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// created, reused, removed, isolated
pub fn record_conversation(event: &'static str) {
    counter!("switchyard_conversations_total", "event" => event).increment(1);
}

pub fn set_active_conversations(count: u64) {
    gauge!("switchyard_active_conversations").set(count as f64);
}

pub fn record_tool_route(outcome: &'static str) {
    counter!("switchyard_tool_routes_total", "outcome" => outcome).increment(1);
}

pub fn record_exchange(dialect: &'static str, kind: &'static str) {
    counter!("switchyard_exchanges_total", "dialect" => dialect, "kind" => kind).increment(1);
}

pub fn record_exchange_duration(dialect: &'static str, seconds: f64) {
    histogram!("switchyard_exchange_duration_seconds", "dialect" => dialect).record(seconds);
}

pub fn record_error(kind: &'static str) {
    counter!("switchyard_errors_total", "kind" => kind).increment(1);
}

pub fn record_usage(usage: &Usage) {
    let model = usage.model.clone().unwrap_or_else(|| "unknown".to_string());
    counter!("switchyard_input_tokens_total", "model" => model.clone())
        .increment(usage.input_tokens);
    counter!("switchyard_output_tokens_total", "model" => model.clone())
        .increment(usage.output_tokens);
    if let Some(cost) = usage.cost_usd {
        gauge!("switchyard_cost_usd_total", "model" => model).increment(cost);
    }
}
