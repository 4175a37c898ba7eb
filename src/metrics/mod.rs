//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Router deployments and their failures
//! - Remote transfer messages
//! - Relay queue depth
//! - Deposits

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_int_counter_vec, register_int_gauge, CounterVec, Encoder,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Deployment metrics
    pub static ref ROUTERS_DEPLOYED: IntCounterVec = register_int_counter_vec!(
        "faucetful_routers_deployed_total",
        "Routers deployed and initialized",
        &["chain"]
    ).expect("metric can be registered");

    pub static ref DEPLOY_FAILURES: IntCounterVec = register_int_counter_vec!(
        "faucetful_deploy_failures_total",
        "Deployment failures by kind",
        &["chain", "kind"]
    ).expect("metric can be registered");

    pub static ref DEPLOY_RETRIES: IntCounterVec = register_int_counter_vec!(
        "faucetful_deploy_retries_total",
        "Retried deployment steps",
        &["chain"]
    ).expect("metric can be registered");

    // Message metrics
    pub static ref MESSAGES_DISPATCHED: IntCounterVec = register_int_counter_vec!(
        "faucetful_messages_dispatched_total",
        "Remote transfer messages dispatched",
        &["origin", "destination"]
    ).expect("metric can be registered");

    pub static ref MESSAGES_DELIVERED: IntCounterVec = register_int_counter_vec!(
        "faucetful_messages_delivered_total",
        "Remote transfer messages applied at their destination",
        &["origin", "destination"]
    ).expect("metric can be registered");

    pub static ref MESSAGES_DUPLICATE: IntCounterVec = register_int_counter_vec!(
        "faucetful_messages_duplicate_total",
        "Redelivered messages acknowledged without effect",
        &["origin", "destination"]
    ).expect("metric can be registered");

    pub static ref MESSAGES_REJECTED: IntCounterVec = register_int_counter_vec!(
        "faucetful_messages_rejected_total",
        "Messages dropped after their destination rejected an already acknowledged nonce",
        &["origin", "destination"]
    ).expect("metric can be registered");

    pub static ref RELAY_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "faucetful_relay_queue_depth",
        "Messages queued in the relay"
    ).expect("metric can be registered");

    // Token metrics
    pub static ref DEPOSITS: CounterVec = register_counter_vec!(
        "faucetful_deposits_total",
        "Deposits accepted by the mainnet router",
        &["chain"]
    ).expect("metric can be registered");
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Current metrics in the Prometheus text format
pub fn render() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// Helper functions to record metrics

pub fn record_router_deployed(chain: &str) {
    ROUTERS_DEPLOYED.with_label_values(&[chain]).inc();
}

pub fn record_deploy_failure(chain: &str, kind: &str) {
    DEPLOY_FAILURES.with_label_values(&[chain, kind]).inc();
}

pub fn record_deploy_retry(chain: &str) {
    DEPLOY_RETRIES.with_label_values(&[chain]).inc();
}

pub fn record_message_dispatched(origin: u64, destination: u64) {
    MESSAGES_DISPATCHED
        .with_label_values(&[&origin.to_string(), &destination.to_string()])
        .inc();
}

pub fn record_message_delivered(origin: u64, destination: u64) {
    MESSAGES_DELIVERED
        .with_label_values(&[&origin.to_string(), &destination.to_string()])
        .inc();
}

pub fn record_duplicate_message(origin: u64, destination: u64) {
    MESSAGES_DUPLICATE
        .with_label_values(&[&origin.to_string(), &destination.to_string()])
        .inc();
}

pub fn record_message_rejected(origin: u64, destination: u64) {
    MESSAGES_REJECTED
        .with_label_values(&[&origin.to_string(), &destination.to_string()])
        .inc();
}

pub fn set_relay_queue_depth(depth: usize) {
    RELAY_QUEUE_DEPTH.set(depth as i64);
}

pub fn record_deposit(chain: &str) {
    DEPOSITS.with_label_values(&[chain]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_metrics_are_rendered() {
        record_router_deployed("metrics-test");
        record_deploy_failure("metrics-test", "rejected");
        record_message_dispatched(5, 80001);

        let text = render().unwrap();
        assert!(text.contains("faucetful_routers_deployed_total"));
        assert!(text.contains(r#"kind="rejected""#));
        assert!(text.contains("faucetful_messages_dispatched_total"));
    }
}
