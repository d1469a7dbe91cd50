use std::sync::Arc;

use axum::{routing::get, Json, Router};
use ranging_service::aggregator::SessionAggregator;
use ranging_service::audit::AuditLogger;
use ranging_service::capability::CapabilityRegistry;
use ranging_service::config::ServiceConfig;
use ranging_service::test_support::SimulatedAdapter;
use ranging_service::RangingAdapter;
use serde_json::json;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::default();
    info!(?config, "starting ranging-service");

    let audit = Arc::new(AuditLogger::new(config.audit_log_path.clone()));
    let capabilities = CapabilityRegistry::new();

    // No production adapter ships in this workspace yet — the service
    // binary runs against the same simulated radio stand-in the test suite
    // uses, so `/health` and the aggregator wiring can be exercised without
    // real UWB/BLE/Wi-Fi hardware attached.
    let adapter = Arc::new(SimulatedAdapter::new());
    for capability in adapter.local_capabilities().await {
        capabilities.register(capability).await;
    }

    let timeouts = ranging_service::peer_session::PeerTimeouts::from(&config);
    let (aggregator, mut events_rx) =
        SessionAggregator::with_timeouts(adapter, capabilities, audit, timeouts);

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            info!(?event, "peer session event");
        }
    });

    let health_port = config.health_port;
    let app = Router::new()
        .route("/health", get(health_check))
        .with_state(aggregator);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", health_port)).await?;
    info!(port = health_port, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(
    axum::extract::State(aggregator): axum::extract::State<Arc<SessionAggregator>>,
) -> Json<serde_json::Value> {
    let active_peers = aggregator.active_peers().await;
    Json(json!({
        "status": "ok",
        "active_sessions": active_peers.len(),
    }))
}
