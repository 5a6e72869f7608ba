use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    governor::RetryGovernor,
    status::{StatusReport, StatusSource},
};

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the global Prometheus recorder. Calling it again is a no-op.
pub fn install_recorder() -> anyhow::Result<()> {
    PROM_HANDLE.get_or_try_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("failed to install Prometheus metrics recorder: {e}"))
    })?;
    Ok(())
}

#[derive(Clone)]
pub struct ServerState {
    pub status: Arc<dyn StatusSource>,
    pub governor: Arc<RetryGovernor>,
}

#[derive(Debug, Serialize)]
struct BreakerReset {
    device_id: i64,
    previous: &'static str,
    state: &'static str,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/breakers/:device_id/reset", post(reset_breaker_handler))
        .with_state(state)
}

/// Bind `bind_addr` and serve the operator routes until `cancel` fires.
pub async fn serve(
    bind_addr: &str,
    state: ServerState,
    cancel: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    install_recorder()?;
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics bind address {bind_addr}: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics server listening");

    let app = router(state);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "metrics server error");
        }
    }))
}

async fn metrics_handler() -> Result<String, StatusCode> {
    PROM_HANDLE
        .get()
        .map(PrometheusHandle::render)
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

async fn status_handler(State(state): State<ServerState>) -> Json<StatusReport> {
    Json(state.status.report().await)
}

/// Operator override: close a device's breaker without waiting out the open timeout.
async fn reset_breaker_handler(
    State(state): State<ServerState>,
    Path(device_id): Path<i64>,
) -> Json<BreakerReset> {
    let previous = state.governor.circuit_state(device_id).name();
    state.governor.reset_device(device_id);
    metrics::counter!("circuit_breaker_manual_resets_total").increment(1);
    Json(BreakerReset {
        device_id,
        previous,
        state: state.governor.circuit_state(device_id).name(),
    })
}
