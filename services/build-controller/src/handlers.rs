use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json,
    extract::{ConnectInfo, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use prometheus_client::{encoding::text::encode, registry::Registry};
use serde_json::json;
use tracing::{error, info, instrument};

pub const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[instrument(name = "root_handler", skip_all)]
pub async fn root_handler(
    cargo_pkg_name: &'static str,
    cargo_pkg_version: &'static str,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    info!(%addr, "client connected");
    Json(json!({
        "service": cargo_pkg_name,
        "version": cargo_pkg_version,
        "status": "ok"
    }))
}

#[instrument(name = "health_handler", skip_all)]
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

#[instrument(name = "ready_handler", skip_all)]
pub async fn ready_handler() -> impl IntoResponse {
    Json(json!({ "status": "ready" }))
}

#[instrument(name = "metrics_handler", skip_all)]
pub async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &registry) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "❌ Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[tracing::instrument("not_found_handler", skip_all, fields(addr = %addr))]
pub async fn not_found_handler(ConnectInfo(addr): ConnectInfo<SocketAddr>) -> impl IntoResponse {
    info!(%addr, "client connected");
    (StatusCode::NOT_FOUND, "nothing to see here")
}
