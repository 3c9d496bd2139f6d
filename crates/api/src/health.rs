//! Health endpoints.
//!
//! `/health` reports build info plus per-tenant readiness. A tenant whose
//! pool has not been built yet (lazy mode) reports `lazy` rather than
//! failing the whole check; load balancers only see 503 when a built pool
//! stops answering.

use crate::state::AppState;
use askgate_core::check_health;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::error;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let generation = state.registry.snapshot();
    let mut tenants = serde_json::Map::new();
    let mut degraded = false;

    for id in generation.tenant_ids() {
        let Some(runtime) = generation.runtime(id) else { continue };
        let status = match runtime.pool_if_built() {
            None => "lazy",
            Some(pool) => match check_health(pool).await {
                Ok(()) => "ready",
                Err(e) => {
                    error!(tenant = id, "tenant database health check failed: {}", e.message);
                    degraded = true;
                    "error"
                }
            },
        };
        tenants.insert(id.to_string(), json!(status));
    }

    let status = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(json!({
            "status": if degraded { "degraded" } else { "healthy" },
            "service": "askgate-server",
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": state.started_at.to_rfc3339(),
            "generation": generation.serial,
            "tenants": tenants,
        })),
    )
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}
