//! Admin surface: tenant summaries and configuration reload.
//!
//! Gated by the `ASKGATE_ADMIN_TOKEN` environment variable; when it is
//! not set the admin surface is disabled entirely.

use crate::error::ApiError;
use crate::state::AppState;
use askgate_core::{Error, ErrorCode, TenantsDocument};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{info, warn};

const ADMIN_HEADER: &str = "x-admin-token";

fn require_admin(headers: &HeaderMap) -> Result<(), Error> {
    let expected = std::env::var("ASKGATE_ADMIN_TOKEN").map_err(|_| {
        Error::new(
            ErrorCode::UnauthorizedTenant,
            "admin interface is disabled (no admin token configured)",
        )
    })?;
    let presented = headers
        .get(ADMIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented == expected && !expected.is_empty() {
        Ok(())
    } else {
        Err(Error::new(
            ErrorCode::UnauthorizedTenant,
            "admin token missing or invalid",
        ))
    }
}

/// `GET /tenants` — tenant summary without secrets.
pub async fn list_tenants(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = require_admin(&headers) {
        return ApiError::new(e).into_response();
    }

    let generation = state.registry.snapshot();
    let tenants: Vec<serde_json::Value> = generation
        .tenant_ids()
        .filter_map(|id| generation.runtime(id))
        .map(|runtime| {
            let c = &runtime.config;
            json!({
                "id": c.id,
                "name": c.name,
                "description": c.description,
                "language": c.language,
                "database": {
                    "host": c.database.host,
                    "port": c.database.port,
                    "database": c.database.database,
                },
                "knowledge_base": c.knowledge_base.as_ref().map(|kb| json!({
                    "id": kb.id,
                    "search_type": kb.search_type,
                    "max_results": kb.max_results,
                })),
                "agents": {
                    "postgres": c.settings.enable_postgres_agent,
                    "knowledge_base": c.settings.enable_knowledge_base_agent,
                    "fallback": c.settings.enable_fallback_agent,
                },
                // endpoint names only; the gateway never calls these
                "webhooks": c.webhooks.keys().collect::<Vec<_>>(),
                "pool_active": runtime.pool_if_built().is_some(),
            })
        })
        .collect();

    Json(json!({
        "generation": generation.serial,
        "tenants": tenants,
    }))
    .into_response()
}

/// `POST /admin/reload` — parse the document again and swap generations.
pub async fn reload(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = require_admin(&headers) {
        return ApiError::new(e).into_response();
    }

    let document = match TenantsDocument::load(state.config_path.as_deref()) {
        Ok(document) => document,
        Err(e) => {
            warn!("reload rejected: {}", e.message);
            return ApiError::new(e).into_response();
        }
    };

    let generation = state.registry.reload(document);
    info!(generation = generation.serial, "configuration reloaded");
    Json(json!({
        "reloaded": true,
        "generation": generation.serial,
        "tenants": generation.tenant_ids().count(),
    }))
    .into_response()
}
