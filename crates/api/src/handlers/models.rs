//! `GET /v1/models` — per-tenant logical models.

use crate::state::AppState;
use crate::wire::{ModelInfo, ModelsResponse};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

/// Lists one logical model per tenant, named `<tenant>-<model>` so chat
/// front-ends can address a tenant through model selection alone.
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let generation = state.registry.snapshot();
    let policy = generation.policy();

    let data: Vec<ModelInfo> = generation
        .tenant_ids()
        .filter_map(|id| generation.runtime(id))
        .map(|runtime| ModelInfo {
            id: format!("{}-{}", runtime.config.id, runtime.config.model(policy)),
            object: "model",
            owned_by: runtime.config.name.clone(),
        })
        .collect();

    Json(ModelsResponse {
        object: "list",
        data,
    })
}
