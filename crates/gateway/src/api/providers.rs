use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/models/readiness — health-probe friendly provider status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reports whether at least one LLM provider initialized successfully.
///
/// Returns 200 with `ready: true` when the registry has any usable
/// provider, even if others failed under `allow_none`; 503 when none did.
/// `init_errors` surfaces the masked failures for operators.
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let ready = !state.llm.is_empty();
    let body = serde_json::json!({
        "ready": ready,
        "providers": state.llm.list_providers(),
        "init_errors": state.llm.init_errors(),
    });

    if ready {
        Json(body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

pub async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    let providers = state.llm.list_providers();
    Json(serde_json::json!({
        "providers": providers,
        "count": providers.len(),
    }))
}

pub async fn list_roles(State(state): State<AppState>) -> impl IntoResponse {
    let roles = state.llm.list_roles();
    Json(serde_json::json!({
        "roles": roles,
    }))
}
