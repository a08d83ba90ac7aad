use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use scanwarden_model::api::ApiResponse;
use serde_json::{Value, json};
use tracing::warn;

use crate::infra::app_state::AppState;
use crate::infra::errors::AppResult;

pub async fn stats_handler(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let stats = state.orchestrator().stats().await?;
    Ok(Json(ApiResponse::success(stats)))
}

pub async fn ping_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let mut status = StatusCode::OK;
    let database = match &state.postgres {
        Some(pg) => match pg.health_check().await {
            Ok(()) => "healthy",
            Err(err) => {
                warn!(error = %err, "database health check failed");
                status = StatusCode::SERVICE_UNAVAILABLE;
                "unhealthy"
            }
        },
        None => "not_configured",
    };

    (
        status,
        Json(json!({
            "status": if status.is_success() { "healthy" } else { "degraded" },
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION"),
            "store": state.store_kind(),
            "database": database,
        })),
    )
}
