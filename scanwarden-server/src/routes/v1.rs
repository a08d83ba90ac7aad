use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    AppState,
    handlers::{findings, scans, stats},
};

/// Create all v1 API routes
pub fn create_v1_router(_state: AppState) -> Router<AppState> {
    Router::new()
        // Scan lifecycle
        .route(
            "/scans",
            get(scans::list_scans_handler).post(scans::start_scan_handler),
        )
        .route("/scans/active", get(scans::active_scans_handler))
        .route("/scans/completed", get(scans::completed_scans_handler))
        .route("/scans/{id}", get(scans::get_scan_handler))
        .route("/scans/{id}/progress", get(scans::scan_progress_handler))
        .route("/scans/{id}/pause", post(scans::pause_scan_handler))
        .route("/scans/{id}/resume", post(scans::resume_scan_handler))
        .route("/scans/{id}/stop", post(scans::stop_scan_handler))
        // Results
        .route("/findings", get(findings::list_findings_handler))
        .route("/stats", get(stats::stats_handler))
}
