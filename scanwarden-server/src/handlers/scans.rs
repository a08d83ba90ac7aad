use std::str::FromStr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use scanwarden_core::store::JobFilter;
use scanwarden_model::api::{ApiResponse, ScanProgressView, StartScanRequest};
use scanwarden_model::{ScanJobId, ScanState};
use serde::Deserialize;
use uuid::Uuid;

use crate::infra::app_state::AppState;
use crate::infra::errors::{AppError, AppResult};

#[derive(Debug, Deserialize)]
pub struct ListScansQuery {
    /// Comma-separated states, e.g. `crawling,auditing`.
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompletedQuery {
    pub limit: Option<usize>,
}

fn parse_states(raw: &str) -> AppResult<JobFilter> {
    let states = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            ScanState::from_str(part).map_err(|err| AppError::unprocessable(err.to_string()))
        })
        .collect::<AppResult<Vec<_>>>()?;
    Ok(JobFilter {
        states: (!states.is_empty()).then_some(states),
    })
}

pub async fn start_scan_handler(
    State(state): State<AppState>,
    Json(request): Json<StartScanRequest>,
) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator().start_scan(&request).await?;
    let message = match job.state {
        ScanState::Queued => "Scan queued",
        _ => "Scan started",
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(job).with_message(message.to_string())),
    ))
}

pub async fn list_scans_handler(
    State(state): State<AppState>,
    Query(query): Query<ListScansQuery>,
) -> AppResult<impl IntoResponse> {
    let filter = match query.state.as_deref() {
        Some(raw) => parse_states(raw)?,
        None => JobFilter::all(),
    };
    let jobs = state.orchestrator().list_scans(&filter).await?;
    Ok(Json(ApiResponse::success(jobs)))
}

pub async fn active_scans_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.orchestrator().active_scans().await))
}

pub async fn completed_scans_handler(
    State(state): State<AppState>,
    Query(query): Query<CompletedQuery>,
) -> AppResult<impl IntoResponse> {
    let completed = state.orchestrator().completed_scans(query.limit).await?;
    Ok(Json(ApiResponse::success(completed)))
}

pub async fn get_scan_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator().get_scan(ScanJobId(id)).await?;
    Ok(Json(ApiResponse::success(job)))
}

pub async fn scan_progress_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator().get_scan(ScanJobId(id)).await?;
    Ok(Json(ApiResponse::success(ScanProgressView::from(&job))))
}

pub async fn pause_scan_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator().pause_scan(ScanJobId(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(job))))
}

pub async fn resume_scan_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator().resume_scan(ScanJobId(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(job))))
}

pub async fn stop_scan_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator().stop_scan(ScanJobId(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(job))))
}
