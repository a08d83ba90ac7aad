use std::str::FromStr;

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use scanwarden_core::store::FindingQuery;
use scanwarden_model::api::ApiResponse;
use scanwarden_model::{ScanJobId, Severity};
use serde::Deserialize;
use uuid::Uuid;

use crate::infra::app_state::AppState;
use crate::infra::errors::{AppError, AppResult};

const MAX_FINDINGS_LIMIT: usize = 5_000;

#[derive(Debug, Default, Deserialize)]
pub struct FindingsQuery {
    pub scan_id: Option<Uuid>,
    pub severity: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl FindingsQuery {
    fn into_store_query(self) -> Result<FindingQuery, AppError> {
        let severity = self
            .severity
            .as_deref()
            .map(Severity::from_str)
            .transpose()
            .map_err(|err| AppError::unprocessable(err.to_string()))?;
        if let (Some(since), Some(until)) = (self.since, self.until)
            && since > until
        {
            return Err(AppError::unprocessable("since must not be after until"));
        }
        Ok(FindingQuery {
            scan_job_id: self.scan_id.map(ScanJobId),
            severity,
            since: self.since,
            until: self.until,
            limit: self.limit.map(|limit| limit.min(MAX_FINDINGS_LIMIT)),
        })
    }
}

pub async fn list_findings_handler(
    State(state): State<AppState>,
    Query(query): Query<FindingsQuery>,
) -> AppResult<impl IntoResponse> {
    let query = query.into_store_query()?;
    let findings = state.orchestrator().list_findings(&query).await?;
    Ok(Json(ApiResponse::success(findings)))
}
