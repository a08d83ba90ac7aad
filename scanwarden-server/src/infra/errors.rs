use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use scanwarden_core::ScanError;
use scanwarden_model::api::ApiResponse;
use std::fmt;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let payload = Json(ApiResponse::<()>::error(self.message));
        (self.status, payload).into_response()
    }
}

/// HTTP status for each scan error kind.
pub fn scan_error_status(err: &ScanError) -> StatusCode {
    match err {
        ScanError::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ScanError::InvalidTransition { .. } => StatusCode::CONFLICT,
        ScanError::NotFound(_) => StatusCode::NOT_FOUND,
        ScanError::ScanAlreadyActive(_) => StatusCode::CONFLICT,
        ScanError::DuplicateCompletedScan(_) => StatusCode::CONFLICT,
        ScanError::ExternalEngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ScanError::ExternalEngineRejected(_) => StatusCode::BAD_GATEWAY,
        ScanError::StoreWriteFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
        ScanError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ScanError> for AppError {
    fn from(err: ScanError) -> Self {
        let status = scan_error_status(&err);
        if status.is_server_error() {
            tracing::warn!(error = %err, status = status.as_u16(), "scan request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}
