use axum::{ http::StatusCode, response::{ IntoResponse, Response }, Json };
use serde::Serialize;
use thiserror::Error;

use crate::storage::StorageError;

const MIB: f64 = 1024.0 * 1024.0;

/// `4` for 4 MiB, `3.5` for 3.5 MiB. Never rounds a limit down to a whole number.
fn mib_label(bytes: &usize) -> String {
    let label = format!("{:.2}", (*bytes as f64) / MIB);
    label.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Every failure a caller of the advisor can observe. Messages are safe to show
/// to the end user as-is.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("An account with this email already exists.")]
    DuplicateAccount,

    #[error("Invalid email or password.")]
    InvalidCredentials,

    #[error("File is too large. Please upload an image smaller than {}MB.", mib_label(.limit))]
    OversizedInput {
        size: usize,
        limit: usize,
    },

    #[error("Unsupported image type '{0}'. Please upload a PNG, JPEG or WEBP image.")]
    UnsupportedMediaType(String),

    #[error("{0}")]
    AnalysisFailed(String),

    #[error("{0}")]
    ConversationFailed(String),

    #[error("You need to sign in first.")]
    NotAuthenticated,

    #[error("{0}")]
    InvalidInput(String),

    #[error("An analysis is already in progress. Please wait for it to finish.")]
    AnalysisInProgress,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Something went wrong. Please try again.")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::DuplicateAccount => "duplicate_account",
            AppError::InvalidCredentials => "invalid_credentials",
            AppError::OversizedInput { .. } => "oversized_input",
            AppError::UnsupportedMediaType(_) => "unsupported_media_type",
            AppError::AnalysisFailed(_) => "analysis_failed",
            AppError::ConversationFailed(_) => "conversation_failed",
            AppError::NotAuthenticated => "not_authenticated",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::AnalysisInProgress => "analysis_in_progress",
            AppError::Storage(_) => "storage_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::DuplicateAccount => StatusCode::CONFLICT,
            AppError::InvalidCredentials | AppError::NotAuthenticated => StatusCode::UNAUTHORIZED,
            AppError::OversizedInput { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::AnalysisFailed(_) | AppError::ConversationFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::AnalysisInProgress => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Storage(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Backend details stay in the log.
        let message = match &self {
            AppError::Storage(e) => {
                log::error!("Storage failure: {}", e);
                "Something went wrong while saving your data.".to_string()
            }
            AppError::Internal(detail) => {
                log::error!("Internal failure: {}", detail);
                self.to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: ErrorDetail { code: self.code(), message },
        };
        (status, Json(body)).into_response()
    }
}
