//! Gateway error types.

use axum::{http::StatusCode, response::IntoResponse, Json};
use canvas::CanvasError;
use game::{DuelError, Rejection};
use serde::Serialize;
use thiserror::Error;

/// Startup and wiring failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bus error: {0}")]
    Bus(#[from] realtime::BusError),

    #[error("Storage error: {0}")]
    Store(#[from] game::StoreError),

    #[error("Canvas error: {0}")]
    Canvas(#[from] CanvasError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors returned by HTTP handlers.
#[derive(Debug)]
pub enum ApiError {
    BadRequest { message: String, code: &'static str },
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl ApiError {
    pub fn bad_request(message: impl ToString, code: &'static str) -> Self {
        ApiError::BadRequest {
            message: message.to_string(),
            code,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let (error, code) = match self {
            ApiError::BadRequest { message, code } => (message, code),
            ApiError::Forbidden(msg) => (msg, "FORBIDDEN"),
            ApiError::NotFound(msg) => (msg, "NOT_FOUND"),
            ApiError::Conflict(msg) => (msg, "CONFLICT"),
            ApiError::Internal(msg) => (msg, "INTERNAL_ERROR"),
        };
        (status, Json(ErrorResponse { error, code })).into_response()
    }
}

impl From<DuelError> for ApiError {
    fn from(e: DuelError) -> Self {
        let message = e.to_string();
        match e {
            DuelError::NotFound(what) => ApiError::NotFound(format!("Game not found: {}", what)),
            DuelError::Rejected(reason @ (Rejection::NotParticipant(_) | Rejection::NotCreator)) => {
                ApiError::Forbidden(reason.to_string())
            }
            DuelError::Rejected(reason) => ApiError::bad_request(reason, "REJECTED"),
            DuelError::Contention(_) => ApiError::Conflict(message),
            DuelError::CodeGeneration(_) | DuelError::Store(_) => {
                tracing::error!("Game operation failed: {}", message);
                ApiError::Internal(message)
            }
        }
    }
}

impl From<CanvasError> for ApiError {
    fn from(e: CanvasError) -> Self {
        if e.is_invalid_input() {
            ApiError::bad_request(e, "INVALID_PIXEL")
        } else {
            tracing::error!("Canvas operation failed: {}", e);
            ApiError::Internal(e.to_string())
        }
    }
}
