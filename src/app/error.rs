use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::app::review::ReviewError;
use crate::lease::LeaseError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    /// The attempt is not in a state that allows the operation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A gating rule or row invariant refused the change.
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// The run could not be handed to a worker.
    #[error("dispatch failed: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ReviewError> for ApiError {
    fn from(err: ReviewError) -> Self {
        let message = err.to_string();
        match err {
            ReviewError::AttemptNotFound(_)
            | ReviewError::RowNotFound(_)
            | ReviewError::BlockerNotFound(_) => Self::NotFound(message),
            ReviewError::Transition(_)
            | ReviewError::NotEditable(_)
            | ReviewError::AlreadyAccepted { .. }
            | ReviewError::SecondAttemptRefused(_)
            | ReviewError::EscalationTooEarly { .. }
            | ReviewError::RunInProgress { .. } => Self::Conflict(message),
            ReviewError::Invariant(_)
            | ReviewError::Override(_)
            | ReviewError::MissingRejectionReason
            | ReviewError::UnknownComponent { .. }
            | ReviewError::SubmissionRefused { .. } => Self::Unprocessable(message),
            ReviewError::InvalidInput(_) => Self::BadRequest(message),
            ReviewError::Store(err) => Self::Other(err),
        }
    }
}

impl From<LeaseError> for ApiError {
    fn from(err: LeaseError) -> Self {
        Self::Conflict(err.to_string())
    }
}

impl ApiError {
    /// Lifts typed errors that travelled through `anyhow` back to their status.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<LeaseError>() {
            Ok(lease) => lease.into(),
            Err(err) => Self::Other(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "missing or invalid bearer token".to_owned(),
            ),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Unprocessable(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "UNPROCESSABLE", msg)
            }
            ApiError::Unavailable(msg) => {
                tracing::error!(%msg, "dispatch failed");
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", msg)
            }
            ApiError::Other(ref err) => {
                tracing::error!(?err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    format!("{err:#}"),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
