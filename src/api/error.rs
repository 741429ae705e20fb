//! Unified API error handling.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

/// API error type.
///
/// Conflicts (duplicate user, busy slice, exhausted pools) deliberately
/// surface as 500 with a descriptive message; only validation failures map
/// to 400 and unknown ids to 404.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Categorize an engine error by its message: "not found" is a 404,
    /// validation phrasing is a 400, everything else (conflicts included)
    /// is a 500.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        let msg = format!("{err:#}");
        let msg_lower = msg.to_lowercase();

        if msg_lower.contains("not found") {
            ApiError::NotFound(msg)
        } else if msg_lower.contains("required")
            || msg_lower.contains("invalid")
            || msg_lower.contains("mutually exclusive")
            || msg_lower.contains("must be")
        {
            ApiError::BadRequest(msg)
        } else {
            ApiError::Internal(msg)
        }
    }
}

/// Error body: `{"error": <string>}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) => {
                error!(message = %msg, "API error");
            }
            _ => {
                debug!(message = %message, "client error");
            }
        }

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::from_anyhow(err)
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err = ApiError::from_anyhow(anyhow::anyhow!("session abc not found"));
        assert!(matches!(err, ApiError::NotFound(_)));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn validation_maps_to_400() {
        for msg in [
            "user_id is required",
            "invalid user_id 'a b'",
            "invalid request: mig_profile and mig_instance_uuid are mutually exclusive",
        ] {
            let err = ApiError::from_anyhow(anyhow::anyhow!("{msg}"));
            assert!(matches!(err, ApiError::BadRequest(_)), "{msg}");
        }
    }

    #[test]
    fn conflicts_and_exhaustion_map_to_500() {
        for msg in [
            "an active session for user u1 already exists",
            "no free MIG instance with profile 3g.20gb available",
            "no free host SSH ports in range 10000-20000",
            "MIG instance MIG-x is already in use by u2",
        ] {
            let err = ApiError::from_anyhow(anyhow::anyhow!("{msg}"));
            assert!(matches!(err, ApiError::Internal(_)), "{msg}");
        }
    }

    #[test]
    fn context_chain_is_preserved() {
        let err = anyhow::anyhow!("no free MIG instance with profile 1g.5gb available");
        let err = err.context("allocating MIG instance");
        let api_err = ApiError::from_anyhow(err);
        let text = api_err.to_string();
        assert!(text.contains("allocating MIG instance"));
        assert!(text.contains("1g.5gb"));
    }
}
