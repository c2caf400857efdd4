//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::fetcher::FetchError;

/// Error surface of the control plane, rendered as `{"detail": …}` JSON.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound(String),
    Internal(String),
}

impl From<FetchError> for ApiError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Invalid(message) => ApiError::Validation(message),
            FetchError::NotFound(what) => ApiError::NotFound(format!("{} not found.", what)),
            FetchError::Internal(inner) => ApiError::Internal(format!("{:#}", inner)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::Validation(message) => (StatusCode::UNPROCESSABLE_ENTITY, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(message) => {
                error!("Internal error: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error.".to_string(),
                )
            }
        };
        (status, Json(json!({"detail": detail}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_fetch_errors_to_statuses() {
        let validation: ApiError = FetchError::Invalid("bad dates".to_string()).into();
        assert!(matches!(validation, ApiError::Validation(_)));

        let missing: ApiError = FetchError::NotFound("Job 'x'".to_string()).into();
        assert!(matches!(missing, ApiError::NotFound(_)));

        let internal: ApiError = FetchError::Internal(anyhow::anyhow!("boom")).into();
        assert!(matches!(internal, ApiError::Internal(_)));
    }
}
