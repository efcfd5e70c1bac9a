// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
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

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

impl From<pushhub_core::Error> for AppError {
    fn from(err: pushhub_core::Error) -> Self {
        use pushhub_core::Error;

        match err {
            Error::Authentication(msg) => Self::unauthorized(msg),
            Error::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                Self::internal("Data processing error")
            }
            Error::Configuration(msg) | Error::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                Self::internal("Internal server error")
            }
        }
    }
}

impl From<pushhub_cluster::Error> for AppError {
    fn from(err: pushhub_cluster::Error) -> Self {
        use pushhub_cluster::Error;

        match err {
            Error::ShuttingDown => Self::service_unavailable("Server is shutting down"),
            Error::LimitExceeded(msg) => Self::too_many_requests(msg),
            other => {
                tracing::error!("Cluster error: {}", other);
                Self::internal("Service temporarily unavailable")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_mapping() {
        let err: AppError = pushhub_core::Error::Authentication("unknown token".into()).into();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.message, "unknown token");

        let err: AppError = pushhub_core::Error::Internal("boom".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Internal server error");
    }

    #[test]
    fn test_cluster_error_mapping() {
        let err: AppError = pushhub_cluster::Error::ShuttingDown.into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);

        let err: AppError = pushhub_cluster::Error::LimitExceeded("max 5".into()).into();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);

        let err: AppError = pushhub_cluster::Error::Redis("refused".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
