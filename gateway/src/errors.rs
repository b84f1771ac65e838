use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::models::IdentityError;
use crate::service::ServiceError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("invalid request body: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<IdentityError> for AppError {
    fn from(e: IdentityError) -> Self {
        AppError::Service(ServiceError::InvalidIdentity(e))
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl AppError {
    /// Machine-readable code sent in the error body (also used as a metrics label).
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Service(e) => match e {
                ServiceError::InvalidIdentity(_) => "invalid_identity",
                ServiceError::InvalidTtl(_) => "invalid_ttl",
                ServiceError::IdentityConflict(_) => "identity_conflict",
                ServiceError::NotFound(_) => "token_not_found",
                ServiceError::Inactive(_) => "token_inactive",
                ServiceError::Unavailable(_) => "service_unavailable",
            },
            AppError::BadRequest(_) => "invalid_request",
            AppError::Internal(_) => "internal_server_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, error_type, msg) = match &self {
            AppError::Service(ServiceError::InvalidIdentity(e)) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                format!("invalid identity: {}", e),
            ),
            AppError::Service(ServiceError::InvalidTtl(reason)) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                format!("invalid ttl: {}", reason),
            ),
            AppError::Service(ServiceError::IdentityConflict(identity)) => (
                StatusCode::CONFLICT,
                "conflict_error",
                format!("a live token already exists for '{}'", identity),
            ),
            AppError::Service(ServiceError::NotFound(identity)) => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                format!("no token for '{}'", identity),
            ),
            AppError::Service(ServiceError::Inactive(identity)) => (
                StatusCode::CONFLICT,
                "conflict_error",
                format!("token for '{}' is revoked or expired", identity),
            ),
            AppError::Service(ServiceError::Unavailable(e)) => {
                // detail (paths, io errors) stays in the log
                tracing::error!(transient = e.is_transient(), "token store error: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "unavailable_error",
                    "token store unavailable, retry later".to_string(),
                )
            }
            AppError::BadRequest(reason) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                reason.clone(),
            ),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        if status == StatusCode::SERVICE_UNAVAILABLE {
            response.headers_mut().insert(
                "retry-after",
                axum::http::HeaderValue::from_static("5"),
            );
        }

        response
    }
}
