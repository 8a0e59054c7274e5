//! HTTP error responses
//!
//! Every non-2xx response from the gateway carries the same JSON body:
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.
//! Publish failures are not errors here; they are reports with a status code
//! chosen by the handler.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "invalid_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Internal(_) => "internal_error",
        }
    }

    /// Attach a request id and turn into a response.
    pub fn with_request_id(self, request_id: &str) -> Response {
        error_response(self.status(), self.error_type(), &self.to_string(), request_id)
    }
}

impl From<credential_pool::Error> for ApiError {
    fn from(err: credential_pool::Error) -> Self {
        match err {
            credential_pool::Error::NotFound(_) => ApiError::NotFound(err.to_string()),
            credential_pool::Error::InvalidInput(_) => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<publisher::Error> for ApiError {
    fn from(err: publisher::Error) -> Self {
        match err {
            publisher::Error::InvalidContent(_) => ApiError::BadRequest(err.to_string()),
        }
    }
}

/// JSON error body in the gateway's error envelope.
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
