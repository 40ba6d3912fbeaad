//! Client-facing error type and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::upstream::UpstreamError;

/// Errors surfaced to API clients.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("unknown model")]
    UnknownModel,

    #[error("not found")]
    NotFound,

    #[error("too many concurrent requests")]
    TooManyRequests,

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// JSON error body, shaped like the Gemini API's own errors.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::UnknownModel => StatusCode::BAD_REQUEST,
            Self::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(err) => upstream_status(err),
        }
    }
}

/// Map an upstream failure onto the status returned to the client.
///
/// Auth and quota statuses pass through; 5xx reads as a bad gateway;
/// anything without a status is treated as a request-level problem.
fn upstream_status(err: &UpstreamError) -> StatusCode {
    match err.status() {
        Some(401) => StatusCode::UNAUTHORIZED,
        Some(403) => StatusCode::FORBIDDEN,
        Some(429) => StatusCode::TOO_MANY_REQUESTS,
        Some(code) if (500..600).contains(&code) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}
