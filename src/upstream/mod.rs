//! Per-credential Code Assist upstream client: unary and streaming
//! generation, project discovery, and the SSE decoding it rides on.

pub mod client;
pub mod http;
pub mod sse;

pub use self::client::{CodeAssistClient, BASE_URL};
pub use self::http::build_http_client;

use crate::auth::AuthError;

/// Errors from upstream calls.
///
/// The Display of [`UpstreamError::Status`] deliberately embeds
/// `upstream status N` so log lines and client-facing messages carry the
/// upstream code; the dispatcher classifies structurally, not by string.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),

    #[error("credentials: {0}")]
    Auth(#[from] AuthError),

    #[error("invalid upstream payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty response envelope")]
    EmptyEnvelope,

    #[error("sse line exceeds {limit} bytes")]
    OversizedLine { limit: usize },

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("project discovery timed out")]
    DiscoveryTimeout,

    #[error("onboarding finished without a project id")]
    OnboardIncomplete,

    #[error("discovered project id is empty")]
    EmptyProject,

    #[error("request cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl UpstreamError {
    /// The upstream HTTP status, when this error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Substrings that mark a transport hiccup worth another unit.
fn is_transport_hiccup(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("timeout")
        || lower.contains("connection reset")
        || lower.contains("temporary failure")
        || lower.contains("unexpected eof")
        || lower.contains("eof")
}

/// Whether a failed attempt should rotate to the next unit.
///
/// 401/403/429, every 5xx, deadlines, and transport hiccups rotate.
/// Explicit cancellation and the remaining 4xx are terminal.
pub fn is_retryable(err: &UpstreamError) -> bool {
    match err {
        UpstreamError::Status { status, .. } => {
            matches!(*status, 401 | 403 | 429) || (500..600).contains(status)
        }
        UpstreamError::Http(e) => {
            e.is_timeout() || e.is_connect() || is_transport_hiccup(&e.to_string())
        }
        UpstreamError::UnexpectedEof | UpstreamError::DiscoveryTimeout => true,
        UpstreamError::Cancelled => false,
        other => is_transport_hiccup(&other.to_string()),
    }
}

/// Whether a discovery/onboarding JSON call should be retried in place.
/// Narrower than [`is_retryable`]: these retries hit the same endpoint.
pub fn is_transient_for_discovery(err: &UpstreamError) -> bool {
    match err {
        UpstreamError::Status { status, .. } => {
            matches!(*status, 401 | 429) || (500..600).contains(status)
        }
        UpstreamError::Http(e) => e.is_timeout() || e.is_connect(),
        _ => false,
    }
}
