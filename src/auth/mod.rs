//! OAuth credential handling: on-disk shapes, atomic persistence, and the
//! per-credential refresh manager.

pub mod manager;
pub mod storage;
pub mod token;

pub use self::manager::{CredentialManager, OAUTH_CLIENT_ID, OAUTH_CLIENT_SECRET};
pub use self::storage::save_credential_atomic;
pub use self::token::{load_credential, RawCredential};

/// Errors from credential loading, refresh, and persistence.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("read credentials file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse credentials json {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("token refresh failed: {0}")]
    Refresh(String),

    #[error("token endpoint: {0}")]
    Http(#[from] reqwest::Error),

    #[error("persist credentials: {0}")]
    Storage(#[from] std::io::Error),
}
