//! Per-credential token lifecycle.
//!
//! Each credential file gets one [`CredentialManager`]. Callers ask it for a
//! live access token before every upstream request; the manager refreshes
//! against Google's token endpoint when the cached token is near expiry and
//! persists the updated credential back to its file. A mutex serializes
//! concurrent callers so the in-memory credential and the file move together.

use std::path::PathBuf;

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::storage::save_credential_atomic;
use super::token::RawCredential;
use super::AuthError;

/// Public OAuth client of the Gemini CLI; not a secret.
pub const OAUTH_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";

/// Public client secret paired with [`OAUTH_CLIENT_ID`]; not a secret either.
pub const OAUTH_CLIENT_SECRET: &str = "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";

/// Google's OAuth token endpoint.
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Refresh when the access token expires within this window.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Response shape of the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Serialized access to one credential: refresh, in-memory update, persist.
pub struct CredentialManager {
    http: reqwest::Client,
    path: PathBuf,
    persist: bool,
    token_url: String,
    /// The credential identity; fixed at construction, used for cache keys.
    refresh_token: String,
    current: Mutex<RawCredential>,
}

impl CredentialManager {
    pub fn new(
        initial: RawCredential,
        path: PathBuf,
        persist: bool,
        http: reqwest::Client,
    ) -> Self {
        Self {
            http,
            path,
            persist,
            token_url: TOKEN_URL.to_string(),
            refresh_token: initial.refresh_token.clone(),
            current: Mutex::new(initial),
        }
    }

    /// Override the token endpoint (tests point this at a mock server).
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    /// The stable identity of this credential.
    pub fn token_identity(&self) -> &str {
        &self.refresh_token
    }

    /// Return a live access token, refreshing and persisting if needed.
    ///
    /// Persistence failures are logged and swallowed; the live token is
    /// still returned.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let mut current = self.current.lock().await;
        if !current.expires_within(EXPIRY_MARGIN_SECS) {
            return Ok(current.access_token.clone());
        }

        debug!(path = %self.path.display(), "access token near expiry, refreshing");
        let refreshed = self.refresh(&current).await?;

        let changed = refreshed.access_token != current.access_token
            || refreshed.expiry_date_ms != current.expiry_date_ms;
        *current = refreshed;

        if changed && self.persist {
            if let Err(e) = save_credential_atomic(&self.path, &current) {
                warn!(path = %self.path.display(), error = %e, "failed to persist refreshed credential");
            }
        }
        Ok(current.access_token.clone())
    }

    async fn refresh(&self, current: &RawCredential) -> Result<RawCredential, AuthError> {
        let form = [
            ("refresh_token", current.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
            ("client_id", OAUTH_CLIENT_ID),
            ("client_secret", OAUTH_CLIENT_SECRET),
        ];

        let response = self.http.post(&self.token_url).form(&form).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<TokenErrorResponse>(&body) {
                return Err(AuthError::Refresh(
                    err.error_description.unwrap_or(err.error),
                ));
            }
            return Err(AuthError::Refresh(format!("HTTP {}", status.as_u16())));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::Refresh(format!("parse token response: {e}")))?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        Ok(RawCredential {
            access_token: token.access_token,
            // Google rarely rotates refresh tokens; keep ours unless it does.
            refresh_token: token
                .refresh_token
                .unwrap_or_else(|| current.refresh_token.clone()),
            token_type: token
                .token_type
                .unwrap_or_else(|| current.token_type.clone()),
            expiry_date_ms: now_ms + token.expires_in * 1000,
            scope: token.scope.unwrap_or_else(|| current.scope.clone()),
        })
    }
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("path", &self.path)
            .field("persist", &self.persist)
            .finish_non_exhaustive()
    }
}
