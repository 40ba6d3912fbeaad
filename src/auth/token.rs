//! The on-disk credential shape and loading.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::AuthError;
use crate::config::expand_user;

/// An OAuth credential as stored by the Gemini CLI tooling.
///
/// `expiry_date` is epoch milliseconds. The refresh token is the stable
/// identity of the credential: access tokens rotate, the refresh token does
/// not (unless the token endpoint explicitly issues a new one).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawCredential {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(rename = "expiry_date")]
    pub expiry_date_ms: i64,
    #[serde(default)]
    pub scope: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl RawCredential {
    /// Whether the access token expires within `margin_secs` from now.
    pub fn expires_within(&self, margin_secs: i64) -> bool {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.expiry_date_ms <= now_ms + margin_secs * 1000
    }
}

/// Load a credential from a JSON file, expanding a leading `~`.
///
/// Returns the parsed credential together with the expanded path, which
/// becomes the canonical key for this credential everywhere else.
pub fn load_credential(path: &str) -> Result<(RawCredential, PathBuf), AuthError> {
    let expanded = expand_user(path);
    let raw = load_credential_at(&expanded)?;
    Ok((raw, expanded))
}

fn load_credential_at(path: &Path) -> Result<RawCredential, AuthError> {
    let content = std::fs::read_to_string(path).map_err(|source| AuthError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| AuthError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "access_token": "ya29.access",
            "refresh_token": "1//refresh",
            "token_type": "Bearer",
            "expiry_date": 1735689600000,
            "scope": "https://www.googleapis.com/auth/cloud-platform"
        }"#
    }

    #[test]
    fn test_load_credential_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        std::fs::write(&path, sample_json()).unwrap();

        let (raw, expanded) = load_credential(path.to_str().unwrap()).unwrap();
        assert_eq!(raw.access_token, "ya29.access");
        assert_eq!(raw.refresh_token, "1//refresh");
        assert_eq!(raw.expiry_date_ms, 1_735_689_600_000);
        assert_eq!(expanded, path);
    }

    #[test]
    fn test_load_credential_missing_file() {
        let err = load_credential("/nonexistent/creds.json").unwrap_err();
        assert!(matches!(err, AuthError::Read { .. }));
    }

    #[test]
    fn test_load_credential_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = load_credential(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, AuthError::Parse { .. }));
    }

    #[test]
    fn test_token_type_defaults_when_missing() {
        let raw: RawCredential = serde_json::from_str(
            r#"{"access_token": "a", "refresh_token": "r", "expiry_date": 0}"#,
        )
        .unwrap();
        assert_eq!(raw.token_type, "Bearer");
        assert_eq!(raw.scope, "");
    }

    #[test]
    fn test_expires_within() {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let fresh = RawCredential {
            access_token: "a".into(),
            refresh_token: "r".into(),
            token_type: "Bearer".into(),
            expiry_date_ms: now_ms + 3_600_000,
            scope: String::new(),
        };
        assert!(!fresh.expires_within(60));
        assert!(fresh.expires_within(7200));

        let stale = RawCredential {
            expiry_date_ms: now_ms - 1,
            ..fresh
        };
        assert!(stale.expires_within(60));
    }
}
