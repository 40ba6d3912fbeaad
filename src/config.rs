//! JSON configuration loading and validation.
//!
//! The config file is strict: unknown keys are rejected at load time.
//! Fields left out (or set to their zero value) pick up the documented
//! defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Placeholder shipped in the example config; refusing it forces operators to
/// pick a real key.
const AUTH_KEY_PLACEHOLDER: &str = "UNSAFE-KEY-REPLACE";

/// Gateway configuration, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub auth_key: String,
    /// Optional upstream proxy URL; `http://` or `socks5://`.
    #[serde(default)]
    pub proxy: String,
    #[serde(default)]
    pub gemini_oauth_creds_files: Vec<String>,
    /// Per-credential project-id lists, keyed by credential path. The value
    /// `"_auto"` adds a discovery-mode unit alongside any explicit ids.
    #[serde(default)]
    pub project_ids: HashMap<String, Vec<String>>,
    #[serde(default = "default_request_max_retries")]
    pub request_max_retries: u32,
    #[serde(default = "default_request_base_delay", rename = "requestBaseDelay")]
    pub request_base_delay_ms: u64,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    /// Cap on incoming request bodies, to bound memory per request.
    #[serde(default = "default_request_max_body_bytes")]
    pub request_max_body_bytes: u64,
    /// Cap on concurrent in-flight requests; excess requests get 429.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
const fn default_port() -> u16 {
    8085
}
const fn default_request_max_retries() -> u32 {
    3
}
const fn default_request_base_delay() -> u64 {
    1000
}
fn default_sqlite_path() -> String {
    "./data/state.db".to_string()
}
const fn default_request_max_body_bytes() -> u64 {
    16 * 1024 * 1024
}
const fn default_max_concurrent_requests() -> usize {
    64
}
fn default_user_agent() -> String {
    "google-api-nodejs-client/9.15.1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_key: String::new(),
            proxy: String::new(),
            gemini_oauth_creds_files: Vec::new(),
            project_ids: HashMap::new(),
            request_max_retries: default_request_max_retries(),
            request_base_delay_ms: default_request_base_delay(),
            sqlite_path: default_sqlite_path(),
            request_max_body_bytes: default_request_max_body_bytes(),
            max_concurrent_requests: default_max_concurrent_requests(),
            user_agent: default_user_agent(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, rejecting unknown keys.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        tracing::info!(path = %path.display(), "loading config");
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&content).map_err(|e| parse_error(&e.to_string()))?;
        config.apply_zero_defaults();
        Ok(config)
    }

    /// Parse from a JSON string (used by tests).
    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let mut config: Config =
            serde_json::from_str(content).map_err(|e| parse_error(&e.to_string()))?;
        config.apply_zero_defaults();
        Ok(config)
    }

    /// Zero values behave like omitted keys so `"port": 0` does not bind an
    /// ephemeral port by accident.
    fn apply_zero_defaults(&mut self) {
        if self.host.is_empty() {
            self.host = default_host();
        }
        if self.port == 0 {
            self.port = default_port();
        }
        if self.request_base_delay_ms == 0 {
            self.request_base_delay_ms = default_request_base_delay();
        }
        if self.sqlite_path.is_empty() {
            self.sqlite_path = default_sqlite_path();
        }
        if self.request_max_body_bytes == 0 {
            self.request_max_body_bytes = default_request_max_body_bytes();
        }
        if self.max_concurrent_requests == 0 {
            self.max_concurrent_requests = default_max_concurrent_requests();
        }
        if self.user_agent.is_empty() {
            self.user_agent = default_user_agent();
        }
    }

    /// Validate settings that cannot be checked structurally.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth_key.is_empty() {
            anyhow::bail!("authKey must be set");
        }
        if self.auth_key == AUTH_KEY_PLACEHOLDER {
            anyhow::bail!("authKey must be changed from the default placeholder");
        }
        if !self.proxy.is_empty() {
            let url = reqwest::Url::parse(&self.proxy)
                .map_err(|e| anyhow::anyhow!("invalid proxy URL: {e}"))?;
            match url.scheme() {
                "http" | "socks5" => {}
                other => anyhow::bail!("proxy scheme must be http or socks5, got {other}"),
            }
            if url.host_str().is_none() {
                anyhow::bail!("proxy URL must include host:port");
            }
        }
        // Every projectIds key must name a configured credential file; both
        // sides are compared after ~ expansion.
        let creds: Vec<PathBuf> = self
            .gemini_oauth_creds_files
            .iter()
            .map(|p| expand_user(p))
            .collect();
        for key in self.project_ids.keys() {
            let expanded = expand_user(key);
            if !creds.contains(&expanded) {
                anyhow::bail!(
                    "projectIds key {key} does not match any geminiOauthCredsFiles entry"
                );
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parse the proxy setting into a URL, if configured.
    pub fn proxy_url(&self) -> anyhow::Result<Option<reqwest::Url>> {
        if self.proxy.is_empty() {
            return Ok(None);
        }
        let url = reqwest::Url::parse(&self.proxy)
            .map_err(|e| anyhow::anyhow!("invalid proxy URL: {e}"))?;
        Ok(Some(url))
    }

    /// The projectIds map re-keyed by expanded credential path.
    pub fn expanded_project_ids(&self) -> HashMap<PathBuf, Vec<String>> {
        self.project_ids
            .iter()
            .map(|(k, v)| (expand_user(k), v.clone()))
            .collect()
    }
}

/// Surface just the offending key for unknown-field errors; serde's full
/// message enumerates every known field, which drowns the signal.
fn parse_error(message: &str) -> anyhow::Error {
    if let Some(rest) = message.split("unknown field `").nth(1) {
        if let Some(field) = rest.split('`').next() {
            return anyhow::anyhow!("unknown config key: {field}");
        }
    }
    anyhow::anyhow!("parse config: {message}")
}

/// Expand a leading `~` or `~/` to the user's home directory.
pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home);
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied_to_empty_config() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8085);
        assert_eq!(config.request_max_retries, 3);
        assert_eq!(config.request_base_delay_ms, 1000);
        assert_eq!(config.sqlite_path, "./data/state.db");
        assert_eq!(config.request_max_body_bytes, 16 * 1024 * 1024);
        assert_eq!(config.max_concurrent_requests, 64);
        assert_eq!(config.user_agent, "google-api-nodejs-client/9.15.1");
    }

    #[test]
    fn test_unknown_key_rejected_with_key_name() {
        let err = Config::from_json(r#"{"prot": 8085}"#).unwrap_err();
        assert_eq!(err.to_string(), "unknown config key: prot");
    }

    #[test]
    fn test_zero_values_fall_back_to_defaults() {
        let config =
            Config::from_json(r#"{"port": 0, "requestBaseDelay": 0, "maxConcurrentRequests": 0}"#)
                .unwrap();
        assert_eq!(config.port, 8085);
        assert_eq!(config.request_base_delay_ms, 1000);
        assert_eq!(config.max_concurrent_requests, 64);
    }

    #[test]
    fn test_validate_requires_auth_key() {
        let config = Config::from_json("{}").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_placeholder_auth_key() {
        let config = Config::from_json(r#"{"authKey": "UNSAFE-KEY-REPLACE"}"#).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("placeholder"));
    }

    #[test]
    fn test_validate_proxy_schemes() {
        let ok = Config::from_json(
            r#"{"authKey": "k", "proxy": "socks5://127.0.0.1:1080"}"#,
        )
        .unwrap();
        ok.validate().unwrap();

        let bad = Config::from_json(r#"{"authKey": "k", "proxy": "ftp://127.0.0.1:21"}"#).unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_validate_project_ids_must_match_creds() {
        let config = Config::from_json(
            r#"{
                "authKey": "k",
                "geminiOauthCredsFiles": ["/tmp/a.json"],
                "projectIds": {"/tmp/b.json": ["p1"]}
            }"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("/tmp/b.json"));

        let config = Config::from_json(
            r#"{
                "authKey": "k",
                "geminiOauthCredsFiles": ["/tmp/a.json"],
                "projectIds": {"/tmp/a.json": ["p1", "_auto"]}
            }"#,
        )
        .unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_expand_user_home_prefix() {
        if let Some(home) = std::env::var_os("HOME") {
            let expanded = expand_user("~/creds.json");
            assert_eq!(expanded, PathBuf::from(&home).join("creds.json"));
            assert_eq!(expand_user("~"), PathBuf::from(home));
        }
        assert_eq!(expand_user("/abs/path.json"), PathBuf::from("/abs/path.json"));
    }

    #[test]
    fn test_listen_addr() {
        let config = Config::from_json(r#"{"host": "0.0.0.0", "port": 9000}"#).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:9000");
    }

    #[test]
    fn test_proxy_url_parse() {
        let config = Config::from_json(r#"{"proxy": "http://127.0.0.1:8080"}"#).unwrap();
        let url = config.proxy_url().unwrap().unwrap();
        assert_eq!(url.scheme(), "http");

        let config = Config::from_json("{}").unwrap();
        assert!(config.proxy_url().unwrap().is_none());
    }
}
