//! The per-credential Code Assist client.
//!
//! One instance per credential, shared by every unit built from that
//! credential, so connection pooling and token refresh are not duplicated.
//! Generation calls carry no internal retries: rotation across units is the
//! dispatcher's job. Discovery helpers are idempotent JSON calls and run
//! under a small transport retry budget.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::http::with_retries;
use super::sse::{parse_data_line, LineScanner, MAX_LINE_BYTES};
use super::UpstreamError;
use crate::auth::CredentialManager;
use crate::gemini::{GenerateContentResponse, Request};

/// Production Code Assist endpoint.
pub const BASE_URL: &str = "https://cloudcode-pa.googleapis.com";

/// Internal API version segment.
const API_VERSION: &str = "v1internal";

/// How long the whole discovery protocol may run.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(120);

/// Pause between onboarding polls.
const ONBOARD_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Cap on error bodies echoed into error messages.
const ERROR_BODY_LIMIT: usize = 1024 * 1024;

/// Outbound wrapper around a generation request.
#[derive(Debug, Serialize)]
struct AssistRequest<'a> {
    model: &'a str,
    project: &'a str,
    request: &'a Request,
}

/// Inbound wrapper around a generation response.
#[derive(Debug, Deserialize)]
struct AssistEnvelope {
    #[serde(default)]
    response: Option<GenerateContentResponse>,
}

/// HTTP client for one credential against the Code Assist backend.
#[derive(Clone)]
pub struct CodeAssistClient {
    http: reqwest::Client,
    credentials: Arc<CredentialManager>,
    base_url: String,
    transport_retries: u32,
    base_delay: Duration,
}

impl CodeAssistClient {
    pub fn new(
        http: reqwest::Client,
        credentials: Arc<CredentialManager>,
        transport_retries: u32,
        base_delay: Duration,
    ) -> Self {
        Self {
            http,
            credentials,
            base_url: BASE_URL.to_string(),
            transport_retries,
            base_delay,
        }
    }

    /// Point the client at a different base URL (tests use a mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}:{}", self.base_url, API_VERSION, method)
    }

    /// Unary generation. Decodes the `{response: …}` envelope on 2xx;
    /// non-2xx becomes a status error carrying a capped copy of the body.
    pub async fn generate_content(
        &self,
        model: &str,
        project: &str,
        request: &Request,
    ) -> Result<GenerateContentResponse, UpstreamError> {
        let url = self.method_url("generateContent");
        debug!(%url, model, "upstream request");
        let token = self.credentials.access_token().await?;

        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&AssistRequest {
                model,
                project,
                request,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status.as_u16(), response).await);
        }

        let envelope: AssistEnvelope = response.json().await?;
        envelope.response.ok_or(UpstreamError::EmptyEnvelope)
    }

    /// Streaming generation.
    ///
    /// Returns the event and error receivers immediately; a spawned task
    /// performs the request and pumps the SSE body. At most one error is
    /// delivered, and it is queued before the event channel closes.
    pub fn stream_generate_content(
        &self,
        model: &str,
        project: &str,
        request: &Request,
    ) -> (
        mpsc::Receiver<GenerateContentResponse>,
        mpsc::Receiver<UpstreamError>,
    ) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (err_tx, err_rx) = mpsc::channel(1);

        let client = self.clone();
        let model = model.to_string();
        let project = project.to_string();
        let request = request.clone();

        tokio::spawn(async move {
            if let Err(err) = client.run_stream(&model, &project, &request, &out_tx).await {
                let _ = err_tx.send(err).await;
            }
            // Both senders drop here; the error (if any) is already queued,
            // so receivers observe it before the event channel closes.
        });

        (out_rx, err_rx)
    }

    async fn run_stream(
        &self,
        model: &str,
        project: &str,
        request: &Request,
        out: &mpsc::Sender<GenerateContentResponse>,
    ) -> Result<(), UpstreamError> {
        let url = format!("{}?alt=sse", self.method_url("streamGenerateContent"));
        debug!(%url, model, "upstream streaming request");
        let token = self.credentials.access_token().await?;

        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&AssistRequest {
                model,
                project,
                request,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let err = status_error(status.as_u16(), response).await;
            warn!(error = %err, "upstream stream rejected");
            return Err(err);
        }

        let mut scanner = LineScanner::new(MAX_LINE_BYTES);
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for line in scanner.push(&chunk)? {
                if let Some(event) = parse_data_line(&line) {
                    if out.send(event).await.is_err() {
                        // Receiver gone; the caller cancelled.
                        return Ok(());
                    }
                }
            }
        }
        if let Some(line) = scanner.finish() {
            if let Some(event) = parse_data_line(&line) {
                let _ = out.send(event).await;
            }
        }
        Ok(())
    }

    /// Derive the project id to use with this credential.
    ///
    /// `loadCodeAssist` first; if it names no project, onboard against the
    /// default tier and poll until done. The whole protocol is bounded by a
    /// two-minute wall clock.
    pub async fn discover_project_id(&self) -> Result<String, UpstreamError> {
        match tokio::time::timeout(DISCOVERY_TIMEOUT, self.discover_inner()).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::DiscoveryTimeout),
        }
    }

    async fn discover_inner(&self) -> Result<String, UpstreamError> {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct AllowedTier {
            #[serde(default)]
            id: String,
            #[serde(default)]
            is_default: bool,
        }

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct LoadResponse {
            /// Either a project-id string or an object with an `id` field.
            #[serde(default)]
            cloudaicompanion_project: Option<Value>,
            #[serde(default)]
            allowed_tiers: Vec<AllowedTier>,
        }

        let load: LoadResponse = self
            .post_json(
                "loadCodeAssist",
                json!({"metadata": {"pluginType": "GEMINI"}}),
            )
            .await?;

        if let Some(value) = load.cloudaicompanion_project {
            match value {
                Value::String(id) if !id.is_empty() => return Ok(id),
                Value::Object(map) => {
                    if let Some(Value::String(id)) = map.get("id") {
                        if !id.is_empty() {
                            return Ok(id.clone());
                        }
                    }
                }
                _ => {}
            }
        }

        let tier_id = load
            .allowed_tiers
            .iter()
            .find(|t| t.is_default && !t.id.is_empty())
            .map(|t| t.id.clone())
            .unwrap_or_else(|| "free-tier".to_string());
        debug!(%tier_id, "no project from loadCodeAssist, onboarding");

        #[derive(Debug, Default, Deserialize)]
        struct OnboardProject {
            #[serde(default)]
            id: String,
        }

        #[derive(Debug, Default, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct OnboardPayload {
            #[serde(default)]
            cloudaicompanion_project: OnboardProject,
        }

        #[derive(Debug, Deserialize)]
        struct OnboardResponse {
            #[serde(default)]
            done: bool,
            #[serde(default)]
            response: Option<OnboardPayload>,
        }

        let body = json!({
            "tierId": tier_id,
            "metadata": {"pluginType": "GEMINI"},
            "cloudaicompanionProject": "default",
        });

        loop {
            let onboard: OnboardResponse = self.post_json("onboardUser", body.clone()).await?;
            if onboard.done {
                let id = onboard
                    .response
                    .unwrap_or_default()
                    .cloudaicompanion_project
                    .id;
                if id.is_empty() {
                    return Err(UpstreamError::OnboardIncomplete);
                }
                return Ok(id);
            }
            tokio::time::sleep(ONBOARD_POLL_INTERVAL).await;
        }
    }

    /// POST a JSON helper call (`:loadCodeAssist`, `:onboardUser`) under the
    /// transport retry budget.
    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: Value,
    ) -> Result<T, UpstreamError> {
        let url = self.method_url(method);
        let client = self.clone();

        with_retries(self.transport_retries, self.base_delay, move || {
            let client = client.clone();
            let url = url.clone();
            let body = body.clone();
            async move {
                let token = client.credentials.access_token().await?;
                let response = client
                    .http
                    .post(&url)
                    .bearer_auth(&token)
                    .json(&body)
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    return Err(status_error(status.as_u16(), response).await);
                }
                Ok(response.json::<T>().await?)
            }
        })
        .await
    }
}

impl std::fmt::Debug for CodeAssistClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeAssistClient")
            .field("base_url", &self.base_url)
            .field("transport_retries", &self.transport_retries)
            .finish_non_exhaustive()
    }
}

/// Build a status error from a non-2xx response, capping the echoed body.
async fn status_error(status: u16, response: reqwest::Response) -> UpstreamError {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut end = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    UpstreamError::Status {
        status,
        body: body.trim().to_string(),
    }
}
