//! Multi-credential dispatch: the unit pool, round-robin selection, rotation
//! on failure, and project-id resolution.
//!
//! A *unit* is one (credential, project-id strategy) pair; the pool is the
//! cross-product of configured credentials and their project-id lists. Every
//! request picks a starting unit from a monotonic counter and walks the pool
//! on retryable failures. Streams rotate only until the first event has been
//! forwarded; after that any failure is terminal, so a client never sees
//! completions from two different units spliced together.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::auth::{CredentialManager, RawCredential, OAUTH_CLIENT_ID};
use crate::gemini::{GenerateContentResponse, Request};
use crate::state::{token_key, StateStore};
use crate::upstream::{build_http_client, is_retryable, CodeAssistClient, UpstreamError};

/// Provider label recorded in the state store.
pub const PROVIDER_NAME: &str = "gemini-cli-oauth";

/// Project-id list entry that requests a discovery-mode unit.
pub const AUTO_PROJECT_SENTINEL: &str = "_auto";

/// Retry budget for the idempotent discovery JSON helpers; generation calls
/// never retry inside a unit.
const TRANSPORT_RETRIES: u32 = 2;

/// A credential ready to join the pool.
#[derive(Debug, Clone)]
pub struct CredSource {
    /// Expanded path of the credential file; used for logging and as the
    /// projectIds map key.
    pub path: PathBuf,
    pub raw: RawCredential,
    /// Whether refreshed tokens are written back to `path`; off in tests.
    pub persist: bool,
}

/// What a unit's upstream client can do. [`CodeAssistClient`] is the real
/// implementation; tests substitute stubs.
#[async_trait]
pub trait UnitClient: Send + Sync {
    async fn generate_content(
        &self,
        model: &str,
        project: &str,
        request: &Request,
    ) -> Result<GenerateContentResponse, UpstreamError>;

    fn stream_generate_content(
        &self,
        model: &str,
        project: &str,
        request: &Request,
    ) -> (
        mpsc::Receiver<GenerateContentResponse>,
        mpsc::Receiver<UpstreamError>,
    );

    async fn discover_project_id(&self) -> Result<String, UpstreamError>;
}

#[async_trait]
impl UnitClient for CodeAssistClient {
    async fn generate_content(
        &self,
        model: &str,
        project: &str,
        request: &Request,
    ) -> Result<GenerateContentResponse, UpstreamError> {
        CodeAssistClient::generate_content(self, model, project, request).await
    }

    fn stream_generate_content(
        &self,
        model: &str,
        project: &str,
        request: &Request,
    ) -> (
        mpsc::Receiver<GenerateContentResponse>,
        mpsc::Receiver<UpstreamError>,
    ) {
        CodeAssistClient::stream_generate_content(self, model, project, request)
    }

    async fn discover_project_id(&self) -> Result<String, UpstreamError> {
        CodeAssistClient::discover_project_id(self).await
    }
}

/// One dispatch target. Immutable after construction except for the
/// write-once project-id slot.
struct Unit {
    idx: usize,
    path: PathBuf,
    token_key: String,
    client: Arc<dyn UnitClient>,
    /// Preset, cached, or discovered project id. Written at most once.
    project_id: OnceLock<String>,
}

impl Unit {
    fn new(idx: usize, path: PathBuf, token_key: String, client: Arc<dyn UnitClient>) -> Self {
        Self {
            idx,
            path,
            token_key,
            client,
            project_id: OnceLock::new(),
        }
    }

    fn with_project(self, project_id: &str) -> Self {
        let _ = self.project_id.set(project_id.to_string());
        self
    }

    /// Credential path for logs, with the home directory shortened to `~`.
    fn display_name(&self) -> String {
        if self.path.as_os_str().is_empty() {
            return format!("idx-{}", self.idx);
        }
        if let Some(home) = std::env::var_os("HOME") {
            if let Ok(rest) = self.path.strip_prefix(Path::new(&home)) {
                return format!("~/{}", rest.display());
            }
        }
        self.path.display().to_string()
    }
}

/// Construction-time knobs for the pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Cross-unit retry budget; total attempts per request = 1 + retries.
    pub request_max_retries: u32,
    /// Base delay for the discovery transport retry helper.
    pub base_delay: Duration,
    pub proxy: Option<reqwest::Url>,
    pub user_agent: String,
    /// Project-id lists keyed by expanded credential path.
    pub project_ids: HashMap<PathBuf, Vec<String>>,
}

struct Inner {
    units: Vec<Unit>,
    rr: AtomicU64,
    store: StateStore,
    provider: String,
    client_id: String,
    retries: u32,
}

/// Fans requests out across the unit pool. Cheap to clone.
#[derive(Clone)]
pub struct MultiClient {
    inner: Arc<Inner>,
}

impl MultiClient {
    /// Build the pool from credential sources. Performs no network calls.
    pub fn new(
        sources: Vec<CredSource>,
        options: PoolOptions,
        store: StateStore,
    ) -> anyhow::Result<Self> {
        let mut units: Vec<Unit> = Vec::new();
        let credential_count = sources.len();

        for source in sources {
            let http = build_http_client(options.proxy.as_ref(), &options.user_agent)?;
            let manager = Arc::new(CredentialManager::new(
                source.raw.clone(),
                source.path.clone(),
                source.persist,
                http.clone(),
            ));
            let client: Arc<dyn UnitClient> = Arc::new(CodeAssistClient::new(
                http,
                manager,
                TRANSPORT_RETRIES,
                options.base_delay,
            ));
            let key = token_key(PROVIDER_NAME, OAUTH_CLIENT_ID, &source.raw.refresh_token);

            push_units_for_source(
                &mut units,
                &source.path,
                &key,
                &client,
                options.project_ids.get(&source.path),
            );
        }

        if units.is_empty() {
            anyhow::bail!("no valid credentials provided");
        }

        let rr = AtomicU64::new(0);
        if let Some(value) = store.get_rr_counter(PROVIDER_NAME, OAUTH_CLIENT_ID) {
            rr.store(value, Ordering::SeqCst);
        }

        info!(
            credentials = credential_count,
            units = units.len(),
            "dispatch pool initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                units,
                rr,
                store,
                provider: PROVIDER_NAME.to_string(),
                client_id: OAUTH_CLIENT_ID.to_string(),
                retries: options.request_max_retries,
            }),
        })
    }

    /// Atomically claim the next starting index and persist the counter in
    /// the background.
    fn pick_start(&self) -> usize {
        let n = self.inner.units.len();
        if n == 0 {
            return 0;
        }
        let v = self.inner.rr.fetch_add(1, Ordering::SeqCst);

        let store = self.inner.store.clone();
        let provider = self.inner.provider.clone();
        let client_id = self.inner.client_id.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.set_rr_counter(&provider, &client_id, v + 1) {
                warn!(error = %e, "failed to persist round-robin counter");
            }
        });

        (v % n as u64) as usize
    }

    /// Resolve the project id for a unit: preset slot, then the state store,
    /// then discovery. Never mutates the unit beyond its write-once slot.
    async fn resolve_project_id(&self, unit: &Unit) -> Result<String, UpstreamError> {
        if let Some(project) = unit.project_id.get() {
            if !project.is_empty() {
                return Ok(project.clone());
            }
        }

        if let Some(project) = self.inner.store.get_project_id(&unit.token_key) {
            let _ = unit.project_id.set(project.clone());
            return Ok(project);
        }

        info!(cred = %unit.display_name(), "project id not cached, starting discovery");
        let project = unit.client.discover_project_id().await?;
        if project.is_empty() {
            return Err(UpstreamError::EmptyProject);
        }
        let _ = unit.project_id.set(project.clone());
        if let Err(e) = self.inner.store.upsert_project_id(
            &unit.token_key,
            &self.inner.provider,
            &self.inner.client_id,
            &project,
        ) {
            warn!(error = %e, "failed to persist discovered project id");
        }
        Ok(project)
    }

    /// Unary dispatch with rotation. An empty `project` means per-unit
    /// resolution; a non-empty one is used verbatim for every attempt.
    pub async fn generate_content(
        &self,
        model: &str,
        project: &str,
        request: &Request,
    ) -> Result<GenerateContentResponse, UpstreamError> {
        let n = self.inner.units.len();
        if n == 0 {
            return Err(UpstreamError::Other("no credentials configured".into()));
        }
        let start = self.pick_start();
        let total = self.inner.retries as usize + 1;
        let mut last_err: Option<UpstreamError> = None;

        for attempt in 0..total {
            let unit = &self.inner.units[(start + attempt) % n];

            let resolved = if project.is_empty() {
                match self.resolve_project_id(unit).await {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(
                            attempt = attempt + 1,
                            idx = unit.idx,
                            cred = %unit.display_name(),
                            error = %err,
                            "discovery failed, rotating"
                        );
                        last_err = Some(err);
                        continue;
                    }
                }
            } else {
                project.to_string()
            };

            info!(
                attempt = attempt + 1,
                idx = unit.idx,
                cred = %unit.display_name(),
                model,
                project = %resolved,
                "dispatching"
            );

            match unit.client.generate_content(model, &resolved, request).await {
                Ok(response) => {
                    info!(idx = unit.idx, cred = %unit.display_name(), "dispatch ok");
                    return Ok(response);
                }
                Err(err) => {
                    if attempt == total - 1 || !is_retryable(&err) {
                        warn!(
                            idx = unit.idx,
                            cred = %unit.display_name(),
                            error = %err,
                            "non-retryable or budget exhausted"
                        );
                        return Err(err);
                    }
                    warn!(
                        idx = unit.idx,
                        cred = %unit.display_name(),
                        error = %err,
                        "rotating on error"
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| UpstreamError::Other("no credentials configured".into())))
    }

    /// Streaming dispatch with pre-first-event rotation.
    ///
    /// The error channel has capacity one and the error is queued before the
    /// event sender drops, so a consumer always observes the error before it
    /// sees the event channel close.
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

        let mc = self.clone();
        let model = model.to_string();
        let project = project.to_string();
        let request = request.clone();

        tokio::spawn(async move {
            mc.run_stream(&model, &project, &request, out_tx, err_tx)
                .await;
        });

        (out_rx, err_rx)
    }

    async fn run_stream(
        &self,
        model: &str,
        project: &str,
        request: &Request,
        out: mpsc::Sender<GenerateContentResponse>,
        errs: mpsc::Sender<UpstreamError>,
    ) {
        let n = self.inner.units.len();
        if n == 0 {
            let _ = errs
                .send(UpstreamError::Other("no credentials configured".into()))
                .await;
            return;
        }
        let start = self.pick_start();
        let total = self.inner.retries as usize + 1;
        let mut last_err: Option<UpstreamError> = None;

        'attempts: for attempt in 0..total {
            let unit = &self.inner.units[(start + attempt) % n];

            let resolved = if project.is_empty() {
                match self.resolve_project_id(unit).await {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(
                            attempt = attempt + 1,
                            idx = unit.idx,
                            cred = %unit.display_name(),
                            error = %err,
                            "discovery failed for stream, rotating"
                        );
                        last_err = Some(err);
                        continue;
                    }
                }
            } else {
                project.to_string()
            };

            info!(
                attempt = attempt + 1,
                idx = unit.idx,
                cred = %unit.display_name(),
                model,
                project = %resolved,
                "streaming dispatch"
            );

            let (mut up_out, mut up_errs) =
                unit.client.stream_generate_content(model, &resolved, request);
            let mut sent_any = false;
            let mut errs_open = true;

            loop {
                tokio::select! {
                    event = up_out.recv() => match event {
                        Some(event) => {
                            sent_any = true;
                            if out.send(event).await.is_err() {
                                // Consumer went away; nothing left to do.
                                return;
                            }
                        }
                        None => {
                            // Upstream events closed; a failure may still be
                            // queued on the inner error channel.
                            if errs_open {
                                if let Some(err) = up_errs.recv().await {
                                    if !sent_any && attempt < total - 1 && is_retryable(&err) {
                                        warn!(
                                            idx = unit.idx,
                                            cred = %unit.display_name(),
                                            error = %err,
                                            "rotating stream on early error"
                                        );
                                        last_err = Some(err);
                                        continue 'attempts;
                                    }
                                    let _ = errs.send(err).await;
                                    return;
                                }
                            }
                            // Clean completion.
                            return;
                        }
                    },
                    err = up_errs.recv(), if errs_open => match err {
                        Some(err) => {
                            if !sent_any && attempt < total - 1 && is_retryable(&err) {
                                warn!(
                                    idx = unit.idx,
                                    cred = %unit.display_name(),
                                    error = %err,
                                    "rotating stream on early error"
                                );
                                last_err = Some(err);
                                continue 'attempts;
                            }
                            let _ = errs.send(err).await;
                            return;
                        }
                        None => {
                            // Inner error channel closed without an error;
                            // keep draining events until they close too.
                            errs_open = false;
                        }
                    },
                    () = out.closed() => {
                        // Consumer dropped its receivers mid-stream.
                        return;
                    }
                }
            }
        }

        // Budget exhausted with only pre-first-event failures.
        if let Some(err) = last_err {
            let _ = errs.send(err).await;
        }
    }
}

/// Apply the pool-construction rules for one credential.
fn push_units_for_source(
    units: &mut Vec<Unit>,
    path: &Path,
    key: &str,
    client: &Arc<dyn UnitClient>,
    configured: Option<&Vec<String>>,
) {
    match configured {
        None => {
            let idx = units.len();
            units.push(Unit::new(idx, path.to_path_buf(), key.to_string(), client.clone()));
        }
        Some(list) if list.is_empty() => {
            warn!(
                cred = %path.display(),
                "empty projectIds list, falling back to discovery"
            );
            let idx = units.len();
            units.push(Unit::new(idx, path.to_path_buf(), key.to_string(), client.clone()));
        }
        Some(list) => {
            // One unit per explicit project id; a single discovery unit when
            // the sentinel is present, regardless of how often it appears.
            let mut include_auto = false;
            for project in list {
                if project == AUTO_PROJECT_SENTINEL {
                    include_auto = true;
                    continue;
                }
                let idx = units.len();
                units.push(
                    Unit::new(idx, path.to_path_buf(), key.to_string(), client.clone())
                        .with_project(project),
                );
            }
            if include_auto {
                let idx = units.len();
                units.push(Unit::new(idx, path.to_path_buf(), key.to_string(), client.clone()));
            }
        }
    }
}
