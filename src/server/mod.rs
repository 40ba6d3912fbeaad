//! The client-facing HTTP boundary.
//!
//! Routes, auth, the concurrency gate, and the adapters that turn dispatcher
//! results into unary JSON or SSE responses. Everything interesting happens
//! behind the [`CodeAssist`] trait so handlers can be exercised against
//! stubs.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_stream::Stream;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::dispatch::MultiClient;
use crate::error::AppError;
use crate::gemini::{is_supported_model, GenerateContentResponse, Request as GeminiRequest, SUPPORTED_MODELS};
use crate::upstream::UpstreamError;

/// Wall-clock bound on a unary generation request.
const UNARY_TIMEOUT: Duration = Duration::from_secs(300);

/// The dispatcher surface the handlers need. [`MultiClient`] is the real
/// implementation; tests substitute stubs.
#[async_trait]
pub trait CodeAssist: Send + Sync {
    async fn generate_content(
        &self,
        model: &str,
        project: &str,
        request: &GeminiRequest,
    ) -> Result<GenerateContentResponse, UpstreamError>;

    fn stream_generate_content(
        &self,
        model: &str,
        project: &str,
        request: &GeminiRequest,
    ) -> (
        mpsc::Receiver<GenerateContentResponse>,
        mpsc::Receiver<UpstreamError>,
    );
}

#[async_trait]
impl CodeAssist for MultiClient {
    async fn generate_content(
        &self,
        model: &str,
        project: &str,
        request: &GeminiRequest,
    ) -> Result<GenerateContentResponse, UpstreamError> {
        MultiClient::generate_content(self, model, project, request).await
    }

    fn stream_generate_content(
        &self,
        model: &str,
        project: &str,
        request: &GeminiRequest,
    ) -> (
        mpsc::Receiver<GenerateContentResponse>,
        mpsc::Receiver<UpstreamError>,
    ) {
        MultiClient::stream_generate_content(self, model, project, request)
    }
}

/// A concurrency permit that lives as long as its request, including a
/// streaming response body.
#[derive(Clone)]
struct RequestPermit(#[allow(dead_code)] Arc<OwnedSemaphorePermit>);

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    backend: Arc<dyn CodeAssist>,
    permits: Arc<Semaphore>,
    /// SHA-256 of the configured auth key; compared digest-to-digest so the
    /// comparison cost is independent of the presented key.
    auth_key_digest: Option<[u8; 32]>,
}

impl AppState {
    pub fn new(config: Arc<Config>, backend: Arc<dyn CodeAssist>) -> Self {
        let auth_key_digest = if config.auth_key.is_empty() {
            None
        } else {
            Some(Sha256::digest(config.auth_key.as_bytes()).into())
        };
        let permits = Arc::new(Semaphore::new(config.max_concurrent_requests));
        Self {
            config,
            backend,
            permits,
            auth_key_digest,
        }
    }

    /// Whether the request headers carry the configured key.
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.auth_key_digest else {
            return true;
        };
        if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            if let Some(token) = value.strip_prefix("Bearer ") {
                let digest: [u8; 32] = Sha256::digest(token.trim().as_bytes()).into();
                if &digest == expected {
                    return true;
                }
            }
        }
        if let Some(value) = headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()) {
            let digest: [u8; 32] = Sha256::digest(value.as_bytes()).into();
            if &digest == expected {
                return true;
            }
        }
        false
    }
}

/// Build the application router with the full middleware stack.
///
/// Order, outermost first: panic recovery, request tracing, body cap,
/// concurrency gate, then the routes. `/health` bypasses auth.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/v1beta/models", get(list_models))
        .route("/v1beta/models/{model_call}", post(generate))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            concurrency_limit,
        ))
        .layer(DefaultBodyLimit::max(
            state.config.request_max_body_bytes as usize,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

async fn require_auth(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if state.authorized(request.headers()) {
        next.run(request).await
    } else {
        AppError::Unauthorized.into_response()
    }
}

/// Reject immediately with 429 when the in-flight cap is reached. The permit
/// rides in the request extensions so streaming handlers can extend its
/// lifetime to the end of the response body.
async fn concurrency_limit(
    State(state): State<AppState>,
    mut request: axum::extract::Request,
    next: Next,
) -> Response {
    match state.permits.clone().try_acquire_owned() {
        Ok(permit) => {
            request
                .extensions_mut()
                .insert(RequestPermit(Arc::new(permit)));
            next.run(request).await
        }
        Err(_) => AppError::TooManyRequests.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    name: String,
    version: &'static str,
    display_name: &'static str,
    description: &'static str,
    supported_generation_methods: [&'static str; 2],
}

#[derive(Debug, Serialize)]
struct ModelList {
    models: Vec<ModelEntry>,
}

async fn list_models() -> Json<ModelList> {
    let models = SUPPORTED_MODELS
        .iter()
        .map(|m| ModelEntry {
            name: format!("models/{}", m.name),
            version: "001",
            display_name: m.display_name,
            description: m.description,
            supported_generation_methods: ["generateContent", "streamGenerateContent"],
        })
        .collect();
    Json(ModelList { models })
}

/// `POST /v1beta/models/{model}:{action}` for both generation endpoints.
async fn generate(
    State(state): State<AppState>,
    Path(model_call): Path<String>,
    permit: Option<axum::extract::Extension<RequestPermit>>,
    Json(request): Json<GeminiRequest>,
) -> Result<Response, AppError> {
    let Some((model, action)) = model_call.split_once(':') else {
        return Err(AppError::NotFound);
    };
    if !is_supported_model(model) {
        return Err(AppError::UnknownModel);
    }

    let request = request.normalize();
    let thinking = request
        .generation_config
        .as_ref()
        .and_then(|g| g.thinking_config.as_ref());
    info!(
        model,
        thinking_config = ?thinking,
        total_tokens = estimate_request_tokens(&request),
        "sending to upstream"
    );

    match action {
        "generateContent" => handle_unary(&state, model, &request).await,
        "streamGenerateContent" => Ok(handle_streaming(
            &state,
            model,
            &request,
            permit.map(|p| p.0),
        )),
        _ => Err(AppError::NotFound),
    }
}

async fn handle_unary(
    state: &AppState,
    model: &str,
    request: &GeminiRequest,
) -> Result<Response, AppError> {
    let result = tokio::time::timeout(
        UNARY_TIMEOUT,
        state.backend.generate_content(model, "", request),
    )
    .await;

    match result {
        Ok(Ok(response)) => Ok(Json(response).into_response()),
        Ok(Err(err)) => Err(AppError::Upstream(err)),
        Err(_) => Err(AppError::Upstream(UpstreamError::Other(
            "request deadline exceeded".into(),
        ))),
    }
}

fn handle_streaming(
    state: &AppState,
    model: &str,
    request: &GeminiRequest,
    permit: Option<RequestPermit>,
) -> Response {
    let (events, errs) = state.backend.stream_generate_content(model, "", request);
    let stream = DispatchSse {
        events,
        errs,
        phase: SsePhase::Streaming,
        _permit: permit,
    };

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    let headers = response.headers_mut();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));
    headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    response
}

// ---------------------------------------------------------------------------
// SSE adaptation
// ---------------------------------------------------------------------------

enum SsePhase {
    /// Forwarding events until the event channel closes.
    Streaming,
    /// Events closed; resolving whether an error is pending.
    Draining,
    /// Terminal frame emitted; the stream ends on the next poll.
    Done,
}

/// Adapts the dispatcher's `(events, errs)` pair into SSE frames.
///
/// Events are drained to completion before the error side is consulted:
/// the dispatcher queues its error and then closes the event channel, so
/// every forwarded event becomes a `data:` frame and a failure still ends
/// with `event: error` rather than a silent close.
struct DispatchSse {
    events: mpsc::Receiver<GenerateContentResponse>,
    errs: mpsc::Receiver<UpstreamError>,
    phase: SsePhase,
    _permit: Option<RequestPermit>,
}

fn data_event(response: &GenerateContentResponse) -> Event {
    Event::default().data(serde_json::to_string(response).unwrap_or_default())
}

fn error_event(err: &UpstreamError) -> Event {
    let body = serde_json::json!({"error": {"message": err.to_string()}});
    Event::default().event("error").data(body.to_string())
}

impl Stream for DispatchSse {
    type Item = Result<Event, std::convert::Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.phase {
                SsePhase::Done => return Poll::Ready(None),
                SsePhase::Draining => match this.errs.poll_recv(cx) {
                    Poll::Ready(Some(err)) => {
                        this.phase = SsePhase::Done;
                        return Poll::Ready(Some(Ok(error_event(&err))));
                    }
                    Poll::Ready(None) => {
                        this.phase = SsePhase::Done;
                        return Poll::Ready(None);
                    }
                    Poll::Pending => return Poll::Pending,
                },
                SsePhase::Streaming => match this.events.poll_recv(cx) {
                    Poll::Ready(Some(response)) => {
                        return Poll::Ready(Some(Ok(data_event(&response))));
                    }
                    Poll::Ready(None) => {
                        this.phase = SsePhase::Draining;
                    }
                    Poll::Pending => return Poll::Pending,
                },
            }
        }
    }
}

/// Rough prompt size for request logs: a character-count heuristic over the
/// text parts, not a tokenizer.
fn estimate_request_tokens(request: &GeminiRequest) -> usize {
    request
        .contents
        .iter()
        .flat_map(|c| c.parts.iter())
        .filter_map(|p| p.text.as_deref())
        .map(|t| t.chars().count().div_ceil(4))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    use crate::gemini::{Content, Part};

    // -- stub backend --------------------------------------------------------

    #[derive(Clone)]
    enum StubPlan {
        UnaryText(String),
        UnaryStatus(u16),
        StreamEvents(Vec<String>),
        StreamEventsThenError(Vec<String>, u16),
    }

    struct StubBackend {
        plan: StubPlan,
    }

    #[async_trait]
    impl CodeAssist for StubBackend {
        async fn generate_content(
            &self,
            _model: &str,
            _project: &str,
            _request: &GeminiRequest,
        ) -> Result<GenerateContentResponse, UpstreamError> {
            match &self.plan {
                StubPlan::UnaryText(text) => Ok(GenerateContentResponse::from_text(text.clone())),
                StubPlan::UnaryStatus(code) => Err(UpstreamError::Status {
                    status: *code,
                    body: "stub".into(),
                }),
                _ => panic!("unary call on streaming stub"),
            }
        }

        fn stream_generate_content(
            &self,
            _model: &str,
            _project: &str,
            _request: &GeminiRequest,
        ) -> (
            mpsc::Receiver<GenerateContentResponse>,
            mpsc::Receiver<UpstreamError>,
        ) {
            let (out_tx, out_rx) = mpsc::channel(16);
            let (err_tx, err_rx) = mpsc::channel(1);
            let plan = self.plan.clone();
            tokio::spawn(async move {
                match plan {
                    StubPlan::StreamEvents(texts) => {
                        for text in texts {
                            let _ = out_tx.send(GenerateContentResponse::from_text(text)).await;
                        }
                    }
                    StubPlan::StreamEventsThenError(texts, code) => {
                        for text in texts {
                            let _ = out_tx.send(GenerateContentResponse::from_text(text)).await;
                        }
                        let _ = err_tx
                            .send(UpstreamError::Status {
                                status: code,
                                body: "stub".into(),
                            })
                            .await;
                    }
                    _ => {}
                }
            });
            (out_rx, err_rx)
        }
    }

    fn app_with(plan: StubPlan, auth_key: &str) -> Router {
        let mut config = Config::default();
        config.auth_key = auth_key.to_string();
        let state = AppState::new(Arc::new(config), Arc::new(StubBackend { plan }));
        build_router(state)
    }

    fn request_body() -> String {
        serde_json::to_string(&GeminiRequest {
            contents: vec![Content {
                role: "user".into(),
                parts: vec![Part::text("hello")],
            }],
            ..GeminiRequest::default()
        })
        .unwrap()
    }

    fn post(uri: &str, key: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        builder.body(Body::from(request_body())).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    // -- routes --------------------------------------------------------------

    #[tokio::test]
    async fn test_health_is_open() {
        let app = app_with(StubPlan::UnaryText("x".into()), "secret");
        let response = app
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("\"status\":\"ok\""));
    }

    #[tokio::test]
    async fn test_models_requires_auth() {
        let app = app_with(StubPlan::UnaryText("x".into()), "secret");
        let response = app
            .oneshot(
                HttpRequest::get("/v1beta/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_models_lists_whitelist_with_bearer() {
        let app = app_with(StubPlan::UnaryText("x".into()), "secret");
        let response = app
            .oneshot(
                HttpRequest::get("/v1beta/models")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("models/gemini-2.5-flash"));
        assert!(body.contains("streamGenerateContent"));
    }

    #[tokio::test]
    async fn test_goog_api_key_header_accepted() {
        let app = app_with(StubPlan::UnaryText("x".into()), "secret");
        let response = app
            .oneshot(
                HttpRequest::get("/v1beta/models")
                    .header("x-goog-api-key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let app = app_with(StubPlan::UnaryText("x".into()), "secret");
        let response = app
            .oneshot(
                HttpRequest::get("/v1beta/models")
                    .header("authorization", "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_no_key_configured_means_open() {
        let app = app_with(StubPlan::UnaryText("x".into()), "");
        let response = app
            .oneshot(
                HttpRequest::get("/v1beta/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // -- unary generation ----------------------------------------------------

    #[tokio::test]
    async fn test_generate_content_ok() {
        let app = app_with(StubPlan::UnaryText("answer".into()), "secret");
        let response = app
            .oneshot(post(
                "/v1beta/models/gemini-2.5-flash:generateContent",
                Some("secret"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("answer"));
    }

    #[tokio::test]
    async fn test_generate_unknown_model_rejected() {
        let app = app_with(StubPlan::UnaryText("x".into()), "secret");
        let response = app
            .oneshot(post(
                "/v1beta/models/not-a-model:generateContent",
                Some("secret"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_generate_unknown_action_is_404() {
        let app = app_with(StubPlan::UnaryText("x".into()), "secret");
        let response = app
            .oneshot(post(
                "/v1beta/models/gemini-2.5-flash:embedContent",
                Some("secret"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_generate_requires_auth() {
        let app = app_with(StubPlan::UnaryText("x".into()), "secret");
        let response = app
            .oneshot(post("/v1beta/models/gemini-2.5-flash:generateContent", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_upstream_status_mapping() {
        for (upstream, expected) in [
            (429u16, StatusCode::TOO_MANY_REQUESTS),
            (401, StatusCode::UNAUTHORIZED),
            (403, StatusCode::FORBIDDEN),
            (500, StatusCode::BAD_GATEWAY),
            (404, StatusCode::BAD_REQUEST),
        ] {
            let app = app_with(StubPlan::UnaryStatus(upstream), "secret");
            let response = app
                .oneshot(post(
                    "/v1beta/models/gemini-2.5-flash:generateContent",
                    Some("secret"),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), expected, "upstream {upstream}");
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let app = app_with(StubPlan::UnaryText("x".into()), "secret");
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/v1beta/models/gemini-2.5-flash:generateContent")
            .header("content-type", "application/json")
            .header("authorization", "Bearer secret")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    // -- streaming -----------------------------------------------------------

    #[tokio::test]
    async fn test_stream_emits_one_frame_per_event() {
        let app = app_with(
            StubPlan::StreamEvents(vec!["one".into(), "two".into()]),
            "secret",
        );
        let response = app
            .oneshot(post(
                "/v1beta/models/gemini-2.5-flash:streamGenerateContent",
                Some("secret"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .unwrap()
                .to_str()
                .unwrap(),
            "text/event-stream"
        );
        assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");
        assert_eq!(response.headers().get("cache-control").unwrap(), "no-cache");

        let body = body_string(response).await;
        let frames: Vec<&str> = body
            .lines()
            .filter(|l| l.starts_with("data: "))
            .collect();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("one"));
        assert!(frames[1].contains("two"));
        assert!(!body.contains("event: error"));
    }

    #[tokio::test]
    async fn test_stream_error_frame_after_events() {
        let app = app_with(
            StubPlan::StreamEventsThenError(vec!["first".into()], 500),
            "secret",
        );
        let response = app
            .oneshot(post(
                "/v1beta/models/gemini-2.5-flash:streamGenerateContent",
                Some("secret"),
            ))
            .await
            .unwrap();
        let body = body_string(response).await;

        assert!(body.contains("first"));
        assert!(body.contains("event: error"));
        assert!(body.contains("upstream status 500"));
        // The error frame comes after the data frame.
        let data_pos = body.find("first").unwrap();
        let error_pos = body.find("event: error").unwrap();
        assert!(error_pos > data_pos);
    }

    // -- concurrency ---------------------------------------------------------

    #[tokio::test]
    async fn test_concurrency_exhaustion_returns_429() {
        let mut config = Config::default();
        config.auth_key = "secret".to_string();
        let state = AppState::new(
            Arc::new(config),
            Arc::new(StubBackend {
                plan: StubPlan::UnaryText("x".into()),
            }),
        );
        // Drain every permit so the next request is shed.
        let held: Vec<_> = (0..state.config.max_concurrent_requests)
            .map(|_| state.permits.clone().try_acquire_owned().unwrap())
            .collect();

        let app = build_router(state);
        let response = app
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        drop(held);
    }

    // -- helpers -------------------------------------------------------------

    #[test]
    fn test_estimate_request_tokens() {
        let request = GeminiRequest {
            contents: vec![Content {
                role: "user".into(),
                parts: vec![Part::text("abcdefgh"), Part::text("xy")],
            }],
            ..GeminiRequest::default()
        };
        // ceil(8/4) + ceil(2/4) = 2 + 1.
        assert_eq!(estimate_request_tokens(&request), 3);
        assert_eq!(estimate_request_tokens(&GeminiRequest::default()), 0);
    }
}
