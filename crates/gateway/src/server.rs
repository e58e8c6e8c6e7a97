use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::any::Any;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, Any as CorsAny, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use webscout_agent::MissionRunner;
use webscout_core::StreamEvent;
use webscout_tools::browser::BrowserSessionManager;

use crate::auth::{require_api_key, API_KEY_HEADER};
use crate::rate_limit::{key_hint, Admission, RateLimiter};
use crate::relay::relay;

/// Shared state passed to every handler.
#[derive(Clone)]
pub struct GatewayState {
    pub runner: Arc<dyn MissionRunner>,
    pub limiter: Arc<RateLimiter>,
    pub api_keys: Arc<Vec<String>>,
    /// `None` when the browser is disabled.
    pub browser: Option<Arc<BrowserSessionManager>>,
    pub request_timeout: Duration,
    pub max_prompt_chars: usize,
}

#[derive(Debug, Deserialize)]
struct MissionQuery {
    prompt: Option<String>,
}

fn preview(prompt: &str) -> String {
    const PREVIEW_CHARS: usize = 80;
    match prompt.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}…", &prompt[..idx]),
        None => prompt.to_string(),
    }
}

fn frame(event: &StreamEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(payload) => Event::default().data(payload),
        Err(e) => {
            error!(error = %e, "Failed to encode stream frame");
            Event::default().data(r#"{"type":"error","content":"An internal error occurred."}"#)
        }
    }
}

async fn handle_run_mission(State(state): State<GatewayState>, Query(query): Query<MissionQuery>) -> Response {
    let prompt = query.prompt.unwrap_or_default();
    let len = prompt.chars().count();
    if len == 0 || len > state.max_prompt_chars {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "detail": format!("prompt must be between 1 and {} characters", state.max_prompt_chars)
            })),
        )
            .into_response();
    }

    info!(prompt = %preview(&prompt), "Mission request");
    let events = state.runner.start(prompt);
    let frames = relay(events, state.request_timeout).map(|event| Ok::<_, Infallible>(frame(&event)));
    Sse::new(frames).into_response()
}

async fn handle_health(State(state): State<GatewayState>) -> impl IntoResponse {
    let browser = state.browser.as_ref().map_or(false, |b| b.is_alive());
    Json(json!({ "status": "healthy", "browser": browser }))
}

/// Requests carrying an API key count against that key's window; requests
/// without one pass through.
async fn rate_limit_middleware(State(state): State<GatewayState>, req: Request, next: Next) -> Response {
    let Some(key) = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return next.run(req).await;
    };

    match state.limiter.check(&key).await {
        Admission::Admitted => next.run(req).await,
        Admission::Rejected { retry_after_secs } => {
            warn!(key = %key_hint(&key), retry_after_secs, "Rate limit hit");
            let mut resp = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "detail": "Rate limit exceeded. Try again later." })),
            )
                .into_response();
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
            resp
        }
    }
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = %detail, "Unhandled panic in request handler");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "detail": "Internal server error" })),
    )
        .into_response()
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive().allow_credentials(false);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(CorsAny)
        .allow_headers(CorsAny)
}

pub fn router(state: GatewayState, cors_origins: &[String]) -> Router {
    let protected = Router::new()
        .route("/v1/run-mission", get(handle_run_mission))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .merge(protected)
        .route("/v1/health", get(handle_health))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(build_cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: tokio::net::TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Gateway listening");
    }
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use serde_json::Value;
    use tower::ServiceExt;
    use webscout_agent::MissionStream;
    use webscout_core::Error;

    enum Script {
        Tokens(Vec<&'static str>),
        Fail(Error),
        Panic,
    }

    struct FakeRunner {
        script: std::sync::Mutex<Option<Script>>,
    }

    impl MissionRunner for FakeRunner {
        fn start(&self, _prompt: String) -> MissionStream {
            let script = self.script.lock().unwrap().take();
            match script {
                Some(Script::Panic) => panic!("runner exploded"),
                Some(Script::Fail(e)) => MissionStream::spawn(|tx| async move {
                    let _ = tx.send(Err(e)).await;
                }),
                Some(Script::Tokens(tokens)) => MissionStream::spawn(|tx| async move {
                    for t in tokens {
                        let _ = tx.send(Ok(StreamEvent::Token(t.to_string()))).await;
                    }
                }),
                None => MissionStream::spawn(|_tx| async {}),
            }
        }
    }

    fn app_with(script: Script, rpm: u32) -> Router {
        let state = GatewayState {
            runner: Arc::new(FakeRunner {
                script: std::sync::Mutex::new(Some(script)),
            }),
            limiter: Arc::new(RateLimiter::new(rpm)),
            api_keys: Arc::new(vec!["test-key".to_string()]),
            browser: None,
            request_timeout: Duration::from_secs(5),
            max_prompt_chars: 2000,
        };
        router(state, &["*".to_string()])
    }

    fn get_req(uri: &str, key: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().uri(uri);
        if let Some(k) = key {
            builder = builder.header("X-API-Key", k);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        serde_json::from_str(&body_text(resp).await).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = app_with(Script::Tokens(vec![]), 20);
        let resp = app.oneshot(get_req("/v1/health", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({"status": "healthy", "browser": false}));
    }

    #[tokio::test]
    async fn test_missing_or_wrong_key_is_401() {
        let app = app_with(Script::Tokens(vec![]), 20);
        for key in [None, Some("nope")] {
            let resp = app
                .clone()
                .oneshot(get_req("/v1/run-mission?prompt=hi", key))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(body_json(resp).await["detail"], "Invalid or missing API key");
        }
    }

    #[tokio::test]
    async fn test_prompt_length_is_validated() {
        let app = app_with(Script::Tokens(vec![]), 20);
        let too_long = format!("/v1/run-mission?prompt={}", "a".repeat(2001));
        for uri in ["/v1/run-mission?prompt=", "/v1/run-mission", too_long.as_str()] {
            let resp = app.clone().oneshot(get_req(uri, Some("test-key"))).await.unwrap();
            assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_mission_streams_frames() {
        let app = app_with(Script::Tokens(vec!["Hello", " world"]), 20);
        let resp = app
            .oneshot(get_req("/v1/run-mission?prompt=say%20hello", Some("test-key")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));
        assert_eq!(
            body_text(resp).await,
            concat!(
                "data: {\"type\":\"token\",\"content\":\"Hello\"}\n\n",
                "data: {\"type\":\"token\",\"content\":\" world\"}\n\n",
                "data: {\"type\":\"done\",\"content\":\"\"}\n\n",
            )
        );
    }

    #[tokio::test]
    async fn test_mission_failure_is_generic_frame() {
        let app = app_with(Script::Fail(Error::Provider("upstream said no".into())), 20);
        let resp = app
            .oneshot(get_req("/v1/run-mission?prompt=x", Some("test-key")))
            .await
            .unwrap();
        assert_eq!(
            body_text(resp).await,
            "data: {\"type\":\"error\",\"content\":\"An internal error occurred.\"}\n\n"
        );
    }

    #[tokio::test]
    async fn test_rate_limit_returns_429_with_retry_after() {
        let app = app_with(Script::Tokens(vec![]), 2);
        for _ in 0..2 {
            let resp = app.clone().oneshot(get_req("/v1/health", Some("test-key"))).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let resp = app.clone().oneshot(get_req("/v1/health", Some("test-key"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry: u64 = resp.headers()[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
        assert!((1..=60).contains(&retry));
        assert_eq!(body_json(resp).await["detail"], "Rate limit exceeded. Try again later.");

        // Keyless requests are not limited.
        let resp = app.oneshot(get_req("/v1/health", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_panic_becomes_500_json() {
        let app = app_with(Script::Panic, 20);
        let resp = app
            .oneshot(get_req("/v1/run-mission?prompt=x", Some("test-key")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await, json!({"detail": "Internal server error"}));
    }

    #[test]
    fn test_preview_truncates_long_prompts() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(100);
        assert_eq!(preview(&long).chars().count(), 81);
    }
}
