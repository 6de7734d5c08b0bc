//! Router construction, middleware, and the serve loop.

use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{DefaultBodyLimit, MatchedPath, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::add_extension::AddExtensionLayer;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use timegrid_app::services::MAX_ARTIFACT_BYTES;

use crate::api::{self, ApiError};
use crate::config::{CorsConfig, ProxyMode, RateLimitConfig, ServerConfig};

pub use crate::api::ApiState;

const HEALTHZ_PATH: &str = "/healthz";
const UPLOAD_PATH: &str = "/api/v2/timetable/upload";
const JOBS_PATH: &str = "/api/v2/timetable/jobs";
const JOB_PATH: &str = "/api/v2/timetable/jobs/:job_id";
const JOB_WEBHOOK_PATH: &str = "/api/v2/timetable/jobs/:job_id/webhook";
const JOB_CALENDAR_PATH: &str = "/api/v2/timetable/jobs/:job_id/fullcalendar";
const HEALTHZ_STATUS: &str = "ok";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_ID_HEADER: &str = "x-request-id";
/// Multipart framing overhead on top of the artifact cap.
const BODY_LIMIT_BYTES: usize = MAX_ARTIFACT_BYTES + 2 * 1024 * 1024;

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    Pending,
    CtrlC,
    SigTerm,
    ListenerFailed,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CORS configuration: {reason}")]
    CorsConfig { reason: String },
}

#[derive(Clone)]
struct RateLimitState {
    upload: Arc<DefaultKeyedRateLimiter<String>>,
    proxy_mode: ProxyMode,
    trusted: Arc<HashSet<IpAddr>>,
}

impl RateLimitState {
    fn new(cfg: &RateLimitConfig) -> Arc<Self> {
        debug_assert!(cfg.window_ms.get() > 0);
        let per = Duration::from_millis(cfg.window_ms.get());
        #[allow(deprecated)]
        let mut quota = Quota::new(cfg.upload_max_requests, per).expect("window_ms must be > 0");
        quota = quota.allow_burst(
            NonZeroU32::new(cfg.upload_burst.get()).expect("burst is non-zero by construction"),
        );
        Arc::new(Self {
            upload: Arc::new(DefaultKeyedRateLimiter::<String>::keyed(quota)),
            proxy_mode: cfg.proxy_mode,
            trusted: Arc::new(cfg.trusted_proxies.iter().copied().collect()),
        })
    }
}

async fn rate_limit_middleware(
    State(state): State<Arc<RateLimitState>>,
    req: Request<Body>,
    next: Next,
) -> axum::response::Response {
    if matched_path_or_uri(&req) != UPLOAD_PATH {
        return next.run(req).await;
    }

    let ip = extract_client_ip(&req, state.proxy_mode, state.trusted.as_ref())
        .unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]));
    let key = format!("upload:{ip}");

    match state.upload.check_key(&key) {
        Ok(()) => next.run(req).await,
        Err(negative) => {
            let wait = negative.wait_time_from(DefaultClock::default().now());
            let mut response = ApiError::rate_limited(wait.as_millis() as u64).into_response();
            let secs = std::cmp::max(1u64, wait.as_millis() as u64 / 1000);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
            response
        }
    }
}

fn extract_client_ip(
    req: &Request<Body>,
    mode: ProxyMode,
    trusted: &HashSet<IpAddr>,
) -> Option<IpAddr> {
    let peer_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())?;

    match mode {
        ProxyMode::Off => Some(peer_ip),
        ProxyMode::XForwardedFor => {
            if trusted.contains(&peer_ip) {
                parse_xff(req.headers()).or(Some(peer_ip))
            } else {
                Some(peer_ip)
            }
        }
    }
}

fn parse_xff(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .and_then(|ip| ip.parse::<IpAddr>().ok())
}

/// Assemble the application router with all middleware layers.
pub fn build_router(
    config: &ServerConfig,
    state: Arc<ApiState>,
) -> Result<Router, ServerError> {
    debug_assert!(HEALTHZ_PATH.starts_with('/'));

    let mut router = Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(UPLOAD_PATH, post(api::upload))
        .route(JOBS_PATH, get(api::list_jobs))
        .route(JOB_PATH, get(api::get_job).delete(api::cancel_job))
        .route(JOB_WEBHOOK_PATH, post(api::attach_webhook))
        .route(JOB_CALENDAR_PATH, get(api::fullcalendar))
        .fallback(not_found_handler);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let path = matched_path_or_uri(request);
            let request_id =
                header_request_id(request.headers()).unwrap_or_else(|| "-".to_string());
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                path = %path,
                request_id = %request_id
            )
        })
        .on_response(
            |response: &axum::response::Response, latency: Duration, span: &tracing::Span| {
                let status = response.status().as_u16();
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::info!(parent: span, status, latency_ms, "request completed");
            },
        );

    if config.rate_limit.enabled {
        let limiter_state = RateLimitState::new(&config.rate_limit);
        router = router.layer(middleware::from_fn_with_state(
            limiter_state,
            rate_limit_middleware,
        ));
    }

    if config.cors.enabled {
        router = router.layer(build_cors_layer(&config.cors)?);
    }

    router = router.layer(trace_layer);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);
    router = router
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES));

    Ok(router.layer(AddExtensionLayer::new(state)))
}

fn build_cors_layer(config: &CorsConfig) -> Result<CorsLayer, ServerError> {
    debug_assert!(!config.allow_origins.is_empty());
    let origins: Vec<HeaderValue> = config
        .allow_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|err| ServerError::CorsConfig {
                reason: format!("origin `{origin}` is not a valid header value: {err}"),
            })
        })
        .collect::<Result<_, _>>()?;

    let methods: Vec<Method> = config
        .allow_methods
        .iter()
        .map(|method| {
            Method::from_bytes(method.as_bytes()).map_err(|_| ServerError::CorsConfig {
                reason: format!("method `{method}` failed to parse"),
            })
        })
        .collect::<Result<_, _>>()?;

    let headers: Vec<HeaderName> = config
        .allow_headers
        .iter()
        .map(|name| {
            HeaderName::from_bytes(name.as_bytes()).map_err(|err| ServerError::CorsConfig {
                reason: format!("header `{name}` is invalid: {err}"),
            })
        })
        .collect::<Result<_, _>>()?;

    let mut cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::list(methods))
        .max_age(Duration::from_secs(config.max_age_secs));
    if !headers.is_empty() {
        cors = cors.allow_headers(AllowHeaders::list(headers));
    }
    Ok(cors)
}

/// Bind and serve until SIGTERM/Ctrl-C, then drain with a bounded timeout.
pub async fn serve(config: ServerConfig, state: Arc<ApiState>) -> Result<(), ServerError> {
    let listen_addr = parse_listen_addr(&config.listen_addr)?;
    let listener = bind_listener(listen_addr).await?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "timegrid server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownEvent::Pending);
    let shutdown_future = broadcast_shutdown(shutdown_tx);

    let app = build_router(&config, state)?;
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let mut server_future = Box::pin(async move {
        axum::serve(listener, make_service)
            .with_graceful_shutdown(shutdown_future)
            .await
    });

    let drain_rx = shutdown_rx.clone();
    let mut drain_timeout = Box::pin(drain_timeout_future(drain_rx));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {
            // Timeout elapsed; dropping the server future forces termination.
        }
    }

    let final_event = *shutdown_rx.borrow();
    if final_event == ShutdownEvent::Pending {
        tracing::info!("server stopped without external shutdown signal");
    } else {
        tracing::info!(?final_event, "server shutdown complete");
    }
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    Json(HealthzResponse {
        status: HEALTHZ_STATUS,
    })
}

async fn not_found_handler(request: Request<Body>) -> axum::response::Response {
    let path = request.uri().path().to_string();
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "error": "not_found",
            "message": format!("resource `{path}` not found"),
        })),
    )
        .into_response()
}

fn matched_path_or_uri<B>(request: &Request<B>) -> String {
    if let Some(path) = request.extensions().get::<MatchedPath>() {
        return path.as_str().to_string();
    }
    request.uri().path().to_string()
}

fn header_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

async fn wait_for_shutdown() -> ShutdownEvent {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }
    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

fn broadcast_shutdown(
    sender: watch::Sender<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let event = wait_for_shutdown().await;
        debug_assert!(event != ShutdownEvent::Pending);
        if let Err(error) = sender.send(event) {
            tracing::warn!(?event, %error, "failed to broadcast shutdown event");
        }
    }
}

fn drain_timeout_future(
    mut receiver: watch::Receiver<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        if receiver.changed().await.is_ok() {
            let event = *receiver.borrow_and_update();
            tracing::info!(?event, "shutdown signal received; draining connections");
            tokio::time::sleep(DRAIN_TIMEOUT).await;
            tracing::warn!(
                ?event,
                seconds = DRAIN_TIMEOUT.as_secs(),
                "graceful shutdown timed out; continuing shutdown"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use axum::body::to_bytes;
    use tower::ServiceExt;

    use timegrid_app::config::PipelineConfig;
    use timegrid_app::jobs::{JobStatus, JobStore, MemoryJobStore};
    use timegrid_app::queue::MemoryQueue;
    use timegrid_app::services::{MemoryBlobStore, SubmissionFacade};
    use timegrid_app::timetable::{ExtractedTimetable, TimeBlock, Weekday};

    use super::*;

    fn test_state() -> (Arc<MemoryJobStore>, Arc<ApiState>) {
        let store = Arc::new(MemoryJobStore::new());
        let blob = Arc::new(MemoryBlobStore::new());
        let queue = Arc::new(MemoryQueue::new(StdDuration::from_secs(300)));
        let facade = Arc::new(SubmissionFacade::new(
            blob,
            store.clone(),
            queue,
            PipelineConfig::default(),
        ));
        let state = Arc::new(ApiState {
            facade,
            store: store.clone(),
        });
        (store, state)
    }

    fn router(state: Arc<ApiState>) -> Router {
        build_router(&ServerConfig::default(), state).expect("router builds")
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("body is JSON")
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let (_store, state) = test_state();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri(HEALTHZ_PATH)
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let (_store, state) = test_state();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/api/v2/timetable/jobs/nope")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"], "not_found");
    }

    #[tokio::test]
    async fn upload_accepts_multipart_and_returns_202() {
        let (store, state) = test_state();
        let boundary = "xyzboundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"grid.png\"\r\n\
             Content-Type: image/png\r\n\r\n\
             fakepngbytes\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"teacherName\"\r\n\r\n\
             Ms Patel\r\n\
             --{boundary}--\r\n"
        );

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(UPLOAD_PATH)
                    .header(
                        "content-type",
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(body))
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["status"], "pending");
        let job_id = json["data"]["jobId"].as_str().expect("job id");
        assert!(json["data"]["statusUrl"]
            .as_str()
            .unwrap()
            .ends_with(job_id));

        let job = store.get_job(job_id).expect("read").expect("job exists");
        assert_eq!(job.teacher_name.as_deref(), Some("Ms Patel"));
    }

    #[tokio::test]
    async fn upload_rejects_unsupported_type() {
        let (_store, state) = test_state();
        let boundary = "xyzboundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             hello\r\n\
             --{boundary}--\r\n"
        );

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(UPLOAD_PATH)
                    .header(
                        "content-type",
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(body))
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn cancel_transitions_pending_job_and_rejects_repeat() {
        let (store, state) = test_state();
        let mut job = timegrid_app::jobs::Job::new("uploads/a/1-x.png", "image/png", "x.png", 8);
        job.job_id = "job-cancel".to_string();
        store.create_job(&job).expect("create");

        let app = router(state);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/api/v2/timetable/jobs/job-cancel")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["status"], "cancelled");
        assert_eq!(
            store.get_job("job-cancel").unwrap().unwrap().status,
            JobStatus::Cancelled
        );

        let repeat = app
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/api/v2/timetable/jobs/job-cancel")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(repeat.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn fullcalendar_serves_projection_for_completed_job() {
        let (store, state) = test_state();
        let mut job = timegrid_app::jobs::Job::new("uploads/a/1-x.png", "image/png", "x.png", 8);
        job.job_id = "job-cal".to_string();
        store.create_job(&job).expect("create");
        store.begin_processing("job-cal", 1).expect("begin");
        let result = ExtractedTimetable {
            blocks: vec![TimeBlock::new(Weekday::Monday, 540, 600, "Maths")],
            ..ExtractedTimetable::default()
        };
        store
            .complete_job("job-cal", &result, "structured", "simple", "results/job-cal/extraction-result.json", 2)
            .expect("complete");

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/api/v2/timetable/jobs/job-cal/fullcalendar")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let events = json["events"].as_array().expect("events array");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["startTime"], "09:00");
        assert_eq!(events[0]["endTime"], "10:00");
        assert_eq!(events[0]["daysOfWeek"][0], 1);
    }

    #[tokio::test]
    async fn completed_job_status_renders_clock_times() {
        let (store, state) = test_state();
        let mut job = timegrid_app::jobs::Job::new("uploads/a/1-x.png", "image/png", "x.png", 8);
        job.job_id = "job-done".to_string();
        store.create_job(&job).expect("create");
        store.begin_processing("job-done", 1).expect("begin");
        let result = ExtractedTimetable {
            blocks: vec![TimeBlock::new(Weekday::Wednesday, 9 * 60 + 5, 10 * 60, "Maths")],
            ..ExtractedTimetable::default()
        };
        store
            .complete_job(
                "job-done",
                &result,
                "hybrid",
                "medium",
                "results/job-done/extraction-result.json",
                2,
            )
            .expect("complete");

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/api/v2/timetable/jobs/job-done")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["status"], "completed");
        assert_eq!(json["data"]["processingMethod"], "hybrid");
        let block = &json["data"]["result"]["blocks"][0];
        assert_eq!(block["day"], "Wednesday");
        assert_eq!(block["startTime"], "09:05");
        assert_eq!(block["endTime"], "10:00");
    }

    #[tokio::test]
    async fn list_endpoint_paginates() {
        let (store, state) = test_state();
        for idx in 0..3 {
            let mut job =
                timegrid_app::jobs::Job::new("uploads/a/1-x.png", "image/png", "x.png", 8);
            job.job_id = format!("job-{idx}");
            job.created_at_ms = idx;
            store.create_job(&job).expect("create");
        }

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/api/v2/timetable/jobs?page=1&perPage=2&status=pending")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["jobs"].as_array().unwrap().len(), 2);
        assert_eq!(json["data"]["pagination"]["total"], 3);
        assert_eq!(json["data"]["pagination"]["totalPages"], 2);
    }
}
