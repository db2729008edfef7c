//! Core library for Tarpit, an HTTP deception endpoint.  Every request that
//! no other route claims lands in the Listener, which records it, scores it
//! and then answers with a decoy, a boring 404 or a stalled connection.

pub mod api;
mod config;
pub mod request;
pub mod scoring;
pub mod stall;
pub mod store;
pub mod strategy;
pub mod telemetry;
pub mod tls;
pub mod util;

pub use config::{AppConfig, TlsPaths};

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::request::{IncomingRequest, Method, RawRequest};
use crate::scoring::ThreatClassifier;
use crate::stall::{stall_response, StallConfig, StallMetrics};
use crate::store::Store;
use crate::strategy::{decoy_response, not_found, ResponseMode, ResponseStrategist};
use crate::telemetry::{CaptureRecord, CaptureSink};

pub const ROBOTS_TXT: &str = "User-agent: *\nDisallow: /";
pub const SITEMAP_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\"></urlset>";

/// Process-wide counters exposed on `/api/metrics`.
#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub record_failures_total: AtomicU64,
    pub flagged_total: AtomicU64,
    pub canned_total: AtomicU64,
    pub acceptable_exit_total: AtomicU64,
    pub payload_serve_total: AtomicU64,
    pub stall_total: AtomicU64,
    pub generic_reject_total: AtomicU64,
    pub stall: Arc<StallMetrics>,
}

impl Metrics {
    fn count_mode(&self, mode: &ResponseMode) {
        let counter = match mode {
            ResponseMode::AcceptableExit => &self.acceptable_exit_total,
            ResponseMode::PayloadServe(_) => &self.payload_serve_total,
            ResponseMode::Stall => &self.stall_total,
            ResponseMode::GenericReject => &self.generic_reject_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared application state.  Cheap to clone; every handler gets a copy.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub classifier: ThreatClassifier,
    pub strategist: ResponseStrategist,
    pub stall: StallConfig,
    pub capture: CaptureSink,
    pub metrics: Arc<Metrics>,
    /// Port recorded on every captured request.
    pub local_port: u16,
    pub flag_threshold: u8,
    pub api_enabled: bool,
    pub api_tokens: Option<Arc<HashSet<String>>>,
    pub max_request_bytes: Option<usize>,
    shutdown: Arc<watch::Sender<bool>>,
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

impl AppState {
    /// Assemble state around an already migrated store.
    pub fn new(config: &AppConfig, store: Store) -> Self {
        let (shutdown, _) = watch::channel(false);
        let start_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            store,
            classifier: ThreatClassifier::new(&config.classifier),
            strategist: ResponseStrategist::new(config.stall.enabled),
            stall: config.stall.clone(),
            capture: CaptureSink::open(
                config.log_file.as_deref(),
                config.rotation.clone(),
                config.log_stdout,
                config.log_sample_n,
            ),
            metrics: Arc::new(Metrics::default()),
            local_port: config.port,
            flag_threshold: config.flag_threshold,
            api_enabled: config.api_enabled,
            api_tokens: config.api_tokens.clone().map(Arc::new),
            max_request_bytes: config.max_request_bytes,
            shutdown: Arc::new(shutdown),
            process_start_epoch: start_time.as_secs_f64(),
            process_start_instant: Instant::now(),
        }
    }

    /// Receiver that flips to `true` once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Tell in-flight stalls to finish.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Connect the store, seed the decoy catalog and optionally run the
/// threat-level backfill.
pub async fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let store = Store::connect(&config.database_url, config.db_max_connections)
        .await
        .with_context(|| format!("failed to open database '{}'", config.database_url))?;
    let state = AppState::new(config, store);

    if !config.payloads.is_empty() {
        let inserted = state
            .store
            .seed_honeypots(&config.payloads)
            .await
            .context("failed to seed honeypot catalog")?;
        tracing::info!(inserted, configured = config.payloads.len(), "honeypot catalog seeded");
    }
    if config.rescore_on_start {
        state
            .store
            .rescore_all(&state.classifier)
            .await
            .context("threat level backfill failed")?;
    }
    Ok(state)
}

/// Build the router: the Listener as fallback, plus the reporting API when
/// enabled.
pub fn app(state: AppState) -> Router {
    let mut router = Router::new();
    if state.api_enabled {
        router = router.nest("/api", api::router(state.clone()));
    }
    let router = router.fallback(listener_handler);

    let router = if let Some(limit) = state.max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

fn canned_response(req: &IncomingRequest) -> Option<Response> {
    if req.method != Method::Get {
        return None;
    }
    let (body, content_type) = match req.path.as_str() {
        "/robots.txt" => (ROBOTS_TXT, "text/plain"),
        "/sitemap.xml" => (SITEMAP_XML, "application/xml"),
        _ => return None,
    };
    Some(
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
            body,
        )
            .into_response(),
    )
}

/// Catch-all handler.  Records and classifies every request before
/// answering; a store failure still gets a plain 404.
async fn listener_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    method: axum::http::Method,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = body.unwrap_or_else(|rejection| {
        tracing::debug!(error = %rejection, "request body dropped");
        Bytes::new()
    });
    let remote_addr = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let req = IncomingRequest::from_raw(RawRequest {
        method: method.as_str(),
        remote_addr: &remote_addr,
        path: uri.path(),
        query: uri.query(),
        headers: &headers,
        body: &body,
        local_port: state.local_port,
    });
    let classification = state.classifier.classify_with_trace(&req);
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    if let Err(err) = state.store.record_request(&req, classification.threat_level).await {
        tracing::warn!(actor = %req.address, path = %req.path, error = %err, "failed to record request");
        state.metrics.record_failures_total.fetch_add(1, Ordering::Relaxed);
        let mut record = CaptureRecord::new(&req, &classification, ResponseMode::GenericReject.as_str());
        record.record_error = Some(err.to_string());
        state.capture.emit_capture(&record);
        return not_found();
    }

    if classification.threat_level >= state.flag_threshold {
        match state.store.set_actor_flagged(&req.address, true).await {
            Ok(_) => {
                state.metrics.flagged_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => tracing::warn!(actor = %req.address, error = %err, "failed to flag actor"),
        }
    }

    if let Some(response) = canned_response(&req) {
        state.metrics.canned_total.fetch_add(1, Ordering::Relaxed);
        state
            .capture
            .emit_capture(&CaptureRecord::new(&req, &classification, "canned"));
        return response;
    }

    let mode = state.strategist.choose(&req, &state.store).await;
    state.metrics.count_mode(&mode);
    state
        .capture
        .emit_capture(&CaptureRecord::new(&req, &classification, mode.as_str()));
    tracing::debug!(
        actor = %req.address,
        path = %req.path,
        threat_level = classification.threat_level,
        mode = mode.as_str(),
        "request classified"
    );

    match mode {
        ResponseMode::AcceptableExit | ResponseMode::GenericReject => not_found(),
        ResponseMode::PayloadServe(contents) => decoy_response(contents),
        ResponseMode::Stall => stall_response(
            &state.stall,
            &req.address,
            state.shutdown_signal(),
            state.metrics.stall.clone(),
        ),
    }
}

/// Health endpoint for readiness and liveness checks.
pub(crate) async fn healthz_handler(State(state): State<AppState>) -> Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "scorerCount": state.classifier.len(),
        "stallEnabled": state.strategist.stall_enabled(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

fn write_metric(buf: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    use std::fmt::Write as _;
    writeln!(buf, "# HELP {name} {help}").ok();
    writeln!(buf, "# TYPE {name} {kind}").ok();
    writeln!(buf, "{name} {value}").ok();
}

/// Prometheus-style metrics exposition.
pub(crate) async fn metrics_handler(State(state): State<AppState>) -> Response {
    use std::fmt::Write as _;
    let m = &state.metrics;
    let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
    let mut buf = String::new();

    write_metric(&mut buf, "tarpit_requests_total", "counter", "Requests handled by the listener", load(&m.requests_total));
    write_metric(
        &mut buf,
        "tarpit_record_failures_total",
        "counter",
        "Requests that could not be persisted",
        load(&m.record_failures_total),
    );
    write_metric(
        &mut buf,
        "tarpit_flagged_total",
        "counter",
        "Requests at or above the flag threshold",
        load(&m.flagged_total),
    );
    write_metric(&mut buf, "tarpit_canned_total", "counter", "robots.txt and sitemap.xml answers", load(&m.canned_total));

    writeln!(buf, "# HELP tarpit_responses_total Strategist decisions by mode").ok();
    writeln!(buf, "# TYPE tarpit_responses_total counter").ok();
    for (mode, counter) in [
        ("acceptable_exit", &m.acceptable_exit_total),
        ("payload_serve", &m.payload_serve_total),
        ("stall", &m.stall_total),
        ("generic_reject", &m.generic_reject_total),
    ] {
        writeln!(buf, "tarpit_responses_total{{mode=\"{mode}\"}} {}", load(counter)).ok();
    }

    write_metric(
        &mut buf,
        "tarpit_stalls_started_total",
        "counter",
        "Stalls started",
        load(&m.stall.started_total),
    );
    write_metric(&mut buf, "tarpit_stalls_active", "gauge", "Connections currently stalled", load(&m.stall.active));
    write_metric(
        &mut buf,
        "tarpit_stall_chunks_total",
        "counter",
        "Filler chunks handed to stalled connections",
        load(&m.stall.chunks_total),
    );
    writeln!(buf, "# HELP tarpit_stalls_finished_total Finished stalls by outcome").ok();
    writeln!(buf, "# TYPE tarpit_stalls_finished_total counter").ok();
    for (outcome, counter) in [
        ("exhausted", &m.stall.exhausted_total),
        ("peer_closed", &m.stall.peer_closed_total),
        ("shutdown", &m.stall.shutdown_total),
    ] {
        writeln!(buf, "tarpit_stalls_finished_total{{outcome=\"{outcome}\"}} {}", load(counter)).ok();
    }

    write_metric(
        &mut buf,
        "tarpit_capture_lines_total",
        "counter",
        "Capture log lines written",
        state.capture.lines_total(),
    );
    write_metric(
        &mut buf,
        "tarpit_capture_write_errors_total",
        "counter",
        "Capture log write failures",
        state.capture.write_errors_total(),
    );
    write_metric(
        &mut buf,
        "tarpit_log_file_size_bytes",
        "gauge",
        "Current size of the capture log (0 if disabled)",
        state.capture.file_size_bytes(),
    );
    writeln!(buf, "# HELP tarpit_build_info Build information\n# TYPE tarpit_build_info gauge").ok();
    writeln!(buf, "tarpit_build_info{{version=\"{}\"}} 1", env!("CARGO_PKG_VERSION")).ok();
    write_metric(
        &mut buf,
        "tarpit_process_start_time_seconds",
        "gauge",
        "Process start time (Unix epoch seconds)",
        state.process_start_epoch,
    );
    write_metric(
        &mut buf,
        "tarpit_process_uptime_seconds",
        "gauge",
        "Process uptime seconds",
        state.process_start_instant.elapsed().as_secs_f64(),
    );

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
