//! REST routes mirroring the control protocol, plus `/events/{topic}`.

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::Router;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use devwatch_protocol::stream::topic;
use devwatch_protocol::{
    AggregationQuery, ErrorCode, ExportFormat, LogFilter, LogLevel, LogQuery, LogStream,
    MetricPoint, Request, Response, SeriesKey, StartSessionRequest, StatusNotice, StreamEvent,
    TimeBucket,
};
use futures_util::{Stream, StreamExt, future, stream};
use libdevwatch::{Devwatch, StreamingBroker, SubscriptionId, Transport, dispatch};
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};

pub struct AppState {
    pub devwatch: Arc<Devwatch>,
    /// Ends open event streams so graceful shutdown can finish.
    pub shutdown: CancellationToken,
}

type ApiResult = Result<Json<Value>, (StatusCode, String)>;

pub async fn serve(listener: TcpListener, state: Arc<AppState>, allow_origins: &[String]) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state).layer(build_cors(allow_origins)?);
    if let Ok(addr) = listener.local_addr() {
        info!("devwatch http listening on http://{addr}");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("http server failed")
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(start_session))
        .route("/api/sessions/{id}", get(session_info).delete(unregister_session))
        .route("/api/sessions/{id}/start", post(start_registered))
        .route("/api/sessions/{id}/stop", post(stop_session))
        .route("/api/sessions/{id}/restart", post(restart_session))
        .route("/api/sessions/{id}/logs", get(session_logs).delete(delete_logs))
        .route("/api/sessions/{id}/logs/export", get(export_logs))
        .route("/api/logs/search", get(search_logs))
        .route("/api/metrics/points", post(ingest_points))
        .route("/api/metrics/series", get(metrics_series))
        .route("/api/metrics/raw", get(metrics_raw))
        .route("/api/metrics/downsampled", get(metrics_downsampled))
        .route("/api/metrics/live", get(metrics_live))
        .route("/api/metrics/aggregate", get(metrics_aggregate))
        .route("/api/metrics/export", get(metrics_export))
        .route("/api/containers/{id}", get(container_status))
        .route("/api/containers/{id}/stats", get(container_stats))
        .route(
            "/api/containers/{id}/monitor",
            post(container_monitor).delete(container_unmonitor),
        )
        .route("/events/{topic}", get(events))
        .with_state(state)
}

fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin: {origin}"))?,
        );
    }
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods(methods)
        .allow_headers(Any))
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::SessionNotFound => StatusCode::NOT_FOUND,
        ErrorCode::SessionAlreadyExists | ErrorCode::PortInUse => StatusCode::CONFLICT,
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::StatusWaitTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::ContainerRuntime | ErrorCode::ConnectionLost => StatusCode::BAD_GATEWAY,
        ErrorCode::ProcessStartFailed | ErrorCode::ProcessStopFailed | ErrorCode::ServerError => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn call(state: &AppState, request: Request) -> ApiResult {
    match dispatch(&state.devwatch, request).await {
        Response::Ok { data } => Ok(Json(data.unwrap_or(Value::Null))),
        Response::Error { message, code } => Err((status_for(code), message)),
    }
}

/// Runs an export request and serves its `content` as a document.
async fn call_export(
    state: &AppState,
    request: Request,
    format: ExportFormat,
) -> Result<impl IntoResponse + use<>, (StatusCode, String)> {
    let Json(data) = call(state, request).await?;
    let content = match data.get("content").and_then(Value::as_str) {
        Some(content) => content.to_string(),
        None => {
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "export returned no content".to_string(),
            ));
        }
    };
    let content_type = match format {
        ExportFormat::Json => "application/json",
        ExportFormat::Csv => "text/csv; charset=utf-8",
        ExportFormat::Text => "text/plain; charset=utf-8",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], content))
}

fn bad_request(message: impl Into<String>) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message.into())
}

fn parse_series(raw: Option<&str>) -> Result<Vec<SeriesKey>, (StatusCode, String)> {
    split_list(raw)
        .into_iter()
        .map(|s| s.parse::<SeriesKey>().map_err(bad_request))
        .collect()
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// Sessions

#[derive(Debug, Default, Deserialize)]
struct StartParams {
    /// Record the session without spawning it.
    #[serde(default)]
    register: bool,
}

#[derive(Debug, Default, Deserialize)]
struct StopParams {
    #[serde(default)]
    force: bool,
    timeout_ms: Option<u64>,
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> ApiResult {
    call(&state, Request::SessionStatus { session_id: None }).await
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StartParams>,
    Json(req): Json<StartSessionRequest>,
) -> ApiResult {
    let request = if params.register {
        Request::SessionRegister(req)
    } else {
        Request::SessionStart(req)
    };
    call(&state, request).await
}

async fn session_info(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    call(&state, Request::SessionStatus { session_id: Some(id) }).await
}

async fn unregister_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    call(&state, Request::SessionUnregister { session_id: id }).await
}

async fn start_registered(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    call(&state, Request::SessionStartRegistered { session_id: id }).await
}

async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<StopParams>,
) -> ApiResult {
    let request = Request::SessionStop {
        session_id: id,
        force: params.force,
        timeout_ms: params.timeout_ms,
    };
    call(&state, request).await
}

async fn restart_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    call(&state, Request::SessionRestart { session_id: id }).await
}

// Logs

#[derive(Debug, Default, Deserialize)]
struct LogParams {
    limit: Option<usize>,
    offset: Option<usize>,
    since_ms: Option<u64>,
    stream: Option<LogStream>,
    min_level: Option<LogLevel>,
    contains: Option<String>,
    #[serde(default)]
    reverse: bool,
    /// Full-text search over history instead of a paged read.
    search: Option<String>,
    format: Option<ExportFormat>,
}

impl LogParams {
    fn query(&self) -> LogQuery {
        let defaults = LogQuery::default();
        LogQuery {
            limit: self.limit.unwrap_or(defaults.limit),
            offset: self.offset,
            since_ms: self.since_ms,
            filter: LogFilter {
                stream: self.stream,
                min_level: self.min_level,
                contains: self.contains.clone(),
            },
            reverse: self.reverse,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
    session_id: Option<String>,
    start_ms: Option<u64>,
    end_ms: Option<u64>,
    limit: Option<usize>,
}

async fn session_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<LogParams>,
) -> ApiResult {
    let request = Request::Logs {
        session_id: id,
        query: params.query(),
        search: params.search.clone(),
    };
    call(&state, request).await
}

async fn export_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<LogParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let format = params.format.unwrap_or(ExportFormat::Json);
    let request = Request::LogsExport {
        session_id: id,
        format,
        query: params.query(),
    };
    call_export(&state, request, format).await
}

async fn delete_logs(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    call(&state, Request::LogsDelete { session_id: id }).await
}

async fn search_logs(State(state): State<Arc<AppState>>, Query(params): Query<SearchParams>) -> ApiResult {
    let request = Request::LogsSearch {
        query: params.q,
        session_id: params.session_id,
        start_ms: params.start_ms,
        end_ms: params.end_ms,
        limit: params.limit.unwrap_or(LogQuery::default().limit),
    };
    call(&state, request).await
}

// Metrics

#[derive(Debug, Default, Deserialize)]
struct RangeParams {
    /// Comma separated `container/metric` keys; empty selects every series.
    series: Option<String>,
    start_ms: Option<u64>,
    end_ms: Option<u64>,
    max_points: Option<usize>,
    format: Option<ExportFormat>,
    #[serde(default)]
    include_unit: bool,
    #[serde(default)]
    include_metadata: bool,
}

impl RangeParams {
    fn bounds(&self) -> (u64, u64) {
        (self.start_ms.unwrap_or(0), self.end_ms.unwrap_or(u64::MAX))
    }
}

#[derive(Debug, Deserialize)]
struct AggregateParams {
    container_ids: Option<String>,
    metric_types: Option<String>,
    start_ms: u64,
    end_ms: u64,
    interval: TimeBucket,
}

async fn ingest_points(State(state): State<Arc<AppState>>, Json(points): Json<Vec<MetricPoint>>) -> ApiResult {
    call(&state, Request::MetricsIngest { points }).await
}

async fn metrics_series(State(state): State<Arc<AppState>>) -> ApiResult {
    call(&state, Request::MetricsSeries).await
}

async fn metrics_raw(State(state): State<Arc<AppState>>, Query(params): Query<RangeParams>) -> ApiResult {
    let (start_ms, end_ms) = params.bounds();
    let request = Request::MetricsRaw {
        series: parse_series(params.series.as_deref())?,
        start_ms,
        end_ms,
    };
    call(&state, request).await
}

async fn metrics_downsampled(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangeParams>,
) -> ApiResult {
    let (start_ms, end_ms) = params.bounds();
    let request = Request::MetricsDownsampled {
        series: parse_series(params.series.as_deref())?,
        start_ms,
        end_ms,
        max_points: params.max_points.unwrap_or(500),
    };
    call(&state, request).await
}

async fn metrics_live(State(state): State<Arc<AppState>>, Query(params): Query<RangeParams>) -> ApiResult {
    let mut series = parse_series(params.series.as_deref())?;
    if series.len() != 1 {
        return Err(bad_request("live view takes exactly one series"));
    }
    let request = Request::MetricsLive {
        series: series.remove(0),
        max_points: params.max_points.unwrap_or(500),
    };
    call(&state, request).await
}

async fn metrics_aggregate(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AggregateParams>,
) -> ApiResult {
    let query = AggregationQuery {
        container_ids: split_list(params.container_ids.as_deref()),
        metric_types: split_list(params.metric_types.as_deref()),
        start_ms: params.start_ms,
        end_ms: params.end_ms,
        interval: params.interval,
    };
    call(&state, Request::MetricsAggregate(query)).await
}

async fn metrics_export(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangeParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let (start_ms, end_ms) = params.bounds();
    let format = params.format.unwrap_or(ExportFormat::Csv);
    let request = Request::MetricsExport {
        series: parse_series(params.series.as_deref())?,
        start_ms,
        end_ms,
        format,
        include_unit: params.include_unit,
        include_metadata: params.include_metadata,
    };
    call_export(&state, request, format).await
}

// Containers

#[derive(Debug, Default, Deserialize)]
struct MonitorParams {
    interval_ms: Option<u64>,
}

async fn container_status(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    call(&state, Request::ContainerStatus { container_id: id }).await
}

async fn container_stats(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    call(&state, Request::ContainerStats { container_id: id }).await
}

async fn container_monitor(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<MonitorParams>,
) -> ApiResult {
    let request = Request::ContainerMonitor {
        container_id: id,
        interval_ms: params.interval_ms,
    };
    call(&state, request).await
}

async fn container_unmonitor(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    call(&state, Request::ContainerUnmonitor { container_id: id }).await
}

// Event stream

/// Drops the broker subscription when the response stream is dropped.
struct SubscriptionGuard {
    broker: Arc<StreamingBroker>,
    id: SubscriptionId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if self.broker.unsubscribe(&self.id) {
            debug!(subscription_id = %self.id, "event stream closed");
        }
    }
}

/// `connected`, then the session's buffered log tail, then
/// `status: historical_complete`, then live events until the client leaves.
async fn events(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let devwatch = &state.devwatch;
    let (transport, mut rx) = Transport::channel(devwatch.config.broker.subscriber_queue);
    let guard = SubscriptionGuard {
        broker: Arc::clone(&devwatch.broker),
        id: devwatch.broker.subscribe(&topic, transport),
    };
    let connected = rx.recv().await;

    let backlog: Vec<StreamEvent> = match topic::session_id(&topic) {
        Some(session_id) => devwatch
            .logs
            .tail(session_id)
            .into_iter()
            .map(StreamEvent::Log)
            .collect(),
        None => Vec::new(),
    };
    let complete = StreamEvent::Status(StatusNotice::HistoricalComplete {
        topic: topic.clone(),
        count: backlog.len(),
    });
    debug!(%topic, subscription_id = %guard.id, replayed = backlog.len(), "event stream opened");

    let head = connected
        .into_iter()
        .chain(backlog)
        .chain(std::iter::once(complete));
    let events = stream::iter(head)
        .chain(ReceiverStream::new(rx))
        .take_until(state.shutdown.clone().cancelled_owned())
        .filter_map(move |event| {
            let _guard = &guard;
            future::ready(to_sse(&event).map(Ok::<Event, Infallible>))
        });
    Sse::new(events)
}

fn to_sse(event: &StreamEvent) -> Option<Event> {
    match event.data_json() {
        Ok(data) => Some(Event::default().event(event.event_type()).data(data)),
        Err(err) => {
            warn!(event = event.event_type(), "failed to encode event: {err}");
            None
        }
    }
}
