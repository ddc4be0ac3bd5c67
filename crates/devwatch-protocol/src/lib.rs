pub mod backoff;
pub mod paths;
pub mod stream;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

pub use stream::{SseDecoder, SseFrame, StatusNotice, StreamEvent};

/// Upper bound on one JSON line on the control socket.
pub const MAX_JSON_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Unique identifier for a session.
pub type SessionId = String;

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lifecycle state of a supervised session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SessionStatus {
    /// A live session owns (or is about to own) an OS process and a port.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Terminal states: no process, no port, no scheduled work.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Automatic restart behaviour after an unexpected exit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_restarts: default_max_restarts(),
            delay_ms: default_restart_delay_ms(),
        }
    }
}

impl RestartPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// One supervised, user-started long-running process plus its metadata.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub command: String,
    pub working_dir: PathBuf,
    /// Port currently assigned to the process, if any.
    pub port: Option<u16>,
    /// Port the caller asked for; `None` means "allocate from the range".
    #[serde(default)]
    pub requested_port: Option<u16>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub ended_at_ms: Option<u64>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub framework: Option<String>,
}

/// Source stream of a log line.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// A single captured line of process output (or a supervisor notice).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub session_id: SessionId,
    /// Per-session sequence number, assigned on write.
    #[serde(default)]
    pub seq: u64,
    pub timestamp_ms: u64,
    pub stream: LogStream,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    /// `<timestamp_ms> [<stream>] <LEVEL> <message>`
    pub fn text_line(&self) -> String {
        format!(
            "{} [{}] {} {}",
            self.timestamp_ms,
            self.stream.as_str(),
            self.level.as_str().to_ascii_uppercase(),
            self.message
        )
    }
}

/// Identifies one metric time series: a container and a metric type.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub container_id: String,
    pub metric_type: String,
}

impl SeriesKey {
    pub fn new(container_id: impl Into<String>, metric_type: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            metric_type: metric_type.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container_id, self.metric_type)
    }
}

/// Parses the `container/metric` form produced by `Display`.
impl std::str::FromStr for SeriesKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((container, metric)) if !container.is_empty() && !metric.is_empty() => {
                Ok(Self::new(container, metric))
            }
            _ => Err(format!("invalid series `{s}`, expected <container>/<metric>")),
        }
    }
}

/// A single time-series sample.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub timestamp_ms: u64,
    pub container_id: String,
    pub metric_type: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl MetricPoint {
    pub fn new(
        timestamp_ms: u64,
        container_id: impl Into<String>,
        metric_type: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            timestamp_ms,
            container_id: container_id.into(),
            metric_type: metric_type.into(),
            value,
            unit: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(&self.container_id, &self.metric_type)
    }
}

/// A (timestamp, value) pair as drawn on a chart.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub timestamp_ms: u64,
    pub value: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DownsampledSeries {
    pub series: SeriesKey,
    pub points: Vec<Point>,
}

/// Width of an aggregation bucket.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeBucket {
    #[serde(rename = "minute")]
    Minute,
    #[serde(rename = "5minute")]
    FiveMinutes,
    #[serde(rename = "15minute")]
    FifteenMinutes,
    #[serde(rename = "30minute")]
    ThirtyMinutes,
    #[serde(rename = "hour")]
    Hour,
    #[serde(rename = "day")]
    Day,
}

impl TimeBucket {
    pub fn width_ms(self) -> u64 {
        const MINUTE: u64 = 60_000;
        match self {
            Self::Minute => MINUTE,
            Self::FiveMinutes => 5 * MINUTE,
            Self::FifteenMinutes => 15 * MINUTE,
            Self::ThirtyMinutes => 30 * MINUTE,
            Self::Hour => 60 * MINUTE,
            Self::Day => 24 * 60 * MINUTE,
        }
    }
}

/// Aggregation request. Empty filters select every series.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AggregationQuery {
    #[serde(default)]
    pub container_ids: Vec<String>,
    #[serde(default)]
    pub metric_types: Vec<String>,
    pub start_ms: u64,
    pub end_ms: u64,
    pub interval: TimeBucket,
}

/// Statistics for one series over one time bucket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AggregatedMetric {
    pub series: SeriesKey,
    pub bucket_start_ms: u64,
    pub bucket_end_ms: u64,
    pub count: usize,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Csv,
    Text,
}

/// Filters applied while reading or exporting logs.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct LogFilter {
    #[serde(default)]
    pub stream: Option<LogStream>,
    #[serde(default)]
    pub min_level: Option<LogLevel>,
    /// Case-insensitive substring over the message.
    #[serde(default)]
    pub contains: Option<String>,
}

/// Pagination and filtering options for `logs` reads.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogQuery {
    #[serde(default = "default_log_limit")]
    pub limit: usize,
    /// Matching entries to skip, counted from the oldest retained entry.
    #[serde(default)]
    pub offset: Option<usize>,
    /// Inclusive lower bound on `timestamp_ms`.
    #[serde(default)]
    pub since_ms: Option<u64>,
    #[serde(default)]
    pub filter: LogFilter,
    #[serde(default)]
    pub reverse: bool,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            limit: default_log_limit(),
            offset: None,
            since_ms: None,
            filter: LogFilter::default(),
            reverse: false,
        }
    }
}

/// Parameters for a session start (or registration).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StartSessionRequest {
    #[serde(default)]
    pub id: Option<SessionId>,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub restart_policy: Option<RestartPolicy>,
    /// Framework hint for ready detection (`next`, `vite`, `django`, ...).
    #[serde(default)]
    pub framework: Option<String>,
}

/// Result of a successful start or restart.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub status: SessionStatus,
}

/// Client-to-daemon requests sent as JSON-lines over the control socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    SessionStart(StartSessionRequest),
    SessionRegister(StartSessionRequest),
    SessionStartRegistered {
        session_id: SessionId,
    },
    SessionStop {
        session_id: SessionId,
        #[serde(default)]
        force: bool,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    SessionRestart {
        session_id: SessionId,
    },
    SessionStatus {
        #[serde(default)]
        session_id: Option<SessionId>,
    },
    SessionUnregister {
        session_id: SessionId,
    },

    // Logs
    Logs {
        session_id: SessionId,
        #[serde(default)]
        query: LogQuery,
        /// Full-text search over the session's history instead of a paged read.
        #[serde(default)]
        search: Option<String>,
    },
    LogsSearch {
        query: String,
        #[serde(default)]
        session_id: Option<SessionId>,
        #[serde(default)]
        start_ms: Option<u64>,
        #[serde(default)]
        end_ms: Option<u64>,
        #[serde(default = "default_log_limit")]
        limit: usize,
    },
    LogsExport {
        session_id: SessionId,
        format: ExportFormat,
        #[serde(default)]
        query: LogQuery,
    },
    LogsDelete {
        session_id: SessionId,
    },

    // Metrics
    MetricsIngest {
        points: Vec<MetricPoint>,
    },
    MetricsRaw {
        series: Vec<SeriesKey>,
        start_ms: u64,
        end_ms: u64,
    },
    MetricsDownsampled {
        series: Vec<SeriesKey>,
        start_ms: u64,
        end_ms: u64,
        max_points: usize,
    },
    MetricsAggregate(AggregationQuery),
    MetricsSeries,
    MetricsLive {
        series: SeriesKey,
        #[serde(default = "default_live_points")]
        max_points: usize,
    },
    MetricsExport {
        series: Vec<SeriesKey>,
        start_ms: u64,
        end_ms: u64,
        format: ExportFormat,
        #[serde(default)]
        include_unit: bool,
        #[serde(default)]
        include_metadata: bool,
    },

    // Containers
    ContainerStatus {
        container_id: String,
    },
    ContainerStats {
        container_id: String,
    },
    ContainerWait {
        container_id: String,
        /// State or health status to wait for, e.g. `running` or `healthy`.
        target: String,
        #[serde(default = "default_wait_timeout_ms")]
        timeout_ms: u64,
    },
    ContainerMonitor {
        container_id: String,
        #[serde(default)]
        interval_ms: Option<u64>,
    },
    ContainerUnmonitor {
        container_id: String,
    },
}

/// Daemon-to-client responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
}

impl Response {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Self::Ok { data }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code,
        }
    }
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionAlreadyExists,
    SessionNotFound,
    PortInUse,
    ProcessStartFailed,
    ProcessStopFailed,
    StatusWaitTimeout,
    ConnectionLost,
    ContainerRuntime,
    InvalidRequest,
    ServerError,
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_delay_ms() -> u64 {
    2_000
}

fn default_log_limit() -> usize {
    100
}

fn default_live_points() -> usize {
    500
}

fn default_wait_timeout_ms() -> u64 {
    30_000
}
