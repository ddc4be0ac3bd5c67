//! Container status and resource polling.
//!
//! The runtime is reached through [`ContainerRuntime`]; [`DockerRuntime`]
//! talks to the Docker Engine API over its Unix socket through `bollard`. Polled stats are fed
//! into the metrics aggregator as `cpu`, `memory`, `memory_percent`,
//! `network_rx` and `network_tx` points.

use async_trait::async_trait;
use bollard::Docker;
use bollard::query_parameters::{InspectContainerOptions, StatsOptionsBuilder};
use dashmap::DashMap;
use devwatch_protocol::{MetricPoint, now_ms};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MetricsConfig;
use crate::error::{DevwatchError, Result};
use crate::metrics::MetricsAggregator;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContainerStatus {
    pub container_id: String,
    /// Runtime state name, e.g. `running`, `exited`, `paused`.
    pub state: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub health: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl ContainerStatus {
    /// True if `target` names the current state or health status.
    pub fn is(&self, target: &str) -> bool {
        self.state.eq_ignore_ascii_case(target)
            || self
                .health
                .as_deref()
                .is_some_and(|h| h.eq_ignore_ascii_case(target))
    }
}

/// One raw stats sample as reported by the runtime.
#[derive(Debug, Clone, Default)]
pub struct RawStats {
    pub cpu_stats: CpuSample,
    pub memory_stats: MemorySample,
    pub networks: Option<HashMap<String, NetworkSample>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuSample {
    pub cpu_usage: CpuUsage,
    pub system_cpu_usage: Option<u64>,
    pub online_cpus: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuUsage {
    pub total_usage: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySample {
    pub usage: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkSample {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl From<bollard::models::ContainerStatsResponse> for RawStats {
    fn from(stats: bollard::models::ContainerStatsResponse) -> Self {
        let cpu_stats = stats
            .cpu_stats
            .map(|cpu| CpuSample {
                cpu_usage: CpuUsage {
                    total_usage: cpu.cpu_usage.and_then(|u| u.total_usage).unwrap_or(0),
                },
                system_cpu_usage: cpu.system_cpu_usage,
                online_cpus: cpu.online_cpus,
            })
            .unwrap_or_default();
        let memory_stats = stats
            .memory_stats
            .map(|mem| MemorySample {
                usage: mem.usage.unwrap_or(0),
                limit: mem.limit.unwrap_or(0),
            })
            .unwrap_or_default();
        let networks = stats.networks.map(|nets| {
            nets.into_iter()
                .map(|(name, net)| {
                    let sample = NetworkSample {
                        rx_bytes: net.rx_bytes.unwrap_or(0),
                        tx_bytes: net.tx_bytes.unwrap_or(0),
                    };
                    (name, sample)
                })
                .collect()
        });
        Self {
            cpu_stats,
            memory_stats,
            networks,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MemoryUsage {
    pub usage: u64,
    pub limit: u64,
    pub percent: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NetworkUsage {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContainerStats {
    pub container_id: String,
    pub timestamp_ms: u64,
    /// `None` until two samples are available.
    pub cpu_percent: Option<f64>,
    pub memory: MemoryUsage,
    pub network: NetworkUsage,
}

impl ContainerStats {
    pub fn to_points(&self) -> Vec<MetricPoint> {
        let point = |metric: &str, value: f64, unit: &str| {
            MetricPoint::new(self.timestamp_ms, &self.container_id, metric, value).with_unit(unit)
        };
        let mut points = Vec::with_capacity(5);
        if let Some(cpu) = self.cpu_percent {
            points.push(point("cpu", cpu, "percent"));
        }
        points.push(point("memory", self.memory.usage as f64, "bytes"));
        points.push(point("memory_percent", self.memory.percent, "percent"));
        points.push(point("network_rx", self.network.rx_bytes as f64, "bytes"));
        points.push(point("network_tx", self.network.tx_bytes as f64, "bytes"));
        points
    }
}

/// `(cpu_delta / system_delta) * online_cores * 100` between two samples.
pub fn cpu_percent(previous: &CpuSample, current: &CpuSample) -> Option<f64> {
    let cpu_delta = current
        .cpu_usage
        .total_usage
        .checked_sub(previous.cpu_usage.total_usage)?;
    let system_delta = current
        .system_cpu_usage?
        .checked_sub(previous.system_cpu_usage?)?;
    if system_delta == 0 {
        return None;
    }
    let cores = f64::from(current.online_cpus.unwrap_or(1).max(1));
    Some(cpu_delta as f64 / system_delta as f64 * cores * 100.0)
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus>;
    async fn raw_stats(&self, container_id: &str) -> Result<RawStats>;
}

/// Docker Engine API client over the daemon's Unix socket.
pub struct DockerRuntime {
    client: std::result::Result<Docker, String>,
}

impl DockerRuntime {
    /// Set up a client for `socket`. Nothing is dialed until the first call,
    /// and a socket that cannot be used only fails container requests.
    pub fn connect(socket: &Path) -> Self {
        let client = Docker::connect_with_socket(
            &socket.to_string_lossy(),
            REQUEST_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| format!("cannot use {}: {e}", socket.display()));
        if let Err(reason) = &client {
            warn!(%reason, "container runtime unavailable");
        }
        Self { client }
    }

    fn docker(&self) -> Result<&Docker> {
        self.client
            .as_ref()
            .map_err(|reason| DevwatchError::ContainerRuntime(reason.clone()))
    }
}

fn runtime_error(container_id: &str, error: bollard::errors::Error) -> DevwatchError {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => DevwatchError::ContainerRuntime(format!("no such container: {container_id}")),
        other => DevwatchError::ContainerRuntime(format!("{container_id}: {other}")),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus> {
        let info = self
            .docker()?
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| runtime_error(container_id, e))?;
        let state = info.state.unwrap_or_default();
        Ok(ContainerStatus {
            container_id: container_id.to_string(),
            state: state.status.map(|s| s.to_string()).unwrap_or_default(),
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
            health: state
                .health
                .and_then(|h| h.status)
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty()),
            started_at: state.started_at,
            finished_at: state.finished_at,
        })
    }

    async fn raw_stats(&self, container_id: &str) -> Result<RawStats> {
        let options = StatsOptionsBuilder::new().stream(false).one_shot(true).build();
        let mut stats = self.docker()?.stats(container_id, Some(options));
        match stats.next().await {
            Some(Ok(sample)) => Ok(sample.into()),
            Some(Err(e)) => Err(runtime_error(container_id, e)),
            None => Err(DevwatchError::ContainerRuntime(format!(
                "{container_id}: runtime returned no stats"
            ))),
        }
    }
}

/// Cancels its poll loop when stopped or dropped.
pub struct MonitorHandle {
    container_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(self) {
        self.cancel.cancel();
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct HealthMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    metrics: Arc<MetricsAggregator>,
    default_interval: Duration,
    last_cpu: DashMap<String, CpuSample>,
    monitors: DashMap<String, MonitorHandle>,
}

impl HealthMonitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        metrics: Arc<MetricsAggregator>,
        config: &MetricsConfig,
    ) -> Self {
        Self {
            runtime,
            metrics,
            default_interval: config.monitor_interval(),
            last_cpu: DashMap::new(),
            monitors: DashMap::new(),
        }
    }

    pub async fn get_status(&self, container_id: &str) -> Result<ContainerStatus> {
        self.runtime.inspect(container_id).await
    }

    /// Current usage. CPU percent needs a previous sample for this container
    /// and is `None` without one.
    pub async fn get_stats(&self, container_id: &str) -> Result<ContainerStats> {
        let raw = self.runtime.raw_stats(container_id).await?;
        let previous = self.last_cpu.insert(container_id.to_string(), raw.cpu_stats);
        let cpu_percent = previous.and_then(|prev| cpu_percent(&prev, &raw.cpu_stats));

        let memory = raw.memory_stats;
        let percent = if memory.limit > 0 {
            memory.usage as f64 / memory.limit as f64 * 100.0
        } else {
            0.0
        };
        let (rx_bytes, tx_bytes) = raw
            .networks
            .iter()
            .flat_map(|nets| nets.values())
            .fold((0u64, 0u64), |(rx, tx), n| {
                (rx.saturating_add(n.rx_bytes), tx.saturating_add(n.tx_bytes))
            });

        Ok(ContainerStats {
            container_id: container_id.to_string(),
            timestamp_ms: now_ms(),
            cpu_percent,
            memory: MemoryUsage {
                usage: memory.usage,
                limit: memory.limit,
                percent,
            },
            network: NetworkUsage { rx_bytes, tx_bytes },
        })
    }

    /// Poll until the container reports `target` as its state or health.
    pub async fn wait_for_status(
        &self,
        container_id: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<ContainerStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.runtime.inspect(container_id).await {
                Ok(status) if status.is(target) => return Ok(status),
                Ok(status) => debug!(container_id, state = %status.state, target, "waiting for status"),
                Err(e) => debug!(container_id, error = %e, "status poll failed"),
            }
            if tokio::time::Instant::now() + STATUS_POLL_INTERVAL > deadline {
                return Err(DevwatchError::StatusWaitTimeout {
                    container_id: container_id.to_string(),
                    target: target.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    /// Poll stats every `interval`, feeding the aggregator and `on_stats`.
    /// The first poll only primes the CPU baseline.
    pub fn start_monitoring<F>(
        self: &Arc<Self>,
        container_id: &str,
        interval: Option<Duration>,
        on_stats: F,
    ) -> MonitorHandle
    where
        F: Fn(&ContainerStats) + Send + Sync + 'static,
    {
        let interval = interval.unwrap_or(self.default_interval).max(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let monitor = Arc::clone(self);
        let id = container_id.to_string();
        let token = cancel.clone();
        self.last_cpu.remove(container_id);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match monitor.get_stats(&id).await {
                    Ok(stats) => {
                        monitor.metrics.add_points(stats.to_points());
                        on_stats(&stats);
                    }
                    Err(e) => warn!(container_id = %id, error = %e, "stats poll failed"),
                }
            }
            debug!(container_id = %id, "monitor stopped");
        });

        info!(container_id, interval_ms = interval.as_millis() as u64, "monitoring container");
        MonitorHandle {
            container_id: container_id.to_string(),
            cancel,
            task,
        }
    }

    /// Start a monitor owned by this instance, replacing any existing one.
    pub fn monitor(self: &Arc<Self>, container_id: &str, interval: Option<Duration>) {
        if let Some((_, previous)) = self.monitors.remove(container_id) {
            previous.stop();
        }
        let handle = self.start_monitoring(container_id, interval, |_| {});
        self.monitors.insert(container_id.to_string(), handle);
    }

    pub fn unmonitor(&self, container_id: &str) -> bool {
        match self.monitors.remove(container_id) {
            Some((_, handle)) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    pub fn monitored(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.monitors.iter().map(|m| m.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn stop_all(&self) {
        self.monitors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::StreamingBroker;
    use crate::config::BrokerConfig;
    use devwatch_protocol::SeriesKey;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    /// Reports a fixed CPU increment per poll and flips to `running` after a
    /// number of inspections.
    struct FakeRuntime {
        polls: AtomicU64,
        inspections: AtomicUsize,
        running_after: usize,
    }

    impl FakeRuntime {
        fn new(running_after: usize) -> Self {
            Self {
                polls: AtomicU64::new(0),
                inspections: AtomicUsize::new(0),
                running_after,
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn inspect(&self, container_id: &str) -> Result<ContainerStatus> {
            let n = self.inspections.fetch_add(1, Ordering::SeqCst);
            let running = n >= self.running_after;
            Ok(ContainerStatus {
                container_id: container_id.to_string(),
                state: if running { "running" } else { "created" }.to_string(),
                running,
                exit_code: None,
                health: None,
                started_at: None,
                finished_at: None,
            })
        }

        async fn raw_stats(&self, _container_id: &str) -> Result<RawStats> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(RawStats {
                cpu_stats: CpuSample {
                    cpu_usage: CpuUsage {
                        total_usage: n * 250,
                    },
                    system_cpu_usage: Some(n * 1_000),
                    online_cpus: Some(2),
                },
                memory_stats: MemorySample {
                    usage: 256,
                    limit: 1_024,
                },
                networks: Some(HashMap::from([(
                    "eth0".to_string(),
                    NetworkSample {
                        rx_bytes: 10,
                        tx_bytes: 20,
                    },
                )])),
            })
        }
    }

    fn monitor_with(runtime: FakeRuntime) -> (Arc<HealthMonitor>, Arc<MetricsAggregator>) {
        let broker = Arc::new(StreamingBroker::new(BrokerConfig::default()));
        let metrics = Arc::new(MetricsAggregator::new(MetricsConfig::default(), broker));
        let monitor = HealthMonitor::new(
            Arc::new(runtime),
            Arc::clone(&metrics),
            &MetricsConfig::default(),
        );
        (Arc::new(monitor), metrics)
    }

    #[test]
    fn cpu_percent_uses_deltas_and_cores() {
        let prev = CpuSample {
            cpu_usage: CpuUsage { total_usage: 100 },
            system_cpu_usage: Some(1_000),
            online_cpus: Some(4),
        };
        let cur = CpuSample {
            cpu_usage: CpuUsage { total_usage: 200 },
            system_cpu_usage: Some(2_000),
            online_cpus: Some(4),
        };
        assert_eq!(cpu_percent(&prev, &cur), Some(40.0));
        assert_eq!(cpu_percent(&cur, &cur), None);
        assert_eq!(cpu_percent(&cur, &prev), None);
    }

    #[tokio::test]
    async fn first_stats_sample_has_no_cpu_percent() {
        let (monitor, _) = monitor_with(FakeRuntime::new(0));
        let first = monitor.get_stats("c1").await.unwrap();
        assert_eq!(first.cpu_percent, None);
        assert_eq!(first.memory.percent, 25.0);
        assert_eq!(first.network.tx_bytes, 20);

        let second = monitor.get_stats("c1").await.unwrap();
        assert_eq!(second.cpu_percent, Some(50.0));
        assert_eq!(second.to_points().len(), 5);
    }

    #[tokio::test]
    async fn wait_for_status_succeeds_or_times_out() {
        let (monitor, _) = monitor_with(FakeRuntime::new(1));
        let status = monitor
            .wait_for_status("c1", "running", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(status.running);

        let err = monitor
            .wait_for_status("c1", "exited", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DevwatchError::StatusWaitTimeout { .. }));
    }

    #[tokio::test]
    async fn monitoring_feeds_aggregator_and_callback() {
        let (monitor, metrics) = monitor_with(FakeRuntime::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = monitor.start_monitoring("c1", Some(Duration::from_millis(10)), move |s| {
            sink.lock().unwrap().push(s.cpu_percent);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_running());
        handle.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock().unwrap().clone();
        assert!(seen.len() >= 2);
        assert_eq!(seen[0], None);
        assert!(seen[1..].iter().all(|cpu| *cpu == Some(50.0)));
        assert!(metrics.point_count(&SeriesKey::new("c1", "memory")) >= 2);
        assert_eq!(
            metrics.point_count(&SeriesKey::new("c1", "cpu")),
            seen.len() - 1
        );
    }

    /// Answers like the Engine API: one request per connection, then close.
    async fn fake_engine(listener: UnixListener) {
        while let Ok((mut conn, _)) = listener.accept().await {
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let head = String::from_utf8_lossy(&request).to_string();
            let target = head.split_whitespace().nth(1).unwrap_or_default().to_string();
            let (status, body) = if target.contains("/containers/web/json") {
                ("200 OK", r#"{"Id":"web","State":{"Status":"running","Running":true,"ExitCode":0,"Health":{"Status":"healthy"}}}"#)
            } else if target.contains("/containers/web/stats?") {
                ("200 OK", r#"{"cpu_stats":{"cpu_usage":{"total_usage":5},"system_cpu_usage":10,"online_cpus":1},"memory_stats":{"usage":1,"limit":4},"networks":{"eth0":{"rx_bytes":7,"tx_bytes":9}}}"#)
            } else {
                ("404 Not Found", r#"{"message":"No such container"}"#)
            };
            let reply = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}\n",
                body.len() + 1
            );
            let _ = conn.write_all(reply.as_bytes()).await;
            let _ = conn.shutdown().await;
        }
    }

    #[tokio::test]
    async fn docker_runtime_maps_engine_responses() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("docker.sock");
        tokio::spawn(fake_engine(UnixListener::bind(&socket).unwrap()));

        let runtime = DockerRuntime::connect(&socket);
        let status = runtime.inspect("web").await.unwrap();
        assert_eq!(status.state, "running");
        assert!(status.running);
        assert!(status.is("healthy"));
        assert_eq!(status.exit_code, Some(0));

        let stats = runtime.raw_stats("web").await.unwrap();
        assert_eq!(stats.cpu_stats.cpu_usage.total_usage, 5);
        assert_eq!(stats.cpu_stats.system_cpu_usage, Some(10));
        assert_eq!(stats.memory_stats.limit, 4);
        assert_eq!(stats.networks.unwrap()["eth0"].tx_bytes, 9);

        match runtime.inspect("missing").await {
            Err(DevwatchError::ContainerRuntime(message)) => {
                assert_eq!(message, "no such container: missing");
            }
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }
}
