//! Tunables for every component, loadable from the daemon's TOML file.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct DevwatchConfig {
    /// Root for the registry file and session logs. `None` keeps everything
    /// in memory (registry) and under a temp dir (logs).
    pub data_dir: Option<PathBuf>,
    pub supervisor: SupervisorConfig,
    pub ports: PortConfig,
    pub registry: RegistryConfig,
    pub logs: LogConfig,
    pub metrics: MetricsConfig,
    pub broker: BrokerConfig,
    pub sweep: SweepConfig,
}

impl DevwatchConfig {
    pub fn registry_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("sessions.json"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.join("logs"),
            None => std::env::temp_dir().join("devwatch-logs"),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Fallback promotion from Starting to Running when no ready line is seen.
    pub ready_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    /// Pause between the stop and start halves of a restart.
    pub restart_settle_ms: u64,
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
    pub auto_restart: bool,
    /// Environment variable the assigned port is exported under.
    pub port_env_var: String,
    pub shell: String,
    /// Output lines longer than this are split into pieces of this size.
    pub max_line_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 10_000,
            stop_timeout_ms: 5_000,
            restart_settle_ms: 1_000,
            max_restarts: 3,
            restart_delay_ms: 2_000,
            auto_restart: true,
            port_env_var: "PORT".to_string(),
            shell: "/bin/sh".to_string(),
            max_line_bytes: 64 * 1024,
        }
    }
}

impl SupervisorConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PortConfig {
    pub range_start: u16,
    pub range_end: u16,
    /// Address used to probe bindability.
    pub probe_host: String,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            range_start: 3000,
            range_end: 3999,
            probe_host: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RegistryConfig {
    pub autosave_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { autosave_secs: 30 }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LogConfig {
    /// Entries kept in memory per session for fast tail reads.
    pub buffer_capacity: usize,
    pub rotate_bytes: u64,
    pub retention_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1_000,
            rotate_bytes: 10 * 1024 * 1024,
            retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl LogConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub series_capacity: usize,
    /// Target size of each series' live downsampled view.
    pub live_view_points: usize,
    pub cache_ttl_secs: u64,
    pub monitor_interval_ms: u64,
    pub docker_socket: PathBuf,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            series_capacity: 10_000,
            live_view_points: 500,
            cache_ttl_secs: 30,
            monitor_interval_ms: 5_000,
            docker_socket: PathBuf::from("/var/run/docker.sock"),
        }
    }
}

impl MetricsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub heartbeat_secs: u64,
    /// A subscriber silent for this many heartbeat intervals is evicted.
    pub stale_after_heartbeats: u32,
    pub subscriber_queue: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            stale_after_heartbeats: 2,
            subscriber_queue: 256,
        }
    }
}

impl BrokerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval() * self.stale_after_heartbeats.max(1)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
    /// How long a Stopped/Failed session stays in the live map.
    pub session_retention_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            session_retention_secs: 60 * 60,
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }
}
