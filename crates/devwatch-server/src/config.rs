use anyhow::{Context, Result};
use libdevwatch::DevwatchConfig;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use devwatch_protocol::paths;

/// Daemon-only settings, under `[server]` in the config file.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ServerSection {
    pub socket_path: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub listen: Option<SocketAddr>,
    /// Origins allowed to call the HTTP API from a browser. `*` allows any.
    pub allow_origins: Vec<String>,
}

/// The whole config file: `[server]` plus every core section
/// (`[supervisor]`, `[ports]`, `[logs]`, ...).
#[derive(Deserialize, Debug, Clone, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(flatten)]
    pub core: DevwatchConfig,
}

/// Settings after merging the file with command line overrides.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    /// `None` disables the HTTP listener.
    pub listen: Option<SocketAddr>,
    pub allow_origins: Vec<String>,
    pub core: DevwatchConfig,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub listen: Option<SocketAddr>,
    pub no_http: bool,
    pub data_dir: Option<PathBuf>,
}

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8787";

impl RuntimeConfig {
    pub fn load(overrides: Overrides) -> Result<Self> {
        let path = overrides.config_path.clone().unwrap_or_else(paths::config_path);
        let explicit = overrides.config_path.is_some();
        let file = read_file_config(&path, explicit)?;
        Self::merge(file, overrides)
    }

    pub fn merge(file: FileConfig, overrides: Overrides) -> Result<Self> {
        let mut core = file.core;
        if let Some(dir) = overrides.data_dir {
            core.data_dir = Some(dir);
        }
        if core.data_dir.is_none() {
            core.data_dir = Some(paths::data_dir());
        }

        let listen = if overrides.no_http {
            None
        } else {
            match overrides.listen.or(file.server.listen) {
                Some(addr) => Some(addr),
                None => Some(DEFAULT_LISTEN.parse().context("invalid default listen address")?),
            }
        };
        let allow_origins = if file.server.allow_origins.is_empty() {
            vec!["http://localhost:3000".to_string()]
        } else {
            file.server.allow_origins
        };

        Ok(Self {
            socket_path: overrides
                .socket_path
                .or(file.server.socket_path)
                .unwrap_or_else(paths::default_socket_path),
            pid_file: file.server.pid_file.unwrap_or_else(paths::pid_file_path),
            listen,
            allow_origins,
            core,
        })
    }
}

fn read_file_config(path: &Path, explicit: bool) -> Result<FileConfig> {
    if !path.exists() {
        if explicit {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        return Ok(FileConfig::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_sections_reach_core_config() {
        let file: FileConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            allow_origins = ["*"]

            [supervisor]
            stop_timeout_ms = 1500

            [ports]
            range_start = 5000
            range_end = 5100
            "#,
        )
        .unwrap();
        assert_eq!(file.core.supervisor.stop_timeout_ms, 1_500);
        assert_eq!(file.core.ports.range_start, 5_000);
        assert_eq!(file.core.logs.buffer_capacity, 1_000);

        let cfg = RuntimeConfig::merge(
            file,
            Overrides {
                data_dir: Some(PathBuf::from("/srv/devwatch")),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.listen, Some("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(cfg.allow_origins, vec!["*".to_string()]);
        assert_eq!(
            cfg.core.registry_path(),
            Some(PathBuf::from("/srv/devwatch/sessions.json"))
        );
    }

    #[test]
    fn overrides_win_and_http_can_be_disabled() {
        let cfg = RuntimeConfig::merge(
            FileConfig::default(),
            Overrides {
                socket_path: Some(PathBuf::from("/tmp/dw.sock")),
                no_http: true,
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.socket_path, PathBuf::from("/tmp/dw.sock"));
        assert!(cfg.listen.is_none());
        assert!(cfg.core.data_dir.is_some());
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RuntimeConfig::load(Overrides {
            config_path: Some(dir.path().join("nope.toml")),
            ..Overrides::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
