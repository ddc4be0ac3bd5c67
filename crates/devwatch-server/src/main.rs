mod config;
mod control;
mod http;

use anyhow::{Context, Result};
use clap::Parser;
use libdevwatch::Devwatch;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Overrides, RuntimeConfig};

/// Supervises dev servers and streams their logs and metrics.
#[derive(Parser, Debug)]
#[command(name = "devwatchd", version)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/devwatch/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Control socket path
    #[arg(long)]
    socket: Option<PathBuf>,
    /// HTTP listen address for the REST API and event stream
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Do not start the HTTP listener
    #[arg(long, conflicts_with = "listen")]
    no_http: bool,
    /// Directory for the session registry and logs
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

impl Args {
    fn overrides(self) -> Overrides {
        Overrides {
            config_path: self.config,
            socket_path: self.socket,
            listen: self.listen,
            no_http: self.no_http,
            data_dir: self.data_dir,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devwatch_server=info,libdevwatch=info".into()),
        )
        .init();

    let cfg = RuntimeConfig::load(Args::parse().overrides())?;
    if let Some(dir) = &cfg.core.data_dir {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let devwatch = Arc::new(Devwatch::new(cfg.core.clone()).context("failed to initialise devwatch")?);

    let shutdown = CancellationToken::new();
    let http_task = match cfg.listen {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind http listener on {addr}"))?;
            let state = Arc::new(http::AppState {
                devwatch: Arc::clone(&devwatch),
                shutdown: shutdown.clone(),
            });
            let origins = cfg.allow_origins.clone();
            Some(tokio::spawn(async move { http::serve(listener, state, &origins).await }))
        }
        None => None,
    };

    let listener = control::bind(&cfg.socket_path)?;
    if let Some(parent) = cfg.pid_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&cfg.pid_file, std::process::id().to_string())
        .with_context(|| format!("failed to write {}", cfg.pid_file.display()))?;
    info!(
        pid = std::process::id(),
        socket = %cfg.socket_path.display(),
        "devwatchd started"
    );

    let background = devwatch.spawn_background(shutdown.clone());
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let accept_result = control::accept_loop(listener, Arc::clone(&devwatch), shutdown.clone()).await;
    shutdown.cancel();

    if let Some(task) = http_task {
        match task.await {
            Ok(Err(err)) => warn!("http server exited with error: {err:#}"),
            Err(err) => warn!("http task failed: {err}"),
            Ok(Ok(())) => {}
        }
    }

    devwatch.shutdown().await;
    for handle in background {
        // Autosave is aborted on shutdown; its cancellation is expected.
        let _ = handle.await;
    }

    let _ = fs::remove_file(&cfg.socket_path);
    let _ = fs::remove_file(&cfg.pid_file);
    info!("devwatchd stopped");

    accept_result
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!("failed to install SIGTERM handler: {err}");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = shutdown.cancelled() => return,
            }
            shutdown.cancel();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = terminate.recv() => info!("SIGTERM received, shutting down"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}
