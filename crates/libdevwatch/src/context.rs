use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::StreamingBroker;
use crate::config::DevwatchConfig;
use crate::error::Result;
use crate::health::{ContainerRuntime, DockerRuntime, HealthMonitor};
use crate::logs::LogManager;
use crate::metrics::MetricsAggregator;
use crate::ports::PortAllocator;
use crate::registry::SessionRegistry;
use crate::supervisor::Supervisor;
use crate::sweeper::Sweeper;

/// One daemon's worth of components, wired together. Everything is owned
/// here and handed to transports by reference; nothing is global.
pub struct Devwatch {
    pub config: DevwatchConfig,
    pub broker: Arc<StreamingBroker>,
    pub registry: Arc<SessionRegistry>,
    pub ports: Arc<PortAllocator>,
    pub logs: Arc<LogManager>,
    pub metrics: Arc<MetricsAggregator>,
    pub health: Arc<HealthMonitor>,
    pub supervisor: Arc<Supervisor>,
}

impl Devwatch {
    /// Build every component, talking to Docker over the configured socket.
    pub fn new(config: DevwatchConfig) -> Result<Self> {
        let runtime = Arc::new(DockerRuntime::connect(&config.metrics.docker_socket));
        Self::with_runtime(config, runtime)
    }

    /// Build every component and reload the registry. Sessions found live in
    /// the registry are reconciled; none are respawned.
    pub fn with_runtime(config: DevwatchConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let broker = Arc::new(StreamingBroker::new(config.broker.clone()));
        let registry = Arc::new(SessionRegistry::new(config.registry_path()));
        let ports = Arc::new(PortAllocator::new(config.ports.clone()));
        let logs = Arc::new(LogManager::new(
            config.logs.clone(),
            config.logs_dir(),
            Arc::clone(&broker),
        ));
        let metrics = Arc::new(MetricsAggregator::new(
            config.metrics.clone(),
            Arc::clone(&broker),
        ));
        let health = Arc::new(HealthMonitor::new(
            runtime,
            Arc::clone(&metrics),
            &config.metrics,
        ));
        let supervisor = Arc::new(Supervisor::new(
            config.supervisor.clone(),
            Arc::clone(&registry),
            Arc::clone(&ports),
            Arc::clone(&logs),
            Arc::clone(&broker),
        ));

        let loaded = registry.load_all()?;
        let adopted = supervisor.recover();
        info!(
            sessions = loaded.len(),
            adopted,
            logs = %config.logs_dir().display(),
            "devwatch core ready"
        );

        Ok(Self {
            config,
            broker,
            registry,
            ports,
            logs,
            metrics,
            health,
            supervisor,
        })
    }

    /// Start heartbeat, sweep and registry autosave loops. They stop when
    /// `shutdown` is cancelled (autosave is aborted).
    pub fn spawn_background(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let sweeper = Arc::new(Sweeper::new(
            self.config.sweep.clone(),
            self.config.logs.retention(),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.logs),
            Arc::clone(&self.broker),
        ));
        let autosave = self
            .registry
            .spawn_autosave(Duration::from_secs(self.config.registry.autosave_secs.max(1)));
        let abort_autosave = {
            let shutdown = shutdown.clone();
            let handle = autosave.abort_handle();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                handle.abort();
            })
        };

        vec![
            self.broker.spawn_heartbeat(shutdown.clone()),
            sweeper.spawn(shutdown),
            autosave,
            abort_autosave,
        ]
    }

    /// Stop monitors and sessions, then flush the registry.
    pub async fn shutdown(&self) {
        self.health.stop_all();
        self.supervisor.shutdown().await;
        if let Err(e) = self.registry.flush().await {
            warn!(error = %e, "final registry save failed");
        }
    }
}
