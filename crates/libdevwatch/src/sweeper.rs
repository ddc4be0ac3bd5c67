use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::StreamingBroker;
use crate::config::SweepConfig;
use crate::logs::LogManager;
use crate::supervisor::Supervisor;

/// What one sweep pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub reaped: usize,
    pub orphans_ended: usize,
    pub rotated: usize,
    pub removed_logs: usize,
    pub evicted: usize,
}

/// Periodic housekeeping: settle adopted sessions whose process is gone, reap
/// finished sessions, rotate and expire logs, evict dead subscribers. Each step only takes short per-item locks.
pub struct Sweeper {
    config: SweepConfig,
    log_retention: Duration,
    supervisor: Arc<Supervisor>,
    logs: Arc<LogManager>,
    broker: Arc<StreamingBroker>,
}

impl Sweeper {
    pub fn new(
        config: SweepConfig,
        log_retention: Duration,
        supervisor: Arc<Supervisor>,
        logs: Arc<LogManager>,
        broker: Arc<StreamingBroker>,
    ) -> Self {
        Self {
            config,
            log_retention,
            supervisor,
            logs,
            broker,
        }
    }

    pub fn run_once(&self) -> SweepReport {
        let orphans_ended = self.supervisor.reconcile_orphans().len();
        let report = SweepReport {
            orphans_ended,
            reaped: self.supervisor.reap(self.config.session_retention()).len(),
            rotated: self.logs.rotate().len(),
            removed_logs: self.logs.cleanup(self.log_retention),
            evicted: self.broker.evict_stale().len(),
        };
        if report != SweepReport::default() {
            info!(
                reaped = report.reaped,
                orphans_ended = report.orphans_ended,
                rotated = report.rotated,
                removed_logs = report.removed_logs,
                evicted = report.evicted,
                "sweep finished"
            );
        }
        report
    }

    /// Run a sweep every configured interval until `shutdown` fires. Log file
    /// work runs on the blocking pool.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {}
                }
                let sweeper = Arc::clone(&self);
                if let Err(e) = tokio::task::spawn_blocking(move || sweeper.run_once()).await {
                    warn!(error = %e, "sweep task panicked");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Transport;
    use crate::config::{BrokerConfig, LogConfig, PortConfig, SupervisorConfig};
    use crate::ports::PortAllocator;
    use crate::registry::SessionRegistry;
    use devwatch_protocol::{LogStream, SessionStatus, StartSessionRequest};

    #[tokio::test]
    async fn sweep_reaps_sessions_rotates_logs_and_evicts_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(StreamingBroker::new(BrokerConfig {
            heartbeat_secs: 1,
            stale_after_heartbeats: 1,
            ..BrokerConfig::default()
        }));
        let logs = Arc::new(LogManager::new(
            LogConfig {
                rotate_bytes: 64,
                ..LogConfig::default()
            },
            dir.path(),
            Arc::clone(&broker),
        ));
        let supervisor = Arc::new(Supervisor::new(
            SupervisorConfig::default(),
            Arc::new(SessionRegistry::in_memory()),
            Arc::new(PortAllocator::new(PortConfig {
                range_start: 43_000,
                range_end: 43_999,
                ..PortConfig::default()
            })),
            Arc::clone(&logs),
            Arc::clone(&broker),
        ));

        supervisor
            .start(StartSessionRequest {
                id: Some("once".to_string()),
                name: "once".to_string(),
                command: "true".to_string(),
                cwd: Some(std::env::temp_dir()),
                ..StartSessionRequest::default()
            })
            .await
            .unwrap();
        for _ in 0..200 {
            if supervisor.status("once").unwrap().status == SessionStatus::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        logs.record("once", LogStream::Stdout, "a line long enough to pass the threshold");

        // The connected event fills the queue and nothing drains it.
        let (transport, _rx) = Transport::channel(1);
        broker.subscribe("sessions", transport);
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let sweeper = Sweeper::new(
            SweepConfig {
                interval_secs: 1,
                session_retention_secs: 0,
            },
            Duration::from_secs(3600),
            Arc::clone(&supervisor),
            Arc::clone(&logs),
            Arc::clone(&broker),
        );
        let report = sweeper.run_once();
        assert_eq!(report.reaped, 1);
        assert_eq!(report.orphans_ended, 0);
        assert_eq!(report.rotated, 1);
        assert_eq!(report.removed_logs, 0);
        assert_eq!(supervisor.live_count(), 0);
        assert_eq!(broker.connection_count(), 0);
    }
}
