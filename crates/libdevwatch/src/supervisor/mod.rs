//! Session lifecycle: spawn, readiness, exit handling, restart policy, stop.
//!
//! Every mutating operation on a session runs while holding that session's
//! slot lock, so start/stop/restart/exit handling for one id are serialized
//! while different ids proceed concurrently. Each launched process gets a
//! generation number; background tasks (ready timer, exit watcher, delayed
//! restart) only act if their generation is still current.

mod process;
pub mod ready;

use dashmap::DashMap;
use devwatch_protocol::stream::topic;
use devwatch_protocol::{
    LogLevel, LogStream, RestartPolicy, Session, SessionHandle, SessionId, SessionStatus,
    StartSessionRequest, StatusNotice, StreamEvent, now_ms,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::StreamingBroker;
use crate::config::SupervisorConfig;
use crate::error::{DevwatchError, Result};
use crate::logs::LogManager;
use crate::ports::PortAllocator;
use crate::registry::{SessionRegistry, pid_alive};

use process::ExitRecord;

const MAX_SESSION_ID_LEN: usize = 128;
const KILL_GRACE: Duration = Duration::from_secs(1);
const ORPHAN_POLL: Duration = Duration::from_millis(100);

struct RunningProcess {
    pid: u32,
    port: u16,
    generation: u64,
    /// Cancels output forwarding and the ready timer.
    cancel: CancellationToken,
    /// Cancels only the ready timer; output keeps draining after a natural exit.
    ready: CancellationToken,
    exit_rx: watch::Receiver<Option<ExitRecord>>,
}

#[derive(Default)]
struct SlotState {
    running: Option<RunningProcess>,
    restart_pending: bool,
    /// Set when the slot is dropped from the live map; holders must re-fetch.
    retired: bool,
}

struct SessionSlot {
    id: SessionId,
    generation: AtomicU64,
    state: Arc<Mutex<SlotState>>,
}

impl SessionSlot {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            generation: AtomicU64::new(0),
            state: Arc::new(Mutex::new(SlotState::default())),
        }
    }

    fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

type SlotGuard = OwnedMutexGuard<SlotState>;

pub struct Supervisor {
    config: SupervisorConfig,
    registry: Arc<SessionRegistry>,
    ports: Arc<PortAllocator>,
    logs: Arc<LogManager>,
    broker: Arc<StreamingBroker>,
    slots: DashMap<SessionId, Arc<SessionSlot>>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        registry: Arc<SessionRegistry>,
        ports: Arc<PortAllocator>,
        logs: Arc<LogManager>,
        broker: Arc<StreamingBroker>,
    ) -> Self {
        Self {
            config,
            registry,
            ports,
            logs,
            broker,
            slots: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Create (or replace) a session record and launch it.
    pub async fn start(self: &Arc<Self>, req: StartSessionRequest) -> Result<SessionHandle> {
        let id = self.resolve_id(req.id.as_deref())?;
        let (slot, mut state) = self.acquire(&id).await;
        self.ensure_not_live(&id, &state)?;
        let session = self.build_session(id, req)?;
        self.ensure_unique_signature(&session)?;
        self.registry.put(session);
        self.launch(&slot, &mut state)
    }

    /// Record a session as Pending without spawning it.
    pub async fn register(&self, req: StartSessionRequest) -> Result<Session> {
        let id = self.resolve_id(req.id.as_deref())?;
        let (_slot, state) = self.acquire(&id).await;
        self.ensure_not_live(&id, &state)?;
        let session = self.build_session(id, req)?;
        self.registry.put(session.clone());
        info!(session_id = %session.id, command = %session.command, "session registered");
        Ok(session)
    }

    /// Launch a previously registered (or finished) session from its stored
    /// configuration.
    pub async fn start_registered(self: &Arc<Self>, id: &str) -> Result<SessionHandle> {
        self.require(id)?;
        let (slot, mut state) = self.acquire(id).await;
        self.ensure_not_live(id, &state)?;
        self.registry.update(id, |s| s.restart_count = 0)?;
        self.launch(&slot, &mut state)
    }

    /// Stop a session. Stopping one that is already finished is a no-op.
    pub async fn stop(&self, id: &str, force: bool, timeout: Option<Duration>) -> Result<Session> {
        self.require(id)?;
        let (slot, mut state) = self.acquire(id).await;
        let timeout = timeout.unwrap_or_else(|| self.config.stop_timeout());
        self.stop_locked(&slot, &mut state, force, timeout).await
    }

    /// Stop, settle, then launch again with the same id and configuration.
    pub async fn restart(self: &Arc<Self>, id: &str) -> Result<SessionHandle> {
        let session = self.require(id)?;
        let (slot, mut state) = self.acquire(id).await;
        if state.running.is_none() && session.status.is_live() {
            return Err(DevwatchError::InvalidRequest(format!(
                "session {id} was adopted from a previous daemon and can only be stopped"
            )));
        }
        self.stop_locked(&slot, &mut state, false, self.config.stop_timeout())
            .await?;
        tokio::time::sleep(self.config.restart_settle()).await;
        self.registry.update(id, |s| s.restart_count = 0)?;
        self.launch(&slot, &mut state)
    }

    pub fn status(&self, id: &str) -> Result<Session> {
        self.require(id)
    }

    pub fn list(&self) -> Vec<Session> {
        self.registry.list()
    }

    /// Stop the session if needed and drop it from the live map. The registry
    /// keeps its record.
    pub async fn unregister(&self, id: &str) -> Result<Session> {
        self.require(id)?;
        let (slot, mut state) = self.acquire(id).await;
        let session = if state.running.is_some() || state.restart_pending {
            self.stop_locked(&slot, &mut state, false, self.config.stop_timeout())
                .await?
        } else {
            self.require(id)?
        };
        state.retired = true;
        self.slots.remove_if(id, |_, current| Arc::ptr_eq(current, &slot));
        info!(session_id = %id, "session unregistered");
        Ok(session)
    }

    /// Drop finished sessions older than `retention` from the live map.
    /// Slots that are busy are skipped until the next sweep.
    pub fn reap(&self, retention: Duration) -> Vec<SessionId> {
        let cutoff = now_ms().saturating_sub(retention.as_millis() as u64);
        let slots: Vec<Arc<SessionSlot>> = self.slots.iter().map(|e| Arc::clone(e.value())).collect();

        let mut reaped = Vec::new();
        for slot in slots {
            let Ok(mut state) = slot.state.try_lock() else {
                continue;
            };
            if state.running.is_some() || state.restart_pending {
                continue;
            }
            let expired = match self.registry.get(&slot.id) {
                Some(s) => s.status.is_terminal() && s.ended_at_ms.is_some_and(|t| t <= cutoff),
                None => true,
            };
            if !expired {
                continue;
            }
            state.retired = true;
            self.slots.remove_if(&slot.id, |_, current| Arc::ptr_eq(current, &slot));
            reaped.push(slot.id.clone());
        }
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "reaped finished sessions");
        }
        reaped
    }

    /// Number of sessions in the live map.
    pub fn live_count(&self) -> usize {
        self.slots.len()
    }

    /// Stop every session that has a process or a scheduled restart.
    pub async fn shutdown(self: &Arc<Self>) -> usize {
        let ids: Vec<SessionId> = self.slots.iter().map(|e| e.key().clone()).collect();
        let mut tasks = JoinSet::new();
        for id in ids {
            let supervisor = Arc::clone(self);
            tasks.spawn(async move {
                let (slot, mut state) = supervisor.acquire(&id).await;
                if state.running.is_none() && !state.restart_pending {
                    return false;
                }
                let timeout = supervisor.config.stop_timeout();
                match supervisor.stop_locked(&slot, &mut state, false, timeout).await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(session_id = %id, error = %e, "stop during shutdown failed");
                        false
                    }
                }
            });
        }

        let mut stopped = 0;
        while let Some(joined) = tasks.join_next().await {
            if matches!(joined, Ok(true)) {
                stopped += 1;
            }
        }
        info!(stopped, "supervisor shut down");
        stopped
    }

    /// Re-reserve the ports of orphaned processes found alive on registry
    /// reload, so new sessions are not handed a port that is still bound.
    pub fn recover(&self) -> usize {
        let mut adopted = 0;
        for session in self.registry.list() {
            if session.status != SessionStatus::Running {
                continue;
            }
            adopted += 1;
            if let Some(port) = session.port
                && !self.ports.reserve_existing(port, &session.id)
            {
                warn!(session_id = %session.id, port, "orphan port already reserved");
            }
            info!(session_id = %session.id, pid = ?session.pid, "adopted orphaned session");
        }
        adopted
    }

    /// Mark adopted sessions whose process has exited on its own as stopped
    /// and release their ports. Busy slots are left for the next sweep.
    pub fn reconcile_orphans(&self) -> Vec<SessionId> {
        let mut ended = Vec::new();
        for session in self.registry.list() {
            let Some(pid) = session.pid.filter(|_| session.status.is_live()) else {
                continue;
            };
            let slot = Arc::clone(
                self.slots
                    .entry(session.id.clone())
                    .or_insert_with(|| Arc::new(SessionSlot::new(&session.id)))
                    .value(),
            );
            let Ok(state) = slot.state.try_lock() else {
                continue;
            };
            if state.retired || state.running.is_some() || pid_alive(pid) {
                continue;
            }

            let id = session.id.as_str();
            if let Some(port) = session.port
                && self.ports.holder(port).as_deref() == Some(id)
            {
                self.ports.release(port);
            }
            self.logs
                .system(id, LogLevel::Warn, format!("adopted pid {pid} exited outside devwatch"));
            match self.transition(id, SessionStatus::Stopped, |s| {
                s.pid = None;
                s.port = None;
                s.ended_at_ms = Some(now_ms());
            }) {
                Ok(_) => ended.push(session.id.clone()),
                Err(e) => warn!(session_id = %id, error = %e, "failed to record orphan exit"),
            }
        }
        ended
    }

    fn require(&self, id: &str) -> Result<Session> {
        self.registry
            .get(id)
            .ok_or_else(|| DevwatchError::SessionNotFound(id.to_string()))
    }

    async fn acquire(&self, id: &str) -> (Arc<SessionSlot>, SlotGuard) {
        loop {
            let slot = Arc::clone(
                self.slots
                    .entry(id.to_string())
                    .or_insert_with(|| Arc::new(SessionSlot::new(id)))
                    .value(),
            );
            let guard = Arc::clone(&slot.state).lock_owned().await;
            if !guard.retired {
                return (slot, guard);
            }
        }
    }

    fn resolve_id(&self, requested: Option<&str>) -> Result<SessionId> {
        let Some(id) = requested else {
            return Ok(Uuid::new_v4().to_string());
        };
        let valid = !id.is_empty()
            && id.len() <= MAX_SESSION_ID_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(id.to_string())
        } else {
            Err(DevwatchError::InvalidRequest(format!(
                "session id must be 1-{MAX_SESSION_ID_LEN} characters of [A-Za-z0-9_-]: {id:?}"
            )))
        }
    }

    fn ensure_not_live(&self, id: &str, state: &SlotState) -> Result<()> {
        let live = state.running.is_some()
            || state.restart_pending
            || self.registry.get(id).is_some_and(|s| s.status.is_live());
        if live {
            Err(DevwatchError::SessionAlreadyExists(id.to_string()))
        } else {
            Ok(())
        }
    }

    fn ensure_unique_signature(&self, session: &Session) -> Result<()> {
        let clash = self.registry.list().into_iter().find(|other| {
            other.id != session.id
                && other.status.is_live()
                && other.command == session.command
                && other.working_dir == session.working_dir
        });
        match clash {
            Some(other) => Err(DevwatchError::SessionAlreadyExists(other.id)),
            None => Ok(()),
        }
    }

    fn build_session(&self, id: SessionId, req: StartSessionRequest) -> Result<Session> {
        if req.command.trim().is_empty() {
            return Err(DevwatchError::InvalidRequest("command is empty".to_string()));
        }
        let working_dir = match req.cwd {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        let restart_policy = req.restart_policy.unwrap_or(RestartPolicy {
            enabled: self.config.auto_restart,
            max_restarts: self.config.max_restarts,
            delay_ms: self.config.restart_delay_ms,
        });
        let name = if req.name.is_empty() { id.clone() } else { req.name };
        Ok(Session {
            id,
            name,
            command: req.command,
            working_dir,
            port: None,
            requested_port: req.port,
            environment: req.env,
            status: SessionStatus::Pending,
            pid: None,
            created_at_ms: now_ms(),
            started_at_ms: None,
            ended_at_ms: None,
            exit_code: None,
            restart_count: 0,
            restart_policy,
            framework: req.framework,
        })
    }

    /// Apply a status change to the registry and announce it.
    fn transition<F>(&self, id: &str, to: SessionStatus, mutate: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut from = to;
        let session = self.registry.update(id, |s| {
            from = s.status;
            s.status = to;
            mutate(s);
        })?;
        info!(
            session_id = %id,
            from = %from,
            to = %to,
            pid = ?session.pid,
            port = ?session.port,
            "session transition"
        );
        self.announce(
            id,
            StatusNotice::Transition {
                session_id: id.to_string(),
                from,
                to,
                pid: session.pid,
                port: session.port,
            },
        );
        Ok(session)
    }

    fn announce(&self, id: &str, notice: StatusNotice) {
        let event = StreamEvent::Status(notice);
        self.broker.publish(&topic::session(id), event.clone());
        self.broker.publish(topic::SESSIONS, event);
    }

    fn fail(&self, id: &str, reason: &str) {
        self.logs.system(id, LogLevel::Error, reason);
        if let Err(e) = self.transition(id, SessionStatus::Failed, |s| {
            s.pid = None;
            s.port = None;
            s.ended_at_ms = Some(now_ms());
        }) {
            warn!(session_id = %id, error = %e, "failed to record session failure");
        }
    }

    /// Allocate a port, spawn the process and start its background tasks.
    /// Caller holds the slot lock.
    fn launch(self: &Arc<Self>, slot: &Arc<SessionSlot>, state: &mut SlotState) -> Result<SessionHandle> {
        let id = slot.id.as_str();
        let session = self.require(id)?;

        let port = match self.ports.allocate(id, session.requested_port) {
            Ok(port) => port,
            Err(e) => {
                self.fail(id, &e.to_string());
                return Err(e);
            }
        };
        let spawned = match process::spawn(&self.config, &session, port) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.ports.release(port);
                self.fail(id, &e.to_string());
                return Err(e);
            }
        };

        let pid = spawned.pid;
        let generation = slot.bump();
        let cancel = CancellationToken::new();
        let ready = cancel.child_token();
        let (exit_tx, exit_rx) = watch::channel(None);

        let session = self.transition(id, SessionStatus::Starting, |s| {
            s.pid = Some(pid);
            s.port = Some(port);
            s.started_at_ms = Some(now_ms());
            s.ended_at_ms = None;
            s.exit_code = None;
        })?;
        self.logs.system(
            id,
            LogLevel::Info,
            format!("started pid {pid} on port {port}: {}", session.command),
        );

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let max_line = self.config.max_line_bytes;
        process::forward_lines(spawned.stdout, LogStream::Stdout, max_line, line_tx.clone());
        process::forward_lines(spawned.stderr, LogStream::Stderr, max_line, line_tx);
        let framework = session
            .framework
            .as_deref()
            .or_else(|| ready::detect_framework(&session.command));
        let matcher = ready::matcher_for(framework);
        self.spawn_pump(slot, generation, cancel.clone(), line_rx, matcher);
        self.spawn_ready_timer(slot, generation, ready.clone());

        let supervisor = Arc::clone(self);
        let watched = Arc::clone(slot);
        let mut child = spawned.child;
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitRecord::from(status),
                Err(e) => {
                    warn!(session_id = %watched.id, error = %e, "waiting on child failed");
                    ExitRecord {
                        code: None,
                        signal: None,
                    }
                }
            };
            let _ = exit_tx.send(Some(exit));
            supervisor.on_exit(&watched, generation, exit).await;
        });

        state.running = Some(RunningProcess {
            pid,
            port,
            generation,
            cancel,
            ready,
            exit_rx,
        });
        state.restart_pending = false;

        Ok(SessionHandle {
            session_id: session.id,
            port: Some(port),
            pid: Some(pid),
            status: session.status,
        })
    }

    fn spawn_pump(
        self: &Arc<Self>,
        slot: &Arc<SessionSlot>,
        generation: u64,
        cancel: CancellationToken,
        mut lines: mpsc::UnboundedReceiver<(LogStream, String)>,
        matcher: Arc<dyn ready::ReadyMatcher>,
    ) {
        let supervisor = Arc::clone(self);
        let slot = Arc::clone(slot);
        tokio::spawn(async move {
            let mut seen_ready = false;
            loop {
                let (stream, line) = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = lines.recv() => match next {
                        Some(line) => line,
                        None => break,
                    },
                };
                supervisor.logs.record(&slot.id, stream, line.as_str());
                if !seen_ready && matcher.is_ready(&ready::normalize_line(&line)) {
                    seen_ready = true;
                    debug!(session_id = %slot.id, matcher = matcher.name(), "ready line seen");
                    supervisor.promote(&slot, generation).await;
                }
            }
        });
    }

    fn spawn_ready_timer(self: &Arc<Self>, slot: &Arc<SessionSlot>, generation: u64, cancel: CancellationToken) {
        let supervisor = Arc::clone(self);
        let slot = Arc::clone(slot);
        let grace = self.config.ready_timeout();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(grace) => supervisor.promote(&slot, generation).await,
            }
        });
    }

    /// Starting -> Running for the process of `generation`, if it is still
    /// the current one and has not exited.
    async fn promote(&self, slot: &SessionSlot, generation: u64) {
        let state = slot.state.lock().await;
        let current = state
            .running
            .as_ref()
            .is_some_and(|r| r.generation == generation && r.exit_rx.borrow().is_none());
        if !current || state.retired {
            return;
        }
        let starting = self
            .registry
            .get(&slot.id)
            .is_some_and(|s| s.status == SessionStatus::Starting);
        if !starting {
            return;
        }
        if let Err(e) = self.transition(&slot.id, SessionStatus::Running, |_| {}) {
            warn!(session_id = %slot.id, error = %e, "promotion failed");
        }
    }

    async fn on_exit(self: &Arc<Self>, slot: &Arc<SessionSlot>, generation: u64, exit: ExitRecord) {
        let mut state = slot.state.lock().await;
        if !state.running.as_ref().is_some_and(|r| r.generation == generation) {
            // A stop already claimed this process.
            return;
        }
        let Some(running) = state.running.take() else {
            return;
        };
        running.ready.cancel();
        self.ports.release(running.port);

        let id = slot.id.as_str();
        let level = if exit.success() { LogLevel::Info } else { LogLevel::Error };
        self.logs.system(id, level, format!("process exited with {exit}"));
        let Some(session) = self.registry.get(id) else {
            return;
        };
        let ended = |s: &mut Session| {
            s.pid = None;
            s.port = None;
            s.exit_code = exit.exit_code();
            s.ended_at_ms = Some(now_ms());
        };

        if exit.success() {
            if let Err(e) = self.transition(id, SessionStatus::Stopped, ended) {
                warn!(session_id = %id, error = %e, "failed to record exit");
            }
            return;
        }

        let policy = session.restart_policy;
        if !policy.enabled || session.restart_count >= policy.max_restarts {
            warn!(
                session_id = %id,
                restarts = session.restart_count,
                %exit,
                "session failed"
            );
            if let Err(e) = self.transition(id, SessionStatus::Failed, ended) {
                warn!(session_id = %id, error = %e, "failed to record exit");
            }
            return;
        }

        let attempt = session.restart_count + 1;
        let recorded = self.transition(id, SessionStatus::Pending, |s| {
            ended(s);
            s.restart_count = attempt;
        });
        if let Err(e) = recorded {
            warn!(session_id = %id, error = %e, "failed to schedule restart");
            return;
        }
        self.announce(
            id,
            StatusNotice::Restarting {
                session_id: id.to_string(),
                attempt,
                delay_ms: policy.delay_ms,
            },
        );
        self.logs.system(
            id,
            LogLevel::Warn,
            format!(
                "restarting in {}ms (attempt {attempt}/{})",
                policy.delay_ms, policy.max_restarts
            ),
        );

        state.restart_pending = true;
        let scheduled = slot.bump();
        let supervisor = Arc::clone(self);
        let slot = Arc::clone(slot);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(policy.delay_ms)).await;
            supervisor.restart_after_exit(&slot, scheduled).await;
        });
    }

    async fn restart_after_exit(self: &Arc<Self>, slot: &Arc<SessionSlot>, scheduled: u64) {
        let mut state = Arc::clone(&slot.state).lock_owned().await;
        if state.retired || !state.restart_pending || !slot.is_current(scheduled) {
            debug!(session_id = %slot.id, "scheduled restart superseded");
            return;
        }
        state.restart_pending = false;
        if let Err(e) = self.launch(slot, &mut state) {
            warn!(session_id = %slot.id, error = %e, "automatic restart failed");
        }
    }

    async fn stop_locked(
        &self,
        slot: &SessionSlot,
        state: &mut SlotState,
        force: bool,
        timeout: Duration,
    ) -> Result<Session> {
        slot.bump();
        let was_pending = std::mem::take(&mut state.restart_pending);
        let id = slot.id.as_str();
        let session = self.require(id)?;

        let Some(running) = state.running.take() else {
            if let Some(pid) = session.pid.filter(|_| session.status.is_live()) {
                return self.stop_orphan(&session, pid, force, timeout).await;
            }
            if session.status.is_terminal() {
                return Ok(session);
            }
            if was_pending {
                self.logs.system(id, LogLevel::Info, "scheduled restart cancelled");
            }
            return self.transition(id, SessionStatus::Stopped, |s| {
                s.ended_at_ms = Some(now_ms());
            });
        };

        running.cancel.cancel();
        self.transition(id, SessionStatus::Stopping, |_| {})?;

        let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
        if let Err(e) = process::signal_group(running.pid, signal) {
            warn!(session_id = %id, pid = running.pid, error = %e, "signal failed");
        }
        let mut exit_rx = running.exit_rx;
        let mut exit = wait_exit(&mut exit_rx, timeout).await;
        if exit.is_none() {
            warn!(session_id = %id, pid = running.pid, "graceful stop timed out, killing");
            if let Err(e) = process::signal_group(running.pid, libc::SIGKILL) {
                warn!(session_id = %id, pid = running.pid, error = %e, "kill failed");
            }
            exit = wait_exit(&mut exit_rx, KILL_GRACE).await;
        }

        self.ports.release(running.port);
        let message = match exit {
            Some(exit) => format!("stopped ({exit})"),
            None => "stopped; process did not confirm exit".to_string(),
        };
        self.logs.system(id, LogLevel::Info, message);
        self.transition(id, SessionStatus::Stopped, |s| {
            s.pid = None;
            s.port = None;
            s.exit_code = exit.and_then(|e| e.exit_code());
            s.ended_at_ms = Some(now_ms());
        })
    }

    /// Best-effort stop of a process adopted from a reloaded registry.
    async fn stop_orphan(&self, session: &Session, pid: u32, force: bool, timeout: Duration) -> Result<Session> {
        let id = session.id.as_str();
        self.transition(id, SessionStatus::Stopping, |_| {})?;
        let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
        if let Err(e) = process::signal_group(pid, signal) {
            warn!(session_id = %id, pid, error = %e, "signal to orphan failed");
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while pid_alive(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(ORPHAN_POLL).await;
        }
        if pid_alive(pid)
            && let Err(e) = process::signal_group(pid, libc::SIGKILL)
        {
            warn!(session_id = %id, pid, error = %e, "kill of orphan failed");
        }

        if let Some(port) = session.port
            && self.ports.holder(port).as_deref() == Some(id)
        {
            self.ports.release(port);
        }
        self.logs.system(id, LogLevel::Info, format!("stopped adopted pid {pid}"));
        self.transition(id, SessionStatus::Stopped, |s| {
            s.pid = None;
            s.port = None;
            s.ended_at_ms = Some(now_ms());
        })
    }
}

async fn wait_exit(rx: &mut watch::Receiver<Option<ExitRecord>>, limit: Duration) -> Option<ExitRecord> {
    match tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await {
        Ok(Ok(seen)) => *seen,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Transport;
    use crate::config::{BrokerConfig, LogConfig, PortConfig};
    use devwatch_protocol::LogQuery;
    use std::net::TcpListener;

    struct Harness {
        supervisor: Arc<Supervisor>,
        broker: Arc<StreamingBroker>,
        logs: Arc<LogManager>,
        _dir: tempfile::TempDir,
    }

    fn free_ports(len: u16) -> PortConfig {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let base = listener.local_addr().unwrap().port();
        drop(listener);
        let start = if base > u16::MAX - len { base - len } else { base };
        PortConfig {
            range_start: start,
            range_end: start + len - 1,
            probe_host: "127.0.0.1".to_string(),
        }
    }

    fn harness(config: SupervisorConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(StreamingBroker::new(BrokerConfig::default()));
        let logs = Arc::new(LogManager::new(
            LogConfig::default(),
            dir.path(),
            Arc::clone(&broker),
        ));
        let supervisor = Arc::new(Supervisor::new(
            config,
            Arc::new(SessionRegistry::in_memory()),
            Arc::new(PortAllocator::new(free_ports(16))),
            Arc::clone(&logs),
            Arc::clone(&broker),
        ));
        Harness {
            supervisor,
            broker,
            logs,
            _dir: dir,
        }
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            ready_timeout_ms: 30_000,
            stop_timeout_ms: 2_000,
            restart_settle_ms: 10,
            restart_delay_ms: 20,
            ..SupervisorConfig::default()
        }
    }

    fn request(id: &str, command: &str) -> StartSessionRequest {
        StartSessionRequest {
            id: Some(id.to_string()),
            name: id.to_string(),
            command: command.to_string(),
            cwd: Some(std::env::temp_dir()),
            ..StartSessionRequest::default()
        }
    }

    async fn wait_for(supervisor: &Supervisor, id: &str, status: SessionStatus) -> Session {
        for _ in 0..500 {
            let session = supervisor.status(id).unwrap();
            if session.status == status {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "session {id} never reached {status}; last {:?}",
            supervisor.status(id).unwrap().status
        );
    }

    #[tokio::test]
    async fn ready_line_promotes_and_stop_releases_port() {
        let h = harness(fast_config());
        let handle = h
            .supervisor
            .start(request("web", "echo \"Server listening on port $PORT\"; sleep 30"))
            .await
            .unwrap();
        assert_eq!(handle.status, SessionStatus::Starting);
        let port = handle.port.unwrap();
        assert!(h.supervisor.ports().is_held(port));

        wait_for(&h.supervisor, "web", SessionStatus::Running).await;
        let lines = h.logs.read("web", &LogQuery::default()).unwrap();
        assert!(
            lines
                .iter()
                .any(|e| e.message == format!("Server listening on port {port}"))
        );

        let stopped = h.supervisor.stop("web", false, None).await.unwrap();
        assert_eq!(stopped.status, SessionStatus::Stopped);
        assert!(stopped.pid.is_none());
        assert!(stopped.port.is_none());
        assert!(!h.supervisor.ports().is_held(port));
    }

    #[tokio::test]
    async fn grace_timeout_promotes_silent_process() {
        let h = harness(SupervisorConfig {
            ready_timeout_ms: 50,
            ..fast_config()
        });
        h.supervisor.start(request("quiet", "sleep 30")).await.unwrap();
        wait_for(&h.supervisor, "quiet", SessionStatus::Running).await;
        h.supervisor.stop("quiet", true, None).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected_and_leaves_first_untouched() {
        let h = harness(fast_config());
        let first = h.supervisor.start(request("web", "sleep 30")).await.unwrap();

        let err = h
            .supervisor
            .start(request("web", "sleep 31"))
            .await
            .unwrap_err();
        assert!(matches!(err, DevwatchError::SessionAlreadyExists(ref id) if id == "web"));

        let err = h
            .supervisor
            .start(request("web-copy", "sleep 30"))
            .await
            .unwrap_err();
        assert!(matches!(err, DevwatchError::SessionAlreadyExists(ref id) if id == "web"));

        let session = h.supervisor.status("web").unwrap();
        assert_eq!(session.pid, first.pid);
        assert_eq!(session.command, "sleep 30");
        assert!(h.supervisor.ports().is_held(first.port.unwrap()));
        h.supervisor.stop("web", false, None).await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let h = harness(fast_config());
        h.supervisor.start(request("web", "sleep 30")).await.unwrap();
        let first = h.supervisor.stop("web", false, None).await.unwrap();
        let second = h.supervisor.stop("web", false, None).await.unwrap();
        assert_eq!(second.status, SessionStatus::Stopped);
        assert_eq!(first.ended_at_ms, second.ended_at_ms);

        assert!(matches!(
            h.supervisor.stop("nope", false, None).await,
            Err(DevwatchError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn repeated_failures_exhaust_restart_budget() {
        let h = harness(fast_config());
        let (transport, mut rx) = Transport::channel(256);
        h.broker.subscribe(&topic::session("flaky"), transport);

        let mut req = request("flaky", "echo boom >&2; exit 1");
        req.restart_policy = Some(RestartPolicy {
            enabled: true,
            max_restarts: 3,
            delay_ms: 20,
        });
        h.supervisor.start(req).await.unwrap();

        let failed = wait_for(&h.supervisor, "flaky", SessionStatus::Failed).await;
        assert_eq!(failed.restart_count, 3);
        assert_eq!(failed.exit_code, Some(1));
        assert!(failed.port.is_none());
        assert!(h.supervisor.ports().held_ports().is_empty());

        let mut attempts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::Status(StatusNotice::Restarting { attempt, .. }) = event {
                attempts.push(attempt);
            }
        }
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn clean_exit_is_not_restarted() {
        let h = harness(fast_config());
        h.supervisor.start(request("once", "echo done")).await.unwrap();
        let stopped = wait_for(&h.supervisor, "once", SessionStatus::Stopped).await;
        assert_eq!(stopped.restart_count, 0);
        assert_eq!(stopped.exit_code, Some(0));
    }

    #[tokio::test]
    async fn stop_cancels_scheduled_restart() {
        let h = harness(fast_config());
        let mut req = request("flaky", "exit 2");
        req.restart_policy = Some(RestartPolicy {
            enabled: true,
            max_restarts: 3,
            delay_ms: 500,
        });
        h.supervisor.start(req).await.unwrap();
        wait_for(&h.supervisor, "flaky", SessionStatus::Pending).await;

        h.supervisor.stop("flaky", false, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
        let session = h.supervisor.status("flaky").unwrap();
        assert_eq!(session.status, SessionStatus::Stopped);
        assert_eq!(session.restart_count, 1);
    }

    #[tokio::test]
    async fn restart_keeps_id_and_resets_count() {
        let h = harness(fast_config());
        let first = h.supervisor.start(request("web", "sleep 30")).await.unwrap();
        let second = h.supervisor.restart("web").await.unwrap();
        assert_eq!(second.session_id, "web");
        assert_ne!(second.pid, first.pid);
        assert_eq!(second.status, SessionStatus::Starting);
        h.supervisor.stop("web", false, None).await.unwrap();
    }

    #[tokio::test]
    async fn register_then_start_registered() {
        let h = harness(fast_config());
        let session = h.supervisor.register(request("api", "sleep 30")).await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert!(session.pid.is_none());

        let handle = h.supervisor.start_registered("api").await.unwrap();
        assert!(handle.pid.is_some());
        assert!(matches!(
            h.supervisor.start_registered("api").await,
            Err(DevwatchError::SessionAlreadyExists(_))
        ));

        let removed = h.supervisor.unregister("api").await.unwrap();
        assert_eq!(removed.status, SessionStatus::Stopped);
        assert_eq!(h.supervisor.live_count(), 0);
        assert!(h.supervisor.registry().contains("api"));
    }

    #[tokio::test]
    async fn spawn_failure_marks_failed_and_frees_port() {
        let h = harness(fast_config());
        let mut req = request("broken", "true");
        req.cwd = Some("/definitely/not/here".into());
        let err = h.supervisor.start(req).await.unwrap_err();
        assert!(matches!(err, DevwatchError::ProcessStartFailed(_)));
        assert_eq!(h.supervisor.status("broken").unwrap().status, SessionStatus::Failed);
        assert!(h.supervisor.ports().held_ports().is_empty());
    }

    #[tokio::test]
    async fn invalid_ids_and_empty_commands_are_rejected() {
        let h = harness(fast_config());
        assert!(matches!(
            h.supervisor.start(request("../etc", "true")).await,
            Err(DevwatchError::InvalidRequest(_))
        ));
        assert!(matches!(
            h.supervisor.start(request("ok", "   ")).await,
            Err(DevwatchError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn reap_drops_finished_sessions() {
        let h = harness(fast_config());
        h.supervisor.start(request("once", "true")).await.unwrap();
        wait_for(&h.supervisor, "once", SessionStatus::Stopped).await;
        assert!(h.supervisor.reap(Duration::from_secs(3600)).is_empty());
        assert_eq!(h.supervisor.reap(Duration::ZERO), vec!["once".to_string()]);
        assert_eq!(h.supervisor.live_count(), 0);
        assert!(h.supervisor.status("once").is_ok());
    }

    #[tokio::test]
    async fn exited_orphan_is_stopped_and_frees_its_port() {
        let h = harness(fast_config());
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        let live_pid = std::process::id();

        for (id, pid, port) in [("gone", dead_pid, 46_123), ("alive", live_pid, 46_124)] {
            h.supervisor
                .register(request(id, &format!("serve {id}")))
                .await
                .unwrap();
            h.supervisor
                .registry()
                .update(id, |s| {
                    s.status = SessionStatus::Running;
                    s.pid = Some(pid);
                    s.port = Some(port);
                })
                .unwrap();
        }
        assert_eq!(h.supervisor.recover(), 2);
        assert!(h.supervisor.ports().is_held(46_123));

        let (transport, mut rx) = Transport::channel(16);
        h.broker.subscribe(topic::SESSIONS, transport);

        assert_eq!(h.supervisor.reconcile_orphans(), vec!["gone".to_string()]);
        let gone = h.supervisor.status("gone").unwrap();
        assert_eq!(gone.status, SessionStatus::Stopped);
        assert_eq!(gone.pid, None);
        assert!(!h.supervisor.ports().is_held(46_123));
        assert_eq!(
            h.supervisor.status("alive").unwrap().status,
            SessionStatus::Running
        );
        assert!(h.supervisor.ports().is_held(46_124));

        let mut announced = false;
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::Status(StatusNotice::Transition { session_id, to, .. }) = event {
                announced |= session_id == "gone" && to == SessionStatus::Stopped;
            }
        }
        assert!(announced);
        assert!(h.supervisor.reconcile_orphans().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let h = harness(fast_config());
        h.supervisor.start(request("a", "sleep 30")).await.unwrap();
        h.supervisor.start(request("b", "sleep 31")).await.unwrap();
        assert_eq!(h.supervisor.shutdown().await, 2);
        for id in ["a", "b"] {
            assert_eq!(h.supervisor.status(id).unwrap().status, SessionStatus::Stopped);
        }
        assert!(h.supervisor.ports().held_ports().is_empty());
    }
}
