use dashmap::DashMap;
use devwatch_protocol::{Session, SessionId, SessionStatus, now_ms};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DevwatchError, Result};

const REGISTRY_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    saved_at_ms: u64,
    sessions: Vec<Session>,
}

type SessionMap = DashMap<SessionId, Session>;

struct Disk {
    path: PathBuf,
    dirty: AtomicBool,
    /// A write-behind save is queued and has not taken its snapshot yet.
    queued: AtomicBool,
    write_lock: Mutex<()>,
}

impl Disk {
    fn save(&self, sessions: &SessionMap) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.queued.store(false, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            saved_at_ms: now_ms(),
            sessions: sorted(sessions),
        };
        let result = write_atomic(&self.path, &file);
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }
}

/// Durable store of session metadata.
///
/// Every mutation is applied in memory first and then written behind to a
/// single JSON file via write-then-rename. Writes run on the blocking pool and
/// mutations that land while one is queued share it. A failed write leaves
/// the registry dirty so the autosave loop retries it; the mutation itself
/// still succeeds.
pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
    disk: Option<Arc<Disk>>,
}

impl SessionRegistry {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            disk: path.map(|path| {
                Arc::new(Disk {
                    path,
                    dirty: AtomicBool::new(false),
                    queued: AtomicBool::new(false),
                    write_lock: Mutex::new(()),
                })
            }),
        }
    }

    /// In-memory registry that never touches disk.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.disk.as_ref().map(|disk| disk.path.as_path())
    }

    pub fn create(&self, session: Session) -> Result<Session> {
        if self.sessions.contains_key(&session.id) {
            return Err(DevwatchError::SessionAlreadyExists(session.id));
        }
        self.sessions.insert(session.id.clone(), session.clone());
        self.save_after_mutation();
        Ok(session)
    }

    /// Insert or replace a session record.
    pub fn put(&self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
        self.save_after_mutation();
    }

    /// Apply `mutate` to a stored session and return the updated copy.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let updated = {
            let mut entry = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| DevwatchError::SessionNotFound(id.to_string()))?;
            mutate(entry.value_mut());
            entry.value().clone()
        };
        self.save_after_mutation();
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<Session> {
        let (_, removed) = self
            .sessions
            .remove(id)
            .ok_or_else(|| DevwatchError::SessionNotFound(id.to_string()))?;
        self.save_after_mutation();
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<Session> {
        sorted(&self.sessions)
    }

    /// True while a change has not reached disk.
    pub fn is_dirty(&self) -> bool {
        self.disk
            .as_ref()
            .is_some_and(|disk| disk.dirty.load(Ordering::Acquire))
    }

    /// Load sessions from disk, reconciling any that claim to be live.
    ///
    /// No process is resurrected. A session recorded as Pending, Starting,
    /// Running or Stopping becomes Stopped unless its pid is still alive, in
    /// which case it is kept as a Running orphan.
    pub fn load_all(&self) -> Result<Vec<Session>> {
        let Some(path) = self.path() else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            debug!(path = %path.display(), "no registry file yet");
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(path)?;
        let file: RegistryFile = serde_json::from_str(&contents)
            .map_err(|e| DevwatchError::PersistenceFailure(format!("corrupt registry: {e}")))?;

        let now = now_ms();
        let mut reconciled = 0usize;
        let mut loaded = Vec::with_capacity(file.sessions.len());
        for mut session in file.sessions {
            if !session.status.is_terminal() {
                let alive = session.pid.is_some_and(pid_alive);
                if alive && session.status != SessionStatus::Pending {
                    session.status = SessionStatus::Running;
                } else {
                    session.status = SessionStatus::Stopped;
                    session.pid = None;
                    session.port = None;
                    session.ended_at_ms.get_or_insert(now);
                    reconciled += 1;
                }
            }
            self.sessions.insert(session.id.clone(), session.clone());
            loaded.push(session);
        }

        info!(
            path = %path.display(),
            sessions = loaded.len(),
            reconciled,
            "registry loaded"
        );
        if reconciled > 0 {
            self.save_after_mutation();
        }
        Ok(loaded)
    }

    /// Atomically rewrite the registry file with the current contents.
    /// Blocks on file I/O.
    pub fn persist_all(&self) -> Result<()> {
        match &self.disk {
            Some(disk) => disk.save(&self.sessions),
            None => Ok(()),
        }
    }

    /// [`persist_all`](Self::persist_all) on the blocking pool.
    pub async fn flush(&self) -> Result<()> {
        let Some(disk) = self.disk.clone() else {
            return Ok(());
        };
        let sessions = Arc::clone(&self.sessions);
        tokio::task::spawn_blocking(move || disk.save(&sessions))
            .await
            .map_err(|e| DevwatchError::PersistenceFailure(format!("registry save task: {e}")))?
    }

    /// Periodically save the registry while it has unsaved changes.
    pub fn spawn_autosave(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !registry.is_dirty() {
                    continue;
                }
                match registry.flush().await {
                    Ok(()) => debug!("registry autosaved"),
                    Err(e) => warn!(error = %e, "registry autosave failed; will retry"),
                }
            }
        })
    }

    /// Queue a write-behind save. Outside a runtime the save happens inline.
    fn save_after_mutation(&self) {
        let Some(disk) = self.disk.as_ref() else {
            return;
        };
        disk.dirty.store(true, Ordering::Release);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            if let Err(e) = disk.save(&self.sessions) {
                warn!(error = %e, "registry save failed; retrying on next autosave");
            }
            return;
        };
        if disk.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let disk = Arc::clone(disk);
        let sessions = Arc::clone(&self.sessions);
        runtime.spawn_blocking(move || {
            if let Err(e) = disk.save(&sessions) {
                warn!(error = %e, "registry save failed; retrying on next autosave");
            }
        });
    }
}

fn sorted(sessions: &SessionMap) -> Vec<Session> {
    let mut list: Vec<Session> = sessions.iter().map(|s| s.value().clone()).collect();
    list.sort_by(|a, b| {
        a.created_at_ms
            .cmp(&b.created_at_ms)
            .then_with(|| a.id.cmp(&b.id))
    });
    list
}

fn write_atomic(path: &Path, file: &RegistryFile) -> Result<()> {
    let persist_err = |e: std::io::Error| DevwatchError::PersistenceFailure(e.to_string());

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(persist_err)?;
    }
    let json = serde_json::to_vec_pretty(file)
        .map_err(|e| DevwatchError::PersistenceFailure(e.to_string()))?;

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut tmp = fs::File::create(&tmp_path).map_err(persist_err)?;
        tmp.write_all(&json).map_err(persist_err)?;
        tmp.sync_all().map_err(persist_err)?;
    }
    fs::rename(&tmp_path, path).map_err(persist_err)?;
    Ok(())
}

/// Signal 0 probes for existence without delivering anything.
pub(crate) fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill with signal 0 performs only permission and existence checks.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample(id: &str, status: SessionStatus, pid: Option<u32>) -> Session {
        Session {
            id: id.to_string(),
            name: id.to_string(),
            command: "serve".to_string(),
            working_dir: PathBuf::from("/tmp"),
            port: Some(4000),
            requested_port: Some(4000),
            environment: BTreeMap::new(),
            status,
            pid,
            created_at_ms: 1,
            started_at_ms: None,
            ended_at_ms: None,
            exit_code: None,
            restart_count: 0,
            restart_policy: Default::default(),
            framework: None,
        }
    }

    #[test]
    fn crud_cycle() {
        let registry = SessionRegistry::in_memory();
        registry
            .create(sample("web", SessionStatus::Pending, None))
            .unwrap();
        assert!(matches!(
            registry.create(sample("web", SessionStatus::Pending, None)),
            Err(DevwatchError::SessionAlreadyExists(_))
        ));

        let updated = registry
            .update("web", |s| s.status = SessionStatus::Running)
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Running);
        assert_eq!(registry.get("web").unwrap().status, SessionStatus::Running);
        assert_eq!(registry.list().len(), 1);

        registry.delete("web").unwrap();
        assert!(registry.get("web").is_none());
        assert!(matches!(
            registry.update("web", |_| {}),
            Err(DevwatchError::SessionNotFound(_))
        ));
    }

    #[test]
    fn persists_and_reloads_with_reconciliation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("sessions.json");

        let registry = SessionRegistry::new(Some(path.clone()));
        registry.put(sample("stale", SessionStatus::Running, Some(u32::MAX - 7)));
        registry.put(sample("self", SessionStatus::Running, Some(std::process::id())));
        registry.put(sample("done", SessionStatus::Failed, None));
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        assert!(!registry.is_dirty());

        let reloaded = SessionRegistry::new(Some(path));
        let sessions = reloaded.load_all().unwrap();
        assert_eq!(sessions.len(), 3);

        let stale = reloaded.get("stale").unwrap();
        assert_eq!(stale.status, SessionStatus::Stopped);
        assert!(stale.pid.is_none());
        assert!(stale.port.is_none());
        assert!(stale.ended_at_ms.is_some());

        assert_eq!(reloaded.get("self").unwrap().status, SessionStatus::Running);
        assert_eq!(reloaded.get("done").unwrap().status, SessionStatus::Failed);
    }

    #[test]
    fn failed_save_marks_dirty_but_keeps_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();

        let registry = SessionRegistry::new(Some(blocker.join("sessions.json")));
        registry.put(sample("web", SessionStatus::Pending, None));
        assert!(registry.get("web").is_some());
        assert!(registry.is_dirty());
        assert!(matches!(
            registry.persist_all(),
            Err(DevwatchError::PersistenceFailure(_))
        ));
    }

    #[tokio::test]
    async fn mutations_reach_disk_off_the_async_workers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let registry = SessionRegistry::new(Some(path.clone()));

        for i in 0..20 {
            registry.put(sample(&format!("s{i}"), SessionStatus::Pending, None));
        }
        registry.update("s0", |s| s.name = "renamed".to_string()).unwrap();

        for _ in 0..200 {
            if !registry.is_dirty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        registry.flush().await.unwrap();
        assert!(!registry.is_dirty());

        let reloaded = SessionRegistry::new(Some(path));
        assert_eq!(reloaded.load_all().unwrap().len(), 20);
        assert_eq!(reloaded.get("s0").unwrap().name, "renamed");
    }

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(Some(dir.path().join("sessions.json")));
        assert!(registry.load_all().unwrap().is_empty());
    }

    #[test]
    fn pid_probe_detects_current_process() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
    }
}
