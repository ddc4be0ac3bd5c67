//! Per-session log capture.
//!
//! Every entry lands in two places: a bounded in-memory tail used for fast
//! recent reads, and an append-only JSON-lines file that holds the full
//! retained history. Reads that reach past the tail stream the files line by
//! line and stop as soon as the page is full.

mod export;
mod file;

use dashmap::DashMap;
use devwatch_protocol::stream::topic;
use devwatch_protocol::{
    ExportFormat, LogEntry, LogFilter, LogLevel, LogQuery, LogStream, SessionId, StatusNotice,
    StreamEvent, now_ms,
};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::StreamingBroker;
use crate::config::LogConfig;
use crate::error::Result;
use crate::ring::RingBuffer;

pub use export::export_entries;
use file::{LogFile, LogFileName};

/// Options for a full-text search.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub session_id: Option<SessionId>,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
    pub limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            session_id: None,
            start_ms: None,
            end_ms: None,
            limit: 100,
        }
    }
}

struct SessionLog {
    tail: RingBuffer<LogEntry>,
    next_seq: u64,
    /// The tail still holds every entry this session ever wrote.
    complete: bool,
    file: Option<LogFile>,
}

pub struct LogManager {
    config: LogConfig,
    dir: PathBuf,
    broker: Arc<StreamingBroker>,
    sessions: DashMap<SessionId, SessionLog>,
}

impl LogManager {
    pub fn new(config: LogConfig, dir: impl Into<PathBuf>, broker: Arc<StreamingBroker>) -> Self {
        Self {
            config,
            dir: dir.into(),
            broker,
            sessions: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append an entry, assigning its sequence number, and publish it on the
    /// session's topic. File errors are logged; the entry is kept in memory.
    pub fn write(&self, mut entry: LogEntry) -> LogEntry {
        let session_id = entry.session_id.clone();
        let mut log = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| self.open_session(&session_id));

        entry.seq = log.next_seq;
        log.next_seq += 1;

        if log.file.is_none() {
            log.file = LogFile::open(&file::active_path(&self.dir, &session_id)).ok();
        }
        if let Some(log_file) = log.file.as_mut()
            && let Err(e) = log_file.append(&entry)
        {
            warn!(session_id = %session_id, error = %e, "log append failed");
            log.file = None;
        }
        if log.tail.push(entry.clone()).is_some() {
            log.complete = false;
        }

        // Published under the session entry so subscribers see seq order.
        self.broker
            .publish(&topic::session(&session_id), StreamEvent::Log(entry.clone()));
        entry
    }

    /// Capture one line of process output, inferring its level.
    pub fn record(&self, session_id: &str, stream: LogStream, message: impl Into<String>) -> LogEntry {
        let message = message.into();
        let level = infer_level(stream, &message);
        self.write(LogEntry {
            session_id: session_id.to_string(),
            seq: 0,
            timestamp_ms: now_ms(),
            stream,
            level,
            message,
        })
    }

    /// Supervisor notice on the `system` stream.
    pub fn system(&self, session_id: &str, level: LogLevel, message: impl Into<String>) -> LogEntry {
        self.write(LogEntry {
            session_id: session_id.to_string(),
            seq: 0,
            timestamp_ms: now_ms(),
            stream: LogStream::System,
            level,
            message: message.into(),
        })
    }

    /// Paged, filtered read.
    ///
    /// With neither `offset` nor `since_ms` the newest `limit` matching entries
    /// are returned. Otherwise entries are counted forward from the oldest
    /// retained one; the in-memory tail answers when it covers the request and
    /// the files are scanned when it does not.
    pub fn read(&self, session_id: &str, query: &LogQuery) -> Result<Vec<LogEntry>> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let matcher = EntryMatcher::new(&query.filter, query.since_ms);
        let mut page = match self.read_tail(session_id, query, &matcher) {
            Some(page) => page,
            None => self.read_files(session_id, query, &matcher)?,
        };
        if query.reverse {
            page.reverse();
        }
        Ok(page)
    }

    /// Case-insensitive substring search over message and metadata.
    pub fn search(&self, needle: &str, opts: &SearchOptions) -> Result<Vec<LogEntry>> {
        let needle = needle.to_lowercase();
        let sessions = match &opts.session_id {
            Some(id) => vec![id.clone()],
            None => self.known_sessions()?,
        };

        let mut hits = Vec::new();
        for session_id in sessions {
            if hits.len() >= opts.limit {
                break;
            }
            file::scan_session(&self.dir, &session_id, |entry| {
                let in_range = opts.start_ms.is_none_or(|start| entry.timestamp_ms >= start)
                    && opts.end_ms.is_none_or(|end| entry.timestamp_ms <= end);
                if in_range && search_haystack(&entry).contains(&needle) {
                    hits.push(entry);
                    if hits.len() >= opts.limit {
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            })?;
        }
        hits.sort_by(|a, b| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then_with(|| a.session_id.cmp(&b.session_id))
                .then_with(|| a.seq.cmp(&b.seq))
        });
        Ok(hits)
    }

    /// In-memory tail, oldest first. Used to replay backlog to new subscribers.
    pub fn tail(&self, session_id: &str) -> Vec<LogEntry> {
        self.sessions
            .get(session_id)
            .map(|log| log.tail.to_vec())
            .unwrap_or_default()
    }

    pub fn export(&self, session_id: &str, format: ExportFormat, query: &LogQuery) -> Result<String> {
        export_entries(&self.read(session_id, query)?, format)
    }

    /// Drop a session's tail and every file it owns. Sequence numbers keep
    /// counting from where they were, so consumers never see one reused.
    pub fn delete(&self, session_id: &str) -> Result<usize> {
        let mut log = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionLog {
                tail: RingBuffer::new(self.config.buffer_capacity),
                next_seq: self.last_seq_on_disk(session_id).map_or(1, |seq| seq + 1),
                complete: true,
                file: None,
            });
        log.tail.clear();
        log.file = None;
        log.complete = true;

        let mut removed = 0;
        for path in file::session_files(&self.dir, session_id)? {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        drop(log);
        self.broker.publish(
            &topic::session(session_id),
            StreamEvent::Status(StatusNotice::LogsCleared {
                session_id: session_id.to_string(),
            }),
        );
        info!(session_id, files = removed, "logs deleted");
        Ok(removed)
    }

    /// Rotate every active file at or over the size threshold. Failures are
    /// logged and left for the next sweep.
    pub fn rotate(&self) -> Vec<PathBuf> {
        let listing = match file::list_dir(&self.dir) {
            Ok(listing) => listing,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "log directory unreadable");
                return Vec::new();
            }
        };

        let mut rotated = Vec::new();
        for (path, name) in listing {
            let LogFileName::Active { session_id } = name else {
                continue;
            };
            let tracked = self
                .sessions
                .get(&session_id)
                .and_then(|log| log.file.as_ref().map(LogFile::size));
            let size = tracked.unwrap_or_else(|| fs::metadata(&path).map_or(0, |m| m.len()));
            if size < self.config.rotate_bytes {
                continue;
            }

            let outcome = match self.sessions.get_mut(&session_id) {
                Some(mut log) => {
                    log.file = None;
                    let outcome = file::rotate(&self.dir, &session_id);
                    log.file = LogFile::open(&path).ok();
                    outcome
                }
                None => file::rotate(&self.dir, &session_id),
            };
            match outcome {
                Ok(target) => {
                    info!(session_id = %session_id, size, to = %target.display(), "log rotated");
                    rotated.push(target);
                }
                Err(e) => warn!(error = %e, "log rotation failed; retrying next sweep"),
            }
        }
        rotated
    }

    /// Delete rotated files older than `max_age`. Returns how many were removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX));
        let listing = match file::list_dir(&self.dir) {
            Ok(listing) => listing,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "log directory unreadable");
                return 0;
            }
        };

        let mut removed = 0;
        for (path, name) in listing {
            let LogFileName::Rotated { stamp_ms, .. } = name else {
                continue;
            };
            if stamp_ms >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "expired log not removed"),
            }
        }
        if removed > 0 {
            debug!(removed, "expired logs cleaned up");
        }
        removed
    }

    /// Sessions with logs in memory or on disk, sorted.
    pub fn known_sessions(&self) -> Result<Vec<SessionId>> {
        let mut ids: BTreeSet<SessionId> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for (_, name) in file::list_dir(&self.dir)? {
            ids.insert(name.session_id().to_string());
        }
        Ok(ids.into_iter().collect())
    }

    fn last_seq_on_disk(&self, session_id: &str) -> Option<u64> {
        file::last_entry(&self.dir, session_id)
            .unwrap_or_else(|e| {
                warn!(session_id, error = %e, "could not read previous log tail");
                None
            })
            .map(|entry| entry.seq)
    }

    fn open_session(&self, session_id: &str) -> SessionLog {
        let previous = self.last_seq_on_disk(session_id);
        let file = match LogFile::open(&file::active_path(&self.dir, session_id)) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(session_id, dir = %self.dir.display(), error = %e, "log file unavailable; keeping memory only");
                None
            }
        };
        SessionLog {
            tail: RingBuffer::new(self.config.buffer_capacity),
            next_seq: previous.map_or(1, |seq| seq + 1),
            complete: previous.is_none(),
            file,
        }
    }

    fn read_tail(
        &self,
        session_id: &str,
        query: &LogQuery,
        matcher: &EntryMatcher,
    ) -> Option<Vec<LogEntry>> {
        let log = self.sessions.get(session_id)?;
        if query.offset.is_none() && query.since_ms.is_none() {
            let mut newest: Vec<LogEntry> = log
                .tail
                .iter()
                .rev()
                .filter(|e| matcher.matches(e))
                .take(query.limit)
                .cloned()
                .collect();
            newest.reverse();
            return Some(newest);
        }

        let covered = log.complete
            || (query.offset.is_none()
                && query
                    .since_ms
                    .zip(log.tail.front())
                    .is_some_and(|(since, oldest)| oldest.timestamp_ms <= since));
        if !covered {
            return None;
        }
        Some(
            log.tail
                .iter()
                .filter(|e| matcher.matches(e))
                .skip(query.offset.unwrap_or(0))
                .take(query.limit)
                .cloned()
                .collect(),
        )
    }

    fn read_files(
        &self,
        session_id: &str,
        query: &LogQuery,
        matcher: &EntryMatcher,
    ) -> Result<Vec<LogEntry>> {
        if query.offset.is_none() && query.since_ms.is_none() {
            // Newest `limit` without holding the whole history in memory.
            let mut newest = RingBuffer::new(query.limit);
            file::scan_session(&self.dir, session_id, |entry| {
                if matcher.matches(&entry) {
                    newest.push(entry);
                }
                ControlFlow::Continue(())
            })?;
            return Ok(newest.to_vec());
        }

        let mut skip = query.offset.unwrap_or(0);
        let mut page = Vec::new();
        file::scan_session(&self.dir, session_id, |entry| {
            if !matcher.matches(&entry) {
                return ControlFlow::Continue(());
            }
            if skip > 0 {
                skip -= 1;
                return ControlFlow::Continue(());
            }
            page.push(entry);
            if page.len() >= query.limit {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        Ok(page)
    }
}

struct EntryMatcher<'a> {
    filter: &'a LogFilter,
    needle: Option<String>,
    since_ms: Option<u64>,
}

impl<'a> EntryMatcher<'a> {
    fn new(filter: &'a LogFilter, since_ms: Option<u64>) -> Self {
        Self {
            filter,
            needle: filter.contains.as_ref().map(|s| s.to_lowercase()),
            since_ms,
        }
    }

    fn matches(&self, entry: &LogEntry) -> bool {
        self.since_ms.is_none_or(|since| entry.timestamp_ms >= since)
            && self.filter.stream.is_none_or(|s| entry.stream == s)
            && self.filter.min_level.is_none_or(|l| entry.level >= l)
            && self
                .needle
                .as_ref()
                .is_none_or(|n| entry.message.to_lowercase().contains(n.as_str()))
    }
}

fn search_haystack(entry: &LogEntry) -> String {
    format!(
        "{} {} {} {}",
        entry.message,
        entry.session_id,
        entry.stream.as_str(),
        entry.level.as_str()
    )
    .to_lowercase()
}

/// Classify a captured line by keyword. Stderr without a keyword is `warn`.
pub fn infer_level(stream: LogStream, message: &str) -> LogLevel {
    if stream == LogStream::System {
        return LogLevel::Info;
    }
    let lower = message.to_lowercase();
    if ["error", "fatal", "panic"].iter().any(|k| lower.contains(k)) {
        LogLevel::Error
    } else if lower.contains("warn") {
        LogLevel::Warn
    } else if lower.contains("debug") || lower.contains("trace") {
        LogLevel::Debug
    } else if stream == LogStream::Stderr {
        LogLevel::Warn
    } else {
        LogLevel::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Transport;
    use crate::config::BrokerConfig;

    fn manager(dir: &Path, buffer_capacity: usize) -> LogManager {
        let config = LogConfig {
            buffer_capacity,
            rotate_bytes: 256,
            ..LogConfig::default()
        };
        LogManager::new(
            config,
            dir,
            Arc::new(StreamingBroker::new(BrokerConfig::default())),
        )
    }

    fn messages(entries: &[LogEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.message.as_str()).collect()
    }

    #[test]
    fn write_assigns_increasing_seq_and_tail_read_serves_newest() {
        let dir = tempfile::tempdir().unwrap();
        let logs = manager(dir.path(), 100);
        for i in 0..5 {
            let entry = logs.record("web", LogStream::Stdout, format!("line {i}"));
            assert_eq!(entry.seq, i + 1);
        }

        let query = LogQuery {
            limit: 2,
            ..LogQuery::default()
        };
        let page = logs.read("web", &query).unwrap();
        assert_eq!(messages(&page), vec!["line 3", "line 4"]);

        let reversed = logs
            .read("web", &LogQuery { reverse: true, ..query })
            .unwrap();
        assert_eq!(messages(&reversed), vec!["line 4", "line 3"]);
    }

    #[test]
    fn offset_past_evicted_tail_falls_back_to_files() {
        let dir = tempfile::tempdir().unwrap();
        let logs = manager(dir.path(), 3);
        for i in 0..10 {
            logs.record("web", LogStream::Stdout, format!("line {i}"));
        }
        assert_eq!(logs.tail("web").len(), 3);

        let page = logs
            .read(
                "web",
                &LogQuery {
                    limit: 2,
                    offset: Some(1),
                    ..LogQuery::default()
                },
            )
            .unwrap();
        assert_eq!(messages(&page), vec!["line 1", "line 2"]);
    }

    #[test]
    fn filters_apply_to_stream_level_and_text() {
        let dir = tempfile::tempdir().unwrap();
        let logs = manager(dir.path(), 100);
        logs.record("web", LogStream::Stdout, "compiled successfully");
        logs.record("web", LogStream::Stderr, "Error: EADDRINUSE");
        logs.record("web", LogStream::Stdout, "Compiled again");

        let errors = logs
            .read(
                "web",
                &LogQuery {
                    filter: LogFilter {
                        min_level: Some(LogLevel::Error),
                        ..LogFilter::default()
                    },
                    ..LogQuery::default()
                },
            )
            .unwrap();
        assert_eq!(messages(&errors), vec!["Error: EADDRINUSE"]);

        let compiled = logs
            .read(
                "web",
                &LogQuery {
                    filter: LogFilter {
                        stream: Some(LogStream::Stdout),
                        contains: Some("COMPILED".to_string()),
                        ..LogFilter::default()
                    },
                    ..LogQuery::default()
                },
            )
            .unwrap();
        assert_eq!(compiled.len(), 2);
    }

    #[test]
    fn reads_history_left_by_a_previous_manager() {
        let dir = tempfile::tempdir().unwrap();
        {
            let logs = manager(dir.path(), 100);
            for i in 0..4 {
                logs.record("web", LogStream::Stdout, format!("old {i}"));
            }
        }

        let logs = manager(dir.path(), 100);
        let page = logs
            .read(
                "web",
                &LogQuery {
                    limit: 2,
                    ..LogQuery::default()
                },
            )
            .unwrap();
        assert_eq!(messages(&page), vec!["old 2", "old 3"]);

        let next = logs.record("web", LogStream::Stdout, "new");
        assert_eq!(next.seq, 5);
    }

    #[test]
    fn search_is_case_insensitive_and_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logs = manager(dir.path(), 100);
        logs.record("web", LogStream::Stdout, "GET /health 200");
        logs.record("api", LogStream::Stdout, "get /users 500");
        fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("web.log"))
            .and_then(|mut f| std::io::Write::write_all(&mut f, b"garbage line\n"))
            .unwrap();
        logs.record("web", LogStream::Stdout, "idle");

        let hits = logs.search("get /", &SearchOptions::default()).unwrap();
        assert_eq!(hits.len(), 2);

        let scoped = logs
            .search(
                "get",
                &SearchOptions {
                    session_id: Some("api".to_string()),
                    ..SearchOptions::default()
                },
            )
            .unwrap();
        assert_eq!(messages(&scoped), vec!["get /users 500"]);

        let by_stream = logs.search("STDOUT", &SearchOptions::default()).unwrap();
        assert_eq!(by_stream.len(), 3);
    }

    #[test]
    fn rotation_starts_a_fresh_active_file() {
        let dir = tempfile::tempdir().unwrap();
        let logs = manager(dir.path(), 100);
        for i in 0..10 {
            logs.record("web", LogStream::Stdout, format!("padding line number {i}"));
        }
        let active = dir.path().join("web.log");
        assert!(fs::metadata(&active).unwrap().len() >= 256);

        let rotated = logs.rotate();
        assert_eq!(rotated.len(), 1);
        assert!(rotated[0].exists());
        assert_eq!(fs::metadata(&active).unwrap().len(), 0);

        logs.record("web", LogStream::Stdout, "after rotation");
        assert!(fs::metadata(&active).unwrap().len() > 0);

        // History spans the rotated file and the new active file.
        let all = logs
            .read(
                "web",
                &LogQuery {
                    limit: 100,
                    offset: Some(0),
                    ..LogQuery::default()
                },
            )
            .unwrap();
        assert_eq!(all.len(), 11);
        assert_eq!(all.last().unwrap().message, "after rotation");
    }

    #[test]
    fn cleanup_removes_only_expired_rotated_files() {
        let dir = tempfile::tempdir().unwrap();
        let logs = manager(dir.path(), 100);
        logs.record("web", LogStream::Stdout, "active");
        fs::write(dir.path().join("web.1000.log"), b"").unwrap();
        let fresh = dir.path().join(format!("web.{}.log", now_ms()));
        fs::write(&fresh, b"").unwrap();

        assert_eq!(logs.cleanup(Duration::from_secs(3600)), 1);
        assert!(!dir.path().join("web.1000.log").exists());
        assert!(fresh.exists());
        assert!(dir.path().join("web.log").exists());
    }

    #[tokio::test]
    async fn delete_clears_everything_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(StreamingBroker::new(BrokerConfig::default()));
        let logs = LogManager::new(LogConfig::default(), dir.path(), Arc::clone(&broker));
        logs.record("web", LogStream::Stdout, "hello");

        let (transport, mut rx) = Transport::channel(8);
        broker.subscribe(&topic::session("web"), transport);
        let _connected = rx.recv().await;

        assert_eq!(logs.delete("web").unwrap(), 1);
        assert!(logs.tail("web").is_empty());
        assert!(!dir.path().join("web.log").exists());
        assert_eq!(
            rx.recv().await.unwrap(),
            StreamEvent::Status(StatusNotice::LogsCleared {
                session_id: "web".to_string()
            })
        );
    }

    #[test]
    fn seq_keeps_counting_after_delete() {
        let dir = tempfile::tempdir().unwrap();
        let logs = manager(dir.path(), 100);
        for i in 0..5 {
            logs.record("web", LogStream::Stdout, format!("line {i}"));
        }
        logs.delete("web").unwrap();
        assert_eq!(logs.record("web", LogStream::Stdout, "after").seq, 6);
        assert_eq!(messages(&logs.tail("web")), vec!["after"]);

        // A fresh manager only has the files to go by.
        let reopened = manager(dir.path(), 100);
        reopened.delete("web").unwrap();
        assert_eq!(reopened.record("web", LogStream::Stdout, "again").seq, 7);
    }

    #[test]
    fn level_inference_by_keyword_and_stream() {
        assert_eq!(infer_level(LogStream::Stdout, "Ready in 2s"), LogLevel::Info);
        assert_eq!(infer_level(LogStream::Stderr, "npm notice"), LogLevel::Warn);
        assert_eq!(infer_level(LogStream::Stdout, "FATAL: boom"), LogLevel::Error);
        assert_eq!(infer_level(LogStream::Stdout, "[debug] x"), LogLevel::Debug);
        assert_eq!(infer_level(LogStream::System, "error text"), LogLevel::Info);
    }
}
