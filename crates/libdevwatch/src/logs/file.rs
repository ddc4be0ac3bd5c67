//! On-disk layout for session logs.
//!
//! Each session appends JSON lines to `<dir>/<session>.log`. Rotation renames
//! that file to `<dir>/<session>.<epoch_ms>.log` and starts a fresh one.

use devwatch_protocol::{LogEntry, now_ms};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use crate::error::{DevwatchError, Result};

const TAIL_PROBE_BYTES: u64 = 64 * 1024;

#[derive(Debug)]
pub(crate) struct LogFile {
    file: File,
    write_pos: u64,
}

impl LogFile {
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let write_pos = file.metadata()?.len();
        Ok(Self { file, write_pos })
    }

    pub(crate) fn append(&mut self, entry: &LogEntry) -> io::Result<()> {
        let mut line = serde_json::to_vec(entry).map_err(io::Error::other)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.write_pos = self
            .write_pos
            .saturating_add(u64::try_from(line.len()).unwrap_or(0));
        Ok(())
    }

    pub(crate) fn size(&self) -> u64 {
        self.write_pos
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LogFileName {
    Active { session_id: String },
    Rotated { session_id: String, stamp_ms: u64 },
}

impl LogFileName {
    pub(crate) fn session_id(&self) -> &str {
        match self {
            Self::Active { session_id } | Self::Rotated { session_id, .. } => session_id,
        }
    }
}

pub(crate) fn active_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{session_id}.log"))
}

pub(crate) fn rotated_path(dir: &Path, session_id: &str, stamp_ms: u64) -> PathBuf {
    dir.join(format!("{session_id}.{stamp_ms}.log"))
}

pub(crate) fn parse_file_name(name: &str) -> Option<LogFileName> {
    let stem = name.strip_suffix(".log")?;
    if let Some((session, stamp)) = stem.rsplit_once('.') {
        if session.is_empty() || stamp.is_empty() || !stamp.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        return Some(LogFileName::Rotated {
            session_id: session.to_string(),
            stamp_ms: stamp.parse().ok()?,
        });
    }
    if stem.is_empty() {
        return None;
    }
    Some(LogFileName::Active {
        session_id: stem.to_string(),
    })
}

/// Every recognised log file in `dir`. A missing directory is empty.
pub(crate) fn list_dir(dir: &Path) -> io::Result<Vec<(PathBuf, LogFileName)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().and_then(parse_file_name) else {
            continue;
        };
        found.push((entry.path(), name));
    }
    Ok(found)
}

/// A session's files in read order: rotated siblings oldest first, then the
/// active file.
pub(crate) fn session_files(dir: &Path, session_id: &str) -> io::Result<Vec<PathBuf>> {
    let mut rotated = Vec::new();
    let mut active = None;
    for (path, name) in list_dir(dir)? {
        match name {
            LogFileName::Rotated {
                session_id: owner,
                stamp_ms,
            } if owner == session_id => rotated.push((stamp_ms, path)),
            LogFileName::Active { session_id: owner } if owner == session_id => {
                active = Some(path)
            }
            _ => {}
        }
    }
    rotated.sort_by_key(|(stamp, _)| *stamp);
    let mut files: Vec<PathBuf> = rotated.into_iter().map(|(_, path)| path).collect();
    files.extend(active);
    Ok(files)
}

/// Feed every well-formed entry of `path` to `visit`. Malformed lines are
/// skipped.
pub(crate) fn scan_file<F>(path: &Path, visit: &mut F) -> io::Result<ControlFlow<()>>
where
    F: FnMut(LogEntry) -> ControlFlow<()>,
{
    let file = match File::open(path) {
        Ok(file) => file,
        // Rotated or deleted between listing and opening.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ControlFlow::Continue(())),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(ControlFlow::Continue(()));
        }
        let Ok(entry) = serde_json::from_slice::<LogEntry>(trim_newline(&line)) else {
            continue;
        };
        if visit(entry).is_break() {
            return Ok(ControlFlow::Break(()));
        }
    }
}

pub(crate) fn scan_session<F>(dir: &Path, session_id: &str, mut visit: F) -> io::Result<()>
where
    F: FnMut(LogEntry) -> ControlFlow<()>,
{
    for path in session_files(dir, session_id)? {
        if scan_file(&path, &mut visit)?.is_break() {
            break;
        }
    }
    Ok(())
}

/// Most recent well-formed entry across a session's files, read from the
/// tail of each file so large histories are not loaded.
pub(crate) fn last_entry(dir: &Path, session_id: &str) -> io::Result<Option<LogEntry>> {
    for path in session_files(dir, session_id)?.iter().rev() {
        if let Some(entry) = last_entry_in(path)? {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

fn last_entry_in(path: &Path) -> io::Result<Option<LogEntry>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(TAIL_PROBE_BYTES)))?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail)?;
    Ok(tail
        .split(|b| *b == b'\n')
        .rev()
        .find_map(|line| serde_json::from_slice::<LogEntry>(trim_newline(line)).ok()))
}

/// Move the active file aside under a fresh timestamped name.
pub(crate) fn rotate(dir: &Path, session_id: &str) -> Result<PathBuf> {
    let active = active_path(dir, session_id);
    let mut stamp = now_ms();
    let mut target = rotated_path(dir, session_id, stamp);
    while target.exists() {
        stamp += 1;
        target = rotated_path(dir, session_id, stamp);
    }
    fs::rename(&active, &target).map_err(|e| DevwatchError::RotationFailure {
        path: active.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(target)
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
