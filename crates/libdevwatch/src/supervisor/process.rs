use devwatch_protocol::{LogStream, Session};
use futures_util::StreamExt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};

use crate::config::SupervisorConfig;
use crate::error::{DevwatchError, Result};

pub(crate) struct SpawnedProcess {
    pub child: Child,
    pub pid: u32,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Run `session.command` through the configured shell in its own process
/// group, with the assigned port exported.
pub(crate) fn spawn(config: &SupervisorConfig, session: &Session, port: u16) -> Result<SpawnedProcess> {
    let mut cmd = Command::new(&config.shell);
    cmd.arg("-c")
        .arg(&session.command)
        .current_dir(&session.working_dir)
        .envs(&session.environment)
        .env(&config.port_env_var, port.to_string())
        .env("DEVWATCH_SESSION_ID", &session.id)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(false);

    let mut child = cmd.spawn().map_err(|e| {
        DevwatchError::ProcessStartFailed(format!(
            "{} (cwd {}): {e}",
            session.command,
            session.working_dir.display()
        ))
    })?;
    let pid = child
        .id()
        .ok_or_else(|| DevwatchError::ProcessStartFailed("failed to get process ID".to_string()))?;
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(DevwatchError::ProcessStartFailed(
            "child output pipes unavailable".to_string(),
        ));
    };
    Ok(SpawnedProcess {
        child,
        pid,
        stdout,
        stderr,
    })
}

/// Read `pipe` line by line into `tx` until EOF. Reading never waits on the
/// consumer, so a slow log path cannot fill the child's pipe.
pub(crate) fn forward_lines<R>(
    pipe: R,
    stream: LogStream,
    max_line_bytes: usize,
    tx: mpsc::UnboundedSender<(LogStream, String)>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = FramedRead::new(pipe, OutputLines::new(max_line_bytes));
        while let Some(Ok(line)) = lines.next().await {
            if tx.send((stream, line)).is_err() {
                break;
            }
        }
    });
}

/// Newline-delimited process output. Bytes are decoded lossily and a line
/// that reaches `max_len` without a newline is emitted in `max_len` pieces.
pub(crate) struct OutputLines {
    max_len: usize,
    /// Bytes already searched for a newline.
    scanned: usize,
    /// The last item was a forced split, so a bare terminator ends it.
    split: bool,
}

impl OutputLines {
    pub(crate) fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            scanned: 0,
            split: false,
        }
    }

    fn take(&mut self, buf: &mut BytesMut, len: usize) -> String {
        self.scanned = 0;
        let raw = buf.split_to(len);
        String::from_utf8_lossy(&raw)
            .trim_end_matches(['\n', '\r'])
            .to_string()
    }
}

impl Decoder for OutputLines {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        loop {
            let window = buf.len().min(self.max_len);
            let from = self.scanned.min(window);
            let newline = buf[from..window]
                .iter()
                .position(|b| *b == b'\n')
                .map(|i| from + i);
            match newline {
                Some(at) => {
                    let after_split = std::mem::take(&mut self.split);
                    let line = self.take(buf, at + 1);
                    if after_split && line.is_empty() {
                        continue;
                    }
                    return Ok(Some(line));
                }
                None if buf.len() >= self.max_len => {
                    let piece = self.take(buf, self.max_len);
                    self.split = true;
                    return Ok(Some(piece));
                }
                None => {
                    self.scanned = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        match self.decode(buf)? {
            Some(line) => Ok(Some(line)),
            None if buf.is_empty() => Ok(None),
            None => {
                let len = buf.len();
                self.split = false;
                Ok(Some(self.take(buf, len)))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExitRecord {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitRecord {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code, with signal deaths reported shell-style as `128 + signal`.
    pub fn exit_code(&self) -> Option<i32> {
        self.code.or(self.signal.map(|s| 128 + s))
    }
}

impl From<ExitStatus> for ExitRecord {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl std::fmt::Display for ExitRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Send `signal` to the process group led by `pid`. A group that is already
/// gone counts as success.
pub(crate) fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    if pgid <= 1 {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }
    // SAFETY: killpg only delivers a signal; the group was created for this
    // child by `process_group(0)`.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    // The leader may not own a group (e.g. adopted from a reloaded registry).
    // SAFETY: plain signal delivery to a single pid.
    let rc = unsafe { libc::kill(pgid, signal) };
    if rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn session(command: &str) -> Session {
        Session {
            id: "t".to_string(),
            name: "t".to_string(),
            command: command.to_string(),
            working_dir: PathBuf::from("/"),
            port: None,
            requested_port: None,
            environment: BTreeMap::from([("GREETING".to_string(), "hi".to_string())]),
            status: devwatch_protocol::SessionStatus::Pending,
            pid: None,
            created_at_ms: 0,
            started_at_ms: None,
            ended_at_ms: None,
            exit_code: None,
            restart_count: 0,
            restart_policy: Default::default(),
            framework: None,
        }
    }

    #[tokio::test]
    async fn spawn_exports_port_and_env_and_forwards_both_streams() {
        let spawned = spawn(
            &SupervisorConfig::default(),
            &session("echo $GREETING $PORT; echo oops >&2; exit 3"),
            4321,
        )
        .unwrap();
        assert!(spawned.pid > 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        forward_lines(spawned.stdout, LogStream::Stdout, 1024, tx.clone());
        forward_lines(spawned.stderr, LogStream::Stderr, 1024, tx);

        let mut child = spawned.child;
        let exit = ExitRecord::from(child.wait().await.unwrap());
        assert_eq!(exit.exit_code(), Some(3));
        assert!(!exit.success());

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert!(lines.contains(&(LogStream::Stdout, "hi 4321".to_string())));
        assert!(lines.contains(&(LogStream::Stderr, "oops".to_string())));
    }

    #[tokio::test]
    async fn overlong_output_is_split_into_bounded_pieces() {
        let spawned = spawn(
            &SupervisorConfig::default(),
            &session("printf 'abcdefghij'; printf 'xy\\r\\n'; printf 'tail'"),
            1,
        )
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward_lines(spawned.stdout, LogStream::Stdout, 4, tx);

        let mut lines = Vec::new();
        while let Some((_, line)) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["abcd", "efgh", "ijxy", "tail"]);
    }

    #[test]
    fn decoder_keeps_partial_lines_until_complete() {
        let mut codec = OutputLines::new(16);
        let mut buf = BytesMut::from(&b"ready in"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b" 2s\nnext");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("ready in 2s"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("next"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn signal_group_terminates_children() {
        let spawned = spawn(&SupervisorConfig::default(), &session("sleep 30"), 1).unwrap();
        signal_group(spawned.pid, libc::SIGTERM).unwrap();
        let mut child = spawned.child;
        let exit = ExitRecord::from(child.wait().await.unwrap());
        assert_eq!(exit.signal, Some(libc::SIGTERM));
        assert_eq!(exit.exit_code(), Some(128 + libc::SIGTERM));
    }

    #[tokio::test]
    async fn bad_working_dir_is_a_start_failure() {
        let mut s = session("true");
        s.working_dir = PathBuf::from("/definitely/not/here");
        assert!(matches!(
            spawn(&SupervisorConfig::default(), &s, 1),
            Err(DevwatchError::ProcessStartFailed(_))
        ));
    }
}
