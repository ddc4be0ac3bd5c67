//! JSON-lines control socket. One request per line, one response per line,
//! answered in order on each connection.

use anyhow::{Context, Result, anyhow};
use devwatch_protocol::{ErrorCode, MAX_JSON_LINE_BYTES, Request, Response};
use futures_util::{SinkExt, StreamExt};
use libdevwatch::{Devwatch, dispatch};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const OUTBOUND_QUEUE: usize = 64;

/// Bind the control socket, replacing a stale one, and restrict it to the
/// owner.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    remove_stale_socket(path)?;
    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

pub async fn accept_loop(
    listener: UnixListener,
    devwatch: Arc<Devwatch>,
    shutdown: CancellationToken,
) -> Result<()> {
    // SAFETY: geteuid() has no preconditions.
    let allowed_uid = unsafe { libc::geteuid() };
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested, stopping control accept loop");
                break;
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };
                if let Err(err) = verify_peer_uid(&stream, allowed_uid) {
                    warn!("rejected peer: {err}");
                    continue;
                }
                connections.spawn(handle_connection(
                    stream,
                    Arc::clone(&devwatch),
                    shutdown.clone(),
                ));
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.abort_all();
    Ok(())
}

async fn handle_connection(stream: UnixStream, devwatch: Arc<Devwatch>, shutdown: CancellationToken) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES));
    let mut writer = FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES));

    let (out_tx, mut out_rx) = mpsc::channel::<Response>(OUTBOUND_QUEUE);
    let writer_task = tokio::spawn(async move {
        while let Some(resp) = out_rx.recv().await {
            let line = match serde_json::to_string(&resp) {
                Ok(line) => line,
                Err(err) => {
                    error!("failed to encode response: {err}");
                    continue;
                }
            };
            if let Err(err) = writer.send(line).await {
                warn!("socket write failed: {err}");
                break;
            }
        }
    });

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = reader.next() => match next {
                Some(Ok(line)) => line,
                Some(Err(err)) => {
                    warn!("control read failed: {err}");
                    let _ = out_tx
                        .send(Response::error(ErrorCode::InvalidRequest, err.to_string()))
                        .await;
                    break;
                }
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!(?request, "control request");
                dispatch(&devwatch, request).await
            }
            Err(err) => Response::error(ErrorCode::InvalidRequest, format!("invalid request: {err}")),
        };
        if out_tx.send(response).await.is_err() {
            break;
        }
    }

    drop(out_tx);
    let _ = writer_task.await;
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    Ok(())
}

fn verify_peer_uid(stream: &UnixStream, expected_uid: u32) -> Result<()> {
    let creds = stream.peer_cred().context("failed to query peer credentials")?;
    let uid = creds.uid();
    if uid != expected_uid {
        return Err(anyhow!("peer uid {uid} is not allowed (expected {expected_uid})"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libdevwatch::DevwatchConfig;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn roundtrip(stream: &mut BufReader<UnixStream>, line: &str) -> Response {
        stream.get_mut().write_all(line.as_bytes()).await.unwrap();
        stream.get_mut().write_all(b"\n").await.unwrap();
        let mut reply = String::new();
        stream.read_line(&mut reply).await.unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[tokio::test]
    async fn answers_requests_in_order_and_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("run").join("devwatch.sock");
        let devwatch = Arc::new(
            Devwatch::new(DevwatchConfig {
                data_dir: Some(dir.path().join("data")),
                ..DevwatchConfig::default()
            })
            .unwrap(),
        );
        let listener = bind(&socket).unwrap();
        let mode = fs::metadata(&socket).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(accept_loop(listener, devwatch, shutdown.clone()));

        let mut client = BufReader::new(UnixStream::connect(&socket).await.unwrap());
        match roundtrip(&mut client, r#"{"cmd":"session_status"}"#).await {
            Response::Ok { data } => assert_eq!(data, Some(serde_json::json!([]))),
            other => panic!("unexpected: {other:?}"),
        }
        match roundtrip(&mut client, r#"{"cmd":"session_status","session_id":"ghost"}"#).await {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::SessionNotFound),
            other => panic!("unexpected: {other:?}"),
        }
        match roundtrip(&mut client, "not json").await {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidRequest),
            other => panic!("unexpected: {other:?}"),
        }

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn verify_peer_uid_checks_owner() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("uid.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let client = tokio::spawn(async move { UnixStream::connect(&socket).await.unwrap() });
        let (server_stream, _) = listener.accept().await.unwrap();
        let _client = client.await.unwrap();

        let uid = unsafe { libc::geteuid() };
        verify_peer_uid(&server_stream, uid).unwrap();
        let err = verify_peer_uid(&server_stream, uid.saturating_add(1)).unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }
}
