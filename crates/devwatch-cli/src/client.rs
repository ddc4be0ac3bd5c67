use anyhow::{Context, Result, anyhow, bail};
use devwatch_protocol::{ErrorCode, Request, Response};
use serde_json::Value;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

/// Client for the daemon's control socket.
pub struct DevwatchClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl DevwatchClient {
    pub async fn connect(socket: Option<&Path>) -> Result<Self> {
        let socket_path = socket
            .map(Path::to_path_buf)
            .unwrap_or_else(devwatch_protocol::paths::default_socket_path);
        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|e| connect_error(&socket_path, e))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Send a request and read its response line.
    pub async fn request(&mut self, req: &Request) -> Result<Response> {
        let json = serde_json::to_string(req)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut line = String::new();
        self.reader.read_line(&mut line).await?;
        if line.is_empty() {
            bail!("daemon closed connection");
        }
        serde_json::from_str(&line).context("invalid response from daemon")
    }

    /// Like [`request`](Self::request), turning an error response into `Err`.
    pub async fn call(&mut self, req: &Request) -> Result<Value> {
        match self.request(req).await? {
            Response::Ok { data } => Ok(data.unwrap_or(Value::Null)),
            Response::Error { message, code } => Err(anyhow!("{message} ({})", code_name(code))),
        }
    }
}

fn connect_error(path: &Path, e: std::io::Error) -> anyhow::Error {
    if e.kind() == std::io::ErrorKind::ConnectionRefused || e.kind() == std::io::ErrorKind::NotFound {
        anyhow!(
            "devwatch daemon is not running at {}. Start it with: devwatchd",
            path.display()
        )
    } else {
        anyhow!("failed to connect to devwatch daemon at {}: {e}", path.display())
    }
}

/// Wire name of an error code, e.g. `session_not_found`.
pub fn code_name(code: ErrorCode) -> String {
    match serde_json::to_value(code) {
        Ok(Value::String(name)) => name,
        _ => format!("{code:?}"),
    }
}
