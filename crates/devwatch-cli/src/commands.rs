use anyhow::{Context, Result};
use devwatch_protocol::{
    AggregationQuery, LogEntry, LogQuery, MetricPoint, Request, Session,
};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::client::DevwatchClient;

/// Output options shared by every command.
pub struct Output {
    pub json: bool,
}

/// Send one request and return its payload.
pub async fn call(socket: Option<&Path>, req: Request) -> Result<Value> {
    let mut client = DevwatchClient::connect(socket).await?;
    client.call(&req).await
}

pub fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Start, register or run; prints `<id>` and the assigned port.
pub async fn session_start(socket: Option<&Path>, request: Request, out: &Output) -> Result<()> {
    let data = call(socket, request).await?;
    if out.json {
        return print_json(&data);
    }
    let id = data
        .get("session_id")
        .or_else(|| data.get("id"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    match data.get("port").and_then(Value::as_u64) {
        Some(port) => println!("{id} port={port}"),
        None => println!("{id}"),
    }
    Ok(())
}

pub async fn session_status(socket: Option<&Path>, session_id: Option<String>, out: &Output) -> Result<()> {
    let single = session_id.is_some();
    let data = call(socket, Request::SessionStatus { session_id }).await?;
    if out.json {
        return print_json(&data);
    }
    let sessions: Vec<Session> = if single {
        vec![serde_json::from_value(data).context("invalid session payload")?]
    } else {
        serde_json::from_value(data).context("invalid session list payload")?
    };
    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    println!("{:<20} {:<9} {:>6} {:>8} {:>8}  COMMAND", "ID", "STATUS", "PORT", "PID", "RESTARTS");
    for s in &sessions {
        println!(
            "{:<20} {:<9} {:>6} {:>8} {:>8}  {}",
            s.id,
            s.status.as_str(),
            s.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            s.restart_count,
            s.command
        );
    }
    Ok(())
}

/// Requests whose payload is a session record; prints `<id> <status>`.
pub async fn session_action(socket: Option<&Path>, req: Request, out: &Output) -> Result<()> {
    let data = call(socket, req).await?;
    if out.json {
        return print_json(&data);
    }
    let id = data
        .get("id")
        .or_else(|| data.get("session_id"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let status = data.get("status").and_then(Value::as_str).unwrap_or("unknown");
    println!("{id} {status}");
    Ok(())
}

pub async fn logs(
    socket: Option<&Path>,
    session_id: String,
    query: LogQuery,
    search: Option<String>,
    out: &Output,
) -> Result<()> {
    let data = call(
        socket,
        Request::Logs {
            session_id,
            query,
            search,
        },
    )
    .await?;
    print_entries(data, out)
}

pub async fn search(socket: Option<&Path>, req: Request, out: &Output) -> Result<()> {
    let data = call(socket, req).await?;
    print_entries(data, out)
}

fn print_entries(data: Value, out: &Output) -> Result<()> {
    if out.json {
        return print_json(&data);
    }
    let entries: Vec<LogEntry> = serde_json::from_value(data).context("invalid log payload")?;
    for entry in &entries {
        println!("{}", entry.text_line());
    }
    Ok(())
}

/// Export requests answer `{format, content}`; write the content out.
pub async fn export(socket: Option<&Path>, req: Request, output: Option<PathBuf>) -> Result<()> {
    let data = call(socket, req).await?;
    let content = data
        .get("content")
        .and_then(Value::as_str)
        .context("export response has no content")?;
    match output {
        Some(path) => {
            std::fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
        None => print!("{content}"),
    }
    Ok(())
}

pub async fn ingest(socket: Option<&Path>, file: &Path) -> Result<()> {
    let raw = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("failed to read stdin")?;
        buf
    } else {
        std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?
    };
    let points: Vec<MetricPoint> = serde_json::from_str(&raw).context("expected a JSON array of metric points")?;
    let data = call(socket, Request::MetricsIngest { points }).await?;
    println!("accepted {}", data.get("accepted").and_then(Value::as_u64).unwrap_or(0));
    Ok(())
}

pub async fn aggregate(socket: Option<&Path>, query: AggregationQuery) -> Result<()> {
    let data = call(socket, Request::MetricsAggregate(query)).await?;
    print_json(&data)
}
