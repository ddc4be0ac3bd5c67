//! `devwatch tail`: follow a topic over the HTTP event stream, reconnecting
//! with backoff until the retry ceiling is hit.

use anyhow::{Result, bail};
use devwatch_protocol::backoff::{ReconnectPolicy, Reconnector};
use devwatch_protocol::{ErrorCode, LogEntry, SseDecoder, StatusNotice, StreamEvent};
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::client::code_name;

pub struct TailOptions {
    pub base_url: String,
    pub topic: String,
    pub policy: ReconnectPolicy,
    pub json: bool,
    pub heartbeats: bool,
}

pub async fn run(opts: TailOptions) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}/events/{}", opts.base_url.trim_end_matches('/'), opts.topic);
    let mut reconnector = Reconnector::new(opts.policy.clone());
    let mut seen = SeenLogs::default();

    loop {
        match follow_once(&client, &url, &opts, &mut reconnector, &mut seen).await {
            Ok(()) => debug!("event stream ended"),
            Err(err) => warn!("event stream error: {err:#}"),
        }
        let Some(delay) = reconnector.next_delay() else {
            bail!(
                "{}: gave up on {url} after {} reconnect attempts",
                code_name(ErrorCode::ConnectionLost),
                reconnector.attempts()
            );
        };
        info!(attempt = reconnector.attempts(), ?delay, "reconnecting");
        tokio::time::sleep(delay).await;
    }
}

async fn follow_once(
    client: &reqwest::Client,
    url: &str,
    opts: &TailOptions,
    reconnector: &mut Reconnector,
    seen: &mut SeenLogs,
) -> Result<()> {
    let resp = client.get(url).send().await?.error_for_status()?;
    let mut body = resp.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut pending = Vec::new();

    while let Some(chunk) = body.next().await {
        pending.extend_from_slice(&chunk?);
        let text = take_utf8(&mut pending);
        for frame in decoder.push(&text) {
            let event = match StreamEvent::from_frame(&frame) {
                Ok(Some(event)) => event,
                Ok(None) => {
                    debug!(event = %frame.event, "skipping unknown event");
                    continue;
                }
                Err(err) => {
                    warn!(event = %frame.event, "undecodable event: {err}");
                    continue;
                }
            };
            if matches!(event, StreamEvent::Connected(_)) {
                reconnector.reset();
            }
            if !seen.should_print(&event) {
                continue;
            }
            if let Some(line) = render(&event, opts.json, opts.heartbeats) {
                println!("{line}");
            }
        }
    }
    Ok(())
}

/// Drops log entries already printed before a reconnect replayed them.
#[derive(Default)]
struct SeenLogs {
    last_seq: HashMap<String, u64>,
}

impl SeenLogs {
    /// False for a log entry printed earlier. A `logs_cleared` notice
    /// forgets the session so its numbering can start over.
    fn should_print(&mut self, event: &StreamEvent) -> bool {
        match event {
            StreamEvent::Log(entry) => self.first_time(entry),
            StreamEvent::Status(StatusNotice::LogsCleared { session_id }) => {
                self.last_seq.remove(session_id);
                true
            }
            _ => true,
        }
    }

    fn first_time(&mut self, entry: &LogEntry) -> bool {
        match self.last_seq.get(&entry.session_id) {
            Some(&last) if entry.seq <= last => false,
            _ => {
                self.last_seq.insert(entry.session_id.clone(), entry.seq);
                true
            }
        }
    }
}

/// Take the longest valid UTF-8 prefix, leaving a split character behind.
fn take_utf8(buf: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(buf) {
        Ok(s) => s.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        // Invalid bytes, not a split: replace them rather than stall.
        Err(_) => buf.len(),
    };
    let rest = buf.split_off(valid);
    let text = String::from_utf8_lossy(buf).into_owned();
    *buf = rest;
    text
}

fn render(event: &StreamEvent, json: bool, heartbeats: bool) -> Option<String> {
    if matches!(event, StreamEvent::Heartbeat(_)) && !heartbeats {
        return None;
    }
    if json {
        return event
            .data_json()
            .ok()
            .map(|data| format!("{{\"event\":\"{}\",\"data\":{data}}}", event.event_type()));
    }
    match event {
        StreamEvent::Connected(c) => Some(format!("-- connected to {}", c.topic)),
        StreamEvent::Log(entry) => Some(entry.text_line()),
        StreamEvent::Metric(p) => Some(format!(
            "{} {}/{} {}{}",
            p.timestamp_ms,
            p.container_id,
            p.metric_type,
            p.value,
            p.unit.as_deref().unwrap_or_default()
        )),
        StreamEvent::Status(notice) => Some(match notice {
            StatusNotice::Transition { session_id, from, to, .. } => {
                format!("-- {session_id}: {from} -> {to}")
            }
            StatusNotice::Restarting {
                session_id,
                attempt,
                delay_ms,
            } => format!("-- {session_id}: restarting (attempt {attempt}) in {delay_ms}ms"),
            StatusNotice::HistoricalComplete { count, .. } => {
                format!("-- replayed {count} buffered lines, following")
            }
            StatusNotice::LogsCleared { session_id } => format!("-- {session_id}: logs cleared"),
        }),
        StreamEvent::Error(e) => Some(format!("-- error: {}", e.message)),
        StreamEvent::Heartbeat(h) => Some(format!("-- heartbeat ({} connections)", h.connections)),
    }
}
