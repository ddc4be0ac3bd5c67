//! Events carried over the text event stream and the framing used for them.
//!
//! Each message on the wire is `event: <type>\ndata: <json>\n\n`. Decoders
//! must skip event types they do not know so older clients keep working
//! against newer daemons.

use serde::{Deserialize, Serialize};

use crate::{LogEntry, MetricPoint, SessionId, SessionStatus};

pub mod topic {
    /// Lifecycle transitions for every session.
    pub const SESSIONS: &str = "sessions";

    /// Log lines and status notices for one session.
    pub fn session(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    /// Metric points for one container.
    pub fn metrics(container_id: &str) -> String {
        format!("metrics:{container_id}")
    }

    /// Returns the session id if `topic` is a session topic.
    pub fn session_id(topic: &str) -> Option<&str> {
        topic.strip_prefix("session:")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Connected {
    pub topic: String,
    pub subscription_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub timestamp_ms: u64,
    pub connections: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorNotice {
    pub message: String,
}

/// Lifecycle and housekeeping notices sent as `status` events.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusNotice {
    Transition {
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        port: Option<u16>,
    },
    Restarting {
        session_id: SessionId,
        attempt: u32,
        delay_ms: u64,
    },
    HistoricalComplete {
        topic: String,
        count: usize,
    },
    LogsCleared {
        session_id: SessionId,
    },
}

/// Every event a subscriber can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected(Connected),
    Log(LogEntry),
    Metric(MetricPoint),
    Status(StatusNotice),
    Error(ErrorNotice),
    Heartbeat(Heartbeat),
}

impl StreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::Log(_) => "log",
            Self::Metric(_) => "metric",
            Self::Status(_) => "status",
            Self::Error(_) => "error",
            Self::Heartbeat(_) => "heartbeat",
        }
    }

    /// JSON body for the `data:` line.
    pub fn data_json(&self) -> serde_json::Result<String> {
        match self {
            Self::Connected(v) => serde_json::to_string(v),
            Self::Log(v) => serde_json::to_string(v),
            Self::Metric(v) => serde_json::to_string(v),
            Self::Status(v) => serde_json::to_string(v),
            Self::Error(v) => serde_json::to_string(v),
            Self::Heartbeat(v) => serde_json::to_string(v),
        }
    }

    /// Parse a decoded frame. Unknown event types yield `Ok(None)`.
    pub fn from_frame(frame: &SseFrame) -> serde_json::Result<Option<Self>> {
        let data = frame.data.as_str();
        let event = match frame.event.as_str() {
            "connected" => Self::Connected(serde_json::from_str(data)?),
            "log" => Self::Log(serde_json::from_str(data)?),
            "metric" => Self::Metric(serde_json::from_str(data)?),
            "status" => Self::Status(serde_json::from_str(data)?),
            "error" => Self::Error(serde_json::from_str(data)?),
            "heartbeat" => Self::Heartbeat(serde_json::from_str(data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Session this event belongs to, when it has one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Log(entry) => Some(&entry.session_id),
            Self::Status(
                StatusNotice::Transition { session_id, .. }
                | StatusNotice::Restarting { session_id, .. }
                | StatusNotice::LogsCleared { session_id },
            ) => Some(session_id),
            _ => None,
        }
    }
}

/// One decoded `event:`/`data:` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental decoder for a text event stream.
///
/// Bytes may arrive split at arbitrary points; complete frames are returned
/// as soon as their terminating blank line has been seen.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.pending.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.pending.find('\n') {
            let mut line: String = self.pending.drain(..=newline).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_str(), ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        frames
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}
