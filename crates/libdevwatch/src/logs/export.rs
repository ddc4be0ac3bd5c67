use devwatch_protocol::{ExportFormat, LogEntry};

use crate::csv::push_row;
use crate::error::{DevwatchError, Result};

const CSV_HEADER: [&str; 6] = ["timestamp", "session_id", "seq", "stream", "level", "message"];

/// Render entries in the requested export format.
pub fn export_entries(entries: &[LogEntry], format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => serde_json::to_string_pretty(entries)
            .map_err(|e| DevwatchError::InvalidRequest(format!("log export: {e}"))),
        ExportFormat::Csv => {
            let mut out = String::new();
            push_row(&mut out, CSV_HEADER);
            for entry in entries {
                push_row(
                    &mut out,
                    [
                        entry.timestamp_ms.to_string().as_str(),
                        entry.session_id.as_str(),
                        entry.seq.to_string().as_str(),
                        entry.stream.as_str(),
                        entry.level.as_str(),
                        entry.message.as_str(),
                    ],
                );
            }
            Ok(out)
        }
        ExportFormat::Text => {
            let mut out = String::new();
            for entry in entries {
                out.push_str(&entry.text_line());
                out.push('\n');
            }
            Ok(out)
        }
    }
}
