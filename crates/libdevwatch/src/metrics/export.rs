use devwatch_protocol::{ExportFormat, MetricPoint};
use serde_json::{Map, Value, json};

use crate::csv::push_row;
use crate::error::{DevwatchError, Result};

/// Optional columns for a metrics export.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    pub include_unit: bool,
    pub include_metadata: bool,
}

pub fn export_points(points: &[MetricPoint], format: ExportFormat, opts: ExportOptions) -> Result<String> {
    match format {
        ExportFormat::Csv => Ok(to_csv(points, opts)),
        ExportFormat::Json => {
            let rows: Vec<Value> = points.iter().map(|p| to_json(p, opts)).collect();
            serde_json::to_string_pretty(&rows)
                .map_err(|e| DevwatchError::InvalidRequest(format!("metrics export: {e}")))
        }
        ExportFormat::Text => Err(DevwatchError::InvalidRequest(
            "metrics export supports csv and json".to_string(),
        )),
    }
}

fn to_csv(points: &[MetricPoint], opts: ExportOptions) -> String {
    let mut header = vec!["timestamp", "container_id", "metric_type", "value"];
    if opts.include_unit {
        header.push("unit");
    }
    if opts.include_metadata {
        header.push("metadata");
    }

    let mut out = String::new();
    push_row(&mut out, header);
    for p in points {
        let mut row = vec![
            p.timestamp_ms.to_string(),
            p.container_id.clone(),
            p.metric_type.clone(),
            p.value.to_string(),
        ];
        if opts.include_unit {
            row.push(p.unit.clone().unwrap_or_default());
        }
        if opts.include_metadata {
            let labels: Vec<String> = p.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
            row.push(labels.join(";"));
        }
        push_row(&mut out, row);
    }
    out
}

fn to_json(p: &MetricPoint, opts: ExportOptions) -> Value {
    let mut row = Map::new();
    row.insert("timestamp_ms".into(), json!(p.timestamp_ms));
    row.insert("container_id".into(), json!(p.container_id));
    row.insert("metric_type".into(), json!(p.metric_type));
    row.insert("value".into(), json!(p.value));
    if opts.include_unit {
        row.insert("unit".into(), json!(p.unit));
    }
    if opts.include_metadata {
        row.insert("metadata".into(), json!(p.labels));
    }
    Value::Object(row)
}
