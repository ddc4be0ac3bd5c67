//! Transport-neutral request dispatch shared by the control socket and the
//! HTTP routes.

use devwatch_protocol::{ErrorCode, Request, Response};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::context::Devwatch;
use crate::error::{DevwatchError, Result};
use crate::logs::SearchOptions;
use crate::metrics::ExportOptions;

/// Run one request against `devwatch` and build its response.
pub async fn dispatch(devwatch: &Devwatch, request: Request) -> Response {
    match handle(devwatch, request).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

async fn handle(devwatch: &Devwatch, request: Request) -> Result<Response> {
    let supervisor = &devwatch.supervisor;
    let response = match request {
        Request::SessionStart(req) => ok_response(&supervisor.start(req).await?),
        Request::SessionRegister(req) => ok_response(&supervisor.register(req).await?),
        Request::SessionStartRegistered { session_id } => {
            ok_response(&supervisor.start_registered(&session_id).await?)
        }
        Request::SessionStop {
            session_id,
            force,
            timeout_ms,
        } => {
            let timeout = timeout_ms.map(Duration::from_millis);
            ok_response(&supervisor.stop(&session_id, force, timeout).await?)
        }
        Request::SessionRestart { session_id } => ok_response(&supervisor.restart(&session_id).await?),
        Request::SessionStatus { session_id: Some(id) } => ok_response(&supervisor.status(&id)?),
        Request::SessionStatus { session_id: None } => ok_response(&supervisor.list()),
        Request::SessionUnregister { session_id } => {
            ok_response(&supervisor.unregister(&session_id).await?)
        }

        Request::Logs {
            session_id,
            query,
            search,
        } => {
            let entries = match search {
                Some(needle) => devwatch.logs.search(
                    &needle,
                    &SearchOptions {
                        session_id: Some(session_id),
                        start_ms: query.since_ms,
                        end_ms: None,
                        limit: query.limit,
                    },
                )?,
                None => devwatch.logs.read(&session_id, &query)?,
            };
            ok_response(&entries)
        }
        Request::LogsSearch {
            query,
            session_id,
            start_ms,
            end_ms,
            limit,
        } => {
            let opts = SearchOptions {
                session_id,
                start_ms,
                end_ms,
                limit,
            };
            ok_response(&devwatch.logs.search(&query, &opts)?)
        }
        Request::LogsExport {
            session_id,
            format,
            query,
        } => {
            let content = devwatch.logs.export(&session_id, format, &query)?;
            Response::ok(Some(json!({ "format": format, "content": content })))
        }
        Request::LogsDelete { session_id } => {
            let removed = devwatch.logs.delete(&session_id)?;
            Response::ok(Some(json!({ "session_id": session_id, "removed_files": removed })))
        }

        Request::MetricsIngest { points } => {
            let accepted = devwatch.metrics.add_points(points);
            Response::ok(Some(json!({ "accepted": accepted })))
        }
        Request::MetricsRaw {
            series,
            start_ms,
            end_ms,
        } => ok_response(&devwatch.metrics.raw_range(&series, start_ms, end_ms)),
        Request::MetricsDownsampled {
            series,
            start_ms,
            end_ms,
            max_points,
        } => ok_response(&devwatch.metrics.downsampled(&series, start_ms, end_ms, max_points)),
        Request::MetricsAggregate(query) => ok_response(&devwatch.metrics.aggregate(&query)?),
        Request::MetricsSeries => ok_response(&devwatch.metrics.series()),
        Request::MetricsLive { series, max_points } => match devwatch.metrics.live_view(&series, max_points) {
            Some(points) => ok_response(&points),
            None => {
                return Err(DevwatchError::InvalidRequest(format!("unknown series {series}")));
            }
        },
        Request::MetricsExport {
            series,
            start_ms,
            end_ms,
            format,
            include_unit,
            include_metadata,
        } => {
            let opts = ExportOptions {
                include_unit,
                include_metadata,
            };
            let content = devwatch
                .metrics
                .export(&series, start_ms, end_ms, format, opts)?;
            Response::ok(Some(json!({ "format": format, "content": content })))
        }

        Request::ContainerStatus { container_id } => {
            ok_response(&devwatch.health.get_status(&container_id).await?)
        }
        Request::ContainerStats { container_id } => {
            ok_response(&devwatch.health.get_stats(&container_id).await?)
        }
        Request::ContainerWait {
            container_id,
            target,
            timeout_ms,
        } => {
            let status = devwatch
                .health
                .wait_for_status(&container_id, &target, Duration::from_millis(timeout_ms))
                .await?;
            ok_response(&status)
        }
        Request::ContainerMonitor {
            container_id,
            interval_ms,
        } => {
            devwatch
                .health
                .monitor(&container_id, interval_ms.map(Duration::from_millis));
            Response::ok(Some(json!({ "monitoring": devwatch.health.monitored() })))
        }
        Request::ContainerUnmonitor { container_id } => {
            let stopped = devwatch.health.unmonitor(&container_id);
            Response::ok(Some(json!({ "stopped": stopped })))
        }
    };
    Ok(response)
}

/// Serialize a value into `Response::Ok`.
pub fn ok_response<T: Serialize>(data: &T) -> Response {
    match serde_json::to_value(data) {
        Ok(value) => Response::ok(Some(value)),
        Err(e) => Response::error(ErrorCode::ServerError, format!("serialization failed: {e}")),
    }
}

pub fn error_response(error: &DevwatchError) -> Response {
    let (code, message) = error.to_error_code();
    debug!(?code, %message, "request failed");
    Response::error(code, message)
}
