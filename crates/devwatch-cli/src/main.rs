mod client;
mod commands;
mod tail;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use devwatch_protocol::backoff::ReconnectPolicy;
use devwatch_protocol::{
    AggregationQuery, ExportFormat, LogFilter, LogLevel, LogQuery, LogStream, Request,
    RestartPolicy, SeriesKey, StartSessionRequest, TimeBucket,
};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::commands::Output;

#[derive(Parser)]
#[command(name = "devwatch", version, about = "Supervise dev servers and watch their output")]
struct Cli {
    /// Control socket of the daemon
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Base URL of the daemon's HTTP listener (used by `tail`)
    #[arg(long, global = true, default_value = "http://127.0.0.1:8787")]
    url: String,

    /// Print raw JSON payloads
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a session
    Start(SessionArgs),

    /// Record a session without starting it
    Register(SessionArgs),

    /// Start a previously registered session
    Run {
        session: String,
    },

    /// Stop a session
    Stop {
        session: String,

        /// Send SIGKILL instead of SIGTERM
        #[arg(long)]
        force: bool,

        /// Grace period before escalating to SIGKILL
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Restart a session
    Restart {
        session: String,
    },

    /// Show one session, or all of them
    Status {
        session: Option<String>,
    },

    /// Stop a session and forget it
    Unregister {
        session: String,
    },

    /// Read a session's logs
    Logs {
        session: String,

        #[command(flatten)]
        filter: LogArgs,

        /// Full-text search over the session's history
        #[arg(long)]
        search: Option<String>,
    },

    /// Search logs across sessions
    Search {
        query: String,

        #[arg(long)]
        session: Option<String>,

        #[arg(long)]
        start_ms: Option<u64>,

        #[arg(long)]
        end_ms: Option<u64>,

        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Export a session's logs
    Export {
        session: String,

        #[arg(long, default_value = "text", value_parser = parse_wire::<ExportFormat>)]
        format: ExportFormat,

        #[command(flatten)]
        filter: LogArgs,

        /// Write to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Delete a session's buffered and on-disk logs
    ClearLogs {
        session: String,
    },

    /// Query and export container metrics
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },

    /// Poll a container's stats into the metrics pipeline
    Monitor {
        container: String,

        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Stop polling a container
    Unmonitor {
        container: String,
    },

    /// Show a container's state and health
    Container {
        container: String,

        /// Show resource usage instead of state
        #[arg(long, conflicts_with = "wait")]
        stats: bool,

        /// Wait until the container reaches this state or health status
        #[arg(long)]
        wait: Option<String>,

        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },

    /// Follow a session (or any topic) over the event stream
    Tail {
        /// Session id, or a topic such as `sessions` or `metrics:<container>`
        target: String,

        /// Reconnect attempts before giving up
        #[arg(long, default_value_t = 10)]
        max_retries: u32,

        /// Also print heartbeats
        #[arg(long)]
        heartbeats: bool,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// Session id (generated when omitted)
    #[arg(long)]
    id: Option<String>,

    /// Display name (defaults to the id, or the program name)
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Preferred port
    #[arg(long)]
    port: Option<u16>,

    /// Extra environment, repeatable
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Framework hint for ready detection (next, vite, cra, django, flask, rails, express)
    #[arg(long)]
    framework: Option<String>,

    /// Never restart after an unexpected exit
    #[arg(long)]
    no_restart: bool,

    #[arg(long)]
    max_restarts: Option<u32>,

    #[arg(long)]
    restart_delay_ms: Option<u64>,

    /// Command line, run through the shell
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl SessionArgs {
    fn into_request(self) -> StartSessionRequest {
        let command = self.command.join(" ");
        let name = self
            .name
            .or_else(|| self.id.clone())
            .or_else(|| self.command.first().cloned())
            .unwrap_or_default();
        let restart_policy = if self.no_restart || self.max_restarts.is_some() || self.restart_delay_ms.is_some() {
            let defaults = RestartPolicy::default();
            Some(RestartPolicy {
                enabled: !self.no_restart,
                max_restarts: self.max_restarts.unwrap_or(defaults.max_restarts),
                delay_ms: self.restart_delay_ms.unwrap_or(defaults.delay_ms),
            })
        } else {
            None
        };
        StartSessionRequest {
            id: self.id,
            name,
            command,
            cwd: self.cwd,
            port: self.port,
            env: self.env.into_iter().collect::<BTreeMap<_, _>>(),
            restart_policy,
            framework: self.framework,
        }
    }
}

#[derive(Args)]
struct LogArgs {
    #[arg(long, default_value_t = 100)]
    limit: usize,

    /// Skip this many matching entries, counted from the oldest
    #[arg(long)]
    offset: Option<usize>,

    /// Only entries at or after this epoch-ms timestamp
    #[arg(long)]
    since_ms: Option<u64>,

    #[arg(long, value_parser = parse_wire::<LogStream>)]
    stream: Option<LogStream>,

    #[arg(long, value_parser = parse_wire::<LogLevel>)]
    level: Option<LogLevel>,

    /// Case-insensitive substring filter
    #[arg(long)]
    contains: Option<String>,

    /// Newest first
    #[arg(long)]
    reverse: bool,
}

impl LogArgs {
    fn into_query(self) -> LogQuery {
        LogQuery {
            limit: self.limit,
            offset: self.offset,
            since_ms: self.since_ms,
            filter: LogFilter {
                stream: self.stream,
                min_level: self.level,
                contains: self.contains,
            },
            reverse: self.reverse,
        }
    }
}

#[derive(Args)]
struct RangeArgs {
    /// `container/metric`, repeatable; omit for every series
    #[arg(long = "series")]
    series: Vec<SeriesKey>,

    #[arg(long, default_value_t = 0)]
    start_ms: u64,

    #[arg(long, default_value_t = u64::MAX)]
    end_ms: u64,
}

#[derive(Subcommand)]
enum MetricsAction {
    /// List known series
    Series,

    /// Raw points
    Raw {
        #[command(flatten)]
        range: RangeArgs,
    },

    /// LTTB-downsampled points per series
    Downsampled {
        #[command(flatten)]
        range: RangeArgs,

        #[arg(long, default_value_t = 500)]
        max_points: usize,
    },

    /// The live chart view of one series
    Live {
        series: SeriesKey,

        #[arg(long, default_value_t = 500)]
        max_points: usize,
    },

    /// Bucketed statistics
    Aggregate {
        #[arg(long = "container")]
        containers: Vec<String>,

        #[arg(long = "metric")]
        metrics: Vec<String>,

        #[arg(long, default_value_t = 0)]
        start_ms: u64,

        #[arg(long, default_value_t = u64::MAX)]
        end_ms: u64,

        /// minute, 5minute, 15minute, 30minute, hour or day
        #[arg(long, default_value = "5minute", value_parser = parse_wire::<TimeBucket>)]
        interval: TimeBucket,
    },

    /// Export points as csv or json
    Export {
        #[command(flatten)]
        range: RangeArgs,

        #[arg(long, default_value = "csv", value_parser = parse_wire::<ExportFormat>)]
        format: ExportFormat,

        #[arg(long)]
        include_unit: bool,

        #[arg(long)]
        include_metadata: bool,

        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Push points from a JSON array file (`-` for stdin)
    Ingest {
        file: PathBuf,
    },
}

/// Parse a value by its wire (serde) name.
fn parse_wire<T: DeserializeOwned>(s: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|e| e.to_string())
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

async fn run_metrics(socket: Option<&std::path::Path>, action: MetricsAction) -> Result<()> {
    let req = match action {
        MetricsAction::Series => Request::MetricsSeries,
        MetricsAction::Raw { range } => Request::MetricsRaw {
            series: range.series,
            start_ms: range.start_ms,
            end_ms: range.end_ms,
        },
        MetricsAction::Downsampled { range, max_points } => Request::MetricsDownsampled {
            series: range.series,
            start_ms: range.start_ms,
            end_ms: range.end_ms,
            max_points,
        },
        MetricsAction::Live { series, max_points } => Request::MetricsLive { series, max_points },
        MetricsAction::Aggregate {
            containers,
            metrics,
            start_ms,
            end_ms,
            interval,
        } => {
            return commands::aggregate(
                socket,
                AggregationQuery {
                    container_ids: containers,
                    metric_types: metrics,
                    start_ms,
                    end_ms,
                    interval,
                },
            )
            .await;
        }
        MetricsAction::Export {
            range,
            format,
            include_unit,
            include_metadata,
            output,
        } => {
            let req = Request::MetricsExport {
                series: range.series,
                start_ms: range.start_ms,
                end_ms: range.end_ms,
                format,
                include_unit,
                include_metadata,
            };
            return commands::export(socket, req, output).await;
        }
        MetricsAction::Ingest { file } => return commands::ingest(socket, &file).await,
    };
    commands::print_json(&commands::call(socket, req).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devwatch_cli=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let socket = cli.socket.as_deref();
    let out = Output { json: cli.json };

    match cli.command {
        Commands::Start(args) => {
            commands::session_start(socket, Request::SessionStart(args.into_request()), &out).await
        }
        Commands::Register(args) => {
            commands::session_start(socket, Request::SessionRegister(args.into_request()), &out).await
        }
        Commands::Run { session } => {
            let req = Request::SessionStartRegistered { session_id: session };
            commands::session_start(socket, req, &out).await
        }
        Commands::Stop {
            session,
            force,
            timeout_ms,
        } => {
            let req = Request::SessionStop {
                session_id: session,
                force,
                timeout_ms,
            };
            commands::session_action(socket, req, &out).await
        }
        Commands::Restart { session } => {
            commands::session_action(socket, Request::SessionRestart { session_id: session }, &out).await
        }
        Commands::Status { session } => commands::session_status(socket, session, &out).await,
        Commands::Unregister { session } => {
            commands::session_action(socket, Request::SessionUnregister { session_id: session }, &out).await
        }
        Commands::Logs {
            session,
            filter,
            search,
        } => commands::logs(socket, session, filter.into_query(), search, &out).await,
        Commands::Search {
            query,
            session,
            start_ms,
            end_ms,
            limit,
        } => {
            let req = Request::LogsSearch {
                query,
                session_id: session,
                start_ms,
                end_ms,
                limit,
            };
            commands::search(socket, req, &out).await
        }
        Commands::Export {
            session,
            format,
            filter,
            output,
        } => {
            let req = Request::LogsExport {
                session_id: session,
                format,
                query: filter.into_query(),
            };
            commands::export(socket, req, output).await
        }
        Commands::ClearLogs { session } => {
            let data = commands::call(socket, Request::LogsDelete { session_id: session }).await?;
            commands::print_json(&data)
        }
        Commands::Metrics { action } => run_metrics(socket, action).await,
        Commands::Monitor {
            container,
            interval_ms,
        } => {
            let req = Request::ContainerMonitor {
                container_id: container,
                interval_ms,
            };
            commands::print_json(&commands::call(socket, req).await?)
        }
        Commands::Unmonitor { container } => {
            let req = Request::ContainerUnmonitor { container_id: container };
            commands::print_json(&commands::call(socket, req).await?)
        }
        Commands::Container {
            container,
            stats,
            wait,
            timeout_ms,
        } => {
            let req = match (stats, wait) {
                (true, _) => Request::ContainerStats { container_id: container },
                (false, Some(target)) => Request::ContainerWait {
                    container_id: container,
                    target,
                    timeout_ms,
                },
                (false, None) => Request::ContainerStatus { container_id: container },
            };
            commands::print_json(&commands::call(socket, req).await?)
        }
        Commands::Tail {
            target,
            max_retries,
            heartbeats,
        } => {
            let topic = if target.contains(':') || target == devwatch_protocol::stream::topic::SESSIONS {
                target
            } else {
                devwatch_protocol::stream::topic::session(&target)
            };
            tail::run(tail::TailOptions {
                base_url: cli.url,
                topic,
                policy: ReconnectPolicy {
                    max_attempts: max_retries,
                    ..ReconnectPolicy::default()
                },
                json: cli.json,
                heartbeats,
            })
            .await
        }
    }
}
