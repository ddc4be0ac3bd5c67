//! Supervision and telemetry core for devwatch.
//!
//! [`context::Devwatch`] wires the components together: the supervisor
//! drives sessions through their lifecycle, captured output flows into the
//! log manager, container stats flow into the metrics aggregator, and both
//! publish onto the streaming broker.

pub mod broker;
pub mod config;
pub mod context;
mod csv;
pub mod error;
pub mod handler;
pub mod health;
pub mod logs;
pub mod metrics;
pub mod ports;
pub mod registry;
pub mod ring;
pub mod supervisor;
pub mod sweeper;

pub use broker::{StreamingBroker, SubscriptionId, Transport};
pub use config::DevwatchConfig;
pub use context::Devwatch;
pub use error::{DevwatchError, Result};
pub use handler::{dispatch, error_response, ok_response};
pub use supervisor::Supervisor;
