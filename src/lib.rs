//! `envwatch`: ingestion-to-alert pipeline for environmental sensor telemetry.
//!
//! This crate is the gateway for all pipeline stages (EMBP). The stage
//! modules are public so their types can be named directly; the commonly
//! used ones are also re-exported here, so most callers only need
//! `envwatch::Monitor` and friends. Only internal plumbing (`locks`, `retry`)
//! is private.
//!
//! The `routes` module adapts `Monitor` to HTTP; `schema` bootstraps the
//! PostgreSQL tables used by `PgStore`.

pub mod aggregation;
pub mod alerts;
pub mod anomaly;
pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod models;
pub mod monitor;
pub mod routes;
pub mod schema;
pub mod store;
pub mod summary;
pub mod thresholds;
pub mod validator;

mod locks;
mod retry;

pub use alerts::{AlertQuery, AlertSummary, SystemStatus};
pub use config::{load_from_env, Config, PipelineConfig};
pub use error::{MonitorError, RejectionReason};
pub use events::{CoreEvent, HealthReport, NotificationChannel};
pub use models::{Alert, AlertState, Granularity, Metric, Reading, Severity};
pub use monitor::{ContextSnapshot, Monitor, RecordOutcome};
pub use store::{MemoryStore, PgStore, Store};
pub use summary::{DailyMetricStats, DailySummary};
pub use thresholds::{Band, Direction, ThresholdConfig};
