//! Configuration loader for the `envwatch` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). Pipeline parameters that the product has not
//! pinned down (grace period, hysteresis gap, escalation timing) live here
//! rather than being hardcoded in the stages that use them.
//!
use std::env;
use std::net::SocketAddr;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use chrono::Duration;

/// Parse an optional environment variable into `$ty`, with a default value.
macro_rules! parse_env {
    ($var_name:expr, $ty:ty, $default:expr) => {
        env::var($var_name)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional whole-seconds environment variable into a positive
/// `chrono::Duration`. The `allow_zero` form also accepts `0`.
macro_rules! parse_env_secs {
    ($var_name:expr, $default_secs:expr) => {
        checked_secs($var_name, parse_env!($var_name, i64, $default_secs), false)?
    };
    ($var_name:expr, $default_secs:expr, allow_zero) => {
        checked_secs($var_name, parse_env!($var_name, i64, $default_secs), true)?
    };
}

fn checked_secs(var_name: &str, secs: i64, allow_zero: bool) -> Result<Duration> {
    // ---
    if secs < 0 || (secs == 0 && !allow_zero) {
        let bound = if allow_zero { "zero or more" } else { "positive" };
        return Err(anyhow!("Invalid {}: {} (must be {})", var_name, secs, bound));
    }
    Duration::try_seconds(secs).ok_or_else(|| anyhow!("Invalid {}: {} is out of range", var_name, secs))
}

// ---

/// Ingestion Validator settings.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// How far in the future `observed_at` may be relative to `received_at`.
    pub max_future_skew: Duration,
    /// Readings older than this (relative to `received_at`) are refused.
    pub retention_floor: Duration,
    /// Registered device identities; empty means open registration.
    pub registered_devices: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_future_skew: Duration::hours(24),
            retention_floor: Duration::days(30),
            registered_devices: Vec::new(),
        }
    }
}

/// Aggregation Engine settings.
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Time after a bucket's nominal close during which it stays open.
    pub grace_period: Duration,
    /// Length of one rolling-statistics epoch; the effective window spans
    /// between one and two epochs.
    pub rolling_window: Duration,
    /// How much per-series minute history is kept for correlation.
    pub correlation_horizon: Duration,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::minutes(5),
            rolling_window: Duration::hours(24),
            correlation_horizon: Duration::days(7),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    /// |z| above which a reading is statistically anomalous.
    pub z_bound: f64,
    /// Samples a series needs before it is scored at all.
    pub min_samples: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            z_bound: 3.0,
            min_samples: 30,
        }
    }
}

/// Alert Lifecycle Manager settings.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Minimum time between re-notifications of the same alert.
    pub cooldown: Duration,
    /// Re-notify whenever `trigger_count` reaches a multiple of this.
    pub renotify_every: u32,
    /// Open alerts unacknowledged this long become escalated.
    pub escalation_timeout: Duration,
    /// Sustained quiet time before an alert auto-closes.
    pub quiet_period: Duration,
    /// Auto-closed alerts older than this are archived.
    pub retention: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::minutes(15),
            renotify_every: 10,
            escalation_timeout: Duration::minutes(30),
            quiet_period: Duration::minutes(10),
            retention: Duration::days(90),
        }
    }
}

/// Bounded exponential backoff for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: StdDuration,
    pub max_delay: StdDuration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: StdDuration::from_millis(50),
            max_delay: StdDuration::from_secs(2),
        }
    }
}

/// Everything the library pipeline needs, independent of the HTTP binary.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub validator: ValidatorConfig,
    pub aggregation: AggregationConfig,
    pub anomaly: AnomalyConfig,
    pub alerts: AlertConfig,
    /// Default deactivation bounds sit this fraction inside the activation bound.
    pub hysteresis_ratio: f64,
    /// Overlapping minutes a pair of series needs before a coefficient is reported.
    pub min_correlation_overlap: usize,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            validator: ValidatorConfig::default(),
            aggregation: AggregationConfig::default(),
            anomaly: AnomalyConfig::default(),
            alerts: AlertConfig::default(),
            hysteresis_ratio: 0.05,
            min_correlation_overlap: 10,
            retry: RetryPolicy::default(),
        }
    }
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string; the in-memory store is used when unset.
    pub db_url: Option<String>,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Address the HTTP server binds to.
    pub bind_addr: SocketAddr,

    /// Period of the background escalation/closure sweep.
    pub sweep_interval: StdDuration,

    pub pipeline: PipelineConfig,
}

/// Load configuration from environment variables with defaults.
///
/// Optional:
/// - `DATABASE_URL` – PostgreSQL connection string (default: in-memory store)
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `BIND_ADDR` – listen address (default: 0.0.0.0:8080)
/// - `REGISTERED_DEVICES` – comma separated device ids (default: open)
/// - `MAX_FUTURE_SKEW_SECS`, `RETENTION_FLOOR_SECS` – ingestion time bounds
/// - `GRACE_PERIOD_SECS`, `ROLLING_WINDOW_SECS`, `CORRELATION_HORIZON_SECS`
/// - `Z_BOUND`, `MIN_ANOMALY_SAMPLES` – anomaly detector
/// - `HYSTERESIS_RATIO` – default hysteresis gap as a fraction of the bound
/// - `ALERT_COOLDOWN_SECS`, `RENOTIFY_EVERY`, `ESCALATION_TIMEOUT_SECS`,
///   `QUIET_PERIOD_SECS`, `ALERT_RETENTION_SECS` – alert lifecycle
/// - `MIN_CORRELATION_OVERLAP` – correlation module
/// - `STORE_RETRY_ATTEMPTS`, `STORE_RETRY_BASE_MS` – persistence retries
/// - `SWEEP_INTERVAL_SECS` – background sweeper period (default: 30)
///
/// Every `*_SECS` value must be positive; `GRACE_PERIOD_SECS` and
/// `ALERT_COOLDOWN_SECS` may also be zero.
///
/// Returns an error if any variable is present but invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let defaults = PipelineConfig::default();

    let db_url = env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty());
    let db_pool_max = parse_env!("DB_POOL_MAX", u32, 5);
    let bind_addr = parse_env!("BIND_ADDR", SocketAddr, SocketAddr::from(([0, 0, 0, 0], 8080)));
    let sweep_secs = parse_env!("SWEEP_INTERVAL_SECS", u64, 30);
    if sweep_secs == 0 {
        return Err(anyhow!("Invalid SWEEP_INTERVAL_SECS: 0 (must be positive)"));
    }
    let sweep_interval = StdDuration::from_secs(sweep_secs);

    let registered_devices = env::var("REGISTERED_DEVICES")
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let validator = ValidatorConfig {
        max_future_skew: parse_env_secs!("MAX_FUTURE_SKEW_SECS", 24 * 3600),
        retention_floor: parse_env_secs!("RETENTION_FLOOR_SECS", 30 * 24 * 3600),
        registered_devices,
    };

    let aggregation = AggregationConfig {
        grace_period: parse_env_secs!("GRACE_PERIOD_SECS", 300, allow_zero),
        rolling_window: parse_env_secs!("ROLLING_WINDOW_SECS", 24 * 3600),
        correlation_horizon: parse_env_secs!("CORRELATION_HORIZON_SECS", 7 * 24 * 3600),
    };

    let anomaly = AnomalyConfig {
        z_bound: parse_env!("Z_BOUND", f64, defaults.anomaly.z_bound),
        min_samples: parse_env!("MIN_ANOMALY_SAMPLES", u64, defaults.anomaly.min_samples),
    };
    if !(anomaly.z_bound.is_finite() && anomaly.z_bound > 0.0) {
        return Err(anyhow!("Invalid Z_BOUND: {} (must be positive)", anomaly.z_bound));
    }

    let alerts = AlertConfig {
        cooldown: parse_env_secs!("ALERT_COOLDOWN_SECS", 15 * 60, allow_zero),
        renotify_every: parse_env!("RENOTIFY_EVERY", u32, defaults.alerts.renotify_every).max(1),
        escalation_timeout: parse_env_secs!("ESCALATION_TIMEOUT_SECS", 30 * 60),
        quiet_period: parse_env_secs!("QUIET_PERIOD_SECS", 10 * 60),
        retention: parse_env_secs!("ALERT_RETENTION_SECS", 90 * 24 * 3600),
    };

    let hysteresis_ratio = parse_env!("HYSTERESIS_RATIO", f64, defaults.hysteresis_ratio);
    if !(0.0..1.0).contains(&hysteresis_ratio) || hysteresis_ratio == 0.0 {
        return Err(anyhow!(
            "Invalid HYSTERESIS_RATIO: {} (must be in (0, 1))",
            hysteresis_ratio
        ));
    }

    let retry = RetryPolicy {
        attempts: parse_env!("STORE_RETRY_ATTEMPTS", u32, defaults.retry.attempts).max(1),
        base_delay: StdDuration::from_millis(parse_env!("STORE_RETRY_BASE_MS", u64, 50)),
        max_delay: defaults.retry.max_delay,
    };

    let pipeline = PipelineConfig {
        validator,
        aggregation,
        anomaly,
        alerts,
        hysteresis_ratio,
        min_correlation_overlap: parse_env!(
            "MIN_CORRELATION_OVERLAP",
            usize,
            defaults.min_correlation_overlap
        ),
        retry,
    };

    Ok(Config {
        db_url,
        db_pool_max,
        bind_addr,
        sweep_interval,
        pipeline,
    })
}

impl Config {
    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        let p = &self.pipeline;
        let db = match &self.db_url {
            Some(url) => mask_db_url(url),
            None => "<unset: in-memory store>".to_string(),
        };
        let devices = if p.validator.registered_devices.is_empty() {
            "<open registration>".to_string()
        } else {
            p.validator.registered_devices.join(",")
        };

        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL            : {}", db);
        tracing::info!("  DB_POOL_MAX             : {}", self.db_pool_max);
        tracing::info!("  BIND_ADDR               : {}", self.bind_addr);
        tracing::info!("  REGISTERED_DEVICES      : {}", devices);
        tracing::info!("  MAX_FUTURE_SKEW_SECS    : {}", p.validator.max_future_skew.num_seconds());
        tracing::info!("  RETENTION_FLOOR_SECS    : {}", p.validator.retention_floor.num_seconds());
        tracing::info!("  GRACE_PERIOD_SECS       : {}", p.aggregation.grace_period.num_seconds());
        tracing::info!("  ROLLING_WINDOW_SECS     : {}", p.aggregation.rolling_window.num_seconds());
        tracing::info!("  Z_BOUND                 : {}", p.anomaly.z_bound);
        tracing::info!("  MIN_ANOMALY_SAMPLES     : {}", p.anomaly.min_samples);
        tracing::info!("  HYSTERESIS_RATIO        : {}", p.hysteresis_ratio);
        tracing::info!("  ALERT_COOLDOWN_SECS     : {}", p.alerts.cooldown.num_seconds());
        tracing::info!("  RENOTIFY_EVERY          : {}", p.alerts.renotify_every);
        tracing::info!("  ESCALATION_TIMEOUT_SECS : {}", p.alerts.escalation_timeout.num_seconds());
        tracing::info!("  QUIET_PERIOD_SECS       : {}", p.alerts.quiet_period.num_seconds());
        tracing::info!("  STORE_RETRY_ATTEMPTS    : {}", p.retry.attempts);
        tracing::info!("  SWEEP_INTERVAL_SECS     : {}", self.sweep_interval.as_secs());
    }
}

/// Mask the password in a database URL for logging.
fn mask_db_url(url: &str) -> String {
    // ---
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            return format!("{}:****{}", &url[..colon_pos], &url[at_pos..]);
        }
    }
    url.to_string()
}
