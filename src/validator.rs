//! Ingestion Validator.
//!
//! Turns a raw submission into a `Reading` or a `RejectionReason`. Pure: no
//! state is touched, so validating the same input twice yields the same
//! outcome and no side effects.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::ValidatorConfig;
use crate::error::RejectionReason;
use crate::models::{Metric, RawReading, Reading};

// ---

/// Set of device identities allowed to submit telemetry.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    allowed: Option<HashSet<String>>,
}

impl DeviceRegistry {
    /// Accept any device id.
    pub fn open() -> Self {
        Self { allowed: None }
    }

    pub fn with_devices<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: Some(devices.into_iter().map(Into::into).collect()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.allowed.is_none()
    }

    pub fn is_registered(&self, device_id: &str) -> bool {
        self.allowed
            .as_ref()
            .map_or(true, |allowed| allowed.contains(device_id))
    }
}

pub struct Validator {
    cfg: ValidatorConfig,
    registry: DeviceRegistry,
}

impl Validator {
    pub fn new(cfg: ValidatorConfig) -> Self {
        // ---
        let registry = if cfg.registered_devices.is_empty() {
            DeviceRegistry::open()
        } else {
            DeviceRegistry::with_devices(cfg.registered_devices.iter().cloned())
        };
        Self { cfg, registry }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Parse one JSON record against the `RawReading` schema, then validate it.
    pub fn validate_json(
        &self,
        record: &serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Result<Reading, RejectionReason> {
        // ---
        let raw: RawReading = serde_json::from_value(record.clone()).map_err(|e| {
            debug!("Record does not match the telemetry schema: {}", e);
            RejectionReason::Malformed {
                detail: e.to_string(),
            }
        })?;
        self.validate(&raw, received_at)
    }

    pub fn validate(
        &self,
        raw: &RawReading,
        received_at: DateTime<Utc>,
    ) -> Result<Reading, RejectionReason> {
        // ---
        let device_id = raw
            .device_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(RejectionReason::MissingField { field: "device_id" })?;

        let metric_name = raw
            .metric
            .as_deref()
            .ok_or(RejectionReason::MissingField { field: "metric" })?;
        let metric: Metric = metric_name
            .parse()
            .map_err(|_| RejectionReason::UnknownMetric {
                metric: metric_name.to_string(),
            })?;

        let value = raw
            .value
            .ok_or(RejectionReason::MissingField { field: "value" })?;
        if !value.is_finite() {
            return Err(RejectionReason::NonFinite);
        }

        let (min, max) = metric.physical_range();
        if value < min || value > max {
            return Err(RejectionReason::OutOfRange {
                metric,
                value,
                min,
                max,
            });
        }

        if !self.registry.is_registered(device_id) {
            return Err(RejectionReason::UnregisteredDevice {
                device_id: device_id.to_string(),
            });
        }

        let observed_at = raw
            .observed_at
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or(received_at);

        let limit = received_at + self.cfg.max_future_skew;
        if observed_at > limit {
            return Err(RejectionReason::FromFuture { observed_at, limit });
        }

        let floor = received_at - self.cfg.retention_floor;
        if observed_at < floor {
            return Err(RejectionReason::Stale { observed_at, floor });
        }

        Ok(Reading {
            device_id: device_id.to_string(),
            metric,
            value,
            observed_at,
            received_at,
        })
    }
}
