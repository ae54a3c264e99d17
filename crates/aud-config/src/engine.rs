//! Typed engine configuration.
//!
//! Every section is optional in YAML; missing keys take the defaults below.

use anyhow::{bail, Context, Result};
use aud_directives::DirectiveLimits;
use aud_fetch::FetchConfig;
use aud_quota::QuotaLimits;
use serde::{Deserialize, Serialize};

use crate::LoadedConfig;

/// Largest accepted `engine.stale_after_hours` (one year).
pub const MAX_STALE_AFTER_HOURS: i64 = 24 * 365;
/// Largest accepted `quarantine.*_retry_after_secs` (one week).
pub const MAX_RETRY_AFTER_SECS: i64 = 7 * 86_400;
/// Largest accepted magnitude for `schedule.*_delay_minutes` (one year).
pub const MAX_DELAY_MINUTES: i64 = 365 * 24 * 60;

/// Pass-level knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassConfig {
    /// Pending updates created longer ago than this are dropped unexecuted.
    pub stale_after_hours: i64,
    /// Upper bound on updates processed concurrently within one pass.
    pub max_concurrent_updates: usize,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            stale_after_hours: 24,
            max_concurrent_updates: 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineConfig {
    /// Used when a 429 carries no usable Retry-After.
    pub default_retry_after_secs: i64,
    /// Retry-After values above this are clamped.
    pub max_retry_after_secs: i64,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            default_retry_after_secs: 30,
            max_retry_after_secs: 3_600,
        }
    }
}

/// Bounds on the delay a caller may request when scheduling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub min_delay_minutes: i64,
    pub max_delay_minutes: i64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            min_delay_minutes: 30,
            max_delay_minutes: 300,
        }
    }
}

/// Full configuration consumed by the reconciliation engine and its binary.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: PassConfig,
    pub quota: QuotaLimits,
    pub directives: DirectiveLimits,
    pub quarantine: QuarantineConfig,
    pub schedule: ScheduleConfig,
    pub fetch: FetchConfig,
}

impl EngineConfig {
    /// Decode from merged config JSON and check cross-field constraints.
    pub fn from_loaded(loaded: &LoadedConfig) -> Result<Self> {
        let cfg: EngineConfig = serde_json::from_value(loaded.config_json.clone())
            .context("engine config decode failed")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrent_updates == 0 {
            bail!("CONFIG_INVALID engine.max_concurrent_updates must be > 0");
        }
        if self.engine.stale_after_hours <= 0 {
            bail!("CONFIG_INVALID engine.stale_after_hours must be > 0");
        }
        if self.engine.stale_after_hours > MAX_STALE_AFTER_HOURS {
            bail!(
                "CONFIG_INVALID engine.stale_after_hours ({}) exceeds {MAX_STALE_AFTER_HOURS}",
                self.engine.stale_after_hours
            );
        }
        for (key, minutes) in [
            ("schedule.min_delay_minutes", self.schedule.min_delay_minutes),
            ("schedule.max_delay_minutes", self.schedule.max_delay_minutes),
        ] {
            if !(-MAX_DELAY_MINUTES..=MAX_DELAY_MINUTES).contains(&minutes) {
                bail!("CONFIG_INVALID {key} ({minutes}) outside +/-{MAX_DELAY_MINUTES}");
            }
        }
        if self.schedule.min_delay_minutes > self.schedule.max_delay_minutes {
            bail!(
                "CONFIG_INVALID schedule.min_delay_minutes ({}) > schedule.max_delay_minutes ({})",
                self.schedule.min_delay_minutes,
                self.schedule.max_delay_minutes
            );
        }
        if self.quarantine.default_retry_after_secs < 0 || self.quarantine.max_retry_after_secs < 0 {
            bail!("CONFIG_INVALID quarantine durations must be >= 0");
        }
        if self.quarantine.max_retry_after_secs > MAX_RETRY_AFTER_SECS {
            bail!(
                "CONFIG_INVALID quarantine.max_retry_after_secs ({}) exceeds {MAX_RETRY_AFTER_SECS}",
                self.quarantine.max_retry_after_secs
            );
        }
        if self.quarantine.default_retry_after_secs > self.quarantine.max_retry_after_secs {
            bail!("CONFIG_INVALID quarantine.default_retry_after_secs exceeds max_retry_after_secs");
        }
        if self.fetch.max_response_bytes == 0 {
            bail!("CONFIG_INVALID fetch.max_response_bytes must be > 0");
        }
        Ok(())
    }
}
