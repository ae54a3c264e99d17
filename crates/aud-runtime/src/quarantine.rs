use anyhow::{Context, Result};
use aud_config::QuarantineConfig;
use aud_schemas::QuarantineEntry;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::info;

/// Persistent (owner, buyer) -> expiration map gating outbound fetches.
#[derive(Clone, Debug)]
pub struct QuarantineTracker {
    pool: SqlitePool,
    cfg: QuarantineConfig,
}

impl QuarantineTracker {
    pub fn new(pool: SqlitePool, cfg: QuarantineConfig) -> Self {
        Self { pool, cfg }
    }

    /// True while `now` is strictly before the stored expiration.
    pub async fn is_quarantined(&self, owner: &str, buyer: &str, now: DateTime<Utc>) -> Result<bool> {
        let entry = aud_db::fetch_quarantine(&self.pool, owner, buyer).await?;
        Ok(entry.is_some_and(|e| now < e.expiration))
    }

    /// Backoff for a rate-limit response. Missing or negative hints fall back
    /// to the default; large hints are clamped.
    ///
    /// `None` when the delay does not fit in a [`Duration`].
    pub fn retry_delay(&self, retry_after_secs: Option<i64>) -> Option<Duration> {
        let secs = match retry_after_secs {
            Some(s) if s >= 0 => s.min(self.cfg.max_retry_after_secs),
            _ => self.cfg.default_retry_after_secs,
        };
        Duration::try_seconds(secs)
    }

    /// Insert or refresh the entry. Returns the new expiration.
    pub async fn record_rate_limited(
        &self,
        owner: &str,
        buyer: &str,
        retry_after_secs: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let expiration = self
            .retry_delay(retry_after_secs)
            .and_then(|d| now.checked_add_signed(d))
            .with_context(|| format!("retry delay {retry_after_secs:?}s out of range"))?;
        aud_db::upsert_quarantine(
            &self.pool,
            &QuarantineEntry {
                owner: owner.to_string(),
                buyer: buyer.to_string(),
                expiration,
            },
        )
        .await?;
        info!(owner, buyer, retry_after_secs = ?retry_after_secs, %expiration, "scope quarantined");
        Ok(expiration)
    }

    /// Drop the entry, if any. Returns whether one existed.
    pub async fn clear(&self, owner: &str, buyer: &str) -> Result<bool> {
        let removed = aud_db::delete_quarantine(&self.pool, owner, buyer).await?;
        if removed {
            info!(owner, buyer, "quarantine cleared");
        }
        Ok(removed)
    }
}
