//! Rate-limit quarantine table keyed by (owner, buyer).

use anyhow::{Context, Result};
use aud_schemas::{to_epoch_ms, QuarantineEntry};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::ms_to_time;

pub async fn fetch_quarantine(pool: &SqlitePool, owner: &str, buyer: &str) -> Result<Option<QuarantineEntry>> {
    let row = sqlx::query(
        r#"
        select owner, buyer, expiration_ms
        from quarantine
        where owner = ? and buyer = ?
        "#,
    )
    .bind(owner)
    .bind(buyer)
    .fetch_optional(pool)
    .await
    .context("fetch_quarantine failed")?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(QuarantineEntry {
        owner: row.try_get("owner")?,
        buyer: row.try_get("buyer")?,
        expiration: ms_to_time(row.try_get("expiration_ms")?, "expiration_ms")?,
    }))
}

/// Insert, or refresh the expiration of, the entry for (owner, buyer).
pub async fn upsert_quarantine(pool: &SqlitePool, entry: &QuarantineEntry) -> Result<()> {
    sqlx::query(
        r#"
        insert into quarantine (owner, buyer, expiration_ms)
        values (?, ?, ?)
        on conflict (owner, buyer) do update set
          expiration_ms = excluded.expiration_ms
        "#,
    )
    .bind(&entry.owner)
    .bind(&entry.buyer)
    .bind(to_epoch_ms(entry.expiration))
    .execute(pool)
    .await
    .context("upsert_quarantine failed")?;

    Ok(())
}

pub async fn delete_quarantine(pool: &SqlitePool, owner: &str, buyer: &str) -> Result<bool> {
    let res = sqlx::query(
        r#"
        delete from quarantine
        where owner = ? and buyer = ?
        "#,
    )
    .bind(owner)
    .bind(buyer)
    .execute(pool)
    .await
    .context("delete_quarantine failed")?;

    Ok(res.rows_affected() > 0)
}

/// Remove entries whose expiration is at or before `now`. Expired entries
/// never gate a fetch, so this is housekeeping only.
pub async fn purge_expired_quarantine(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query(
        r#"
        delete from quarantine
        where expiration_ms <= ?
        "#,
    )
    .bind(to_epoch_ms(now))
    .execute(pool)
    .await
    .context("purge_expired_quarantine failed")?;

    Ok(res.rows_affected())
}
