//! Audience membership store.
//!
//! Every write is a single statement, so each upsert or delete is atomic on
//! its own. Callers never hold a transaction across records.

use anyhow::{Context, Result};
use aud_schemas::{to_epoch_ms, AdEntry, MembershipRecord, TrustedBiddingData};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::ms_to_time;

const SELECT_COLUMNS: &str = r#"
    select
      owner,
      buyer,
      name,
      activation_time_ms,
      expiration_time_ms,
      creation_time_ms,
      updated_time_ms,
      daily_update_uri,
      bidding_logic_uri,
      bidding_signals,
      trusted_bidding_uri,
      trusted_bidding_keys_json,
      ads_json,
      priority,
      auction_server_request_flags
    from audiences
"#;

fn record_from_row(row: &SqliteRow) -> Result<MembershipRecord> {
    let ads_json: String = row.try_get("ads_json")?;
    let ads: Vec<AdEntry> = serde_json::from_str(&ads_json).context("ads_json decode failed")?;
    let keys_json: String = row.try_get("trusted_bidding_keys_json")?;
    let keys: Vec<String> =
        serde_json::from_str(&keys_json).context("trusted_bidding_keys_json decode failed")?;
    let flags: i64 = row.try_get("auction_server_request_flags")?;

    Ok(MembershipRecord {
        owner: row.try_get("owner")?,
        buyer: row.try_get("buyer")?,
        name: row.try_get("name")?,
        activation_time: ms_to_time(row.try_get("activation_time_ms")?, "activation_time_ms")?,
        expiration_time: ms_to_time(row.try_get("expiration_time_ms")?, "expiration_time_ms")?,
        creation_time: ms_to_time(row.try_get("creation_time_ms")?, "creation_time_ms")?,
        updated_time: ms_to_time(row.try_get("updated_time_ms")?, "updated_time_ms")?,
        daily_update_uri: row.try_get("daily_update_uri")?,
        bidding_logic_uri: row.try_get("bidding_logic_uri")?,
        bidding_signals: row.try_get("bidding_signals")?,
        trusted_bidding_data: TrustedBiddingData {
            uri: row.try_get("trusted_bidding_uri")?,
            keys,
        },
        ads,
        priority: row.try_get("priority")?,
        auction_server_request_flags: u32::try_from(flags)
            .context("auction_server_request_flags out of range")?,
    })
}

/// Insert or wholly replace the record keyed by (owner, buyer, name).
pub async fn upsert_audience(pool: &SqlitePool, rec: &MembershipRecord) -> Result<()> {
    let ads_json = serde_json::to_string(&rec.ads).context("ads encode failed")?;
    let keys_json = serde_json::to_string(&rec.trusted_bidding_data.keys)
        .context("trusted bidding keys encode failed")?;

    sqlx::query(
        r#"
        insert into audiences (
          owner, buyer, name,
          activation_time_ms, expiration_time_ms, creation_time_ms, updated_time_ms,
          daily_update_uri, bidding_logic_uri, bidding_signals,
          trusted_bidding_uri, trusted_bidding_keys_json,
          ads_json, priority, auction_server_request_flags
        ) values (
          ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
        )
        on conflict (owner, buyer, name) do update set
          activation_time_ms = excluded.activation_time_ms,
          expiration_time_ms = excluded.expiration_time_ms,
          creation_time_ms = excluded.creation_time_ms,
          updated_time_ms = excluded.updated_time_ms,
          daily_update_uri = excluded.daily_update_uri,
          bidding_logic_uri = excluded.bidding_logic_uri,
          bidding_signals = excluded.bidding_signals,
          trusted_bidding_uri = excluded.trusted_bidding_uri,
          trusted_bidding_keys_json = excluded.trusted_bidding_keys_json,
          ads_json = excluded.ads_json,
          priority = excluded.priority,
          auction_server_request_flags = excluded.auction_server_request_flags
        "#,
    )
    .bind(&rec.owner)
    .bind(&rec.buyer)
    .bind(&rec.name)
    .bind(to_epoch_ms(rec.activation_time))
    .bind(to_epoch_ms(rec.expiration_time))
    .bind(to_epoch_ms(rec.creation_time))
    .bind(to_epoch_ms(rec.updated_time))
    .bind(&rec.daily_update_uri)
    .bind(&rec.bidding_logic_uri)
    .bind(&rec.bidding_signals)
    .bind(&rec.trusted_bidding_data.uri)
    .bind(keys_json)
    .bind(ads_json)
    .bind(rec.priority)
    .bind(i64::from(rec.auction_server_request_flags))
    .execute(pool)
    .await
    .context("upsert_audience failed")?;

    Ok(())
}

/// Delete one record. Returns false when nothing matched; a missing record
/// is not an error.
pub async fn delete_audience(pool: &SqlitePool, owner: &str, buyer: &str, name: &str) -> Result<bool> {
    let res = sqlx::query(
        r#"
        delete from audiences
        where owner = ? and buyer = ? and name = ?
        "#,
    )
    .bind(owner)
    .bind(buyer)
    .bind(name)
    .execute(pool)
    .await
    .context("delete_audience failed")?;

    Ok(res.rows_affected() > 0)
}

pub async fn audience_exists(pool: &SqlitePool, owner: &str, buyer: &str, name: &str) -> Result<bool> {
    let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
        r#"
        select count(*)
        from audiences
        where owner = ? and buyer = ? and name = ?
        "#,
    )
    .bind(owner)
    .bind(buyer)
    .bind(name)
    .fetch_one(pool)
    .await
    .context("audience_exists failed")?;

    Ok(n > 0)
}

pub async fn fetch_audience(
    pool: &SqlitePool,
    owner: &str,
    buyer: &str,
    name: &str,
) -> Result<Option<MembershipRecord>> {
    let sql = format!("{SELECT_COLUMNS} where owner = ? and buyer = ? and name = ?");
    let row = sqlx::query(&sql)
        .bind(owner)
        .bind(buyer)
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("fetch_audience failed")?;

    row.as_ref().map(record_from_row).transpose()
}

/// All records held for `owner`, ordered by (buyer, name).
pub async fn list_audiences_for_owner(pool: &SqlitePool, owner: &str) -> Result<Vec<MembershipRecord>> {
    let sql = format!("{SELECT_COLUMNS} where owner = ? order by buyer, name");
    let rows = sqlx::query(&sql)
        .bind(owner)
        .fetch_all(pool)
        .await
        .context("list_audiences_for_owner failed")?;

    rows.iter().map(record_from_row).collect()
}

/// Records for `owner` that are activated and unexpired at `now`.
/// Expired rows stay in the table; they are only filtered here.
pub async fn list_active_audiences(
    pool: &SqlitePool,
    owner: &str,
    now: DateTime<Utc>,
) -> Result<Vec<MembershipRecord>> {
    let sql = format!(
        "{SELECT_COLUMNS} where owner = ? and activation_time_ms <= ? and expiration_time_ms > ? \
         order by buyer, name"
    );
    let now_ms = to_epoch_ms(now);
    let rows = sqlx::query(&sql)
        .bind(owner)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_all(pool)
        .await
        .context("list_active_audiences failed")?;

    rows.iter().map(record_from_row).collect()
}

/// Store-wide counts used for quota decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudienceCounts {
    pub total: i64,
    pub owner: i64,
    pub owner_buyer: i64,
    pub distinct_owners: i64,
}

pub async fn audience_counts(pool: &SqlitePool, owner: &str, buyer: &str) -> Result<AudienceCounts> {
    let row = sqlx::query(
        r#"
        select
          (select count(*) from audiences) as total,
          (select count(*) from audiences where owner = ?) as owner_count,
          (select count(*) from audiences where owner = ? and buyer = ?) as owner_buyer_count,
          (select count(distinct owner) from audiences) as distinct_owners
        "#,
    )
    .bind(owner)
    .bind(owner)
    .bind(buyer)
    .fetch_one(pool)
    .await
    .context("audience_counts failed")?;

    Ok(AudienceCounts {
        total: row.try_get("total")?,
        owner: row.try_get("owner_count")?,
        owner_buyer: row.try_get("owner_buyer_count")?,
        distinct_owners: row.try_get("distinct_owners")?,
    })
}
