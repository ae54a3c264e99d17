//! Scheduled-update queue with its partial-override and leave child rows.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use aud_schemas::{to_epoch_ms, PartialOverride, ScheduledUpdate, ScheduledUpdateRequest};
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::{ms_to_time, opt_ms_to_time};

/// Result of [`insert_scheduled_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored. `replaced` pending rows for the same (owner, endpoint) were
    /// removed in the same transaction.
    Inserted { replaced: u64 },
    /// A pending row for (owner, endpoint) exists and replacement was not
    /// requested. Nothing was written.
    AlreadyPending,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

/// Insert a queue row and its children atomically.
///
/// With `replace_pending`, existing rows for (owner, update_uri) are deleted
/// first inside the same transaction. Without it, the unique index on
/// (owner, update_uri) rejects the insert and the transaction rolls back.
pub async fn insert_scheduled_update(
    pool: &SqlitePool,
    req: &ScheduledUpdateRequest,
    replace_pending: bool,
) -> Result<InsertOutcome> {
    let u = &req.update;
    let update_id = u.update_id.to_string();

    let mut tx = pool.begin().await.context("insert_scheduled_update begin failed")?;

    let mut replaced = 0u64;
    if replace_pending {
        let res = sqlx::query(
            r#"
            delete from scheduled_updates
            where owner = ? and update_uri = ?
            "#,
        )
        .bind(&u.owner)
        .bind(&u.update_uri)
        .execute(&mut *tx)
        .await
        .context("replace pending scheduled_updates failed")?;
        replaced = res.rows_affected();
    }

    let res = sqlx::query(
        r#"
        insert into scheduled_updates (
          update_id, owner, buyer, update_uri,
          creation_time_ms, scheduled_time_ms, allow_schedule_in_response
        ) values (
          ?, ?, ?, ?, ?, ?, ?
        )
        "#,
    )
    .bind(&update_id)
    .bind(&u.owner)
    .bind(&u.buyer)
    .bind(&u.update_uri)
    .bind(to_epoch_ms(u.creation_time))
    .bind(to_epoch_ms(u.scheduled_time))
    .bind(u.allow_schedule_in_response)
    .execute(&mut *tx)
    .await;

    match res {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            tx.rollback().await.context("insert_scheduled_update rollback failed")?;
            return Ok(InsertOutcome::AlreadyPending);
        }
        Err(e) => return Err(anyhow::Error::new(e).context("insert scheduled_updates failed")),
    }

    for ov in &req.partial_overrides {
        sqlx::query(
            r#"
            insert or replace into partial_overrides (
              update_id, name, activation_time_ms, expiration_time_ms, bidding_signals
            ) values (
              ?, ?, ?, ?, ?
            )
            "#,
        )
        .bind(&update_id)
        .bind(&ov.name)
        .bind(ov.activation_time.map(to_epoch_ms))
        .bind(ov.expiration_time.map(to_epoch_ms))
        .bind(ov.bidding_signals.as_ref().map(|s| s.to_string()))
        .execute(&mut *tx)
        .await
        .context("insert partial_overrides failed")?;
    }

    for name in &req.leaves {
        sqlx::query(
            r#"
            insert or ignore into update_leaves (update_id, name)
            values (?, ?)
            "#,
        )
        .bind(&update_id)
        .bind(name)
        .execute(&mut *tx)
        .await
        .context("insert update_leaves failed")?;
    }

    tx.commit().await.context("insert_scheduled_update commit failed")?;

    Ok(InsertOutcome::Inserted { replaced })
}

fn update_from_row(row: &SqliteRow) -> Result<ScheduledUpdate> {
    let id: String = row.try_get("update_id")?;
    Ok(ScheduledUpdate {
        update_id: Uuid::parse_str(&id).with_context(|| format!("bad update_id: {id}"))?,
        owner: row.try_get("owner")?,
        buyer: row.try_get("buyer")?,
        update_uri: row.try_get("update_uri")?,
        creation_time: ms_to_time(row.try_get("creation_time_ms")?, "creation_time_ms")?,
        scheduled_time: ms_to_time(row.try_get("scheduled_time_ms")?, "scheduled_time_ms")?,
        allow_schedule_in_response: row.try_get("allow_schedule_in_response")?,
    })
}

fn override_from_row(row: &SqliteRow) -> Result<PartialOverride> {
    let signals: Option<String> = row.try_get("bidding_signals")?;
    Ok(PartialOverride {
        name: row.try_get("name")?,
        activation_time: opt_ms_to_time(row.try_get("activation_time_ms")?, "activation_time_ms")?,
        expiration_time: opt_ms_to_time(row.try_get("expiration_time_ms")?, "expiration_time_ms")?,
        bidding_signals: signals
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .context("partial_overrides.bidding_signals decode failed")?,
    })
}

/// Row selector for [`load_requests`].
enum Filter {
    DueBy(i64),
    Owner(String),
}

impl Filter {
    fn clause(&self) -> &'static str {
        match self {
            Filter::DueBy(_) => "scheduled_time_ms <= ?",
            Filter::Owner(_) => "owner = ?",
        }
    }

    fn bind<'q>(
        &self,
        q: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        match self {
            Filter::DueBy(ms) => q.bind(*ms),
            Filter::Owner(owner) => q.bind(owner.clone()),
        }
    }
}

/// Load queue rows matching `filter` together with their children.
async fn load_requests(
    pool: &SqlitePool,
    filter: Filter,
    ctx: &'static str,
) -> Result<Vec<ScheduledUpdateRequest>> {
    let clause = filter.clause();
    let sql = format!(
        r#"
        select update_id, owner, buyer, update_uri,
               creation_time_ms, scheduled_time_ms, allow_schedule_in_response
        from scheduled_updates
        where {clause}
        order by scheduled_time_ms, creation_time_ms, update_id
        "#
    );
    let rows = filter
        .bind(sqlx::query(&sql))
        .fetch_all(pool)
        .await
        .context(ctx)?;

    let mut out: Vec<ScheduledUpdateRequest> = Vec::with_capacity(rows.len());
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    for row in &rows {
        let update = update_from_row(row)?;
        index.insert(update.update_id.to_string(), out.len());
        out.push(ScheduledUpdateRequest {
            update,
            partial_overrides: Vec::new(),
            leaves: Vec::new(),
        });
    }
    if out.is_empty() {
        return Ok(out);
    }

    let sql = format!(
        r#"
        select update_id, name, activation_time_ms, expiration_time_ms, bidding_signals
        from partial_overrides
        where update_id in (select update_id from scheduled_updates where {clause})
        order by update_id, name
        "#
    );
    let rows = filter
        .bind(sqlx::query(&sql))
        .fetch_all(pool)
        .await
        .context(ctx)?;
    for row in &rows {
        let id: String = row.try_get("update_id")?;
        if let Some(&i) = index.get(&id) {
            out[i].partial_overrides.push(override_from_row(row)?);
        }
    }

    let sql = format!(
        r#"
        select update_id, name
        from update_leaves
        where update_id in (select update_id from scheduled_updates where {clause})
        order by update_id, name
        "#
    );
    let rows = filter
        .bind(sqlx::query(&sql))
        .fetch_all(pool)
        .await
        .context(ctx)?;
    for row in &rows {
        let id: String = row.try_get("update_id")?;
        if let Some(&i) = index.get(&id) {
            out[i].leaves.push(row.try_get("name")?);
        }
    }

    Ok(out)
}

/// Queue rows with `scheduled_time <= now`, oldest due first.
pub async fn list_due_updates(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<ScheduledUpdateRequest>> {
    load_requests(pool, Filter::DueBy(to_epoch_ms(now)), "list_due_updates failed").await
}

/// All pending rows for `owner`, due or not.
pub async fn list_updates_for_owner(pool: &SqlitePool, owner: &str) -> Result<Vec<ScheduledUpdateRequest>> {
    load_requests(pool, Filter::Owner(owner.to_string()), "list_updates_for_owner failed").await
}

/// Remove one queue row; children cascade. Returns false when already gone.
pub async fn delete_scheduled_update(pool: &SqlitePool, update_id: Uuid) -> Result<bool> {
    let res = sqlx::query(
        r#"
        delete from scheduled_updates
        where update_id = ?
        "#,
    )
    .bind(update_id.to_string())
    .execute(pool)
    .await
    .context("delete_scheduled_update failed")?;

    Ok(res.rows_affected() > 0)
}

/// Drop every row created strictly before `cutoff` without executing it.
pub async fn delete_updates_created_before(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query(
        r#"
        delete from scheduled_updates
        where creation_time_ms < ?
        "#,
    )
    .bind(to_epoch_ms(cutoff))
    .execute(pool)
    .await
    .context("delete_updates_created_before failed")?;

    Ok(res.rows_affected())
}

pub async fn count_pending_updates(pool: &SqlitePool) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as::<_, (i64,)>("select count(*) from scheduled_updates")
        .fetch_one(pool)
        .await
        .context("count_pending_updates failed")?;
    Ok(n)
}
