use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

mod audiences;
mod quarantine;
mod queue;

pub use audiences::*;
pub use quarantine::*;
pub use queue::*;

pub const ENV_DB_URL: &str = "AUD_DATABASE_URL";

/// Connect using AUD_DATABASE_URL (e.g. `sqlite://audiences.db`).
pub async fn connect_from_env() -> Result<SqlitePool> {
    let url = std::env::var(ENV_DB_URL)
        .with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

/// Connect to a SQLite database file, creating it when missing.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("invalid sqlite url: {url}"))?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(opts)
        .await
        .context("failed to connect to SQLite")?;

    Ok(pool)
}

/// Private in-memory database. A single long-lived connection holds the data,
/// so the pool never recycles it.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")
        .context("invalid in-memory sqlite url")?
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await
        .context("failed to open in-memory SQLite")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &SqlitePool) -> Result<DbStatus> {
    let (one,): (i64,) = sqlx::query_as::<_, (i64,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
        r#"
        select count(*)
        from sqlite_master
        where type = 'table' and name = 'scheduled_updates'
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    let has_schema = n > 0;
    let pending_updates = if has_schema {
        count_pending_updates(pool).await?
    } else {
        0
    };

    Ok(DbStatus {
        ok,
        has_schema,
        pending_updates,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_schema: bool,
    pub pending_updates: i64,
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

pub(crate) fn ms_to_time(ms: i64, column: &str) -> Result<DateTime<Utc>> {
    aud_schemas::from_epoch_ms(ms).ok_or_else(|| anyhow!("{column} out of range: {ms}"))
}

pub(crate) fn opt_ms_to_time(ms: Option<i64>, column: &str) -> Result<Option<DateTime<Utc>>> {
    ms.map(|v| ms_to_time(v, column)).transpose()
}
