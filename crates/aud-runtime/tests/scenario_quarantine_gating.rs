mod common;

use aud_fetch::FetchResponse;
use chrono::Duration;
use common::*;
use serde_json::json;

#[tokio::test]
async fn zero_retry_after_does_not_block_the_next_pass() -> anyhow::Result<()> {
    let (pool, fetcher, engine) = engine().await;
    engine
        .scheduler()
        .schedule(&due_request(OWNER, URI, vec![], &[]), t0())
        .await?;

    fetcher.push(URI, Ok(FetchResponse::rate_limited(Some(0))));
    fetcher.push(URI, ok(json!({"join": [join_entry(json!({"name": "x", "ads": []}))]})));

    let first = engine.perform_scheduled_updates(t0()).await;
    assert_eq!(first.quarantined, 1);
    let entry = aud_db::fetch_quarantine(&pool, OWNER, BUYER).await?.expect("entry recorded");
    assert_eq!(entry.expiration, t0());
    assert_eq!(aud_db::count_pending_updates(&pool).await?, 1);

    let second = engine.perform_scheduled_updates(t0()).await;
    assert_eq!(second.completed, 1);
    assert_eq!(fetcher.call_count(), 2);

    // A successful exchange clears the scope.
    assert!(aud_db::fetch_quarantine(&pool, OWNER, BUYER).await?.is_none());
    assert!(aud_db::audience_exists(&pool, OWNER, BUYER, "x").await?);
    Ok(())
}

#[tokio::test]
async fn quarantined_scope_is_not_fetched_until_expiry() -> anyhow::Result<()> {
    let (pool, fetcher, engine) = engine().await;
    engine
        .scheduler()
        .schedule(&due_request(OWNER, URI, vec![], &[]), t0())
        .await?;

    fetcher.push(URI, Ok(FetchResponse::rate_limited(Some(60))));
    fetcher.push(URI, ok(json!({})));

    engine.perform_scheduled_updates(t0()).await;
    assert_eq!(fetcher.call_count(), 1);

    let gated = engine.perform_scheduled_updates(t0() + Duration::seconds(30)).await;
    assert_eq!(gated.quarantined, 1);
    assert_eq!(fetcher.call_count(), 1);
    assert_eq!(aud_db::count_pending_updates(&pool).await?, 1);

    let after = engine.perform_scheduled_updates(t0() + Duration::seconds(60)).await;
    assert_eq!(after.completed, 1);
    assert_eq!(fetcher.call_count(), 2);
    Ok(())
}

#[tokio::test]
async fn quarantine_is_scoped_to_owner_and_buyer() -> anyhow::Result<()> {
    let (_pool, fetcher, engine) = engine().await;
    engine
        .quarantine()
        .record_rate_limited(OWNER, BUYER, Some(600), t0())
        .await?;

    let other_buyer = "https://c.example/update";
    for (owner, uri) in [(OWNER, URI), ("B", URI), (OWNER, other_buyer)] {
        engine
            .scheduler()
            .schedule(&due_request(owner, uri, vec![], &[]), t0())
            .await?;
    }
    fetcher.push(URI, ok(json!({})));
    fetcher.push(other_buyer, ok(json!({})));

    let summary = engine.perform_scheduled_updates(t0()).await;
    assert_eq!(summary.quarantined, 1);
    assert_eq!(summary.completed, 2);
    assert_eq!(fetcher.call_count(), 2);
    Ok(())
}

#[tokio::test]
async fn missing_retry_hint_uses_the_default_and_repeat_refreshes() -> anyhow::Result<()> {
    let (pool, fetcher, engine) = engine().await;
    let default_secs = engine.config().quarantine.default_retry_after_secs;
    engine
        .scheduler()
        .schedule(&due_request(OWNER, URI, vec![], &[]), t0())
        .await?;

    fetcher.push(URI, Ok(FetchResponse::rate_limited(None)));
    fetcher.push(URI, Ok(FetchResponse::rate_limited(Some(120))));

    engine.perform_scheduled_updates(t0()).await;
    let first = aud_db::fetch_quarantine(&pool, OWNER, BUYER).await?.expect("entry");
    assert_eq!(first.expiration, t0() + Duration::seconds(default_secs));

    let later = first.expiration;
    engine.perform_scheduled_updates(later).await;
    let refreshed = aud_db::fetch_quarantine(&pool, OWNER, BUYER).await?.expect("entry");
    assert_eq!(refreshed.expiration, later + Duration::seconds(120));

    // The request keeps its original creation time while it waits.
    let pending = engine.scheduler().list_pending_for_owner(OWNER).await?;
    assert_eq!(pending[0].update.creation_time, t0());
    Ok(())
}

#[tokio::test]
async fn unusable_body_leaves_quarantine_untouched() -> anyhow::Result<()> {
    let (pool, fetcher, engine) = engine().await;
    let exp = engine
        .quarantine()
        .record_rate_limited(OWNER, BUYER, Some(10), t0() - Duration::minutes(5))
        .await?;
    engine
        .scheduler()
        .schedule(&due_request(OWNER, URI, vec![], &[]), t0())
        .await?;
    fetcher.push(URI, Ok(FetchResponse::ok("nope")));

    let summary = engine.perform_scheduled_updates(t0()).await;
    assert_eq!(summary.malformed_dropped, 1);
    let entry = aud_db::fetch_quarantine(&pool, OWNER, BUYER).await?.expect("kept");
    assert_eq!(entry.expiration, exp);
    Ok(())
}
