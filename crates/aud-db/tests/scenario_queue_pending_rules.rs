use aud_db::InsertOutcome;
use aud_schemas::{from_epoch_ms, PartialOverride, ScheduledUpdate, ScheduledUpdateRequest};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

fn t0() -> DateTime<Utc> {
    from_epoch_ms(1_750_000_000_000).expect("valid instant")
}

fn request(owner: &str, uri: &str, created: DateTime<Utc>, due: DateTime<Utc>) -> ScheduledUpdateRequest {
    let mut ov = PartialOverride::named("x");
    ov.bidding_signals = Some(serde_json::json!({"s": 1}));
    ov.expiration_time = Some(t0() + Duration::days(3));

    ScheduledUpdateRequest {
        update: ScheduledUpdate {
            update_id: Uuid::new_v4(),
            owner: owner.to_string(),
            buyer: "buyer.example".to_string(),
            update_uri: uri.to_string(),
            creation_time: created,
            scheduled_time: due,
            allow_schedule_in_response: true,
        },
        partial_overrides: vec![ov, PartialOverride::named("y")],
        leaves: vec!["gone".to_string(), "gone".to_string(), "old".to_string()],
    }
}

#[tokio::test]
async fn duplicate_pending_is_rejected_unless_replacing() -> anyhow::Result<()> {
    let pool = aud_db::connect_in_memory().await?;
    aud_db::migrate(&pool).await?;

    let uri = "https://buyer.example/update";
    let first = request("A", uri, t0(), t0());
    let second = request("A", uri, t0(), t0());

    assert_eq!(
        aud_db::insert_scheduled_update(&pool, &first, false).await?,
        InsertOutcome::Inserted { replaced: 0 }
    );
    assert_eq!(
        aud_db::insert_scheduled_update(&pool, &second, false).await?,
        InsertOutcome::AlreadyPending
    );

    // Rejected insert left no partial rows behind.
    let pending = aud_db::list_updates_for_owner(&pool, "A").await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].update.update_id, first.update.update_id);

    assert_eq!(
        aud_db::insert_scheduled_update(&pool, &second, true).await?,
        InsertOutcome::Inserted { replaced: 1 }
    );
    let pending = aud_db::list_updates_for_owner(&pool, "A").await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].update.update_id, second.update.update_id);

    // Same endpoint, different owner is a separate scope.
    assert_eq!(
        aud_db::insert_scheduled_update(&pool, &request("other", uri, t0(), t0()), false).await?,
        InsertOutcome::Inserted { replaced: 0 }
    );

    Ok(())
}

#[tokio::test]
async fn children_roundtrip_with_deduplicated_leaves() -> anyhow::Result<()> {
    let pool = aud_db::connect_in_memory().await?;
    aud_db::migrate(&pool).await?;

    let req = request("A", "https://buyer.example/u", t0(), t0());
    aud_db::insert_scheduled_update(&pool, &req, false).await?;

    let due = aud_db::list_due_updates(&pool, t0()).await?;
    assert_eq!(due.len(), 1);
    let got = &due[0];
    assert_eq!(got.update, req.update);
    assert_eq!(got.partial_overrides, req.partial_overrides);
    assert_eq!(got.leaves, vec!["gone", "old"]);

    Ok(())
}

#[tokio::test]
async fn due_listing_and_stale_deletion_use_their_own_clocks() -> anyhow::Result<()> {
    let pool = aud_db::connect_in_memory().await?;
    aud_db::migrate(&pool).await?;

    let due_now = request("A", "https://b.example/1", t0(), t0());
    let due_later = request("A", "https://b.example/2", t0(), t0() + Duration::hours(1));
    let ancient = request("A", "https://b.example/3", t0() - Duration::days(2), t0());
    for r in [&due_now, &due_later, &ancient] {
        aud_db::insert_scheduled_update(&pool, r, false).await?;
    }

    assert_eq!(aud_db::list_due_updates(&pool, t0()).await?.len(), 2);

    let removed = aud_db::delete_updates_created_before(&pool, t0() - Duration::hours(24)).await?;
    assert_eq!(removed, 1);

    let due: Vec<Uuid> = aud_db::list_due_updates(&pool, t0())
        .await?
        .into_iter()
        .map(|r| r.update.update_id)
        .collect();
    assert_eq!(due, vec![due_now.update.update_id]);
    assert_eq!(aud_db::count_pending_updates(&pool).await?, 2);

    assert!(aud_db::delete_scheduled_update(&pool, due_now.update.update_id).await?);
    assert!(!aud_db::delete_scheduled_update(&pool, due_now.update.update_id).await?);

    Ok(())
}
