//! Field validators for fused records and owner-supplied overrides.
//!
//! All time arithmetic is done in epoch milliseconds with saturating math so
//! that hostile timestamps can never overflow.

use aud_schemas::{to_epoch_ms, MembershipRecord, PartialOverride};
use chrono::{DateTime, Utc};

use crate::limits::secs_to_ms;
use crate::{DirectiveLimits, DropReason};

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

pub(crate) fn check_name(name: &str, limits: &DirectiveLimits) -> Result<(), DropReason> {
    if name.is_empty() || name.len() > limits.max_name_size_b {
        return Err(DropReason::Name);
    }
    Ok(())
}

fn check_uris(rec: &MembershipRecord) -> Result<(), DropReason> {
    if rec.daily_update_uri.is_empty() || rec.bidding_logic_uri.is_empty() {
        return Err(DropReason::Uris);
    }
    Ok(())
}

fn check_trusted_bidding_data(
    rec: &MembershipRecord,
    limits: &DirectiveLimits,
) -> Result<(), DropReason> {
    let data = &rec.trusted_bidding_data;
    if data.uri.is_empty() {
        return Err(DropReason::TrustedBiddingData);
    }
    let size = serde_json::to_vec(data)
        .map_err(|_| DropReason::TrustedBiddingData)?
        .len();
    if size > limits.max_trusted_bidding_data_size_b {
        return Err(DropReason::TrustedBiddingData);
    }
    Ok(())
}

/// Signals text must be empty (none supplied) or a JSON object within size.
pub(crate) fn check_bidding_signals(
    signals: &str,
    limits: &DirectiveLimits,
) -> Result<(), DropReason> {
    if signals.is_empty() {
        return Ok(());
    }
    if signals.len() > limits.max_bidding_signals_size_b {
        return Err(DropReason::BiddingSignals);
    }
    match serde_json::from_str::<serde_json::Value>(signals) {
        Ok(serde_json::Value::Object(_)) => Ok(()),
        _ => Err(DropReason::BiddingSignals),
    }
}

/// Ordering and horizon checks.
///
/// - activation strictly before expiration
/// - expiration strictly after `now`
/// - expiration no later than `now + max_expire_in`
/// - activation no later than `now + max_activation_delay`
pub(crate) fn check_times(
    activation_ms: i64,
    expiration_ms: i64,
    now: DateTime<Utc>,
    limits: &DirectiveLimits,
) -> Result<(), DropReason> {
    let now_ms = to_epoch_ms(now);
    let max_expiration = now_ms.saturating_add(secs_to_ms(limits.max_expire_in_secs));
    let max_activation = now_ms.saturating_add(secs_to_ms(limits.max_activation_delay_secs));

    if activation_ms >= expiration_ms
        || expiration_ms <= now_ms
        || expiration_ms > max_expiration
        || activation_ms > max_activation
    {
        return Err(DropReason::Timestamps);
    }
    Ok(())
}

fn check_ads(rec: &MembershipRecord, limits: &DirectiveLimits) -> Result<(), DropReason> {
    if rec.ads.len() > limits.max_num_ads {
        return Err(DropReason::Ads);
    }
    for ad in &rec.ads {
        if ad.render_uri.is_empty() {
            return Err(DropReason::Ads);
        }
        if let Some(id) = &ad.ad_render_id {
            if id.len() > limits.ad_render_id_max_length {
                return Err(DropReason::Ads);
            }
        }
    }
    let ads_size = serde_json::to_vec(&rec.ads)
        .map_err(|_| DropReason::Ads)?
        .len();
    if ads_size > limits.max_ads_size_b {
        return Err(DropReason::Ads);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Whole-record validation
// ---------------------------------------------------------------------------

/// Validate a fused record. The first failing check decides the reason.
pub fn validate_record(
    rec: &MembershipRecord,
    now: DateTime<Utc>,
    limits: &DirectiveLimits,
) -> Result<(), DropReason> {
    check_name(&rec.name, limits)?;
    check_uris(rec)?;
    check_bidding_signals(&rec.bidding_signals, limits)?;
    check_trusted_bidding_data(rec, limits)?;
    check_ads(rec, limits)?;
    check_times(
        to_epoch_ms(rec.activation_time),
        to_epoch_ms(rec.expiration_time),
        now,
        limits,
    )?;

    let size = serde_json::to_vec(rec)
        .map_err(|_| DropReason::Oversized)?
        .len();
    if size > limits.max_record_size_b {
        return Err(DropReason::Oversized);
    }
    Ok(())
}

/// Validate an owner-supplied override on its own.
///
/// Only the fields that are present are checked. When just one of the two
/// times is present it must still respect its horizon.
pub fn validate_override(
    ov: &PartialOverride,
    now: DateTime<Utc>,
    limits: &DirectiveLimits,
) -> Result<(), DropReason> {
    check_name(&ov.name, limits)?;

    if let Some(signals) = &ov.bidding_signals {
        if !signals.is_object() {
            return Err(DropReason::BiddingSignals);
        }
        check_bidding_signals(&signals.to_string(), limits)?;
    }

    let now_ms = to_epoch_ms(now);
    match (ov.activation_time, ov.expiration_time) {
        (Some(a), Some(e)) => check_times(to_epoch_ms(a), to_epoch_ms(e), now, limits)?,
        (Some(a), None) => {
            let max_activation =
                now_ms.saturating_add(secs_to_ms(limits.max_activation_delay_secs));
            if to_epoch_ms(a) > max_activation {
                return Err(DropReason::Timestamps);
            }
        }
        (None, Some(e)) => {
            let e = to_epoch_ms(e);
            let max_expiration = now_ms.saturating_add(secs_to_ms(limits.max_expire_in_secs));
            if e <= now_ms || e > max_expiration {
                return Err(DropReason::Timestamps);
            }
        }
        (None, None) => {}
    }
    Ok(())
}

/// Keep the overrides that pass [`validate_override`], in input order.
///
/// Returns the survivors and the number rejected. A later override with the
/// same name as an earlier survivor replaces it.
pub fn retain_valid_overrides(
    overrides: &[PartialOverride],
    now: DateTime<Utc>,
    limits: &DirectiveLimits,
) -> (Vec<PartialOverride>, usize) {
    let mut kept: Vec<PartialOverride> = Vec::with_capacity(overrides.len());
    let mut rejected = 0usize;
    for ov in overrides {
        if validate_override(ov, now, limits).is_err() {
            rejected += 1;
            continue;
        }
        match kept.iter_mut().find(|k| k.name == ov.name) {
            Some(slot) => *slot = ov.clone(),
            None => kept.push(ov.clone()),
        }
    }
    (kept, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aud_schemas::{from_epoch_ms, AdEntry, TrustedBiddingData};
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        from_epoch_ms(1_700_000_000_000).unwrap()
    }

    fn record(name: &str) -> MembershipRecord {
        MembershipRecord {
            owner: "com.example.app".to_string(),
            buyer: "buyer.example".to_string(),
            name: name.to_string(),
            activation_time: now(),
            expiration_time: now() + Duration::days(1),
            creation_time: now(),
            updated_time: now(),
            daily_update_uri: "https://buyer.example/daily".to_string(),
            bidding_logic_uri: "https://buyer.example/bid.js".to_string(),
            bidding_signals: String::new(),
            trusted_bidding_data: TrustedBiddingData {
                uri: "https://buyer.example/kv".to_string(),
                keys: vec!["k".to_string()],
            },
            ads: vec![AdEntry::new("https://buyer.example/ad/1")],
            priority: 0.0,
            auction_server_request_flags: 0,
        }
    }

    #[test]
    fn valid_record_passes() {
        assert_eq!(validate_record(&record("x"), now(), &DirectiveLimits::default()), Ok(()));
    }

    #[test]
    fn long_name_is_rejected() {
        let limits = DirectiveLimits {
            max_name_size_b: 3,
            ..DirectiveLimits::default()
        };
        assert_eq!(
            validate_record(&record("toolong"), now(), &limits),
            Err(DropReason::Name)
        );
    }

    #[test]
    fn empty_daily_update_or_bidding_logic_uri_is_rejected() {
        let mut r = record("x");
        r.daily_update_uri.clear();
        assert_eq!(
            validate_record(&r, now(), &DirectiveLimits::default()),
            Err(DropReason::Uris)
        );

        let mut r = record("x");
        r.bidding_logic_uri.clear();
        assert_eq!(
            validate_record(&r, now(), &DirectiveLimits::default()),
            Err(DropReason::Uris)
        );
    }

    #[test]
    fn trusted_bidding_data_needs_a_uri_and_fits_its_ceiling() {
        let mut r = record("x");
        r.trusted_bidding_data.uri.clear();
        assert_eq!(
            validate_record(&r, now(), &DirectiveLimits::default()),
            Err(DropReason::TrustedBiddingData)
        );

        let mut r = record("x");
        r.trusted_bidding_data.keys = (0..50).map(|i| format!("key-{i}")).collect();
        let limits = DirectiveLimits {
            max_trusted_bidding_data_size_b: 100,
            ..DirectiveLimits::default()
        };
        assert_eq!(
            validate_record(&r, now(), &limits),
            Err(DropReason::TrustedBiddingData)
        );
    }

    #[test]
    fn ad_filters_count_towards_the_ads_ceiling() {
        let mut r = record("x");
        r.ads[0].ad_counter_keys = (0..200).collect();
        r.ads[0].ad_filters = Some(serde_json::json!({"app_install": {"package_names": ["p"]}}));
        let limits = DirectiveLimits {
            max_ads_size_b: 300,
            ..DirectiveLimits::default()
        };
        assert_eq!(validate_record(&r, now(), &limits), Err(DropReason::Ads));
        assert_eq!(validate_record(&r, now(), &DirectiveLimits::default()), Ok(()));
    }

    #[test]
    fn signals_must_be_an_object() {
        let mut r = record("x");
        r.bidding_signals = "[1,2]".to_string();
        assert_eq!(
            validate_record(&r, now(), &DirectiveLimits::default()),
            Err(DropReason::BiddingSignals)
        );
    }

    #[test]
    fn expiration_beyond_horizon_is_rejected() {
        let mut r = record("x");
        r.expiration_time = now() + Duration::days(61);
        assert_eq!(
            validate_record(&r, now(), &DirectiveLimits::default()),
            Err(DropReason::Timestamps)
        );
    }

    #[test]
    fn already_expired_record_is_rejected() {
        let mut r = record("x");
        r.activation_time = now() - Duration::days(2);
        r.expiration_time = now() - Duration::days(1);
        assert_eq!(
            validate_record(&r, now(), &DirectiveLimits::default()),
            Err(DropReason::Timestamps)
        );
    }

    #[test]
    fn too_many_ads_is_rejected() {
        let mut r = record("x");
        let ad = r.ads[0].clone();
        r.ads = vec![ad; 3];
        let limits = DirectiveLimits {
            max_num_ads: 2,
            ..DirectiveLimits::default()
        };
        assert_eq!(validate_record(&r, now(), &limits), Err(DropReason::Ads));
    }

    #[test]
    fn override_with_array_signals_is_rejected_and_later_duplicate_wins() {
        let mut bad = PartialOverride::named("a");
        bad.bidding_signals = Some(serde_json::json!([1]));

        let mut first = PartialOverride::named("b");
        first.bidding_signals = Some(serde_json::json!({"v": 1}));
        let mut second = PartialOverride::named("b");
        second.bidding_signals = Some(serde_json::json!({"v": 2}));

        let (kept, rejected) =
            retain_valid_overrides(&[bad, first, second], now(), &DirectiveLimits::default());

        assert_eq!(rejected, 1);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].bidding_signals, Some(serde_json::json!({"v": 2})));
    }
}
