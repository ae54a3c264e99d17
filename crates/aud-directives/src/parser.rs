//! Response parsing and override fusion.
//!
//! Turns a buyer's response body into validated join records, leave names,
//! and nested schedule instructions. Identity fields (owner, buyer) always
//! come from the request context, never from the response.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use aud_schemas::{
    from_epoch_ms, to_epoch_ms, AdEntry, MembershipRecord, PartialOverride, TrustedBiddingData,
    FLAG_OMIT_ADS,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::limits::secs_to_ms;
use crate::report::{DropReason, ParseReport};
use crate::validate::validate_record;
use crate::DirectiveLimits;

// ---------------------------------------------------------------------------
// Wire keys
// ---------------------------------------------------------------------------

pub const JOIN_KEY: &str = "join";
pub const LEAVE_KEY: &str = "leave";
pub const SCHEDULE_REQUESTS_KEY: &str = "schedule_requests";
pub const REQUESTS_KEY: &str = "requests";
pub const PARTIAL_AUDIENCE_DATA_KEY: &str = "partial_custom_audience_data";
pub const UPDATE_URI_KEY: &str = "update_uri";
pub const MIN_DELAY_KEY: &str = "min_delay";
pub const REPLACE_PENDING_KEY: &str = "should_replace_pending_updates";

pub const NAME_KEY: &str = "name";
pub const ADS_KEY: &str = "ads";
pub const ACTIVATION_TIME_KEY: &str = "activation_time";
pub const EXPIRATION_TIME_KEY: &str = "expiration_time";
pub const BIDDING_SIGNALS_KEY: &str = "user_bidding_signals";
pub const DAILY_UPDATE_URI_KEY: &str = "daily_update_uri";
pub const BIDDING_LOGIC_URI_KEY: &str = "bidding_logic_uri";
pub const TRUSTED_BIDDING_DATA_KEY: &str = "trusted_bidding_data";
pub const TRUSTED_BIDDING_URI_KEY: &str = "trusted_bidding_uri";
pub const TRUSTED_BIDDING_KEYS_KEY: &str = "trusted_bidding_keys";
pub const PRIORITY_KEY: &str = "priority";
pub const AUCTION_FLAGS_KEY: &str = "auction_server_request_flags";
pub const RENDER_URI_KEY: &str = "render_uri";
pub const METADATA_KEY: &str = "metadata";
pub const AD_RENDER_ID_KEY: &str = "ad_render_id";
pub const AD_COUNTER_KEYS_KEY: &str = "ad_counter_keys";
pub const AD_FILTERS_KEY: &str = "ad_filters";
pub const FREQUENCY_CAP_FILTER_KEY: &str = "frequency_cap";
pub const APP_INSTALL_FILTER_KEY: &str = "app_install";

const OMIT_ADS_FLAG: &str = "omit_ads";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Whole-response failure. Per-entry problems never surface here; they are
/// counted in [`ParseReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveError {
    /// Body is not JSON, or its top level is not an object.
    MalformedResponse { reason: String },
}

impl fmt::Display for DirectiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectiveError::MalformedResponse { reason } => {
                write!(f, "malformed update response: {reason}")
            }
        }
    }
}

impl std::error::Error for DirectiveError {}

// ---------------------------------------------------------------------------
// Input / output types
// ---------------------------------------------------------------------------

/// Per-request context fused into every join entry.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    pub owner: &'a str,
    pub buyer: &'a str,
    /// Already validated overrides. Matched by name.
    pub overrides: &'a [PartialOverride],
    pub limits: &'a DirectiveLimits,
    pub now: DateTime<Utc>,
}

/// A scheduling instruction carried inside a response.
#[derive(Debug, Clone, PartialEq)]
pub struct NestedSchedule {
    pub update_uri: String,
    pub min_delay_minutes: i64,
    pub replace_pending: bool,
    pub partial_overrides: Vec<PartialOverride>,
    pub leaves: Vec<String>,
}

/// Successful parse result.
#[derive(Debug, Clone)]
pub struct ParsedDirectives {
    /// Validated fused records in response order.
    pub joins: Vec<MembershipRecord>,
    /// Deduplicated leave names in first-seen order.
    pub leaves: Vec<String>,
    pub schedule_requests: Vec<NestedSchedule>,
    pub report: ParseReport,
}

// ---------------------------------------------------------------------------
// Top-level parse
// ---------------------------------------------------------------------------

/// Parse a 2xx response body.
///
/// Returns [`DirectiveError::MalformedResponse`] only when the body as a whole
/// is unusable. Missing sections mean empty lists.
pub fn parse_response(body: &str, ctx: &MergeContext<'_>) -> Result<ParsedDirectives, DirectiveError> {
    let root: Value = serde_json::from_str(body).map_err(|e| DirectiveError::MalformedResponse {
        reason: e.to_string(),
    })?;
    let obj = match root {
        Value::Object(m) => m,
        other => {
            return Err(DirectiveError::MalformedResponse {
                reason: format!("expected a JSON object, got {}", json_kind(&other)),
            })
        }
    };

    let mut report = ParseReport::default();

    let leaves = match section_array(&obj, LEAVE_KEY, &mut report) {
        Some(items) => leave_names(items, &mut report.skipped_leave_entries),
        None => Vec::new(),
    };

    let overrides: BTreeMap<&str, &PartialOverride> =
        ctx.overrides.iter().map(|o| (o.name.as_str(), o)).collect();

    let mut joins = Vec::new();
    if let Some(items) = section_array(&obj, JOIN_KEY, &mut report) {
        report.join_entries = items.len();
        for item in items {
            let fused = fuse_entry(item, ctx, &overrides)
                .and_then(|rec| validate_record(&rec, ctx.now, ctx.limits).map(|_| rec));
            match fused {
                Ok(rec) => joins.push(rec),
                Err(reason) => report.record_drop(reason),
            }
        }
        report.accepted = joins.len();
    }

    let schedule_requests = match obj.get(SCHEDULE_REQUESTS_KEY) {
        None => Vec::new(),
        Some(Value::Object(inner)) => match inner.get(REQUESTS_KEY) {
            Some(Value::Array(items)) => nested_schedules(items, &mut report),
            None => Vec::new(),
            Some(_) => {
                report.ignored_sections.push(SCHEDULE_REQUESTS_KEY);
                Vec::new()
            }
        },
        Some(_) => {
            report.ignored_sections.push(SCHEDULE_REQUESTS_KEY);
            Vec::new()
        }
    };

    Ok(ParsedDirectives {
        joins,
        leaves,
        schedule_requests,
        report,
    })
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn section_array<'a>(
    obj: &'a Map<String, Value>,
    key: &'static str,
    report: &mut ParseReport,
) -> Option<&'a Vec<Value>> {
    match obj.get(key) {
        None => None,
        Some(Value::Array(items)) => Some(items),
        Some(_) => {
            report.ignored_sections.push(key);
            None
        }
    }
}

/// Non-empty strings, deduplicated, first-seen order.
fn leave_names(items: &[Value], skipped: &mut usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        match item.as_str() {
            Some(name) if !name.is_empty() => {
                if seen.insert(name) {
                    out.push(name.to_string());
                }
            }
            _ => *skipped += 1,
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Fusion
// ---------------------------------------------------------------------------

fn time_field(entry: &Map<String, Value>, key: &str) -> Result<Option<i64>, DropReason> {
    match entry.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or(DropReason::Timestamps),
    }
}

fn parse_ads(v: &Value, limits: &DirectiveLimits) -> Result<Vec<AdEntry>, DropReason> {
    let items = v.as_array().ok_or(DropReason::Ads)?;
    let mut ads = Vec::with_capacity(items.len());
    for item in items {
        let ad = item.as_object().ok_or(DropReason::Ads)?;
        let render_uri = ad
            .get(RENDER_URI_KEY)
            .and_then(Value::as_str)
            .ok_or(DropReason::Ads)?;
        let metadata = match ad.get(METADATA_KEY) {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(m) => m.clone(),
        };
        let ad_render_id = if limits.ad_render_id_enabled {
            match ad.get(AD_RENDER_ID_KEY) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(_) => return Err(DropReason::Ads),
            }
        } else {
            None
        };
        let ad_counter_keys = if limits.frequency_cap_filtering_enabled {
            match ad.get(AD_COUNTER_KEYS_KEY) {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(keys)) => keys
                    .iter()
                    .map(|k| k.as_i64().and_then(|k| i32::try_from(k).ok()))
                    .collect::<Option<Vec<_>>>()
                    .ok_or(DropReason::Ads)?,
                Some(_) => return Err(DropReason::Ads),
            }
        } else {
            Vec::new()
        };
        let ad_filters = match ad.get(AD_FILTERS_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::Object(f)) => enabled_filters(f, limits),
            Some(_) => return Err(DropReason::Ads),
        };
        ads.push(AdEntry {
            render_uri: render_uri.to_string(),
            metadata,
            ad_render_id,
            ad_counter_keys,
            ad_filters,
        });
    }
    Ok(ads)
}

/// Keep only the filter kinds that are switched on. `None` when nothing is left.
fn enabled_filters(filters: &Map<String, Value>, limits: &DirectiveLimits) -> Option<Value> {
    let mut kept = Map::new();
    for (key, enabled) in [
        (FREQUENCY_CAP_FILTER_KEY, limits.frequency_cap_filtering_enabled),
        (APP_INSTALL_FILTER_KEY, limits.app_install_filtering_enabled),
    ] {
        match filters.get(key) {
            Some(v) if enabled && !v.is_null() => {
                kept.insert(key.to_string(), v.clone());
            }
            _ => {}
        }
    }
    (!kept.is_empty()).then_some(Value::Object(kept))
}

fn parse_trusted_bidding_data(v: &Value) -> Result<TrustedBiddingData, DropReason> {
    let obj = v.as_object().ok_or(DropReason::TrustedBiddingData)?;
    let uri = obj
        .get(TRUSTED_BIDDING_URI_KEY)
        .and_then(Value::as_str)
        .ok_or(DropReason::TrustedBiddingData)?;
    let keys = obj
        .get(TRUSTED_BIDDING_KEYS_KEY)
        .and_then(Value::as_array)
        .ok_or(DropReason::TrustedBiddingData)?
        .iter()
        .map(|k| k.as_str().map(str::to_string))
        .collect::<Option<Vec<_>>>()
        .ok_or(DropReason::TrustedBiddingData)?;
    Ok(TrustedBiddingData {
        uri: uri.to_string(),
        keys,
    })
}

fn required_str<'e>(entry: &'e Map<String, Value>, key: &str) -> Result<&'e str, DropReason> {
    match entry.get(key) {
        None | Some(Value::Null) => Err(DropReason::Incomplete),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(DropReason::InvalidJsonEntry),
    }
}

fn parse_auction_flags(v: &Value) -> Result<u32, DropReason> {
    let items = v.as_array().ok_or(DropReason::InvalidJsonEntry)?;
    let mut flags = 0u32;
    for item in items {
        let s = item.as_str().ok_or(DropReason::InvalidJsonEntry)?;
        if s.eq_ignore_ascii_case(OMIT_ADS_FLAG) {
            flags |= FLAG_OMIT_ADS;
        }
    }
    Ok(flags)
}

/// Build one fused record from a response entry and the matching override.
fn fuse_entry(
    item: &Value,
    ctx: &MergeContext<'_>,
    overrides: &BTreeMap<&str, &PartialOverride>,
) -> Result<MembershipRecord, DropReason> {
    let entry = item.as_object().ok_or(DropReason::InvalidJsonEntry)?;
    let limits = ctx.limits;

    let name = required_str(entry, NAME_KEY)?;
    let daily_update_uri = required_str(entry, DAILY_UPDATE_URI_KEY)?;
    let bidding_logic_uri = required_str(entry, BIDDING_LOGIC_URI_KEY)?;
    let trusted_bidding_data = match entry.get(TRUSTED_BIDDING_DATA_KEY) {
        None | Some(Value::Null) => return Err(DropReason::Incomplete),
        Some(v) => parse_trusted_bidding_data(v)?,
    };
    let ads = match entry.get(ADS_KEY) {
        None | Some(Value::Null) => return Err(DropReason::Incomplete),
        Some(v) => parse_ads(v, limits)?,
    };

    let mut activation_ms = time_field(entry, ACTIVATION_TIME_KEY)?;
    let mut expiration_ms = time_field(entry, EXPIRATION_TIME_KEY)?;
    let mut signals = match entry.get(BIDDING_SIGNALS_KEY) {
        None | Some(Value::Null) => None,
        Some(v @ Value::Object(_)) => Some(v.clone()),
        Some(_) => return Err(DropReason::BiddingSignals),
    };

    let priority = if limits.seller_configuration_enabled {
        match entry.get(PRIORITY_KEY) {
            None | Some(Value::Null) => 0.0,
            Some(v) => v.as_f64().ok_or(DropReason::InvalidJsonEntry)?,
        }
    } else {
        0.0
    };
    let flags = if limits.auction_server_request_flags_enabled {
        match entry.get(AUCTION_FLAGS_KEY) {
            None | Some(Value::Null) => 0,
            Some(v) => parse_auction_flags(v)?,
        }
    } else {
        0
    };

    // Owner-supplied values win.
    if let Some(ov) = overrides.get(name) {
        if let Some(a) = ov.activation_time {
            activation_ms = Some(to_epoch_ms(a));
        }
        if let Some(e) = ov.expiration_time {
            expiration_ms = Some(to_epoch_ms(e));
        }
        if ov.bidding_signals.is_some() {
            signals = ov.bidding_signals.clone();
        }
    }

    let now_ms = to_epoch_ms(ctx.now);
    let activation_ms = activation_ms.unwrap_or(now_ms);
    let expiration_ms = expiration_ms
        .unwrap_or_else(|| activation_ms.saturating_add(secs_to_ms(limits.default_expire_in_secs)));
    let activation_time = from_epoch_ms(activation_ms).ok_or(DropReason::Timestamps)?;
    let expiration_time = from_epoch_ms(expiration_ms).ok_or(DropReason::Timestamps)?;

    Ok(MembershipRecord {
        owner: ctx.owner.to_string(),
        buyer: ctx.buyer.to_string(),
        name: name.to_string(),
        activation_time,
        expiration_time,
        creation_time: ctx.now,
        updated_time: ctx.now,
        daily_update_uri: daily_update_uri.to_string(),
        bidding_logic_uri: bidding_logic_uri.to_string(),
        bidding_signals: signals.map(|s| s.to_string()).unwrap_or_default(),
        trusted_bidding_data,
        ads,
        priority,
        auction_server_request_flags: flags,
    })
}

// ---------------------------------------------------------------------------
// Overrides and nested schedule requests
// ---------------------------------------------------------------------------

/// Read an override object in wire form. Returns `None` when the shape is
/// wrong; field-level limits are checked separately.
pub fn parse_override_json(v: &Value) -> Option<PartialOverride> {
    let obj = v.as_object()?;
    let name = obj.get(NAME_KEY)?.as_str()?.to_string();

    let time = |key: &str| -> Option<Option<DateTime<Utc>>> {
        match obj.get(key) {
            None | Some(Value::Null) => Some(None),
            Some(t) => from_epoch_ms(t.as_i64()?).map(Some),
        }
    };
    let activation_time = time(ACTIVATION_TIME_KEY)?;
    let expiration_time = time(EXPIRATION_TIME_KEY)?;
    let bidding_signals = match obj.get(BIDDING_SIGNALS_KEY) {
        None | Some(Value::Null) => None,
        Some(s @ Value::Object(_)) => Some(s.clone()),
        Some(_) => return None,
    };

    Some(PartialOverride {
        name,
        activation_time,
        expiration_time,
        bidding_signals,
    })
}

fn nested_schedule(v: &Value) -> Option<NestedSchedule> {
    let obj = v.as_object()?;
    let update_uri = obj.get(UPDATE_URI_KEY)?.as_str()?.to_string();
    let min_delay_minutes = obj.get(MIN_DELAY_KEY)?.as_i64()?;
    let replace_pending = match obj.get(REPLACE_PENDING_KEY) {
        None | Some(Value::Null) => false,
        Some(b) => b.as_bool()?,
    };
    let partial_overrides = match obj.get(PARTIAL_AUDIENCE_DATA_KEY) {
        None | Some(Value::Null) => Vec::new(),
        Some(items) => items
            .as_array()?
            .iter()
            .map(parse_override_json)
            .collect::<Option<Vec<_>>>()?,
    };
    let leaves = match obj.get(LEAVE_KEY) {
        None | Some(Value::Null) => Vec::new(),
        Some(items) => {
            let mut skipped = 0;
            let names = leave_names(items.as_array()?, &mut skipped);
            if skipped > 0 {
                return None;
            }
            names
        }
    };
    Some(NestedSchedule {
        update_uri,
        min_delay_minutes,
        replace_pending,
        partial_overrides,
        leaves,
    })
}

fn nested_schedules(items: &[Value], report: &mut ParseReport) -> Vec<NestedSchedule> {
    let mut out = Vec::new();
    for item in items {
        match nested_schedule(item) {
            Some(s) => out.push(s),
            None => report.skipped_schedule_requests += 1,
        }
    }
    out
}
