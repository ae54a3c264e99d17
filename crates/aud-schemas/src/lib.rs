//! aud-schemas
//!
//! Shared data model for the audience reconciliation workspace.
//!
//! Plain data only: no IO, no validation. Validation lives in `aud-directives`,
//! persistence in `aud-db`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bit set in [`MembershipRecord::auction_server_request_flags`] when the buyer
/// asked for ads to be omitted from server-side auction payloads.
pub const FLAG_OMIT_ADS: u32 = 1;

// ---------------------------------------------------------------------------
// Membership records
// ---------------------------------------------------------------------------

/// Identity of a membership record. Unique across the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AudienceKey {
    pub owner: String,
    pub buyer: String,
    pub name: String,
}

impl AudienceKey {
    pub fn new(owner: &str, buyer: &str, name: &str) -> Self {
        Self {
            owner: owner.to_string(),
            buyer: buyer.to_string(),
            name: name.to_string(),
        }
    }
}

/// One ad attached to a membership record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdEntry {
    pub render_uri: String,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad_render_id: Option<String>,
    /// Counter keys for frequency-cap filtering. Empty when that filtering is off.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ad_counter_keys: Vec<i32>,
    /// Filter object with `frequency_cap` and/or `app_install` members.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad_filters: Option<serde_json::Value>,
}

impl AdEntry {
    pub fn new(render_uri: &str) -> Self {
        Self {
            render_uri: render_uri.to_string(),
            metadata: empty_object(),
            ad_render_id: None,
            ad_counter_keys: Vec::new(),
            ad_filters: None,
        }
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Where the buyer's real-time bidding data server lives and which keys to ask
/// it for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedBiddingData {
    pub uri: String,
    #[serde(default)]
    pub keys: Vec<String>,
}

/// A named audience group held on behalf of `owner` for `buyer`.
///
/// Stored as a whole-record replace; partial merging happens before a record
/// reaches the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub owner: String,
    pub buyer: String,
    pub name: String,
    pub activation_time: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    pub creation_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub daily_update_uri: String,
    pub bidding_logic_uri: String,
    /// JSON object text. Empty string means no signals were supplied.
    pub bidding_signals: String,
    pub trusted_bidding_data: TrustedBiddingData,
    pub ads: Vec<AdEntry>,
    pub priority: f64,
    pub auction_server_request_flags: u32,
}

impl MembershipRecord {
    pub fn key(&self) -> AudienceKey {
        AudienceKey::new(&self.owner, &self.buyer, &self.name)
    }

    /// Active means activated and not yet expired at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.activation_time <= now && now < self.expiration_time
    }
}

// ---------------------------------------------------------------------------
// Scheduled updates
// ---------------------------------------------------------------------------

/// Owner-supplied values that win over the buyer's response for `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialOverride {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<DateTime<Utc>>,
    /// JSON object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bidding_signals: Option<serde_json::Value>,
}

impl PartialOverride {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            activation_time: None,
            expiration_time: None,
            bidding_signals: None,
        }
    }
}

/// Queue row for a pending reconciliation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledUpdate {
    pub update_id: Uuid,
    pub owner: String,
    pub buyer: String,
    pub update_uri: String,
    pub creation_time: DateTime<Utc>,
    pub scheduled_time: DateTime<Utc>,
    pub allow_schedule_in_response: bool,
}

/// A queue row together with its child rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledUpdateRequest {
    pub update: ScheduledUpdate,
    pub partial_overrides: Vec<PartialOverride>,
    pub leaves: Vec<String>,
}

// ---------------------------------------------------------------------------
// Quarantine
// ---------------------------------------------------------------------------

/// Rate-limit suppression for an (owner, buyer) scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub owner: String,
    pub buyer: String,
    pub expiration: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Epoch milliseconds used for persistence and on the wire.
pub fn to_epoch_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Inverse of [`to_epoch_ms`]. Out-of-range values yield `None`.
pub fn from_epoch_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
