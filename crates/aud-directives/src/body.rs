//! Outbound request body.

use aud_schemas::{to_epoch_ms, PartialOverride};
use serde_json::{Map, Value};

use crate::parser::{
    ACTIVATION_TIME_KEY, BIDDING_SIGNALS_KEY, EXPIRATION_TIME_KEY, LEAVE_KEY, NAME_KEY,
    PARTIAL_AUDIENCE_DATA_KEY,
};

/// Wire form of one override. Times are epoch milliseconds.
pub fn override_to_json(ov: &PartialOverride) -> Value {
    let mut obj = Map::new();
    obj.insert(NAME_KEY.to_string(), Value::String(ov.name.clone()));
    if let Some(a) = ov.activation_time {
        obj.insert(ACTIVATION_TIME_KEY.to_string(), Value::from(to_epoch_ms(a)));
    }
    if let Some(e) = ov.expiration_time {
        obj.insert(EXPIRATION_TIME_KEY.to_string(), Value::from(to_epoch_ms(e)));
    }
    if let Some(s) = &ov.bidding_signals {
        obj.insert(BIDDING_SIGNALS_KEY.to_string(), s.clone());
    }
    Value::Object(obj)
}

/// Body posted to the buyer's update endpoint.
///
/// Requests that may not schedule follow-ups send a bare array of overrides.
/// Requests that may schedule follow-ups also carry the pre-declared leaves,
/// wrapped in an object alongside the overrides.
pub fn build_request_body(
    overrides: &[PartialOverride],
    leaves: &[String],
    allow_schedule_in_response: bool,
) -> String {
    let partials: Vec<Value> = overrides.iter().map(override_to_json).collect();
    if !allow_schedule_in_response {
        return Value::Array(partials).to_string();
    }

    let mut obj = Map::new();
    obj.insert(PARTIAL_AUDIENCE_DATA_KEY.to_string(), Value::Array(partials));
    obj.insert(
        LEAVE_KEY.to_string(),
        Value::Array(leaves.iter().cloned().map(Value::String).collect()),
    );
    Value::Object(obj).to_string()
}
