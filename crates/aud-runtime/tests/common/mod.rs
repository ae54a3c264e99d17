#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use aud_config::{EngineConfig, ScheduleConfig};
use aud_fetch::{FetchError, FetchRequest, FetchResponse, UpdateFetcher};
use aud_runtime::{ReconciliationEngine, ScheduleRequest};
use aud_schemas::{from_epoch_ms, MembershipRecord, PartialOverride, TrustedBiddingData};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sqlx::SqlitePool;

pub const OWNER: &str = "A";
pub const BUYER: &str = "b.example";
pub const URI: &str = "https://b.example/update";

pub fn t0() -> DateTime<Utc> {
    from_epoch_ms(1_750_000_000_000).expect("valid instant")
}

/// Replays canned responses per endpoint and records every request.
#[derive(Default)]
pub struct ScriptedFetcher {
    script: Mutex<HashMap<String, VecDeque<Result<FetchResponse, FetchError>>>>,
    calls: Mutex<Vec<FetchRequest>>,
}

impl ScriptedFetcher {
    pub fn push(&self, uri: &str, resp: Result<FetchResponse, FetchError>) {
        self.script
            .lock()
            .unwrap()
            .entry(uri.to_string())
            .or_default()
            .push_back(resp);
    }

    pub fn calls(&self) -> Vec<FetchRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl UpdateFetcher for ScriptedFetcher {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        self.calls.lock().unwrap().push(req.clone());
        self.script
            .lock()
            .unwrap()
            .get_mut(&req.uri)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Err(FetchError::Transport("no scripted response".to_string())))
    }
}

/// Defaults, except that requests may be due immediately.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        schedule: ScheduleConfig {
            min_delay_minutes: -60,
            max_delay_minutes: 300,
        },
        ..EngineConfig::default()
    }
}

pub async fn engine_with(cfg: EngineConfig) -> (SqlitePool, Arc<ScriptedFetcher>, ReconciliationEngine) {
    let pool = aud_db::connect_in_memory().await.expect("in-memory db");
    aud_db::migrate(&pool).await.expect("migrate");
    let fetcher = Arc::new(ScriptedFetcher::default());
    let engine = ReconciliationEngine::new(pool.clone(), fetcher.clone(), cfg);
    (pool, fetcher, engine)
}

pub async fn engine() -> (SqlitePool, Arc<ScriptedFetcher>, ReconciliationEngine) {
    engine_with(test_config()).await
}

/// Due one minute before `t0()`.
pub fn due_request(owner: &str, uri: &str, overrides: Vec<PartialOverride>, leaves: &[&str]) -> ScheduleRequest {
    ScheduleRequest {
        owner: owner.to_string(),
        update_uri: uri.to_string(),
        partial_overrides: overrides,
        leaves: leaves.iter().map(|s| s.to_string()).collect(),
        min_delay_minutes: -1,
        replace_pending: false,
        allow_schedule_in_response: false,
    }
}

pub fn ok(body: serde_json::Value) -> Result<FetchResponse, FetchError> {
    Ok(FetchResponse::ok(&body.to_string()))
}

/// Fills in the mandatory fields a test entry leaves out.
pub fn join_entry(mut entry: Value) -> Value {
    if let Some(obj) = entry.as_object_mut() {
        let defaults = [
            ("daily_update_uri", json!("https://b.example/daily")),
            ("bidding_logic_uri", json!("https://b.example/bid.js")),
            (
                "trusted_bidding_data",
                json!({"trusted_bidding_uri": "https://b.example/kv", "trusted_bidding_keys": ["k"]}),
            ),
        ];
        for (key, value) in defaults {
            obj.entry(key).or_insert(value);
        }
    }
    entry
}

/// An already-joined record, active across `t0()`.
pub fn stored(owner: &str, buyer: &str, name: &str) -> MembershipRecord {
    MembershipRecord {
        owner: owner.to_string(),
        buyer: buyer.to_string(),
        name: name.to_string(),
        activation_time: t0() - Duration::days(1),
        expiration_time: t0() + Duration::days(1),
        creation_time: t0() - Duration::days(1),
        updated_time: t0() - Duration::days(1),
        daily_update_uri: "https://b.example/daily".to_string(),
        bidding_logic_uri: "https://b.example/bid.js".to_string(),
        bidding_signals: String::new(),
        trusted_bidding_data: TrustedBiddingData {
            uri: "https://b.example/kv".to_string(),
            keys: Vec::new(),
        },
        ads: Vec::new(),
        priority: 0.0,
        auction_server_request_flags: 0,
    }
}
