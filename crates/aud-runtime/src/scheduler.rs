//! Scheduling entry point for deferred reconciliation requests.

use std::fmt;

use aud_config::ScheduleConfig;
use aud_db::InsertOutcome;
use aud_directives::NestedSchedule;
use aud_schemas::{PartialOverride, ScheduledUpdate, ScheduledUpdateRequest};
use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Request / error types
// ---------------------------------------------------------------------------

/// Caller input for [`Scheduler::schedule`]. The buyer is derived from the
/// endpoint host and is never supplied directly.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRequest {
    pub owner: String,
    pub update_uri: String,
    pub partial_overrides: Vec<PartialOverride>,
    pub leaves: Vec<String>,
    /// Minutes from `now` until the request becomes due. May be negative when
    /// the configured bounds allow it.
    pub min_delay_minutes: i64,
    pub replace_pending: bool,
    pub allow_schedule_in_response: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Bad endpoint, owner, or delay.
    InvalidArgument(String),
    /// A request for (owner, update_uri) is already pending and replacement
    /// was not requested.
    AlreadyPending,
    Storage(String),
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::InvalidArgument(msg) => write!(f, "invalid schedule request: {msg}"),
            ScheduleError::AlreadyPending => {
                write!(f, "an update for this owner and endpoint is already pending")
            }
            ScheduleError::Storage(msg) => write!(f, "schedule storage error: {msg}"),
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Buyer identity of an update endpoint: its host.
pub fn buyer_from_uri(update_uri: &str) -> Result<String, ScheduleError> {
    let url = Url::parse(update_uri)
        .map_err(|e| ScheduleError::InvalidArgument(format!("update_uri {update_uri:?}: {e}")))?;
    if !matches!(url.scheme(), "https" | "http") {
        return Err(ScheduleError::InvalidArgument(format!(
            "update_uri scheme must be http(s), got {}",
            url.scheme()
        )));
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(host.to_string()),
        _ => Err(ScheduleError::InvalidArgument(format!(
            "update_uri {update_uri:?} has no host"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Scheduler {
    pool: SqlitePool,
    cfg: ScheduleConfig,
}

impl Scheduler {
    pub fn new(pool: SqlitePool, cfg: ScheduleConfig) -> Self {
        Self { pool, cfg }
    }

    /// Validate and enqueue. Returns the new request id.
    pub async fn schedule(&self, req: &ScheduleRequest, now: DateTime<Utc>) -> Result<Uuid, ScheduleError> {
        if req.owner.trim().is_empty() {
            return Err(ScheduleError::InvalidArgument("owner must not be empty".to_string()));
        }
        let buyer = buyer_from_uri(&req.update_uri)?;
        if req.min_delay_minutes < self.cfg.min_delay_minutes
            || req.min_delay_minutes > self.cfg.max_delay_minutes
        {
            return Err(ScheduleError::InvalidArgument(format!(
                "min_delay {} outside [{}, {}] minutes",
                req.min_delay_minutes, self.cfg.min_delay_minutes, self.cfg.max_delay_minutes
            )));
        }

        let scheduled_time = Duration::try_minutes(req.min_delay_minutes)
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| {
                ScheduleError::InvalidArgument(format!(
                    "min_delay {} minutes is out of range",
                    req.min_delay_minutes
                ))
            })?;

        let update_id = Uuid::new_v4();
        let record = ScheduledUpdateRequest {
            update: ScheduledUpdate {
                update_id,
                owner: req.owner.clone(),
                buyer: buyer.clone(),
                update_uri: req.update_uri.clone(),
                creation_time: now,
                scheduled_time,
                allow_schedule_in_response: req.allow_schedule_in_response,
            },
            partial_overrides: req.partial_overrides.clone(),
            leaves: req.leaves.clone(),
        };

        let outcome = aud_db::insert_scheduled_update(&self.pool, &record, req.replace_pending)
            .await
            .map_err(|e| ScheduleError::Storage(format!("{e:#}")))?;

        match outcome {
            InsertOutcome::Inserted { replaced } => {
                info!(
                    update_id = %update_id,
                    owner = %req.owner,
                    buyer = %buyer,
                    replaced,
                    due = %record.update.scheduled_time,
                    "update scheduled"
                );
                Ok(update_id)
            }
            InsertOutcome::AlreadyPending => Err(ScheduleError::AlreadyPending),
        }
    }

    /// Enqueue a follow-up carried in a response to `parent`.
    ///
    /// The follow-up must target the parent's buyer and may not itself
    /// schedule further requests.
    pub async fn schedule_from_response(
        &self,
        parent: &ScheduledUpdate,
        nested: &NestedSchedule,
        now: DateTime<Utc>,
    ) -> Result<Uuid, ScheduleError> {
        let buyer = buyer_from_uri(&nested.update_uri)?;
        if buyer != parent.buyer {
            warn!(
                update_id = %parent.update_id,
                parent_buyer = %parent.buyer,
                nested_buyer = %buyer,
                "nested schedule targets a different buyer"
            );
            return Err(ScheduleError::InvalidArgument(format!(
                "nested update_uri host {buyer} does not match buyer {}",
                parent.buyer
            )));
        }

        let req = ScheduleRequest {
            owner: parent.owner.clone(),
            update_uri: nested.update_uri.clone(),
            partial_overrides: nested.partial_overrides.clone(),
            leaves: nested.leaves.clone(),
            min_delay_minutes: nested.min_delay_minutes,
            replace_pending: nested.replace_pending,
            allow_schedule_in_response: false,
        };
        self.schedule(&req, now).await
    }

    pub async fn list_pending_for_owner(&self, owner: &str) -> anyhow::Result<Vec<ScheduledUpdateRequest>> {
        aud_db::list_updates_for_owner(&self.pool, owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buyer_is_endpoint_host() {
        assert_eq!(
            buyer_from_uri("https://buyer.example/path?q=1").unwrap(),
            "buyer.example"
        );
        assert_eq!(buyer_from_uri("http://127.0.0.1:8080/u").unwrap(), "127.0.0.1");
    }

    #[test]
    fn unusable_endpoints_are_invalid_arguments() {
        for uri in ["not a uri", "ftp://buyer.example/x", "mailto:a@b.example", ""] {
            assert!(
                matches!(buyer_from_uri(uri), Err(ScheduleError::InvalidArgument(_))),
                "{uri} should be rejected"
            );
        }
    }

    #[test]
    fn error_display() {
        assert_eq!(
            ScheduleError::AlreadyPending.to_string(),
            "an update for this owner and endpoint is already pending"
        );
        assert!(ScheduleError::InvalidArgument("x".into())
            .to_string()
            .starts_with("invalid schedule request"));
    }
}
