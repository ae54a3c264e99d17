//! Reconciliation pass over the scheduled-update queue.
//!
//! Per request: quarantine gate -> fetch -> parse -> leaves -> quota -> joins
//! -> nested schedules -> delete. Requests are isolated from each other; a
//! failure in one only ever leaves that request pending.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use aud_config::EngineConfig;
use aud_directives::{
    build_request_body, parse_response, retain_valid_overrides, MergeContext, NestedSchedule,
};
use aud_fetch::{FetchRequest, UpdateFetcher};
use aud_quota::{Candidate, QuotaCounts};
use aud_schemas::{MembershipRecord, ScheduledUpdate, ScheduledUpdateRequest};
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use crate::quarantine::QuarantineTracker;
use crate::scheduler::Scheduler;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal state of one request within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Applied and removed from the queue.
    Completed,
    /// Scope is rate limited (skipped, or answered 429). Still pending.
    Quarantined,
    /// Transport, status, or storage failure. Still pending.
    RetryPending,
    /// Body was unusable. Removed from the queue without applying anything.
    MalformedDropped,
}

/// Aggregate counts for one pass. Per-request detail is only in the logs
/// and in store state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Due requests picked up after stale removal.
    pub found: usize,
    pub stale_removed: u64,
    pub completed: usize,
    pub quarantined: usize,
    pub retry_pending: usize,
    pub malformed_dropped: usize,
}

impl PassSummary {
    fn record(&mut self, outcome: UpdateOutcome) {
        match outcome {
            UpdateOutcome::Completed => self.completed += 1,
            UpdateOutcome::Quarantined => self.quarantined += 1,
            UpdateOutcome::RetryPending => self.retry_pending += 1,
            UpdateOutcome::MalformedDropped => self.malformed_dropped += 1,
        }
    }
}

/// Write-side counts for one applied response.
#[derive(Debug, Default)]
struct Applied {
    left: usize,
    joined: usize,
    quota_dropped: usize,
    scheduled: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Cheap to clone; every clone shares the pool, fetcher, and config.
#[derive(Clone)]
pub struct ReconciliationEngine {
    pool: SqlitePool,
    fetcher: Arc<dyn UpdateFetcher>,
    cfg: Arc<EngineConfig>,
    quarantine: QuarantineTracker,
    scheduler: Scheduler,
}

impl ReconciliationEngine {
    pub fn new(pool: SqlitePool, fetcher: Arc<dyn UpdateFetcher>, cfg: EngineConfig) -> Self {
        let quarantine = QuarantineTracker::new(pool.clone(), cfg.quarantine.clone());
        let scheduler = Scheduler::new(pool.clone(), cfg.schedule.clone());
        Self {
            pool,
            fetcher,
            cfg: Arc::new(cfg),
            quarantine,
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn quarantine(&self) -> &QuarantineTracker {
        &self.quarantine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Run one pass over everything due at `now`.
    ///
    /// Never fails: storage errors on the queue itself end the pass early
    /// with whatever was counted so far.
    pub async fn perform_scheduled_updates(&self, now: DateTime<Utc>) -> PassSummary {
        let mut summary = PassSummary::default();

        let stale_after_hours = self.cfg.engine.stale_after_hours;
        match Duration::try_hours(stale_after_hours).and_then(|d| now.checked_sub_signed(d)) {
            Some(cutoff) => match aud_db::delete_updates_created_before(&self.pool, cutoff).await {
                Ok(n) => {
                    summary.stale_removed = n;
                    if n > 0 {
                        info!(removed = n, %cutoff, "stale scheduled updates removed");
                    }
                }
                Err(e) => error!(error = %format!("{e:#}"), "stale update cleanup failed"),
            },
            None => error!(stale_after_hours, "stale cutoff out of range; cleanup skipped"),
        }

        let due = match aud_db::list_due_updates(&self.pool, now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %format!("{e:#}"), "listing due updates failed");
                return summary;
            }
        };
        summary.found = due.len();
        if due.is_empty() {
            debug!("no scheduled updates due");
            return summary;
        }

        let permits = Arc::new(Semaphore::new(self.cfg.engine.max_concurrent_updates));
        let mut tasks: JoinSet<UpdateOutcome> = JoinSet::new();

        for req in due {
            let permit = match permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let engine = self.clone();
            let span = tracing::info_span!(
                "scheduled_update",
                update_id = %req.update.update_id,
                owner = %req.update.owner,
                buyer = %req.update.buyer,
            );
            tasks.spawn(
                async move {
                    let _permit = permit;
                    engine.handle_update(req, now).await
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    error!(error = %e, "update worker did not finish");
                    summary.record(UpdateOutcome::RetryPending);
                }
            }
        }

        info!(
            found = summary.found,
            stale_removed = summary.stale_removed,
            completed = summary.completed,
            quarantined = summary.quarantined,
            retry_pending = summary.retry_pending,
            malformed_dropped = summary.malformed_dropped,
            "scheduled update pass finished"
        );
        summary
    }

    /// Drive one request to a terminal or pending state.
    pub async fn handle_update(&self, req: ScheduledUpdateRequest, now: DateTime<Utc>) -> UpdateOutcome {
        let u = &req.update;

        match self.quarantine.is_quarantined(&u.owner, &u.buyer, now).await {
            Ok(false) => {}
            Ok(true) => {
                debug!("scope quarantined, skipping for this pass");
                return UpdateOutcome::Quarantined;
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "quarantine lookup failed, skipping for this pass");
                return UpdateOutcome::Quarantined;
            }
        }

        let limits = &self.cfg.directives;
        let (overrides, rejected) = retain_valid_overrides(&req.partial_overrides, now, limits);
        if rejected > 0 {
            warn!(rejected, "invalid partial overrides discarded");
        }

        let fetch_req = FetchRequest {
            uri: u.update_uri.clone(),
            body: build_request_body(&overrides, &req.leaves, u.allow_schedule_in_response),
        };
        let resp = match self.fetcher.fetch(&fetch_req).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(fetcher = self.fetcher.name(), error = %e, "fetch failed, left pending");
                return UpdateOutcome::RetryPending;
            }
        };

        if resp.is_rate_limited() {
            if let Err(e) = self
                .quarantine
                .record_rate_limited(&u.owner, &u.buyer, resp.retry_after_secs, now)
                .await
            {
                error!(error = %format!("{e:#}"), "recording quarantine failed");
            }
            return UpdateOutcome::Quarantined;
        }
        if !resp.is_success() {
            warn!(status = resp.status, "update endpoint failed, left pending");
            return UpdateOutcome::RetryPending;
        }

        let ctx = MergeContext {
            owner: &u.owner,
            buyer: &u.buyer,
            overrides: &overrides,
            limits,
            now,
        };
        let parsed = match parse_response(&resp.body, &ctx) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Quarantine state is left as is.
                warn!(error = %e, "dropping update with unusable response");
                return match aud_db::delete_scheduled_update(&self.pool, u.update_id).await {
                    Ok(_) => UpdateOutcome::MalformedDropped,
                    Err(e) => {
                        error!(error = %format!("{e:#}"), "deleting malformed update failed");
                        UpdateOutcome::RetryPending
                    }
                };
            }
        };
        if !parsed.report.is_clean() {
            info!(report = %parsed.report, "response entries dropped");
        }

        if let Err(e) = self.quarantine.clear(&u.owner, &u.buyer).await {
            error!(error = %format!("{e:#}"), "clearing quarantine failed, left pending");
            return UpdateOutcome::RetryPending;
        }

        let mut leaves: Vec<&str> = Vec::new();
        let mut seen = HashSet::new();
        for name in req.leaves.iter().chain(parsed.leaves.iter()) {
            if seen.insert(name.as_str()) {
                leaves.push(name.as_str());
            }
        }

        let applied = match self
            .apply(u, &leaves, &parsed.joins, &parsed.schedule_requests, now)
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                error!(error = %format!("{e:#}"), "applying update failed, left pending");
                return UpdateOutcome::RetryPending;
            }
        };

        if let Err(e) = aud_db::delete_scheduled_update(&self.pool, u.update_id).await {
            error!(error = %format!("{e:#}"), "deleting completed update failed");
            return UpdateOutcome::RetryPending;
        }

        info!(
            left = applied.left,
            joined = applied.joined,
            quota_dropped = applied.quota_dropped,
            scheduled = applied.scheduled,
            "update applied"
        );
        UpdateOutcome::Completed
    }

    /// Leaves first so a leave and a same-named join end with the join.
    async fn apply(
        &self,
        u: &ScheduledUpdate,
        leaves: &[&str],
        joins: &[MembershipRecord],
        nested: &[NestedSchedule],
        now: DateTime<Utc>,
    ) -> Result<Applied> {
        let mut applied = Applied::default();

        for name in leaves {
            if aud_db::delete_audience(&self.pool, &u.owner, &u.buyer, name).await? {
                applied.left += 1;
            }
        }

        if !joins.is_empty() {
            let counts = aud_db::audience_counts(&self.pool, &u.owner, &u.buyer).await?;
            let counts = QuotaCounts {
                total: counts.total.max(0) as u64,
                owner: counts.owner.max(0) as u64,
                owner_buyer: counts.owner_buyer.max(0) as u64,
                distinct_owners: counts.distinct_owners.max(0) as u64,
            };

            let mut candidates = Vec::with_capacity(joins.len());
            for rec in joins {
                let exists = aud_db::audience_exists(&self.pool, &u.owner, &u.buyer, &rec.name).await?;
                candidates.push(Candidate::new(&rec.name, exists));
            }

            let decision = aud_quota::admit(&self.cfg.quota, counts, &candidates);
            if let Some(ceiling) = decision.stopped_by {
                info!(
                    ceiling = ceiling.as_str(),
                    dropped = decision.dropped,
                    "quota reached, remaining joins dropped"
                );
            }
            applied.quota_dropped = decision.dropped;

            for rec in joins.iter().take(decision.admitted.len()) {
                aud_db::upsert_audience(&self.pool, rec).await?;
                applied.joined += 1;
            }
        }

        if !nested.is_empty() {
            if u.allow_schedule_in_response {
                for n in nested {
                    match self.scheduler.schedule_from_response(u, n, now).await {
                        Ok(id) => {
                            debug!(nested_update_id = %id, uri = %n.update_uri, "nested update scheduled");
                            applied.scheduled += 1;
                        }
                        Err(e) => warn!(uri = %n.update_uri, error = %e, "nested schedule dropped"),
                    }
                }
            } else {
                debug!(count = nested.len(), "nested schedules ignored, not allowed for this update");
            }
        }

        Ok(applied)
    }
}

/// Run a pass every `interval` for as long as the runtime lives.
pub fn spawn_pass_tick(engine: ReconciliationEngine, interval: StdDuration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            engine.perform_scheduled_updates(Utc::now()).await;
        }
    })
}
