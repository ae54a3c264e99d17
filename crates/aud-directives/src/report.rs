//! Per-response drop accounting.
//!
//! Every join entry that does not survive parsing and validation is counted
//! under exactly one [`DropReason`]. Nothing here is fatal; the report exists
//! so callers can log what the buyer sent that was thrown away.

use std::collections::BTreeMap;
use std::fmt;

/// Why a single join entry was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DropReason {
    /// A mandatory field (name, URIs, trusted bidding data, ads) was absent.
    Incomplete,
    /// The entry was not an object, or an optional field had the wrong shape.
    InvalidJsonEntry,
    Name,
    /// Daily-update or bidding-logic URI was empty.
    Uris,
    BiddingSignals,
    TrustedBiddingData,
    Ads,
    Timestamps,
    /// The serialized fused record exceeded its ceiling.
    Oversized,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Incomplete => "incomplete",
            DropReason::InvalidJsonEntry => "invalid_json_entry",
            DropReason::Name => "name",
            DropReason::Uris => "uris",
            DropReason::BiddingSignals => "bidding_signals",
            DropReason::TrustedBiddingData => "trusted_bidding_data",
            DropReason::Ads => "ads",
            DropReason::Timestamps => "timestamps",
            DropReason::Oversized => "oversized",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one parsed response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseReport {
    /// Items found under the join key, valid or not.
    pub join_entries: usize,
    /// Fused records that passed every check.
    pub accepted: usize,
    /// Drop counts keyed by reason. Only reasons that occurred are present.
    pub drops: BTreeMap<DropReason, usize>,
    /// Leave items that were not non-empty strings.
    pub skipped_leave_entries: usize,
    /// Nested schedule requests missing a required field.
    pub skipped_schedule_requests: usize,
    /// Top-level sections (`join`, `leave`, `schedule_requests`) present with
    /// the wrong shape and treated as empty.
    pub ignored_sections: Vec<&'static str>,
}

impl ParseReport {
    pub(crate) fn record_drop(&mut self, reason: DropReason) {
        *self.drops.entry(reason).or_insert(0) += 1;
    }

    pub fn dropped(&self, reason: DropReason) -> usize {
        self.drops.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_dropped(&self) -> usize {
        self.drops.values().sum()
    }

    /// `true` when nothing in the response was discarded.
    pub fn is_clean(&self) -> bool {
        self.drops.is_empty()
            && self.skipped_leave_entries == 0
            && self.skipped_schedule_requests == 0
            && self.ignored_sections.is_empty()
    }
}

impl fmt::Display for ParseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "join_entries={} accepted={} dropped={}",
            self.join_entries,
            self.accepted,
            self.total_dropped()
        )?;
        for (reason, n) in &self.drops {
            write!(f, " {reason}={n}")?;
        }
        if self.skipped_leave_entries > 0 {
            write!(f, " skipped_leave={}", self.skipped_leave_entries)?;
        }
        if self.skipped_schedule_requests > 0 {
            write!(f, " skipped_schedule={}", self.skipped_schedule_requests)?;
        }
        if !self.ignored_sections.is_empty() {
            write!(f, " ignored_sections={}", self.ignored_sections.join(","))?;
        }
        Ok(())
    }
}
