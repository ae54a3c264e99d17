use serde::{Deserialize, Serialize};

/// Configured ceilings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    /// Records across every owner and buyer.
    pub max_total: u64,
    /// Records held by one owner.
    pub max_per_owner: u64,
    /// Records held by one owner for one buyer.
    pub max_per_owner_buyer: u64,
    /// Distinct owners holding at least one record.
    pub max_owners: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_total: 4_000,
            max_per_owner: 1_000,
            max_per_owner_buyer: 1_000,
            max_owners: 1_000,
        }
    }
}

/// Store counts observed before the pass applies any joins.
///
/// Counts are taken after leaves were applied so freed space is usable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QuotaCounts {
    pub total: u64,
    pub owner: u64,
    pub owner_buyer: u64,
    pub distinct_owners: u64,
}

/// One proposed join.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    /// True when (owner, buyer, name) is already in the store. Overwrites
    /// never consume new quota.
    pub exists: bool,
}

impl Candidate {
    pub fn new(name: &str, exists: bool) -> Self {
        Self {
            name: name.to_string(),
            exists,
        }
    }
}

/// Which ceiling stopped admission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Ceiling {
    Total,
    PerOwner,
    PerOwnerBuyer,
    Owners,
}

impl Ceiling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ceiling::Total => "TOTAL",
            Ceiling::PerOwner => "PER_OWNER",
            Ceiling::PerOwnerBuyer => "PER_OWNER_BUYER",
            Ceiling::Owners => "OWNERS",
        }
    }
}

/// Outcome of [`crate::admit`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaDecision {
    /// Admitted candidate names, in presentation order. Always a prefix of
    /// the input.
    pub admitted: Vec<String>,
    /// Candidates dropped once a ceiling was hit.
    pub dropped: usize,
    /// The ceiling that stopped admission, if any.
    pub stopped_by: Option<Ceiling>,
}

impl QuotaDecision {
    pub fn all_admitted(&self) -> bool {
        self.stopped_by.is_none()
    }
}
