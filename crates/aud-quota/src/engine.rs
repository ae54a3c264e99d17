use std::collections::BTreeSet;

use crate::{Candidate, Ceiling, QuotaCounts, QuotaDecision, QuotaLimits};

/// Check a single new record against every ceiling given running counts.
fn breached(limits: &QuotaLimits, counts: &QuotaCounts) -> Option<Ceiling> {
    // A brand new owner also adds to the distinct-owner count.
    if counts.owner == 0 && counts.distinct_owners >= limits.max_owners {
        return Some(Ceiling::Owners);
    }
    if counts.total >= limits.max_total {
        return Some(Ceiling::Total);
    }
    if counts.owner >= limits.max_per_owner {
        return Some(Ceiling::PerOwner);
    }
    if counts.owner_buyer >= limits.max_per_owner_buyer {
        return Some(Ceiling::PerOwnerBuyer);
    }
    None
}

/// Admit candidates in order until the first one that would breach a ceiling.
///
/// - Overwrites of an existing record are admitted without consuming quota.
/// - A name repeated within the same list counts as new at most once.
/// - Once a ceiling stops admission, every remaining candidate is dropped,
///   including overwrites and candidates that would fit on their own.
pub fn admit(limits: &QuotaLimits, counts: QuotaCounts, candidates: &[Candidate]) -> QuotaDecision {
    let mut running = counts;
    let mut seen_new: BTreeSet<&str> = BTreeSet::new();
    let mut admitted: Vec<String> = Vec::with_capacity(candidates.len());

    for (idx, c) in candidates.iter().enumerate() {
        let is_new = !c.exists && !seen_new.contains(c.name.as_str());

        if is_new {
            if let Some(ceiling) = breached(limits, &running) {
                return QuotaDecision {
                    admitted,
                    dropped: candidates.len() - idx,
                    stopped_by: Some(ceiling),
                };
            }
            if running.owner == 0 {
                running.distinct_owners += 1;
            }
            running.total += 1;
            running.owner += 1;
            running.owner_buyer += 1;
            seen_new.insert(c.name.as_str());
        }

        admitted.push(c.name.clone());
    }

    QuotaDecision {
        admitted,
        dropped: 0,
        stopped_by: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(total: u64, owner: u64, owner_buyer: u64) -> QuotaLimits {
        QuotaLimits {
            max_total: total,
            max_per_owner: owner,
            max_per_owner_buyer: owner_buyer,
            max_owners: 10,
        }
    }

    #[test]
    fn empty_candidates_admit_nothing_and_stop_nowhere() {
        let d = admit(&QuotaLimits::default(), QuotaCounts::default(), &[]);
        assert!(d.admitted.is_empty());
        assert!(d.all_admitted());
    }

    #[test]
    fn overwrite_does_not_consume_quota() {
        let counts = QuotaCounts {
            total: 2,
            owner: 2,
            owner_buyer: 2,
            distinct_owners: 1,
        };
        let d = admit(
            &limits(2, 2, 2),
            counts,
            &[Candidate::new("a", true), Candidate::new("b", true)],
        );
        assert_eq!(d.admitted, vec!["a", "b"]);
        assert!(d.all_admitted());
    }

    #[test]
    fn repeated_new_name_counts_once() {
        let d = admit(
            &limits(10, 10, 1),
            QuotaCounts::default(),
            &[Candidate::new("a", false), Candidate::new("a", false)],
        );
        assert_eq!(d.admitted, vec!["a", "a"]);
        assert!(d.all_admitted());
    }

    #[test]
    fn owner_ceiling_reports_which_limit_stopped() {
        let counts = QuotaCounts {
            total: 0,
            owner: 1,
            owner_buyer: 0,
            distinct_owners: 1,
        };
        let d = admit(&limits(100, 1, 100), counts, &[Candidate::new("x", false)]);
        assert_eq!(d.stopped_by, Some(Ceiling::PerOwner));
        assert_eq!(d.dropped, 1);
    }

    #[test]
    fn new_owner_blocked_when_owner_count_at_ceiling() {
        let l = QuotaLimits {
            max_owners: 3,
            ..QuotaLimits::default()
        };
        let counts = QuotaCounts {
            total: 3,
            owner: 0,
            owner_buyer: 0,
            distinct_owners: 3,
        };
        let d = admit(&l, counts, &[Candidate::new("x", false)]);
        assert_eq!(d.stopped_by, Some(Ceiling::Owners));
    }
}
