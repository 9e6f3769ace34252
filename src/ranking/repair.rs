//! Reconciles an oracle ranking against the candidate set.
//!
//! Pure: no I/O, no logging. Given candidate ids `C` and the oracle's pairs,
//! the result covers `C` exactly with ranks `1..=|C|`:
//! - ids outside `C` are dropped (hallucinated),
//! - repeated ids keep their first occurrence,
//! - ids the oracle skipped are appended after everything it did rank, in
//!   candidate order,
//! - ties and gaps are compacted by (oracle rank, candidate order).

use std::collections::{HashMap, HashSet};

use crate::oracle::RankedId;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepairReport {
    /// Final ranks, ascending.
    pub pairs: Vec<RankedId>,
    /// Candidates the oracle did not return, in candidate order.
    pub missing: Vec<String>,
    /// Returned ids that are not candidates.
    pub hallucinated: Vec<String>,
    /// Candidate ids the oracle returned more than once.
    pub duplicates: Vec<String>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.hallucinated.is_empty() && self.duplicates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepairError {
    #[error("oracle returned no usable rankings for {candidates} candidates")]
    NoValidRankings { candidates: usize },
    #[error("candidate id {0:?} appears more than once")]
    DuplicateCandidate(String),
    #[error("repaired ranking failed verification: {0}")]
    Verification(String),
}

pub fn repair_rankings(
    candidates: &[String],
    returned: &[RankedId],
) -> Result<RepairReport, RepairError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(candidates.len());
    for (i, id) in candidates.iter().enumerate() {
        if index.insert(id.as_str(), i).is_some() {
            return Err(RepairError::DuplicateCandidate(id.clone()));
        }
    }
    if candidates.is_empty() {
        return Ok(RepairReport::default());
    }

    let mut report = RepairReport::default();
    let mut seen: HashSet<&str> = HashSet::new();
    // (oracle rank, candidate index)
    let mut kept: Vec<(u32, usize)> = Vec::with_capacity(returned.len());

    for pair in returned {
        let id = pair.course_id.as_str();
        match index.get(id) {
            None => {
                if !report.hallucinated.iter().any(|h| h == id) {
                    report.hallucinated.push(id.to_string());
                }
            }
            Some(&i) => {
                if seen.insert(id) {
                    kept.push((pair.rank, i));
                } else if !report.duplicates.iter().any(|d| d == id) {
                    report.duplicates.push(id.to_string());
                }
            }
        }
    }

    if kept.is_empty() {
        return Err(RepairError::NoValidRankings {
            candidates: candidates.len(),
        });
    }

    let max_rank = kept.iter().map(|&(rank, _)| rank).max().unwrap_or(0);
    let mut next = max_rank;
    for (i, id) in candidates.iter().enumerate() {
        if !seen.contains(id.as_str()) {
            next = next.saturating_add(1);
            kept.push((next, i));
            report.missing.push(id.clone());
        }
    }

    kept.sort_by_key(|&(rank, i)| (rank, i));
    report.pairs = kept
        .iter()
        .enumerate()
        .map(|(pos, &(_, i))| RankedId::new(candidates[i].clone(), pos as u32 + 1))
        .collect();

    verify(candidates, &report.pairs)?;
    Ok(report)
}

/// Ids equal the candidate set; ranks are exactly `1..=N`.
fn verify(candidates: &[String], pairs: &[RankedId]) -> Result<(), RepairError> {
    if pairs.len() != candidates.len() {
        return Err(RepairError::Verification(format!(
            "{} pairs for {} candidates",
            pairs.len(),
            candidates.len()
        )));
    }
    let expected: HashSet<&str> = candidates.iter().map(String::as_str).collect();
    let ids: HashSet<&str> = pairs.iter().map(|p| p.course_id.as_str()).collect();
    if ids != expected {
        return Err(RepairError::Verification("id set mismatch".into()));
    }
    let ranks: HashSet<u32> = pairs.iter().map(|p| p.rank).collect();
    let n = candidates.len() as u32;
    if ranks.len() != pairs.len() || !ranks.iter().all(|r| (1..=n).contains(r)) {
        return Err(RepairError::Verification("ranks are not 1..=N".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn rank_of(report: &RepairReport, id: &str) -> u32 {
        report
            .pairs
            .iter()
            .find(|p| p.course_id == id)
            .map(|p| p.rank)
            .unwrap()
    }

    #[test]
    fn complete_response_passes_through() {
        let c = ids(&["A", "B", "C"]);
        let r = vec![
            RankedId::new("B", 1),
            RankedId::new("C", 2),
            RankedId::new("A", 3),
        ];
        let report = repair_rankings(&c, &r).unwrap();
        assert!(report.is_clean());
        assert_eq!(rank_of(&report, "A"), 3);
        assert_eq!(rank_of(&report, "B"), 1);
        assert_eq!(rank_of(&report, "C"), 2);
    }

    #[test]
    fn missing_candidate_is_appended_last() {
        let c = ids(&["A", "B", "C"]);
        let r = vec![RankedId::new("B", 1), RankedId::new("A", 2)];
        let report = repair_rankings(&c, &r).unwrap();
        assert_eq!(report.missing, ids(&["C"]));
        assert_eq!(rank_of(&report, "B"), 1);
        assert_eq!(rank_of(&report, "A"), 2);
        assert_eq!(rank_of(&report, "C"), 3);
    }

    #[test]
    fn hallucinated_id_is_dropped_and_gap_filled() {
        let c = ids(&["A", "B"]);
        let r = vec![RankedId::new("A", 1), RankedId::new("X", 2)];
        let report = repair_rankings(&c, &r).unwrap();
        assert_eq!(report.hallucinated, ids(&["X"]));
        assert_eq!(report.missing, ids(&["B"]));
        assert_eq!(rank_of(&report, "A"), 1);
        assert_eq!(rank_of(&report, "B"), 2);
        assert!(report.pairs.iter().all(|p| p.course_id != "X"));
    }

    #[test]
    fn duplicates_keep_first_and_ties_follow_candidate_order() {
        let c = ids(&["A", "B", "C", "D"]);
        let r = vec![
            RankedId::new("C", 2),
            RankedId::new("A", 2),
            RankedId::new("C", 1),
            RankedId::new("D", 7),
        ];
        let report = repair_rankings(&c, &r).unwrap();
        assert_eq!(report.duplicates, ids(&["C"]));
        // A and C tie at 2; A comes first in the catalog.
        assert_eq!(rank_of(&report, "A"), 1);
        assert_eq!(rank_of(&report, "C"), 2);
        assert_eq!(rank_of(&report, "D"), 3);
        assert_eq!(rank_of(&report, "B"), 4);
    }

    #[test]
    fn missing_items_rank_below_everything_returned() {
        let c: Vec<String> = (0..50).map(|i| format!("c{i}")).collect();
        let r: Vec<RankedId> = (0..50)
            .step_by(3)
            .enumerate()
            .map(|(pos, i)| RankedId::new(format!("c{i}"), 100 + pos as u32 * 10))
            .collect();
        let report = repair_rankings(&c, &r).unwrap();

        let returned: HashSet<&str> = r.iter().map(|p| p.course_id.as_str()).collect();
        let worst_returned = report
            .pairs
            .iter()
            .filter(|p| returned.contains(p.course_id.as_str()))
            .map(|p| p.rank)
            .max()
            .unwrap();
        for p in report
            .pairs
            .iter()
            .filter(|p| !returned.contains(p.course_id.as_str()))
        {
            assert!(p.rank > worst_returned, "{} ranked {}", p.course_id, p.rank);
        }
        let mut ranks: Vec<u32> = report.pairs.iter().map(|p| p.rank).collect();
        ranks.sort_unstable();
        assert_eq!(ranks, (1..=50).collect::<Vec<_>>());
    }

    #[test]
    fn nothing_usable_is_total_failure() {
        let c = ids(&["A", "B"]);
        assert_eq!(
            repair_rankings(&c, &[]),
            Err(RepairError::NoValidRankings { candidates: 2 })
        );
        assert_eq!(
            repair_rankings(&c, &[RankedId::new("Z", 1)]),
            Err(RepairError::NoValidRankings { candidates: 2 })
        );
    }

    #[test]
    fn empty_candidate_set_needs_no_repair() {
        let report = repair_rankings(&[], &[RankedId::new("ghost", 1)]).unwrap();
        assert!(report.pairs.is_empty());
    }

    #[test]
    fn duplicate_candidates_are_rejected() {
        let c = ids(&["A", "A"]);
        assert!(matches!(
            repair_rankings(&c, &[RankedId::new("A", 1)]),
            Err(RepairError::DuplicateCandidate(_))
        ));
    }
}
