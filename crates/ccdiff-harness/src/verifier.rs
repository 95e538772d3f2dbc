//! Majority-vote differential verification.
//!
//! Successful runs are partitioned by fingerprint. With exactly two groups
//! the larger one is the tentative baseline, then two tie-breaks may swap
//! the assignment:
//!
//! 1. If the baseline holds no no-optimization runs and the other group
//!    holds at least one, the groups swap.
//! 2. If the baseline spans fewer compilers than the other group, the
//!    groups swap, so a single misbehaving toolchain ends up on the bad
//!    side.
//!
//! The order of these rules is significant; classification downstream
//! depends on it.
//!
//! A single group whose output contains the error sentinel is not a pass:
//! every run agrees on a result the test program itself reports as wrong,
//! so all of them are bad and there is no baseline.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use ccdiff_observability::{RunTag, Statistics};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::TestRun;

/// What the verifier needs to know about one successful run.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub fingerprint: &'a [u8],
    pub compiler: &'a str,
    pub no_opt: bool,
}

impl<'a> Candidate<'a> {
    /// `None` unless the run finished with a fingerprint.
    pub fn from_run(run: &'a TestRun) -> Option<Self> {
        Some(Self {
            fingerprint: run.fingerprint()?,
            compiler: &run.option_set.compiler,
            no_opt: run.option_set.no_opt,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No successful runs at all.
    Empty,
    Pass,
    /// All runs agree on an output that carries the error sentinel.
    ErrorOutput,
    Miscompare,
    MultipleMiscompare,
}

/// Result of verification. Indices refer to the candidate slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub verdict: Verdict,
    pub group_count: usize,
    pub good: Vec<usize>,
    pub bad: Vec<usize>,
}

impl Verification {
    /// Whether blame and reduction have a baseline to compare against.
    pub fn has_baseline(&self) -> bool {
        !self.good.is_empty()
    }
}

/// Partition `candidates` and assign good and bad runs. An output
/// containing `error_sentinel` never passes.
pub fn verify(candidates: &[Candidate<'_>], error_sentinel: Option<&str>) -> Verification {
    let groups = group_by_fingerprint(candidates);
    let flagged = |g: &[usize]| {
        error_sentinel.is_some_and(|s| {
            g.first()
                .is_some_and(|&i| contains(candidates[i].fingerprint, s.as_bytes()))
        })
    };
    match groups.len() {
        0 => Verification {
            verdict: Verdict::Empty,
            group_count: 0,
            good: Vec::new(),
            bad: Vec::new(),
        },
        1 if flagged(&groups[0]) => Verification {
            verdict: Verdict::ErrorOutput,
            group_count: 1,
            good: Vec::new(),
            bad: groups.into_iter().flatten().collect(),
        },
        1 => Verification {
            verdict: Verdict::Pass,
            group_count: 1,
            good: groups.into_iter().next().unwrap_or_default(),
            bad: Vec::new(),
        },
        2 => {
            let mut iter = groups.into_iter();
            let mut good = iter.next().unwrap_or_default();
            let mut bad = iter.next().unwrap_or_default();
            if bad.len() > good.len() {
                std::mem::swap(&mut good, &mut bad);
            }
            let no_opt = |g: &[usize]| g.iter().filter(|&&i| candidates[i].no_opt).count();
            if no_opt(&good) == 0 && no_opt(&bad) > 0 {
                std::mem::swap(&mut good, &mut bad);
            }
            let families = |g: &[usize]| {
                g.iter()
                    .map(|&i| candidates[i].compiler)
                    .collect::<BTreeSet<_>>()
                    .len()
            };
            if families(&good) < families(&bad) {
                std::mem::swap(&mut good, &mut bad);
            }
            Verification {
                verdict: Verdict::Miscompare,
                group_count: 2,
                good,
                bad,
            }
        }
        n => Verification {
            verdict: Verdict::MultipleMiscompare,
            group_count: n,
            good: Vec::new(),
            bad: groups.into_iter().flatten().collect(),
        },
    }
}

/// Groups in order of first appearance.
fn group_by_fingerprint(candidates: &[Candidate<'_>]) -> Vec<Vec<usize>> {
    let mut keys: Vec<&[u8]> = Vec::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (idx, c) in candidates.iter().enumerate() {
        match keys.iter().position(|k| *k == c.fingerprint) {
            Some(g) => groups[g].push(idx),
            None => {
                keys.push(c.fingerprint);
                groups.push(vec![idx]);
            }
        }
    }
    groups
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Count a miscompare for every bad run.
pub fn record_miscompares(stats: &Statistics, runs: &[&TestRun], verification: &Verification) {
    if verification.verdict == Verdict::Pass || verification.verdict == Verdict::Empty {
        return;
    }
    for &idx in &verification.bad {
        if let Some(run) = runs.get(idx) {
            stats.record_target(run.name(), RunTag::Miscompare);
        }
    }
}

/// Short stable digest of a fingerprint for logs and records.
pub fn fingerprint_digest(fingerprint: &[u8]) -> String {
    let digest = Sha256::digest(fingerprint);
    let mut s = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        let _ = write!(s, "{byte:02x}");
    }
    s
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn cand<'a>(fp: &'a str, compiler: &'a str, no_opt: bool) -> Candidate<'a> {
        Candidate {
            fingerprint: fp.as_bytes(),
            compiler,
            no_opt,
        }
    }

    #[test]
    fn single_group_passes() {
        let c = [cand("42", "gcc", false), cand("42", "clang", false)];
        let v = verify(&c, None);
        assert_eq!(v.verdict, Verdict::Pass);
        assert_eq!(v.good, [0, 1]);
        assert!(v.bad.is_empty());
    }

    #[test]
    fn majority_is_good() {
        let c = [
            cand("42", "gcc", false),
            cand("42", "clang", false),
            cand("43", "clang", false),
        ];
        let v = verify(&c, None);
        assert_eq!(v.verdict, Verdict::Miscompare);
        assert_eq!(v.good, [0, 1]);
        assert_eq!(v.bad, [2]);
    }

    #[test]
    fn equal_sizes_keep_first_group_as_good() {
        let c = [cand("1", "gcc", false), cand("2", "gcc", false)];
        let v = verify(&c, None);
        assert_eq!(v.good, [0]);
        assert_eq!(v.bad, [1]);
    }

    #[test]
    fn no_opt_tie_break_swaps() {
        // Majority is optimized only; the minority contains a -O0 run.
        let c = [
            cand("1", "gcc", false),
            cand("1", "gcc", false),
            cand("2", "gcc", true),
        ];
        let v = verify(&c, None);
        assert_eq!(v.good, [2]);
        assert_eq!(v.bad, [0, 1]);
    }

    #[test]
    fn compiler_tie_break_blames_single_toolchain() {
        // Majority comes from one compiler, minority from two.
        let c = [
            cand("1", "icc", false),
            cand("1", "icc", false),
            cand("1", "icc", false),
            cand("2", "gcc", false),
            cand("2", "clang", false),
        ];
        let v = verify(&c, None);
        assert_eq!(v.good, [3, 4]);
        assert_eq!(v.bad, [0, 1, 2]);
    }

    #[test]
    fn compiler_tie_break_applies_after_no_opt() {
        // no-opt moves the single gcc -O0 run to good, then the family rule
        // moves it back because the other side spans two compilers.
        let c = [
            cand("1", "clang", false),
            cand("1", "icc", false),
            cand("2", "gcc", true),
        ];
        let v = verify(&c, None);
        assert_eq!(v.good, [0, 1]);
        assert_eq!(v.bad, [2]);
    }

    #[test]
    fn three_groups_have_no_baseline() {
        let c = [
            cand("1", "gcc", false),
            cand("2", "gcc", false),
            cand("3", "gcc", false),
            cand("1", "clang", false),
        ];
        let v = verify(&c, None);
        assert_eq!(v.verdict, Verdict::MultipleMiscompare);
        assert_eq!(v.group_count, 3);
        assert!(!v.has_baseline());
        assert_eq!(v.bad.len(), 4);
    }

    #[test]
    fn agreeing_error_output_is_all_bad() {
        let c = [
            cand("ERROR: checksum mismatch", "gcc", false),
            cand("ERROR: checksum mismatch", "clang", false),
        ];
        let v = verify(&c, Some("ERROR"));
        assert_eq!(v.verdict, Verdict::ErrorOutput);
        assert!(!v.has_baseline());
        assert_eq!(v.bad, [0, 1]);
        assert_eq!(verify(&c, None).verdict, Verdict::Pass);
        let ok = [cand("42", "gcc", false), cand("42", "clang", false)];
        assert_eq!(verify(&ok, Some("ERROR")).verdict, Verdict::Pass);
    }

    #[test]
    fn sentinel_in_one_of_two_groups_is_a_plain_miscompare() {
        let c = [
            cand("42", "gcc", false),
            cand("42", "gcc", false),
            cand("ERROR", "clang", false),
        ];
        let v = verify(&c, Some("ERROR"));
        assert_eq!(v.verdict, Verdict::Miscompare);
        assert_eq!(v.bad, [2]);
    }

    #[test]
    fn empty_input() {
        let v = verify(&[], None);
        assert_eq!(v.verdict, Verdict::Empty);
        assert_eq!(v.group_count, 0);
    }

    #[test]
    fn digest_is_stable() {
        assert_eq!(fingerprint_digest(b"42"), fingerprint_digest(b"42"));
        assert_ne!(fingerprint_digest(b"42"), fingerprint_digest(b"43"));
        assert_eq!(fingerprint_digest(b"").len(), 16);
    }

    proptest! {
        #[test]
        fn group_count_equals_distinct_fingerprints(
            fps in proptest::collection::vec(0u8..6, 0..24),
            compilers in proptest::collection::vec(0u8..3, 24),
        ) {
            let texts: Vec<String> = fps.iter().map(u8::to_string).collect();
            let names = ["gcc", "clang", "icc"];
            let cands: Vec<Candidate<'_>> = texts
                .iter()
                .zip(&compilers)
                .map(|(t, &c)| cand(t, names[usize::from(c)], false))
                .collect();
            let distinct: BTreeSet<&String> = texts.iter().collect();
            let v = verify(&cands, None);
            prop_assert_eq!(v.group_count, distinct.len());
            prop_assert_eq!(v.good.len() + v.bad.len(), cands.len());
            match distinct.len() {
                0 => prop_assert_eq!(v.verdict, Verdict::Empty),
                1 => prop_assert_eq!(v.verdict, Verdict::Pass),
                2 => prop_assert_eq!(v.verdict, Verdict::Miscompare),
                _ => {
                    prop_assert_eq!(v.verdict, Verdict::MultipleMiscompare);
                    prop_assert!(v.good.is_empty());
                }
            }
        }
    }
}
