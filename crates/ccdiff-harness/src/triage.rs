//! Per-Test triage: verification, blame, reduction and persistence.
//!
//! Blame and reduction are enrichments. Their errors are turned into
//! descriptions on the FailureRecord and never stop the record from being
//! saved.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use ccdiff_error::Result;
use ccdiff_observability::Statistics;
use tracing::{error, info, warn};

use crate::blame::{self, BLAME_LOG, BlameSettings};
use crate::classifier::{Classifier, FailureGroup, group_failures};
use crate::config::HarnessConfig;
use crate::model::{RunStatus, Test, TestRun, TestStatus};
use crate::narrative::{self, BlameNote, LogHeader, StepTimeouts};
use crate::persist::{
    FailureRecord, FailureStore, FingerprintDigest, GEN_FAIL, NO_BASELINE, SaveOutcome,
};
use crate::reducer::{ReductionKind, ReductionOutcome, Reducer};
use crate::registry::OptionSet;
use crate::verifier::{self, Candidate, Verdict, Verification};

/// Shared, read-only collaborators of triage.
#[derive(Debug, Clone, Copy)]
pub struct TriageContext<'a> {
    pub config: &'a HarnessConfig,
    pub classifier: &'a Classifier,
    pub stats: &'a Statistics,
    pub store: &'a FailureStore,
    pub generator_version: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriageSummary {
    pub status: TestStatus,
    pub passed: bool,
    pub records: Vec<SaveOutcome>,
}

/// Outcome of the enrichment steps for one failure.
struct Enrichment {
    blame: Option<BlameNote>,
    reduction: Option<String>,
    artifacts: Vec<PathBuf>,
}

impl TriageContext<'_> {
    fn timeouts(&self) -> StepTimeouts {
        StepTimeouts {
            build_secs: self.config.timeouts.build_secs,
            run_secs: self.config.timeouts.run_secs,
        }
    }

    fn blame_settings<'s>(&'s self, seed: &'s str) -> BlameSettings<'s> {
        BlameSettings {
            build: self.config.commands.blame_build(),
            run: self.config.commands.blame_run(),
            build_limits: self.config.build_limits(),
            run_limits: self.config.run_limits(),
            seed,
        }
    }

    fn reducer<'s>(&'s self, seed: &'s str) -> Reducer<'s> {
        Reducer {
            config: &self.config.reduction,
            build: &self.config.commands.build,
            run: &self.config.commands.run,
            build_timeout_secs: self.config.timeouts.build_secs,
            run_timeout_secs: self.config.timeouts.run_secs,
            seed,
        }
    }

    fn blame(&self, test: &Test, option_set: &OptionSet, expected: &[u8]) -> BlameNote {
        let settings = self.blame_settings(test.seed.as_str());
        let result = blame::blame_option_set(&settings, option_set, expected, &test.dir, &test.files);
        BlameNote::from_result(&result)
    }

    fn reduce(
        &self,
        test: &Test,
        kind: ReductionKind,
        good: &[&TestRun],
        bad: &[&TestRun],
    ) -> (Option<String>, Vec<PathBuf>) {
        if !self.config.reduction.enabled {
            return (None, Vec::new());
        }
        let reducer = self.reducer(test.seed.as_str());
        match reducer.reduce(kind, good, bad, &test.dir, &test.files) {
            Ok(outcome) => {
                if let ReductionOutcome::Degraded { reason } = &outcome {
                    warn!(seed = %test.seed, reason = %reason, "reduction degraded");
                }
                (Some(outcome.to_string()), outcome.artifacts())
            }
            Err(err) => {
                warn!(seed = %test.seed, error = %err, "reduction raised an error");
                (Some(format!("raised an error: {err}")), Vec::new())
            }
        }
    }

    fn save(&self, record: &FailureRecord, log: &str, test: &Test, files: &[PathBuf]) -> Option<SaveOutcome> {
        match self.store.save(record, log, &test.dir, files) {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!(seed = %test.seed, error = %err, "failed to save failure record");
                None
            }
        }
    }
}

/// Save the narrative of a failed generator run.
///
/// # Errors
///
/// I/O errors writing the record.
pub fn save_generation_failure(ctx: &TriageContext<'_>, test: &Test) -> Result<SaveOutcome> {
    let status = test.aggregate()?;
    let header = LogHeader {
        generator_version: ctx.generator_version,
        seed: test.seed.as_str(),
        optsets: Vec::new(),
        fail_type: status.as_str(),
        blame: None,
    };
    let log = narrative::generation_log(&header, test, ctx.config.timeouts.generator_secs);
    let record = FailureRecord::new(test.seed.as_str(), GEN_FAIL, status.as_str());
    ctx.stats.seed_failed(test.seed.as_str());
    ctx.store.save(&record, &log, &test.dir, &[])
}

/// Triage a Test whose runs are all terminal.
///
/// # Errors
///
/// [`ccdiff_error::CcdiffError::RunsPending`] when called too early.
/// Enrichment and persistence problems are logged, not returned.
pub fn handle_results(ctx: &TriageContext<'_>, test: &Test) -> Result<TriageSummary> {
    let mut status = test.aggregate()?;
    if matches!(status, TestStatus::GenFail | TestStatus::GenFailTimeout) {
        let records = vec![save_generation_failure(ctx, test)?];
        return Ok(TriageSummary {
            status,
            passed: false,
            records,
        });
    }

    let successful: Vec<&TestRun> = test.successful_runs().collect();
    let candidates: Vec<Candidate<'_>> = successful
        .iter()
        .filter_map(|r| Candidate::from_run(r))
        .collect();
    let verification = verifier::verify(&candidates, ctx.config.error_sentinel.as_deref());
    if verification.verdict == Verdict::ErrorOutput {
        status = TestStatus::MultipleMiscompare;
    }
    verifier::record_miscompares(ctx.stats, &successful, &verification);
    let good: Vec<&TestRun> = verification.good.iter().map(|&i| successful[i]).collect();
    let bad: Vec<&TestRun> = verification.bad.iter().map(|&i| successful[i]).collect();

    let mut records = Vec::new();
    for group in group_failures(ctx.classifier, &test.runs) {
        records.extend(save_failure_group(ctx, test, &group, &successful, &good));
    }

    match verification.verdict {
        Verdict::Empty | Verdict::Pass => {}
        Verdict::Miscompare => {
            records.extend(save_miscompare(ctx, test, &verification, &good, &bad, &successful));
        }
        Verdict::ErrorOutput | Verdict::MultipleMiscompare => {
            records.extend(save_ambiguous(ctx, test, status, &bad));
        }
    }
    if status == TestStatus::NoGoodRuns {
        let failed: Vec<&TestRun> = test.failed_runs().collect();
        records.extend(save_ambiguous(ctx, test, status, &failed));
    }

    let passed = status == TestStatus::Ok;
    if passed {
        ctx.stats.seed_passed(test.seed.as_str());
    } else {
        ctx.stats.seed_failed(test.seed.as_str());
        info!(seed = %test.seed, status = %status, records = records.len(), "test failed");
    }
    Ok(TriageSummary {
        status,
        passed,
        records,
    })
}

fn blame_log_if_present(test: &Test) -> Option<PathBuf> {
    test.dir.join(BLAME_LOG).is_file().then(|| PathBuf::from(BLAME_LOG))
}

fn save_failure_group(
    ctx: &TriageContext<'_>,
    test: &Test,
    group: &FailureGroup,
    successful: &[&TestRun],
    good: &[&TestRun],
) -> Option<SaveOutcome> {
    let members: Vec<&TestRun> = group.members.iter().map(|&i| &test.runs[i]).collect();
    let representative = &test.runs[group.representative()];
    let mut tag = group.tag.clone();

    let mut enrichment = Enrichment {
        blame: ctx.config.blame.then(BlameNote::not_run),
        reduction: None,
        artifacts: Vec::new(),
    };
    if ctx.config.blame && group.status == RunStatus::RunFail && tag.is_none() {
        if let Some(expected) = good.first().and_then(|r| r.fingerprint()) {
            let note = ctx.blame(test, &representative.option_set, expected);
            tag.clone_from(&note.phase);
            enrichment.blame = Some(note);
            enrichment.artifacts.extend(blame_log_if_present(test));
        }
    }
    let kind = match group.status {
        RunStatus::BuildFail => Some(ReductionKind::BuildFail),
        RunStatus::RunFail => Some(ReductionKind::RunFail),
        _ => None,
    };
    if let Some(kind) = kind {
        let (reduction, artifacts) = ctx.reduce(test, kind, successful, &[representative]);
        enrichment.reduction = reduction;
        enrichment.artifacts.extend(artifacts);
    }

    let log_only = group.status == RunStatus::BuildTimeout && ctx.config.ignore_build_timeout_files;
    let sizes: Option<Vec<(String, u64)>> = log_only.then(|| {
        test.files
            .iter()
            .map(|f| {
                let size = fs::metadata(test.dir.join(f)).map_or(0, |m| m.len());
                (f.to_string_lossy().into_owned(), size)
            })
            .collect()
    });
    let files = if log_only {
        Vec::new()
    } else {
        let mut files = test.files.clone();
        files.extend(members.iter().filter_map(|r| r.artifact.clone()));
        files.extend(enrichment.artifacts.iter().cloned());
        files
    };

    let header = LogHeader {
        generator_version: ctx.generator_version,
        seed: test.seed.as_str(),
        optsets: members.iter().map(|r| r.name()).collect(),
        fail_type: group.fail_type(),
        blame: enrichment.blame.as_ref(),
    };
    let log = narrative::failure_log(&header, &members, ctx.timeouts(), sizes.as_deref());

    let mut record = FailureRecord::new(
        test.seed.as_str(),
        &representative.option_set.compiler,
        group.fail_type(),
    )
    .with_classification(tag.as_deref());
    record.option_sets = members.iter().map(|r| r.name().to_owned()).collect();
    record.blame_result = enrichment.blame;
    record.reduction_result = enrichment.reduction;
    record.artifacts = enrichment
        .artifacts
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    ctx.save(&record, &log, test, &files)
}

fn compiler_set(runs: &[&TestRun]) -> String {
    runs.iter()
        .map(|r| r.option_set.compiler.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join("-")
}

fn digests(runs: &[&TestRun]) -> Vec<FingerprintDigest> {
    runs.iter()
        .filter_map(|r| {
            r.fingerprint().map(|fp| FingerprintDigest {
                option_set: r.name().to_owned(),
                digest: verifier::fingerprint_digest(fp),
            })
        })
        .collect()
}

fn save_miscompare(
    ctx: &TriageContext<'_>,
    test: &Test,
    verification: &Verification,
    good: &[&TestRun],
    bad: &[&TestRun],
    successful: &[&TestRun],
) -> Option<SaveOutcome> {
    let (Some(first_bad), Some(expected)) = (bad.first(), good.first().and_then(|r| r.fingerprint()))
    else {
        return None;
    };
    info!(
        seed = %test.seed,
        groups = verification.group_count,
        bad = ?bad.iter().map(|r| r.name()).collect::<Vec<_>>(),
        "miscompare"
    );
    let mut enrichment = Enrichment {
        blame: None,
        reduction: None,
        artifacts: Vec::new(),
    };
    if ctx.config.blame {
        enrichment.blame = Some(ctx.blame(test, &first_bad.option_set, expected));
        enrichment.artifacts.extend(blame_log_if_present(test));
    }
    let (reduction, artifacts) = ctx.reduce(test, ReductionKind::Miscompare, good, bad);
    enrichment.reduction = reduction;
    enrichment.artifacts.extend(artifacts);

    let mut files = test.files.clone();
    files.extend(bad.iter().chain(good).filter_map(|r| r.artifact.clone()));
    files.extend(enrichment.artifacts.iter().cloned());

    let fail_type = TestStatus::Miscompare.as_str();
    let mut optsets: Vec<&str> = bad.iter().map(|r| r.name()).collect();
    optsets.extend(good.iter().map(|r| r.name()));
    let header = LogHeader {
        generator_version: ctx.generator_version,
        seed: test.seed.as_str(),
        optsets,
        fail_type,
        blame: enrichment.blame.as_ref(),
    };
    let log = narrative::miscompare_log(&header, test, bad, good);

    let classification = enrichment.blame.as_ref().and_then(|b| b.phase.clone());
    let mut record = FailureRecord::new(test.seed.as_str(), &compiler_set(bad), fail_type)
        .with_classification(classification.as_deref());
    record.option_sets = bad.iter().map(|r| r.name().to_owned()).collect();
    record.fingerprints = digests(successful);
    record.blame_result = enrichment.blame;
    record.reduction_result = enrichment.reduction;
    record.artifacts = enrichment
        .artifacts
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    ctx.save(&record, &log, test, &files)
}

/// Failures without a baseline: no blame, no reduction.
fn save_ambiguous(
    ctx: &TriageContext<'_>,
    test: &Test,
    status: TestStatus,
    runs: &[&TestRun],
) -> Option<SaveOutcome> {
    if runs.is_empty() {
        return None;
    }
    let fail_type = status.as_str();
    let header = LogHeader {
        generator_version: ctx.generator_version,
        seed: test.seed.as_str(),
        optsets: runs.iter().map(|r| r.name()).collect(),
        fail_type,
        blame: None,
    };
    let log = narrative::miscompare_log(&header, test, runs, &[]);
    let mut files = test.files.clone();
    files.extend(runs.iter().filter_map(|r| r.artifact.clone()));
    let mut record = FailureRecord::new(test.seed.as_str(), &compiler_set(runs), fail_type)
        .with_classification(Some(NO_BASELINE));
    record.option_sets = runs.iter().map(|r| r.name().to_owned()).collect();
    record.fingerprints = digests(runs);
    ctx.save(&record, &log, test, &files)
}
