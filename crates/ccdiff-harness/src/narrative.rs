//! Human-readable `log.txt` narratives stored with every FailureRecord.

use std::fmt::Write as _;

use ccdiff_error::{CcdiffError, Result};
use serde::{Deserialize, Serialize};

use crate::blame::BlameOutcome;
use crate::model::{RunStatus, StepRecord, Test, TestRun};

const RULE: &str = "====================================================================";

/// Blame result as it appears in narratives and `record.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlameNote {
    pub result: String,
    pub phase: Option<String>,
}

impl BlameNote {
    pub fn not_run() -> Self {
        Self {
            result: "was not run".to_owned(),
            phase: None,
        }
    }

    /// Degraded and hard-error results are described, never propagated.
    pub fn from_result(result: &Result<BlameOutcome>) -> Self {
        match result {
            Ok(outcome) => Self {
                result: outcome.to_string(),
                phase: outcome.phase_name().map(str::to_owned),
            },
            Err(err) => Self::from_error(err),
        }
    }

    pub fn from_error(err: &CcdiffError) -> Self {
        Self {
            result: format!("raised an error: {err}"),
            phase: None,
        }
    }
}

/// Lines common to every narrative.
#[derive(Debug, Clone)]
pub struct LogHeader<'a> {
    pub generator_version: &'a str,
    pub seed: &'a str,
    pub optsets: Vec<&'a str>,
    pub fail_type: &'a str,
    /// `None` when blame is disabled for the campaign.
    pub blame: Option<&'a BlameNote>,
}

impl LogHeader<'_> {
    fn write(&self, out: &mut String) {
        let now = chrono::Local::now().format("%Y/%m/%d %H:%M:%S");
        let _ = writeln!(out, "Generator version: {}", self.generator_version);
        let _ = writeln!(out, "Seed: {}", self.seed);
        let _ = writeln!(out, "Time: {now}");
        if !self.optsets.is_empty() {
            let _ = writeln!(out, "Optsets: {}", self.optsets.join(", "));
        }
        let _ = writeln!(out, "Type: {}", self.fail_type);
        if let Some(blame) = self.blame {
            let _ = writeln!(out, "Blaming {}", blame.result);
            let _ = writeln!(
                out,
                "Optimization to blame: {}",
                blame.phase.as_deref().unwrap_or("")
            );
        }
    }
}

fn write_step(out: &mut String, label: &str, step: &StepRecord) {
    let _ = writeln!(out, "{label} cmd: {}", step.command);
    let _ = writeln!(out, "{label} exit code: {}", step.output.display_code());
    let banner = |kind: &str| {
        let title = format!("=== {label} {kind} ");
        let pad = RULE.len().saturating_sub(title.len());
        format!("{title}{}\n", "=".repeat(pad))
    };
    out.push_str(&banner("log"));
    out.push_str(&step.output.stdout_text());
    out.push_str(&banner("err"));
    out.push_str(&step.output.stderr_text());
    out.push_str(&banner("end"));
    out.push('\n');
}

/// Narrative of a failed or timed-out generator invocation.
pub fn generation_log(header: &LogHeader<'_>, test: &Test, timeout_secs: u64) -> String {
    let mut out = String::new();
    header.write(&mut out);
    out.push_str("\n\n");
    if let Some(step) = test.generator() {
        if step.output.timed_out {
            let _ = writeln!(out, "Generator timeout: {timeout_secs} seconds");
        }
        write_step(&mut out, "Generator", step);
    }
    out
}

/// Per-run build and run timeouts, for narratives.
#[derive(Debug, Clone, Copy)]
pub struct StepTimeouts {
    pub build_secs: u64,
    pub run_secs: u64,
}

/// Narrative for a group of build or run failures.
///
/// `sizes` lists the Test files for build-timeout records that keep only
/// the log.
pub fn failure_log(
    header: &LogHeader<'_>,
    runs: &[&TestRun],
    timeouts: StepTimeouts,
    sizes: Option<&[(String, u64)]>,
) -> String {
    let mut out = String::new();
    header.write(&mut out);
    for run in runs {
        out.push_str("\n\n");
        let _ = writeln!(out, "{RULE}");
        let _ = writeln!(out, "========== Details for {} optset.", run.name());
        let _ = writeln!(out, "{RULE}");
        if run.status() == RunStatus::BuildTimeout {
            let _ = writeln!(out, "Build timeout: {} seconds", timeouts.build_secs);
            if let Some(sizes) = sizes {
                out.push_str("File sizes: \n");
                for (file, bytes) in sizes {
                    let _ = writeln!(out, "{file} : {}b", metric_size(*bytes));
                }
            }
        }
        if let Some(build) = run.build() {
            write_step(&mut out, "Build", build);
        }
        if run.status() == RunStatus::RunTimeout {
            let _ = writeln!(out, "Exec timeout: {} seconds", timeouts.run_secs);
        }
        if let Some(step) = run.run() {
            write_step(&mut out, "Run", step);
        }
    }
    out
}

/// Narrative for a Test whose successful runs disagree.
pub fn miscompare_log(
    header: &LogHeader<'_>,
    test: &Test,
    bad: &[&TestRun],
    good: &[&TestRun],
) -> String {
    let mut out = String::new();
    header.write(&mut out);
    out.push_str("\n\n");
    out.push_str("==== FAILED TEST RUNS =====================\n");
    for run in test.failed_runs() {
        let _ = writeln!(out, "Optset {} has status {}", run.name(), run.status());
    }
    out.push_str("==== SUCCESSFUL TEST RUNS =================\n");
    for run in test.successful_runs() {
        let _ = writeln!(out, "Optset {} has status {}", run.name(), run.status());
    }
    out.push_str("===========================================\n");
    if test.failed_runs().next().is_some() {
        out.push_str(
            "For details look for this fail saved as one of individual compfail or runfail\n",
        );
    }
    for run in bad {
        out.push_str("==== BAD ==================================\n");
        let _ = writeln!(out, "Optset: {}", run.name());
        let output = run.fingerprint().map(String::from_utf8_lossy).unwrap_or_default();
        let _ = writeln!(out, "Output: {output}");
    }
    out.push_str("===========================================\n\n");
    for run in good {
        out.push_str("==== GOOD =================================\n");
        let _ = writeln!(out, "Optset: {}", run.name());
        let output = run.fingerprint().map(String::from_utf8_lossy).unwrap_or_default();
        let _ = writeln!(out, "Output: {output}");
    }
    out.push_str("===========================================\n");
    out
}

/// Decimal metric prefix with one fractional digit: `999`, `1.2k`, `3.4M`.
pub fn metric_size(bytes: u64) -> String {
    const PREFIXES: &[char] = &['k', 'M', 'G', 'T', 'P', 'E'];
    if bytes < 1000 {
        return bytes.to_string();
    }
    let mut exp = 0;
    let mut scale = 1u64;
    while exp < PREFIXES.len() && bytes / scale >= 1000 {
        scale *= 1000;
        exp += 1;
    }
    #[allow(clippy::cast_precision_loss)]
    let value = bytes as f64 / scale as f64;
    format!("{value:.1}{}", PREFIXES[exp - 1])
}
