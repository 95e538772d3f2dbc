//! Optimization-phase bisection ("blame").
//!
//! Given a failing option-set and the output a good build produced, find the
//! smallest optimization-control limit at which the failure appears and name
//! the pass that runs at that limit.
//!
//! The search space is a list of stages, each with ordered phases. Every
//! phase is searched with [`bisect_phase`], a halving search whose interval
//! keeps `start < current < end` until `current == start + 1`.

mod executor;
mod profile;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use ccdiff_error::{CcdiffError, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use executor::{BlameExecutor, BlameSettings, CommandExecutor};
pub use profile::{
    BlameMode, BlameProfile, CompiledProfile, FAILED_TO_BLAME, Injection, PhaseSpec, StageSpec,
};

use crate::process::ProcessOutput;
use crate::registry::OptionSet;

/// Phase name reported for failures of unoptimized builds.
pub const O0_BUG: &str = "O0_bug";

/// Scratch directory, relative to the Test directory.
pub const BLAME_DIR: &str = "blame";

/// Narrative written next to the Test files.
pub const BLAME_LOG: &str = "blame.log";

/// Upper bound on predicate evaluations for one phase. A monotone
/// predicate over a 64-bit range needs far fewer.
const MAX_EVALUATIONS: usize = 256;

// ── Per-phase search ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSearch {
    /// First limit at which the failure appears.
    pub culprit: u64,
    pub evaluations: usize,
}

fn next_step(start: u64, end: u64, current: u64, previous_failed: bool) -> (u64, u64, u64) {
    if previous_failed {
        (start, current, (current - start) / 2 + start)
    } else {
        (current, end, (end - current) / 2 + current)
    }
}

/// Binary search over `[0, max]` for the first limit where `fails` holds.
///
/// The search starts as if `max` had already failed. If the last evaluated
/// limit passed, the culprit is the upper end of the interval.
///
/// # Errors
///
/// Errors from `fails` are propagated; a predicate that keeps the search
/// from converging within a fixed budget yields [`CcdiffError::Internal`].
pub fn bisect_phase<F>(max: u64, mut fails: F) -> Result<PhaseSearch>
where
    F: FnMut(u64) -> Result<bool>,
{
    if max == 0 {
        return Ok(PhaseSearch {
            culprit: 0,
            evaluations: 0,
        });
    }
    let (mut start, mut end, mut current) = (0, max, max);
    let mut failed = true;
    let mut evaluations = 0;
    loop {
        if evaluations >= MAX_EVALUATIONS {
            return Err(CcdiffError::internal(format!(
                "phase bisection over [0, {max}] did not converge"
            )));
        }
        (start, end, current) = next_step(start, end, current, failed);
        let converged = start + 1 >= current;
        debug!(start, current, end, "trying limit");
        failed = fails(current)?;
        evaluations += 1;
        if failed {
            if converged {
                break;
            }
            continue;
        }
        if converged && current + 1 == end {
            break;
        }
    }
    Ok(PhaseSearch {
        culprit: if failed { current } else { end },
        evaluations,
    })
}

// ── Search state ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseValue {
    Unset,
    Limit(i64),
}

/// Current limit of every phase in every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlameState {
    values: Vec<Vec<PhaseValue>>,
}

impl BlameState {
    pub fn new(profile: &CompiledProfile) -> Self {
        Self {
            values: profile
                .spec()
                .stages
                .iter()
                .map(|s| vec![PhaseValue::Unset; s.phases.len()])
                .collect(),
        }
    }

    pub fn get(&self, stage: usize, phase: usize) -> PhaseValue {
        self.values
            .get(stage)
            .and_then(|s| s.get(phase))
            .copied()
            .unwrap_or(PhaseValue::Unset)
    }

    pub fn set(&mut self, stage: usize, phase: usize, value: PhaseValue) {
        if let Some(slot) = self.values.get_mut(stage).and_then(|s| s.get_mut(phase)) {
            *slot = value;
        }
    }

    /// Zero every phase of `stage`.
    pub fn disable_stage(&mut self, stage: usize) {
        if let Some(s) = self.values.get_mut(stage) {
            s.fill(PhaseValue::Limit(0));
        }
    }

    pub fn clear_stage(&mut self, stage: usize) {
        if let Some(s) = self.values.get_mut(stage) {
            s.fill(PhaseValue::Unset);
        }
    }

    /// Control string: every set phase as `<option><limit>`, space separated.
    pub fn injection(&self, profile: &CompiledProfile) -> String {
        let mut parts = Vec::new();
        for (s, stage) in profile.spec().stages.iter().enumerate() {
            for (p, phase) in stage.phases.iter().enumerate() {
                if let PhaseValue::Limit(v) = self.get(s, p) {
                    parts.push(format!("{}{v}", phase.option));
                }
            }
        }
        parts.join(" ")
    }
}

// ── Outcome ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlameReport {
    /// Whitespace replaced by underscores.
    pub phase_name: String,
    pub raw_phase_name: String,
    /// Control string at the converged setting.
    pub injection: String,
    pub stage: Option<String>,
    pub evaluations: usize,
    #[serde(skip)]
    pub final_output: Option<ProcessOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BlameOutcome {
    Blamed(BlameReport),
    NotApplicable { reason: String },
    Degraded { reason: String },
}

impl BlameOutcome {
    pub fn phase_name(&self) -> Option<&str> {
        match self {
            Self::Blamed(report) => Some(&report.phase_name),
            _ => None,
        }
    }
}

impl fmt::Display for BlameOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blamed(_) => f.write_str("was successful"),
            Self::NotApplicable { reason } => write!(f, "is not applicable: {reason}"),
            Self::Degraded { reason } => write!(f, "has failed: {reason}"),
        }
    }
}

// ── Bisector ────────────────────────────────────────────────────────────

struct Bisector<'a, E> {
    profile: &'a CompiledProfile,
    expected: &'a [u8],
    exec: &'a mut E,
    state: BlameState,
    evaluations: usize,
    phases_searched: usize,
}

impl<E: BlameExecutor> Bisector<'_, E> {
    /// Whether the failure is still visible with the current state.
    fn fails(&mut self) -> Result<bool> {
        let injection = self.state.injection(self.profile);
        self.evaluations += 1;
        let build = self.exec.build(&injection)?;
        if !build.success() {
            debug!(%injection, "build failed");
            return Ok(true);
        }
        let run = self.exec.run(&injection)?;
        if !run.success() {
            debug!(%injection, "run failed");
            return Ok(true);
        }
        Ok(run.stdout != self.expected)
    }

    /// Diagnostics of the step that prints them for the current state.
    fn diagnostics(&mut self) -> Result<ProcessOutput> {
        let injection = self.state.injection(self.profile);
        let build = self.exec.build(&injection)?;
        if self.profile.spec().diagnostics_from_run {
            return self.exec.run(&injection);
        }
        Ok(build)
    }

    /// Search one phase. `Ok(None)` means the phase was skipped.
    fn search_phase(&mut self, stage: usize, phase: usize) -> Result<Option<u64>> {
        let profile = self.profile;
        let fixed_max = profile
            .phase(stage, phase)
            .ok_or_else(|| CcdiffError::internal("phase index out of range"))?
            .fixed_max;
        let max = if let Some(max) = fixed_max {
            max
        } else {
            self.state
                .set(stage, phase, PhaseValue::Limit(profile.spec().probe_value));
            let probe = self.diagnostics()?;
            match profile.parse_phase_count(stage, phase, &probe.stderr_text()) {
                Some(max) => max,
                None if self.phases_searched == 0 => {
                    return Err(CcdiffError::PhaseCountUnreadable {
                        pattern: profile
                            .count_pattern(stage, phase)
                            .map_or_else(String::new, |re| re.as_str().to_owned()),
                        stage,
                        phase,
                    });
                }
                None => {
                    debug!(stage, phase, "phase count not reported, skipping phase");
                    self.state.set(stage, phase, PhaseValue::Unset);
                    return Ok(None);
                }
            }
        };
        debug!(stage, phase, max, "searching phase");
        let search = bisect_phase(max, |limit| {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            self.state.set(stage, phase, PhaseValue::Limit(limit));
            self.fails()
        })?;
        let value = i64::try_from(search.culprit)
            .unwrap_or(i64::MAX)
            .saturating_add(profile.spec().result_offset);
        self.state.set(stage, phase, PhaseValue::Limit(value));
        self.phases_searched += 1;
        Ok(Some(search.culprit))
    }

    fn run_flat(&mut self) -> Result<Option<(usize, u64)>> {
        let mut last = None;
        for stage in 0..self.profile.stage_count() {
            for phase in 0..self.profile.phase_count(stage) {
                if let Some(culprit) = self.search_phase(stage, phase)? {
                    last = Some((stage, culprit));
                }
            }
        }
        Ok(last)
    }

    fn run_staged(&mut self) -> Result<Option<(usize, u64)>> {
        let mut chosen = None;
        for stage in (0..self.profile.stage_count()).rev() {
            self.state.disable_stage(stage);
            let still_fails = self.fails()?;
            self.state.clear_stage(stage);
            if !still_fails {
                chosen = Some(stage);
                break;
            }
            debug!(stage, "failure persists with stage disabled");
        }
        let Some(stage) = chosen else {
            return Ok(None);
        };
        let mut last = None;
        for phase in 0..self.profile.phase_count(stage) {
            if let Some(culprit) = self.search_phase(stage, phase)? {
                last = Some((stage, culprit));
            }
        }
        Ok(last)
    }
}

/// Run the whole staged search for one failing option-set.
///
/// # Errors
///
/// Process failures from the executor, an unreadable phase count on the
/// first searched phase, and a missing phase name at the converged setting.
pub fn bisect<E: BlameExecutor>(
    profile: &CompiledProfile,
    target: &str,
    expected: &[u8],
    exec: &mut E,
) -> Result<BlameOutcome> {
    let mut bisector = Bisector {
        profile,
        expected,
        exec,
        state: BlameState::new(profile),
        evaluations: 0,
        phases_searched: 0,
    };
    let last = match profile.spec().mode {
        BlameMode::Flat => bisector.run_flat()?,
        BlameMode::Staged => bisector.run_staged()?,
    };
    let Some((stage, culprit)) = last else {
        let reason = match profile.spec().mode {
            BlameMode::Staged => "disabling no single stage hides the failure",
            BlameMode::Flat => "no phase reported a count",
        };
        return Ok(BlameOutcome::Degraded {
            reason: reason.to_owned(),
        });
    };
    let injection = bisector.state.injection(profile);
    let stage_name = profile.spec().stages.get(stage).map(|s| s.name.clone());

    if profile.spec().unblamable_limit == Some(culprit) {
        return Ok(BlameOutcome::Blamed(BlameReport {
            phase_name: FAILED_TO_BLAME.to_owned(),
            raw_phase_name: FAILED_TO_BLAME.to_owned(),
            injection,
            stage: stage_name,
            evaluations: bisector.evaluations,
            final_output: None,
        }));
    }

    let final_output = bisector.diagnostics()?;
    let (phase_name, raw_phase_name) = profile
        .extract_phase_name(&final_output.stderr_text())
        .ok_or_else(|| CcdiffError::PhaseNameMissing {
            target: target.to_owned(),
        })?;
    Ok(BlameOutcome::Blamed(BlameReport {
        phase_name,
        raw_phase_name,
        injection,
        stage: stage_name,
        evaluations: bisector.evaluations,
        final_output: Some(final_output),
    }))
}

// ── Test-level entry point ──────────────────────────────────────────────

/// Blame `option_set` for a Test living in `test_dir`.
///
/// Unoptimized option-sets are reported as [`O0_BUG`] without searching.
/// The search runs in a `blame/` copy of `files`; the narrative is written
/// to `blame.log` in `test_dir` whenever a search was attempted.
///
/// # Errors
///
/// See [`bisect`]; I/O errors while preparing the scratch copy.
pub fn blame_option_set(
    settings: &BlameSettings<'_>,
    option_set: &OptionSet,
    expected: &[u8],
    test_dir: &Path,
    files: &[PathBuf],
) -> Result<BlameOutcome> {
    if option_set.no_opt {
        return Ok(BlameOutcome::Blamed(BlameReport {
            phase_name: O0_BUG.to_owned(),
            raw_phase_name: O0_BUG.to_owned(),
            injection: String::new(),
            stage: None,
            evaluations: 0,
            final_output: None,
        }));
    }
    let Some(profile) = option_set.blame.as_deref() else {
        return Ok(BlameOutcome::NotApplicable {
            reason: format!("{} has no bisection control", option_set.family),
        });
    };

    let scratch = test_dir.join(BLAME_DIR);
    if scratch.exists() {
        fs::remove_dir_all(&scratch)?;
    }
    fs::create_dir_all(&scratch)?;
    for file in files {
        let dest = scratch.join(file);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(test_dir.join(file), dest)?;
    }

    info!(optset = %option_set.name, "blaming");
    let mut exec =
        CommandExecutor::new(settings, &option_set.name, &scratch, profile.spec().injection);
    let result = bisect(profile, &option_set.name, expected, &mut exec);
    let log = blame_narrative(&option_set.name, &result);
    if let Err(err) = fs::write(test_dir.join(BLAME_LOG), log) {
        warn!(error = %err, "failed to write blame log");
    }
    match &result {
        Ok(outcome) => info!(
            optset = %option_set.name,
            result = %outcome,
            phase = ?outcome.phase_name(),
            "blame finished"
        ),
        Err(err) => warn!(optset = %option_set.name, error = %err, "blame raised an error"),
    }
    result
}

fn blame_narrative(target: &str, result: &Result<BlameOutcome>) -> String {
    let mut log = format!("Blaming for {target} optset\n");
    match result {
        Ok(BlameOutcome::Blamed(report)) => {
            log.push_str(&format!("Optimization to blame: {}\n", report.raw_phase_name));
            log.push_str(&format!("Blame opts: {}\n", report.injection));
            log.push_str(&format!("Evaluations: {}\n\n", report.evaluations));
            if let Some(out) = &report.final_output {
                log.push_str("Details of blaming run:\n");
                log.push_str("=== Compiler log ==================================================\n");
                log.push_str(&out.stdout_text());
                log.push_str("=== Compiler err ==================================================\n");
                log.push_str(&out.stderr_text());
                log.push_str("=== Compiler end ==================================================\n");
            }
        }
        Ok(other) => log.push_str(&format!("Blaming {other}\n")),
        Err(err) => log.push_str(&format!("Blaming raised an error: {err}\n")),
    }
    log
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn scenario_max_seven_first_failure_four() {
        let mut seen = Vec::new();
        let search = bisect_phase(7, |k| {
            seen.push(k);
            Ok(k >= 4)
        })
        .unwrap();
        assert_eq!(search.culprit, 4);
        assert_eq!(seen, [3, 5, 4]);
    }

    #[test]
    fn passing_last_probe_reports_end() {
        let search = bisect_phase(7, |k| Ok(k >= 5)).unwrap();
        assert_eq!(search.culprit, 5);
        let search = bisect_phase(10, |k| Ok(k >= 10)).unwrap();
        assert_eq!(search.culprit, 10);
    }

    #[test]
    fn tiny_ranges() {
        assert_eq!(bisect_phase(1, |k| Ok(k >= 1)).unwrap().culprit, 1);
        assert_eq!(bisect_phase(2, |k| Ok(k >= 1)).unwrap().culprit, 1);
        assert_eq!(bisect_phase(2, |k| Ok(k >= 2)).unwrap().culprit, 2);
        assert_eq!(
            bisect_phase(0, |_| Err(CcdiffError::internal("must not be called"))).unwrap(),
            PhaseSearch {
                culprit: 0,
                evaluations: 0
            }
        );
    }

    #[test]
    fn predicate_errors_propagate() {
        let err = bisect_phase(100, |_| Err(CcdiffError::internal("boom"))).unwrap_err();
        assert!(matches!(err, CcdiffError::Internal(_)));
    }

    proptest! {
        #[test]
        fn monotone_predicate_converges_to_threshold(n in 1u64..1_000_000, frac in 0.0f64..1.0) {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
            let k = ((n as f64 * frac) as u64).clamp(1, n);
            let search = bisect_phase(n, |c| Ok(c >= k)).unwrap();
            prop_assert_eq!(search.culprit, k);
            let log2 = u64::BITS - n.leading_zeros();
            prop_assert!(search.evaluations <= log2 as usize + 3, "{} evals for n={}", search.evaluations, n);
        }
    }

    /// Executor driven by a pure function of the injection string.
    struct FakeExec<F> {
        behave: F,
        builds: VecDeque<String>,
    }

    impl<F> BlameExecutor for FakeExec<F>
    where
        F: FnMut(&str) -> (bool, Vec<u8>, String),
    {
        fn build(&mut self, injection: &str) -> Result<ProcessOutput> {
            self.builds.push_back(injection.to_owned());
            let (_, _, stderr) = (self.behave)(injection);
            Ok(ProcessOutput {
                exit_code: Some(0),
                stderr: stderr.into_bytes(),
                ..ProcessOutput::default()
            })
        }

        fn run(&mut self, injection: &str) -> Result<ProcessOutput> {
            let (ok, stdout, _) = (self.behave)(injection);
            Ok(ProcessOutput {
                exit_code: Some(if ok { 0 } else { 1 }),
                stdout,
                ..ProcessOutput::default()
            })
        }
    }

    fn limit_of(injection: &str, option: &str) -> Option<i64> {
        injection
            .split_whitespace()
            .find_map(|tok| tok.strip_prefix(option))
            .and_then(|v| v.parse().ok())
    }

    #[test]
    fn flat_opt_bisect_names_pass() {
        let profile = BlameProfile::opt_bisect().compile().unwrap();
        let passes = ["SROA", "EarlyCSE", "GVN", "Loop Unroll", "InstCombine", "DSE", "LICM"];
        let mut exec = FakeExec {
            behave: |inj: &str| {
                let limit = limit_of(inj, "-opt-bisect-limit=").unwrap_or(-1);
                let ran = if limit < 0 { 7 } else { limit.min(7) };
                let mut stderr = String::new();
                for (i, name) in passes.iter().enumerate().take(usize::try_from(ran).unwrap()) {
                    stderr.push_str(&format!("BISECT: running pass ({}) {name} (function) on f\n", i + 1));
                }
                let out = if ran >= 4 { b"43".to_vec() } else { b"42".to_vec() };
                (true, out, stderr)
            },
            builds: VecDeque::new(),
        };
        let outcome = bisect(&profile, "clang_o3", b"42", &mut exec).unwrap();
        let BlameOutcome::Blamed(report) = outcome else {
            panic!("expected blame, got {outcome:?}");
        };
        assert_eq!(report.phase_name, "Loop_Unroll");
        assert_eq!(report.raw_phase_name, "Loop Unroll");
        assert_eq!(report.injection, "-mllvm -opt-bisect-limit=4");
        assert_eq!(exec.builds.front().map(String::as_str), Some("-mllvm -opt-bisect-limit=-1"));
    }

    #[test]
    fn unreadable_first_phase_is_fatal() {
        let profile = BlameProfile::opt_bisect().compile().unwrap();
        let mut exec = FakeExec {
            behave: |_: &str| (true, b"43".to_vec(), "nothing useful".to_owned()),
            builds: VecDeque::new(),
        };
        let err = bisect(&profile, "clang_o3", b"42", &mut exec).unwrap_err();
        assert!(matches!(err, CcdiffError::PhaseCountUnreadable { stage: 0, phase: 0, .. }));
    }

    #[test]
    fn unreadable_later_phase_is_skipped() {
        let profile = BlameProfile::icc().compile().unwrap();
        // Routines report (5), optimizations report (9); the case ordinal
        // line never appears.
        let mut exec = FakeExec {
            behave: |inj: &str| {
                let rtn = limit_of(inj, "-to_rtn=").unwrap_or(-1);
                let opt = limit_of(inj, "-num_opt=");
                let bad = match opt {
                    None | Some(-1) => rtn < 0 || rtn >= 3,
                    Some(o) => rtn >= 3 && o >= 6,
                };
                let mut stderr = String::from("routine count (5)\n");
                if rtn >= 0 {
                    stderr.push_str("DOING [x] Scalar Replacement (6) (last opt)\nopt count (9)\n");
                }
                (true, if bad { b"1".to_vec() } else { b"0".to_vec() }, stderr)
            },
            builds: VecDeque::new(),
        };
        let outcome = bisect(&profile, "icc_o2", b"0", &mut exec).unwrap();
        let BlameOutcome::Blamed(report) = outcome else {
            panic!("expected blame, got {outcome:?}");
        };
        assert_eq!(report.injection, "-from_rtn=0 -to_rtn=3 -num_opt=6");
        assert_eq!(report.phase_name, "Scalar_Replacement");
    }

    fn staged_profile() -> CompiledProfile {
        let phase = |option: &str, tag: &str| PhaseSpec {
            option: option.to_owned(),
            count_pattern: Some(format!(r"{tag} \(\d+\)")),
            fixed_max: None,
        };
        BlameProfile {
            mode: BlameMode::Staged,
            injection: Injection::Flag,
            stages: vec![
                StageSpec {
                    name: "early".to_owned(),
                    phases: vec![phase("-early=", "EARLY")],
                },
                StageSpec {
                    name: "late".to_owned(),
                    phases: vec![phase("-late-a=", "LATEA"), phase("-late-b=", "LATEB")],
                },
            ],
            name_prefix: "RUNNING ".to_owned(),
            name_suffix: " NOW".to_owned(),
            probe_value: -1,
            result_offset: 0,
            first_name_match: false,
            unblamable_limit: None,
            diagnostics_from_run: false,
        }
        .compile()
        .unwrap()
    }

    #[test]
    fn staged_mode_searches_first_stage_that_hides_failure() {
        let profile = staged_profile();
        // Failure lives in the "late" stage: phase a >= 2.
        let mut exec = FakeExec {
            behave: |inj: &str| {
                let a = limit_of(inj, "-late-a=");
                let bad = match a {
                    Some(a) if a >= 0 => a >= 2,
                    _ => true,
                };
                let mut stderr = String::from("EARLY (4)\nLATEA (8)\nLATEB (3)\n");
                if let Some(a) = a {
                    stderr.push_str(&format!("RUNNING late-a-{a} NOW\n"));
                }
                (true, if bad { b"bad".to_vec() } else { b"ok".to_vec() }, stderr)
            },
            builds: VecDeque::new(),
        };
        let outcome = bisect(&profile, "x", b"ok", &mut exec).unwrap();
        let BlameOutcome::Blamed(report) = outcome else {
            panic!("expected blame, got {outcome:?}");
        };
        assert_eq!(report.stage.as_deref(), Some("late"));
        assert!(report.injection.starts_with("-late-a=2"), "{}", report.injection);
        assert!(!report.injection.contains("-early="), "{}", report.injection);
        // The first build disables the whole late stage.
        assert_eq!(exec.builds.front().map(String::as_str), Some("-late-a=0 -late-b=0"));
    }

    #[test]
    fn staged_mode_degrades_when_nothing_hides_failure() {
        let profile = staged_profile();
        let mut exec = FakeExec {
            behave: |_: &str| (true, b"bad".to_vec(), String::new()),
            builds: VecDeque::new(),
        };
        let outcome = bisect(&profile, "x", b"ok", &mut exec).unwrap();
        assert!(matches!(outcome, BlameOutcome::Degraded { .. }));
    }

    #[test]
    fn env_profile_reports_failed_to_blame() {
        let profile = BlameProfile::igc().compile().unwrap();
        let mut exec = FakeExec {
            behave: |_: &str| (true, b"bad".to_vec(), String::new()),
            builds: VecDeque::new(),
        };
        let outcome = bisect(&profile, "dpcpp_gpu", b"ok", &mut exec).unwrap();
        let BlameOutcome::Blamed(report) = outcome else {
            panic!("expected blame, got {outcome:?}");
        };
        assert_eq!(report.phase_name, FAILED_TO_BLAME);
        assert!(report.injection.ends_with("IGC_ShaderDisableOptPassesAfter=0"));
    }

    #[test]
    fn state_renders_only_set_phases() {
        let profile = BlameProfile::icc().compile().unwrap();
        let mut state = BlameState::new(&profile);
        assert_eq!(state.injection(&profile), "");
        state.set(0, 0, PhaseValue::Limit(12));
        state.set(2, 0, PhaseValue::Limit(-1));
        assert_eq!(state.injection(&profile), "-from_rtn=0 -to_rtn=12 -num-case=-1");
        state.clear_stage(2);
        state.disable_stage(1);
        assert_eq!(state.injection(&profile), "-from_rtn=0 -to_rtn=12 -num_opt=0");
    }

    #[test]
    fn outcome_display() {
        assert_eq!(
            BlameOutcome::NotApplicable {
                reason: "gcc has no bisection control".to_owned()
            }
            .to_string(),
            "is not applicable: gcc has no bisection control"
        );
    }
}
