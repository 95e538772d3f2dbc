//! Test and TestRun state machines.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ccdiff_error::{CcdiffError, Result};
use ccdiff_observability::RunTag;
use serde::Serialize;

use crate::process::ProcessOutput;
use crate::registry::OptionSet;
use crate::seeds::Seed;

// ── Generation ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    NotGenerated,
    Ok,
    Fail,
    Timeout,
}

/// A command and what it produced.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub command: String,
    pub output: ProcessOutput,
}

// ── TestRun ─────────────────────────────────────────────────────────────

/// State of one (Test, option-set) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotBuilt,
    /// Built successfully, not yet run.
    NotRun,
    BuildFail,
    BuildTimeout,
    RunFail,
    RunTimeout,
    RunOk,
}

impl RunStatus {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::NotBuilt | Self::NotRun)
    }

    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            Self::BuildFail | Self::BuildTimeout | Self::RunFail | Self::RunTimeout
        )
    }

    /// Statistics tag for a terminal state.
    pub const fn tag(self) -> Option<RunTag> {
        match self {
            Self::BuildFail => Some(RunTag::Compfail),
            Self::BuildTimeout => Some(RunTag::CompfailTimeout),
            Self::RunFail => Some(RunTag::Runfail),
            Self::RunTimeout => Some(RunTag::RunfailTimeout),
            Self::RunOk => Some(RunTag::Ok),
            Self::NotBuilt | Self::NotRun => None,
        }
    }

    /// Failure-type directory name under `result/<compiler>/`.
    pub const fn fail_type(self) -> Option<&'static str> {
        match self {
            Self::BuildFail => Some("compfail"),
            Self::BuildTimeout => Some("compfail_timeout"),
            Self::RunFail => Some("runfail"),
            Self::RunTimeout => Some("runfail_timeout"),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotBuilt => "not_built",
            Self::NotRun => "not_run",
            Self::BuildFail => "compfail",
            Self::BuildTimeout => "compfail_timeout",
            Self::RunFail => "runfail",
            Self::RunTimeout => "runfail_timeout",
            Self::RunOk => "ok",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of building and running one Test under one option-set.
#[derive(Debug, Clone)]
pub struct TestRun {
    pub option_set: Arc<OptionSet>,
    status: RunStatus,
    build: Option<StepRecord>,
    run: Option<StepRecord>,
    fingerprint: Option<Vec<u8>>,
    /// Executable produced by the build, relative to the Test directory.
    pub artifact: Option<PathBuf>,
}

impl TestRun {
    pub fn new(option_set: Arc<OptionSet>) -> Self {
        Self {
            option_set,
            status: RunStatus::NotBuilt,
            build: None,
            run: None,
            fingerprint: None,
            artifact: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.option_set.name
    }

    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Present exactly when the status is [`RunStatus::RunOk`].
    pub fn fingerprint(&self) -> Option<&[u8]> {
        self.fingerprint.as_deref()
    }

    pub fn build(&self) -> Option<&StepRecord> {
        self.build.as_ref()
    }

    pub fn run(&self) -> Option<&StepRecord> {
        self.run.as_ref()
    }

    /// Build plus run wall time.
    pub fn elapsed(&self) -> Duration {
        [&self.build, &self.run]
            .into_iter()
            .flatten()
            .map(|s| s.output.wall_time)
            .sum()
    }

    /// Build plus run CPU time.
    pub fn cpu_time(&self) -> Duration {
        [&self.build, &self.run]
            .into_iter()
            .flatten()
            .map(|s| s.output.cpu_time)
            .sum()
    }

    /// Diagnostic text of the phase that failed.
    pub fn failure_diagnostics(&self) -> Option<String> {
        match self.status {
            RunStatus::BuildFail | RunStatus::BuildTimeout => {
                self.build.as_ref().map(|b| b.output.stderr_text())
            }
            RunStatus::RunFail | RunStatus::RunTimeout => {
                self.run.as_ref().map(|r| r.output.stderr_text())
            }
            _ => None,
        }
    }

    fn illegal(&self, to: &str) -> CcdiffError {
        CcdiffError::IllegalTransition {
            target: self.option_set.name.clone(),
            from: self.status.as_str().to_owned(),
            to: to.to_owned(),
        }
    }

    /// `NotBuilt -> {NotRun, BuildFail, BuildTimeout}`.
    ///
    /// # Errors
    ///
    /// [`CcdiffError::IllegalTransition`] unless the run is `NotBuilt`.
    pub fn record_build(&mut self, command: String, output: ProcessOutput) -> Result<RunStatus> {
        if self.status != RunStatus::NotBuilt {
            return Err(self.illegal("built"));
        }
        self.status = if output.timed_out {
            RunStatus::BuildTimeout
        } else if output.success() {
            RunStatus::NotRun
        } else {
            RunStatus::BuildFail
        };
        self.build = Some(StepRecord { command, output });
        Ok(self.status)
    }

    /// `NotRun -> {RunOk, RunFail, RunTimeout}`. The fingerprint is the
    /// complete stdout of a successful run.
    ///
    /// # Errors
    ///
    /// [`CcdiffError::IllegalTransition`] unless the run is `NotRun`.
    pub fn record_run(&mut self, command: String, output: ProcessOutput) -> Result<RunStatus> {
        if self.status != RunStatus::NotRun {
            return Err(self.illegal("ran"));
        }
        self.status = if output.timed_out {
            RunStatus::RunTimeout
        } else if output.success() {
            self.fingerprint = Some(output.stdout.clone());
            RunStatus::RunOk
        } else {
            RunStatus::RunFail
        };
        self.run = Some(StepRecord { command, output });
        Ok(self.status)
    }
}

// ── Test ────────────────────────────────────────────────────────────────

/// Aggregate outcome of a Test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Ok,
    GenFail,
    GenFailTimeout,
    /// Successful runs agree but some runs failed.
    RunsFailed,
    Miscompare,
    MultipleMiscompare,
    NoGoodRuns,
}

impl TestStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::GenFail => "gen_fail",
            Self::GenFailTimeout => "gen_fail_timeout",
            Self::RunsFailed => "runs_failed",
            Self::Miscompare => "miscompare",
            Self::MultipleMiscompare => "multiple_miscompare",
            Self::NoGoodRuns => "no_good_runs",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One generated program and its runs.
#[derive(Debug, Clone)]
pub struct Test {
    pub seed: Seed,
    /// Worker directory the program lives in.
    pub dir: PathBuf,
    pub worker: usize,
    generation: GenerationStatus,
    generator: Option<StepRecord>,
    /// Source and build files, relative to `dir`.
    pub files: Vec<PathBuf>,
    pub runs: Vec<TestRun>,
}

impl Test {
    pub fn new(seed: Seed, dir: PathBuf, worker: usize) -> Self {
        Self {
            seed,
            dir,
            worker,
            generation: GenerationStatus::NotGenerated,
            generator: None,
            files: Vec::new(),
            runs: Vec::new(),
        }
    }

    pub const fn generation(&self) -> GenerationStatus {
        self.generation
    }

    pub fn generator(&self) -> Option<&StepRecord> {
        self.generator.as_ref()
    }

    /// `NotGenerated -> {Ok, Fail, Timeout}`.
    ///
    /// # Errors
    ///
    /// [`CcdiffError::IllegalTransition`] if generation was already recorded.
    pub fn record_generation(
        &mut self,
        command: String,
        output: ProcessOutput,
    ) -> Result<GenerationStatus> {
        if self.generation != GenerationStatus::NotGenerated {
            return Err(CcdiffError::IllegalTransition {
                target: "generator".to_owned(),
                from: format!("{:?}", self.generation),
                to: "generated".to_owned(),
            });
        }
        self.generation = if output.timed_out {
            GenerationStatus::Timeout
        } else if output.success() {
            GenerationStatus::Ok
        } else {
            GenerationStatus::Fail
        };
        self.generator = Some(StepRecord { command, output });
        Ok(self.generation)
    }

    /// Create one pending run per option-set. Only valid after a successful
    /// generation.
    ///
    /// # Errors
    ///
    /// [`CcdiffError::IllegalTransition`] if generation did not succeed.
    pub fn add_runs<'a>(&mut self, option_sets: impl IntoIterator<Item = &'a Arc<OptionSet>>) -> Result<()> {
        if self.generation != GenerationStatus::Ok {
            return Err(CcdiffError::IllegalTransition {
                target: "test".to_owned(),
                from: format!("{:?}", self.generation),
                to: "runs".to_owned(),
            });
        }
        self.runs
            .extend(option_sets.into_iter().map(|o| TestRun::new(Arc::clone(o))));
        Ok(())
    }

    pub fn successful_runs(&self) -> impl Iterator<Item = &TestRun> {
        self.runs.iter().filter(|r| r.status == RunStatus::RunOk)
    }

    pub fn failed_runs(&self) -> impl Iterator<Item = &TestRun> {
        self.runs.iter().filter(|r| r.status.is_failure())
    }

    /// Aggregate status once every run is terminal.
    ///
    /// # Errors
    ///
    /// [`CcdiffError::RunsPending`] if any run is not terminal, and
    /// [`CcdiffError::Internal`] before generation.
    pub fn aggregate(&self) -> Result<TestStatus> {
        match self.generation {
            GenerationStatus::NotGenerated => {
                return Err(CcdiffError::internal(format!(
                    "test {} aggregated before generation",
                    self.seed
                )));
            }
            GenerationStatus::Fail => return Ok(TestStatus::GenFail),
            GenerationStatus::Timeout => return Ok(TestStatus::GenFailTimeout),
            GenerationStatus::Ok => {}
        }
        let pending = self.runs.iter().filter(|r| !r.status.is_terminal()).count();
        if pending > 0 {
            return Err(CcdiffError::RunsPending {
                seed: self.seed.to_string(),
                pending,
            });
        }
        let mut distinct: Vec<&[u8]> = Vec::new();
        for fp in self.successful_runs().filter_map(TestRun::fingerprint) {
            if !distinct.contains(&fp) {
                distinct.push(fp);
            }
        }
        let any_failed = self.failed_runs().next().is_some();
        Ok(match distinct.len() {
            0 if any_failed => TestStatus::NoGoodRuns,
            0 | 1 if any_failed => TestStatus::RunsFailed,
            0 | 1 => TestStatus::Ok,
            2 => TestStatus::Miscompare,
            _ => TestStatus::MultipleMiscompare,
        })
    }
}
