//! Hand-off to an external test-case minimizer (creduce).
//!
//! For a failing Test the reducer picks a good and a bad option-set, writes
//! a `test.sh` oracle that succeeds exactly while the failure reproduces,
//! and runs the minimizer on the source file inside a scratch copy of the
//! Test. Whatever the minimizer produces is copied back next to the Test
//! files so it ends up in the FailureRecord.

use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use ccdiff_error::{CcdiffError, Result};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{CommandTemplate, ReductionConfig, TemplateVars};
use crate::model::TestRun;
use crate::persist::copy_entry;
use crate::process::{self, CommandSpec, RunLimits};

static VERSION_RE: LazyLock<Result<Regex>> = LazyLock::new(|| {
    Regex::new(r"^creduce (\d+)\.(\d+)\.(\d+)").map_err(|err| CcdiffError::InvalidPattern {
        pattern: "creduce version".to_owned(),
        detail: err.to_string(),
    })
});

const ORACLE: &str = "test.sh";
const TEST_PWD: &str = "\"${TEST_PWD}\"";
const BUG_DIR_PREFIX: &str = "creduce_bug";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionKind {
    Miscompare,
    BuildFail,
    RunFail,
}

impl ReductionKind {
    pub const fn scratch_dir(self) -> &'static str {
        match self {
            Self::Miscompare => "reduce",
            Self::BuildFail => "reduce_compfail",
            Self::RunFail => "reduce_runfail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReductionReport {
    pub kind: ReductionKind,
    pub good: String,
    pub bad: String,
    pub return_code: i32,
    pub elapsed: Duration,
    pub timed_out: bool,
    /// Files written next to the Test, relative to the Test directory.
    pub artifacts: Vec<PathBuf>,
    /// `creduce_bug*` directories the minimizer left behind.
    pub minimizer_bugs: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReductionOutcome {
    Completed(ReductionReport),
    Skipped { reason: String },
    Degraded { reason: String },
}

impl ReductionOutcome {
    /// Files to add to the FailureRecord.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        match self {
            Self::Completed(report) => report
                .artifacts
                .iter()
                .chain(&report.minimizer_bugs)
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for ReductionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(report) if report.timed_out => {
                write!(f, "completed, time limit exceeded ({})", report.bad)
            }
            Self::Completed(report) => {
                write!(f, "completed with return code {} ({})", report.return_code, report.bad)
            }
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
            Self::Degraded { reason } => write!(f, "has failed: {reason}"),
        }
    }
}

/// Reduction settings resolved against the harness configuration.
#[derive(Debug, Clone, Copy)]
pub struct Reducer<'a> {
    pub config: &'a ReductionConfig,
    pub build: &'a CommandTemplate,
    pub run: &'a CommandTemplate,
    pub build_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub seed: &'a str,
}

impl Reducer<'_> {
    /// Reduce one failure.
    ///
    /// `good_pool` are candidate baselines and `bad_pool` candidate failing
    /// runs; the fastest of each is used. Files in `files` and the
    /// reduction build description are copied into a scratch directory
    /// under `test_dir`.
    ///
    /// # Errors
    ///
    /// I/O errors preparing the scratch directory and failure to start the
    /// minimizer.
    pub fn reduce(
        &self,
        kind: ReductionKind,
        good_pool: &[&TestRun],
        bad_pool: &[&TestRun],
        test_dir: &Path,
        files: &[PathBuf],
    ) -> Result<ReductionOutcome> {
        let Some(good) = self.pick_baseline(good_pool) else {
            let reason = if self.config.require_sanitizer_baseline {
                "no successful sanitizer run to use as baseline"
            } else {
                "no successful run to use as baseline"
            };
            warn!(seed = self.seed, "reduction skipped: {reason}");
            return Ok(ReductionOutcome::Skipped {
                reason: reason.to_owned(),
            });
        };
        let Some(bad) = fastest(bad_pool.iter().copied()) else {
            return Ok(ReductionOutcome::Skipped {
                reason: "no failing run".to_owned(),
            });
        };
        if !test_dir.join(&self.config.source_file).is_file() {
            return Ok(ReductionOutcome::Degraded {
                reason: format!("source file {} is missing", self.config.source_file),
            });
        }
        debug!(seed = self.seed, good = good.name(), bad = bad.name(), ?kind, "running minimizer");

        let scratch = test_dir.join(kind.scratch_dir());
        if scratch.exists() {
            fs::remove_dir_all(&scratch)?;
        }
        fs::create_dir_all(&scratch)?;
        for file in files {
            copy_entry(&test_dir.join(file), &scratch.join(file))?;
        }
        let mut artifacts = Vec::new();
        if let Some(desc) = &self.config.build_description {
            if let Some(name) = desc.file_name() {
                fs::copy(desc, scratch.join(name))?;
                fs::copy(desc, test_dir.join(name))?;
                artifacts.push(PathBuf::from(name));
            }
        }

        let script = self.oracle(kind, good, bad, &scratch);
        let script_path = scratch.join(ORACLE);
        fs::write(&script_path, script)?;
        let mut perms = fs::metadata(&script_path)?.permissions();
        perms.set_mode(perms.mode() | 0o111);
        fs::set_permissions(&script_path, perms)?;
        fs::copy(&script_path, test_dir.join(ORACLE))?;
        artifacts.push(PathBuf::from(ORACLE));

        let check_timeout = (self.build_timeout_secs + self.run_timeout_secs) * 2;
        let spec = CommandSpec::new(&self.config.minimizer)
            .arg("--n")
            .arg(self.config.jobs.to_string())
            .arg("--timing")
            .arg("--timeout")
            .arg(check_timeout.to_string())
            .arg(script_path.to_string_lossy())
            .arg(&self.config.source_file)
            .current_dir(&scratch);
        let output = process::run(
            &spec,
            RunLimits::timeout(Duration::from_secs(self.config.timeout_secs)),
        )?;

        let bad_name = bad.name();
        let out_name = format!("creduce_{bad_name}.out");
        let err_name = format!("creduce_{bad_name}.err");
        let log_name = format!("creduce_{bad_name}.log");
        fs::write(test_dir.join(&out_name), &output.stdout)?;
        fs::write(test_dir.join(&err_name), &output.stderr)?;
        let limit = if output.timed_out {
            "Time limit was exceeded!"
        } else {
            "Time limit was not exceeded"
        };
        fs::write(
            test_dir.join(&log_name),
            format!(
                "Return code: {}\nExecution time: {:.3}\n{limit}\n",
                output.display_code(),
                output.wall_time.as_secs_f64()
            ),
        )?;
        artifacts.extend([out_name, err_name, log_name].map(PathBuf::from));

        let reduced_name = reduced_file_name(&self.config.source_file, bad_name);
        fs::copy(scratch.join(&self.config.source_file), test_dir.join(&reduced_name))?;
        artifacts.push(PathBuf::from(reduced_name));

        let minimizer_bugs = collect_minimizer_bugs(&scratch, test_dir)?;
        if !minimizer_bugs.is_empty() {
            warn!(
                seed = self.seed,
                dirs = ?minimizer_bugs,
                "minimizer reported an internal error, consider reporting it upstream"
            );
        }
        info!(
            seed = self.seed,
            bad = bad_name,
            code = output.display_code(),
            timed_out = output.timed_out,
            "reduction finished"
        );
        Ok(ReductionOutcome::Completed(ReductionReport {
            kind,
            good: good.name().to_owned(),
            bad: bad_name.to_owned(),
            return_code: output.display_code(),
            elapsed: output.wall_time,
            timed_out: output.timed_out,
            artifacts,
            minimizer_bugs,
        }))
    }

    fn pick_baseline<'r>(&self, pool: &[&'r TestRun]) -> Option<&'r TestRun> {
        let sanitizer = fastest(pool.iter().copied().filter(|r| r.option_set.sanitizer));
        if sanitizer.is_some() || self.config.require_sanitizer_baseline {
            return sanitizer;
        }
        fastest(pool.iter().copied())
    }

    fn build_template(&self) -> &CommandTemplate {
        self.config.build.as_ref().unwrap_or(self.build)
    }

    fn run_template(&self) -> &CommandTemplate {
        self.config.run.as_ref().unwrap_or(self.run)
    }

    fn shell(&self, template: &CommandTemplate, target: &str) -> String {
        shell_command(template, target, self.seed)
    }

    /// Contents of `test.sh` for `kind`.
    pub fn oracle(&self, kind: ReductionKind, good: &TestRun, bad: &TestRun, dir: &Path) -> String {
        let ulimit = match kind {
            ReductionKind::Miscompare => self.build_timeout_secs.max(self.run_timeout_secs),
            ReductionKind::BuildFail | ReductionKind::RunFail => self.build_timeout_secs,
        };
        let (build, run) = (self.build_template(), self.run_template());
        let mut script = format!(
            "#!/bin/bash\n\nulimit -t {ulimit}\n\nexport TEST_PWD={}\n\n",
            shell_quote(&dir.to_string_lossy())
        );
        let good_build = self.shell(build, good.name());
        let good_run = self.shell(run, good.name());
        let bad_build = self.shell(build, bad.name());
        let bad_run = self.shell(run, bad.name());
        match kind {
            ReductionKind::Miscompare => {
                script.push_str(&format!("{good_build} && \\\n"));
                script.push_str(&format!("{good_run} > good_out && \\\n"));
                script.push_str(&format!("{bad_build} && \\\n"));
                script.push_str(&format!("{bad_run} > bad_out && \\\n"));
                script.push_str("! diff good_out bad_out\n");
            }
            ReductionKind::BuildFail => {
                script.push_str(&format!("! {bad_build} && \\\n"));
                script.push_str(&format!("{good_build} && \\\n"));
                script.push_str(&format!("{good_run}\n"));
            }
            ReductionKind::RunFail => {
                let code = bad.run().map_or(1, |r| r.output.display_code());
                script.push_str(&format!("{bad_build} && \\\n"));
                script.push_str(&format!("{bad_run} 2>err.log\n"));
                script.push_str("RETCODE=$?\n");
                script.push_str(&format!("[ $RETCODE -eq {code} ] && \\\n"));
                for pattern in &self.config.exclude_patterns {
                    script.push_str(&format!("! grep {} err.log && \\\n", shell_quote(pattern)));
                }
                script.push_str(&format!("{good_build} && \\\n"));
                script.push_str(&format!("{good_run}\n"));
            }
        }
        script
    }
}

fn fastest<'r>(runs: impl Iterator<Item = &'r TestRun>) -> Option<&'r TestRun> {
    runs.min_by_key(|r| r.elapsed())
}

fn reduced_file_name(source_file: &str, optset: &str) -> String {
    let path = Path::new(source_file);
    match path.extension() {
        Some(ext) => format!("func_reduced_{optset}.{}", ext.to_string_lossy()),
        None => format!("func_reduced_{optset}"),
    }
}

fn collect_minimizer_bugs(scratch: &Path, test_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(scratch)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(BUG_DIR_PREFIX) && entry.file_type()?.is_dir() {
            copy_entry(&entry.path(), &test_dir.join(&name))?;
            found.push(PathBuf::from(name));
        }
    }
    found.sort();
    Ok(found)
}

/// Render a template as one shell command line. `{dir}` becomes the
/// oracle's `$TEST_PWD`.
fn shell_command(template: &CommandTemplate, target: &str, seed: &str) -> String {
    let vars = TemplateVars {
        target,
        dir: "",
        seed,
        blame: "",
    };
    let mut words = Vec::with_capacity(template.0.len());
    for arg in &template.0 {
        if arg == "{blame}" {
            continue;
        }
        let pieces: Vec<String> = arg
            .split("{dir}")
            .map(|piece| {
                let expanded = CommandTemplate::new([piece]).expand_args(&vars).concat();
                if expanded.is_empty() {
                    expanded
                } else {
                    shell_quote(&expanded)
                }
            })
            .collect();
        words.push(pieces.join(TEST_PWD));
    }
    words.join(" ")
}

fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Parse `creduce X.Y.Z` from the start of the minimizer's help text.
pub fn parse_minimizer_version(text: &str) -> Option<(u32, u32, u32)> {
    let re = VERSION_RE.as_ref().ok()?;
    let caps = re.captures(text.trim_start())?;
    Some((
        caps.get(1)?.as_str().parse().ok()?,
        caps.get(2)?.as_str().parse().ok()?,
        caps.get(3)?.as_str().parse().ok()?,
    ))
}

/// Check the minimizer once at startup.
///
/// # Errors
///
/// [`CcdiffError::ToolUnavailable`] when the minimizer cannot be run or its
/// version cannot be read.
pub fn check_minimizer(config: &ReductionConfig) -> Result<(u32, u32, u32)> {
    let spec = CommandSpec::new(&config.minimizer).arg("--help");
    let output = process::run(&spec, RunLimits::timeout(Duration::from_secs(60))).map_err(|err| {
        CcdiffError::ToolUnavailable {
            tool: config.minimizer.clone(),
            detail: err.to_string(),
        }
    })?;
    let version = parse_minimizer_version(&output.stdout_text()).ok_or_else(|| {
        CcdiffError::ToolUnavailable {
            tool: config.minimizer.clone(),
            detail: "can't read the minimizer version".to_owned(),
        }
    })?;
    let (major, minor, patch) = version;
    if (major, minor) < config.min_version {
        warn!(
            "{} {}.{}.0 or later is recommended, found {major}.{minor}.{patch}",
            config.minimizer, config.min_version.0, config.min_version.1
        );
    }
    Ok(version)
}
