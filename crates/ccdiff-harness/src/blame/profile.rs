//! Declarative description of a toolchain's optimization-control space.

use ccdiff_error::{CcdiffError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// How stages are searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlameMode {
    /// Stages in declared order, each ceiling fixed before the next.
    #[default]
    Flat,
    /// Stages in reverse order; the first one whose complete disabling makes
    /// the test pass is searched phase by phase.
    Staged,
}

/// Where the control string goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Injection {
    /// Extra compiler flags, substituted for `{blame}`.
    #[default]
    Flag,
    /// `KEY=VALUE` pairs added to the build and run environment.
    Env,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    /// Control prefix; the numeric limit is appended directly.
    pub option: String,
    /// Extracts the tool-reported maximum from stderr of the probe build.
    #[serde(default)]
    pub count_pattern: Option<String>,
    /// Known maximum; skips the probe.
    #[serde(default)]
    pub fixed_max: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    #[serde(default)]
    pub name: String,
    pub phases: Vec<PhaseSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlameProfile {
    #[serde(default)]
    pub mode: BlameMode,
    #[serde(default)]
    pub injection: Injection,
    pub stages: Vec<StageSpec>,
    pub name_prefix: String,
    pub name_suffix: String,
    /// Limit value that turns the control on without restricting anything.
    #[serde(default = "default_probe_value")]
    pub probe_value: i64,
    /// Added to the converged limit before it is injected.
    #[serde(default)]
    pub result_offset: i64,
    /// Take the first phase-name match instead of the last.
    #[serde(default)]
    pub first_name_match: bool,
    /// Converged limit that means "no single phase could be blamed".
    #[serde(default)]
    pub unblamable_limit: Option<u64>,
    /// Diagnostics are printed by the run step, not the build step.
    #[serde(default)]
    pub diagnostics_from_run: bool,
}

const fn default_probe_value() -> i64 {
    -1
}

pub const FAILED_TO_BLAME: &str = "FailedToBlame";

impl BlameProfile {
    /// Single-phase profile for LLVM's `-opt-bisect-limit`.
    pub fn opt_bisect() -> Self {
        Self {
            mode: BlameMode::Flat,
            injection: Injection::Flag,
            stages: vec![StageSpec {
                name: "pass".to_owned(),
                phases: vec![PhaseSpec {
                    option: "-mllvm -opt-bisect-limit=".to_owned(),
                    count_pattern: Some(r"BISECT: running pass \(\d+\)".to_owned()),
                    fixed_max: None,
                }],
            }],
            name_prefix: r"BISECT: running pass \(\d+\) ".to_owned(),
            name_suffix: r" \(.*\)".to_owned(),
            probe_value: -1,
            result_offset: 0,
            first_name_match: false,
            unblamable_limit: None,
            diagnostics_from_run: false,
        }
    }

    /// Routine, optimization and case ordinals of the classic Intel compiler.
    pub fn icc() -> Self {
        let phase = |option: &str, pattern: &str| PhaseSpec {
            option: option.to_owned(),
            count_pattern: Some(pattern.to_owned()),
            fixed_max: None,
        };
        Self {
            mode: BlameMode::Flat,
            injection: Injection::Flag,
            stages: vec![
                StageSpec {
                    name: "routine".to_owned(),
                    phases: vec![phase("-from_rtn=0 -to_rtn=", r"\(\d+\)")],
                },
                StageSpec {
                    name: "optimization".to_owned(),
                    phases: vec![phase("-num_opt=", r"\(\d+\)\s*\n")],
                },
                StageSpec {
                    name: "case".to_owned(),
                    phases: vec![phase("-num-case=", r"DO ANOTHER.*\(\d+\)")],
                },
            ],
            name_prefix: r"DOING\s*\[\w*\]\s*".to_owned(),
            name_suffix: r"\s*\(\d*\)\s*\(last opt\)".to_owned(),
            probe_value: -1,
            result_offset: 0,
            first_name_match: false,
            unblamable_limit: None,
            diagnostics_from_run: false,
        }
    }

    /// GPU shader pass limit passed through the environment.
    pub fn igc() -> Self {
        Self {
            mode: BlameMode::Flat,
            injection: Injection::Env,
            stages: vec![StageSpec {
                name: "shader_pass".to_owned(),
                phases: vec![PhaseSpec {
                    option: "IGC_ShaderDumpEnableAll=1 IGC_ShaderDisableOptPassesAfter=".to_owned(),
                    count_pattern: None,
                    fixed_max: Some(250),
                }],
            }],
            name_prefix: "Skipping optimization pass: '".to_owned(),
            name_suffix: r"' \(.*\).".to_owned(),
            probe_value: 1,
            result_offset: -1,
            first_name_match: true,
            unblamable_limit: Some(1),
            diagnostics_from_run: true,
        }
    }

    /// Compile every pattern once.
    ///
    /// # Errors
    ///
    /// [`CcdiffError::InvalidPattern`] for a bad regex and
    /// [`CcdiffError::InvalidConfig`] for a phase with neither a count
    /// pattern nor a fixed maximum.
    pub fn compile(self) -> Result<CompiledProfile> {
        if self.stages.is_empty() || self.stages.iter().any(|s| s.phases.is_empty()) {
            return Err(CcdiffError::config(
                "blame profile needs at least one stage and every stage at least one phase",
            ));
        }
        let mut count_patterns = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let mut compiled = Vec::with_capacity(stage.phases.len());
            for phase in &stage.phases {
                match (&phase.count_pattern, phase.fixed_max) {
                    (Some(pattern), _) => compiled.push(Some(compile_pattern(pattern)?)),
                    (None, Some(_)) => compiled.push(None),
                    (None, None) => {
                        return Err(CcdiffError::config(format!(
                            "blame phase '{}' has neither count_pattern nor fixed_max",
                            phase.option
                        )));
                    }
                }
            }
            count_patterns.push(compiled);
        }
        let name_pattern = compile_pattern(&format!("{}.*{}", self.name_prefix, self.name_suffix))?;
        let prefix = compile_pattern(&self.name_prefix)?;
        let suffix = compile_pattern(&self.name_suffix)?;
        Ok(CompiledProfile {
            spec: self,
            count_patterns,
            name_pattern,
            prefix,
            suffix,
        })
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|err| CcdiffError::InvalidPattern {
        pattern: pattern.to_owned(),
        detail: err.to_string(),
    })
}

/// A [`BlameProfile`] with its patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledProfile {
    spec: BlameProfile,
    count_patterns: Vec<Vec<Option<Regex>>>,
    name_pattern: Regex,
    prefix: Regex,
    suffix: Regex,
}

impl CompiledProfile {
    pub fn spec(&self) -> &BlameProfile {
        &self.spec
    }

    pub fn stage_count(&self) -> usize {
        self.spec.stages.len()
    }

    pub fn phase_count(&self, stage: usize) -> usize {
        self.spec.stages.get(stage).map_or(0, |s| s.phases.len())
    }

    pub fn phase(&self, stage: usize, phase: usize) -> Option<&PhaseSpec> {
        self.spec.stages.get(stage)?.phases.get(phase)
    }

    pub fn count_pattern(&self, stage: usize, phase: usize) -> Option<&Regex> {
        self.count_patterns.get(stage)?.get(phase)?.as_ref()
    }

    /// Last integer of the last count-pattern match in `diagnostics`.
    pub fn parse_phase_count(&self, stage: usize, phase: usize, diagnostics: &str) -> Option<u64> {
        let pattern = self.count_pattern(stage, phase)?;
        let last = pattern.find_iter(diagnostics).last()?;
        last_integer(last.as_str())
    }

    /// Phase name at the converged setting, prefix and suffix stripped and
    /// spaces replaced by underscores. Returns `(normalized, raw)`.
    pub fn extract_phase_name(&self, diagnostics: &str) -> Option<(String, String)> {
        let mut matches = self.name_pattern.find_iter(diagnostics);
        let found = if self.spec.first_name_match {
            matches.next()
        } else {
            matches.last()
        }?;
        let without_prefix = self.prefix.replace_all(found.as_str(), "");
        let raw = self.suffix.replace_all(&without_prefix, "").into_owned();
        let normalized = raw.replace(' ', "_");
        Some((normalized, raw))
    }
}

fn last_integer(text: &str) -> Option<u64> {
    let bytes = text.as_bytes();
    let end = bytes.iter().rposition(u8::is_ascii_digit)? + 1;
    let start = bytes[..end]
        .iter()
        .rposition(|b| !b.is_ascii_digit())
        .map_or(0, |p| p + 1);
    text[start..end].parse().ok()
}
