//! Compilers and option-sets under test.
//!
//! The registry is resolved once at startup from the campaign config and is
//! read-only afterwards; workers share it by reference without locking.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use ccdiff_error::{CcdiffError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::blame::{BlameProfile, CompiledProfile};
use crate::process::{self, CommandSpec, RunLimits};

/// Supported toolchain families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolchainFamily {
    Gcc,
    Clang,
    Icc,
    Icx,
    Dpcpp,
    Other,
}

impl ToolchainFamily {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gcc => "gcc",
            Self::Clang => "clang",
            Self::Icc => "icc",
            Self::Icx => "icx",
            Self::Dpcpp => "dpcpp",
            Self::Other => "other",
        }
    }

    /// Built-in blame profile, if the toolchain exposes a bisection control.
    pub fn builtin_blame_profile(self) -> Option<BlameProfile> {
        match self {
            Self::Clang | Self::Icx => Some(BlameProfile::opt_bisect()),
            Self::Icc => Some(BlameProfile::icc()),
            Self::Dpcpp => Some(BlameProfile::igc()),
            Self::Gcc | Self::Other => None,
        }
    }
}

impl fmt::Display for ToolchainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One compiler as declared in the campaign config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerSpec {
    pub name: String,
    pub family: ToolchainFamily,
    /// Probed with `--version` at startup when set.
    #[serde(default)]
    pub executable: Option<String>,
    /// Replaces the family's built-in profile.
    #[serde(default)]
    pub blame_profile: Option<BlameProfile>,
}

/// One option-set as declared in the campaign config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionSetSpec {
    pub name: String,
    pub compiler: String,
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub arch: Option<String>,
    /// Defaults to "name or compiler starts with `ubsan`".
    #[serde(default)]
    pub sanitizer: Option<bool>,
}

/// A resolved option-set.
#[derive(Debug, Clone)]
pub struct OptionSet {
    pub name: String,
    pub compiler: String,
    pub family: ToolchainFamily,
    pub flags: String,
    pub arch: Option<String>,
    pub sanitizer: bool,
    pub no_opt: bool,
    pub blame: Option<Arc<CompiledProfile>>,
}

impl OptionSet {
    fn resolve(spec: &OptionSetSpec, compiler: &CompilerSpec, blame: Option<Arc<CompiledProfile>>) -> Self {
        let no_opt = spec.name.contains("no_opt")
            || spec.flags.split_whitespace().any(|f| f == "-O0");
        let sanitizer = spec
            .sanitizer
            .unwrap_or_else(|| spec.name.starts_with("ubsan") || compiler.name.starts_with("ubsan"));
        Self {
            name: spec.name.clone(),
            compiler: compiler.name.clone(),
            family: compiler.family,
            flags: spec.flags.clone(),
            arch: spec.arch.clone(),
            sanitizer,
            no_opt,
            blame,
        }
    }
}

/// Ordered, immutable collection of option-sets.
#[derive(Debug, Clone)]
pub struct TargetRegistry {
    compilers: Vec<CompilerSpec>,
    option_sets: Vec<Arc<OptionSet>>,
}

impl TargetRegistry {
    /// Resolve option-sets against compilers and compile blame profiles.
    ///
    /// # Errors
    ///
    /// Duplicate names, option-sets naming an undeclared compiler, and
    /// invalid blame profiles.
    pub fn new(compilers: Vec<CompilerSpec>, option_sets: &[OptionSetSpec]) -> Result<Self> {
        let mut seen = HashSet::new();
        for compiler in &compilers {
            if !seen.insert(compiler.name.as_str()) {
                return Err(CcdiffError::config(format!(
                    "compiler '{}' is declared twice",
                    compiler.name
                )));
            }
        }
        let mut profiles = Vec::with_capacity(compilers.len());
        for compiler in &compilers {
            let profile = compiler
                .blame_profile
                .clone()
                .or_else(|| compiler.family.builtin_blame_profile())
                .map(BlameProfile::compile)
                .transpose()?
                .map(Arc::new);
            profiles.push(profile);
        }

        let mut names = HashSet::new();
        let mut resolved = Vec::with_capacity(option_sets.len());
        for spec in option_sets {
            if !names.insert(spec.name.as_str()) {
                return Err(CcdiffError::config(format!(
                    "option-set '{}' is declared twice",
                    spec.name
                )));
            }
            if spec.name.is_empty() || spec.name.contains(['/', ' ']) {
                return Err(CcdiffError::config(format!(
                    "option-set name '{}' must be non-empty without '/' or spaces",
                    spec.name
                )));
            }
            let idx = compilers
                .iter()
                .position(|c| c.name == spec.compiler)
                .ok_or_else(|| {
                    CcdiffError::config(format!(
                        "option-set '{}' uses undeclared compiler '{}'",
                        spec.name, spec.compiler
                    ))
                })?;
            resolved.push(Arc::new(OptionSet::resolve(
                spec,
                &compilers[idx],
                profiles[idx].clone(),
            )));
        }
        Ok(Self {
            compilers,
            option_sets: resolved,
        })
    }

    /// Keep only option-sets whose compiler is in `names`, preserving order.
    ///
    /// # Errors
    ///
    /// [`CcdiffError::UnknownTarget`] for a name that is not a declared
    /// compiler, and a config error if nothing is left.
    pub fn select(self, names: &[String]) -> Result<Self> {
        if names.is_empty() {
            return Ok(self);
        }
        for name in names {
            if !self.compilers.iter().any(|c| &c.name == name) {
                return Err(CcdiffError::UnknownTarget { name: name.clone() });
            }
        }
        let option_sets: Vec<_> = self
            .option_sets
            .into_iter()
            .filter(|o| names.contains(&o.compiler))
            .collect();
        if option_sets.is_empty() {
            return Err(CcdiffError::config("selected compilers have no option-sets"));
        }
        let compilers = self
            .compilers
            .into_iter()
            .filter(|c| names.contains(&c.name))
            .collect();
        Ok(Self {
            compilers,
            option_sets,
        })
    }

    pub fn option_sets(&self) -> &[Arc<OptionSet>] {
        &self.option_sets
    }

    pub fn compilers(&self) -> &[CompilerSpec] {
        &self.compilers
    }

    pub fn get(&self, name: &str) -> Option<&Arc<OptionSet>> {
        self.option_sets.iter().find(|o| o.name == name)
    }

    pub fn len(&self) -> usize {
        self.option_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.option_sets.is_empty()
    }

    /// Run `<executable> --version` for every compiler that declares one
    /// and log the first line.
    ///
    /// # Errors
    ///
    /// [`CcdiffError::ToolUnavailable`] if an executable cannot be run.
    pub fn probe_versions(&self, limits: RunLimits) -> Result<Vec<(String, String)>> {
        let mut versions = Vec::new();
        for compiler in &self.compilers {
            let Some(exe) = &compiler.executable else {
                continue;
            };
            let out = process::run(&CommandSpec::new(exe).arg("--version"), limits).map_err(
                |err| CcdiffError::ToolUnavailable {
                    tool: exe.clone(),
                    detail: err.to_string(),
                },
            )?;
            let text = if out.stdout.is_empty() {
                out.stderr_text()
            } else {
                out.stdout_text()
            };
            let first = text.lines().next().unwrap_or_default().trim().to_owned();
            info!(compiler = %compiler.name, version = %first, "compiler version");
            versions.push((compiler.name.clone(), first));
        }
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiler(name: &str, family: ToolchainFamily) -> CompilerSpec {
        CompilerSpec {
            name: name.to_owned(),
            family,
            executable: None,
            blame_profile: None,
        }
    }

    fn optset(name: &str, compiler: &str, flags: &str) -> OptionSetSpec {
        OptionSetSpec {
            name: name.to_owned(),
            compiler: compiler.to_owned(),
            flags: flags.to_owned(),
            arch: None,
            sanitizer: None,
        }
    }

    fn sample() -> TargetRegistry {
        TargetRegistry::new(
            vec![
                compiler("gcc", ToolchainFamily::Gcc),
                compiler("clang", ToolchainFamily::Clang),
                compiler("ubsan_clang", ToolchainFamily::Clang),
            ],
            &[
                optset("gcc_no_opt", "gcc", "-O0"),
                optset("clang_o0", "clang", "-O0 -march=native"),
                optset("clang_o3", "clang", "-O3"),
                optset("ubsan_clang_o0", "ubsan_clang", "-O0 -fsanitize=undefined"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn resolves_flags_and_profiles() {
        let reg = sample();
        assert_eq!(reg.len(), 4);
        let gcc = reg.get("gcc_no_opt").unwrap();
        assert!(gcc.no_opt);
        assert!(gcc.blame.is_none());
        let o0 = reg.get("clang_o0").unwrap();
        assert!(o0.no_opt);
        let o3 = reg.get("clang_o3").unwrap();
        assert!(!o3.no_opt);
        assert!(!o3.sanitizer);
        assert!(o3.blame.is_some());
        assert!(reg.get("ubsan_clang_o0").unwrap().sanitizer);
    }

    #[test]
    fn select_preserves_declaration_order() {
        let reg = sample().select(&["clang".to_owned()]).unwrap();
        let names: Vec<_> = reg.option_sets().iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["clang_o0", "clang_o3"]);
    }

    #[test]
    fn select_rejects_unknown() {
        let err = sample().select(&["msvc".to_owned()]).unwrap_err();
        assert!(matches!(err, CcdiffError::UnknownTarget { .. }));
    }

    #[test]
    fn undeclared_compiler_is_config_error() {
        let err = TargetRegistry::new(vec![], &[optset("x", "nope", "")]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn duplicate_option_set_is_rejected() {
        let err = TargetRegistry::new(
            vec![compiler("gcc", ToolchainFamily::Gcc)],
            &[optset("a", "gcc", ""), optset("a", "gcc", "-O2")],
        )
        .unwrap_err();
        assert!(matches!(err, CcdiffError::InvalidConfig { .. }));
    }

    #[test]
    fn probe_reports_missing_executable() {
        let mut c = compiler("ghost", ToolchainFamily::Other);
        c.executable = Some("/nonexistent/ccdiff-ghost-cc".to_owned());
        let reg = TargetRegistry::new(vec![c], &[optset("g", "ghost", "")]).unwrap();
        let err = reg.probe_versions(RunLimits::unlimited()).unwrap_err();
        assert!(matches!(err, CcdiffError::ToolUnavailable { .. }));
    }

    #[test]
    fn probe_reads_first_line() {
        let mut c = compiler("shell", ToolchainFamily::Other);
        c.executable = Some("echo".to_owned());
        let reg = TargetRegistry::new(vec![c], &[optset("s", "shell", "")]).unwrap();
        let versions = reg.probe_versions(RunLimits::unlimited()).unwrap();
        assert_eq!(versions, [("shell".to_owned(), "--version".to_owned())]);
    }
}
