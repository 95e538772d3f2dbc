//! Campaign configuration.
//!
//! One JSON file holds the harness settings, the compilers and the
//! option-sets. Every harness field has a default so a minimal file only
//! names the generator, the build/run command templates and the targets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ccdiff_error::{CcdiffError, Result};
use serde::{Deserialize, Serialize};

use crate::classifier::{Classifier, Signature, SignatureTable};
use crate::process::{CommandSpec, RunLimits};
use crate::registry::{CompilerSpec, OptionSetSpec, TargetRegistry};

/// Printed by generated programs that detect a wrong result themselves.
pub const DEFAULT_ERROR_SENTINEL: &str = "ERROR";

// ── Command templates ───────────────────────────────────────────────────

/// Placeholder values for one template expansion.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateVars<'a> {
    pub target: &'a str,
    pub dir: &'a str,
    pub seed: &'a str,
    pub blame: &'a str,
}

/// An argument vector with `{target}`, `{dir}`, `{seed}` and `{blame}`
/// placeholders.
///
/// An argument that is exactly `{blame}` expands to the whitespace-split
/// control string (possibly zero arguments); elsewhere placeholders are
/// substituted in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct CommandTemplate(pub Vec<String>);

impl CommandTemplate {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(args.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn mentions(&self, placeholder: &str) -> bool {
        self.0.iter().any(|a| a.contains(placeholder))
    }

    /// Expanded argument vector, program first.
    pub fn expand_args(&self, vars: &TemplateVars<'_>) -> Vec<String> {
        let mut out = Vec::with_capacity(self.0.len());
        for arg in &self.0 {
            if arg == "{blame}" {
                out.extend(vars.blame.split_whitespace().map(str::to_owned));
                continue;
            }
            out.push(
                arg.replace("{target}", vars.target)
                    .replace("{dir}", vars.dir)
                    .replace("{seed}", vars.seed)
                    .replace("{blame}", vars.blame),
            );
        }
        out
    }

    /// Expanded command, or `None` for an empty template.
    pub fn expand(&self, vars: &TemplateVars<'_>) -> Option<CommandSpec> {
        let mut args = self.expand_args(vars).into_iter();
        let program = args.next()?;
        Some(CommandSpec::new(program).args(args))
    }
}

// ── Harness settings ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub generator_secs: u64,
    pub build_secs: u64,
    pub run_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            generator_secs: 60,
            build_secs: 1200,
            run_secs: 300,
        }
    }
}

/// Address-space ceilings in KiB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLimits {
    pub generator_kib: Option<u64>,
    pub build_kib: Option<u64>,
    pub run_kib: Option<u64>,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            generator_kib: Some(2_000_000),
            build_kib: Some(10_000_000),
            run_kib: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub command: CommandTemplate,
    /// Appended when a seed is supplied; `{seed}` is substituted.
    pub seed_args: Vec<String>,
    /// Files the generator writes. Empty means "every regular file it left
    /// in the worker directory".
    pub files: Vec<String>,
    pub version_args: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: CommandTemplate::new(["yarpgen"]),
            seed_args: vec!["-s".to_owned(), "{seed}".to_owned()],
            files: Vec::new(),
            version_args: vec!["-v".to_owned()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTemplates {
    pub build: CommandTemplate,
    pub run: CommandTemplate,
    /// Defaults to `build`.
    pub blame_build: Option<CommandTemplate>,
    /// Defaults to `run`.
    pub blame_run: Option<CommandTemplate>,
    /// Executable produced by `build`, saved with miscompares.
    pub artifact: Option<String>,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            build: CommandTemplate::new(["make", "-f", "{dir}/Test_Makefile", "{target}"]),
            run: CommandTemplate::new(["make", "-f", "{dir}/Test_Makefile", "run_{target}"]),
            blame_build: None,
            blame_run: None,
            artifact: Some("{target}.out".to_owned()),
        }
    }
}

impl CommandTemplates {
    pub fn blame_build(&self) -> &CommandTemplate {
        self.blame_build.as_ref().unwrap_or(&self.build)
    }

    pub fn blame_run(&self) -> &CommandTemplate {
        self.blame_run.as_ref().unwrap_or(&self.run)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionConfig {
    pub enabled: bool,
    /// Parallelism handed to the minimizer (`--n`).
    pub jobs: usize,
    pub minimizer: String,
    pub timeout_secs: u64,
    /// File the minimizer shrinks.
    pub source_file: String,
    /// Build description copied next to the oracle script.
    pub build_description: Option<PathBuf>,
    /// Default to the main build/run templates.
    pub build: Option<CommandTemplate>,
    pub run: Option<CommandTemplate>,
    /// Skip reduction when no sanitizer run can serve as the good side.
    pub require_sanitizer_baseline: bool,
    /// Stderr patterns that disqualify a run-failure candidate.
    pub exclude_patterns: Vec<String>,
    pub min_version: (u32, u32),
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            jobs: 1,
            minimizer: "creduce".to_owned(),
            timeout_secs: 24 * 60 * 60,
            source_file: "func.cpp".to_owned(),
            build_description: None,
            build: None,
            run: None,
            require_sanitizer_baseline: true,
            exclude_patterns: vec!["left shift of negative value".to_owned()],
            min_version: (2, 6),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub interval_secs: u64,
    pub log_file: Option<PathBuf>,
    pub print_line: bool,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            log_file: None,
            print_line: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub command: Option<CommandTemplate>,
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            command: None,
            interval_secs: 3600,
        }
    }
}

/// Harness-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub out_dir: PathBuf,
    pub jobs: usize,
    /// Wall-clock budget; `None` runs until the seed list is exhausted or
    /// the process is stopped.
    pub time_budget_secs: Option<u64>,
    pub timeouts: Timeouts,
    pub memory: MemoryLimits,
    pub generator: GeneratorConfig,
    pub commands: CommandTemplates,
    /// Copied into every worker directory before generation.
    pub build_description: Option<PathBuf>,
    pub blame: bool,
    pub reduction: ReductionConfig,
    pub stats: StatsConfig,
    pub cleanup: CleanupConfig,
    /// Save only `log.txt` (with file sizes) for build timeouts.
    pub ignore_build_timeout_files: bool,
    /// Output marker of a self-reported failure; agreeing runs that print
    /// it do not pass. `null` disables the check.
    pub error_sentinel: Option<String>,
    /// Checked after the built-in build-failure signatures.
    pub build_signatures: Vec<Signature>,
    /// Checked after the built-in run-failure signatures.
    pub run_signatures: Vec<Signature>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("ccdiff-out"),
            jobs: num_cpus::get().max(1),
            time_budget_secs: None,
            timeouts: Timeouts::default(),
            memory: MemoryLimits::default(),
            generator: GeneratorConfig::default(),
            commands: CommandTemplates::default(),
            build_description: None,
            blame: false,
            reduction: ReductionConfig::default(),
            stats: StatsConfig::default(),
            cleanup: CleanupConfig::default(),
            ignore_build_timeout_files: true,
            error_sentinel: Some(DEFAULT_ERROR_SENTINEL.to_owned()),
            build_signatures: Vec::new(),
            run_signatures: Vec::new(),
        }
    }
}

impl HarnessConfig {
    pub fn generator_limits(&self) -> RunLimits {
        RunLimits {
            timeout: Some(Duration::from_secs(self.timeouts.generator_secs)),
            memory_kib: self.memory.generator_kib,
        }
    }

    pub fn build_limits(&self) -> RunLimits {
        RunLimits {
            timeout: Some(Duration::from_secs(self.timeouts.build_secs)),
            memory_kib: self.memory.build_kib,
        }
    }

    pub fn run_limits(&self) -> RunLimits {
        RunLimits {
            timeout: Some(Duration::from_secs(self.timeouts.run_secs)),
            memory_kib: self.memory.run_kib,
        }
    }

    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget_secs.map(Duration::from_secs)
    }

    /// Built-in signature tables extended with the configured rows.
    ///
    /// # Errors
    ///
    /// [`CcdiffError::InvalidPattern`] for a malformed row.
    pub fn classifier(&self) -> Result<Classifier> {
        Ok(Classifier {
            build: SignatureTable::builtin_build()?.extended(&self.build_signatures)?,
            run: SignatureTable::builtin_run()?.extended(&self.run_signatures)?,
        })
    }

    /// # Errors
    ///
    /// [`CcdiffError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.jobs == 0 {
            return Err(CcdiffError::config("jobs must be at least 1"));
        }
        if self.generator.command.is_empty() {
            return Err(CcdiffError::config("generator.command is empty"));
        }
        if self.commands.build.is_empty() || self.commands.run.is_empty() {
            return Err(CcdiffError::config("commands.build and commands.run are required"));
        }
        if !self.commands.build.mentions("{target}") || !self.commands.run.mentions("{target}") {
            return Err(CcdiffError::config(
                "commands.build and commands.run must mention {target}",
            ));
        }
        if self.timeouts.build_secs == 0 || self.timeouts.run_secs == 0 {
            return Err(CcdiffError::config("build and run timeouts must be positive"));
        }
        if self.reduction.enabled && self.reduction.jobs == 0 {
            return Err(CcdiffError::config("reduction.jobs must be at least 1"));
        }
        if let Some(path) = &self.build_description {
            if !path.is_file() {
                return Err(CcdiffError::config(format!(
                    "build description '{}' does not exist",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

// ── Whole campaign file ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    #[serde(default)]
    pub harness: HarnessConfig,
    pub compilers: Vec<CompilerSpec>,
    pub option_sets: Vec<OptionSetSpec>,
}

impl CampaignConfig {
    /// Read and parse a campaign file.
    ///
    /// # Errors
    ///
    /// I/O errors and [`CcdiffError::ConfigParse`].
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|err| CcdiffError::ConfigParse {
            path: path.to_path_buf(),
            detail: err.to_string(),
        })
    }

    /// Build the target registry, keeping only `selected` compilers if any
    /// are named.
    ///
    /// # Errors
    ///
    /// See [`TargetRegistry::new`] and [`TargetRegistry::select`].
    pub fn registry(&self, selected: &[String]) -> Result<TargetRegistry> {
        TargetRegistry::new(self.compilers.clone(), &self.option_sets)?.select(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let cfg = HarnessConfig::default();
        assert_eq!(cfg.timeouts.generator_secs, 60);
        assert_eq!(cfg.timeouts.build_secs, 1200);
        assert_eq!(cfg.timeouts.run_secs, 300);
        assert_eq!(cfg.memory.generator_kib, Some(2_000_000));
        assert_eq!(cfg.memory.build_kib, Some(10_000_000));
        assert_eq!(cfg.reduction.timeout_secs, 86_400);
        assert_eq!(cfg.stats.interval_secs, 10);
        assert_eq!(cfg.cleanup.interval_secs, 3600);
        assert!(cfg.jobs >= 1);
        assert_eq!(cfg.error_sentinel.as_deref(), Some("ERROR"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn template_expansion() {
        let t = CommandTemplate::new(["cc", "{blame}", "-o", "{dir}/{target}.out", "X={blame}"]);
        let vars = TemplateVars {
            target: "clang_o3",
            dir: "/w",
            seed: "1",
            blame: "-mllvm -opt-bisect-limit=5",
        };
        assert_eq!(
            t.expand_args(&vars),
            [
                "cc",
                "-mllvm",
                "-opt-bisect-limit=5",
                "-o",
                "/w/clang_o3.out",
                "X=-mllvm -opt-bisect-limit=5"
            ]
        );
        let empty_blame = TemplateVars { blame: "", ..vars };
        assert_eq!(t.expand_args(&empty_blame).len(), 5);
    }

    #[test]
    fn empty_template_expands_to_none() {
        assert!(CommandTemplate::default().expand(&TemplateVars::default()).is_none());
    }

    #[test]
    fn minimal_campaign_parses() {
        let json = r#"{
            "harness": {
                "jobs": 2,
                "generator": {"command": ["./gen.sh"]},
                "commands": {"build": ["./build.sh", "{target}"], "run": ["./run.sh", "{target}"]}
            },
            "compilers": [{"name": "gcc", "family": "gcc"}],
            "option_sets": [{"name": "gcc_o2", "compiler": "gcc", "flags": "-O2"}]
        }"#;
        let cfg: CampaignConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.harness.jobs, 2);
        assert_eq!(cfg.harness.timeouts.run_secs, 300);
        assert!(cfg.harness.validate().is_ok());
        let reg = cfg.registry(&[]).unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn validation_catches_missing_target_placeholder() {
        let mut cfg = HarnessConfig::default();
        cfg.commands.build = CommandTemplate::new(["make"]);
        assert!(matches!(cfg.validate(), Err(CcdiffError::InvalidConfig { .. })));
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            CampaignConfig::load(&path),
            Err(CcdiffError::ConfigParse { .. })
        ));
    }
}
