use std::path::{Path, PathBuf};

use ccdiff_error::{CcdiffError, Result};

use super::Injection;
use crate::config::{CommandTemplate, TemplateVars};
use crate::process::{self, CommandSpec, ProcessOutput, RunLimits};

/// Builds and runs the program under a given control string.
pub trait BlameExecutor {
    /// # Errors
    ///
    /// Only when the build command cannot be executed at all.
    fn build(&mut self, injection: &str) -> Result<ProcessOutput>;

    /// # Errors
    ///
    /// Only when the run command cannot be executed at all.
    fn run(&mut self, injection: &str) -> Result<ProcessOutput>;
}

/// Command templates and limits used while blaming.
#[derive(Debug, Clone, Copy)]
pub struct BlameSettings<'a> {
    pub build: &'a CommandTemplate,
    pub run: &'a CommandTemplate,
    pub build_limits: RunLimits,
    pub run_limits: RunLimits,
    pub seed: &'a str,
}

/// [`BlameExecutor`] that expands the configured templates in a scratch
/// directory.
#[derive(Debug)]
pub struct CommandExecutor<'a> {
    settings: &'a BlameSettings<'a>,
    target: String,
    dir: PathBuf,
    injection: Injection,
}

impl<'a> CommandExecutor<'a> {
    pub fn new(settings: &'a BlameSettings<'a>, target: &str, dir: &Path, injection: Injection) -> Self {
        Self {
            settings,
            target: target.to_owned(),
            dir: dir.to_path_buf(),
            injection,
        }
    }

    fn command(&self, template: &CommandTemplate, injection: &str) -> Result<CommandSpec> {
        let dir = self.dir.to_string_lossy();
        let flag = match self.injection {
            Injection::Flag => injection,
            Injection::Env => "",
        };
        let vars = TemplateVars {
            target: &self.target,
            dir: &dir,
            seed: self.settings.seed,
            blame: flag,
        };
        let mut spec = template
            .expand(&vars)
            .ok_or_else(|| CcdiffError::config("blame command template is empty"))?
            .current_dir(&self.dir);
        if self.injection == Injection::Env {
            for (key, value) in env_pairs(injection) {
                spec = spec.env(key, value);
            }
        }
        Ok(spec)
    }
}

impl BlameExecutor for CommandExecutor<'_> {
    fn build(&mut self, injection: &str) -> Result<ProcessOutput> {
        let spec = self.command(self.settings.build, injection)?;
        process::run(&spec, self.settings.build_limits)
    }

    fn run(&mut self, injection: &str) -> Result<ProcessOutput> {
        let spec = self.command(self.settings.run, injection)?;
        process::run(&spec, self.settings.run_limits)
    }
}

/// `KEY=VALUE` tokens of an environment control string.
fn env_pairs(injection: &str) -> impl Iterator<Item = (&str, &str)> {
    injection
        .split_whitespace()
        .filter_map(|token| token.split_once('='))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_injection_splits_pairs() {
        let pairs: Vec<_> =
            env_pairs("IGC_ShaderDumpEnableAll=1 IGC_ShaderDisableOptPassesAfter=17").collect();
        assert_eq!(
            pairs,
            [
                ("IGC_ShaderDumpEnableAll", "1"),
                ("IGC_ShaderDisableOptPassesAfter", "17")
            ]
        );
        assert_eq!(env_pairs("").count(), 0);
    }

    #[test]
    fn flag_injection_goes_into_arguments() {
        let build = CommandTemplate::new(["cc", "{blame}", "-o", "{target}.out"]);
        let run = CommandTemplate::new(["./{target}.out"]);
        let settings = BlameSettings {
            build: &build,
            run: &run,
            build_limits: RunLimits::unlimited(),
            run_limits: RunLimits::unlimited(),
            seed: "1",
        };
        let dir = Path::new("/tmp/blame");
        let exec = CommandExecutor::new(&settings, "clang_o3", dir, Injection::Flag);
        let spec = exec.command(&build, "-mllvm -opt-bisect-limit=4").unwrap();
        assert_eq!(spec.program, "cc");
        assert_eq!(spec.args, ["-mllvm", "-opt-bisect-limit=4", "-o", "clang_o3.out"]);
        assert!(spec.env.is_empty());

        let exec = CommandExecutor::new(&settings, "dpcpp", dir, Injection::Env);
        let spec = exec.command(&build, "A=1 B=2").unwrap();
        assert_eq!(spec.args, ["-o", "dpcpp.out"]);
        assert_eq!(spec.env, [("A".to_owned(), "1".to_owned()), ("B".to_owned(), "2".to_owned())]);
        assert_eq!(spec.cwd.as_deref(), Some(dir));
    }

    #[test]
    fn runs_real_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let build = CommandTemplate::new(["sh", "-c", "echo building {blame} >&2"]);
        let run = CommandTemplate::new(["sh", "-c", "echo $LIMIT"]);
        let settings = BlameSettings {
            build: &build,
            run: &run,
            build_limits: RunLimits::unlimited(),
            run_limits: RunLimits::unlimited(),
            seed: "1",
        };
        let mut exec = CommandExecutor::new(&settings, "t", tmp.path(), Injection::Env);
        let out = exec.run("LIMIT=9").unwrap();
        assert_eq!(out.stdout_text().trim(), "9");
        let mut exec = CommandExecutor::new(&settings, "t", tmp.path(), Injection::Flag);
        let out = exec.build("-x=3").unwrap();
        assert!(out.stderr_text().contains("building -x=3"));
    }
}
