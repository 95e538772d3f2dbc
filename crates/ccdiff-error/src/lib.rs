use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for ccdiff operations.
///
/// Only conditions that must stop the caller live here. A compiler that
/// crashes, times out, or prints the wrong answer is *data*, not an error;
/// it is reported through the run model and the failure store instead.
#[derive(Error, Debug)]
pub enum CcdiffError {
    // === Process Errors ===
    /// The operating system refused to start a command.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on or signalling a child failed in a way that is neither a
    /// timeout nor a nonzero exit.
    #[error("process '{command}' failed unexpectedly: {detail}")]
    ProcessFailure { command: String, detail: String },

    // === Configuration Errors ===
    /// Campaign configuration is malformed or inconsistent.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    /// Configuration file could not be parsed.
    #[error("cannot parse config '{path}': {detail}")]
    ConfigParse { path: PathBuf, detail: String },

    /// A `--target` name matched no declared compiler.
    #[error("unknown target: '{name}'")]
    UnknownTarget { name: String },

    /// A required external tool is missing or unusable.
    #[error("tool '{tool}' is unavailable: {detail}")]
    ToolUnavailable { tool: String, detail: String },

    /// A signature or blame pattern did not compile.
    #[error("invalid pattern '{pattern}': {detail}")]
    InvalidPattern { pattern: String, detail: String },

    // === Seed Errors ===
    /// A token in a seed list is not a valid seed.
    #[error("invalid seed: '{token}'")]
    InvalidSeed { token: String },

    // === Model Errors ===
    /// A test run was asked to move backwards or skip a phase.
    #[error("illegal transition for '{target}': {from} -> {to}")]
    IllegalTransition {
        target: String,
        from: String,
        to: String,
    },

    /// A test was aggregated while some of its runs were still pending.
    #[error("test {seed} has {pending} unfinished run(s)")]
    RunsPending { seed: String, pending: usize },

    // === Blame Errors ===
    /// The phase count could not be read from the compiler diagnostics.
    #[error("cannot read phase count with '{pattern}' (stage {stage}, phase {phase})")]
    PhaseCountUnreadable {
        pattern: String,
        stage: usize,
        phase: usize,
    },

    /// The converged blame build printed no recognizable phase name.
    #[error("cannot extract phase name from diagnostics of '{target}'")]
    PhaseNameMissing { target: String },

    // === I/O and Internal ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization of a report or record failed.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Internal logic error (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CcdiffError {
    /// Create an internal error.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }

    /// Create a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }

    /// Create a process failure for `command`.
    pub fn process(command: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ProcessFailure {
            command: command.into(),
            detail: detail.into(),
        }
    }

    /// Whether the whole campaign has to stop.
    ///
    /// Everything else is scoped to one test or one enrichment step and is
    /// logged by the worker before it moves on.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. }
                | Self::ConfigParse { .. }
                | Self::UnknownTarget { .. }
                | Self::ToolUnavailable { .. }
                | Self::InvalidPattern { .. }
                | Self::InvalidSeed { .. }
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Spawn { .. } => Some("Check that the executable exists and is on PATH"),
            Self::UnknownTarget { .. } => {
                Some("List the compiler in the config's \"compilers\" section")
            }
            Self::ToolUnavailable { .. } => Some("Install the tool or disable the feature using it"),
            Self::InvalidSeed { .. } => {
                Some("Seeds are numbers, optionally '<proc>_<number>', with an optional S_ prefix")
            }
            Self::ConfigParse { .. } | Self::InvalidConfig { .. } => {
                Some("Fix the campaign config file and restart")
            }
            _ => None,
        }
    }

    /// Process exit code for the command-line front end.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfig { .. }
            | Self::ConfigParse { .. }
            | Self::UnknownTarget { .. }
            | Self::InvalidSeed { .. }
            | Self::InvalidPattern { .. } => 2,
            Self::ToolUnavailable { .. } | Self::Spawn { .. } => 3,
            _ => 1,
        }
    }
}

/// Result type alias using `CcdiffError`.
pub type Result<T> = std::result::Result<T, CcdiffError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_spawn() {
        let err = CcdiffError::Spawn {
            command: "clang".to_owned(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(err.to_string(), "failed to spawn 'clang': no such file");
    }

    #[test]
    fn error_display_transition() {
        let err = CcdiffError::IllegalTransition {
            target: "clang_o2".to_owned(),
            from: "run_ok".to_owned(),
            to: "not_run".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "illegal transition for 'clang_o2': run_ok -> not_run"
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(CcdiffError::config("jobs must be > 0").is_fatal());
        assert!(
            CcdiffError::UnknownTarget {
                name: "msvc".to_owned()
            }
            .is_fatal()
        );
        assert!(!CcdiffError::process("make", "wait4 failed").is_fatal());
        assert!(!CcdiffError::internal("oops").is_fatal());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(CcdiffError::config("x").exit_code(), 2);
        assert_eq!(
            CcdiffError::ToolUnavailable {
                tool: "creduce".to_owned(),
                detail: "not found".to_owned()
            }
            .exit_code(),
            3
        );
        assert_eq!(CcdiffError::internal("x").exit_code(), 1);
    }

    #[test]
    fn io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: CcdiffError = io.into();
        assert!(matches!(err, CcdiffError::Io(_)));
        assert!(err.suggestion().is_none());
    }

    #[test]
    fn suggestions_exist_for_user_errors() {
        assert!(
            CcdiffError::InvalidSeed {
                token: "abc".to_owned()
            }
            .suggestion()
            .is_some()
        );
        assert!(CcdiffError::config("x").suggestion().is_some());
    }
}
