//! Known-defect signatures and failure grouping.

use ccdiff_error::{CcdiffError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::{RunStatus, TestRun};

/// One `(pattern, tag)` row as written in config files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub pattern: String,
    pub tag: String,
}

/// Ordered signature table; the first matching row wins.
#[derive(Debug, Clone)]
pub struct SignatureTable {
    rows: Vec<(Regex, String)>,
}

const BUILD_SIGNATURES: &[(&str, &str)] = &[
    // clang
    (
        r#"Assertion `NodeToMatch\->getOpcode\(\) != ISD::DELETED_NODE && "NodeToMatch was removed partway through selection"'"#,
        "SelectionDAGISel",
    ),
    ("replaceAllUses of value with new value of different type", "replaceAllUses"),
    ("Concatenation of vectors with inconsistent value types", "FoldCONCAT_VECTORS"),
    ("Integer type overpromoted", "PromoteIntRes_SETCC"),
    ("Cannot select.*urem", "Cannot_select_urem"),
    ("Cannot select.*X86ISD::PCMPEQ", "Cannot_select_pcmpeq"),
    ("Binary operator types must match", "Binary_operator_types_must_match"),
    ("Deleted Node added to Worklist", "DAGCombiner_AddToWorklist"),
    ("Invalid child # of SDNode", "SDNode_getOperand"),
    ("DELETED_NODE in CSEMap!", "DELETED_NODE_CSEMap"),
    (
        "The number of nodes scheduled doesn't match the expected number",
        "VerifyScheduledSequence",
    ),
    ("Cannot emit physreg copy instruction", "physreg_copy"),
    ("Deleted edge still exists in the CFG", "deleted_cfg_edge"),
    ("Cannot convert from scalar to/from vector", "vec_convert"),
    ("Invalid constantexpr cast!", "constexpr_cast"),
    // gcc
    ("compute_live_loop_exits", "compute_live_loop_exits"),
    ("ubsan_instrument_division", "ubsan_instrument_division"),
    ("non-trivial conversion at assignment", "verify_gimple_assignment"),
    ("type mismatch in shift expression", "verify_gimple_shift"),
    ("type mismatch in binary expression", "verify_gimple_binary"),
    ("REG_BR_PROB does not match", "REG_BR_PROB"),
    ("in build_low_bits_mask", "build_low_bits_mask"),
    ("non-trivial conversion in unary operation", "verify_gimple_conversion_in_unary"),
    ("conversion of register to a different size", "verify_gimple_register_size"),
    ("in decompose", "decompose"),
    ("mismatching comparison operand types", "verify_gimple_unary_conversion"),
    ("qsort checking failed", "qsort"),
    ("in immed_wide_int_const, at emit-rtl.c", "immed_wide_int_const"),
    ("during RTL pass: cprop", "cprop"),
    ("may be used uninitialized in this function", "may_be_uninit"),
    ("hoist_memory_references", "hoist_memory_references"),
    ("verify_gimple_in_cfg", "verify_gimple_in_cfg"),
    ("crash_signal", "crash_signal"),
    ("maybe_canonicalize_mem_ref_addr", "maybe_canonicalize_mem_ref_addr"),
    // resource exhaustion
    ("bad_alloc", "memory_problem"),
    ("out of memory", "memory_problem"),
    ("Out of memory", "memory_problem"),
    ("Cannot allocate memory", "memory_problem"),
    ("Killed", "killed"),
    ("relocation truncated to fit", "inp_alloc_problem"),
];

const RUN_SIGNATURES: &[(&str, &str)] = &[
    ("Total size of kernel arguments exceeds limit", "kernel_size"),
    ("CL_DEVICE_NOT_FOUND", "device_not_found"),
    ("Killed", "killed"),
    ("Aborted", "aborted"),
];

impl SignatureTable {
    /// # Errors
    ///
    /// [`CcdiffError::InvalidPattern`] for the first row that fails to compile.
    pub fn new<'a>(rows: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let rows = rows
            .into_iter()
            .map(|(pattern, tag)| {
                Regex::new(pattern)
                    .map(|re| (re, tag.to_owned()))
                    .map_err(|err| CcdiffError::InvalidPattern {
                        pattern: pattern.to_owned(),
                        detail: err.to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rows })
    }

    /// Built-in compiler crash signatures.
    ///
    /// # Errors
    ///
    /// Only if a built-in pattern is malformed.
    pub fn builtin_build() -> Result<Self> {
        Self::new(BUILD_SIGNATURES.iter().copied())
    }

    /// Built-in runtime failure signatures.
    ///
    /// # Errors
    ///
    /// Only if a built-in pattern is malformed.
    pub fn builtin_run() -> Result<Self> {
        Self::new(RUN_SIGNATURES.iter().copied())
    }

    /// Built-in rows followed by `extra`; earlier rows win.
    ///
    /// # Errors
    ///
    /// [`CcdiffError::InvalidPattern`] for a malformed extra row.
    pub fn extended(mut self, extra: &[Signature]) -> Result<Self> {
        let more = Self::new(extra.iter().map(|s| (s.pattern.as_str(), s.tag.as_str())))?;
        self.rows.extend(more.rows);
        Ok(self)
    }

    pub fn classify(&self, diagnostics: &str) -> Option<&str> {
        self.rows
            .iter()
            .find(|(re, _)| re.is_match(diagnostics))
            .map(|(_, tag)| tag.as_str())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Build and run tables, read-only after startup.
#[derive(Debug, Clone)]
pub struct Classifier {
    pub build: SignatureTable,
    pub run: SignatureTable,
}

impl Classifier {
    /// # Errors
    ///
    /// See [`SignatureTable::builtin_build`].
    pub fn builtin() -> Result<Self> {
        Ok(Self {
            build: SignatureTable::builtin_build()?,
            run: SignatureTable::builtin_run()?,
        })
    }

    /// Tag for a failed run, looked up in the table for its failing phase.
    pub fn classify_run(&self, run: &TestRun) -> Option<String> {
        let diagnostics = run.failure_diagnostics()?;
        let table = match run.status() {
            RunStatus::BuildFail | RunStatus::BuildTimeout => &self.build,
            RunStatus::RunFail | RunStatus::RunTimeout => &self.run,
            _ => return None,
        };
        table.classify(&diagnostics).map(str::to_owned)
    }
}

/// Failed runs that share a failure type and tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureGroup {
    pub status: RunStatus,
    pub tag: Option<String>,
    /// Indices into the Test's runs, first one is the representative.
    pub members: Vec<usize>,
}

impl FailureGroup {
    pub fn fail_type(&self) -> &'static str {
        self.status.fail_type().unwrap_or("unknown")
    }

    pub fn representative(&self) -> usize {
        self.members[0]
    }
}

/// Partition failed runs by `(status, tag)` in order of first appearance.
pub fn group_failures(classifier: &Classifier, runs: &[TestRun]) -> Vec<FailureGroup> {
    let mut groups: Vec<FailureGroup> = Vec::new();
    for (idx, run) in runs.iter().enumerate() {
        if !run.status().is_failure() {
            continue;
        }
        let tag = classifier.classify_run(run);
        match groups
            .iter_mut()
            .find(|g| g.status == run.status() && g.tag == tag)
        {
            Some(group) => group.members.push(idx),
            None => groups.push(FailureGroup {
                status: run.status(),
                tag,
                members: vec![idx],
            }),
        }
    }
    groups
}
