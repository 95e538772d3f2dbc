//! FailureRecord storage under `result/`.
//!
//! Layout: `result/<compiler>/<fail-type>/[classification]/S_<seed>/`.
//! A record is written at most once per directory; a later save for the
//! same key merges its evidence into the existing record.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use ccdiff_error::{CcdiffError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::narrative::BlameNote;

pub const RESULT_DIR: &str = "result";
pub const RECORD_FILE: &str = "record.json";
pub const LOG_FILE: &str = "log.txt";
pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// Compiler name used for generation failures.
pub const GEN_FAIL: &str = "gen_fail";

/// Classification for failures without a usable baseline.
pub const NO_BASELINE: &str = "no_baseline";

const MERGE_BANNER: &str = "=== merged evidence ===";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintDigest {
    pub option_set: String,
    pub digest: String,
}

/// Machine-readable companion of `log.txt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub schema_version: u32,
    pub harness_version: String,
    pub seed: String,
    pub compiler: String,
    pub fail_type: String,
    pub classification: Option<String>,
    pub option_sets: Vec<String>,
    pub blame_result: Option<BlameNote>,
    #[serde(default)]
    pub reduction_result: Option<String>,
    #[serde(default)]
    pub fingerprints: Vec<FingerprintDigest>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// RFC 3339, UTC.
    pub recorded_at: String,
}

impl FailureRecord {
    pub fn new(seed: &str, compiler: &str, fail_type: &str) -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            harness_version: env!("CARGO_PKG_VERSION").to_owned(),
            seed: seed.to_owned(),
            compiler: compiler.to_owned(),
            fail_type: fail_type.to_owned(),
            classification: None,
            option_sets: Vec::new(),
            blame_result: None,
            reduction_result: None,
            fingerprints: Vec::new(),
            artifacts: Vec::new(),
            recorded_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[must_use]
    pub fn with_classification(mut self, classification: Option<&str>) -> Self {
        self.classification = classification.map(str::to_owned);
        self
    }

    /// Directory of this record relative to the store root.
    pub fn relative_dir(&self) -> PathBuf {
        let mut dir = PathBuf::from(path_component(&self.compiler));
        dir.push(path_component(&self.fail_type));
        if let Some(classification) = &self.classification {
            dir.push(path_component(classification));
        }
        dir.push(format!("S_{}", path_component(&self.seed)));
        dir
    }

    fn merge(&mut self, newer: &Self) {
        for name in &newer.option_sets {
            if !self.option_sets.contains(name) {
                self.option_sets.push(name.clone());
            }
        }
        for fp in &newer.fingerprints {
            if !self.fingerprints.contains(fp) {
                self.fingerprints.push(fp.clone());
            }
        }
        for artifact in &newer.artifacts {
            if !self.artifacts.contains(artifact) {
                self.artifacts.push(artifact.clone());
            }
        }
        if self.blame_result.is_none() {
            self.blame_result.clone_from(&newer.blame_result);
        }
        if self.reduction_result.is_none() {
            self.reduction_result.clone_from(&newer.reduction_result);
        }
    }
}

/// One directory component; separators and surrounding whitespace would
/// change the layout.
fn path_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_whitespace() { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "_".to_owned()
    } else {
        cleaned
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Created(PathBuf),
    Merged(PathBuf),
}

impl SaveOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Created(p) | Self::Merged(p) => p,
        }
    }
}

/// Owner of `result/`. Directory creation and copying are serialized.
#[derive(Debug)]
pub struct FailureStore {
    root: PathBuf,
    lock: Mutex<()>,
    created: AtomicUsize,
}

impl FailureStore {
    pub fn new(out_dir: &Path) -> Self {
        Self {
            root: out_dir.join(RESULT_DIR),
            lock: Mutex::new(()),
            created: AtomicUsize::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Distinct records written by this store.
    pub fn records_written(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Save `record` with `log` and copies of `files` (relative to
    /// `source_dir`; directories are copied recursively, missing entries
    /// are skipped).
    ///
    /// # Errors
    ///
    /// I/O errors creating the record directory or writing its files.
    pub fn save(
        &self,
        record: &FailureRecord,
        log: &str,
        source_dir: &Path,
        files: &[PathBuf],
    ) -> Result<SaveOutcome> {
        let dest = self.root.join(record.relative_dir());
        let _guard = self.lock.lock();
        let merged = dest.join(RECORD_FILE).exists();
        fs::create_dir_all(&dest)?;
        for file in files {
            let src = source_dir.join(file);
            let Some(name) = file.file_name() else {
                continue;
            };
            let target = dest.join(name);
            if merged && target.exists() {
                continue;
            }
            if let Err(err) = copy_entry(&src, &target) {
                warn!(src = %src.display(), error = %err, "failed to copy file into record");
            }
        }

        if merged {
            let mut existing: FailureRecord = fs::read_to_string(dest.join(RECORD_FILE))
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok())
                .unwrap_or_else(|| record.clone());
            existing.merge(record);
            write_record(&dest, &existing)?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dest.join(LOG_FILE))?;
            writeln!(file, "\n{MERGE_BANNER}")?;
            file.write_all(log.as_bytes())?;
            info!(path = %dest.display(), "merged evidence into existing record");
            Ok(SaveOutcome::Merged(dest))
        } else {
            fs::write(dest.join(LOG_FILE), log)?;
            write_record(&dest, record)?;
            self.created.fetch_add(1, Ordering::Relaxed);
            info!(path = %dest.display(), fail_type = %record.fail_type, "saved failure record");
            Ok(SaveOutcome::Created(dest))
        }
    }
}

fn write_record(dest: &Path, record: &FailureRecord) -> Result<()> {
    let json = serde_json::to_string_pretty(record)
        .map_err(|err| CcdiffError::Serialization(err.to_string()))?;
    fs::write(dest.join(RECORD_FILE), json)?;
    Ok(())
}

/// Copy a file, or a directory tree.
pub(crate) fn copy_entry(src: &Path, dest: &Path) -> std::io::Result<()> {
    let meta = match fs::metadata(src) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(src = %src.display(), "skipping missing file");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    if meta.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_entry(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dest)?;
    }
    Ok(())
}
