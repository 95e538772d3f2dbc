//! Seed identities, seed-list parsing and the shared seed queue.

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use ccdiff_error::{CcdiffError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// How many empty polls a worker makes before treating the queue as drained.
pub const DRAIN_RETRIES: usize = 3;

const LOCK_WAIT: Duration = Duration::from_millis(20);

/// Identity of one generated program.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seed(String);

impl Seed {
    /// Wrap a token that has already been validated.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name used under `result/`.
    pub fn dir_name(&self) -> String {
        format!("S_{}", self.0)
    }

    /// Seed derived from the worker id and the current UTC time, used when
    /// the generator printed nothing usable.
    pub fn fallback(worker: usize) -> Self {
        Self(format!(
            "{worker}_{}",
            chrono::Utc::now().format("%Y_%m_%d_%H_%M_%S")
        ))
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extract the seed from generator stdout: the second whitespace-separated
/// token with trailing punctuation removed.
pub fn parse_generator_seed(stdout: &str) -> Option<Seed> {
    let token = stdout.split_whitespace().nth(1)?;
    let trimmed = token.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    if trimmed.is_empty() {
        None
    } else {
        Some(Seed::new(trimmed))
    }
}

/// Parse one line of a seed list.
///
/// Tokens are separated by whitespace or commas, may carry a leading `S_`
/// and a trailing `/`, and must be `<number>` or `<proc>_<number>`.
///
/// # Errors
///
/// [`CcdiffError::InvalidSeed`] for the first malformed token.
pub fn parse_seed_line(line: &str) -> Result<Vec<Seed>> {
    line.replace(',', " ")
        .split_whitespace()
        .map(parse_seed_token)
        .collect()
}

fn parse_seed_token(token: &str) -> Result<Seed> {
    let invalid = || CcdiffError::InvalidSeed {
        token: token.to_owned(),
    };
    let body = token
        .trim_start_matches(['S', '_'])
        .trim_end_matches('/');
    if body.is_empty() || !body.chars().all(|c| c.is_ascii_digit() || c == '_') {
        return Err(invalid());
    }
    let parts: Vec<&str> = body.split('_').collect();
    let last = parts.last().copied().unwrap_or_default();
    if parts.len() > 2 || last.is_empty() || !last.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    Ok(Seed::new(body))
}

/// Parse a `--seeds` value: either a path to a seed file or a literal list.
///
/// The result is de-duplicated and sorted.
///
/// # Errors
///
/// Propagates invalid tokens and file read errors.
pub fn load_seed_list(value: &str) -> Result<Vec<Seed>> {
    let trimmed = value.trim();
    let mut seeds = Vec::new();
    let path = Path::new(trimmed);
    if !trimmed.is_empty() && !trimmed.contains(char::is_whitespace) && path.is_file() {
        let text = std::fs::read_to_string(path)?;
        for line in text.lines() {
            if line.trim_start().starts_with('#') {
                continue;
            }
            seeds.extend(parse_seed_line(line)?);
        }
    } else {
        seeds = parse_seed_line(trimmed)?;
    }
    let supplied = seeds.len();
    seeds.sort();
    seeds.dedup();
    let duplicates = supplied - seeds.len();
    if duplicates > 0 {
        info!(duplicates, unique = seeds.len(), "dropped duplicate seeds");
    }
    Ok(seeds)
}

// ── SeedQueue ───────────────────────────────────────────────────────────

/// FIFO of externally supplied seeds shared by all workers.
#[derive(Debug, Default)]
pub struct SeedQueue {
    inner: Mutex<VecDeque<Seed>>,
}

impl SeedQueue {
    pub fn new(seeds: impl IntoIterator<Item = Seed>) -> Self {
        Self {
            inner: Mutex::new(seeds.into_iter().collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Non-blocking dequeue. `None` means "empty or contended right now",
    /// which is not proof the queue is drained.
    pub fn try_dequeue(&self) -> Option<Seed> {
        self.inner.try_lock_for(LOCK_WAIT)?.pop_front()
    }

    /// Next seed, or `None` once [`DRAIN_RETRIES`] consecutive polls came
    /// back empty.
    pub fn next_seed(&self) -> Option<Seed> {
        for attempt in 0..DRAIN_RETRIES {
            if let Some(seed) = self.try_dequeue() {
                return Some(seed);
            }
            if attempt + 1 < DRAIN_RETRIES {
                std::thread::yield_now();
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn generator_seed_is_second_token() {
        let seed = parse_generator_seed("/*SEED 1234567890*/\n").unwrap();
        assert_eq!(seed.as_str(), "1234567890");
        let seed = parse_generator_seed("seed: 3_1700000000, done").unwrap();
        assert_eq!(seed.as_str(), "3_1700000000");
        assert!(parse_generator_seed("").is_none());
        assert!(parse_generator_seed("onlyone").is_none());
    }

    #[test]
    fn fallback_seed_shape() {
        let seed = Seed::fallback(7);
        let parts: Vec<&str> = seed.as_str().split('_').collect();
        assert_eq!(parts[0], "7");
        assert_eq!(parts.len(), 7);
    }

    #[test]
    fn seed_line_accepts_prefixes_and_commas() {
        let seeds = parse_seed_line("S_123, 456/ 2_789").unwrap();
        let seeds: Vec<&str> = seeds.iter().map(Seed::as_str).collect();
        assert_eq!(seeds, ["123", "456", "2_789"]);
    }

    #[test]
    fn seed_line_rejects_garbage() {
        for bad in ["abc", "1_2_3", "12_", "S_", "1x"] {
            assert!(
                matches!(parse_seed_line(bad), Err(CcdiffError::InvalidSeed { .. })),
                "{bad}"
            );
        }
    }

    #[test]
    fn seed_file_skips_comments_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeds.txt");
        std::fs::write(&path, "# failing seeds\n3 1\n  # indented comment\nS_2, 1\n").unwrap();
        let seeds = load_seed_list(path.to_str().unwrap()).unwrap();
        let seeds: Vec<&str> = seeds.iter().map(Seed::as_str).collect();
        assert_eq!(seeds, ["1", "2", "3"]);
    }

    #[test]
    fn literal_list_is_sorted() {
        let seeds = load_seed_list("30 10 20 10").unwrap();
        assert_eq!(seeds.len(), 3);
        assert_eq!(seeds[0].dir_name(), "S_10");
    }

    #[test]
    fn queue_drains_exactly_once_across_workers() {
        let total = 200;
        let queue = Arc::new(SeedQueue::new((0..total).map(|i| Seed::new(i.to_string()))));
        let taken = Arc::new(parking_lot::Mutex::new(Vec::new()));
        std::thread::scope(|s| {
            for _ in 0..6 {
                let queue = Arc::clone(&queue);
                let taken = Arc::clone(&taken);
                s.spawn(move || {
                    while let Some(seed) = queue.next_seed() {
                        taken.lock().push(seed);
                    }
                });
            }
        });
        let taken = taken.lock();
        let unique: BTreeSet<_> = taken.iter().cloned().collect();
        assert_eq!(taken.len(), total);
        assert_eq!(unique.len(), total);
        assert!(queue.is_empty());
    }

    #[test]
    fn empty_queue_reports_drained() {
        let queue = SeedQueue::new(Vec::new());
        assert!(queue.next_seed().is_none());
    }

    proptest! {
        #[test]
        fn numeric_seeds_roundtrip_through_prefix(n in 0u64..u64::MAX, proc_id in 0u32..512) {
            let plain = parse_seed_line(&format!("S_{n}")).unwrap();
            prop_assert_eq!(plain[0].as_str(), n.to_string());
            let tagged = parse_seed_line(&format!("{proc_id}_{n}/")).unwrap();
            prop_assert_eq!(tagged[0].as_str(), format!("{proc_id}_{n}"));
        }
    }
}
