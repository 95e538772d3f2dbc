//! Campaign statistics for the ccdiff harness.
//!
//! A single [`Statistics`] value is created by the scheduler and shared by
//! handle with every worker. All mutation goes through one
//! [`parking_lot::Mutex`]; critical sections are pure arithmetic so workers
//! never wait on I/O held by a sibling.
//!
//! [`StatsReporter`] owns the background thread that renders the rolling
//! one-line summary and the verbose breakdown on a fixed interval.

mod reporter;

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Serialize, Serializer};

pub use reporter::{CleanupCommand, ReporterConfig, StatsReporter};

// ---------------------------------------------------------------------------
// RunTag
// ---------------------------------------------------------------------------

/// Outcome category counted per target and for the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTag {
    Total,
    Ok,
    Compfail,
    CompfailTimeout,
    Runfail,
    RunfailTimeout,
    Miscompare,
}

impl RunTag {
    pub const ALL: [Self; 7] = [
        Self::Total,
        Self::Ok,
        Self::CompfailTimeout,
        Self::Compfail,
        Self::RunfailTimeout,
        Self::Runfail,
        Self::Miscompare,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Ok => "ok",
            Self::Compfail => "compfail",
            Self::CompfailTimeout => "compfail_timeout",
            Self::Runfail => "runfail",
            Self::RunfailTimeout => "runfail_timeout",
            Self::Miscompare => "miscompare",
        }
    }
}

impl std::fmt::Display for RunTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Per-target (or generator) counters plus accumulated CPU time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub total: u64,
    pub ok: u64,
    pub compfail: u64,
    pub compfail_timeout: u64,
    pub runfail: u64,
    pub runfail_timeout: u64,
    pub miscompare: u64,
    #[serde(rename = "cpu_ms", serialize_with = "serialize_ms")]
    pub cpu: Duration,
}

impl Counters {
    pub const fn get(&self, tag: RunTag) -> u64 {
        match tag {
            RunTag::Total => self.total,
            RunTag::Ok => self.ok,
            RunTag::Compfail => self.compfail,
            RunTag::CompfailTimeout => self.compfail_timeout,
            RunTag::Runfail => self.runfail,
            RunTag::RunfailTimeout => self.runfail_timeout,
            RunTag::Miscompare => self.miscompare,
        }
    }

    fn bump(&mut self, tag: RunTag) {
        let slot = match tag {
            RunTag::Total => &mut self.total,
            RunTag::Ok => &mut self.ok,
            RunTag::Compfail => &mut self.compfail,
            RunTag::CompfailTimeout => &mut self.compfail_timeout,
            RunTag::Runfail => &mut self.runfail,
            RunTag::RunfailTimeout => &mut self.runfail_timeout,
            RunTag::Miscompare => &mut self.miscompare,
        };
        *slot = slot.saturating_add(1);
    }
}

fn serialize_ms<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SeedLists {
    passed: BTreeSet<String>,
    failed: BTreeSet<String>,
}

#[derive(Debug)]
struct Inner {
    generator: Counters,
    /// Declaration order is preserved for rendering.
    targets: Vec<(String, Counters)>,
    seeds: Option<SeedLists>,
}

impl Inner {
    fn target_mut(&mut self, name: &str) -> &mut Counters {
        let idx = match self.targets.iter().position(|(n, _)| n == name) {
            Some(idx) => idx,
            None => {
                self.targets.push((name.to_owned(), Counters::default()));
                self.targets.len() - 1
            }
        };
        &mut self.targets[idx].1
    }
}

/// Process-wide counters shared by all workers.
#[derive(Debug)]
pub struct Statistics {
    started: Instant,
    inner: Mutex<Inner>,
}

impl Statistics {
    /// Create statistics for `targets`, in the order they should be rendered.
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            started: Instant::now(),
            inner: Mutex::new(Inner {
                generator: Counters::default(),
                targets: targets
                    .into_iter()
                    .map(|name| (name.into(), Counters::default()))
                    .collect(),
                seeds: None,
            }),
        }
    }

    /// Start tracking passed and failed seeds.
    pub fn enable_seed_lists(&self) {
        let mut inner = self.inner.lock();
        if inner.seeds.is_none() {
            inner.seeds = Some(SeedLists::default());
        }
    }

    pub fn seed_lists_enabled(&self) -> bool {
        self.inner.lock().seeds.is_some()
    }

    pub fn record_target(&self, target: &str, tag: RunTag) {
        self.inner.lock().target_mut(target).bump(tag);
    }

    pub fn add_target_duration(&self, target: &str, cpu: Duration) {
        let mut inner = self.inner.lock();
        let counters = inner.target_mut(target);
        counters.cpu = counters.cpu.saturating_add(cpu);
    }

    pub fn record_generator(&self, tag: RunTag) {
        self.inner.lock().generator.bump(tag);
    }

    pub fn add_generator_duration(&self, cpu: Duration) {
        let mut inner = self.inner.lock();
        inner.generator.cpu = inner.generator.cpu.saturating_add(cpu);
    }

    /// No-op unless seed lists are enabled.
    pub fn seed_passed(&self, seed: &str) {
        if let Some(seeds) = self.inner.lock().seeds.as_mut() {
            seeds.passed.insert(seed.to_owned());
        }
    }

    /// No-op unless seed lists are enabled.
    pub fn seed_failed(&self, seed: &str) {
        if let Some(seeds) = self.inner.lock().seeds.as_mut() {
            seeds.failed.insert(seed.to_owned());
        }
    }

    pub fn target_count(&self, target: &str, tag: RunTag) -> u64 {
        let inner = self.inner.lock();
        inner
            .targets
            .iter()
            .find(|(n, _)| n == target)
            .map_or(0, |(_, c)| c.get(tag))
    }

    pub fn generator_count(&self, tag: RunTag) -> u64 {
        self.inner.lock().generator.get(tag)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Copy the current state out under the lock.
    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.started.elapsed();
        let inner = self.inner.lock();
        let (passed_seeds, failed_seeds) = inner.seeds.as_ref().map_or((None, None), |s| {
            (
                Some(s.passed.iter().cloned().collect()),
                Some(s.failed.iter().cloned().collect()),
            )
        });
        StatsSnapshot {
            taken_at: chrono::Utc::now().format("%Y/%m/%d %H:%M:%S").to_string(),
            elapsed,
            generator: inner.generator.clone(),
            targets: inner
                .targets
                .iter()
                .map(|(name, counters)| TargetCounters {
                    name: name.clone(),
                    counters: counters.clone(),
                })
                .collect(),
            passed_seeds,
            failed_seeds,
        }
    }
}

// ---------------------------------------------------------------------------
// StatsSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetCounters {
    pub name: String,
    #[serde(flatten)]
    pub counters: Counters,
}

/// Point-in-time copy of [`Statistics`], rendered without holding the lock.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub taken_at: String,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_ms")]
    pub elapsed: Duration,
    pub generator: Counters,
    pub targets: Vec<TargetCounters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed_seeds: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_seeds: Option<Vec<String>>,
}

impl StatsSnapshot {
    /// Sum of one tag over all targets.
    pub fn target_total(&self, tag: RunTag) -> u64 {
        self.targets.iter().map(|t| t.counters.get(tag)).sum()
    }

    /// Generator plus build/run CPU time.
    pub fn cpu_time(&self) -> Duration {
        self.targets
            .iter()
            .fold(self.generator.cpu, |acc, t| acc.saturating_add(t.counters.cpu))
    }

    /// Generated programs per minute of wall time.
    #[allow(clippy::cast_precision_loss)]
    pub fn seeds_per_minute(&self) -> f64 {
        let minutes = self.elapsed.as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        self.generator.total as f64 / minutes
    }

    /// The rolling one-line summary.
    pub fn render_line(&self, active: usize) -> String {
        let gen_errors = self.generator.runfail + self.generator.runfail_timeout;
        format!(
            "time {} | cpu time: {} | {:.2} seed/min | active {} | seeds/targets: {}/{} | \
             Errors(g/ct/c/rt/r/d): {}/{}/{}/{}/{}/{}",
            format_span(self.elapsed),
            format_span(self.cpu_time()),
            self.seeds_per_minute(),
            active,
            self.generator.total,
            self.target_total(RunTag::Total),
            gen_errors,
            self.target_total(RunTag::CompfailTimeout),
            self.target_total(RunTag::Compfail),
            self.target_total(RunTag::RunfailTimeout),
            self.target_total(RunTag::Runfail),
            self.target_total(RunTag::Miscompare),
        )
    }

    /// Multi-line per-target breakdown.
    pub fn render_verbose(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "##########################");
        let _ = writeln!(out, "campaign stat:");
        let _ = writeln!(out, "time: {}", self.taken_at);
        let _ = writeln!(out, "duration: {}", format_span(self.elapsed));
        let _ = writeln!(out, "testing speed: {:.2} seed/min", self.seeds_per_minute());
        let _ = writeln!(out, "##########################");
        let _ = writeln!(out, "generator stat:");
        let _ = writeln!(out, "\tcpu time: {}", format_span(self.generator.cpu));
        for tag in [
            RunTag::Total,
            RunTag::Ok,
            RunTag::RunfailTimeout,
            RunTag::Runfail,
        ] {
            let _ = writeln!(out, "\t{tag} : {}", self.generator.get(tag));
        }
        for target in &self.targets {
            let _ = writeln!(out, "##########################");
            let _ = writeln!(out, "{} stat:", target.name);
            let _ = writeln!(out, "\tcpu time: {}", format_span(target.counters.cpu));
            for tag in RunTag::ALL {
                let _ = writeln!(out, "\t{tag} : {}", target.counters.get(tag));
            }
        }
        if let (Some(passed), Some(failed)) = (&self.passed_seeds, &self.failed_seeds) {
            let _ = writeln!(
                out,
                "PASSED SEEDS ({}): {}",
                passed.len(),
                join_seeds(passed)
            );
            let _ = writeln!(
                out,
                "FAILED SEEDS ({}): {}",
                failed.len(),
                join_seeds(failed)
            );
        }
        let _ = writeln!(out, "=================================");
        out
    }

    /// Machine-readable form, one JSON object.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_owned())
    }
}

fn join_seeds(seeds: &[String]) -> String {
    seeds
        .iter()
        .map(|s| format!("S_{s}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `D d H:MM:SS`.
pub fn format_span(d: Duration) -> String {
    let secs = d.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    format!("{days} d {hours}:{minutes:02}:{seconds:02}")
}
