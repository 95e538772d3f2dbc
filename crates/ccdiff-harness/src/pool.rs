//! Worker pool: generate, build, run and triage Tests until the seed list
//! runs dry or the time budget is spent.
//!
//! Every worker owns `<out>/process_<i>/` and never touches a sibling's
//! directory. The statistics and the optional seed queue are the only
//! shared mutable state; the registry and classifier are read-only.

use std::collections::BTreeSet;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ccdiff_error::{CcdiffError, Result};
use ccdiff_observability::{RunTag, StatsSnapshot, Statistics};
use tracing::{debug, error, info, warn};

use crate::classifier::Classifier;
use crate::config::{HarnessConfig, TemplateVars};
use crate::model::{GenerationStatus, RunStatus, Test, TestStatus};
use crate::persist::FailureStore;
use crate::process::{self, CommandSpec, RunLimits};
use crate::registry::TargetRegistry;
use crate::seeds::{Seed, SeedQueue, parse_generator_seed};
use crate::triage::{self, TriageContext};

/// Marker written into a worker directory when the worker exits.
pub const DONE_MARKER: &str = "done";

/// File holding the seed of the Test currently in the worker directory.
pub const SEED_FILE: &str = "seed";

/// Everything a campaign shares between workers.
#[derive(Debug, Clone, Copy)]
pub struct Campaign<'a> {
    pub config: &'a HarnessConfig,
    pub registry: &'a TargetRegistry,
    pub classifier: &'a Classifier,
    pub stats: &'a Statistics,
    /// Live worker count, read by the statistics reporter.
    pub active: &'a AtomicUsize,
    /// When set, workers stop once the queue is drained.
    pub seeds: Option<&'a SeedQueue>,
    pub generator_version: &'a str,
}

#[derive(Debug, Clone)]
pub struct CampaignSummary {
    pub snapshot: StatsSnapshot,
    pub tests: usize,
    pub failed_tests: usize,
    pub records: usize,
    pub wall_time: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerTally {
    tests: usize,
    failed: usize,
}

/// Run the campaign to completion.
///
/// # Errors
///
/// I/O errors preparing the output directory. Failures inside a Test are
/// logged by its worker and never end the campaign.
pub fn run_campaign(campaign: &Campaign<'_>) -> Result<CampaignSummary> {
    let started = Instant::now();
    let config = campaign.config;
    let out_dir = std::path::absolute(&config.out_dir)?;
    fs::create_dir_all(&out_dir)?;
    let store = FailureStore::new(&out_dir);
    fs::create_dir_all(store.root())?;

    let mut jobs = config.jobs.max(1);
    if let Some(queue) = campaign.seeds {
        campaign.stats.enable_seed_lists();
        jobs = jobs.min(queue.len().max(1));
    }
    let deadline = config.time_budget().map(|budget| started + budget);
    info!(
        jobs,
        targets = campaign.registry.len(),
        out = %out_dir.display(),
        budget_secs = config.time_budget_secs,
        "starting campaign"
    );

    let dirs: Vec<PathBuf> = (0..jobs)
        .map(|i| out_dir.join(format!("process_{i}")))
        .collect();
    for dir in &dirs {
        fs::create_dir_all(dir)?;
    }

    let tallies: Vec<WorkerTally> = std::thread::scope(|s| {
        let mut joins = Vec::with_capacity(jobs);
        for (id, dir) in dirs.iter().enumerate() {
            let store = &store;
            let handle = std::thread::Builder::new()
                .name(format!("ccdiff-worker-{id}"))
                .spawn_scoped(s, move || {
                    let worker = Worker {
                        campaign,
                        store,
                        id,
                        dir,
                        deadline,
                    };
                    worker.run()
                });
            match handle {
                Ok(join) => joins.push((id, join)),
                Err(err) => error!(worker = id, error = %err, "failed to spawn worker"),
            }
        }
        joins
            .into_iter()
            .map(|(id, join)| {
                join.join().unwrap_or_else(|_| {
                    error!(worker = id, "worker thread panicked");
                    WorkerTally::default()
                })
            })
            .collect()
    });

    for dir in &dirs {
        if let Err(err) = fs::remove_dir_all(dir) {
            warn!(dir = %dir.display(), error = %err, "failed to remove worker directory");
        }
    }

    let tests = tallies.iter().map(|t| t.tests).sum();
    let failed_tests = tallies.iter().map(|t| t.failed).sum();
    let summary = CampaignSummary {
        snapshot: campaign.stats.snapshot(),
        tests,
        failed_tests,
        records: store.records_written(),
        wall_time: started.elapsed(),
    };
    info!(
        tests,
        failed_tests,
        records = summary.records,
        wall_secs = summary.wall_time.as_secs(),
        "campaign finished"
    );
    Ok(summary)
}

/// First line the generator prints for its version arguments, or
/// `"unknown"`.
pub fn generator_version(config: &HarnessConfig) -> String {
    let Some(program) = config.generator.command.0.first() else {
        return "unknown".to_owned();
    };
    let spec = CommandSpec::new(program).args(config.generator.version_args.iter().cloned());
    match process::run(&spec, RunLimits::timeout(Duration::from_secs(10))) {
        Ok(out) => {
            let text = if out.stdout.is_empty() {
                out.stderr_text()
            } else {
                out.stdout_text()
            };
            text.lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map_or_else(|| "unknown".to_owned(), str::to_owned)
        }
        Err(err) => {
            warn!(error = %err, "cannot read generator version");
            "unknown".to_owned()
        }
    }
}

// ── Worker ──────────────────────────────────────────────────────────────

struct Worker<'a> {
    campaign: &'a Campaign<'a>,
    store: &'a FailureStore,
    id: usize,
    dir: &'a Path,
    deadline: Option<Instant>,
}

impl Worker<'_> {
    fn run(&self) -> WorkerTally {
        self.campaign.active.fetch_add(1, Ordering::Relaxed);
        let mut tally = WorkerTally::default();
        loop {
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                debug!(worker = self.id, "time budget spent");
                break;
            }
            let seed = match self.campaign.seeds {
                Some(queue) => match queue.next_seed() {
                    Some(seed) => Some(seed),
                    None => {
                        debug!(worker = self.id, "seed queue drained");
                        break;
                    }
                },
                None => None,
            };
            match panic::catch_unwind(AssertUnwindSafe(|| self.run_test(seed))) {
                Ok(Ok(status)) => {
                    tally.tests += 1;
                    if status != TestStatus::Ok {
                        tally.failed += 1;
                    }
                }
                Ok(Err(err)) if err.is_fatal() => {
                    error!(worker = self.id, error = %err, "stopping worker");
                    break;
                }
                Ok(Err(err)) => {
                    tally.tests += 1;
                    tally.failed += 1;
                    error!(worker = self.id, error = %err, "test aborted");
                }
                Err(payload) => {
                    tally.tests += 1;
                    tally.failed += 1;
                    error!(worker = self.id, panic = panic_message(&*payload), "test panicked");
                }
            }
        }
        if let Err(err) = fs::write(self.dir.join(DONE_MARKER), "") {
            warn!(worker = self.id, error = %err, "failed to write done marker");
        }
        self.campaign.active.fetch_sub(1, Ordering::Relaxed);
        tally
    }

    fn vars<'v>(&'v self, dir: &'v str, seed: &'v str, target: &'v str) -> TemplateVars<'v> {
        TemplateVars {
            target,
            dir,
            seed,
            blame: "",
        }
    }

    /// Empty the worker directory and copy in the build description.
    fn prepare_dir(&self) -> Result<()> {
        let expected = format!("process_{}", self.id);
        if self.dir.file_name().and_then(|n| n.to_str()) != Some(expected.as_str()) {
            return Err(CcdiffError::internal(format!(
                "worker {} is not in its own directory: {}",
                self.id,
                self.dir.display()
            )));
        }
        clear_dir(self.dir)?;
        if let Some(desc) = &self.campaign.config.build_description {
            if let Some(name) = desc.file_name() {
                fs::copy(desc, self.dir.join(name))?;
            }
        }
        Ok(())
    }

    fn run_test(&self, seed: Option<Seed>) -> Result<TestStatus> {
        let config = self.campaign.config;
        let stats = self.campaign.stats;
        self.prepare_dir()?;
        let before = list_files(self.dir)?;
        let dir_text = self.dir.to_string_lossy();

        // Generation.
        let seed_text = seed.as_ref().map_or("", Seed::as_str);
        let vars = self.vars(&dir_text, seed_text, "");
        let mut args = config.generator.command.expand_args(&vars);
        if seed.is_some() {
            args.extend(
                config
                    .generator
                    .seed_args
                    .iter()
                    .map(|a| a.replace("{seed}", seed_text)),
            );
        }
        let mut args = args.into_iter();
        let program = args
            .next()
            .ok_or_else(|| CcdiffError::config("generator.command is empty"))?;
        let spec = CommandSpec::new(program).args(args).current_dir(self.dir);
        let output = process::run(&spec, config.generator_limits())?;
        stats.record_generator(RunTag::Total);
        stats.add_generator_duration(output.cpu_time);
        let seed = seed
            .or_else(|| parse_generator_seed(&output.stdout_text()))
            .unwrap_or_else(|| Seed::fallback(self.id));
        fs::write(self.dir.join(SEED_FILE), seed.as_str())?;

        let mut test = Test::new(seed, self.dir.to_path_buf(), self.id);
        match test.record_generation(spec.display(), output)? {
            GenerationStatus::Ok => stats.record_generator(RunTag::Ok),
            GenerationStatus::Timeout => stats.record_generator(RunTag::RunfailTimeout),
            GenerationStatus::Fail | GenerationStatus::NotGenerated => {
                stats.record_generator(RunTag::Runfail);
            }
        }
        debug!(worker = self.id, seed = %test.seed, generation = ?test.generation(), "generated");

        if test.generation() == GenerationStatus::Ok {
            test.files = self.generated_files(&before)?;
            test.add_runs(self.campaign.registry.option_sets())?;
            for idx in 0..test.runs.len() {
                self.build_and_run(&mut test, idx)?;
            }
        }

        let ctx = TriageContext {
            config,
            classifier: self.campaign.classifier,
            stats,
            store: self.store,
            generator_version: self.campaign.generator_version,
        };
        let summary = triage::handle_results(&ctx, &test)?;
        Ok(summary.status)
    }

    /// Sources the generator produced, plus the build description.
    fn generated_files(&self, before: &BTreeSet<PathBuf>) -> Result<Vec<PathBuf>> {
        let config = self.campaign.config;
        let mut files: Vec<PathBuf> = if config.generator.files.is_empty() {
            list_files(self.dir)?
                .difference(before)
                .filter(|p| p.as_os_str() != SEED_FILE)
                .cloned()
                .collect()
        } else {
            config.generator.files.iter().map(PathBuf::from).collect()
        };
        if let Some(name) = config.build_description.as_deref().and_then(Path::file_name) {
            let name = PathBuf::from(name);
            if !files.contains(&name) {
                files.push(name);
            }
        }
        Ok(files)
    }

    fn build_and_run(&self, test: &mut Test, idx: usize) -> Result<()> {
        let config = self.campaign.config;
        let stats = self.campaign.stats;
        let dir_text = self.dir.to_string_lossy();
        let name = test.runs[idx].name().to_owned();
        let vars = self.vars(&dir_text, test.seed.as_str(), &name);

        let build = config
            .commands
            .build
            .expand(&vars)
            .ok_or_else(|| CcdiffError::config("commands.build is empty"))?
            .current_dir(self.dir);
        let output = process::run(&build, config.build_limits())?;
        let run = &mut test.runs[idx];
        let mut status = run.record_build(build.display(), output)?;
        if status == RunStatus::NotRun {
            if let Some(artifact) = &config.commands.artifact {
                let path = PathBuf::from(artifact.replace("{target}", &name));
                if self.dir.join(&path).exists() {
                    run.artifact = Some(path);
                }
            }
            let exec = config
                .commands
                .run
                .expand(&vars)
                .ok_or_else(|| CcdiffError::config("commands.run is empty"))?
                .current_dir(self.dir);
            let output = process::run(&exec, config.run_limits())?;
            status = run.record_run(exec.display(), output)?;
        }

        stats.record_target(&name, RunTag::Total);
        if let Some(tag) = status.tag() {
            stats.record_target(&name, tag);
        }
        stats.add_target_duration(&name, run.cpu_time());
        debug!(worker = self.id, seed = %test.seed, optset = %name, %status, "run finished");
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Regular files directly inside `dir`, as names relative to it.
fn list_files(dir: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut files = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.insert(PathBuf::from(entry.file_name()));
        }
    }
    Ok(files)
}

fn clear_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
