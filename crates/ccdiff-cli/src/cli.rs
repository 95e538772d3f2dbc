//! Argument parsing and command dispatch for `ccdiff`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use ccdiff_error::{CcdiffError, Result};
use ccdiff_harness::blame::{self, BLAME_LOG, BlameSettings};
use ccdiff_harness::config::{CampaignConfig, HarnessConfig, TemplateVars};
use ccdiff_harness::pool::{self, Campaign, SEED_FILE};
use ccdiff_harness::process::{self, RunLimits};
use ccdiff_harness::reducer;
use ccdiff_harness::registry::TargetRegistry;
use ccdiff_harness::seeds::{SeedQueue, load_seed_list};
use ccdiff_observability::{CleanupCommand, ReporterConfig, Statistics, StatsReporter, format_span};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "ccdiff", version, about = "Differential testing of C/C++ compilers")]
pub struct Cli {
    #[command(flatten)]
    pub log: LogArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug)]
pub struct LogArgs {
    /// Log at debug level.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a testing campaign.
    Run(RunArgs),
    /// Bisect the optimization phase behind an existing failure.
    Blame(BlameArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Campaign configuration (JSON).
    #[arg(short, long)]
    pub config: PathBuf,

    /// Output directory.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Time budget in minutes; -1 runs until stopped.
    #[arg(short, long, allow_negative_numbers = true)]
    pub timeout: Option<i64>,

    /// Compilers to test, space or comma separated.
    #[arg(long, num_args = 1.., value_delimiter = ',')]
    pub target: Vec<String>,

    /// Number of workers.
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Seed list, or a file holding one.
    #[arg(long)]
    pub seeds: Option<String>,

    /// Bisect optimization phases for failures.
    #[arg(long)]
    pub blame: bool,

    /// Minimize failures, optionally with N minimizer jobs.
    #[arg(long, num_args = 0..=1, value_name = "N")]
    pub reduce: Option<Option<usize>>,

    /// Rewrite the verbose statistics to this file on every tick.
    #[arg(long)]
    pub stat_log_file: Option<PathBuf>,

    /// Do not run the periodic cleanup command.
    #[arg(long)]
    pub no_tmp_cleaner: bool,
}

#[derive(Args, Debug)]
pub struct BlameArgs {
    /// Campaign configuration (JSON).
    #[arg(short, long)]
    pub config: PathBuf,

    /// Directory holding the failing Test.
    #[arg(short, long, default_value = ".")]
    pub dir: PathBuf,

    /// Option-set that produces the wrong result.
    #[arg(long)]
    pub optset: String,

    /// Option-set whose output is taken as the expected result.
    #[arg(long)]
    pub good: String,
}

/// Run the parsed command line and return the process exit code.
pub fn run_cli(cli: Cli) -> i32 {
    if let Err(err) = init_logging(&cli.log) {
        eprintln!("error: cannot open log file: {err}");
        return 1;
    }
    let result = match cli.command {
        Command::Run(args) => run_campaign(args),
        Command::Blame(args) => run_blame(&args),
    };
    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            if let Some(hint) = err.suggestion() {
                eprintln!("hint: {hint}");
            }
            err.exit_code()
        }
    }
}

fn init_logging(args: &LogArgs) -> std::io::Result<()> {
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match &args.log_file {
        Some(path) => {
            let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

/// Fold command-line overrides into the file configuration.
fn apply_overrides(config: &mut HarnessConfig, args: &RunArgs) {
    if let Some(output) = &args.output {
        config.out_dir.clone_from(output);
    }
    if let Some(minutes) = args.timeout {
        config.time_budget_secs = u64::try_from(minutes).ok().map(|m| m.saturating_mul(60));
    }
    if let Some(jobs) = args.jobs {
        config.jobs = jobs;
    }
    if args.blame {
        config.blame = true;
    }
    if let Some(jobs) = args.reduce {
        config.reduction.enabled = true;
        if let Some(jobs) = jobs {
            config.reduction.jobs = jobs;
        }
    }
    if let Some(path) = &args.stat_log_file {
        config.stats.log_file = Some(path.clone());
    }
    if args.no_tmp_cleaner {
        config.cleanup.command = None;
    }
}

/// Compiler names from `--target`, split on whitespace as well.
fn target_names(raw: &[String]) -> Vec<String> {
    raw.iter()
        .flat_map(|t| t.split_whitespace())
        .map(str::to_owned)
        .collect()
}

fn reporter_config(config: &HarnessConfig) -> ReporterConfig {
    let cleanup = config.cleanup.command.as_ref().and_then(|cmd| {
        let (program, args) = cmd.0.split_first()?;
        Some(CleanupCommand {
            program: PathBuf::from(program),
            args: args.to_vec(),
            interval: Duration::from_secs(config.cleanup.interval_secs),
        })
    });
    ReporterConfig {
        interval: Duration::from_secs(config.stats.interval_secs.max(1)),
        stat_log_file: config.stats.log_file.clone(),
        print_line: config.stats.print_line,
        cleanup,
    }
}

fn load_registry(campaign: &CampaignConfig, targets: &[String]) -> Result<TargetRegistry> {
    let registry = campaign.registry(targets)?;
    registry.probe_versions(RunLimits::timeout(VERSION_PROBE_TIMEOUT))?;
    Ok(registry)
}

fn run_campaign(args: RunArgs) -> Result<()> {
    let mut campaign_config = CampaignConfig::load(&args.config)?;
    apply_overrides(&mut campaign_config.harness, &args);
    let config = &campaign_config.harness;
    config.validate()?;
    let registry = load_registry(&campaign_config, &target_names(&args.target))?;
    let classifier = config.classifier()?;
    if config.reduction.enabled {
        let (major, minor, patch) = reducer::check_minimizer(&config.reduction)?;
        info!(version = %format!("{major}.{minor}.{patch}"), "minimizer found");
    }
    let seeds = args
        .seeds
        .as_deref()
        .map(load_seed_list)
        .transpose()?
        .map(SeedQueue::new);
    if let Some(queue) = &seeds {
        if queue.is_empty() {
            return Err(CcdiffError::config("the seed list is empty"));
        }
        info!(seeds = queue.len(), "testing supplied seeds");
    }
    let generator_version = pool::generator_version(config);
    info!(generator = %generator_version, "generator version");

    let stats = Arc::new(Statistics::new(
        registry.option_sets().iter().map(|o| o.name.clone()),
    ));
    let active = Arc::new(AtomicUsize::new(0));
    let reporter = StatsReporter::spawn(
        Arc::clone(&stats),
        Arc::clone(&active),
        reporter_config(config),
    )?;
    let campaign = Campaign {
        config,
        registry: &registry,
        classifier: &classifier,
        stats: &stats,
        active: &active,
        seeds: seeds.as_ref(),
        generator_version: &generator_version,
    };
    let result = pool::run_campaign(&campaign);
    let snapshot = reporter.stop();
    let summary = result?;
    info!(
        tests = summary.tests,
        failed = summary.failed_tests,
        records = summary.records,
        wall = %format_span(summary.wall_time),
        seeds_per_minute = snapshot.seeds_per_minute(),
        "done"
    );
    Ok(())
}

/// Regular files of a Test directory that a blame copy needs.
fn test_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_file() && name != BLAME_LOG {
            files.push(PathBuf::from(name));
        }
    }
    files.sort();
    Ok(files)
}

fn run_blame(args: &BlameArgs) -> Result<()> {
    let campaign_config = CampaignConfig::load(&args.config)?;
    let config = &campaign_config.harness;
    let registry = campaign_config.registry(&[])?;
    let find = |name: &str| {
        registry
            .get(name)
            .ok_or_else(|| CcdiffError::config(format!("unknown option-set '{name}'")))
    };
    let bad = find(&args.optset)?;
    let good = find(&args.good)?;

    let dir = std::path::absolute(&args.dir)?;
    let dir_text = dir.to_string_lossy();
    let seed = fs::read_to_string(dir.join(SEED_FILE)).unwrap_or_default();
    let vars = TemplateVars {
        target: &good.name,
        dir: &dir_text,
        seed: seed.trim(),
        blame: "",
    };
    let empty = || CcdiffError::config("build and run commands must not be empty");
    let build = config.commands.build.expand(&vars).ok_or_else(empty)?.current_dir(&dir);
    let run = config.commands.run.expand(&vars).ok_or_else(empty)?.current_dir(&dir);
    let built = process::run(&build, config.build_limits())?;
    let ran = if built.success() {
        process::run(&run, config.run_limits())?
    } else {
        built
    };
    if !ran.success() {
        return Err(CcdiffError::process(
            run.display(),
            format!("good option-set '{}' did not produce a result", good.name),
        ));
    }

    let settings = BlameSettings {
        build: config.commands.blame_build(),
        run: config.commands.blame_run(),
        build_limits: config.build_limits(),
        run_limits: config.run_limits(),
        seed: seed.trim(),
    };
    let files = test_files(&dir)?;
    let outcome = blame::blame_option_set(&settings, bad, &ran.stdout, &dir, &files)?;
    match serde_json::to_string_pretty(&outcome) {
        Ok(json) => println!("{json}"),
        Err(err) => warn!(error = %err, "cannot render blame outcome"),
    }
    Ok(())
}
